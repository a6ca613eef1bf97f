use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use crate::caching::CacheError;
use crate::types::{Artifact, DeliveryTarget, Priority};

/// A consumer waiting for the outcome of a [`Request`].
#[derive(Debug, Clone)]
pub(crate) struct Subscriber {
    pub target: DeliveryTarget,
    /// Logical time of the load call that subscribed, compared against the freshness table.
    pub subscribed_at: u64,
}

#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Pending,
    Ready(Artifact),
    Failed(CacheError),
}

#[derive(Debug)]
struct RequestState {
    outcome: Outcome,
    subscribers: VecDeque<Subscriber>,
}

/// The single live request for one URL.
///
/// All loads for the URL share it until it is evicted, invalidated or has failed.
#[derive(Debug)]
pub(crate) struct Request {
    pub url: String,
    pub scale: u32,
    pub priority: Priority,
    /// Advisory only, nothing expires stored artifacts. `None` if it lies beyond what
    /// [`SystemTime`] can represent.
    #[allow(dead_code)]
    pub expires_at: Option<SystemTime>,
    pub tag: String,
    pub artifact_path: PathBuf,
    state: Mutex<RequestState>,
}

impl Request {
    pub fn new(
        url: String,
        scale: u32,
        priority: Priority,
        expires_at: Option<SystemTime>,
        tag: String,
        artifact_path: PathBuf,
    ) -> Self {
        Self {
            url,
            scale,
            priority,
            expires_at,
            tag,
            artifact_path,
            state: Mutex::new(RequestState {
                outcome: Outcome::Pending,
                subscribers: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn outcome(&self) -> Outcome {
        self.lock().outcome.clone()
    }

    /// Adds `subscriber`, or refreshes the stamp of an existing subscriber with the same target.
    ///
    /// Returns the outcome if the request is no longer pending. In that case the subscriber was
    /// not added, and the caller has to deliver to it directly.
    pub fn subscribe(&self, subscriber: Subscriber) -> Result<(), (Outcome, Subscriber)> {
        let mut state = self.lock();
        if !matches!(state.outcome, Outcome::Pending) {
            return Err((state.outcome.clone(), subscriber));
        }

        match state
            .subscribers
            .iter_mut()
            .find(|existing| existing.target.same_as(&subscriber.target))
        {
            Some(existing) => existing.subscribed_at = subscriber.subscribed_at,
            None => state.subscribers.push_back(subscriber),
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn drain_subscribers(&self) -> Vec<Subscriber> {
        self.lock().subscribers.drain(..).collect()
    }

    /// Sets the outcome and drains the subscribers in one step.
    ///
    /// Every subscriber is thus either returned here, or rejected by a later
    /// [`subscribe`](Self::subscribe).
    pub fn complete(&self, outcome: Outcome) -> Vec<Subscriber> {
        let mut state = self.lock();
        state.outcome = outcome;
        state.subscribers.drain(..).collect()
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}
