//! Types exchanged between the loader and its consumers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::caching::CacheError;

/// The tag assigned to a load that does not specify one.
pub const DEFAULT_TAG: &str = "default";

/// Opaque identity of a consumer, such as a view that displays an artifact.
///
/// A handle is reused by its owner: when it issues a new load, results of its older loads that
/// are still in flight are no longer delivered to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Scheduling tier of a network fetch.
///
/// Tiers are strict: all queued `Fastest` fetches start before any `Faster` one, and all
/// `Faster` fetches before any `Fast` one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Fast,
    Faster,
    Fastest,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Faster => "faster",
            Self::Fastest => "fastest",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(Self::Fast),
            "faster" => Ok(Self::Faster),
            "fastest" => Ok(Self::Fastest),
            other => Err(format!("unknown priority `{other}`")),
        }
    }
}

/// A decoded artifact.
///
/// Artifacts are immutable once produced and cheap to clone, so the same artifact can be handed
/// to any number of consumers and kept in the memory cache at the same time.
#[derive(Clone, PartialEq, Eq)]
pub struct Artifact {
    data: Bytes,
    scale: u32,
}

impl Artifact {
    pub fn new(data: impl Into<Bytes>, scale: u32) -> Self {
        Self {
            data: data.into(),
            scale,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The downsampling factor this artifact was decoded with.
    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Number of bytes this artifact accounts for in the memory cache.
    pub fn byte_size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("bytes", &self.data.len())
            .field("scale", &self.scale)
            .finish()
    }
}

type OnArtifact = dyn Fn(&str, Option<Handle>, &Artifact) + Send + Sync;
type OnFailure = dyn Fn(&str, Option<Handle>, &CacheError) + Send + Sync;

/// A consumer-supplied function notified when an artifact becomes available.
///
/// Two callbacks are considered the same subscriber when they are clones of each other.
#[derive(Clone)]
pub struct Callback {
    on_artifact: Arc<OnArtifact>,
    on_failure: Option<Arc<OnFailure>>,
}

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str, Option<Handle>, &Artifact) + Send + Sync + 'static,
    {
        Self {
            on_artifact: Arc::new(f),
            on_failure: None,
        }
    }

    /// Also notify this callback when the fetch or decode of the artifact fails.
    ///
    /// Without this, a failed load is silent and simply retried on the next request.
    pub fn with_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, Option<Handle>, &CacheError) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(f));
        self
    }

    pub(crate) fn artifact(&self, url: &str, handle: Option<Handle>, artifact: &Artifact) {
        (self.on_artifact)(url, handle, artifact)
    }

    pub(crate) fn failure(&self, url: &str, handle: Option<Handle>, error: &CacheError) {
        if let Some(on_failure) = &self.on_failure {
            on_failure(url, handle, error)
        }
    }

    pub(crate) fn same_as(&self, other: &Callback) -> bool {
        Arc::ptr_eq(&self.on_artifact, &other.on_artifact)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("on_artifact", &Arc::as_ptr(&self.on_artifact))
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

/// Where a delivered artifact goes.
#[derive(Clone, Debug)]
pub enum DeliveryTarget {
    /// Invoke the callback. The handle, if any, is passed back to it.
    Callback {
        handle: Option<Handle>,
        callback: Callback,
    },
    /// Apply the artifact to the handle through the loader's [`ArtifactSink`].
    ///
    /// [`ArtifactSink`]: crate::services::ArtifactSink
    Handle(Handle),
}

impl DeliveryTarget {
    /// Resolves the target of a load call.
    ///
    /// A callback takes precedence over direct application to the handle. Returns `None` when
    /// nobody is interested in the result, which still warms the caches.
    pub fn new(handle: Option<Handle>, callback: Option<Callback>) -> Option<Self> {
        match (handle, callback) {
            (handle, Some(callback)) => Some(Self::Callback { handle, callback }),
            (Some(handle), None) => Some(Self::Handle(handle)),
            (None, None) => None,
        }
    }

    pub fn handle(&self) -> Option<Handle> {
        match self {
            Self::Callback { handle, .. } => *handle,
            Self::Handle(handle) => Some(*handle),
        }
    }

    /// Whether both targets denote the same subscriber.
    pub(crate) fn same_as(&self, other: &DeliveryTarget) -> bool {
        match (self, other) {
            (
                Self::Callback {
                    handle: h1,
                    callback: c1,
                },
                Self::Callback {
                    handle: h2,
                    callback: c2,
                },
            ) => h1 == h2 && c1.same_as(c2),
            (Self::Handle(h1), Self::Handle(h2)) => h1 == h2,
            _ => false,
        }
    }
}

/// Options of a single load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadOptions {
    pub priority: Priority,
    /// Advisory lifetime of the stored artifact.
    pub expire: Duration,
    pub tag: String,
    /// Downsampling factor passed to the decoder, at least 1.
    pub scale: u32,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Fast,
            expire: Duration::ZERO,
            tag: DEFAULT_TAG.to_owned(),
            scale: 1,
        }
    }
}

impl LoadOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn expire(mut self, expire: Duration) -> Self {
        self.expire = expire;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn scale(mut self, scale: u32) -> Self {
        self.scale = scale.max(1);
        self
    }
}
