use std::sync::Arc;

use crate::caching::{CacheEntry, CacheError};
use crate::utils::defer::defer;

use super::{Loader, Outcome, Request};

impl Loader {
    /// Persists fetched artifacts until every cold load has passed through.
    ///
    /// Every cold load increments `pending_writes` and its request reaches the write queue exactly
    /// once. The worker exits when the counter drops to zero, and waits for the download workers
    /// in between.
    pub(super) async fn run_disk_writer(self: Arc<Self>) {
        let loader = self.clone();
        let guard = defer(move || loader.disk_writer_aborted());

        loop {
            let Some(request) = self.write_queue.pop() else {
                self.write_ready.notified().await;
                continue;
            };

            self.persist(&request).await;

            let mut state = self.lock_state();
            state.pending_writes -= 1;
            if state.pending_writes == 0 {
                let evicted = state.memory.purge_if_needed();
                state.forget_evicted(evicted);
                guard.disarm();
                return;
            }
        }
    }

    /// Writes the artifact of `request` to the store, or forgets the request if it failed.
    async fn persist(&self, request: &Arc<Request>) {
        let artifact = match request.outcome() {
            Outcome::Ready(artifact) => artifact,
            Outcome::Failed(_) | Outcome::Pending => {
                self.discard(request);
                return;
            }
        };

        let codec = self.codec.clone();
        let store = self.store.clone();
        let path = request.artifact_path.clone();
        let result = self
            .runtime
            .spawn_blocking(move || -> CacheEntry {
                let data = codec.encode(&artifact)?;
                store.write(&path, &data)?;
                Ok(())
            })
            .await
            .map_err(CacheError::from_std_error)
            .and_then(|result| result);

        match result {
            Ok(()) => {
                metric!(counter("loader.disk.write") += 1);
                tracing::trace!(url = request.url.as_str(), "Stored artifact");
            }
            Err(error) => {
                // The decoded artifact stays valid in memory.
                metric!(counter("loader.disk.write.failure") += 1);
                tracing::error!(
                    url = request.url.as_str(),
                    path = %request.artifact_path.display(),
                    error = &error as &dyn std::error::Error,
                    "Failed to store artifact"
                );
            }
        }
    }

    /// Accounts for the item that was being written when the writer panicked, and restarts the
    /// writer if more items are pending.
    ///
    /// Also called when the runtime shuts down, in which case nothing is restarted.
    fn disk_writer_aborted(self: Arc<Self>) {
        if !std::thread::panicking() {
            return;
        }
        tracing::error!("Disk writer panicked");
        let mut state = self.lock_state();
        state.pending_writes = state.pending_writes.saturating_sub(1);
        if state.pending_writes > 0 {
            self.spawn_worker(self.clone().run_disk_writer());
        }
    }
}
