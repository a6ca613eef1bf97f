use std::io;
use std::sync::Arc;

use bytes::Bytes;

use crate::caching::{CacheEntry, CacheError};
use crate::types::Artifact;
use crate::utils::defer::defer;

use super::{Loader, Request};

impl Loader {
    /// Decodes requests found in the artifact store until the read queue is empty.
    pub(super) async fn run_disk_reader(self: Arc<Self>) {
        let loader = self.clone();
        let guard = defer(move || {
            if std::thread::panicking() {
                tracing::error!("Disk reader panicked");
            }
            loader.lock_state().disk_reader_running = false;
        });

        loop {
            let Some(request) = self.read_queue.pop() else {
                let mut state = self.lock_state();
                if self.read_queue.is_empty() {
                    state.disk_reader_running = false;
                    guard.disarm();
                    return;
                }
                continue;
            };

            let result = match self.store.read(&request.artifact_path).await {
                Ok(data) => self.decode_stored(data).await,
                Err(error) if error.kind() == io::ErrorKind::NotFound => {
                    // Removed since `load` looked for it.
                    tracing::debug!(url = request.url.as_str(), "Stored artifact vanished");
                    self.schedule_fetch(&mut self.lock_state(), request);
                    continue;
                }
                Err(error) => Err(CacheError::from(error)),
            };

            if let Err(error) = &result {
                self.report_read_failure(&request, error);
                // Gone before the failure is published, the next load fetches it again.
                if let Err(error) = tokio::fs::remove_file(&request.artifact_path).await {
                    tracing::debug!(
                        error = &error as &dyn std::error::Error,
                        "Failed to remove broken artifact file"
                    );
                }
            }

            let subscribers = self.settle(&request, &result);
            if result.is_err() {
                self.discard(&request);
            }
            self.deliver_all(&request, subscribers, &result);
        }
    }

    fn report_read_failure(&self, request: &Request, error: &CacheError) {
        metric!(counter("loader.disk.read.failure") += 1);
        tracing::error!(
            url = request.url.as_str(),
            path = %request.artifact_path.display(),
            error = error as &dyn std::error::Error,
            "Failed to load stored artifact"
        );
    }

    /// Decodes a stored artifact.
    ///
    /// Stored artifacts are already downsampled, so they are decoded at scale 1.
    async fn decode_stored(&self, data: Bytes) -> CacheEntry<Artifact> {
        let codec = self.codec.clone();
        self.runtime
            .spawn_blocking(move || codec.decode(data, 1))
            .await
            .map_err(CacheError::from_std_error)?
    }
}
