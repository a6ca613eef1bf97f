use std::sync::Arc;

use crate::caching::{CacheEntry, CacheError};
use crate::types::Artifact;
use crate::utils::defer::defer;

use super::{Loader, Request};

impl Loader {
    /// Drains the priority tiers until they are empty.
    ///
    /// The final emptiness check and the decrement of the worker counter happen under the state
    /// lock, which is also held while `load` enqueues and decides whether to start a worker. A
    /// request can thus never be left in a tier without a worker.
    pub(super) async fn run_download_worker(self: Arc<Self>) {
        let loader = self.clone();
        let guard = defer(move || {
            if std::thread::panicking() {
                tracing::error!("Download worker panicked");
            }
            loader.lock_state().download_workers -= 1;
        });

        loop {
            let request = match self.queues.dequeue_next() {
                Some(request) => request,
                None => {
                    let mut state = self.lock_state();
                    match self.queues.dequeue_next() {
                        Some(request) => request,
                        None => {
                            state.download_workers -= 1;
                            guard.disarm();
                            return;
                        }
                    }
                }
            };

            let result = self.fetch_and_decode(&request).await;
            if let Err(error) = &result {
                tracing::debug!(
                    url = request.url.as_str(),
                    error = error as &dyn std::error::Error,
                    "Failed to load artifact"
                );
            }

            let subscribers = self.settle(&request, &result);
            // Failed requests go to the writer as well, which drops them from the table.
            self.write_queue.push(request.clone());
            self.write_ready.notify_one();

            self.deliver_all(&request, subscribers, &result);
        }
    }

    async fn fetch_and_decode(&self, request: &Request) -> CacheEntry<Artifact> {
        tracing::trace!(
            url = request.url.as_str(),
            priority = %request.priority,
            "Fetching artifact"
        );
        let data = self.fetcher.fetch(&request.url).await?;

        let codec = self.codec.clone();
        let scale = request.scale;
        self.runtime
            .spawn_blocking(move || codec.decode(data, scale))
            .await
            .map_err(CacheError::from_std_error)?
    }
}
