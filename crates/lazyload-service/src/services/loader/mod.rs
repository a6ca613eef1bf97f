//! The loader: request coalescing, scheduling and delivery.
//!
//! Every [`load`](Loader::load) goes through the request table, which holds at most one live
//! [`Request`] per URL. A decoded request is delivered right away. A pending one gets another
//! subscriber. Otherwise a new request is created and handed to one of three kinds of
//! background workers, all of them tokio tasks on the loader's runtime:
//!
//! - Download workers (at most `max_download_workers`) drain the priority tiers, fetch and decode
//!   the artifact, publish it and hand the request on to the disk writer.
//! - A single disk reader decodes artifacts found in the store.
//! - A single disk writer persists freshly fetched artifacts, and forgets failed requests so that
//!   their URL is retried on the next load.
//!
//! Workers are started on demand and exit once they run out of work. The request table, the
//! memory cache accounting, the tag index, the freshness table and the worker counters are
//! guarded by one mutex. Callbacks and the sink are never invoked while it is held.
//!
//! A subscriber only receives the outcome if its handle has not issued a newer load in the
//! meantime. Loads without a handle all share one entry in the freshness table.

use std::collections::HashMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use once_cell::sync::OnceCell;
use sentry::{Hub, SentryFutureExt};
use tokio::sync::Notify;

use crate::caching::{ArtifactStore, CacheEntry, LoadError, MemoryCache, TagIndex};
use crate::config::Config;
use crate::services::codec::{ArtifactCodec, RawCodec};
use crate::services::download::{DownloadService, Fetcher};
use crate::services::scheduler::{PriorityQueues, WorkQueue};
use crate::services::sink::{ArtifactSink, NoopSink};
use crate::types::{Artifact, Callback, DeliveryTarget, Handle, LoadOptions, Priority};

mod disk_read;
mod disk_write;
mod download_pool;
mod request;

use self::request::{Outcome, Request, Subscriber};

/// The external collaborators of a [`Loader`].
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub codec: Arc<dyn ArtifactCodec>,
    pub sink: Arc<dyn ArtifactSink>,
}

impl Collaborators {
    /// The [`DownloadService`] as fetcher, the [`RawCodec`] and a sink that drops everything.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            fetcher: Arc::new(DownloadService::new(config)?),
            codec: Arc::new(RawCodec),
            sink: Arc::new(NoopSink),
        })
    }

    pub fn with_fetcher(mut self, fetcher: impl Fetcher) -> Self {
        self.fetcher = Arc::new(fetcher);
        self
    }

    pub fn with_codec(mut self, codec: impl ArtifactCodec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn with_sink(mut self, sink: impl ArtifactSink) -> Self {
        self.sink = Arc::new(sink);
        self
    }
}

/// A point-in-time view of the loader's internal state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// Live entries in the request table, pending or decoded.
    pub requests: usize,
    pub memory_entries: usize,
    pub memory_bytes: u64,
    pub tags: usize,
    pub queued_fastest: usize,
    pub queued_faster: usize,
    pub queued_fast: usize,
    pub download_workers: usize,
    /// Cold loads that have not passed the disk writer yet.
    pub pending_writes: usize,
    pub disk_reader_running: bool,
}

#[derive(Debug)]
struct LoaderState {
    requests: HashMap<String, Arc<Request>>,
    memory: MemoryCache,
    tags: TagIndex,
    /// The logical time of the latest load per handle.
    freshness: HashMap<Option<Handle>, u64>,
    clock: u64,
    download_workers: usize,
    pending_writes: usize,
    disk_reader_running: bool,
}

impl LoaderState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Whether `request` is the one the table holds for its URL.
    fn is_live(&self, request: &Arc<Request>) -> bool {
        self.requests
            .get(&request.url)
            .is_some_and(|live| Arc::ptr_eq(live, request))
    }

    fn is_fresh(&self, subscriber: &Subscriber) -> bool {
        let handle = subscriber.target.handle();
        self.freshness
            .get(&handle)
            .is_none_or(|latest| subscriber.subscribed_at >= *latest)
    }

    /// Drops `url` from the table, the tag index and the memory cache.
    fn forget(&mut self, url: &str) {
        if let Some(request) = self.requests.remove(url) {
            self.tags.remove(&request.tag, url);
        }
        self.memory.remove(url);
    }

    /// Drops the URLs the memory cache evicted.
    fn forget_evicted(&mut self, evicted: Vec<String>) {
        for url in evicted {
            if let Some(request) = self.requests.remove(&url) {
                self.tags.remove(&request.tag, &url);
            }
        }
        metric!(gauge("loader.memory.size") = self.memory.current_size());
    }
}

/// Loads artifacts by URL from memory, the artifact store or the network.
pub struct Loader {
    runtime: tokio::runtime::Handle,
    max_download_workers: usize,
    store: ArtifactStore,
    queues: PriorityQueues<Arc<Request>>,
    read_queue: WorkQueue<Arc<Request>>,
    write_queue: WorkQueue<Arc<Request>>,
    write_ready: Notify,
    fetcher: Arc<dyn Fetcher>,
    codec: Arc<dyn ArtifactCodec>,
    sink: Arc<dyn ArtifactSink>,
    state: Mutex<LoaderState>,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("store", &self.store)
            .field("max_download_workers", &self.max_download_workers)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Loader {
    /// Creates the loader and its storage directory.
    ///
    /// All background work is spawned onto `runtime`.
    pub fn initialize(
        config: &Config,
        runtime: tokio::runtime::Handle,
        collaborators: Collaborators,
    ) -> std::io::Result<Arc<Self>> {
        let store = ArtifactStore::open(&config.storage_dir)?;
        let memory = MemoryCache::new(
            config.caches.memory.upper_limit(),
            config.caches.memory.lower_limit(),
        );
        tracing::debug!(
            storage_dir = %store.root().display(),
            upper_limit = memory.upper_limit(),
            lower_limit = memory.lower_limit(),
            "Initialized loader"
        );

        Ok(Arc::new(Self {
            runtime,
            max_download_workers: config.max_download_workers.max(1),
            store,
            queues: PriorityQueues::new(),
            read_queue: WorkQueue::new(),
            write_queue: WorkQueue::new(),
            write_ready: Notify::new(),
            fetcher: collaborators.fetcher,
            codec: collaborators.codec,
            sink: collaborators.sink,
            state: Mutex::new(LoaderState {
                requests: HashMap::new(),
                memory,
                tags: TagIndex::default(),
                freshness: HashMap::new(),
                clock: 0,
                download_workers: 0,
                pending_writes: 0,
                disk_reader_running: false,
            }),
        }))
    }

    pub fn storage_dir(&self) -> &Path {
        self.store.root()
    }

    fn lock_state(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawns a worker onto the loader's runtime, inheriting the current Sentry hub.
    fn spawn_worker<F>(&self, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let hub = Hub::new_from_top(Hub::current());
        self.runtime.spawn(worker.bind_hub(hub));
    }

    /// Requests the artifact at `url`.
    ///
    /// The outcome goes to `callback` if given, otherwise it is applied to `handle` through the
    /// [`ArtifactSink`]. Without either, the load only warms the caches. Memory hits and loads
    /// joining a pending request never touch the disk. A miss checks whether the artifact file
    /// exists, all other I/O runs in the background. Errors are never reported to the caller.
    pub fn load(
        self: &Arc<Self>,
        url: &str,
        handle: Option<Handle>,
        callback: Option<Callback>,
        options: LoadOptions,
    ) {
        if url.is_empty() {
            let error = LoadError::EmptyUrl;
            tracing::error!(error = &error as &dyn Error, ?handle, "Rejected load");
            return;
        }
        metric!(counter("loader.load") += 1, "priority" => options.priority.as_str());

        let target = DeliveryTarget::new(handle, callback);

        let joined = {
            let mut state = self.lock_state();
            let now = state.tick();
            state.freshness.insert(handle, now);
            let subscriber = target.map(|target| Subscriber {
                target,
                subscribed_at: now,
            });
            self.join_existing(&mut state, url, subscriber)
        };

        let immediate = match joined {
            Ok(immediate) => immediate,
            Err(subscriber) => {
                // The store is only consulted on a miss, and never under the state lock.
                let artifact_path = self.store.path_for(url);
                let on_disk = self.store.contains(&artifact_path);

                let mut state = self.lock_state();
                match self.join_existing(&mut state, url, subscriber) {
                    Ok(immediate) => immediate,
                    Err(subscriber) => {
                        self.schedule(
                            &mut state,
                            url,
                            subscriber,
                            &options,
                            artifact_path,
                            on_disk,
                        );
                        None
                    }
                }
            }
        };

        if let Some((target, outcome)) = immediate {
            self.deliver(url, &target, &outcome);
        }
    }

    /// Attaches to the live request for `url`, if there is one.
    ///
    /// Returns the subscriber back if a new request has to be created. `Ok(Some(..))` is a
    /// delivery the caller makes once the state lock is released.
    #[allow(clippy::type_complexity)]
    fn join_existing(
        &self,
        state: &mut LoaderState,
        url: &str,
        subscriber: Option<Subscriber>,
    ) -> Result<Option<(DeliveryTarget, Outcome)>, Option<Subscriber>> {
        let Some(request) = state.requests.get(url).cloned() else {
            return Err(subscriber);
        };

        match request.outcome() {
            Outcome::Ready(artifact) => {
                metric!(counter("loader.memory.hit") += 1);
                state.memory.touch(url);
                Ok(subscriber.map(|s| (s.target, Outcome::Ready(artifact))))
            }
            Outcome::Pending => {
                metric!(counter("loader.coalesced") += 1);
                tracing::trace!(url, "Coalescing with in-flight request");
                match subscriber.map(|s| request.subscribe(s)) {
                    Some(Err((outcome, s))) => Ok(Some((s.target, outcome))),
                    _ => Ok(None),
                }
            }
            Outcome::Failed(_) => {
                // Not yet picked up by the disk writer, start over.
                state.forget(url);
                Err(subscriber)
            }
        }
    }

    /// Creates the request for `url` and hands it to the disk reader or the download workers.
    fn schedule(
        self: &Arc<Self>,
        state: &mut LoaderState,
        url: &str,
        subscriber: Option<Subscriber>,
        options: &LoadOptions,
        artifact_path: PathBuf,
        on_disk: bool,
    ) {
        let request = Arc::new(Request::new(
            url.to_owned(),
            options.scale,
            options.priority,
            SystemTime::now().checked_add(options.expire),
            options.tag.clone(),
            artifact_path,
        ));
        if let Some(subscriber) = subscriber {
            // A fresh request is pending, so this cannot be rejected.
            let _ = request.subscribe(subscriber);
        }

        state.memory.remove(url);
        state.requests.insert(url.to_owned(), request.clone());
        state.tags.insert(&options.tag, url);

        if on_disk {
            metric!(counter("loader.disk.hit") += 1);
            tracing::trace!(url, "Loading artifact from store");
            self.read_queue.push(request);
            if !state.disk_reader_running {
                state.disk_reader_running = true;
                self.spawn_worker(self.clone().run_disk_reader());
            }
            return;
        }

        self.schedule_fetch(state, request);
    }

    /// Queues the network fetch of `request` and starts the workers it needs.
    fn schedule_fetch(self: &Arc<Self>, state: &mut LoaderState, request: Arc<Request>) {
        tracing::trace!(
            url = request.url.as_str(),
            priority = %request.priority,
            "Scheduling fetch"
        );
        self.queues.enqueue(request.priority, request);

        state.pending_writes += 1;
        if state.pending_writes == 1 {
            self.spawn_worker(self.clone().run_disk_writer());
        }
        if state.download_workers < self.max_download_workers {
            state.download_workers += 1;
            self.spawn_worker(self.clone().run_download_worker());
        }
    }

    /// Records the outcome of `request` and returns the subscribers to deliver it to.
    ///
    /// A successful outcome of the live request for its URL is accounted in the memory cache,
    /// which may evict other entries. Subscribers whose handle has issued a newer load are
    /// dropped.
    fn settle(&self, request: &Arc<Request>, result: &CacheEntry<Artifact>) -> Vec<Subscriber> {
        let outcome = match result {
            Ok(artifact) => Outcome::Ready(artifact.clone()),
            Err(error) => Outcome::Failed(error.clone()),
        };
        let subscribers = request.complete(outcome);

        let mut state = self.lock_state();
        if let Ok(artifact) = result
            && state.is_live(request)
        {
            let evicted = state
                .memory
                .insert(request.url.clone(), artifact.byte_size());
            state.forget_evicted(evicted);
        }

        let (fresh, stale): (Vec<_>, Vec<_>) =
            subscribers.into_iter().partition(|s| state.is_fresh(s));
        if !stale.is_empty() {
            tracing::trace!(
                url = request.url.as_str(),
                stale = stale.len(),
                "Dropping stale subscribers"
            );
            metric!(counter("loader.delivery.stale") += stale.len() as i64);
        }
        fresh
    }

    fn deliver_all(
        &self,
        request: &Request,
        subscribers: Vec<Subscriber>,
        result: &CacheEntry<Artifact>,
    ) {
        let outcome = match result {
            Ok(artifact) => Outcome::Ready(artifact.clone()),
            Err(error) => Outcome::Failed(error.clone()),
        };
        for subscriber in subscribers {
            self.deliver(&request.url, &subscriber.target, &outcome);
        }
    }

    fn deliver(&self, url: &str, target: &DeliveryTarget, outcome: &Outcome) {
        match (target, outcome) {
            (DeliveryTarget::Callback { handle, callback }, Outcome::Ready(artifact)) => {
                callback.artifact(url, *handle, artifact)
            }
            (DeliveryTarget::Callback { handle, callback }, Outcome::Failed(error)) => {
                callback.failure(url, *handle, error)
            }
            (DeliveryTarget::Handle(handle), Outcome::Ready(artifact)) => {
                self.sink.apply(*handle, url, artifact)
            }
            // a failed load leaves the handle untouched
            (DeliveryTarget::Handle(_), Outcome::Failed(_)) => return,
            (_, Outcome::Pending) => return,
        }
        metric!(counter("loader.delivery") += 1);
    }

    /// Drops `request` from the loader, unless its URL has been requested anew since.
    fn discard(&self, request: &Arc<Request>) {
        let mut state = self.lock_state();
        if state.is_live(request) {
            state.forget(&request.url);
        }
    }

    /// Demotes every queued fetch by one tier.
    ///
    /// Meant to be called when the consumer's focus changes, so that fetches requested afterwards
    /// overtake the ones requested before. Nothing is cancelled.
    pub fn reset_priority(&self) {
        self.queues.reset_priority();
    }

    /// Forgets every request and empties the memory cache. The artifact store is kept.
    pub fn clear_cache(&self) {
        let mut state = self.lock_state();
        tracing::debug!(requests = state.requests.len(), "Clearing loader cache");
        state.requests.clear();
        state.memory.clear();
        state.tags.clear();
        metric!(gauge("loader.memory.size") = 0u64);
    }

    /// Forgets every request loaded under `tag`, or all of them if `tag` is `None`.
    pub fn invalidate_tag(&self, tag: Option<&str>) {
        let Some(tag) = tag else {
            return self.clear_cache();
        };

        let mut state = self.lock_state();
        let urls = state.tags.take(tag);
        tracing::debug!(tag, urls = urls.len(), "Invalidating tag");
        for url in urls {
            state.requests.remove(&url);
            state.memory.remove(&url);
        }
        metric!(gauge("loader.memory.size") = state.memory.current_size());
    }

    pub fn stats(&self) -> LoaderStats {
        let state = self.lock_state();
        LoaderStats {
            requests: state.requests.len(),
            memory_entries: state.memory.len(),
            memory_bytes: state.memory.current_size(),
            tags: state.tags.len(),
            queued_fastest: self.queues.len(Priority::Fastest),
            queued_faster: self.queues.len(Priority::Faster),
            queued_fast: self.queues.len(Priority::Fast),
            download_workers: state.download_workers,
            pending_writes: state.pending_writes,
            disk_reader_running: state.disk_reader_running,
        }
    }
}

/// Holds the loader of a host that must only ever initialize one.
#[derive(Debug, Default)]
pub struct LoaderCell {
    inner: OnceCell<Arc<Loader>>,
}

impl LoaderCell {
    pub const fn new() -> Self {
        Self {
            inner: OnceCell::new(),
        }
    }

    /// Initializes the loader on the first call. Later calls return it and ignore their
    /// arguments.
    pub fn initialize(
        &self,
        config: &Config,
        runtime: tokio::runtime::Handle,
        collaborators: Collaborators,
    ) -> std::io::Result<&Arc<Loader>> {
        self.inner
            .get_or_try_init(|| Loader::initialize(config, runtime, collaborators))
    }

    pub fn get(&self) -> Option<&Arc<Loader>> {
        self.inner.get()
    }
}
