use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;

use lazyload_service::caching::CacheEntry;
use lazyload_service::config::Config;
use lazyload_service::services::{Collaborators, Fetcher, Loader};
use lazyload_service::types::{LoadOptions, Priority};
use lazyload_test::Recorder;

/// Records the order of fetches. Fetching `gate` blocks until the gate is opened.
#[derive(Clone)]
struct OrderedFetcher {
    fetched: Arc<Mutex<Vec<String>>>,
    gate: Arc<Semaphore>,
}

impl Default for OrderedFetcher {
    fn default() -> Self {
        Self {
            fetched: Default::default(),
            gate: Arc::new(Semaphore::new(0)),
        }
    }
}

impl OrderedFetcher {
    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    async fn wait_for(&self, count: usize) {
        let wait = async {
            while self.fetched().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap();
    }
}

impl Fetcher for OrderedFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, CacheEntry<Bytes>> {
        Box::pin(async move {
            self.fetched.lock().unwrap().push(url.to_owned());
            if url == "gate" {
                let _permit = self.gate.acquire().await.unwrap();
            }
            Ok(Bytes::copy_from_slice(url.as_bytes()))
        })
    }
}

fn setup(storage: &lazyload_test::TempDir, fetcher: &OrderedFetcher) -> Arc<Loader> {
    lazyload_test::setup();

    let config = Config {
        max_download_workers: 1,
        ..lazyload_test::config(storage.path())
    };
    let collaborators = Collaborators::from_config(&config)
        .unwrap()
        .with_fetcher(fetcher.clone())
        .with_sink(Recorder::new());
    Loader::initialize(&config, tokio::runtime::Handle::current(), collaborators).unwrap()
}

fn load(loader: &Arc<Loader>, url: &str, priority: Priority) {
    loader.load(url, None, None, LoadOptions::default().priority(priority));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_strict_priority_order() {
    let storage = lazyload_test::tempdir();
    let fetcher = OrderedFetcher::default();
    let loader = setup(&storage, &fetcher);

    load(&loader, "gate", Priority::Fast);
    fetcher.wait_for(1).await;

    load(&loader, "fast-1", Priority::Fast);
    load(&loader, "faster-1", Priority::Faster);
    load(&loader, "fastest-1", Priority::Fastest);
    load(&loader, "fast-2", Priority::Fast);
    load(&loader, "fastest-2", Priority::Fastest);

    let stats = loader.stats();
    assert_eq!(stats.download_workers, 1);
    assert_eq!(stats.queued_fastest, 2);
    assert_eq!(stats.queued_faster, 1);
    assert_eq!(stats.queued_fast, 2);

    fetcher.gate.add_permits(1);
    lazyload_test::wait_idle(&loader).await;

    assert_eq!(
        fetcher.fetched(),
        ["gate", "fastest-1", "fastest-2", "faster-1", "fast-1", "fast-2"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reset_priority_demotes_queued_fetches() {
    let storage = lazyload_test::tempdir();
    let fetcher = OrderedFetcher::default();
    let loader = setup(&storage, &fetcher);

    load(&loader, "gate", Priority::Fastest);
    fetcher.wait_for(1).await;

    load(&loader, "old-fastest", Priority::Fastest);
    load(&loader, "old-faster", Priority::Faster);
    load(&loader, "old-fast", Priority::Fast);
    loader.reset_priority();

    let stats = loader.stats();
    assert_eq!(stats.queued_fastest, 0);
    assert_eq!(stats.queued_faster, 1);
    assert_eq!(stats.queued_fast, 2);

    // queued behind the fetch that was demoted into the same tier
    load(&loader, "new-faster", Priority::Faster);

    fetcher.gate.add_permits(1);
    lazyload_test::wait_idle(&loader).await;

    assert_eq!(
        fetcher.fetched(),
        ["gate", "old-fastest", "new-faster", "old-fast", "old-faster"]
    );
    assert_eq!(loader.stats().requests, 5);
}
