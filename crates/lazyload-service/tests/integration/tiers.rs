use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;

use lazyload_service::caching::{CacheEntry, CacheError, file_name};
use lazyload_service::services::{ArtifactCodec, Collaborators, Loader, LoaderCell, RawCodec};
use lazyload_service::types::{Artifact, Handle, LoadOptions, Priority};
use lazyload_test::{HitCounter, Recorder};
use url::Url;

use crate::utils::setup_loader;

#[tokio::test(flavor = "multi_thread")]
async fn test_cold_load() {
    let storage = lazyload_test::tempdir();
    let server = HitCounter::new();
    let recorder = Recorder::new();
    let loader = setup_loader(storage.path(), &recorder, |config| {
        config.max_download_workers = 1;
    });

    let url = server.url("delay/100ms/garbage_data/cold.png");
    let options = LoadOptions::default().priority(Priority::Fastest);
    loader.load(url.as_str(), Some(Handle::new(1)), None, options);

    let stats = loader.stats();
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.download_workers, 1);
    assert_eq!(stats.pending_writes, 1);
    assert!(!stats.disk_reader_running);

    let deliveries = recorder.wait_for(1).await;
    lazyload_test::wait_idle(&loader).await;

    assert_eq!(deliveries[0].handle, Some(Handle::new(1)));
    assert_eq!(deliveries[0].outcome, Ok(Bytes::from_static(b"cold.png")));

    let stats = loader.stats();
    assert_eq!(stats.memory_entries, 1);
    assert_eq!(stats.download_workers, 0);
    assert_eq!(stats.pending_writes, 0);

    let stored = std::fs::read(storage.path().join(file_name(url.as_str()))).unwrap();
    assert_eq!(stored, b"cold.png");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stored_artifact_skips_network() {
    let storage = lazyload_test::tempdir();
    let server = HitCounter::new();
    let recorder = Recorder::new();
    let url = server.url("garbage_data/stored.png");

    {
        let loader = setup_loader(storage.path(), &recorder, |_| {});
        loader.load(url.as_str(), Some(Handle::new(1)), None, LoadOptions::default());
        recorder.wait_for(1).await;
        lazyload_test::wait_idle(&loader).await;
    }
    assert_eq!(server.accesses(), 1);

    // a fresh loader only has the store to go by
    let loader = setup_loader(storage.path(), &recorder, |_| {});
    loader.load(url.as_str(), Some(Handle::new(2)), None, LoadOptions::default());
    assert_eq!(loader.stats().pending_writes, 0);

    let deliveries = recorder.wait_for(2).await;
    lazyload_test::wait_idle(&loader).await;

    assert_eq!(deliveries[1].handle, Some(Handle::new(2)));
    assert_eq!(deliveries[1].outcome, Ok(Bytes::from_static(b"stored.png")));
    assert_eq!(server.accesses(), 0);
    assert_eq!(loader.stats().memory_entries, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_fetch_is_retried() {
    let storage = lazyload_test::tempdir();
    let server = HitCounter::new();
    let recorder = Recorder::new();
    let loader = setup_loader(storage.path(), &recorder, |_| {});

    let url = server.url("respond_statuscode/404/missing.png");
    let handle = Some(Handle::new(1));
    loader.load(url.as_str(), handle, Some(recorder.callback()), LoadOptions::default());

    let deliveries = recorder.wait_for(1).await;
    lazyload_test::wait_idle(&loader).await;
    assert_eq!(deliveries[0].outcome, Err(CacheError::NotFound));

    // the failed request is forgotten and nothing is stored
    let stats = loader.stats();
    assert_eq!(stats.requests, 0);
    assert_eq!(stats.memory_entries, 0);
    assert!(!storage.path().join(file_name(url.as_str())).exists());
    assert_eq!(server.accesses(), 1);

    loader.load(url.as_str(), handle, Some(recorder.callback()), LoadOptions::default());
    recorder.wait_for(2).await;
    lazyload_test::wait_idle(&loader).await;
    assert_eq!(server.accesses(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failure_without_failure_callback_is_silent() {
    let storage = lazyload_test::tempdir();
    let server = HitCounter::new();
    let recorder = Recorder::new();
    let loader = setup_loader(storage.path(), &recorder, |_| {});

    let url = server.url("respond_statuscode/403/secret.png");
    loader.load(url.as_str(), Some(Handle::new(1)), None, LoadOptions::default());
    lazyload_test::wait_idle(&loader).await;

    assert!(recorder.is_empty());
    assert_eq!(loader.stats().requests, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_errors_are_retried() {
    let storage = lazyload_test::tempdir();
    let server = HitCounter::new();
    let recorder = Recorder::new();
    let loader = setup_loader(storage.path(), &recorder, |config| {
        config.download_attempts = 3;
    });

    let url = server.url("respond_statuscode/503/flaky.png");
    loader.load(url.as_str(), None, Some(recorder.callback()), LoadOptions::default());

    let deliveries = recorder.wait_for(1).await;
    lazyload_test::wait_idle(&loader).await;
    assert_eq!(
        deliveries[0].outcome,
        Err(CacheError::DownloadError("503 Service Unavailable".into()))
    );
    assert_eq!(server.accesses(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_timeout() {
    let storage = lazyload_test::tempdir();
    let server = HitCounter::new();
    let recorder = Recorder::new();
    let loader = setup_loader(storage.path(), &recorder, |config| {
        config.max_download_timeout = Duration::from_millis(100);
    });

    let url = server.url("delay/1s/garbage_data/late.png");
    loader.load(url.as_str(), None, Some(recorder.callback()), LoadOptions::default());

    let deliveries = recorder.wait_for(1).await;
    assert_eq!(
        deliveries[0].outcome,
        Err(CacheError::Timeout(Duration::from_millis(100)))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_payload_is_malformed() {
    let storage = lazyload_test::tempdir();
    let server = HitCounter::new();
    let recorder = Recorder::new();
    let loader = setup_loader(storage.path(), &recorder, |_| {});

    let url = server.url("respond_statuscode/200/empty.png");
    loader.load(url.as_str(), None, Some(recorder.callback()), LoadOptions::default());

    let deliveries = recorder.wait_for(1).await;
    lazyload_test::wait_idle(&loader).await;
    assert!(matches!(deliveries[0].outcome, Err(CacheError::Malformed(_))));
    assert_eq!(loader.stats().requests, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broken_stored_artifact_is_refetched() {
    let storage = lazyload_test::tempdir();
    let server = HitCounter::new();
    let recorder = Recorder::new();
    let loader = setup_loader(storage.path(), &recorder, |_| {});

    let url = server.url("garbage_data/broken.png");
    let stored = storage.path().join(file_name(url.as_str()));
    std::fs::write(&stored, b"").unwrap();

    loader.load(url.as_str(), None, Some(recorder.callback()), LoadOptions::default());
    let deliveries = recorder.wait_for(1).await;
    lazyload_test::wait_idle(&loader).await;

    assert!(matches!(deliveries[0].outcome, Err(CacheError::Malformed(_))));
    assert!(!stored.exists());
    assert_eq!(loader.stats().requests, 0);
    assert_eq!(server.accesses(), 0);

    loader.load(url.as_str(), None, Some(recorder.callback()), LoadOptions::default());
    let deliveries = recorder.wait_for(2).await;
    lazyload_test::wait_idle(&loader).await;

    assert_eq!(deliveries[1].outcome, Ok(Bytes::from_static(b"broken.png")));
    assert_eq!(server.accesses(), 1);
    assert_eq!(std::fs::read(&stored).unwrap(), b"broken.png");
}

/// Counts how often an empty payload was decoded.
#[derive(Clone, Default)]
struct CountingCodec {
    empty_decodes: Arc<AtomicUsize>,
}

impl ArtifactCodec for CountingCodec {
    fn decode(&self, data: Bytes, scale: u32) -> CacheEntry<Artifact> {
        if data.is_empty() {
            self.empty_decodes.fetch_add(1, Ordering::SeqCst);
        }
        RawCodec.decode(data, scale)
    }

    fn encode(&self, artifact: &Artifact) -> CacheEntry<Bytes> {
        RawCodec.encode(artifact)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broken_stored_artifact_is_read_once() {
    lazyload_test::setup();
    let storage = lazyload_test::tempdir();
    let server = HitCounter::new();
    let recorder = Recorder::new();
    let codec = CountingCodec::default();

    let config = lazyload_test::config(storage.path());
    let collaborators = Collaborators::from_config(&config)
        .unwrap()
        .with_codec(codec.clone())
        .with_sink(recorder.clone());
    let loader =
        Loader::initialize(&config, tokio::runtime::Handle::current(), collaborators).unwrap();

    let url = server.url("garbage_data/racy.png");
    let stored = storage.path().join(file_name(url.as_str()));
    std::fs::write(&stored, b"").unwrap();

    // keep loading while the broken file is read, rejected and removed
    for _ in 0..50 {
        loader.load(url.as_str(), None, Some(recorder.callback()), LoadOptions::default());
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    lazyload_test::wait_idle(&loader).await;

    loader.load(url.as_str(), None, Some(recorder.callback()), LoadOptions::default());
    lazyload_test::wait_idle(&loader).await;

    assert_eq!(codec.empty_decodes.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read(&stored).unwrap(), b"racy.png");
    assert!(
        recorder
            .deliveries()
            .iter()
            .all(|d| d.outcome.is_ok() || matches!(d.outcome, Err(CacheError::Malformed(_))))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_expire_beyond_representable_time() {
    let storage = lazyload_test::tempdir();
    let server = HitCounter::new();
    let recorder = Recorder::new();
    let loader = setup_loader(storage.path(), &recorder, |_| {});

    let url = server.url("garbage_data/forever.png");
    let forever = LoadOptions::default().expire(Duration::MAX);
    loader.load(url.as_str(), None, Some(recorder.callback()), forever.clone());
    let deliveries = recorder.wait_for(1).await;
    lazyload_test::wait_idle(&loader).await;
    assert_eq!(deliveries[0].outcome, Ok(Bytes::from_static(b"forever.png")));

    // the disk path creates its request the same way
    loader.clear_cache();
    let forever = forever.expire(Duration::from_secs(u64::MAX));
    loader.load(url.as_str(), None, Some(recorder.callback()), forever);
    let deliveries = recorder.wait_for(2).await;
    lazyload_test::wait_idle(&loader).await;
    assert_eq!(deliveries[1].outcome, Ok(Bytes::from_static(b"forever.png")));
    assert_eq!(server.accesses(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_long_found_redirect_chain_is_denied() {
    let storage = lazyload_test::tempdir();
    let server = HitCounter::new();
    let recorder = Recorder::new();
    let loader = setup_loader(storage.path(), &recorder, |_| {});

    let followed = server.url("redirect/redirect/garbage_data/two.png");
    loader.load(followed.as_str(), None, Some(recorder.callback()), LoadOptions::default());
    let deliveries = recorder.wait_for(1).await;
    assert_eq!(deliveries[0].outcome, Ok(Bytes::from_static(b"two.png")));
    lazyload_test::wait_idle(&loader).await;
    server.accesses();

    let login = server.url("redirect/redirect/redirect/garbage_data/three.png");
    loader.load(login.as_str(), None, Some(recorder.callback()), LoadOptions::default());
    let deliveries = recorder.wait_for(2).await;
    lazyload_test::wait_idle(&loader).await;
    assert_eq!(
        deliveries[1].outcome,
        Err(CacheError::PermissionDenied(
            "Potential login page detected".into()
        ))
    );
    // three redirects, the artifact itself is never requested, and nothing is retried
    assert_eq!(server.accesses(), 3);
    assert_eq!(server.hits("garbage_data/three.png"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_url() {
    let storage = lazyload_test::tempdir();
    let recorder = Recorder::new();
    let loader = setup_loader(storage.path(), &recorder, |_| {});

    let url = Url::from_file_path(lazyload_test::fixture("artifacts/hello.txt")).unwrap();
    let options = LoadOptions::default().scale(2);
    loader.load(url.as_str(), Some(Handle::new(1)), None, options);

    let deliveries = recorder.wait_for(1).await;
    assert_eq!(
        deliveries[0].outcome,
        Ok(Bytes::from_static(b"hello from the fixture store\n"))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_loader_cell_initializes_once() {
    lazyload_test::setup();
    let first_dir = lazyload_test::tempdir();
    let second_dir = lazyload_test::tempdir();

    let cell = LoaderCell::new();
    assert!(cell.get().is_none());

    let config = lazyload_test::config(first_dir.path());
    let runtime = tokio::runtime::Handle::current();
    let collaborators = Collaborators::from_config(&config).unwrap();
    let first = cell
        .initialize(&config, runtime.clone(), collaborators.clone())
        .unwrap()
        .clone();

    let config = lazyload_test::config(second_dir.path());
    let second = cell.initialize(&config, runtime, collaborators).unwrap();

    assert!(std::sync::Arc::ptr_eq(&first, second));
    assert_eq!(second.storage_dir(), first_dir.path());
}
