use bytes::Bytes;

use lazyload_service::caching::file_name;
use lazyload_service::types::{Handle, LoadOptions};
use lazyload_test::{HitCounter, Recorder};

use crate::utils::setup_loader;

#[tokio::test(flavor = "multi_thread")]
async fn test_eviction_down_to_low_watermark() {
    let storage = lazyload_test::tempdir();
    let server = HitCounter::new();
    let recorder = Recorder::new();
    let loader = setup_loader(storage.path(), &recorder, |config| {
        config.caches.memory.budget = 100;
        config.caches.memory.low_watermark = Some(50);
    });

    let urls: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| server.url(&format!("sized/40/{name}.png")))
        .collect();

    for (i, url) in urls.iter().enumerate() {
        loader.load(url.as_str(), Some(Handle::new(1)), None, LoadOptions::default());
        recorder.wait_for(i + 1).await;
        lazyload_test::wait_idle(&loader).await;
    }

    // 120 bytes reached the budget of 100, so the two oldest entries were dropped
    let stats = loader.stats();
    assert_eq!(stats.memory_bytes, 40);
    assert_eq!(stats.memory_entries, 1);
    assert_eq!(stats.requests, 1);
    assert_eq!(server.accesses(), 3);

    // evicted artifacts are reloaded from the store
    loader.load(urls[0].as_str(), Some(Handle::new(1)), None, LoadOptions::default());
    recorder.wait_for(4).await;
    lazyload_test::wait_idle(&loader).await;
    assert_eq!(server.accesses(), 0);
    assert_eq!(loader.stats().memory_bytes, 80);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recently_used_entries_survive() {
    let storage = lazyload_test::tempdir();
    let server = HitCounter::new();
    let recorder = Recorder::new();
    let loader = setup_loader(storage.path(), &recorder, |config| {
        config.caches.memory.budget = 100;
        config.caches.memory.low_watermark = Some(80);
    });

    let a = server.url("sized/40/a.png");
    let b = server.url("sized/40/b.png");
    let c = server.url("sized/40/c.png");

    for (i, url) in [&a, &b].into_iter().enumerate() {
        loader.load(url.as_str(), Some(Handle::new(1)), None, LoadOptions::default());
        recorder.wait_for(i + 1).await;
        lazyload_test::wait_idle(&loader).await;
    }

    // touching `a` makes `b` the least recently used entry
    loader.load(a.as_str(), Some(Handle::new(1)), None, LoadOptions::default());
    loader.load(c.as_str(), Some(Handle::new(1)), None, LoadOptions::default());
    recorder.wait_for(4).await;
    lazyload_test::wait_idle(&loader).await;
    assert_eq!(server.accesses(), 3);

    let stats = loader.stats();
    assert_eq!(stats.memory_entries, 2);
    assert_eq!(stats.memory_bytes, 80);

    // `a` is still decoded and delivered right away
    loader.load(a.as_str(), Some(Handle::new(2)), None, LoadOptions::default());
    assert_eq!(recorder.len(), 5);

    // `b` has to be read back from the store
    loader.load(b.as_str(), Some(Handle::new(3)), None, LoadOptions::default());
    recorder.wait_for(6).await;
    lazyload_test::wait_idle(&loader).await;
    assert_eq!(server.accesses(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalidate_tag() {
    let storage = lazyload_test::tempdir();
    let server = HitCounter::new();
    let recorder = Recorder::new();
    let loader = setup_loader(storage.path(), &recorder, |_| {});

    let thumbs = LoadOptions::default().tag("thumbs");
    loader.load(server.url("sized/10/a.png").as_str(), None, None, thumbs.clone());
    loader.load(server.url("sized/10/b.png").as_str(), None, None, thumbs);
    loader.load(server.url("sized/30/c.png").as_str(), None, None, LoadOptions::default());
    lazyload_test::wait_idle(&loader).await;

    let stats = loader.stats();
    assert_eq!(stats.requests, 3);
    assert_eq!(stats.memory_bytes, 50);
    assert_eq!(stats.tags, 2);

    loader.invalidate_tag(Some("thumbs"));
    let stats = loader.stats();
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.memory_entries, 1);
    assert_eq!(stats.memory_bytes, 30);
    assert_eq!(stats.tags, 1);

    // unknown tags are a no-op
    loader.invalidate_tag(Some("avatars"));
    assert_eq!(loader.stats().requests, 1);

    loader.invalidate_tag(None);
    let stats = loader.stats();
    assert_eq!(stats.requests, 0);
    assert_eq!(stats.memory_bytes, 0);
    assert_eq!(stats.tags, 1);
    assert_eq!(server.accesses(), 3);

    // the store is kept
    loader.load(server.url("sized/10/a.png").as_str(), None, None, LoadOptions::default());
    lazyload_test::wait_idle(&loader).await;
    assert_eq!(server.accesses(), 0);
    assert_eq!(loader.stats().memory_bytes, 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clear_cache_during_fetch() {
    let storage = lazyload_test::tempdir();
    let server = HitCounter::new();
    let recorder = Recorder::new();
    let loader = setup_loader(storage.path(), &recorder, |_| {});

    let url = server.url("delay/200ms/garbage_data/late.png");
    let callback = Some(recorder.callback());
    loader.load(url.as_str(), Some(Handle::new(1)), callback, LoadOptions::default());
    loader.clear_cache();
    assert_eq!(loader.stats().requests, 0);

    // the fetch is not cancelled, but its result is no longer cached in memory
    let deliveries = recorder.wait_for(1).await;
    lazyload_test::wait_idle(&loader).await;
    assert_eq!(deliveries[0].outcome, Ok(Bytes::from_static(b"late.png")));

    let stats = loader.stats();
    assert_eq!(stats.requests, 0);
    assert_eq!(stats.memory_entries, 0);
    assert_eq!(stats.memory_bytes, 0);

    let stored = storage.path().join(file_name(url.as_str()));
    assert_eq!(std::fs::read(stored).unwrap(), b"late.png");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalidate_tag_during_fetch() {
    let storage = lazyload_test::tempdir();
    let server = HitCounter::new();
    let recorder = Recorder::new();
    let loader = setup_loader(storage.path(), &recorder, |_| {});

    let thumb = server.url("delay/200ms/sized/10/thumb.png");
    let other = server.url("delay/200ms/sized/30/other.png");
    let thumbs = LoadOptions::default().tag("thumbs");
    let callback = Some(recorder.callback());
    loader.load(thumb.as_str(), Some(Handle::new(1)), callback.clone(), thumbs);
    loader.load(other.as_str(), Some(Handle::new(2)), callback, LoadOptions::default());
    loader.invalidate_tag(Some("thumbs"));
    assert_eq!(loader.stats().requests, 1);

    let deliveries = recorder.wait_for(2).await;
    lazyload_test::wait_idle(&loader).await;
    assert!(deliveries.iter().all(|d| d.outcome.is_ok()));

    let stats = loader.stats();
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.memory_entries, 1);
    assert_eq!(stats.memory_bytes, 30);

    assert!(storage.path().join(file_name(thumb.as_str())).is_file());
    assert!(storage.path().join(file_name(other.as_str())).is_file());
}
