//! Embedding-side helpers: view slots, manual callback pumping, and
//! memory-pressure purges.

mod support;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use airimage_core::{
    CallbackContext, ImageCache, ImageSlot, MemoryPressureSignal,
    PressureSource,
};
use support::*;
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slot_reload_drops_the_stale_request() {
    let dir = TempDir::new().unwrap();
    let remote = sample_image(9, 9, [0, 0, 255]);
    let transport = GatedTransport::closed(Ok(jpeg_bytes(&remote)));
    let cache = cache_with(&dir, transport.clone());
    let local = sample_image(2, 2, [255, 0, 0]);
    cache.save(local.clone(), "row-1");

    let mut slot = ImageSlot::new();
    slot.load(&cache, "row-7");
    assert!(slot.is_pending());
    transport.wait_for_calls(1).await;

    // Cell recycled for another row before row-7 arrived.
    slot.load(&cache, "row-1");
    assert_eq!(slot.key().map(|k| k.as_str()), Some("row-1"));
    eventually(|| slot.image().is_some_and(|image| image.ptr_eq(&local))).await;

    eventually(|| cache.stats().in_flight == 0).await;
    transport.release();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(slot.image().unwrap().ptr_eq(&local));
    assert!(!dir.path().join("row-7.jpg").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_a_slot_cancels_its_lookup() {
    let dir = TempDir::new().unwrap();
    let remote = sample_image(3, 3, [7, 7, 7]);
    let transport = GatedTransport::closed(Ok(jpeg_bytes(&remote)));
    let cache = cache_with(&dir, transport.clone());

    let mut slot = ImageSlot::new();
    slot.load(&cache, "gone-soon");
    transport.wait_for_calls(1).await;
    drop(slot);

    eventually(|| cache.stats().in_flight == 0).await;
    transport.release();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cache.memory().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_context_runs_completions_only_when_pumped() {
    let dir = TempDir::new().unwrap();
    let (cache, pump) = ImageCache::builder(settings_in(&dir))
        .transport(GatedTransport::open(Ok(Vec::new())))
        .build_in(CallbackContext::Manual)
        .unwrap();
    let mut pump = pump.expect("manual context hands back a pump");

    let image = sample_image(2, 2, [1, 2, 3]);
    cache.save(image, "user-42");

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    assert!(
        cache
            .lookup("user-42", move |entry| {
                flag.store(entry.is_some(), Ordering::SeqCst);
            })
            .is_none()
    );

    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(pump.run_pending(), 1);
    assert!(ran.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pressure_signal_purges_memory_but_not_disk() {
    let dir = TempDir::new().unwrap();
    let signal = MemoryPressureSignal::new();
    let cache = ImageCache::builder(settings_in(&dir))
        .transport(GatedTransport::open(Ok(Vec::new())))
        .pressure_signal(signal.clone())
        .build()
        .unwrap();

    for key in ["a", "b"] {
        assert!(cache.save(sample_image(2, 2, [4, 4, 4]), key).await.unwrap());
    }
    assert_eq!(cache.memory().len(), 2);

    assert_eq!(signal.notify(PressureSource::Application), 1);
    eventually(|| cache.memory().is_empty()).await;

    let (callback, mut rx) = collector();
    cache.lookup("a", callback);
    assert!(next_result(&mut rx).await.is_some(), "disk survives a purge");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_cache_deregisters_from_the_signal() {
    let dir = TempDir::new().unwrap();
    let signal = MemoryPressureSignal::new();
    let cache = ImageCache::builder(settings_in(&dir))
        .transport(GatedTransport::open(Ok(Vec::new())))
        .pressure_signal(signal.clone())
        .build()
        .unwrap();
    assert_eq!(signal.subscriber_count(), 1);

    drop(cache);
    eventually(|| signal.subscriber_count() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn memory_budget_evicts_oldest_saves() {
    let dir = TempDir::new().unwrap();
    let one = sample_image(4, 4, [0, 0, 0]).estimated_bytes();
    let cache = ImageCache::builder(airimage_core::CacheSettings {
        memory_budget_bytes: Some(one * 2),
        ..settings_in(&dir)
    })
    .transport(GatedTransport::open(Ok(Vec::new())))
    .build()
    .unwrap();

    for key in ["first", "second", "third"] {
        cache.save(sample_image(4, 4, [0, 0, 0]), key);
    }

    assert_eq!(cache.memory().len(), 2);
    assert!(cache.memory().resident_bytes() <= one * 2);
    assert!(cache.memory().get(&"first".into()).is_none());
}
