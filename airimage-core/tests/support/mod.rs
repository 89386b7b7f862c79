#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use airimage_core::{
    CacheKey, CacheSettings, FetchError, ImageCache, ImageCodec, ImageEntry,
    JpegCodec, Transport,
};
use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use url::Url;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn sample_image(width: u32, height: u32, rgb: [u8; 3]) -> ImageEntry {
    ImageEntry::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(
        width,
        height,
        Rgb(rgb),
    )))
}

pub fn jpeg_bytes(entry: &ImageEntry) -> Vec<u8> {
    JpegCodec::default().encode(entry).expect("encode sample")
}

/// Transport double: counts calls and holds every fetch until the gate
/// opens.
#[derive(Debug)]
pub struct GatedTransport {
    calls: watch::Sender<usize>,
    resets: AtomicUsize,
    gate: watch::Sender<bool>,
    response: Mutex<Result<Vec<u8>, FetchError>>,
}

impl GatedTransport {
    pub fn closed(response: Result<Vec<u8>, FetchError>) -> Arc<Self> {
        Arc::new(Self {
            calls: watch::Sender::new(0),
            resets: AtomicUsize::new(0),
            gate: watch::Sender::new(false),
            response: Mutex::new(response),
        })
    }

    pub fn open(response: Result<Vec<u8>, FetchError>) -> Arc<Self> {
        let transport = Self::closed(response);
        transport.release();
        transport
    }

    pub fn serving(entry: &ImageEntry) -> Arc<Self> {
        Self::open(Ok(jpeg_bytes(entry)))
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn calls(&self) -> usize {
        *self.calls.borrow()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub async fn wait_for_calls(&self, expected: usize) {
        let mut rx = self.calls.subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(|calls| *calls >= expected))
            .await
            .expect("transport was not called in time")
            .expect("call counter closed");
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn fetch(&self, _url: &Url) -> Result<Vec<u8>, FetchError> {
        self.calls.send_modify(|calls| *calls += 1);
        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(FetchError::Cancelled);
        }
        self.response.lock().clone()
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport double whose first fetch panics; later fetches serve `body`.
#[derive(Debug)]
pub struct PanicsFirst {
    calls: AtomicUsize,
    body: Vec<u8>,
}

impl PanicsFirst {
    pub fn serving(entry: &ImageEntry) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            body: jpeg_bytes(entry),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for PanicsFirst {
    async fn fetch(&self, _url: &Url) -> Result<Vec<u8>, FetchError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("transport failed hard");
        }
        Ok(self.body.clone())
    }
}

pub fn resolve_all(key: &CacheKey) -> Option<Url> {
    Url::parse("https://img.test/")
        .ok()?
        .join(key.as_str())
        .ok()
}

pub fn settings_in(dir: &TempDir) -> CacheSettings {
    CacheSettings {
        cache_root: Some(dir.path().to_path_buf()),
        ..CacheSettings::default()
    }
}

pub fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("airimage_core=debug")
        .with_test_writer()
        .try_init();
}

pub fn cache_with(dir: &TempDir, transport: Arc<GatedTransport>) -> ImageCache {
    init_logs();
    ImageCache::builder(settings_in(dir))
        .resolver(resolve_all)
        .transport(transport)
        .build()
        .expect("build cache")
}

/// Completion sink: every callback invocation lands in the receiver.
pub fn collector() -> (
    impl FnOnce(Option<ImageEntry>) + Send + Clone + 'static,
    mpsc::UnboundedReceiver<Option<ImageEntry>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move |entry: Option<ImageEntry>| {
        let _ = tx.send(entry);
    };
    (callback, rx)
}

pub async fn next_result(
    rx: &mut mpsc::UnboundedReceiver<Option<ImageEntry>>,
) -> Option<ImageEntry> {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("completion was not delivered in time")
        .expect("completion channel closed")
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
