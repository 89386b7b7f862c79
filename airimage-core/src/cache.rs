//! Tiered lookup: memory → disk → network, with in-flight fetch joining.

use std::{
    collections::HashMap,
    fmt,
    panic::{AssertUnwindSafe, Location},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    completion::{CallbackContext, CompletionPump, CompletionQueue},
    disk::DiskTier,
    entry::{ImageCodec, ImageEntry, JpegCodec},
    error::{CacheError, FetchError, Result, WriteError},
    handle::CancelHandle,
    key::CacheKey,
    memory::MemoryTier,
    pressure::{MemoryPressureSignal, PressureSubscription, SystemMemoryMonitor},
    resolver::UrlResolver,
    settings::CacheSettings,
    stats::CacheStats,
    transport::{HttpTransport, Transport},
};

/// Process-wide image cache. Cheap to clone; clones share all state.
///
/// Construct once with [`ImageCache::builder`] and hand clones to every call
/// site. Completions are always delivered on the cache's callback context,
/// never on the calling thread or a runtime worker.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<Inner>,
}

struct Inner {
    memory: Arc<MemoryTier>,
    disk: Arc<DiskTier>,
    codec: Arc<dyn ImageCodec>,
    resolver: Option<Arc<dyn UrlResolver>>,
    transport: Arc<dyn Transport>,
    completions: CompletionQueue,
    runtime: Handle,
    fetch_timeout: Option<Duration>,
    // One flight per key; see `subscribe`.
    in_flight: Mutex<HashMap<CacheKey, Arc<Flight>>>,
    // Parent of every flight token; replaced by `cancel_all`.
    generation: Mutex<CancellationToken>,
    fetches_dispatched: AtomicU64,
    fetches_joined: AtomicU64,
    _pressure: Option<PressureSubscription>,
    _monitor: Option<SystemMemoryMonitor>,
}

#[derive(Clone)]
enum FlightState {
    Pending,
    Settled(Option<ImageEntry>),
}

/// One network fetch shared by every lookup of the same key.
struct Flight {
    token: CancellationToken,
    // Only changed while holding the `in_flight` lock.
    subscribers: AtomicUsize,
    state: watch::Sender<FlightState>,
}

/// A lookup's interest in a flight. Dropping it (for instance when the
/// lookup is cancelled) leaves the flight; the last one out cancels it.
struct Subscriber {
    inner: Arc<Inner>,
    key: CacheKey,
    flight: Arc<Flight>,
    rx: watch::Receiver<FlightState>,
}

impl Subscriber {
    async fn wait(&mut self) -> Option<ImageEntry> {
        let state = self
            .rx
            .wait_for(|state| matches!(state, FlightState::Settled(_)))
            .await
            .ok()?;
        match &*state {
            FlightState::Settled(entry) => entry.clone(),
            FlightState::Pending => None,
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.inner.leave(&self.key, &self.flight);
    }
}

impl fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageCache")
            .field("memory", &self.inner.memory)
            .field("disk", &self.inner.disk)
            .field("codec", &self.inner.codec)
            .field("has_resolver", &self.inner.resolver.is_some())
            .field("transport", &self.inner.transport)
            .field("fetch_timeout", &self.inner.fetch_timeout)
            .field("in_flight", &self.inner.in_flight.lock().len())
            .field(
                "fetches_dispatched",
                &self.inner.fetches_dispatched.load(Ordering::Relaxed),
            )
            .field(
                "fetches_joined",
                &self.inner.fetches_joined.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl ImageCache {
    pub fn builder(settings: CacheSettings) -> ImageCacheBuilder {
        ImageCacheBuilder::new(settings)
    }

    /// Finds the image for `key`, trying memory, then disk, then the network.
    ///
    /// `on_complete` receives the image, or `None` when no tier has it. It is
    /// called exactly once unless the lookup is cancelled, and always on the
    /// callback context. Returns `None` when memory answered (nothing left
    /// to cancel), otherwise a handle for the pending work.
    #[track_caller]
    pub fn lookup<K, F>(&self, key: K, on_complete: F) -> Option<CancelHandle>
    where
        K: Into<CacheKey>,
        F: FnOnce(Option<ImageEntry>) + Send + 'static,
    {
        let key = key.into();
        let caller = Location::caller();

        if let Some(entry) = self.inner.memory.get(&key) {
            debug!(key = %key, %caller, "got image from memory");
            self.inner.completions.deliver(None, on_complete, Some(entry));
            return None;
        }

        let token = CancellationToken::new();
        let lookup_token = token.clone();
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let result = tokio::select! {
                biased;
                () = lookup_token.cancelled() => {
                    debug!(key = %key, %caller, "lookup cancelled");
                    return;
                }
                result = inner.load(&key, caller) => result,
            };
            inner
                .completions
                .deliver(Some(lookup_token), on_complete, result);
        });

        Some(CancelHandle::new(token))
    }

    /// Seeds the cache with an image the caller already has.
    ///
    /// Memory is written immediately. The disk write runs on the blocking
    /// pool; the returned task yields whether it landed, and can be ignored.
    #[track_caller]
    pub fn save<K>(
        &self,
        entry: impl Into<ImageEntry>,
        key: K,
    ) -> JoinHandle<bool>
    where
        K: Into<CacheKey>,
    {
        let key = key.into();
        let entry = entry.into();
        let caller = Location::caller();

        self.inner.memory.put(key.clone(), entry.clone());

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            inner.persist(&key, &entry, None, caller).await
        })
    }

    /// Cancels every in-flight fetch and resets the transport. Lookups
    /// waiting on those fetches complete with `None`.
    pub fn cancel_all(&self) {
        let previous = {
            let mut generation = self.inner.generation.lock();
            std::mem::replace(&mut *generation, CancellationToken::new())
        };
        previous.cancel();

        let cancelled = self.inner.in_flight.lock().len();
        self.inner.transport.reset();
        info!(cancelled, "cancelled all image downloads");
    }

    /// Drops every memory entry; disk is untouched.
    pub fn purge_memory(&self) -> usize {
        self.inner.memory.purge_all("explicit purge")
    }

    /// Deletes `key` from memory and disk.
    pub async fn remove<K>(
        &self,
        key: K,
    ) -> std::result::Result<bool, WriteError>
    where
        K: Into<CacheKey>,
    {
        let key = key.into();
        let in_memory = self.inner.memory.remove(&key).is_some();

        let disk = Arc::clone(&self.inner.disk);
        let on_disk = tokio::task::spawn_blocking(move || disk.remove(&key))
            .await
            .map_err(|err| WriteError::Io {
                path: Default::default(),
                source: std::io::Error::other(err),
            })??;

        Ok(in_memory || on_disk)
    }

    /// Deletes every cached file; returns how many were removed.
    pub async fn clear_disk(&self) -> std::result::Result<usize, WriteError> {
        let disk = Arc::clone(&self.inner.disk);
        let removed = tokio::task::spawn_blocking(move || disk.clear())
            .await
            .map_err(|err| WriteError::Io {
                path: Default::default(),
                source: std::io::Error::other(err),
            })??;
        info!(removed, "cleared disk tier");
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        CacheStats {
            memory_items: inner.memory.len(),
            memory_bytes: inner.memory.resident_bytes(),
            disk_reads: inner.disk.reads(),
            disk_hits: inner.disk.hits(),
            disk_writes: inner.disk.writes(),
            disk_write_failures: inner.disk.write_failures(),
            fetches_dispatched: inner
                .fetches_dispatched
                .load(Ordering::Relaxed),
            fetches_joined: inner.fetches_joined.load(Ordering::Relaxed),
            in_flight: inner.in_flight.lock().len(),
        }
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.inner.memory
    }

    pub fn disk(&self) -> &DiskTier {
        &self.inner.disk
    }
}

impl Inner {
    /// Disk → resolver → network. Runs on the runtime.
    async fn load(
        self: &Arc<Self>,
        key: &CacheKey,
        caller: &'static Location<'static>,
    ) -> Option<ImageEntry> {
        let disk = Arc::clone(&self.disk);
        let disk_key = key.clone();
        let from_disk =
            match tokio::task::spawn_blocking(move || disk.get(&disk_key))
                .await
            {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(key = %key, %err, %caller, "disk read task failed");
                    None
                }
            };

        if let Some(entry) = from_disk {
            // Promote so the next lookup is a memory hit.
            self.memory.put(key.clone(), entry.clone());
            debug!(key = %key, %caller, "got image from file system");
            return Some(entry);
        }

        let url = self.resolver.as_ref().and_then(|r| r.resolve(key));
        let Some(url) = url else {
            debug!(key = %key, %caller, "no image url; reporting miss");
            return None;
        };

        let mut subscriber = self.subscribe(key, url, caller);
        subscriber.wait().await
    }

    /// Joins the flight for `key`, starting one if none is live.
    fn subscribe(
        self: &Arc<Self>,
        key: &CacheKey,
        url: Url,
        caller: &'static Location<'static>,
    ) -> Subscriber {
        let mut in_flight = self.in_flight.lock();

        if let Some(flight) = in_flight.get(key)
            && !flight.token.is_cancelled()
        {
            let subscribers =
                flight.subscribers.fetch_add(1, Ordering::SeqCst) + 1;
            self.fetches_joined.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %key,
                %caller,
                subscribers,
                "joined in-flight download"
            );
            return Subscriber {
                inner: Arc::clone(self),
                key: key.clone(),
                flight: Arc::clone(flight),
                rx: flight.state.subscribe(),
            };
        }

        let token = self.generation.lock().child_token();
        let (state, rx) = watch::channel(FlightState::Pending);
        let flight = Arc::new(Flight {
            token,
            subscribers: AtomicUsize::new(1),
            state,
        });
        in_flight.insert(key.clone(), Arc::clone(&flight));
        drop(in_flight);

        self.fetches_dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, url = %url, %caller, "downloading image");
        self.runtime.spawn(Arc::clone(self).run_flight(
            key.clone(),
            url,
            Arc::clone(&flight),
            caller,
        ));

        Subscriber {
            inner: Arc::clone(self),
            key: key.clone(),
            flight,
            rx,
        }
    }

    fn leave(&self, key: &CacheKey, flight: &Arc<Flight>) {
        let mut in_flight = self.in_flight.lock();
        let remaining = flight.subscribers.fetch_sub(1, Ordering::SeqCst) - 1;
        let settled =
            matches!(*flight.state.borrow(), FlightState::Settled(_));
        if remaining > 0 || settled {
            return;
        }

        // Nobody is waiting: abandon the download before it writes anything.
        flight.token.cancel();
        self.forget(&mut in_flight, key, flight);
        debug!(key = %key, "abandoned download with no remaining lookups");
    }

    /// Drops the table entry for `key` if it still belongs to `flight`.
    fn forget(
        &self,
        in_flight: &mut HashMap<CacheKey, Arc<Flight>>,
        key: &CacheKey,
        flight: &Arc<Flight>,
    ) {
        if in_flight
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, flight))
        {
            in_flight.remove(key);
        }
    }

    async fn run_flight(
        self: Arc<Self>,
        key: CacheKey,
        url: Url,
        flight: Arc<Flight>,
        caller: &'static Location<'static>,
    ) {
        // Settles the flight even if this task unwinds or is dropped.
        let settle = Settle {
            inner: Arc::clone(&self),
            key: key.clone(),
            flight: Arc::clone(&flight),
            entry: None,
        };

        let fetched = tokio::select! {
            biased;
            () = flight.token.cancelled() => Err(FetchError::Cancelled),
            result = self.fetch(&url) => result,
        };
        let decoded = match fetched {
            Ok(bytes) => self.decode(bytes).await,
            Err(err) => Err(err),
        };

        let entry = match decoded {
            Ok(entry) if !flight.token.is_cancelled() => {
                self.store(&key, entry, &flight.token, caller).await
            }
            Ok(_) => {
                debug!(
                    key = %key,
                    url = %url,
                    "download cancelled after decode"
                );
                None
            }
            Err(err) if err.is_cancelled() => {
                debug!(key = %key, url = %url, "download cancelled");
                None
            }
            Err(err) => {
                warn!(
                    key = %key,
                    url = %url,
                    %err,
                    %caller,
                    "error downloading image"
                );
                None
            }
        };

        settle.finish(entry);
    }

    /// Writes a fetched image back to memory and disk, unless the flight is
    /// cancelled first. Returns the entry waiters should receive.
    async fn store(
        &self,
        key: &CacheKey,
        entry: ImageEntry,
        token: &CancellationToken,
        caller: &'static Location<'static>,
    ) -> Option<ImageEntry> {
        self.memory.put(key.clone(), entry.clone());
        if token.is_cancelled() {
            self.memory.remove_if_same(key, &entry);
            debug!(key = %key, "download cancelled before write-back");
            return None;
        }

        if !self.persist(key, &entry, Some(token), caller).await
            && token.is_cancelled()
        {
            self.memory.remove_if_same(key, &entry);
            return None;
        }
        Some(entry)
    }

    /// Runs the transport with panics contained: a panicking transport is a
    /// failed fetch, not a stuck flight.
    async fn fetch(
        &self,
        url: &Url,
    ) -> std::result::Result<Vec<u8>, FetchError> {
        let guarded = AssertUnwindSafe(self.transport.fetch(url))
            .catch_unwind()
            .map(|outcome| {
                outcome.unwrap_or_else(|_| {
                    Err(FetchError::Network("transport panicked".to_string()))
                })
            });

        match self.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .unwrap_or(Err(FetchError::Timeout)),
            None => guarded.await,
        }
    }

    async fn decode(
        &self,
        bytes: Vec<u8>,
    ) -> std::result::Result<ImageEntry, FetchError> {
        let codec = Arc::clone(&self.codec);
        tokio::task::spawn_blocking(move || codec.decode(&bytes))
            .await
            .map_err(|err| FetchError::Decode(err.to_string()))?
            .map_err(|err| FetchError::Decode(err.to_string()))
    }

    /// Best-effort disk write; failures are logged, never surfaced.
    ///
    /// With a `token`, the write is skipped if it is cancelled by the time
    /// the blocking pool picks the job up.
    async fn persist(
        &self,
        key: &CacheKey,
        entry: &ImageEntry,
        token: Option<&CancellationToken>,
        caller: &'static Location<'static>,
    ) -> bool {
        let disk = Arc::clone(&self.disk);
        let disk_key = key.clone();
        let disk_entry = entry.clone();
        let token = token.cloned();

        let written = tokio::task::spawn_blocking(move || {
            if token.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return None;
            }
            Some(disk.put(&disk_key, &disk_entry))
        })
        .await;

        match written {
            Ok(Some(Ok(()))) => true,
            Ok(None) => {
                debug!(key = %key, "disk write skipped; download cancelled");
                false
            }
            Ok(Some(Err(err))) => {
                warn!(
                    key = %key,
                    %err,
                    %caller,
                    "error saving image to file system"
                );
                false
            }
            Err(err) => {
                warn!(key = %key, %err, %caller, "disk write task failed");
                false
            }
        }
    }
}

/// Removes a flight from the table and publishes its result on drop.
struct Settle {
    inner: Arc<Inner>,
    key: CacheKey,
    flight: Arc<Flight>,
    entry: Option<ImageEntry>,
}

impl Settle {
    fn finish(mut self, entry: Option<ImageEntry>) {
        self.entry = entry;
    }
}

impl Drop for Settle {
    fn drop(&mut self) {
        {
            let mut in_flight = self.inner.in_flight.lock();
            self.inner.forget(&mut in_flight, &self.key, &self.flight);
        }
        self.flight
            .state
            .send_replace(FlightState::Settled(self.entry.take()));
    }
}

/// Assembles an [`ImageCache`]. Anything not supplied gets a default: JPEG
/// codec, `reqwest` transport, no resolver (network tier disabled).
pub struct ImageCacheBuilder {
    settings: CacheSettings,
    codec: Option<Arc<dyn ImageCodec>>,
    resolver: Option<Arc<dyn UrlResolver>>,
    transport: Option<Arc<dyn Transport>>,
    pressure: Option<MemoryPressureSignal>,
    runtime: Option<Handle>,
}

impl fmt::Debug for ImageCacheBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageCacheBuilder")
            .field("settings", &self.settings)
            .field("codec", &self.codec)
            .field("has_resolver", &self.resolver.is_some())
            .field("transport", &self.transport)
            .field("pressure", &self.pressure)
            .field("runtime", &self.runtime.is_some())
            .finish()
    }
}

impl ImageCacheBuilder {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            codec: None,
            resolver: None,
            transport: None,
            pressure: None,
            runtime: None,
        }
    }

    pub fn resolver(mut self, resolver: impl UrlResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn ImageCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Purge the memory tier whenever `signal` is raised.
    pub fn pressure_signal(mut self, signal: MemoryPressureSignal) -> Self {
        self.pressure = Some(signal);
        self
    }

    /// Runtime for background work. Defaults to the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Builds with a dedicated callback thread.
    pub fn build(self) -> Result<ImageCache> {
        let (cache, _) = self.build_in(CallbackContext::Dedicated)?;
        Ok(cache)
    }

    /// Builds with a manual callback context: the caller drains the
    /// returned pump on the thread that should run completions.
    pub fn build_with_pump(self) -> Result<(ImageCache, CompletionPump)> {
        let (completions, pump) = CompletionQueue::manual();
        Ok((self.assemble(completions)?, pump))
    }

    /// Builds for `context`. The pump is `Some` only for
    /// [`CallbackContext::Manual`].
    pub fn build_in(
        self,
        context: CallbackContext,
    ) -> Result<(ImageCache, Option<CompletionPump>)> {
        match context {
            CallbackContext::Dedicated => {
                let completions = CompletionQueue::dedicated()?;
                Ok((self.assemble(completions)?, None))
            }
            CallbackContext::Manual => {
                let (cache, pump) = self.build_with_pump()?;
                Ok((cache, Some(pump)))
            }
        }
    }

    fn assemble(self, completions: CompletionQueue) -> Result<ImageCache> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|err| CacheError::NoRuntime(err.to_string()))?,
        };
        let settings = self.settings;

        let codec = match self.codec {
            Some(codec) => codec,
            None => Arc::new(JpegCodec::new(settings.jpeg_quality)),
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(settings.fetch_timeout())?),
        };

        let root = settings.resolved_cache_root();
        if root.is_none() {
            warn!("no cache directory available; disk tier disabled");
        }
        let disk = Arc::new(DiskTier::new(root, Arc::clone(&codec)));
        let memory = Arc::new(MemoryTier::new(settings.memory_budget_bytes));

        let signal = self.pressure.or_else(|| {
            settings
                .low_memory_threshold_bytes
                .map(|_| MemoryPressureSignal::new())
        });
        let pressure = signal.as_ref().map(|signal| {
            let memory = Arc::clone(&memory);
            PressureSubscription::spawn(signal, &runtime, move |source| {
                memory.purge_all(source.as_str());
            })
        });
        let monitor = match (&signal, settings.low_memory_threshold_bytes) {
            (Some(signal), Some(threshold)) => Some(SystemMemoryMonitor::spawn(
                signal.clone(),
                threshold,
                settings.pressure_poll_interval(),
                &runtime,
            )),
            _ => None,
        };

        Ok(ImageCache {
            inner: Arc::new(Inner {
                memory,
                disk,
                codec,
                resolver: self.resolver,
                transport,
                completions,
                runtime,
                fetch_timeout: settings.fetch_timeout(),
                in_flight: Mutex::new(HashMap::new()),
                generation: Mutex::new(CancellationToken::new()),
                fetches_dispatched: AtomicU64::new(0),
                fetches_joined: AtomicU64::new(0),
                _pressure: pressure,
                _monitor: monitor,
            }),
        })
    }
}
