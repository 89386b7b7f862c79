//! Memory-pressure notifications.
//!
//! The embedding application owns a [`MemoryPressureSignal`] and raises it
//! when the platform reports low memory. A cache subscribes when it is built
//! and holds a [`PressureSubscription`]; dropping the subscription (with the
//! cache) deregisters the handler.

use std::time::Duration;

use sysinfo::System;
use tokio::{
    runtime::Handle,
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, info};

const SIGNAL_CAPACITY: usize = 16;

/// Where a pressure notification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureSource {
    /// Raised by the embedding application (e.g. an OS low-memory callback).
    Application,
    /// Raised by [`SystemMemoryMonitor`].
    System,
}

impl PressureSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PressureSource::Application => "application memory warning",
            PressureSource::System => "system memory low",
        }
    }
}

/// Broadcast source of low-memory events. Clones share subscribers.
#[derive(Debug, Clone)]
pub struct MemoryPressureSignal {
    tx: broadcast::Sender<PressureSource>,
}

impl Default for MemoryPressureSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPressureSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self { tx }
    }

    /// Raises the signal; returns how many subscribers will see it.
    pub fn notify(&self, source: PressureSource) -> usize {
        self.tx.send(source).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PressureSource> {
        self.tx.subscribe()
    }
}

/// A registered pressure handler. Deregisters on drop.
#[derive(Debug)]
pub struct PressureSubscription {
    task: JoinHandle<()>,
}

impl PressureSubscription {
    pub fn spawn<F>(
        signal: &MemoryPressureSignal,
        runtime: &Handle,
        on_pressure: F,
    ) -> Self
    where
        F: Fn(PressureSource) + Send + 'static,
    {
        let mut rx = signal.subscribe();
        let task = runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(source) => on_pressure(source),
                    // The retained notifications still follow.
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(
                            skipped,
                            "memory pressure notifications coalesced"
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Self { task }
    }
}

impl Drop for PressureSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Polls system memory and raises the signal once each time available
/// memory drops below the threshold.
#[derive(Debug)]
pub struct SystemMemoryMonitor {
    task: JoinHandle<()>,
}

impl SystemMemoryMonitor {
    pub fn spawn(
        signal: MemoryPressureSignal,
        threshold_bytes: u64,
        interval: Duration,
        runtime: &Handle,
    ) -> Self {
        let task = runtime.spawn(async move {
            let mut system = System::new();
            let mut ticker = tokio::time::interval(interval);
            let mut was_low = false;

            loop {
                ticker.tick().await;
                system.refresh_memory();
                let available = system.available_memory();
                let is_low = available < threshold_bytes;

                if is_low && !was_low {
                    info!(
                        available,
                        threshold = threshold_bytes,
                        "available system memory below threshold"
                    );
                    signal.notify(PressureSource::System);
                }
                was_low = is_low;
            }
        });
        Self { task }
    }
}

impl Drop for SystemMemoryMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
