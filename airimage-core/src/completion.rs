//! The single context lookup completions run on.

use std::{
    fmt, io,
    panic::{AssertUnwindSafe, catch_unwind},
    thread,
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CALLBACK_THREAD_NAME: &str = "airimage-callbacks";

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where completions are delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackContext {
    /// One named OS thread owned by the cache.
    #[default]
    Dedicated,
    /// The embedding application drains a [`CompletionPump`] on its own
    /// thread (typically its UI loop).
    Manual,
}

/// Sender half: serialises completions onto one context.
#[derive(Clone)]
pub struct CompletionQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl CompletionQueue {
    pub fn manual() -> (Self, CompletionPump) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, CompletionPump { rx })
    }

    /// Spawns the callback thread; it exits once every queue clone is gone.
    pub fn dedicated() -> io::Result<Self> {
        let (queue, pump) = Self::manual();
        thread::Builder::new()
            .name(CALLBACK_THREAD_NAME.to_string())
            .spawn(move || pump.run_until_closed())?;
        Ok(queue)
    }

    /// Queues `on_complete(value)`. It is skipped if `token` is cancelled by
    /// the time the context gets to it.
    pub fn deliver<T, F>(
        &self,
        token: Option<CancellationToken>,
        on_complete: F,
        value: T,
    ) where
        T: Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        let job: Job = Box::new(move || {
            if token.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return;
            }
            on_complete(value);
        });

        if self.tx.send(job).is_err() {
            debug!("callback context closed; completion dropped");
        }
    }
}

/// Receiver half for [`CallbackContext::Manual`].
pub struct CompletionPump {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl fmt::Debug for CompletionPump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionPump")
            .field("queued", &self.rx.len())
            .finish()
    }
}

impl CompletionPump {
    /// Runs everything queued right now without blocking.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            run_job(job);
            ran += 1;
        }
        ran
    }

    /// Waits for and runs the next completion; `false` once closed.
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(job) => {
                run_job(job);
                true
            }
            None => false,
        }
    }

    /// Blocks the current thread, running completions until every queue is
    /// dropped. Must not be called from inside an async runtime.
    pub fn run_until_closed(mut self) {
        while let Some(job) = self.rx.blocking_recv() {
            run_job(job);
        }
    }
}

fn run_job(job: Job) {
    // A panicking callback must not take the context down with it.
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        warn!("image cache completion callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn manual_pump_runs_in_order() {
        let (queue, mut pump) = CompletionQueue::manual();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let seen = Arc::clone(&seen);
            queue.deliver(None, move |v: i32| seen.lock().unwrap().push(v), i);
        }

        assert_eq!(pump.run_pending(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn cancelled_completions_are_skipped() {
        let (queue, mut pump) = CompletionQueue::manual();
        let token = CancellationToken::new();
        let called = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&called);

        queue.deliver(
            Some(token.clone()),
            move |()| *flag.lock().unwrap() = true,
            (),
        );
        token.cancel();
        pump.run_pending();

        assert!(!*called.lock().unwrap());
    }

    #[test]
    fn dedicated_thread_runs_on_one_named_thread() {
        let queue =
            CompletionQueue::dedicated().expect("spawn callback thread");
        let (tx, rx) = std::sync::mpsc::channel();

        for _ in 0..2 {
            let tx = tx.clone();
            queue.deliver(
                None,
                move |()| {
                    let name = thread::current().name().map(str::to_owned);
                    tx.send(name).unwrap();
                },
                (),
            );
        }

        let first = rx.recv().unwrap();
        let second = rx.recv().unwrap();
        assert_eq!(first.as_deref(), Some(CALLBACK_THREAD_NAME));
        assert_eq!(first, second);
    }

    #[test]
    fn panicking_callback_does_not_stop_the_pump() {
        let (queue, mut pump) = CompletionQueue::manual();
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);

        queue.deliver(None, |()| panic!("boom"), ());
        queue.deliver(None, move |()| *flag.lock().unwrap() = true, ());

        assert_eq!(pump.run_pending(), 2);
        assert!(*ran.lock().unwrap());
    }
}
