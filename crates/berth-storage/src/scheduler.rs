//! Background task scheduler for long-running maintenance work.
//!
//! Maintenance jobs (dedup index rebuild, today; anything repo- or
//! digest-granular, tomorrow) are handed over as a [`TaskGenerator`]: a
//! producer of small, independently retryable tasks rather than one giant
//! job. The worker drains one generator at a time, sleeping `rate_limit`
//! between tasks so foreground traffic keeps priority. Cancellation is
//! cooperative: the flag is polled between tasks and inside generators.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::error::Result;

/// Shared cancellation signal.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One unit of background work.
pub trait Task: Send {
    fn run(&mut self) -> Result<()>;

    /// Short human-readable label, for logs.
    fn name(&self) -> String;
}

/// Lazy producer of tasks. `next` is called repeatedly until it returns
/// `None`; generators are expected to poll `cancel` and cut the stream
/// short when it fires.
pub trait TaskGenerator: Send {
    fn next(&mut self, cancel: &CancelFlag) -> Option<Box<dyn Task>>;
}

/// Single-worker scheduler draining submitted generators in order.
pub struct Scheduler {
    sender: Option<Sender<Box<dyn TaskGenerator>>>,
    cancel: CancelFlag,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the worker thread. `rate_limit` is the pause inserted between
    /// consecutive tasks.
    pub fn new(rate_limit: Duration) -> Self {
        let (sender, receiver) = unbounded::<Box<dyn TaskGenerator>>();
        let cancel = CancelFlag::new();
        let worker_cancel = cancel.clone();

        let worker = std::thread::spawn(move || {
            while !worker_cancel.is_cancelled() {
                let mut generator = match receiver.recv_timeout(Duration::from_millis(50)) {
                    Ok(generator) => generator,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };

                while !worker_cancel.is_cancelled() {
                    let Some(mut task) = generator.next(&worker_cancel) else {
                        break;
                    };
                    let name = task.name();
                    match task.run() {
                        Ok(()) => debug!(task = %name, "task finished"),
                        // a failed task does not stop the generator; the
                        // submitter may retry by resubmitting
                        Err(err) => warn!(task = %name, error = %err, "task failed"),
                    }
                    if !rate_limit.is_zero() {
                        std::thread::sleep(rate_limit);
                    }
                }
            }
        });

        Self {
            sender: Some(sender),
            cancel,
            worker: Some(worker),
        }
    }

    /// Queue a generator behind any already-submitted work.
    pub fn submit(&self, generator: Box<dyn TaskGenerator>) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(generator);
        }
    }

    /// The scheduler's cancellation flag, for sharing with generators.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Stop accepting work, cancel the current generator and join the
    /// worker.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
