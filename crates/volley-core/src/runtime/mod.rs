//! Cooperative event loop
//!
//! Background tasks never touch script state directly. They hand closures to a
//! [`CompletionQueue`] and the single thread that owns the [`EventLoop`] runs
//! them, one at a time, in the order they were queued.

mod task_queue;

pub use task_queue::CompletionQueue;

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;

/// Unit of work run on the loop thread
pub(crate) type Task = Box<dyn FnOnce() + Send>;

pub(crate) enum LoopMessage {
    Run(Task),
    /// A completion queue was closed
    Release,
}

#[derive(Debug, Default)]
pub(crate) struct LoopState {
    iteration: AtomicU64,
    open_queues: AtomicUsize,
}

/// Cloneable access to a loop from other tasks
#[derive(Clone)]
pub struct LoopHandle {
    state: Arc<LoopState>,
    context: CancellationToken,
    tx: mpsc::UnboundedSender<LoopMessage>,
}

impl LoopHandle {
    /// Current iteration number, starting at 0 before the first iteration
    pub fn iteration(&self) -> u64 {
        self.state.iteration.load(Ordering::Acquire)
    }

    /// Cancelled when the loop is dropped
    pub fn context(&self) -> &CancellationToken {
        &self.context
    }

    /// Register a new queue; the loop stays busy until it is closed
    pub fn completion_queue(&self) -> CompletionQueue {
        self.state.open_queues.fetch_add(1, Ordering::AcqRel);
        CompletionQueue::new(self.tx.clone())
    }

    /// Number of registered queues not yet released
    pub fn open_queues(&self) -> usize {
        self.state.open_queues.load(Ordering::Acquire)
    }
}

/// Drives completions on the thread that owns it
pub struct EventLoop {
    handle: LoopHandle,
    rx: mpsc::UnboundedReceiver<LoopMessage>,
}

impl EventLoop {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handle: LoopHandle {
                state: Arc::new(LoopState::default()),
                context: CancellationToken::new(),
                tx,
            },
            rx,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Run everything already queued without waiting. Returns the number of
    /// tasks run.
    pub fn tick(&mut self) -> usize {
        let mut ran = 0;
        loop {
            match self.rx.try_recv() {
                Ok(message) => {
                    if self.dispatch(message) {
                        ran += 1;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        ran
    }

    /// Wait for and run tasks until every completion queue is released
    pub async fn run_until_idle(&mut self) {
        while self.handle.open_queues() > 0 {
            match self.rx.recv().await {
                Some(message) => {
                    self.dispatch(message);
                }
                None => break,
            }
        }
        // Work queued alongside the last release
        self.tick();
    }

    /// One script iteration: bump the counter, run the script, drain
    pub async fn run_iteration<F, T>(&mut self, script: F) -> T
    where
        F: Future<Output = T>,
    {
        let iteration = self.handle.state.iteration.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(iteration, "Iteration started");
        let output = script.await;
        self.run_until_idle().await;
        tracing::debug!(iteration, "Iteration finished");
        output
    }

    /// Returns whether a task ran
    fn dispatch(&mut self, message: LoopMessage) -> bool {
        match message {
            LoopMessage::Run(task) => {
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    tracing::error!(panic = %panic_message(&panic), "Event loop task panicked");
                }
                true
            }
            LoopMessage::Release => {
                let _ = self.handle.state.open_queues.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |open| open.checked_sub(1),
                );
                false
            }
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.handle.context.cancel();
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
