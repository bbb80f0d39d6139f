//! Completion queue: ordered hand-off into the event loop

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use super::LoopMessage;

/// Producer side of the loop, owned by one stream or call.
///
/// While a queue is open the loop considers itself busy. Closing releases the
/// registration exactly once; tasks queued afterwards are dropped.
pub struct CompletionQueue {
    tx: mpsc::UnboundedSender<LoopMessage>,
    closed: AtomicBool,
}

impl CompletionQueue {
    pub(super) fn new(tx: mpsc::UnboundedSender<LoopMessage>) -> Self {
        Self {
            tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Schedule `task` on the loop thread
    pub fn queue<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // Send fails only once the loop is gone
        let _ = self.tx.send(LoopMessage::Run(Box::new(task)));
    }

    /// Release the registration. Later calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(LoopMessage::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        self.close();
    }
}
