//! Cancellation handle shared between a client connection, its queue entry,
//! and the upstream request driving it.
//!
//! A disconnect cancels the queued entry and aborts any in-flight upstream
//! stream; a stream that finished normally first is never reported as
//! cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
    completed: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the request as completed normally; subsequent `cancel` calls
    /// become no-ops.
    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        if !self.is_completed() {
            let _ = self.sender.send(true);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves when cancellation is signalled. For use in `select!`.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow() {
            if receiver.changed().await.is_err() {
                // Sender gone without a cancel; treat as never-cancelled.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
