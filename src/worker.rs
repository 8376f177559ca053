//! Inter-worker wake-up signaling.
//!
//! In the original design, publishing a message to a channel wakes every
//! worker process holding subscribers for it, via a shared-memory flag and a
//! signal. Here every worker is a `WorkerSlot` inside one process, and the
//! actual payload delivery already happens over the per-subscriber mpsc
//! channel from `arena::channel::FanoutEvent` — `Wake` stays a distinct,
//! smaller signal: "something changed for you," used by long-poll
//! subscribers that block on a `Notify` rather than holding a receiver open.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;

use crate::arena::WorkerSlot;

pub trait Wake: Send + Sync {
    fn notify(&self, slot: WorkerSlot);
}

/// One `Notify` per worker slot, created lazily on first use.
#[derive(Default)]
pub struct LocalWake {
    notifies: RwLock<FxHashMap<WorkerSlot, Arc<Notify>>>,
}

impl LocalWake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_for(&self, slot: WorkerSlot) -> Arc<Notify> {
        if let Some(n) = self.notifies.read().get(&slot) {
            return n.clone();
        }
        self.notifies
            .write()
            .entry(slot)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

impl Wake for LocalWake {
    fn notify(&self, slot: WorkerSlot) {
        if let Some(n) = self.notifies.read().get(&slot) {
            n.notify_waiters();
        }
    }
}
