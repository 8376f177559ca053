//! Channels, worker-subscriber buckets, and subscriber records.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::message::Message;
use super::slab::Slab;
use super::WorkerSlot;

/// Event handed to a subscriber's task when it has a new message (or the
/// channel-deleted notice) to write out. The subscriber task owns the actual
/// HTTP response and never touches the arena mutex.
#[derive(Clone)]
pub enum FanoutEvent {
    Message(Arc<Message>),
    ChannelDeleted(Arc<Message>),
}

/// One subscriber's presence on one channel, inside one worker's bucket.
pub struct SubscriberRecord {
    pub tx: mpsc::UnboundedSender<FanoutEvent>,
    /// Last message id this subscriber has been sent, for long-poll replay
    /// decisions. Streaming subscribers just get every fan-out.
    pub last_seen: i64,
}

/// Per-channel, per-worker bucket: exists iff this worker currently holds at
/// least one subscriber for the channel (spec.md §3).
pub struct Bucket {
    pub slot: WorkerSlot,
    pub records: Slab<SubscriberRecord>,
}

impl Bucket {
    fn new(slot: WorkerSlot) -> Self {
        Self {
            slot,
            records: Slab::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub struct Channel {
    pub id: Vec<u8>,
    pub key: u32,
    pub broadcast: bool,
    pub message_queue: VecDeque<Arc<Message>>,
    pub next_message_id: i64,
    pub buckets: HashMap<WorkerSlot, Bucket>,
    pub deleted: bool,
    /// Set once the channel is moved to the trash tree; the reclaimer frees
    /// it once this elapses and it has no subscribers left.
    pub expires: Option<Instant>,
    pub channel_deleted_message: Option<Arc<Message>>,
    pub max_messages: Option<u32>,
    pub message_ttl: Option<std::time::Duration>,
}

impl Channel {
    pub fn new(id: Vec<u8>, key: u32, max_messages: Option<u32>, message_ttl: Option<std::time::Duration>) -> Self {
        Self {
            id,
            key,
            broadcast: false,
            message_queue: VecDeque::new(),
            next_message_id: crate::constants::FIRST_MESSAGE_ID,
            buckets: HashMap::new(),
            deleted: false,
            expires: None,
            channel_deleted_message: None,
            max_messages,
            message_ttl,
        }
    }

    pub fn stored_messages(&self) -> u32 {
        self.message_queue.len() as u32
    }

    pub fn subscribers(&self) -> u32 {
        self.buckets.values().map(|b| b.len() as u32).sum()
    }

    pub fn bucket_mut(&mut self, slot: WorkerSlot) -> &mut Bucket {
        self.buckets.entry(slot).or_insert_with(|| Bucket::new(slot))
    }

    pub fn is_reclaimable(&self) -> bool {
        self.stored_messages() == 0 && self.subscribers() == 0
    }
}
