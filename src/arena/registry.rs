//! The channel registry and message store: `Arena`, the single
//! `parking_lot::Mutex`-guarded structure every worker touches.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::channel::{Channel, FanoutEvent, SubscriberRecord};
use super::message::{Message, TrashedMessage};
use super::slab::{Index, Slab};
use super::{SubscriptionHandle, WorkerSlot};
use crate::config::BrokerConfig;
use crate::constants::CHANNEL_DELETED_MESSAGE_ID;
use crate::error::BrokerError;
use crate::hash::hash_channel_id;
use crate::template;

type FanoutTarget = (WorkerSlot, mpsc::UnboundedSender<FanoutEvent>);

struct ArenaInner {
    channels: Slab<Channel>,
    live: BTreeMap<u32, Vec<Index>>,
    trash: BTreeMap<u32, Vec<Index>>,
    unrecoverable: BTreeMap<u32, Vec<Index>>,
    message_trash: VecDeque<TrashedMessage>,
}

impl ArenaInner {
    fn find_in(tree: &BTreeMap<u32, Vec<Index>>, channels: &Slab<Channel>, key: u32, id: &[u8]) -> Option<Index> {
        tree.get(&key)?
            .iter()
            .copied()
            .find(|&idx| channels.get(idx).is_some_and(|c| c.id == id))
    }

    fn find_live(&self, id: &[u8]) -> Option<Index> {
        Self::find_in(&self.live, &self.channels, hash_channel_id(id), id)
    }

    fn remove_from_tree(tree: &mut BTreeMap<u32, Vec<Index>>, key: u32, index: Index) {
        if let Some(bucket) = tree.get_mut(&key) {
            bucket.retain(|&i| i != index);
            if bucket.is_empty() {
                tree.remove(&key);
            }
        }
    }
}

/// Snapshot returned by `query(channel)`.
#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub stored_messages: u32,
    pub subscribers: u32,
    pub worker_count: u32,
    pub broadcast: bool,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GlobalStats {
    pub live_channels: u32,
    pub trash_channels: u32,
    pub unrecoverable_channels: u32,
    pub total_subscribers: u32,
    pub total_stored_messages: u32,
}

pub struct PublishOutcome {
    pub message: Arc<Message>,
    pub targets: Vec<FanoutTarget>,
}

pub struct DeleteOutcome {
    pub message: Arc<Message>,
    pub targets: Vec<FanoutTarget>,
}

pub struct SubscribeOutcome {
    pub handle: SubscriptionHandle,
    pub receiver: mpsc::UnboundedReceiver<FanoutEvent>,
    pub backlog: Vec<Arc<Message>>,
}

pub struct Arena {
    inner: Mutex<ArenaInner>,
    config: Arc<BrokerConfig>,
}

impl Arena {
    pub fn new(config: Arc<BrokerConfig>) -> Self {
        Self {
            inner: Mutex::new(ArenaInner {
                channels: Slab::new(),
                live: BTreeMap::new(),
                trash: BTreeMap::new(),
                unrecoverable: BTreeMap::new(),
                message_trash: VecDeque::new(),
            }),
            config,
        }
    }

    /// Read-only lookup; `None` if absent, deleted, or never created.
    pub fn stats(&self, id: &[u8]) -> Option<ChannelStats> {
        let inner = self.inner.lock();
        let idx = inner.find_live(id)?;
        let channel = inner.channels.get(idx)?;
        Some(ChannelStats {
            stored_messages: channel.stored_messages(),
            subscribers: channel.subscribers(),
            worker_count: channel.buckets.len() as u32,
            broadcast: channel.broadcast,
            deleted: channel.deleted,
        })
    }

    pub fn global_stats(&self) -> GlobalStats {
        let inner = self.inner.lock();
        let mut stats = GlobalStats {
            live_channels: inner.live.values().map(|v| v.len() as u32).sum(),
            trash_channels: inner.trash.values().map(|v| v.len() as u32).sum(),
            unrecoverable_channels: inner.unrecoverable.values().map(|v| v.len() as u32).sum(),
            ..Default::default()
        };
        for (_, channel) in inner.channels.iter() {
            stats.total_subscribers += channel.subscribers();
            stats.total_stored_messages += channel.stored_messages();
        }
        stats
    }

    /// Mark a channel as broadcast-only (no retained history). See
    /// DESIGN.md for why this is a separate call rather than a publish-time
    /// flag: spec.md's admin surface never names an operation that sets it.
    pub fn mark_broadcast(&self, id: &[u8], broadcast: bool) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        let idx = self.find_or_create_locked(&mut inner, id)?;
        inner.channels.get_mut(idx).unwrap().broadcast = broadcast;
        Ok(())
    }

    fn find_or_create_locked(&self, inner: &mut ArenaInner, id: &[u8]) -> Result<Index, BrokerError> {
        let key = hash_channel_id(id);
        if let Some(idx) = ArenaInner::find_in(&inner.live, &inner.channels, key, id) {
            return Ok(idx);
        }
        if let Some(max) = self.config.max_channels {
            let live_count: usize = inner.live.values().map(|v| v.len()).sum();
            if live_count as u32 >= max {
                return Err(BrokerError::OutOfMemory);
            }
        }
        let channel = Channel::new(
            id.to_vec(),
            key,
            self.config.max_messages,
            non_zero(self.config.message_ttl),
        );
        let idx = inner.channels.insert(channel);
        inner.live.entry(key).or_default().push(idx);
        Ok(idx)
    }

    /// publish(channel, payload, event_id): append to the retained queue,
    /// enforce the bound, and collect fan-out targets. Returns
    /// `ChannelNotFound` only if the id resolves to a deleted channel that
    /// has not yet been swept.
    pub fn publish(
        &self,
        id: &[u8],
        payload: Bytes,
        event_id: Option<String>,
        now: Instant,
    ) -> Result<PublishOutcome, BrokerError> {
        let mut inner = self.inner.lock();
        let idx = self.find_or_create_locked(&mut inner, id)?;

        let message_id = {
            let channel = inner.channels.get_mut(idx).unwrap();
            let id = channel.next_message_id;
            channel.next_message_id += 1;
            id
        };

        let formatted = template::render_all(&self.config.templates, id, message_id, event_id.as_deref(), &payload);
        let event_id_message = if self.config.sse_enabled {
            template::render_event_id_message(event_id.as_deref())
        } else {
            None
        };

        let channel = inner.channels.get_mut(idx).unwrap();
        let message = Arc::new(Message {
            raw: payload,
            id: message_id,
            event_id,
            event_id_message,
            formatted_messages: formatted,
            expires: channel.message_ttl.map(|ttl| now + ttl),
            created_at: now,
        });

        if !channel.broadcast {
            channel.message_queue.push_back(message.clone());
        }

        enforce_bound(channel, &mut inner.message_trash, now, self.config.cleanup_ttl);

        if channel.broadcast {
            // Broadcast-only channels never retain history: trash immediately.
            inner.message_trash.push_back(TrashedMessage {
                message: message.clone(),
                expires: now + self.config.cleanup_ttl,
            });
        }

        let targets = collect_targets(inner.channels.get(idx).unwrap());

        Ok(PublishOutcome { message, targets })
    }

    pub fn delete(&self, id: &[u8], now: Instant) -> Result<DeleteOutcome, BrokerError> {
        let mut inner = self.inner.lock();
        let idx = inner
            .find_live(id)
            .ok_or_else(|| BrokerError::ChannelNotFound(String::from_utf8_lossy(id).into_owned()))?;

        let key = inner.channels.get(idx).unwrap().key;
        ArenaInner::remove_from_tree(&mut inner.live, key, idx);
        inner.unrecoverable.entry(key).or_default().push(idx);

        let rendered = template::render_all(
            &self.config.templates,
            id,
            CHANNEL_DELETED_MESSAGE_ID,
            None,
            self.config.channel_deleted_message.as_bytes(),
        );
        let notice = Arc::new(Message {
            raw: Bytes::copy_from_slice(self.config.channel_deleted_message.as_bytes()),
            id: CHANNEL_DELETED_MESSAGE_ID,
            event_id: None,
            event_id_message: None,
            formatted_messages: rendered,
            expires: Some(now + self.config.cleanup_ttl),
            created_at: now,
        });

        let channel = inner.channels.get_mut(idx).unwrap();
        channel.deleted = true;
        channel.expires = Some(now + self.config.cleanup_ttl);
        channel.channel_deleted_message = Some(notice.clone());

        while let Some(msg) = channel.message_queue.pop_front() {
            inner.message_trash.push_back(TrashedMessage {
                message: msg,
                expires: now + self.config.cleanup_ttl,
            });
        }

        let targets = collect_targets(channel);

        Ok(DeleteOutcome { message: notice, targets })
    }

    pub fn subscribe(
        &self,
        id: &[u8],
        slot: WorkerSlot,
        last_seen: i64,
    ) -> Result<SubscribeOutcome, BrokerError> {
        let mut inner = self.inner.lock();

        let idx = if let Some(idx) = inner.find_live(id) {
            idx
        } else if self.config.create_channel_on_subscribe {
            self.find_or_create_locked(&mut inner, id)?
        } else {
            return Err(BrokerError::ChannelCreationDisabled(
                String::from_utf8_lossy(id).into_owned(),
            ));
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = inner.channels.get_mut(idx).unwrap();
        let record_idx = channel.bucket_mut(slot).records.insert(SubscriberRecord {
            tx,
            last_seen,
        });

        let backlog: Vec<Arc<Message>> = channel
            .message_queue
            .iter()
            .filter(|m| m.id > last_seen)
            .cloned()
            .collect();

        Ok(SubscribeOutcome {
            handle: SubscriptionHandle {
                channel: idx,
                slot,
                record: record_idx,
            },
            receiver: rx,
            backlog,
        })
    }

    /// Unlink a subscription from both the bucket and (implicitly) the
    /// channel. Idempotent: calling it twice with the same handle, or with a
    /// handle whose channel has already been reclaimed, is a harmless no-op
    /// (spec.md §5's underflow-guard requirement, satisfied here by the
    /// slab's own stale-index rejection rather than a manually decremented
    /// counter — see DESIGN.md).
    ///
    /// When this empties the last bucket of an already-deleted/reclaimable
    /// channel, bumps `expires` to `now + cleanup_ttl` so the channel is
    /// freed no earlier than a fresh `cleanup_ttl` after the last subscriber
    /// actually leaves, per spec.md §8 — not from whenever it was originally
    /// marked for reclaim.
    pub fn unsubscribe(&self, handle: SubscriptionHandle, now: Instant) {
        let mut inner = self.inner.lock();
        let Some(channel) = inner.channels.get_mut(handle.channel) else {
            return;
        };
        let Some(bucket) = channel.buckets.get_mut(&handle.slot) else {
            return;
        };
        bucket.records.remove(handle.record);
        if bucket.is_empty() {
            channel.buckets.remove(&handle.slot);
        }
        if channel.deleted && channel.subscribers() == 0 {
            channel.expires = Some(now + self.config.cleanup_ttl);
        }
    }

    /// Memory cleanup: drop expired messages, mark empty/expired channels
    /// for reclaim, then sweep everything past its TTL. Returns the number
    /// of channels freed.
    pub fn collect_empty_and_expired(&self, now: Instant, force: bool) -> usize {
        let mut inner = self.inner.lock();
        let cleanup_ttl = self.config.cleanup_ttl;

        let live_indices: Vec<Index> = inner.live.values().flatten().copied().collect();
        for idx in live_indices {
            drop_expired_from_channel(&mut inner, idx, now, cleanup_ttl);

            let reclaimable = inner
                .channels
                .get(idx)
                .is_some_and(|c| c.is_reclaimable());
            if reclaimable {
                let (key, subscribers) = {
                    let channel = inner.channels.get_mut(idx).unwrap();
                    channel.deleted = true;
                    channel.expires = Some(now + cleanup_ttl);
                    (channel.key, channel.subscribers())
                };
                ArenaInner::remove_from_tree(&mut inner.live, key, idx);
                if subscribers == 0 {
                    inner.trash.entry(key).or_default().push(idx);
                } else {
                    inner.unrecoverable.entry(key).or_default().push(idx);
                }
            }
        }

        let freed_trash = sweep_tree(&mut inner.trash, &mut inner.channels, now, force);
        let freed_unrecoverable = sweep_tree(&mut inner.unrecoverable, &mut inner.channels, now, force);

        inner
            .message_trash
            .retain(|entry| !(force || entry.expires <= now));

        freed_trash + freed_unrecoverable
    }

    /// Buffer cleanup: drop expired retained messages without touching
    /// channel existence.
    pub fn drop_expired_messages(&self, now: Instant) {
        let mut inner = self.inner.lock();
        let cleanup_ttl = self.config.cleanup_ttl;
        let live_indices: Vec<Index> = inner.live.values().flatten().copied().collect();
        for idx in live_indices {
            drop_expired_from_channel(&mut inner, idx, now, cleanup_ttl);
        }
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    if d.is_zero() { None } else { Some(d) }
}

fn collect_targets(channel: &Channel) -> Vec<FanoutTarget> {
    let mut targets = Vec::new();
    for bucket in channel.buckets.values() {
        for (_, record) in bucket.records.iter() {
            targets.push((bucket.slot, record.tx.clone()));
        }
    }
    targets
}

/// While the queue exceeds `max_messages`, or the head is expired, move the
/// head into the global trash list (spec.md §4.2).
fn enforce_bound(
    channel: &mut Channel,
    trash: &mut VecDeque<TrashedMessage>,
    now: Instant,
    cleanup_ttl: Duration,
) {
    loop {
        let over_bound = channel
            .max_messages
            .is_some_and(|max| channel.message_queue.len() as u32 > max);
        let head_expired = channel
            .message_queue
            .front()
            .is_some_and(|m| m.is_expired(now));
        if !(over_bound || head_expired) {
            break;
        }
        let Some(msg) = channel.message_queue.pop_front() else {
            break;
        };
        trash.push_back(TrashedMessage {
            message: msg,
            expires: now + cleanup_ttl,
        });
    }
}

fn drop_expired_from_channel(inner: &mut ArenaInner, idx: Index, now: Instant, cleanup_ttl: Duration) {
    let Some(channel) = inner.channels.get_mut(idx) else {
        return;
    };
    while channel
        .message_queue
        .front()
        .is_some_and(|m| m.is_expired(now))
    {
        if let Some(msg) = channel.message_queue.pop_front() {
            inner.message_trash.push_back(TrashedMessage {
                message: msg,
                expires: now + cleanup_ttl,
            });
        }
    }
}

/// Sweep a trash/unrecoverable tree: free any channel past its reclaim TTL
/// (or any channel, under `force`) that has no subscribers left.
fn sweep_tree(tree: &mut BTreeMap<u32, Vec<Index>>, channels: &mut Slab<Channel>, now: Instant, force: bool) -> usize {
    let mut freed = 0;
    let mut empty_keys = Vec::new();
    for (key, indices) in tree.iter_mut() {
        indices.retain(|&idx| {
            let Some(channel) = channels.get(idx) else {
                return false;
            };
            let past_ttl = channel.expires.is_some_and(|t| t <= now);
            let reclaim = (force || past_ttl) && channel.subscribers() == 0;
            if reclaim {
                channels.remove(idx);
                freed += 1;
                false
            } else {
                true
            }
        });
        if indices.is_empty() {
            empty_keys.push(*key);
        }
    }
    for key in empty_keys {
        tree.remove(&key);
    }
    freed
}
