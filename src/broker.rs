//! `Broker`: the public facade over the arena, wake signaling, and
//! background timers.
//!
//! Every method here follows the same shape as the teacher's service layer:
//! take the arena mutex just long enough to mutate state and read out what
//! needs to happen next, drop it, then do the actual I/O (channel sends,
//! wake notifications) with no lock held — spec.md §5's "never suspend
//! while holding the arena mutex."

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::arena::{Arena, ChannelStats, FanoutEvent, GlobalStats, Message, SubscribeOutcome};
use crate::arena::{SubscriptionHandle, WorkerSlot};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::timers;
use crate::worker::{LocalWake, Wake};

pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub receiver: mpsc::UnboundedReceiver<FanoutEvent>,
    pub backlog: Vec<Arc<Message>>,
}

pub struct Broker {
    arena: Arc<Arena>,
    wake: Arc<LocalWake>,
    config: Arc<BrokerConfig>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let config = Arc::new(config);
        Self {
            arena: Arc::new(Arena::new(config.clone())),
            wake: Arc::new(LocalWake::new()),
            config,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Publish `payload` to `channel`, returning the stored message.
    /// Fans out to every current subscriber and wakes their worker slots.
    pub async fn publish(
        &self,
        channel: &[u8],
        payload: Bytes,
        event_id: Option<String>,
    ) -> Result<Arc<Message>, BrokerError> {
        let outcome = self.arena.publish(channel, payload, event_id, Instant::now())?;
        self.fan_out(FanoutEvent::Message(outcome.message.clone()), outcome.targets);
        Ok(outcome.message)
    }

    /// Administratively delete a channel: notify every current subscriber,
    /// then mark it for reclamation.
    pub async fn delete_channel(&self, channel: &[u8]) -> Result<(), BrokerError> {
        let outcome = self.arena.delete(channel, Instant::now())?;
        self.fan_out(FanoutEvent::ChannelDeleted(outcome.message), outcome.targets);
        Ok(())
    }

    /// Subscribe `slot` to `channel`, replaying any retained messages newer
    /// than `last_seen`.
    pub async fn subscribe(
        &self,
        channel: &[u8],
        slot: WorkerSlot,
        last_seen: i64,
    ) -> Result<Subscription, BrokerError> {
        let SubscribeOutcome { handle, receiver, backlog } = self.arena.subscribe(channel, slot, last_seen)?;
        Ok(Subscription { handle, receiver, backlog })
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.arena.unsubscribe(handle, Instant::now());
    }

    pub fn mark_broadcast(&self, channel: &[u8], broadcast: bool) -> Result<(), BrokerError> {
        self.arena.mark_broadcast(channel, broadcast)
    }

    pub fn stats(&self, channel: &[u8]) -> Option<ChannelStats> {
        self.arena.stats(channel)
    }

    pub fn global_stats(&self) -> GlobalStats {
        self.arena.global_stats()
    }

    /// A handle to this worker slot's wake signal, for long-poll subscribers
    /// to wait on between mpsc polls.
    pub fn wake_handle(&self, slot: WorkerSlot) -> Arc<tokio::sync::Notify> {
        self.wake.handle_for(slot)
    }

    /// Spawn the memory-cleanup and buffer-cleanup background tasks,
    /// returning a guard that cancels both on drop.
    pub fn spawn_background_tasks(&self) -> timers::TimerGuard {
        timers::spawn(self.arena.clone(), self.config.clone())
    }

    fn fan_out(&self, event: FanoutEvent, targets: Vec<(WorkerSlot, mpsc::UnboundedSender<FanoutEvent>)>) {
        for (slot, tx) in targets {
            if tx.send(event.clone()).is_err() {
                debug!(?slot, "subscriber gone before fan-out send");
                continue;
            }
            self.wake.notify(slot);
        }
        if let FanoutEvent::ChannelDeleted(_) = event {
            warn!("channel deleted notice fanned out");
        }
    }
}
