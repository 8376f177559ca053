//! The shared arena: channel registry, message store, and subscriber fabric,
//! all guarded by a single coarse mutex (spec.md §1, §5).

pub mod channel;
pub mod message;
pub mod registry;
pub mod slab;

pub use channel::FanoutEvent;
pub use message::Message;
pub use registry::{Arena, ChannelStats, DeleteOutcome, GlobalStats, PublishOutcome, SubscribeOutcome};
pub use slab::Index as ChannelId;

/// A logical worker: one OS process in the original design, one partition of
/// subscribers in this single-process rendition (see SPEC_FULL.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerSlot(pub u32);

/// One subscriber's membership in one channel: the edge the data model calls
/// a "subscription." Held by the subscriber (process-local); used to unlink
/// in O(1) from both the bucket and, implicitly, the channel.
#[derive(Clone, Copy)]
pub struct SubscriptionHandle {
    pub channel: ChannelId,
    pub slot: WorkerSlot,
    pub record: slab::Index,
}
