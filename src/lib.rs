//! `pushcast`: the core of an HTTP publish/subscribe broker — channel
//! registry, bounded per-channel retained-message queues, multi-worker
//! fan-out over long-lived responses, and periodic two-phase reclamation.
//!
//! Modeled on the shared-memory design of an nginx push-stream style
//! module, rendered in safe Rust: the shared slab arena becomes a
//! generational `Slab<T>` behind one `parking_lot::Mutex`, and cross-worker
//! delivery becomes per-subscriber `tokio::sync::mpsc` channels plus a
//! lightweight `Wake` signal (see `worker`).

pub mod arena;
pub mod broker;
pub mod config;
pub mod constants;
pub mod error;
pub mod hash;
pub mod subscriber;
pub mod template;
pub mod timers;
pub mod worker;

pub use arena::{ChannelId, Message, SubscriptionHandle, WorkerSlot};
pub use broker::{Broker, Subscription};
pub use config::{BrokerConfig, TemplateConfig};
pub use error::BrokerError;
