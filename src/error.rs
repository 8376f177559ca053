//! Typed errors for the broker core.
//!
//! One enum, one variant per §7 error kind of the design, following the
//! teacher's preference for `thiserror` enums in library code and `anyhow`
//! only at the process entry point.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The shared arena has no room left for a new channel, message, or
    /// subscriber record. No partial state is left behind.
    #[error("arena out of memory")]
    OutOfMemory,

    /// Operation targeted a channel that does not exist, or exists only in
    /// the trash/unrecoverable trees.
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    /// `subscribe()` targeted an unknown channel and channel creation on
    /// subscribe is disabled by configuration.
    #[error("channel does not exist and creation on subscribe is disabled: {0}")]
    ChannelCreationDisabled(String),

    /// A configured template referenced a token or produced invalid bytes.
    #[error("template render error: {0}")]
    Template(String),

    /// Writing to a specific subscriber failed; never propagated to other
    /// subscribers of the same channel.
    #[error("peer write error")]
    PeerWrite,

    /// The subscriber's connection is gone.
    #[error("subscriber disconnected")]
    Disconnected,

    /// Configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Config(String),
}
