//! Centralized defaults, environment variable names, and wire constants.
//!
//! Grouped the way the teacher's `core/constants.rs` groups them: one block
//! per concern, loudest defaults first.

// =============================================================================
// Environment variables
// =============================================================================

pub const ENV_LOG: &str = "PUSHCAST_LOG";
pub const ENV_HOST: &str = "PUSHCAST_HOST";
pub const ENV_PORT: &str = "PUSHCAST_PORT";
pub const ENV_CONFIG: &str = "PUSHCAST_CONFIG";

pub const ENV_MAX_MESSAGES: &str = "PUSHCAST_MAX_MESSAGES";
pub const ENV_MESSAGE_TTL_SECS: &str = "PUSHCAST_MESSAGE_TTL_SECS";
pub const ENV_CLEANUP_TTL_SECS: &str = "PUSHCAST_CLEANUP_TTL_SECS";
pub const ENV_MEMORY_CLEANUP_INTERVAL_SECS: &str = "PUSHCAST_MEMORY_CLEANUP_INTERVAL_SECS";
pub const ENV_BUFFER_CLEANUP_INTERVAL_SECS: &str = "PUSHCAST_BUFFER_CLEANUP_INTERVAL_SECS";
pub const ENV_PING_INTERVAL_SECS: &str = "PUSHCAST_PING_INTERVAL_SECS";
pub const ENV_DISCONNECT_INTERVAL_SECS: &str = "PUSHCAST_DISCONNECT_INTERVAL_SECS";

// =============================================================================
// Server defaults
// =============================================================================

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5488;

// =============================================================================
// Broker defaults
// =============================================================================

/// Unbounded by default (mirrors the original module's `push_stream_store_messages off`).
pub const DEFAULT_MAX_MESSAGES: Option<u32> = None;
/// 0 = messages never expire on their own (still subject to `max_messages`).
pub const DEFAULT_MESSAGE_TTL_SECS: u64 = 0;
/// How long a deleted/empty channel or a trashed message stays reachable
/// before the reclaimer frees it. Must exceed the longest critical section
/// any worker can hold against an entity discovered before the mark step.
pub const DEFAULT_CLEANUP_TTL_SECS: u64 = 2;
pub const DEFAULT_MEMORY_CLEANUP_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_BUFFER_CLEANUP_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_DISCONNECT_INTERVAL_SECS: u64 = 0;

pub const DEFAULT_CHANNEL_DELETED_MESSAGE: &str = "channel deleted";
pub const DEFAULT_PING_MESSAGE: &str = "";

// =============================================================================
// Message id sentinels
// =============================================================================

/// Reserved id for the synthetic ping message (never stored in a retained queue).
pub const PING_MESSAGE_ID: i64 = -1;
/// Reserved id for the synthetic "channel deleted" notification.
pub const CHANNEL_DELETED_MESSAGE_ID: i64 = -2;
/// First id assigned to a real published message.
pub const FIRST_MESSAGE_ID: i64 = 1;

// =============================================================================
// Template tokens (literal substrings substituted at publish time)
// =============================================================================

pub const TOKEN_ID: &str = "~id~";
pub const TOKEN_EVENT_ID: &str = "~event-id~";
pub const TOKEN_CHANNEL: &str = "~channel~";
pub const TOKEN_TEXT: &str = "~text~";
