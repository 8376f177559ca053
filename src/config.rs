//! Broker configuration.
//!
//! Loaded the way the teacher's `core/config.rs` loads `AppConfig`: hardcoded
//! defaults, overridable by a JSON config file, overridable again by
//! environment variables. The demo binary layers CLI flags on top of that
//! (see `bin/demo_server.rs`); the library itself only ever sees the final
//! `BrokerConfig` value.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::BrokerError;

/// One configured output template.
///
/// `eventsource` mirrors the original module's per-template `push_stream_...`
/// eventsource flag: when set, the publisher payload is first split at line
/// boundaries and each line becomes its own `data:` line (see
/// `template::TemplateEngine::render`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub name: String,
    pub body: String,
    #[serde(default)]
    pub eventsource: bool,
}

impl TemplateConfig {
    pub fn plain(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
            eventsource: false,
        }
    }

    pub fn eventsource(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
            eventsource: true,
        }
    }
}

/// Recognized broker configuration options (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Max retained messages per channel. `None` = unbounded.
    pub max_messages: Option<u32>,
    /// Message TTL. Zero means messages never expire on their own.
    pub message_ttl: Duration,
    /// Grace period a deleted/empty channel (or a trashed message) stays
    /// reachable before the reclaimer frees it.
    pub cleanup_ttl: Duration,
    /// How often the memory-cleanup timer fires. `None` disables it.
    pub memory_cleanup_interval: Option<Duration>,
    /// How often the buffer-cleanup timer fires. `None` disables it.
    pub buffer_cleanup_interval: Option<Duration>,
    /// How often a ping is sent to every connected subscriber. `None` disables pings.
    pub ping_interval: Option<Duration>,
    /// How long a long-poll subscriber may idle before being finalized with a 304.
    /// `None` disables the disconnect timer (streaming subscribers rely on
    /// client disconnect detection instead).
    pub disconnect_interval: Option<Duration>,
    /// Soft cap on the number of live channels, standing in for the fixed
    /// shared-memory arena size of the original design (see DESIGN.md).
    /// `None` = unbounded.
    pub max_channels: Option<u32>,
    /// Whether an unknown channel is created on subscribe, or subscribe
    /// returns not-found.
    pub create_channel_on_subscribe: bool,
    /// Output templates, in configured order. `formatted_messages` on every
    /// published message has exactly `templates.len()` entries, same order.
    pub templates: Vec<TemplateConfig>,
    /// Whether the SSE `id:`/`data:` framing is available at all.
    pub sse_enabled: bool,
    /// Message body sent to subscribers when their channel is administratively deleted.
    pub channel_deleted_message: String,
    /// Message body sent on each ping tick.
    pub ping_message: String,
    /// Written, as its own HTTP chunk, before anything else in a streaming
    /// response. Empty means no header is sent (spec.md §6).
    pub header_template: String,
    /// Written, as its own HTTP chunk, immediately before the terminating
    /// `0\r\n\r\n` of a streaming response. Empty means no footer is sent.
    pub footer_template: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            message_ttl: Duration::from_secs(DEFAULT_MESSAGE_TTL_SECS),
            cleanup_ttl: Duration::from_secs(DEFAULT_CLEANUP_TTL_SECS),
            memory_cleanup_interval: Some(Duration::from_secs(
                DEFAULT_MEMORY_CLEANUP_INTERVAL_SECS,
            )),
            buffer_cleanup_interval: Some(Duration::from_secs(
                DEFAULT_BUFFER_CLEANUP_INTERVAL_SECS,
            )),
            ping_interval: Some(Duration::from_secs(DEFAULT_PING_INTERVAL_SECS)),
            disconnect_interval: None,
            max_channels: None,
            create_channel_on_subscribe: true,
            templates: vec![
                TemplateConfig::plain("chunked", TOKEN_TEXT),
                TemplateConfig::eventsource("sse", format!("data:{TOKEN_TEXT}")),
            ],
            sse_enabled: true,
            channel_deleted_message: DEFAULT_CHANNEL_DELETED_MESSAGE.to_string(),
            ping_message: DEFAULT_PING_MESSAGE.to_string(),
            header_template: String::new(),
            footer_template: String::new(),
        }
    }
}

impl BrokerConfig {
    /// Load a config file (JSON) and overlay environment variables on top,
    /// matching the teacher's file-then-env precedence.
    pub fn load(path: Option<&Path>) -> Result<Self, BrokerError> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| BrokerError::Config(format!("reading {}: {e}", p.display())))?;
                serde_json::from_str(&raw)
                    .map_err(|e| BrokerError::Config(format!("parsing {}: {e}", p.display())))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u32(ENV_MAX_MESSAGES) {
            self.max_messages = Some(v);
        }
        if let Some(v) = env_u64(ENV_MESSAGE_TTL_SECS) {
            self.message_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_u64(ENV_CLEANUP_TTL_SECS) {
            self.cleanup_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_u64(ENV_MEMORY_CLEANUP_INTERVAL_SECS) {
            self.memory_cleanup_interval = non_zero_duration(v);
        }
        if let Some(v) = env_u64(ENV_BUFFER_CLEANUP_INTERVAL_SECS) {
            self.buffer_cleanup_interval = non_zero_duration(v);
        }
        if let Some(v) = env_u64(ENV_PING_INTERVAL_SECS) {
            self.ping_interval = non_zero_duration(v);
        }
        if let Some(v) = env_u64(ENV_DISCONNECT_INTERVAL_SECS) {
            self.disconnect_interval = non_zero_duration(v);
        }
    }
}

fn non_zero_duration(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_two_templates() {
        let config = BrokerConfig::default();
        assert_eq!(config.templates.len(), 2);
        assert!(config.templates[1].eventsource);
    }

    #[test]
    fn env_override_applies_on_top_of_default() {
        // SAFETY: tests run single-threaded within this process for env mutation safety.
        unsafe { std::env::set_var(ENV_MAX_MESSAGES, "7") };
        let config = BrokerConfig::load(None).unwrap();
        assert_eq!(config.max_messages, Some(7));
        unsafe { std::env::remove_var(ENV_MAX_MESSAGES) };
    }
}
