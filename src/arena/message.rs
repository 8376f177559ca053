//! Retained messages.

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;

/// One published message.
///
/// `formatted_messages` and `event_id_message` are built once at publish
/// time (see `template::render_all`) and shared, via `Arc`, by every
/// subscriber that ends up receiving the message — matching spec.md §3's
/// "built once at publish time and shared by all subscribers."
#[derive(Debug)]
pub struct Message {
    pub raw: Bytes,
    pub id: i64,
    pub event_id: Option<String>,
    pub event_id_message: Option<Bytes>,
    pub formatted_messages: Vec<Bytes>,
    /// Absolute instant after which this message is garbage. `None` = never
    /// expires on its own (still subject to `max_messages`).
    pub expires: Option<Instant>,
    pub created_at: Instant,
}

impl Message {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|t| t <= now)
    }

    /// The pre-chunked byte string for a given template index, prefixed by
    /// the event-id chunk when present and the template at `template_index`
    /// is eventsource-flagged — plain chunked templates never see the SSE
    /// `id:` line (examples/original_source/src/ngx_http_push_stream_module_utils.c:368-369
    /// gates this per-connection on `pslcf->eventsource_support`, not globally).
    pub fn render_for(&self, template_index: usize, eventsource: bool) -> Vec<Bytes> {
        let mut out = Vec::with_capacity(2);
        if eventsource {
            if let Some(ref event_id_chunk) = self.event_id_message {
                out.push(event_id_chunk.clone());
            }
        }
        if let Some(body) = self.formatted_messages.get(template_index) {
            out.push(body.clone());
        }
        out
    }
}

/// A message (or channel-deleted notice) that has been unlinked from its
/// channel's retained list and is waiting out `cleanup_ttl` in the global
/// trash list before it becomes unreachable.
pub struct TrashedMessage {
    pub message: Arc<Message>,
    pub expires: Instant,
}
