//! Template substitution and HTTP chunk framing.
//!
//! Templates are plain strings containing literal token markers
//! (`constants::TOKEN_*`) substituted at publish time. Per the resolved Open
//! Question in SPEC_FULL.md, substitution is a single non-overlapping pass
//! per token (`str::replace` never rescans its own output), applied in the
//! fixed order: id, event-id, channel, text.

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::TemplateConfig;
use crate::constants::{TOKEN_CHANNEL, TOKEN_EVENT_ID, TOKEN_ID, TOKEN_TEXT};

/// Wrap `body` as a single HTTP/1.1 chunked-transfer frame: hex length, CRLF,
/// body, CRLF.
pub fn chunk_wrap(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 16);
    buf.put_slice(format!("{:x}\r\n", body.len()).as_bytes());
    buf.put_slice(body);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// The terminating `0\r\n\r\n` chunk that ends an HTTP chunked response.
pub fn final_chunk() -> Bytes {
    Bytes::from_static(b"0\r\n\r\n")
}

fn substitute_tokens(template: &str, channel_id: &str, message_id: i64, event_id: &str, text: &str) -> String {
    template
        .replace(TOKEN_ID, &message_id.to_string())
        .replace(TOKEN_EVENT_ID, event_id)
        .replace(TOKEN_CHANNEL, channel_id)
        .replace(TOKEN_TEXT, text)
}

/// Render one SSE `data:` line per input line, rejoined with CRLF, for an
/// "eventsource"-flagged template. Each original line of the publisher's
/// payload becomes its own rendered and substituted line.
fn render_eventsource(
    template: &TemplateConfig,
    channel_id: &str,
    message_id: i64,
    event_id: &str,
    payload: &str,
) -> String {
    let lines: Vec<&str> = payload.split(['\r', '\n']).filter(|l| !l.is_empty()).collect();
    let lines = if lines.is_empty() { vec![""] } else { lines };
    lines
        .into_iter()
        .map(|line| substitute_tokens(&template.body, channel_id, message_id, event_id, line))
        .collect::<Vec<_>>()
        .join("\r\n")
}

/// Render every configured template for one message, producing one
/// pre-chunked byte string per template, in configured order.
pub fn render_all(
    templates: &[TemplateConfig],
    channel_id: &[u8],
    message_id: i64,
    event_id: Option<&str>,
    payload: &[u8],
) -> Vec<Bytes> {
    let channel_id = String::from_utf8_lossy(channel_id);
    let payload_str = String::from_utf8_lossy(payload);
    let event_id = event_id.unwrap_or("");

    templates
        .iter()
        .map(|tpl| {
            let rendered = if tpl.eventsource {
                let mut out = render_eventsource(tpl, &channel_id, message_id, event_id, &payload_str);
                out.push_str("\r\n\r\n");
                out
            } else {
                substitute_tokens(&tpl.body, &channel_id, message_id, event_id, &payload_str)
            };
            chunk_wrap(rendered.as_bytes())
        })
        .collect()
}

/// Pre-render the standalone SSE `id:` chunk for a message, if it carries an event id.
pub fn render_event_id_message(event_id: Option<&str>) -> Option<Bytes> {
    event_id.map(|id| chunk_wrap(format!("id:{id}\r\n").as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn templates() -> Vec<TemplateConfig> {
        vec![
            TemplateConfig::plain("chunked", TOKEN_TEXT),
            TemplateConfig::eventsource("sse", format!("data:{TOKEN_TEXT}")),
        ]
    }

    #[test]
    fn render_is_deterministic() {
        let tpls = templates();
        let a = render_all(&tpls, b"chan", 3, None, b"hello");
        let b = render_all(&tpls, b"chan", 3, None, b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn eventsource_splits_lines() {
        let tpls = templates();
        let rendered = render_all(&tpls, b"C", 1, Some("42"), b"line1\nline2");
        // formatted_messages[1] is the eventsource variant.
        let sse = &rendered[1];
        let text = String::from_utf8_lossy(sse);
        assert!(text.contains("data:line1"));
        assert!(text.contains("data:line2"));
    }

    #[test]
    fn plain_template_substitutes_all_tokens_once() {
        let tpls = vec![TemplateConfig::plain(
            "t",
            format!("{TOKEN_ID}:{TOKEN_EVENT_ID}:{TOKEN_CHANNEL}:{TOKEN_TEXT}"),
        )];
        let rendered = render_all(&tpls, b"chan-1", 7, Some("ev"), b"payload with ~id~ inside");
        let text = String::from_utf8_lossy(&rendered[0]);
        // The literal token inside the payload is not re-substituted because
        // substitution runs once against the template, not the payload.
        assert!(text.contains("7:ev:chan-1:payload with ~id~ inside"));
    }

    #[test]
    fn chunk_wrap_hex_length_matches_body() {
        let chunk = chunk_wrap(b"hello");
        assert_eq!(&chunk[..], b"5\r\nhello\r\n");
    }
}
