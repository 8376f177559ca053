//! Subscriber-side handle: owns the receiving end of a subscription and
//! unsubscribes on drop so a dropped HTTP response can never leak a
//! registry entry.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::trace;

use crate::arena::{FanoutEvent, Message, SubscriptionHandle};
use crate::broker::Broker;
use crate::constants::PING_MESSAGE_ID;

/// What a streaming subscriber's poll loop should do next.
pub enum StreamItem {
    /// Bytes to write to the response body.
    Data(Bytes),
    /// The channel was deleted; write this, then close the connection.
    ChannelDeleted(Bytes),
    /// Nothing arrived before the ping interval elapsed; write a ping frame.
    Ping,
    /// Nothing arrived before the disconnect interval elapsed; finalize with
    /// a 304/timeout response.
    Idle,
}

/// The host-runtime collaborator spec.md §6 calls out as out of scope: how
/// rendered bytes actually reach a connected client. The core only depends
/// on this trait boundary; the demo binary supplies the transport (a
/// chunked HTTP body, an SSE stream, ...).
pub trait ResponseSink: Send {
    type Error;

    fn write_chunk(&mut self, bytes: Bytes) -> impl Future<Output = Result<(), Self::Error>> + Send;
    fn finalize(&mut self) -> impl Future<Output = ()> + Send;
}

/// Writes one chunk, finalizing the sink first if the write fails — spec.md
/// §7's "peer write error on a subscriber: finalize that subscriber's
/// response" applies to every write in the loop, not just the last one.
async fn write_or_finalize<S: ResponseSink>(sink: &mut S, bytes: Bytes) -> Result<(), S::Error> {
    if let Err(err) = sink.write_chunk(bytes).await {
        sink.finalize().await;
        return Err(err);
    }
    Ok(())
}

/// Outcome of waiting out a long-poll subscription to completion.
pub enum LongPollOutcome {
    /// Rendered message bodies to return with a normal 200 response.
    Messages(Vec<Bytes>),
    /// The channel was deleted; body to return with a 200 before closing.
    ChannelDeleted(Bytes),
    /// No new message arrived before the disconnect interval elapsed:
    /// spec.md §6's "HTTP 304 with Last-Modified and Etag headers
    /// reflecting the last observed message time and id."
    TimedOut,
}

/// A live, streaming or long-poll subscription. Holds the receiving half of
/// the fan-out channel plus enough of `Broker` to clean itself up.
pub struct StreamHandle {
    broker: Arc<Broker>,
    handle: SubscriptionHandle,
    receiver: mpsc::UnboundedReceiver<FanoutEvent>,
    template_index: usize,
    eventsource: bool,
    ping_interval: Option<Duration>,
    disconnect_interval: Option<Duration>,
    ping_message: Bytes,
    header_template: Bytes,
    footer_template: Bytes,
}

impl StreamHandle {
    pub fn new(
        broker: Arc<Broker>,
        handle: SubscriptionHandle,
        receiver: mpsc::UnboundedReceiver<FanoutEvent>,
        template_index: usize,
    ) -> Self {
        let config = broker.config();
        let eventsource = config
            .templates
            .get(template_index)
            .is_some_and(|t| t.eventsource);
        let ping_interval = config.ping_interval;
        let disconnect_interval = config.disconnect_interval;
        let ping_message = Bytes::from(config.ping_message.clone().into_bytes());
        let header_template = Bytes::from(config.header_template.clone().into_bytes());
        let footer_template = Bytes::from(config.footer_template.clone().into_bytes());
        Self {
            broker,
            handle,
            receiver,
            template_index,
            eventsource,
            ping_interval,
            disconnect_interval,
            ping_message,
            header_template,
            footer_template,
        }
    }

    /// Wait for the next thing this subscriber should do: a message, a
    /// ping, a channel-deleted notice, or idle timeout. Drives its own
    /// ping/disconnect timers via `tokio::select!`, per spec.md §4.4.
    pub async fn next(&mut self) -> StreamItem {
        let ping_sleep = match self.ping_interval {
            Some(d) => Some(tokio::time::sleep(d)),
            None => None,
        };
        let disconnect_sleep = match self.disconnect_interval {
            Some(d) => Some(tokio::time::sleep(d)),
            None => None,
        };

        tokio::select! {
            biased;

            event = self.receiver.recv() => {
                match event {
                    Some(FanoutEvent::Message(msg)) => self.render_message(&msg),
                    Some(FanoutEvent::ChannelDeleted(msg)) => {
                        StreamItem::ChannelDeleted(self.render_body(&msg))
                    }
                    None => StreamItem::Idle,
                }
            }

            _ = maybe_sleep(ping_sleep) => StreamItem::Ping,

            _ = maybe_sleep(disconnect_sleep) => StreamItem::Idle,
        }
    }

    pub fn ping_message(&self) -> Bytes {
        self.ping_message.clone()
    }

    fn render_message(&self, msg: &Message) -> StreamItem {
        if msg.id == PING_MESSAGE_ID {
            return StreamItem::Ping;
        }
        StreamItem::Data(self.render_body(msg))
    }

    fn render_body(&self, msg: &Message) -> Bytes {
        render_body(msg, self.template_index, self.eventsource)
    }

    /// Drive this subscription to completion against a concrete
    /// `ResponseSink`: write the header template (if configured), replay
    /// `backlog`, then loop on `next()` until the channel is deleted or the
    /// subscriber goes idle, writing the footer template (if configured)
    /// and finalizing the sink either way — including when a write fails
    /// partway through.
    pub async fn drive<S: ResponseSink>(
        &mut self,
        backlog: Vec<Arc<Message>>,
        mut sink: S,
    ) -> Result<(), S::Error> {
        if !self.header_template.is_empty() {
            write_or_finalize(&mut sink, self.header_template.clone()).await?;
        }
        for msg in &backlog {
            write_or_finalize(&mut sink, self.render_body(msg)).await?;
        }
        loop {
            match self.next().await {
                StreamItem::Data(bytes) => write_or_finalize(&mut sink, bytes).await?,
                StreamItem::Ping => write_or_finalize(&mut sink, self.ping_message()).await?,
                StreamItem::ChannelDeleted(bytes) => {
                    write_or_finalize(&mut sink, bytes).await?;
                    break;
                }
                StreamItem::Idle => break,
            }
        }
        if !self.footer_template.is_empty() {
            // Best-effort: the connection may already be half-closed by the
            // time we get here, but we still must finalize either way.
            let _ = sink.write_chunk(self.footer_template.clone()).await;
        }
        sink.finalize().await;
        Ok(())
    }

    /// Wait out a long-poll subscription: if the backlog already has
    /// messages newer than the client's last-seen id, return them
    /// immediately; otherwise wait for the next message, channel deletion,
    /// or the disconnect timer (scenario 6: 304 timeout). Pings are
    /// swallowed — long-poll has no open connection to keep alive.
    pub async fn await_long_poll(&mut self, backlog: Vec<Arc<Message>>) -> LongPollOutcome {
        if !backlog.is_empty() {
            return LongPollOutcome::Messages(backlog.iter().map(|m| self.render_body(m)).collect());
        }
        loop {
            match self.next().await {
                StreamItem::Data(bytes) => return LongPollOutcome::Messages(vec![bytes]),
                StreamItem::ChannelDeleted(bytes) => return LongPollOutcome::ChannelDeleted(bytes),
                StreamItem::Ping => continue,
                StreamItem::Idle => return LongPollOutcome::TimedOut,
            }
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        trace!("subscriber stream dropped, unsubscribing");
        self.broker.unsubscribe(self.handle);
    }
}

async fn maybe_sleep(sleep: Option<tokio::time::Sleep>) {
    match sleep {
        Some(s) => s.await,
        None => std::future::pending().await,
    }
}

fn render_body(msg: &Message, template_index: usize, eventsource: bool) -> Bytes {
    let parts = msg.render_for(template_index, eventsource);
    if parts.len() == 1 {
        return parts.into_iter().next().unwrap();
    }
    let total: usize = parts.iter().map(|p| p.len()).sum();
    let mut out = bytes::BytesMut::with_capacity(total);
    for part in parts {
        out.extend_from_slice(&part);
    }
    out.freeze()
}

/// Compute replay state for a long-poll request carrying an `If-None-Match`
/// etag / `If-Modified-Since` header: the message id it last saw.
pub fn last_seen_from_etag(etag: Option<&str>) -> i64 {
    etag.and_then(|s| s.trim_matches('"').parse().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, TemplateConfig};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        chunks: Vec<Bytes>,
        finalized: bool,
    }

    impl ResponseSink for Arc<StdMutex<RecordingSink>> {
        type Error = ();

        async fn write_chunk(&mut self, bytes: Bytes) -> Result<(), ()> {
            self.lock().unwrap().chunks.push(bytes);
            Ok(())
        }

        async fn finalize(&mut self) {
            self.lock().unwrap().finalized = true;
        }
    }

    /// A sink whose Nth write (0-indexed) fails; every other write succeeds.
    struct FailingSink {
        inner: Arc<StdMutex<RecordingSink>>,
        fail_at: usize,
        writes: usize,
    }

    impl ResponseSink for FailingSink {
        type Error = ();

        async fn write_chunk(&mut self, bytes: Bytes) -> Result<(), ()> {
            let at = self.writes;
            self.writes += 1;
            if at == self.fail_at {
                return Err(());
            }
            self.inner.lock().unwrap().chunks.push(bytes);
            Ok(())
        }

        async fn finalize(&mut self) {
            self.inner.lock().unwrap().finalized = true;
        }
    }

    async fn broker_with(config: BrokerConfig) -> Arc<Broker> {
        Arc::new(Broker::new(config))
    }

    #[tokio::test(start_paused = true)]
    async fn drive_replays_backlog_then_live_publish_then_idle() {
        let broker = broker_with(BrokerConfig {
            disconnect_interval: Some(Duration::from_millis(10)),
            ping_interval: None,
            ..Default::default()
        })
        .await;
        broker.publish(b"chan", Bytes::from_static(b"backlog"), None).await.unwrap();
        let sub = broker.subscribe(b"chan", crate::WorkerSlot(0), 0).await.unwrap();
        let mut stream = StreamHandle::new(broker.clone(), sub.handle, sub.receiver, 0);

        let recording = Arc::new(StdMutex::new(RecordingSink::default()));
        let sink = recording.clone();
        stream.drive(sub.backlog, sink).await.unwrap();

        let recorded = recording.lock().unwrap();
        assert_eq!(recorded.chunks.len(), 1);
        assert!(recorded.finalized, "drive must finalize on idle timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn drive_finalizes_on_write_error_instead_of_silently_dropping() {
        let broker = broker_with(BrokerConfig {
            disconnect_interval: Some(Duration::from_millis(10)),
            ping_interval: None,
            ..Default::default()
        })
        .await;
        let sub = broker.subscribe(b"chan", crate::WorkerSlot(0), 0).await.unwrap();
        let mut stream = StreamHandle::new(broker.clone(), sub.handle, sub.receiver, 0);

        let recording = Arc::new(StdMutex::new(RecordingSink::default()));
        let sink = FailingSink {
            inner: recording.clone(),
            fail_at: 0,
            writes: 0,
        };

        tokio::spawn({
            let broker = broker.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                broker.publish(b"chan", Bytes::from_static(b"x"), None).await.unwrap();
            }
        });

        let result = stream.drive(vec![], sink).await;
        assert!(result.is_err(), "the first failing write must propagate its error");
        assert!(recording.lock().unwrap().finalized, "a write error must still finalize the sink");
    }

    #[tokio::test(start_paused = true)]
    async fn drive_writes_channel_deleted_notice_then_finalizes() {
        let broker = broker_with(BrokerConfig::default()).await;
        let sub = broker.subscribe(b"chan", crate::WorkerSlot(0), 0).await.unwrap();
        let mut stream = StreamHandle::new(broker.clone(), sub.handle, sub.receiver, 0);

        tokio::spawn({
            let broker = broker.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                broker.delete_channel(b"chan").await.unwrap();
            }
        });

        let recording = Arc::new(StdMutex::new(RecordingSink::default()));
        let sink = recording.clone();
        stream.drive(vec![], sink).await.unwrap();

        let recorded = recording.lock().unwrap();
        assert_eq!(recorded.chunks.len(), 1);
        assert!(recorded.finalized);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_tick_yields_ping_without_ending_the_loop() {
        let broker = broker_with(BrokerConfig {
            ping_interval: Some(Duration::from_millis(5)),
            disconnect_interval: Some(Duration::from_millis(12)),
            ..Default::default()
        })
        .await;
        let sub = broker.subscribe(b"chan", crate::WorkerSlot(0), 0).await.unwrap();
        let mut stream = StreamHandle::new(broker.clone(), sub.handle, sub.receiver, 0);

        assert!(matches!(stream.next().await, StreamItem::Ping));
    }

    #[tokio::test(start_paused = true)]
    async fn eventsource_template_includes_event_id_chunk_plain_does_not() {
        let broker = broker_with(BrokerConfig {
            templates: vec![
                TemplateConfig::plain("chunked", "~text~"),
                TemplateConfig::eventsource("sse", "data:~text~"),
            ],
            ..Default::default()
        })
        .await;
        broker
            .publish(b"chan", Bytes::from_static(b"hi"), Some("42".to_string()))
            .await
            .unwrap();

        let plain_sub = broker.subscribe(b"chan", crate::WorkerSlot(0), 0).await.unwrap();
        let plain_stream = StreamHandle::new(broker.clone(), plain_sub.handle, plain_sub.receiver, 0);
        let plain_body = plain_stream.render_body(&plain_sub.backlog[0]);
        assert!(!String::from_utf8_lossy(&plain_body).contains("id:42"));

        let sse_sub = broker.subscribe(b"chan", crate::WorkerSlot(1), 0).await.unwrap();
        let sse_stream = StreamHandle::new(broker.clone(), sse_sub.handle, sse_sub.receiver, 1);
        let sse_body = sse_stream.render_body(&sse_sub.backlog[0]);
        assert!(String::from_utf8_lossy(&sse_body).contains("id:42"));
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_with_empty_backlog_times_out_on_disconnect_interval() {
        let broker = broker_with(BrokerConfig {
            disconnect_interval: Some(Duration::from_millis(10)),
            ping_interval: None,
            ..Default::default()
        })
        .await;
        let sub = broker.subscribe(b"chan", crate::WorkerSlot(0), 0).await.unwrap();
        let mut stream = StreamHandle::new(broker.clone(), sub.handle, sub.receiver, 0);

        let outcome = stream.await_long_poll(sub.backlog).await;
        assert!(matches!(outcome, LongPollOutcome::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_with_backlog_returns_immediately() {
        let broker = broker_with(BrokerConfig::default()).await;
        broker.publish(b"chan", Bytes::from_static(b"hi"), None).await.unwrap();
        let sub = broker.subscribe(b"chan", crate::WorkerSlot(0), 0).await.unwrap();
        let mut stream = StreamHandle::new(broker.clone(), sub.handle, sub.receiver, 0);

        let outcome = stream.await_long_poll(sub.backlog).await;
        match outcome {
            LongPollOutcome::Messages(msgs) => assert_eq!(msgs.len(), 1),
            _ => panic!("expected immediate backlog replay"),
        }
    }
}
