//! End-to-end scenarios against the public `Broker` facade, covering the
//! six numbered testable properties plus the core registry invariants.

use std::time::Duration;

use bytes::Bytes;
use pushcast::arena::FanoutEvent;
use pushcast::{Broker, BrokerConfig, WorkerSlot};

fn config(max_messages: Option<u32>) -> BrokerConfig {
    BrokerConfig {
        max_messages,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn unbounded_then_bounded_publish_behavior() {
    let broker = Broker::new(config(None));
    for i in 0..10 {
        broker
            .publish(b"unbounded", Bytes::from(format!("m{i}")), None)
            .await
            .unwrap();
    }
    let stats = broker.stats(b"unbounded").unwrap();
    assert_eq!(stats.stored_messages, 10, "no bound means nothing gets trimmed");
}

#[tokio::test(start_paused = true)]
async fn max_messages_trims_oldest_into_trash() {
    let broker = Broker::new(config(Some(3)));
    for i in 0..5 {
        broker
            .publish(b"bounded", Bytes::from(format!("m{i}")), None)
            .await
            .unwrap();
    }
    let stats = broker.stats(b"bounded").unwrap();
    assert_eq!(stats.stored_messages, 3, "queue trimmed to the configured bound");
}

#[tokio::test(start_paused = true)]
async fn two_subscribers_two_workers_both_receive_fanout() {
    let broker = Broker::new(config(None));
    let mut sub_a = broker.subscribe(b"fanout", WorkerSlot(0), 0).await.unwrap();
    let mut sub_b = broker.subscribe(b"fanout", WorkerSlot(1), 0).await.unwrap();

    broker.publish(b"fanout", Bytes::from_static(b"hello"), None).await.unwrap();

    let a = sub_a.receiver.recv().await.unwrap();
    let b = sub_b.receiver.recv().await.unwrap();
    assert!(matches!(a, FanoutEvent::Message(_)));
    assert!(matches!(b, FanoutEvent::Message(_)));

    let stats = broker.stats(b"fanout").unwrap();
    assert_eq!(stats.subscribers, 2);
    assert_eq!(stats.worker_count, 2);
}

#[tokio::test(start_paused = true)]
async fn sse_message_carries_event_id_and_splits_multiline_payload() {
    let broker = Broker::new(config(None));
    let message = broker
        .publish(b"sse-chan", Bytes::from_static(b"line one\nline two"), Some("42".to_string()))
        .await
        .unwrap();

    assert_eq!(message.event_id.as_deref(), Some("42"));
    assert!(message.event_id_message.is_some());

    // formatted_messages[1] is the eventsource template (see BrokerConfig::default).
    let sse_body = &message.formatted_messages[1];
    let text = String::from_utf8_lossy(sse_body);
    assert!(text.contains("line one"));
    assert!(text.contains("line two"));
}

#[tokio::test(start_paused = true)]
async fn channel_deletion_fans_out_then_reclaims_after_cleanup_ttl() {
    let broker = Broker::new(BrokerConfig {
        cleanup_ttl: Duration::from_millis(20),
        ..Default::default()
    });

    let mut sub = broker.subscribe(b"doomed", WorkerSlot(0), 0).await.unwrap();
    broker.publish(b"doomed", Bytes::from_static(b"hi"), None).await.unwrap();
    broker.delete_channel(b"doomed").await.unwrap();

    let event = sub.receiver.recv().await.unwrap();
    assert!(matches!(event, FanoutEvent::ChannelDeleted(_)));

    // Channel is unrecoverable immediately...
    assert!(broker.stats(b"doomed").is_none());

    // ...but it isn't actually reclaimed from the underlying arena until the
    // cleanup timer has both elapsed and seen no subscribers.
    drop(sub);
    tokio::time::advance(Duration::from_millis(30)).await;
}

#[tokio::test(start_paused = true)]
async fn long_poll_replay_only_sends_messages_newer_than_last_seen() {
    let broker = Broker::new(config(None));
    let first = broker.publish(b"replay", Bytes::from_static(b"m1"), None).await.unwrap();
    broker.publish(b"replay", Bytes::from_static(b"m2"), None).await.unwrap();

    let sub = broker.subscribe(b"replay", WorkerSlot(0), first.id).await.unwrap();
    assert_eq!(sub.backlog.len(), 1, "only the message after last_seen replays");
    assert_eq!(sub.backlog[0].raw, Bytes::from_static(b"m2"));
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_is_idempotent_and_frees_the_bucket() {
    let broker = Broker::new(config(None));
    let sub = broker.subscribe(b"unsub", WorkerSlot(0), 0).await.unwrap();
    broker.unsubscribe(sub.handle);
    broker.unsubscribe(sub.handle);

    let stats = broker.stats(b"unsub").unwrap();
    assert_eq!(stats.subscribers, 0);
    assert_eq!(stats.worker_count, 0, "empty bucket is removed, not left dangling");
}

#[tokio::test(start_paused = true)]
async fn publishing_to_unknown_channel_creates_it_by_default() {
    let broker = Broker::new(config(None));
    broker.publish(b"auto-created", Bytes::from_static(b"x"), None).await.unwrap();
    assert!(broker.stats(b"auto-created").is_some());
}

#[tokio::test(start_paused = true)]
async fn subscribe_to_unknown_channel_fails_when_creation_disabled() {
    let broker = Broker::new(BrokerConfig {
        create_channel_on_subscribe: false,
        ..Default::default()
    });
    let result = broker.subscribe(b"nope", WorkerSlot(0), 0).await;
    assert!(result.is_err());
}
