use std::time::Duration;

use super::{Connection, DeliveryMode};
use crate::test_support::{spawn_broker, wait_until};
use crate::utils::error::ClientError;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_open_unreachable_host_fails_with_connection_error() {
    // nothing listens on port 1
    let err = Connection::open_with("127.0.0.1:1", Duration::from_millis(500))
        .await
        .unwrap_err();

    match &err {
        ClientError::Connection { host, .. } => assert_eq!(host, "127.0.0.1:1"),
        other => panic!("expected a connection error, got {other:?}"),
    }
    assert!(
        err.to_string()
            .starts_with("connection to broker at 127.0.0.1:1 failed")
    );
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (addr, broker) = spawn_broker().await;
    let conn = Connection::open(&addr).await.unwrap();
    assert!(conn.is_open());

    conn.close().await;
    conn.close().await;
    assert!(!conn.is_open());

    assert!(wait_until(|| broker.lock().unwrap().peers.is_empty()).await);
    assert!(matches!(conn.channel().await, Err(ClientError::ConnectionClosed)));
}

#[tokio::test]
async fn test_declare_is_idempotent_and_conflict_closes_channel() {
    let (addr, _broker) = spawn_broker().await;
    let conn = Connection::open(&addr).await.unwrap();
    let ch = conn.channel().await.unwrap();

    let first = ch.declare_queue("task_queue_smoker", true).await.unwrap();
    let again = ch.declare_queue("task_queue_smoker", true).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(first.name, "task_queue_smoker");

    let err = ch.declare_queue("task_queue_smoker", false).await.unwrap_err();
    assert!(matches!(err, ClientError::QueueConflict { ref queue, .. } if queue == "task_queue_smoker"));
    assert!(!ch.is_open());
    assert!(matches!(
        ch.declare_queue("other", true).await,
        Err(ClientError::ChannelClosed { .. })
    ));

    // the connection and its other channels are unaffected
    let other = conn.channel().await.unwrap();
    other.declare_queue("task_queue_smoker", true).await.unwrap();
    conn.close().await;
}

#[tokio::test]
async fn test_publish_to_missing_queue_fails() {
    let (addr, _broker) = spawn_broker().await;
    let conn = Connection::open(&addr).await.unwrap();
    let ch = conn.channel().await.unwrap();

    let err = ch
        .publish("nowhere", b"Southeast", DeliveryMode::Persistent)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Publish { ref queue, .. } if queue == "nowhere"));
    assert!(ch.is_open());
    conn.close().await;
}

#[tokio::test]
async fn test_payload_bytes_arrive_unchanged() {
    let (addr, _broker) = spawn_broker().await;
    let conn = Connection::open(&addr).await.unwrap();
    let ch = conn.channel().await.unwrap();
    ch.declare_queue("bytes", true).await.unwrap();

    let payload: Vec<u8> = vec![0x00, 0xff, b'y', b'e', b's', 0xc3];
    ch.publish("bytes", &payload, DeliveryMode::Persistent).await.unwrap();

    let mut consumer = ch.consume("bytes", "").await.unwrap();
    assert!(consumer.tag().starts_with("ctag-"));
    let delivery = tokio::time::timeout(WAIT, consumer.next()).await.unwrap().unwrap();
    assert_eq!(delivery.payload, payload);
    assert_eq!(delivery.queue, "bytes");
    assert!(!delivery.redelivered);
    delivery.ack().await.unwrap();
    conn.close().await;
}

#[tokio::test]
async fn test_prefetch_one_holds_back_second_message() {
    let (addr, broker) = spawn_broker().await;
    let conn = Connection::open(&addr).await.unwrap();
    let ch = conn.channel().await.unwrap();
    ch.declare_queue("work", true).await.unwrap();
    ch.basic_qos(1).await.unwrap();

    ch.publish("work", b"yes", DeliveryMode::Persistent).await.unwrap();
    ch.publish("work", b"no", DeliveryMode::Persistent).await.unwrap();

    let mut consumer = ch.consume("work", "worker").await.unwrap();
    let first = tokio::time::timeout(WAIT, consumer.next()).await.unwrap().unwrap();
    assert_eq!(first.payload, b"yes");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(consumer.try_next().is_none());
    let stats = broker.lock().unwrap().queue_stats("work").unwrap();
    assert_eq!((stats.ready, stats.unacked), (1, 1));

    first.ack().await.unwrap();
    let second = tokio::time::timeout(WAIT, consumer.next()).await.unwrap().unwrap();
    assert_eq!(second.payload, b"no");
    second.ack().await.unwrap();
    conn.close().await;
}

#[tokio::test]
async fn test_reject_with_requeue_redelivers() {
    let (addr, _broker) = spawn_broker().await;
    let conn = Connection::open(&addr).await.unwrap();
    let ch = conn.channel().await.unwrap();
    ch.declare_queue("retry", false).await.unwrap();
    ch.publish("retry", b"maybe", DeliveryMode::Transient).await.unwrap();

    let mut consumer = ch.consume("retry", "c").await.unwrap();
    let delivery = tokio::time::timeout(WAIT, consumer.next()).await.unwrap().unwrap();
    delivery.reject(true).await.unwrap();

    let again = tokio::time::timeout(WAIT, consumer.next()).await.unwrap().unwrap();
    assert_eq!(again.payload, b"maybe");
    assert!(again.redelivered);
    again.reject(false).await.unwrap();
    conn.close().await;
}

#[tokio::test]
async fn test_closing_channel_requeues_unacked() {
    let (addr, broker) = spawn_broker().await;
    let conn = Connection::open(&addr).await.unwrap();

    let producer = conn.channel().await.unwrap();
    producer.declare_queue("jobs", true).await.unwrap();
    producer.publish("jobs", b"a", DeliveryMode::Persistent).await.unwrap();

    let ch = conn.channel().await.unwrap();
    let mut consumer = ch.consume("jobs", "first").await.unwrap();
    let delivery = tokio::time::timeout(WAIT, consumer.next()).await.unwrap().unwrap();
    drop(delivery);

    ch.close().await.unwrap();
    ch.close().await.unwrap();
    assert!(consumer.next().await.is_none());

    let stats = broker.lock().unwrap().queue_stats("jobs").unwrap();
    assert_eq!((stats.ready, stats.unacked, stats.consumers), (1, 0, 0));

    let ch2 = conn.channel().await.unwrap();
    let mut consumer2 = ch2.consume("jobs", "second").await.unwrap();
    let redelivered = tokio::time::timeout(WAIT, consumer2.next()).await.unwrap().unwrap();
    assert!(redelivered.redelivered);
    redelivered.ack().await.unwrap();
    conn.close().await;
}

#[tokio::test]
async fn test_cancel_ends_consumer_stream() {
    let (addr, _broker) = spawn_broker().await;
    let conn = Connection::open(&addr).await.unwrap();
    let ch = conn.channel().await.unwrap();
    ch.declare_queue("idle", false).await.unwrap();

    let mut consumer = ch.consume("idle", "tag").await.unwrap();
    consumer.cancel().await.unwrap();
    assert!(tokio::time::timeout(WAIT, consumer.next()).await.unwrap().is_none());
    conn.close().await;
}
