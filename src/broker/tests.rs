use super::Broker;
use super::message::QueuedMessage;
use super::peer::Peer;
use super::queue::{ConsumerRef, Queue};
use crate::persistence::Persistence;
use crate::transport::message::{ClientFrame, ErrorCode, Reply, ServerFrame};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tungstenite::protocol::Message as WsMessage;

fn connect(broker: &mut Broker) -> (String, UnboundedReceiver<WsMessage>) {
    let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();
    let peer = Peer::new(tx);
    let id = peer.id.clone();
    broker.register_peer(peer);
    (id, rx)
}

fn drain(rx: &mut UnboundedReceiver<WsMessage>) -> Vec<ServerFrame> {
    let mut frames = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        frames.push(serde_json::from_str(msg.to_text().unwrap()).unwrap());
    }
    frames
}

fn deliveries(frames: &[ServerFrame]) -> Vec<(u64, Vec<u8>, bool)> {
    frames
        .iter()
        .filter_map(|f| match f {
            ServerFrame::Deliver {
                delivery_tag,
                payload,
                redelivered,
                ..
            } => Some((*delivery_tag, payload.clone(), *redelivered)),
            _ => None,
        })
        .collect()
}

/// Opens channel 1 and declares `queue` on it.
fn setup(broker: &mut Broker, conn: &str, queue: &str, durable: bool) {
    broker.open_channel(conn, 1).unwrap();
    broker.declare_queue(conn, 1, queue, durable).unwrap();
}

fn publish(broker: &mut Broker, conn: &str, queue: &str, payload: &[u8]) {
    broker.handle_frame(
        conn,
        ClientFrame::Publish {
            channel: 1,
            request: 0,
            queue: queue.to_string(),
            payload: payload.to_vec(),
            persistent: true,
        },
    );
}

#[test]
fn test_queue_new() {
    let queue = Queue::new("task_queue", true);
    assert_eq!(queue.name, "task_queue");
    assert!(queue.durable);
    assert!(queue.ready.is_empty());
    assert!(queue.consumers.is_empty());
}

#[test]
fn test_queue_requeue_goes_to_head_flagged() {
    let mut queue = Queue::new("q", false);
    queue.ready.push_back(QueuedMessage::new(2, b"second".to_vec(), false));
    queue.requeue(QueuedMessage::new(1, b"first".to_vec(), false));

    let head = queue.ready.front().unwrap();
    assert_eq!(head.payload, b"first");
    assert!(head.redelivered);
}

#[test]
fn test_queue_detach() {
    let mut queue = Queue::new("q", false);
    queue.attach(ConsumerRef {
        connection: "c".into(),
        channel: 1,
        tag: "a".into(),
    });
    queue.detach(|c| c.tag == "a");
    assert!(queue.consumers.is_empty());
}

#[test]
fn test_broker_new() {
    let broker = Broker::new();
    assert!(broker.queues.is_empty());
    assert!(broker.peers.is_empty());
}

#[test]
fn test_declare_is_idempotent() {
    let mut broker = Broker::new();
    let (conn, _rx) = connect(&mut broker);
    setup(&mut broker, &conn, "task_queue_smoker", true);

    let again = broker
        .declare_queue(&conn, 1, "task_queue_smoker", true)
        .unwrap();
    assert_eq!(
        again,
        Reply::QueueDeclared {
            queue: "task_queue_smoker".into(),
            message_count: 0,
            consumer_count: 0,
        }
    );
    assert_eq!(broker.queues.len(), 1);
}

#[test]
fn test_declare_conflict_closes_only_that_channel() {
    let mut broker = Broker::new();
    let (conn, mut rx) = connect(&mut broker);
    setup(&mut broker, &conn, "q", true);
    broker.open_channel(&conn, 2).unwrap();

    broker.handle_frame(
        &conn,
        ClientFrame::DeclareQueue {
            channel: 1,
            request: 7,
            queue: "q".into(),
            durable: false,
        },
    );

    match drain(&mut rx).as_slice() {
        [
            ServerFrame::Error {
                request: Some(7),
                code: ErrorCode::PreconditionFailed,
                channel_closed: true,
                ..
            },
        ] => {}
        other => panic!("unexpected frames: {other:?}"),
    }
    assert!(broker.queue_stats("q").unwrap().durable);
    // channel 1 is gone, channel 2 still works
    assert!(broker.declare_queue(&conn, 1, "q", true).is_err());
    assert!(broker.declare_queue(&conn, 2, "q", true).is_ok());
}

#[test]
fn test_declare_rejects_empty_name() {
    let mut broker = Broker::new();
    let (conn, _rx) = connect(&mut broker);
    broker.open_channel(&conn, 1).unwrap();
    assert!(broker.declare_queue(&conn, 1, "", true).is_err());
}

#[test]
fn test_operations_require_open_channel() {
    let mut broker = Broker::new();
    let (conn, _rx) = connect(&mut broker);
    assert!(broker.declare_queue(&conn, 3, "q", true).is_err());
    assert!(broker.open_channel(&conn, 3).is_ok());
    assert!(broker.open_channel(&conn, 3).is_err());
}

#[test]
fn test_publish_to_missing_queue_keeps_channel_open() {
    let mut broker = Broker::new();
    let (conn, mut rx) = connect(&mut broker);
    broker.open_channel(&conn, 1).unwrap();

    publish(&mut broker, &conn, "nope", b"x");

    match drain(&mut rx).as_slice() {
        [
            ServerFrame::Error {
                code: ErrorCode::NotFound,
                channel_closed: false,
                ..
            },
        ] => {}
        other => panic!("unexpected frames: {other:?}"),
    }
    assert!(broker.declare_queue(&conn, 1, "q", false).is_ok());
}

#[test]
fn test_reply_precedes_delivery() {
    let mut broker = Broker::new();
    let (conn, mut rx) = connect(&mut broker);
    setup(&mut broker, &conn, "q", true);
    publish(&mut broker, &conn, "q", b"yes");
    drain(&mut rx);

    broker.handle_frame(
        &conn,
        ClientFrame::Consume {
            channel: 1,
            request: 3,
            queue: "q".into(),
            consumer_tag: "worker".into(),
        },
    );

    let frames = drain(&mut rx);
    assert!(matches!(
        frames[0],
        ServerFrame::Ok {
            reply: Reply::ConsumeOk { .. },
            ..
        }
    ));
    assert_eq!(deliveries(&frames), vec![(1, b"yes".to_vec(), false)]);
}

#[test]
fn test_prefetch_one_bounds_in_flight() {
    let mut broker = Broker::new();
    let (conn, mut rx) = connect(&mut broker);
    setup(&mut broker, &conn, "q", true);
    broker.set_qos(&conn, 1, 1).unwrap();
    broker.consume(&conn, 1, "q", "worker".into()).unwrap();

    for payload in [b"a", b"b", b"c"] {
        publish(&mut broker, &conn, "q", payload);
    }

    let delivered = deliveries(&drain(&mut rx));
    assert_eq!(delivered.len(), 1);
    let stats = broker.queue_stats("q").unwrap();
    assert_eq!((stats.ready, stats.unacked), (2, 1));

    broker.handle_frame(
        &conn,
        ClientFrame::Ack {
            channel: 1,
            request: 9,
            delivery_tag: delivered[0].0,
        },
    );
    let next = deliveries(&drain(&mut rx));
    assert_eq!(next, vec![(2, b"b".to_vec(), false)]);
    assert_eq!(broker.queue_stats("q").unwrap().unacked, 1);
}

#[test]
fn test_unlimited_prefetch_delivers_everything() {
    let mut broker = Broker::new();
    let (conn, mut rx) = connect(&mut broker);
    setup(&mut broker, &conn, "q", false);
    broker.consume(&conn, 1, "q", "worker".into()).unwrap();

    for payload in [b"a", b"b", b"c"] {
        publish(&mut broker, &conn, "q", payload);
    }

    let tags: Vec<u64> = deliveries(&drain(&mut rx)).iter().map(|d| d.0).collect();
    assert_eq!(tags, vec![1, 2, 3]);
}

#[test]
fn test_round_robin_between_consumers() {
    let mut broker = Broker::new();
    let (first, mut first_rx) = connect(&mut broker);
    let (second, mut second_rx) = connect(&mut broker);
    setup(&mut broker, &first, "q", true);
    setup(&mut broker, &second, "q", true);
    broker.consume(&first, 1, "q", "a".into()).unwrap();
    broker.consume(&second, 1, "q", "b".into()).unwrap();

    for payload in [b"1", b"2", b"3", b"4"] {
        publish(&mut broker, &first, "q", payload);
    }

    assert_eq!(deliveries(&drain(&mut first_rx)).len(), 2);
    assert_eq!(deliveries(&drain(&mut second_rx)).len(), 2);
}

#[test]
fn test_ack_unknown_tag_is_channel_error() {
    let mut broker = Broker::new();
    let (conn, mut rx) = connect(&mut broker);
    setup(&mut broker, &conn, "q", true);

    broker.handle_frame(
        &conn,
        ClientFrame::Ack {
            channel: 1,
            request: 1,
            delivery_tag: 42,
        },
    );

    match drain(&mut rx).as_slice() {
        [
            ServerFrame::Error {
                code: ErrorCode::PreconditionFailed,
                channel_closed: true,
                ..
            },
        ] => {}
        other => panic!("unexpected frames: {other:?}"),
    }
}

#[test]
fn test_nack_requeue_and_drop() {
    let mut broker = Broker::new();
    let (conn, mut rx) = connect(&mut broker);
    setup(&mut broker, &conn, "q", true);
    broker.set_qos(&conn, 1, 1).unwrap();
    broker.consume(&conn, 1, "q", "worker".into()).unwrap();
    publish(&mut broker, &conn, "q", b"maybe");
    let first = deliveries(&drain(&mut rx));

    broker.handle_frame(
        &conn,
        ClientFrame::Nack {
            channel: 1,
            request: 2,
            delivery_tag: first[0].0,
            requeue: true,
        },
    );
    let again = deliveries(&drain(&mut rx));
    assert_eq!(again, vec![(2, b"maybe".to_vec(), true)]);

    broker.handle_frame(
        &conn,
        ClientFrame::Nack {
            channel: 1,
            request: 3,
            delivery_tag: again[0].0,
            requeue: false,
        },
    );
    let stats = broker.queue_stats("q").unwrap();
    assert_eq!((stats.ready, stats.unacked), (0, 0));
}

#[test]
fn test_channel_close_requeues_in_order() {
    let mut broker = Broker::new();
    let (conn, mut rx) = connect(&mut broker);
    setup(&mut broker, &conn, "q", true);
    broker.consume(&conn, 1, "q", "worker".into()).unwrap();
    for payload in [b"a", b"b"] {
        publish(&mut broker, &conn, "q", payload);
    }
    assert_eq!(deliveries(&drain(&mut rx)).len(), 2);

    broker.close_channel(&conn, 1);

    let queue = broker.queues.get("q").unwrap();
    let payloads: Vec<&[u8]> = queue.ready.iter().map(|m| m.payload.as_slice()).collect();
    assert_eq!(payloads, vec![b"a".as_slice(), b"b".as_slice()]);
    assert!(queue.ready.iter().all(|m| m.redelivered));
    assert_eq!(queue.unacked, 0);
    assert!(queue.consumers.is_empty());
}

#[test]
fn test_cleanup_peer_redelivers_to_other_consumer() {
    let mut broker = Broker::new();
    let (gone, mut gone_rx) = connect(&mut broker);
    let (other, mut other_rx) = connect(&mut broker);
    setup(&mut broker, &gone, "q", true);
    setup(&mut broker, &other, "q", true);
    broker.set_qos(&gone, 1, 1).unwrap();
    broker.set_qos(&other, 1, 1).unwrap();
    broker.consume(&gone, 1, "q", "a".into()).unwrap();
    publish(&mut broker, &gone, "q", b"Southeast");
    assert_eq!(deliveries(&drain(&mut gone_rx)).len(), 1);

    broker.consume(&other, 1, "q", "b".into()).unwrap();
    broker.cleanup_peer(&gone);

    let redelivered = deliveries(&drain(&mut other_rx));
    assert_eq!(redelivered, vec![(1, b"Southeast".to_vec(), true)]);
    assert!(!broker.peers.contains_key(&gone));
}

#[test]
fn test_cancel_stops_dispatch() {
    let mut broker = Broker::new();
    let (conn, mut rx) = connect(&mut broker);
    setup(&mut broker, &conn, "q", true);
    broker.consume(&conn, 1, "q", "worker".into()).unwrap();
    broker.cancel(&conn, 1, "worker").unwrap();

    publish(&mut broker, &conn, "q", b"late");

    assert!(deliveries(&drain(&mut rx)).is_empty());
    assert_eq!(broker.queue_stats("q").unwrap().ready, 1);
}

#[test]
fn test_duplicate_consumer_tag_rejected() {
    let mut broker = Broker::new();
    let (conn, _rx) = connect(&mut broker);
    setup(&mut broker, &conn, "q", true);
    broker.consume(&conn, 1, "q", "worker".into()).unwrap();
    assert!(broker.consume(&conn, 1, "q", "worker".into()).is_err());
}

#[test]
fn test_durable_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();

    {
        let persistence = Persistence::open(&path).unwrap();
        let mut broker = Broker::with_persistence(persistence.clone()).unwrap();
        let (conn, _rx) = connect(&mut broker);
        setup(&mut broker, &conn, "durable_q", true);
        broker.declare_queue(&conn, 1, "transient_q", false).unwrap();

        broker.publish(&conn, 1, "durable_q", b"keep".to_vec(), true).unwrap();
        broker.publish(&conn, 1, "durable_q", b"lose".to_vec(), false).unwrap();
        broker.publish(&conn, 1, "transient_q", b"lose".to_vec(), true).unwrap();
        persistence.flush().unwrap();
    }

    let broker = Broker::with_persistence(Persistence::open(&path).unwrap()).unwrap();
    assert!(broker.queue_stats("transient_q").is_none());
    let queue = broker.queues.get("durable_q").unwrap();
    let payloads: Vec<&[u8]> = queue.ready.iter().map(|m| m.payload.as_slice()).collect();
    assert_eq!(payloads, vec![b"keep".as_slice()]);
}

#[test]
fn test_acked_message_removed_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();

    {
        let persistence = Persistence::open(&path).unwrap();
        let mut broker = Broker::with_persistence(persistence.clone()).unwrap();
        let (conn, _rx) = connect(&mut broker);
        setup(&mut broker, &conn, "q", true);
        broker.consume(&conn, 1, "q", "worker".into()).unwrap();
        broker.publish(&conn, 1, "q", b"done".to_vec(), true).unwrap();
        broker.publish(&conn, 1, "q", b"pending".to_vec(), true).unwrap();
        broker.handle_frame(&conn, ClientFrame::Qos { channel: 1, request: 0, prefetch: 0 });
        broker.ack(&conn, 1, 1).unwrap();
        persistence.flush().unwrap();
    }

    let broker = Broker::with_persistence(Persistence::open(&path).unwrap()).unwrap();
    let queue = broker.queues.get("q").unwrap();
    let payloads: Vec<&[u8]> = queue.ready.iter().map(|m| m.payload.as_slice()).collect();
    assert_eq!(payloads, vec![b"pending".as_slice()]);
}

#[test]
fn test_failed_disk_removal_keeps_delivery_unacked() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();
    let persistence = Persistence::open(&path).unwrap();
    let mut broker = Broker::with_persistence(persistence.clone()).unwrap();
    let (conn, mut rx) = connect(&mut broker);
    setup(&mut broker, &conn, "q", true);
    broker.consume(&conn, 1, "q", "worker".into()).unwrap();
    broker.publish(&conn, 1, "q", b"kept".to_vec(), true).unwrap();
    drain(&mut rx);

    persistence.fail_removals();
    assert!(broker.ack(&conn, 1, 1).is_err());
    assert!(broker.nack(&conn, 1, 1, false).is_err());
    let stats = broker.queue_stats("q").unwrap();
    assert_eq!((stats.ready, stats.unacked), (0, 1));

    broker.handle_frame(
        &conn,
        ClientFrame::Ack {
            channel: 1,
            request: 7,
            delivery_tag: 1,
        },
    );
    let frames = drain(&mut rx);
    assert!(
        frames
            .iter()
            .any(|f| matches!(f, ServerFrame::Error { channel_closed: true, .. }))
    );

    let queue = broker.queues.get("q").unwrap();
    assert_eq!(queue.unacked, 0);
    let requeued: Vec<(&[u8], bool)> = queue
        .ready
        .iter()
        .map(|m| (m.payload.as_slice(), m.redelivered))
        .collect();
    assert_eq!(requeued, vec![(b"kept".as_slice(), true)]);
}
