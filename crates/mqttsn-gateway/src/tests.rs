// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Gateway scenario tests.
//
// Frames go in through the dispatcher exactly as the UDP reader hands them
// over; replies are read back from the outbound queue. The broker side is a
// recording bridge whose acknowledgment behaviour each test chooses.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::bridge::{
    AckSender, AckToken, BridgeConnector, BridgeError, BrokerBridge, InboundHandler, NullBridge,
};
use crate::config::{BrokerConfig, GatewayConfig};
use crate::dispatcher::Dispatcher;
use crate::gateway::Gateway;
use crate::protocol::*;
use crate::qos::Direction;
use crate::session::{Session, SessionRegistry, SessionState};
use crate::topics::TopicTable;
use crate::transport::{Datagram, Outbound};

// -----------------------------------------------------------------------
// Recording broker bridge
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckMode {
    Accept,
    /// Tokens stay pending forever.
    Never,
    InvalidTopic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BrokerPublish {
    client_id: String,
    topic: String,
    qos: Qos,
    retain: bool,
    payload: Vec<u8>,
}

#[derive(Default)]
struct BrokerLog {
    connects: Vec<String>,
    publishes: Vec<BrokerPublish>,
    subscribes: Vec<(String, String, Qos)>,
    unsubscribes: Vec<(String, String)>,
    disconnects: Vec<String>,
    handlers: Vec<(String, String, Arc<dyn InboundHandler>)>,
    pending: Vec<AckSender>,
}

struct BrokerShared {
    log: Mutex<BrokerLog>,
    mode: Mutex<AckMode>,
}

impl BrokerShared {
    fn token(&self) -> AckToken {
        match *self.mode.lock().unwrap() {
            AckMode::Accept => AckToken::ready(Ok(())),
            AckMode::InvalidTopic => AckToken::ready(Err(BridgeError::InvalidTopic("t".into()))),
            AckMode::Never => {
                let (tx, token) = AckToken::pending();
                self.log.lock().unwrap().pending.push(tx);
                token
            }
        }
    }
}

struct RecordingBridge {
    client_id: String,
    shared: Arc<BrokerShared>,
}

impl BrokerBridge for RecordingBridge {
    fn publish(&self, topic: &str, qos: Qos, retain: bool, payload: Vec<u8>) -> AckToken {
        self.shared.log.lock().unwrap().publishes.push(BrokerPublish {
            client_id: self.client_id.clone(),
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        });
        self.shared.token()
    }

    fn subscribe(&self, filter: &str, qos: Qos, handler: Arc<dyn InboundHandler>) -> AckToken {
        {
            let mut log = self.shared.log.lock().unwrap();
            log.subscribes
                .push((self.client_id.clone(), filter.to_string(), qos));
            log.handlers
                .push((self.client_id.clone(), filter.to_string(), handler));
        }
        self.shared.token()
    }

    fn unsubscribe(&self, filter: &str) -> AckToken {
        self.shared
            .log
            .lock()
            .unwrap()
            .unsubscribes
            .push((self.client_id.clone(), filter.to_string()));
        self.shared.token()
    }

    fn disconnect(&self) {
        self.shared
            .log
            .lock()
            .unwrap()
            .disconnects
            .push(self.client_id.clone());
    }
}

struct RecordingConnector {
    shared: Arc<BrokerShared>,
}

impl BridgeConnector for RecordingConnector {
    fn connect(&self, client_id: &str, _broker: &BrokerConfig) -> Arc<dyn BrokerBridge> {
        self.shared
            .log
            .lock()
            .unwrap()
            .connects
            .push(client_id.to_string());
        Arc::new(RecordingBridge {
            client_id: client_id.to_string(),
            shared: Arc::clone(&self.shared),
        })
    }
}

// -----------------------------------------------------------------------
// Harness
// -----------------------------------------------------------------------

struct Harness {
    gateway: Arc<Gateway>,
    dispatcher: Dispatcher,
    outbound: mpsc::UnboundedReceiver<Datagram>,
    broker: Arc<BrokerShared>,
}

fn fast_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.qos.ack_timeout_ms = 20;
    config.qos.max_retries = 2;
    config.qos.backoff_multiplier = 2.0;
    config.qos.max_timeout_ms = 100;
    config
}

fn harness_with(config: GatewayConfig, mode: AckMode) -> Harness {
    let broker = Arc::new(BrokerShared {
        log: Mutex::new(BrokerLog::default()),
        mode: Mutex::new(mode),
    });
    let (outbound_tx, outbound) = Outbound::channel();
    let connector = Arc::new(RecordingConnector {
        shared: Arc::clone(&broker),
    });
    let gateway = Gateway::new(config, connector, outbound_tx).unwrap();
    Harness {
        dispatcher: Dispatcher::new(Arc::clone(&gateway)),
        gateway,
        outbound,
        broker,
    }
}

fn harness() -> Harness {
    harness_with(fast_config(), AckMode::Accept)
}

impl Harness {
    /// Dispatch `msg` from `from` and wait for its handler to finish.
    async fn send(&self, from: SocketAddr, msg: Message) {
        let bytes = encode(&msg).unwrap();
        let handle = self.dispatcher.dispatch(from, &bytes).expect("decodable");
        handle.await.unwrap();
    }

    async fn recv(&mut self) -> (SocketAddr, Message) {
        let datagram = tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
            .await
            .expect("gateway reply")
            .expect("outbound open");
        (datagram.addr, decode(&datagram.bytes).unwrap())
    }

    fn assert_silent(&mut self) {
        if let Ok(datagram) = self.outbound.try_recv() {
            panic!("unexpected reply: {:?}", decode(&datagram.bytes));
        }
    }

    async fn connect(&mut self, from: SocketAddr, client_id: &str) {
        self.send(from, connect_msg(client_id, true, 0)).await;
        assert_eq!(self.recv().await.1, connack(ReturnCode::Accepted));
    }

    fn publishes(&self) -> Vec<BrokerPublish> {
        self.broker.log.lock().unwrap().publishes.clone()
    }

    fn handler(&self, filter: &str) -> Arc<dyn InboundHandler> {
        let log = self.broker.log.lock().unwrap();
        let (_, _, handler) = log
            .handlers
            .iter()
            .rev()
            .find(|(_, f, _)| f == filter)
            .expect("subscription handler");
        Arc::clone(handler)
    }

    async fn wait_flow_idle(&self) {
        for _ in 0..100 {
            if self.gateway.flow().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("QoS exchanges still pending");
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn connect_msg(client_id: &str, clean_session: bool, duration: u16) -> Message {
    Message::Connect(Connect {
        flags: Flags {
            clean_session,
            ..Flags::default()
        },
        protocol_id: PROTOCOL_ID,
        duration,
        client_id: client_id.to_string(),
    })
}

fn connack(return_code: ReturnCode) -> Message {
    Message::ConnAck(ConnAck { return_code })
}

fn register_msg(name: &str, msg_id: u16) -> Message {
    Message::Register(Register {
        topic_id: 0,
        msg_id,
        topic_name: name.to_string(),
    })
}

fn publish_msg(topic_id: u16, topic_id_type: TopicIdType, qos: Qos, msg_id: u16, data: &[u8]) -> Message {
    Message::Publish(Publish {
        flags: Flags::with(qos, topic_id_type),
        topic_id,
        msg_id,
        data: data.to_vec(),
    })
}

fn subscribe_msg(topic: TopicRef, topic_id_type: TopicIdType, qos: Qos, msg_id: u16) -> Message {
    Message::Subscription(Subscription {
        kind: SubscriptionKind::Subscribe,
        flags: Flags::with(qos, topic_id_type),
        msg_id,
        topic,
    })
}

fn pubflow(kind: PubFlowKind, msg_id: u16) -> Message {
    Message::PubFlow(PubFlow { kind, msg_id })
}

// -----------------------------------------------------------------------
// 1. Basic scenario: connect, register, publish QoS 0, disconnect
// -----------------------------------------------------------------------
#[tokio::test]
async fn test_register_publish_disconnect_scenario() {
    let mut h = harness();
    let client = addr(5001);

    h.connect(client, "A").await;

    h.send(client, register_msg("room/temp", 7)).await;
    assert_eq!(
        h.recv().await,
        (
            client,
            Message::RegAck(RegAck {
                topic_id: 1,
                msg_id: 7,
                return_code: ReturnCode::Accepted
            })
        )
    );

    h.send(client, publish_msg(1, TopicIdType::Normal, Qos::AtMostOnce, 0, b"21.5"))
        .await;
    assert_eq!(
        h.publishes(),
        vec![BrokerPublish {
            client_id: "A".into(),
            topic: "room/temp".into(),
            qos: Qos::AtMostOnce,
            retain: false,
            payload: b"21.5".to_vec(),
        }]
    );
    h.assert_silent();

    h.send(client, Message::Disconnect(Disconnect { duration: None }))
        .await;
    assert_eq!(h.recv().await.1, Message::Disconnect(Disconnect { duration: None }));
    assert!(h.gateway.registry().is_empty());
    assert_eq!(h.broker.log.lock().unwrap().disconnects, vec!["A".to_string()]);
}

// -----------------------------------------------------------------------
// 2. Clean session semantics
// -----------------------------------------------------------------------
#[tokio::test]
async fn test_reconnect_without_clean_session_keeps_topics() {
    let mut h = harness();
    let first = addr(5002);
    let second = addr(5003);

    h.connect(first, "A").await;
    h.send(first, register_msg("x", 1)).await;
    h.recv().await;

    // Same client, new address, clean_session=false.
    h.send(second, connect_msg("A", false, 0)).await;
    assert_eq!(h.recv().await, (second, connack(ReturnCode::Accepted)));

    assert!(h.gateway.registry().resolve(first).is_none());
    let session = h.gateway.registry().resolve(second).unwrap();
    assert_eq!(session.registered_name(1).as_deref(), Some("x"));
    assert_eq!(h.gateway.registry().len(), 1);
    assert_eq!(h.broker.log.lock().unwrap().connects.len(), 1);

    h.send(second, register_msg("y", 2)).await;
    match h.recv().await.1 {
        Message::RegAck(ack) => assert_eq!(ack.topic_id, 2),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn test_clean_session_discards_topics() {
    let mut h = harness();
    let client = addr(5004);

    h.connect(client, "A").await;
    h.send(client, register_msg("x", 1)).await;
    h.recv().await;
    let old = h.gateway.registry().resolve(client).unwrap();

    h.connect(client, "A").await;
    let new = h.gateway.registry().resolve(client).unwrap();
    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(new.registered_topic_count(), 0);
    assert_eq!(old.state(), SessionState::Disconnected);

    let log = h.broker.log.lock().unwrap();
    assert_eq!(log.connects.len(), 2);
    assert_eq!(log.disconnects, vec!["A".to_string()]);
}

#[tokio::test]
async fn test_empty_client_id_rejected() {
    let mut h = harness();
    h.send(addr(5005), connect_msg("", true, 0)).await;
    assert_eq!(h.recv().await.1, connack(ReturnCode::NotSupported));
    assert!(h.gateway.registry().is_empty());
}

// -----------------------------------------------------------------------
// 3. Topic ids
// -----------------------------------------------------------------------
#[tokio::test]
async fn test_register_is_idempotent_per_session() {
    let mut h = harness();
    let client = addr(5006);
    h.connect(client, "A").await;

    let mut ids = Vec::new();
    for (name, msg_id) in [("a", 1), ("a", 2), ("b", 3)] {
        h.send(client, register_msg(name, msg_id)).await;
        match h.recv().await.1 {
            Message::RegAck(ack) => {
                assert_eq!(ack.msg_id, msg_id);
                assert!(ack.return_code.is_accepted());
                ids.push(ack.topic_id);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
    assert_eq!(ids[0], ids[1]);
    assert_ne!(ids[0], ids[2]);
}

#[tokio::test]
async fn test_register_wildcard_not_supported() {
    let mut h = harness();
    let client = addr(5007);
    h.connect(client, "A").await;
    h.send(client, register_msg("a/#", 4)).await;
    assert_eq!(
        h.recv().await.1,
        Message::RegAck(RegAck {
            topic_id: 0,
            msg_id: 4,
            return_code: ReturnCode::NotSupported
        })
    );
}

#[tokio::test]
async fn test_predefined_topics_resolve_and_are_never_reallocated() {
    let mut config = fast_config();
    config.add_predefined("A", 1, "cfg/one");
    config.add_predefined("A", 2, "cfg/two");
    let mut h = harness_with(config, AckMode::Accept);
    let client = addr(5008);
    h.connect(client, "A").await;

    h.send(client, register_msg("dyn", 1)).await;
    match h.recv().await.1 {
        Message::RegAck(ack) => assert_eq!(ack.topic_id, 3),
        other => panic!("unexpected: {:?}", other),
    }

    h.send(client, publish_msg(2, TopicIdType::Predefined, Qos::AtMostOnce, 0, b"p"))
        .await;
    assert_eq!(h.publishes()[0].topic, "cfg/two");

    // Another client has no predefined topics.
    let other = addr(5009);
    h.connect(other, "B").await;
    h.send(other, publish_msg(2, TopicIdType::Predefined, Qos::AtMostOnce, 0, b"p"))
        .await;
    match h.recv().await.1 {
        Message::PubAck(ack) => assert_eq!(ack.return_code, ReturnCode::InvalidTopicId),
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(h.publishes().len(), 1);
}

// -----------------------------------------------------------------------
// 4. Publish path (client -> broker)
// -----------------------------------------------------------------------
#[tokio::test]
async fn test_publish_unknown_topic_id_rejected() {
    let mut h = harness();
    let client = addr(5010);
    h.connect(client, "A").await;

    h.send(client, publish_msg(42, TopicIdType::Normal, Qos::AtLeastOnce, 9, b"x"))
        .await;
    assert_eq!(
        h.recv().await.1,
        Message::PubAck(PubAck {
            topic_id: 42,
            msg_id: 9,
            return_code: ReturnCode::InvalidTopicId
        })
    );
    assert!(h.publishes().is_empty());
}

#[tokio::test]
async fn test_publish_without_session_dropped() {
    let mut h = harness();
    h.send(addr(5011), publish_msg(1, TopicIdType::Normal, Qos::AtLeastOnce, 1, b"x"))
        .await;
    h.assert_silent();
    assert!(h.publishes().is_empty());
}

#[tokio::test]
async fn test_publish_short_name() {
    let mut h = harness();
    let client = addr(5012);
    h.connect(client, "A").await;
    let id = short_name_to_id("ab").unwrap();
    h.send(client, publish_msg(id, TopicIdType::ShortName, Qos::AtMostOnce, 0, b"s"))
        .await;
    assert_eq!(h.publishes()[0].topic, "ab");
}

#[tokio::test]
async fn test_publish_reserved_topic_type_dropped() {
    let mut h = harness();
    let client = addr(5013);
    h.connect(client, "A").await;
    h.send(client, publish_msg(1, TopicIdType::Reserved, Qos::AtLeastOnce, 1, b"x"))
        .await;
    h.assert_silent();
    assert!(h.publishes().is_empty());
}

#[tokio::test]
async fn test_qos1_publish_acked_once() {
    let mut h = harness();
    let client = addr(5014);
    h.connect(client, "A").await;
    h.send(client, register_msg("t", 1)).await;
    h.recv().await;

    h.send(client, publish_msg(1, TopicIdType::Normal, Qos::AtLeastOnce, 11, b"v"))
        .await;
    assert_eq!(
        h.recv().await.1,
        Message::PubAck(PubAck {
            topic_id: 1,
            msg_id: 11,
            return_code: ReturnCode::Accepted
        })
    );
    h.assert_silent();
    assert_eq!(h.publishes().len(), 1);
    assert_eq!(h.publishes()[0].qos, Qos::AtLeastOnce);
    assert!(h.gateway.flow().is_empty());
}

#[tokio::test]
async fn test_qos1_publish_unconfirmed_rejected_after_retries() {
    let mut h = harness_with(fast_config(), AckMode::Never);
    let client = addr(5015);
    h.connect(client, "A").await;
    h.send(client, register_msg("t", 1)).await;
    h.recv().await;

    let started = Instant::now();
    h.send(client, publish_msg(1, TopicIdType::Normal, Qos::AtLeastOnce, 12, b"v"))
        .await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(
        h.recv().await.1,
        Message::PubAck(PubAck {
            topic_id: 1,
            msg_id: 12,
            return_code: ReturnCode::Congestion
        })
    );
    // First try plus max_retries.
    assert_eq!(h.publishes().len(), 3);
    assert!(h.gateway.flow().is_empty());
}

#[tokio::test]
async fn test_qos1_publish_invalid_topic_at_broker() {
    let mut h = harness_with(fast_config(), AckMode::InvalidTopic);
    let client = addr(5016);
    h.connect(client, "A").await;
    h.send(client, register_msg("t", 1)).await;
    h.recv().await;

    h.send(client, publish_msg(1, TopicIdType::Normal, Qos::AtLeastOnce, 13, b"v"))
        .await;
    match h.recv().await.1 {
        Message::PubAck(ack) => assert_eq!(ack.return_code, ReturnCode::InvalidTopicId),
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(h.publishes().len(), 1);
}

#[tokio::test]
async fn test_qos1_duplicate_in_flight_not_forwarded_twice() {
    // One long attempt so the first PUBLISH stays in flight.
    let mut config = fast_config();
    config.qos.ack_timeout_ms = 300;
    config.qos.max_timeout_ms = 300;
    config.qos.max_retries = 0;
    let mut h = harness_with(config, AckMode::Never);
    let client = addr(5017);
    h.connect(client, "A").await;
    h.send(client, register_msg("t", 1)).await;
    h.recv().await;

    let frame = encode(&publish_msg(1, TopicIdType::Normal, Qos::AtLeastOnce, 14, b"v")).unwrap();
    let first = h.dispatcher.dispatch(client, &frame).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let session = h.gateway.registry().resolve(client).unwrap();
    assert_eq!(
        h.gateway.flow().step(session.id(), 14, Direction::Uplink),
        Some(crate::qos::QosStep::AwaitBrokerAck)
    );
    let dup = h.dispatcher.dispatch(client, &frame).unwrap();
    dup.await.unwrap();
    assert_eq!(h.publishes().len(), 1);

    first.await.unwrap();
    match h.recv().await.1 {
        Message::PubAck(ack) => assert_eq!(ack.msg_id, 14),
        other => panic!("unexpected: {:?}", other),
    }
    h.assert_silent();
}

#[tokio::test]
async fn test_qos2_publish_flow() {
    let mut h = harness();
    let client = addr(5018);
    h.connect(client, "A").await;
    h.send(client, register_msg("t", 1)).await;
    h.recv().await;

    h.send(client, publish_msg(1, TopicIdType::Normal, Qos::ExactlyOnce, 20, b"q2"))
        .await;
    assert_eq!(h.recv().await.1, pubflow(PubFlowKind::Rec, 20));
    assert!(h.publishes().is_empty());

    // Duplicate PUBLISH before PUBREL: PUBREC again, nothing forwarded.
    h.send(client, publish_msg(1, TopicIdType::Normal, Qos::ExactlyOnce, 20, b"q2"))
        .await;
    assert_eq!(h.recv().await.1, pubflow(PubFlowKind::Rec, 20));
    assert!(h.publishes().is_empty());

    h.send(client, pubflow(PubFlowKind::Rel, 20)).await;
    assert_eq!(h.recv().await.1, pubflow(PubFlowKind::Comp, 20));
    let publishes = h.publishes();
    assert_eq!(publishes.len(), 1);
    assert_eq!(publishes[0].qos, Qos::ExactlyOnce);
    assert_eq!(publishes[0].payload, b"q2".to_vec());
    assert!(h.gateway.flow().is_empty());
}

#[tokio::test]
async fn test_qos2_broker_failure_yields_puback_rejection() {
    let mut h = harness_with(fast_config(), AckMode::Never);
    let client = addr(5019);
    h.connect(client, "A").await;
    h.send(client, register_msg("t", 1)).await;
    h.recv().await;

    h.send(client, publish_msg(1, TopicIdType::Normal, Qos::ExactlyOnce, 21, b"q2"))
        .await;
    assert_eq!(h.recv().await.1, pubflow(PubFlowKind::Rec, 21));
    h.send(client, pubflow(PubFlowKind::Rel, 21)).await;
    assert_eq!(
        h.recv().await.1,
        Message::PubAck(PubAck {
            topic_id: 1,
            msg_id: 21,
            return_code: ReturnCode::Congestion
        })
    );
}

#[tokio::test]
async fn test_pubrel_without_pubrec_ignored() {
    let mut h = harness();
    let client = addr(5020);
    h.connect(client, "A").await;
    h.send(client, pubflow(PubFlowKind::Rel, 99)).await;
    h.assert_silent();
    assert!(h.publishes().is_empty());
}

#[tokio::test]
async fn test_stale_pubrel_keeps_held_publish_of_new_session() {
    let mut config = fast_config();
    config.qos.ack_timeout_ms = 100;
    config.qos.max_timeout_ms = 100;
    config.qos.max_retries = 0;
    let mut h = harness_with(config, AckMode::Never);
    let client = addr(5050);
    h.connect(client, "A").await;
    h.send(client, register_msg("t", 1)).await;
    h.recv().await;
    h.send(client, publish_msg(1, TopicIdType::Normal, Qos::ExactlyOnce, 7, b"old"))
        .await;
    assert_eq!(h.recv().await.1, pubflow(PubFlowKind::Rec, 7));

    // The old PUBREL waits on the broker while the client starts over.
    let rel = encode(&pubflow(PubFlowKind::Rel, 7)).unwrap();
    let old = h.dispatcher.dispatch(client, &rel).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    h.connect(client, "A").await;
    h.send(client, register_msg("t", 1)).await;
    h.recv().await;
    h.send(client, publish_msg(1, TopicIdType::Normal, Qos::ExactlyOnce, 7, b"new"))
        .await;
    assert_eq!(h.recv().await.1, pubflow(PubFlowKind::Rec, 7));

    old.await.unwrap();
    h.assert_silent();

    *h.broker.mode.lock().unwrap() = AckMode::Accept;
    h.send(client, pubflow(PubFlowKind::Rel, 7)).await;
    assert_eq!(h.recv().await.1, pubflow(PubFlowKind::Comp, 7));
    let publishes = h.publishes();
    assert_eq!(publishes.last().unwrap().payload, b"new".to_vec());
}

#[tokio::test]
async fn test_stale_qos1_exchange_keeps_new_session_in_flight() {
    let mut config = fast_config();
    config.qos.ack_timeout_ms = 150;
    config.qos.max_timeout_ms = 150;
    config.qos.max_retries = 0;
    let mut h = harness_with(config, AckMode::Never);
    let client = addr(5051);
    h.connect(client, "A").await;
    h.send(client, register_msg("t", 1)).await;
    h.recv().await;

    let frame = encode(&publish_msg(1, TopicIdType::Normal, Qos::AtLeastOnce, 14, b"v")).unwrap();
    let started = Instant::now();
    let old = h.dispatcher.dispatch(client, &frame).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    h.connect(client, "A").await;
    h.send(client, register_msg("t", 1)).await;
    h.recv().await;
    // Start the new exchange well before the old one gives up.
    tokio::time::sleep_until((started + Duration::from_millis(60)).into()).await;
    let new = h.dispatcher.dispatch(client, &frame).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let session = h.gateway.registry().resolve(client).unwrap();
    let awaiting = Some(crate::qos::QosStep::AwaitBrokerAck);
    assert_eq!(h.gateway.flow().step(session.id(), 14, Direction::Uplink), awaiting);

    old.await.unwrap();
    assert_eq!(h.gateway.flow().step(session.id(), 14, Direction::Uplink), awaiting);

    let dup = h.dispatcher.dispatch(client, &frame).unwrap();
    dup.await.unwrap();
    assert_eq!(h.publishes().len(), 2);

    new.await.unwrap();
    match h.recv().await.1 {
        Message::PubAck(ack) => assert_eq!(ack.msg_id, 14),
        other => panic!("unexpected: {:?}", other),
    }
    h.assert_silent();
}

// -----------------------------------------------------------------------
// 5. Subscribe path (broker -> client)
// -----------------------------------------------------------------------
#[tokio::test]
async fn test_wildcard_subscribe_allocates_on_delivery() {
    let mut h = harness();
    let client = addr(5021);
    h.connect(client, "A").await;

    h.send(
        client,
        subscribe_msg(TopicRef::Name("a/+".into()), TopicIdType::Normal, Qos::AtLeastOnce, 3),
    )
    .await;
    match h.recv().await.1 {
        Message::SubAck(ack) => {
            assert_eq!(ack.topic_id, 0);
            assert_eq!(ack.msg_id, 3);
            assert_eq!(ack.return_code, ReturnCode::Accepted);
            assert_eq!(ack.flags.qos, Qos::AtLeastOnce);
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(
        h.broker.log.lock().unwrap().subscribes,
        vec![("A".to_string(), "a/+".to_string(), Qos::AtLeastOnce)]
    );

    h.handler("a/+").on_message("a/b", b"hi", Qos::AtMostOnce);

    let registered = match h.recv().await {
        (to, Message::Register(reg)) => {
            assert_eq!(to, client);
            assert_eq!(reg.topic_name, "a/b");
            assert_ne!(reg.topic_id, 0);
            reg.topic_id
        }
        other => panic!("unexpected: {:?}", other),
    };
    match h.recv().await.1 {
        Message::Publish(p) => {
            assert_eq!(p.topic_id, registered);
            assert_eq!(p.flags.topic_id_type, TopicIdType::Normal);
            assert_eq!(p.data, b"hi".to_vec());
        }
        other => panic!("unexpected: {:?}", other),
    }

    // Second message on the same topic reuses the id, no REGISTER.
    h.handler("a/+").on_message("a/b", b"again", Qos::AtMostOnce);
    match h.recv().await.1 {
        Message::Publish(p) => assert_eq!(p.topic_id, registered),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn test_subscribe_topic_id_matches_delivery() {
    let mut h = harness();
    let client = addr(5022);
    h.connect(client, "A").await;

    h.send(
        client,
        subscribe_msg(TopicRef::Name("room/temp".into()), TopicIdType::Normal, Qos::AtMostOnce, 4),
    )
    .await;
    let topic_id = match h.recv().await.1 {
        Message::SubAck(ack) => {
            assert_ne!(ack.topic_id, 0);
            ack.topic_id
        }
        other => panic!("unexpected: {:?}", other),
    };

    h.handler("room/temp")
        .on_message("room/temp", b"20", Qos::AtMostOnce);
    match h.recv().await.1 {
        Message::Publish(p) => {
            assert_eq!(p.topic_id, topic_id);
            assert_eq!(p.flags.qos, Qos::AtMostOnce);
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn test_subscribe_short_name() {
    let mut h = harness();
    let client = addr(5023);
    h.connect(client, "A").await;
    let id = short_name_to_id("xy").unwrap();

    h.send(
        client,
        subscribe_msg(TopicRef::Short(id), TopicIdType::ShortName, Qos::AtMostOnce, 5),
    )
    .await;
    match h.recv().await.1 {
        Message::SubAck(ack) => {
            assert_eq!(ack.topic_id, id);
            assert_eq!(ack.flags.topic_id_type, TopicIdType::ShortName);
            assert!(ack.return_code.is_accepted());
        }
        other => panic!("unexpected: {:?}", other),
    }

    h.handler("xy").on_message("xy", b"s", Qos::AtMostOnce);
    match h.recv().await.1 {
        Message::Publish(p) => {
            assert_eq!(p.topic_id, id);
            assert_eq!(p.flags.topic_id_type, TopicIdType::ShortName);
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn test_subscribe_unknown_predefined_rejected() {
    let mut h = harness();
    let client = addr(5024);
    h.connect(client, "A").await;

    h.send(
        client,
        subscribe_msg(TopicRef::Id(77), TopicIdType::Predefined, Qos::AtMostOnce, 6),
    )
    .await;
    assert_eq!(
        h.recv().await.1,
        Message::SubAck(SubAck {
            flags: Flags::with(Qos::AtMostOnce, TopicIdType::Predefined),
            topic_id: 0,
            msg_id: 6,
            return_code: ReturnCode::InvalidTopicId
        })
    );
    assert!(h.broker.log.lock().unwrap().subscribes.is_empty());
}

#[tokio::test]
async fn test_subscribe_broker_failure_reports_congestion() {
    let mut h = harness_with(fast_config(), AckMode::Never);
    let client = addr(5025);
    h.connect(client, "A").await;

    h.send(
        client,
        subscribe_msg(TopicRef::Name("a/b".into()), TopicIdType::Normal, Qos::AtMostOnce, 7),
    )
    .await;
    match h.recv().await.1 {
        Message::SubAck(ack) => assert_eq!(ack.return_code, ReturnCode::Congestion),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn test_unsubscribe() {
    let mut h = harness();
    let client = addr(5026);
    h.connect(client, "A").await;

    h.send(
        client,
        Message::Subscription(Subscription {
            kind: SubscriptionKind::Unsubscribe,
            flags: Flags::with(Qos::AtMostOnce, TopicIdType::Normal),
            msg_id: 8,
            topic: TopicRef::Name("a/+".into()),
        }),
    )
    .await;
    assert_eq!(h.recv().await.1, Message::UnsubAck(UnsubAck { msg_id: 8 }));
    assert_eq!(
        h.broker.log.lock().unwrap().unsubscribes,
        vec![("A".to_string(), "a/+".to_string())]
    );
}

#[tokio::test]
async fn test_downlink_qos1_retransmits_until_acked() {
    let mut h = harness();
    let client = addr(5027);
    h.connect(client, "A").await;
    h.send(
        client,
        subscribe_msg(TopicRef::Name("d/q".into()), TopicIdType::Normal, Qos::AtLeastOnce, 1),
    )
    .await;
    let topic_id = match h.recv().await.1 {
        Message::SubAck(ack) => ack.topic_id,
        other => panic!("unexpected: {:?}", other),
    };

    h.handler("d/q").on_message("d/q", b"x", Qos::AtLeastOnce);
    let first = match h.recv().await.1 {
        Message::Publish(p) => p,
        other => panic!("unexpected: {:?}", other),
    };
    assert_eq!(first.flags.qos, Qos::AtLeastOnce);
    assert!(!first.flags.dup);
    assert_ne!(first.msg_id, 0);

    let retry = match h.recv().await.1 {
        Message::Publish(p) => p,
        other => panic!("unexpected: {:?}", other),
    };
    assert!(retry.flags.dup);
    assert_eq!(retry.msg_id, first.msg_id);

    h.send(
        client,
        Message::PubAck(PubAck {
            topic_id,
            msg_id: first.msg_id,
            return_code: ReturnCode::Accepted,
        }),
    )
    .await;
    h.wait_flow_idle().await;
}

#[tokio::test]
async fn test_downlink_qos2_handshake() {
    let mut h = harness();
    let client = addr(5028);
    h.connect(client, "A").await;
    h.send(
        client,
        subscribe_msg(TopicRef::Name("d/q2".into()), TopicIdType::Normal, Qos::ExactlyOnce, 1),
    )
    .await;
    h.recv().await;

    h.handler("d/q2").on_message("d/q2", b"x", Qos::ExactlyOnce);
    let publish = match h.recv().await.1 {
        Message::Publish(p) => p,
        other => panic!("unexpected: {:?}", other),
    };
    assert_eq!(publish.flags.qos, Qos::ExactlyOnce);

    h.send(client, pubflow(PubFlowKind::Rec, publish.msg_id)).await;
    // Skip retransmitted PUBLISH frames racing the PUBREC.
    loop {
        match h.recv().await.1 {
            Message::PubFlow(f) => {
                assert_eq!(f, PubFlow { kind: PubFlowKind::Rel, msg_id: publish.msg_id });
                break;
            }
            Message::Publish(p) => assert!(p.flags.dup),
            other => panic!("unexpected: {:?}", other),
        }
    }

    h.send(client, pubflow(PubFlowKind::Comp, publish.msg_id)).await;
    h.wait_flow_idle().await;
}

#[tokio::test]
async fn test_downlink_gives_up_after_retry_budget() {
    let mut h = harness();
    let client = addr(5029);
    h.connect(client, "A").await;
    h.send(
        client,
        subscribe_msg(TopicRef::Name("d/q".into()), TopicIdType::Normal, Qos::AtLeastOnce, 1),
    )
    .await;
    h.recv().await;

    h.handler("d/q").on_message("d/q", b"x", Qos::AtLeastOnce);
    let mut sent = 0;
    while let Ok(Some(datagram)) =
        tokio::time::timeout(Duration::from_millis(300), h.outbound.recv()).await
    {
        assert!(matches!(decode(&datagram.bytes).unwrap(), Message::Publish(_)));
        sent += 1;
    }
    assert_eq!(sent, 3);
    h.wait_flow_idle().await;
}

// -----------------------------------------------------------------------
// 6. Sleeping clients
// -----------------------------------------------------------------------
#[tokio::test]
async fn test_asleep_buffers_and_flushes_on_pingreq() {
    let mut h = harness();
    let client = addr(5030);
    h.connect(client, "A").await;
    h.send(
        client,
        subscribe_msg(TopicRef::Name("s/t".into()), TopicIdType::Normal, Qos::AtMostOnce, 1),
    )
    .await;
    h.recv().await;

    h.send(client, Message::Disconnect(Disconnect { duration: Some(60) }))
        .await;
    assert_eq!(h.recv().await.1, Message::Disconnect(Disconnect { duration: None }));
    let session = h.gateway.registry().resolve(client).unwrap();
    assert_eq!(session.state(), SessionState::Asleep);

    let handler = h.handler("s/t");
    handler.on_message("s/t", b"1", Qos::AtMostOnce);
    handler.on_message("s/t", b"2", Qos::AtMostOnce);
    h.assert_silent();
    assert_eq!(session.buffered_len(), 2);

    // Wakes up from a new address.
    let woke = addr(5031);
    h.send(
        woke,
        Message::PingReq(PingReq {
            client_id: Some("A".into()),
        }),
    )
    .await;
    for expected in [b"1", b"2"] {
        match h.recv().await {
            (to, Message::Publish(p)) => {
                assert_eq!(to, woke);
                assert_eq!(p.data, expected.to_vec());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
    assert_eq!(h.recv().await, (woke, Message::PingResp));
    assert_eq!(session.state(), SessionState::Connected);
    assert!(h.gateway.registry().resolve(client).is_none());
}

#[tokio::test]
async fn test_sleep_buffer_drops_oldest() {
    let mut config = fast_config();
    config.sessions.sleep_buffer_capacity = 2;
    let mut h = harness_with(config, AckMode::Accept);
    let client = addr(5032);
    h.connect(client, "A").await;
    h.send(
        client,
        subscribe_msg(TopicRef::Name("s/t".into()), TopicIdType::Normal, Qos::AtMostOnce, 1),
    )
    .await;
    h.recv().await;
    h.send(client, Message::Disconnect(Disconnect { duration: Some(60) }))
        .await;
    h.recv().await;

    let handler = h.handler("s/t");
    for payload in [b"1", b"2", b"3"] {
        handler.on_message("s/t", payload, Qos::AtMostOnce);
    }

    // CONNECT also wakes the session.
    h.send(client, connect_msg("A", false, 0)).await;
    assert_eq!(h.recv().await.1, connack(ReturnCode::Accepted));
    for expected in [b"2", b"3"] {
        match h.recv().await.1 {
            Message::Publish(p) => assert_eq!(p.data, expected.to_vec()),
            other => panic!("unexpected: {:?}", other),
        }
    }
    h.assert_silent();
}

#[tokio::test]
async fn test_pingreq_always_answered() {
    let mut h = harness();
    h.send(addr(5033), Message::PingReq(PingReq::default())).await;
    assert_eq!(h.recv().await.1, Message::PingResp);
}

#[tokio::test]
async fn test_pingreq_does_not_move_connected_session() {
    let mut h = harness();
    let home = addr(5052);
    let elsewhere = addr(5053);
    h.connect(home, "A").await;

    h.send(
        elsewhere,
        Message::PingReq(PingReq {
            client_id: Some("A".into()),
        }),
    )
    .await;
    assert_eq!(h.recv().await, (elsewhere, Message::PingResp));

    let session = h.gateway.registry().resolve(home).expect("session stays put");
    assert_eq!(session.state(), SessionState::Connected);
    assert!(h.gateway.registry().resolve(elsewhere).is_none());
    assert!(h.broker.log.lock().unwrap().disconnects.is_empty());
}

// -----------------------------------------------------------------------
// 7. Will and keep-alive
// -----------------------------------------------------------------------
#[tokio::test]
async fn test_will_handshake_and_publish_on_expiry() {
    let mut h = harness();
    let client = addr(5034);

    h.send(
        client,
        Message::Connect(Connect {
            flags: Flags {
                clean_session: true,
                will: true,
                ..Flags::default()
            },
            protocol_id: PROTOCOL_ID,
            duration: 1,
            client_id: "A".into(),
        }),
    )
    .await;
    assert_eq!(h.recv().await.1, Message::WillTopicReq);

    h.send(
        client,
        Message::WillTopic(WillTopic {
            qos: Qos::AtLeastOnce,
            retain: true,
            topic: "dev/status".into(),
        }),
    )
    .await;
    assert_eq!(h.recv().await.1, Message::WillMsgReq);

    h.send(client, Message::WillMsg(WillMsg { msg: b"offline".to_vec() }))
        .await;
    assert_eq!(h.recv().await.1, connack(ReturnCode::Accepted));

    // Not yet expired.
    assert_eq!(h.gateway.sweep(Instant::now()), 0);
    assert_eq!(h.gateway.sweep(Instant::now() + Duration::from_secs(2)), 1);
    assert!(h.gateway.registry().is_empty());

    let log = h.broker.log.lock().unwrap();
    assert_eq!(
        log.publishes,
        vec![BrokerPublish {
            client_id: "A".into(),
            topic: "dev/status".into(),
            qos: Qos::AtLeastOnce,
            retain: true,
            payload: b"offline".to_vec(),
        }]
    );
    assert_eq!(log.disconnects, vec!["A".to_string()]);
}

#[tokio::test]
async fn test_empty_will_topic_completes_connect() {
    let mut h = harness();
    let client = addr(5035);
    h.send(
        client,
        Message::Connect(Connect {
            flags: Flags {
                will: true,
                ..Flags::default()
            },
            protocol_id: PROTOCOL_ID,
            duration: 0,
            client_id: "A".into(),
        }),
    )
    .await;
    assert_eq!(h.recv().await.1, Message::WillTopicReq);
    h.send(client, Message::WillTopic(WillTopic::default())).await;
    assert_eq!(h.recv().await.1, connack(ReturnCode::Accepted));
    assert!(h.gateway.registry().resolve(client).unwrap().will().is_none());
}

#[tokio::test]
async fn test_will_updates() {
    let mut h = harness();
    let client = addr(5036);

    // No session yet.
    h.send(client, Message::WillTopicUpd(WillTopic::default())).await;
    assert_eq!(
        h.recv().await.1,
        Message::WillResp(WillResp {
            kind: WillRespKind::Topic,
            return_code: ReturnCode::NotSupported
        })
    );

    h.connect(client, "A").await;
    h.send(
        client,
        Message::WillTopicUpd(WillTopic {
            qos: Qos::AtMostOnce,
            retain: false,
            topic: "w".into(),
        }),
    )
    .await;
    assert_eq!(
        h.recv().await.1,
        Message::WillResp(WillResp {
            kind: WillRespKind::Topic,
            return_code: ReturnCode::Accepted
        })
    );
    h.send(client, Message::WillMsgUpd(WillMsg { msg: b"bye".to_vec() }))
        .await;
    assert_eq!(
        h.recv().await.1,
        Message::WillResp(WillResp {
            kind: WillRespKind::Msg,
            return_code: ReturnCode::Accepted
        })
    );
    let will = h.gateway.registry().resolve(client).unwrap().will().unwrap();
    assert_eq!(will.topic, "w");
    assert_eq!(will.message, b"bye".to_vec());
}

#[tokio::test]
async fn test_graceful_disconnect_discards_will() {
    let mut h = harness();
    let client = addr(5037);
    h.send(client, connect_msg("A", true, 1)).await;
    h.recv().await;
    h.send(
        client,
        Message::WillTopicUpd(WillTopic {
            qos: Qos::AtMostOnce,
            retain: false,
            topic: "w".into(),
        }),
    )
    .await;
    h.recv().await;

    h.send(client, Message::Disconnect(Disconnect { duration: Some(0) }))
        .await;
    h.recv().await;
    assert!(h.gateway.registry().is_empty());
    assert!(h.publishes().is_empty());
}

#[tokio::test]
async fn test_zero_keep_alive_never_expires() {
    let mut h = harness();
    h.connect(addr(5038), "A").await;
    assert_eq!(h.gateway.sweep(Instant::now() + Duration::from_secs(3600)), 0);
}

#[tokio::test]
async fn test_asleep_session_expires_after_sleep_duration() {
    let mut h = harness();
    let client = addr(5039);
    h.connect(client, "A").await;
    h.send(client, Message::Disconnect(Disconnect { duration: Some(10) }))
        .await;
    h.recv().await;
    assert_eq!(h.gateway.sweep(Instant::now() + Duration::from_secs(12)), 0);
    assert_eq!(h.gateway.sweep(Instant::now() + Duration::from_secs(16)), 1);
}

// -----------------------------------------------------------------------
// 8. Dispatch edge cases
// -----------------------------------------------------------------------
#[tokio::test]
async fn test_malformed_datagram_dropped() {
    let mut h = harness();
    assert!(h.dispatcher.dispatch(addr(5040), &[0x05, 0x04]).is_none());
    assert!(h.dispatcher.dispatch(addr(5040), &[]).is_none());
    assert!(h.dispatcher.dispatch(addr(5040), &[0x02, 0x99]).is_none());
    h.assert_silent();
}

#[tokio::test]
async fn test_searchgw_answered_with_gwinfo() {
    let mut config = fast_config();
    config.gateway.gateway_id = 9;
    let mut h = harness_with(config, AckMode::Accept);
    h.send(addr(5041), Message::SearchGw(SearchGw { radius: 1 })).await;
    assert_eq!(
        h.recv().await.1,
        Message::GwInfo(GwInfo {
            gw_id: 9,
            gw_addr: Vec::new()
        })
    );
}

#[tokio::test]
async fn test_gateway_frames_from_client_ignored() {
    let mut h = harness();
    h.send(addr(5042), Message::PingResp).await;
    h.send(addr(5042), connack(ReturnCode::Accepted)).await;
    h.assert_silent();
}

// -----------------------------------------------------------------------
// 9. Concurrency
// -----------------------------------------------------------------------
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients_keep_separate_topic_tables() {
    let h = harness();
    let mut tasks = Vec::new();
    for i in 0..16u16 {
        let dispatcher = Dispatcher::new(Arc::clone(&h.gateway));
        tasks.push(tokio::spawn(async move {
            let from = addr(6000 + i);
            let connect = encode(&connect_msg(&format!("c{}", i), true, 0)).unwrap();
            dispatcher.dispatch(from, &connect).unwrap().await.unwrap();
            let register = encode(&register_msg(&format!("t/{}", i), 1)).unwrap();
            dispatcher.dispatch(from, &register).unwrap().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(h.gateway.registry().len(), 16);
    for i in 0..16u16 {
        let session = h.gateway.registry().resolve(addr(6000 + i)).unwrap();
        assert_eq!(session.client_id(), format!("c{}", i));
        assert_eq!(session.registered_topic_count(), 1);
        assert_eq!(session.registered_name(1), Some(format!("t/{}", i)));
    }
}

#[test]
fn test_racing_connects_create_one_session() {
    let registry = Arc::new(SessionRegistry::new());
    let created = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..8u16)
        .map(|i| {
            let registry = Arc::clone(&registry);
            let created = Arc::clone(&created);
            std::thread::spawn(move || {
                let from = addr(7000 + i);
                registry.connect_or_reuse("same", from, false, || {
                    created.fetch_add(1, Ordering::SeqCst);
                    Arc::new(Session::new(
                        "same",
                        from,
                        TopicTable::new(),
                        Arc::new(NullBridge),
                        4,
                    ))
                });
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_registry_connect_at_taken_address_retires_previous() {
    let registry = SessionRegistry::new();
    let from = addr(7100);
    let make = |id: &str| {
        Arc::new(Session::new(id, from, TopicTable::new(), Arc::new(NullBridge), 4))
    };

    let first = registry.connect_or_reuse("A", from, true, || make("A"));
    assert!(first.created);
    assert!(first.retired.is_empty());

    let second = registry.connect_or_reuse("B", from, true, || make("B"));
    assert_eq!(second.retired.len(), 1);
    assert_eq!(second.retired[0].client_id(), "A");
    assert!(registry.find_by_client_id("A").is_none());
    assert_eq!(registry.resolve(from).unwrap().client_id(), "B");
}
