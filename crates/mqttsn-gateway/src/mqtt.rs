// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rumqttc-backed broker bridge.
//!
//! Every session gets its own `AsyncClient` and a spawned task polling the
//! matching `EventLoop`. Acknowledgment tokens are correlated with broker
//! acks through the packet ids rumqttc reports in `Event::Outgoing`:
//!
//! ```text
//!  publish()  --try_publish-->  queued (FIFO)  --Outgoing::Publish(pkid)-->  inflight[pkid]
//!                                                          Incoming::PubAck/PubComp(pkid) --> resolve
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode,
};

use crate::bridge::{AckSender, AckToken, BridgeConnector, BridgeError, BrokerBridge, InboundHandler};
use crate::config::BrokerConfig;
use crate::protocol::Qos;
use crate::topics::filter_matches;

/// rumqttc rejects keep-alive periods below this.
const MIN_KEEP_ALIVE_SECS: u64 = 5;

const RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

fn to_mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce | Qos::Connectionless => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn from_mqtt_qos(qos: QoS) -> Qos {
    match qos {
        QoS::AtMostOnce => Qos::AtMostOnce,
        QoS::AtLeastOnce => Qos::AtLeastOnce,
        QoS::ExactlyOnce => Qos::ExactlyOnce,
    }
}

/// Reconnect delay after `attempt` consecutive event loop failures.
fn reconnect_delay(attempt: u32) -> Duration {
    RECONNECT_INITIAL
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(RECONNECT_MAX)
}

// ---------------------------------------------------------------------------
// Correlation state
// ---------------------------------------------------------------------------

struct Subscription {
    filter: String,
    qos: QoS,
    handler: Arc<dyn InboundHandler>,
}

#[derive(Default)]
struct Correlation {
    // Requests handed to rumqttc, not yet assigned a packet id. `None`
    // marks requests nobody waits for (resubscribe after reconnect).
    queued_publishes: VecDeque<(QoS, AckSender)>,
    queued_subscribes: VecDeque<Option<AckSender>>,
    queued_unsubscribes: VecDeque<AckSender>,

    inflight_publishes: HashMap<u16, AckSender>,
    inflight_subscribes: HashMap<u16, AckSender>,
    inflight_unsubscribes: HashMap<u16, AckSender>,

    // Packet ids rumqttc retransmits after a reconnect, until the broker acks
    // them. Their outgoing events belong to requests already failed.
    replayed_publishes: HashSet<u16>,

    subscriptions: Vec<Subscription>,
}

impl Correlation {
    /// The connection dropped: fail everything in flight and remember which
    /// publishes rumqttc will replay.
    fn connection_lost(&mut self, error: &BridgeError) {
        self.replayed_publishes
            .extend(self.inflight_publishes.keys().copied());
        self.fail_inflight(error);
    }

    fn fail_inflight(&mut self, error: &BridgeError) {
        for (_, tx) in self.inflight_publishes.drain() {
            tx.resolve(Err(error.clone()));
        }
        for (_, tx) in self.inflight_subscribes.drain() {
            tx.resolve(Err(error.clone()));
        }
        for (_, tx) in self.inflight_unsubscribes.drain() {
            tx.resolve(Err(error.clone()));
        }
    }
}

struct Shared {
    client_id: String,
    correlation: Mutex<Correlation>,
    closed: AtomicBool,
    // Set when the connection dropped; the next CONNACK restores subscriptions.
    lost: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Correlation> {
        self.correlation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn handle_event(&self, client: &AsyncClient, event: Event) {
        match event {
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                let mut state = self.lock();
                if state.replayed_publishes.contains(&pkid) {
                    tracing::debug!("[{}] replayed publish {}", self.client_id, pkid);
                    return;
                }
                if let Some((qos, tx)) = state.queued_publishes.pop_front() {
                    if qos == QoS::AtMostOnce {
                        tx.resolve(Ok(()));
                    } else {
                        state.inflight_publishes.insert(pkid, tx);
                    }
                }
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                let mut state = self.lock();
                if let Some(Some(tx)) = state.queued_subscribes.pop_front() {
                    state.inflight_subscribes.insert(pkid, tx);
                }
            }
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                let mut state = self.lock();
                if let Some(tx) = state.queued_unsubscribes.pop_front() {
                    state.inflight_unsubscribes.insert(pkid, tx);
                }
            }
            Event::Outgoing(outgoing) => {
                tracing::trace!("[{}] outgoing {:?}", self.client_id, outgoing);
            }
            Event::Incoming(packet) => self.handle_incoming(client, packet),
        }
    }

    fn handle_incoming(&self, client: &AsyncClient, packet: Packet) {
        match packet {
            Packet::PubAck(ack) => self.resolve_publish(ack.pkid),
            Packet::PubComp(comp) => self.resolve_publish(comp.pkid),
            Packet::SubAck(ack) => {
                let refused = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                if let Some(tx) = self.lock().inflight_subscribes.remove(&ack.pkid) {
                    if refused {
                        tx.resolve(Err(BridgeError::Rejected("subscription refused".into())));
                    } else {
                        tx.resolve(Ok(()));
                    }
                }
            }
            Packet::UnsubAck(ack) => {
                if let Some(tx) = self.lock().inflight_unsubscribes.remove(&ack.pkid) {
                    tx.resolve(Ok(()));
                }
            }
            Packet::Publish(publish) => {
                let handler = self
                    .lock()
                    .subscriptions
                    .iter()
                    .find(|s| filter_matches(&s.filter, &publish.topic))
                    .map(|s| Arc::clone(&s.handler));
                match handler {
                    Some(handler) => {
                        handler.on_message(&publish.topic, &publish.payload, from_mqtt_qos(publish.qos))
                    }
                    None => tracing::debug!(
                        "[{}] no subscription matches {}, dropping",
                        self.client_id,
                        publish.topic
                    ),
                }
            }
            Packet::ConnAck(conn_ack) => {
                if conn_ack.code == ConnectReturnCode::Success {
                    tracing::info!("[{}] broker connection established", self.client_id);
                    if self.lost.swap(false, Ordering::AcqRel) && !conn_ack.session_present {
                        self.resubscribe(client);
                    }
                } else {
                    tracing::warn!(
                        "[{}] broker refused connection: {:?}",
                        self.client_id,
                        conn_ack.code
                    );
                }
            }
            Packet::Disconnect => {
                tracing::warn!("[{}] disconnected by broker", self.client_id);
            }
            other => tracing::trace!("[{}] incoming {:?}", self.client_id, other),
        }
    }

    fn resolve_publish(&self, pkid: u16) {
        let mut state = self.lock();
        if state.replayed_publishes.remove(&pkid) {
            return;
        }
        if let Some(tx) = state.inflight_publishes.remove(&pkid) {
            tx.resolve(Ok(()));
        }
    }

    /// Restore subscriptions after the broker dropped our session.
    fn resubscribe(&self, client: &AsyncClient) {
        let mut state = self.lock();
        let filters: Vec<(String, QoS)> = state
            .subscriptions
            .iter()
            .map(|s| (s.filter.clone(), s.qos))
            .collect();
        for (filter, qos) in filters {
            match client.try_subscribe(filter.clone(), qos) {
                Ok(()) => state.queued_subscribes.push_back(None),
                Err(e) => tracing::warn!(
                    "[{}] resubscribe to {} failed: {}",
                    self.client_id,
                    filter,
                    e
                ),
            }
        }
    }
}

async fn run_event_loop(mut eventloop: EventLoop, shared: Arc<Shared>, client: AsyncClient) {
    let mut failures = 0u32;
    loop {
        match eventloop.poll().await {
            Ok(event) => {
                failures = 0;
                shared.handle_event(&client, event);
            }
            Err(ConnectionError::RequestsDone) => {
                tracing::debug!("[{}] bridge dropped, event loop done", shared.client_id);
                break;
            }
            Err(e) => {
                if shared.is_closed() {
                    tracing::debug!("[{}] event loop stopped: {}", shared.client_id, e);
                    break;
                }
                shared.lost.store(true, Ordering::Release);
                shared
                    .lock()
                    .connection_lost(&BridgeError::Connection(e.to_string()));
                let delay = reconnect_delay(failures);
                failures = failures.saturating_add(1);
                tracing::warn!(
                    "[{}] broker connection error, reconnecting in {:.2}s: {}",
                    shared.client_id,
                    delay.as_secs_f64(),
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// One MQTT connection to the broker.
pub struct MqttBridge {
    client: AsyncClient,
    shared: Arc<Shared>,
}

impl MqttBridge {
    /// Open a connection for `client_id`. Must be called inside a tokio runtime.
    pub fn connect(client_id: &str, broker: &BrokerConfig) -> Self {
        let mqtt_id = format!("{}{}", broker.client_id_prefix, client_id);
        let mut options = MqttOptions::new(mqtt_id, broker.host.clone(), broker.port);
        options.set_keep_alive(Duration::from_secs(
            broker.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS),
        ));
        options.set_clean_session(true);
        if let Some(username) = &broker.username {
            options.set_credentials(username.clone(), broker.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, broker.channel_capacity.max(1));
        let shared = Arc::new(Shared {
            client_id: client_id.to_string(),
            correlation: Mutex::new(Correlation::default()),
            closed: AtomicBool::new(false),
            lost: AtomicBool::new(false),
        });
        tokio::spawn(run_event_loop(eventloop, Arc::clone(&shared), client.clone()));

        tracing::debug!(
            "[{}] opening broker connection to {}:{}",
            client_id,
            broker.host,
            broker.port
        );
        Self { client, shared }
    }
}

impl BrokerBridge for MqttBridge {
    fn publish(&self, topic: &str, qos: Qos, retain: bool, payload: Vec<u8>) -> AckToken {
        if self.shared.is_closed() {
            return AckToken::ready(Err(BridgeError::Closed));
        }
        if topic.is_empty() || topic.contains(['+', '#']) {
            return AckToken::ready(Err(BridgeError::InvalidTopic(topic.to_string())));
        }
        let qos = to_mqtt_qos(qos);
        let (tx, token) = AckToken::pending();
        // Queue under the lock so the event loop cannot see the outgoing
        // packet before its sender is in place.
        let mut state = self.shared.lock();
        match self.client.try_publish(topic, qos, retain, payload) {
            Ok(()) => state.queued_publishes.push_back((qos, tx)),
            Err(e) => tx.resolve(Err(BridgeError::QueueFull(e.to_string()))),
        }
        token
    }

    fn subscribe(&self, filter: &str, qos: Qos, handler: Arc<dyn InboundHandler>) -> AckToken {
        if self.shared.is_closed() {
            return AckToken::ready(Err(BridgeError::Closed));
        }
        let qos = to_mqtt_qos(qos);
        let (tx, token) = AckToken::pending();
        let mut state = self.shared.lock();
        state.subscriptions.retain(|s| s.filter != filter);
        state.subscriptions.push(Subscription {
            filter: filter.to_string(),
            qos,
            handler,
        });
        match self.client.try_subscribe(filter, qos) {
            Ok(()) => state.queued_subscribes.push_back(Some(tx)),
            Err(e) => {
                state.subscriptions.retain(|s| s.filter != filter);
                tx.resolve(Err(BridgeError::QueueFull(e.to_string())));
            }
        }
        token
    }

    fn unsubscribe(&self, filter: &str) -> AckToken {
        if self.shared.is_closed() {
            return AckToken::ready(Err(BridgeError::Closed));
        }
        let (tx, token) = AckToken::pending();
        let mut state = self.shared.lock();
        state.subscriptions.retain(|s| s.filter != filter);
        match self.client.try_unsubscribe(filter) {
            Ok(()) => state.queued_unsubscribes.push_back(tx),
            Err(e) => tx.resolve(Err(BridgeError::QueueFull(e.to_string()))),
        }
        token
    }

    fn disconnect(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.shared.lock();
        state.subscriptions.clear();
        state.fail_inflight(&BridgeError::Closed);
        for (_, tx) in state.queued_publishes.drain(..) {
            tx.resolve(Err(BridgeError::Closed));
        }
        for tx in state.queued_subscribes.drain(..).flatten() {
            tx.resolve(Err(BridgeError::Closed));
        }
        for tx in state.queued_unsubscribes.drain(..) {
            tx.resolve(Err(BridgeError::Closed));
        }
        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!("[{}] disconnect request failed: {}", self.shared.client_id, e);
        }
    }
}

/// Opens one `MqttBridge` per session.
#[derive(Debug, Default)]
pub struct MqttConnector;

impl BridgeConnector for MqttConnector {
    fn connect(&self, client_id: &str, broker: &BrokerConfig) -> Arc<dyn BrokerBridge> {
        Arc::new(MqttBridge::connect(client_id, broker))
    }
}
