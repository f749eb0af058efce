// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! QoS flow control.
//!
//! Tracks in-flight QoS 1/2 exchanges per `(session, message id,
//! direction)` and drives the broker side of uplink publishes.
//!
//! ```text
//!  uplink QoS 1   PUBLISH -> [AwaitBrokerAck] -> PUBACK
//!  uplink QoS 2   PUBLISH -> [AwaitPubRel] -> PUBREC .. PUBREL -> [AwaitBrokerAck] -> PUBCOMP
//!  downlink QoS 1 PUBLISH -> [AwaitPubAck]
//!  downlink QoS 2 PUBLISH -> [AwaitPubRec] -> PUBREL -> [AwaitPubComp]
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::bridge::{BridgeError, BrokerBridge};
use crate::protocol::{Qos, ReturnCode};
use crate::session::SessionId;

/// Buffered client acks per downlink exchange.
const DOWNLINK_ACK_CAPACITY: usize = 4;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for acknowledgment waits.
///
/// Attempt `n` (starting at 0) waits `min(ack_timeout * multiplier^n, max_timeout)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub ack_timeout: Duration,
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub max_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            max_retries: 3,
            backoff_multiplier: 2.0,
            max_timeout: Duration::from_secs(16),
        }
    }
}

impl RetryPolicy {
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .max(1.0)
            .powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.ack_timeout.as_millis() as f64 * factor;
        // f64 -> u64 casts saturate.
        Duration::from_millis(millis as u64).min(self.max_timeout)
    }

    /// Total number of attempts, first try included.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Publish to the broker, retrying on failure with growing timeouts.
///
/// Invalid-topic failures are final and returned immediately.
pub async fn publish_with_retry(
    bridge: &dyn BrokerBridge,
    topic: &str,
    qos: Qos,
    payload: &[u8],
    policy: &RetryPolicy,
) -> Result<(), BridgeError> {
    let mut last_error = BridgeError::Timeout;
    for attempt in 0..policy.attempts() {
        let timeout = policy.timeout_for(attempt);
        let started = tokio::time::Instant::now();
        match bridge
            .publish(topic, qos, false, payload.to_vec())
            .wait(timeout)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e @ BridgeError::InvalidTopic(_)) => return Err(e),
            Err(e) => {
                tracing::debug!(
                    "Broker publish to {} failed (attempt {}/{}): {}",
                    topic,
                    attempt + 1,
                    policy.attempts(),
                    e
                );
                last_error = e;
                // Fast failures still wait out the attempt window.
                if attempt + 1 < policy.attempts() {
                    tokio::time::sleep_until(started + timeout).await;
                }
            }
        }
    }
    tracing::warn!(
        "Giving up broker publish to {} after {} attempts: {}",
        topic,
        policy.attempts(),
        last_error
    );
    Err(last_error)
}

/// MQTT-SN return code reported to a client for a broker outcome.
pub fn return_code_for(result: &Result<(), BridgeError>) -> ReturnCode {
    match result {
        Ok(()) => ReturnCode::Accepted,
        Err(BridgeError::InvalidTopic(_)) => ReturnCode::InvalidTopicId,
        Err(_) => ReturnCode::Congestion,
    }
}

// ---------------------------------------------------------------------------
// Pending exchange table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client -> broker.
    Uplink,
    /// Broker -> client.
    Downlink,
}

/// What an in-flight exchange is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosStep {
    AwaitBrokerAck,
    AwaitPubRel,
    AwaitPubAck,
    AwaitPubRec,
    AwaitPubComp,
}

/// Client acknowledgment of a downlink publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkAck {
    PubAck(ReturnCode),
    PubRec,
    PubComp,
}

impl QosStep {
    /// Whether `ack` completes this step. A PUBACK during a QoS 2 exchange
    /// is the client's rejection.
    pub fn accepts(self, ack: &DownlinkAck) -> bool {
        matches!(
            (self, ack),
            (QosStep::AwaitPubAck, DownlinkAck::PubAck(_))
                | (QosStep::AwaitPubRec, DownlinkAck::PubRec)
                | (QosStep::AwaitPubRec, DownlinkAck::PubAck(_))
                | (QosStep::AwaitPubComp, DownlinkAck::PubComp)
        )
    }
}

/// Uplink QoS 2 publish held until PUBREL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldPublish {
    pub topic_id: u16,
    pub topic_name: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    session: SessionId,
    msg_id: u16,
    direction: Direction,
}

impl PendingKey {
    fn new(session: SessionId, msg_id: u16, direction: Direction) -> Self {
        Self {
            session,
            msg_id,
            direction,
        }
    }
}

#[derive(Debug)]
struct PendingEntry {
    topic_id: u16,
    step: QosStep,
    held: Option<HeldPublish>,
    acks: Option<mpsc::Sender<DownlinkAck>>,
}

/// In-flight QoS exchanges across all sessions.
#[derive(Debug, Default)]
pub struct FlowController {
    pending: Mutex<HashMap<PendingKey, PendingEntry>>,
}

impl FlowController {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PendingKey, PendingEntry>> {
        self.pending.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("QoS flow table lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Start an uplink QoS 1 exchange. Returns false if one with the same
    /// message id is still in flight (a DUP retransmission).
    pub fn begin_uplink(&self, session: SessionId, msg_id: u16, topic_id: u16) -> bool {
        let mut pending = self.lock();
        let key = PendingKey::new(session, msg_id, Direction::Uplink);
        if pending.contains_key(&key) {
            return false;
        }
        pending.insert(
            key,
            PendingEntry {
                topic_id,
                step: QosStep::AwaitBrokerAck,
                held: None,
                acks: None,
            },
        );
        true
    }

    /// Hold an uplink QoS 2 publish until PUBREL. Returns false if the
    /// message id is already held or being forwarded.
    pub fn hold(&self, session: SessionId, msg_id: u16, publish: HeldPublish) -> bool {
        let mut pending = self.lock();
        let key = PendingKey::new(session, msg_id, Direction::Uplink);
        if pending.contains_key(&key) {
            return false;
        }
        pending.insert(
            key,
            PendingEntry {
                topic_id: publish.topic_id,
                step: QosStep::AwaitPubRel,
                held: Some(publish),
                acks: None,
            },
        );
        true
    }

    /// PUBREL: take the held publish for forwarding. `None` when nothing is
    /// held under this id (unknown or already being forwarded).
    pub fn release(&self, session: SessionId, msg_id: u16) -> Option<HeldPublish> {
        let mut pending = self.lock();
        let entry = pending.get_mut(&PendingKey::new(session, msg_id, Direction::Uplink))?;
        if entry.step != QosStep::AwaitPubRel {
            return None;
        }
        entry.step = QosStep::AwaitBrokerAck;
        entry.held.take()
    }

    pub fn finish_uplink(&self, session: SessionId, msg_id: u16) {
        self.lock()
            .remove(&PendingKey::new(session, msg_id, Direction::Uplink));
    }

    /// Start a downlink exchange; client acks arrive on the returned channel.
    pub fn begin_downlink(
        &self,
        session: SessionId,
        msg_id: u16,
        topic_id: u16,
        step: QosStep,
    ) -> mpsc::Receiver<DownlinkAck> {
        let (tx, rx) = mpsc::channel(DOWNLINK_ACK_CAPACITY);
        self.lock().insert(
            PendingKey::new(session, msg_id, Direction::Downlink),
            PendingEntry {
                topic_id,
                step,
                held: None,
                acks: Some(tx),
            },
        );
        rx
    }

    pub fn advance_downlink(&self, session: SessionId, msg_id: u16, step: QosStep) {
        if let Some(entry) = self
            .lock()
            .get_mut(&PendingKey::new(session, msg_id, Direction::Downlink))
        {
            entry.step = step;
        }
    }

    /// Route a client ack to its downlink exchange. Returns false if no
    /// exchange is waiting for it.
    pub fn acknowledge(&self, session: SessionId, msg_id: u16, ack: DownlinkAck) -> bool {
        let pending = self.lock();
        let Some(entry) = pending.get(&PendingKey::new(session, msg_id, Direction::Downlink))
        else {
            return false;
        };
        if !entry.step.accepts(&ack) {
            return false;
        }
        match &entry.acks {
            Some(tx) => tx.try_send(ack).is_ok(),
            None => false,
        }
    }

    pub fn finish_downlink(&self, session: SessionId, msg_id: u16) {
        self.lock()
            .remove(&PendingKey::new(session, msg_id, Direction::Downlink));
    }

    /// Drop every exchange of `session`. Waiting downlink deliveries see
    /// their ack channel close.
    pub fn clear_session(&self, session: SessionId) -> usize {
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|key, _| key.session != session);
        before - pending.len()
    }

    pub fn step(&self, session: SessionId, msg_id: u16, direction: Direction) -> Option<QosStep> {
        self.lock()
            .get(&PendingKey::new(session, msg_id, direction))
            .map(|e| e.step)
    }

    pub fn topic_id(&self, session: SessionId, msg_id: u16, direction: Direction) -> Option<u16> {
        self.lock()
            .get(&PendingKey::new(session, msg_id, direction))
            .map(|e| e.topic_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
