// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// BrokerBridge trait - bridges MQTT-SN sessions to an MQTT broker.
//
// Each session owns one bridge, i.e. one broker connection named after the
// client id. Calls never block: they hand back an `AckToken` that resolves
// when the broker acknowledges the operation.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::BrokerConfig;
use crate::protocol::Qos;

/// Failure of a broker operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("broker acknowledgment timed out")]
    Timeout,

    #[error("broker connection lost: {0}")]
    Connection(String),

    #[error("invalid topic for broker: {0}")]
    InvalidTopic(String),

    #[error("broker request queue full: {0}")]
    QueueFull(String),

    #[error("broker refused request: {0}")]
    Rejected(String),

    #[error("broker bridge closed")]
    Closed,
}

/// Completion handle for one broker operation.
#[derive(Debug)]
pub struct AckToken {
    rx: oneshot::Receiver<Result<(), BridgeError>>,
}

/// Resolving side of an `AckToken`.
#[derive(Debug)]
pub struct AckSender {
    tx: oneshot::Sender<Result<(), BridgeError>>,
}

impl AckSender {
    /// Complete the operation. The waiter may already be gone.
    pub fn resolve(self, result: Result<(), BridgeError>) {
        let _ = self.tx.send(result);
    }
}

impl AckToken {
    pub fn pending() -> (AckSender, AckToken) {
        let (tx, rx) = oneshot::channel();
        (AckSender { tx }, AckToken { rx })
    }

    /// A token that is already complete.
    pub fn ready(result: Result<(), BridgeError>) -> AckToken {
        let (tx, token) = Self::pending();
        tx.resolve(result);
        token
    }

    /// Wait at most `timeout` for the broker.
    pub async fn wait(self, timeout: Duration) -> Result<(), BridgeError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::Closed),
            Err(_) => Err(BridgeError::Timeout),
        }
    }
}

/// Receives broker messages for one subscription.
///
/// Implementations identify their session by client id and must not keep
/// the session alive; the registry owns sessions.
pub trait InboundHandler: Send + Sync {
    fn on_message(&self, topic: &str, payload: &[u8], qos: Qos);
}

/// One broker connection.
pub trait BrokerBridge: Send + Sync {
    /// Publish `payload` on `topic`. QoS -1 is sent as QoS 0.
    fn publish(&self, topic: &str, qos: Qos, retain: bool, payload: Vec<u8>) -> AckToken;

    /// Subscribe to `filter`; matching broker messages go to `handler`.
    fn subscribe(&self, filter: &str, qos: Qos, handler: Arc<dyn InboundHandler>) -> AckToken;

    fn unsubscribe(&self, filter: &str) -> AckToken;

    /// Close the connection. Pending operations fail with `Closed`.
    fn disconnect(&self);
}

/// Opens a broker connection for a new session.
pub trait BridgeConnector: Send + Sync {
    fn connect(&self, client_id: &str, broker: &BrokerConfig) -> Arc<dyn BrokerBridge>;
}

// ---------------------------------------------------------------------------
// Null bridge (for testing)
// ---------------------------------------------------------------------------

/// A bridge that acknowledges everything and never delivers. Useful for
/// protocol-level testing without a broker.
#[derive(Debug, Default)]
pub struct NullBridge;

impl BrokerBridge for NullBridge {
    fn publish(&self, _topic: &str, _qos: Qos, _retain: bool, _payload: Vec<u8>) -> AckToken {
        AckToken::ready(Ok(()))
    }

    fn subscribe(&self, _filter: &str, _qos: Qos, _handler: Arc<dyn InboundHandler>) -> AckToken {
        AckToken::ready(Ok(()))
    }

    fn unsubscribe(&self, _filter: &str) -> AckToken {
        AckToken::ready(Ok(()))
    }

    fn disconnect(&self) {}
}

/// Hands out `NullBridge`s.
#[derive(Debug, Default)]
pub struct NullConnector;

impl BridgeConnector for NullConnector {
    fn connect(&self, _client_id: &str, _broker: &BrokerConfig) -> Arc<dyn BrokerBridge> {
        Arc::new(NullBridge)
    }
}
