// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT-SN v1.2 transparent gateway.
//!
//! Bridges MQTT-SN clients (sensors, MCUs, anything speaking UDP) to a
//! standard MQTT broker. Every MQTT-SN session gets its own broker
//! connection; topics are translated between the 16-bit MQTT-SN ids and
//! full MQTT topic names per session.
//!
//! # Architecture
//!
//! ```text
//! MQTT-SN Client (UDP)             Gateway (this crate)              MQTT Broker
//!        |                                |                               |
//!        |--- CONNECT ------------------->|--- MQTT CONNECT (per client) ->|
//!        |<-- CONNACK --------------------|                               |
//!        |--- REGISTER("room/temp") ----->|                               |
//!        |<-- REGACK(id=1) ---------------|                               |
//!        |--- PUBLISH(id=1, qos 1) ------>|--- PUBLISH room/temp -------->|
//!        |<-- PUBACK ---------------------|<-- PUBACK ---------------------|
//!        |--- SUBSCRIBE("a/+") ---------->|--- SUBSCRIBE a/+ ------------>|
//!        |<-- REGISTER(id=2, "a/b") ------|<-- PUBLISH a/b ---------------|
//!        |<-- PUBLISH(id=2) --------------|                               |
//! ```
//!
//! # Key Features
//!
//! - **Topic namespaces**: registered, predefined (from configuration) and
//!   two-character short names
//! - **QoS 0/1/2** in both directions, with bounded retries
//! - **Sleeping clients**: broker messages are buffered and flushed on wake
//! - **Wills**: stored at CONNECT, published when a session expires
//! - **Broker-agnostic core**: the broker side sits behind [`BrokerBridge`];
//!   [`MqttConnector`] is the rumqttc implementation

pub mod bridge;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod gateway;
pub mod handlers;
pub mod mqtt;
pub mod protocol;
pub mod qos;
pub mod session;
pub mod topics;
pub mod transport;

// Re-exports for convenience.
pub use bridge::{
    AckSender, AckToken, BridgeConnector, BridgeError, BrokerBridge, InboundHandler, NullBridge,
    NullConnector,
};
pub use config::{
    BrokerConfig, ConfigError, GatewayConfig, ListenConfig, PredefinedTopic, PredefinedTopics,
    QosConfig, SessionConfig,
};
pub use dispatcher::Dispatcher;
pub use gateway::{Gateway, GatewayError, GatewayServer};
pub use mqtt::{MqttBridge, MqttConnector};
pub use protocol::{decode, encode, CodecError, Flags, Message, Qos, ReturnCode, TopicIdType};
pub use qos::{FlowController, RetryPolicy};
pub use session::{Session, SessionRegistry, SessionState};
pub use topics::{TopicError, TopicTable};
pub use transport::{Datagram, Outbound, UdpTransport};

#[cfg(test)]
mod tests;
