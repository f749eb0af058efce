// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway core.
//!
//! `Gateway` owns the session registry, the QoS flow table and the outbound
//! queue; message handlers live in `handlers` and broker-to-client delivery
//! in `delivery`. `GatewayServer` wires it to a UDP socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::bridge::{BridgeConnector, BridgeError};
use crate::config::{ConfigError, GatewayConfig, PredefinedTopics};
use crate::dispatcher::Dispatcher;
use crate::protocol::{CodecError, Message};
use crate::qos::{FlowController, RetryPolicy};
use crate::session::{Session, SessionRegistry};
use crate::topics::TopicTable;
use crate::transport::{Datagram, Outbound, UdpTransport};

/// Gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Broker bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Cannot resolve listen address {0}")]
    Resolve(String),
}

/// Shared gateway state. Handlers run as independent tasks against an
/// `Arc<Gateway>`.
pub struct Gateway {
    config: GatewayConfig,
    predefined: PredefinedTopics,
    retry: RetryPolicy,
    registry: SessionRegistry,
    flow: FlowController,
    connector: Arc<dyn BridgeConnector>,
    outbound: Outbound,
    running: AtomicBool,
    this: Weak<Gateway>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        connector: Arc<dyn BridgeConnector>,
        outbound: Outbound,
    ) -> Result<Arc<Self>, GatewayError> {
        config.validate()?;
        let predefined = config.predefined_topics();
        let retry = config.qos.retry_policy();
        Ok(Arc::new_cyclic(|this| Self {
            config,
            predefined,
            retry,
            registry: SessionRegistry::new(),
            flow: FlowController::new(),
            connector,
            outbound,
            running: AtomicBool::new(true),
            this: this.clone(),
        }))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn flow(&self) -> &FlowController {
        &self.flow
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub(crate) fn weak(&self) -> Weak<Gateway> {
        self.this.clone()
    }

    pub(crate) fn send(&self, addr: SocketAddr, msg: Message) {
        self.outbound.send(addr, &msg);
    }

    /// Build a session for a CONNECT: predefined topics for the client id
    /// (none is fine) and a fresh broker connection.
    pub(crate) fn create_session(&self, client_id: &str, addr: SocketAddr) -> Arc<Session> {
        let topics = match self.predefined.get(client_id) {
            Some(ids) => TopicTable::with_predefined(ids),
            None => TopicTable::new(),
        };
        let bridge = self.connector.connect(client_id, &self.config.broker);
        tracing::info!("New MQTT-SN session {} at {}", client_id, addr);
        Arc::new(Session::new(
            client_id,
            addr,
            topics,
            bridge,
            self.config.sessions.sleep_buffer_capacity,
        ))
    }

    /// Close the broker connection of a session that left the registry.
    /// `clear_flow` drops its in-flight QoS exchanges as well.
    pub(crate) fn retire(&self, session: &Arc<Session>, clear_flow: bool) {
        session.bridge().disconnect();
        if clear_flow {
            let cleared = self.flow.clear_session(session.id());
            if cleared > 0 {
                tracing::debug!(
                    "Cleared {} in-flight exchanges of {}",
                    cleared,
                    session.client_id()
                );
            }
        }
    }

    /// Evict sessions whose keep-alive or sleep period ran out, publishing
    /// their wills. Returns the number evicted.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired = self.registry.evict_expired(now);
        for session in &expired {
            tracing::info!(
                "Session {} at {} expired ({:?})",
                session.client_id(),
                session.addr(),
                session.state()
            );
            if let Some(will) = session.take_will() {
                tracing::debug!("Publishing will of {} on {}", session.client_id(), will.topic);
                // Queued ahead of the disconnect below.
                drop(
                    session
                        .bridge()
                        .publish(&will.topic, will.qos, will.retain, will.message),
                );
            }
            self.retire(session, true);
        }
        expired.len()
    }

    /// Stop housekeeping and close every broker connection.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        let sessions = self.registry.drain();
        tracing::info!("Shutting down, closing {} sessions", sessions.len());
        for session in &sessions {
            session.mark_disconnected();
            self.retire(session, true);
        }
    }
}

/// Periodic session sweep until the gateway stops.
pub async fn run_housekeeping(gateway: Arc<Gateway>) {
    let period = Duration::from_millis(gateway.config.sessions.housekeeping_interval_ms);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if !gateway.is_running() {
            break;
        }
        gateway.sweep(Instant::now());
    }
    tracing::debug!("Housekeeping stopped");
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A gateway bound to its UDP socket.
pub struct GatewayServer {
    gateway: Arc<Gateway>,
    transport: UdpTransport,
    outbound_rx: mpsc::UnboundedReceiver<Datagram>,
}

impl GatewayServer {
    pub async fn bind(
        config: GatewayConfig,
        connector: Arc<dyn BridgeConnector>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let listen = config.listen_addr();
        let addr = tokio::net::lookup_host(listen.as_str())
            .await?
            .next()
            .ok_or_else(|| GatewayError::Resolve(config.listen_addr()))?;
        let transport = UdpTransport::bind(addr, config.gateway.max_datagram_size)?;
        let (outbound, outbound_rx) = Outbound::channel();
        let gateway = Gateway::new(config, connector, outbound)?;
        Ok(Self {
            gateway,
            transport,
            outbound_rx,
        })
    }

    pub fn gateway(&self) -> Arc<Gateway> {
        Arc::clone(&self.gateway)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.transport.local_addr()?)
    }

    /// Serve until the task is dropped.
    pub async fn run(self) -> Result<(), GatewayError> {
        let Self {
            gateway,
            transport,
            outbound_rx,
        } = self;

        tracing::info!(
            "MQTT-SN gateway {} listening on {}, broker {}:{}",
            gateway.config.gateway.gateway_id,
            transport.local_addr()?,
            gateway.config.broker.host,
            gateway.config.broker.port
        );

        tokio::spawn(transport.clone().run_writer(outbound_rx));
        tokio::spawn(run_housekeeping(Arc::clone(&gateway)));

        let dispatcher = Dispatcher::new(gateway);
        transport
            .run_reader(|from, datagram| {
                dispatcher.dispatch(from, datagram);
            })
            .await;
        Ok(())
    }
}
