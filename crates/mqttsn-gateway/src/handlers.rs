// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Per-message handlers.
//
// Every client frame type has one handler here. Handlers that need a session
// resolve it by source address and drop the frame when there is none; no
// handler holds a registry or session lock across an await.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::gateway::Gateway;
use crate::protocol::{
    short_name_from_id, ConnAck, Connect, Disconnect, Flags, GwInfo, Message, PingReq, PubAck,
    PubFlow, PubFlowKind, Publish, Qos, RegAck, Register, ReturnCode, SearchGw, SubAck,
    Subscription, TopicIdType, TopicRef, UnsubAck, WillMsg, WillResp, WillRespKind, WillTopic,
};
use crate::qos::{publish_with_retry, return_code_for, DownlinkAck, HeldPublish};
use crate::session::{ConnectPhase, DeliveryTopic, Session, SessionState};
use crate::topics::{is_wildcarded, TopicError};

impl Gateway {
    /// Session at `from`, refreshed for keep-alive. Logs when missing.
    fn session_for(&self, from: SocketAddr, frame: &str) -> Option<Arc<Session>> {
        match self.registry().resolve(from) {
            Some(session) => {
                session.touch();
                Some(session)
            }
            None => {
                tracing::warn!("{} from {} without a session, dropping", frame, from);
                None
            }
        }
    }

    /// Send `msg` to the session's current address unless the session has
    /// left the registry meanwhile.
    pub(crate) fn reply_to(&self, session: &Arc<Session>, msg: Message) {
        if self.registry().is_current(session) {
            self.send(session.addr(), msg);
        } else {
            tracing::debug!(
                "Session {} vanished, dropping {:?}",
                session.client_id(),
                msg.msg_type()
            );
        }
    }

    fn broker_timeout(&self) -> Duration {
        self.retry_policy().timeout_for(0)
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    pub fn handle_searchgw(&self, from: SocketAddr, m: SearchGw) {
        tracing::debug!("SEARCHGW (radius {}) from {}", m.radius, from);
        self.send(
            from,
            Message::GwInfo(GwInfo {
                gw_id: self.config().gateway.gateway_id,
                gw_addr: Vec::new(),
            }),
        );
    }

    // -----------------------------------------------------------------------
    // Connection
    // -----------------------------------------------------------------------

    pub fn handle_connect(&self, from: SocketAddr, m: Connect) {
        if m.client_id.is_empty() {
            tracing::warn!("CONNECT from {} without client id, rejecting", from);
            self.send(
                from,
                Message::ConnAck(ConnAck {
                    return_code: ReturnCode::NotSupported,
                }),
            );
            return;
        }

        let outcome = self.registry().connect_or_reuse(
            &m.client_id,
            from,
            m.flags.clean_session,
            || self.create_session(&m.client_id, from),
        );
        for old in &outcome.retired {
            tracing::info!(
                "Retiring session {} replaced by CONNECT of {} from {}",
                old.client_id(),
                m.client_id,
                from
            );
            old.mark_disconnected();
            self.retire(old, true);
        }

        let session = outcome.session;
        if !outcome.created {
            tracing::info!("Resuming session {} at {}", m.client_id, from);
        }
        session.on_connect(m.duration);

        if m.flags.will {
            session.begin_will_handshake();
            self.send(from, Message::WillTopicReq);
            return;
        }
        self.complete_connect(&session, from);
    }

    /// CONNACK, then anything buffered while the client slept.
    fn complete_connect(&self, session: &Arc<Session>, from: SocketAddr) {
        self.send(
            from,
            Message::ConnAck(ConnAck {
                return_code: ReturnCode::Accepted,
            }),
        );
        let buffered = session.wake();
        if !buffered.is_empty() {
            tracing::info!(
                "Delivering {} buffered messages to {}",
                buffered.len(),
                session.client_id()
            );
            self.flush(session, buffered);
        }
    }

    pub fn handle_willtopic(&self, from: SocketAddr, m: WillTopic) {
        let Some(session) = self.session_for(from, "WILLTOPIC") else {
            return;
        };
        match session.accept_will_topic(m) {
            Some(ConnectPhase::AwaitingWillMsg) => self.send(from, Message::WillMsgReq),
            Some(ConnectPhase::Complete) => self.complete_connect(&session, from),
            Some(ConnectPhase::AwaitingWillTopic) | None => {
                tracing::warn!("Unexpected WILLTOPIC from {}, ignoring", from)
            }
        }
    }

    pub fn handle_willmsg(&self, from: SocketAddr, m: WillMsg) {
        let Some(session) = self.session_for(from, "WILLMSG") else {
            return;
        };
        if session.accept_will_msg(m.msg) {
            tracing::debug!("Will stored for {}", session.client_id());
            self.complete_connect(&session, from);
        } else {
            tracing::warn!("Unexpected WILLMSG from {}, ignoring", from);
        }
    }

    pub fn handle_willtopicupd(&self, from: SocketAddr, m: WillTopic) {
        let return_code = match self.session_for(from, "WILLTOPICUPD") {
            Some(session) => {
                session.update_will_topic(m);
                ReturnCode::Accepted
            }
            None => ReturnCode::NotSupported,
        };
        self.send(
            from,
            Message::WillResp(WillResp {
                kind: WillRespKind::Topic,
                return_code,
            }),
        );
    }

    pub fn handle_willmsgupd(&self, from: SocketAddr, m: WillMsg) {
        let return_code = match self.session_for(from, "WILLMSGUPD") {
            Some(session) if session.update_will_msg(m.msg) => ReturnCode::Accepted,
            Some(session) => {
                tracing::warn!("WILLMSGUPD from {} without a will topic", session.client_id());
                ReturnCode::NotSupported
            }
            None => ReturnCode::NotSupported,
        };
        self.send(
            from,
            Message::WillResp(WillResp {
                kind: WillRespKind::Msg,
                return_code,
            }),
        );
    }

    pub fn handle_pingreq(&self, from: SocketAddr, m: PingReq) {
        let session = match &m.client_id {
            Some(client_id) => match self.registry().relocate(client_id, from) {
                Some((session, displaced)) => {
                    for old in &displaced {
                        old.mark_disconnected();
                        self.retire(old, true);
                    }
                    Some(session)
                }
                None => {
                    tracing::warn!(
                        "PINGREQ for {} from {}: no asleep session to wake there",
                        client_id,
                        from
                    );
                    None
                }
            },
            None => self.registry().resolve(from),
        };

        if let Some(session) = session {
            session.touch();
            if session.state() == SessionState::Asleep {
                let buffered = session.wake();
                tracing::info!(
                    "Session {} awake at {}, {} buffered messages",
                    session.client_id(),
                    from,
                    buffered.len()
                );
                self.flush(&session, buffered);
            }
        }
        self.send(from, Message::PingResp);
    }

    pub fn handle_disconnect(&self, from: SocketAddr, m: Disconnect) {
        match self.registry().resolve(from) {
            Some(session) => match m.duration {
                Some(secs) if secs > 0 => {
                    session.sleep(Duration::from_secs(u64::from(secs)));
                    tracing::info!("Session {} asleep for {}s", session.client_id(), secs);
                }
                _ => {
                    session.mark_disconnected();
                    self.registry().remove_session(&session);
                    self.retire(&session, true);
                    tracing::info!("Session {} disconnected", session.client_id());
                }
            },
            None => tracing::debug!("DISCONNECT from {} without a session", from),
        }
        self.send(from, Message::Disconnect(Disconnect { duration: None }));
    }

    // -----------------------------------------------------------------------
    // Topic registration
    // -----------------------------------------------------------------------

    pub fn handle_register(&self, from: SocketAddr, m: Register) {
        let Some(session) = self.session_for(from, "REGISTER") else {
            return;
        };
        let (topic_id, return_code) = if is_wildcarded(&m.topic_name) {
            tracing::warn!("REGISTER of wildcard {} from {}", m.topic_name, from);
            (0, ReturnCode::NotSupported)
        } else {
            match session.register_topic(&m.topic_name) {
                Ok(id) => (id, ReturnCode::Accepted),
                Err(TopicError::EmptyName) => (0, ReturnCode::NotSupported),
                Err(e @ TopicError::IdsExhausted) => {
                    tracing::warn!("REGISTER from {}: {}", session.client_id(), e);
                    (0, ReturnCode::Congestion)
                }
            }
        };
        self.send(
            from,
            Message::RegAck(RegAck {
                topic_id,
                msg_id: m.msg_id,
                return_code,
            }),
        );
    }

    pub fn handle_regack(&self, from: SocketAddr, m: RegAck) {
        if m.return_code.is_accepted() {
            tracing::debug!("REGACK for topic {} from {}", m.topic_id, from);
        } else {
            tracing::warn!(
                "Client {} refused topic {}: {:?}",
                from,
                m.topic_id,
                m.return_code
            );
        }
    }

    // -----------------------------------------------------------------------
    // Publish (client -> broker)
    // -----------------------------------------------------------------------

    pub async fn handle_publish(&self, from: SocketAddr, m: Publish) {
        let Some(session) = self.session_for(from, "PUBLISH") else {
            return;
        };
        let topic_name = match m.flags.topic_id_type {
            TopicIdType::Normal => session.registered_name(m.topic_id),
            TopicIdType::Predefined => session.predefined_name(m.topic_id),
            TopicIdType::ShortName => Some(m.short_name()),
            TopicIdType::Reserved => {
                tracing::warn!("PUBLISH from {} with reserved topic id type, dropping", from);
                return;
            }
        };
        let Some(topic_name) = topic_name else {
            tracing::warn!(
                "PUBLISH from {} to unknown {:?} topic id {}",
                from,
                m.flags.topic_id_type,
                m.topic_id
            );
            self.send(
                from,
                Message::PubAck(PubAck {
                    topic_id: m.topic_id,
                    msg_id: m.msg_id,
                    return_code: ReturnCode::InvalidTopicId,
                }),
            );
            return;
        };

        match m.flags.qos {
            Qos::AtMostOnce | Qos::Connectionless => {
                drop(
                    session
                        .bridge()
                        .publish(&topic_name, Qos::AtMostOnce, false, m.data),
                );
            }
            Qos::AtLeastOnce => self.forward_qos1(&session, m, topic_name).await,
            Qos::ExactlyOnce => self.hold_qos2(&session, from, m, topic_name),
        }
    }

    async fn forward_qos1(&self, session: &Arc<Session>, m: Publish, topic_name: String) {
        let client_id = session.client_id();
        if !self.flow().begin_uplink(session.id(), m.msg_id, m.topic_id) {
            tracing::debug!(
                "Duplicate QoS 1 PUBLISH {} from {} still in flight",
                m.msg_id,
                client_id
            );
            return;
        }
        let result = publish_with_retry(
            &**session.bridge(),
            &topic_name,
            Qos::AtLeastOnce,
            &m.data,
            self.retry_policy(),
        )
        .await;
        self.flow().finish_uplink(session.id(), m.msg_id);

        self.reply_to(
            session,
            Message::PubAck(PubAck {
                topic_id: m.topic_id,
                msg_id: m.msg_id,
                return_code: return_code_for(&result),
            }),
        );
    }

    fn hold_qos2(&self, session: &Arc<Session>, from: SocketAddr, m: Publish, topic_name: String) {
        let held = HeldPublish {
            topic_id: m.topic_id,
            topic_name,
            payload: m.data,
        };
        if !self.flow().hold(session.id(), m.msg_id, held) {
            tracing::debug!(
                "Duplicate QoS 2 PUBLISH {} from {}, repeating PUBREC",
                m.msg_id,
                session.client_id()
            );
        }
        self.send(
            from,
            Message::PubFlow(PubFlow {
                kind: PubFlowKind::Rec,
                msg_id: m.msg_id,
            }),
        );
    }

    pub async fn handle_pubrel(&self, from: SocketAddr, msg_id: u16) {
        let Some(session) = self.session_for(from, "PUBREL") else {
            return;
        };
        let client_id = session.client_id();
        let Some(held) = self.flow().release(session.id(), msg_id) else {
            tracing::warn!("PUBREL {} from {} without a held PUBLISH, ignoring", msg_id, client_id);
            return;
        };

        let result = publish_with_retry(
            &**session.bridge(),
            &held.topic_name,
            Qos::ExactlyOnce,
            &held.payload,
            self.retry_policy(),
        )
        .await;
        self.flow().finish_uplink(session.id(), msg_id);

        let reply = match result {
            Ok(()) => Message::PubFlow(PubFlow {
                kind: PubFlowKind::Comp,
                msg_id,
            }),
            Err(_) => Message::PubAck(PubAck {
                topic_id: held.topic_id,
                msg_id,
                return_code: return_code_for(&result),
            }),
        };
        self.reply_to(&session, reply);
    }

    // -----------------------------------------------------------------------
    // Client acks for broker -> client publishes
    // -----------------------------------------------------------------------

    fn route_ack(&self, from: SocketAddr, msg_id: u16, ack: DownlinkAck) {
        let Some(session) = self.session_for(from, "ack") else {
            return;
        };
        if !self.flow().acknowledge(session.id(), msg_id, ack) {
            tracing::debug!(
                "Stray {:?} for message {} from {}",
                ack,
                msg_id,
                session.client_id()
            );
        }
    }

    pub fn handle_puback(&self, from: SocketAddr, m: PubAck) {
        if m.return_code == ReturnCode::InvalidTopicId {
            tracing::warn!("Client {} does not know topic id {}", from, m.topic_id);
        }
        self.route_ack(from, m.msg_id, DownlinkAck::PubAck(m.return_code));
    }

    pub fn handle_pubrec(&self, from: SocketAddr, msg_id: u16) {
        self.route_ack(from, msg_id, DownlinkAck::PubRec);
    }

    pub fn handle_pubcomp(&self, from: SocketAddr, msg_id: u16) {
        self.route_ack(from, msg_id, DownlinkAck::PubComp);
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    pub async fn handle_subscribe(&self, from: SocketAddr, s: Subscription) {
        let Some(session) = self.session_for(from, "SUBSCRIBE") else {
            return;
        };
        let granted = match s.flags.qos {
            Qos::Connectionless => Qos::AtMostOnce,
            qos => qos,
        };

        let (topic_id, mut return_code, target) = match &s.topic {
            TopicRef::Name(name) if name.is_empty() => (0, ReturnCode::InvalidTopicId, None),
            TopicRef::Name(name) if is_wildcarded(name) => (
                0,
                ReturnCode::Accepted,
                Some((name.clone(), DeliveryTopic::Normal)),
            ),
            TopicRef::Name(name) => match session.register_topic(name) {
                Ok(id) => (
                    id,
                    ReturnCode::Accepted,
                    Some((name.clone(), DeliveryTopic::Normal)),
                ),
                Err(e) => {
                    tracing::warn!("SUBSCRIBE from {}: {}", session.client_id(), e);
                    (0, ReturnCode::Congestion, None)
                }
            },
            TopicRef::Id(id) if s.flags.topic_id_type == TopicIdType::Predefined => {
                match session.predefined_name(*id) {
                    Some(name) => (
                        *id,
                        ReturnCode::Accepted,
                        Some((name, DeliveryTopic::Predefined(*id))),
                    ),
                    None => {
                        tracing::warn!(
                            "SUBSCRIBE from {} to unknown predefined topic id {}",
                            session.client_id(),
                            id
                        );
                        (0, ReturnCode::InvalidTopicId, None)
                    }
                }
            }
            TopicRef::Id(_) => (0, ReturnCode::NotSupported, None),
            TopicRef::Short(raw) => (
                *raw,
                ReturnCode::Accepted,
                Some((short_name_from_id(*raw), DeliveryTopic::Short(*raw))),
            ),
        };

        if let Some((filter, delivery)) = target {
            let handler = Arc::new(crate::delivery::SessionInbound::new(
                self.weak(),
                session.client_id(),
                delivery,
            ));
            let result = session
                .bridge()
                .subscribe(&filter, granted, handler)
                .wait(self.broker_timeout())
                .await;
            match result {
                Ok(()) => tracing::debug!("{} subscribed to {}", session.client_id(), filter),
                Err(e) => {
                    tracing::warn!(
                        "Broker subscribe of {} to {} failed: {}",
                        session.client_id(),
                        filter,
                        e
                    );
                    return_code = ReturnCode::Congestion;
                }
            }
        }

        self.reply_to(
            &session,
            Message::SubAck(SubAck {
                flags: Flags::with(granted, s.flags.topic_id_type),
                topic_id,
                msg_id: s.msg_id,
                return_code,
            }),
        );
    }

    pub async fn handle_unsubscribe(&self, from: SocketAddr, s: Subscription) {
        let Some(session) = self.session_for(from, "UNSUBSCRIBE") else {
            return;
        };
        let filter = match &s.topic {
            TopicRef::Name(name) => Some(name.clone()),
            TopicRef::Id(id) if s.flags.topic_id_type == TopicIdType::Predefined => {
                session.predefined_name(*id)
            }
            TopicRef::Id(_) => None,
            TopicRef::Short(raw) => Some(short_name_from_id(*raw)),
        };

        match filter {
            Some(filter) => {
                let result = session
                    .bridge()
                    .unsubscribe(&filter)
                    .wait(self.broker_timeout())
                    .await;
                if let Err(e) = result {
                    tracing::warn!(
                        "Broker unsubscribe of {} from {} failed: {}",
                        session.client_id(),
                        filter,
                        e
                    );
                }
            }
            None => tracing::debug!("UNSUBSCRIBE from {} for unknown topic", session.client_id()),
        }

        self.reply_to(&session, Message::UnsubAck(UnsubAck { msg_id: s.msg_id }));
    }
}
