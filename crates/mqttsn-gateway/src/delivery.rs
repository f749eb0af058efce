// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Broker -> client delivery.
//
// `SessionInbound` is the handler registered with a session's bridge for
// each subscription. It finds the session by client id on every message,
// buffers while the client sleeps and otherwise hands the message to the
// gateway, which maps the topic to an id and runs the QoS exchange.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;

use crate::bridge::InboundHandler;
use crate::gateway::Gateway;
use crate::protocol::{
    Flags, Message, PubFlow, PubFlowKind, Publish, Qos, Register, TopicIdType,
};
use crate::qos::{DownlinkAck, QosStep};
use crate::session::{DeliveryTopic, InboundMessage, Session};

/// Subscription callback bound to one client id.
pub struct SessionInbound {
    gateway: Weak<Gateway>,
    client_id: String,
    delivery: DeliveryTopic,
}

impl SessionInbound {
    pub fn new(gateway: Weak<Gateway>, client_id: &str, delivery: DeliveryTopic) -> Self {
        Self {
            gateway,
            client_id: client_id.to_string(),
            delivery,
        }
    }
}

impl InboundHandler for SessionInbound {
    fn on_message(&self, topic: &str, payload: &[u8], qos: Qos) {
        let Some(gateway) = self.gateway.upgrade() else {
            return;
        };
        let Some(session) = gateway.registry().find_by_client_id(&self.client_id) else {
            tracing::debug!(
                "Broker message on {} for vanished session {}",
                topic,
                self.client_id
            );
            return;
        };
        let msg = InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            delivery: self.delivery,
        };
        if let Some(msg) = session.buffer_if_asleep(msg) {
            gateway.deliver(&session, msg);
        }
    }
}

/// A QoS 1/2 PUBLISH sent to a client, waiting for its acks.
pub(crate) struct DownlinkExchange {
    session: Arc<Session>,
    publish: Publish,
    acks: mpsc::Receiver<DownlinkAck>,
}

impl Gateway {
    /// Send `msg` to the client now; QoS 1/2 acks are awaited in a spawned
    /// task.
    pub fn deliver(&self, session: &Arc<Session>, msg: InboundMessage) {
        let Some(exchange) = self.start_delivery(session, msg) else {
            return;
        };
        let Some(gateway) = self.weak().upgrade() else {
            return;
        };
        tokio::spawn(async move {
            gateway.complete_delivery(exchange).await;
        });
    }

    /// Deliver a wake-up backlog. First transmissions go out in order before
    /// this returns.
    pub(crate) fn flush(&self, session: &Arc<Session>, backlog: Vec<InboundMessage>) {
        for msg in backlog {
            self.deliver(session, msg);
        }
    }

    /// Map the topic, send REGISTER if the id is new, send the PUBLISH.
    pub(crate) fn start_delivery(
        &self,
        session: &Arc<Session>,
        msg: InboundMessage,
    ) -> Option<DownlinkExchange> {
        let addr = session.addr();
        let (topic_id, topic_id_type) = match msg.delivery {
            DeliveryTopic::Predefined(id) => (id, TopicIdType::Predefined),
            DeliveryTopic::Short(raw) => (raw, TopicIdType::ShortName),
            DeliveryTopic::Normal => match session.delivery_id(&msg.topic) {
                Ok((id, true, _)) => (id, TopicIdType::Predefined),
                Ok((id, false, fresh)) => {
                    if fresh {
                        tracing::debug!(
                            "Registering {} as topic {} with {}",
                            msg.topic,
                            id,
                            session.client_id()
                        );
                        self.send(
                            addr,
                            Message::Register(Register {
                                topic_id: id,
                                msg_id: session.next_msg_id(),
                                topic_name: msg.topic.clone(),
                            }),
                        );
                    }
                    (id, TopicIdType::Normal)
                }
                Err(e) => {
                    tracing::warn!(
                        "Cannot deliver {} to {}: {}",
                        msg.topic,
                        session.client_id(),
                        e
                    );
                    return None;
                }
            },
        };

        let qos = match msg.qos {
            Qos::Connectionless => Qos::AtMostOnce,
            qos => qos,
        };
        let msg_id = match qos {
            Qos::AtMostOnce | Qos::Connectionless => 0,
            _ => session.next_msg_id(),
        };
        let publish = Publish {
            flags: Flags::with(qos, topic_id_type),
            topic_id,
            msg_id,
            data: msg.payload,
        };

        let acks = match qos {
            Qos::AtLeastOnce => Some(QosStep::AwaitPubAck),
            Qos::ExactlyOnce => Some(QosStep::AwaitPubRec),
            Qos::AtMostOnce | Qos::Connectionless => None,
        }
        .map(|step| {
            self.flow()
                .begin_downlink(session.id(), msg_id, topic_id, step)
        });

        self.send(addr, Message::Publish(publish.clone()));

        acks.map(|acks| DownlinkExchange {
            session: Arc::clone(session),
            publish,
            acks,
        })
    }

    /// Retransmit until the client acks or the retry budget runs out.
    pub(crate) async fn complete_delivery(&self, exchange: DownlinkExchange) {
        let DownlinkExchange {
            session,
            publish,
            mut acks,
        } = exchange;
        let client_id = session.client_id();
        let msg_id = publish.msg_id;

        let first_step = if publish.flags.qos == Qos::AtLeastOnce {
            QosStep::AwaitPubAck
        } else {
            QosStep::AwaitPubRec
        };
        let mut retransmit = publish;
        retransmit.flags.dup = true;

        match self
            .await_client_ack(&session, Message::Publish(retransmit), &mut acks, first_step)
            .await
        {
            Some(DownlinkAck::PubAck(code)) if !code.is_accepted() => {
                tracing::warn!(
                    "Client {} rejected message {}: {:?}",
                    client_id,
                    msg_id,
                    code
                );
            }
            Some(DownlinkAck::PubRec) => {
                self.flow()
                    .advance_downlink(session.id(), msg_id, QosStep::AwaitPubComp);
                let pubrel = Message::PubFlow(PubFlow {
                    kind: PubFlowKind::Rel,
                    msg_id,
                });
                self.reply_to(&session, pubrel.clone());
                if self
                    .await_client_ack(&session, pubrel, &mut acks, QosStep::AwaitPubComp)
                    .await
                    .is_none()
                {
                    tracing::warn!("No PUBCOMP from {} for message {}", client_id, msg_id);
                }
            }
            Some(_) => {}
            None => tracing::warn!(
                "No acknowledgment from {} for message {}, giving up",
                client_id,
                msg_id
            ),
        }
        self.flow().finish_downlink(session.id(), msg_id);
    }

    /// Wait for an ack completing `step`, resending `retransmit` after each
    /// timeout. The first transmission has already been sent.
    async fn await_client_ack(
        &self,
        session: &Arc<Session>,
        retransmit: Message,
        acks: &mut mpsc::Receiver<DownlinkAck>,
        step: QosStep,
    ) -> Option<DownlinkAck> {
        let policy = self.retry_policy();
        for attempt in 0..policy.attempts() {
            if attempt > 0 {
                if !self.registry().is_current(session) {
                    return None;
                }
                tracing::debug!(
                    "Retransmitting {:?} to {} (attempt {}/{})",
                    retransmit.msg_type(),
                    session.client_id(),
                    attempt + 1,
                    policy.attempts()
                );
                self.send(session.addr(), retransmit.clone());
            }
            let wait = async {
                loop {
                    match acks.recv().await {
                        Some(ack) if step.accepts(&ack) => return Some(ack),
                        Some(_) => continue,
                        None => return None,
                    }
                }
            };
            if let Ok(ack) = tokio::time::timeout(policy.timeout_for(attempt), wait).await {
                return ack;
            }
        }
        None
    }
}
