// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Datagram dispatch.
//
// Decodes each datagram and runs its handler as an independent task, so a
// handler waiting on the broker never holds up reception.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::gateway::Gateway;
use crate::protocol::{self, Message, PubFlowKind, SubscriptionKind};

pub struct Dispatcher {
    gateway: Arc<Gateway>,
}

impl Dispatcher {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Decode `datagram` and spawn its handler. Malformed input is dropped
    /// and yields `None`.
    pub fn dispatch(&self, from: SocketAddr, datagram: &[u8]) -> Option<JoinHandle<()>> {
        let msg = match protocol::decode(datagram) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(
                    "Dropping malformed datagram from {} ({} bytes): {}",
                    from,
                    datagram.len(),
                    e
                );
                return None;
            }
        };
        tracing::trace!("<- {} {:?}", from, msg.msg_type());

        let gateway = Arc::clone(&self.gateway);
        Some(tokio::spawn(async move {
            route(&gateway, from, msg).await;
        }))
    }
}

/// Run the handler for one decoded message.
pub async fn route(gateway: &Gateway, from: SocketAddr, msg: Message) {
    match msg {
        Message::SearchGw(m) => gateway.handle_searchgw(from, m),
        Message::Advertise(_) | Message::GwInfo(_) => {
            tracing::debug!("Ignoring gateway discovery frame from {}", from)
        }
        Message::Connect(m) => gateway.handle_connect(from, m),
        Message::WillTopic(m) => gateway.handle_willtopic(from, m),
        Message::WillMsg(m) => gateway.handle_willmsg(from, m),
        Message::WillTopicUpd(m) => gateway.handle_willtopicupd(from, m),
        Message::WillMsgUpd(m) => gateway.handle_willmsgupd(from, m),
        Message::Register(m) => gateway.handle_register(from, m),
        Message::RegAck(m) => gateway.handle_regack(from, m),
        Message::Publish(m) => gateway.handle_publish(from, m).await,
        Message::PubAck(m) => gateway.handle_puback(from, m),
        Message::PubFlow(f) => match f.kind {
            PubFlowKind::Rec => gateway.handle_pubrec(from, f.msg_id),
            PubFlowKind::Rel => gateway.handle_pubrel(from, f.msg_id).await,
            PubFlowKind::Comp => gateway.handle_pubcomp(from, f.msg_id),
        },
        Message::Subscription(s) => match s.kind {
            SubscriptionKind::Subscribe => gateway.handle_subscribe(from, s).await,
            SubscriptionKind::Unsubscribe => gateway.handle_unsubscribe(from, s).await,
        },
        Message::PingReq(m) => gateway.handle_pingreq(from, m),
        Message::Disconnect(m) => gateway.handle_disconnect(from, m),
        // Gateway-to-client frames.
        other @ (Message::ConnAck(_)
        | Message::WillTopicReq
        | Message::WillMsgReq
        | Message::SubAck(_)
        | Message::UnsubAck(_)
        | Message::PingResp
        | Message::WillResp(_)) => {
            tracing::warn!(
                "Unexpected {:?} from client {}, ignoring",
                other.msg_type(),
                from
            );
        }
    }
}
