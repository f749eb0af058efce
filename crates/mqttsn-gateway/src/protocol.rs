// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// MQTT-SN v1.2 wire format parser/builder.
//
// All parsing is safe: malformed input returns Err, never panics.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced while decoding or encoding MQTT-SN frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("buffer too short")]
    BufferTooShort,

    #[error("length mismatch: header declares {declared} bytes, datagram has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("unknown return code: 0x{0:02x}")]
    UnknownReturnCode(u8),

    #[error("unsupported protocol id: 0x{0:02x}")]
    UnsupportedProtocolId(u8),

    #[error("{0} bytes left over after frame body")]
    TrailingBytes(usize),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("frame too large to encode: {0} bytes")]
    FrameTooLarge(usize),
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Protocol id carried in CONNECT.
pub const PROTOCOL_ID: u8 = 0x01;

/// First length byte announcing a 3-byte length field.
pub const LONG_LENGTH_MARKER: u8 = 0x01;

/// Largest frame the 3-byte length form can describe.
pub const MAX_FRAME_SIZE: usize = 0xFFFF;

// Message types
pub const MSG_ADVERTISE: u8 = 0x00;
pub const MSG_SEARCHGW: u8 = 0x01;
pub const MSG_GWINFO: u8 = 0x02;
pub const MSG_CONNECT: u8 = 0x04;
pub const MSG_CONNACK: u8 = 0x05;
pub const MSG_WILLTOPICREQ: u8 = 0x06;
pub const MSG_WILLTOPIC: u8 = 0x07;
pub const MSG_WILLMSGREQ: u8 = 0x08;
pub const MSG_WILLMSG: u8 = 0x09;
pub const MSG_REGISTER: u8 = 0x0A;
pub const MSG_REGACK: u8 = 0x0B;
pub const MSG_PUBLISH: u8 = 0x0C;
pub const MSG_PUBACK: u8 = 0x0D;
pub const MSG_PUBCOMP: u8 = 0x0E;
pub const MSG_PUBREC: u8 = 0x0F;
pub const MSG_PUBREL: u8 = 0x10;
pub const MSG_SUBSCRIBE: u8 = 0x12;
pub const MSG_SUBACK: u8 = 0x13;
pub const MSG_UNSUBSCRIBE: u8 = 0x14;
pub const MSG_UNSUBACK: u8 = 0x15;
pub const MSG_PINGREQ: u8 = 0x16;
pub const MSG_PINGRESP: u8 = 0x17;
pub const MSG_DISCONNECT: u8 = 0x18;
pub const MSG_WILLTOPICUPD: u8 = 0x1A;
pub const MSG_WILLTOPICRESP: u8 = 0x1B;
pub const MSG_WILLMSGUPD: u8 = 0x1C;
pub const MSG_WILLMSGRESP: u8 = 0x1D;

// Return codes
pub const RC_ACCEPTED: u8 = 0x00;
pub const RC_REJECTED_CONGESTION: u8 = 0x01;
pub const RC_REJECTED_INVALID_TOPIC_ID: u8 = 0x02;
pub const RC_REJECTED_NOT_SUPPORTED: u8 = 0x03;

// Flag bits
const FLAG_DUP: u8 = 0x80;
const FLAG_QOS_MASK: u8 = 0x60;
const FLAG_QOS_SHIFT: u8 = 5;
const FLAG_RETAIN: u8 = 0x10;
const FLAG_WILL: u8 = 0x08;
const FLAG_CLEAN_SESSION: u8 = 0x04;
const FLAG_TOPIC_ID_TYPE_MASK: u8 = 0x03;

// ---------------------------------------------------------------------------
// Message type enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Advertise = MSG_ADVERTISE,
    SearchGw = MSG_SEARCHGW,
    GwInfo = MSG_GWINFO,
    Connect = MSG_CONNECT,
    ConnAck = MSG_CONNACK,
    WillTopicReq = MSG_WILLTOPICREQ,
    WillTopic = MSG_WILLTOPIC,
    WillMsgReq = MSG_WILLMSGREQ,
    WillMsg = MSG_WILLMSG,
    Register = MSG_REGISTER,
    RegAck = MSG_REGACK,
    Publish = MSG_PUBLISH,
    PubAck = MSG_PUBACK,
    PubComp = MSG_PUBCOMP,
    PubRec = MSG_PUBREC,
    PubRel = MSG_PUBREL,
    Subscribe = MSG_SUBSCRIBE,
    SubAck = MSG_SUBACK,
    Unsubscribe = MSG_UNSUBSCRIBE,
    UnsubAck = MSG_UNSUBACK,
    PingReq = MSG_PINGREQ,
    PingResp = MSG_PINGRESP,
    Disconnect = MSG_DISCONNECT,
    WillTopicUpd = MSG_WILLTOPICUPD,
    WillTopicResp = MSG_WILLTOPICRESP,
    WillMsgUpd = MSG_WILLMSGUPD,
    WillMsgResp = MSG_WILLMSGRESP,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        let t = match v {
            MSG_ADVERTISE => Self::Advertise,
            MSG_SEARCHGW => Self::SearchGw,
            MSG_GWINFO => Self::GwInfo,
            MSG_CONNECT => Self::Connect,
            MSG_CONNACK => Self::ConnAck,
            MSG_WILLTOPICREQ => Self::WillTopicReq,
            MSG_WILLTOPIC => Self::WillTopic,
            MSG_WILLMSGREQ => Self::WillMsgReq,
            MSG_WILLMSG => Self::WillMsg,
            MSG_REGISTER => Self::Register,
            MSG_REGACK => Self::RegAck,
            MSG_PUBLISH => Self::Publish,
            MSG_PUBACK => Self::PubAck,
            MSG_PUBCOMP => Self::PubComp,
            MSG_PUBREC => Self::PubRec,
            MSG_PUBREL => Self::PubRel,
            MSG_SUBSCRIBE => Self::Subscribe,
            MSG_SUBACK => Self::SubAck,
            MSG_UNSUBSCRIBE => Self::Unsubscribe,
            MSG_UNSUBACK => Self::UnsubAck,
            MSG_PINGREQ => Self::PingReq,
            MSG_PINGRESP => Self::PingResp,
            MSG_DISCONNECT => Self::Disconnect,
            MSG_WILLTOPICUPD => Self::WillTopicUpd,
            MSG_WILLTOPICRESP => Self::WillTopicResp,
            MSG_WILLMSGUPD => Self::WillMsgUpd,
            MSG_WILLMSGRESP => Self::WillMsgResp,
            _ => return Err(CodecError::UnknownMessageType(v)),
        };
        Ok(t)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ---------------------------------------------------------------------------
// Return code enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    Accepted = RC_ACCEPTED,
    Congestion = RC_REJECTED_CONGESTION,
    InvalidTopicId = RC_REJECTED_INVALID_TOPIC_ID,
    NotSupported = RC_REJECTED_NOT_SUPPORTED,
}

impl ReturnCode {
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            RC_ACCEPTED => Ok(Self::Accepted),
            RC_REJECTED_CONGESTION => Ok(Self::Congestion),
            RC_REJECTED_INVALID_TOPIC_ID => Ok(Self::InvalidTopicId),
            RC_REJECTED_NOT_SUPPORTED => Ok(Self::NotSupported),
            _ => Err(CodecError::UnknownReturnCode(v)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Topic id type carried in the two low flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopicIdType {
    #[default]
    Normal,
    Predefined,
    ShortName,
    /// 0b11, reserved by the protocol. Decodes, but handlers reject it.
    Reserved,
}

impl TopicIdType {
    fn from_bits(bits: u8) -> Self {
        match bits & FLAG_TOPIC_ID_TYPE_MASK {
            0 => Self::Normal,
            1 => Self::Predefined,
            2 => Self::ShortName,
            _ => Self::Reserved,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Predefined => 1,
            Self::ShortName => 2,
            Self::Reserved => 3,
        }
    }
}

/// Quality of service as encoded in the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
    /// QoS -1: publish without an established connection.
    Connectionless,
}

impl Qos {
    fn from_bits(bits: u8) -> Self {
        match (bits & FLAG_QOS_MASK) >> FLAG_QOS_SHIFT {
            0 => Self::AtMostOnce,
            1 => Self::AtLeastOnce,
            2 => Self::ExactlyOnce,
            _ => Self::Connectionless,
        }
    }

    fn bits(self) -> u8 {
        let level = match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
            Self::Connectionless => 3,
        };
        level << FLAG_QOS_SHIFT
    }

    /// Numeric level; QoS -1 is reported as 0 since it carries no acks.
    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce | Self::Connectionless => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

/// The MQTT-SN flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    pub dup: bool,
    pub qos: Qos,
    pub retain: bool,
    pub will: bool,
    pub clean_session: bool,
    pub topic_id_type: TopicIdType,
}

impl Flags {
    pub fn from_u8(v: u8) -> Self {
        Self {
            dup: v & FLAG_DUP != 0,
            qos: Qos::from_bits(v),
            retain: v & FLAG_RETAIN != 0,
            will: v & FLAG_WILL != 0,
            clean_session: v & FLAG_CLEAN_SESSION != 0,
            topic_id_type: TopicIdType::from_bits(v),
        }
    }

    pub fn as_u8(&self) -> u8 {
        let mut v = self.qos.bits() | self.topic_id_type.bits();
        if self.dup {
            v |= FLAG_DUP;
        }
        if self.retain {
            v |= FLAG_RETAIN;
        }
        if self.will {
            v |= FLAG_WILL;
        }
        if self.clean_session {
            v |= FLAG_CLEAN_SESSION;
        }
        v
    }

    /// Flags for a frame that only carries a QoS and a topic id type.
    pub fn with(qos: Qos, topic_id_type: TopicIdType) -> Self {
        Self {
            qos,
            topic_id_type,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Frame payloads
// ---------------------------------------------------------------------------

/// ADVERTISE (0x00)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advertise {
    pub gw_id: u8,
    pub duration: u16,
}

/// SEARCHGW (0x01)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchGw {
    pub radius: u8,
}

/// GWINFO (0x02). `gw_addr` is only present when sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GwInfo {
    pub gw_id: u8,
    pub gw_addr: Vec<u8>,
}

/// CONNECT (0x04)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub flags: Flags,
    pub protocol_id: u8,
    /// Keep-alive period in seconds.
    pub duration: u16,
    pub client_id: String,
}

/// CONNACK (0x05)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub return_code: ReturnCode,
}

/// WILLTOPIC (0x07) and WILLTOPICUPD (0x1A). An empty topic means "no will".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WillTopic {
    pub qos: Qos,
    pub retain: bool,
    pub topic: String,
}

/// WILLMSG (0x09) and WILLMSGUPD (0x1C).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WillMsg {
    pub msg: Vec<u8>,
}

/// REGISTER (0x0A)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub topic_id: u16,
    pub msg_id: u16,
    pub topic_name: String,
}

/// REGACK (0x0B)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegAck {
    pub topic_id: u16,
    pub msg_id: u16,
    pub return_code: ReturnCode,
}

/// PUBLISH (0x0C). For short topic names `topic_id` holds the two name bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub flags: Flags,
    pub topic_id: u16,
    pub msg_id: u16,
    pub data: Vec<u8>,
}

impl Publish {
    /// The inline two-character topic name of a short-name publish.
    pub fn short_name(&self) -> String {
        short_name_from_id(self.topic_id)
    }
}

/// PUBACK (0x0D)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub topic_id: u16,
    pub msg_id: u16,
    pub return_code: ReturnCode,
}

/// Discriminator for the shared PUBREC/PUBREL/PUBCOMP frame shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubFlowKind {
    Rec,
    Rel,
    Comp,
}

/// PUBREC (0x0F), PUBREL (0x10) and PUBCOMP (0x0E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubFlow {
    pub kind: PubFlowKind,
    pub msg_id: u16,
}

/// Discriminator for the shared SUBSCRIBE/UNSUBSCRIBE frame shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Subscribe,
    Unsubscribe,
}

/// Topic reference in a SUBSCRIBE/UNSUBSCRIBE, selected by the topic id type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicRef {
    /// NORMAL: full topic name, possibly wildcarded.
    Name(String),
    /// PREDEFINED (or the reserved type): numeric topic id.
    Id(u16),
    /// SHORT_NAME: two-character name carried in the topic id field.
    Short(u16),
}

/// SUBSCRIBE (0x12) and UNSUBSCRIBE (0x14).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub kind: SubscriptionKind,
    pub flags: Flags,
    pub msg_id: u16,
    pub topic: TopicRef,
}

/// SUBACK (0x13)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubAck {
    pub flags: Flags,
    pub topic_id: u16,
    pub msg_id: u16,
    pub return_code: ReturnCode,
}

/// UNSUBACK (0x15)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub msg_id: u16,
}

/// PINGREQ (0x16). Sleeping clients include their client id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PingReq {
    pub client_id: Option<String>,
}

/// DISCONNECT (0x18). A duration asks the gateway to keep the session asleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Disconnect {
    pub duration: Option<u16>,
}

/// Discriminator for the shared WILLTOPICRESP/WILLMSGRESP frame shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WillRespKind {
    Topic,
    Msg,
}

/// WILLTOPICRESP (0x1B) and WILLMSGRESP (0x1D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WillResp {
    pub kind: WillRespKind,
    pub return_code: ReturnCode,
}

// ---------------------------------------------------------------------------
// Unified message enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Advertise(Advertise),
    SearchGw(SearchGw),
    GwInfo(GwInfo),
    Connect(Connect),
    ConnAck(ConnAck),
    WillTopicReq,
    WillTopic(WillTopic),
    WillMsgReq,
    WillMsg(WillMsg),
    Register(Register),
    RegAck(RegAck),
    Publish(Publish),
    PubAck(PubAck),
    PubFlow(PubFlow),
    Subscription(Subscription),
    SubAck(SubAck),
    UnsubAck(UnsubAck),
    PingReq(PingReq),
    PingResp,
    Disconnect(Disconnect),
    WillTopicUpd(WillTopic),
    WillMsgUpd(WillMsg),
    WillResp(WillResp),
}

impl Message {
    /// Wire message type of this frame.
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::Advertise(_) => MsgType::Advertise,
            Self::SearchGw(_) => MsgType::SearchGw,
            Self::GwInfo(_) => MsgType::GwInfo,
            Self::Connect(_) => MsgType::Connect,
            Self::ConnAck(_) => MsgType::ConnAck,
            Self::WillTopicReq => MsgType::WillTopicReq,
            Self::WillTopic(_) => MsgType::WillTopic,
            Self::WillMsgReq => MsgType::WillMsgReq,
            Self::WillMsg(_) => MsgType::WillMsg,
            Self::Register(_) => MsgType::Register,
            Self::RegAck(_) => MsgType::RegAck,
            Self::Publish(_) => MsgType::Publish,
            Self::PubAck(_) => MsgType::PubAck,
            Self::PubFlow(f) => match f.kind {
                PubFlowKind::Rec => MsgType::PubRec,
                PubFlowKind::Rel => MsgType::PubRel,
                PubFlowKind::Comp => MsgType::PubComp,
            },
            Self::Subscription(s) => match s.kind {
                SubscriptionKind::Subscribe => MsgType::Subscribe,
                SubscriptionKind::Unsubscribe => MsgType::Unsubscribe,
            },
            Self::SubAck(_) => MsgType::SubAck,
            Self::UnsubAck(_) => MsgType::UnsubAck,
            Self::PingReq(_) => MsgType::PingReq,
            Self::PingResp => MsgType::PingResp,
            Self::Disconnect(_) => MsgType::Disconnect,
            Self::WillTopicUpd(_) => MsgType::WillTopicUpd,
            Self::WillMsgUpd(_) => MsgType::WillMsgUpd,
            Self::WillResp(r) => match r.kind {
                WillRespKind::Topic => MsgType::WillTopicResp,
                WillRespKind::Msg => MsgType::WillMsgResp,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Short topic names
// ---------------------------------------------------------------------------

/// Pack a two-character topic name into the 16-bit topic id field.
/// Returns `None` unless the name is exactly two bytes long.
pub fn short_name_to_id(name: &str) -> Option<u16> {
    match name.as_bytes() {
        [a, b] => Some(u16::from_be_bytes([*a, *b])),
        _ => None,
    }
}

/// Unpack the two name bytes stored in a topic id field.
pub fn short_name_from_id(topic_id: u16) -> String {
    String::from_utf8_lossy(&topic_id.to_be_bytes()).into_owned()
}

// ---------------------------------------------------------------------------
// Parsing helpers (big-endian)
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.off
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        let v = *self.buf.get(self.off).ok_or(CodecError::BufferTooShort)?;
        self.off += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        if self.remaining() < 2 {
            return Err(CodecError::BufferTooShort);
        }
        let v = u16::from_be_bytes([self.buf[self.off], self.buf[self.off + 1]]);
        self.off += 2;
        Ok(v)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.off..];
        self.off = self.buf.len();
        rest
    }

    fn string(&mut self, what: &'static str) -> Result<String, CodecError> {
        String::from_utf8(self.rest().to_vec()).map_err(|_| CodecError::InvalidUtf8(what))
    }

    fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

/// Read the length field. Returns (declared total length, length field size).
fn read_length(buf: &[u8]) -> Result<(usize, usize), CodecError> {
    match buf.first() {
        None => Err(CodecError::BufferTooShort),
        Some(&LONG_LENGTH_MARKER) => {
            if buf.len() < 3 {
                return Err(CodecError::BufferTooShort);
            }
            Ok((u16::from_be_bytes([buf[1], buf[2]]) as usize, 3))
        }
        Some(&len) => Ok((len as usize, 1)),
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode one datagram into a typed MQTT-SN message.
pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
    let (declared, len_size) = read_length(buf)?;
    if declared != buf.len() {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: buf.len(),
        });
    }
    if buf.len() < len_size + 1 {
        return Err(CodecError::BufferTooShort);
    }
    let msg_type = MsgType::from_u8(buf[len_size])?;
    let mut r = Reader::new(&buf[len_size + 1..]);

    let msg = match msg_type {
        MsgType::Advertise => Message::Advertise(Advertise {
            gw_id: r.u8()?,
            duration: r.u16()?,
        }),
        MsgType::SearchGw => Message::SearchGw(SearchGw { radius: r.u8()? }),
        MsgType::GwInfo => Message::GwInfo(GwInfo {
            gw_id: r.u8()?,
            gw_addr: r.rest().to_vec(),
        }),
        MsgType::Connect => {
            let flags = Flags::from_u8(r.u8()?);
            let protocol_id = r.u8()?;
            if protocol_id != PROTOCOL_ID {
                return Err(CodecError::UnsupportedProtocolId(protocol_id));
            }
            let duration = r.u16()?;
            let client_id = r.string("client id")?;
            Message::Connect(Connect {
                flags,
                protocol_id,
                duration,
                client_id,
            })
        }
        MsgType::ConnAck => Message::ConnAck(ConnAck {
            return_code: ReturnCode::from_u8(r.u8()?)?,
        }),
        MsgType::WillTopicReq => Message::WillTopicReq,
        MsgType::WillTopic => Message::WillTopic(parse_will_topic(&mut r)?),
        MsgType::WillMsgReq => Message::WillMsgReq,
        MsgType::WillMsg => Message::WillMsg(WillMsg {
            msg: r.rest().to_vec(),
        }),
        MsgType::Register => Message::Register(Register {
            topic_id: r.u16()?,
            msg_id: r.u16()?,
            topic_name: r.string("topic name")?,
        }),
        MsgType::RegAck => Message::RegAck(RegAck {
            topic_id: r.u16()?,
            msg_id: r.u16()?,
            return_code: ReturnCode::from_u8(r.u8()?)?,
        }),
        MsgType::Publish => Message::Publish(Publish {
            flags: Flags::from_u8(r.u8()?),
            topic_id: r.u16()?,
            msg_id: r.u16()?,
            data: r.rest().to_vec(),
        }),
        MsgType::PubAck => Message::PubAck(PubAck {
            topic_id: r.u16()?,
            msg_id: r.u16()?,
            return_code: ReturnCode::from_u8(r.u8()?)?,
        }),
        MsgType::PubRec | MsgType::PubRel | MsgType::PubComp => {
            let kind = match msg_type {
                MsgType::PubRec => PubFlowKind::Rec,
                MsgType::PubRel => PubFlowKind::Rel,
                _ => PubFlowKind::Comp,
            };
            Message::PubFlow(PubFlow {
                kind,
                msg_id: r.u16()?,
            })
        }
        MsgType::Subscribe | MsgType::Unsubscribe => {
            let kind = if msg_type == MsgType::Subscribe {
                SubscriptionKind::Subscribe
            } else {
                SubscriptionKind::Unsubscribe
            };
            let flags = Flags::from_u8(r.u8()?);
            let msg_id = r.u16()?;
            let topic = match flags.topic_id_type {
                TopicIdType::Normal => TopicRef::Name(r.string("topic name")?),
                TopicIdType::ShortName => TopicRef::Short(r.u16()?),
                TopicIdType::Predefined | TopicIdType::Reserved => TopicRef::Id(r.u16()?),
            };
            Message::Subscription(Subscription {
                kind,
                flags,
                msg_id,
                topic,
            })
        }
        MsgType::SubAck => Message::SubAck(SubAck {
            flags: Flags::from_u8(r.u8()?),
            topic_id: r.u16()?,
            msg_id: r.u16()?,
            return_code: ReturnCode::from_u8(r.u8()?)?,
        }),
        MsgType::UnsubAck => Message::UnsubAck(UnsubAck { msg_id: r.u16()? }),
        MsgType::PingReq => {
            let client_id = if r.remaining() == 0 {
                None
            } else {
                Some(r.string("client id")?)
            };
            Message::PingReq(PingReq { client_id })
        }
        MsgType::PingResp => Message::PingResp,
        MsgType::Disconnect => {
            let duration = if r.remaining() == 0 {
                None
            } else {
                Some(r.u16()?)
            };
            Message::Disconnect(Disconnect { duration })
        }
        MsgType::WillTopicUpd => Message::WillTopicUpd(parse_will_topic(&mut r)?),
        MsgType::WillMsgUpd => Message::WillMsgUpd(WillMsg {
            msg: r.rest().to_vec(),
        }),
        MsgType::WillTopicResp | MsgType::WillMsgResp => {
            let kind = if msg_type == MsgType::WillTopicResp {
                WillRespKind::Topic
            } else {
                WillRespKind::Msg
            };
            Message::WillResp(WillResp {
                kind,
                return_code: ReturnCode::from_u8(r.u8()?)?,
            })
        }
    };

    r.finish()?;
    Ok(msg)
}

fn parse_will_topic(r: &mut Reader<'_>) -> Result<WillTopic, CodecError> {
    // Header-only form deletes the will.
    if r.remaining() == 0 {
        return Ok(WillTopic::default());
    }
    let flags = Flags::from_u8(r.u8()?);
    Ok(WillTopic {
        qos: flags.qos,
        retain: flags.retain,
        topic: r.string("will topic")?,
    })
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a typed message into one datagram.
pub fn encode(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let mut body = Vec::with_capacity(16);
    body.push(msg.msg_type().as_u8());

    match msg {
        Message::Advertise(m) => {
            body.push(m.gw_id);
            body.extend_from_slice(&m.duration.to_be_bytes());
        }
        Message::SearchGw(m) => body.push(m.radius),
        Message::GwInfo(m) => {
            body.push(m.gw_id);
            body.extend_from_slice(&m.gw_addr);
        }
        Message::Connect(m) => {
            body.push(m.flags.as_u8());
            body.push(m.protocol_id);
            body.extend_from_slice(&m.duration.to_be_bytes());
            body.extend_from_slice(m.client_id.as_bytes());
        }
        Message::ConnAck(m) => body.push(m.return_code.as_u8()),
        Message::WillTopicReq | Message::WillMsgReq | Message::PingResp => {}
        Message::WillTopic(m) | Message::WillTopicUpd(m) => {
            if !m.topic.is_empty() {
                let flags = Flags {
                    qos: m.qos,
                    retain: m.retain,
                    ..Flags::default()
                };
                body.push(flags.as_u8());
                body.extend_from_slice(m.topic.as_bytes());
            }
        }
        Message::WillMsg(m) | Message::WillMsgUpd(m) => body.extend_from_slice(&m.msg),
        Message::Register(m) => {
            body.extend_from_slice(&m.topic_id.to_be_bytes());
            body.extend_from_slice(&m.msg_id.to_be_bytes());
            body.extend_from_slice(m.topic_name.as_bytes());
        }
        Message::RegAck(m) => {
            body.extend_from_slice(&m.topic_id.to_be_bytes());
            body.extend_from_slice(&m.msg_id.to_be_bytes());
            body.push(m.return_code.as_u8());
        }
        Message::Publish(m) => {
            body.push(m.flags.as_u8());
            body.extend_from_slice(&m.topic_id.to_be_bytes());
            body.extend_from_slice(&m.msg_id.to_be_bytes());
            body.extend_from_slice(&m.data);
        }
        Message::PubAck(m) => {
            body.extend_from_slice(&m.topic_id.to_be_bytes());
            body.extend_from_slice(&m.msg_id.to_be_bytes());
            body.push(m.return_code.as_u8());
        }
        Message::PubFlow(m) => body.extend_from_slice(&m.msg_id.to_be_bytes()),
        Message::Subscription(m) => {
            body.push(m.flags.as_u8());
            body.extend_from_slice(&m.msg_id.to_be_bytes());
            match &m.topic {
                TopicRef::Name(name) => body.extend_from_slice(name.as_bytes()),
                TopicRef::Id(id) | TopicRef::Short(id) => {
                    body.extend_from_slice(&id.to_be_bytes())
                }
            }
        }
        Message::SubAck(m) => {
            body.push(m.flags.as_u8());
            body.extend_from_slice(&m.topic_id.to_be_bytes());
            body.extend_from_slice(&m.msg_id.to_be_bytes());
            body.push(m.return_code.as_u8());
        }
        Message::UnsubAck(m) => body.extend_from_slice(&m.msg_id.to_be_bytes()),
        Message::PingReq(m) => {
            if let Some(id) = &m.client_id {
                body.extend_from_slice(id.as_bytes());
            }
        }
        Message::Disconnect(m) => {
            if let Some(duration) = m.duration {
                body.extend_from_slice(&duration.to_be_bytes());
            }
        }
        Message::WillResp(m) => body.push(m.return_code.as_u8()),
    }

    frame(body)
}

/// Prefix a message body (type byte included) with its length field.
fn frame(body: Vec<u8>) -> Result<Vec<u8>, CodecError> {
    let short_total = body.len() + 1;
    if short_total <= 0xFF {
        let mut out = Vec::with_capacity(short_total);
        out.push(short_total as u8);
        out.extend_from_slice(&body);
        return Ok(out);
    }
    let long_total = body.len() + 3;
    if long_total > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(long_total));
    }
    let mut out = Vec::with_capacity(long_total);
    out.push(LONG_LENGTH_MARKER);
    out.extend_from_slice(&(long_total as u16).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}
