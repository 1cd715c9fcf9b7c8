use core::convert::TryFrom;

use derive_more::Display;
use num_enum::TryFromPrimitive;

/// Two byte identifier correlating the packets of one QoS 1/2 handshake.
/// Zero is reserved.
pub type PacketId = u16;

/// Upper bound on the topic list of a single SUBSCRIBE or UNSUBSCRIBE.
pub const MAX_SUBSCRIPTIONS: usize = 128;

/// Protocol revisions this crate speaks.
///
/// The discriminant is the level byte of the CONNECT variable header;
/// each revision pairs it with its own protocol name.
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, PartialOrd, Clone, Copy, TryFromPrimitive)]
pub enum ProtocolVersion {
    V31 = 3,
    V311 = 4,
}

impl ProtocolVersion {
    pub fn protocol_name(self) -> &'static str {
        match self {
            ProtocolVersion::V31 => "MQIsdp",
            ProtocolVersion::V311 => "MQTT",
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::V311
    }
}

/// Delivery guarantee for an application message.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce = 0,
    /// Acknowledged with PUBACK; the sender may deliver duplicates.
    AtLeastOnce = 1,
    /// Four step PUBLISH/PUBREC/PUBREL/PUBCOMP handshake, no loss and
    /// no duplicates.
    ExactlyOnce = 2,
}

/// The fourteen control packet kinds, as encoded in the high nibble of
/// the fixed header byte.
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Copy, Clone, TryFromPrimitive)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

/// What the first bytes of every control packet announce: the type, the
/// raw flag nibble and how many body bytes follow.
#[derive(Debug, PartialEq, Clone)]
pub struct Header {
    pub packet_type: PacketType,
    /// Low nibble of the first byte, meaningful for PUBLISH and fixed
    /// for PUBREL/SUBSCRIBE/UNSUBSCRIBE.
    pub flags: u8,
    pub remaining_length: usize,
}

/// One MQTT control packet.
///
/// Topics and payloads borrow from the buffer the packet was decoded
/// from; acknowledgement kinds that carry nothing but a packet id hold
/// it inline.
#[derive(Debug, PartialEq, Clone)]
pub enum Packet<'a> {
    Connect(Connect<'a>),
    ConnAck(ConnAck),
    Publish(Publish<'a>),
    PubAck(PacketId),
    PubRec(PacketId),
    PubRel(PacketId),
    PubComp(PacketId),
    Subscribe(Subscribe<'a>),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe<'a>),
    UnsubAck(PacketId),
    PingReq,
    PingResp,
    Disconnect,
}

/// Session request sent by a client as its first packet.
#[derive(Debug, PartialEq, Clone)]
pub struct Connect<'a> {
    pub version: ProtocolVersion,
    /// Discard any state the broker still holds for this client id.
    pub clean_session: bool,
    /// Idle interval in seconds after which the broker may drop us.
    pub keep_alive: u16,
    pub client_id: &'a str,
    pub will: Option<Will<'a>>,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
}

bitflags! {
    /// The CONNECT variable header flag byte. Bit 0 is reserved and must
    /// stay clear.
    pub struct ConnectFlags: u8 {
        const CLEAN_SESSION = 0x02;
        const WILL          = 0x04;
        const WILL_QOS      = 0x18;
        const WILL_RETAIN   = 0x20;
        const PASSWORD      = 0x40;
        const USERNAME      = 0x80;
    }
}

impl ConnectFlags {
    /// The will QoS bits, when they name a valid level.
    pub fn will_qos(self) -> Option<QoS> {
        QoS::try_from((self & Self::WILL_QOS).bits() >> 3).ok()
    }
}

/// Message the broker publishes on the client's behalf if the
/// connection dies without a DISCONNECT.
#[derive(Debug, PartialEq, Clone)]
pub struct Will<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
}

/// The broker's answer to CONNECT.
#[derive(Debug, PartialEq, Clone)]
pub struct ConnAck {
    /// The broker kept session state from an earlier connection.
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

/// CONNACK verdicts. Anything but `Accepted` means the broker is about
/// to close the connection.
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Copy, Clone, TryFromPrimitive, Display)]
pub enum ConnectReturnCode {
    #[display(fmt = "connection accepted")]
    Accepted = 0,
    #[display(fmt = "connection refused: unacceptable protocol version")]
    BadProtocolVersion = 1,
    #[display(fmt = "connection refused: client identifier rejected")]
    IdentifierRejected = 2,
    #[display(fmt = "connection refused: server unavailable")]
    ServerUnavailable = 3,
    #[display(fmt = "connection refused: bad user name or password")]
    BadCredentials = 4,
    #[display(fmt = "connection refused: not authorized")]
    NotAuthorized = 5,
}

/// An application message, in either direction.
#[derive(Debug, PartialEq, Clone)]
pub struct Publish<'a> {
    /// Set on retransmissions of an unacknowledged QoS 1/2 message.
    pub dup: bool,
    pub qos: QoS,
    /// Ask the broker to keep the message for future subscribers.
    pub retain: bool,
    pub topic: &'a str,
    /// Present exactly when `qos` is above [`QoS::AtMostOnce`].
    pub packet_id: Option<PacketId>,
    pub payload: &'a [u8],
}

/// Subscription request: up to 128 topic filters with their requested
/// maximum QoS.
#[derive(Debug, PartialEq, Clone)]
pub struct Subscribe<'a> {
    pub packet_id: PacketId,
    pub topics: Vec<(&'a str, QoS)>,
}

/// The broker's verdict on a SUBSCRIBE, one code per requested filter.
#[derive(Debug, PartialEq, Clone)]
pub struct SubAck {
    pub packet_id: PacketId,
    pub granted: Vec<SubAckReturnCode>,
}

/// One element of a SUBACK payload: the granted QoS, or 0x80 for a
/// filter the broker refused.
#[derive(Debug, PartialEq, Copy, Clone)]
pub enum SubAckReturnCode {
    Granted(QoS),
    Failure,
}

impl SubAckReturnCode {
    pub const FAILURE: u8 = 0x80;

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        if byte == Self::FAILURE {
            Some(SubAckReturnCode::Failure)
        } else {
            QoS::try_from(byte).ok().map(SubAckReturnCode::Granted)
        }
    }
}

impl From<SubAckReturnCode> for u8 {
    fn from(code: SubAckReturnCode) -> u8 {
        match code {
            SubAckReturnCode::Granted(qos) => qos as u8,
            SubAckReturnCode::Failure => SubAckReturnCode::FAILURE,
        }
    }
}

/// Unsubscription request for up to 128 topic filters.
#[derive(Debug, PartialEq, Clone)]
pub struct Unsubscribe<'a> {
    pub packet_id: PacketId,
    pub topics: Vec<&'a str>,
}

/// The ways a byte stream can fail to decode as a control packet.
#[derive(Debug, Eq, PartialEq, Clone, Display)]
pub enum DecodeError {
    /// The fixed header type nibble does not name a control packet.
    #[display(fmt = "unsupported packet type: {}", _0)]
    UnsupportedPacketType(u8),
    /// The remaining length field used more than four bytes.
    #[display(fmt = "oversized remaining length")]
    OversizedRemainingLength,
    /// The input ended before the announced packet did.
    #[display(fmt = "truncated packet")]
    Truncated,
    /// The remaining region does not decode as a packet of the announced
    /// type.
    #[display(fmt = "malformed {:?} packet", _0)]
    MalformedPacket(PacketType),
    /// A packet other than CONNECT or CONNACK arrived before the session
    /// was authenticated.
    #[display(fmt = "unexpected {:?} packet before CONNACK", _0)]
    UnexpectedPacket(PacketType),
}

impl std::error::Error for DecodeError {}
