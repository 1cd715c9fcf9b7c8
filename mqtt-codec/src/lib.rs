//! Wire codec for MQTT 3.1 / 3.1.1 control packets.
//!
//! The crate covers three layers: the packet model ([`Packet`] and its
//! per-type structs), the serializer ([`Packet::to_bytes`]), and an
//! incremental [`Parser`] that turns arbitrarily fragmented byte chunks
//! back into packets.

#[macro_use]
extern crate bitflags;

mod decode;
mod encode;
mod packet;
mod parser;

pub use decode::decode_body;
pub use packet::{
    ConnAck, Connect, ConnectFlags, ConnectReturnCode, DecodeError, Header, Packet, PacketId,
    PacketType, ProtocolVersion, Publish, QoS, SubAck, SubAckReturnCode, Subscribe, Unsubscribe,
    Will, MAX_SUBSCRIPTIONS,
};
pub use parser::Parser;
