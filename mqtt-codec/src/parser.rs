use core::convert::TryFrom;
use core::mem;

use crate::decode::decode_body;
use crate::packet::{DecodeError, Packet, PacketType};

const MAX_MULTIPLIER: usize = 128 * 128 * 128;

/// An incremental control packet parser.
///
/// Bytes are pushed in whatever chunks the transport produces; the parser
/// keeps its position across calls and hands every completed packet to the
/// caller's closure. Until the first CONNECT or CONNACK has been seen, any
/// other packet type is a protocol error.
#[derive(Debug, Default)]
pub struct Parser {
    state: State,
    authenticated: bool,
}

#[derive(Debug)]
enum State {
    /// Waiting for the fixed header byte.
    FixedHeader,
    /// Accumulating the variable length remaining-length field.
    RemainingLength {
        packet_type: PacketType,
        packet_flags: u8,
        remaining_length: usize,
        multiplier: usize,
    },
    /// Collecting the remaining region of the announced size.
    Remaining {
        packet_type: PacketType,
        packet_flags: u8,
        remaining_length: usize,
        body: Vec<u8>,
    },
}

impl Default for State {
    fn default() -> Self {
        State::FixedHeader
    }
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rearms the parser for a fresh connection.
    pub fn reset(&mut self) {
        self.state = State::FixedHeader;
        self.authenticated = false;
    }

    /// Consumes a chunk of the inbound byte stream.
    ///
    /// Every packet completed by this chunk is passed to `on_packet`; an
    /// error from the closure, or any protocol violation, aborts the parse.
    pub fn feed<E, F>(&mut self, mut input: &[u8], on_packet: &mut F) -> Result<(), E>
    where
        E: From<DecodeError>,
        F: FnMut(Packet<'_>) -> Result<(), E>,
    {
        while !input.is_empty() {
            match self.state {
                State::FixedHeader => {
                    let b = input[0];
                    input = &input[1..];

                    let packet_type = PacketType::try_from(b >> 4)
                        .map_err(|_| DecodeError::UnsupportedPacketType(b >> 4))?;

                    self.state = State::RemainingLength {
                        packet_type,
                        packet_flags: b & 0x0F,
                        remaining_length: 0,
                        multiplier: 1,
                    };
                }
                State::RemainingLength {
                    packet_type,
                    packet_flags,
                    ref mut remaining_length,
                    ref mut multiplier,
                } => {
                    let b = input[0];
                    input = &input[1..];

                    *remaining_length += usize::from(b & 0x7F) * *multiplier;
                    *multiplier *= 128;

                    let remaining_length = *remaining_length;
                    let multiplier = *multiplier;

                    if b & 0x80 == 0 {
                        if remaining_length == 0 {
                            // PINGREQ, PINGRESP and DISCONNECT complete here
                            self.state = State::FixedHeader;
                            self.dispatch(packet_type, packet_flags, &[], on_packet)?;
                        } else {
                            self.state = State::Remaining {
                                packet_type,
                                packet_flags,
                                remaining_length,
                                body: Vec::with_capacity(remaining_length),
                            };
                        }
                    } else if multiplier > MAX_MULTIPLIER {
                        return Err(DecodeError::OversizedRemainingLength.into());
                    }
                }
                State::Remaining {
                    packet_type,
                    packet_flags,
                    remaining_length,
                    ref mut body,
                } => {
                    let require = remaining_length - body.len();
                    let take = require.min(input.len());
                    body.extend_from_slice(&input[..take]);
                    input = &input[take..];

                    if body.len() == remaining_length {
                        let body = match mem::take(&mut self.state) {
                            State::Remaining { body, .. } => body,
                            _ => unreachable!(),
                        };
                        self.dispatch(packet_type, packet_flags, &body, on_packet)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn dispatch<E, F>(
        &mut self,
        packet_type: PacketType,
        packet_flags: u8,
        body: &[u8],
        on_packet: &mut F,
    ) -> Result<(), E>
    where
        E: From<DecodeError>,
        F: FnMut(Packet<'_>) -> Result<(), E>,
    {
        if !self.authenticated
            && packet_type != PacketType::Connect
            && packet_type != PacketType::ConnAck
        {
            return Err(DecodeError::UnexpectedPacket(packet_type).into());
        }

        let packet = decode_body(packet_type, packet_flags, body).map_err(E::from)?;
        on_packet(packet)?;

        if packet_type == PacketType::Connect || packet_type == PacketType::ConnAck {
            self.authenticated = true;
        }

        Ok(())
    }
}
