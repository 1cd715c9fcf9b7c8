use core::convert::TryFrom;
use core::str;

use nom::{
    combinator::map_res,
    multi::length_data,
    number::complete::{be_u16, be_u8},
    IResult,
};

use crate::packet::*;

/// Per-variant body parsers work on the fully buffered remaining region
/// with a plain `()` error; any failure collapses into
/// [`DecodeError::MalformedPacket`], the way a broker treats a bad body.
type Parsed<'a, O> = IResult<&'a [u8], O, ()>;

fn fail<O>() -> Parsed<'static, O> {
    Err(nom::Err::Error(()))
}

/// Two byte big-endian length prefix followed by that many bytes.
fn prefixed_bytes(input: &[u8]) -> Parsed<&[u8]> {
    length_data(be_u16)(input)
}

/// Length-prefixed UTF-8 text. A zero length prefix is the empty string;
/// nothing on the wire is NUL terminated.
fn utf_string(input: &[u8]) -> Parsed<&str> {
    map_res(prefixed_bytes, str::from_utf8)(input)
}

/// A QoS byte. Reserved values, including the SUBACK failure marker,
/// are not accepted here.
fn qos_level(input: &[u8]) -> Parsed<QoS> {
    let (rest, byte) = be_u8(input)?;
    match QoS::try_from(byte) {
        Ok(qos) => Ok((rest, qos)),
        Err(_) => fail(),
    }
}

impl Header {
    /// Splits the fixed header byte and the remaining length off the
    /// front of `input`, returning what follows (the packet body onward).
    pub fn decode(input: &[u8]) -> Result<(Header, &[u8]), DecodeError> {
        let (&first, mut rest) = input.split_first().ok_or(DecodeError::Truncated)?;
        let packet_type = PacketType::try_from(first >> 4)
            .map_err(|_| DecodeError::UnsupportedPacketType(first >> 4))?;

        // seven payload bits per length byte, low bits first, at most
        // four bytes
        let mut remaining_length = 0usize;
        let mut shift = 0u32;
        loop {
            let (&byte, tail) = rest.split_first().ok_or(DecodeError::Truncated)?;
            rest = tail;
            remaining_length |= usize::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 21 {
                return Err(DecodeError::OversizedRemainingLength);
            }
        }

        Ok((
            Header {
                packet_type,
                flags: first & 0x0F,
                remaining_length,
            },
            rest,
        ))
    }
}

impl<'a> Packet<'a> {
    /// Decodes one complete control packet from the front of `input`,
    /// returning it together with the unconsumed tail.
    pub fn decode(input: &'a [u8]) -> Result<(Packet<'a>, &'a [u8]), DecodeError> {
        let (header, rest) = Header::decode(input)?;
        if rest.len() < header.remaining_length {
            return Err(DecodeError::Truncated);
        }
        let (body, rest) = rest.split_at(header.remaining_length);
        let packet = decode_body(header.packet_type, header.flags, body)?;

        Ok((packet, rest))
    }
}

/// Runs a body parser that must consume the whole remaining region.
fn exact<'a, O>(res: Parsed<'a, O>) -> Option<O> {
    match res {
        Ok((rest, value)) if rest.is_empty() => Some(value),
        _ => None,
    }
}

/// Decodes a fully buffered remaining region whose fixed header is
/// already known. This is the entry point of the incremental parser.
pub fn decode_body<'a>(
    packet_type: PacketType,
    flags: u8,
    body: &'a [u8],
) -> Result<Packet<'a>, DecodeError> {
    // PUBREL, SUBSCRIBE and UNSUBSCRIBE carry a mandatory 0b0010 flag
    // nibble; a wrong nibble falls through to the malformed arm
    let packet = match packet_type {
        PacketType::Connect => exact(connect(body)).map(Packet::Connect),
        PacketType::ConnAck => exact(conn_ack(body)).map(Packet::ConnAck),
        PacketType::Publish => exact(publish(flags, body)).map(Packet::Publish),
        PacketType::PubAck => exact(be_u16(body)).map(Packet::PubAck),
        PacketType::PubRec => exact(be_u16(body)).map(Packet::PubRec),
        PacketType::PubRel if flags == 0x02 => exact(be_u16(body)).map(Packet::PubRel),
        PacketType::PubComp => exact(be_u16(body)).map(Packet::PubComp),
        PacketType::Subscribe if flags == 0x02 => {
            exact(subscribe(body)).map(Packet::Subscribe)
        }
        PacketType::SubAck => exact(sub_ack(body)).map(Packet::SubAck),
        PacketType::Unsubscribe if flags == 0x02 => {
            exact(unsubscribe(body)).map(Packet::Unsubscribe)
        }
        PacketType::UnsubAck => exact(be_u16(body)).map(Packet::UnsubAck),
        PacketType::PingReq if body.is_empty() => Some(Packet::PingReq),
        PacketType::PingResp if body.is_empty() => Some(Packet::PingResp),
        PacketType::Disconnect if body.is_empty() => Some(Packet::Disconnect),
        _ => None,
    };

    packet.ok_or(DecodeError::MalformedPacket(packet_type))
}

fn connect(input: &[u8]) -> Parsed<Connect<'_>> {
    let (input, name) = utf_string(input)?;
    let (input, level) = be_u8(input)?;
    let version = match ProtocolVersion::try_from(level) {
        Ok(version) if version.protocol_name() == name => version,
        _ => return fail(),
    };

    let (input, flag_bits) = be_u8(input)?;
    let flags = match ConnectFlags::from_bits(flag_bits) {
        Some(flags) => flags,
        None => return fail(),
    };
    if flags.contains(ConnectFlags::PASSWORD) && !flags.contains(ConnectFlags::USERNAME) {
        return fail();
    }
    if !flags.contains(ConnectFlags::WILL)
        && flags.intersects(ConnectFlags::WILL_QOS | ConnectFlags::WILL_RETAIN)
    {
        return fail();
    }

    let (input, keep_alive) = be_u16(input)?;
    let (input, client_id) = utf_string(input)?;
    if client_id.is_empty() && !flags.contains(ConnectFlags::CLEAN_SESSION) {
        return fail();
    }

    let (input, will) = if flags.contains(ConnectFlags::WILL) {
        let qos = match flags.will_qos() {
            Some(qos) => qos,
            None => return fail(),
        };
        let (input, topic) = utf_string(input)?;
        let (input, payload) = prefixed_bytes(input)?;
        if topic.is_empty() || payload.is_empty() {
            return fail();
        }
        let will = Will {
            topic,
            payload,
            qos,
            retain: flags.contains(ConnectFlags::WILL_RETAIN),
        };
        (input, Some(will))
    } else {
        (input, None)
    };

    let (input, username) = if flags.contains(ConnectFlags::USERNAME) {
        let (input, username) = utf_string(input)?;
        (input, Some(username))
    } else {
        (input, None)
    };
    let (input, password) = if flags.contains(ConnectFlags::PASSWORD) {
        let (input, password) = prefixed_bytes(input)?;
        (input, Some(password))
    } else {
        (input, None)
    };

    Ok((
        input,
        Connect {
            version,
            clean_session: flags.contains(ConnectFlags::CLEAN_SESSION),
            keep_alive,
            client_id,
            will,
            username,
            password,
        },
    ))
}

fn conn_ack(input: &[u8]) -> Parsed<ConnAck> {
    let (input, ack_flags) = be_u8(input)?;
    if ack_flags & !0x01 != 0 {
        return fail();
    }
    let (input, code) = be_u8(input)?;
    match ConnectReturnCode::try_from(code) {
        Ok(return_code) => Ok((
            input,
            ConnAck {
                session_present: ack_flags != 0,
                return_code,
            },
        )),
        Err(_) => fail(),
    }
}

fn publish(flags: u8, input: &[u8]) -> Parsed<Publish<'_>> {
    let qos = match QoS::try_from((flags >> 1) & 0x03) {
        Ok(qos) => qos,
        Err(_) => return fail(),
    };

    let (input, topic) = utf_string(input)?;
    if topic.is_empty() || topic.bytes().any(|b| b == b'#' || b == b'+') {
        return fail();
    }

    let (input, packet_id) = if qos == QoS::AtMostOnce {
        (input, None)
    } else {
        let (input, packet_id) = be_u16(input)?;
        (input, Some(packet_id))
    };

    // everything after the topic and the optional id is payload
    Ok((
        &[][..],
        Publish {
            dup: flags & 0x08 != 0,
            qos,
            retain: flags & 0x01 != 0,
            topic,
            packet_id,
            payload: input,
        },
    ))
}

fn subscribe(input: &[u8]) -> Parsed<Subscribe<'_>> {
    let (mut input, packet_id) = be_u16(input)?;

    let mut topics = Vec::new();
    while !input.is_empty() {
        if topics.len() == MAX_SUBSCRIPTIONS {
            return fail();
        }
        let (rest, filter) = utf_string(input)?;
        let (rest, qos) = qos_level(rest)?;
        if filter.is_empty() {
            return fail();
        }
        topics.push((filter, qos));
        input = rest;
    }
    if topics.is_empty() {
        return fail();
    }

    Ok((input, Subscribe { packet_id, topics }))
}

fn sub_ack(input: &[u8]) -> Parsed<SubAck> {
    let (mut input, packet_id) = be_u16(input)?;

    let mut granted = Vec::new();
    while !input.is_empty() {
        if granted.len() == MAX_SUBSCRIPTIONS {
            return fail();
        }
        let (rest, byte) = be_u8(input)?;
        match SubAckReturnCode::from_byte(byte) {
            Some(code) => granted.push(code),
            None => return fail(),
        }
        input = rest;
    }
    if granted.is_empty() {
        return fail();
    }

    Ok((input, SubAck { packet_id, granted }))
}

fn unsubscribe(input: &[u8]) -> Parsed<Unsubscribe<'_>> {
    let (mut input, packet_id) = be_u16(input)?;

    let mut topics = Vec::new();
    while !input.is_empty() {
        if topics.len() == MAX_SUBSCRIPTIONS {
            return fail();
        }
        let (rest, filter) = utf_string(input)?;
        if filter.is_empty() {
            return fail();
        }
        topics.push(filter);
        input = rest;
    }
    if topics.is_empty() {
        return fail();
    }

    Ok((input, Unsubscribe { packet_id, topics }))
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;

    use super::*;

    /// Decodes `bytes` as exactly one packet with nothing trailing.
    fn decode(bytes: &[u8]) -> Result<Packet<'_>, DecodeError> {
        let (packet, rest) = Packet::decode(bytes)?;
        assert!(rest.is_empty(), "undecoded trailing bytes: {:?}", rest);
        Ok(packet)
    }

    #[test]
    fn test_header() {
        assert_eq!(
            Header::decode(b"\x20\x02\x00\x00"),
            Ok((
                Header {
                    packet_type: PacketType::ConnAck,
                    flags: 0,
                    remaining_length: 2,
                },
                &b"\x00\x00"[..],
            ))
        );
        assert_eq!(
            Header::decode(b"\x3b\x00"),
            Ok((
                Header {
                    packet_type: PacketType::Publish,
                    flags: 0x0B,
                    remaining_length: 0,
                },
                &b""[..],
            ))
        );

        assert_eq!(Header::decode(b""), Err(DecodeError::Truncated));
        assert_eq!(Header::decode(b"\x30"), Err(DecodeError::Truncated));
        assert_eq!(Header::decode(b"\x30\x80"), Err(DecodeError::Truncated));
        assert_eq!(
            Header::decode(b"\x00\x00"),
            Err(DecodeError::UnsupportedPacketType(0)),
            "type nibble zero is reserved"
        );
        assert_eq!(
            Header::decode(b"\xf0\x00"),
            Err(DecodeError::UnsupportedPacketType(15)),
            "type nibble fifteen is reserved"
        );
    }

    #[test]
    fn test_remaining_length_boundaries() {
        for &(bytes, expected) in &[
            (&b"\x00"[..], 0),
            (&b"\x7f"[..], 127),
            (&b"\x80\x01"[..], 128),
            (&b"\xff\x7f"[..], 16_383),
            (&b"\x80\x80\x01"[..], 16_384),
            (&b"\xff\xff\x7f"[..], 2_097_151),
            (&b"\x80\x80\x80\x01"[..], 2_097_152),
            (&b"\xff\xff\xff\x7f"[..], 268_435_455),
        ] {
            let mut input = vec![0x30];
            input.extend_from_slice(bytes);
            let (header, rest) = Header::decode(&input).unwrap();
            assert_eq!(header.remaining_length, expected, "length bytes {:?}", bytes);
            assert!(rest.is_empty());
        }

        // 268435456 needs a fifth length byte
        assert_eq!(
            Header::decode(b"\x30\x80\x80\x80\x80\x01"),
            Err(DecodeError::OversizedRemainingLength)
        );
    }

    #[test]
    fn test_connect() {
        assert_eq!(
            decode(b"\x10\x0D\x00\x04MQTT\x04\x02\x00\x3C\x00\x01c"),
            Ok(Packet::Connect(Connect {
                version: ProtocolVersion::V311,
                clean_session: true,
                keep_alive: 60,
                client_id: "c",
                will: None,
                username: None,
                password: None,
            }))
        );

        assert_eq!(
            decode(b"\x10\x13\x00\x06MQIsdp\x03\x00\x00\x0A\x00\x05relay"),
            Ok(Packet::Connect(Connect {
                version: ProtocolVersion::V31,
                clean_session: false,
                keep_alive: 10,
                client_id: "relay",
                will: None,
                username: None,
                password: None,
            })),
            "3.1 pairs the MQIsdp name with level 3"
        );

        assert_eq!(
            decode(
                b"\x10\x27\x00\x04MQTT\x04\xEC\x00\x1E\x00\x03cli\
                  \x00\x05state\x00\x04gone\x00\x04user\x00\x03key"
            ),
            Ok(Packet::Connect(Connect {
                version: ProtocolVersion::V311,
                clean_session: false,
                keep_alive: 30,
                client_id: "cli",
                will: Some(Will {
                    topic: "state",
                    payload: b"gone",
                    qos: QoS::AtLeastOnce,
                    retain: true,
                }),
                username: Some("user"),
                password: Some(b"key"),
            })),
            "will, username and password together"
        );

        assert_eq!(
            decode(b"\x10\x0C\x00\x04MQTT\x04\x02\x00\x3C\x00\x00"),
            Ok(Packet::Connect(Connect {
                version: ProtocolVersion::V311,
                clean_session: true,
                keep_alive: 60,
                client_id: "",
                will: None,
                username: None,
                password: None,
            })),
            "a zero length client id decodes as the empty string"
        );

        let malformed = Err(DecodeError::MalformedPacket(PacketType::Connect));
        assert_eq!(
            decode(b"\x10\x0D\x00\x04MQTT\x03\x02\x00\x3C\x00\x01c"),
            malformed,
            "name and level must agree"
        );
        assert_eq!(
            decode(b"\x10\x0D\x00\x04MQXX\x04\x02\x00\x3C\x00\x01c"),
            malformed,
            "unknown protocol name"
        );
        assert_eq!(
            decode(b"\x10\x0D\x00\x04MQTT\x04\x03\x00\x3C\x00\x01c"),
            malformed,
            "reserved flag bit set"
        );
        assert_eq!(
            decode(b"\x10\x0D\x00\x04MQTT\x04\x1A\x00\x3C\x00\x01c"),
            malformed,
            "will QoS and retain bits without the will flag"
        );
        assert_eq!(
            decode(b"\x10\x12\x00\x04MQTT\x04\x42\x00\x3C\x00\x01c\x00\x03key"),
            malformed,
            "password flag without a username"
        );
        assert_eq!(
            decode(b"\x10\x11\x00\x04MQTT\x04\x06\x00\x3C\x00\x01c\x00\x00\x00\x00"),
            malformed,
            "will flag with an empty will topic"
        );
        assert_eq!(
            decode(b"\x10\x0C\x00\x04MQTT\x04\x00\x00\x3C\x00\x00"),
            malformed,
            "empty client id needs the clean session flag"
        );
        assert_eq!(
            decode(b"\x10\x07\x00\x04MQTT\x04\x02"),
            malformed,
            "body ends inside the variable header"
        );
    }

    #[test]
    fn test_conn_ack() {
        assert_eq!(
            decode(b"\x20\x02\x00\x00"),
            Ok(Packet::ConnAck(ConnAck {
                session_present: false,
                return_code: ConnectReturnCode::Accepted,
            }))
        );
        assert_eq!(
            decode(b"\x20\x02\x01\x05"),
            Ok(Packet::ConnAck(ConnAck {
                session_present: true,
                return_code: ConnectReturnCode::NotAuthorized,
            }))
        );

        let malformed = Err(DecodeError::MalformedPacket(PacketType::ConnAck));
        assert_eq!(decode(b"\x20\x02\x02\x00"), malformed, "reserved ack flag bits");
        assert_eq!(decode(b"\x20\x02\x00\x06"), malformed, "unknown return code");
        assert_eq!(decode(b"\x20\x03\x00\x00\x00"), malformed, "overlong body");
    }

    #[test]
    fn test_publish() {
        assert_eq!(
            decode(b"\x30\x05\x00\x01thi"),
            Ok(Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: "t",
                packet_id: None,
                payload: b"hi",
            }))
        );
        assert_eq!(
            decode(b"\x32\x06\x00\x01a\x00\x01x"),
            Ok(Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: "a",
                packet_id: Some(1),
                payload: b"x",
            }))
        );
        assert_eq!(
            decode(b"\x3d\x09\x00\x03a/b\x01\x02ok"),
            Ok(Packet::Publish(Publish {
                dup: true,
                qos: QoS::ExactlyOnce,
                retain: true,
                topic: "a/b",
                packet_id: Some(0x0102),
                payload: b"ok",
            })),
            "dup and retain bits travel in the fixed header"
        );
        assert_eq!(
            decode(b"\x32\x05\x00\x01a\x00\x07"),
            Ok(Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: "a",
                packet_id: Some(7),
                payload: b"",
            })),
            "the payload may be empty"
        );

        let malformed = Err(DecodeError::MalformedPacket(PacketType::Publish));
        assert_eq!(decode(b"\x36\x05\x00\x01thi"), malformed, "QoS bits 0b11 are reserved");
        assert_eq!(decode(b"\x30\x04\x00\x00hi"), malformed, "empty topic name");
        assert_eq!(decode(b"\x30\x04\x00\x02t#"), malformed, "wildcard in a topic name");
        assert_eq!(decode(b"\x32\x04\x00\x01a\x00"), malformed, "QoS 1 without a full id");
    }

    #[test]
    fn test_packet_id_acks() {
        assert_eq!(decode(b"\x40\x02\x00\x01"), Ok(Packet::PubAck(1)));
        assert_eq!(decode(b"\x50\x02\x00\x07"), Ok(Packet::PubRec(7)));
        assert_eq!(decode(b"\x62\x02\x00\x07"), Ok(Packet::PubRel(7)));
        assert_eq!(decode(b"\x70\x02\x00\x07"), Ok(Packet::PubComp(7)));
        assert_eq!(decode(b"\xb0\x02\x12\x34"), Ok(Packet::UnsubAck(0x1234)));

        assert_eq!(
            decode(b"\x60\x02\x00\x07"),
            Err(DecodeError::MalformedPacket(PacketType::PubRel)),
            "PUBREL must carry the 0b0010 flag nibble"
        );
        assert_eq!(
            decode(b"\x40\x03\x00\x01\x00"),
            Err(DecodeError::MalformedPacket(PacketType::PubAck)),
            "an ack body is exactly two bytes"
        );
        assert_eq!(
            decode(b"\x40\x01\x00"),
            Err(DecodeError::MalformedPacket(PacketType::PubAck))
        );
    }

    #[test]
    fn test_subscribe() {
        assert_eq!(
            decode(b"\x82\x0c\x00\x02\x00\x03a/b\x01\x00\x01c\x02"),
            Ok(Packet::Subscribe(Subscribe {
                packet_id: 2,
                topics: vec![("a/b", QoS::AtLeastOnce), ("c", QoS::ExactlyOnce)],
            }))
        );

        let malformed = Err(DecodeError::MalformedPacket(PacketType::Subscribe));
        assert_eq!(
            decode(b"\x80\x0c\x00\x02\x00\x03a/b\x01\x00\x01c\x02"),
            malformed,
            "SUBSCRIBE must carry the 0b0010 flag nibble"
        );
        assert_eq!(decode(b"\x82\x02\x00\x02"), malformed, "at least one filter required");
        assert_eq!(decode(b"\x82\x07\x00\x02\x00\x03a/b"), malformed, "filter without a QoS");
        assert_eq!(
            decode(b"\x82\x08\x00\x02\x00\x03a/b\x03"),
            malformed,
            "reserved requested QoS"
        );
        assert_eq!(decode(b"\x82\x05\x00\x02\x00\x05a"), malformed, "truncated filter list");

        // 129 filters exceed the per-request cap
        let mut input = vec![0x82, 0x86, 0x04, 0x00, 0x01];
        for _ in 0..129 {
            input.extend_from_slice(b"\x00\x01t\x00");
        }
        assert_eq!(decode(&input), malformed);
    }

    #[test]
    fn test_sub_ack() {
        assert_eq!(
            decode(b"\x90\x06\x00\x05\x00\x01\x80\x02"),
            Ok(Packet::SubAck(SubAck {
                packet_id: 5,
                granted: vec![
                    SubAckReturnCode::Granted(QoS::AtMostOnce),
                    SubAckReturnCode::Granted(QoS::AtLeastOnce),
                    SubAckReturnCode::Failure,
                    SubAckReturnCode::Granted(QoS::ExactlyOnce),
                ],
            }))
        );

        let malformed = Err(DecodeError::MalformedPacket(PacketType::SubAck));
        assert_eq!(decode(b"\x90\x02\x00\x05"), malformed, "no granted codes");
        assert_eq!(decode(b"\x90\x03\x00\x05\x03"), malformed, "reserved granted code");
    }

    #[test]
    fn test_unsubscribe() {
        assert_eq!(
            decode(b"\xa2\x0c\x00\x09\x00\x03a/b\x00\x03c/d"),
            Ok(Packet::Unsubscribe(Unsubscribe {
                packet_id: 9,
                topics: vec!["a/b", "c/d"],
            }))
        );

        let malformed = Err(DecodeError::MalformedPacket(PacketType::Unsubscribe));
        assert_eq!(
            decode(b"\xa0\x07\x00\x09\x00\x03a/b"),
            malformed,
            "UNSUBSCRIBE must carry the 0b0010 flag nibble"
        );
        assert_eq!(decode(b"\xa2\x02\x00\x09"), malformed, "at least one filter required");
        assert_eq!(decode(b"\xa2\x05\x00\x09\x00\x05a"), malformed, "truncated filter");
    }

    #[test]
    fn test_bodyless_packets() {
        assert_eq!(decode(b"\xc0\x00"), Ok(Packet::PingReq));
        assert_eq!(decode(b"\xd0\x00"), Ok(Packet::PingResp));
        assert_eq!(decode(b"\xe0\x00"), Ok(Packet::Disconnect));

        assert_eq!(
            decode(b"\xe0\x01\x00"),
            Err(DecodeError::MalformedPacket(PacketType::Disconnect)),
            "DISCONNECT carries no body"
        );
    }

    #[test]
    fn test_trailing_bytes_stay_unconsumed() {
        let (packet, rest) = Packet::decode(b"\xd0\x00\x40\x02\x00\x01").unwrap();
        assert_eq!(packet, Packet::PingResp);
        assert_eq!(rest, b"\x40\x02\x00\x01");
    }

    #[test]
    fn test_truncated_input() {
        assert_matches!(
            Packet::decode(b"\x30\x05\x00\x01t"),
            Err(DecodeError::Truncated)
        );
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(
            decode_body(PacketType::PubAck, 0, b"\x00\x01"),
            Ok(Packet::PubAck(1))
        );
        assert_eq!(
            decode_body(PacketType::PubRel, 0, b"\x00\x01"),
            Err(DecodeError::MalformedPacket(PacketType::PubRel))
        );
        assert_eq!(decode_body(PacketType::PingResp, 0, b""), Ok(Packet::PingResp));
    }
}
