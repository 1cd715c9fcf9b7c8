use bytes::BufMut;

use crate::packet::*;

/// Number of bytes the variable length encoding of `n` occupies.
fn remaining_length_size(n: usize) -> usize {
    match n {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        2_097_152..=268_435_455 => 4,
        _ => panic!("remaining length {} out of range", n),
    }
}

/// Seven payload bits per byte, low bits first, high bit flags another
/// byte to come.
fn put_remaining_length<B: BufMut>(buf: &mut B, mut n: usize) {
    loop {
        let mut byte = (n & 0x7F) as u8;
        n >>= 7;
        if n > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if n == 0 {
            break;
        }
    }
}

/// Two byte length prefix followed by the bytes themselves.
fn put_prefixed<B: BufMut>(buf: &mut B, bytes: &[u8]) {
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn put_str<B: BufMut>(buf: &mut B, s: &str) {
    put_prefixed(buf, s.as_bytes());
}

impl Packet<'_> {
    /// The control packet type of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// The fixed header byte: type nibble plus flag bits. Only PUBLISH
    /// has variable flags; PUBREL, SUBSCRIBE and UNSUBSCRIBE always
    /// carry 0b0010.
    fn header_byte(&self) -> u8 {
        match self {
            Packet::Connect(_) => 0x10,
            Packet::ConnAck(_) => 0x20,
            Packet::Publish(publish) => {
                0x30 | ((publish.dup as u8) << 3)
                    | ((publish.qos as u8) << 1)
                    | publish.retain as u8
            }
            Packet::PubAck(_) => 0x40,
            Packet::PubRec(_) => 0x50,
            Packet::PubRel(_) => 0x62,
            Packet::PubComp(_) => 0x70,
            Packet::Subscribe(_) => 0x82,
            Packet::SubAck(_) => 0x90,
            Packet::Unsubscribe(_) => 0xA2,
            Packet::UnsubAck(_) => 0xB0,
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect => 0xE0,
        }
    }

    /// Byte count of the variable header and payload.
    fn body_len(&self) -> usize {
        match self {
            Packet::Connect(connect) => connect.body_len(),
            Packet::ConnAck(_) => 2,
            Packet::Publish(publish) => publish.body_len(),
            Packet::PubAck(_)
            | Packet::PubRec(_)
            | Packet::PubRel(_)
            | Packet::PubComp(_)
            | Packet::UnsubAck(_) => 2,
            Packet::Subscribe(subscribe) => {
                2 + subscribe
                    .topics
                    .iter()
                    .map(|(filter, _)| 3 + filter.len())
                    .sum::<usize>()
            }
            Packet::SubAck(sub_ack) => 2 + sub_ack.granted.len(),
            Packet::Unsubscribe(unsubscribe) => {
                2 + unsubscribe
                    .topics
                    .iter()
                    .map(|filter| 2 + filter.len())
                    .sum::<usize>()
            }
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
        }
    }

    /// Serializes the packet into a buffer of exactly the right size.
    pub fn to_bytes(&self) -> Vec<u8> {
        let body_len = self.body_len();
        let mut buf = Vec::with_capacity(1 + remaining_length_size(body_len) + body_len);

        buf.put_u8(self.header_byte());
        put_remaining_length(&mut buf, body_len);
        self.put_body(&mut buf);
        debug_assert_eq!(buf.len(), buf.capacity());

        buf
    }

    fn put_body<B: BufMut>(&self, buf: &mut B) {
        match self {
            Packet::Connect(connect) => connect.put(buf),
            Packet::ConnAck(ack) => {
                buf.put_u8(ack.session_present as u8);
                buf.put_u8(ack.return_code as u8);
            }
            Packet::Publish(publish) => publish.put(buf),
            Packet::PubAck(packet_id)
            | Packet::PubRec(packet_id)
            | Packet::PubRel(packet_id)
            | Packet::PubComp(packet_id)
            | Packet::UnsubAck(packet_id) => buf.put_u16(*packet_id),
            Packet::Subscribe(subscribe) => {
                buf.put_u16(subscribe.packet_id);
                for &(filter, qos) in &subscribe.topics {
                    put_str(buf, filter);
                    buf.put_u8(qos as u8);
                }
            }
            Packet::SubAck(sub_ack) => {
                buf.put_u16(sub_ack.packet_id);
                for &code in &sub_ack.granted {
                    buf.put_u8(code.into());
                }
            }
            Packet::Unsubscribe(unsubscribe) => {
                buf.put_u16(unsubscribe.packet_id);
                for &filter in &unsubscribe.topics {
                    put_str(buf, filter);
                }
            }
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => {}
        }
    }
}

impl Connect<'_> {
    fn flag_bits(&self) -> ConnectFlags {
        let mut flags = ConnectFlags::empty();
        if self.clean_session {
            flags |= ConnectFlags::CLEAN_SESSION;
        }
        if let Some(ref will) = self.will {
            flags |= ConnectFlags::WILL;
            flags |= ConnectFlags::from_bits_truncate((will.qos as u8) << 3);
            if will.retain {
                flags |= ConnectFlags::WILL_RETAIN;
            }
        }
        if self.username.is_some() {
            flags |= ConnectFlags::USERNAME;
            // a password is only legal alongside a username
            if self.password.is_some() {
                flags |= ConnectFlags::PASSWORD;
            }
        }
        flags
    }

    fn body_len(&self) -> usize {
        let mut n = 2 + self.version.protocol_name().len()  // protocol name
            + 4                                             // level, flags, keep alive
            + 2 + self.client_id.len();
        if let Some(ref will) = self.will {
            n += 4 + will.topic.len() + will.payload.len();
        }
        if let Some(username) = self.username {
            n += 2 + username.len();
            if let Some(password) = self.password {
                n += 2 + password.len();
            }
        }
        n
    }

    fn put<B: BufMut>(&self, buf: &mut B) {
        put_str(buf, self.version.protocol_name());
        buf.put_u8(self.version as u8);
        buf.put_u8(self.flag_bits().bits());
        buf.put_u16(self.keep_alive);
        put_str(buf, self.client_id);
        if let Some(ref will) = self.will {
            put_str(buf, will.topic);
            put_prefixed(buf, will.payload);
        }
        if let Some(username) = self.username {
            put_str(buf, username);
            if let Some(password) = self.password {
                put_prefixed(buf, password);
            }
        }
    }
}

impl Publish<'_> {
    fn body_len(&self) -> usize {
        2 + self.topic.len()
            + self.packet_id.map_or(0, |_| 2)
            + self.payload.len()
    }

    fn put<B: BufMut>(&self, buf: &mut B) {
        put_str(buf, self.topic);
        if let Some(packet_id) = self.packet_id {
            buf.put_u16(packet_id);
        }
        buf.put_slice(self.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_length_encoding() {
        for &(value, bytes) in &[
            (0, &b"\x00"[..]),
            (127, &b"\x7f"[..]),
            (128, &b"\x80\x01"[..]),
            (16_383, &b"\xff\x7f"[..]),
            (16_384, &b"\x80\x80\x01"[..]),
            (2_097_151, &b"\xff\xff\x7f"[..]),
            (2_097_152, &b"\x80\x80\x80\x01"[..]),
            (268_435_455, &b"\xff\xff\xff\x7f"[..]),
        ] {
            let mut buf = Vec::new();
            put_remaining_length(&mut buf, value);
            assert_eq!(buf, bytes, "encoding of {}", value);
            assert_eq!(remaining_length_size(value), bytes.len());
        }
    }

    #[test]
    fn test_connect() {
        let connect = Packet::Connect(Connect {
            version: ProtocolVersion::V311,
            clean_session: true,
            keep_alive: 60,
            client_id: "c",
            will: None,
            username: None,
            password: None,
        });
        assert_eq!(
            connect.to_bytes(),
            b"\x10\x0D\x00\x04MQTT\x04\x02\x00\x3C\x00\x01c"
        );

        let connect = Packet::Connect(Connect {
            version: ProtocolVersion::V31,
            clean_session: false,
            keep_alive: 10,
            client_id: "relay",
            will: None,
            username: None,
            password: None,
        });
        assert_eq!(
            connect.to_bytes(),
            b"\x10\x13\x00\x06MQIsdp\x03\x00\x00\x0A\x00\x05relay",
            "3.1 uses the MQIsdp name and level 3"
        );

        let connect = Packet::Connect(Connect {
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
        });
        assert_eq!(
            connect.to_bytes(),
            &b"\x10\x27\x00\x04MQTT\x04\xEC\x00\x1E\x00\x03cli\
               \x00\x05state\x00\x04gone\x00\x04user\x00\x03key"[..],
            "will, username and password set every flag bit involved"
        );

        let connect = Packet::Connect(Connect {
            version: ProtocolVersion::V311,
            clean_session: true,
            keep_alive: 60,
            client_id: "c",
            will: None,
            username: None,
            password: Some(b"orphan"),
        });
        assert_eq!(
            connect.to_bytes(),
            b"\x10\x0D\x00\x04MQTT\x04\x02\x00\x3C\x00\x01c",
            "a password without a username stays off the wire"
        );
    }

    #[test]
    fn test_conn_ack() {
        let ack = Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: ConnectReturnCode::Accepted,
        });
        assert_eq!(ack.to_bytes(), b"\x20\x02\x00\x00");

        let ack = Packet::ConnAck(ConnAck {
            session_present: true,
            return_code: ConnectReturnCode::BadCredentials,
        });
        assert_eq!(ack.to_bytes(), b"\x20\x02\x01\x04");
    }

    #[test]
    fn test_publish() {
        let publish = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "t",
            packet_id: None,
            payload: b"hi",
        });
        assert_eq!(publish.to_bytes(), b"\x30\x05\x00\x01thi");

        let publish = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "a",
            packet_id: Some(1),
            payload: b"x",
        });
        assert_eq!(publish.to_bytes(), b"\x32\x06\x00\x01a\x00\x01x");

        let publish = Packet::Publish(Publish {
            dup: true,
            qos: QoS::ExactlyOnce,
            retain: true,
            topic: "a/b",
            packet_id: Some(0x0102),
            payload: b"ok",
        });
        assert_eq!(
            publish.to_bytes(),
            b"\x3d\x09\x00\x03a/b\x01\x02ok",
            "dup, QoS and retain land in the header flag nibble"
        );
    }

    #[test]
    fn test_packet_id_acks() {
        assert_eq!(Packet::PubAck(1).to_bytes(), b"\x40\x02\x00\x01");
        assert_eq!(Packet::PubRec(7).to_bytes(), b"\x50\x02\x00\x07");
        assert_eq!(Packet::PubRel(7).to_bytes(), b"\x62\x02\x00\x07");
        assert_eq!(Packet::PubComp(7).to_bytes(), b"\x70\x02\x00\x07");
        assert_eq!(Packet::UnsubAck(0x1234).to_bytes(), b"\xb0\x02\x12\x34");
    }

    #[test]
    fn test_subscribe() {
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id: 2,
            topics: vec![("a/b", QoS::AtLeastOnce), ("c", QoS::ExactlyOnce)],
        });
        assert_eq!(
            subscribe.to_bytes(),
            b"\x82\x0c\x00\x02\x00\x03a/b\x01\x00\x01c\x02"
        );

        let sub_ack = Packet::SubAck(SubAck {
            packet_id: 5,
            granted: vec![
                SubAckReturnCode::Granted(QoS::AtLeastOnce),
                SubAckReturnCode::Failure,
            ],
        });
        assert_eq!(sub_ack.to_bytes(), b"\x90\x04\x00\x05\x01\x80");

        let unsubscribe = Packet::Unsubscribe(Unsubscribe {
            packet_id: 9,
            topics: vec!["a/b", "c/d"],
        });
        assert_eq!(
            unsubscribe.to_bytes(),
            b"\xa2\x0c\x00\x09\x00\x03a/b\x00\x03c/d"
        );
    }

    #[test]
    fn test_bodyless_packets() {
        assert_eq!(Packet::PingReq.to_bytes(), b"\xc0\x00");
        assert_eq!(Packet::PingResp.to_bytes(), b"\xd0\x00");
        assert_eq!(Packet::Disconnect.to_bytes(), b"\xe0\x00");
    }

    #[test]
    fn test_round_trip() {
        let packets = vec![
            Packet::Connect(Connect {
                version: ProtocolVersion::V311,
                clean_session: true,
                keep_alive: 30,
                client_id: "round-trip",
                will: Some(Will {
                    topic: "status",
                    payload: b"offline",
                    qos: QoS::AtLeastOnce,
                    retain: true,
                }),
                username: Some("user"),
                password: Some(b"pass"),
            }),
            Packet::ConnAck(ConnAck {
                session_present: true,
                return_code: ConnectReturnCode::ServerUnavailable,
            }),
            Packet::Publish(Publish {
                dup: false,
                qos: QoS::ExactlyOnce,
                retain: false,
                topic: "a/b",
                packet_id: Some(42),
                payload: b"payload",
            }),
            Packet::PubAck(42),
            Packet::PubRec(42),
            Packet::PubRel(42),
            Packet::PubComp(42),
            Packet::Subscribe(Subscribe {
                packet_id: 43,
                topics: vec![("a/+", QoS::AtLeastOnce), ("b/#", QoS::AtMostOnce)],
            }),
            Packet::SubAck(SubAck {
                packet_id: 43,
                granted: vec![
                    SubAckReturnCode::Granted(QoS::AtLeastOnce),
                    SubAckReturnCode::Failure,
                ],
            }),
            Packet::Unsubscribe(Unsubscribe {
                packet_id: 44,
                topics: vec!["a/+"],
            }),
            Packet::UnsubAck(44),
            Packet::PingReq,
            Packet::PingResp,
            Packet::Disconnect,
        ];

        for packet in packets {
            let bytes = packet.to_bytes();
            assert_eq!(
                Packet::decode(&bytes),
                Ok((packet.clone(), &b""[..])),
                "round trip {:?}",
                packet
            );
        }
    }
}
