use std::collections::HashMap;
use std::io;

use log::{debug, warn};

use mqtt_codec::{
    Packet, PacketId, PacketType, Publish, QoS, Subscribe, Unsubscribe, MAX_SUBSCRIPTIONS,
};

use crate::error::Error;
use crate::events::EventHandler;
use crate::transport::Sender;

/// Which side of the handshake a publication record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Direction {
    /// We published the message and track the peer's acknowledgements.
    Outbound,
    /// We received the message and owe the peer acknowledgements.
    Inbound,
}

/// Where an in-flight publication stands in its QoS handshake.
///
/// `Send*` states hold a packet whose wire write failed and must be
/// retried; `Wait*` states have the packet on the wire and await the
/// peer's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InflightState {
    SendPublish,
    SendPubAck,
    SendPubRec,
    SendPubRel,
    SendPubComp,
    WaitPubAck,
    WaitPubRec,
    WaitPubRel,
    WaitPubComp,
}

/// One QoS 1/2 publication between first send and terminal acknowledgement.
#[derive(Debug)]
struct Inflight {
    topic: String,
    qos: QoS,
    retain: bool,
    payload: Vec<u8>,
    state: InflightState,
    /// Session clock second of the last wire attempt for this record.
    last_action: u64,
}

/// What a clock tick decided about the link.
#[derive(Debug, PartialEq, Eq)]
pub enum Tick {
    Alive,
    /// A PINGREQ went unanswered for a whole keep alive window.
    LinkDead,
}

/// The client session state machine.
///
/// Owns the in-flight publication table, the packet id generator and the
/// keep alive clock. All wire output goes through the [`Sender`] handed to
/// each call; the session itself never blocks.
pub struct Session {
    keep_alive: u64,
    now: u64,
    last_sent: u64,
    /// Clock second the outstanding PINGREQ was sent, 0 when none is.
    ping_outstanding_at: u64,
    last_packet_id: PacketId,
    inflight: HashMap<(PacketId, Direction), Inflight>,
    /// Insertion order of `inflight` keys; stale keys are pruned by the sweep.
    order: Vec<(PacketId, Direction)>,
}

impl Session {
    pub fn new(keep_alive: u16) -> Self {
        Session {
            keep_alive: u64::from(keep_alive),
            now: 0,
            last_sent: 0,
            ping_outstanding_at: 0,
            last_packet_id: 0,
            inflight: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn set_keep_alive(&mut self, keep_alive: u16) {
        self.keep_alive = u64::from(keep_alive);
    }

    /// Rearms the keep alive cycle after the link was re-established.
    pub fn on_reconnect(&mut self) {
        self.ping_outstanding_at = 0;
    }

    /// The number of publications currently in flight.
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Sends a packet and stamps the keep alive clock on success.
    pub(crate) fn send_packet<S: Sender>(&mut self, sink: &mut S, packet: &Packet) -> io::Result<()> {
        sink.send(packet)?;
        self.last_sent = self.now;
        Ok(())
    }

    /// Draws the next free packet id.
    ///
    /// Zero is reserved and skipped on wrap around; ids with a live
    /// outbound record are skipped as well.
    fn next_packet_id(&mut self) -> Result<PacketId, Error> {
        for _ in 0..usize::from(u16::max_value()) {
            self.last_packet_id = self.last_packet_id.wrapping_add(1);
            if self.last_packet_id == 0 {
                self.last_packet_id = 1;
            }
            if !self
                .inflight
                .contains_key(&(self.last_packet_id, Direction::Outbound))
            {
                return Ok(self.last_packet_id);
            }
        }

        Err(Error::PacketIdsExhausted)
    }

    fn insert(&mut self, packet_id: PacketId, direction: Direction, record: Inflight) {
        let key = (packet_id, direction);
        if self.inflight.insert(key, record).is_none() {
            self.order.push(key);
        }
    }

    fn remove(&mut self, packet_id: PacketId, direction: Direction) {
        self.inflight.remove(&(packet_id, direction));
        // the order list is pruned lazily by the sweep
    }

    fn state_of(&self, packet_id: PacketId, direction: Direction) -> Option<InflightState> {
        self.inflight
            .get(&(packet_id, direction))
            .map(|record| record.state)
    }

    fn transition(&mut self, packet_id: PacketId, direction: Direction, state: InflightState) {
        if let Some(record) = self.inflight.get_mut(&(packet_id, direction)) {
            record.state = state;
            record.last_action = self.now;
        }
    }

    fn stamp(&mut self, packet_id: PacketId, direction: Direction) {
        if let Some(record) = self.inflight.get_mut(&(packet_id, direction)) {
            record.last_action = self.now;
        }
    }

    /// Publishes an application message.
    ///
    /// A failed write is not an error: the message is queued in the
    /// in-flight table and re-driven by the next sweep, QoS 0 included.
    pub fn publish<S: Sender>(
        &mut self,
        sink: &mut S,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
    ) -> Result<Option<PacketId>, Error> {
        let packet_id = if qos > QoS::AtMostOnce {
            Some(self.next_packet_id()?)
        } else {
            None
        };

        let packet = Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic,
            packet_id,
            payload,
        });
        let sent = self.send_packet(sink, &packet).is_ok();

        if sent {
            debug!(
                "sending PUBLISH (d0, q{}, r{}, m{}, '{}', ... ({} bytes))",
                qos as u8,
                retain as u8,
                packet_id.unwrap_or(0),
                topic,
                payload.len()
            );
            if qos == QoS::AtMostOnce {
                return Ok(None);
            }
        }

        let state = if !sent {
            InflightState::SendPublish
        } else if qos == QoS::AtLeastOnce {
            InflightState::WaitPubAck
        } else {
            InflightState::WaitPubRec
        };
        // a QoS 0 message only lands here when the write failed; it still
        // needs a unique table key even though none goes on the wire
        let record_id = match packet_id {
            Some(id) => id,
            None => self.next_packet_id()?,
        };
        self.insert(
            record_id,
            Direction::Outbound,
            Inflight {
                topic: topic.to_owned(),
                qos,
                retain,
                payload: payload.to_vec(),
                state,
                last_action: self.now,
            },
        );

        Ok(packet_id)
    }

    /// Requests subscriptions for up to 128 (topic, QoS) pairs.
    pub fn subscribe<S: Sender>(
        &mut self,
        sink: &mut S,
        topics: &[(&str, QoS)],
    ) -> Result<PacketId, Error> {
        if topics.len() > MAX_SUBSCRIPTIONS {
            return Err(Error::TooManySubscriptions);
        }

        let packet_id = self.next_packet_id()?;
        let packet = Packet::Subscribe(Subscribe {
            packet_id,
            topics: topics.to_vec(),
        });
        self.send_packet(sink, &packet).map_err(Error::Write)?;

        for (topic, qos) in topics {
            debug!(
                "sending SUBSCRIBE (id: {}, topic: {}, QoS: {})",
                packet_id, topic, *qos as u8
            );
        }

        Ok(packet_id)
    }

    /// Drops subscriptions for up to 128 topics.
    pub fn unsubscribe<S: Sender>(
        &mut self,
        sink: &mut S,
        topics: &[&str],
    ) -> Result<PacketId, Error> {
        if topics.len() > MAX_SUBSCRIPTIONS {
            return Err(Error::TooManySubscriptions);
        }

        let packet_id = self.next_packet_id()?;
        let packet = Packet::Unsubscribe(Unsubscribe {
            packet_id,
            topics: topics.to_vec(),
        });
        self.send_packet(sink, &packet).map_err(Error::Write)?;

        for topic in topics {
            debug!("sending UNSUBSCRIBE (id: {}, topic: {})", packet_id, topic);
        }

        Ok(packet_id)
    }

    /// Dispatches one decoded packet from the peer.
    pub fn handle_packet<S, H>(
        &mut self,
        sink: &mut S,
        packet: Packet<'_>,
        handler: &mut H,
    ) -> Result<(), Error>
    where
        S: Sender,
        H: EventHandler,
    {
        match packet {
            Packet::ConnAck(ack) => {
                debug!(
                    "received CONNACK (a{}, c{})",
                    ack.session_present as u8, ack.return_code as u8
                );
                handler.on_connack(ack.session_present, ack.return_code);
                Ok(())
            }
            Packet::SubAck(ack) => {
                debug!(
                    "received SUBACK (id: {}, {} topics)",
                    ack.packet_id,
                    ack.granted.len()
                );
                handler.on_suback(ack.packet_id, &ack.granted);
                Ok(())
            }
            Packet::UnsubAck(packet_id) => {
                debug!("received UNSUBACK (id: {})", packet_id);
                handler.on_unsuback(packet_id);
                Ok(())
            }
            Packet::Publish(publish) => self.handle_publish(sink, publish, handler),
            Packet::PubAck(packet_id) => {
                debug!("received PUBACK (id: {})", packet_id);
                self.complete(packet_id, InflightState::WaitPubAck, PacketType::PubAck, handler)
            }
            Packet::PubRec(packet_id) => self.handle_pubrec(sink, packet_id),
            Packet::PubRel(packet_id) => self.handle_pubrel(sink, packet_id, handler),
            Packet::PubComp(packet_id) => {
                debug!("received PUBCOMP (id: {})", packet_id);
                self.complete(packet_id, InflightState::WaitPubComp, PacketType::PubComp, handler)
            }
            Packet::PingResp => {
                debug!("received PINGRESP");
                self.ping_outstanding_at = 0;
                Ok(())
            }
            // server-side requests have no business on a client connection
            other => Err(Error::UnexpectedPacket(other.packet_type())),
        }
    }

    /// Finishes an outbound handshake on its terminal acknowledgement.
    fn complete<H: EventHandler>(
        &mut self,
        packet_id: PacketId,
        expected: InflightState,
        ack: PacketType,
        handler: &mut H,
    ) -> Result<(), Error> {
        if self.state_of(packet_id, Direction::Outbound) != Some(expected) {
            return Err(Error::UnexpectedPacket(ack));
        }

        handler.on_puback(packet_id);
        self.remove(packet_id, Direction::Outbound);
        Ok(())
    }

    fn handle_pubrec<S: Sender>(&mut self, sink: &mut S, packet_id: PacketId) -> Result<(), Error> {
        debug!("received PUBREC (id: {})", packet_id);

        if self.state_of(packet_id, Direction::Outbound) != Some(InflightState::WaitPubRec) {
            return Err(Error::UnexpectedPacket(PacketType::PubRec));
        }

        if self.send_packet(sink, &Packet::PubRel(packet_id)).is_ok() {
            debug!("sending PUBREL (id: {})", packet_id);
            self.transition(packet_id, Direction::Outbound, InflightState::WaitPubComp);
        } else {
            self.transition(packet_id, Direction::Outbound, InflightState::SendPubRel);
        }
        Ok(())
    }

    fn handle_pubrel<S, H>(
        &mut self,
        sink: &mut S,
        packet_id: PacketId,
        handler: &mut H,
    ) -> Result<(), Error>
    where
        S: Sender,
        H: EventHandler,
    {
        debug!("received PUBREL (id: {})", packet_id);

        if self.state_of(packet_id, Direction::Inbound) != Some(InflightState::WaitPubRel) {
            return Err(Error::UnexpectedPacket(PacketType::PubRel));
        }

        {
            let record = &self.inflight[&(packet_id, Direction::Inbound)];
            handler.on_publish(&record.topic, record.qos, record.retain, &record.payload);
        }

        if self.send_packet(sink, &Packet::PubComp(packet_id)).is_ok() {
            debug!("sending PUBCOMP (id: {})", packet_id);
            self.remove(packet_id, Direction::Inbound);
        } else {
            self.transition(packet_id, Direction::Inbound, InflightState::SendPubComp);
        }
        Ok(())
    }

    fn handle_publish<S, H>(
        &mut self,
        sink: &mut S,
        publish: Publish<'_>,
        handler: &mut H,
    ) -> Result<(), Error>
    where
        S: Sender,
        H: EventHandler,
    {
        debug!(
            "received PUBLISH (d{}, q{}, r{}, m{}, '{}', ... ({} bytes))",
            publish.dup as u8,
            publish.qos as u8,
            publish.retain as u8,
            publish.packet_id.unwrap_or(0),
            publish.topic,
            publish.payload.len()
        );

        match publish.qos {
            QoS::AtMostOnce => {
                handler.on_publish(publish.topic, publish.qos, publish.retain, publish.payload);
                Ok(())
            }
            QoS::AtLeastOnce => {
                let packet_id = match publish.packet_id {
                    Some(id) => id,
                    None => return Err(Error::UnexpectedPacket(PacketType::Publish)),
                };

                handler.on_publish(publish.topic, publish.qos, publish.retain, publish.payload);

                if self.send_packet(sink, &Packet::PubAck(packet_id)).is_ok() {
                    debug!("sending PUBACK (id: {})", packet_id);
                } else {
                    self.insert_inbound(packet_id, &publish, InflightState::SendPubAck);
                }
                Ok(())
            }
            QoS::ExactlyOnce => {
                let packet_id = match publish.packet_id {
                    Some(id) => id,
                    None => return Err(Error::UnexpectedPacket(PacketType::Publish)),
                };

                if self
                    .inflight
                    .contains_key(&(packet_id, Direction::Inbound))
                {
                    // retransmitted PUBLISH for a message we already hold;
                    // answer with PUBREC again, deliver nothing
                    if self.send_packet(sink, &Packet::PubRec(packet_id)).is_ok() {
                        debug!("sending PUBREC (id: {})", packet_id);
                        self.stamp(packet_id, Direction::Inbound);
                    }
                    return Ok(());
                }

                // PUBREC goes out before the user sees the message; delivery
                // happens exactly once, on PUBREL
                let state = if self.send_packet(sink, &Packet::PubRec(packet_id)).is_ok() {
                    debug!("sending PUBREC (id: {})", packet_id);
                    InflightState::WaitPubRel
                } else {
                    InflightState::SendPubRec
                };
                self.insert_inbound(packet_id, &publish, state);
                Ok(())
            }
        }
    }

    fn insert_inbound(&mut self, packet_id: PacketId, publish: &Publish<'_>, state: InflightState) {
        self.insert(
            packet_id,
            Direction::Inbound,
            Inflight {
                topic: publish.topic.to_owned(),
                qos: publish.qos,
                retain: publish.retain,
                payload: publish.payload.to_vec(),
                state,
                last_action: self.now,
            },
        );
    }

    /// Advances the session clock by one second.
    ///
    /// Runs the keep alive checks first, then the retransmission sweep.
    pub fn tick<S: Sender>(&mut self, sink: &mut S) -> Tick {
        self.now += 1;

        if self.ping_outstanding_at > 0
            && self.now - self.ping_outstanding_at > self.keep_alive
        {
            warn!("PINGRESP overdue, giving up on the link");
            return Tick::LinkDead;
        }

        if self.ping_outstanding_at == 0 && self.now - self.last_sent >= self.keep_alive {
            if self.send_packet(sink, &Packet::PingReq).is_ok() {
                self.ping_outstanding_at = self.now;
                debug!("sending PINGREQ");
            }
        }

        self.sweep(sink);
        Tick::Alive
    }

    /// Re-drives every in-flight record that has been idle for longer than
    /// the keep alive interval, in insertion order.
    fn sweep<S: Sender>(&mut self, sink: &mut S) {
        let inflight = &self.inflight;
        self.order.retain(|key| inflight.contains_key(key));

        let due: Vec<(PacketId, Direction)> = self.order.clone();
        for (packet_id, direction) in due {
            let (state, qos) = match self.inflight.get(&(packet_id, direction)) {
                Some(record) if self.now - record.last_action > self.keep_alive => {
                    (record.state, record.qos)
                }
                _ => continue,
            };

            match state {
                InflightState::SendPublish
                | InflightState::WaitPubAck
                | InflightState::WaitPubRec => {
                    self.retransmit_publish(sink, packet_id, direction, qos)
                }
                InflightState::SendPubAck => {
                    if self.send_packet(sink, &Packet::PubAck(packet_id)).is_ok() {
                        debug!("sending PUBACK (id: {})", packet_id);
                        self.remove(packet_id, direction);
                    } else {
                        self.stamp(packet_id, direction);
                    }
                }
                InflightState::SendPubRec => {
                    if self.send_packet(sink, &Packet::PubRec(packet_id)).is_ok() {
                        debug!("sending PUBREC (id: {})", packet_id);
                        self.transition(packet_id, direction, InflightState::WaitPubRel);
                    } else {
                        self.stamp(packet_id, direction);
                    }
                }
                InflightState::SendPubRel => {
                    if self.send_packet(sink, &Packet::PubRel(packet_id)).is_ok() {
                        debug!("sending PUBREL (id: {})", packet_id);
                        self.transition(packet_id, direction, InflightState::WaitPubComp);
                    } else {
                        self.stamp(packet_id, direction);
                    }
                }
                InflightState::SendPubComp => {
                    if self.send_packet(sink, &Packet::PubComp(packet_id)).is_ok() {
                        debug!("sending PUBCOMP (id: {})", packet_id);
                        self.remove(packet_id, direction);
                    } else {
                        self.stamp(packet_id, direction);
                    }
                }
                InflightState::WaitPubRel => {
                    if self.send_packet(sink, &Packet::PubRec(packet_id)).is_ok() {
                        debug!("sending PUBREC (id: {})", packet_id);
                    }
                    self.stamp(packet_id, direction);
                }
                InflightState::WaitPubComp => {
                    if self.send_packet(sink, &Packet::PubRel(packet_id)).is_ok() {
                        debug!("sending PUBREL (id: {})", packet_id);
                    }
                    self.stamp(packet_id, direction);
                }
            }
        }
    }

    /// Re-emits the original PUBLISH with the DUP flag set.
    fn retransmit_publish<S: Sender>(
        &mut self,
        sink: &mut S,
        packet_id: PacketId,
        direction: Direction,
        qos: QoS,
    ) {
        let (sent, retain) = {
            let record = match self.inflight.get(&(packet_id, direction)) {
                Some(record) => record,
                None => return,
            };
            let publish = Publish {
                dup: true,
                qos: record.qos,
                retain: record.retain,
                topic: &record.topic,
                packet_id: if record.qos > QoS::AtMostOnce {
                    Some(packet_id)
                } else {
                    None
                },
                payload: &record.payload,
            };
            (sink.send(&Packet::Publish(publish)).is_ok(), record.retain)
        };

        if sent {
            self.last_sent = self.now;
            debug!(
                "sending PUBLISH (d1, q{}, r{}, m{})",
                qos as u8, retain as u8, packet_id
            );

            if qos == QoS::AtMostOnce {
                // only ever queued because its first write failed; one
                // delivery attempt is all QoS 0 gets
                self.remove(packet_id, direction);
                return;
            }
            let state = if qos == QoS::AtLeastOnce {
                InflightState::WaitPubAck
            } else {
                InflightState::WaitPubRec
            };
            self.transition(packet_id, direction, state);
        } else {
            self.stamp(packet_id, direction);
        }
    }
}
