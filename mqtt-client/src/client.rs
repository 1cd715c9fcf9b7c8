use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::process;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use mqtt_codec::{Connect, Packet, PacketId, Parser, ProtocolVersion, QoS, Will};

use crate::error::Error;
use crate::events::EventHandler;
use crate::session::{Session, Tick};
use crate::transport::{self, READ_BUFFER_SIZE};

/// Default keep alive interval in seconds.
pub const DEFAULT_KEEP_ALIVE: u16 = 30;

#[derive(Debug, Clone)]
struct WillConfig {
    retain: bool,
    qos: QoS,
    topic: String,
    payload: Vec<u8>,
}

/// An MQTT 3.1/3.1.1 client over a single TCP connection.
///
/// The client owns the transport, the incremental parser and the session
/// state machine; [`Client::run`] drives all of them from one thread.
/// Session events are reported through the [`EventHandler`] given at
/// construction time.
pub struct Client<H> {
    client_id: String,
    keep_alive: u16,
    clean_session: bool,
    protocol_version: ProtocolVersion,
    username: Option<String>,
    password: Option<Vec<u8>>,
    will: Option<WillConfig>,
    handler: H,
    parser: Parser,
    session: Session,
    reader: Option<TcpStream>,
    writer: Option<TcpStream>,
    addr: Option<(String, u16)>,
    closing: bool,
}

fn generated_client_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|s| s.to_str().map(str::to_owned))
        .unwrap_or_else(|| "localhost".to_owned());

    format!("libmqtt/{}-{}", process::id(), host)
}

impl<H> Client<H>
where
    H: EventHandler,
{
    /// Creates a client with the given identifier, or a generated
    /// `libmqtt/<pid>-<hostname>` one when the caller has no preference.
    pub fn new(client_id: Option<&str>, handler: H) -> Self {
        Client {
            client_id: client_id.map_or_else(generated_client_id, str::to_owned),
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: true,
            protocol_version: ProtocolVersion::default(),
            username: None,
            password: None,
            will: None,
            handler,
            parser: Parser::new(),
            session: Session::new(DEFAULT_KEEP_ALIVE),
            reader: None,
            writer: None,
            addr: None,
            closing: false,
        }
    }

    /// The keep alive interval in seconds; 0 disables pings and
    /// retransmission entirely.
    pub fn set_keep_alive(&mut self, keep_alive: u16) {
        self.keep_alive = keep_alive;
    }

    pub fn set_clean_session(&mut self, clean_session: bool) {
        self.clean_session = clean_session;
    }

    pub fn set_version(&mut self, protocol_version: ProtocolVersion) {
        self.protocol_version = protocol_version;
    }

    /// Credentials for the CONNECT packet. A password without a username
    /// never goes on the wire.
    pub fn set_auth(&mut self, username: Option<&str>, password: Option<&[u8]>) {
        self.username = username.map(str::to_owned);
        self.password = password.map(<[u8]>::to_vec);
    }

    /// Registers the Will the broker publishes if this client vanishes.
    pub fn set_will(&mut self, retain: bool, qos: QoS, topic: &str, payload: Option<&[u8]>) {
        self.will = Some(WillConfig {
            retain,
            qos,
            topic: topic.to_owned(),
            payload: payload.map_or_else(Vec::new, <[u8]>::to_vec),
        });
    }

    pub fn clear_will(&mut self) {
        self.will = None;
    }

    /// The event handler given to [`Client::new`].
    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Opens the TCP connection and writes the CONNECT packet.
    ///
    /// The broker's verdict arrives later, through
    /// [`EventHandler::on_connack`], once [`Client::run`] is driving the
    /// connection.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), Error> {
        self.addr = Some((host.to_owned(), port));
        self.closing = false;
        self.session.set_keep_alive(self.keep_alive);
        self.open()
    }

    fn open(&mut self) -> Result<(), Error> {
        let (host, port) = self.addr.clone().ok_or(Error::NotConnected)?;

        let stream = transport::connect((host.as_str(), port)).map_err(Error::Connect)?;
        let writer = stream.try_clone().map_err(Error::Connect)?;
        self.reader = Some(stream);
        self.writer = Some(writer);
        self.parser.reset();
        self.session.on_reconnect();

        self.send_connect()
    }

    fn send_connect(&mut self) -> Result<(), Error> {
        let writer = self.writer.as_mut().ok_or(Error::NotConnected)?;

        let connect = Connect {
            version: self.protocol_version,
            clean_session: self.clean_session,
            keep_alive: self.keep_alive,
            client_id: &self.client_id,
            will: self.will.as_ref().map(|will| Will {
                topic: &will.topic,
                payload: &will.payload,
                qos: will.qos,
                retain: will.retain,
            }),
            username: self.username.as_deref(),
            password: self.password.as_deref(),
        };
        self.session
            .send_packet(writer, &Packet::Connect(connect))
            .map_err(Error::Write)?;

        debug!(
            "sending CONNECT ({}, c{}, k{})",
            self.protocol_version.protocol_name(),
            self.clean_session as u8,
            self.keep_alive
        );
        Ok(())
    }

    /// Publishes a message; the returned id is `Some` for QoS 1/2.
    pub fn publish(
        &mut self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
    ) -> Result<Option<PacketId>, Error> {
        let writer = self.writer.as_mut().ok_or(Error::NotConnected)?;
        self.session.publish(writer, topic, qos, retain, payload)
    }

    /// Requests subscriptions for up to 128 (topic, QoS) pairs.
    pub fn subscribe(&mut self, subscriptions: &[(&str, QoS)]) -> Result<PacketId, Error> {
        let writer = self.writer.as_mut().ok_or(Error::NotConnected)?;
        self.session.subscribe(writer, subscriptions)
    }

    /// Drops subscriptions for up to 128 topics.
    pub fn unsubscribe(&mut self, topic_filters: &[&str]) -> Result<PacketId, Error> {
        let writer = self.writer.as_mut().ok_or(Error::NotConnected)?;
        self.session.unsubscribe(writer, topic_filters)
    }

    /// Writes DISCONNECT and half-closes the connection.
    ///
    /// The event loop winds down once the broker closes its side.
    pub fn disconnect(&mut self) -> Result<(), Error> {
        self.closing = true;
        let writer = self.writer.as_mut().ok_or(Error::NotConnected)?;

        let res = self
            .session
            .send_packet(&mut *writer, &Packet::Disconnect)
            .map_err(Error::Write);
        let _ = writer.shutdown(Shutdown::Write);

        if res.is_ok() {
            debug!("sending DISCONNECT");
        }
        res
    }

    /// Drives the connection until it terminates.
    ///
    /// Handles reads, the one second tick and link death. On link death
    /// one reconnect (fresh TCP connection plus CONNECT) is attempted;
    /// a failed attempt, or death after [`Client::disconnect`], stops the
    /// loop. In-flight publications survive a reconnect and are re-driven
    /// by the retransmission sweep.
    pub fn run(&mut self) -> Result<(), Error> {
        if self.reader.is_none() {
            return Err(Error::NotConnected);
        }

        let tick_interval = Duration::from_secs(1);
        let mut next_tick = Instant::now() + tick_interval;
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            let read = {
                let reader = match self.reader.as_mut() {
                    Some(reader) => reader,
                    None => break,
                };
                if self.keep_alive > 0 {
                    let timeout = next_tick
                        .saturating_duration_since(Instant::now())
                        .max(Duration::from_millis(1));
                    let _ = reader.set_read_timeout(Some(timeout));
                }
                reader.read(&mut buf)
            };

            let mut link_dead = false;
            match read {
                Ok(0) => {
                    info!("connection closed by peer");
                    link_dead = true;
                }
                Ok(n) => {
                    if let Err(err) = self.on_readable(n, &buf) {
                        warn!("dropping the link: {}", err);
                        link_dead = true;
                    }
                }
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut
                        || err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!("read error: {}", err);
                    link_dead = true;
                }
            }

            if !link_dead && self.keep_alive > 0 {
                while Instant::now() >= next_tick {
                    next_tick += tick_interval;

                    let writer = match self.writer.as_mut() {
                        Some(writer) => writer,
                        None => break,
                    };
                    if let Tick::LinkDead = self.session.tick(&mut *writer) {
                        let _ = writer.shutdown(Shutdown::Write);
                        link_dead = true;
                        break;
                    }
                }
            }

            if link_dead {
                self.reader = None;
                self.writer = None;

                if self.closing {
                    break;
                }
                info!("reconnecting to the broker");
                if self.open().is_err() {
                    warn!("reconnect failed, stopping");
                    break;
                }
                next_tick = Instant::now() + tick_interval;
            }
        }

        Ok(())
    }

    fn on_readable(&mut self, n: usize, buf: &[u8; READ_BUFFER_SIZE]) -> Result<(), Error> {
        let Client {
            parser,
            session,
            handler,
            writer,
            ..
        } = self;
        let writer = writer.as_mut().ok_or(Error::NotConnected)?;

        parser.feed(&buf[..n], &mut |packet| {
            session.handle_packet(&mut *writer, packet, handler)
        })
    }
}
