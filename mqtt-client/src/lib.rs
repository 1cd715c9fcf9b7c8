//! An MQTT 3.1/3.1.1 client.
//!
//! [`Client`] drives a single long-lived TCP connection from one thread:
//! inbound bytes flow through the incremental parser into the [`Session`]
//! state machine, which enforces the QoS 1/2 acknowledgement handshakes,
//! retransmits unacknowledged publications with the DUP flag, and keeps
//! the connection alive with PINGREQ. Applications observe traffic through
//! an [`EventHandler`].

pub use mqtt_codec as codec;

mod client;
mod error;
mod events;
mod session;
mod transport;

pub use self::client::{Client, DEFAULT_KEEP_ALIVE};
pub use self::error::{strerror, Error};
pub use self::events::EventHandler;
pub use self::session::{Session, Tick};
pub use self::transport::{Sender, READ_BUFFER_SIZE};
