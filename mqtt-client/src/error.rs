use std::io;

use derive_more::Display;

use mqtt_codec::{DecodeError, PacketType};

/// Client operation failures.
///
/// Every variant maps onto a stable numeric code through [`Error::code`];
/// [`strerror`] yields the matching message for callers that only keep the
/// number around (exit codes, foreign bindings).
#[derive(Debug, Display)]
pub enum Error {
    /// The operation needs an established connection.
    #[display(fmt = "client is not connected")]
    NotConnected,
    /// Opening the TCP connection failed.
    #[display(fmt = "tcp connection error: {}", _0)]
    Connect(io::Error),
    /// Writing a packet to the TCP stream failed.
    #[display(fmt = "tcp write error: {}", _0)]
    Write(io::Error),
    /// More topics in one SUBSCRIBE/UNSUBSCRIBE than the protocol allows.
    #[display(fmt = "max topic/qos per subscribe or unsubscribe")]
    TooManySubscriptions,
    /// The peer sent bytes that do not decode as a valid packet.
    #[display(fmt = "mqtt protocol violation: {}", _0)]
    Decode(DecodeError),
    /// The peer sent a well formed packet the session cannot accept,
    /// e.g. an acknowledgement for an unknown packet id.
    #[display(fmt = "unexpected {:?} packet", _0)]
    UnexpectedPacket(PacketType),
    /// All 65535 packet ids have in-flight publications.
    #[display(fmt = "packet id space exhausted")]
    PacketIdsExhausted,
}

impl Error {
    /// The stable numeric code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::NotConnected => -1,
            Error::Connect(_) => -5,
            Error::Write(_) => -6,
            Error::TooManySubscriptions => -7,
            Error::Decode(_) | Error::UnexpectedPacket(_) => -8,
            Error::PacketIdsExhausted => -9,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connect(err) | Error::Write(err) => Some(err),
            Error::Decode(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::Decode(err)
    }
}

/// The stable message for a numeric return code, `None` for codes outside
/// the table.
///
/// Codes 0 to -7 match the original libmqtt taxonomy byte for byte; -2 to
/// -4 name conditions the typed API rules out but stay reserved so the
/// numbering is not reused.
pub fn strerror(code: i32) -> Option<&'static str> {
    match code {
        0 => Some("success"),
        -1 => Some("null pointer access"),
        -2 => Some("memory allocation error"),
        -3 => Some("error mqtt qos"),
        -4 => Some("error mqtt protocol version"),
        -5 => Some("tcp connection error"),
        -6 => Some("tcp write error"),
        -7 => Some("max topic/qos per subscribe or unsubscribe"),
        -8 => Some("mqtt protocol violation"),
        -9 => Some("packet id space exhausted"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_have_messages() {
        assert_eq!(strerror(0), Some("success"));
        assert_eq!(strerror(Error::NotConnected.code()), Some("null pointer access"));
        assert_eq!(
            strerror(Error::TooManySubscriptions.code()),
            Some("max topic/qos per subscribe or unsubscribe")
        );
        assert_eq!(strerror(Error::PacketIdsExhausted.code()), Some("packet id space exhausted"));
        assert_eq!(strerror(1), None);
        assert_eq!(strerror(-10), None);
    }
}
