use mqtt_codec::{ConnectReturnCode, PacketId, QoS, SubAckReturnCode};

/// Hooks a client application implements to observe session events.
///
/// Every method has an empty default body, so an implementation only
/// overrides the events it cares about.
pub trait EventHandler {
    /// The broker answered our CONNECT.
    ///
    /// A refused connection arrives here as a non-accepted return code,
    /// not as an error.
    fn on_connack(&mut self, _session_present: bool, _return_code: ConnectReturnCode) {}

    /// The broker acknowledged a SUBSCRIBE request, one granted QoS
    /// (or failure) per requested topic.
    fn on_suback(&mut self, _packet_id: PacketId, _granted: &[SubAckReturnCode]) {}

    /// The broker acknowledged an UNSUBSCRIBE request.
    fn on_unsuback(&mut self, _packet_id: PacketId) {}

    /// An outbound QoS 1/2 publication finished its acknowledgement
    /// handshake.
    fn on_puback(&mut self, _packet_id: PacketId) {}

    /// An application message arrived on a subscribed topic.
    ///
    /// QoS 2 messages are delivered exactly once, on receipt of PUBREL.
    fn on_publish(&mut self, _topic: &str, _qos: QoS, _retain: bool, _payload: &[u8]) {}
}
