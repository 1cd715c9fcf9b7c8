use std::io;
use std::net::{TcpStream, ToSocketAddrs};

use log::trace;

use mqtt_codec::Packet;

/// The size of the inbound read buffer.
pub const READ_BUFFER_SIZE: usize = 4096;

/// A sink for outbound control packets.
///
/// Writes are all-or-nothing: a short or failed write is reported as an
/// error and the packet is re-sent whole later.
pub trait Sender {
    fn send(&mut self, packet: &Packet) -> io::Result<()>;
}

impl<W> Sender for W
where
    W: io::Write,
{
    fn send(&mut self, packet: &Packet) -> io::Result<()> {
        let buf = packet.to_bytes();
        self.write_all(&buf)?;
        trace!("wrote {:?} packet in {} bytes", packet.packet_type(), buf.len());
        Ok(())
    }
}

/// Opens the TCP connection to the broker.
pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
