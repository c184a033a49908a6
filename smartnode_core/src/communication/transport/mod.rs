//! Byte-stream transports for the broker session
//!
//! A [`Transport`] opens a fresh link per connection attempt and splits it into a
//! reader half, which the session moves into its own intake task, and a writer half.

mod simulation;
mod tcp;

pub use simulation::{SimulatedBroker, SimulatedLink, SimulatedReader, SimulatedWriter};
pub use tcp::{TcpReader, TcpTransport, TcpWriter};

use super::packet::Packet;
use crate::error::TransportError;

#[allow(async_fn_in_trait)]
pub trait PacketReader {
    /// Read the next complete packet, rejecting bodies larger than `limit`
    async fn read_packet(&mut self, limit: usize) -> Result<Packet, TransportError>;
}

#[allow(async_fn_in_trait)]
pub trait PacketWriter {
    async fn write_packet(&mut self, packet: &Packet) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[allow(async_fn_in_trait)]
pub trait Transport {
    type Reader: PacketReader + 'static;
    type Writer: PacketWriter;

    /// Open a new link to the broker.
    async fn open(&mut self) -> Result<(Self::Reader, Self::Writer), TransportError>;

    /// Human-readable endpoint for logs
    fn describe(&self) -> String;
}
