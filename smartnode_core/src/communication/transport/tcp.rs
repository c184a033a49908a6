use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::{PacketReader, PacketWriter, Transport};
use crate::communication::packet::{read_packet, Packet};
use crate::error::TransportError;

/// Plain TCP link to a broker
#[derive(Debug, Clone)]
pub struct TcpTransport {
    host: String,
    port: u16,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

pub struct TcpReader {
    inner: BufReader<OwnedReadHalf>,
}

pub struct TcpWriter {
    inner: OwnedWriteHalf,
}

impl Transport for TcpTransport {
    type Reader = TcpReader;
    type Writer = TcpWriter;

    async fn open(&mut self) -> Result<(TcpReader, TcpWriter), TransportError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok((
            TcpReader {
                inner: BufReader::new(read),
            },
            TcpWriter { inner: write },
        ))
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

impl PacketReader for TcpReader {
    async fn read_packet(&mut self, limit: usize) -> Result<Packet, TransportError> {
        read_packet(&mut self.inner, limit).await
    }
}

impl PacketWriter for TcpWriter {
    async fn write_packet(&mut self, packet: &Packet) -> Result<(), TransportError> {
        self.inner.write_all(&packet.encode()?).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
