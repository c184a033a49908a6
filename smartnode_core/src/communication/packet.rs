//! Broker packets and their MQTT 3.1.1 wire encoding
//!
//! Only the packet kinds a single-node client needs are modelled: the handshake,
//! QoS 0/1 publishing, subscribing, keepalive and disconnect. The decoder accepts
//! every kind the encoder produces so the same types can be used on both ends of the
//! simulated broker.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProtocolError, TransportError};

/// Largest remaining-length value representable in four varint bytes
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

/// Delivery guarantee requested for a publish or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

impl QoS {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(ProtocolError::Malformed(format!(
                "unsupported QoS level {}",
                other
            ))),
        }
    }
}

/// Username/password pair presented during the handshake
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

/// An application message, inbound or outbound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retained(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Payload as UTF-8, if it is valid
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// CONNECT packet contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keepalive_secs: u16,
    pub clean_session: bool,
    pub credentials: Option<Credentials>,
    pub will: Option<Message>,
}

/// PUBLISH packet contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub message: Message,
    /// Present exactly when QoS > 0
    pub packet_id: Option<u16>,
    pub dup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck { session_present: bool, code: u8 },
    Publish(Publish),
    PubAck { packet_id: u16 },
    Subscribe { packet_id: u16, filters: Vec<(String, QoS)> },
    SubAck { packet_id: u16, codes: Vec<u8> },
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Short name used in logs and protocol errors
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck { .. } => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck { .. } => "PUBACK",
            Packet::Subscribe { .. } => "SUBSCRIBE",
            Packet::SubAck { .. } => "SUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }

    /// Encode into a complete frame (fixed header + body).
    ///
    /// Fails when a string field exceeds the 16-bit length prefix or the body
    /// exceeds [`MAX_REMAINING_LENGTH`].
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        self.encode_within(MAX_REMAINING_LENGTH)
    }

    /// Like [`encode`](Self::encode), but bodies larger than `limit` are rejected,
    /// the same bound [`read_packet`] applies on the way in.
    pub fn encode_within(&self, limit: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut body = Vec::new();
        let header = match self {
            Packet::Connect(connect) => {
                encode_connect(connect, &mut body)?;
                0x10
            }
            Packet::ConnAck {
                session_present,
                code,
            } => {
                body.push(u8::from(*session_present));
                body.push(*code);
                0x20
            }
            Packet::Publish(publish) => {
                let msg = &publish.message;
                put_str(&mut body, &msg.topic)?;
                if let Some(id) = publish.packet_id {
                    body.extend_from_slice(&id.to_be_bytes());
                }
                body.extend_from_slice(&msg.payload);
                0x30 | (u8::from(publish.dup) << 3) | ((msg.qos as u8) << 1) | u8::from(msg.retain)
            }
            Packet::PubAck { packet_id } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                0x40
            }
            Packet::Subscribe { packet_id, filters } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                for (filter, qos) in filters {
                    put_str(&mut body, filter)?;
                    body.push(*qos as u8);
                }
                0x82
            }
            Packet::SubAck { packet_id, codes } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                body.extend_from_slice(codes);
                0x90
            }
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect => 0xE0,
        };

        let limit = limit.min(MAX_REMAINING_LENGTH);
        if body.len() > limit {
            return Err(ProtocolError::TooLarge {
                size: body.len(),
                limit,
            });
        }
        let mut frame = Vec::with_capacity(body.len() + 5);
        frame.push(header);
        encode_remaining_length(body.len(), &mut frame);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a packet from its first header byte and body
    pub fn decode(header: u8, body: &[u8]) -> Result<Packet, ProtocolError> {
        let flags = header & 0x0F;
        let mut cur = Cursor::new(body);
        let packet = match header >> 4 {
            1 => Packet::Connect(decode_connect(&mut cur)?),
            2 => {
                let ack_flags = cur.u8()?;
                let code = cur.u8()?;
                Packet::ConnAck {
                    session_present: ack_flags & 0x01 == 1,
                    code,
                }
            }
            3 => {
                let qos = QoS::from_u8((flags >> 1) & 0x03)?;
                let topic = cur.string()?;
                let packet_id = match qos {
                    QoS::AtMostOnce => None,
                    QoS::AtLeastOnce => Some(cur.u16()?),
                };
                let payload = cur.rest().to_vec();
                Packet::Publish(Publish {
                    message: Message {
                        topic,
                        payload,
                        qos,
                        retain: flags & 0x01 == 1,
                    },
                    packet_id,
                    dup: flags & 0x08 != 0,
                })
            }
            4 => Packet::PubAck {
                packet_id: cur.u16()?,
            },
            8 => {
                if flags != 0x02 {
                    return Err(ProtocolError::Malformed(
                        "SUBSCRIBE must carry flags 0b0010".to_string(),
                    ));
                }
                let packet_id = cur.u16()?;
                let mut filters = Vec::new();
                while !cur.is_empty() {
                    let filter = cur.string()?;
                    let qos = QoS::from_u8(cur.u8()? & 0x03)?;
                    filters.push((filter, qos));
                }
                if filters.is_empty() {
                    return Err(ProtocolError::Malformed(
                        "SUBSCRIBE without topic filters".to_string(),
                    ));
                }
                Packet::Subscribe { packet_id, filters }
            }
            9 => {
                let packet_id = cur.u16()?;
                Packet::SubAck {
                    packet_id,
                    codes: cur.rest().to_vec(),
                }
            }
            12 => Packet::PingReq,
            13 => Packet::PingResp,
            14 => Packet::Disconnect,
            other => return Err(ProtocolError::UnsupportedType(other)),
        };
        Ok(packet)
    }
}

/// Read one complete packet from an async byte stream.
///
/// End of stream before the first header byte is reported as
/// [`TransportError::ConnectionClosed`].
pub async fn read_packet<R>(reader: &mut R, limit: usize) -> Result<Packet, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 1];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::ConnectionClosed)
        }
        Err(e) => return Err(TransportError::Io(e)),
    }

    let mut length = 0usize;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).await?;
        length |= ((byte[0] & 0x7F) as usize) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(ProtocolError::Malformed("remaining length exceeds 4 bytes".into()).into());
        }
    }
    if length > limit {
        return Err(ProtocolError::TooLarge {
            size: length,
            limit,
        }
        .into());
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Packet::decode(header[0], &body)?)
}

pub fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), ProtocolError> {
    put_bytes(out, s.as_bytes())
}

fn put_bytes(out: &mut Vec<u8>, b: &[u8]) -> Result<(), ProtocolError> {
    let len = u16::try_from(b.len()).map_err(|_| ProtocolError::TooLarge {
        size: b.len(),
        limit: u16::MAX as usize,
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(b);
    Ok(())
}

fn encode_connect(connect: &Connect, body: &mut Vec<u8>) -> Result<(), ProtocolError> {
    put_str(body, PROTOCOL_NAME)?;
    body.push(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if let Some(creds) = &connect.credentials {
        flags |= 0x80;
        if creds.password.is_some() {
            flags |= 0x40;
        }
    }
    body.push(flags);
    body.extend_from_slice(&connect.keepalive_secs.to_be_bytes());

    put_str(body, &connect.client_id)?;
    if let Some(will) = &connect.will {
        put_str(body, &will.topic)?;
        put_bytes(body, &will.payload)?;
    }
    if let Some(creds) = &connect.credentials {
        put_str(body, &creds.username)?;
        if let Some(password) = &creds.password {
            put_str(body, password)?;
        }
    }
    Ok(())
}

fn decode_connect(cur: &mut Cursor<'_>) -> Result<Connect, ProtocolError> {
    let name = cur.string()?;
    let level = cur.u8()?;
    if name != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
        return Err(ProtocolError::Malformed(format!(
            "unsupported protocol {} level {}",
            name, level
        )));
    }
    let flags = cur.u8()?;
    let keepalive_secs = cur.u16()?;
    let client_id = cur.string()?;

    let will = if flags & 0x04 != 0 {
        let topic = cur.string()?;
        let payload = cur.bytes()?.to_vec();
        Some(Message {
            topic,
            payload,
            qos: QoS::from_u8((flags >> 3) & 0x03)?,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };

    let credentials = if flags & 0x80 != 0 {
        let username = cur.string()?;
        let password = if flags & 0x40 != 0 {
            Some(cur.string()?)
        } else {
            None
        };
        Some(Credentials { username, password })
    } else {
        None
    };

    Ok(Connect {
        client_id,
        keepalive_secs,
        clean_session: flags & 0x02 != 0,
        credentials,
        will,
    })
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.pos + n > self.buf.len() {
            return Err(ProtocolError::Malformed(format!(
                "need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len() - self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::Malformed("string is not valid UTF-8".to_string()))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_length_boundaries() {
        let cases: [(usize, &[u8]); 4] = [
            (0, &[0x00]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (16_383, &[0xFF, 0x7F]),
        ];
        for (len, expected) in cases {
            let mut out = Vec::new();
            encode_remaining_length(len, &mut out);
            assert_eq!(out, expected, "length {}", len);
        }
    }

    #[test]
    fn test_pingreq_and_disconnect_frames() {
        assert_eq!(Packet::PingReq.encode().unwrap(), vec![0xC0, 0x00]);
        assert_eq!(Packet::Disconnect.encode().unwrap(), vec![0xE0, 0x00]);
    }

    #[test]
    fn test_encode_rejects_overlong_strings() {
        let topic = "t".repeat(u16::MAX as usize + 1);
        let err = Packet::Publish(Publish {
            message: Message::new(topic, "x"),
            packet_id: None,
            dup: false,
        })
        .encode()
        .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::TooLarge {
                size: u16::MAX as usize + 1,
                limit: u16::MAX as usize
            }
        );

        let err = Packet::Connect(Connect {
            client_id: "n1".to_string(),
            keepalive_secs: 60,
            clean_session: true,
            credentials: None,
            will: Some(Message::new("home/n1/status", vec![0u8; 70_000])),
        })
        .encode()
        .unwrap_err();
        assert!(matches!(err, ProtocolError::TooLarge { size: 70_000, .. }));

        let longest = "t".repeat(u16::MAX as usize);
        let frame = Packet::Subscribe {
            packet_id: 1,
            filters: vec![(longest, QoS::AtMostOnce)],
        }
        .encode()
        .unwrap();
        // header, three length bytes, packet id, then the filter length prefix
        assert_eq!(&frame[6..8], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_encode_within_matches_read_limit() {
        let packet = Packet::Publish(Publish {
            message: Message::new("t", vec![0u8; 13]),
            packet_id: None,
            dup: false,
        });
        // topic prefix (2) + topic (1) + payload (13)
        assert_eq!(packet.encode_within(16).unwrap().len(), 18);
        assert_eq!(
            packet.encode_within(15).unwrap_err(),
            ProtocolError::TooLarge { size: 16, limit: 15 }
        );
    }

    #[test]
    fn test_connect_frame_layout() {
        let frame = Packet::Connect(Connect {
            client_id: "n1".to_string(),
            keepalive_secs: 60,
            clean_session: true,
            credentials: Some(Credentials {
                username: "u".to_string(),
                password: Some("p".to_string()),
            }),
            will: None,
        })
        .encode()
        .unwrap();

        assert_eq!(frame[0], 0x10);
        // name(6) + level(1) + flags(1) + keepalive(2) + id(4) + user(3) + pass(3)
        assert_eq!(frame[1] as usize, 20);
        assert_eq!(&frame[2..8], &[0x00, 0x04, b'M', b'Q', b'T', b'T']);
        assert_eq!(frame[8], 4);
        assert_eq!(frame[9], 0x80 | 0x40 | 0x02);
        assert_eq!(&frame[10..12], &[0x00, 60]);
    }

    #[test]
    fn test_decode_qos1_publish() {
        let body = [
            0x00, 0x03, b'a', b'/', b'b', // topic
            0x00, 0x07, // packet id
            b'h', b'i',
        ];
        let packet = Packet::decode(0x33, &body).unwrap();
        match packet {
            Packet::Publish(p) => {
                assert_eq!(p.message.topic, "a/b");
                assert_eq!(p.message.qos, QoS::AtLeastOnce);
                assert!(p.message.retain);
                assert_eq!(p.packet_id, Some(7));
                assert_eq!(p.message.payload_str(), Some("hi"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_truncated_suback() {
        let err = Packet::decode(0x90, &[0x00]).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = Packet::decode(0xF0, &[]).unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedType(15));
    }

    #[tokio::test]
    async fn test_read_packet_from_stream() {
        let mut frame = Packet::SubAck {
            packet_id: 3,
            codes: vec![0x00, 0x80],
        }
        .encode()
        .unwrap();
        frame.extend(Packet::PingResp.encode().unwrap());
        let mut stream: &[u8] = &frame;

        let first = read_packet(&mut stream, 1024).await.unwrap();
        assert_eq!(
            first,
            Packet::SubAck {
                packet_id: 3,
                codes: vec![0x00, 0x80]
            }
        );
        assert_eq!(read_packet(&mut stream, 1024).await.unwrap(), Packet::PingResp);
        assert!(matches!(
            read_packet(&mut stream, 1024).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_packet_enforces_limit() {
        let frame = Packet::Publish(Publish {
            message: Message::new("t", vec![0u8; 64]),
            packet_id: None,
            dup: false,
        })
        .encode()
        .unwrap();
        let mut stream: &[u8] = &frame;
        let err = read_packet(&mut stream, 16).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::TooLarge { .. })
        ));
    }
}
