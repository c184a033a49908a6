//! In-process broker for simulation and tests
//!
//! `SimulatedBroker` answers the handshake, subscriptions, publishes and pings the
//! way a real broker would, records every packet the client sent, and lets the
//! caller break the link on demand.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::rc::Rc;

use tokio::sync::mpsc;

use super::{PacketReader, PacketWriter, Transport};
use crate::communication::packet::{Credentials, Message, Packet, Publish, QoS};
use crate::communication::subscriptions::topic_matches;
use crate::error::TransportError;

type LinkSender = mpsc::UnboundedSender<Result<Packet, TransportError>>;

struct BrokerState {
    received: Vec<Packet>,
    attempts: u32,
    connections: u32,
    refuse_connections: u32,
    reject_code: Option<u8>,
    respond_to_pings: bool,
    required_credentials: Option<Credentials>,
    retained: BTreeMap<String, Message>,
    subscriptions: Vec<String>,
    will: Option<Message>,
    generation: u64,
    link: Option<LinkSender>,
}

impl BrokerState {
    fn send(&self, packet: Packet) {
        if let Some(link) = &self.link {
            link.send(Ok(packet)).ok();
        }
    }

    fn deliver(&self, message: &Message) -> bool {
        if !self
            .subscriptions
            .iter()
            .any(|f| topic_matches(f, &message.topic))
        {
            return false;
        }
        self.send(Packet::Publish(Publish {
            message: message.clone().with_qos(QoS::AtMostOnce),
            packet_id: None,
            dup: false,
        }));
        true
    }

    fn handle(&mut self, packet: &Packet) {
        match packet {
            Packet::Connect(connect) => {
                let code = match (&self.required_credentials, &connect.credentials) {
                    (Some(required), Some(given)) if required != given => 4,
                    (Some(_), None) => 4,
                    _ => self.reject_code.take().unwrap_or(0),
                };
                if code == 0 {
                    self.will = connect.will.clone();
                    self.subscriptions.clear();
                }
                self.send(Packet::ConnAck {
                    session_present: false,
                    code,
                });
            }
            Packet::Subscribe { packet_id, filters } => {
                let mut codes = Vec::with_capacity(filters.len());
                for (filter, qos) in filters {
                    if !self.subscriptions.contains(filter) {
                        self.subscriptions.push(filter.clone());
                    }
                    codes.push(*qos as u8);
                }
                self.send(Packet::SubAck {
                    packet_id: *packet_id,
                    codes,
                });
                let retained: Vec<Message> = self
                    .retained
                    .values()
                    .filter(|m| filters.iter().any(|(f, _)| topic_matches(f, &m.topic)))
                    .cloned()
                    .collect();
                for message in retained {
                    self.send(Packet::Publish(Publish {
                        message: message.with_qos(QoS::AtMostOnce).retained(true),
                        packet_id: None,
                        dup: false,
                    }));
                }
            }
            Packet::Publish(publish) => {
                let message = &publish.message;
                if message.retain {
                    if message.payload.is_empty() {
                        self.retained.remove(&message.topic);
                    } else {
                        self.retained.insert(message.topic.clone(), message.clone());
                    }
                }
                if let Some(packet_id) = publish.packet_id {
                    self.send(Packet::PubAck { packet_id });
                }
                let mut echo = message.clone();
                echo.retain = false;
                self.deliver(&echo);
            }
            Packet::PingReq => {
                if self.respond_to_pings {
                    self.send(Packet::PingResp);
                }
            }
            Packet::Disconnect => {
                self.will = None;
                self.link = None;
            }
            _ => {}
        }
    }
}

#[derive(Clone)]
pub struct SimulatedBroker {
    state: Rc<RefCell<BrokerState>>,
}

impl Default for SimulatedBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBroker {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(BrokerState {
                received: Vec::new(),
                attempts: 0,
                connections: 0,
                refuse_connections: 0,
                reject_code: None,
                respond_to_pings: true,
                required_credentials: None,
                retained: BTreeMap::new(),
                subscriptions: Vec::new(),
                will: None,
                generation: 0,
                link: None,
            })),
        }
    }

    /// Transport handle for a session
    pub fn link(&self) -> SimulatedLink {
        SimulatedLink {
            state: self.state.clone(),
        }
    }

    pub fn require_credentials(&self, credentials: Credentials) {
        self.state.borrow_mut().required_credentials = Some(credentials);
    }

    /// Make the next `count` link attempts fail before the handshake
    pub fn refuse_connections(&self, count: u32) {
        self.state.borrow_mut().refuse_connections = count;
    }

    /// Answer the next CONNECT with a non-zero return code
    pub fn reject_next_handshake(&self, code: u8) {
        self.state.borrow_mut().reject_code = Some(code);
    }

    pub fn set_respond_to_pings(&self, respond: bool) {
        self.state.borrow_mut().respond_to_pings = respond;
    }

    /// Link attempts, including refused ones
    pub fn attempts(&self) -> u32 {
        self.state.borrow().attempts
    }

    /// Links that were opened successfully
    pub fn connections(&self) -> u32 {
        self.state.borrow().connections
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().link.is_some()
    }

    /// Every packet the client has sent, oldest first
    pub fn received(&self) -> Vec<Packet> {
        self.state.borrow().received.clone()
    }

    pub fn clear_received(&self) {
        self.state.borrow_mut().received.clear();
    }

    /// Application messages the client has published, oldest first
    pub fn published(&self) -> Vec<Message> {
        self.state
            .borrow()
            .received
            .iter()
            .filter_map(|p| match p {
                Packet::Publish(publish) => Some(publish.message.clone()),
                _ => None,
            })
            .collect()
    }

    /// How many SUBSCRIBE packets named `pattern`
    pub fn subscribe_count(&self, pattern: &str) -> usize {
        self.state
            .borrow()
            .received
            .iter()
            .filter(|p| match p {
                Packet::Subscribe { filters, .. } => filters.iter().any(|(f, _)| f == pattern),
                _ => false,
            })
            .count()
    }

    pub fn retained(&self, topic: &str) -> Option<Message> {
        self.state.borrow().retained.get(topic).cloned()
    }

    /// Drop the current link without a DISCONNECT, firing the last will.
    pub fn sever(&self) {
        let mut state = self.state.borrow_mut();
        state.link = None;
        if let Some(will) = state.will.take() {
            if will.retain {
                state.retained.insert(will.topic.clone(), will);
            }
        }
    }

    /// Make the client's next read fail with an I/O error.
    pub fn fail_link(&self, kind: io::ErrorKind) {
        let mut state = self.state.borrow_mut();
        if let Some(link) = state.link.take() {
            link.send(Err(TransportError::Io(io::Error::new(
                kind,
                "simulated link failure",
            ))))
            .ok();
        }
    }

    /// Publish from another client. Returns true when the session was subscribed.
    pub fn inject(&self, message: Message) -> bool {
        let mut state = self.state.borrow_mut();
        if message.retain {
            state.retained.insert(message.topic.clone(), message.clone());
        }
        state.deliver(&message)
    }
}

/// [`Transport`] side of a [`SimulatedBroker`]
#[derive(Clone)]
pub struct SimulatedLink {
    state: Rc<RefCell<BrokerState>>,
}

pub struct SimulatedReader {
    rx: mpsc::UnboundedReceiver<Result<Packet, TransportError>>,
}

pub struct SimulatedWriter {
    state: Rc<RefCell<BrokerState>>,
    generation: u64,
}

impl Transport for SimulatedLink {
    type Reader = SimulatedReader;
    type Writer = SimulatedWriter;

    async fn open(&mut self) -> Result<(SimulatedReader, SimulatedWriter), TransportError> {
        let mut state = self.state.borrow_mut();
        state.attempts += 1;
        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "simulated broker refused the link",
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.generation += 1;
        state.connections += 1;
        state.link = Some(tx);
        Ok((
            SimulatedReader { rx },
            SimulatedWriter {
                state: self.state.clone(),
                generation: state.generation,
            },
        ))
    }

    fn describe(&self) -> String {
        "simulated broker".to_string()
    }
}

impl PacketReader for SimulatedReader {
    async fn read_packet(&mut self, _limit: usize) -> Result<Packet, TransportError> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(TransportError::ConnectionClosed),
        }
    }
}

impl PacketWriter for SimulatedWriter {
    async fn write_packet(&mut self, packet: &Packet) -> Result<(), TransportError> {
        packet.encode()?;
        let mut state = self.state.borrow_mut();
        if state.generation != self.generation || state.link.is_none() {
            return Err(TransportError::ConnectionClosed);
        }
        state.received.push(packet.clone());
        state.handle(packet);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if state.generation == self.generation {
            state.link = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::packet::Connect;

    fn connect() -> Packet {
        Packet::Connect(Connect {
            client_id: "node".to_string(),
            keepalive_secs: 30,
            clean_session: true,
            credentials: None,
            will: Some(Message::new("home/node/status", "offline").retained(true)),
        })
    }

    #[tokio::test]
    async fn test_handshake_and_retained_delivery() {
        let broker = SimulatedBroker::new();
        broker.inject(Message::new("home/a/status", "on").retained(true));

        let mut link = broker.link();
        let (mut reader, mut writer) = link.open().await.unwrap();
        writer.write_packet(&connect()).await.unwrap();
        assert!(matches!(
            reader.read_packet(0).await.unwrap(),
            Packet::ConnAck { code: 0, .. }
        ));

        writer
            .write_packet(&Packet::Subscribe {
                packet_id: 1,
                filters: vec![("home/+/status".to_string(), QoS::AtMostOnce)],
            })
            .await
            .unwrap();
        assert!(matches!(
            reader.read_packet(0).await.unwrap(),
            Packet::SubAck { packet_id: 1, .. }
        ));
        match reader.read_packet(0).await.unwrap() {
            Packet::Publish(p) => {
                assert_eq!(p.message.topic, "home/a/status");
                assert!(p.message.retain);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(broker.subscribe_count("home/+/status"), 1);
    }

    #[tokio::test]
    async fn test_sever_fires_will_and_closes_reader() {
        let broker = SimulatedBroker::new();
        let mut link = broker.link();
        let (mut reader, mut writer) = link.open().await.unwrap();
        writer.write_packet(&connect()).await.unwrap();
        reader.read_packet(0).await.unwrap();

        broker.sever();
        assert!(matches!(
            reader.read_packet(0).await,
            Err(TransportError::ConnectionClosed)
        ));
        assert!(writer.write_packet(&Packet::PingReq).await.is_err());
        assert_eq!(
            broker.retained("home/node/status").unwrap().payload_str(),
            Some("offline")
        );
    }

    #[tokio::test]
    async fn test_refused_and_rejected_connections() {
        let broker = SimulatedBroker::new();
        broker.refuse_connections(1);
        let mut link = broker.link();
        assert!(link.open().await.is_err());

        broker.require_credentials(Credentials {
            username: "u".to_string(),
            password: Some("p".to_string()),
        });
        let (mut reader, mut writer) = link.open().await.unwrap();
        writer.write_packet(&connect()).await.unwrap();
        assert_eq!(
            reader.read_packet(0).await.unwrap(),
            Packet::ConnAck {
                session_present: false,
                code: 4
            }
        );
        assert_eq!(broker.attempts(), 2);
        assert_eq!(broker.connections(), 1);
    }
}
