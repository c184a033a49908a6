//! Persistent broker session
//!
//! [`Session`] owns the connect / serve / backoff cycle and runs as one task on the
//! scheduler. Everything else talks to it through a cloneable [`SessionHandle`]:
//! subscriptions and publishes are recorded in shared state and the session task is
//! woken to apply them, so callers never wait on the network.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::backoff::{BackoffPolicy, ReconnectBackoff};
use super::outbox::Outbox;
use super::packet::{Connect, Credentials, Message, Packet, Publish, QoS};
use super::subscriptions::{validate_filter, MessageHandler, SubscriptionSet};
use super::transport::{PacketReader, PacketWriter, Transport};
use crate::error::{NodeResult, ProtocolError, TaskFault, TransportError};
use crate::scheduling::{is_shutdown, wait_for_shutdown};

const HISTORY_LIMIT: usize = 64;
const DEFAULT_KEEPALIVE_FACTOR: f64 = 1.5;
const SUBACK_FAILURE: u8 = 0x80;

/// Connection lifecycle as seen by the rest of the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal, reached only through shutdown
    Closed,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub keepalive: Duration,
    /// A PINGRESP must arrive within `keepalive × keepalive_factor` of the PINGREQ
    pub keepalive_factor: f64,
    pub handshake_timeout: Duration,
    pub pending_capacity: usize,
    pub max_packet_size: usize,
    pub backoff: BackoffPolicy,
    /// Topic for the retained `online` birth message and `offline` last will
    pub availability_topic: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: "smartnode".to_string(),
            credentials: None,
            keepalive: Duration::from_secs(60),
            keepalive_factor: DEFAULT_KEEPALIVE_FACTOR,
            handshake_timeout: Duration::from_secs(10),
            pending_capacity: 64,
            max_packet_size: 64 * 1024,
            backoff: BackoffPolicy::default(),
            availability_topic: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub connections: u64,
    pub connection_failures: u64,
    pub published: u64,
    /// Publishes dropped because their frame exceeds the packet size limit
    pub rejected: u64,
    pub received: u64,
    pub subscribes_sent: u64,
}

struct Shared {
    config: SessionConfig,
    subscriptions: RefCell<SubscriptionSet>,
    outbox: RefCell<Outbox>,
    /// Publishes made while connected; never evicted
    ready: RefCell<VecDeque<Message>>,
    wake: Notify,
    state: watch::Sender<SessionState>,
    history: RefCell<VecDeque<SessionState>>,
    stats: RefCell<SessionStats>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        log::debug!("Session state -> {:?}", state);
        {
            let mut history = self.history.borrow_mut();
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(state.clone());
        }
        self.state.send_replace(state);
    }

    fn park(&self, message: Message) {
        if let Some(evicted) = self.outbox.borrow_mut().push(message) {
            log::warn!("Outbox full, dropped message for '{}'", evicted.topic);
        }
    }

    fn next_outgoing(&self) -> Option<Message> {
        let parked = self.outbox.borrow_mut().pop();
        parked.or_else(|| self.ready.borrow_mut().pop_front())
    }
}

/// How long a PINGRESP may take. Falls back to the default factor when `factor` is
/// unusable and to `keepalive` itself when the product does not fit a `Duration`.
fn keepalive_grace(keepalive: Duration, factor: f64) -> Duration {
    let factor = if factor.is_finite() && factor >= 1.0 {
        factor
    } else {
        log::warn!(
            "Keepalive factor {} is unusable, using {}",
            factor,
            DEFAULT_KEEPALIVE_FACTOR
        );
        DEFAULT_KEEPALIVE_FACTOR
    };
    Duration::try_from_secs_f64(keepalive.as_secs_f64() * factor).unwrap_or(keepalive)
}

/// Cloneable front end of the session
#[derive(Clone)]
pub struct SessionHandle {
    shared: Rc<Shared>,
}

impl SessionHandle {
    /// Register a handler for `pattern`. The broker subscription is issued right
    /// away when connected and restored after every reconnect.
    pub fn subscribe<F, Fut>(&self, pattern: &str, qos: QoS, handler: F) -> NodeResult<()>
    where
        F: Fn(Message) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        validate_filter(pattern)?;
        let handler: MessageHandler = Rc::new(move |message: Message| handler(message).boxed_local());
        let is_new = self
            .shared
            .subscriptions
            .borrow_mut()
            .add(pattern, qos, handler);
        if is_new {
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    /// Queue a message for the broker. While connected it is sent on the session's
    /// next turn; while disconnected it waits in the bounded outbox, which drops the
    /// oldest entry when full.
    pub fn publish(&self, message: Message) {
        if self.shared.state.borrow().is_connected() {
            self.shared.ready.borrow_mut().push_back(message);
        } else {
            self.shared.park(message);
        }
        self.shared.wake.notify_one();
    }

    /// Where panics in message handlers are reported
    pub fn on_handler_fault(&self, sink: impl Fn(TaskFault) + 'static) {
        self.shared
            .subscriptions
            .borrow_mut()
            .set_fault_sink(Rc::new(sink));
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Resolve once the state satisfies `predicate`.
    pub async fn wait_for<P>(&self, mut predicate: P) -> SessionState
    where
        P: FnMut(&SessionState) -> bool,
    {
        let mut rx = self.shared.state.subscribe();
        loop {
            {
                let current = rx.borrow_and_update();
                if predicate(&current) {
                    return current.clone();
                }
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// Most recent state transitions, oldest first
    pub fn transitions(&self) -> Vec<SessionState> {
        self.shared.history.borrow().iter().cloned().collect()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats.borrow().clone()
    }

    /// Messages not yet handed to the broker
    pub fn pending(&self) -> usize {
        self.shared.outbox.borrow().len() + self.shared.ready.borrow().len()
    }

    pub fn dropped(&self) -> u64 {
        self.shared.outbox.borrow().dropped()
    }

    pub fn subscription_patterns(&self) -> Vec<String> {
        self.shared
            .subscriptions
            .borrow()
            .patterns()
            .into_iter()
            .map(|(pattern, _)| pattern)
            .collect()
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Per-link bookkeeping, discarded on disconnect
struct Connection<W> {
    writer: W,
    limit: usize,
    active: HashSet<String>,
    inflight: BTreeMap<u16, Message>,
    last_id: u16,
}

impl<W: PacketWriter> Connection<W> {
    fn next_id(&mut self) -> u16 {
        self.last_id = self.last_id.wrapping_add(1);
        if self.last_id == 0 {
            self.last_id = 1;
        }
        self.last_id
    }

    async fn subscribe(&mut self, pattern: String, qos: QoS) -> Result<u16, TransportError> {
        let packet_id = self.next_id();
        self.writer
            .write_packet(&Packet::Subscribe {
                packet_id,
                filters: vec![(pattern.clone(), qos)],
            })
            .await?;
        self.active.insert(pattern);
        Ok(packet_id)
    }

    /// Hand `message` to the writer. `Ok(false)` means it can never be sent and was
    /// dropped.
    async fn publish(&mut self, message: Message) -> Result<bool, (Message, TransportError)> {
        let packet_id = match message.qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => Some(self.next_id()),
        };
        let packet = Packet::Publish(Publish {
            message: message.clone(),
            packet_id,
            dup: false,
        });
        if let Err(e) = packet.encode_within(self.limit) {
            log::error!("Dropping publish to '{:.64}': {}", message.topic, e);
            return Ok(false);
        }
        match self.writer.write_packet(&packet).await {
            Ok(()) => {
                if let Some(id) = packet_id {
                    self.inflight.insert(id, message);
                }
                Ok(true)
            }
            Err(e) => Err((message, e)),
        }
    }
}

async fn read_loop<R: PacketReader>(
    mut reader: R,
    limit: usize,
    tx: mpsc::UnboundedSender<Result<Packet, TransportError>>,
) {
    loop {
        let result = reader.read_packet(limit).await;
        let failed = result.is_err();
        if tx.send(result).is_err() || failed {
            break;
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

pub struct Session<T: Transport> {
    shared: Rc<Shared>,
    transport: T,
    shutdown: watch::Receiver<bool>,
    backoff: ReconnectBackoff,
}

impl<T: Transport> Session<T> {
    pub fn new(config: SessionConfig, transport: T, shutdown: watch::Receiver<bool>) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let backoff = ReconnectBackoff::new(config.backoff);
        let shared = Rc::new(Shared {
            outbox: RefCell::new(Outbox::new(config.pending_capacity)),
            ready: RefCell::new(VecDeque::new()),
            subscriptions: RefCell::new(SubscriptionSet::new()),
            wake: Notify::new(),
            state,
            history: RefCell::new(VecDeque::new()),
            stats: RefCell::new(SessionStats::default()),
            config,
        });
        Self {
            shared,
            transport,
            shutdown,
            backoff,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: self.shared.clone(),
        }
    }

    /// Drive the session until shutdown. Transport and protocol failures are never
    /// returned; they move the session through `Disconnected` into backoff.
    pub async fn run(mut self) -> NodeResult<()> {
        log::info!("Broker session starting ({})", self.transport.describe());
        loop {
            if is_shutdown(&self.shutdown) {
                break;
            }
            self.shared.set_state(SessionState::Connecting);
            match self.connect_and_serve().await {
                Ok(()) => break,
                Err(e) => {
                    self.shared.stats.borrow_mut().connection_failures += 1;
                    log::warn!("Broker connection lost: {}", e);
                    self.shared.set_state(SessionState::Disconnected);
                }
            }
            if is_shutdown(&self.shutdown) {
                break;
            }

            let delay = self.backoff.next_delay();
            let attempt = self.backoff.attempt();
            self.shared
                .set_state(SessionState::Reconnecting { attempt, delay });
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }
        self.shared.set_state(SessionState::Closed);
        log::info!("Broker session closed");
        Ok(())
    }

    fn connect_packet(&self) -> Packet {
        let config = &self.shared.config;
        Packet::Connect(Connect {
            client_id: config.client_id.clone(),
            keepalive_secs: config.keepalive.as_secs().min(u16::MAX as u64) as u16,
            clean_session: true,
            credentials: config.credentials.clone(),
            will: config
                .availability_topic
                .as_ref()
                .map(|topic| Message::new(topic.clone(), "offline").retained(true)),
        })
    }

    async fn handshake(&mut self) -> Result<(T::Reader, T::Writer), TransportError> {
        let connect = self.connect_packet();
        let limit = self.shared.config.max_packet_size;
        let (mut reader, mut writer) = self.transport.open().await?;
        writer.write_packet(&connect).await?;
        match reader.read_packet(limit).await? {
            Packet::ConnAck { code: 0, .. } => Ok((reader, writer)),
            Packet::ConnAck { code, .. } => Err(TransportError::Refused(code)),
            other => Err(ProtocolError::Unexpected(format!("{} during handshake", other.kind())).into()),
        }
    }

    async fn connect_and_serve(&mut self) -> Result<(), TransportError> {
        let timeout = self.shared.config.handshake_timeout;
        let (reader, writer) = time::timeout(timeout, self.handshake())
            .await
            .map_err(|_| TransportError::Timeout("broker handshake".to_string()))??;
        self.backoff.reset();
        log::info!("Connected to {}", self.transport.describe());

        let (tx, mut inbound) = mpsc::unbounded_channel();
        let limit = self.shared.config.max_packet_size;
        let _intake = AbortOnDrop(tokio::task::spawn_local(read_loop(reader, limit, tx)));

        let mut conn = Connection {
            writer,
            limit,
            active: HashSet::new(),
            inflight: BTreeMap::new(),
            last_id: 0,
        };
        let result = self.serve(&mut conn, &mut inbound).await;

        // unacknowledged QoS 1 publishes go out again on the next link
        {
            let mut outbox = self.shared.outbox.borrow_mut();
            for (_, message) in std::mem::take(&mut conn.inflight).into_iter().rev() {
                outbox.requeue(message);
            }
        }
        // unsent publishes from the connected period now wait like any other
        let unsent: Vec<Message> = self.shared.ready.borrow_mut().drain(..).collect();
        for message in unsent {
            self.shared.park(message);
        }
        result
    }

    async fn serve(
        &self,
        conn: &mut Connection<T::Writer>,
        inbound: &mut mpsc::UnboundedReceiver<Result<Packet, TransportError>>,
    ) -> Result<(), TransportError> {
        // replay happens-before readiness
        let patterns = self.shared.subscriptions.borrow().patterns();
        for (pattern, qos) in patterns {
            let packet_id = conn.subscribe(pattern, qos).await?;
            self.shared.stats.borrow_mut().subscribes_sent += 1;
            self.await_suback(packet_id, conn, inbound).await?;
        }

        self.shared.stats.borrow_mut().connections += 1;
        self.shared.set_state(SessionState::Connected);

        if let Some(topic) = &self.shared.config.availability_topic {
            conn.publish(Message::new(topic.clone(), "online").retained(true))
                .await
                .map_err(|(_, e)| e)?;
        }
        self.sync(conn).await?;

        let keepalive = self.shared.config.keepalive;
        let grace = keepalive_grace(keepalive, self.shared.config.keepalive_factor);
        let mut ping = time::interval_at(Instant::now() + keepalive, keepalive);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping_sent: Option<Instant> = None;
        let mut shutdown = self.shutdown.clone();

        loop {
            let pong_deadline = ping_sent.and_then(|at| at.checked_add(grace));
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => {
                    conn.writer.write_packet(&Packet::Disconnect).await.ok();
                    conn.writer.close().await.ok();
                    return Ok(());
                }
                packet = inbound.recv() => match packet {
                    Some(Ok(packet)) => self.handle_inbound(packet, conn, &mut ping_sent).await?,
                    Some(Err(e)) => return Err(e),
                    None => return Err(TransportError::ConnectionClosed),
                },
                _ = self.shared.wake.notified() => self.sync(conn).await?,
                _ = ping.tick() => {
                    if ping_sent.is_none() {
                        conn.writer.write_packet(&Packet::PingReq).await?;
                        ping_sent = Some(Instant::now());
                    }
                }
                _ = sleep_until_opt(pong_deadline) => {
                    return Err(TransportError::KeepaliveTimeout(grace));
                }
            }
        }
    }

    async fn await_suback(
        &self,
        packet_id: u16,
        conn: &mut Connection<T::Writer>,
        inbound: &mut mpsc::UnboundedReceiver<Result<Packet, TransportError>>,
    ) -> Result<(), TransportError> {
        let deadline = Instant::now() + self.shared.config.handshake_timeout;
        let mut ping_sent = None;
        loop {
            let packet = match time::timeout_at(deadline, inbound.recv()).await {
                Err(_) => {
                    return Err(TransportError::Timeout(format!(
                        "SUBACK for packet {}",
                        packet_id
                    )))
                }
                Ok(None) => return Err(TransportError::ConnectionClosed),
                Ok(Some(result)) => result?,
            };
            match packet {
                Packet::SubAck {
                    packet_id: id,
                    codes,
                } if id == packet_id => {
                    if codes.contains(&SUBACK_FAILURE) {
                        log::warn!("Broker rejected subscription (packet {})", packet_id);
                    }
                    return Ok(());
                }
                other => self.handle_inbound(other, conn, &mut ping_sent).await?,
            }
        }
    }

    /// Issue subscriptions added since the link came up, then flush the outbox and
    /// the connected-period queue, in that order.
    async fn sync(&self, conn: &mut Connection<T::Writer>) -> Result<(), TransportError> {
        let fresh: Vec<(String, QoS)> = self
            .shared
            .subscriptions
            .borrow()
            .patterns()
            .into_iter()
            .filter(|(pattern, _)| !conn.active.contains(pattern))
            .collect();
        for (pattern, qos) in fresh {
            conn.subscribe(pattern, qos).await?;
            self.shared.stats.borrow_mut().subscribes_sent += 1;
        }

        loop {
            let next = self.shared.next_outgoing();
            let Some(message) = next else {
                break;
            };
            match conn.publish(message).await {
                Ok(true) => self.shared.stats.borrow_mut().published += 1,
                Ok(false) => self.shared.stats.borrow_mut().rejected += 1,
                Err((message, e)) => {
                    self.shared.outbox.borrow_mut().requeue(message);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn handle_inbound(
        &self,
        packet: Packet,
        conn: &mut Connection<T::Writer>,
        ping_sent: &mut Option<Instant>,
    ) -> Result<(), TransportError> {
        match packet {
            Packet::Publish(publish) => {
                if let Some(packet_id) = publish.packet_id {
                    conn.writer
                        .write_packet(&Packet::PubAck { packet_id })
                        .await?;
                }
                self.shared.stats.borrow_mut().received += 1;
                let matched = self
                    .shared
                    .subscriptions
                    .borrow_mut()
                    .dispatch(&publish.message);
                if matched == 0 {
                    log::debug!("No handler for '{}'", publish.message.topic);
                }
            }
            Packet::PubAck { packet_id } => {
                conn.inflight.remove(&packet_id);
            }
            Packet::SubAck { packet_id, codes } => {
                if codes.contains(&SUBACK_FAILURE) {
                    log::warn!("Broker rejected subscription (packet {})", packet_id);
                }
            }
            Packet::PingResp => *ping_sent = None,
            other => {
                return Err(ProtocolError::Unexpected(other.kind().to_string()).into());
            }
        }
        Ok(())
    }
}
