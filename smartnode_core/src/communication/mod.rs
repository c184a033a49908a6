//! # Broker communication for SmartNode
//!
//! - **Packet**: MQTT 3.1.1 packets and their wire codec
//! - **Transport**: TCP and in-process simulated links
//! - **Session**: the persistent connection with reconnect, keepalive and
//!   subscription replay
//! - **Telemetry**: device topics and the remote logger

pub mod backoff;
pub mod outbox;
pub mod packet;
pub mod session;
pub mod subscriptions;
pub mod telemetry;
pub mod transport;

pub use backoff::{BackoffPolicy, JitterPolicy, ReconnectBackoff};
pub use packet::{Credentials, Message, Packet, QoS};
pub use session::{Session, SessionConfig, SessionHandle, SessionState, SessionStats};
pub use subscriptions::topic_matches;
pub use telemetry::{LogLevel, RemoteLogger, TopicBuilder};
pub use transport::{SimulatedBroker, SimulatedLink, TcpTransport, Transport};
