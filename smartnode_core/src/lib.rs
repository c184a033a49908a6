//! # SmartNode Core
//!
//! The runtime for a SmartNode device: a single-node client that turns a
//! declarative component description into running handlers, keeps them reachable
//! over an unreliable broker link and restarts itself when the run-loop stalls.
//!
//! - **Loader**: resolves descriptors into a registry of live components
//! - **Scheduling**: cooperative run-loop with a liveness supervisor
//! - **Communication**: persistent MQTT session with reconnect and replay
//! - **Config**: TOML node settings
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smartnode_core::{FactoryRegistry, NodeSettings, SmartNode, TcpTransport};
//!
//! fn main() -> smartnode_core::NodeResult<()> {
//!     let settings = NodeSettings::from_file("node.toml")?;
//!     let transport = TcpTransport::new(&settings.broker.host, settings.broker.port);
//!     let node = SmartNode::new(settings, transport, FactoryRegistry::new())?;
//!     node.run_blocking()?;
//!     Ok(())
//! }
//! ```

pub mod communication;
pub mod config;
pub mod core;
pub mod error;
pub mod loader;
pub mod node;
pub mod scheduling;

/// Version reported in the remote-configuration request and boot message
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use communication::{
    LogLevel, Message, QoS, RemoteLogger, SessionHandle, SessionState, SimulatedBroker,
    TcpTransport, TopicBuilder,
};
pub use config::NodeSettings;
pub use core::{Capability, Component, NodeContext, Reading, Registry, Sensor};
pub use error::{LoadError, NodeError, NodeResult, TaskFault};
pub use loader::{
    ComponentFactory, DescriptorSet, FactoryRegistry, LoadReport, LoadStatus, ResolvedArgs,
};
pub use node::{BootSummary, SmartNode};
pub use scheduling::{Scheduler, SchedulerConfig, Supervisor};
