//! # SmartNode
//!
//! A declarative, self-healing runtime for sensor nodes. A JSON description names
//! the components to build and how they reference each other; the runtime loads
//! them, keeps a broker session alive across link failures, and restarts the
//! process when its run-loop stalls.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smartnode::prelude::*;
//!
//! fn main() -> NodeResult<()> {
//!     let settings = NodeSettings::from_file("node.toml")?;
//!     let transport = TcpTransport::new(&settings.broker.host, settings.broker.port);
//!     let node = SmartNode::new(settings, transport, smartnode::default_factories())?;
//!     node.run_blocking()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Component loader** with named references and partial-failure reporting
//! - **Persistent MQTT session** with subscription replay and bounded outbox
//! - **Liveness supervision** through a software or hardware watchdog
//! - **Standard library of components** (I2C bus, HTU21D, HC-SR04, water sensor)

// Re-export core components
pub use smartnode_core::{self, *};

// Re-export standard library with alias
pub use smartnode_library as library;
pub use smartnode_library::{default_factories, register_all};

// Re-export the serialization and runtime crates components are written against
pub use serde;
pub use tokio;

/// The SmartNode prelude - everything needed to write and run components
pub mod prelude {
    // ============================================
    // Node
    // ============================================
    pub use smartnode_core::config::NodeSettings;
    pub use smartnode_core::node::{BootSummary, SmartNode};

    // ============================================
    // Components
    // ============================================
    pub use smartnode_core::core::{
        unknown_function, CallFuture, Capability, Component, NodeContext, Reading, Registry,
        Sensor,
    };
    pub use smartnode_core::loader::{
        BuildContext, ComponentFactory, DescriptorSet, FactoryRegistry, LoadReport, LoadStatus,
        ResolvedArgs,
    };

    // ============================================
    // Communication
    // ============================================
    pub use smartnode_core::communication::{
        LogLevel, Message, QoS, RemoteLogger, SessionHandle, SessionState, SimulatedBroker,
        TcpTransport, TopicBuilder,
    };

    // ============================================
    // Scheduling & Supervision
    // ============================================
    pub use smartnode_core::scheduling::{
        Scheduler, SchedulerConfig, SchedulerHandle, ShutdownTrigger, Supervisor,
    };

    // ============================================
    // Errors
    // ============================================
    pub use smartnode_core::error::{LoadError, NodeError, NodeResult};

    // ============================================
    // Standard components
    // ============================================
    pub use smartnode_library::{Hcsr04, Htu21d, I2cBus, WaterSensor};
}
