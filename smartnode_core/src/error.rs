//! Unified error handling for SmartNode
//!
//! `NodeError` is the crate-wide error type. The focused enums below it map onto the
//! failure classes the runtime treats differently:
//!
//! - [`LoadError`] is recorded per component and never stops the node from booting.
//! - [`TransportError`] (and [`ProtocolError`], which recovers the same way) drives the
//!   broker session into reconnect.
//! - [`TaskFault`] is caught at the scheduler boundary and reported.

use serde::Serialize;
use thiserror::Error;

/// Main error type for SmartNode operations
#[derive(Debug, Error)]
pub enum NodeError {
    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parsing or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Component loading errors
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Broker transport errors
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A component argument names another component that is not registered
    #[error("Unresolved component reference '{0}'")]
    UnresolvedReference(String),

    /// A component was asked to run a function it does not provide
    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    /// Driver-related errors
    #[error("Driver error: {0}")]
    Driver(String),

    /// Scheduling errors
    #[error("Scheduling error: {0}")]
    Scheduling(String),

    /// Watchdog / supervisor errors
    #[error("Supervisor error: {0}")]
    Supervisor(String),

    /// Serialization/Deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid input/argument errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Catch-all for other error types
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Results using NodeError
pub type NodeResult<T> = Result<T, NodeError>;

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for NodeError {
    fn from(err: toml::de::Error) -> Self {
        NodeError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<&str> for NodeError {
    fn from(msg: &str) -> Self {
        NodeError::Other(msg.to_string())
    }
}

impl From<String> for NodeError {
    fn from(msg: String) -> Self {
        NodeError::Other(msg)
    }
}

impl NodeError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(msg: S) -> Self {
        NodeError::Config(msg.into())
    }

    /// Create a driver error
    pub fn driver<S: Into<String>>(msg: S) -> Self {
        NodeError::Driver(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        NodeError::InvalidInput(msg.into())
    }
}

/// Per-component load failure.
///
/// Serializable so the load report can be published as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoadError {
    #[error("component '{component}' references '{reference}', which is not loaded")]
    UnresolvedReference { component: String, reference: String },

    #[error("component '{name}' is declared more than once; first occurrence kept")]
    DuplicateName { name: String },

    #[error("component '{component}' uses unknown factory '{factory}'")]
    UnknownFactory { component: String, factory: String },

    #[error("component '{name}' is missing from the explicit load order")]
    NotInOrder { name: String },

    #[error("load order names '{name}', which has no descriptor")]
    MissingDescriptor { name: String },

    #[error("construction of '{component}' failed: {message}")]
    Construction { component: String, message: String },

    #[error("init function '{function}' of '{component}' failed: {message}")]
    Initialization {
        component: String,
        function: String,
        message: String,
    },

    #[error("component '{component}' has no function '{function}'")]
    UnknownFunction { component: String, function: String },

    #[error("descriptor '{name}' is invalid: {message}")]
    InvalidDescriptor { name: String, message: String },

    #[error("no explicit load order; components load in declaration order")]
    ImplicitOrder,
}

impl LoadError {
    /// Map an error raised by a factory into the load taxonomy.
    pub fn from_construction(component: &str, err: NodeError) -> Self {
        match err {
            NodeError::UnresolvedReference(reference) => LoadError::UnresolvedReference {
                component: component.to_string(),
                reference,
            },
            other => LoadError::Construction {
                component: component.to_string(),
                message: other.to_string(),
            },
        }
    }

    pub fn is_unresolved_reference(&self) -> bool {
        matches!(self, LoadError::UnresolvedReference { .. })
    }
}

/// Broker protocol violations. Recovered exactly like a transport failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("unexpected packet: {0}")]
    Unexpected(String),

    #[error("packet of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("unsupported packet type {0:#04x}")]
    UnsupportedType(u8),
}

/// Link-level failures of the broker connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("transport operation timed out: {0}")]
    Timeout(String),

    #[error("no keepalive acknowledgement within {0:?}")]
    KeepaliveTimeout(std::time::Duration),

    #[error("broker refused connection (return code {0})")]
    Refused(u8),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// An unhandled failure inside a scheduled task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task '{task}' faulted: {message}")]
pub struct TaskFault {
    pub task: String,
    pub message: String,
    /// True when the fault was a panic rather than a returned error
    pub panicked: bool,
}

impl TaskFault {
    pub fn from_error(task: &str, err: &NodeError) -> Self {
        Self {
            task: task.to_string(),
            message: err.to_string(),
            panicked: false,
        }
    }

    pub fn from_panic(task: &str, payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("panicked: {}", s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("panicked: {}", s)
        } else {
            "panicked with unknown payload".to_string()
        };
        Self {
            task: task.to_string(),
            message,
            panicked: true,
        }
    }
}
