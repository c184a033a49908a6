pub mod component;
pub mod context;
pub mod registry;

pub use component::{
    downcast, unknown_function, AsAny, CallFuture, Capability, Component, Measurement, Reading,
    Sensor,
};
pub use context::NodeContext;
pub use registry::{Registry, RegistryBuilder, RegistryEntry};
