//! Drivers behind the standard components
//!
//! Every driver has a simulation backend that is always available, so a node
//! configuration can be checked on a workstation. Hardware backends are feature
//! gated.
//!
//! # Available Drivers
//!
//! - I2C: `SimulationI2cDriver`, `LinuxI2cDriver` (requires `i2c-hardware`)
//! - ADC: `SimulationAdcDriver`
//! - Ultrasonic echo: `SimulationEchoDriver`

pub mod adc;
pub mod bus;
pub mod ultrasonic;

pub use adc::SimulationAdcDriver;
#[cfg(feature = "i2c-hardware")]
pub use bus::LinuxI2cDriver;
pub use bus::{I2cDriver, I2cDriverBackend, SimulationI2cDriver};
pub use ultrasonic::{Echo, EchoError, SimulationEchoDriver};

/// Lifecycle state shared by all drivers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DriverStatus {
    #[default]
    Uninitialized,
    Ready,
    Running,
    Shutdown,
    Error(String),
}

impl DriverStatus {
    pub fn is_usable(&self) -> bool {
        matches!(self, DriverStatus::Ready | DriverStatus::Running)
    }
}
