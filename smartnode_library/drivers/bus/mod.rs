//! I2C bus drivers
//!
//! - `SimulationI2cDriver` - always available, register maps plus command replies
//! - `LinuxI2cDriver` - Linux i2cdev interface (requires `i2c-hardware` feature)

mod simulation;

#[cfg(feature = "i2c-hardware")]
mod linux_i2c;

pub use simulation::SimulationI2cDriver;

#[cfg(feature = "i2c-hardware")]
pub use linux_i2c::LinuxI2cDriver;

use smartnode_core::error::{NodeError, NodeResult};

use super::DriverStatus;

/// I2C driver backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum I2cDriverBackend {
    #[default]
    Simulation,
    #[cfg(feature = "i2c-hardware")]
    Linux,
}

impl I2cDriverBackend {
    /// Backend named in a descriptor's `backend` argument
    pub fn from_name(name: &str) -> NodeResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "simulation" | "sim" => Ok(Self::Simulation),
            #[cfg(feature = "i2c-hardware")]
            "linux" => Ok(Self::Linux),
            #[cfg(not(feature = "i2c-hardware"))]
            "linux" => Err(NodeError::config(
                "the linux I2C backend requires the i2c-hardware feature",
            )),
            other => Err(NodeError::config(format!("unknown I2C backend '{}'", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simulation => "simulation",
            #[cfg(feature = "i2c-hardware")]
            Self::Linux => "linux",
        }
    }
}

/// Type-erased I2C driver
pub enum I2cDriver {
    Simulation(SimulationI2cDriver),
    #[cfg(feature = "i2c-hardware")]
    Linux(LinuxI2cDriver),
}

impl I2cDriver {
    /// `device` is the bus device path; the simulation ignores it
    #[cfg_attr(not(feature = "i2c-hardware"), allow(unused_variables))]
    pub fn new(backend: I2cDriverBackend, device: &str) -> NodeResult<Self> {
        match backend {
            I2cDriverBackend::Simulation => Ok(Self::Simulation(SimulationI2cDriver::new())),
            #[cfg(feature = "i2c-hardware")]
            I2cDriverBackend::Linux => Ok(Self::Linux(LinuxI2cDriver::new(device))),
        }
    }

    pub fn simulation() -> Self {
        Self::Simulation(SimulationI2cDriver::new())
    }

    pub fn backend(&self) -> I2cDriverBackend {
        match self {
            Self::Simulation(_) => I2cDriverBackend::Simulation,
            #[cfg(feature = "i2c-hardware")]
            Self::Linux(_) => I2cDriverBackend::Linux,
        }
    }

    pub fn as_simulation_mut(&mut self) -> Option<&mut SimulationI2cDriver> {
        match self {
            Self::Simulation(d) => Some(d),
            #[cfg(feature = "i2c-hardware")]
            _ => None,
        }
    }

    pub fn init(&mut self) -> NodeResult<()> {
        match self {
            Self::Simulation(d) => d.init(),
            #[cfg(feature = "i2c-hardware")]
            Self::Linux(d) => d.init(),
        }
    }

    pub fn shutdown(&mut self) -> NodeResult<()> {
        match self {
            Self::Simulation(d) => d.shutdown(),
            #[cfg(feature = "i2c-hardware")]
            Self::Linux(d) => d.shutdown(),
        }
    }

    pub fn is_available(&self) -> bool {
        match self {
            Self::Simulation(d) => d.is_available(),
            #[cfg(feature = "i2c-hardware")]
            Self::Linux(d) => d.is_available(),
        }
    }

    pub fn status(&self) -> DriverStatus {
        match self {
            Self::Simulation(d) => d.status(),
            #[cfg(feature = "i2c-hardware")]
            Self::Linux(d) => d.status(),
        }
    }

    pub fn read_bytes(&mut self, addr: u16, len: usize) -> NodeResult<Vec<u8>> {
        match self {
            Self::Simulation(d) => d.read_bytes(addr, len),
            #[cfg(feature = "i2c-hardware")]
            Self::Linux(d) => d.read_bytes(addr, len),
        }
    }

    pub fn write_bytes(&mut self, addr: u16, data: &[u8]) -> NodeResult<()> {
        match self {
            Self::Simulation(d) => d.write_bytes(addr, data),
            #[cfg(feature = "i2c-hardware")]
            Self::Linux(d) => d.write_bytes(addr, data),
        }
    }
}

fn not_ready() -> NodeError {
    NodeError::driver("I2C driver not initialized")
}
