//! Linux I2C driver
//!
//! I2C driver using the Linux i2cdev interface.
//! Requires the `i2c-hardware` feature.

use std::collections::HashMap;
use std::path::Path;

use i2cdev::core::I2CDevice;
use i2cdev::linux::LinuxI2CDevice;
use smartnode_core::error::{NodeError, NodeResult};

use super::not_ready;
use crate::drivers::DriverStatus;

/// Linux I2C driver, one open handle per slave address
pub struct LinuxI2cDriver {
    device: String,
    status: DriverStatus,
    handles: HashMap<u16, LinuxI2CDevice>,
}

impl LinuxI2cDriver {
    /// `device` is the bus path, e.g. `/dev/i2c-1`
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            status: DriverStatus::Uninitialized,
            handles: HashMap::new(),
        }
    }

    pub fn init(&mut self) -> NodeResult<()> {
        if !Path::new(&self.device).exists() {
            self.status = DriverStatus::Error(format!("{} not found", self.device));
            return Err(NodeError::driver(format!(
                "I2C device {} not found",
                self.device
            )));
        }
        self.status = DriverStatus::Ready;
        Ok(())
    }

    pub fn shutdown(&mut self) -> NodeResult<()> {
        self.handles.clear();
        self.status = DriverStatus::Shutdown;
        Ok(())
    }

    pub fn is_available(&self) -> bool {
        self.status.is_usable()
    }

    pub fn status(&self) -> DriverStatus {
        self.status.clone()
    }

    fn handle(&mut self, addr: u16) -> NodeResult<&mut LinuxI2CDevice> {
        if !self.status.is_usable() {
            return Err(not_ready());
        }
        if !self.handles.contains_key(&addr) {
            let handle = LinuxI2CDevice::new(&self.device, addr).map_err(|e| {
                NodeError::driver(format!("Failed to set I2C address 0x{:02x}: {}", addr, e))
            })?;
            self.handles.insert(addr, handle);
        }
        self.handles
            .get_mut(&addr)
            .ok_or_else(|| NodeError::driver("I2C handle vanished"))
    }

    pub fn read_bytes(&mut self, addr: u16, len: usize) -> NodeResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.handle(addr)?
            .read(&mut buf)
            .map_err(|e| NodeError::driver(format!("I2C read failed: {}", e)))?;
        self.status = DriverStatus::Running;
        Ok(buf)
    }

    pub fn write_bytes(&mut self, addr: u16, data: &[u8]) -> NodeResult<()> {
        self.handle(addr)?
            .write(data)
            .map_err(|e| NodeError::driver(format!("I2C write failed: {}", e)))?;
        self.status = DriverStatus::Running;
        Ok(())
    }
}
