//! Simulated I2C bus

use std::collections::HashMap;

use smartnode_core::error::NodeResult;

use super::not_ready;
use crate::drivers::DriverStatus;

/// Simulation I2C bus driver
///
/// Devices are register maps: a write sets the register pointer and stores any
/// trailing bytes, a read returns consecutive registers from the pointer. A
/// device may also answer a single command byte with a canned reply, which is how
/// sensors with measurement commands are simulated.
pub struct SimulationI2cDriver {
    status: DriverStatus,
    /// device_addr -> (register_addr -> value)
    devices: HashMap<u8, HashMap<u8, u8>>,
    register_pointers: HashMap<u8, u8>,
    /// (device_addr, command) -> reply
    replies: HashMap<(u8, u8), Vec<u8>>,
    /// Reply armed by the last command, consumed by the next read
    armed: HashMap<u8, Vec<u8>>,
    transfers: u64,
}

impl SimulationI2cDriver {
    pub fn new() -> Self {
        Self {
            status: DriverStatus::Uninitialized,
            devices: HashMap::new(),
            register_pointers: HashMap::new(),
            replies: HashMap::new(),
            armed: HashMap::new(),
            transfers: 0,
        }
    }

    /// Add a simulated device with initial register values
    pub fn add_device(&mut self, addr: u8, registers: HashMap<u8, u8>) {
        self.devices.insert(addr, registers);
        self.register_pointers.insert(addr, 0);
    }

    pub fn set_register(&mut self, addr: u8, reg: u8, value: u8) {
        self.devices.entry(addr).or_default().insert(reg, value);
    }

    pub fn get_register(&self, addr: u8, reg: u8) -> Option<u8> {
        self.devices
            .get(&addr)
            .and_then(|regs| regs.get(&reg).copied())
    }

    /// Answer `command` written to `addr` with `reply` on the following read
    pub fn set_reply(&mut self, addr: u8, command: u8, reply: Vec<u8>) {
        self.replies.insert((addr, command), reply);
    }

    pub fn clear_reply(&mut self, addr: u8, command: u8) {
        self.replies.remove(&(addr, command));
    }

    /// Reads and writes performed so far
    pub fn transfers(&self) -> u64 {
        self.transfers
    }

    pub fn init(&mut self) -> NodeResult<()> {
        self.status = DriverStatus::Ready;
        Ok(())
    }

    pub fn shutdown(&mut self) -> NodeResult<()> {
        self.status = DriverStatus::Shutdown;
        Ok(())
    }

    pub fn is_available(&self) -> bool {
        true
    }

    pub fn status(&self) -> DriverStatus {
        self.status.clone()
    }

    pub fn read_bytes(&mut self, addr: u16, len: usize) -> NodeResult<Vec<u8>> {
        if !self.status.is_usable() {
            return Err(not_ready());
        }
        self.status = DriverStatus::Running;
        self.transfers += 1;

        let addr8 = addr as u8;
        if let Some(mut reply) = self.armed.remove(&addr8) {
            reply.resize(len, 0xFF);
            return Ok(reply);
        }

        let reg_ptr = self.register_pointers.get(&addr8).copied().unwrap_or(0);
        let mut result = Vec::with_capacity(len);
        match self.devices.get(&addr8) {
            Some(device) => {
                for i in 0..len {
                    let reg = reg_ptr.wrapping_add(i as u8);
                    result.push(device.get(&reg).copied().unwrap_or(0xFF));
                }
            }
            // nobody pulls the lines low
            None => result.resize(len, 0xFF),
        }
        Ok(result)
    }

    pub fn write_bytes(&mut self, addr: u16, data: &[u8]) -> NodeResult<()> {
        if !self.status.is_usable() {
            return Err(not_ready());
        }
        self.status = DriverStatus::Running;
        self.transfers += 1;

        let addr8 = addr as u8;
        let Some((&command, payload)) = data.split_first() else {
            return Ok(());
        };

        if payload.is_empty() {
            if let Some(reply) = self.replies.get(&(addr8, command)) {
                self.armed.insert(addr8, reply.clone());
                return Ok(());
            }
        }

        self.register_pointers.insert(addr8, command);
        if !payload.is_empty() {
            let device = self.devices.entry(addr8).or_default();
            for (i, &byte) in payload.iter().enumerate() {
                device.insert(command.wrapping_add(i as u8), byte);
            }
        }
        Ok(())
    }
}

impl Default for SimulationI2cDriver {
    fn default() -> Self {
        Self::new()
    }
}
