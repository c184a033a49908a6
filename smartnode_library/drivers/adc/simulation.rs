//! Simulation ADC driver

use smartnode_core::error::{NodeError, NodeResult};

use super::DEFAULT_MAX_VOLTAGE;
use crate::drivers::DriverStatus;

/// A single ADC channel holding whatever voltage was last set on it
pub struct SimulationAdcDriver {
    pin: String,
    status: DriverStatus,
    voltage: f64,
    max_voltage: f64,
    reads: u64,
}

impl SimulationAdcDriver {
    pub fn new(pin: impl Into<String>) -> Self {
        Self {
            pin: pin.into(),
            status: DriverStatus::Uninitialized,
            voltage: DEFAULT_MAX_VOLTAGE,
            max_voltage: DEFAULT_MAX_VOLTAGE,
            reads: 0,
        }
    }

    pub fn with_max_voltage(mut self, max_voltage: f64) -> Self {
        self.max_voltage = max_voltage;
        self
    }

    pub fn pin(&self) -> &str {
        &self.pin
    }

    /// Clamped to `0..=max_voltage`, as a real converter saturates
    pub fn set_voltage(&mut self, voltage: f64) {
        self.voltage = voltage.clamp(0.0, self.max_voltage);
    }

    pub fn max_voltage(&self) -> f64 {
        self.max_voltage
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn init(&mut self) -> NodeResult<()> {
        self.status = DriverStatus::Ready;
        Ok(())
    }

    pub fn shutdown(&mut self) -> NodeResult<()> {
        self.status = DriverStatus::Shutdown;
        Ok(())
    }

    pub fn status(&self) -> DriverStatus {
        self.status.clone()
    }

    pub fn read_voltage(&mut self) -> NodeResult<f64> {
        if !self.status.is_usable() {
            return Err(NodeError::driver(format!(
                "ADC on pin {} not initialized",
                self.pin
            )));
        }
        self.status = DriverStatus::Running;
        self.reads += 1;
        Ok(self.voltage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voltage_saturates() {
        let mut adc = SimulationAdcDriver::new("33");
        assert!(adc.read_voltage().is_err());
        adc.init().unwrap();
        assert_eq!(adc.read_voltage().unwrap(), 3.3);

        adc.set_voltage(5.0);
        assert_eq!(adc.read_voltage().unwrap(), 3.3);
        adc.set_voltage(-1.0);
        assert_eq!(adc.read_voltage().unwrap(), 0.0);
        assert_eq!(adc.reads(), 3);
    }
}
