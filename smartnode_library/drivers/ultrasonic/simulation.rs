//! Simulation echo driver
//!
//! Answers every trigger with the echo an object at a fixed distance would
//! produce. Individual echoes can be scripted ahead to simulate noise, objects
//! out of range or readings below the sensor minimum.

use std::collections::VecDeque;

use super::{Echo, EchoError};
use crate::drivers::DriverStatus;

/// Microseconds of round trip per centimetre at ~20°C
pub const ROUND_TRIP_US_PER_CM: f64 = 2.0 * 29.14;

pub struct SimulationEchoDriver {
    status: DriverStatus,
    distance_cm: f64,
    timeout_us: u32,
    script: VecDeque<Echo>,
    pulses: u64,
}

impl SimulationEchoDriver {
    pub fn new(distance_cm: f64, timeout_us: u32) -> Self {
        Self {
            status: DriverStatus::Uninitialized,
            distance_cm,
            timeout_us,
            script: VecDeque::new(),
            pulses: 0,
        }
    }

    pub fn set_distance(&mut self, distance_cm: f64) {
        self.distance_cm = distance_cm;
    }

    /// Queue echoes returned before falling back to the fixed distance
    pub fn script(&mut self, echoes: impl IntoIterator<Item = Echo>) {
        self.script.extend(echoes);
    }

    pub fn pulses(&self) -> u64 {
        self.pulses
    }

    pub fn init(&mut self) {
        self.status = DriverStatus::Ready;
    }

    pub fn shutdown(&mut self) {
        self.status = DriverStatus::Shutdown;
    }

    pub fn status(&self) -> DriverStatus {
        self.status.clone()
    }

    /// Fire the trigger and time the echo
    pub fn pulse(&mut self) -> Result<u32, EchoError> {
        if !self.status.is_usable() {
            return Err(EchoError::NotInitialized);
        }
        self.status = DriverStatus::Running;
        self.pulses += 1;

        let echo = self.script.pop_front().unwrap_or_else(|| {
            Echo::Pulse((self.distance_cm * ROUND_TRIP_US_PER_CM).round().max(0.0) as u32)
        });
        match echo {
            Echo::Pulse(width) if width <= self.timeout_us => Ok(width),
            _ => Err(EchoError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_to_echo() {
        let mut driver = SimulationEchoDriver::new(100.0, 30_000);
        assert_eq!(driver.pulse(), Err(EchoError::NotInitialized));
        driver.init();
        assert_eq!(driver.pulse(), Ok(5828));

        driver.set_distance(600.0);
        assert_eq!(driver.pulse(), Err(EchoError::Timeout));
        assert_eq!(driver.pulses(), 2);
    }

    #[test]
    fn test_script_runs_first() {
        let mut driver = SimulationEchoDriver::new(10.0, 30_000);
        driver.init();
        driver.script([Echo::Timeout, Echo::Pulse(120)]);
        assert_eq!(driver.pulse(), Err(EchoError::Timeout));
        assert_eq!(driver.pulse(), Ok(120));
        assert_eq!(driver.pulse(), Ok(583));
    }
}
