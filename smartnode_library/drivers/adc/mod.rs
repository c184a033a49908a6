//! Analog-to-digital converter drivers

mod simulation;

pub use simulation::SimulationAdcDriver;

/// Full-scale voltage of the ESP32-class ADCs most nodes carry
pub const DEFAULT_MAX_VOLTAGE: f64 = 3.3;
