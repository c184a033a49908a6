//! # SmartNode Standard Library
//!
//! Components a node configuration can name, plus the drivers behind them.
//!
//! ```text
//! smartnode_library/
//! ── drivers/        # Simulation and hardware drivers (I2C, ADC, ultrasonic echo)
//! ── components/     # Loadable components, by descriptor package
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use smartnode_core::FactoryRegistry;
//!
//! let mut factories = FactoryRegistry::new();
//! smartnode_library::register_all(&mut factories);
//! ```

pub mod components;
pub mod drivers;

use smartnode_core::loader::FactoryRegistry;

pub use components::machine::I2cBus;
pub use components::sensors::{Hcsr04, Htu21d, WaterSensor};

/// Register every standard component factory
pub fn register_all(factories: &mut FactoryRegistry) {
    factories
        .register(I2cBus::factory())
        .register(Htu21d::factory())
        .register(Hcsr04::factory())
        .register(WaterSensor::factory());
}

/// A factory registry holding the standard components
pub fn default_factories() -> FactoryRegistry {
    let mut factories = FactoryRegistry::new();
    register_all(&mut factories);
    factories
}
