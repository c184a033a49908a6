//! Board-level components other components are wired to

pub mod i2c;

pub use i2c::I2cBus;
