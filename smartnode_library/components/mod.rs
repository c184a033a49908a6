//! Standard components, laid out by descriptor package
//!
//! | package            | component     | type                           |
//! |--------------------|---------------|--------------------------------|
//! | `machine`          | `I2C`         | [`machine::I2cBus`]            |
//! | `sensors.htu21d`   | `HTU21D`      | [`sensors::htu21d::Htu21d`]    |
//! | `sensors.hcsr04`   | `HCSR04`      | [`sensors::hcsr04::Hcsr04`]    |
//! | `sensors.waterSensor` | `WaterSensor` | [`sensors::water_sensor::WaterSensor`] |

pub mod machine;
pub mod sensors;

#[cfg(test)]
pub(crate) mod testing;
