//! Sensor components

pub mod hcsr04;
pub mod htu21d;
pub mod water_sensor;

pub use hcsr04::Hcsr04;
pub use htu21d::Htu21d;
pub use water_sensor::WaterSensor;

use smartnode_core::error::NodeResult;
use smartnode_core::loader::ResolvedArgs;

/// Round half away from zero to `precision` decimals
pub(crate) fn round_to(value: f64, precision: usize) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

pub(crate) fn format_value(value: f64, precision: usize) -> String {
    format!("{:.*}", precision, value)
}

/// The `publish` flag every sensor function accepts, on by default
pub(crate) fn publish_arg(args: &ResolvedArgs) -> NodeResult<bool> {
    args.bool_or(0, "publish", true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding_and_formatting() {
        assert_eq!(round_to(100.0959, 2), 100.1);
        assert_eq!(round_to(24.6864, 1), 24.7);
        assert_eq!(format_value(100.1, 2), "100.10");
        assert_eq!(format_value(7.0, 0), "7");
    }
}
