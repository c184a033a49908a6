//! Ultrasonic echo drivers
//!
//! A driver fires one trigger pulse and reports the width of the echo in
//! microseconds, the raw input of a time-of-flight distance measurement.

mod simulation;

pub use simulation::SimulationEchoDriver;

use thiserror::Error;

/// Scripted outcome of one trigger pulse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    Pulse(u32),
    Timeout,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EchoError {
    #[error("Object too far")]
    Timeout,

    #[error("Echo driver not initialized")]
    NotInitialized,
}
