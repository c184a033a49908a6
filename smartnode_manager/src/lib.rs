//! Command-line manager for SmartNode devices
//!
//! The `smartnode` binary is a thin layer over these modules so the commands can
//! be driven from tests without spawning a process.

pub mod commands;
pub mod logging;
