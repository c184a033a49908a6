//! # Cooperative scheduling for SmartNode
//!
//! - **Scheduler**: single-threaded run-loop on a tokio `LocalSet`, with fault
//!   isolation at every task boundary
//! - **Supervisor**: liveness watchdog serviced once per sweep
//! - **Config**: sweep and cadence presets
//!
//! ```rust,ignore
//! use smartnode_core::scheduling::{Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::standard());
//! scheduler.spawn("blink", async { Ok(()) });
//! scheduler.run_blocking()?;
//! ```

pub mod config;
pub mod scheduler;
pub mod supervisor;

use tokio::sync::watch;

pub use config::SchedulerConfig;
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerStats, ShutdownTrigger};
pub use supervisor::{
    Countdown, DeviceWatchdog, ExpirationCounter, ExpiryAction, Supervisor, ThreadWatchdog,
    WatchdogTicket, WatchdogTimer,
};

/// Resolves once the shutdown flag is set. A dropped sender counts as shutdown.
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

pub(crate) fn is_shutdown(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}
