// Scheduler configuration with presets for mains-powered and battery nodes
use std::time::Duration;

/// Timing configuration for the cooperative scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Period of the top-level sweep that services the liveness supervisor.
    /// Must be well below the supervisor timeout.
    pub sweep_period: Duration,
    /// How long tasks get to observe shutdown before the loop returns
    pub shutdown_grace: Duration,
    /// Interval for periodic component functions that do not set their own
    pub default_call_interval: Duration,
    /// Optional pause between components while loading
    pub loader_pause: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl SchedulerConfig {
    /// Mains-powered node: one sweep per second, ten-minute sensor cadence
    pub fn standard() -> Self {
        Self {
            sweep_period: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(2),
            default_call_interval: Duration::from_secs(600),
            loader_pause: None,
        }
    }

    /// Battery node: fewer wakeups, components loaded with breathing room
    pub fn low_power() -> Self {
        Self {
            sweep_period: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(1),
            default_call_interval: Duration::from_secs(1800),
            loader_pause: Some(Duration::from_millis(100)),
        }
    }

    pub fn with_sweep_period(mut self, period: Duration) -> Self {
        self.sweep_period = period;
        self
    }

    pub fn with_default_call_interval(mut self, interval: Duration) -> Self {
        self.default_call_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let standard = SchedulerConfig::standard();
        assert_eq!(standard, SchedulerConfig::default());
        assert_eq!(standard.default_call_interval, Duration::from_secs(600));

        let low = SchedulerConfig::low_power();
        assert!(low.sweep_period > standard.sweep_period);
        assert!(low.loader_pause.is_some());
    }

    #[test]
    fn test_builder_overrides() {
        let config = SchedulerConfig::standard()
            .with_sweep_period(Duration::from_millis(50))
            .with_default_call_interval(Duration::from_secs(5));
        assert_eq!(config.sweep_period, Duration::from_millis(50));
        assert_eq!(config.default_call_interval, Duration::from_secs(5));
    }
}
