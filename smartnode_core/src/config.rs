//! Node settings loaded from TOML.
//!
//! Every section has defaults, so an empty file is a valid configuration for a
//! simulated node. [`NodeSettings::validate`] rejects combinations that would make the
//! node unstable, such as a sweep period that cannot keep the watchdog fed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::communication::{BackoffPolicy, Credentials, JitterPolicy, SessionConfig, TopicBuilder};
use crate::error::{NodeError, NodeResult};
use crate::scheduling::SchedulerConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub device_id: String,
    pub topic_prefix: String,
    pub broker: BrokerSettings,
    pub scheduler: SchedulerSettings,
    pub supervisor: SupervisorSettings,
    pub components: ComponentSettings,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            device_id: "smartnode".to_string(),
            topic_prefix: "home".to_string(),
            broker: BrokerSettings::default(),
            scheduler: SchedulerSettings::default(),
            supervisor: SupervisorSettings::default(),
            components: ComponentSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    /// Defaults to the device id
    pub client_id: Option<String>,
    pub credentials: Option<Credentials>,
    pub keepalive_secs: u64,
    pub keepalive_factor: f64,
    pub handshake_timeout_secs: u64,
    pub pending_capacity: usize,
    pub max_packet_size: usize,
    pub backoff: BackoffSettings,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            credentials: None,
            keepalive_secs: 60,
            keepalive_factor: 1.5,
            handshake_timeout_secs: 10,
            pending_capacity: 64,
            max_packet_size: 64 * 1024,
            backoff: BackoffSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub first_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    pub jitter: JitterPolicy,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            first_ms: 1_000,
            max_ms: 300_000,
            factor: 2.0,
            jitter: JitterPolicy::default(),
        }
    }
}

impl From<&BackoffSettings> for BackoffPolicy {
    fn from(settings: &BackoffSettings) -> Self {
        BackoffPolicy {
            first: Duration::from_millis(settings.first_ms),
            max: Duration::from_millis(settings.max_ms),
            factor: settings.factor,
            jitter: settings.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub sweep_period_ms: u64,
    pub shutdown_grace_ms: u64,
    pub default_call_interval_secs: u64,
    pub loader_pause_ms: Option<u64>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let standard = SchedulerConfig::standard();
        Self {
            sweep_period_ms: standard.sweep_period.as_millis() as u64,
            shutdown_grace_ms: standard.shutdown_grace.as_millis() as u64,
            default_call_interval_secs: standard.default_call_interval.as_secs(),
            loader_pause_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchdogBackend {
    #[default]
    Thread,
    Device,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub backend: WatchdogBackend,
    pub device_path: PathBuf,
    /// Restart when the run-loop itself fails; otherwise halt for inspection
    pub restart_on_fault: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 30,
            backend: WatchdogBackend::Thread,
            device_path: PathBuf::from("/dev/watchdog"),
            restart_on_fault: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentSettings {
    /// Local descriptor file
    pub file: Option<PathBuf>,
    /// Ask the broker for the descriptor set at boot
    pub remote: bool,
    pub remote_timeout_secs: u64,
    /// Where a remotely received descriptor set is persisted
    pub cache: Option<PathBuf>,
}

impl Default for ComponentSettings {
    fn default() -> Self {
        Self {
            file: None,
            remote: false,
            remote_timeout_secs: 10,
            cache: None,
        }
    }
}

impl NodeSettings {
    pub fn from_file(path: impl AsRef<Path>) -> NodeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            NodeError::config(format!("cannot read settings {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> NodeResult<Self> {
        let settings: NodeSettings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> NodeResult<()> {
        if self.device_id.is_empty() {
            return Err(NodeError::config("device_id must not be empty"));
        }
        if self.device_id.contains(['/', '+', '#']) {
            return Err(NodeError::config(format!(
                "device_id '{}' must not contain topic separators or wildcards",
                self.device_id
            )));
        }
        if self.scheduler.sweep_period_ms == 0 {
            return Err(NodeError::config("scheduler.sweep_period_ms must be positive"));
        }
        if self.scheduler.default_call_interval_secs == 0 {
            return Err(NodeError::config(
                "scheduler.default_call_interval_secs must be positive",
            ));
        }
        if self.supervisor.enabled {
            if self.supervisor.timeout_secs == 0 {
                return Err(NodeError::config("supervisor.timeout_secs must be positive"));
            }
            // a sweep has to land well inside every watchdog window
            if self.scheduler.sweep_period_ms * 2 > self.supervisor.timeout_secs * 1_000 {
                return Err(NodeError::config(format!(
                    "scheduler.sweep_period_ms ({}) must be at most half of supervisor.timeout_secs ({})",
                    self.scheduler.sweep_period_ms, self.supervisor.timeout_secs
                )));
            }
        }
        if self.broker.keepalive_secs == 0 || self.broker.keepalive_secs > u16::MAX as u64 {
            return Err(NodeError::config("broker.keepalive_secs must be within 1..=65535"));
        }
        let factor = self.broker.keepalive_factor;
        if !(factor.is_finite() && factor >= 1.0) {
            return Err(NodeError::config(
                "broker.keepalive_factor must be a finite number of at least 1.0",
            ));
        }
        if self.broker.pending_capacity == 0 {
            return Err(NodeError::config("broker.pending_capacity must be positive"));
        }
        let backoff = &self.broker.backoff;
        if backoff.first_ms == 0
            || backoff.max_ms < backoff.first_ms
            || !(backoff.factor.is_finite() && backoff.factor >= 1.0)
        {
            return Err(NodeError::config(
                "broker.backoff needs 0 < first_ms <= max_ms and a finite factor >= 1.0",
            ));
        }
        if self.components.remote && self.components.remote_timeout_secs == 0 {
            return Err(NodeError::config(
                "components.remote_timeout_secs must be positive when remote is enabled",
            ));
        }
        Ok(())
    }

    pub fn topics(&self) -> TopicBuilder {
        TopicBuilder::new(&self.topic_prefix, &self.device_id)
    }

    pub fn session_config(&self) -> SessionConfig {
        let broker = &self.broker;
        SessionConfig {
            client_id: broker
                .client_id
                .clone()
                .unwrap_or_else(|| self.device_id.clone()),
            credentials: broker.credentials.clone(),
            keepalive: Duration::from_secs(broker.keepalive_secs),
            keepalive_factor: broker.keepalive_factor,
            handshake_timeout: Duration::from_secs(broker.handshake_timeout_secs),
            pending_capacity: broker.pending_capacity,
            max_packet_size: broker.max_packet_size,
            backoff: BackoffPolicy::from(&broker.backoff),
            availability_topic: Some(self.topics().status()),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let scheduler = &self.scheduler;
        SchedulerConfig {
            sweep_period: Duration::from_millis(scheduler.sweep_period_ms),
            shutdown_grace: Duration::from_millis(scheduler.shutdown_grace_ms),
            default_call_interval: Duration::from_secs(scheduler.default_call_interval_secs),
            loader_pause: scheduler.loader_pause_ms.map(Duration::from_millis),
        }
    }
}
