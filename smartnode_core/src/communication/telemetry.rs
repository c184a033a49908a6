//! Device topics and remote logging

use std::fmt;

use super::packet::Message;
use super::session::SessionHandle;

/// Severity of a remote log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }

    fn local_level(&self) -> log::Level {
        match self {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error | LogLevel::Critical => log::Level::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds every topic the node publishes or listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    prefix: String,
    device_id: String,
}

impl TopicBuilder {
    pub fn new(prefix: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
            device_id: device_id.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// `<prefix>/<device_id>/<suffix>`
    pub fn device(&self, suffix: &str) -> String {
        format!("{}/{}/{}", self.prefix, self.device_id, suffix)
    }

    /// Command topic for `suffix`, ending in `/set`
    pub fn command(&self, suffix: &str) -> String {
        format!("{}/set", self.device(suffix))
    }

    pub fn log(&self, level: LogLevel) -> String {
        format!("{}/log/{}/{}", self.prefix, level, self.device_id)
    }

    pub fn version(&self, component: &str) -> String {
        self.device(&format!("version/{}", component))
    }

    pub fn components(&self) -> String {
        self.device("components")
    }

    pub fn status(&self) -> String {
        self.device("status")
    }

    pub fn login(&self) -> String {
        format!("{}/login/{}", self.prefix, self.device_id)
    }

    pub fn login_response(&self) -> String {
        format!("{}/set", self.login())
    }
}

/// Logger that writes locally through `log` and mirrors lines to the log topic.
#[derive(Clone)]
pub struct RemoteLogger {
    component: String,
    topics: TopicBuilder,
    session: SessionHandle,
    min_level: LogLevel,
}

impl RemoteLogger {
    pub fn new(component: impl Into<String>, topics: TopicBuilder, session: SessionHandle) -> Self {
        Self {
            component: component.into(),
            topics,
            session,
            min_level: LogLevel::Info,
        }
    }

    /// Lowest level that is published; everything is still logged locally.
    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn log(&self, level: LogLevel, message: impl fmt::Display) {
        let line = format!("{}: {}", self.component, message);
        log::log!(target: "smartnode::remote", level.local_level(), "{}", line);
        if level >= self.min_level {
            self.session
                .publish(Message::new(self.topics.log(level), line));
        }
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.log(LogLevel::Error, message);
    }

    pub fn critical(&self, message: impl fmt::Display) {
        self.log(LogLevel::Critical, message);
    }
}
