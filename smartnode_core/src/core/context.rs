use std::time::Duration;

use crate::communication::{LogLevel, Message, RemoteLogger, SessionHandle, TopicBuilder};
use crate::scheduling::SchedulerHandle;

/// Node-wide collaborators handed to component factories
#[derive(Clone)]
pub struct NodeContext {
    topics: TopicBuilder,
    session: SessionHandle,
    scheduler: SchedulerHandle,
    default_call_interval: Duration,
    log_level: LogLevel,
}

impl NodeContext {
    pub fn new(
        topics: TopicBuilder,
        session: SessionHandle,
        scheduler: SchedulerHandle,
        default_call_interval: Duration,
    ) -> Self {
        Self {
            topics,
            session,
            scheduler,
            default_call_interval,
            log_level: LogLevel::Info,
        }
    }

    /// Lowest level mirrored to the broker by loggers created from this context
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn default_call_interval(&self) -> Duration {
        self.default_call_interval
    }

    pub fn logger(&self, component: &str) -> RemoteLogger {
        RemoteLogger::new(component, self.topics.clone(), self.session.clone())
            .with_min_level(self.log_level)
    }

    /// Publish to `<prefix>/<device_id>/<suffix>`
    pub fn publish_device(&self, suffix: &str, payload: impl Into<Vec<u8>>, retain: bool) {
        self.session
            .publish(Message::new(self.topics.device(suffix), payload).retained(retain));
    }
}
