//! Shared fixtures for component tests

use std::time::Duration;

use smartnode_core::communication::{Session, SessionConfig, SimulatedBroker, TopicBuilder};
use smartnode_core::core::NodeContext;
use smartnode_core::loader::{BuildContext, ResolvedArgs};
use smartnode_core::scheduling::{Scheduler, SchedulerConfig};

pub(crate) struct Bench {
    pub scheduler: Scheduler,
    pub broker: SimulatedBroker,
    pub context: NodeContext,
}

/// A scheduler with a session to a simulated broker, device `home/n1`
pub(crate) fn bench() -> Bench {
    let scheduler = Scheduler::new(SchedulerConfig::standard());
    let broker = SimulatedBroker::new();
    let session = Session::new(
        SessionConfig::default(),
        broker.link(),
        scheduler.handle().shutdown_receiver(),
    );
    let context = NodeContext::new(
        TopicBuilder::new("home", "n1"),
        session.handle(),
        scheduler.handle(),
        Duration::from_secs(600),
    );
    scheduler.spawn("session", session.run());
    Bench {
        scheduler,
        broker,
        context,
    }
}

impl Bench {
    pub fn build_context<'a>(&'a self, name: &'a str, args: &'a ResolvedArgs) -> BuildContext<'a> {
        BuildContext {
            name,
            node: &self.context,
            args,
        }
    }

    /// Payloads published to `topic`, oldest first
    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.broker
            .published()
            .iter()
            .filter(|m| m.topic == topic)
            .filter_map(|m| m.payload_str().map(str::to_string))
            .collect()
    }
}
