//! The assembled node: settings → scheduler and supervisor → session → descriptors
//! → loader → announce, then sweep until shutdown.

use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::time::Duration;

use crate::communication::{Message, Session, SessionHandle, Transport};
use crate::config::NodeSettings;
use crate::core::context::NodeContext;
use crate::core::registry::Registry;
use crate::error::{NodeError, NodeResult, TaskFault};
use crate::loader::{
    resolve_descriptors, ConfigSource, DescriptorSet, FactoryRegistry, LoadReport, Loader,
    RemoteConfig,
};
use crate::scheduling::{Scheduler, ShutdownTrigger, Supervisor};

/// What the node booted with
#[derive(Debug, Clone)]
pub struct BootSummary {
    pub source: ConfigSource,
    pub report: LoadReport,
}

pub struct SmartNode {
    settings: NodeSettings,
    scheduler: Scheduler,
    session: SessionHandle,
    context: NodeContext,
    factories: FactoryRegistry,
    descriptors: Option<DescriptorSet>,
    registry: RefCell<Registry>,
}

impl SmartNode {
    /// Validate `settings`, create the scheduler and supervisor, and queue the broker
    /// session on the scheduler. Nothing runs until [`run`](Self::run).
    pub fn new<T>(settings: NodeSettings, transport: T, factories: FactoryRegistry) -> NodeResult<Self>
    where
        T: Transport + 'static,
    {
        settings.validate()?;

        let mut scheduler = Scheduler::new(settings.scheduler_config());
        if let Some(supervisor) = Supervisor::from_settings(&settings.supervisor)? {
            scheduler = scheduler.with_supervisor(Rc::new(supervisor));
        }

        let session = Session::new(
            settings.session_config(),
            transport,
            scheduler.handle().shutdown_receiver(),
        );
        let handle = session.handle();
        scheduler.spawn("session", session.run());

        let context = NodeContext::new(
            settings.topics(),
            handle.clone(),
            scheduler.handle(),
            scheduler.config().default_call_interval,
        );

        let fault_logger = context.logger("scheduler");
        scheduler.on_fault(move |fault| fault_logger.error(fault));
        let reporter = scheduler.handle();
        handle.on_handler_fault(move |fault| reporter.report_fault(fault));

        Ok(Self {
            settings,
            scheduler,
            session: handle,
            context,
            factories,
            descriptors: None,
            registry: RefCell::new(Registry::default()),
        })
    }

    /// Boot with this set instead of consulting remote, cache or local file
    pub fn with_descriptors(mut self, set: DescriptorSet) -> Self {
        self.descriptors = Some(set);
        self
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn context(&self) -> &NodeContext {
        &self.context
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.scheduler.shutdown_trigger()
    }

    /// Components registered by the last boot
    pub fn registry(&self) -> Registry {
        self.registry.borrow().clone()
    }

    /// Resolve descriptors, load them and announce the result. Runs on the
    /// scheduler so the session and the supervisor sweep stay live during boot.
    pub async fn boot(&self) -> BootSummary {
        let (set, source) = match &self.descriptors {
            Some(set) => (set.clone(), ConfigSource::Local),
            None => {
                let components = &self.settings.components;
                let remote = components.remote.then(|| {
                    let remote = RemoteConfig::new(
                        self.context.topics().clone(),
                        self.session.clone(),
                        Duration::from_secs(components.remote_timeout_secs),
                    );
                    match &components.cache {
                        Some(cache) => remote.with_cache(cache),
                        None => remote,
                    }
                });
                resolve_descriptors(components, remote.as_ref()).await
            }
        };

        let loader = Loader::new(&self.factories, self.context.clone())
            .with_pause(self.scheduler.config().loader_pause);
        let (registry, report) = loader.load(&set).await;
        *self.registry.borrow_mut() = registry;

        match report.to_json() {
            Ok(json) => self.session.publish(
                Message::new(self.context.topics().components(), json).retained(true),
            ),
            Err(e) => log::error!("Cannot serialize load report: {}", e),
        }
        self.context.logger("device").info(format!(
            "Device started, version {} ({} configuration, {})",
            crate::VERSION,
            source,
            report.summary()
        ));
        BootSummary { source, report }
    }

    /// Boot, then sweep until shutdown is triggered.
    pub async fn run(&self) -> BootSummary {
        let summary = self.scheduler.run_until(self.boot()).await;
        self.scheduler.run().await;
        log::info!("Node stopped");
        summary
    }

    /// [`run`](Self::run) on a fresh current-thread runtime.
    ///
    /// A panic escaping the run-loop itself is handed to the supervisor, which
    /// restarts the process or halts, depending on `restart_on_fault`.
    pub fn run_blocking(&self) -> NodeResult<BootSummary> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        match std::panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(self.run()))) {
            Ok(summary) => Ok(summary),
            Err(payload) => {
                let fault = TaskFault::from_panic("run-loop", payload);
                match self.scheduler.supervisor() {
                    Some(supervisor) => supervisor.handle_fatal(&fault.message),
                    None => Err(NodeError::Scheduling(fault.to_string())),
                }
            }
        }
    }
}
