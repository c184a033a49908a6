//! # Component loader
//!
//! Turns a [`DescriptorSet`] into a frozen [`Registry`]:
//!
//! 1. resolve every reference argument against the components registered so far
//! 2. build through the [`FactoryRegistry`]
//! 3. run the optional init function (failure leaves the component *degraded*)
//! 4. register, publish the version and hand any regular function to the scheduler
//!
//! One bad component never stops the rest. Every name gets exactly one outcome in
//! the [`LoadReport`]; problems that belong to no single component are issues.

pub mod args;
pub mod descriptor;
pub mod factory;
pub mod remote;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;

pub use args::{ResolvedArg, ResolvedArgs};
pub use descriptor::{ArgValue, Args, ComponentDescriptor, DescriptorSet};
pub use factory::{BuildContext, ComponentFactory, FactoryInfo, FactoryRegistry};
pub use remote::{resolve_descriptors, ConfigSource, RemoteConfig};

use crate::communication::{Message, RemoteLogger};
use crate::core::component::Component;
use crate::core::context::NodeContext;
use crate::core::registry::{Registry, RegistryBuilder, RegistryEntry};
use crate::error::{LoadError, NodeResult, TaskFault};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Loaded,
    Degraded,
    Failed,
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStatus::Loaded => write!(f, "loaded"),
            LoadStatus::Degraded => write!(f, "degraded"),
            LoadStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentOutcome {
    pub name: String,
    pub status: LoadStatus,
    /// Factory identifier, `package.component`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<LoadError>,
}

impl ComponentOutcome {
    fn failed(name: &str, component: Option<String>, error: LoadError) -> Self {
        Self {
            name: name.to_string(),
            status: LoadStatus::Failed,
            component,
            version: None,
            error: Some(error),
        }
    }
}

/// What happened to every declared component
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub outcomes: Vec<ComponentOutcome>,
    /// Problems that do not fail a component on their own
    pub issues: Vec<LoadError>,
}

impl LoadReport {
    pub fn outcome(&self, name: &str) -> Option<&ComponentOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    pub fn status(&self, name: &str) -> Option<LoadStatus> {
        self.outcome(name).map(|o| o.status)
    }

    pub fn count(&self, status: LoadStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Everything loaded and nothing worth a warning
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty() && self.count(LoadStatus::Loaded) == self.outcomes.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} loaded, {} degraded, {} failed, {} issue(s)",
            self.count(LoadStatus::Loaded),
            self.count(LoadStatus::Degraded),
            self.count(LoadStatus::Failed),
            self.issues.len()
        )
    }

    pub fn to_json(&self) -> NodeResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Builds components from descriptors and wires them into a registry.
pub struct Loader<'a> {
    factories: &'a FactoryRegistry,
    context: NodeContext,
    logger: RemoteLogger,
    pause: Option<Duration>,
}

impl<'a> Loader<'a> {
    pub fn new(factories: &'a FactoryRegistry, context: NodeContext) -> Self {
        let logger = context.logger("loader");
        Self {
            factories,
            context,
            logger,
            pause: None,
        }
    }

    /// Sleep between components instead of only yielding
    pub fn with_pause(mut self, pause: Option<Duration>) -> Self {
        self.pause = pause;
        self
    }

    /// Load the whole set. Must run on the scheduler, which hosts the periodic tasks.
    pub async fn load(&self, set: &DescriptorSet) -> (Registry, LoadReport) {
        let mut report = LoadReport::default();
        let mut builder = RegistryBuilder::new();

        let invalid: HashSet<&str> = set
            .invalid
            .iter()
            .filter_map(|e| match e {
                LoadError::InvalidDescriptor { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        for error in &set.invalid {
            if let LoadError::InvalidDescriptor { name, .. } = error {
                report
                    .outcomes
                    .push(ComponentOutcome::failed(name, None, error.clone()));
            } else {
                report.issues.push(error.clone());
            }
        }

        // first occurrence of a name wins
        let mut by_name: HashMap<&str, &ComponentDescriptor> = HashMap::new();
        for descriptor in &set.descriptors {
            if by_name.contains_key(descriptor.name.as_str()) {
                report.issues.push(LoadError::DuplicateName {
                    name: descriptor.name.clone(),
                });
            } else {
                by_name.insert(&descriptor.name, descriptor);
            }
        }

        let (order, explicit) = set.effective_order();
        if !explicit && !by_name.is_empty() {
            report.issues.push(LoadError::ImplicitOrder);
        }

        let mut queue: Vec<&ComponentDescriptor> = Vec::new();
        let mut queued: HashSet<&str> = HashSet::new();
        for name in &order {
            match by_name.get(name.as_str()) {
                Some(&descriptor) => {
                    // declaration duplicates were reported above
                    if !queued.insert(descriptor.name.as_str()) {
                        if explicit && !set_declares_twice(set, name) {
                            report.issues.push(LoadError::DuplicateName { name: name.clone() });
                        }
                        continue;
                    }
                    queue.push(descriptor);
                }
                None if invalid.contains(name.as_str()) => {}
                None => report.issues.push(LoadError::MissingDescriptor { name: name.clone() }),
            }
        }
        for descriptor in by_name.values() {
            if !queued.contains(descriptor.name.as_str()) {
                report.outcomes.push(ComponentOutcome::failed(
                    &descriptor.name,
                    Some(descriptor.factory_id()),
                    LoadError::NotInOrder {
                        name: descriptor.name.clone(),
                    },
                ));
            }
        }
        // HashMap iteration order is arbitrary; keep the report in declaration order
        sort_by_declaration(&mut report.outcomes, set);

        for (i, descriptor) in queue.into_iter().enumerate() {
            if i > 0 {
                self.breathe().await;
            }
            let outcome = self.load_one(descriptor, &mut builder).await;
            self.log_outcome(&outcome);
            report.outcomes.push(outcome);
        }

        for issue in &report.issues {
            self.logger.warn(issue);
        }
        self.logger.info(format!("Load finished: {}", report.summary()));
        (builder.freeze(), report)
    }

    async fn breathe(&self) {
        match self.pause {
            Some(pause) if !pause.is_zero() => tokio::time::sleep(pause).await,
            _ => tokio::task::yield_now().await,
        }
    }

    async fn load_one(
        &self,
        descriptor: &ComponentDescriptor,
        builder: &mut RegistryBuilder,
    ) -> ComponentOutcome {
        let name = descriptor.name.as_str();
        let factory_id = descriptor.factory_id();

        let Some(factory) = self
            .factories
            .get(&descriptor.package, &descriptor.component)
        else {
            return ComponentOutcome::failed(
                name,
                Some(factory_id.clone()),
                LoadError::UnknownFactory {
                    component: name.to_string(),
                    factory: factory_id,
                },
            );
        };

        let args = match resolve(name, &descriptor.constructor_args, builder) {
            Ok(args) => args,
            Err(e) => return ComponentOutcome::failed(name, Some(factory_id), e),
        };

        let ctx = BuildContext {
            name,
            node: &self.context,
            args: &args,
        };
        let built = std::panic::catch_unwind(AssertUnwindSafe(|| factory.build(&ctx)));
        let instance = match built {
            Ok(Ok(instance)) => instance,
            Ok(Err(e)) => {
                return ComponentOutcome::failed(
                    name,
                    Some(factory_id),
                    LoadError::from_construction(name, e),
                )
            }
            Err(payload) => {
                let fault = TaskFault::from_panic(name, payload);
                return ComponentOutcome::failed(
                    name,
                    Some(factory_id),
                    LoadError::Construction {
                        component: name.to_string(),
                        message: fault.message,
                    },
                );
            }
        };

        let entry = RegistryEntry::new(name, instance.clone())
            .with_version(factory.version())
            .with_capabilities(factory.capabilities());
        if let Err(e) = builder.insert(entry) {
            return ComponentOutcome::failed(name, Some(factory_id), e);
        }

        let mut outcome = ComponentOutcome {
            name: name.to_string(),
            status: LoadStatus::Loaded,
            component: Some(factory_id),
            version: Some(factory.version().to_string()),
            error: None,
        };

        if let Some(function) = &descriptor.init_function {
            if let Err(e) = self.initialize(name, &instance, function, descriptor, builder).await {
                builder.mark_degraded(name);
                outcome.status = LoadStatus::Degraded;
                outcome.error = Some(e);
            }
        }

        if let Some(function) = &descriptor.call_function_regularly {
            if outcome.status == LoadStatus::Degraded {
                log::debug!("Not scheduling '{}' of degraded component '{}'", function, name);
            } else if !instance.supports(function) {
                builder.mark_degraded(name);
                outcome.status = LoadStatus::Degraded;
                outcome.error = Some(LoadError::UnknownFunction {
                    component: name.to_string(),
                    function: function.clone(),
                });
            } else {
                let interval = descriptor
                    .call_interval
                    .unwrap_or_else(|| self.context.default_call_interval());
                self.schedule(name, instance.clone(), function, interval);
            }
        }

        self.context.session().publish(
            Message::new(self.context.topics().version(name), factory.version()).retained(true),
        );
        outcome
    }

    async fn initialize(
        &self,
        name: &str,
        instance: &Rc<dyn Component>,
        function: &str,
        descriptor: &ComponentDescriptor,
        builder: &RegistryBuilder,
    ) -> Result<(), LoadError> {
        if !instance.supports(function) {
            return Err(LoadError::UnknownFunction {
                component: name.to_string(),
                function: function.to_string(),
            });
        }
        let args = resolve(name, &descriptor.init_args, builder)?;
        let call = instance.clone().call(function, args);
        let message = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(payload) => TaskFault::from_panic(name, payload).message,
        };
        Err(LoadError::Initialization {
            component: name.to_string(),
            function: function.to_string(),
            message,
        })
    }

    fn schedule(&self, name: &str, instance: Rc<dyn Component>, function: &str, interval: Duration) {
        log::debug!("Calling '{}.{}' every {:?}", name, function, interval);
        let function = function.to_string();
        self.context.scheduler().spawn_periodic(
            format!("{}.{}", name, function),
            interval,
            move || instance.clone().call(&function, ResolvedArgs::default()),
        );
    }

    fn log_outcome(&self, outcome: &ComponentOutcome) {
        match (&outcome.status, &outcome.error) {
            (LoadStatus::Loaded, _) => self.logger.info(format!(
                "Added component {} ({})",
                outcome.name,
                outcome.component.as_deref().unwrap_or("?")
            )),
            (LoadStatus::Degraded, Some(e)) => {
                self.logger.warn(format!("Component {} degraded: {}", outcome.name, e))
            }
            (_, Some(e)) => self.logger.error(format!("Component {} failed: {}", outcome.name, e)),
            (status, None) => self.logger.warn(format!("Component {} {}", outcome.name, status)),
        }
    }
}

/// Look up every reference among `args` in the components registered so far.
fn resolve(component: &str, args: &Args, registry: &RegistryBuilder) -> Result<ResolvedArgs, LoadError> {
    let resolve_one = |value: &ArgValue| -> Result<ResolvedArg, LoadError> {
        match value {
            ArgValue::Literal(v) => Ok(ResolvedArg::Value(v.clone())),
            ArgValue::Reference(reference) => registry
                .get(reference)
                .map(|instance| ResolvedArg::Component {
                    name: reference.clone(),
                    instance,
                })
                .ok_or_else(|| LoadError::UnresolvedReference {
                    component: component.to_string(),
                    reference: reference.clone(),
                }),
        }
    };
    let positional = args
        .positional
        .iter()
        .map(&resolve_one)
        .collect::<Result<Vec<_>, _>>()?;
    let named = args
        .named
        .iter()
        .map(|(key, value)| resolve_one(value).map(|arg| (key.clone(), arg)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ResolvedArgs::new(positional, named))
}

fn set_declares_twice(set: &DescriptorSet, name: &str) -> bool {
    set.descriptors.iter().filter(|d| d.name == name).count() > 1
}

fn sort_by_declaration(outcomes: &mut [ComponentOutcome], set: &DescriptorSet) {
    let position = |name: &str| {
        set.descriptors
            .iter()
            .position(|d| d.name == name)
            .unwrap_or(usize::MAX)
    };
    outcomes.sort_by_key(|o| position(&o.name));
}
