//! Factory registry - create components from descriptors
//!
//! Factories are registered once at startup, keyed by `(package, component)`, and
//! looked up by the loader for every descriptor.
//!
//! ```rust,ignore
//! let mut factories = FactoryRegistry::new();
//! factories.register(
//!     ComponentFactory::new("sensors.htu21d", "HTU21D", "1.2.0", |ctx| {
//!         let bus = ctx.args.component::<I2cBus>(0, "i2c")?;
//!         Ok(Rc::new(Htu21d::new(ctx.name, bus, ctx.node)?))
//!     })
//!     .with_capabilities(&[Capability::Sensor, Capability::Publisher]),
//! );
//! ```

use std::collections::BTreeMap;
use std::rc::Rc;

use serde::Serialize;

use super::args::ResolvedArgs;
use crate::core::component::{Capability, Component};
use crate::core::context::NodeContext;
use crate::error::NodeResult;

/// Everything a factory sees while building one component
pub struct BuildContext<'a> {
    pub name: &'a str,
    pub node: &'a NodeContext,
    pub args: &'a ResolvedArgs,
}

type BuildFn = Box<dyn Fn(&BuildContext<'_>) -> NodeResult<Rc<dyn Component>>>;

pub struct ComponentFactory {
    package: String,
    component: String,
    version: String,
    capabilities: Vec<Capability>,
    build: BuildFn,
}

impl ComponentFactory {
    pub fn new<F>(package: &str, component: &str, version: &str, build: F) -> Self
    where
        F: Fn(&BuildContext<'_>) -> NodeResult<Rc<dyn Component>> + 'static,
    {
        Self {
            package: normalize_package(package),
            component: component.to_string(),
            version: version.to_string(),
            capabilities: Vec::new(),
            build: Box::new(build),
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[Capability]) -> Self {
        self.capabilities = capabilities.to_vec();
        self
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn build(&self, ctx: &BuildContext<'_>) -> NodeResult<Rc<dyn Component>> {
        (self.build)(ctx)
    }

    pub fn info(&self) -> FactoryInfo {
        FactoryInfo {
            package: self.package.clone(),
            component: self.component.clone(),
            version: self.version.clone(),
            capabilities: self.capabilities.clone(),
        }
    }
}

/// Serializable summary of a registered factory
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactoryInfo {
    pub package: String,
    pub component: String,
    pub version: String,
    pub capabilities: Vec<Capability>,
}

impl FactoryInfo {
    pub fn id(&self) -> String {
        if self.package.is_empty() {
            self.component.clone()
        } else {
            format!("{}.{}", self.package, self.component)
        }
    }
}

#[derive(Default)]
pub struct FactoryRegistry {
    factories: BTreeMap<(String, String), ComponentFactory>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory. A later registration for the same key replaces the earlier one.
    pub fn register(&mut self, factory: ComponentFactory) -> &mut Self {
        let key = (factory.package.clone(), factory.component.clone());
        if self.factories.insert(key, factory).is_some() {
            log::warn!("Replaced an existing component factory registration");
        }
        self
    }

    pub fn get(&self, package: &str, component: &str) -> Option<&ComponentFactory> {
        self.factories
            .get(&(normalize_package(package), component.to_string()))
    }

    pub fn contains(&self, package: &str, component: &str) -> bool {
        self.get(package, component).is_some()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Sorted by package, then component
    pub fn infos(&self) -> Vec<FactoryInfo> {
        self.factories.values().map(ComponentFactory::info).collect()
    }
}

fn normalize_package(package: &str) -> String {
    package.trim().trim_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::component::{unknown_function, CallFuture};

    struct Relay;

    impl Component for Relay {
        fn call(self: Rc<Self>, function: &str, _args: ResolvedArgs) -> CallFuture {
            unknown_function(function)
        }
    }

    fn relay_factory(version: &str) -> ComponentFactory {
        ComponentFactory::new(".actuators.relay.", "Relay", version, |_ctx| Ok(Rc::new(Relay)))
            .with_capabilities(&[Capability::Actuator])
    }

    #[test]
    fn test_lookup_normalizes_package() {
        let mut factories = FactoryRegistry::new();
        factories.register(relay_factory("1.0"));
        assert!(factories.contains("actuators.relay", "Relay"));
        assert!(factories.contains("actuators.relay.", "Relay"));
        assert!(!factories.contains("actuators.relay", "relay"));

        let info = factories.get("actuators.relay", "Relay").unwrap().info();
        assert_eq!(info.id(), "actuators.relay.Relay");
        assert_eq!(info.capabilities, vec![Capability::Actuator]);
    }

    #[test]
    fn test_later_registration_replaces() {
        let mut factories = FactoryRegistry::new();
        factories.register(relay_factory("1.0")).register(relay_factory("1.1"));
        assert_eq!(factories.len(), 1);
        assert_eq!(factories.infos()[0].version, "1.1");
    }
}
