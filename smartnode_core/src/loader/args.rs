//! Arguments after reference resolution, as seen by factories and component
//! functions.
//!
//! Every getter takes both a position and a name so a component accepts either
//! descriptor form (`[..]` or `{..}`) without caring which one was used.

use std::rc::Rc;

use serde_json::Value;

use crate::core::component::{downcast, Component, Sensor};
use crate::error::{NodeError, NodeResult};

#[derive(Clone)]
pub enum ResolvedArg {
    Value(Value),
    Component {
        name: String,
        instance: Rc<dyn Component>,
    },
}

impl std::fmt::Debug for ResolvedArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedArg::Value(v) => write!(f, "Value({})", v),
            ResolvedArg::Component { name, .. } => write!(f, "Component({})", name),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedArgs {
    positional: Vec<ResolvedArg>,
    named: Vec<(String, ResolvedArg)>,
}

impl ResolvedArgs {
    pub fn new(positional: Vec<ResolvedArg>, named: Vec<(String, ResolvedArg)>) -> Self {
        Self { positional, named }
    }

    /// Literal-only arguments, mostly for tests and direct calls
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            positional: values.into_iter().map(ResolvedArg::Value).collect(),
            named: Vec::new(),
        }
    }

    pub fn with_named(mut self, key: impl Into<String>, arg: ResolvedArg) -> Self {
        self.named.push((key.into(), arg));
        self
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Positional argument `index`, or else the named argument `name`
    pub fn get(&self, index: usize, name: &str) -> Option<&ResolvedArg> {
        self.positional.get(index).or_else(|| {
            self.named
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, arg)| arg)
        })
    }

    pub fn value(&self, index: usize, name: &str) -> Option<&Value> {
        match self.get(index, name) {
            Some(ResolvedArg::Value(v)) if !v.is_null() => Some(v),
            _ => None,
        }
    }

    /// A required component handle.
    ///
    /// A plain string where a component belongs names something that was never
    /// declared, which is reported as an unresolved reference.
    pub fn component_handle(&self, index: usize, name: &str) -> NodeResult<Rc<dyn Component>> {
        match self.get(index, name) {
            Some(ResolvedArg::Component { instance, .. }) => Ok(instance.clone()),
            Some(ResolvedArg::Value(Value::String(reference))) => {
                Err(NodeError::UnresolvedReference(reference.clone()))
            }
            Some(ResolvedArg::Value(other)) => Err(NodeError::invalid_input(format!(
                "argument '{}' must name a component, got {}",
                name, other
            ))),
            None => Err(NodeError::invalid_input(format!(
                "missing component argument '{}'",
                name
            ))),
        }
    }

    pub fn component<T: Component + 'static>(&self, index: usize, name: &str) -> NodeResult<Rc<T>> {
        let handle = self.component_handle(index, name)?;
        downcast::<T>(handle).ok_or_else(|| {
            NodeError::invalid_input(format!(
                "argument '{}' is not a {}",
                name,
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn optional_component<T: Component + 'static>(
        &self,
        index: usize,
        name: &str,
    ) -> NodeResult<Option<Rc<T>>> {
        if self.is_absent(index, name) {
            return Ok(None);
        }
        self.component::<T>(index, name).map(Some)
    }

    pub fn sensor(&self, index: usize, name: &str) -> NodeResult<Rc<dyn Sensor>> {
        self.component_handle(index, name)?
            .as_sensor()
            .ok_or_else(|| NodeError::invalid_input(format!("argument '{}' is not a sensor", name)))
    }

    pub fn optional_sensor(&self, index: usize, name: &str) -> NodeResult<Option<Rc<dyn Sensor>>> {
        if self.is_absent(index, name) {
            return Ok(None);
        }
        self.sensor(index, name).map(Some)
    }

    pub fn string_or(&self, index: usize, name: &str, default: &str) -> NodeResult<String> {
        match self.value(index, name) {
            None => Ok(default.to_string()),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(type_error(name, "a string", other)),
        }
    }

    pub fn f64_or(&self, index: usize, name: &str, default: f64) -> NodeResult<f64> {
        match self.value(index, name) {
            None => Ok(default),
            Some(v) => v.as_f64().ok_or_else(|| type_error(name, "a number", v)),
        }
    }

    pub fn u64_or(&self, index: usize, name: &str, default: u64) -> NodeResult<u64> {
        match self.value(index, name) {
            None => Ok(default),
            Some(v) => v
                .as_u64()
                .ok_or_else(|| type_error(name, "a non-negative integer", v)),
        }
    }

    pub fn bool_or(&self, index: usize, name: &str, default: bool) -> NodeResult<bool> {
        match self.value(index, name) {
            None => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| type_error(name, "a boolean", v)),
        }
    }

    fn is_absent(&self, index: usize, name: &str) -> bool {
        matches!(self.get(index, name), None | Some(ResolvedArg::Value(Value::Null)))
    }
}

fn type_error(name: &str, expected: &str, got: &Value) -> NodeError {
    NodeError::invalid_input(format!("argument '{}' must be {}, got {}", name, expected, got))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::component::{unknown_function, CallFuture};
    use serde_json::json;

    struct Bus;

    impl Component for Bus {
        fn call(self: Rc<Self>, function: &str, _args: ResolvedArgs) -> CallFuture {
            unknown_function(function)
        }
    }

    fn bus_arg() -> ResolvedArg {
        ResolvedArg::Component {
            name: "i2c".to_string(),
            instance: Rc::new(Bus),
        }
    }

    #[test]
    fn test_positional_then_named_lookup() {
        let args = ResolvedArgs::new(vec![bus_arg()], vec![])
            .with_named("precision", ResolvedArg::Value(json!(3)));
        assert!(args.component::<Bus>(0, "i2c").is_ok());
        assert_eq!(args.u64_or(1, "precision", 2).unwrap(), 3);
        assert_eq!(args.f64_or(2, "offset", 0.5).unwrap(), 0.5);
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_literal_string_is_unresolved_reference() {
        let args = ResolvedArgs::from_values([json!("i2c2")]);
        let err = args.component::<Bus>(0, "i2c").err().unwrap();
        assert!(matches!(err, NodeError::UnresolvedReference(ref r) if r == "i2c2"));
    }

    #[test]
    fn test_optional_sensor() {
        let args = ResolvedArgs::from_values([json!(null)]);
        assert!(args.optional_sensor(0, "temp_sensor").unwrap().is_none());
        assert!(ResolvedArgs::default()
            .optional_sensor(0, "temp_sensor")
            .unwrap()
            .is_none());

        // a bus is a component but not a sensor
        let args = ResolvedArgs::new(vec![bus_arg()], vec![]);
        assert!(args.optional_sensor(0, "temp_sensor").is_err());
    }

    #[test]
    fn test_type_errors() {
        let args = ResolvedArgs::from_values([json!("fast"), json!(-1), json!(3)]);
        assert!(args.f64_or(0, "interval", 1.0).is_err());
        assert!(args.u64_or(1, "samples", 20).is_err());
        assert!(args.string_or(2, "topic", "x").is_err());
        assert!(args.bool_or(3, "publish", true).unwrap());
    }
}
