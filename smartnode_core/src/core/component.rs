//! The contract every loadable component satisfies.
//!
//! Components are plain structs shared through `Rc`. The loader only needs three
//! things from them: the names of the functions a descriptor may call, a way to call
//! one, and (for sensors) a `read` entry point other components can depend on.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use serde::Serialize;

use crate::error::{NodeError, NodeResult};
use crate::loader::ResolvedArgs;

/// Future returned by a component function call
pub type CallFuture = LocalBoxFuture<'static, NodeResult<()>>;

/// What a component offers, declared by its factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Bus,
    Sensor,
    Actuator,
    Publisher,
    Subscriber,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bus => write!(f, "bus"),
            Self::Sensor => write!(f, "sensor"),
            Self::Actuator => write!(f, "actuator"),
            Self::Publisher => write!(f, "publisher"),
            Self::Subscriber => write!(f, "subscriber"),
        }
    }
}

/// Upcast to `Any` so shared handles can be downcast to their concrete type.
pub trait AsAny {
    fn into_any_rc(self: Rc<Self>) -> Rc<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn into_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

pub trait Component: AsAny {
    /// Functions a descriptor may name as `init_function` or
    /// `call_function_regularly`
    fn functions(&self) -> &'static [&'static str] {
        &[]
    }

    fn supports(&self, function: &str) -> bool {
        self.functions().contains(&function)
    }

    /// Invoke `function` by name. Implementations fall back to
    /// [`unknown_function`] for names they do not provide.
    fn call(self: Rc<Self>, function: &str, args: ResolvedArgs) -> CallFuture;

    fn as_sensor(self: Rc<Self>) -> Option<Rc<dyn Sensor>> {
        None
    }
}

/// A component that produces measurements on demand.
pub trait Sensor: Component {
    /// Take a measurement. With `publish` set the reading also goes to the
    /// component's device topic.
    fn read(self: Rc<Self>, publish: bool) -> LocalBoxFuture<'static, NodeResult<Reading>>;
}

/// The error future for a function the component does not provide
pub fn unknown_function(function: &str) -> CallFuture {
    let err = NodeError::UnknownFunction(function.to_string());
    async move { Err(err) }.boxed_local()
}

/// Downcast a shared component handle to its concrete type
pub fn downcast<T: Component + 'static>(component: Rc<dyn Component>) -> Option<Rc<T>> {
    component.into_any_rc().downcast::<T>().ok()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub name: String,
    pub value: f64,
    pub unit: String,
}

/// One or more measurements taken together
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Reading {
    pub values: Vec<Measurement>,
}

impl Reading {
    pub fn single(name: &str, value: f64, unit: &str) -> Self {
        Self::default().with(name, value, unit)
    }

    pub fn with(mut self, name: &str, value: f64, unit: &str) -> Self {
        self.values.push(Measurement {
            name: name.to_string(),
            value,
            unit: unit.to_string(),
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.iter().find(|m| m.name == name).map(|m| m.value)
    }

    /// The first value, for single-quantity sensors
    pub fn primary(&self) -> Option<f64> {
        self.values.first().map(|m| m.value)
    }

    pub fn to_json(&self) -> String {
        let map: serde_json::Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|m| (m.name.clone(), serde_json::json!(m.value)))
            .collect();
        serde_json::Value::Object(map).to_string()
    }
}
