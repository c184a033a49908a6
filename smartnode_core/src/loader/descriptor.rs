//! Component descriptors and their JSON surface.
//!
//! ```json
//! {
//!   "_order": ["i2c", "htu"],
//!   "i2c": { "package": "machine", "component": "I2C", "constructor_args": { "scl": 22, "sda": 21 } },
//!   "htu": {
//!     "package": "sensors.htu21d",
//!     "component": "HTU21D",
//!     "constructor_args": ["i2c"],
//!     "call_function_regularly": "temp_humid",
//!     "call_interval": 600
//!   }
//! }
//! ```
//!
//! A string argument that equals the name of another descriptor in the set is a
//! reference; everything else is a literal.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LoadError, NodeError, NodeResult};

const ORDER_KEY: &str = "_order";

/// One constructor or init argument
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    Literal(Value),
    Reference(String),
}

impl ArgValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        ArgValue::Literal(value.into())
    }

    pub fn reference(name: impl Into<String>) -> Self {
        ArgValue::Reference(name.into())
    }

    pub fn as_reference(&self) -> Option<&str> {
        match self {
            ArgValue::Reference(name) => Some(name),
            ArgValue::Literal(_) => None,
        }
    }
}

/// Positional and named arguments, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Args {
    pub positional: Vec<ArgValue>,
    pub named: Vec<(String, ArgValue)>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// `[..]` becomes positional, `{..}` named, `null` empty and any other scalar a
    /// single positional literal.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => Self::default(),
            Value::Array(items) => Self {
                positional: items.into_iter().map(ArgValue::Literal).collect(),
                named: Vec::new(),
            },
            Value::Object(map) => Self {
                positional: Vec::new(),
                named: map
                    .into_iter()
                    .map(|(k, v)| (k, ArgValue::Literal(v)))
                    .collect(),
            },
            scalar => Self {
                positional: vec![ArgValue::Literal(scalar)],
                named: Vec::new(),
            },
        }
    }

    pub fn arg(mut self, value: ArgValue) -> Self {
        self.positional.push(value);
        self
    }

    pub fn named(mut self, key: impl Into<String>, value: ArgValue) -> Self {
        self.named.push((key.into(), value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &ArgValue> {
        self.positional
            .iter()
            .chain(self.named.iter().map(|(_, v)| v))
    }

    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.values().filter_map(ArgValue::as_reference)
    }

    fn values_mut(&mut self) -> impl Iterator<Item = &mut ArgValue> {
        self.positional
            .iter_mut()
            .chain(self.named.iter_mut().map(|(_, v)| v))
    }

    // Promote string literals naming another descriptor to references
    fn link(&mut self, own_name: &str, names: &HashSet<String>) {
        for value in self.values_mut() {
            if let ArgValue::Literal(Value::String(s)) = value {
                if s.as_str() != own_name && names.contains(s.as_str()) {
                    *value = ArgValue::Reference(std::mem::take(s));
                }
            }
        }
    }
}

/// How to build and wire one component
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentDescriptor {
    pub name: String,
    pub package: String,
    pub component: String,
    pub constructor_args: Args,
    pub init_function: Option<String>,
    pub init_args: Args,
    pub call_function_regularly: Option<String>,
    pub call_interval: Option<Duration>,
}

impl ComponentDescriptor {
    pub fn new(
        name: impl Into<String>,
        package: impl Into<String>,
        component: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            package: package.into(),
            component: component.into(),
            constructor_args: Args::default(),
            init_function: None,
            init_args: Args::default(),
            call_function_regularly: None,
            call_interval: None,
        }
    }

    pub fn with_args(mut self, args: Args) -> Self {
        self.constructor_args = args;
        self
    }

    pub fn with_init(mut self, function: impl Into<String>, args: Args) -> Self {
        self.init_function = Some(function.into());
        self.init_args = args;
        self
    }

    pub fn call_regularly(mut self, function: impl Into<String>, interval: Option<Duration>) -> Self {
        self.call_function_regularly = Some(function.into());
        self.call_interval = interval;
        self
    }

    /// `package.component`, as shown in reports
    pub fn factory_id(&self) -> String {
        let package = self.package.trim_matches('.');
        if package.is_empty() {
            self.component.clone()
        } else {
            format!("{}.{}", package, self.component)
        }
    }

    fn link(&mut self, names: &HashSet<String>) {
        let own = self.name.clone();
        self.constructor_args.link(&own, names);
        self.init_args.link(&own, names);
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDescriptor {
    #[serde(default)]
    package: String,
    component: String,
    #[serde(default)]
    constructor_args: Value,
    #[serde(default)]
    init_function: Option<String>,
    #[serde(default)]
    init_args: Value,
    #[serde(default)]
    call_function_regularly: Option<String>,
    /// Seconds
    #[serde(default)]
    call_interval: Option<f64>,
}

impl RawDescriptor {
    fn into_descriptor(self, name: &str) -> Result<ComponentDescriptor, String> {
        if self.component.trim().is_empty() {
            return Err("'component' must not be empty".to_string());
        }
        let call_interval = match self.call_interval {
            None => None,
            Some(secs) if secs.is_finite() && secs > 0.0 => Some(
                Duration::try_from_secs_f64(secs)
                    .map_err(|_| format!("call_interval out of range: {}", secs))?,
            ),
            Some(secs) => return Err(format!("call_interval must be positive, got {}", secs)),
        };
        if call_interval.is_some() && self.call_function_regularly.is_none() {
            return Err("call_interval given without call_function_regularly".to_string());
        }
        Ok(ComponentDescriptor {
            name: name.to_string(),
            package: self.package,
            component: self.component,
            constructor_args: Args::from_value(self.constructor_args),
            init_function: self.init_function,
            init_args: Args::from_value(self.init_args),
            call_function_regularly: self.call_function_regularly,
            call_interval,
        })
    }
}

/// An ordered collection of descriptors, possibly merged from several sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DescriptorSet {
    /// Explicit load order; `None` means declaration order
    pub order: Option<Vec<String>>,
    pub descriptors: Vec<ComponentDescriptor>,
    /// Entries that could not be parsed; reported as failed at load
    pub invalid: Vec<LoadError>,
}

impl DescriptorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> NodeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            NodeError::config(format!("cannot read descriptors {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> NodeResult<Self> {
        let TopLevel(entries) = serde_json::from_str(content)?;

        let mut set = DescriptorSet::default();
        for (key, value) in entries {
            if key == ORDER_KEY {
                if set.order.is_some() {
                    log::warn!("Ignoring repeated {} key", ORDER_KEY);
                } else {
                    set.order = Some(parse_order(value)?);
                }
                continue;
            }
            if key.starts_with('_') {
                // reserved for annotations
                continue;
            }
            let parsed = serde_json::from_value::<RawDescriptor>(value)
                .map_err(|e| e.to_string())
                .and_then(|raw| raw.into_descriptor(&key));
            match parsed {
                Ok(descriptor) => set.descriptors.push(descriptor),
                Err(message) => {
                    log::warn!("Ignoring invalid descriptor '{}': {}", key, message);
                    set.invalid.push(LoadError::InvalidDescriptor { name: key, message });
                }
            }
        }
        set.link();
        Ok(set)
    }

    pub fn with_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order = Some(order.into_iter().map(Into::into).collect());
        self
    }

    /// Append a descriptor. String arguments are re-linked against the whole set.
    pub fn push(&mut self, descriptor: ComponentDescriptor) {
        self.descriptors.push(descriptor);
        self.link();
    }

    pub fn with(mut self, descriptor: ComponentDescriptor) -> Self {
        self.push(descriptor);
        self
    }

    /// Combine two sets. Orders concatenate when either side is explicit; names
    /// declared on both sides surface as duplicates at load time.
    pub fn merge(mut self, other: DescriptorSet) -> Self {
        self.order = match (self.order.is_some(), other.order.is_some()) {
            (false, false) => None,
            _ => {
                let mut order = self.effective_order().0;
                order.extend(other.effective_order().0);
                Some(order)
            }
        };
        self.descriptors.extend(other.descriptors);
        self.invalid.extend(other.invalid);
        self.link();
        self
    }

    /// The order to load in, and whether it was given explicitly
    pub fn effective_order(&self) -> (Vec<String>, bool) {
        match &self.order {
            Some(order) => (order.clone(), true),
            None => (
                self.descriptors.iter().map(|d| d.name.clone()).collect(),
                false,
            ),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ComponentDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty() && self.invalid.is_empty()
    }

    fn link(&mut self) {
        let names: HashSet<String> = self.descriptors.iter().map(|d| d.name.clone()).collect();
        for descriptor in &mut self.descriptors {
            descriptor.link(&names);
        }
    }
}

/// Top-level entries in document order. Repeated keys are all kept so the loader
/// can report them; a plain `Map` would keep only the last one.
struct TopLevel(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for TopLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{MapAccess, Visitor};
        use std::fmt;

        struct TopLevelVisitor;

        impl<'de> Visitor<'de> for TopLevelVisitor {
            type Value = TopLevel;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an object of component descriptors")
            }

            fn visit_map<V>(self, mut map: V) -> Result<TopLevel, V::Error>
            where
                V: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, Value>()? {
                    entries.push(entry);
                }
                Ok(TopLevel(entries))
            }
        }

        deserializer.deserialize_map(TopLevelVisitor)
    }
}

fn parse_order(value: Value) -> NodeResult<Vec<String>> {
    let Value::Array(items) = value else {
        return Err(NodeError::config("_order must be an array of component names"));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::String(name) => Ok(name),
            other => Err(NodeError::config(format!(
                "_order entries must be strings, got {}",
                other
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCENARIO: &str = r#"{
        "_order": ["i2c", "htu"],
        "i2c": {"package": "machine", "component": "I2C", "constructor_args": {"scl": 22, "sda": 21}},
        "htu": {
            "package": "sensors.htu21d",
            "component": "HTU21D",
            "constructor_args": ["i2c", "living_room"],
            "call_function_regularly": "temp_humid",
            "call_interval": 600
        }
    }"#;

    #[test]
    fn test_parse_and_link_references() {
        let set = DescriptorSet::from_json(SCENARIO).unwrap();
        assert_eq!(set.order, Some(vec!["i2c".to_string(), "htu".to_string()]));
        assert_eq!(set.len(), 2);

        let htu = set.get("htu").unwrap();
        assert_eq!(htu.factory_id(), "sensors.htu21d.HTU21D");
        assert_eq!(
            htu.constructor_args.positional,
            vec![ArgValue::reference("i2c"), ArgValue::literal("living_room")]
        );
        assert_eq!(htu.call_interval, Some(Duration::from_secs(600)));

        let i2c = set.get("i2c").unwrap();
        assert_eq!(
            i2c.constructor_args.named,
            vec![
                ("scl".to_string(), ArgValue::literal(22)),
                ("sda".to_string(), ArgValue::literal(21)),
            ]
        );
    }

    #[test]
    fn test_unknown_name_stays_literal() {
        let set = DescriptorSet::from_json(
            r#"{"htu": {"component": "HTU21D", "constructor_args": ["i2c2"]}}"#,
        )
        .unwrap();
        let htu = set.get("htu").unwrap();
        assert_eq!(htu.constructor_args.references().count(), 0);
        assert_eq!(set.effective_order(), (vec!["htu".to_string()], false));
    }

    #[test]
    fn test_invalid_entries_are_collected() {
        let set = DescriptorSet::from_json(
            r#"{
                "_comment": "ignored",
                "good": {"component": "I2C"},
                "typo": {"componnet": "I2C"},
                "zero": {"component": "X", "call_function_regularly": "f", "call_interval": 0}
            }"#,
        )
        .unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.invalid.len(), 2);
        assert!(matches!(
            &set.invalid[0],
            LoadError::InvalidDescriptor { name, .. } if name == "typo"
        ));
    }

    #[test]
    fn test_out_of_range_interval_is_invalid() {
        let set = DescriptorSet::from_json(
            r#"{"htu": {"component": "HTU21D", "call_function_regularly": "temp_humid", "call_interval": 1e300}}"#,
        )
        .unwrap();
        assert_eq!(set.len(), 0);
        assert_eq!(set.invalid.len(), 1);
        assert!(matches!(
            &set.invalid[0],
            LoadError::InvalidDescriptor { name, message }
                if name == "htu" && message.contains("out of range")
        ));
    }

    #[test]
    fn test_repeated_keys_are_all_kept_in_document_order() {
        let set = DescriptorSet::from_json(
            r#"{
                "_order": ["bus"],
                "bus": {"package": "machine", "component": "First"},
                "bus": {"package": "machine", "component": "Second"},
                "_order": ["other"]
            }"#,
        )
        .unwrap();
        assert_eq!(set.order, Some(vec!["bus".to_string()]));
        let components: Vec<&str> = set.descriptors.iter().map(|d| d.component.as_str()).collect();
        assert_eq!(components, vec!["First", "Second"]);
        assert_eq!(set.get("bus").unwrap().component, "First");
    }

    #[test]
    fn test_rejects_non_object_root_and_bad_order() {
        assert!(DescriptorSet::from_json("[1, 2]").is_err());
        assert!(DescriptorSet::from_json(r#"{"_order": "i2c"}"#).is_err());
        assert!(DescriptorSet::from_json(r#"{"_order": [1]}"#).is_err());
    }

    #[test]
    fn test_merge_relinks_and_keeps_duplicates() {
        let base = DescriptorSet::from_json(
            r#"{"_order": ["i2c"], "i2c": {"package": "machine", "component": "I2C"}}"#,
        )
        .unwrap();
        let extra = DescriptorSet::from_json(
            r#"{
                "i2c": {"package": "machine", "component": "I2C"},
                "water": {"package": "sensors.waterSensor", "component": "WaterSensor", "init_args": {"bus": "i2c"}}
            }"#,
        )
        .unwrap();
        let merged = base.merge(extra);
        assert_eq!(merged.len(), 3);
        assert_eq!(
            merged.effective_order().0,
            vec!["i2c", "i2c", "water"]
        );
        let water = merged.get("water").unwrap();
        assert_eq!(water.init_args.named[0].1, ArgValue::reference("i2c"));
    }

    #[test]
    fn test_builder_links_on_push() {
        let set = DescriptorSet::new()
            .with(ComponentDescriptor::new("bus", "machine", "I2C"))
            .with(
                ComponentDescriptor::new("htu", "sensors.htu21d", "HTU21D")
                    .with_args(Args::new().arg(ArgValue::literal(json!("bus")))),
            );
        assert_eq!(
            set.get("htu").unwrap().constructor_args.positional[0],
            ArgValue::reference("bus")
        );
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("components.json");
        std::fs::write(&path, SCENARIO).unwrap();
        assert_eq!(DescriptorSet::from_file(&path).unwrap().len(), 2);
        assert!(DescriptorSet::from_file(dir.path().join("missing.json")).is_err());
    }
}
