//! Name → live component directory.
//!
//! The loader is the only writer and works on a [`RegistryBuilder`]. Once loading
//! finishes the builder is frozen into a [`Registry`], which is cheap to clone and
//! lookup-only for the rest of the process lifetime.

use std::collections::HashMap;
use std::rc::Rc;

use super::component::{downcast, Capability, Component, Sensor};
use crate::error::LoadError;

/// One registered component and its metadata
#[derive(Clone)]
pub struct RegistryEntry {
    pub name: String,
    pub instance: Rc<dyn Component>,
    pub version: Option<String>,
    pub capabilities: Vec<Capability>,
    pub degraded: bool,
}

impl RegistryEntry {
    pub fn new(name: impl Into<String>, instance: Rc<dyn Component>) -> Self {
        Self {
            name: name.into(),
            instance,
            version: None,
            capabilities: Vec::new(),
            degraded: false,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[Capability]) -> Self {
        self.capabilities = capabilities.to_vec();
        self
    }
}

#[derive(Default)]
struct Entries {
    ordered: Vec<RegistryEntry>,
    index: HashMap<String, usize>,
}

impl Entries {
    fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.index.get(name).map(|&i| &self.ordered[i])
    }
}

/// Writable registry used while loading
#[derive(Default)]
pub struct RegistryBuilder {
    entries: Entries,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry. The first registration of a name wins.
    pub fn insert(&mut self, entry: RegistryEntry) -> Result<(), LoadError> {
        if self.entries.index.contains_key(&entry.name) {
            return Err(LoadError::DuplicateName { name: entry.name });
        }
        self.entries
            .index
            .insert(entry.name.clone(), self.entries.ordered.len());
        self.entries.ordered.push(entry);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Rc<dyn Component>> {
        self.entries.get(name).map(|e| e.instance.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.index.contains_key(name)
    }

    pub fn mark_degraded(&mut self, name: &str) {
        if let Some(&i) = self.entries.index.get(name) {
            self.entries.ordered[i].degraded = true;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.ordered.is_empty()
    }

    pub fn freeze(self) -> Registry {
        Registry {
            entries: Rc::new(self.entries),
        }
    }
}

/// Frozen, lookup-only registry
#[derive(Clone, Default)]
pub struct Registry {
    entries: Rc<Entries>,
}

impl Registry {
    pub fn get(&self, name: &str) -> Option<Rc<dyn Component>> {
        self.entries.get(name).map(|e| e.instance.clone())
    }

    /// Look up `name` and downcast it to its concrete type
    pub fn get_as<T: Component + 'static>(&self, name: &str) -> Option<Rc<T>> {
        self.get(name).and_then(downcast::<T>)
    }

    pub fn sensor(&self, name: &str) -> Option<Rc<dyn Sensor>> {
        self.get(name).and_then(|c| c.as_sensor())
    }

    pub fn entry(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.ordered.is_empty()
    }

    /// Names in registration order
    pub fn names(&self) -> Vec<&str> {
        self.entries.ordered.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.ordered.iter()
    }

    pub fn degraded(&self) -> Vec<&str> {
        self.iter()
            .filter(|e| e.degraded)
            .map(|e| e.name.as_str())
            .collect()
    }
}
