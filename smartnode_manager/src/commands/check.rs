//! `smartnode check`
//!
//! Loads a descriptor file the way a booting node would, but against an
//! in-process broker and with the supervisor off, then reports per component.

use std::path::Path;

use anyhow::{Context, Result};
use smartnode::communication::SimulatedBroker;
use smartnode::loader::{FactoryRegistry, LoadReport};
use smartnode::{NodeSettings, SmartNode};

use super::load_descriptors;

/// Dry-run `components`. Topic layout comes from `settings` when given.
pub fn check_components(
    components: &Path,
    settings: Option<&Path>,
    factories: FactoryRegistry,
) -> Result<LoadReport> {
    let mut settings = match settings {
        Some(path) => NodeSettings::from_file(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => NodeSettings::default(),
    };
    settings.supervisor.enabled = false;
    settings.components.remote = false;
    settings.scheduler.loader_pause_ms = None;

    let descriptors = load_descriptors(components)?;
    let broker = SimulatedBroker::new();
    let node = SmartNode::new(settings, broker.link(), factories)
        .context("failed to create node")?
        .with_descriptors(descriptors);

    let summary = node
        .scheduler()
        .block_on(node.boot())
        .context("dry run failed")?;
    log::debug!("Dry run published {} message(s)", broker.published().len());
    Ok(summary.report)
}
