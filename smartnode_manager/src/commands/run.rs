//! `smartnode run`

use std::path::PathBuf;

use anyhow::{Context, Result};
use colored::*;
use smartnode::communication::{SimulatedBroker, TcpTransport, Transport};
use smartnode::loader::{DescriptorSet, FactoryRegistry};
use smartnode::{BootSummary, NodeSettings, SmartNode};

use super::{load_descriptors, print_report};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub settings: PathBuf,
    /// Overrides the remote, cache and local descriptor sources
    pub components: Option<PathBuf>,
    /// Talk to an in-process broker instead of the configured one
    pub simulate: bool,
}

pub fn run_node(options: &RunOptions) -> Result<BootSummary> {
    let settings = NodeSettings::from_file(&options.settings)
        .with_context(|| format!("failed to load settings from {}", options.settings.display()))?;
    let descriptors = options
        .components
        .as_deref()
        .map(load_descriptors)
        .transpose()?;
    let factories = smartnode::default_factories();

    let target = if options.simulate {
        "simulated broker".to_string()
    } else {
        format!("{}:{}", settings.broker.host, settings.broker.port)
    };
    println!(
        "{} Starting node {} ({})",
        "->".cyan(),
        settings.device_id.green().bold(),
        target
    );

    let summary = if options.simulate {
        let broker = SimulatedBroker::new();
        launch(settings, broker.link(), factories, descriptors)?
    } else {
        let transport = TcpTransport::new(settings.broker.host.clone(), settings.broker.port);
        launch(settings, transport, factories, descriptors)?
    };

    println!();
    println!("{} Node stopped; booted from {} with:", "->".cyan(), summary.source);
    print_report(&summary.report);
    Ok(summary)
}

fn launch<T>(
    settings: NodeSettings,
    transport: T,
    factories: FactoryRegistry,
    descriptors: Option<DescriptorSet>,
) -> Result<BootSummary>
where
    T: Transport + 'static,
{
    let mut node =
        SmartNode::new(settings, transport, factories).context("failed to create node")?;
    if let Some(set) = descriptors {
        node = node.with_descriptors(set);
    }

    let trigger = node.shutdown_trigger();
    ctrlc::set_handler(move || {
        println!("\n{}", "Shutting down...".yellow());
        trigger.trigger();
    })
    .context("failed to install Ctrl+C handler")?;

    tracing::info!(device = %node.settings().device_id, "run-loop starting");
    node.run_blocking().context("node run-loop failed")
}
