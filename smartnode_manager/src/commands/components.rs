//! `smartnode components`

use anyhow::Result;
use colored::*;
use smartnode::loader::{FactoryInfo, FactoryRegistry};

/// Factories sorted by identifier
pub fn list(factories: &FactoryRegistry) -> Vec<FactoryInfo> {
    let mut infos = factories.infos();
    infos.sort_by_key(FactoryInfo::id);
    infos
}

pub fn print_components(factories: &FactoryRegistry, json: bool) -> Result<()> {
    let infos = list(factories);
    if json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
        return Ok(());
    }

    println!("{}", "Available components:".green().bold());
    println!();
    for info in &infos {
        let capabilities = info
            .capabilities
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "  {} {} {}",
            format!("{:32}", info.id()).cyan(),
            format!("v{:8}", info.version).dimmed(),
            capabilities
        );
    }
    println!();
    println!("  {} component(s)", infos.len());
    Ok(())
}
