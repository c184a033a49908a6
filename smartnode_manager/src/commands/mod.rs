pub mod check;
pub mod components;
pub mod run;

use std::path::Path;

use anyhow::{Context, Result};
use colored::*;
use smartnode::loader::{DescriptorSet, LoadReport, LoadStatus};

/// Read a descriptor file, naming the path on failure
pub fn load_descriptors(path: &Path) -> Result<DescriptorSet> {
    DescriptorSet::from_file(path)
        .with_context(|| format!("failed to load component descriptors from {}", path.display()))
}

/// Print one line per component, then the non-fatal issues
pub fn print_report(report: &LoadReport) {
    for outcome in &report.outcomes {
        let tag = match outcome.status {
            LoadStatus::Loaded => "[OK]".green(),
            LoadStatus::Degraded => "[WARN]".yellow(),
            LoadStatus::Failed => "[ERR]".red(),
        };
        let detail = match (&outcome.error, &outcome.component, &outcome.version) {
            (Some(error), _, _) => error.to_string(),
            (None, Some(component), Some(version)) => format!("{} v{}", component, version),
            (None, Some(component), None) => component.clone(),
            (None, None, _) => String::new(),
        };
        println!("  {} {} {}", tag, format!("{:20}", outcome.name).cyan(), detail);
    }
    for issue in &report.issues {
        println!("  {} {}", "[WARN]".yellow(), issue);
    }
    println!();
    println!("  {}", report.summary().bold());
}
