//! SmartNode manager CLI

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::*;
use smartnode::loader::LoadStatus;
use smartnode_manager::commands::{self, run::RunOptions};
use smartnode_manager::logging;

#[derive(Parser)]
#[command(name = "smartnode")]
#[command(about = "Run and inspect SmartNode sensor nodes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(propagate_version = true)]
struct Cli {
    /// More log output (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the node and run until Ctrl+C
    Run {
        /// Node settings file
        #[arg(short, long, default_value = "node.toml")]
        settings: PathBuf,

        /// Component descriptors, overriding remote, cache and configured file
        #[arg(short, long)]
        components: Option<PathBuf>,

        /// Use an in-process broker instead of the configured one
        #[arg(long)]
        simulate: bool,
    },

    /// Dry-run a descriptor file and report what would load
    Check {
        /// Component descriptors to check
        #[arg(short, long)]
        components: PathBuf,

        /// Node settings file, for topic layout
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the components this build can load
    Components {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let result = match cli.command {
        Commands::Run {
            settings,
            components,
            simulate,
        } => commands::run::run_node(&RunOptions {
            settings,
            components,
            simulate,
        })
        .map(drop),

        Commands::Check {
            components,
            settings,
            json,
        } => commands::check::check_components(
            &components,
            settings.as_deref(),
            smartnode::default_factories(),
        )
        .and_then(|report| {
            if json {
                println!("{}", report.to_json()?);
            } else {
                println!("{}", "Component check:".green().bold());
                println!();
                commands::print_report(&report);
            }
            if report.count(LoadStatus::Failed) > 0 {
                std::process::exit(2);
            }
            Ok(())
        }),

        Commands::Components { json } => {
            commands::components::print_components(&smartnode::default_factories(), json)
        }
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}
