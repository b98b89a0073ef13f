//! `shinobi`: validate orchestration descriptors and inspect settings.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shinobi_engine::{Catalog, Descriptor};
use shinobi_settings::{load_settings, load_settings_from_path, ShinobiSettings};
use shinobi_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "shinobi", version, about = "Multi-agent orchestration runtime")]
struct Cli {
    /// Settings file. Defaults to `$SHINOBI_SETTINGS` or `~/.shinobi/settings.json`.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a specialist, orchestrator, clan or dojo descriptor.
    Check {
        file: PathBuf,
        /// Capability the runtime will provide. Repeatable.
        #[arg(long = "capability", value_name = "NAME")]
        capabilities: Vec<String>,
        /// Reasoning module the runtime will provide. Repeatable. When none
        /// are given, reasoning-module references are not checked.
        #[arg(long = "module", value_name = "NAME")]
        modules: Vec<String>,
    },
    /// Print the effective settings as JSON.
    Settings,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = resolve_settings(cli.settings.as_deref())?;
    let _telemetry = init_telemetry(TelemetryConfig::from_settings(&settings.telemetry));

    match cli.command {
        Command::Check {
            file,
            capabilities,
            modules,
        } => check(&file, capabilities, modules),
        Command::Settings => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn resolve_settings(path: Option<&Path>) -> Result<ShinobiSettings> {
    match path {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display())),
        None => load_settings().context("failed to load settings"),
    }
}

fn check(file: &Path, capabilities: Vec<String>, modules: Vec<String>) -> Result<()> {
    let descriptor = Descriptor::from_path(file)?;
    let mut catalog = Catalog::new(capabilities);
    if !modules.is_empty() {
        catalog = catalog.with_modules(modules);
    }

    println!("{}", descriptor.summary());
    let problems = descriptor.problems(&catalog);
    if problems.is_empty() {
        tracing::info!(kind = descriptor.kind(), name = descriptor.name(), "descriptor is valid");
        println!("ok");
        return Ok(());
    }
    for problem in &problems {
        eprintln!("error: {problem}");
    }
    anyhow::bail!("{} problem(s) in {}", problems.len(), file.display())
}
