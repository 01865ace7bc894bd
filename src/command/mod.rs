pub mod config;
pub mod instrument;
pub mod list;
pub mod uninstrument;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use anyhow::{Context as _, Result};
use console::style;
use tracing::{info, warn};

use crate::config::{CliOverrides, Config};
use crate::docker::runtime::DockerCli;
use crate::docker::sequencer::{BatchReport, CancelFlag};
use crate::docker::synth::Synthesizer;
use crate::logger;
use crate::state::Ledger;

/// Effective configuration plus the collaborators built from it.
pub struct Context {
    pub config: Config,
    pub location: Option<PathBuf>,
}

impl Context {
    /// Load config, apply flags, and start the file logger at the configured level.
    pub fn load(explicit: Option<&Path>, overrides: &CliOverrides) -> Result<Self> {
        let (mut config, location) = Config::load(explicit)?;
        config.apply_cli_overrides(overrides);
        config.validate()?;
        logger::init(&config.log_level())?;
        info!(
            args = ?std::env::args().collect::<Vec<_>>(),
            config = ?location,
            "java-injector start"
        );
        Ok(Self { config, location })
    }

    pub fn runtime(&self) -> DockerCli {
        DockerCli::new(
            self.config.runtime(),
            self.config.compose_command(),
            self.config.timeout(),
        )
    }

    pub fn ledger(&self) -> Ledger {
        Ledger::in_dir(&self.config.state_directory())
    }

    pub fn synthesizer(&self) -> Synthesizer {
        Synthesizer::new(
            self.config.agent_path().display().to_string(),
            self.config.container_agent_path(),
        )
    }
}

/// Mutating commands need the docker socket and the state directory; say so
/// up front instead of failing halfway.
pub fn warn_if_not_root() {
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        warn!(euid, "not running as root");
        eprintln!(
            "{} not running as root; docker access or the state directory may be denied",
            style("Warning:").yellow().bold()
        );
    }
}

/// Ctrl-C sets the returned flag. The first press is deferred to the next safe
/// point; the operator is told so.
pub fn install_interrupt_handler() -> Result<CancelFlag> {
    let cancel = CancelFlag::default();
    let flag = cancel.clone();
    ctrlc::set_handler(move || {
        if !flag.swap(true, Ordering::SeqCst) {
            eprintln!(
                "\n{} finishing the current step before stopping",
                style("Interrupt received:").yellow().bold()
            );
        }
    })
    .context("Failed to install Ctrl-C handler")?;
    Ok(cancel)
}

pub fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    io::stdin()
        .read_line(&mut input)
        .context("Failed to read input")?;
    Ok(matches!(input.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// Print the per-container results. Errors if anything failed.
pub fn print_report(verb: &str, report: &BatchReport) -> Result<()> {
    for (name, reason) in &report.skipped {
        println!("{} {}: {}", style("-").dim(), name, reason);
    }
    for (name, err) in &report.failed {
        println!("{} {}: {}", style("✘").red(), name, err);
    }
    if report.interrupted() {
        println!(
            "{} interrupted; not processed: {}",
            style("!").yellow(),
            report.not_processed.join(", ")
        );
    }
    println!(
        "\n{}: {} succeeded, {} failed, {} skipped",
        verb,
        style(report.succeeded.len()).green(),
        style(report.failed.len()).red(),
        report.skipped.len()
    );

    if !report.failed.is_empty() {
        anyhow::bail!("{} container(s) failed", report.failed.len());
    }
    Ok(())
}
