use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};

use crate::command::{self, Context};
use crate::config::CliOverrides;

#[derive(Parser)]
#[command(author, version, long_about = None)]
#[command(name = "java-injector")]
#[command(about = "Attach the Middleware Java agent to running containers, and take it off again")]
#[command(
    after_help = "Instrumentation replaces the container: it is stopped, committed, removed and recreated with the agent mounted."
)]
struct Cli {
    /// Config file to use instead of the default search locations
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Settings that override the config file for one run.
#[derive(Args, Debug, Default)]
struct OverrideFlags {
    /// Middleware API key
    #[arg(long, value_name = "KEY")]
    api_key: Option<String>,

    /// Middleware target URL
    #[arg(long, value_name = "URL")]
    target: Option<String>,

    /// Agent JAR on the host
    #[arg(long, value_name = "PATH")]
    agent_path: Option<PathBuf>,

    /// Service name reported by the agent
    #[arg(long, value_name = "NAME")]
    service_name: Option<String>,
}

impl From<OverrideFlags> for CliOverrides {
    fn from(flags: OverrideFlags) -> Self {
        CliOverrides {
            api_key: flags.api_key,
            target: flags.target,
            agent_path: flags.agent_path,
            service_name: flags.service_name,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Instrument containers with the Java agent
    Instrument {
        /// Container names
        #[arg(required_unless_present = "all")]
        names: Vec<String>,

        /// Instrument every running Java container
        #[arg(long, conflicts_with = "names")]
        all: bool,

        /// Re-instrument already instrumented containers without asking
        #[arg(short = 'y', long)]
        yes: bool,

        #[command(flatten)]
        overrides: OverrideFlags,
    },

    /// Restore containers to their state before instrumentation
    Uninstrument {
        /// Container names
        #[arg(required_unless_present = "all")]
        names: Vec<String>,

        /// Restore every container recorded in the ledger
        #[arg(long, conflicts_with = "names")]
        all: bool,
    },

    /// List instrumented containers
    #[command(visible_alias = "ls")]
    List {
        /// List running Java containers instead, with their instrumentation status
        #[arg(long)]
        discovered: bool,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a commented config template
    Init {
        /// Where to write it
        #[arg(default_value = "java-injector.yaml")]
        path: PathBuf,
    },

    /// Print the effective configuration with secrets masked
    Show,
}

fn context(config: Option<&Path>, overrides: CliOverrides) -> Result<Context> {
    Context::load(config, &overrides)
}

// --- Public Entry Point ---
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Instrument {
            names,
            all,
            yes,
            overrides,
        } => command::instrument::run(&context(config, overrides.into())?, &names, all, yes),
        Commands::Uninstrument { names, all } => {
            command::uninstrument::run(&context(config, CliOverrides::default())?, &names, all)
        }
        Commands::List { discovered } => {
            command::list::run(&context(config, CliOverrides::default())?, discovered)
        }
        Commands::Config { command } => match command {
            ConfigCommands::Init { path } => command::config::init(&path),
            ConfigCommands::Show => {
                command::config::show(&context(config, CliOverrides::default())?)
            }
        },
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
