mod agent;
mod cli;
mod cmd;
mod command;
mod config;
mod docker;
mod error;
mod logger;
mod naming;
mod shell;
mod spinner;
mod state;

use anyhow::Result;
use tracing::{error, info};

fn main() -> Result<()> {
    match cli::run() {
        Ok(result) => {
            info!("java-injector finished successfully");
            Ok(result)
        }
        Err(err) => {
            error!(error = ?err, "java-injector failed");
            Err(err)
        }
    }
}
