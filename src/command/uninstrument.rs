use anyhow::Result;
use tracing::info;

use crate::command::{self, Context};
use crate::docker::sequencer::{Phase, Sequencer, run_batch};
use crate::spinner::with_spinner;

pub fn run(ctx: &Context, names: &[String], all: bool) -> Result<()> {
    command::warn_if_not_root();

    let runtime = ctx.runtime();
    let ledger = ctx.ledger();

    let targets: Vec<String> = if all {
        ledger
            .list()?
            .into_iter()
            .map(|e| e.container_name)
            .collect()
    } else {
        names.to_vec()
    };
    if targets.is_empty() {
        println!("No instrumented containers");
        return Ok(());
    }
    info!(count = targets.len(), all, "uninstrument:start");

    let cancel = command::install_interrupt_handler()?;
    let report = run_batch(&targets, &cancel, |name| {
        with_spinner(&format!("Restoring {}", name), |pb| {
            let observe =
                |container: &str, phase: Phase| pb.set_message(format!("{}: {}", container, phase));
            Sequencer::new(&runtime, &ledger, ctx.synthesizer())
                .cancel_flag(cancel.clone())
                .observer(&observe)
                .uninstrument(name)
        })
    });

    command::print_report("Uninstrument", &report)
}
