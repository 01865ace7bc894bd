use anyhow::Result;
use console::style;
use tracing::info;

use crate::agent;
use crate::command::{self, Context};
use crate::docker::discovery;
use crate::docker::sequencer::{InstrumentOutcome, Phase, Sequencer, run_batch};
use crate::error::InjectError;
use crate::spinner::with_spinner;

pub fn run(ctx: &Context, names: &[String], all: bool, yes: bool) -> Result<()> {
    ctx.config.validate_for_instrument()?;
    command::warn_if_not_root();

    let agent_path = ctx.config.agent_path();
    if agent::prepare_agent(agent_path)? {
        println!(
            "{} made {} world-readable so containers can load it",
            style("!").yellow(),
            agent_path.display()
        );
    }

    let runtime = ctx.runtime();
    let ledger = ctx.ledger();

    let targets: Vec<String> = if all {
        discovery::discover(&runtime, &ledger)?
            .into_iter()
            .map(|c| c.name)
            .collect()
    } else {
        names.to_vec()
    };
    if targets.is_empty() {
        println!("No Java containers found");
        return Ok(());
    }
    info!(count = targets.len(), all, "instrument:start");

    let desired = ctx.config.desired();
    let cancel = command::install_interrupt_handler()?;

    let report = run_batch(&targets, &cancel, |name| {
        let replace = ledger.contains(name)?;
        if replace
            && !yes
            && !command::confirm(&format!(
                "{} is already instrumented. Update configuration?",
                name
            ))
            .unwrap_or(false)
        {
            return Err(InjectError::AlreadyInstrumented(name.to_string()));
        }

        let outcome = with_spinner(&format!("Instrumenting {}", name), |pb| {
            let observe =
                |container: &str, phase: Phase| pb.set_message(format!("{}: {}", container, phase));
            Sequencer::new(&runtime, &ledger, ctx.synthesizer())
                .commit(ctx.config.commit())
                .cancel_flag(cancel.clone())
                .observer(&observe)
                .instrument(name, &desired, replace)
        })?;

        match &outcome {
            InstrumentOutcome::Instrumented {
                image,
                degraded: true,
                ..
            } => println!(
                "  {} commit failed; recreated from {} so filesystem changes made inside the container were not kept",
                style("!").yellow(),
                image
            ),
            InstrumentOutcome::ComposeManual(instructions) => println!("{}", instructions),
            _ => {}
        }
        Ok(outcome)
    });

    command::print_report("Instrument", &report)
}
