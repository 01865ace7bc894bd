//! The instrument / uninstrument state machine.
//!
//! A running container cannot have its environment or mounts changed, so it
//! is replaced: `Discovered -> Captured -> Stopped -> Committed -> Removed ->
//! Recreated -> Persisted`. Everything up to `Captured` is read-only and may
//! fail freely. `Stopped` is the point of no return; from there until
//! `Recreated` the workload may be absent, so interrupts are deferred and a
//! failed recreate is reported with the command that brings the original back.
//! Only after the ledger write does an instrumentation count as done.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, warn};

use crate::docker::compose::{self, ComposeChange, ComposeLink, ComposeOutcome, ManualInstructions};
use crate::docker::env::{self, DesiredConfig};
use crate::docker::runtime::ContainerRuntime;
use crate::docker::snapshot::RuntimeSnapshot;
use crate::docker::synth::{RecreationCommand, RunSpec, Synthesizer};
use crate::error::{InjectError, Step};
use crate::state::ledger::now_unix;
use crate::state::{Ledger, LedgerEntry};

/// Set by the Ctrl-C handler; read at step boundaries.
pub type CancelFlag = Arc<AtomicBool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Discovered,
    Captured,
    Stopped,
    Committed,
    Removed,
    Recreated,
    Persisted,
    LedgerEntryDeleted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Discovered => "discovered",
            Phase::Captured => "captured",
            Phase::Stopped => "stopped",
            Phase::Committed => "committed",
            Phase::Removed => "removed",
            Phase::Recreated => "recreated",
            Phase::Persisted => "persisted",
            Phase::LedgerEntryDeleted => "ledger entry deleted",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum InstrumentOutcome {
    Instrumented {
        container: String,
        image: String,
        /// Commit failed; the replacement runs from the original image.
        degraded: bool,
    },
    ComposeApplied {
        container: String,
    },
    ComposeManual(ManualInstructions),
}

#[derive(Debug, PartialEq, Eq)]
pub enum UninstrumentOutcome {
    Restored { container: String },
    ComposeRestored { container: String },
}

/// Image the commit step writes for `container`.
pub fn committed_image_name(container: &str) -> String {
    format!("{}-mw-instrumented:latest", container.to_lowercase())
}

pub struct Sequencer<'a> {
    runtime: &'a dyn ContainerRuntime,
    ledger: &'a Ledger,
    synth: Synthesizer,
    commit: bool,
    cancel: CancelFlag,
    observer: Option<&'a dyn Fn(&str, Phase)>,
}

impl<'a> Sequencer<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, ledger: &'a Ledger, synth: Synthesizer) -> Self {
        Self {
            runtime,
            ledger,
            synth,
            commit: true,
            cancel: CancelFlag::default(),
            observer: None,
        }
    }

    /// Whether to snapshot the container filesystem before replacing it.
    pub fn commit(mut self, commit: bool) -> Self {
        self.commit = commit;
        self
    }

    pub fn cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Called on every phase transition.
    pub fn observer(mut self, observer: &'a dyn Fn(&str, Phase)) -> Self {
        self.observer = Some(observer);
        self
    }

    fn enter(&self, container: &str, phase: Phase) {
        debug!(container, phase = %phase, "sequencer:phase");
        if let Some(observer) = self.observer {
            observer(container, phase);
        }
    }

    fn checkpoint(&self, next: Step) -> Result<(), InjectError> {
        if self.cancel.load(Ordering::SeqCst) {
            info!(step = %next, "sequencer:cancelled at step boundary");
            return Err(InjectError::Cancelled(next));
        }
        Ok(())
    }

    fn note_deferred_interrupt(&self, container: &str) {
        if self.cancel.load(Ordering::SeqCst) {
            warn!(
                container,
                "sequencer:interrupt deferred until the container was recreated"
            );
        }
    }

    fn still_present(&self, container: &str) -> bool {
        !matches!(
            self.runtime.inspect(container),
            Err(InjectError::NotFound(_))
        )
    }

    /// Instrument `name`. An already instrumented container is rejected unless
    /// `replace` is set, in which case it is restored first and instrumented afresh.
    pub fn instrument(
        &self,
        name: &str,
        desired: &DesiredConfig,
        replace: bool,
    ) -> Result<InstrumentOutcome, InjectError> {
        self.enter(name, Phase::Discovered);
        self.checkpoint(Step::Inspect)?;
        let mut snapshot = self.runtime.inspect(name)?;
        let container = snapshot.name.clone();

        if self.ledger.contains(&container)? {
            if !replace {
                return Err(InjectError::AlreadyInstrumented(container));
            }
            info!(container = %container, "sequencer:re-instrumenting, restoring original first");
            self.uninstrument(&container)?;
            self.checkpoint(Step::Inspect)?;
            snapshot = self.runtime.inspect(&container)?;
        }
        self.enter(&container, Phase::Captured);

        let overlay = env::build_instrumentation_env(&snapshot, desired);
        if let Some(link) = ComposeLink::from_snapshot(&snapshot) {
            return self.instrument_compose(snapshot, link, &overlay);
        }

        // Both commands are built before anything is mutated.
        let original = self.synth.original(&snapshot)?;
        let mut spec = self.synth.instrumented_spec(&snapshot, &overlay, None)?;

        self.checkpoint(Step::Stop)?;
        self.runtime
            .stop(&container)
            .map_err(|e| InjectError::mutation(&container, Step::Stop, e))?;
        self.enter(&container, Phase::Stopped);

        let mut degraded = false;
        let mut committed_image = None;
        if self.commit {
            let image = committed_image_name(&container);
            match self.runtime.commit(&container, &image) {
                Ok(()) => {
                    spec.image = image.clone();
                    committed_image = Some(image);
                    self.enter(&container, Phase::Committed);
                }
                Err(e) => {
                    degraded = true;
                    warn!(
                        container = %container,
                        error = %e,
                        "sequencer:commit failed, recreating from the original image"
                    );
                }
            }
        }

        if let Err(e) = self.runtime.remove(&container) {
            if self.still_present(&container) {
                return Err(self.abandon_after_failed_remove(&container, committed_image, e));
            }
            warn!(container = %container, error = %e, "sequencer:remove reported failure but the container is gone");
        }
        self.enter(&container, Phase::Removed);

        if let Err(e) = self.runtime.run(&spec.render()) {
            error!(container = %container, error = %e, "sequencer:recreate failed, workload is absent");
            return Err(InjectError::MutationFailed {
                container: container.clone(),
                step: Step::Recreate,
                reason: e.to_string(),
                remediation: Some(format!(
                    "the container no longer exists; recreate the original with:\n    {}",
                    original.display_with(self.runtime.program())
                )),
            });
        }
        self.enter(&container, Phase::Recreated);

        let entry = self.ledger_entry(&snapshot, Some(original.clone()), committed_image);
        if let Err(e) = self.ledger.put(entry, false) {
            error!(container = %container, error = %e, "sequencer:ledger write failed");
            return Err(InjectError::MutationFailed {
                container: container.clone(),
                step: Step::Persist,
                reason: e.to_string(),
                remediation: Some(format!(
                    "the container runs instrumented but is not recorded; to restore it, remove it and run:\n    {}",
                    original.display_with(self.runtime.program())
                )),
            });
        }
        self.enter(&container, Phase::Persisted);
        self.note_deferred_interrupt(&container);
        info!(container = %container, image = %spec.image, degraded, "sequencer:instrumented");

        Ok(InstrumentOutcome::Instrumented {
            container,
            image: spec.image,
            degraded,
        })
    }

    /// The old container survived `rm`, so it is intact: bring it back up
    /// unchanged and drop the image committed from it.
    fn abandon_after_failed_remove(
        &self,
        container: &str,
        committed_image: Option<String>,
        cause: InjectError,
    ) -> InjectError {
        if let Some(image) = &committed_image
            && let Err(e) = self.runtime.remove_image(image)
        {
            warn!(image = %image, error = %e, "sequencer:could not remove committed image");
        }
        let remediation = match self.runtime.start(container) {
            Ok(()) => {
                info!(container, "sequencer:restarted the uninstrumented container");
                format!(
                    "the original container was started again unchanged; remove it with `{} rm -f {}` and retry",
                    self.runtime.program(),
                    container
                )
            }
            Err(e) => {
                warn!(container, error = %e, "sequencer:could not restart the original container");
                format!(
                    "the container is stopped but still present; start it again with `{} start {}`",
                    self.runtime.program(),
                    container
                )
            }
        };
        InjectError::MutationFailed {
            container: container.to_string(),
            step: Step::Remove,
            reason: cause.to_string(),
            remediation: Some(remediation),
        }
    }

    fn ledger_entry(
        &self,
        snapshot: &RuntimeSnapshot,
        recreation_command: Option<RecreationCommand>,
        committed_image: Option<String>,
    ) -> LedgerEntry {
        LedgerEntry {
            container_id: snapshot.id.clone(),
            container_name: snapshot.name.clone(),
            image: snapshot.image.clone().unwrap_or_default(),
            instrumented_at: now_unix(),
            agent_path: self.synth.agent_host_path.clone(),
            original_env: env::strip_instrumentation(
                &env::parse_env(&snapshot.env),
                &self.synth.container_agent_path,
            ),
            recreation_command,
            original_config: Some(snapshot.raw.clone()),
            compose_file: None,
            compose_files: Vec::new(),
            compose_project: None,
            compose_service: None,
            compose_workdir: None,
            committed_image,
        }
    }

    fn instrument_compose(
        &self,
        snapshot: RuntimeSnapshot,
        link: ComposeLink,
        overlay: &env::EnvMap,
    ) -> Result<InstrumentOutcome, InjectError> {
        let container = snapshot.name.clone();
        let change = ComposeChange::new(
            &snapshot,
            overlay,
            &self.synth.agent_host_path,
            &self.synth.container_agent_path,
        );
        let entry = self.ledger_entry(&snapshot, self.synth.original(&snapshot).ok(), None);

        self.checkpoint(Step::Recreate)?;
        match compose::instrument(self.runtime, self.ledger, &link, change, entry)? {
            ComposeOutcome::Applied => {
                self.enter(&container, Phase::Recreated);
                self.enter(&container, Phase::Persisted);
                self.note_deferred_interrupt(&container);
                Ok(InstrumentOutcome::ComposeApplied { container })
            }
            ComposeOutcome::Manual(instructions) => Ok(InstrumentOutcome::ComposeManual(instructions)),
        }
    }

    /// Restore `name` from its ledger entry.
    pub fn uninstrument(&self, name: &str) -> Result<UninstrumentOutcome, InjectError> {
        let entry = self
            .ledger
            .get(name)?
            .ok_or_else(|| InjectError::NotInstrumentedByThisTool(name.to_string()))?;
        let container = entry.container_name.clone();
        self.enter(&container, Phase::Discovered);

        if entry.is_compose() {
            self.checkpoint(Step::Recreate)?;
            compose::uninstrument(self.runtime, self.ledger, &entry)?;
            self.enter(&container, Phase::LedgerEntryDeleted);
            return Ok(UninstrumentOutcome::ComposeRestored { container });
        }

        let Some(command) = self.usable_command(&entry) else {
            warn!(container = %container, "sequencer:no usable restore command, dropping ledger entry");
            self.ledger.delete(&container)?;
            return Err(InjectError::DegradedRestore { container });
        };

        self.checkpoint(Step::Stop)?;
        match self.runtime.stop(&container) {
            Ok(()) => self.enter(&container, Phase::Stopped),
            Err(e) => warn!(container = %container, error = %e, "sequencer:stop failed, continuing"),
        }

        if let Err(e) = self.runtime.remove(&container) {
            if self.still_present(&container) {
                return Err(InjectError::MutationFailed {
                    container: container.clone(),
                    step: Step::Remove,
                    reason: e.to_string(),
                    remediation: Some(format!(
                        "remove it with `{} rm -f {}` and run uninstrument again",
                        self.runtime.program(),
                        container
                    )),
                });
            }
            warn!(container = %container, error = %e, "sequencer:container already gone");
        }
        self.enter(&container, Phase::Removed);

        if let Err(e) = self.runtime.run(&command) {
            error!(container = %container, error = %e, "sequencer:restore failed, workload is absent");
            return Err(InjectError::MutationFailed {
                container: container.clone(),
                step: Step::Recreate,
                reason: e.to_string(),
                remediation: Some(format!(
                    "the ledger entry was kept; recreate the original with:\n    {}",
                    command.display_with(self.runtime.program())
                )),
            });
        }
        self.enter(&container, Phase::Recreated);

        self.ledger.delete(&container)?;
        self.enter(&container, Phase::LedgerEntryDeleted);

        if let Some(image) = &entry.committed_image
            && let Err(e) = self.runtime.remove_image(image)
        {
            warn!(image = %image, error = %e, "sequencer:could not remove committed image");
        }
        self.note_deferred_interrupt(&container);
        info!(container = %container, "sequencer:restored");
        Ok(UninstrumentOutcome::Restored { container })
    }

    /// The stored restore command, if it is one this tool could have written.
    fn usable_command(&self, entry: &LedgerEntry) -> Option<RecreationCommand> {
        let command = entry.recreation_command.clone().filter(|c| !c.is_empty())?;
        match RunSpec::parse(&command) {
            Ok(spec) if spec.name == entry.container_name => Some(command),
            Ok(spec) => {
                warn!(container = %entry.container_name, recorded = %spec.name, "sequencer:restore command names another container");
                None
            }
            Err(e) => {
                warn!(container = %entry.container_name, error = %e, "sequencer:restore command is malformed");
                None
            }
        }
    }
}

/// How one batch item ended when it did not fail.
pub trait BatchOutcome {
    /// Some(reason) when the operator still has to act.
    fn skip_reason(&self) -> Option<String> {
        None
    }
}

impl BatchOutcome for InstrumentOutcome {
    fn skip_reason(&self) -> Option<String> {
        match self {
            InstrumentOutcome::ComposeManual(instructions) => {
                Some(format!("manual compose change required: {}", instructions.reason))
            }
            _ => None,
        }
    }
}

impl BatchOutcome for UninstrumentOutcome {}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, InjectError)>,
    pub skipped: Vec<(String, String)>,
    /// Containers never started because of an interrupt.
    pub not_processed: Vec<String>,
}

impl BatchReport {
    pub fn interrupted(&self) -> bool {
        !self.not_processed.is_empty()
    }
}

/// Run `op` for each name. Each container finishes (or fails) before the next
/// starts, and a failure never stops the batch; an interrupt does.
pub fn run_batch<T, F>(names: &[String], cancel: &CancelFlag, mut op: F) -> BatchReport
where
    T: BatchOutcome,
    F: FnMut(&str) -> Result<T, InjectError>,
{
    let mut report = BatchReport::default();
    for (i, name) in names.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            report.not_processed = names[i..].to_vec();
            warn!(remaining = report.not_processed.len(), "batch:interrupted");
            break;
        }
        match op(name) {
            Ok(outcome) => match outcome.skip_reason() {
                Some(reason) => report.skipped.push((name.clone(), reason)),
                None => report.succeeded.push(name.clone()),
            },
            Err(e @ InjectError::Cancelled(_)) => {
                report.skipped.push((name.clone(), e.to_string()));
            }
            Err(e) if e.is_skip() || matches!(e, InjectError::DegradedRestore { .. }) => {
                report.skipped.push((name.clone(), e.to_string()));
            }
            Err(e) => {
                warn!(container = %name, error = %e, "batch:container failed");
                report.failed.push((name.clone(), e));
            }
        }
    }
    info!(
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        "batch:done"
    );
    report
}
