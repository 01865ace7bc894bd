//! Container runtime control.
//!
//! The sequencer only talks to [`ContainerRuntime`]; [`DockerCli`] drives the
//! `docker` (or `podman`) binary, every call bounded by a timeout.

use std::time::Duration;

use tracing::debug;

use crate::cmd::{Cmd, CmdError};
use crate::config::RuntimeKind;
use crate::docker::compose::ComposeLink;
use crate::docker::snapshot::RuntimeSnapshot;
use crate::docker::synth::RecreationCommand;
use crate::error::InjectError;

/// Opaque runtime operations. Argument construction belongs to the synthesizer.
pub trait ContainerRuntime {
    /// Binary name, used when showing commands to the operator.
    fn program(&self) -> &str;

    fn inspect(&self, container: &str) -> Result<RuntimeSnapshot, InjectError>;

    fn stop(&self, container: &str) -> Result<(), InjectError>;

    fn start(&self, container: &str) -> Result<(), InjectError>;

    /// Snapshot the container filesystem into `image`.
    fn commit(&self, container: &str, image: &str) -> Result<(), InjectError>;

    fn remove(&self, container: &str) -> Result<(), InjectError>;

    /// Execute a recreation command; returns the new container id.
    fn run(&self, command: &RecreationCommand) -> Result<String, InjectError>;

    fn remove_image(&self, image: &str) -> Result<(), InjectError>;

    /// Names of running containers.
    fn list_containers(&self) -> Result<Vec<String>, InjectError>;

    /// Reconcile one compose service after its descriptor changed.
    fn compose_up(&self, link: &ComposeLink) -> Result<(), InjectError>;
}

pub struct DockerCli {
    program: String,
    compose: Vec<String>,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(kind: RuntimeKind, compose_command: Option<&str>, timeout: Duration) -> Self {
        let program = kind.binary().to_string();
        let compose = match compose_command.map(str::trim).filter(|c| !c.is_empty()) {
            Some(custom) => custom.split_whitespace().map(str::to_string).collect(),
            None if which::which("docker-compose").is_ok() && kind == RuntimeKind::Docker => {
                vec!["docker-compose".to_string()]
            }
            None => vec![program.clone(), "compose".to_string()],
        };
        debug!(program = %program, compose = ?compose, timeout_secs = timeout.as_secs(), "runtime:init");
        Self {
            program,
            compose,
            timeout,
        }
    }

    fn cmd(&self) -> Cmd {
        Cmd::new(&self.program).timeout(self.timeout)
    }

    fn compose_cmd(&self, link: &ComposeLink) -> Result<Cmd, InjectError> {
        let Some((program, prefix)) = self.compose.split_first() else {
            return Err(InjectError::Runtime("no compose command configured".into()));
        };
        Ok(Cmd::new(program)
            .args(prefix.iter().cloned())
            .args(link.up_args())
            .workdir(&link.workdir)
            .timeout(self.timeout))
    }
}

fn is_no_such(err: &CmdError) -> bool {
    err.stderr().to_lowercase().contains("no such")
}

impl ContainerRuntime for DockerCli {
    fn program(&self) -> &str {
        &self.program
    }

    fn inspect(&self, container: &str) -> Result<RuntimeSnapshot, InjectError> {
        let output = self
            .cmd()
            .args(["inspect", "--type", "container", container])
            .run_and_capture_stdout()
            .map_err(|e| match e {
                ref failed if is_no_such(failed) => {
                    InjectError::NotFound(format!("container {}", container))
                }
                CmdError::Timeout { command, secs } => InjectError::Timeout { command, secs },
                other => InjectError::InspectionFailed {
                    container: container.to_string(),
                    reason: other.to_string(),
                },
            })?;
        RuntimeSnapshot::from_inspect_output(container, &output)
    }

    fn stop(&self, container: &str) -> Result<(), InjectError> {
        self.cmd().args(["stop", container]).run()?;
        Ok(())
    }

    fn start(&self, container: &str) -> Result<(), InjectError> {
        self.cmd().args(["start", container]).run()?;
        Ok(())
    }

    fn commit(&self, container: &str, image: &str) -> Result<(), InjectError> {
        self.cmd().args(["commit", container, image]).run()?;
        Ok(())
    }

    fn remove(&self, container: &str) -> Result<(), InjectError> {
        self.cmd().args(["rm", container]).run()?;
        Ok(())
    }

    fn run(&self, command: &RecreationCommand) -> Result<String, InjectError> {
        Ok(self
            .cmd()
            .args(command.args())
            .redact(command.secrets())
            .run_and_capture_stdout()?)
    }

    fn remove_image(&self, image: &str) -> Result<(), InjectError> {
        self.cmd().args(["rmi", image]).run()?;
        Ok(())
    }

    fn list_containers(&self) -> Result<Vec<String>, InjectError> {
        let output = self
            .cmd()
            .args(["ps", "--format", "{{.Names}}"])
            .run_and_capture_stdout()?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn compose_up(&self, link: &ComposeLink) -> Result<(), InjectError> {
        self.compose_cmd(link)?.run()?;
        Ok(())
    }
}
