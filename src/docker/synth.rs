//! Command synthesis: turn a [`RuntimeSnapshot`] into an equivalent `run` invocation.
//!
//! A [`RunSpec`] is the structured form, a [`RecreationCommand`] the argv form
//! stored in the ledger and executed without a shell. Rendering is
//! deterministic: environment keys are sorted, everything else keeps snapshot
//! order. [`RunSpec::parse`] reads a rendered command back, which lets the
//! uninstrument path validate a stored command before replaying it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::docker::env::{self, EnvMap};
use crate::docker::snapshot::{Mount, PortBinding, RestartPolicy, RuntimeSnapshot};
use crate::error::InjectError;
use crate::shell;

const WILDCARD_HOST_IP: &str = "0.0.0.0";

/// Argument vector for the runtime binary, starting with `run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecreationCommand(pub Vec<String>);

impl RecreationCommand {
    pub fn args(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Values of `-e` entries that must not show up in logs or errors.
    pub fn secrets(&self) -> Vec<&str> {
        self.0
            .windows(2)
            .filter(|pair| pair[0] == "-e")
            .filter_map(|pair| pair[1].split_once('='))
            .filter(|(key, value)| env::is_secret_key(key) && !value.is_empty())
            .map(|(_, value)| value)
            .collect()
    }

    /// Copy-pasteable form, e.g. for remediation text.
    pub fn display_with(&self, program: &str) -> String {
        shell::join_command(program, &self.0)
    }
}

impl fmt::Display for RecreationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_with("docker"))
    }
}

/// Everything a `run` invocation needs to launch a container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunSpec {
    pub name: String,
    pub env: EnvMap,
    pub mounts: Vec<Mount>,
    /// Host IPs are always explicit here; a missing one became the wildcard.
    pub ports: Vec<PortBinding>,
    pub networks: Vec<String>,
    pub restart: Option<RestartPolicy>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    /// First entrypoint element; the remainder travels in `args`.
    pub entrypoint: Option<String>,
    pub image: String,
    /// Opaque trailing tokens after the image.
    pub args: Vec<String>,
}

impl RunSpec {
    fn from_snapshot(snapshot: &RuntimeSnapshot, env: EnvMap, image: String) -> Self {
        let ports = snapshot
            .ports
            .iter()
            .map(|p| PortBinding {
                container_port: p.container_port.clone(),
                host_ip: Some(
                    p.host_ip
                        .clone()
                        .unwrap_or_else(|| WILDCARD_HOST_IP.to_string()),
                ),
                host_port: p.host_port.clone(),
            })
            .collect();

        let restart = snapshot
            .restart_policy
            .as_ref()
            .filter(|p| p.name != "no")
            .cloned();

        let (entrypoint, mut args) = match snapshot.entrypoint.split_first() {
            Some((first, rest)) => (Some(first.clone()), rest.to_vec()),
            None => (None, Vec::new()),
        };
        args.extend(snapshot.cmd.iter().cloned());

        RunSpec {
            name: snapshot.name.clone(),
            env,
            mounts: snapshot.mounts.clone(),
            ports,
            networks: snapshot.networks.clone(),
            restart,
            workdir: snapshot.working_dir.clone(),
            user: snapshot.user.clone(),
            entrypoint,
            image,
            args,
        }
    }

    pub fn render(&self) -> RecreationCommand {
        let mut argv: Vec<String> = vec!["run".into(), "-d".into(), "--name".into(), self.name.clone()];

        for (key, value) in &self.env {
            argv.push("-e".into());
            argv.push(format!("{}={}", key, value));
        }
        for mount in &self.mounts {
            argv.push("-v".into());
            argv.push(render_mount(mount));
        }
        for port in &self.ports {
            argv.push("-p".into());
            argv.push(render_port(port));
        }
        for network in &self.networks {
            argv.push("--network".into());
            argv.push(network.clone());
        }
        if let Some(policy) = &self.restart {
            argv.push("--restart".into());
            argv.push(render_restart(policy));
        }
        if let Some(dir) = &self.workdir {
            argv.push("--workdir".into());
            argv.push(dir.clone());
        }
        if let Some(user) = &self.user {
            argv.push("--user".into());
            argv.push(user.clone());
        }
        if let Some(entrypoint) = &self.entrypoint {
            argv.push("--entrypoint".into());
            argv.push(entrypoint.clone());
        }
        argv.push(self.image.clone());
        argv.extend(self.args.iter().cloned());

        RecreationCommand(argv)
    }

    /// Read back a command produced by [`RunSpec::render`]. Anything else is rejected.
    pub fn parse(command: &RecreationCommand) -> Result<Self, InjectError> {
        let mut tokens = command.args().iter();
        match tokens.next().map(String::as_str) {
            Some("run") => {}
            Some(other) => {
                return Err(InjectError::InvalidCommand(format!(
                    "expected `run`, found `{}`",
                    other
                )));
            }
            None => return Err(InjectError::InvalidCommand("empty command".into())),
        }

        let mut spec = RunSpec::default();
        let mut detached = false;
        let mut image = None;

        while let Some(token) = tokens.next() {
            if !token.starts_with('-') {
                image = Some(token.clone());
                break;
            }
            if token == "-d" {
                detached = true;
                continue;
            }
            let value = tokens
                .next()
                .ok_or_else(|| InjectError::InvalidCommand(format!("`{}` needs a value", token)))?
                .clone();
            match token.as_str() {
                "--name" => spec.name = value,
                "-e" => {
                    let (key, val) = value.split_once('=').ok_or_else(|| {
                        InjectError::InvalidCommand(format!("malformed env entry `{}`", value))
                    })?;
                    spec.env.insert(key.to_string(), val.to_string());
                }
                "-v" => spec.mounts.push(parse_mount(&value)?),
                "-p" => spec.ports.push(parse_port(&value)?),
                "--network" => spec.networks.push(value),
                "--restart" => spec.restart = Some(parse_restart(&value)?),
                "--workdir" => spec.workdir = Some(value),
                "--user" => spec.user = Some(value),
                "--entrypoint" => spec.entrypoint = Some(value),
                other => {
                    return Err(InjectError::InvalidCommand(format!(
                        "unsupported flag `{}`",
                        other
                    )));
                }
            }
        }

        if !detached {
            return Err(InjectError::InvalidCommand("missing `-d`".into()));
        }
        if spec.name.is_empty() {
            return Err(InjectError::InvalidCommand("missing `--name`".into()));
        }
        spec.image =
            image.ok_or_else(|| InjectError::InvalidCommand("missing image reference".into()))?;
        spec.args = tokens.cloned().collect();
        Ok(spec)
    }
}

fn render_mount(mount: &Mount) -> String {
    let mode = if mount.read_only { "ro" } else { "rw" };
    format!("{}:{}:{}", mount.source, mount.destination, mode)
}

fn parse_mount(value: &str) -> Result<Mount, InjectError> {
    let mut parts = value.rsplitn(3, ':');
    let (Some(mode), Some(destination), Some(source)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(InjectError::InvalidCommand(format!(
            "malformed mount `{}`",
            value
        )));
    };
    let read_only = match mode {
        "ro" => true,
        "rw" => false,
        _ => {
            return Err(InjectError::InvalidCommand(format!(
                "unknown mount mode in `{}`",
                value
            )));
        }
    };
    Ok(Mount {
        source: source.to_string(),
        destination: destination.to_string(),
        read_only,
    })
}

fn render_port(port: &PortBinding) -> String {
    let ip = port.host_ip.as_deref().unwrap_or(WILDCARD_HOST_IP);
    let ip = if ip.contains(':') {
        format!("[{}]", ip)
    } else {
        ip.to_string()
    };
    format!("{}:{}:{}", ip, port.host_port, port.container_port)
}

fn parse_port(value: &str) -> Result<PortBinding, InjectError> {
    let malformed = || InjectError::InvalidCommand(format!("malformed port `{}`", value));

    let (ip, rest) = match value.strip_prefix('[') {
        Some(bracketed) => {
            let (ip, rest) = bracketed.split_once("]:").ok_or_else(malformed)?;
            (ip.to_string(), rest)
        }
        None => {
            let (ip, rest) = value.split_once(':').ok_or_else(malformed)?;
            (ip.to_string(), rest)
        }
    };
    let (host_port, container_port) = rest.split_once(':').ok_or_else(malformed)?;
    if container_port.is_empty() {
        return Err(malformed());
    }
    Ok(PortBinding {
        container_port: container_port.to_string(),
        host_ip: Some(ip),
        host_port: host_port.to_string(),
    })
}

fn render_restart(policy: &RestartPolicy) -> String {
    if policy.name == "on-failure" && policy.maximum_retry_count > 0 {
        format!("{}:{}", policy.name, policy.maximum_retry_count)
    } else {
        policy.name.clone()
    }
}

fn parse_restart(value: &str) -> Result<RestartPolicy, InjectError> {
    let malformed = || InjectError::InvalidCommand(format!("malformed restart policy `{}`", value));
    let (name, maximum_retry_count) = match value.split_once(':') {
        Some((name, count)) => (name, count.parse().map_err(|_| malformed())?),
        None => (value, 0),
    };
    if name.is_empty() {
        return Err(malformed());
    }
    Ok(RestartPolicy {
        name: name.to_string(),
        maximum_retry_count,
    })
}

/// Builds the original and instrumented commands for one agent setup.
#[derive(Debug, Clone)]
pub struct Synthesizer {
    /// Agent JAR on the host, bind-mounted into instrumented containers.
    pub agent_host_path: String,
    pub container_agent_path: String,
}

impl Synthesizer {
    pub fn new(agent_host_path: impl Into<String>, container_agent_path: impl Into<String>) -> Self {
        Self {
            agent_host_path: agent_host_path.into(),
            container_agent_path: container_agent_path.into(),
        }
    }

    fn base(&self, snapshot: &RuntimeSnapshot) -> Result<(EnvMap, String), InjectError> {
        let image = snapshot.image.clone().ok_or_else(|| {
            InjectError::InvalidSnapshot(format!("container {} has no image reference", snapshot.name))
        })?;
        let env = env::strip_instrumentation(
            &env::parse_env(&snapshot.env),
            &self.container_agent_path,
        );
        Ok((env, image))
    }

    fn without_agent_mount(&self, spec: &mut RunSpec) {
        spec.mounts
            .retain(|m| m.destination != self.container_agent_path);
    }

    /// The restore command: snapshot image, no instrumentation artifacts.
    pub fn original_spec(&self, snapshot: &RuntimeSnapshot) -> Result<RunSpec, InjectError> {
        let (env, image) = self.base(snapshot)?;
        let mut spec = RunSpec::from_snapshot(snapshot, env, image);
        self.without_agent_mount(&mut spec);
        Ok(spec)
    }

    pub fn original(&self, snapshot: &RuntimeSnapshot) -> Result<RecreationCommand, InjectError> {
        Ok(self.original_spec(snapshot)?.render())
    }

    /// The instrumented command: filtered env plus `overlay`, the agent mounted read-only
    /// exactly once, optionally targeting `image_override`.
    pub fn instrumented_spec(
        &self,
        snapshot: &RuntimeSnapshot,
        overlay: &EnvMap,
        image_override: Option<&str>,
    ) -> Result<RunSpec, InjectError> {
        let (base, image) = self.base(snapshot)?;
        let env = env::apply_overlay(&base, overlay);
        let image = image_override.map(str::to_string).unwrap_or(image);
        let mut spec = RunSpec::from_snapshot(snapshot, env, image);
        self.without_agent_mount(&mut spec);
        spec.mounts.push(Mount {
            source: self.agent_host_path.clone(),
            destination: self.container_agent_path.clone(),
            read_only: true,
        });
        Ok(spec)
    }
}
