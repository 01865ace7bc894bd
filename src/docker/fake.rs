//! In-memory [`ContainerRuntime`] that records every call.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::docker::compose::ComposeLink;
use crate::docker::runtime::ContainerRuntime;
use crate::docker::snapshot::RuntimeSnapshot;
use crate::docker::synth::{RecreationCommand, RunSpec};
use crate::error::InjectError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Inspect(String),
    Stop(String),
    Start(String),
    Commit(String, String),
    Remove(String),
    Run(RecreationCommand),
    RemoveImage(String),
    List,
    ComposeUp {
        project: Option<String>,
        files: Vec<PathBuf>,
        service: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    Stop,
    Start,
    Commit,
    Remove,
    Run,
    ComposeUp,
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Error,
    Timeout,
}

#[derive(Default)]
struct FakeState {
    containers: BTreeMap<String, RuntimeSnapshot>,
    images: BTreeSet<String>,
    calls: Vec<Call>,
    failures: BTreeMap<(Op, String), Failure>,
    next_id: u32,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: RefCell<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, snapshot: RuntimeSnapshot) -> Self {
        self.add(snapshot);
        self
    }

    pub fn add(&self, snapshot: RuntimeSnapshot) {
        self.state
            .borrow_mut()
            .containers
            .insert(snapshot.name.clone(), snapshot);
    }

    /// Make `op` fail for `name` (container name, or service name for compose).
    pub fn fail(&self, op: Op, name: &str) {
        self.state
            .borrow_mut()
            .failures
            .insert((op, name.to_string()), Failure::Error);
    }

    /// Make `op` for `name` run into the runtime call timeout.
    pub fn time_out(&self, op: Op, name: &str) {
        self.state
            .borrow_mut()
            .failures
            .insert((op, name.to_string()), Failure::Timeout);
    }

    pub fn heal(&self, op: Op, name: &str) {
        self.state
            .borrow_mut()
            .failures
            .remove(&(op, name.to_string()));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn runs(&self) -> Vec<RecreationCommand> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Run(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    pub fn container(&self, name: &str) -> Option<RuntimeSnapshot> {
        self.state.borrow().containers.get(name).cloned()
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state.borrow().images.contains(image)
    }

    fn record(&self, call: Call) {
        self.state.borrow_mut().calls.push(call);
    }

    fn check(&self, op: Op, name: &str) -> Result<(), InjectError> {
        match self.state.borrow().failures.get(&(op, name.to_string())) {
            None => Ok(()),
            Some(Failure::Error) => Err(InjectError::Runtime(format!(
                "injected {:?} failure for {}",
                op, name
            ))),
            Some(Failure::Timeout) => Err(InjectError::Timeout {
                command: format!("docker {:?} {}", op, name).to_lowercase(),
                secs: 300,
            }),
        }
    }

    fn require(&self, name: &str) -> Result<(), InjectError> {
        if self.state.borrow().containers.contains_key(name) {
            Ok(())
        } else {
            Err(InjectError::Runtime(format!(
                "Error: No such container: {}",
                name
            )))
        }
    }
}

fn snapshot_from_spec(spec: RunSpec, id: String) -> RuntimeSnapshot {
    RuntimeSnapshot {
        id,
        name: spec.name,
        image: Some(spec.image),
        env: spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect(),
        mounts: spec.mounts,
        ports: spec.ports,
        networks: spec.networks,
        restart_policy: spec.restart,
        working_dir: spec.workdir,
        user: spec.user,
        entrypoint: spec.entrypoint.into_iter().collect(),
        cmd: spec.args,
        running: true,
        ..Default::default()
    }
}

impl ContainerRuntime for FakeRuntime {
    fn program(&self) -> &str {
        "docker"
    }

    fn inspect(&self, container: &str) -> Result<RuntimeSnapshot, InjectError> {
        self.record(Call::Inspect(container.to_string()));
        self.container(container)
            .ok_or_else(|| InjectError::NotFound(format!("container {}", container)))
    }

    fn stop(&self, container: &str) -> Result<(), InjectError> {
        self.record(Call::Stop(container.to_string()));
        self.check(Op::Stop, container)?;
        self.require(container)?;
        if let Some(c) = self.state.borrow_mut().containers.get_mut(container) {
            c.running = false;
        }
        Ok(())
    }

    fn start(&self, container: &str) -> Result<(), InjectError> {
        self.record(Call::Start(container.to_string()));
        self.check(Op::Start, container)?;
        self.require(container)?;
        if let Some(c) = self.state.borrow_mut().containers.get_mut(container) {
            c.running = true;
        }
        Ok(())
    }

    fn commit(&self, container: &str, image: &str) -> Result<(), InjectError> {
        self.record(Call::Commit(container.to_string(), image.to_string()));
        self.check(Op::Commit, container)?;
        self.require(container)?;
        self.state.borrow_mut().images.insert(image.to_string());
        Ok(())
    }

    fn remove(&self, container: &str) -> Result<(), InjectError> {
        self.record(Call::Remove(container.to_string()));
        self.check(Op::Remove, container)?;
        self.require(container)?;
        self.state.borrow_mut().containers.remove(container);
        Ok(())
    }

    fn run(&self, command: &RecreationCommand) -> Result<String, InjectError> {
        self.record(Call::Run(command.clone()));
        let spec = RunSpec::parse(command)?;
        self.check(Op::Run, &spec.name)?;
        let mut state = self.state.borrow_mut();
        if state.containers.contains_key(&spec.name) {
            return Err(InjectError::Runtime(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }
        state.next_id += 1;
        let id = format!("fake{:04}", state.next_id);
        let snapshot = snapshot_from_spec(spec, id.clone());
        state.containers.insert(snapshot.name.clone(), snapshot);
        Ok(id)
    }

    fn remove_image(&self, image: &str) -> Result<(), InjectError> {
        self.record(Call::RemoveImage(image.to_string()));
        self.state.borrow_mut().images.remove(image);
        Ok(())
    }

    fn list_containers(&self) -> Result<Vec<String>, InjectError> {
        self.record(Call::List);
        Ok(self
            .state
            .borrow()
            .containers
            .values()
            .filter(|c| c.running)
            .map(|c| c.name.clone())
            .collect())
    }

    fn compose_up(&self, link: &ComposeLink) -> Result<(), InjectError> {
        self.record(Call::ComposeUp {
            project: link.project.clone(),
            files: link.files.clone(),
            service: link.service.clone(),
        });
        self.check(Op::ComposeUp, &link.service)
    }
}
