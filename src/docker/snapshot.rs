//! Typed capture of a container's runtime configuration.
//!
//! `docker inspect` returns a loosely structured document; it is parsed once
//! here into a [`RuntimeSnapshot`] with explicit optional fields so nothing
//! downstream performs untyped lookups. Absent sections (no mounts, no ports,
//! `null` command) are normal and produce empty collections.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

use crate::error::InjectError;

/// Networks a container joins implicitly; never re-specified on recreation.
pub const IMPLICIT_NETWORKS: &[&str] = &["bridge", "default"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Host path for bind mounts, volume name for named volumes.
    pub source: String,
    pub destination: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    /// Container side including protocol, e.g. `8080/tcp`.
    pub container_port: String,
    pub host_ip: Option<String>,
    /// Empty when the runtime picked a random host port.
    pub host_port: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub name: String,
    pub maximum_retry_count: u32,
}

/// Immutable point-in-time capture of a container. Each inspection yields a new one.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuntimeSnapshot {
    pub id: String,
    pub name: String,
    pub image: Option<String>,
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortBinding>,
    /// Explicitly attached networks, sorted, implicit ones excluded.
    pub networks: Vec<String>,
    pub restart_policy: Option<RestartPolicy>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub running: bool,
    /// The inspect document this snapshot was parsed from.
    pub raw: serde_json::Value,
}

impl RuntimeSnapshot {
    /// Parse the output of `docker inspect <container>`.
    pub fn from_inspect_output(container: &str, output: &str) -> Result<Self, InjectError> {
        let documents: Vec<serde_json::Value> =
            serde_json::from_str(output).map_err(|e| InjectError::InspectionFailed {
                container: container.to_string(),
                reason: format!("unparseable inspect output: {}", e),
            })?;

        let raw = documents
            .into_iter()
            .next()
            .ok_or_else(|| InjectError::NotFound(format!("container {}", container)))?;

        Self::from_inspect_value(container, raw)
    }

    pub fn from_inspect_value(container: &str, raw: serde_json::Value) -> Result<Self, InjectError> {
        let doc: InspectDocument =
            serde_json::from_value(raw.clone()).map_err(|e| InjectError::InspectionFailed {
                container: container.to_string(),
                reason: format!("unexpected inspect document: {}", e),
            })?;

        let config = doc.config.unwrap_or_default();
        let host_config = doc.host_config.unwrap_or_default();
        let network_settings = doc.network_settings.unwrap_or_default();

        let mounts = doc
            .mounts
            .unwrap_or_default()
            .into_iter()
            .filter_map(InspectMount::into_mount)
            .collect();

        // HostConfig reflects what was requested and survives a stopped container;
        // NetworkSettings only describes a running one.
        let ports = match host_config.port_bindings.filter(|b| !b.is_empty()) {
            Some(bindings) => flatten_bindings(bindings, false),
            None => flatten_bindings(network_settings.ports.unwrap_or_default(), true),
        };

        let mut networks: Vec<String> = network_settings
            .networks
            .unwrap_or_default()
            .into_keys()
            .filter(|n| !IMPLICIT_NETWORKS.contains(&n.as_str()))
            .collect();
        networks.sort();

        let restart_policy = host_config
            .restart_policy
            .and_then(|p| {
                let name = p.name.unwrap_or_default();
                (!name.is_empty()).then_some(RestartPolicy {
                    name,
                    maximum_retry_count: p.maximum_retry_count.unwrap_or(0),
                })
            });

        Ok(RuntimeSnapshot {
            id: doc.id,
            name: doc.name.trim_start_matches('/').to_string(),
            image: config.image.filter(|i| !i.is_empty()),
            env: config.env.unwrap_or_default(),
            mounts,
            ports,
            networks,
            restart_policy,
            working_dir: config.working_dir.filter(|w| !w.is_empty()),
            user: config.user.filter(|u| !u.is_empty()),
            entrypoint: config.entrypoint.unwrap_or_default(),
            cmd: config.cmd.unwrap_or_default(),
            labels: config.labels.unwrap_or_default().into_iter().collect(),
            running: doc.state.and_then(|s| s.running).unwrap_or(false),
            raw,
        })
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

fn flatten_bindings(
    ports: HashMap<String, Option<Vec<InspectPortBinding>>>,
    first_only: bool,
) -> Vec<PortBinding> {
    let mut keys: Vec<_> = ports.into_iter().collect();
    keys.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::new();
    for (container_port, bindings) in keys {
        let bindings = bindings.unwrap_or_default();
        let take = if first_only { 1 } else { bindings.len() };
        for binding in bindings.into_iter().take(take) {
            out.push(PortBinding {
                container_port: container_port.clone(),
                host_ip: binding.host_ip.filter(|ip| !ip.is_empty()),
                host_port: binding.host_port.unwrap_or_default(),
            });
        }
    }
    out
}

// --- inspect document shape ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectDocument {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    config: Option<InspectConfig>,
    host_config: Option<InspectHostConfig>,
    network_settings: Option<InspectNetworkSettings>,
    mounts: Option<Vec<InspectMount>>,
    state: Option<InspectState>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: Option<String>,
    env: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
    entrypoint: Option<Vec<String>>,
    working_dir: Option<String>,
    user: Option<String>,
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    restart_policy: Option<InspectRestartPolicy>,
    port_bindings: Option<HashMap<String, Option<Vec<InspectPortBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRestartPolicy {
    name: Option<String>,
    maximum_retry_count: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    ports: Option<HashMap<String, Option<Vec<InspectPortBinding>>>>,
    networks: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectPortBinding {
    host_ip: Option<String>,
    host_port: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectMount {
    #[serde(rename = "Type")]
    kind: Option<String>,
    name: Option<String>,
    source: Option<String>,
    destination: Option<String>,
    #[serde(rename = "RW")]
    rw: Option<bool>,
}

impl InspectMount {
    fn into_mount(self) -> Option<Mount> {
        let destination = self.destination.filter(|d| !d.is_empty())?;
        let source = match (self.kind.as_deref(), self.name) {
            (Some("volume"), Some(name)) if !name.is_empty() => name,
            _ => self.source.filter(|s| !s.is_empty())?,
        };
        Some(Mount {
            source,
            destination,
            read_only: !self.rw.unwrap_or(true),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: Option<bool>,
}
