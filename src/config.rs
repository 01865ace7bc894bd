use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::docker::env::{DEFAULT_CONTAINER_AGENT_PATH, DesiredConfig};

pub const CONFIG_ENV_VAR: &str = "JAVA_INJECTOR_CONFIG";

const DEFAULT_TARGET: &str = "https://prod.middleware.io:443";
const DEFAULT_AGENT_PATH: &str = "/opt/middleware/agents/middleware-javaagent-1.8.1.jar";
const DEFAULT_STATE_DIRECTORY: &str = "/etc/java-injector/state";
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_LOG_LEVEL: &str = "info";
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Middleware.io connection settings
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct MiddlewareConfig {
    pub api_key: Option<String>,
    /// Ingestion endpoint. Default: https://prod.middleware.io:443
    pub target: Option<String>,
}

/// Java agent location
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct AgentConfig {
    /// Agent JAR on the host.
    pub path: Option<PathBuf>,
    /// Where the JAR is mounted inside containers.
    pub container_path: Option<String>,
}

/// Service naming
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Fixed service name. Derived from the container when unset.
    pub name: Option<String>,
    pub name_prefix: Option<String>,
    pub name_suffix: Option<String>,
    /// Deployment environment, exported as MW_ENVIRONMENT when set.
    pub environment: Option<String>,
}

/// Container runtime binary
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Docker (default)
    #[default]
    Docker,
    /// Podman
    Podman,
}

impl RuntimeKind {
    pub fn binary(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Podman => "podman",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct DockerConfig {
    pub runtime: Option<RuntimeKind>,
    /// e.g. "docker compose". Auto-detected when unset.
    pub compose_command: Option<String>,
    /// Commit the container filesystem before replacing it. Default: true
    pub commit: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error. Default: info
    pub level: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct AdvancedConfig {
    /// Bound on every runtime call. Default: 300
    pub timeout_secs: Option<u64>,
    /// Where the ledger lives. Default: /etc/java-injector/state
    pub state_directory: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub middleware: MiddlewareConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub advanced: AdvancedConfig,
}

/// Values given on the command line; they win over file and environment.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub api_key: Option<String>,
    pub target: Option<String>,
    pub agent_path: Option<PathBuf>,
    pub service_name: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl Config {
    /// Candidate config files, in priority order, after `--config` and the env var.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("java-injector.yaml"),
            PathBuf::from("java-injector.yml"),
            PathBuf::from("/etc/java-injector/config.yaml"),
            PathBuf::from("/etc/java-injector/config.yml"),
        ];
        if let Some(home_dir) = home::home_dir() {
            paths.push(home_dir.join(".config/java-injector/config.yaml"));
            paths.push(home_dir.join(".config/java-injector/config.yml"));
        }
        paths
    }

    /// The file that would be loaded, if any.
    pub fn locate(explicit: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if !path.exists() {
                anyhow::bail!("Config file {} does not exist", path.display());
            }
            return Ok(Some(path.to_path_buf()));
        }
        if let Ok(path) = env::var(CONFIG_ENV_VAR)
            && !path.trim().is_empty()
        {
            let path = PathBuf::from(path);
            if !path.exists() {
                anyhow::bail!(
                    "{} points to {}, which does not exist",
                    CONFIG_ENV_VAR,
                    path.display()
                );
            }
            return Ok(Some(path));
        }
        Ok(Self::search_paths().into_iter().find(|p| p.exists()))
    }

    /// Load the effective configuration: file (or defaults), then environment overrides.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        debug!("config:loading");
        let location = Self::locate(explicit)?;
        let mut config = match &location {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| env::var(key).ok());
        debug!(
            path = ?location,
            runtime = ?config.runtime(),
            has_api_key = config.api_key().is_some(),
            "config:loaded"
        );
        Ok((config, location))
    }

    fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config at {}: {}", path.display(), e))
    }

    /// Apply `MW_*` environment overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("MW_API_KEY") {
            self.middleware.api_key = Some(v);
        }
        if let Some(v) = get("MW_TARGET") {
            self.middleware.target = Some(v);
        }
        if let Some(v) = get("MW_AGENT_PATH") {
            self.agent.path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("MW_SERVICE_NAME") {
            self.service.name = Some(v);
        }
        if let Some(v) = get("MW_ENVIRONMENT") {
            self.service.environment = Some(v);
        }
        if let Some(v) = get("MW_LOG_LEVEL") {
            self.logging.level = Some(v);
        }
    }

    pub fn apply_cli_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(v) = &overrides.api_key {
            self.middleware.api_key = Some(v.clone());
        }
        if let Some(v) = &overrides.target {
            self.middleware.target = Some(v.clone());
        }
        if let Some(v) = &overrides.agent_path {
            self.agent.path = Some(v.clone());
        }
        if let Some(v) = &overrides.service_name {
            self.service.name = Some(v.clone());
        }
    }

    /// Checks that hold for every command.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.advanced.timeout_secs == Some(0) {
            anyhow::bail!("advanced.timeout_secs must be positive");
        }
        if let Some(level) = &self.logging.level
            && !LOG_LEVELS.contains(&level.to_lowercase().as_str())
        {
            anyhow::bail!(
                "Invalid log level '{}' (valid: {})",
                level,
                LOG_LEVELS.join(", ")
            );
        }
        Ok(())
    }

    /// Checks needed before anything gets instrumented.
    pub fn validate_for_instrument(&self) -> anyhow::Result<()> {
        self.validate()?;
        if self.api_key().is_none() {
            anyhow::bail!(
                "middleware.api_key is required. Set it in the config file, MW_API_KEY, or --api-key"
            );
        }
        if non_empty(Some(self.target())).is_none() {
            anyhow::bail!("middleware.target must not be empty");
        }
        Ok(())
    }

    pub fn api_key(&self) -> Option<&str> {
        non_empty(self.middleware.api_key.as_deref())
    }

    pub fn target(&self) -> &str {
        self.middleware.target.as_deref().unwrap_or(DEFAULT_TARGET)
    }

    pub fn agent_path(&self) -> &Path {
        self.agent
            .path
            .as_deref()
            .unwrap_or(Path::new(DEFAULT_AGENT_PATH))
    }

    pub fn container_agent_path(&self) -> &str {
        non_empty(self.agent.container_path.as_deref()).unwrap_or(DEFAULT_CONTAINER_AGENT_PATH)
    }

    pub fn runtime(&self) -> RuntimeKind {
        self.docker.runtime.unwrap_or_default()
    }

    pub fn compose_command(&self) -> Option<&str> {
        non_empty(self.docker.compose_command.as_deref())
    }

    pub fn commit(&self) -> bool {
        self.docker.commit.unwrap_or(true)
    }

    /// Lowercased, ready for an `EnvFilter`.
    pub fn log_level(&self) -> String {
        self.logging
            .level
            .as_deref()
            .unwrap_or(DEFAULT_LOG_LEVEL)
            .to_lowercase()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.advanced.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    pub fn state_directory(&self) -> PathBuf {
        self.advanced
            .state_directory
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIRECTORY))
    }

    /// What gets injected into containers.
    pub fn desired(&self) -> DesiredConfig {
        DesiredConfig {
            api_key: self.api_key().unwrap_or_default().to_string(),
            target: self.target().to_string(),
            service_name: non_empty(self.service.name.as_deref()).map(str::to_string),
            container_agent_path: self.container_agent_path().to_string(),
            deployment_environment: non_empty(self.service.environment.as_deref())
                .map(str::to_string),
            service_name_prefix: non_empty(self.service.name_prefix.as_deref())
                .map(str::to_string),
            service_name_suffix: non_empty(self.service.name_suffix.as_deref())
                .map(str::to_string),
        }
    }

    /// Copy with the API key masked, for display.
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        if let Some(key) = copy.middleware.api_key.as_mut() {
            *key = mask_secret(key);
        }
        copy
    }

    /// Effective settings with defaults filled in, as YAML.
    pub fn effective_yaml(&self) -> anyhow::Result<String> {
        let resolved = Config {
            middleware: MiddlewareConfig {
                api_key: self.middleware.api_key.clone(),
                target: Some(self.target().to_string()),
            },
            agent: AgentConfig {
                path: Some(self.agent_path().to_path_buf()),
                container_path: Some(self.container_agent_path().to_string()),
            },
            service: self.service.clone(),
            docker: DockerConfig {
                runtime: Some(self.runtime()),
                compose_command: self.docker.compose_command.clone(),
                commit: Some(self.commit()),
            },
            logging: LoggingConfig {
                level: Some(self.log_level()),
            },
            advanced: AdvancedConfig {
                timeout_secs: Some(self.timeout().as_secs()),
                state_directory: Some(self.state_directory()),
            },
        };
        Ok(serde_yaml::to_string(&resolved.masked())?)
    }

    /// Write a commented template to `path`. Never overwrites.
    pub fn init(path: &Path) -> anyhow::Result<()> {
        if path.exists() {
            return Err(anyhow::anyhow!(
                "{} already exists. Remove it first if you want to regenerate it.",
                path.display()
            ));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, CONFIG_TEMPLATE)?;
        Ok(())
    }
}

fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 8), tail)
}

const CONFIG_TEMPLATE: &str = r#"# java-injector configuration
#
# Looked up in this order (first match wins):
#   --config <path>
#   $JAVA_INJECTOR_CONFIG
#   ./java-injector.yaml
#   /etc/java-injector/config.yaml
#   ~/.config/java-injector/config.yaml
#
# MW_API_KEY, MW_TARGET, MW_AGENT_PATH, MW_SERVICE_NAME, MW_ENVIRONMENT and
# MW_LOG_LEVEL override the values below.

#-------------------------------------------------------------------------------
# Middleware
#-------------------------------------------------------------------------------

middleware:
  api_key: "your-api-key-here"
  # target: "https://prod.middleware.io:443"

#-------------------------------------------------------------------------------
# Agent
#-------------------------------------------------------------------------------

# agent:
#   # JAR on the host, bind-mounted read-only into containers.
#   path: /opt/middleware/agents/middleware-javaagent-1.8.1.jar
#   container_path: /opt/middleware/agents/middleware-javaagent.jar

#-------------------------------------------------------------------------------
# Service naming
#-------------------------------------------------------------------------------

# service:
#   # Fixed name for every container. Default: derived from the container.
#   name: orders
#   name_prefix: ""
#   name_suffix: ""
#   environment: production

#-------------------------------------------------------------------------------
# Docker
#-------------------------------------------------------------------------------

# docker:
#   runtime: docker        # or podman
#   compose_command: "docker compose"
#   commit: true           # keep in-container changes by committing before replace

#-------------------------------------------------------------------------------
# Logging & advanced
#-------------------------------------------------------------------------------

# logging:
#   level: info            # trace, debug, info, warn, error

# advanced:
#   timeout_secs: 300
#   state_directory: /etc/java-injector/state
"#;
