//! Instrumentation environment: what gets injected, and how earlier injections
//! are recognised and stripped again.

use std::collections::BTreeMap;

use crate::docker::snapshot::RuntimeSnapshot;
use crate::naming;

/// Variable the JVM reads extra command-line flags from.
pub const AGENT_FLAG_VAR: &str = "JAVA_TOOL_OPTIONS";

/// Key prefixes owned by this tool and the agent it installs.
pub const RESERVED_PREFIXES: &[&str] = &["MW_", "OTEL_"];

pub const ENV_API_KEY: &str = "MW_API_KEY";
pub const ENV_TARGET: &str = "MW_TARGET";
pub const ENV_SERVICE_NAME: &str = "MW_SERVICE_NAME";
pub const ENV_DEPLOYMENT: &str = "MW_ENVIRONMENT";

/// Where the agent JAR is mounted inside instrumented containers.
pub const DEFAULT_CONTAINER_AGENT_PATH: &str = "/opt/middleware/agents/middleware-javaagent.jar";

/// Any `-javaagent:` pointing below this directory was injected by us.
const AGENT_DIR: &str = "/opt/middleware/agents/";

pub type EnvMap = BTreeMap<String, String>;

/// What the operator wants injected into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredConfig {
    pub api_key: String,
    pub target: String,
    /// Derived from the container's identity when unset.
    pub service_name: Option<String>,
    pub container_agent_path: String,
    pub deployment_environment: Option<String>,
    pub service_name_prefix: Option<String>,
    pub service_name_suffix: Option<String>,
}

pub fn agent_flag(container_agent_path: &str) -> String {
    format!("-javaagent:{}", container_agent_path)
}

/// Split `KEY=value` entries into a sorted map. Later duplicates win, as in the runtime.
pub fn parse_env(entries: &[String]) -> EnvMap {
    entries
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (entry.clone(), String::new()),
        })
        .collect()
}

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Keys whose values are credentials: ours and the usual naming conventions.
pub fn is_secret_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    key == ENV_API_KEY || ["PASSWORD", "SECRET", "TOKEN", "API_KEY"].iter().any(|m| upper.contains(m))
}

fn is_injected_agent_token(token: &str, container_agent_path: &str) -> bool {
    token
        .strip_prefix("-javaagent:")
        .is_some_and(|jar| jar == container_agent_path || jar.starts_with(AGENT_DIR))
}

/// Remove every trace of a previous injection so restore commands never
/// carry stale instrumentation, no matter how many cycles preceded them.
///
/// Reserved keys are dropped outright. The agent flag variable loses only the
/// tokens we injected; other JVM flags (including foreign agents) stay.
pub fn strip_instrumentation(env: &EnvMap, container_agent_path: &str) -> EnvMap {
    let mut out = EnvMap::new();
    for (key, value) in env {
        if is_reserved_key(key) {
            continue;
        }
        if key == AGENT_FLAG_VAR {
            let kept: Vec<&str> = value
                .split_whitespace()
                .filter(|t| !is_injected_agent_token(t, container_agent_path))
                .collect();
            if kept.is_empty() {
                continue;
            }
            if kept.len() != value.split_whitespace().count() {
                out.insert(key.clone(), kept.join(" "));
                continue;
            }
        }
        out.insert(key.clone(), value.clone());
    }
    out
}

/// Append `flag` to an existing agent-flag value; never replace it.
pub fn merge_agent_flag(existing: Option<&str>, flag: &str) -> String {
    match existing.map(str::trim).filter(|v| !v.is_empty()) {
        Some(current) if current.split_whitespace().any(|t| t == flag) => current.to_string(),
        Some(current) => format!("{} {}", current, flag),
        None => flag.to_string(),
    }
}

/// Overlay `overlay` onto `base`. Collisions overwrite, except the agent flag
/// variable whose tokens accumulate.
pub fn apply_overlay(base: &EnvMap, overlay: &EnvMap) -> EnvMap {
    let mut merged = base.clone();
    for (key, value) in overlay {
        if key == AGENT_FLAG_VAR {
            let combined = value
                .split_whitespace()
                .fold(merged.get(key).cloned(), |acc, token| {
                    Some(merge_agent_flag(acc.as_deref(), token))
                })
                .unwrap_or_default();
            merged.insert(key.clone(), combined);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Compute the variables to inject into `snapshot`'s container.
pub fn build_instrumentation_env(snapshot: &RuntimeSnapshot, desired: &DesiredConfig) -> EnvMap {
    let service_name = desired
        .service_name
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| {
            naming::service_name_for(
                snapshot,
                desired.service_name_prefix.as_deref(),
                desired.service_name_suffix.as_deref(),
            )
        });

    let mut overlay = EnvMap::new();
    overlay.insert(
        AGENT_FLAG_VAR.to_string(),
        agent_flag(&desired.container_agent_path),
    );
    overlay.insert(ENV_API_KEY.to_string(), desired.api_key.clone());
    overlay.insert(ENV_TARGET.to_string(), desired.target.clone());
    overlay.insert(ENV_SERVICE_NAME.to_string(), service_name);
    if let Some(env) = desired
        .deployment_environment
        .as_ref()
        .filter(|e| !e.is_empty())
    {
        overlay.insert(ENV_DEPLOYMENT.to_string(), env.clone());
    }
    overlay
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired() -> DesiredConfig {
        DesiredConfig {
            api_key: "k1".into(),
            target: "https://t".into(),
            service_name: Some("orders".into()),
            container_agent_path: DEFAULT_CONTAINER_AGENT_PATH.into(),
            deployment_environment: None,
            service_name_prefix: None,
            service_name_suffix: None,
        }
    }

    fn env(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn credential_keys_are_secret() {
        assert!(is_secret_key("MW_API_KEY"));
        assert!(is_secret_key("DB_PASSWORD"));
        assert!(is_secret_key("github_token"));
        assert!(!is_secret_key("LOG_LEVEL"));
        assert!(!is_secret_key("MW_TARGET"));
    }

    #[test]
    fn parse_env_splits_on_first_equals() {
        let parsed = parse_env(&["A=1".into(), "B=x=y".into(), "C".into()]);
        assert_eq!(parsed["A"], "1");
        assert_eq!(parsed["B"], "x=y");
        assert_eq!(parsed["C"], "");
    }

    #[test]
    fn strip_drops_reserved_keys_and_injected_flags() {
        let base = env(&[
            ("LOG_LEVEL", "info"),
            ("MW_API_KEY", "old"),
            ("OTEL_SERVICE_NAME", "x"),
            ("JAVA_TOOL_OPTIONS", "-javaagent:/opt/middleware/agents/middleware-javaagent.jar"),
        ]);
        let stripped = strip_instrumentation(&base, DEFAULT_CONTAINER_AGENT_PATH);
        assert_eq!(stripped, env(&[("LOG_LEVEL", "info")]));
    }

    #[test]
    fn strip_keeps_foreign_jvm_flags() {
        let base = env(&[(
            "JAVA_TOOL_OPTIONS",
            "-Xmx512m -javaagent:/opt/middleware/agents/middleware-javaagent-1.8.1.jar -javaagent:/other/apm.jar",
        )]);
        let stripped = strip_instrumentation(&base, DEFAULT_CONTAINER_AGENT_PATH);
        assert_eq!(stripped["JAVA_TOOL_OPTIONS"], "-Xmx512m -javaagent:/other/apm.jar");
    }

    #[test]
    fn stripping_is_idempotent() {
        let base = env(&[
            ("A", "1"),
            ("MW_TARGET", "t"),
            ("JAVA_TOOL_OPTIONS", "-Dfoo=bar -javaagent:/opt/middleware/agents/middleware-javaagent.jar"),
        ]);
        let once = strip_instrumentation(&base, DEFAULT_CONTAINER_AGENT_PATH);
        let twice = strip_instrumentation(&once, DEFAULT_CONTAINER_AGENT_PATH);
        assert_eq!(once, twice);
    }

    #[test]
    fn agent_flag_is_appended_not_replaced() {
        let existing = "-Xmx1g -javaagent:/other/apm.jar";
        let base = env(&[("JAVA_TOOL_OPTIONS", existing)]);
        let overlay = env(&[("JAVA_TOOL_OPTIONS", "-javaagent:/opt/middleware/agents/middleware-javaagent.jar")]);
        let merged = apply_overlay(&base, &overlay);
        let value = &merged["JAVA_TOOL_OPTIONS"];
        assert!(value.contains(existing));
        assert!(value.ends_with("-javaagent:/opt/middleware/agents/middleware-javaagent.jar"));
    }

    #[test]
    fn agent_flag_is_not_duplicated() {
        let flag = agent_flag(DEFAULT_CONTAINER_AGENT_PATH);
        assert_eq!(merge_agent_flag(Some(&flag), &flag), flag);
        assert_eq!(merge_agent_flag(None, &flag), flag);
        assert_eq!(merge_agent_flag(Some("  "), &flag), flag);
    }

    #[test]
    fn overlay_overwrites_other_keys() {
        let base = env(&[("MW_TARGET", "old"), ("KEEP", "1")]);
        let overlay = env(&[("MW_TARGET", "new")]);
        let merged = apply_overlay(&base, &overlay);
        assert_eq!(merged["MW_TARGET"], "new");
        assert_eq!(merged["KEEP"], "1");
    }

    #[test]
    fn builds_three_variables_plus_agent_flag() {
        let snapshot = RuntimeSnapshot {
            name: "orders-svc".into(),
            ..Default::default()
        };
        let overlay = build_instrumentation_env(&snapshot, &desired());
        assert_eq!(overlay.len(), 4);
        assert_eq!(overlay[ENV_API_KEY], "k1");
        assert_eq!(overlay[ENV_TARGET], "https://t");
        assert_eq!(overlay[ENV_SERVICE_NAME], "orders");
        assert_eq!(
            overlay[AGENT_FLAG_VAR],
            "-javaagent:/opt/middleware/agents/middleware-javaagent.jar"
        );
    }

    #[test]
    fn service_name_defaults_to_container_identity() {
        let snapshot = RuntimeSnapshot {
            name: "Billing_API".into(),
            ..Default::default()
        };
        let mut cfg = desired();
        cfg.service_name = None;
        cfg.deployment_environment = Some("staging".into());
        let overlay = build_instrumentation_env(&snapshot, &cfg);
        assert_eq!(overlay[ENV_SERVICE_NAME], "billing-api");
        assert_eq!(overlay[ENV_DEPLOYMENT], "staging");
    }
}
