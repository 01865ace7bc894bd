//! Finding running containers that host a JVM.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::docker::compose::LABEL_SERVICE;
use crate::docker::runtime::ContainerRuntime;
use crate::docker::snapshot::RuntimeSnapshot;
use crate::error::InjectError;
use crate::state::Ledger;

static JAVA_IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(^|[/:_.-])(java|jdk|jre|openjdk|temurin|amazoncorretto|corretto|zulu|graalvm|tomcat|jetty|wildfly|jboss|payara|liberty|spring)([/:_.-]|\d|$)",
    )
    .unwrap()
});

static JAVA_COMMAND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|/)java$|\.jar$|^-javaagent:|^org\.springframework\.").unwrap());

const JAVA_ENV_KEYS: &[&str] = &[
    "JAVA_HOME",
    "JAVA_VERSION",
    "JAVA_OPTS",
    "JDK_JAVA_OPTIONS",
    "CATALINA_HOME",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub compose_service: Option<String>,
    /// A ledger entry exists for this container.
    pub instrumented: bool,
}

/// Heuristic: JVM image name, JVM environment, or a java/jar command line.
pub fn is_java(snapshot: &RuntimeSnapshot) -> bool {
    if snapshot
        .image
        .as_deref()
        .is_some_and(|image| JAVA_IMAGE_RE.is_match(image))
    {
        return true;
    }
    if snapshot.env.iter().any(|entry| {
        let key = entry.split('=').next().unwrap_or(entry);
        JAVA_ENV_KEYS.contains(&key)
    }) {
        return true;
    }
    snapshot
        .entrypoint
        .iter()
        .chain(&snapshot.cmd)
        .flat_map(|part| part.split_whitespace())
        .any(|token| JAVA_COMMAND_RE.is_match(token))
}

/// Inspect every running container and keep the Java ones. Containers that
/// vanish or fail to inspect between listing and inspection are skipped.
pub fn discover(
    runtime: &dyn ContainerRuntime,
    ledger: &Ledger,
) -> Result<Vec<DiscoveredContainer>, InjectError> {
    let recorded: BTreeSet<String> = ledger
        .list()?
        .into_iter()
        .map(|e| e.container_name)
        .collect();

    let mut found = Vec::new();
    for name in runtime.list_containers()? {
        let snapshot = match runtime.inspect(&name) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(container = %name, error = %e, "discovery:inspect failed, skipping");
                continue;
            }
        };
        if !is_java(&snapshot) {
            debug!(container = %name, "discovery:not a java container");
            continue;
        }
        found.push(DiscoveredContainer {
            instrumented: recorded.contains(&snapshot.name),
            compose_service: snapshot.label(LABEL_SERVICE).map(str::to_string),
            image: snapshot.image.clone().unwrap_or_default(),
            name: snapshot.name,
            id: snapshot.id,
        });
    }
    debug!(count = found.len(), "discovery:done");
    Ok(found)
}
