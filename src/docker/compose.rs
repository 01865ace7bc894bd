//! Compose-managed containers.
//!
//! Their lifecycle belongs to a compose project, so instead of the
//! stop/commit/replace sequence one descriptor is backed up, edited, and the
//! service reconciled with `compose -p <project> -f <file>... up -d <service>`,
//! passing every file the project was started with. The edit is textual and
//! best-effort: whenever the service block has a shape the editor does not
//! understand, the change is printed for manual application instead.
//! Uninstrumenting copies the backup back verbatim and reconciles again.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::docker::env::{self, EnvMap};
use crate::docker::runtime::ContainerRuntime;
use crate::docker::snapshot::RuntimeSnapshot;
use crate::error::{InjectError, Step};
use crate::shell;
use crate::state::{Ledger, LedgerEntry};

pub const LABEL_PROJECT: &str = "com.docker.compose.project";
pub const LABEL_CONFIG_FILES: &str = "com.docker.compose.project.config_files";
pub const LABEL_SERVICE: &str = "com.docker.compose.service";
pub const LABEL_WORKDIR: &str = "com.docker.compose.project.working_dir";

const BACKUP_SUFFIX: &str = ".mw-backup";

/// How a compose-managed container was brought up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeLink {
    pub project: Option<String>,
    /// Every descriptor of the project, in the order compose merged them.
    pub files: Vec<PathBuf>,
    pub service: String,
    pub workdir: PathBuf,
}

impl ComposeLink {
    pub fn from_snapshot(snapshot: &RuntimeSnapshot) -> Option<Self> {
        let service = snapshot.label(LABEL_SERVICE).filter(|s| !s.is_empty())?;
        let workdir = snapshot
            .label(LABEL_WORKDIR)
            .filter(|w| !w.is_empty())
            .map(PathBuf::from);

        let files: Vec<PathBuf> = snapshot
            .label(LABEL_CONFIG_FILES)?
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(|f| match &workdir {
                Some(dir) if Path::new(f).is_relative() => dir.join(f),
                _ => PathBuf::from(f),
            })
            .collect();
        let first = files.first()?;

        let workdir = workdir
            .or_else(|| first.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        let project = snapshot
            .label(LABEL_PROJECT)
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        Some(Self {
            project,
            files,
            service: service.to_string(),
            workdir,
        })
    }

    /// Entries written before the full file list was recorded only know the
    /// edited descriptor.
    pub fn from_entry(entry: &LedgerEntry) -> Option<Self> {
        let file = entry.compose_file.clone()?;
        let workdir = entry
            .compose_workdir
            .clone()
            .or_else(|| file.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        let files = if entry.compose_files.is_empty() {
            vec![file]
        } else {
            entry.compose_files.clone()
        };
        Some(Self {
            project: entry.compose_project.clone(),
            files,
            service: entry.compose_service.clone().unwrap_or_default(),
            workdir,
        })
    }

    /// Arguments after the compose program that reconcile the service.
    pub fn up_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(project) = &self.project {
            args.push("-p".to_string());
            args.push(project.clone());
        }
        for file in &self.files {
            args.push("-f".to_string());
            args.push(file.to_string_lossy().into_owned());
        }
        args.extend(["up".to_string(), "-d".to_string(), self.service.clone()]);
        args
    }

    /// Copy-pasteable reconcile command for operator hints.
    pub fn up_hint(&self) -> String {
        format!(
            "cd {} && docker {}",
            shell::shell_quote(&self.workdir.to_string_lossy()),
            shell::join_command("compose", &self.up_args())
        )
    }

    /// The last descriptor declaring the service. Compose merges files in
    /// order, so environment and volumes added there take precedence.
    pub fn declaring_file(&self) -> Result<PathBuf, String> {
        let mut found = None;
        for file in &self.files {
            let content = fs::read_to_string(file)
                .map_err(|e| format!("cannot read {}: {}", file.display(), e))?;
            let doc: serde_yaml::Value = serde_yaml::from_str(&content)
                .map_err(|e| format!("{} does not parse: {}", file.display(), e))?;
            let declares = doc
                .get("services")
                .and_then(|s| s.get(self.service.as_str()))
                .is_some();
            debug!(file = %file.display(), service = %self.service, declares, "compose:scan descriptor");
            if declares {
                found = Some(file.clone());
            }
        }
        found.ok_or_else(|| format!("no compose file declares service `{}`", self.service))
    }
}

pub fn backup_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Environment entries and the agent volume a service needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeChange {
    pub env: EnvMap,
    pub volume: String,
}

impl ComposeChange {
    /// `overlay` merged against the container's current environment so the
    /// agent flag keeps any JVM options the image already sets.
    pub fn new(
        snapshot: &RuntimeSnapshot,
        overlay: &EnvMap,
        agent_host_path: &str,
        container_agent_path: &str,
    ) -> Self {
        let base = env::strip_instrumentation(&env::parse_env(&snapshot.env), container_agent_path);
        let merged = env::apply_overlay(&base, overlay);
        let env = overlay
            .keys()
            .filter_map(|k| merged.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        Self {
            env,
            volume: format!("{}:{}:ro", agent_host_path, container_agent_path),
        }
    }
}

/// A change the operator has to apply by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualInstructions {
    pub link: ComposeLink,
    /// Descriptor the change belongs in, when one was found.
    pub file: Option<PathBuf>,
    pub change: ComposeChange,
    pub reason: String,
}

impl fmt::Display for ManualInstructions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => writeln!(f, "Could not edit {} automatically: {}", file.display(), self.reason)?,
            None => writeln!(f, "Could not edit the compose files automatically: {}", self.reason)?,
        }
        writeln!(f, "Add the following to service `{}`:", self.link.service)?;
        writeln!(f, "  environment:")?;
        for (key, value) in &self.change.env {
            writeln!(f, "    - {}", yaml_quote(&format!("{}={}", key, value)))?;
        }
        writeln!(f, "  volumes:")?;
        writeln!(f, "    - {}", yaml_quote(&self.change.volume))?;
        write!(f, "Then run: {}", self.link.up_hint())
    }
}

#[derive(Debug)]
pub enum ComposeOutcome {
    Applied,
    Manual(ManualInstructions),
}

fn yaml_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

// --- textual editor ---

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

fn is_structural(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

/// `key: value` split of a trimmed line; the value has any trailing comment removed.
fn split_key(trimmed: &str) -> Option<(&str, &str)> {
    if trimmed.starts_with('-') {
        return None;
    }
    let (key, rest) = trimmed.split_once(':')?;
    if !rest.is_empty() && !rest.starts_with(' ') {
        return None;
    }
    let value = rest.trim();
    let value = if value.starts_with('#') { "" } else { value };
    Some((key.trim().trim_matches('"').trim_matches('\''), value))
}

/// First structural line after `start` at or above `parent_indent`.
fn block_end(lines: &[&str], start: usize, parent_indent: usize) -> usize {
    (start + 1..lines.len())
        .find(|&i| is_structural(lines[i]) && indent_of(lines[i]) <= parent_indent)
        .unwrap_or(lines.len())
}

/// Insertion point right after the last structural line of a block.
fn after_last_content(lines: &[&str], start: usize, end: usize) -> usize {
    (start + 1..end)
        .rev()
        .find(|&i| is_structural(lines[i]))
        .unwrap_or(start)
        + 1
}

fn find_key(
    lines: &[&str],
    start: usize,
    end: usize,
    indent: usize,
    key: &str,
) -> Option<(usize, String)> {
    (start + 1..end).find_map(|i| {
        let line = lines[i];
        if !is_structural(line) || indent_of(line) != indent {
            return None;
        }
        match split_key(line.trim()) {
            Some((k, value)) if k == key => Some((i, value.to_string())),
            _ => None,
        }
    })
}

fn child_lines<'a>(lines: &[&'a str], start: usize, end: usize) -> Vec<&'a str> {
    lines[start + 1..end]
        .iter()
        .copied()
        .filter(|l| is_structural(l))
        .collect()
}

fn list_item_key(trimmed: &str) -> Option<String> {
    let item = trimmed.strip_prefix('-')?.trim();
    let item = item.trim_matches('"').trim_matches('\'');
    Some(item.split('=').next().unwrap_or(item).to_string())
}

/// Add `change` to `service` in a compose document. Returns the new text, or
/// the reason the document has to be edited by hand.
pub fn edit_descriptor(content: &str, service: &str, change: &ComposeChange) -> Result<String, String> {
    let lines: Vec<&str> = content.lines().collect();
    if lines
        .iter()
        .any(|l| l.trim_start_matches(' ').starts_with('\t'))
    {
        return Err("tab indentation".into());
    }

    let services_at = lines
        .iter()
        .position(|l| {
            indent_of(l) == 0 && matches!(split_key(l.trim()), Some(("services", "")))
        })
        .ok_or("no top-level `services:` block")?;
    let services_end = block_end(&lines, services_at, 0);

    let service_indent = lines[services_at + 1..services_end]
        .iter()
        .find(|l| is_structural(l))
        .map(|l| indent_of(l))
        .ok_or("`services:` block is empty")?;
    let (service_at, inline) = find_key(&lines, services_at, services_end, service_indent, service)
        .ok_or_else(|| format!("service `{}` not found", service))?;
    if !inline.is_empty() {
        return Err(format!("service `{}` uses flow syntax", service));
    }
    let service_end = block_end(&lines, service_at, service_indent);
    let key_indent = lines[service_at + 1..service_end]
        .iter()
        .find(|l| is_structural(l))
        .map(|l| indent_of(l))
        .ok_or_else(|| format!("service `{}` has no keys", service))?;

    let pad = |n: usize| " ".repeat(n);
    let mut inserts: Vec<(usize, Vec<String>)> = Vec::new();

    // environment
    match find_key(&lines, service_at, service_end, key_indent, "environment") {
        None => {
            let mut block = vec![format!("{}environment:", pad(key_indent))];
            block.extend(change.env.iter().map(|(k, v)| {
                format!("{}- {}", pad(key_indent + 2), yaml_quote(&format!("{}={}", k, v)))
            }));
            inserts.push((after_last_content(&lines, service_at, service_end), block));
        }
        Some((at, value)) => {
            if !value.is_empty() {
                return Err("`environment` uses flow syntax".into());
            }
            let end = block_end(&lines, at, key_indent);
            let children = child_lines(&lines, at, end);
            let first = children.first().ok_or("`environment` is empty")?;
            let child_indent = indent_of(first);
            let list_style = first.trim().starts_with('-');

            let existing: Vec<String> = children
                .iter()
                .filter(|c| indent_of(c) == child_indent)
                .filter_map(|c| {
                    if list_style {
                        list_item_key(c.trim())
                    } else {
                        split_key(c.trim()).map(|(k, _)| k.to_string())
                    }
                })
                .collect();
            if let Some(clash) = change.env.keys().find(|k| existing.contains(k)) {
                return Err(format!("service already sets {}", clash));
            }

            let block = change
                .env
                .iter()
                .map(|(k, v)| {
                    if list_style {
                        format!("{}- {}", pad(child_indent), yaml_quote(&format!("{}={}", k, v)))
                    } else {
                        format!("{}{}: {}", pad(child_indent), k, yaml_quote(v))
                    }
                })
                .collect();
            inserts.push((after_last_content(&lines, at, end), block));
        }
    }

    // volumes
    let volume_line = |indent: usize| format!("{}- {}", pad(indent), yaml_quote(&change.volume));
    match find_key(&lines, service_at, service_end, key_indent, "volumes") {
        None => {
            inserts.push((
                after_last_content(&lines, service_at, service_end),
                vec![format!("{}volumes:", pad(key_indent)), volume_line(key_indent + 2)],
            ));
        }
        Some((at, value)) => {
            if !value.is_empty() {
                return Err("`volumes` uses flow syntax".into());
            }
            let end = block_end(&lines, at, key_indent);
            let children = child_lines(&lines, at, end);
            let first = children.first().ok_or("`volumes` is empty")?;
            if !first.trim().starts_with('-') {
                return Err("`volumes` is not a list".into());
            }
            let destination = change.volume.split(':').nth(1).unwrap_or_default();
            if children.iter().any(|c| c.contains(destination)) {
                return Err(format!("{} is already mounted", destination));
            }
            inserts.push((after_last_content(&lines, at, end), vec![volume_line(indent_of(first))]));
        }
    }

    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 8);
    for (i, line) in lines.iter().enumerate() {
        for (_, block) in inserts.iter().filter(|(at, _)| *at == i) {
            out.extend(block.iter().cloned());
        }
        out.push((*line).to_string());
    }
    for (_, block) in inserts.iter().filter(|(at, _)| *at >= lines.len()) {
        out.extend(block.iter().cloned());
    }
    let mut edited = out.join("\n");
    if content.ends_with('\n') || content.is_empty() {
        edited.push('\n');
    }

    verify_edit(&edited, service, change)?;
    Ok(edited)
}

/// Parse the edited text and check the change landed where intended.
fn verify_edit(edited: &str, service: &str, change: &ComposeChange) -> Result<(), String> {
    use serde_yaml::Value;

    let doc: Value =
        serde_yaml::from_str(edited).map_err(|e| format!("edited document does not parse: {}", e))?;
    let svc = doc
        .get("services")
        .and_then(|s| s.get(service))
        .ok_or("edited document lost the service")?;

    let env_ok = match svc.get("environment") {
        Some(Value::Sequence(items)) => change.env.iter().all(|(k, v)| {
            let wanted = format!("{}={}", k, v);
            items.iter().any(|i| i.as_str() == Some(wanted.as_str()))
        }),
        Some(Value::Mapping(map)) => change
            .env
            .iter()
            .all(|(k, v)| map.get(k.as_str()).and_then(Value::as_str) == Some(v.as_str())),
        _ => false,
    };
    let volume_ok = svc
        .get("volumes")
        .and_then(Value::as_sequence)
        .is_some_and(|items| items.iter().any(|i| i.as_str() == Some(change.volume.as_str())));

    if env_ok && volume_ok {
        Ok(())
    } else {
        Err("edited document does not contain the change".into())
    }
}

// --- lifecycle ---

/// Instrument a compose service. Returns `Manual` without touching anything
/// when no descriptor can be edited safely.
pub fn instrument(
    runtime: &dyn ContainerRuntime,
    ledger: &Ledger,
    link: &ComposeLink,
    change: ComposeChange,
    mut entry: LedgerEntry,
) -> Result<ComposeOutcome, InjectError> {
    let name = entry.container_name.clone();
    if let Some(missing) = link.files.iter().find(|f| !f.is_file()) {
        return Err(InjectError::NotFound(format!(
            "compose file {}",
            missing.display()
        )));
    }
    let manual = |file: Option<PathBuf>, reason: String| -> Result<ComposeOutcome, InjectError> {
        warn!(container = %name, reason = %reason, "compose:manual edit required");
        Ok(ComposeOutcome::Manual(ManualInstructions {
            link: link.clone(),
            file,
            change: change.clone(),
            reason,
        }))
    };

    let file = match link.declaring_file() {
        Ok(file) => file,
        Err(reason) => return manual(None, reason),
    };
    let backup = backup_path(&file);
    if backup.exists() {
        let reason = format!(
            "backup {} already exists from an earlier run",
            backup.display()
        );
        return manual(Some(file), reason);
    }

    let content = fs::read_to_string(&file)?;
    let edited = match edit_descriptor(&content, &link.service, &change) {
        Ok(edited) => edited,
        Err(reason) => return manual(Some(file), reason),
    };

    fs::copy(&file, &backup)?;
    fs::write(&file, edited)?;
    info!(container = %name, file = %file.display(), backup = %backup.display(), "compose:descriptor edited");

    if let Err(e) = runtime.compose_up(link) {
        let restored = fs::copy(&backup, &file).and_then(|_| fs::remove_file(&backup));
        warn!(container = %name, error = %e, restored = restored.is_ok(), "compose:reconcile failed");
        return Err(InjectError::MutationFailed {
            container: name,
            step: Step::Recreate,
            reason: e.to_string(),
            remediation: Some(format!(
                "the descriptor was restored; bring the service back with `{}`",
                link.up_hint()
            )),
        });
    }

    entry.compose_file = Some(file.clone());
    entry.compose_files = link.files.clone();
    entry.compose_project = link.project.clone();
    entry.compose_service = Some(link.service.clone());
    entry.compose_workdir = Some(link.workdir.clone());
    if let Err(e) = ledger.put(entry, false) {
        return Err(InjectError::MutationFailed {
            container: name,
            step: Step::Persist,
            reason: e.to_string(),
            remediation: Some(format!(
                "the service runs instrumented but is not recorded; to revert copy {} over {} and run `{}`",
                backup.display(),
                file.display(),
                link.up_hint()
            )),
        });
    }
    info!(container = %name, "compose:instrumented");
    Ok(ComposeOutcome::Applied)
}

/// Restore the backed-up descriptor and reconcile with the project's full file list.
pub fn uninstrument(
    runtime: &dyn ContainerRuntime,
    ledger: &Ledger,
    entry: &LedgerEntry,
) -> Result<(), InjectError> {
    let name = &entry.container_name;
    let restorable = entry
        .compose_file
        .clone()
        .zip(ComposeLink::from_entry(entry))
        .filter(|(file, link)| !link.service.is_empty() && backup_path(file).is_file());
    let Some((file, link)) = restorable else {
        warn!(container = %name, "compose:no backup to restore from");
        ledger.delete(name)?;
        return Err(InjectError::DegradedRestore {
            container: name.clone(),
        });
    };
    let backup = backup_path(&file);

    fs::copy(&backup, &file)?;
    info!(container = %name, file = %file.display(), "compose:descriptor restored");

    runtime
        .compose_up(&link)
        .map_err(|e| InjectError::MutationFailed {
            container: name.clone(),
            step: Step::Recreate,
            reason: e.to_string(),
            remediation: Some(format!(
                "the original descriptor is back in place; run `{}`",
                link.up_hint()
            )),
        })?;

    if let Err(e) = fs::remove_file(&backup) {
        warn!(path = %backup.display(), error = %e, "compose:could not remove backup");
    }
    ledger.delete(name)?;
    info!(container = %name, "compose:uninstrumented");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn change() -> ComposeChange {
        ComposeChange {
            env: EnvMap::from([
                ("JAVA_TOOL_OPTIONS".to_string(), "-javaagent:/opt/a.jar".to_string()),
                ("MW_API_KEY".to_string(), "k1".to_string()),
            ]),
            volume: "/host/a.jar:/opt/a.jar:ro".to_string(),
        }
    }

    const LIST_STYLE: &str = "\
version: \"3.8\"
services:
  api:
    image: acme/api:1
    environment:
      - LOG_LEVEL=info
    volumes:
      - ./data:/data
    ports:
      - \"8080:8080\"

  db:
    image: postgres:16
volumes:
  pgdata:
";

    #[test]
    fn edits_list_style_service() {
        let edited = edit_descriptor(LIST_STYLE, "api", &change()).unwrap();
        assert!(edited.contains("      - LOG_LEVEL=info\n      - \"JAVA_TOOL_OPTIONS=-javaagent:/opt/a.jar\"\n      - \"MW_API_KEY=k1\"\n"));
        assert!(edited.contains("      - ./data:/data\n      - \"/host/a.jar:/opt/a.jar:ro\"\n"));
        // db untouched
        assert!(edited.contains("  db:\n    image: postgres:16\n"));
    }

    #[test]
    fn adds_missing_sections_at_end_of_service() {
        let edited = edit_descriptor(LIST_STYLE, "db", &change()).unwrap();
        assert!(edited.contains(
            "  db:\n    image: postgres:16\n    environment:\n      - \"JAVA_TOOL_OPTIONS=-javaagent:/opt/a.jar\"\n      - \"MW_API_KEY=k1\"\n    volumes:\n      - \"/host/a.jar:/opt/a.jar:ro\"\nvolumes:\n"
        ));
    }

    #[test]
    fn edits_map_style_environment() {
        let content = "services:\n  web:\n    image: x\n    environment:\n      LOG_LEVEL: info\n";
        let edited = edit_descriptor(content, "web", &change()).unwrap();
        assert!(edited.contains("      LOG_LEVEL: info\n      JAVA_TOOL_OPTIONS: \"-javaagent:/opt/a.jar\"\n      MW_API_KEY: \"k1\"\n"));
    }

    #[test]
    fn unsupported_shapes_need_manual_edit() {
        let cases = [
            ("web:\n  image: x\n", "no top-level"),
            ("services:\n  other:\n    image: x\n", "not found"),
            ("services:\n  web:\n    image: x\n    environment: [A=1]\n", "flow syntax"),
            ("services:\n  web:\n    image: x\n    environment:\n      - MW_API_KEY=old\n", "already sets"),
            ("services:\n  web:\n    image: x\n    volumes:\n      - /host/a.jar:/opt/a.jar:ro\n", "already mounted"),
        ];
        for (content, needle) in cases {
            let err = edit_descriptor(content, "web", &change()).unwrap_err();
            assert!(err.contains(needle), "{:?} -> {}", content, err);
        }
    }

    fn shop_snapshot(files: &str, workdir: &str) -> RuntimeSnapshot {
        RuntimeSnapshot {
            name: "shop-api-1".into(),
            labels: BTreeMap::from([
                (LABEL_SERVICE.to_string(), "api".to_string()),
                (LABEL_PROJECT.to_string(), "shop".to_string()),
                (LABEL_CONFIG_FILES.to_string(), files.to_string()),
                (LABEL_WORKDIR.to_string(), workdir.to_string()),
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn link_keeps_every_file_and_the_project() {
        let link = ComposeLink::from_snapshot(&shop_snapshot(
            "compose.yaml, /etc/shop/compose.override.yaml",
            "/srv/shop",
        ))
        .unwrap();
        assert_eq!(
            link.files,
            [
                PathBuf::from("/srv/shop/compose.yaml"),
                PathBuf::from("/etc/shop/compose.override.yaml"),
            ]
        );
        assert_eq!(link.project.as_deref(), Some("shop"));
        assert_eq!(link.service, "api");
        assert_eq!(link.workdir, PathBuf::from("/srv/shop"));
        assert_eq!(
            link.up_args(),
            [
                "-p",
                "shop",
                "-f",
                "/srv/shop/compose.yaml",
                "-f",
                "/etc/shop/compose.override.yaml",
                "up",
                "-d",
                "api",
            ]
        );
        assert_eq!(
            backup_path(&link.files[0]),
            PathBuf::from("/srv/shop/compose.yaml.mw-backup")
        );

        assert!(ComposeLink::from_snapshot(&RuntimeSnapshot::default()).is_none());
    }

    #[test]
    fn link_from_old_entry_falls_back_to_the_edited_file() {
        let entry = LedgerEntry {
            compose_file: Some("/srv/shop/compose.yaml".into()),
            compose_service: Some("api".into()),
            ..crate::state::ledger::tests::entry("shop-api-1")
        };
        let link = ComposeLink::from_entry(&entry).unwrap();
        assert_eq!(link.files, [PathBuf::from("/srv/shop/compose.yaml")]);
        assert_eq!(link.project, None);
        assert_eq!(link.up_args(), ["-f", "/srv/shop/compose.yaml", "up", "-d", "api"]);
    }

    #[test]
    fn declaring_file_is_the_last_one_naming_the_service() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().join("compose.yaml");
        let override_file = dir.path().join("compose.override.yaml");
        let extra = dir.path().join("compose.db.yaml");
        fs::write(&base, "services:\n  api:\n    image: acme/api:1\n").unwrap();
        fs::write(&override_file, "services:\n  api:\n    ports:\n      - \"8080:8080\"\n").unwrap();
        fs::write(&extra, "services:\n  db:\n    image: postgres:16\n").unwrap();

        let link = ComposeLink {
            project: Some("shop".into()),
            files: vec![base.clone(), override_file.clone(), extra.clone()],
            service: "api".into(),
            workdir: dir.path().to_path_buf(),
        };
        assert_eq!(link.declaring_file().unwrap(), override_file);

        let only_base = ComposeLink {
            files: vec![base.clone(), extra.clone()],
            ..link.clone()
        };
        assert_eq!(only_base.declaring_file().unwrap(), base);

        let none = ComposeLink {
            files: vec![extra],
            ..link
        };
        assert!(none.declaring_file().unwrap_err().contains("no compose file declares"));
    }

    #[test]
    fn change_keeps_existing_jvm_options() {
        let snapshot = RuntimeSnapshot {
            env: vec!["JAVA_TOOL_OPTIONS=-Xmx1g".into(), "OTHER=1".into()],
            ..Default::default()
        };
        let overlay = EnvMap::from([(
            "JAVA_TOOL_OPTIONS".to_string(),
            "-javaagent:/opt/a.jar".to_string(),
        )]);
        let change = ComposeChange::new(&snapshot, &overlay, "/host/a.jar", "/opt/a.jar");
        assert_eq!(change.env["JAVA_TOOL_OPTIONS"], "-Xmx1g -javaagent:/opt/a.jar");
        assert!(!change.env.contains_key("OTHER"));
    }
}
