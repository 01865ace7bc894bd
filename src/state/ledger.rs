//! The instrumentation ledger: which containers this tool instrumented and how
//! to put them back.
//!
//! One versioned JSON document per state directory. Every mutation is a
//! read-modify-write of the whole document under an exclusive `flock` on a
//! sibling lock file, and the rewrite goes through a temporary file that is
//! renamed into place, so readers never observe a half-written ledger.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::docker::synth::RecreationCommand;
use crate::error::InjectError;

pub const LEDGER_VERSION: u32 = 1;
pub const LEDGER_FILE_NAME: &str = "docker.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    /// Unix seconds.
    pub instrumented_at: u64,
    /// Agent JAR on the host at instrumentation time.
    pub agent_path: String,
    /// Environment with instrumentation stripped.
    #[serde(default)]
    pub original_env: BTreeMap<String, String>,
    /// Restore command. Absent or empty means a degraded restore.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recreation_command: Option<RecreationCommand>,
    /// Raw inspect document, kept for diagnostics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_config: Option<serde_json::Value>,
    /// The compose descriptor that was edited and has a backup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_file: Option<PathBuf>,
    /// Every descriptor of the project, in `-f` order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compose_files: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_workdir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_image: Option<String>,
}

impl LedgerEntry {
    pub fn is_compose(&self) -> bool {
        self.compose_file.is_some()
    }

    pub fn has_restore_command(&self) -> bool {
        self.recreation_command
            .as_ref()
            .is_some_and(|c| !c.is_empty())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerDocument {
    version: Option<u32>,
    #[serde(default)]
    containers: BTreeMap<String, LedgerEntry>,
    #[serde(default)]
    updated_at: u64,
}

impl Default for LedgerDocument {
    fn default() -> Self {
        Self {
            version: Some(LEDGER_VERSION),
            containers: BTreeMap::new(),
            updated_at: 0,
        }
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Ledger stored as `docker.json` inside `state_dir`.
    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(LEDGER_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    pub fn get(&self, name: &str) -> Result<Option<LedgerEntry>, InjectError> {
        Ok(self.load()?.containers.remove(name))
    }

    pub fn contains(&self, name: &str) -> Result<bool, InjectError> {
        Ok(self.load()?.containers.contains_key(name))
    }

    /// All entries, ordered by container name.
    pub fn list(&self) -> Result<Vec<LedgerEntry>, InjectError> {
        Ok(self.load()?.containers.into_values().collect())
    }

    /// Insert `entry`. An existing entry for the same name is only replaced when
    /// `replace` is set; otherwise the call fails with `AlreadyInstrumented`.
    pub fn put(&self, entry: LedgerEntry, replace: bool) -> Result<(), InjectError> {
        self.mutate(|doc| {
            let name = entry.container_name.clone();
            if !replace && doc.containers.contains_key(&name) {
                return Err(InjectError::AlreadyInstrumented(name));
            }
            doc.containers.insert(name, entry);
            Ok(())
        })
    }

    /// Remove and return the entry for `name`, if any.
    pub fn delete(&self, name: &str) -> Result<Option<LedgerEntry>, InjectError> {
        self.mutate(|doc| Ok(doc.containers.remove(name)))
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut LedgerDocument) -> Result<T, InjectError>,
    ) -> Result<T, InjectError> {
        let _guard = self.lock()?;
        let mut doc = self.load()?;
        let result = f(&mut doc)?;
        doc.updated_at = now_unix();
        self.store(&doc)?;
        Ok(result)
    }

    fn lock(&self) -> Result<Flock<File>, InjectError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())?;
        trace!(path = %self.path.display(), "ledger:lock wait");
        let guard = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| io::Error::from(errno))?;
        trace!(path = %self.path.display(), "ledger:lock acquired");
        Ok(guard)
    }

    fn corrupt(&self, reason: impl Into<String>) -> InjectError {
        InjectError::LedgerCorrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn load(&self) -> Result<LedgerDocument, InjectError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LedgerDocument::default()),
            Err(e) => return Err(e.into()),
        };
        let doc: LedgerDocument = serde_json::from_str(&content)
            .map_err(|e| self.corrupt(format!("unparseable: {}", e)))?;
        match doc.version {
            Some(LEDGER_VERSION) => {}
            Some(other) => return Err(self.corrupt(format!("unsupported version {}", other))),
            None => return Err(self.corrupt("missing version")),
        }
        if let Some((key, entry)) = doc
            .containers
            .iter()
            .find(|(key, entry)| **key != entry.container_name)
        {
            return Err(self.corrupt(format!(
                "entry `{}` is recorded under key `{}`",
                entry.container_name, key
            )));
        }
        Ok(doc)
    }

    fn store(&self, doc: &LedgerDocument) -> Result<(), InjectError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| InjectError::Io(io::Error::other(e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        debug!(
            path = %self.path.display(),
            entries = doc.containers.len(),
            "ledger:written"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    pub(crate) fn entry(name: &str) -> LedgerEntry {
        LedgerEntry {
            container_id: format!("id-{}", name),
            container_name: name.to_string(),
            image: "acme/app:1".into(),
            instrumented_at: 1_700_000_000,
            agent_path: "/opt/agent.jar".into(),
            original_env: BTreeMap::from([("LOG_LEVEL".to_string(), "info".to_string())]),
            recreation_command: Some(RecreationCommand(vec![
                "run".into(),
                "-d".into(),
                "--name".into(),
                name.to_string(),
                "acme/app:1".into(),
            ])),
            original_config: None,
            compose_file: None,
            compose_files: Vec::new(),
            compose_project: None,
            compose_service: None,
            compose_workdir: None,
            committed_image: None,
        }
    }

    #[test]
    fn missing_file_is_an_empty_ledger() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::in_dir(&dir.path().join("state"));
        assert!(ledger.list().unwrap().is_empty());
        assert!(ledger.get("x").unwrap().is_none());
        assert!(!ledger.path().exists());
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::in_dir(dir.path());
        ledger.put(entry("orders"), false).unwrap();
        assert_eq!(ledger.get("orders").unwrap(), Some(entry("orders")));

        let removed = ledger.delete("orders").unwrap();
        assert_eq!(removed.map(|e| e.container_name), Some("orders".to_string()));
        assert!(ledger.get("orders").unwrap().is_none());
        assert!(ledger.delete("orders").unwrap().is_none());
    }

    #[test]
    fn put_refuses_to_overwrite_without_replace() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::in_dir(dir.path());
        ledger.put(entry("orders"), false).unwrap();

        let err = ledger.put(entry("orders"), false).unwrap_err();
        assert!(matches!(err, InjectError::AlreadyInstrumented(ref n) if n == "orders"));

        let mut updated = entry("orders");
        updated.image = "acme/app:2".into();
        ledger.put(updated, true).unwrap();
        assert_eq!(ledger.get("orders").unwrap().unwrap().image, "acme/app:2");
        assert_eq!(ledger.list().unwrap().len(), 1);
    }

    #[test]
    fn document_carries_version_and_timestamp() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::in_dir(dir.path());
        ledger.put(entry("a"), false).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(ledger.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert!(raw["updated_at"].as_u64().unwrap() > 0);
        assert_eq!(raw["containers"]["a"]["container_name"], "a");
    }

    #[test]
    fn unknown_version_is_corrupt_and_left_untouched() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::in_dir(dir.path());
        let content = r#"{"version": 2, "containers": {}, "updated_at": 0}"#;
        fs::write(ledger.path(), content).unwrap();

        assert!(matches!(ledger.list(), Err(InjectError::LedgerCorrupt { .. })));
        assert!(matches!(
            ledger.put(entry("a"), false),
            Err(InjectError::LedgerCorrupt { .. })
        ));
        assert_eq!(fs::read_to_string(ledger.path()).unwrap(), content);
    }

    #[test]
    fn garbage_and_unversioned_documents_are_corrupt() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::in_dir(dir.path());
        for content in ["{not json", "", r#"{"containers": {}}"#] {
            fs::write(ledger.path(), content).unwrap();
            assert!(
                matches!(ledger.get("a"), Err(InjectError::LedgerCorrupt { .. })),
                "accepted {:?}",
                content
            );
        }
    }

    #[test]
    fn mismatched_keys_are_corrupt() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::in_dir(dir.path());
        let doc = serde_json::json!({
            "version": 1,
            "containers": {"a": entry("b")},
            "updated_at": 0,
        });
        fs::write(ledger.path(), doc.to_string()).unwrap();
        assert!(matches!(ledger.list(), Err(InjectError::LedgerCorrupt { .. })));
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::in_dir(dir.path());
        let doc = serde_json::json!({
            "version": 1,
            "containers": {"old": {
                "container_id": "1",
                "container_name": "old",
                "image": "img",
                "instrumented_at": 5,
                "agent_path": "/a.jar"
            }},
            "updated_at": 5,
        });
        fs::write(ledger.path(), doc.to_string()).unwrap();
        let found = ledger.get("old").unwrap().unwrap();
        assert!(!found.has_restore_command());
        assert!(!found.is_compose());
    }

    #[test]
    fn concurrent_writers_do_not_lose_entries() {
        let dir = TempDir::new().unwrap();
        let path = Arc::new(dir.path().join("docker.json"));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = Arc::clone(&path);
                thread::spawn(move || {
                    let ledger = Ledger::new(path.as_ref().clone());
                    for j in 0..5 {
                        ledger.put(entry(&format!("c{}-{}", i, j)), false).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let ledger = Ledger::new(path.as_ref().clone());
        assert_eq!(ledger.list().unwrap().len(), 40);
    }
}
