//! Host-side checks on the agent JAR before it is mounted into containers.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

/// Mode that lets the container user read a bind-mounted JAR regardless of uid.
const WORLD_READABLE: u32 = 0o644;

/// Validate the agent JAR at `path`, fixing its mode when containers could not read it.
/// Returns true when the mode was changed.
pub fn prepare_agent(path: &Path) -> Result<bool> {
    if path.extension().and_then(|e| e.to_str()) != Some("jar") {
        bail!("Agent file must be a .jar file: {}", path.display());
    }
    let metadata = fs::metadata(path)
        .with_context(|| format!("Agent file does not exist: {}", path.display()))?;
    if !metadata.is_file() {
        bail!("Agent path is not a regular file: {}", path.display());
    }

    let mode = metadata.permissions().mode();
    if mode & 0o004 != 0 {
        return Ok(false);
    }

    warn!(
        path = %path.display(),
        mode = format!("{:o}", mode & 0o777),
        "agent:not world-readable, fixing permissions"
    );
    fs::set_permissions(path, fs::Permissions::from_mode(WORLD_READABLE)).with_context(|| {
        format!(
            "Agent file {} is not readable by container users and its mode could not be changed",
            path.display()
        )
    })?;
    info!(path = %path.display(), "agent:permissions set to 644");
    Ok(true)
}
