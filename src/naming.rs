//! Default service names derived from container identity.

use crate::docker::compose::LABEL_SERVICE;
use crate::docker::snapshot::RuntimeSnapshot;

const FALLBACK_SERVICE_NAME: &str = "java-service";

/// Slugified compose service name, else container name, wrapped in the
/// configured prefix and suffix.
pub fn service_name_for(
    snapshot: &RuntimeSnapshot,
    prefix: Option<&str>,
    suffix: Option<&str>,
) -> String {
    let base = snapshot
        .label(LABEL_SERVICE)
        .map(slug::slugify)
        .filter(|s| !s.is_empty())
        .or_else(|| Some(slug::slugify(&snapshot.name)).filter(|s| !s.is_empty()))
        .unwrap_or_else(|| FALLBACK_SERVICE_NAME.to_string());

    format!(
        "{}{}{}",
        prefix.unwrap_or_default(),
        base,
        suffix.unwrap_or_default()
    )
}
