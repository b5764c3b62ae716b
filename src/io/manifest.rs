use crate::types::{SessionRecord, TilerError, TilerResult};
use std::fs;
use std::path::PathBuf;

/// Name of the manifest written next to a session's tiles
pub const MANIFEST_FILE_NAME: &str = "session.json";

/// Pretty-printed JSON form of a session record
pub fn manifest_json(record: &SessionRecord) -> TilerResult<String> {
    serde_json::to_string_pretty(record).map_err(|e| {
        TilerError::Serialization(format!(
            "Failed to serialize session {}: {}",
            record.session_id, e
        ))
    })
}

/// Writes the manifest into the session's storage directory
pub fn write_manifest(record: &SessionRecord) -> TilerResult<PathBuf> {
    let path = record.storage_location.join(MANIFEST_FILE_NAME);
    fs::write(&path, manifest_json(record)?).map_err(|e| {
        TilerError::Write(format!("Failed to write manifest {}: {}", path.display(), e))
    })?;
    log::debug!("Wrote manifest {}", path.display());
    Ok(path)
}
