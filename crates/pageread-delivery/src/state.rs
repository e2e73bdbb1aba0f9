//! Persisted delivery state: location, loading, and atomic durable
//! writes.

use std::path::{Path, PathBuf};

use pageread_core::ModelDeliveryState;

use crate::error::{Error, Result};

/// `<app_support>` root, matching the layout `dirs` resolves for every
/// other on-disk artifact in the pack (config dirs, caches).
pub fn app_support_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("GlmOCRSwift")
}

pub fn state_file_path() -> PathBuf {
    app_support_dir().join("ModelDelivery").join("model-delivery-state.json")
}

pub fn hub_cache_dir() -> PathBuf {
    app_support_dir().join("huggingface").join("hub")
}

pub fn load_state(path: &Path) -> Result<ModelDeliveryState> {
    let bytes = std::fs::read(path).map_err(|_| Error::MissingState(path.display().to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::MissingState(format!("{}: {e}", path.display())))
}

pub fn load_state_or_default(path: &Path) -> ModelDeliveryState {
    load_state(path).unwrap_or_default()
}

/// Writes state to a temp file in the same directory, then renames over
/// the target — a crash or cancellation between the two leaves the old
/// state intact rather than a truncated file.
pub fn write_state_atomically(path: &Path, state: &ModelDeliveryState) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Io(format!("{}: no parent directory", path.display())))?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut tmp, state).map_err(|e| Error::Io(e.to_string()))?;
    tmp.persist(path).map_err(|e| Error::Io(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pageread_core::{ModelFileRecord, ModelSnapshotRecord};

    fn sample_state() -> ModelDeliveryState {
        let mut state = ModelDeliveryState::default();
        state.models.insert(
            "org/model".to_string(),
            ModelSnapshotRecord {
                revision: "abc123".to_string(),
                snapshot_path: "/tmp/org-model".to_string(),
                updated_at_utc: "2026-01-01T00:00:00Z".to_string(),
                files: vec![ModelFileRecord {
                    relative_path: "config.json".to_string(),
                    etag: "deadbeef".to_string(),
                    commit_hash: Some("abc123".to_string()),
                }],
            },
        );
        state
    }

    #[test]
    fn write_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let state = sample_state();
        write_state_atomically(&path, &state).unwrap();
        let loaded = load_state(&path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn load_missing_state_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(load_state(&path).is_err());
        assert_eq!(load_state_or_default(&path), ModelDeliveryState::default());
    }

    #[test]
    fn write_leaves_no_partial_file_on_disk_before_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_state_atomically(&path, &sample_state()).unwrap();
        assert!(path.exists());
        let siblings: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(siblings.len(), 1, "no leftover temp file after persist");
    }
}
