//! Model snapshot resolution, offline integrity verification, and
//! durable delivery state.

pub mod error;
pub mod hub;
pub mod integrity;
pub mod manifest;
pub mod state;

pub use error::{Error, Result};
pub use manifest::Manifest;

use std::path::{Path, PathBuf};

use pageread_core::{ModelDeliveryState, ModelFileRecord, ModelSnapshotRecord};

use crate::integrity::{is_sha256_hex, normalize_etag, sha256_file};

/// Local directories for the two models a pipeline needs, resolved by
/// [`ensure_ready`].
#[derive(Debug, Clone)]
pub struct ResolvedModelPaths {
    pub recognizer_dir: PathBuf,
    pub layout_dir: PathBuf,
}

/// Resolves both the recognizer and layout model snapshots: a
/// local-path id is used as-is, otherwise a hub snapshot is fetched,
/// validated, and integrity-checked before the delivery state is
/// persisted atomically.
pub fn ensure_ready(recognizer_id: &str, layout_id: &str) -> Result<ResolvedModelPaths> {
    let state_path = state::state_file_path();
    let cache_dir = state::hub_cache_dir();
    let manifest = Manifest::default();

    let mut state = state::load_state_or_default(&state_path);
    let recognizer_dir = resolve_model(&mut state, &cache_dir, recognizer_id, &manifest)?;
    let layout_dir = resolve_model(&mut state, &cache_dir, layout_id, &manifest)?;
    state::write_state_atomically(&state_path, &state)?;

    Ok(ResolvedModelPaths { recognizer_dir, layout_dir })
}

fn resolve_model(state: &mut ModelDeliveryState, cache_dir: &Path, model_id: &str, manifest: &Manifest) -> Result<PathBuf> {
    let local = Path::new(model_id);
    if local.is_dir() {
        tracing::debug!(model_id, "using local model path as-is");
        return Ok(local.to_path_buf());
    }

    tracing::info!(model_id, "resolving model snapshot from hub");
    let (snapshot_dir, files) = hub::fetch_snapshot(cache_dir, model_id, manifest)?;

    let missing = manifest::missing_required(&manifest.required_files, &files);
    if let Some(first) = missing.first() {
        return Err(Error::MissingRequiredFile((*first).to_string()));
    }
    if !manifest::has_safetensors(&files) {
        return Err(Error::NoSafetensorsFound(model_id.to_string()));
    }

    let mut records = Vec::with_capacity(files.len());
    let mut revision = "main".to_string();
    for relative_path in &files {
        let remote = hub::fetch_remote_file_info(model_id, relative_path, "main")?;
        revision = remote.revision.clone();
        let normalized = normalize_etag(&remote.etag);
        let local_path = snapshot_dir.join(relative_path);
        let integrity_value = if is_sha256_hex(&normalized) {
            let actual = sha256_file(&local_path)?;
            if actual != normalized {
                return Err(Error::ChecksumMismatch { path: relative_path.clone(), expected: normalized, actual });
            }
            normalized
        } else {
            sha256_file(&local_path)?
        };
        records.push(ModelFileRecord {
            relative_path: relative_path.clone(),
            etag: integrity_value,
            commit_hash: Some(remote.revision),
        });
    }
    records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    state.models.insert(
        model_id.to_string(),
        ModelSnapshotRecord {
            revision,
            snapshot_path: snapshot_dir.to_string_lossy().into_owned(),
            updated_at_utc: chrono::Utc::now().to_rfc3339(),
            files: records,
        },
    );

    Ok(snapshot_dir)
}

/// Recomputes SHA-256 for every integrity path in the persisted state
/// and compares against what was recorded; never contacts the hub.
pub fn verify_offline_readiness(model_ids: &[&str]) -> Result<()> {
    let state_path = state::state_file_path();
    let state = state::load_state(&state_path)?;
    verify_state(&state, model_ids)
}

fn verify_state(state: &ModelDeliveryState, model_ids: &[&str]) -> Result<()> {
    for model_id in model_ids {
        let record = state
            .models
            .get(*model_id)
            .ok_or_else(|| Error::MissingMetadata((*model_id).to_string()))?;
        let snapshot_dir = Path::new(&record.snapshot_path);
        for file in &record.files {
            let local_path = snapshot_dir.join(&file.relative_path);
            let actual = sha256_file(&local_path)?;
            if actual != file.etag {
                return Err(Error::ChecksumMismatch {
                    path: file.relative_path.clone(),
                    expected: file.etag.clone(),
                    actual,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pageread_core::{ModelFileRecord, ModelSnapshotRecord};

    fn state_with_file(dir: &Path, relative_path: &str, content: &[u8]) -> ModelDeliveryState {
        std::fs::write(dir.join(relative_path), content).unwrap();
        let etag = sha256_file(&dir.join(relative_path)).unwrap();
        let mut state = ModelDeliveryState::default();
        state.models.insert(
            "org/model".to_string(),
            ModelSnapshotRecord {
                revision: "abc123".to_string(),
                snapshot_path: dir.to_string_lossy().into_owned(),
                updated_at_utc: "2026-01-01T00:00:00Z".to_string(),
                files: vec![ModelFileRecord { relative_path: relative_path.to_string(), etag, commit_hash: None }],
            },
        );
        state
    }

    #[test]
    fn verify_state_succeeds_when_checksums_match() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_file(dir.path(), "model.safetensors", b"weights");
        assert!(verify_state(&state, &["org/model"]).is_ok());
    }

    #[test]
    fn verify_state_fails_with_checksum_mismatch_on_tampered_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_file(dir.path(), "model.safetensors", b"weights");
        std::fs::write(dir.path().join("model.safetensors"), b"tampered").unwrap();
        let err = verify_state(&state, &["org/model"]).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn verify_state_fails_when_model_has_no_metadata_entry() {
        let state = ModelDeliveryState::default();
        let err = verify_state(&state, &["org/unknown"]).unwrap_err();
        assert!(matches!(err, Error::MissingMetadata(_)));
    }

    #[test]
    fn resolve_model_uses_local_directory_as_is_without_network_access() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = ModelDeliveryState::default();
        let manifest = Manifest::default();
        let resolved = resolve_model(&mut state, dir.path(), dir.path().to_str().unwrap(), &manifest).unwrap();
        assert_eq!(resolved, dir.path());
        assert!(state.models.is_empty());
    }
}
