//! HuggingFace Hub snapshot resolution, with a `ureq`-based manual step
//! for the one thing `hf-hub`'s sync API doesn't expose: the raw
//! response headers needed to read a file's ETag.

use std::path::{Path, PathBuf};

use hf_hub::api::sync::ApiBuilder;

use crate::error::{Error, Result};
use crate::manifest::Manifest;

/// A file's identity on the hub as of the most recent HEAD request.
pub struct RemoteFileInfo {
    pub etag: String,
    pub revision: String,
}

/// Downloads every manifest-matching file from `model_id`'s `main`
/// revision into the shared hub cache, returning the resolved snapshot
/// directory and the filenames that were fetched (relative to it).
pub fn fetch_snapshot(cache_dir: &Path, model_id: &str, manifest: &Manifest) -> Result<(PathBuf, Vec<String>)> {
    let api = ApiBuilder::new()
        .with_cache_dir(cache_dir.to_path_buf())
        .with_progress(false)
        .build()
        .map_err(|e| Error::HubRequestFailed(e.to_string()))?;
    let repo = api.model(model_id.to_string());

    let info = repo.info().map_err(|e| Error::HubRequestFailed(e.to_string()))?;
    let matching: Vec<String> = info
        .siblings
        .iter()
        .map(|sibling| sibling.rfilename.clone())
        .filter(|name| manifest.matches(name))
        .collect();

    let mut snapshot_dir = None;
    for name in &matching {
        let local = repo.get(name).map_err(|e| Error::HubRequestFailed(format!("{name}: {e}")))?;
        if snapshot_dir.is_none() {
            snapshot_dir = local.parent().map(Path::to_path_buf);
        }
    }

    let snapshot_dir = snapshot_dir
        .ok_or_else(|| Error::MissingRequiredFile(format!("{model_id}: no files matched the manifest")))?;
    Ok((snapshot_dir, matching))
}

/// HEAD the file's canonical resolve URL to read its ETag and resolved
/// commit without re-downloading the body.
pub fn fetch_remote_file_info(model_id: &str, relative_path: &str, revision: &str) -> Result<RemoteFileInfo> {
    let url = format!("https://huggingface.co/{model_id}/resolve/{revision}/{relative_path}");
    let response = ureq::head(&url)
        .call()
        .map_err(|e| Error::HubRequestFailed(format!("{url}: {e}")))?;
    let etag = response
        .header("x-linked-etag")
        .or_else(|| response.header("etag"))
        .ok_or_else(|| Error::HubRequestFailed(format!("{url}: response had no ETag header")))?
        .to_string();
    let resolved_revision = response
        .header("x-repo-commit")
        .map(str::to_string)
        .unwrap_or_else(|| revision.to_string());
    Ok(RemoteFileInfo { etag, revision: resolved_revision })
}
