//! Artifact store: per-session persistence of pipeline step results.
//!
//! Layout under the artifacts root:
//! ```text
//! <root>/<session_id>/meta.json            # index of all artifacts
//! <root>/<session_id>/<node_id>/<aid>.json # result envelope
//! <root>/<session_id>/<node_id>/<file>     # extracted blobs
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cf_domain::{short_hex_id, unix_now, Error, Result};

use crate::blob::extract_media_blobs;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub session_id: String,
    pub artifact_id: String,
    pub node_id: String,
    pub path: String,
    pub summary: Option<String>,
    pub created_at: f64,
}

/// The persisted result envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEnvelope {
    pub payload: Value,
    pub session_id: String,
    pub artifact_id: String,
    pub node_id: String,
    pub created_at: f64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ArtifactStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One store per (artifacts root, session). Writers within a session
/// serialize on the internal lock; `meta.json` is rewritten in place on
/// every append.
pub struct ArtifactStore {
    session_id: String,
    session_dir: PathBuf,
    meta_path: PathBuf,
    meta_lock: Mutex<()>,
}

impl ArtifactStore {
    pub fn new(artifacts_dir: &Path, session_id: &str) -> Result<Self> {
        let session_dir = artifacts_dir.join(session_id);
        fs::create_dir_all(&session_dir)?;
        let meta_path = session_dir.join("meta.json");

        let store = Self {
            session_id: session_id.to_string(),
            session_dir,
            meta_path,
            meta_lock: Mutex::new(()),
        };
        if !store.meta_path.exists()
            || store.meta_path.metadata().map(|m| m.len()).unwrap_or(0) == 0
        {
            store.write_meta_list(&[])?;
        }
        Ok(store)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Mint `<node_id>_<8-hex>`.
    pub fn generate_artifact_id(&self, node_id: &str) -> String {
        format!("{node_id}_{}", short_hex_id(8))
    }

    /// Persist one step result: extract inlined blobs (into the node's
    /// artifact directory unless `blob_dir` redirects them, as the
    /// media-search node does with the session media dir), write the
    /// envelope, append to the index.
    pub fn save_result(
        &self,
        node_id: &str,
        artifact_id: &str,
        summary: Option<&str>,
        mut payload: Value,
        blob_dir: Option<&Path>,
    ) -> Result<ArtifactMeta> {
        let created_at = unix_now();
        let node_dir = self.session_dir.join(node_id);
        fs::create_dir_all(&node_dir)?;

        let blob_target = blob_dir.unwrap_or(&node_dir);
        extract_media_blobs(&mut payload, blob_target, artifact_id)?;

        let envelope = ArtifactEnvelope {
            payload,
            session_id: self.session_id.clone(),
            artifact_id: artifact_id.to_string(),
            node_id: node_id.to_string(),
            created_at,
        };

        let file_path = node_dir.join(format!("{artifact_id}.json"));
        fs::write(&file_path, serde_json::to_vec_pretty(&envelope)?)?;
        tracing::info!(node_id, artifact_id, path = %file_path.display(), "saved step result");

        let meta = ArtifactMeta {
            session_id: self.session_id.clone(),
            artifact_id: artifact_id.to_string(),
            node_id: node_id.to_string(),
            path: file_path.to_string_lossy().into_owned(),
            summary: summary.map(str::to_string),
            created_at,
        };
        self.append_meta(meta.clone())?;
        Ok(meta)
    }

    /// Load an artifact by id. `NotFound` if the index has no entry.
    pub fn load_result(&self, artifact_id: &str) -> Result<(ArtifactMeta, ArtifactEnvelope)> {
        let metas = self.load_meta_list()?;
        let meta = metas
            .into_iter()
            .find(|m| m.artifact_id == artifact_id)
            .ok_or_else(|| Error::not_found(format!("artifact `{artifact_id}`")))?;

        let raw = fs::read_to_string(&meta.path)?;
        let envelope: ArtifactEnvelope = serde_json::from_str(&raw)?;
        Ok((meta, envelope))
    }

    /// The most recently created artifact of a node, if any.
    pub fn get_latest_meta(&self, node_id: &str) -> Result<Option<ArtifactMeta>> {
        let metas = self.load_meta_list()?;
        Ok(metas
            .into_iter()
            .filter(|m| m.node_id == node_id && m.session_id == self.session_id)
            .max_by(|a, b| a.created_at.total_cmp(&b.created_at)))
    }

    // ── Private ──────────────────────────────────────────────────────

    fn load_meta_list(&self) -> Result<Vec<ArtifactMeta>> {
        if !self.meta_path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.meta_path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_meta_list(&self, metas: &[ArtifactMeta]) -> Result<()> {
        fs::write(&self.meta_path, serde_json::to_vec_pretty(metas)?)?;
        Ok(())
    }

    fn append_meta(&self, meta: ArtifactMeta) -> Result<()> {
        let _guard = self.meta_lock.lock();
        let mut metas = self.load_meta_list()?;
        metas.push(meta);
        self.write_meta_list(&metas)
    }
}
