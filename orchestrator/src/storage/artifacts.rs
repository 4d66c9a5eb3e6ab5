//! Content-addressed artifact store
//!
//! An artifact is a model file plus its optional requirements manifest.
//! References are `sha256:<hex>` over filename, model bytes and manifest, so
//! the same upload always maps to the same reference.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::OrchestratorError;
use crate::filesys::dir::Dir;
use crate::utils::is_content_ref;

/// Artifact metadata, available without reading the body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub artifact_ref: String,

    /// Original model filename, e.g. `model.pkl`
    pub filename: String,

    /// Model size in bytes
    pub size: u64,

    pub has_manifest: bool,
    pub created_at: DateTime<Utc>,
}

/// Model file and manifest
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub meta: ArtifactMeta,
    pub model: Vec<u8>,

    /// `requirements.txt` contents
    pub manifest: Option<String>,
}

/// Blob store holding model artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact and return its reference
    async fn put(
        &self,
        filename: &str,
        model: Vec<u8>,
        manifest: Option<String>,
    ) -> Result<String, OrchestratorError>;

    /// Fetch an artifact. `NotFound` when the reference is unknown.
    async fn get(&self, artifact_ref: &str) -> Result<Artifact, OrchestratorError>;

    /// Fetch metadata only
    async fn head(&self, artifact_ref: &str) -> Result<ArtifactMeta, OrchestratorError>;
}

/// Compute the reference of an artifact
pub fn artifact_ref_for(filename: &str, model: &[u8], manifest: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    hasher.update([0u8]);
    hasher.update(model);
    hasher.update([0u8]);
    if let Some(manifest) = manifest {
        hasher.update(manifest.as_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("sha256:{}", hex)
}

fn check_filename(filename: &str) -> Result<(), OrchestratorError> {
    if filename.is_empty()
        || filename.contains('/')
        || filename.contains('\\')
        || filename.starts_with('.')
    {
        return Err(OrchestratorError::InvalidArtifact(format!(
            "invalid model filename: {:?}",
            filename
        )));
    }
    Ok(())
}

fn check_ref(artifact_ref: &str) -> Result<&str, OrchestratorError> {
    if !is_content_ref(artifact_ref) {
        return Err(OrchestratorError::NotFound(format!(
            "artifact {}",
            artifact_ref
        )));
    }
    Ok(&artifact_ref["sha256:".len()..])
}

fn not_found(artifact_ref: &str) -> OrchestratorError {
    OrchestratorError::NotFound(format!("artifact {}", artifact_ref))
}

// ================================== MEMORY ======================================= //

/// In-memory artifact store
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: RwLock<HashMap<String, Artifact>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        filename: &str,
        model: Vec<u8>,
        manifest: Option<String>,
    ) -> Result<String, OrchestratorError> {
        check_filename(filename)?;
        let artifact_ref = artifact_ref_for(filename, &model, manifest.as_deref());

        let mut artifacts = self
            .artifacts
            .write()
            .map_err(|_| OrchestratorError::StorageError("lock poisoned".to_string()))?;
        artifacts
            .entry(artifact_ref.clone())
            .or_insert_with(|| Artifact {
                meta: ArtifactMeta {
                    artifact_ref: artifact_ref.clone(),
                    filename: filename.to_string(),
                    size: model.len() as u64,
                    has_manifest: manifest.is_some(),
                    created_at: Utc::now(),
                },
                model,
                manifest,
            });

        Ok(artifact_ref)
    }

    async fn get(&self, artifact_ref: &str) -> Result<Artifact, OrchestratorError> {
        let artifacts = self
            .artifacts
            .read()
            .map_err(|_| OrchestratorError::StorageError("lock poisoned".to_string()))?;
        artifacts
            .get(artifact_ref)
            .cloned()
            .ok_or_else(|| not_found(artifact_ref))
    }

    async fn head(&self, artifact_ref: &str) -> Result<ArtifactMeta, OrchestratorError> {
        let artifacts = self
            .artifacts
            .read()
            .map_err(|_| OrchestratorError::StorageError("lock poisoned".to_string()))?;
        artifacts
            .get(artifact_ref)
            .map(|a| a.meta.clone())
            .ok_or_else(|| not_found(artifact_ref))
    }
}

// =================================== FILE ======================================== //

/// Artifact store on the local filesystem.
///
/// Layout: `<dir>/<hex>/{meta.json, model, requirements.txt}`
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    dir: Dir,
}

impl FsArtifactStore {
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }

    fn artifact_dir(&self, artifact_ref: &str) -> Result<Dir, OrchestratorError> {
        let hex = check_ref(artifact_ref)?;
        Ok(self.dir.subdir(hex))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        filename: &str,
        model: Vec<u8>,
        manifest: Option<String>,
    ) -> Result<String, OrchestratorError> {
        check_filename(filename)?;
        let artifact_ref = artifact_ref_for(filename, &model, manifest.as_deref());
        let dir = self.artifact_dir(&artifact_ref)?;

        if dir.file("meta.json").exists().await {
            return Ok(artifact_ref);
        }

        let meta = ArtifactMeta {
            artifact_ref: artifact_ref.clone(),
            filename: filename.to_string(),
            size: model.len() as u64,
            has_manifest: manifest.is_some(),
            created_at: Utc::now(),
        };

        dir.file("model").write_atomic(&model).await?;
        if let Some(manifest) = &manifest {
            dir.file("requirements.txt")
                .write_atomic(manifest.as_bytes())
                .await?;
        }
        // meta.json last: its presence marks a complete artifact
        dir.file("meta.json").write_json(&meta).await?;

        debug!(artifact_ref = %artifact_ref, size = meta.size, "Stored artifact");
        Ok(artifact_ref)
    }

    async fn get(&self, artifact_ref: &str) -> Result<Artifact, OrchestratorError> {
        let meta = self.head(artifact_ref).await?;
        let dir = self.artifact_dir(artifact_ref)?;

        let model = dir.file("model").read_bytes().await?;
        let manifest = if meta.has_manifest {
            Some(dir.file("requirements.txt").read_string().await?)
        } else {
            None
        };

        Ok(Artifact {
            meta,
            model,
            manifest,
        })
    }

    async fn head(&self, artifact_ref: &str) -> Result<ArtifactMeta, OrchestratorError> {
        let meta_file = self.artifact_dir(artifact_ref)?.file("meta.json");
        if !meta_file.exists().await {
            return Err(not_found(artifact_ref));
        }
        meta_file.read_json().await
    }
}
