//! Deployment record store
//!
//! One record per deployment. Every change after insertion goes through
//! [`DeploymentStore::compare_and_swap`] keyed on `transition_version`, which
//! is what makes the orchestrator the single writer per id.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::OrchestratorError;
use crate::filesys::dir::Dir;
use crate::models::deployment::{Deployment, DeploymentStatus};

/// Filter for listing deployments
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    pub owner_id: Option<String>,
    pub statuses: Vec<DeploymentStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl DeploymentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Match this status; repeated calls widen the match
    pub fn status(mut self, status: DeploymentStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn matches(&self, record: &Deployment) -> bool {
        if let Some(owner_id) = &self.owner_id {
            if &record.owner_id != owner_id {
                return false;
            }
        }
        self.statuses.is_empty() || self.statuses.contains(&record.status)
    }
}

/// Storage backend for deployment records
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert a new record. Fails with `IdempotencyConflict` when the owner
    /// already used the record's idempotency key.
    async fn insert(&self, record: &Deployment) -> Result<Deployment, OrchestratorError>;

    async fn get(&self, id: &str) -> Result<Option<Deployment>, OrchestratorError>;

    /// Replace the record if its stored `transition_version` still equals
    /// `expected`. The stored copy gets `expected + 1`.
    async fn compare_and_swap(
        &self,
        record: &Deployment,
        expected: u64,
    ) -> Result<Deployment, OrchestratorError>;

    async fn find_by_idempotency_key(
        &self,
        owner_id: &str,
        key: &str,
    ) -> Result<Option<Deployment>, OrchestratorError>;

    /// Records matching the filter, oldest first
    async fn list(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>, OrchestratorError>;
}

// ================================== MEMORY ======================================= //

/// In-memory deployment store.
///
/// Data is lost when the process exits; used by tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    deployments: RwLock<HashMap<String, Deployment>>,
    idempotency: RwLock<HashMap<(String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> OrchestratorError {
        OrchestratorError::StorageError("lock poisoned".to_string())
    }

    fn insert_sync(&self, record: &Deployment) -> Result<Deployment, OrchestratorError> {
        let mut deployments = self.deployments.write().map_err(|_| Self::poisoned())?;
        let mut idempotency = self.idempotency.write().map_err(|_| Self::poisoned())?;

        if deployments.contains_key(&record.id) {
            return Err(OrchestratorError::StorageError(format!(
                "deployment {} already exists",
                record.id
            )));
        }

        if let Some(key) = &record.idempotency_key {
            let index_key = (record.owner_id.clone(), key.clone());
            if idempotency.contains_key(&index_key) {
                return Err(OrchestratorError::IdempotencyConflict(key.clone()));
            }
            idempotency.insert(index_key, record.id.clone());
        }

        deployments.insert(record.id.clone(), record.clone());
        Ok(record.clone())
    }

    /// Check the CAS precondition without writing
    fn check_version(
        &self,
        record: &Deployment,
        expected: u64,
    ) -> Result<Deployment, OrchestratorError> {
        let deployments = self.deployments.read().map_err(|_| Self::poisoned())?;
        let stored = deployments
            .get(&record.id)
            .ok_or_else(|| OrchestratorError::NotFound(record.id.clone()))?;
        if stored.transition_version != expected {
            return Err(OrchestratorError::StaleTransition(record.id.clone()));
        }
        let mut next = record.clone();
        next.transition_version = expected + 1;
        Ok(next)
    }

    fn swap_sync(&self, record: &Deployment, expected: u64) -> Result<Deployment, OrchestratorError> {
        let mut deployments = self.deployments.write().map_err(|_| Self::poisoned())?;
        let stored = deployments
            .get_mut(&record.id)
            .ok_or_else(|| OrchestratorError::NotFound(record.id.clone()))?;

        if stored.transition_version != expected {
            return Err(OrchestratorError::StaleTransition(record.id.clone()));
        }

        let mut next = record.clone();
        next.transition_version = expected + 1;
        *stored = next.clone();
        Ok(next)
    }

    fn load(&self, record: Deployment) -> Result<(), OrchestratorError> {
        let mut deployments = self.deployments.write().map_err(|_| Self::poisoned())?;
        let mut idempotency = self.idempotency.write().map_err(|_| Self::poisoned())?;
        if let Some(key) = &record.idempotency_key {
            idempotency.insert((record.owner_id.clone(), key.clone()), record.id.clone());
        }
        deployments.insert(record.id.clone(), record);
        Ok(())
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert(&self, record: &Deployment) -> Result<Deployment, OrchestratorError> {
        self.insert_sync(record)
    }

    async fn get(&self, id: &str) -> Result<Option<Deployment>, OrchestratorError> {
        let deployments = self.deployments.read().map_err(|_| Self::poisoned())?;
        Ok(deployments.get(id).cloned())
    }

    async fn compare_and_swap(
        &self,
        record: &Deployment,
        expected: u64,
    ) -> Result<Deployment, OrchestratorError> {
        self.swap_sync(record, expected)
    }

    async fn find_by_idempotency_key(
        &self,
        owner_id: &str,
        key: &str,
    ) -> Result<Option<Deployment>, OrchestratorError> {
        let id = {
            let idempotency = self.idempotency.read().map_err(|_| Self::poisoned())?;
            idempotency
                .get(&(owner_id.to_string(), key.to_string()))
                .cloned()
        };
        match id {
            Some(id) => self.get(&id).await,
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>, OrchestratorError> {
        let deployments = self.deployments.read().map_err(|_| Self::poisoned())?;

        let mut results: Vec<_> = deployments
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        results.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let offset = filter.offset.unwrap_or(0);
        let results = results.into_iter().skip(offset);
        Ok(match filter.limit {
            Some(limit) => results.take(limit).collect(),
            None => results.collect(),
        })
    }
}

// =================================== FILE ======================================== //

/// Deployment store persisted as one JSON file per record.
///
/// Records are cached in memory; writes are serialized and hit the disk
/// (atomically) before the cache is updated.
#[derive(Debug)]
pub struct FileStore {
    dir: Dir,
    cache: MemoryStore,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open the store, loading every record found in `dir`
    pub async fn open(dir: Dir) -> Result<Self, OrchestratorError> {
        dir.create().await?;
        let cache = MemoryStore::new();

        for path in dir.list_files().await? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let file = crate::filesys::file::File::new(&path);
            match file.read_json::<Deployment>().await {
                Ok(record) => cache.load(record)?,
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }

        debug!(dir = %dir.path().display(), "Opened record store");
        Ok(Self {
            dir,
            cache,
            write_lock: Mutex::new(()),
        })
    }

    fn record_file(&self, id: &str) -> crate::filesys::file::File {
        self.dir.file(&format!("{}.json", id))
    }
}

#[async_trait]
impl DeploymentStore for FileStore {
    async fn insert(&self, record: &Deployment) -> Result<Deployment, OrchestratorError> {
        let _guard = self.write_lock.lock().await;

        if let Some(key) = &record.idempotency_key {
            if self
                .cache
                .find_by_idempotency_key(&record.owner_id, key)
                .await?
                .is_some()
            {
                return Err(OrchestratorError::IdempotencyConflict(key.clone()));
            }
        }
        if self.cache.get(&record.id).await?.is_some() {
            return Err(OrchestratorError::StorageError(format!(
                "deployment {} already exists",
                record.id
            )));
        }

        self.record_file(&record.id).write_json(record).await?;
        self.cache.insert_sync(record)
    }

    async fn get(&self, id: &str) -> Result<Option<Deployment>, OrchestratorError> {
        self.cache.get(id).await
    }

    async fn compare_and_swap(
        &self,
        record: &Deployment,
        expected: u64,
    ) -> Result<Deployment, OrchestratorError> {
        let _guard = self.write_lock.lock().await;

        let next = self.cache.check_version(record, expected)?;
        self.record_file(&next.id).write_json(&next).await?;
        self.cache.swap_sync(record, expected)
    }

    async fn find_by_idempotency_key(
        &self,
        owner_id: &str,
        key: &str,
    ) -> Result<Option<Deployment>, OrchestratorError> {
        self.cache.find_by_idempotency_key(owner_id, key).await
    }

    async fn list(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>, OrchestratorError> {
        self.cache.list(filter).await
    }
}
