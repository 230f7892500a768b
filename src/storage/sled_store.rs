//! Sled-based storage for file versions and conflicts.
//!
//! Trees:
//! - `versions`: project ++ path ++ 0x00 ++ version(be) -> FileVersion
//! - `version_ids`: version id -> versions key
//! - `project_versions`: project ++ created_at(be) ++ version id -> versions key
//! - `conflicts`: conflict id -> FileConflict
//! - `project_conflicts`: project ++ created_at(be) ++ conflict id -> conflict id
//!
//! Appends run inside a multi-tree transaction that refuses to overwrite an
//! existing version number, so two writers racing on one path can never both
//! land version N.

use dashmap::DashMap;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::StorageConfig;
use crate::error::{AppError, AppResult};
use crate::vcs::{ConflictId, FileConflict, FileVersion, NewVersion, ProjectId, VersionId};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),

    #[error("Gave up appending to {path} after {attempts} attempts")]
    Contention { path: String, attempts: u32 },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

const TREE_VERSIONS: &str = "versions";
const TREE_VERSION_IDS: &str = "version_ids";
const TREE_PROJECT_VERSIONS: &str = "project_versions";
const TREE_CONFLICTS: &str = "conflicts";
const TREE_PROJECT_CONFLICTS: &str = "project_conflicts";

/// Abort reason when the version number we computed is already taken
struct VersionTaken;

/// Sled-backed store of version logs and conflict records
#[derive(Clone)]
pub struct VersionStore {
    db: Db,
    versions: Tree,
    version_ids: Tree,
    project_versions: Tree,
    conflicts: Tree,
    project_conflicts: Tree,
    /// One async mutex per (project, path)
    path_locks: Arc<DashMap<Vec<u8>, Arc<Mutex<()>>>>,
    config: StorageConfig,
}

impl VersionStore {
    /// Open or create a store
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let db = if config.temporary {
            sled::Config::new().temporary(true).open()?
        } else {
            let path = Path::new(&config.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::InitFailed(format!("Failed to create directory: {}", e))
                })?;
            }

            sled::Config::new()
                .path(&config.path)
                .cache_capacity(config.cache_size)
                .flush_every_ms(if config.flush_interval_ms > 0 {
                    Some(config.flush_interval_ms)
                } else {
                    None
                })
                .open()?
        };

        Ok(Self {
            versions: db.open_tree(TREE_VERSIONS)?,
            version_ids: db.open_tree(TREE_VERSION_IDS)?,
            project_versions: db.open_tree(TREE_PROJECT_VERSIONS)?,
            conflicts: db.open_tree(TREE_CONFLICTS)?,
            project_conflicts: db.open_tree(TREE_PROJECT_CONFLICTS)?,
            db,
            path_locks: Arc::new(DashMap::new()),
            config,
        })
    }

    /// Serialize writers on one (project, path); other paths are unaffected
    pub async fn lock_path(&self, project_id: ProjectId, file_path: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .path_locks
            .entry(path_prefix(project_id, file_path))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop lock entries nobody is holding or waiting on
    pub fn prune_path_locks(&self) -> usize {
        let before = self.path_locks.len();
        self.path_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.path_locks.len()
    }

    /// Highest version for the path, tombstones included
    pub fn head(&self, project_id: ProjectId, file_path: &str) -> StorageResult<Option<FileVersion>> {
        let prefix = path_prefix(project_id, file_path);
        match self.versions.scan_prefix(&prefix).next_back() {
            Some(item) => {
                let (_, value) = item?;
                Ok(Some(bincode::deserialize(&value)?))
            }
            None => Ok(None),
        }
    }

    /// Highest version that is not a tombstone
    pub fn latest(&self, project_id: ProjectId, file_path: &str) -> StorageResult<Option<FileVersion>> {
        let prefix = path_prefix(project_id, file_path);
        for item in self.versions.scan_prefix(&prefix).rev() {
            let (_, value) = item?;
            let version: FileVersion = bincode::deserialize(&value)?;
            if !version.is_deleted {
                return Ok(Some(version));
            }
        }
        Ok(None)
    }

    /// Versions of one path, newest first
    pub fn history(
        &self,
        project_id: ProjectId,
        file_path: &str,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<FileVersion>> {
        let prefix = path_prefix(project_id, file_path);
        self.versions
            .scan_prefix(&prefix)
            .rev()
            .skip(offset)
            .take(limit)
            .map(|item| {
                let (_, value) = item?;
                Ok(bincode::deserialize(&value)?)
            })
            .collect()
    }

    /// Versions across every path of a project, newest first
    pub fn project_versions(&self, project_id: ProjectId, limit: usize) -> StorageResult<Vec<FileVersion>> {
        let mut out = Vec::new();
        for item in self.project_versions.scan_prefix(project_id.as_bytes()).rev() {
            if out.len() >= limit {
                break;
            }
            let (_, version_key) = item?;
            let value = self.versions.get(&version_key)?.ok_or_else(|| {
                StorageError::Corruption(format!(
                    "project index points at missing version {}",
                    hex::encode(&version_key)
                ))
            })?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    /// Look a version up by id
    pub fn version(&self, id: VersionId) -> StorageResult<Option<FileVersion>> {
        let Some(version_key) = self.version_ids.get(id.as_bytes())? else {
            return Ok(None);
        };
        match self.versions.get(&version_key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Err(StorageError::Corruption(format!(
                "version id {} points at a missing record",
                id
            ))),
        }
    }

    /// Append the next version for the draft's path.
    ///
    /// The number is `head + 1`. If another writer takes that number first
    /// the head is re-read and the append retried.
    pub fn create_version(&self, draft: NewVersion) -> StorageResult<FileVersion> {
        let attempts = self.config.max_insert_attempts.max(1);

        for attempt in 1..=attempts {
            let next = self
                .head(draft.project_id, &draft.file_path)?
                .map(|v| v.version)
                .unwrap_or(0)
                + 1;
            let version = draft.clone().into_version(next);

            let key = version_key(version.project_id, &version.file_path, next);
            let index_key = timeline_key(version.project_id, version.created_at, version.id);
            let bytes = bincode::serialize(&version)?;

            let result = (&self.versions, &self.project_versions, &self.version_ids).transaction(
                |(versions, index, ids)| {
                    if versions.get(&key[..])?.is_some() {
                        return Err(ConflictableTransactionError::Abort(VersionTaken));
                    }
                    versions.insert(&key[..], &bytes[..])?;
                    index.insert(&index_key[..], &key[..])?;
                    ids.insert(&version.id.as_bytes()[..], &key[..])?;
                    Ok(())
                },
            );

            match result {
                Ok(()) => return Ok(version),
                Err(TransactionError::Abort(VersionTaken)) => {
                    tracing::debug!(
                        "Version {} of {} taken on attempt {}, retrying",
                        next,
                        version.file_path,
                        attempt
                    );
                }
                Err(TransactionError::Storage(e)) => return Err(e.into()),
            }
        }

        Err(StorageError::Contention {
            path: draft.file_path,
            attempts,
        })
    }

    pub fn insert_conflict(&self, conflict: &FileConflict) -> StorageResult<()> {
        let bytes = bincode::serialize(conflict)?;
        let index_key = timeline_key(conflict.project_id, conflict.created_at, conflict.id);

        (&self.conflicts, &self.project_conflicts)
            .transaction(|(conflicts, index)| {
                conflicts.insert(&conflict.id.as_bytes()[..], &bytes[..])?;
                index.insert(&index_key[..], &conflict.id.as_bytes()[..])?;
                Ok::<_, ConflictableTransactionError<()>>(())
            })
            .map_err(|e| match e {
                TransactionError::Storage(e) => StorageError::Sled(e),
                TransactionError::Abort(()) => {
                    StorageError::Corruption("conflict insert aborted".to_string())
                }
            })
    }

    pub fn conflict(&self, id: ConflictId) -> StorageResult<Option<FileConflict>> {
        match self.conflicts.get(id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Pending conflicts of a project, newest first, optionally for one path
    pub fn pending_conflicts(
        &self,
        project_id: ProjectId,
        file_path: Option<&str>,
    ) -> StorageResult<Vec<FileConflict>> {
        let mut out = Vec::new();
        for item in self.project_conflicts.scan_prefix(project_id.as_bytes()).rev() {
            let (_, id) = item?;
            let Some(value) = self.conflicts.get(&id)? else {
                continue;
            };
            let conflict: FileConflict = bincode::deserialize(&value)?;
            if conflict.status.is_terminal() {
                continue;
            }
            if file_path.map_or(true, |p| p == conflict.file_path) {
                out.push(conflict);
            }
        }
        Ok(out)
    }

    /// Read-modify-write a conflict atomically.
    ///
    /// The closure sees the stored record and may refuse the change; the
    /// record is only written back if it returns `Ok`.
    pub fn update_conflict<F>(&self, id: ConflictId, apply: F) -> AppResult<FileConflict>
    where
        F: Fn(&mut FileConflict) -> AppResult<()>,
    {
        let key = id.as_bytes();
        let result = self.conflicts.transaction(|tx| {
            let value = tx
                .get(&key[..])?
                .ok_or_else(|| ConflictableTransactionError::Abort(AppError::not_found("Conflict", id)))?;
            let mut conflict: FileConflict = bincode::deserialize(&value).map_err(|e| {
                ConflictableTransactionError::Abort(AppError::Persistence(e.into()))
            })?;

            apply(&mut conflict).map_err(ConflictableTransactionError::Abort)?;

            let bytes = bincode::serialize(&conflict).map_err(|e| {
                ConflictableTransactionError::Abort(AppError::Persistence(e.into()))
            })?;
            tx.insert(&key[..], bytes)?;
            Ok(conflict)
        });

        result.map_err(|e| match e {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => AppError::Persistence(err.into()),
        })
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            version_count: self.versions.len(),
            conflict_count: self.conflicts.len(),
            locked_paths: self.path_locks.len(),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }
}

/// Statistics about the storage
#[derive(Debug, Clone, serde::Serialize)]
pub struct StorageStats {
    pub version_count: usize,
    pub conflict_count: usize,
    pub locked_paths: usize,
    pub total_size_bytes: u64,
}

fn path_prefix(project_id: ProjectId, file_path: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + file_path.len() + 1 + 8);
    key.extend_from_slice(project_id.as_bytes());
    key.extend_from_slice(file_path.as_bytes());
    key.push(0);
    key
}

fn version_key(project_id: ProjectId, file_path: &str, version: u64) -> Vec<u8> {
    let mut key = path_prefix(project_id, file_path);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn timeline_key(project_id: ProjectId, at: chrono::DateTime<chrono::Utc>, id: Uuid) -> Vec<u8> {
    let micros = at.timestamp_micros().max(0) as u64;
    let mut key = Vec::with_capacity(16 + 8 + 16);
    key.extend_from_slice(project_id.as_bytes());
    key.extend_from_slice(&micros.to_be_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}
