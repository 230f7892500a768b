//! Conflict records and their pending -> resolved/ignored lifecycle.

use super::{ConflictId, ConflictStatus, FileConflict, ProjectId};
use crate::error::{AppError, AppResult};
use crate::session::UserId;
use crate::storage::VersionStore;

#[derive(Clone)]
pub struct ConflictResolver {
    store: VersionStore,
}

impl ConflictResolver {
    pub fn new(store: VersionStore) -> Self {
        Self { store }
    }

    /// Persist a freshly detected conflict
    pub fn record(&self, conflict: &FileConflict) -> AppResult<()> {
        self.store.insert_conflict(conflict)?;
        tracing::info!(
            "Conflict {} recorded on {} (base {}, latest {})",
            conflict.id,
            conflict.file_path,
            conflict.base_version,
            conflict.latest_version
        );
        Ok(())
    }

    pub fn get(&self, id: ConflictId) -> AppResult<FileConflict> {
        self.store
            .conflict(id)?
            .ok_or_else(|| AppError::not_found("Conflict", id))
    }

    pub fn pending(&self, project_id: ProjectId, file_path: Option<&str>) -> AppResult<Vec<FileConflict>> {
        Ok(self.store.pending_conflicts(project_id, file_path)?)
    }

    pub fn resolve(&self, id: ConflictId, by: UserId) -> AppResult<FileConflict> {
        self.finish(id, ConflictStatus::Resolved, by)
    }

    pub fn ignore(&self, id: ConflictId, by: UserId) -> AppResult<FileConflict> {
        self.finish(id, ConflictStatus::Ignored, by)
    }

    fn finish(&self, id: ConflictId, to: ConflictStatus, by: UserId) -> AppResult<FileConflict> {
        let conflict = self.store.update_conflict(id, |c| c.transition(to, by))?;
        tracing::info!("Conflict {} marked {} by {}", id, to, by);
        Ok(conflict)
    }
}
