//! The commit pipeline and the read side of version control.

use serde::Deserialize;

use super::{
    ConflictDetector, ConflictId, ConflictResolver, CommitRequest, DeleteRequest, FileConflict,
    FileVersion, PendingCommit, ProjectId, Verdict, VersionId,
};
use crate::directory::{ActivityEntry, Directories, ProjectDirectory, UserDirectory, UserRef};
use crate::error::{parse_id, AppError, AppResult};
use crate::notifier::Notifier;
use crate::storage::VersionStore;

/// Upper bound on one page of history
pub const MAX_HISTORY_LIMIT: usize = 500;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Request to close a conflict, as it arrives from a client
#[derive(Debug, Clone, Deserialize)]
pub struct ConflictDecision {
    pub conflict_id: String,
    #[serde(alias = "resolved_by_email", alias = "resolved_by")]
    pub user: String,
}

#[derive(Clone)]
pub struct VersionControl {
    store: VersionStore,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    notifier: Notifier,
    directories: Directories,
}

impl VersionControl {
    pub fn new(store: VersionStore, notifier: Notifier, directories: Directories) -> Self {
        Self {
            resolver: ConflictResolver::new(store.clone()),
            detector: ConflictDetector,
            store,
            notifier,
            directories,
        }
    }

    /// Append a new version, or record a conflict if the base is stale
    pub async fn commit(&self, request: CommitRequest) -> AppResult<FileVersion> {
        let commit = request.validate()?;
        self.apply(commit).await
    }

    /// Append a tombstone through the same pipeline as a commit
    pub async fn delete_file(&self, request: DeleteRequest) -> AppResult<FileVersion> {
        let commit = request.validate()?;
        self.apply(commit).await
    }

    async fn apply(&self, commit: PendingCommit) -> AppResult<FileVersion> {
        let project = self.directories.projects.require(commit.project_id).await?;
        let author = self.directories.users.require(&commit.author).await?;

        let guard = self.store.lock_path(commit.project_id, &commit.file_path).await;

        let head = self.store.head(commit.project_id, &commit.file_path)?;
        match self.detector.check(commit.base_version, head.as_ref()) {
            Verdict::Clear => {}
            Verdict::Ahead { base, latest } => {
                return Err(AppError::validation(format!(
                    "base_version {} is ahead of latest version {} for {}",
                    base, latest, commit.file_path
                )));
            }
            Verdict::Stale(head) => {
                let conflict = FileConflict::detected(&commit, author.id, head);
                self.resolver.record(&conflict)?;
                drop(guard);

                if conflict.remote_author_id != author.id {
                    self.notifier.conflict_detected(&conflict, &author);
                }
                self.directories
                    .activity
                    .record(
                        ActivityEntry::new(
                            author.id,
                            "file_conflict",
                            format!(
                                "Conflict on {} (base {}, latest {})",
                                conflict.file_path, conflict.base_version, conflict.latest_version
                            ),
                        )
                        .in_project(project.id),
                    )
                    .await;

                return Err(AppError::Conflict {
                    conflict_id: conflict.id,
                    file_path: conflict.file_path,
                    base_version: conflict.base_version,
                    latest_version: conflict.latest_version,
                });
            }
        }

        let version = self.store.create_version(commit.into_new_version(author.id))?;
        drop(guard);

        tracing::info!(
            user_id = %author.id,
            "{} v{} of {} in {}",
            if version.is_deleted { "Deleted" } else { "Committed" },
            version.version,
            version.file_path,
            project.id
        );

        let action = if version.is_deleted { "file_delete" } else { "file_commit" };
        self.directories
            .activity
            .record(
                ActivityEntry::new(
                    author.id,
                    action,
                    format!("{} {} v{}", action, version.file_path, version.version),
                )
                .in_project(project.id),
            )
            .await;

        match self.directories.project_members(&project, author.id).await {
            Ok(recipients) => self.notifier.file_committed(&version, &author, &recipients),
            Err(e) => tracing::warn!("Skipping commit notifications for {}: {}", version.file_path, e),
        }

        Ok(version)
    }

    /// Versions of a path, newest first
    pub fn file_history(
        &self,
        project_id: ProjectId,
        file_path: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> AppResult<Vec<FileVersion>> {
        super::validate_file_path(file_path)?;
        let limit = limit
            .filter(|&l| l > 0)
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .min(MAX_HISTORY_LIMIT);
        Ok(self.store.history(project_id, file_path, limit, offset)?)
    }

    /// Most recent non-deleted version of a path
    pub fn latest(&self, project_id: ProjectId, file_path: &str) -> AppResult<FileVersion> {
        super::validate_file_path(file_path)?;
        self.store
            .latest(project_id, file_path)?
            .ok_or_else(|| AppError::not_found("File", file_path))
    }

    pub fn version(&self, id: VersionId) -> AppResult<FileVersion> {
        self.store
            .version(id)?
            .ok_or_else(|| AppError::not_found("Version", id))
    }

    pub fn project_versions(&self, project_id: ProjectId, limit: Option<usize>) -> AppResult<Vec<FileVersion>> {
        let limit = limit
            .filter(|&l| l > 0)
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .min(MAX_HISTORY_LIMIT);
        Ok(self.store.project_versions(project_id, limit)?)
    }

    pub fn pending_conflicts(&self, project_id: ProjectId, file_path: Option<&str>) -> AppResult<Vec<FileConflict>> {
        self.resolver.pending(project_id, file_path)
    }

    pub fn conflict(&self, id: ConflictId) -> AppResult<FileConflict> {
        self.resolver.get(id)
    }

    /// Mark a pending conflict resolved; creates no version
    pub async fn resolve_conflict(&self, decision: ConflictDecision) -> AppResult<FileConflict> {
        self.close_conflict(decision, false).await
    }

    /// Mark a pending conflict ignored
    pub async fn ignore_conflict(&self, decision: ConflictDecision) -> AppResult<FileConflict> {
        self.close_conflict(decision, true).await
    }

    async fn close_conflict(&self, decision: ConflictDecision, ignore: bool) -> AppResult<FileConflict> {
        let conflict_id = parse_id("conflict_id", &decision.conflict_id)?;
        let user = self.directories.users.require(&UserRef::parse(&decision.user)?).await?;
        let existing = self.resolver.get(conflict_id)?;

        let conflict = {
            let _guard = self.store.lock_path(existing.project_id, &existing.file_path).await;
            if ignore {
                self.resolver.ignore(conflict_id, user.id)?
            } else {
                self.resolver.resolve(conflict_id, user.id)?
            }
        };

        self.notifier.conflict_resolved(&conflict, user.id);
        self.directories
            .activity
            .record(
                ActivityEntry::new(
                    user.id,
                    if ignore { "conflict_ignore" } else { "conflict_resolve" },
                    format!("Conflict {} on {} marked {}", conflict.id, conflict.file_path, conflict.status),
                )
                .in_project(conflict.project_id),
            )
            .await;

        Ok(conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{
        Collaborator, CollaborationStatus, InMemoryDirectory, Project, TracingActivityLog, User,
    };
    use crate::session::{DispatchConfig, Dispatcher, EventType, SessionRegistry};
    use crate::storage::StorageConfig;
    use crate::vcs::ConflictStatus;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc};
    use uuid::Uuid;

    struct Fixture {
        vcs: VersionControl,
        registry: Arc<SessionRegistry>,
        project: Uuid,
        alice: User,
        bob: User,
        activity: Arc<TracingActivityLog>,
        _shutdown: broadcast::Sender<()>,
    }

    fn user(name: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: name.to_string(),
            email: format!("{}@example.com", name),
            name: None,
        }
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(InMemoryDirectory::new());
        let alice = user("alice");
        let bob = user("bob");
        let project = Uuid::new_v4();
        directory.add_user(alice.clone());
        directory.add_user(bob.clone());
        directory.add_project(Project {
            id: project,
            name: "game".to_string(),
            owner_id: alice.id,
        });
        directory.add_collaborator(Collaborator::new(project, bob.id, CollaborationStatus::Approved));

        let registry = Arc::new(SessionRegistry::new());
        let (dispatcher, worker) = Dispatcher::new(registry.clone(), DispatchConfig::default());
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(worker.run(shutdown_rx));

        let activity = Arc::new(TracingActivityLog::default());
        let store = VersionStore::open(StorageConfig::temporary()).unwrap();
        let vcs = VersionControl::new(
            store,
            Notifier::new(dispatcher),
            Directories::in_memory(directory, activity.clone()),
        );

        Fixture {
            vcs,
            registry,
            project,
            alice,
            bob,
            activity,
            _shutdown: shutdown,
        }
    }

    fn commit(project: Uuid, author: &User, content: &str, base: u64) -> CommitRequest {
        CommitRequest {
            project_id: project.to_string(),
            file_path: "a.txt".to_string(),
            author: author.email.clone(),
            content: content.to_string(),
            hash: None,
            size: None,
            commit_message: String::new(),
            base_version: base,
            file_name: None,
            file_type: None,
        }
    }

    #[tokio::test]
    async fn test_commit_then_stale_commit_conflicts() {
        let f = fixture();
        let v1 = f.vcs.commit(commit(f.project, &f.alice, "one", 0)).await.unwrap();
        assert_eq!(v1.version, 1);
        let v2 = f.vcs.commit(commit(f.project, &f.alice, "two", 1)).await.unwrap();
        assert_eq!(v2.version, 2);

        let err = f.vcs.commit(commit(f.project, &f.bob, "mine", 1)).await.unwrap_err();
        let AppError::Conflict { conflict_id, latest_version, base_version, .. } = err else {
            panic!("expected conflict");
        };
        assert_eq!((base_version, latest_version), (1, 2));

        let stored = f.vcs.conflict(conflict_id).unwrap();
        assert_eq!(stored.local_author_id, f.bob.id);
        assert_eq!(stored.remote_author_id, f.alice.id);
        assert_eq!(stored.remote_content, "two");
        assert_eq!(f.vcs.file_history(f.project, "a.txt", None, 0).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_base_on_existing_file_conflicts() {
        let f = fixture();
        f.vcs.commit(commit(f.project, &f.alice, "one", 0)).await.unwrap();
        let err = f.vcs.commit(commit(f.project, &f.bob, "two", 0)).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict { latest_version: 1, base_version: 0, .. }));
        assert_eq!(f.vcs.pending_conflicts(f.project, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_base_ahead_is_rejected() {
        let f = fixture();
        let err = f.vcs.commit(commit(f.project, &f.alice, "x", 3)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unknown_project_or_author() {
        let f = fixture();
        let err = f.vcs.commit(commit(Uuid::new_v4(), &f.alice, "x", 0)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound { kind: "Project", .. }));

        let stranger = user("mallory");
        let err = f.vcs.commit(commit(f.project, &stranger, "x", 0)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound { kind: "User", .. }));
    }

    #[tokio::test]
    async fn test_delete_then_latest() {
        let f = fixture();
        f.vcs.commit(commit(f.project, &f.alice, "keep", 0)).await.unwrap();
        let tombstone = f
            .vcs
            .delete_file(DeleteRequest {
                project_id: f.project.to_string(),
                file_path: "a.txt".to_string(),
                author: f.alice.username.clone(),
                commit_message: String::new(),
                base_version: 1,
            })
            .await
            .unwrap();
        assert_eq!(tombstone.version, 2);
        assert!(tombstone.is_deleted);

        assert_eq!(f.vcs.latest(f.project, "a.txt").unwrap().content, "keep");
        assert!(matches!(
            f.vcs.latest(f.project, "nothing.txt"),
            Err(AppError::NotFound { .. })
        ));
        assert_eq!(f.vcs.version(tombstone.id).unwrap(), tombstone);
    }

    #[tokio::test]
    async fn test_resolve_and_ignore_are_terminal() {
        let f = fixture();
        f.vcs.commit(commit(f.project, &f.alice, "one", 0)).await.unwrap();
        f.vcs.commit(commit(f.project, &f.alice, "two", 1)).await.unwrap();
        let AppError::Conflict { conflict_id, .. } =
            f.vcs.commit(commit(f.project, &f.bob, "mine", 1)).await.unwrap_err()
        else {
            panic!("expected conflict");
        };

        let decision = ConflictDecision {
            conflict_id: conflict_id.to_string(),
            user: f.bob.email.clone(),
        };
        let resolved = f.vcs.resolve_conflict(decision.clone()).await.unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved);
        assert_eq!(resolved.resolved_by, Some(f.bob.id));

        let again = f.vcs.resolve_conflict(decision.clone()).await;
        assert!(matches!(again, Err(AppError::InvalidState(_))));
        let ignored = f.vcs.ignore_conflict(decision).await;
        assert!(matches!(ignored, Err(AppError::InvalidState(_))));
        assert_eq!(f.vcs.conflict(conflict_id).unwrap().status, ConflictStatus::Resolved);

        // No version was created by resolving.
        assert_eq!(f.vcs.file_history(f.project, "a.txt", None, 0).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_commit_notifies_members_but_not_author() {
        let f = fixture();
        let (alice_tx, mut alice_rx) = mpsc::channel(8);
        let (bob_tx, mut bob_rx) = mpsc::channel(8);
        f.registry.connect(&f.alice.id.to_string(), alice_tx).unwrap();
        f.registry.connect(&f.bob.id.to_string(), bob_tx).unwrap();
        alice_rx.recv().await.unwrap();
        bob_rx.recv().await.unwrap();

        f.vcs.commit(commit(f.project, &f.bob, "hello", 0)).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), alice_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.kind, EventType::FileUpdated);
        assert_eq!(got.sender, Some(f.bob.id));
        assert_eq!(got.payload.unwrap()["version"], 1);

        let nothing = tokio::time::timeout(Duration::from_millis(100), bob_rx.recv()).await;
        assert!(nothing.is_err());
        assert_eq!(f.activity.recent(1)[0].action, "file_commit");
    }

    #[tokio::test]
    async fn test_conflict_notifies_remote_author() {
        let f = fixture();
        f.vcs.commit(commit(f.project, &f.alice, "one", 0)).await.unwrap();
        f.vcs.commit(commit(f.project, &f.alice, "two", 1)).await.unwrap();

        let (alice_tx, mut alice_rx) = mpsc::channel(8);
        f.registry.connect(&f.alice.id.to_string(), alice_tx).unwrap();
        alice_rx.recv().await.unwrap();

        let _ = f.vcs.commit(commit(f.project, &f.bob, "mine", 1)).await;
        let got = tokio::time::timeout(Duration::from_secs(1), alice_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.kind, EventType::FileConflict);
        assert_eq!(got.payload.unwrap()["latest_version"], 2);
    }

    #[tokio::test]
    async fn test_history_limit_is_clamped() {
        let f = fixture();
        for i in 0..3 {
            f.vcs
                .commit(commit(f.project, &f.alice, &format!("v{}", i), i))
                .await
                .unwrap();
        }
        // Zero means "use the default", not "one row"
        assert_eq!(f.vcs.file_history(f.project, "a.txt", Some(0), 0).unwrap().len(), 3);
        assert_eq!(f.vcs.file_history(f.project, "a.txt", Some(2), 0).unwrap().len(), 2);
        assert_eq!(f.vcs.project_versions(f.project, Some(0)).unwrap().len(), 3);
        assert_eq!(f.vcs.project_versions(f.project, Some(10_000)).unwrap().len(), 3);
        assert!(f.vcs.file_history(f.project, "../etc", None, 0).is_err());
    }
}
