//! Users, projects, collaborators and the activity log.
//!
//! The hub only consumes these through the traits below. `InMemoryDirectory`
//! backs all three lookups for a single-instance deployment and can be seeded
//! from a JSON file at startup.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::session::UserId;
use crate::vcs::ProjectId;

pub type CollaborationId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub owner_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationStatus {
    Pending,
    Approved,
    Rejected,
}

impl CollaborationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CollaborationStatus::Pending => "pending",
            CollaborationStatus::Approved => "approved",
            CollaborationStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub id: CollaborationId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub status: CollaborationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Collaborator {
    pub fn new(project_id: ProjectId, user_id: UserId, status: CollaborationStatus) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            user_id,
            status,
            created_at: now,
            updated_at: now,
        }
    }
}

/// How a request names a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserRef {
    Id(UserId),
    Email(String),
    Username(String),
}

impl UserRef {
    /// A UUID is an id, anything with `@` is an email, the rest are usernames
    pub fn parse(raw: &str) -> AppResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AppError::validation("user identifier is required"));
        }
        if let Ok(id) = Uuid::parse_str(raw) {
            return Ok(UserRef::Id(id));
        }
        if raw.contains('@') {
            return Ok(UserRef::Email(raw.to_lowercase()));
        }
        Ok(UserRef::Username(raw.to_string()))
    }
}

impl std::fmt::Display for UserRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserRef::Id(id) => write!(f, "{}", id),
            UserRef::Email(email) => write!(f, "{}", email),
            UserRef::Username(name) => write!(f, "{}", name),
        }
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_id(&self, id: UserId) -> AppResult<Option<User>>;
    async fn find_by_email(&self, email: &str) -> AppResult<Option<User>>;
    async fn find_by_username(&self, username: &str) -> AppResult<Option<User>>;

    async fn find(&self, who: &UserRef) -> AppResult<Option<User>> {
        match who {
            UserRef::Id(id) => self.find_by_id(*id).await,
            UserRef::Email(email) => self.find_by_email(email).await,
            UserRef::Username(name) => self.find_by_username(name).await,
        }
    }

    /// Like `find`, but a missing user is an error
    async fn require(&self, who: &UserRef) -> AppResult<User> {
        self.find(who)
            .await?
            .ok_or_else(|| AppError::not_found("User", who))
    }
}

#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    async fn get(&self, id: ProjectId) -> AppResult<Option<Project>>;

    async fn require(&self, id: ProjectId) -> AppResult<Project> {
        self.get(id)
            .await?
            .ok_or_else(|| AppError::not_found("Project", id))
    }
}

#[async_trait]
pub trait CollaboratorDirectory: Send + Sync {
    async fn approved_collaborators(&self, project_id: ProjectId) -> AppResult<Vec<Collaborator>>;
    async fn is_approved(&self, project_id: ProjectId, user_id: UserId) -> AppResult<bool>;

    /// Every collaboration on a project regardless of status
    async fn for_project(&self, project_id: ProjectId) -> AppResult<Vec<Collaborator>>;
    async fn pending_for_user(&self, user_id: UserId) -> AppResult<Vec<Collaborator>>;
    async fn get(&self, id: CollaborationId) -> AppResult<Option<Collaborator>>;
    /// Open a pending request; one per (project, user)
    async fn create(&self, project_id: ProjectId, user_id: UserId) -> AppResult<Collaborator>;
    /// Compare-and-set: move to `next` only while the status is still `expected`
    async fn transition(
        &self,
        id: CollaborationId,
        expected: CollaborationStatus,
        next: CollaborationStatus,
    ) -> AppResult<Collaborator>;
    /// Drop the collaboration and free its (project, user) slot
    async fn remove(&self, id: CollaborationId) -> AppResult<Collaborator>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub user_id: UserId,
    pub project_id: Option<ProjectId>,
    pub action: &'static str,
    pub details: String,
    pub at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(user_id: UserId, action: &'static str, details: impl Into<String>) -> Self {
        Self {
            user_id,
            project_id: None,
            action,
            details: details.into(),
            at: Utc::now(),
        }
    }

    pub fn in_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }
}

/// Fire-and-forget audit trail
#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn record(&self, entry: ActivityEntry);
}

/// The lookups and audit sink every service needs
#[derive(Clone)]
pub struct Directories {
    pub users: Arc<dyn UserDirectory>,
    pub projects: Arc<dyn ProjectDirectory>,
    pub collaborators: Arc<dyn CollaboratorDirectory>,
    pub activity: Arc<dyn ActivityLog>,
}

impl Directories {
    /// Serve all three lookups from one in-memory directory
    pub fn in_memory(directory: Arc<InMemoryDirectory>, activity: Arc<dyn ActivityLog>) -> Self {
        Self {
            users: directory.clone(),
            projects: directory.clone(),
            collaborators: directory,
            activity,
        }
    }

    /// Owner plus approved collaborators, minus `exclude`
    pub async fn project_members(&self, project: &Project, exclude: UserId) -> AppResult<Vec<UserId>> {
        let mut members: Vec<UserId> = self
            .collaborators
            .approved_collaborators(project.id)
            .await?
            .into_iter()
            .map(|c| c.user_id)
            .collect();
        members.push(project.owner_id);
        members.sort_unstable();
        members.dedup();
        members.retain(|id| *id != exclude);
        Ok(members)
    }
}

/// Initial directory contents, loaded from JSON
#[derive(Debug, Default, Deserialize)]
pub struct DirectorySeed {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub collaborators: Vec<SeedCollaborator>,
}

#[derive(Debug, Deserialize)]
pub struct SeedCollaborator {
    pub project_id: ProjectId,
    pub user_id: UserId,
    #[serde(default = "approved")]
    pub status: CollaborationStatus,
}

fn approved() -> CollaborationStatus {
    CollaborationStatus::Approved
}

impl DirectorySeed {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read directory seed {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse directory seed {}", path.display()))
    }
}

/// Directory held entirely in memory
#[derive(Default)]
pub struct InMemoryDirectory {
    users: DashMap<UserId, User>,
    projects: DashMap<ProjectId, Project>,
    collaborations: DashMap<CollaborationId, Collaborator>,
    /// (project, user) -> collaboration; the slot is claimed before the row exists
    memberships: DashMap<(ProjectId, UserId), CollaborationId>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: DirectorySeed) -> Self {
        let directory = Self::new();
        for user in seed.users {
            directory.add_user(user);
        }
        for project in seed.projects {
            directory.add_project(project);
        }
        for c in seed.collaborators {
            directory.add_collaborator(Collaborator::new(c.project_id, c.user_id, c.status));
        }
        tracing::info!(
            "Directory seeded: {} users, {} projects, {} collaborations",
            directory.users.len(),
            directory.projects.len(),
            directory.collaborations.len()
        );
        directory
    }

    pub fn add_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    pub fn add_project(&self, project: Project) {
        self.projects.insert(project.id, project);
    }

    pub fn add_collaborator(&self, collaborator: Collaborator) {
        let key = (collaborator.project_id, collaborator.user_id);
        if let Some(previous) = self.memberships.insert(key, collaborator.id) {
            self.collaborations.remove(&previous);
        }
        self.collaborations.insert(collaborator.id, collaborator);
    }

    fn collaboration_of(&self, project_id: ProjectId, user_id: UserId) -> Option<Collaborator> {
        let id = *self.memberships.get(&(project_id, user_id))?;
        self.collaborations.get(&id).map(|c| c.clone())
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn find_by_id(&self, id: UserId) -> AppResult<Option<User>> {
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn find_by_email(&self, email: &str) -> AppResult<Option<User>> {
        Ok(self
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .map(|u| u.clone()))
    }

    async fn find_by_username(&self, username: &str) -> AppResult<Option<User>> {
        Ok(self
            .users
            .iter()
            .find(|u| u.username == username)
            .map(|u| u.clone()))
    }
}

#[async_trait]
impl ProjectDirectory for InMemoryDirectory {
    async fn get(&self, id: ProjectId) -> AppResult<Option<Project>> {
        Ok(self.projects.get(&id).map(|p| p.clone()))
    }
}

#[async_trait]
impl CollaboratorDirectory for InMemoryDirectory {
    async fn approved_collaborators(&self, project_id: ProjectId) -> AppResult<Vec<Collaborator>> {
        Ok(self
            .collaborations
            .iter()
            .filter(|c| c.project_id == project_id && c.status == CollaborationStatus::Approved)
            .map(|c| c.clone())
            .collect())
    }

    async fn is_approved(&self, project_id: ProjectId, user_id: UserId) -> AppResult<bool> {
        Ok(self
            .collaboration_of(project_id, user_id)
            .map_or(false, |c| c.status == CollaborationStatus::Approved))
    }

    async fn for_project(&self, project_id: ProjectId) -> AppResult<Vec<Collaborator>> {
        let mut all: Vec<Collaborator> = self
            .collaborations
            .iter()
            .filter(|c| c.project_id == project_id)
            .map(|c| c.clone())
            .collect();
        all.sort_by_key(|c| c.created_at);
        Ok(all)
    }

    async fn pending_for_user(&self, user_id: UserId) -> AppResult<Vec<Collaborator>> {
        Ok(self
            .collaborations
            .iter()
            .filter(|c| c.user_id == user_id && c.status == CollaborationStatus::Pending)
            .map(|c| c.clone())
            .collect())
    }

    async fn get(&self, id: CollaborationId) -> AppResult<Option<Collaborator>> {
        Ok(self.collaborations.get(&id).map(|c| c.clone()))
    }

    async fn create(&self, project_id: ProjectId, user_id: UserId) -> AppResult<Collaborator> {
        match self.memberships.entry((project_id, user_id)) {
            Entry::Occupied(existing) => {
                let status = self
                    .collaborations
                    .get(existing.get())
                    .map_or("pending", |c| c.status.as_str());
                Err(AppError::InvalidState(format!(
                    "user {} already has a {} collaboration on project {}",
                    user_id, status, project_id
                )))
            }
            Entry::Vacant(slot) => {
                let collaborator = Collaborator::new(project_id, user_id, CollaborationStatus::Pending);
                self.collaborations.insert(collaborator.id, collaborator.clone());
                slot.insert(collaborator.id);
                Ok(collaborator)
            }
        }
    }

    async fn transition(
        &self,
        id: CollaborationId,
        expected: CollaborationStatus,
        next: CollaborationStatus,
    ) -> AppResult<Collaborator> {
        let mut entry = self
            .collaborations
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("Collaboration", id))?;
        if entry.status != expected {
            return Err(AppError::InvalidState(format!(
                "collaboration {} is already {}",
                id,
                entry.status.as_str()
            )));
        }
        entry.status = next;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn remove(&self, id: CollaborationId) -> AppResult<Collaborator> {
        let (_, removed) = self
            .collaborations
            .remove(&id)
            .ok_or_else(|| AppError::not_found("Collaboration", id))?;
        self.memberships
            .remove_if(&(removed.project_id, removed.user_id), |_, current| *current == id);
        Ok(removed)
    }
}

/// Activity log that emits tracing events and keeps a bounded tail
pub struct TracingActivityLog {
    recent: Mutex<VecDeque<ActivityEntry>>,
    capacity: usize,
}

impl TracingActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Newest entries first
    pub fn recent(&self, limit: usize) -> Vec<ActivityEntry> {
        self.recent.lock().iter().rev().take(limit).cloned().collect()
    }
}

impl Default for TracingActivityLog {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl ActivityLog for TracingActivityLog {
    async fn record(&self, entry: ActivityEntry) {
        tracing::info!(
            target: "collab_hub::activity",
            user_id = %entry.user_id,
            project_id = ?entry.project_id,
            action = entry.action,
            "{}",
            entry.details
        );

        let mut recent = self.recent.lock();
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> User {
        User {
            id: Uuid::new_v4(),
            username: "alice".to_string(),
            email: "Alice@Example.com".to_string(),
            name: None,
        }
    }

    #[test]
    fn test_user_ref_parse() {
        let id = Uuid::new_v4();
        assert_eq!(UserRef::parse(&id.to_string()).unwrap(), UserRef::Id(id));
        assert_eq!(
            UserRef::parse(" Bob@Example.com ").unwrap(),
            UserRef::Email("bob@example.com".to_string())
        );
        assert_eq!(
            UserRef::parse("bob").unwrap(),
            UserRef::Username("bob".to_string())
        );
        assert!(UserRef::parse("  ").is_err());
    }

    #[tokio::test]
    async fn test_user_lookup() {
        let directory = InMemoryDirectory::new();
        let user = alice();
        directory.add_user(user.clone());

        let by_email = directory.find(&UserRef::Email("alice@example.com".to_string())).await.unwrap();
        assert_eq!(by_email, Some(user.clone()));
        let by_name = directory.find(&UserRef::Username("alice".to_string())).await.unwrap();
        assert_eq!(by_name, Some(user.clone()));

        let missing = UserDirectory::require(&directory, &UserRef::Id(Uuid::new_v4())).await;
        assert!(matches!(missing, Err(AppError::NotFound { kind: "User", .. })));
    }

    #[tokio::test]
    async fn test_collaboration_lifecycle() {
        let directory = InMemoryDirectory::new();
        let project = Uuid::new_v4();
        let user = Uuid::new_v4();

        let request = directory.create(project, user).await.unwrap();
        assert_eq!(request.status, CollaborationStatus::Pending);
        assert!(!directory.is_approved(project, user).await.unwrap());
        assert_eq!(directory.pending_for_user(user).await.unwrap().len(), 1);
        assert!(directory.create(project, user).await.is_err());

        directory
            .transition(request.id, CollaborationStatus::Pending, CollaborationStatus::Approved)
            .await
            .unwrap();
        assert!(directory.is_approved(project, user).await.unwrap());
        assert_eq!(directory.approved_collaborators(project).await.unwrap().len(), 1);
        assert!(directory.pending_for_user(user).await.unwrap().is_empty());

        // Only a pending request can be answered
        let late = directory
            .transition(request.id, CollaborationStatus::Pending, CollaborationStatus::Rejected)
            .await;
        assert!(matches!(late, Err(AppError::InvalidState(_))));
        assert!(directory.is_approved(project, user).await.unwrap());

        // Removing frees the slot for a fresh invitation
        let removed = directory.remove(request.id).await.unwrap();
        assert_eq!(removed.id, request.id);
        assert!(!directory.is_approved(project, user).await.unwrap());
        assert!(CollaboratorDirectory::get(&directory, request.id).await.unwrap().is_none());
        assert!(matches!(
            directory.remove(request.id).await,
            Err(AppError::NotFound { .. })
        ));
        assert!(directory.create(project, user).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_invites_open_one_request() {
        let directory = Arc::new(InMemoryDirectory::new());
        for _ in 0..100 {
            let project = Uuid::new_v4();
            let user = Uuid::new_v4();
            let barrier = Arc::new(tokio::sync::Barrier::new(2));

            let tasks: Vec<_> = (0..2)
                .map(|_| {
                    let directory = directory.clone();
                    let barrier = barrier.clone();
                    tokio::spawn(async move {
                        barrier.wait().await;
                        directory.create(project, user).await.is_ok()
                    })
                })
                .collect();

            let mut created = 0;
            for task in tasks {
                if task.await.unwrap() {
                    created += 1;
                }
            }
            assert_eq!(created, 1);
            assert_eq!(directory.for_project(project).await.unwrap().len(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transitions_have_one_winner() {
        let directory = Arc::new(InMemoryDirectory::new());
        for _ in 0..100 {
            let request = directory.create(Uuid::new_v4(), Uuid::new_v4()).await.unwrap();
            let barrier = Arc::new(tokio::sync::Barrier::new(2));

            let tasks: Vec<_> = [CollaborationStatus::Approved, CollaborationStatus::Rejected]
                .into_iter()
                .map(|next| {
                    let directory = directory.clone();
                    let barrier = barrier.clone();
                    tokio::spawn(async move {
                        barrier.wait().await;
                        directory
                            .transition(request.id, CollaborationStatus::Pending, next)
                            .await
                            .is_ok()
                    })
                })
                .collect();

            let mut winners = 0;
            for task in tasks {
                if task.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
        }
    }

    #[test]
    fn test_seed_parsing() {
        let owner = Uuid::new_v4();
        let project = Uuid::new_v4();
        let json = format!(
            r#"{{
                "users": [{{"id": "{owner}", "username": "o", "email": "o@x.io"}}],
                "projects": [{{"id": "{project}", "name": "game", "owner_id": "{owner}"}}],
                "collaborators": [{{"project_id": "{project}", "user_id": "{owner}"}}]
            }}"#
        );
        let seed: DirectorySeed = serde_json::from_str(&json).unwrap();
        assert_eq!(seed.collaborators[0].status, CollaborationStatus::Approved);

        let directory = InMemoryDirectory::from_seed(seed);
        assert_eq!(directory.users.len(), 1);
        assert_eq!(directory.projects.len(), 1);
    }

    #[tokio::test]
    async fn test_activity_log_is_bounded() {
        let log = TracingActivityLog::new(2);
        let user = Uuid::new_v4();
        for i in 0..3 {
            log.record(ActivityEntry::new(user, "commit", format!("c{}", i))).await;
        }
        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].details, "c2");
        assert_eq!(recent[1].details, "c1");
    }
}
