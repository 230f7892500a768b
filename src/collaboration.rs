//! Inviting users onto a project and answering those invitations.

use serde::Deserialize;

use crate::directory::{
    ActivityEntry, CollaborationStatus, Collaborator, CollaboratorDirectory, Directories,
    ProjectDirectory, UserDirectory, UserRef,
};
use crate::error::{parse_id, AppError, AppResult};
use crate::notifier::Notifier;
use crate::session::{CollaboratorPresence, Presence};
use crate::vcs::ProjectId;

#[derive(Debug, Clone, Deserialize)]
pub struct InviteRequest {
    #[serde(alias = "owner_email")]
    pub owner: String,
    #[serde(alias = "collaborator_email")]
    pub collaborator: String,
    pub project_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionRequest {
    pub collab_id: String,
    /// `approved` or `rejected`
    pub status: String,
    /// The invited user answering the request
    #[serde(alias = "user_email")]
    pub user: String,
}

#[derive(Clone)]
pub struct CollaborationService {
    notifier: Notifier,
    presence: Presence,
    directories: Directories,
}

impl CollaborationService {
    pub fn new(notifier: Notifier, presence: Presence, directories: Directories) -> Self {
        Self {
            notifier,
            presence,
            directories,
        }
    }

    /// Owner invites a user; the invitation starts out pending
    pub async fn invite(&self, request: InviteRequest) -> AppResult<Collaborator> {
        let project_id = parse_id("project_id", &request.project_id)?;
        let owner = self.directories.users.require(&UserRef::parse(&request.owner)?).await?;
        let invitee = self
            .directories
            .users
            .require(&UserRef::parse(&request.collaborator)?)
            .await?;
        let project = self.directories.projects.require(project_id).await?;

        if project.owner_id != owner.id {
            return Err(AppError::Forbidden(
                "Project not found or access denied".to_string(),
            ));
        }
        if invitee.id == owner.id {
            return Err(AppError::validation("Owner cannot invite themselves"));
        }

        let collaboration = self.directories.collaborators.create(project.id, invitee.id).await?;
        self.notifier
            .collaboration_requested(&collaboration, &owner, &project.name);
        self.directories
            .activity
            .record(
                ActivityEntry::new(
                    owner.id,
                    "collaboration_request",
                    format!("Invited {} to {}", invitee.username, project.name),
                )
                .in_project(project.id),
            )
            .await;

        Ok(collaboration)
    }

    /// The invited user approves or rejects a pending invitation
    pub async fn decide(&self, request: DecisionRequest) -> AppResult<Collaborator> {
        let collab_id = parse_id("collab_id", &request.collab_id)?;
        let status = match request.status.trim() {
            "approved" => CollaborationStatus::Approved,
            "rejected" => CollaborationStatus::Rejected,
            _ => return Err(AppError::validation("Status must be 'approved' or 'rejected'")),
        };
        let user = self.directories.users.require(&UserRef::parse(&request.user)?).await?;

        let existing = self
            .directories
            .collaborators
            .get(collab_id)
            .await?
            .ok_or_else(|| AppError::not_found("Collaboration", collab_id))?;
        if existing.user_id != user.id {
            return Err(AppError::Forbidden(
                "Only the invited user can answer this request".to_string(),
            ));
        }

        let updated = self
            .directories
            .collaborators
            .transition(collab_id, CollaborationStatus::Pending, status)
            .await?;
        let owner = self
            .directories
            .projects
            .get(updated.project_id)
            .await?
            .map(|p| p.owner_id);

        let recipients: Vec<_> = owner.into_iter().chain(Some(updated.user_id)).collect();
        self.notifier.collaboration_updated(&updated, user.id, &recipients);
        self.directories
            .activity
            .record(
                ActivityEntry::new(
                    user.id,
                    "collaboration_decision",
                    format!("Collaboration {} {}", updated.id, status.as_str()),
                )
                .in_project(updated.project_id),
            )
            .await;

        tracing::info!(user_id = %user.id, "Collaboration {} {}", updated.id, status.as_str());
        Ok(updated)
    }

    /// The project owner revokes a collaboration in any state
    pub async fn remove(&self, collab_id: &str, owner: &str) -> AppResult<Collaborator> {
        let collab_id = parse_id("collab_id", collab_id)?;
        let owner = self.directories.users.require(&UserRef::parse(owner)?).await?;

        let existing = self
            .directories
            .collaborators
            .get(collab_id)
            .await?
            .ok_or_else(|| AppError::not_found("Collaboration", collab_id))?;
        let project = self.directories.projects.require(existing.project_id).await?;
        if project.owner_id != owner.id {
            return Err(AppError::Forbidden(
                "Only the project owner can remove collaborators".to_string(),
            ));
        }

        let removed = self.directories.collaborators.remove(collab_id).await?;
        self.notifier.collaboration_removed(&removed, &owner, &project.name);
        self.directories
            .activity
            .record(
                ActivityEntry::new(
                    owner.id,
                    "collaboration_removed",
                    format!("Removed collaborator {} from {}", removed.user_id, project.name),
                )
                .in_project(project.id),
            )
            .await;

        tracing::info!(user_id = %owner.id, "Collaboration {} removed", removed.id);
        Ok(removed)
    }

    /// Every collaboration on a project with online status
    pub async fn project_collaborators(&self, project_id: ProjectId) -> AppResult<Vec<CollaboratorPresence>> {
        self.directories.projects.require(project_id).await?;
        let all = self.directories.collaborators.for_project(project_id).await?;
        Ok(self.presence.annotate(all))
    }

    /// Invitations still waiting on `user`
    pub async fn pending_requests(&self, user: &str) -> AppResult<Vec<Collaborator>> {
        let user = self.directories.users.require(&UserRef::parse(user)?).await?;
        self.directories.collaborators.pending_for_user(user.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{InMemoryDirectory, Project, TracingActivityLog, User};
    use crate::session::{DispatchConfig, Dispatcher, EventType, SessionRegistry};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc};
    use uuid::Uuid;

    fn user(name: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: name.to_string(),
            email: format!("{}@example.com", name),
            name: None,
        }
    }

    struct Fixture {
        directory: Arc<InMemoryDirectory>,
        registry: Arc<SessionRegistry>,
        service: CollaborationService,
        owner: User,
        guest: User,
        project: Uuid,
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(InMemoryDirectory::new());
        let owner = user("owner");
        let guest = user("guest");
        let project = Uuid::new_v4();
        directory.add_user(owner.clone());
        directory.add_user(guest.clone());
        directory.add_project(Project {
            id: project,
            name: "arena".to_string(),
            owner_id: owner.id,
        });

        let registry = Arc::new(SessionRegistry::new());
        let (dispatcher, worker) = Dispatcher::new(registry.clone(), DispatchConfig::default());
        let (shutdown, rx) = broadcast::channel(1);
        tokio::spawn(async move {
            // Keep the sender alive for the whole test
            let _shutdown = shutdown;
            worker.run(rx).await;
        });
        let service = CollaborationService::new(
            Notifier::new(dispatcher),
            Presence::new(registry.clone()),
            Directories::in_memory(directory.clone(), Arc::new(TracingActivityLog::default())),
        );

        Fixture {
            directory,
            registry,
            service,
            owner,
            guest,
            project,
        }
    }

    #[tokio::test]
    async fn test_invite_and_approve() {
        let Fixture {
            registry,
            service,
            owner,
            guest,
            project,
            ..
        } = fixture();

        let (owner_tx, mut owner_rx) = mpsc::channel(8);
        registry.connect(&owner.id.to_string(), owner_tx).unwrap();
        owner_rx.recv().await.unwrap();

        let invite = service
            .invite(InviteRequest {
                owner: owner.email.clone(),
                collaborator: guest.email.clone(),
                project_id: project.to_string(),
            })
            .await
            .unwrap();
        assert_eq!(invite.status, CollaborationStatus::Pending);
        assert_eq!(service.pending_requests(&guest.username).await.unwrap().len(), 1);

        let wrong_user = service
            .decide(DecisionRequest {
                collab_id: invite.id.to_string(),
                status: "approved".to_string(),
                user: owner.email.clone(),
            })
            .await;
        assert!(matches!(wrong_user, Err(AppError::Forbidden(_))));

        let approved = service
            .decide(DecisionRequest {
                collab_id: invite.id.to_string(),
                status: "approved".to_string(),
                user: guest.email.clone(),
            })
            .await
            .unwrap();
        assert_eq!(approved.status, CollaborationStatus::Approved);

        let got = tokio::time::timeout(Duration::from_secs(1), owner_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.kind, EventType::CollaborationUpdated);
        assert_eq!(got.payload.unwrap()["status"], "approved");

        let again = service
            .decide(DecisionRequest {
                collab_id: invite.id.to_string(),
                status: "rejected".to_string(),
                user: guest.email.clone(),
            })
            .await;
        assert!(matches!(again, Err(AppError::InvalidState(_))));

        let listed = service.project_collaborators(project).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].is_online);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_decisions_have_one_winner() {
        let f = fixture();
        for _ in 0..50 {
            let project = Uuid::new_v4();
            f.directory.add_project(Project {
                id: project,
                name: "race".to_string(),
                owner_id: f.owner.id,
            });
            let invite = f
                .service
                .invite(InviteRequest {
                    owner: f.owner.email.clone(),
                    collaborator: f.guest.email.clone(),
                    project_id: project.to_string(),
                })
                .await
                .unwrap();

            let barrier = Arc::new(tokio::sync::Barrier::new(2));
            let tasks: Vec<_> = ["approved", "rejected"]
                .into_iter()
                .map(|status| {
                    let service = f.service.clone();
                    let barrier = barrier.clone();
                    let request = DecisionRequest {
                        collab_id: invite.id.to_string(),
                        status: status.to_string(),
                        user: f.guest.email.clone(),
                    };
                    tokio::spawn(async move {
                        barrier.wait().await;
                        service.decide(request).await
                    })
                })
                .collect();

            let mut winners = 0;
            for task in tasks {
                match task.await.unwrap() {
                    Ok(_) => winners += 1,
                    Err(err) => assert!(matches!(err, AppError::InvalidState(_))),
                }
            }
            assert_eq!(winners, 1);
        }
    }

    #[tokio::test]
    async fn test_owner_removes_collaborator() {
        let f = fixture();
        let (guest_tx, mut guest_rx) = mpsc::channel(8);
        f.registry.connect(&f.guest.id.to_string(), guest_tx).unwrap();
        guest_rx.recv().await.unwrap();

        let invite = f
            .service
            .invite(InviteRequest {
                owner: f.owner.username.clone(),
                collaborator: f.guest.username.clone(),
                project_id: f.project.to_string(),
            })
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), guest_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.kind, EventType::Notification);

        let by_guest = f.service.remove(&invite.id.to_string(), &f.guest.email).await;
        assert!(matches!(by_guest, Err(AppError::Forbidden(_))));

        let removed = f
            .service
            .remove(&invite.id.to_string(), &f.owner.email)
            .await
            .unwrap();
        assert_eq!(removed.user_id, f.guest.id);
        assert!(f.service.project_collaborators(f.project).await.unwrap().is_empty());

        let got = tokio::time::timeout(Duration::from_secs(1), guest_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.kind, EventType::CollaborationUpdated);
        assert_eq!(got.payload.unwrap()["status"], "removed");

        let again = f.service.remove(&invite.id.to_string(), &f.owner.email).await;
        assert!(matches!(again, Err(AppError::NotFound { .. })));
    }
}
