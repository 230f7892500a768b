//! Builds the server-originated events and hands them to the dispatcher.
//!
//! Everything here is best effort: a recipient who is offline simply misses
//! the event.

use serde_json::json;

use crate::directory::{Collaborator, User};
use crate::session::{Dispatcher, Envelope, EventType, UserId};
use crate::vcs::{FileConflict, FileVersion};

#[derive(Clone)]
pub struct Notifier {
    dispatcher: Dispatcher,
}

impl Notifier {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Tell everyone in `recipients` that a new version landed
    pub fn file_committed(&self, version: &FileVersion, author: &User, recipients: &[UserId]) {
        let action = if version.is_deleted { "deleted" } else { "committed" };
        let payload = json!({
            "message": format!("{} {} {} (v{})", author.username, action, version.file_path, version.version),
            "project_id": version.project_id,
            "file_path": version.file_path,
            "file_name": version.file_name,
            "version": version.version,
            "version_id": version.id,
            "file_hash": version.file_hash,
            "is_deleted": version.is_deleted,
            "author_id": author.id,
            "author": author.username,
            "commit_message": version.commit_message,
        });

        for &recipient in recipients {
            self.dispatcher.send(
                Envelope::new(EventType::FileUpdated)
                    .with_sender(author.id)
                    .to(recipient)
                    .with_payload(payload.clone()),
            );
        }
    }

    /// Warn the author of the head version that someone collided with them
    pub fn conflict_detected(&self, conflict: &FileConflict, committer: &User) {
        self.dispatcher.send(
            Envelope::new(EventType::FileConflict)
                .with_sender(committer.id)
                .to(conflict.remote_author_id)
                .with_payload(json!({
                    "message": format!("{} hit a conflict on {}", committer.username, conflict.file_path),
                    "conflict_id": conflict.id,
                    "project_id": conflict.project_id,
                    "file_path": conflict.file_path,
                    "base_version": conflict.base_version,
                    "latest_version": conflict.latest_version,
                    "local_author_id": conflict.local_author_id,
                })),
        );
    }

    /// Tell both sides of a conflict it was closed
    pub fn conflict_resolved(&self, conflict: &FileConflict, by: UserId) {
        let payload = json!({
            "conflict_id": conflict.id,
            "project_id": conflict.project_id,
            "file_path": conflict.file_path,
            "status": conflict.status,
            "resolved_by": by,
        });

        let mut recipients = vec![conflict.local_author_id, conflict.remote_author_id];
        recipients.dedup();
        for recipient in recipients.into_iter().filter(|r| *r != by) {
            self.dispatcher.send(
                Envelope::new(EventType::ConflictResolved)
                    .with_sender(by)
                    .to(recipient)
                    .with_payload(payload.clone()),
            );
        }
    }

    /// A collaboration request was opened for `invitee`
    pub fn collaboration_requested(&self, collaboration: &Collaborator, owner: &User, project_name: &str) {
        self.dispatcher.send(
            Envelope::new(EventType::Notification)
                .with_sender(owner.id)
                .to(collaboration.user_id)
                .with_payload(json!({
                    "message": format!("{} invited you to collaborate on {}", owner.username, project_name),
                    "collab_id": collaboration.id,
                    "project_id": collaboration.project_id,
                    "project_name": project_name,
                    "status": collaboration.status,
                })),
        );
    }

    /// A collaboration was approved or rejected
    pub fn collaboration_updated(&self, collaboration: &Collaborator, decided_by: UserId, recipients: &[UserId]) {
        let payload = json!({
            "collab_id": collaboration.id,
            "project_id": collaboration.project_id,
            "user_id": collaboration.user_id,
            "status": collaboration.status,
        });
        for &recipient in recipients.iter().filter(|r| **r != decided_by) {
            self.dispatcher.send(
                Envelope::new(EventType::CollaborationUpdated)
                    .with_sender(decided_by)
                    .to(recipient)
                    .with_payload(payload.clone()),
            );
        }
    }

    /// The owner revoked a collaboration; only the removed user hears about it
    pub fn collaboration_removed(&self, collaboration: &Collaborator, owner: &User, project_name: &str) {
        self.dispatcher.send(
            Envelope::new(EventType::CollaborationUpdated)
                .with_sender(owner.id)
                .to(collaboration.user_id)
                .with_payload(json!({
                    "message": format!("{} removed you from {}", owner.username, project_name),
                    "collab_id": collaboration.id,
                    "project_id": collaboration.project_id,
                    "user_id": collaboration.user_id,
                    "status": "removed",
                })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::CollaborationStatus;
    use crate::session::{DispatchConfig, SessionRegistry};
    use crate::vcs::ConflictStatus;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc};
    use uuid::Uuid;

    struct Online {
        registry: Arc<SessionRegistry>,
        notifier: Notifier,
        _shutdown: broadcast::Sender<()>,
    }

    fn online() -> Online {
        let registry = Arc::new(SessionRegistry::new());
        let (dispatcher, worker) = Dispatcher::new(registry.clone(), DispatchConfig::default());
        let (shutdown, rx) = broadcast::channel(1);
        tokio::spawn(worker.run(rx));
        Online {
            registry,
            notifier: Notifier::new(dispatcher),
            _shutdown: shutdown,
        }
    }

    /// Connect `user` and swallow the handshake
    async fn inbox(registry: &SessionRegistry, user: UserId) -> mpsc::Receiver<Envelope> {
        let (tx, mut rx) = mpsc::channel(8);
        registry.connect(&user.to_string(), tx).unwrap();
        rx.recv().await.unwrap();
        rx
    }

    async fn next(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn user(name: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: name.to_string(),
            email: format!("{}@example.com", name),
            name: None,
        }
    }

    #[tokio::test]
    async fn test_file_committed_reaches_each_recipient() {
        let o = online();
        let author = user("alice");
        let (bob, carol) = (Uuid::new_v4(), Uuid::new_v4());
        let mut bob_rx = inbox(&o.registry, bob).await;
        let mut carol_rx = inbox(&o.registry, carol).await;

        let version = FileVersion {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            file_path: "src/lib.rs".to_string(),
            file_name: "lib.rs".to_string(),
            file_type: "rust".to_string(),
            version: 3,
            content: String::new(),
            file_hash: String::new(),
            file_size: 0,
            commit_message: "tidy".to_string(),
            author_id: author.id,
            is_deleted: true,
            created_at: Utc::now(),
        };
        o.notifier.file_committed(&version, &author, &[bob, carol]);

        for rx in [&mut bob_rx, &mut carol_rx] {
            let got = next(rx).await;
            assert_eq!(got.kind, EventType::FileUpdated);
            assert_eq!(got.sender, Some(author.id));
            let payload = got.payload.unwrap();
            assert_eq!(payload["version"], 3);
            assert_eq!(payload["is_deleted"], true);
            assert_eq!(payload["message"], "alice deleted src/lib.rs (v3)");
        }
    }

    #[tokio::test]
    async fn test_conflict_resolved_skips_the_resolver() {
        let o = online();
        let (local, remote) = (Uuid::new_v4(), Uuid::new_v4());
        let mut local_rx = inbox(&o.registry, local).await;
        let mut remote_rx = inbox(&o.registry, remote).await;

        let conflict = FileConflict {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            file_path: "a.txt".to_string(),
            base_version: 1,
            latest_version: 2,
            local_author_id: local,
            remote_author_id: remote,
            local_content: "mine".to_string(),
            remote_content: "theirs".to_string(),
            status: ConflictStatus::Resolved,
            resolved_by: Some(local),
            created_at: Utc::now(),
            resolved_at: Some(Utc::now()),
        };
        o.notifier.conflict_resolved(&conflict, local);

        let got = next(&mut remote_rx).await;
        assert_eq!(got.kind, EventType::ConflictResolved);
        assert_eq!(got.payload.unwrap()["resolved_by"], local.to_string());
        assert!(local_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_collaboration_updated_skips_the_decider() {
        let o = online();
        let owner = Uuid::new_v4();
        let guest = Uuid::new_v4();
        let mut owner_rx = inbox(&o.registry, owner).await;
        let mut guest_rx = inbox(&o.registry, guest).await;

        let collaboration = Collaborator::new(Uuid::new_v4(), guest, CollaborationStatus::Rejected);
        o.notifier
            .collaboration_updated(&collaboration, guest, &[owner, guest]);

        let got = next(&mut owner_rx).await;
        assert_eq!(got.kind, EventType::CollaborationUpdated);
        assert_eq!(got.payload.unwrap()["status"], "rejected");
        assert!(guest_rx.try_recv().is_err());
    }
}
