//! Online/offline queries derived from the session registry.

use serde::Serialize;
use std::sync::Arc;

use super::{SessionRegistry, UserId};
use crate::directory::Collaborator;

/// A collaborator annotated with whether they are connected right now
#[derive(Debug, Clone, Serialize)]
pub struct CollaboratorPresence {
    #[serde(flatten)]
    pub collaborator: Collaborator,
    pub is_online: bool,
}

#[derive(Clone)]
pub struct Presence {
    registry: Arc<SessionRegistry>,
}

impl Presence {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.registry.is_online(user_id)
    }

    pub fn list_online(&self) -> Vec<UserId> {
        self.registry.list_online()
    }

    pub fn online_count(&self) -> usize {
        self.registry.len()
    }

    pub fn annotate(&self, collaborators: Vec<Collaborator>) -> Vec<CollaboratorPresence> {
        collaborators
            .into_iter()
            .map(|collaborator| CollaboratorPresence {
                is_online: self.is_online(collaborator.user_id),
                collaborator,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::CollaborationStatus;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_annotate() {
        let registry = Arc::new(SessionRegistry::new());
        let presence = Presence::new(registry.clone());
        let project = Uuid::new_v4();
        let online = Uuid::new_v4();
        let offline = Uuid::new_v4();

        let (tx, _rx) = mpsc::channel(4);
        registry.connect(&online.to_string(), tx).unwrap();

        let annotated = presence.annotate(vec![
            Collaborator::new(project, online, CollaborationStatus::Approved),
            Collaborator::new(project, offline, CollaborationStatus::Approved),
        ]);
        assert!(annotated[0].is_online);
        assert!(!annotated[1].is_online);
        assert_eq!(presence.online_count(), 1);
        assert_eq!(presence.list_online(), vec![online]);

        let json = serde_json::to_value(&annotated[0]).unwrap();
        assert_eq!(json["user_id"], online.to_string());
        assert_eq!(json["is_online"], true);
    }
}
