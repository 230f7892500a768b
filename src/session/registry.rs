//! Registry of online sessions, one per user.
//!
//! All access goes through these methods; shard locks are never held across
//! an await or while talking to a socket.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{parse_user_id, Envelope, Session, UserId};
use crate::error::AppResult;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<UserId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `raw_user_id`, closing any session it replaces
    pub fn connect(&self, raw_user_id: &str, outbox: mpsc::Sender<Envelope>) -> AppResult<Arc<Session>> {
        let user_id = parse_user_id(raw_user_id)?;
        let session = Arc::new(Session::new(user_id, outbox));
        session.activate()?;

        let previous = self.sessions.insert(user_id, session.clone());
        if let Some(previous) = previous {
            previous.close();
            info!(
                user_id = %user_id,
                "Session {} replaced by {}",
                previous.session_id(),
                session.session_id()
            );
        } else {
            info!(user_id = %user_id, "Session {} connected", session.session_id());
        }

        Ok(session)
    }

    /// Drop whatever session the user has; no-op when offline
    pub fn disconnect(&self, user_id: UserId) -> bool {
        match self.sessions.remove(&user_id) {
            Some((_, session)) => {
                session.close();
                info!(user_id = %user_id, "Session {} disconnected", session.session_id());
                true
            }
            None => false,
        }
    }

    /// Remove `session` only if it is still the user's current one
    pub fn release(&self, session: &Arc<Session>) -> bool {
        let removed = self
            .sessions
            .remove_if(&session.user_id(), |_, current| Arc::ptr_eq(current, session))
            .is_some();
        session.close();
        if removed {
            debug!(user_id = %session.user_id(), "Session {} released", session.session_id());
        }
        removed
    }

    pub fn get(&self, user_id: UserId) -> Option<Arc<Session>> {
        self.sessions.get(&user_id).map(|s| s.clone())
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.sessions.contains_key(&user_id)
    }

    /// Point-in-time snapshot, unordered
    pub fn list_online(&self) -> Vec<UserId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Evict sessions silent for longer than `max_idle`
    pub fn reap_idle(&self, max_idle: Duration) -> Vec<UserId> {
        let stale: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_stale(max_idle))
            .map(|entry| entry.value().clone())
            .collect();

        stale
            .into_iter()
            .filter(|session| self.release(session))
            .map(|session| {
                warn!(
                    user_id = %session.user_id(),
                    "Reaped session idle for {:?}",
                    session.idle_for()
                );
                session.user_id()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::session::{EventType, SessionState};
    use uuid::Uuid;

    fn outbox() -> (mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>) {
        mpsc::channel(8)
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_id() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = outbox();
        assert!(matches!(
            registry.connect("not-a-uuid", tx),
            Err(AppError::Validation(_))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_last_connect_wins() {
        let registry = SessionRegistry::new();
        let user = Uuid::new_v4();

        let (tx1, mut rx1) = outbox();
        let first = registry.connect(&user.to_string(), tx1).unwrap();
        let (tx2, _rx2) = outbox();
        let second = registry.connect(&user.to_string(), tx2).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(first.state(), SessionState::Closing);
        assert!(second.is_active());
        assert!(Arc::ptr_eq(&registry.get(user).unwrap(), &second));
        assert_eq!(rx1.recv().await.unwrap().kind, EventType::ConnectionSuccess);
    }

    #[tokio::test]
    async fn test_stale_release_keeps_successor() {
        let registry = SessionRegistry::new();
        let user = Uuid::new_v4();

        let (tx1, _rx1) = outbox();
        let first = registry.connect(&user.to_string(), tx1).unwrap();
        let (tx2, _rx2) = outbox();
        let second = registry.connect(&user.to_string(), tx2).unwrap();

        assert!(!registry.release(&first));
        assert!(registry.is_online(user));
        assert!(registry.release(&second));
        assert!(!registry.is_online(user));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let registry = SessionRegistry::new();
        let user = Uuid::new_v4();
        let (tx, _rx) = outbox();
        let session = registry.connect(&user.to_string(), tx).unwrap();

        assert!(registry.disconnect(user));
        assert!(!registry.disconnect(user));
        assert_eq!(session.state(), SessionState::Closing);
        assert!(registry.list_online().is_empty());
    }

    #[tokio::test]
    async fn test_reap_idle() {
        let registry = SessionRegistry::new();
        let idle = Uuid::new_v4();
        let busy = Uuid::new_v4();
        let (tx1, _rx1) = outbox();
        let (tx2, _rx2) = outbox();
        registry.connect(&idle.to_string(), tx1).unwrap();
        let busy_session = registry.connect(&busy.to_string(), tx2).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        busy_session.touch();

        let reaped = registry.reap_idle(Duration::from_millis(20));
        assert_eq!(reaped, vec![idle]);
        assert_eq!(registry.list_online(), vec![busy]);
    }
}
