//! Online sessions and best-effort event delivery.
//!
//! This module provides:
//! - One [`Session`] per connected user, owning the user's outbox
//! - A registry enforcing at most one session per user (last connect wins)
//! - A single-worker dispatcher that routes envelopes to recipients
//! - Presence queries on top of the registry

pub mod dispatcher;
pub mod presence;
pub mod protocol;
pub mod registry;

pub use dispatcher::{DispatchConfig, DispatchStats, DispatchWorker, Dispatcher};
pub use presence::{CollaboratorPresence, Presence};
pub use protocol::{Envelope, EventType, ProtocolError};
pub use registry::SessionRegistry;

use parking_lot::RwLock;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::{parse_id, AppError, AppResult};

/// Unique identifier for a user
pub type UserId = Uuid;

pub fn parse_user_id(raw: &str) -> AppResult<UserId> {
    parse_id("user_id", raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Transport timings and buffer sizes
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often the server pings an idle socket
    pub heartbeat_interval: Duration,
    /// Silence longer than this tears the session down
    pub read_timeout: Duration,
    /// Deadline for flushing one frame to the socket
    pub write_timeout: Duration,
    /// Envelopes buffered per session before delivery blocks
    pub outbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            outbox_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }
}

/// A connected user's transport handle
pub struct Session {
    user_id: UserId,
    session_id: Uuid,
    outbox: mpsc::Sender<Envelope>,
    state: watch::Sender<SessionState>,
    last_active: RwLock<Instant>,
}

impl Session {
    pub fn new(user_id: UserId, outbox: mpsc::Sender<Envelope>) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            user_id,
            session_id: Uuid::new_v4(),
            outbox,
            state,
            last_active: RwLock::new(Instant::now()),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Watch for state changes; the transport exits once it sees `Closing`
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Queue the handshake and move Connecting -> Active
    pub fn activate(&self) -> AppResult<()> {
        self.try_push(Envelope::connection_success(self.user_id))?;
        self.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// Push without waiting; fails if the outbox is full or gone
    pub fn try_push(&self, envelope: Envelope) -> AppResult<()> {
        self.outbox.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => AppError::Transport(format!("outbox of {} is full", self.user_id)),
            TrySendError::Closed(_) => AppError::Transport(format!("outbox of {} is closed", self.user_id)),
        })
    }

    /// Push, waiting at most `deadline` for room in the outbox
    pub async fn deliver(&self, envelope: Envelope, deadline: Duration) -> AppResult<()> {
        if !self.is_active() {
            return Err(AppError::Transport(format!(
                "session of {} is {:?}",
                self.user_id,
                self.state()
            )));
        }
        self.outbox
            .send_timeout(envelope, deadline)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => {
                    AppError::Transport(format!("delivery to {} timed out", self.user_id))
                }
                SendTimeoutError::Closed(_) => {
                    AppError::Transport(format!("outbox of {} is closed", self.user_id))
                }
            })
    }

    /// Begin teardown. Returns true only for the call that started it.
    pub fn close(&self) -> bool {
        self.state.send_if_modified(|state| match state {
            SessionState::Connecting | SessionState::Active => {
                *state = SessionState::Closing;
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        })
    }

    /// Mark the transport as gone
    pub fn finish(&self) {
        self.state.send_replace(SessionState::Closed);
    }

    pub fn touch(&self) {
        *self.last_active.write() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.read().elapsed()
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_activate_queues_handshake() {
        let (tx, mut rx) = mpsc::channel(4);
        let session = Session::new(Uuid::new_v4(), tx);
        assert_eq!(session.state(), SessionState::Connecting);

        session.activate().unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(rx.recv().await.unwrap().kind, EventType::ConnectionSuccess);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (tx, _rx) = mpsc::channel(4);
        let session = Session::new(Uuid::new_v4(), tx);
        session.activate().unwrap();

        let mut watcher = session.subscribe();
        assert!(session.close());
        assert!(!session.close());
        watcher.changed().await.unwrap();
        assert_eq!(*watcher.borrow(), SessionState::Closing);

        session.finish();
        assert!(!session.close());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_deliver_times_out_on_full_outbox() {
        let (tx, _rx) = mpsc::channel(1);
        let session = Session::new(Uuid::new_v4(), tx);
        // The handshake fills the only slot.
        session.activate().unwrap();

        let result = session
            .deliver(Envelope::new(EventType::Notification), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(AppError::Transport(_))));
    }

    #[tokio::test]
    async fn test_deliver_refused_after_close() {
        let (tx, _rx) = mpsc::channel(4);
        let session = Session::new(Uuid::new_v4(), tx);
        session.activate().unwrap();
        session.close();

        let result = session
            .deliver(Envelope::new(EventType::Notification), Duration::from_millis(20))
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_staleness() {
        let (tx, _rx) = mpsc::channel(1);
        let session = Session::new(Uuid::new_v4(), tx);
        assert!(!session.is_stale(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(session.is_stale(Duration::from_millis(1)));
        session.touch();
        assert!(session.idle_for() < Duration::from_secs(1));
    }
}
