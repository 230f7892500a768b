//! Collab Hub - real-time collaboration backend
//!
//! A coordination server for collaborative projects using:
//! - One WebSocket session per user for best-effort event delivery
//! - Linear per-file version history with optimistic conflict detection
//! - Sled embedded database for versions and conflict records
//! - Axum for the HTTP and WebSocket surface

pub mod api;
pub mod collaboration;
pub mod config;
pub mod directory;
pub mod error;
pub mod notifier;
pub mod session;
pub mod share;
pub mod storage;
pub mod vcs;

pub use api::{router, AppState, BackgroundTaskHandles};
pub use config::ServerConfig;
pub use error::{AppError, AppResult};
