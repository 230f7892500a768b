//! HTTP and WebSocket surface of the hub.
//!
//! [`AppState`] wires the services together; [`router`] exposes them.

pub mod http;
pub mod ws;

use axum::{
    http::Method,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::collaboration::CollaborationService;
use crate::config::ServerConfig;
use crate::directory::Directories;
use crate::notifier::Notifier;
use crate::session::{DispatchWorker, Dispatcher, Presence, SessionRegistry};
use crate::share::ShareService;
use crate::storage::VersionStore;
use crate::vcs::VersionControl;

/// Shared application state
pub struct AppState {
    pub config: ServerConfig,
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Dispatcher,
    pub presence: Presence,
    pub vcs: VersionControl,
    pub shares: ShareService,
    pub collaboration: CollaborationService,
    pub store: VersionStore,
    /// Server start time
    pub started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Build the state; the returned worker must be started with
    /// [`AppState::start_background_tasks`]
    pub fn new(config: ServerConfig, store: VersionStore, directories: Directories) -> (Arc<Self>, DispatchWorker) {
        let registry = Arc::new(SessionRegistry::new());
        let (dispatcher, worker) = Dispatcher::new(registry.clone(), config.dispatch.clone());
        let presence = Presence::new(registry.clone());
        let notifier = Notifier::new(dispatcher.clone());

        let vcs = VersionControl::new(store.clone(), notifier.clone(), directories.clone());
        let shares = ShareService::new(dispatcher.clone(), presence.clone(), directories.clone());
        let collaboration = CollaborationService::new(notifier, presence.clone(), directories);
        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(Self {
            config,
            registry,
            dispatcher,
            presence,
            vcs,
            shares,
            collaboration,
            store,
            started_at: Instant::now(),
            shutdown_tx,
        });
        (state, worker)
    }

    /// Spawn the dispatch worker and the idle-session reaper
    pub fn start_background_tasks(self: &Arc<Self>, worker: DispatchWorker) -> BackgroundTaskHandles {
        let dispatch_task = tokio::spawn(worker.run(self.shutdown_tx.subscribe()));

        let state = self.clone();
        let reap_interval = state.config.session.heartbeat_interval;
        let max_idle = state.config.session.read_timeout;

        let reaper_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(reap_interval);
            let mut shutdown = state.shutdown_tx.subscribe();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let reaped = state.registry.reap_idle(max_idle);
                        if !reaped.is_empty() {
                            warn!("Reaped {} idle sessions", reaped.len());
                        }
                        let pruned = state.store.prune_path_locks();
                        if pruned > 0 {
                            debug!("Pruned {} idle path locks", pruned);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Session reaper shutting down");
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            dispatch_task,
            reaper_task,
        }
    }

    /// Signal background tasks to stop and close every session
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        for user_id in self.registry.list_online() {
            self.registry.disconnect(user_id);
        }
    }
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub dispatch_task: tokio::task::JoinHandle<()>,
    pub reaper_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = tokio::join!(self.dispatch_task, self.reaper_task);
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(http::health_check))
        // Sessions and presence
        .route("/ws", get(ws::ws_handler))
        .route("/ws/online-users", get(http::online_users))
        .route("/ws/user-status", get(http::user_status))
        // Version control
        .route("/version/commit", post(http::commit))
        .route("/version/delete", post(http::delete_file))
        .route("/version/history", get(http::file_history))
        .route("/version/latest", get(http::latest_version))
        .route("/version/by-id", get(http::version_by_id))
        .route("/version/project", get(http::project_versions))
        .route("/version/conflicts", get(http::pending_conflicts))
        .route("/version/conflict", get(http::conflict_by_id))
        .route("/version/resolve", post(http::resolve_conflict))
        .route("/version/ignore", post(http::ignore_conflict))
        // Sharing
        .route("/share/file", post(http::share_file))
        .route("/share/code", post(http::share_code))
        .route("/share/bulk", post(http::share_bulk))
        .route("/share/collaborators", get(http::shareable_collaborators))
        // Collaboration requests
        .route("/collab/invite", post(http::invite))
        .route("/collab/decide", post(http::decide))
        .route("/collab/project", get(http::project_collaborators))
        .route("/collab/requests", get(http::pending_requests))
        .route("/collab/remove/:collab_id", delete(http::remove_collaborator))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
