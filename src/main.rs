use anyhow::Context;
use std::{net::SocketAddr, sync::Arc};
use tracing::{info, warn};

use collab_hub::directory::{Directories, DirectorySeed, InMemoryDirectory, TracingActivityLog};
use collab_hub::storage::VersionStore;
use collab_hub::{router, AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_hub=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env().context("Invalid server configuration")?;

    info!("Initializing storage at: {}", config.storage.path);
    let store = VersionStore::open(config.storage.clone()).context("Failed to open storage")?;
    info!("Storage initialized successfully");

    let directory = match &config.directory_seed {
        Some(path) => {
            info!("Loading directory seed from {}", path.display());
            InMemoryDirectory::from_seed(DirectorySeed::load(path)?)
        }
        None => {
            warn!("DIRECTORY_SEED not set - directory starts empty");
            InMemoryDirectory::new()
        }
    };
    let directories = Directories::in_memory(Arc::new(directory), Arc::new(TracingActivityLog::default()));

    let (state, worker) = AppState::new(config.clone(), store.clone(), directories);
    let handles = state.start_background_tasks(worker);
    let app = router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!("🚀 Collab hub v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws?user_id=<uuid>", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    state.shutdown();
    handles.wait().await;
    store.flush().context("Failed to flush storage")?;
    info!("Collab hub stopped");
    Ok(())
}
