//! Collab Room Server - real-time collaborative document editing
//!
//! A room server using:
//! - One actor task per room for ordered membership, broadcast and edits
//! - Sled embedded database (or memory) for document persistence
//! - Axum with WebSocket for client connections

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

use collab_room_server::api::{build_router, AppState};
use collab_room_server::config::{ServerConfig, StorageBackend};
use collab_room_server::room::RoomRegistry;
use collab_room_server::storage::{DocumentGateway, MemoryDocumentStore, SledDocumentStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_room_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env().context("Invalid configuration")?;

    let store: Arc<dyn DocumentGateway> = match config.backend {
        StorageBackend::Sled => {
            info!("Initializing storage at: {}", config.storage.path);
            let store = SledDocumentStore::open(config.storage.clone())
                .with_context(|| format!("Failed to open storage at {}", config.storage.path))?;
            Arc::new(store)
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage, documents are lost on restart");
            Arc::new(MemoryDocumentStore::new())
        }
    };

    let registry = Arc::new(RoomRegistry::new(store, config.room.clone()));

    let addr = config.bind_addr();
    let state = Arc::new(AppState::new(registry, config));
    let app = build_router(state);

    info!("Collab room server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws/:room_id", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
