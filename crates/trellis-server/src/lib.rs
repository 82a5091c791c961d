//! HTTP + WebSocket server

pub mod agent;
pub mod handlers;
pub mod router;
pub mod websocket;


use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;
use trellis_core::config::{QueryConfig, ServerConfig};
use trellis_core::{GraphQuery, GraphStore, InstrumentationMerge};

pub use router::create_router;

/// Diffs buffered per websocket client before it is reported as lagging.
const DIFF_CHANNEL_CAPACITY: usize = 256;

/// Shared state handed to every handler.
pub struct ServerState {
    pub query: GraphQuery,
    pub merge: InstrumentationMerge,
    pub diff_tx: broadcast::Sender<String>,
    /// Page size used when a request gives none.
    pub default_limit: usize,
}

impl ServerState {
    pub fn new(store: Arc<GraphStore>, config: &QueryConfig) -> Self {
        let (diff_tx, _) = broadcast::channel(DIFF_CHANNEL_CAPACITY);
        ServerState {
            query: GraphQuery::new(Arc::clone(&store), config.max_page_size),
            merge: InstrumentationMerge::new(store),
            diff_tx,
            default_limit: config.default_limit,
        }
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        self.query.store()
    }

    /// Send a message to every connected websocket client.
    pub fn broadcast(&self, message: String) -> Result<usize, broadcast::error::SendError<String>> {
        self.diff_tx.send(message)
    }
}

pub struct TrellisServer {
    state: Arc<ServerState>,
    config: ServerConfig,
}

impl TrellisServer {
    pub fn new(state: Arc<ServerState>, config: ServerConfig) -> Self {
        TrellisServer { state, config }
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Serve until `shutdown` resolves.
    pub async fn start(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("Trellis server listening on http://{}", listener.local_addr()?);

        axum::serve(listener, create_router(self.state))
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("Server stopped");
        Ok(())
    }
}
