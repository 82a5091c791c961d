//! WebSocket handling for real-time graph updates

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use trellis_core::{Edge, Node};

use crate::ServerState;

/// Replies queued per connection ahead of the socket writer.
const REPLY_QUEUE: usize = 16;

/// WebSocket message types for client-server communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Client requests the full graph
    RequestFullGraph,
    /// Server sends the full graph
    FullGraph { graph: GraphData },
    /// Server broadcasts a graph diff
    GraphDiff { diff: trellis_core::GraphDiff },
    /// Client acknowledges a diff
    DiffAck { sequence: u64 },
    Subscribe,
    Unsubscribe,
    Ping,
    Pong,
    Error { message: String },
}

/// Whole-graph payload sent on connect and on request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphData {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    /// Diff sequence the graph reflects; later diffs have larger numbers.
    pub sequence: u64,
}

fn graph_data(state: &ServerState) -> GraphData {
    let store = state.store();
    // Read the sequence first so a diff racing the export is never skipped.
    let sequence = store.sequence();
    let snapshot = store.export_snapshot();
    GraphData {
        nodes: snapshot.nodes,
        edges: snapshot.edges,
        sequence,
    }
}

fn full_graph_message(state: &ServerState) -> Option<String> {
    let message = WsMessage::FullGraph {
        graph: graph_data(state),
    };
    match serde_json::to_string(&message) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!("Failed to serialize full graph message: {}", e);
            None
        }
    }
}

/// Handle WebSocket upgrade requests
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    info!("New WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();
    // Subscribe before the snapshot so no diff falls between the two.
    let mut diffs = state.diff_tx.subscribe();

    if let Some(json) = full_graph_message(&state) {
        if sender.send(Message::Text(json)).await.is_err() {
            warn!("Failed to send initial full graph to WebSocket client");
            return;
        }
    }

    let subscribed = Arc::new(AtomicBool::new(true));
    let (reply_tx, mut replies) = mpsc::channel::<String>(REPLY_QUEUE);

    let recv_state = Arc::clone(&state);
    let recv_subscribed = Arc::clone(&subscribed);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let reply = match serde_json::from_str::<WsMessage>(&text) {
                        Ok(message) => handle_client_message(message, &recv_state, &recv_subscribed),
                        Err(e) => {
                            debug!("Unparseable WebSocket message: {}", e);
                            serde_json::to_string(&WsMessage::Error {
                                message: format!("invalid message: {}", e),
                            })
                            .ok()
                        }
                    };
                    if let Some(reply) = reply {
                        if reply_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Message::Close(_) => {
                    debug!("WebSocket client disconnected");
                    break;
                }
                _ => {}
            }
        }
    });

    let mut send_task = tokio::spawn(async move {
        loop {
            let outgoing = tokio::select! {
                reply = replies.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
                diff = diffs.recv() => match diff {
                    Ok(diff) if subscribed.load(Ordering::Acquire) => diff,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The client's view is now incomplete; resend everything.
                        warn!("WebSocket client lagged behind by {} diffs", skipped);
                        match full_graph_message(&state) {
                            Some(json) => json,
                            None => continue,
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if sender.send(Message::Text(outgoing)).await.is_err() {
                debug!("Failed to send message to WebSocket client");
                break;
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    info!("WebSocket connection closed");
}

/// Returns the reply to send, if any.
fn handle_client_message(msg: WsMessage, state: &ServerState, subscribed: &AtomicBool) -> Option<String> {
    match msg {
        WsMessage::RequestFullGraph => full_graph_message(state),
        WsMessage::Subscribe => {
            subscribed.store(true, Ordering::Release);
            None
        }
        WsMessage::Unsubscribe => {
            subscribed.store(false, Ordering::Release);
            None
        }
        WsMessage::DiffAck { sequence } => {
            debug!("Client acknowledged diff {}", sequence);
            None
        }
        WsMessage::Ping => serde_json::to_string(&WsMessage::Pong).ok(),
        other => {
            debug!("Ignoring server-side message from client: {:?}", other);
            None
        }
    }
}
