//! Tool-call protocol for coding agents
//!
//! `GET /api/agent/tools` describes the tools; `POST /api/agent` runs one.
//! Limits default to the configured default and are clamped to
//! `1..=max_page_size` instead of being rejected, so agents never need to
//! know the server's bounds.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{extract::State, response::Json};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;
use trellis_core::{Direction, GraphQuery, NodeFilter, NodeId, NodeType, QueryError};

use crate::ServerState;

#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentRequest {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("missing or invalid '{0}' argument")]
    MissingArgument(&'static str),

    #[error("invalid arguments: {0}")]
    InvalidArguments(#[from] serde_json::Error),

    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Arguments accepted by any tool; each tool reads the fields it needs.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Arguments {
    #[serde(alias = "id", alias = "function_id")]
    node_id: Option<String>,
    #[serde(alias = "query")]
    keyword: Option<String>,
    #[serde(alias = "file_path")]
    filepath: Option<PathBuf>,
    #[serde(alias = "type")]
    node_type: Option<String>,
    filters: Option<NodeFilter>,
    direction: Option<Value>,
    limit: Option<Value>,
    offset: Option<usize>,
}

impl Arguments {
    fn node_id(&self) -> Result<NodeId, AgentError> {
        self.node_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(NodeId::from)
            .ok_or(AgentError::MissingArgument("node_id"))
    }

    fn keyword(&self) -> Result<&str, AgentError> {
        self.keyword
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(AgentError::MissingArgument("keyword"))
    }

    fn filepath(&self) -> Result<&PathBuf, AgentError> {
        self.filepath.as_ref().ok_or(AgentError::MissingArgument("filepath"))
    }

    /// Unknown directions read as both.
    fn direction(&self) -> Direction {
        self.direction
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    /// Non-positive or non-integer limits fall back to the default.
    fn limit(&self, default: usize, max: usize) -> usize {
        let requested = self
            .limit
            .as_ref()
            .and_then(Value::as_i64)
            .filter(|limit| *limit > 0)
            .map(|limit| limit as usize)
            .unwrap_or(default);
        requested.clamp(1, max.max(1))
    }
}

fn limit_schema() -> Value {
    json!({"type": "integer", "description": "Maximum number of results to return", "default": 10})
}

fn string_schema(description: &str) -> Value {
    json!({"type": "string", "description": description})
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({"type": "object", "properties": properties, "required": required})
}

/// Every tool the agent endpoint understands.
pub fn tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "list_nodes",
            description: "List nodes in the graph with optional filtering.",
            input_schema: object_schema(
                json!({
                    "filters": {
                        "type": "object",
                        "description": "Optional filters, e.g. {\"node_type\": \"function\", \"file_path\": \"a.py\"}"
                    },
                    "limit": limit_schema(),
                    "offset": {"type": "integer", "default": 0}
                }),
                &[],
            ),
        },
        ToolDescriptor {
            name: "get_node_details",
            description: "Get detailed information about a specific node.",
            input_schema: object_schema(
                json!({"node_id": string_schema("The ID of the node to retrieve")}),
                &["node_id"],
            ),
        },
        ToolDescriptor {
            name: "search_nodes",
            description: "Search for nodes matching a keyword in name, qualified name or file path.",
            input_schema: object_schema(
                json!({"keyword": string_schema("The search term to look for"), "limit": limit_schema()}),
                &["keyword"],
            ),
        },
        ToolDescriptor {
            name: "list_edges_for_node",
            description: "List edges connected to a specific node.",
            input_schema: object_schema(
                json!({
                    "node_id": string_schema("The ID of the node"),
                    "direction": {
                        "type": "string",
                        "enum": ["incoming", "outgoing", "both"],
                        "default": "both"
                    },
                    "limit": limit_schema(),
                    "offset": {"type": "integer", "default": 0}
                }),
                &["node_id"],
            ),
        },
        ToolDescriptor {
            name: "find_functions_calling",
            description: "Find functions that call the given function.",
            input_schema: object_schema(
                json!({"node_id": string_schema("The ID of the called function"), "limit": limit_schema()}),
                &["node_id"],
            ),
        },
        ToolDescriptor {
            name: "find_functions_called_by",
            description: "Find functions called by the given function.",
            input_schema: object_schema(
                json!({"node_id": string_schema("The ID of the calling function"), "limit": limit_schema()}),
                &["node_id"],
            ),
        },
        ToolDescriptor {
            name: "get_nodes_by_type",
            description: "List nodes of one type (module, class, function, variable).",
            input_schema: object_schema(
                json!({"node_type": string_schema("The node type"), "limit": limit_schema()}),
                &["node_type"],
            ),
        },
        ToolDescriptor {
            name: "get_nodes_by_filepath",
            description: "List nodes defined in a file.",
            input_schema: object_schema(
                json!({"filepath": string_schema("Repository-relative file path"), "limit": limit_schema()}),
                &["filepath"],
            ),
        },
        ToolDescriptor {
            name: "find_functions_by_keyword",
            description: "Find functions that match a keyword in their name or parameters.",
            input_schema: object_schema(
                json!({
                    "keyword": string_schema("The keyword to search for in function names or parameters"),
                    "limit": limit_schema()
                }),
                &["keyword"],
            ),
        },
        ToolDescriptor {
            name: "find_functions_calling_filepath",
            description: "Find functions that call any function defined in the specified filepath.",
            input_schema: object_schema(
                json!({"filepath": string_schema("The filepath to find callers for"), "limit": limit_schema()}),
                &["filepath"],
            ),
        },
        ToolDescriptor {
            name: "graph_stats",
            description: "Node, edge, pending edge and file counts.",
            input_schema: object_schema(json!({}), &[]),
        },
    ]
}

/// Run one tool call against the graph.
pub fn dispatch(query: &GraphQuery, default_limit: usize, request: &AgentRequest) -> Result<Value, AgentError> {
    let arguments: Arguments = match &request.arguments {
        Value::Null => Arguments::default(),
        value => serde_json::from_value(value.clone())?,
    };
    let limit = arguments.limit(default_limit, query.max_page_size());
    let offset = arguments.offset.unwrap_or(0);
    debug!("Agent tool {} (limit {})", request.tool, limit);

    let result = match request.tool.as_str() {
        "list_nodes" => {
            let filter = arguments.filters.clone().unwrap_or_default();
            serde_json::to_value(query.list_nodes(&filter, limit, offset)?)?
        }
        "get_node_details" => serde_json::to_value(query.get_node_details(&arguments.node_id()?)?)?,
        "search_nodes" => serde_json::to_value(query.search_nodes(arguments.keyword()?, limit)?)?,
        "list_edges_for_node" => {
            let direction = arguments.direction();
            serde_json::to_value(query.list_edges_for_node(&arguments.node_id()?, direction, limit, offset)?)?
        }
        "find_functions_calling" => serde_json::to_value(query.find_functions_calling(&arguments.node_id()?, limit)?)?,
        "find_functions_called_by" => {
            serde_json::to_value(query.find_functions_called_by(&arguments.node_id()?, limit)?)?
        }
        "get_nodes_by_type" => {
            let node_type = arguments
                .node_type
                .clone()
                .map(NodeType::from)
                .ok_or(AgentError::MissingArgument("node_type"))?;
            serde_json::to_value(query.nodes_by_type(node_type, limit, offset)?)?
        }
        "get_nodes_by_filepath" => serde_json::to_value(query.nodes_by_filepath(arguments.filepath()?, limit, offset)?)?,
        "find_functions_by_keyword" => serde_json::to_value(query.find_functions_by_keyword(arguments.keyword()?, limit)?)?,
        "find_functions_calling_filepath" => {
            serde_json::to_value(query.find_functions_calling_filepath(arguments.filepath()?, limit)?)?
        }
        "graph_stats" => serde_json::to_value(query.stats())?,
        other => return Err(AgentError::UnknownTool(other.to_string())),
    };
    Ok(result)
}

pub async fn list_tools() -> Json<Vec<ToolDescriptor>> {
    Json(tools())
}

/// Tool failures are reported in the body, never as HTTP errors.
pub async fn call_tool(State(state): State<Arc<ServerState>>, Json(request): Json<AgentRequest>) -> Json<AgentResponse> {
    let response = match dispatch(&state.query, state.default_limit, &request) {
        Ok(result) => AgentResponse {
            ok: true,
            result: Some(result),
            error: None,
        },
        Err(e) => AgentResponse {
            ok: false,
            result: None,
            error: Some(e.to_string()),
        },
    };
    Json(response)
}
