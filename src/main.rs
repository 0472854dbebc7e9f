//! MCP rr Server
//!
//! A Model Context Protocol (MCP) server that lets LLMs debug rr traces.
//! It drives `rr replay` over GDB/MI and returns each command's output once
//! the debugger has settled.
//!
//! Usage:
//!   Add to Claude Desktop config:
//!   ```json
//!   {
//!     "mcpServers": {
//!       "rr": {
//!         "command": "/path/to/mcp-rr-server",
//!         "env": { "RR_MCP_RR_PATH": "/usr/local/bin/rr" }
//!       }
//!     }
//!   }
//!   ```

mod mcp;
mod replay;

use crate::mcp::protocol::*;
use crate::mcp::RrMcpServer;
use crate::replay::RrConfig;
use anyhow::Result;
use std::io::{BufRead, BufReader, Write};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// MCP Server state
struct ServerState {
    server: RrMcpServer,
    initialized: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting MCP rr Server v{}", env!("CARGO_PKG_VERSION"));

    let config = RrConfig::from_env();
    debug!("Using {:?}", config);

    let state = RwLock::new(ServerState {
        server: RrMcpServer::new(config),
        initialized: false,
    });

    // Read from stdin, write to stdout
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();

    let reader = BufReader::new(stdin);

    info!("MCP rr Server ready, listening on stdin");

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("Error reading from stdin: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        debug!("Received: {}", line);

        let reply = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(req) => {
                let id = req.id.clone();
                match handle_request(&state, req).await {
                    Ok(Some(resp)) => Some(serde_json::to_string(&resp)?),
                    // Notification, no response needed
                    Ok(None) => None,
                    Err(e) => {
                        error!("Error handling request: {} ({})", e.message, e.code);
                        let error_resp = JsonRpcErrorResponse::new(id, e);
                        Some(serde_json::to_string(&error_resp)?)
                    }
                }
            }
            Err(e) => {
                error!("Failed to parse request: {}", e);
                let error_resp = JsonRpcErrorResponse::new(None, JsonRpcError::parse_error());
                Some(serde_json::to_string(&error_resp)?)
            }
        };

        if let Some(reply) = reply {
            debug!("Sending: {}", reply);
            writeln!(stdout, "{}", reply)?;
            stdout.flush()?;
        }
    }

    info!("MCP rr Server shutting down");
    let state = state.into_inner();
    if !state.initialized {
        debug!("Client disconnected before initialize");
    }
    let manager = std::sync::Arc::clone(state.server.manager());
    tokio::task::spawn_blocking(move || manager.exit()).await?;
    Ok(())
}

/// Handle a JSON-RPC request
async fn handle_request(
    state: &RwLock<ServerState>,
    request: JsonRpcRequest,
) -> std::result::Result<Option<JsonRpcResponse>, JsonRpcError> {
    let method = request.method.as_str();

    debug!("Handling method: {}", method);

    let internal = |e: anyhow::Error| JsonRpcError::internal_error(&e.to_string());

    let result = match method {
        // MCP Protocol methods
        "initialize" => {
            let mut state = state.write().await;
            state.initialized = true;
            state.server.handle_initialize(request.params).await.map_err(internal)?
        }
        "initialized" | "notifications/initialized" | "notifications/cancelled" => {
            // Notification, no response needed
            return Ok(None);
        }
        "ping" | "logging/setLevel" => serde_json::json!({}),
        "tools/list" => {
            let state = state.read().await;
            state.server.handle_tools_list().await.map_err(internal)?
        }
        "tools/call" => {
            let state = state.read().await;
            state.server.handle_tools_call(request.params).await.map_err(internal)?
        }
        "resources/list" => serde_json::json!({"resources": []}),
        "prompts/list" => serde_json::json!({"prompts": []}),
        _ => {
            warn!("Unknown method: {}", method);
            return Err(JsonRpcError::method_not_found(method));
        }
    };

    Ok(Some(JsonRpcResponse::new(request.id, result)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RwLock<ServerState> {
        RwLock::new(ServerState {
            server: RrMcpServer::new(RrConfig::default()),
            initialized: false,
        })
    }

    fn request(method: &str, params: Option<serde_json::Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(RequestId::Number(1)),
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn test_initialize_marks_state() {
        let state = state();
        let resp = tokio_test::block_on(handle_request(&state, request("initialize", None)))
            .unwrap()
            .unwrap();
        assert_eq!(resp.id, RequestId::Number(1));
        assert_eq!(resp.result["serverInfo"]["name"], "mcp-rr-server");
        assert!(tokio_test::block_on(state.read()).initialized);
    }

    #[test]
    fn test_notifications_have_no_response() {
        let state = state();
        let resp = tokio_test::block_on(handle_request(
            &state,
            request("notifications/initialized", None),
        ))
        .unwrap();
        assert!(resp.is_none());
    }

    #[test]
    fn test_unknown_method() {
        let state = state();
        let err = tokio_test::block_on(handle_request(&state, request("bogus/method", None)))
            .unwrap_err();
        assert_eq!(err.code, -32601);
    }

    #[test]
    fn test_tools_call_without_params() {
        let state = state();
        let err = tokio_test::block_on(handle_request(&state, request("tools/call", None)))
            .unwrap_err();
        assert_eq!(err.code, -32603);
    }
}
