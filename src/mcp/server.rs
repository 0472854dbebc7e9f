//! MCP Server Handler Implementation

use crate::mcp::protocol::*;
use crate::mcp::tools::get_all_tools;
use crate::replay::{
    CompletionPredicate, ControllerError, RecordKind, ResponseRecord, RrConfig, SessionManager,
};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Longest text rendering returned for one command
const MAX_OUTPUT_BYTES: usize = 6 * 1024;

type Arguments = Option<serde_json::Map<String, serde_json::Value>>;

/// rr MCP Server
pub struct RrMcpServer {
    manager: Arc<SessionManager>,
}

impl RrMcpServer {
    pub fn new(config: RrConfig) -> Self {
        Self::with_manager(Arc::new(SessionManager::new(config)))
    }

    pub fn with_manager(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Get server info
    pub fn get_info(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: "2024-11-05".to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
                ..Default::default()
            },
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(
                "rr MCP Server for debugging recorded executions with rr's deterministic replay.\n\n\
                 Start with 'rr_replay' on a trace directory, then drive the debugger with 'rr_run_cmd' \
                 (breakpoints, continue, step, reverse-continue, reverse-step, backtrace, print, ...). \
                 Use 'rr_status' to inspect the session and 'rr_exit' to end it."
                    .to_string(),
            ),
        }
    }

    /// Handle initialize request
    pub async fn handle_initialize(&self, _params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let info = self.get_info();
        Ok(serde_json::to_value(info)?)
    }

    /// Handle tools/list request
    pub async fn handle_tools_list(&self) -> Result<serde_json::Value> {
        let tools: Vec<Tool> = get_all_tools()
            .into_iter()
            .map(|t| Tool {
                name: t.name,
                description: Some(t.description),
                input_schema: t.input_schema,
            })
            .collect();

        let result = ListToolsResult {
            tools,
            next_cursor: None,
        };

        Ok(serde_json::to_value(result)?)
    }

    /// Handle tools/call request
    pub async fn handle_tools_call(&self, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let params = params.ok_or_else(|| anyhow::anyhow!("Missing params"))?;
        let request: CallToolRequest = serde_json::from_value(params)?;

        debug!("Calling tool: {}", request.name);

        let result = match request.name.as_str() {
            "rr_replay" => self.handle_replay(request.arguments).await,
            "rr_run_cmd" => self.handle_run_cmd(request.arguments).await,
            "rr_exit" => self.handle_exit().await,
            "rr_status" => self.handle_status().await,
            _ => Ok(CallToolResult::error_text(format!("Unknown tool: {}", request.name))),
        };

        Ok(serde_json::to_value(result?)?)
    }

    // ========================================================================
    // Tool Handlers
    // ========================================================================

    async fn handle_replay(&self, args: Arguments) -> Result<CallToolResult> {
        let trace_dir = args
            .as_ref()
            .and_then(|a| a.get("trace_dir"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let manager = Arc::clone(&self.manager);
        let outcome =
            tokio::task::spawn_blocking(move || manager.replace(trace_dir.as_deref())).await?;

        match outcome {
            Ok(status) => {
                info!("Replaying {}", status.trace_dir.display());
                Ok(CallToolResult::text(format!(
                    "Replaying {} (session {}).",
                    status.trace_dir.display(),
                    status.id
                )))
            }
            Err(e) => Ok(CallToolResult::error_text(e.to_string())),
        }
    }

    async fn handle_run_cmd(&self, args: Arguments) -> Result<CallToolResult> {
        let Some(command) = args
            .as_ref()
            .and_then(|a| a.get("command"))
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
        else {
            return Ok(CallToolResult::error_text("command is required"));
        };

        let (default_predicate, default_timeout) = self.manager.completion_for(&command);

        let predicate = match args.as_ref().and_then(|a| a.get("wait_for")).and_then(|v| v.as_str()) {
            None => default_predicate,
            Some("stop") => CompletionPredicate::stopped(),
            Some("result") => CompletionPredicate::result(),
            Some(other) => {
                return Ok(CallToolResult::error_text(format!(
                    "wait_for must be 'stop' or 'result', got '{}'",
                    other
                )))
            }
        };

        let timeout = args
            .as_ref()
            .and_then(|a| a.get("timeout_ms"))
            .and_then(|v| v.as_u64())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);

        let manager = Arc::clone(&self.manager);
        let outcome =
            tokio::task::spawn_blocking(move || manager.run(&command, &predicate, timeout)).await?;

        match outcome {
            Ok(records) => Ok(CallToolResult::success(vec![
                Content::text(render_records(&records)),
                Content::text(serde_json::to_string_pretty(&records)?),
            ])),
            Err(e) => Ok(error_result(&e)?),
        }
    }

    async fn handle_exit(&self) -> Result<CallToolResult> {
        let manager = Arc::clone(&self.manager);
        tokio::task::spawn_blocking(move || manager.exit()).await?;
        Ok(CallToolResult::text("Replay session exited."))
    }

    async fn handle_status(&self) -> Result<CallToolResult> {
        // Waits behind a replace that is still in its handshake
        let manager = Arc::clone(&self.manager);
        match tokio::task::spawn_blocking(move || manager.status()).await? {
            Some(status) => Ok(CallToolResult::text(serde_json::to_string_pretty(&status)?)),
            None => Ok(CallToolResult::text("No replay session.")),
        }
    }
}

/// Error text plus whatever the command printed before giving up
fn error_result(error: &ControllerError) -> Result<CallToolResult> {
    let records = error.records();
    if records.is_empty() {
        return Ok(CallToolResult::error_text(error.to_string()));
    }
    Ok(CallToolResult::error(vec![
        Content::text(format!("{}\n{}", error, render_records(records))),
        Content::text(serde_json::to_string_pretty(records)?),
    ]))
}

/// Human-readable rendering of a command's records: where it stopped,
/// then everything the debugger printed.
pub fn render_records(records: &[ResponseRecord]) -> String {
    let mut out = String::new();

    if let Some(stop) = records.iter().rev().find(|r| r.is_stopped()) {
        if let Some(reason) = stop.stop_reason() {
            out.push_str(&format!("Stopped: {}", reason));
            if let Some(frame) = stop.frame() {
                out.push_str(&format!(" at {}", frame));
            }
            out.push('\n');
        }
    }

    for record in records {
        match record.kind() {
            RecordKind::Console | RecordKind::Target | RecordKind::Log => {
                out.push_str(record.text().unwrap_or_default());
            }
            RecordKind::Result => {
                if let Some(msg) = record.payload().and_then(|p| p.get_str("msg")) {
                    out.push_str(msg);
                    out.push('\n');
                }
            }
            _ => {}
        }
    }

    truncate_output(out, MAX_OUTPUT_BYTES)
}

fn truncate_output(mut text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("...");
    text
}
