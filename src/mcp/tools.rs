//! MCP Tool Definitions for rr Replay Debugging

use serde::{Deserialize, Serialize};

/// MCP Tool definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Tool: Start or replace the replay session
pub fn tool_replay() -> ToolDefinition {
    ToolDefinition {
        name: "rr_replay".to_string(),
        description: "Replay an rr trace under GDB/MI. Replaces any running replay session.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "trace_dir": {
                    "type": "string",
                    "description": "Directory containing the rr trace (default: ~/.local/share/rr/latest-trace)"
                }
            },
            "required": []
        }),
    }
}

/// Tool: Run a debugger command and wait for it to settle
pub fn tool_run_cmd() -> ToolDefinition {
    ToolDefinition {
        name: "rr_run_cmd".to_string(),
        description: "Run a gdb/rr command (CLI or MI) in the replay session and return its output. \
                      Execution commands such as continue, step or reverse-next wait until the program stops; \
                      other commands wait for their result."
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Command to run, e.g. 'break main', 'reverse-continue' or '-stack-list-frames'"
                },
                "wait_for": {
                    "type": "string",
                    "enum": ["stop", "result"],
                    "description": "Override completion: 'stop' waits for *stopped, 'result' for the result record"
                },
                "timeout_ms": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "How long to wait for completion in milliseconds"
                }
            },
            "required": ["command"]
        }),
    }
}

/// Tool: Exit the replay session
pub fn tool_exit() -> ToolDefinition {
    ToolDefinition {
        name: "rr_exit".to_string(),
        description: "Exit the current replay session and clean up the rr process.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        }),
    }
}

/// Tool: Session status
pub fn tool_status() -> ToolDefinition {
    ToolDefinition {
        name: "rr_status".to_string(),
        description: "Show the current replay session: trace directory, state and commands sent.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        }),
    }
}

/// Get all available tools
pub fn get_all_tools() -> Vec<ToolDefinition> {
    vec![tool_replay(), tool_run_cmd(), tool_exit(), tool_status()]
}
