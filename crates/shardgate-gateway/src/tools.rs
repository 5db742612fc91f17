//! Tool set advertised to the upstream in agent mode.

use serde::Serialize;
use serde_json::{json, Value};

/// How much a tool may touch the user's machine, as the upstream grades it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSafety {
    Safe = 0,
    Workspace = 1,
    Unsafe = 2,
}

impl Serialize for ToolSafety {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(*self as u8)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    /// JSON schema, sent as a string.
    pub input_schema_json: String,
    pub tool_safety: ToolSafety,
}

fn tool(name: &'static str, description: &'static str, schema: Value, safety: ToolSafety) -> ToolDefinition {
    ToolDefinition {
        name,
        description,
        input_schema_json: schema.to_string(),
        tool_safety: safety,
    }
}

fn object(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

pub fn agent_tools() -> Vec<ToolDefinition> {
    vec![
        tool(
            "web-search",
            "Search the web. Returns markdown results with URL, title and a snippet when available.",
            json!({
                "title": "WebSearchInput",
                "type": "object",
                "properties": {
                    "query": { "type": "string", "title": "Query", "description": "The search query to send." },
                    "num_results": {
                        "type": "integer",
                        "title": "Num Results",
                        "description": "Number of results to return",
                        "default": 5,
                        "minimum": 1,
                        "maximum": 10
                    }
                },
                "required": ["query"]
            }),
            ToolSafety::Safe,
        ),
        tool(
            "web-fetch",
            "Fetch a webpage and return its content as Markdown.",
            object(
                json!({ "url": { "type": "string", "description": "The URL to fetch." } }),
                &["url"],
            ),
            ToolSafety::Safe,
        ),
        tool(
            "codebase-retrieval",
            "Retrieve relevant code snippets from the current workspace given a natural language description.",
            object(
                json!({
                    "information_request": {
                        "type": "string",
                        "description": "A description of the information you need."
                    }
                }),
                &["information_request"],
            ),
            ToolSafety::Workspace,
        ),
        tool(
            "shell",
            "Execute a shell command. Prefer a more specific tool when one exists.",
            object(
                json!({ "command": { "type": "string", "description": "The shell command to execute." } }),
                &["command"],
            ),
            ToolSafety::Unsafe,
        ),
        tool(
            "str-replace-editor",
            "View, create and edit files relative to the workspace root with view, str_replace and insert commands.",
            object(
                json!({
                    "command": {
                        "type": "string",
                        "enum": ["view", "str_replace", "insert"],
                        "description": "The command to run."
                    },
                    "path": { "type": "string", "description": "Path relative to the workspace root." },
                    "view_range": {
                        "type": "array",
                        "items": { "type": "integer" },
                        "description": "Optional 1-based inclusive line range for 'view'."
                    },
                    "insert_line_entries": {
                        "type": "array",
                        "description": "Entries for 'insert'.",
                        "items": {
                            "type": "object",
                            "properties": {
                                "insert_line": { "type": "integer" },
                                "new_str": { "type": "string" }
                            },
                            "required": ["insert_line", "new_str"]
                        }
                    },
                    "str_replace_entries": {
                        "type": "array",
                        "description": "Entries for 'str_replace'.",
                        "items": {
                            "type": "object",
                            "properties": {
                                "old_str": { "type": "string" },
                                "new_str": { "type": "string" },
                                "old_str_start_line_number": { "type": "integer" },
                                "old_str_end_line_number": { "type": "integer" }
                            },
                            "required": [
                                "old_str",
                                "new_str",
                                "old_str_start_line_number",
                                "old_str_end_line_number"
                            ]
                        }
                    }
                }),
                &["command", "path"],
            ),
            ToolSafety::Workspace,
        ),
        tool(
            "save-file",
            "Save a file.",
            object(
                json!({
                    "file_path": { "type": "string", "description": "The path of the file to save." },
                    "file_content": { "type": "string", "description": "The content of the file to save." },
                    "add_last_line_newline": {
                        "type": "boolean",
                        "description": "Whether to add a newline at the end of the file (default: true)."
                    }
                }),
                &["file_path", "file_content"],
            ),
            ToolSafety::Workspace,
        ),
        tool(
            "launch-process",
            "Launch a process, optionally waiting a number of seconds for it to finish.",
            object(
                json!({
                    "command": { "type": "string", "description": "The shell command to execute" },
                    "wait": { "type": "number", "description": "Seconds to wait for completion." },
                    "cwd": { "type": "string", "description": "Working directory for the command." }
                }),
                &["command"],
            ),
            ToolSafety::Unsafe,
        ),
        tool(
            "read-process",
            "Read output from a terminal.",
            object(
                json!({ "terminal_id": { "type": "number", "description": "Terminal ID to read from." } }),
                &["terminal_id"],
            ),
            ToolSafety::Workspace,
        ),
        tool(
            "kill-process",
            "Kill a process by its terminal ID.",
            object(
                json!({ "terminal_id": { "type": "number", "description": "Terminal ID to kill." } }),
                &["terminal_id"],
            ),
            ToolSafety::Workspace,
        ),
    ]
}
