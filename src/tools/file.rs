use async_trait::async_trait;
use tracing::debug;

use super::{Tool, ToolContext, ToolOutput};
use crate::error::Result;

fn path_param(params: &serde_json::Value) -> Option<&str> {
    params.get("path").and_then(|v| v.as_str())
}

// -- ReadFile ------------------------------------------------------------

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the scratch directory. Symbolic links are never followed."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the scratch root (absolute paths must lie inside it)"
                }
            }
        })
    }

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let path = path_param(&params).unwrap_or_default();
        debug!(path, "reading file");

        match ctx.sandbox.read_to_string(path) {
            Ok(contents) => Ok(ToolOutput::ok(contents)),
            Err(e) => Ok(ToolOutput::error(e.to_string())),
        }
    }
}

// -- WriteFile -----------------------------------------------------------

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text to a file in the scratch directory, creating parent directories as needed."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["path", "content"],
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the scratch root"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                }
            }
        })
    }

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let path = path_param(&params).unwrap_or_default();
        let Some(content) = params.get("content").and_then(|v| v.as_str()) else {
            return Ok(ToolOutput::error("content is required"));
        };
        debug!(path, bytes = content.len(), "writing file");

        match ctx.sandbox.write(path, content.as_bytes()) {
            Ok(outcome) => Ok(ToolOutput::ok_with_meta(
                format!("Wrote {} bytes to {}", outcome.bytes_written, outcome.path),
                serde_json::json!(outcome),
            )),
            Err(e) => Ok(ToolOutput::error(e.to_string())),
        }
    }
}

// -- DeleteFile ----------------------------------------------------------

pub struct DeleteFileTool;

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete an existing file in the scratch directory."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the scratch root"
                }
            }
        })
    }

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let path = path_param(&params).unwrap_or_default();
        debug!(path, "deleting file");

        match ctx.sandbox.delete(path) {
            Ok(display) => Ok(ToolOutput::ok(format!("Deleted {display}"))),
            Err(e) => Ok(ToolOutput::error(e.to_string())),
        }
    }
}

// -- ListFiles -----------------------------------------------------------

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List a directory in the scratch area. Entries are tagged [file] or [dir]."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory relative to the scratch root (default: the root)"
                }
            }
        })
    }

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let path = path_param(&params).filter(|p| !p.is_empty());
        debug!(?path, "listing directory");

        match ctx.sandbox.list(path) {
            Ok(entries) if entries.is_empty() => {
                Ok(ToolOutput::ok_with_meta("(empty)", serde_json::json!([])))
            }
            Ok(entries) => {
                let text = entries
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(ToolOutput::ok_with_meta(text, serde_json::json!(entries)))
            }
            Err(e) => Ok(ToolOutput::error(e.to_string())),
        }
    }
}
