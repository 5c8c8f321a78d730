use async_trait::async_trait;
use tracing::debug;

use super::{Tool, ToolContext, ToolOutput};
use crate::error::Result;

// -- RunScript -----------------------------------------------------------

pub struct RunScriptTool;

#[async_trait]
impl Tool for RunScriptTool {
    fn name(&self) -> &str {
        "run_script"
    }

    fn description(&self) -> &str {
        "Run a vetted Python script from the scripts directory, passing optional JSON on stdin. Output is size-capped and the run is time-limited."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["script"],
            "properties": {
                "script": {
                    "type": "string",
                    "description": "Script file name, e.g. \"report.py\" (letters, digits, _ and - only)"
                },
                "input": {
                    "type": "string",
                    "description": "JSON document written to the script's stdin (empty for none)"
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Wall-clock limit in milliseconds (capped by configuration)"
                }
            }
        })
    }

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let script = params
            .get("script")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        // A JSON value in place of a string is accepted as the document itself.
        let input = match params.get("input") {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        let timeout_ms = params.get("timeout_ms").and_then(|v| v.as_u64());

        debug!(script, input_bytes = input.len(), ?timeout_ms, "run_script");

        let result = match ctx.scripts.run(script, &input, timeout_ms).await {
            Ok(result) => result,
            Err(e) => return Ok(ToolOutput::error(e.to_string())),
        };

        let mut text = String::new();
        if let Some(err) = &result.error {
            text.push_str(err);
            text.push('\n');
        } else if !result.success {
            text.push_str(&format!(
                "exit code {}\n",
                result.exit_code.map_or_else(|| "none".to_string(), |c| c.to_string())
            ));
        }
        text.push_str(&result.stdout);
        if !result.stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("[stderr] ");
            text.push_str(&result.stderr);
        }

        Ok(ToolOutput {
            success: result.success,
            output: text,
            metadata: serde_json::to_value(&result).ok(),
        })
    }
}
