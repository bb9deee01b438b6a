//! Built-in file tools: `file_read`, `file_write` and `file_list`.
//!
//! Paths arrive already rewritten by the kernel sandbox, so nothing here
//! checks where a path points. Failures are reported as error results, never
//! as transport errors.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;
use warden_runtime::ToolCapability;
use warden_types::{ToolCall, ToolResult, ToolSchema};

/// The file tools shipped with the `warden` binary.
#[derive(Debug, Default)]
pub struct BuiltinTools;

impl BuiltinTools {
    pub fn new() -> Self {
        Self
    }
}

fn path_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": { "path": { "type": "string", "description": description } },
        "required": ["path"],
    })
}

pub fn schemas() -> Vec<ToolSchema> {
    vec![
        ToolSchema::new("file_read", "Read a UTF-8 text file.", path_schema("File to read")),
        ToolSchema::new(
            "file_write",
            "Write a text file, creating parent directories. Replaces existing content.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File to write" },
                    "content": { "type": "string", "description": "Full file content" },
                },
                "required": ["path", "content"],
            }),
        ),
        ToolSchema::new(
            "file_list",
            "List a directory. Sub-directories end with '/'.",
            path_schema("Directory to list"),
        ),
    ]
}

async fn file_read(path: &str) -> ToolResult {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => ToolResult::ok(json!({ "path": path, "content": content })),
        Err(e) => ToolResult::error(format!("cannot read {path}: {e}")),
    }
}

async fn file_write(path: &str, content: &str) -> ToolResult {
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty())
        && let Err(e) = tokio::fs::create_dir_all(parent).await
    {
        return ToolResult::error(format!("cannot create {}: {e}", parent.display()));
    }
    match tokio::fs::write(path, content).await {
        Ok(()) => ToolResult::ok(json!({ "path": path, "bytes": content.len() })),
        Err(e) => ToolResult::error(format!("cannot write {path}: {e}")),
    }
}

async fn file_list(path: &str) -> ToolResult {
    let mut dir = match tokio::fs::read_dir(path).await {
        Ok(dir) => dir,
        Err(e) => return ToolResult::error(format!("cannot list {path}: {e}")),
    };
    let mut entries = Vec::new();
    loop {
        match dir.next_entry().await {
            Ok(Some(entry)) => {
                let mut name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    name.push('/');
                }
                entries.push(name);
            }
            Ok(None) => break,
            Err(e) => return ToolResult::error(format!("cannot list {path}: {e}")),
        }
    }
    entries.sort();
    ToolResult::ok(json!({ "path": path, "entries": entries }))
}

#[async_trait]
impl ToolCapability for BuiltinTools {
    fn list_tools(&self) -> Vec<ToolSchema> {
        schemas()
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult, warden_types::WardenError> {
        debug!(tool = %call.tool, "executing built-in tool");
        let Some(path) = call.str_arg("path") else {
            return Ok(ToolResult::error(format!("{}: missing 'path' argument", call.tool)));
        };
        let result = match call.tool.as_str() {
            "file_read" => file_read(path).await,
            "file_list" => file_list(path).await,
            "file_write" => {
                let content = match call.args.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                };
                file_write(path, &content).await
            }
            other => ToolResult::error(format!("unknown tool '{other}'")),
        };
        Ok(result)
    }
}
