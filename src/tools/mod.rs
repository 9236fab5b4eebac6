//! Tool registry and built-in tools
//!
//! Tools are pure functions of `(JSON args) -> result string`; structured
//! tools return JSON. The registry also exports each tool's JSON schema for
//! the LLM tools array and flags which tools touch the filesystem, which the
//! worker uses for plan-mode enforcement.

pub mod worker;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use serde_json::{json, Value};

use crate::llm::types::ToolDefinition;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

pub type ToolOutput = std::result::Result<String, ToolError>;

/// Tool implementations take parsed JSON args and return a result string
pub type ToolHandler = fn(&Value) -> ToolOutput;

/// A tool as known to the worker
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    pub handler: ToolHandler,
    /// Edits an existing file; subject to plan-mode protection
    pub modifies_files: bool,
    /// Creates a file; successful calls feed the plan-mode created set
    pub creates_files: bool,
}

/// In-memory tool registry populated at startup
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// The built-in tool suite
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(
            tool_def("read", "Read a file's contents", json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path to read"}
                },
                "required": ["path"]
            })),
            tool_read,
            false,
            false,
        );
        registry.register(
            tool_def("list", "List a directory's entries", json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory path"}
                },
                "required": ["path"]
            })),
            tool_list,
            false,
            false,
        );
        registry.register(
            tool_def("create", "Create a new file with the given content", json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            })),
            tool_create,
            false,
            true,
        );
        registry.register(
            tool_def("edit", "Edit an existing file", json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "operation": {"type": "string", "enum": ["replace", "append", "rewrite"]},
                    "old": {"type": "string", "description": "Text to replace (operation=replace)"},
                    "new": {"type": "string", "description": "Replacement text (operation=replace)"},
                    "content": {"type": "string", "description": "Content for append/rewrite"}
                },
                "required": ["path", "operation"]
            })),
            tool_edit,
            true,
            false,
        );
        registry.register(
            tool_def("bash", "Run a shell command and capture its output", json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"}
                },
                "required": ["command"]
            })),
            tool_bash,
            false,
            false,
        );
        registry.register(
            tool_def("fetch", "Fetch a URL and return the response body", json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string"}
                },
                "required": ["url"]
            })),
            tool_fetch,
            false,
            false,
        );
        registry.register(
            tool_def("todolist", "Manage the session todo list", json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["add", "done", "list"]},
                    "item": {"type": "string"}
                },
                "required": ["action"]
            })),
            tool_todolist,
            false,
            false,
        );
        registry
    }

    pub fn register(
        &mut self,
        definition: ToolDefinition,
        handler: ToolHandler,
        modifies_files: bool,
        creates_files: bool,
    ) {
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool {
                definition,
                handler,
                modifies_files,
                creates_files,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.definition.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Schemas filtered to an agent's allowed-tools set
    pub fn definitions_for(&self, allowed: &[String]) -> Vec<ToolDefinition> {
        self.definitions()
            .into_iter()
            .filter(|d| allowed.iter().any(|name| name == &d.name))
            .collect()
    }
}

fn tool_def(name: &str, description: &str, input_schema: Value) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> std::result::Result<&'a str, ToolError> {
    args[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidArgs(format!("missing '{}'", key)))
}

// ── Built-in tool implementations ──────────────────────────────────────────

fn tool_read(args: &Value) -> ToolOutput {
    let path = required_str(args, "path")?;
    let content = std::fs::read_to_string(path)
        .map_err(|e| ToolError::ExecutionFailed(format!("{}: {}", path, e)))?;
    Ok(json!({"path": path, "content": content}).to_string())
}

fn tool_list(args: &Value) -> ToolOutput {
    let path = required_str(args, "path")?;
    let mut entries = Vec::new();
    let dir = std::fs::read_dir(path)
        .map_err(|e| ToolError::ExecutionFailed(format!("{}: {}", path, e)))?;
    for entry in dir {
        let entry = entry.map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        let kind = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            "directory"
        } else {
            "file"
        };
        entries.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "type": kind,
        }));
    }
    entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    Ok(json!({"entries": entries}).to_string())
}

fn tool_create(args: &Value) -> ToolOutput {
    let path = required_str(args, "path")?;
    let content = args["content"].as_str().unwrap_or_default();
    if Path::new(path).exists() {
        return Err(ToolError::ExecutionFailed(format!(
            "{} already exists; use edit instead",
            path
        )));
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        }
    }
    std::fs::write(path, content).map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
    Ok(json!({"created": path, "bytes": content.len()}).to_string())
}

fn tool_edit(args: &Value) -> ToolOutput {
    let path = required_str(args, "path")?;
    let operation = required_str(args, "operation")?;
    let existing = std::fs::read_to_string(path)
        .map_err(|e| ToolError::ExecutionFailed(format!("{}: {}", path, e)))?;

    let updated = match operation {
        "replace" => {
            let old = required_str(args, "old")?;
            let new = args["new"].as_str().unwrap_or_default();
            if !existing.contains(old) {
                return Err(ToolError::NotFound(format!(
                    "text to replace not found in {}",
                    path
                )));
            }
            existing.replacen(old, new, 1)
        }
        "append" => {
            let content = args["content"].as_str().unwrap_or_default();
            let mut updated = existing;
            updated.push_str(content);
            updated
        }
        "rewrite" => args["content"].as_str().unwrap_or_default().to_string(),
        other => {
            return Err(ToolError::InvalidArgs(format!(
                "unknown operation '{}'",
                other
            )))
        }
    };

    std::fs::write(path, &updated).map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
    Ok(json!({"edited": path, "bytes": updated.len()}).to_string())
}

fn tool_bash(args: &Value) -> ToolOutput {
    let command = required_str(args, "command")?;
    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
    Ok(json!({
        "exit_code": output.status.code(),
        "stdout": String::from_utf8_lossy(&output.stdout),
        "stderr": String::from_utf8_lossy(&output.stderr),
    })
    .to_string())
}

fn tool_fetch(args: &Value) -> ToolOutput {
    let url = required_str(args, "url")?;
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
    let body = rt
        .block_on(async {
            let response = reqwest::get(url).await?;
            let status = response.status().as_u16();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        })
        .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
    Ok(json!({"status": body.0, "body": body.1}).to_string())
}

fn todo_state() -> &'static Mutex<Vec<(String, bool)>> {
    static TODOS: OnceLock<Mutex<Vec<(String, bool)>>> = OnceLock::new();
    TODOS.get_or_init(|| Mutex::new(Vec::new()))
}

fn tool_todolist(args: &Value) -> ToolOutput {
    let action = required_str(args, "action")?;
    let mut todos = todo_state().lock().expect("todo mutex poisoned");
    match action {
        "add" => {
            let item = required_str(args, "item")?;
            todos.push((item.to_string(), false));
            Ok(json!({"added": item, "count": todos.len()}).to_string())
        }
        "done" => {
            let item = required_str(args, "item")?;
            match todos.iter_mut().find(|(text, _)| text == item) {
                Some(entry) => {
                    entry.1 = true;
                    Ok(json!({"done": item}).to_string())
                }
                None => Err(ToolError::NotFound(format!("no todo item '{}'", item))),
            }
        }
        "list" => {
            let items: Vec<Value> = todos
                .iter()
                .map(|(text, done)| json!({"item": text, "done": done}))
                .collect();
            Ok(json!({"items": items}).to_string())
        }
        other => Err(ToolError::InvalidArgs(format!("unknown action '{}'", other))),
    }
}
