//! Tool worker - dequeues tool-call requests, enforces policy, dispatches
//!
//! A single worker thread consumes `toolRequest` and produces `toolResponse`.
//! It enforces the per-agent allow-list, applies plan-mode file protection,
//! and converts every failure (including panics inside a tool) into a
//! `success=false` result. The worker exits only on shutdown.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::channels::{ChannelFabric, ToolRequest, ToolResponse};
use crate::store::{ConversationMode, ConversationStore};
use crate::tools::ToolRegistry;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stable rejection text; the LLM learns from it across turns
pub const PLAN_MODE_EDIT_ERROR: &str = "Cannot edit existing files in plan mode. \
Only files created during this plan mode session can be edited.";

pub struct ToolWorker {
    fabric: ChannelFabric,
    registry: ToolRegistry,
    store: Option<ConversationStore>,
    /// Allow-lists keyed by agent name; requests without an agent bypass them
    agent_tools: HashMap<String, HashSet<String>>,
}

/// Spawn the tool worker thread over the given fabric
pub fn spawn(
    fabric: ChannelFabric,
    registry: ToolRegistry,
    store: Option<ConversationStore>,
    agent_tools: HashMap<String, HashSet<String>>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("tool-worker".into())
        .spawn(move || {
            let _guard = fabric.register_thread();
            ToolWorker::new(fabric.clone(), registry, store, agent_tools).run();
        })
        .expect("failed to spawn tool worker thread")
}

impl ToolWorker {
    pub fn new(
        fabric: ChannelFabric,
        registry: ToolRegistry,
        store: Option<ConversationStore>,
        agent_tools: HashMap<String, HashSet<String>>,
    ) -> Self {
        Self {
            fabric,
            registry,
            store,
            agent_tools,
        }
    }

    pub fn run(self) {
        tracing::debug!("tool worker started");
        loop {
            if self.fabric.is_shutdown() {
                // Final drain so in-flight turns get their results
                while let Some(request) = self.fabric.tool_request.try_recv() {
                    self.handle(request);
                }
                break;
            }
            if let Some(request) = self.fabric.tool_request.recv_timeout(POLL_INTERVAL) {
                self.handle(request);
            }
        }
        tracing::debug!("tool worker exiting");
    }

    /// Authorize, protect, dispatch; always produces exactly one response
    pub fn handle(&self, request: ToolRequest) {
        let started = Instant::now();
        let (success, result) = self.execute(&request);
        let response = ToolResponse {
            tool_call_id: request.tool_call_id.clone(),
            success,
            result,
            elapsed: started.elapsed(),
        };
        if let Err(e) = self.fabric.tool_response.send(response) {
            tracing::error!(
                tool_call_id = %request.tool_call_id,
                "failed to send tool response: {}",
                e
            );
        }
    }

    fn execute(&self, request: &ToolRequest) -> (bool, String) {
        if let Some(agent) = &request.agent_name {
            let allowed = self
                .agent_tools
                .get(agent)
                .map(|set| set.contains(&request.name))
                .unwrap_or(false);
            if !allowed {
                return error_result(format!(
                    "Tool '{}' is not allowed for agent '{}'",
                    request.name, agent
                ));
            }
        }

        let Some(tool) = self.registry.get(&request.name) else {
            return error_result(format!("Unknown tool: {}", request.name));
        };

        let args: Value = if request.arguments.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(&request.arguments) {
                Ok(value) => value,
                Err(e) => return error_result(format!("Malformed tool arguments: {}", e)),
            }
        };

        if tool.modifies_files {
            if let Err(message) = self.check_plan_mode(request, &args) {
                return error_result(message);
            }
        }

        let handler = tool.handler;
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(&args)));

        match outcome {
            Ok(Ok(result)) => {
                if tool.creates_files {
                    self.record_created_file(request, &args);
                }
                (true, result)
            }
            Ok(Err(e)) => error_result(e.to_string()),
            Err(_) => {
                tracing::error!(tool = %request.name, "tool panicked");
                error_result(format!("Tool '{}' panicked", request.name))
            }
        }
    }

    /// Plan-mode file protection. Fail-open: if the store cannot answer, log
    /// and allow.
    fn check_plan_mode(
        &self,
        request: &ToolRequest,
        args: &Value,
    ) -> std::result::Result<(), String> {
        let Some(conversation_id) = request.conversation_id else {
            return Ok(());
        };
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        let Some(path) = args["path"].as_str() else {
            return Ok(());
        };

        let conversation = match store.get_conversation(conversation_id) {
            Ok(Some(conversation)) => conversation,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!(conversation_id, "plan-mode check unavailable, allowing: {}", e);
                return Ok(());
            }
        };

        if conversation.mode != ConversationMode::Plan {
            return Ok(());
        }

        match store.is_created_file(conversation_id, path) {
            Ok(true) => Ok(()),
            Ok(false) => Err(PLAN_MODE_EDIT_ERROR.to_string()),
            Err(e) => {
                tracing::warn!(conversation_id, "created-files lookup failed, allowing: {}", e);
                Ok(())
            }
        }
    }

    fn record_created_file(&self, request: &ToolRequest, args: &Value) {
        let Some(conversation_id) = request.conversation_id else {
            return;
        };
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let Some(path) = args["path"].as_str() else {
            return;
        };

        let in_plan_mode = matches!(
            store.get_conversation(conversation_id),
            Ok(Some(conversation)) if conversation.mode == ConversationMode::Plan
        );
        if !in_plan_mode {
            return;
        }
        if let Err(e) = store.add_created_file(conversation_id, path) {
            tracing::warn!(conversation_id, path, "failed to record created file: {}", e);
        }
    }
}

fn error_result(message: String) -> (bool, String) {
    (false, json!({ "error": message }).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ToolDefinition;
    use crate::store::ConversationMode;
    use crate::tools::{ToolError, ToolRegistry};

    fn fabric_worker(
        store: Option<ConversationStore>,
        agent_tools: HashMap<String, HashSet<String>>,
    ) -> (ChannelFabric, ToolWorker) {
        let fabric = ChannelFabric::new();
        let worker = ToolWorker::new(
            fabric.clone(),
            ToolRegistry::builtin(),
            store,
            agent_tools,
        );
        (fabric, worker)
    }

    fn request(name: &str, arguments: &str) -> ToolRequest {
        ToolRequest {
            tool_call_id: "call_1".into(),
            name: name.into(),
            arguments: arguments.into(),
            agent_name: None,
            conversation_id: None,
        }
    }

    fn run(worker: &ToolWorker, fabric: &ChannelFabric, request: ToolRequest) -> ToolResponse {
        worker.handle(request);
        fabric
            .tool_response
            .recv_timeout(Duration::from_millis(200))
            .expect("no tool response")
    }

    #[test]
    fn test_unknown_tool_rejected() {
        let (fabric, worker) = fabric_worker(None, HashMap::new());
        let response = run(&worker, &fabric, request("teleport", "{}"));
        assert!(!response.success);
        assert!(response.result.contains("Unknown tool"));
    }

    #[test]
    fn test_agent_allow_list_enforced() {
        let mut agent_tools = HashMap::new();
        agent_tools.insert(
            "researcher".to_string(),
            ["read", "list"].iter().map(|s| s.to_string()).collect(),
        );
        let (fabric, worker) = fabric_worker(None, agent_tools);

        let mut req = request("bash", r#"{"command":"true"}"#);
        req.agent_name = Some("researcher".into());
        let response = run(&worker, &fabric, req);
        assert!(!response.success);
        assert!(response.result.contains("not allowed for agent"));

        // Unknown agents get nothing
        let mut req = request("read", r#"{"path":"/etc/hostname"}"#);
        req.agent_name = Some("ghost".into());
        let response = run(&worker, &fabric, req);
        assert!(!response.success);
    }

    #[test]
    fn test_plan_mode_blocks_editing_existing_files() {
        let store = ConversationStore::open_in_memory().unwrap();
        let conv = store
            .create_conversation("plan", ConversationMode::Plan, "gpt4o")
            .unwrap();
        let (fabric, worker) = fabric_worker(Some(store), HashMap::new());

        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("README.md");
        std::fs::write(&existing, "# hi").unwrap();

        let mut req = request(
            "edit",
            &json!({
                "path": existing.to_string_lossy(),
                "operation": "replace",
                "old": "hi",
                "new": "bye"
            })
            .to_string(),
        );
        req.conversation_id = Some(conv.id);

        let response = run(&worker, &fabric, req);
        assert!(!response.success);
        let parsed: Value = serde_json::from_str(&response.result).unwrap();
        assert!(parsed["error"]
            .as_str()
            .unwrap()
            .starts_with("Cannot edit existing files in plan mode"));
        // File untouched
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "# hi");
    }

    #[test]
    fn test_plan_mode_create_then_edit_allowed() {
        let store = ConversationStore::open_in_memory().unwrap();
        let conv = store
            .create_conversation("plan", ConversationMode::Plan, "gpt4o")
            .unwrap();
        let (fabric, worker) = fabric_worker(Some(store.clone()), HashMap::new());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("draft.md");
        let path_str = path.to_string_lossy().to_string();

        let mut req = request(
            "create",
            &json!({"path": path_str, "content": "v1"}).to_string(),
        );
        req.conversation_id = Some(conv.id);
        let response = run(&worker, &fabric, req);
        assert!(response.success);
        // Successful create lands in the created-files set
        assert!(store.is_created_file(conv.id, &path_str).unwrap());

        let mut req = request(
            "edit",
            &json!({"path": path_str, "operation": "rewrite", "content": "v2"}).to_string(),
        );
        req.conversation_id = Some(conv.id);
        let response = run(&worker, &fabric, req);
        assert!(response.success);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "v2");
    }

    #[test]
    fn test_code_mode_edits_unrestricted() {
        let store = ConversationStore::open_in_memory().unwrap();
        let conv = store
            .create_conversation("code", ConversationMode::Code, "gpt4o")
            .unwrap();
        let (fabric, worker) = fabric_worker(Some(store), HashMap::new());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.rs");
        std::fs::write(&path, "fn main() {}").unwrap();

        let mut req = request(
            "edit",
            &json!({
                "path": path.to_string_lossy(),
                "operation": "append",
                "content": "\n// end"
            })
            .to_string(),
        );
        req.conversation_id = Some(conv.id);
        let response = run(&worker, &fabric, req);
        assert!(response.success);
    }

    #[test]
    fn test_malformed_arguments_are_an_error_result() {
        let (fabric, worker) = fabric_worker(None, HashMap::new());
        let response = run(&worker, &fabric, request("read", "{not json"));
        assert!(!response.success);
        assert!(response.result.contains("Malformed tool arguments"));
    }

    #[test]
    fn test_panicking_tool_contained() {
        fn panicker(_args: &Value) -> std::result::Result<String, ToolError> {
            panic!("boom");
        }

        let mut registry = ToolRegistry::empty();
        registry.register(
            ToolDefinition {
                name: "panic".into(),
                description: "always panics".into(),
                input_schema: json!({"type": "object"}),
            },
            panicker,
            false,
            false,
        );
        let fabric = ChannelFabric::new();
        let worker = ToolWorker::new(fabric.clone(), registry, None, HashMap::new());

        let response = run(&worker, &fabric, request("panic", "{}"));
        assert!(!response.success);
        assert!(response.result.contains("panicked"));
    }

    #[test]
    fn test_response_carries_timing() {
        let (fabric, worker) = fabric_worker(None, HashMap::new());
        let response = run(&worker, &fabric, request("todolist", r#"{"action":"list"}"#));
        assert!(response.success);
        assert!(response.elapsed < Duration::from_secs(5));
    }
}
