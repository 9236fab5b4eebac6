//! UI input loop - interactive prompt, history, streamed output
//!
//! Two shapes share this module: the master REPL routing `@agent` input over
//! the bus, and the single-process local REPL driving its own API and tool
//! workers. The output handler thread filters responses by the active
//! request id so late chunks from a cancelled turn never reach the terminal;
//! input and output threads share only the `is_processing` flag and the
//! active-request cell.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::agent::classify::parse_turn;
use crate::agent::classify::TurnKind;
use crate::bus::generate_request_id;
use crate::channels::{ApiRequest, ApiResponse, ChannelFabric, ChatRequest};
use crate::commands::{derive_title, CommandCategory, CommandContext, CommandRegistry};
use crate::config::Config;
use crate::error::{NifflerError, Result};
use crate::llm::types::{ChatMessage, MessageRole, StreamErrorKind};
use crate::llm::worker::{self as api_worker, ApiWorkerOptions};
use crate::master::{normalize_newlines, Master, RouteOutcome};
use crate::session::Session;
use crate::store::{ConversationMode, ConversationStore};
use crate::tools::{worker as tool_worker, ToolRegistry};

const OUTPUT_POLL: Duration = Duration::from_millis(100);
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

fn history_path() -> PathBuf {
    Config::data_dir().join("history.txt")
}

fn prompt(session: &Session, processing: bool) -> String {
    let user = Session::username();
    let conversation = session
        .conversation_id
        .map(|id| format!(" #{}", id))
        .unwrap_or_default();
    let marker = if processing { "…" } else { ">" };
    format!("{}@niffler{}{} ", user, conversation, marker)
}

// ── Master REPL ────────────────────────────────────────────────────────────

/// Interactive master loop; returns when the user quits
pub fn run_master_ui(master: &mut Master) -> Result<()> {
    let mut editor = DefaultEditor::new()
        .map_err(|e| NifflerError::Config(format!("readline init failed: {}", e)))?;
    let _ = editor.load_history(&history_path());
    let registry = CommandRegistry::builtin();
    let user = Session::username();

    println!("niffler master - route input with @agent, /agents lists them, /quit exits");

    loop {
        let focused = master
            .current_agent()
            .map(|agent| format!(" [{}]", agent))
            .unwrap_or_default();
        let line = match editor.readline(&format!("{}@niffler{}> ", user, focused)) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                tracing::error!("readline failed: {}", e);
                break;
            }
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(input);

        if let Some(CommandCategory::Global) = registry.category_of(input) {
            match input.split_whitespace().next().unwrap_or("") {
                "/quit" | "/exit" => break,
                "/agents" => {
                    let agents = master.present_agents();
                    if agents.is_empty() {
                        println!("No agents present.");
                    } else {
                        println!("Present agents: {}", agents.join(", "));
                    }
                }
                other => println!("{} is master-only but not implemented here", other),
            }
            continue;
        }

        // Everything else (agent commands included) routes to the focused agent
        match master.handle_agent_request(input) {
            RouteOutcome::Sent { agent, request_id } => {
                tracing::debug!(%agent, %request_id, "routed");
            }
            RouteOutcome::Focused { agent } => println!("Focused @{}", agent),
            RouteOutcome::Unhandled => {
                println!("No agent selected. Address one with @<agent> <input>.");
            }
            RouteOutcome::Error(message) => println!("{}", message),
        }
    }

    let _ = std::fs::create_dir_all(Config::data_dir());
    let _ = editor.save_history(&history_path());
    Ok(())
}

// ── Local (single-process) REPL ────────────────────────────────────────────

/// Single-process shape: UI, API worker, and tool worker in one process,
/// no bus and no master/agent split.
pub fn run_local(config: Config, store: ConversationStore, options: ApiWorkerOptions) -> Result<()> {
    let fabric = ChannelFabric::new();
    let registry = ToolRegistry::builtin();
    let tool_names = registry.names();
    let tool_definitions = registry.definitions();

    let api_handle = api_worker::spawn(
        fabric.clone(),
        Some(store.clone()),
        config.clone(),
        options,
    );
    let tool_handle = tool_worker::spawn(
        fabric.clone(),
        registry,
        Some(store.clone()),
        Default::default(),
    );

    let is_processing = Arc::new(AtomicBool::new(false));
    let active_request = Arc::new(Mutex::new(String::new()));
    let output_handle =
        spawn_output_handler(fabric.clone(), active_request.clone(), is_processing.clone());

    let mut session = Session::new(&config);
    let commands = CommandRegistry::builtin();

    let mut editor = DefaultEditor::new()
        .map_err(|e| NifflerError::Config(format!("readline init failed: {}", e)))?;
    let _ = editor.load_history(&history_path());
    if let Ok(recent) = store.get_recent_prompts(50) {
        for entry in recent.iter().rev() {
            let _ = editor.add_history_entry(entry);
        }
    }

    println!("niffler - local session, /help for commands, ctrl-c cancels a running turn");

    loop {
        let processing = is_processing.load(Ordering::SeqCst);
        let line = match editor.readline(&prompt(&session, processing)) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                if is_processing.load(Ordering::SeqCst) {
                    let request_id = active_request.lock().expect("request cell poisoned").clone();
                    let _ = fabric.api_request.send(ApiRequest::StreamCancel { request_id });
                    continue;
                }
                break;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                tracing::error!("readline failed: {}", e);
                break;
            }
        };
        let input = line.trim().to_string();
        if input.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(&input);

        if input == "/quit" || input == "/exit" {
            break;
        }

        let mut ctx = CommandContext {
            store: &store,
            session: &mut session,
            config: &config,
            tool_names: &tool_names,
            agent_name: None,
        };
        if let Some(result) = commands.execute(&mut ctx, &input) {
            match result {
                Ok(output) => println!("{}", output.trim_end()),
                Err(message) => println!("❌ {}", message),
            }
            continue;
        }

        if is_processing.load(Ordering::SeqCst) {
            println!("A turn is already running; ctrl-c to cancel it first.");
            continue;
        }

        if let Err(message) = start_local_turn(
            &fabric,
            &store,
            &config,
            &mut session,
            &tool_definitions,
            &input,
            &active_request,
            &is_processing,
        ) {
            println!("❌ {}", message);
        }
    }

    fabric.signal_shutdown();
    let _ = api_handle.join();
    let _ = tool_handle.join();
    let _ = output_handle.join();
    if !fabric.wait_for_exit(Duration::from_secs(2)) {
        tracing::warn!("workers still registered at exit");
    }

    let _ = std::fs::create_dir_all(Config::data_dir());
    let _ = editor.save_history(&history_path());
    Ok(())
}

/// Build and enqueue one local chat turn. The active-request cell is set
/// before the enqueue so the output handler never drops the first chunks.
#[allow(clippy::too_many_arguments)]
fn start_local_turn(
    fabric: &ChannelFabric,
    store: &ConversationStore,
    config: &Config,
    session: &mut Session,
    tools: &[crate::llm::types::ToolDefinition],
    input: &str,
    active_request: &Arc<Mutex<String>>,
    is_processing: &Arc<AtomicBool>,
) -> std::result::Result<(), String> {
    let model = config
        .model(&session.model_nickname)
        .map_err(|e| e.to_string())?;
    let api_key = model
        .api_key()
        .ok_or_else(|| format!("no API key in ${}", model.api_key_env))?;

    let (messages, conversation_id) = match parse_turn(input) {
        TurnKind::Task(prompt) => {
            if prompt.is_empty() {
                return Err("usage: /task <prompt>".to_string());
            }
            (vec![ChatMessage::user(prompt)], None)
        }
        TurnKind::Ask(prompt) => {
            let conversation_id = ensure_conversation(store, session, &prompt)?;
            store
                .append_message(conversation_id, &ChatMessage::user(prompt))
                .map_err(|e| e.to_string())?;
            let stored = store
                .get_messages(conversation_id)
                .map_err(|e| e.to_string())?;
            let messages: Vec<ChatMessage> = stored
                .iter()
                .filter(|m| m.role != MessageRole::System)
                .map(|m| m.to_chat_message())
                .collect();
            (messages, Some(conversation_id))
        }
    };

    let request_id = generate_request_id();
    let chat = ChatRequest {
        request_id: request_id.clone(),
        messages,
        model: model.model.clone(),
        model_nickname: session.model_nickname.clone(),
        max_tokens: model.max_tokens,
        temperature: model.temperature,
        base_url: model.base_url.clone(),
        api_key,
        enable_tools: !tools.is_empty(),
        tools: tools.to_vec(),
        agent_name: None,
        conversation_id,
        tool_timeout: Duration::from_secs(config.defaults.tool_timeout_secs),
    };
    *active_request.lock().expect("request cell poisoned") = request_id;
    is_processing.store(true, Ordering::SeqCst);
    if let Err(e) = fabric.api_request.send(ApiRequest::Chat(Box::new(chat))) {
        is_processing.store(false, Ordering::SeqCst);
        return Err(e.to_string());
    }
    Ok(())
}

fn ensure_conversation(
    store: &ConversationStore,
    session: &mut Session,
    first_prompt: &str,
) -> std::result::Result<i64, String> {
    if let Some(id) = session.conversation_id {
        if matches!(store.get_conversation(id), Ok(Some(_))) {
            return Ok(id);
        }
    }
    let conversation = store
        .create_conversation(
            &derive_title(first_prompt),
            ConversationMode::Code,
            &session.model_nickname,
        )
        .map_err(|e| e.to_string())?;
    session.conversation_id = Some(conversation.id);
    Ok(conversation.id)
}

/// Output handler thread: prints api responses for the active request only
pub fn spawn_output_handler(
    fabric: ChannelFabric,
    active_request: Arc<Mutex<String>>,
    is_processing: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("output-handler".into())
        .spawn(move || {
            let _guard = fabric.register_thread();
            loop {
                if fabric.is_shutdown() {
                    while fabric.api_response.try_recv().is_some() {}
                    break;
                }
                let Some(response) = fabric.api_response.recv_timeout(OUTPUT_POLL) else {
                    continue;
                };
                let current = active_request.lock().expect("request cell poisoned").clone();
                if response.request_id() != current {
                    tracing::debug!(
                        request_id = %response.request_id(),
                        "dropping output for inactive request"
                    );
                    continue;
                }
                print_response(&response, &is_processing);
            }
        })
        .expect("failed to spawn output handler thread")
}

fn print_response(response: &ApiResponse, is_processing: &AtomicBool) {
    match response {
        ApiResponse::Ready { .. } => {}
        ApiResponse::StreamChunk {
            content,
            thinking,
            is_encrypted,
            ..
        } => {
            if let Some(text) = content {
                print!("{}", normalize_newlines(text));
            }
            if let Some(text) = thinking {
                if !is_encrypted {
                    print!("{}{}{}", DIM, normalize_newlines(text), RESET);
                }
            }
        }
        ApiResponse::ToolCallRequest { tool_call, .. } => {
            print!(
                "\r\n{}[tool] {}({}){}\r\n",
                DIM, tool_call.name, tool_call.arguments, RESET
            );
        }
        ApiResponse::ToolCallResult {
            tool_name,
            success,
            elapsed,
            ..
        } => {
            print!(
                "{}[tool] {} {} in {:?}{}\r\n",
                DIM,
                tool_name,
                if *success { "ok" } else { "failed" },
                elapsed,
                RESET
            );
        }
        ApiResponse::StreamComplete { usage, .. } => {
            print!(
                "\r\n{}({} in / {} out tokens{}){}\r\n",
                DIM,
                usage.input_tokens,
                usage.output_tokens,
                if usage.estimated { ", estimated" } else { "" },
                RESET
            );
            is_processing.store(false, Ordering::SeqCst);
        }
        ApiResponse::StreamError { kind, message, .. } => {
            match kind {
                StreamErrorKind::Cancelled => print!("\r\n{}(cancelled){}\r\n", DIM, RESET),
                _ => print!("\r\n❌ {}\r\n", message),
            }
            is_processing.store(false, Ordering::SeqCst);
        }
    }
    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_shape() {
        let config = Config::default();
        let mut session = Session::new(&config);
        let idle = prompt(&session, false);
        assert!(idle.contains("@niffler>"));

        session.conversation_id = Some(7);
        let busy = prompt(&session, true);
        assert!(busy.contains("#7"));
        assert!(busy.contains('…'));
    }

    #[test]
    fn test_output_handler_filters_by_request_id() {
        let fabric = ChannelFabric::new();
        let active = Arc::new(Mutex::new("live".to_string()));
        let processing = Arc::new(AtomicBool::new(true));
        let handle = spawn_output_handler(fabric.clone(), active, processing.clone());

        // A completion for a stale request must not clear the flag
        fabric
            .api_response
            .send(ApiResponse::StreamComplete {
                request_id: "stale".into(),
                usage: Default::default(),
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(150));
        assert!(processing.load(Ordering::SeqCst));

        // The live request does
        fabric
            .api_response
            .send(ApiResponse::StreamComplete {
                request_id: "live".into(),
                usage: Default::default(),
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(150));
        assert!(!processing.load(Ordering::SeqCst));

        fabric.signal_shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_ensure_conversation_creates_once() {
        let store = ConversationStore::open_in_memory().unwrap();
        let config = Config::default();
        let mut session = Session::new(&config);

        let first = ensure_conversation(&store, &mut session, "list the files please").unwrap();
        let second = ensure_conversation(&store, &mut session, "and again").unwrap();
        assert_eq!(first, second);

        let conversation = store.get_conversation(first).unwrap().unwrap();
        assert_eq!(conversation.title, "list the files please");
    }
}
