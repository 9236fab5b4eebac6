//! Agent runtime - headless process serving one agent over the bus
//!
//! A single-threaded pump with a ~1 s period: receive requests, classify,
//! route. Safe-quick commands answer inline even while a turn streams;
//! disruptive commands are refused mid-turn; agentic work runs through a
//! single-slot executor with a FIFO queue behind it. The runtime is
//! constructed fully before any thread is spawned, and worker threads only
//! ever receive clones, never the runtime itself.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::agent::classify::{classify, parse_turn, CommandClass, TurnKind};
use crate::agent::definition::AgentDefinition;
use crate::bus::{
    agent_request_subject, BusClient, BusSubscription, NatsRequest, NatsResponse,
    NatsStatusUpdate, RESPONSE_SUBJECT, STATUS_SUBJECT,
};
use crate::channels::{ApiRequest, ApiResponse, ChannelFabric, ChatRequest};
use crate::commands::{derive_title, CommandContext, CommandRegistry};
use crate::config::Config;
use crate::error::{NifflerError, Result};
use crate::llm::types::{ChatMessage, MessageRole, StreamErrorKind, ToolDefinition};
use crate::llm::worker::{self as api_worker, ApiWorkerOptions};
use crate::session::Session;
use crate::store::{ConversationMode, ConversationStore};
use crate::tools::{worker as tool_worker, ToolRegistry};

const PUMP_TIMEOUT: Duration = Duration::from_millis(1000);
const RESPONSE_POLL: Duration = Duration::from_millis(100);

/// Rejection text for disruptive commands while the slot is taken
pub const BUSY_REJECTION: &str = "Cannot execute this command while ask/task is running";

/// Status line for queued agentic requests
pub fn queue_status(position: usize) -> String {
    format!("Queued - agent busy (position {})", position)
}

pub struct AgentRuntime {
    definition: AgentDefinition,
    config: Config,
    bus: BusClient,
    fabric: ChannelFabric,
    store: ConversationStore,
    session: Session,
    commands: CommandRegistry,
    tool_names: Vec<String>,
    tool_definitions: Vec<ToolDefinition>,
    subscription: BusSubscription,
    agentic_active: Arc<AtomicBool>,
    pending: VecDeque<NatsRequest>,
    executor: Option<JoinHandle<()>>,
    api_worker: Option<JoinHandle<()>>,
    tool_worker: Option<JoinHandle<()>>,
    heartbeat_interval: Duration,
    last_heartbeat: Instant,
}

impl AgentRuntime {
    /// Connect the bus, start the workers, and subscribe. Bus failure is
    /// fatal for an agent.
    pub fn start(
        definition: AgentDefinition,
        config: Config,
        store: ConversationStore,
        nats_url: &str,
        options: ApiWorkerOptions,
    ) -> Result<Self> {
        let presence_ttl = Duration::from_secs(config.defaults.presence_ttl_secs);
        let bus = BusClient::connect(nats_url, &definition.name, presence_ttl)
            .map_err(|e| NifflerError::Bus(e.to_string()))?;
        let subscription = bus
            .subscribe(&agent_request_subject(&definition.name))
            .map_err(|e| NifflerError::Bus(e.to_string()))?;

        let fabric = ChannelFabric::new();
        let registry = ToolRegistry::builtin();
        let tool_names = registry.names();
        let tool_definitions = registry.definitions_for(&definition.allowed_tools);

        let mut agent_tools: HashMap<String, HashSet<String>> = HashMap::new();
        agent_tools.insert(
            definition.name.clone(),
            definition.allowed_tools.iter().cloned().collect(),
        );

        let api_worker = api_worker::spawn(
            fabric.clone(),
            Some(store.clone()),
            config.clone(),
            options,
        );
        let tool_worker = tool_worker::spawn(
            fabric.clone(),
            registry,
            Some(store.clone()),
            agent_tools,
        );

        let mut session = Session::new(&config);
        if let Some(nickname) = &definition.model {
            if config.model(nickname).is_ok() {
                session.model_nickname = nickname.clone();
            } else {
                tracing::warn!(
                    %nickname,
                    "agent model nickname not in config, using default"
                );
            }
        }

        let heartbeat_interval = presence_ttl / 3;
        tracing::info!(
            agent = %definition.name,
            description = %definition.description,
            tools = ?definition.allowed_tools,
            "agent runtime started"
        );

        Ok(Self {
            definition,
            config,
            bus,
            fabric,
            store,
            session,
            commands: CommandRegistry::builtin(),
            tool_names,
            tool_definitions,
            subscription,
            agentic_active: Arc::new(AtomicBool::new(false)),
            pending: VecDeque::new(),
            executor: None,
            api_worker: Some(api_worker),
            tool_worker: Some(tool_worker),
            heartbeat_interval,
            last_heartbeat: Instant::now(),
        })
    }

    /// Main pump; returns after `shutdown` is raised and teardown completes
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::SeqCst) {
            if let Some(payload) = self.subscription.next_msg(PUMP_TIMEOUT) {
                self.handle_payload(&payload);
            }
            self.reap_executor();
            self.start_pending_if_idle();
            self.heartbeat_if_due();
        }
        self.teardown();
    }

    fn handle_payload(&mut self, payload: &str) {
        let request: NatsRequest = match serde_json::from_str(payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("dropping malformed request: {}", e);
                return;
            }
        };
        tracing::debug!(request_id = %request.request_id, input = %request.input, "request");

        match classify(&request.input) {
            CommandClass::SafeQuick => {
                let output = self.run_command(&request.input);
                self.publish_response(&request.request_id, &output, true);
            }
            CommandClass::Disruptive => {
                if self.agentic_active.load(Ordering::SeqCst) {
                    self.publish_response(&request.request_id, BUSY_REJECTION, true);
                } else {
                    let output = self.run_command(&request.input);
                    self.publish_response(&request.request_id, &output, true);
                }
            }
            CommandClass::Agentic => {
                if self.agentic_active.load(Ordering::SeqCst) {
                    self.pending.push_back(request.clone());
                    self.publish_status(&request.request_id, &queue_status(self.pending.len()));
                } else {
                    self.dispatch_agentic(request);
                }
            }
        }
    }

    /// One main-loop tick after the slot frees, the queue head starts
    fn start_pending_if_idle(&mut self) {
        if self.agentic_active.load(Ordering::SeqCst) {
            return;
        }
        if let Some(request) = self.pending.pop_front() {
            self.dispatch_agentic(request);
        }
    }

    fn dispatch_agentic(&mut self, request: NatsRequest) {
        // Registered commands that reached the agentic slot run inline
        if self.commands.category_of(&request.input).is_some() {
            let output = self.run_command(&request.input);
            self.publish_response(&request.request_id, &output, true);
            return;
        }

        let kind = parse_turn(&request.input);
        if let TurnKind::Task(prompt) = &kind {
            if prompt.is_empty() {
                self.publish_response(&request.request_id, "usage: /task <prompt>", true);
                return;
            }
        }

        let conversation_id = match &kind {
            TurnKind::Task(_) => None,
            TurnKind::Ask(prompt) => match self.ensure_conversation(prompt) {
                Ok(id) => Some(id),
                Err(e) => {
                    self.publish_response(
                        &request.request_id,
                        &format!("❌ failed to open conversation: {}", e),
                        true,
                    );
                    return;
                }
            },
        };

        self.agentic_active.store(true, Ordering::SeqCst);
        let turn = AgenticTurn {
            fabric: self.fabric.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
            definition: self.definition.clone(),
            store: self.store.clone(),
            request,
            kind,
            conversation_id,
            model_nickname: self.session.model_nickname.clone(),
            tools: self.tool_definitions.clone(),
            active: self.agentic_active.clone(),
        };

        let fabric = self.fabric.clone();
        let handle = thread::Builder::new()
            .name(format!("agentic-{}", self.definition.name))
            .spawn(move || {
                let _guard = fabric.register_thread();
                turn.run();
            })
            .expect("failed to spawn agentic executor thread");
        self.executor = Some(handle);
    }

    fn reap_executor(&mut self) {
        if self
            .executor
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(false)
        {
            if let Some(handle) = self.executor.take() {
                let _ = handle.join();
            }
        }
    }

    fn heartbeat_if_due(&mut self) {
        if self.last_heartbeat.elapsed() < self.heartbeat_interval {
            return;
        }
        if let Err(e) = self.bus.send_heartbeat() {
            tracing::warn!("heartbeat failed: {}", e);
        }
        self.last_heartbeat = Instant::now();
    }

    /// Bind the session to a conversation, creating one on first use
    fn ensure_conversation(&mut self, first_prompt: &str) -> Result<i64> {
        if let Some(id) = self.session.conversation_id {
            if matches!(self.store.get_conversation(id), Ok(Some(_))) {
                return Ok(id);
            }
        }
        if let Ok(conversations) = self.store.list_active() {
            if let Some(latest) = conversations.first() {
                self.session.conversation_id = Some(latest.id);
                self.session.model_nickname = latest.model_nickname.clone();
                return Ok(latest.id);
            }
        }
        let conversation = self
            .store
            .create_conversation(
                &derive_title(first_prompt),
                ConversationMode::Code,
                &self.session.model_nickname,
            )
            .map_err(|e| NifflerError::Store(e.to_string()))?;
        self.session.conversation_id = Some(conversation.id);
        Ok(conversation.id)
    }

    fn run_command(&mut self, input: &str) -> String {
        let mut ctx = CommandContext {
            store: &self.store,
            session: &mut self.session,
            config: &self.config,
            tool_names: &self.tool_names,
            agent_name: Some(&self.definition.name),
        };
        match self.commands.execute(&mut ctx, input) {
            Some(Ok(output)) => output,
            Some(Err(message)) => format!("❌ {}", message),
            None => format!("Unknown command: {}", input),
        }
    }

    fn publish_response(&self, request_id: &str, content: &str, done: bool) {
        publish_response(&self.bus, &self.definition.name, request_id, content, done);
    }

    fn publish_status(&self, request_id: &str, status: &str) {
        publish_status(&self.bus, &self.definition.name, request_id, status);
    }

    fn teardown(&mut self) {
        tracing::info!(agent = %self.definition.name, "agent shutting down");
        self.fabric.signal_shutdown();
        if let Some(handle) = self.executor.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.api_worker.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.tool_worker.take() {
            let _ = handle.join();
        }
        if !self.fabric.wait_for_exit(Duration::from_secs(2)) {
            tracing::warn!("workers still registered after teardown");
        }
        if let Err(e) = self.bus.remove_presence() {
            tracing::warn!("failed to remove presence: {}", e);
        }
        self.bus.clone().close();
    }
}

/// Everything one agentic turn needs, cloned out of the runtime before the
/// executor thread starts
struct AgenticTurn {
    fabric: ChannelFabric,
    bus: BusClient,
    config: Config,
    definition: AgentDefinition,
    store: ConversationStore,
    request: NatsRequest,
    kind: TurnKind,
    conversation_id: Option<i64>,
    model_nickname: String,
    tools: Vec<ToolDefinition>,
    active: Arc<AtomicBool>,
}

impl AgenticTurn {
    fn run(self) {
        let request_id = self.request.request_id.clone();
        if let Err(message) = self.execute() {
            publish_response(&self.bus, &self.definition.name, &request_id, &message, true);
        }
        self.active.store(false, Ordering::SeqCst);
    }

    /// Returns Err with a user-facing message when the turn could not even
    /// start; successful turns publish their own final response.
    fn execute(&self) -> std::result::Result<(), String> {
        let (messages, stream_chunks) = self.build_messages()?;

        let model = self
            .config
            .model(&self.model_nickname)
            .map_err(|e| format!("❌ {}", e))?;
        let api_key = model
            .api_key()
            .ok_or_else(|| format!("❌ no API key in ${}", model.api_key_env))?;

        let tool_timeout = Duration::from_secs(self.config.defaults.tool_timeout_secs);
        let chat = ChatRequest {
            request_id: self.request.request_id.clone(),
            messages,
            model: model.model.clone(),
            model_nickname: self.model_nickname.clone(),
            max_tokens: model.max_tokens,
            temperature: model.temperature,
            base_url: model.base_url.clone(),
            api_key,
            enable_tools: !self.tools.is_empty(),
            tools: self.tools.clone(),
            agent_name: Some(self.definition.name.clone()),
            conversation_id: self.conversation_id,
            tool_timeout,
        };

        self.fabric
            .api_request
            .send(ApiRequest::Chat(Box::new(chat)))
            .map_err(|e| format!("❌ failed to queue request: {}", e))?;

        self.pump_responses(stream_chunks, tool_timeout);
        Ok(())
    }

    /// Returns the message list and whether chunks stream to the master
    fn build_messages(&self) -> std::result::Result<(Vec<ChatMessage>, bool), String> {
        match &self.kind {
            TurnKind::Task(prompt) => {
                // Fresh, isolated context; the bound conversation is untouched
                let system = self.definition.system_prompt(ConversationMode::Code);
                let mut messages = Vec::new();
                if !system.is_empty() {
                    messages.push(ChatMessage::system(system));
                }
                messages.push(ChatMessage::user(prompt.clone()));
                Ok((messages, false))
            }
            TurnKind::Ask(prompt) => {
                let conversation_id = self
                    .conversation_id
                    .ok_or_else(|| "❌ no conversation bound".to_string())?;
                let conversation = self
                    .store
                    .get_conversation(conversation_id)
                    .map_err(|e| format!("❌ {}", e))?
                    .ok_or_else(|| "❌ conversation disappeared".to_string())?;

                self.store
                    .append_message(conversation_id, &ChatMessage::user(prompt.clone()))
                    .map_err(|e| format!("❌ failed to append message: {}", e))?;

                let stored = self
                    .store
                    .get_messages(conversation_id)
                    .map_err(|e| format!("❌ {}", e))?;

                let system = self.definition.system_prompt(conversation.mode);
                let mut messages = Vec::new();
                if !system.is_empty() {
                    messages.push(ChatMessage::system(system));
                }
                messages.extend(
                    stored
                        .iter()
                        .filter(|m| m.role != MessageRole::System)
                        .map(|m| m.to_chat_message()),
                );
                Ok((messages, true))
            }
        }
    }

    /// Consume api responses for this request, forwarding to the bus
    fn pump_responses(&self, stream_chunks: bool, idle_timeout: Duration) {
        let request_id = &self.request.request_id;
        let agent = &self.definition.name;
        let mut accumulated = String::new();
        let mut idle_deadline = Instant::now() + idle_timeout;

        loop {
            if self.fabric.is_shutdown() {
                publish_response(&self.bus, agent, request_id, "❌ agent shutting down", true);
                return;
            }
            let Some(response) = self.fabric.api_response.recv_timeout(RESPONSE_POLL) else {
                if Instant::now() >= idle_deadline {
                    publish_response(&self.bus, agent, request_id, "❌ agent turn timed out", true);
                    return;
                }
                continue;
            };

            if response.request_id() != request_id {
                tracing::debug!(
                    got = %response.request_id(),
                    "dropping response for another request"
                );
                continue;
            }
            idle_deadline = Instant::now() + idle_timeout;

            match response {
                ApiResponse::Ready { .. } => {}
                ApiResponse::StreamChunk { content, .. } => {
                    if let Some(text) = content {
                        accumulated.push_str(&text);
                        if stream_chunks {
                            publish_response(&self.bus, agent, request_id, &accumulated, false);
                        }
                    }
                }
                ApiResponse::ToolCallRequest { tool_call, .. } => {
                    publish_status(
                        &self.bus,
                        agent,
                        request_id,
                        &format!("Executing tool {}", tool_call.name),
                    );
                }
                ApiResponse::ToolCallResult {
                    tool_name, success, ..
                } => {
                    publish_status(
                        &self.bus,
                        agent,
                        request_id,
                        &format!(
                            "Tool {} {}",
                            tool_name,
                            if success { "completed" } else { "failed" }
                        ),
                    );
                }
                ApiResponse::StreamComplete { usage, .. } => {
                    tracing::debug!(
                        input = usage.input_tokens,
                        output = usage.output_tokens,
                        "turn complete"
                    );
                    publish_response(&self.bus, agent, request_id, &accumulated, true);
                    return;
                }
                ApiResponse::StreamError { kind, message, .. } => {
                    let content = match kind {
                        StreamErrorKind::Cancelled => "❌ cancelled".to_string(),
                        _ => format!("❌ {}", message),
                    };
                    publish_response(&self.bus, agent, request_id, &content, true);
                    return;
                }
            }
        }
    }
}

fn publish_response(bus: &BusClient, agent: &str, request_id: &str, content: &str, done: bool) {
    let response = NatsResponse {
        request_id: request_id.to_string(),
        agent_name: agent.to_string(),
        content: content.to_string(),
        done,
    };
    match serde_json::to_string(&response) {
        Ok(payload) => {
            if let Err(e) = bus.publish(RESPONSE_SUBJECT, &payload) {
                tracing::warn!("failed to publish response: {}", e);
            }
        }
        Err(e) => tracing::error!("failed to serialize response: {}", e),
    }
}

fn publish_status(bus: &BusClient, agent: &str, request_id: &str, status: &str) {
    let update = NatsStatusUpdate {
        request_id: request_id.to_string(),
        agent_name: agent.to_string(),
        status: status.to_string(),
    };
    match serde_json::to_string(&update) {
        Ok(payload) => {
            if let Err(e) = bus.publish(STATUS_SUBJECT, &payload) {
                tracing::warn!("failed to publish status: {}", e);
            }
        }
        Err(e) => tracing::error!("failed to serialize status: {}", e),
    }
}
