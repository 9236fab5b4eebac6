//! API worker - owns the streaming LLM session and the tool-calling loop
//!
//! A single-threaded consumer of `apiRequest` and producer of `apiResponse`.
//! Parallel agents get concurrency by each owning their own worker. The
//! worker drives one streaming request at a time through the sequence
//! Idle -> Streaming -> (ToolDispatch -> Streaming)* -> PersistAndComplete,
//! emitting exactly one of `StreamComplete` / `StreamError` per request.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tiktoken_rs::CoreBPE;

use crate::channels::{
    ApiRequest, ApiResponse, ChannelFabric, ChatRequest, ToolRequest, ToolResponse,
};
use crate::config::{Config, ModelConfig};
use crate::error::{NifflerError, Result};
use crate::llm::client;
use crate::llm::sse::{SseDelta, SseParser};
use crate::llm::types::{ChatMessage, StreamErrorKind, ToolCall, UsageData};
use crate::store::ConversationStore;

/// Dequeue/poll granularity; lets the worker observe shutdown and cancels
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Safety cap on the tool-calling loop, bounding adversarial models
pub const MAX_TOOL_ITERATIONS: usize = 25;

/// Diagnostics toggles from the CLI
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiWorkerOptions {
    /// Log resolved request bodies at debug
    pub dump: bool,
    /// Log raw SSE data lines at trace
    pub dump_sse: bool,
}

type TurnError = (StreamErrorKind, String);

/// Accumulated output of one HTTP stream
#[derive(Debug, Default)]
struct StreamTurn {
    assistant_text: String,
    thinking: String,
    thinking_encrypted: bool,
    tool_calls: Vec<ToolCall>,
    usage: Option<UsageData>,
}

pub struct ApiWorker {
    fabric: ChannelFabric,
    store: Option<ConversationStore>,
    config: Config,
    options: ApiWorkerOptions,
    http: reqwest::Client,
    rt: tokio::runtime::Runtime,
    bpe: CoreBPE,
    active_model: Option<ModelConfig>,
}

/// Spawn the API worker thread over the given fabric
pub fn spawn(
    fabric: ChannelFabric,
    store: Option<ConversationStore>,
    config: Config,
    options: ApiWorkerOptions,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("api-worker".into())
        .spawn(move || {
            let _guard = fabric.register_thread();
            match ApiWorker::new(fabric.clone(), store, config, options) {
                Ok(worker) => worker.run(),
                Err(e) => tracing::error!("api worker failed to start: {}", e),
            }
        })
        .expect("failed to spawn api worker thread")
}

impl ApiWorker {
    pub fn new(
        fabric: ChannelFabric,
        store: Option<ConversationStore>,
        config: Config,
        options: ApiWorkerOptions,
    ) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| NifflerError::Config(format!("tokenizer init failed: {}", e)))?;
        Ok(Self {
            fabric,
            store,
            config,
            options,
            http: reqwest::Client::new(),
            rt,
            bpe,
            active_model: None,
        })
    }

    pub fn run(mut self) {
        tracing::debug!("api worker started");
        loop {
            if self.fabric.is_shutdown() {
                // Final drain: fail pending chats rather than start new turns
                while let Some(request) = self.fabric.api_request.try_recv() {
                    if let ApiRequest::Chat(chat) = request {
                        self.emit(ApiResponse::StreamError {
                            request_id: chat.request_id,
                            kind: StreamErrorKind::Cancelled,
                            message: "shutting down".into(),
                        });
                    }
                }
                break;
            }

            match self.fabric.api_request.recv_timeout(POLL_INTERVAL) {
                Some(ApiRequest::Chat(chat)) => self.run_turn(*chat),
                Some(ApiRequest::StreamCancel { request_id }) => {
                    tracing::debug!(%request_id, "cancel for idle worker ignored");
                }
                Some(ApiRequest::ConfigureModel { model }) => {
                    tracing::info!(model = %model.model, "active model configured");
                    self.active_model = Some(*model);
                }
                None => {}
            }
        }
        tracing::debug!("api worker exiting");
    }

    /// Run one chat turn end to end, emitting the single terminal event
    fn run_turn(&self, mut request: ChatRequest) {
        self.fill_from_active_model(&mut request);
        let request_id = request.request_id.clone();
        self.emit(ApiResponse::Ready {
            request_id: request_id.clone(),
        });

        match self.drive_turn(&request) {
            Ok(usage) => self.emit(ApiResponse::StreamComplete { request_id, usage }),
            Err((kind, message)) => {
                if kind != StreamErrorKind::Cancelled {
                    tracing::error!(%request_id, ?kind, "turn failed: {}", message);
                }
                self.emit(ApiResponse::StreamError {
                    request_id,
                    kind,
                    message,
                });
            }
        }
    }

    fn drive_turn(&self, request: &ChatRequest) -> std::result::Result<UsageData, TurnError> {
        let mut messages = request.messages.clone();
        let mut reported = UsageData::default();
        let mut any_usage = false;

        for iteration in 0..MAX_TOOL_ITERATIONS {
            let turn = self.stream_once(request, &messages)?;

            if let Some(usage) = turn.usage {
                reported.input_tokens += usage.input_tokens;
                reported.output_tokens += usage.output_tokens;
                reported.reasoning_tokens += usage.reasoning_tokens;
                any_usage = true;
            }

            if turn.tool_calls.is_empty() {
                let usage = if any_usage {
                    reported
                } else {
                    self.estimate_usage(&messages, &turn.assistant_text)
                };
                let message_id = if turn.assistant_text.is_empty() {
                    None
                } else {
                    self.persist_message(request, &assistant_message(&turn))
                };
                self.record_usage(request, message_id, usage);
                return Ok(usage);
            }

            tracing::debug!(
                iteration,
                calls = turn.tool_calls.len(),
                "dispatching tool calls"
            );

            let assistant = assistant_message(&turn);
            self.persist_message(request, &assistant);
            messages.push(assistant);

            for call in &turn.tool_calls {
                self.emit_checked(ApiResponse::ToolCallRequest {
                    request_id: request.request_id.clone(),
                    tool_call: call.clone(),
                })?;

                self.fabric
                    .tool_request
                    .send(ToolRequest {
                        tool_call_id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                        agent_name: request.agent_name.clone(),
                        conversation_id: request.conversation_id,
                    })
                    .map_err(|e| (StreamErrorKind::QueueFull, e.to_string()))?;

                let response = self.await_tool_response(&call.id, request)?;

                self.emit_checked(ApiResponse::ToolCallResult {
                    request_id: request.request_id.clone(),
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    success: response.success,
                    result: response.result.clone(),
                    elapsed: response.elapsed,
                })?;

                let tool_message = ChatMessage::tool_result(&call.id, &response.result);
                self.persist_message(request, &tool_message);
                messages.push(tool_message);
            }
        }

        Err((
            StreamErrorKind::TurnCapExceeded,
            format!(
                "tool-calling loop exceeded {} iterations",
                MAX_TOOL_ITERATIONS
            ),
        ))
    }

    /// Open one HTTP stream and consume it to the end, emitting chunks
    fn stream_once(
        &self,
        request: &ChatRequest,
        messages: &[ChatMessage],
    ) -> std::result::Result<StreamTurn, TurnError> {
        let mut effective = request.clone();
        effective.messages = messages.to_vec();

        if self.options.dump {
            tracing::debug!(
                request_id = %request.request_id,
                body = %client::build_request_body(&effective),
                "resolved request"
            );
        }

        self.rt.block_on(async {
            let stream = client::open_stream(&self.http, &effective)
                .await
                .map_err(|e| (e.stream_kind(), e.to_string()))?;
            let mut stream = Box::pin(stream);

            let mut parser = SseParser::new();
            let mut turn = StreamTurn::default();

            loop {
                if self.check_cancel(&request.request_id) {
                    // Drop the stream; already-received chunks are discarded
                    return Err((StreamErrorKind::Cancelled, "cancelled".into()));
                }
                if self.fabric.is_shutdown() {
                    return Err((StreamErrorKind::Cancelled, "shutting down".into()));
                }

                match tokio::time::timeout(POLL_INTERVAL, stream.next()).await {
                    Err(_) => continue,
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        return Err((StreamErrorKind::Network, e.to_string()));
                    }
                    Ok(Some(Ok(event))) => {
                        if !client::is_data_event(&event) {
                            continue;
                        }
                        if self.options.dump_sse {
                            tracing::trace!(data = %event.data, "sse");
                        }
                        let deltas = parser
                            .feed(&event.data)
                            .map_err(|e| (e.stream_kind(), e.to_string()))?;
                        for delta in deltas {
                            self.emit_delta(&request.request_id, &mut turn, delta)?;
                        }
                    }
                }
            }

            for delta in parser.flush() {
                self.emit_delta(&request.request_id, &mut turn, delta)?;
            }
            if let Some(reason) = parser.finish_reason() {
                tracing::debug!(reason, "stream finished");
            }
            turn.tool_calls = parser.take_tool_calls();
            turn.usage = parser.usage();
            Ok(turn)
        })
    }

    fn emit_delta(
        &self,
        request_id: &str,
        turn: &mut StreamTurn,
        delta: SseDelta,
    ) -> std::result::Result<(), TurnError> {
        let response = match delta {
            SseDelta::Content(text) => {
                turn.assistant_text.push_str(&text);
                ApiResponse::StreamChunk {
                    request_id: request_id.to_string(),
                    content: Some(text),
                    thinking: None,
                    is_encrypted: false,
                }
            }
            SseDelta::Thinking { text, encrypted } => {
                turn.thinking.push_str(&text);
                turn.thinking_encrypted |= encrypted;
                ApiResponse::StreamChunk {
                    request_id: request_id.to_string(),
                    content: None,
                    thinking: Some(text),
                    is_encrypted: encrypted,
                }
            }
        };
        self.emit_checked(response)
    }

    /// Block until the matching tool result arrives, honoring the per-call
    /// timeout and cooperative cancellation
    fn await_tool_response(
        &self,
        tool_call_id: &str,
        request: &ChatRequest,
    ) -> std::result::Result<ToolResponse, TurnError> {
        let deadline = Instant::now() + request.tool_timeout;
        loop {
            if self.check_cancel(&request.request_id) {
                return Err((StreamErrorKind::Cancelled, "cancelled".into()));
            }
            if self.fabric.is_shutdown() {
                return Err((StreamErrorKind::Cancelled, "shutting down".into()));
            }
            if let Some(response) = self.fabric.tool_response.recv_timeout(POLL_INTERVAL) {
                if response.tool_call_id == tool_call_id {
                    return Ok(response);
                }
                tracing::debug!(
                    got = %response.tool_call_id,
                    want = %tool_call_id,
                    "dropping stale tool response"
                );
            }
            if Instant::now() >= deadline {
                return Err((
                    StreamErrorKind::ToolTimeout,
                    format!(
                        "tool call {} produced no result within {:?}",
                        tool_call_id, request.tool_timeout
                    ),
                ));
            }
        }
    }

    /// Drain control messages that arrived mid-turn. Returns true when the
    /// current request was cancelled.
    fn check_cancel(&self, current_request: &str) -> bool {
        while let Some(message) = self.fabric.api_request.try_recv() {
            match message {
                ApiRequest::StreamCancel { request_id } if request_id == current_request => {
                    tracing::info!(%request_id, "stream cancelled");
                    return true;
                }
                ApiRequest::StreamCancel { request_id } => {
                    tracing::debug!(%request_id, "cancel for other request ignored");
                }
                ApiRequest::Chat(other) => {
                    // One streaming request at a time; overlap is a caller bug
                    self.emit(ApiResponse::StreamError {
                        request_id: other.request_id,
                        kind: StreamErrorKind::Provider,
                        message: "API worker busy with another request".into(),
                    });
                }
                ApiRequest::ConfigureModel { .. } => {
                    tracing::warn!("configure-model ignored while a request is in flight");
                }
            }
        }
        false
    }

    fn fill_from_active_model(&self, request: &mut ChatRequest) {
        if request.model.is_empty() {
            if let Some(model) = &self.active_model {
                request.model = model.model.clone();
                request.base_url = model.base_url.clone();
                request.max_tokens = model.max_tokens;
                request.temperature = model.temperature;
                if request.api_key.is_empty() {
                    request.api_key = model.api_key().unwrap_or_default();
                }
            }
        }
    }

    fn persist_message(&self, request: &ChatRequest, message: &ChatMessage) -> Option<i64> {
        let conversation_id = request.conversation_id?;
        let store = self.store.as_ref()?;
        match store.append_message(conversation_id, message) {
            Ok(stored) => Some(stored.id),
            Err(e) => {
                tracing::warn!(conversation_id, "failed to persist message: {}", e);
                None
            }
        }
    }

    fn record_usage(&self, request: &ChatRequest, message_id: Option<i64>, usage: UsageData) {
        let Some(conversation_id) = request.conversation_id else {
            return;
        };
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let (input_cost, output_cost, reasoning_cost) =
            cost_for(&self.config, &request.model_nickname, usage);
        if let Err(e) = store.record_token_usage(
            conversation_id,
            message_id,
            &request.model_nickname,
            usage,
            input_cost,
            output_cost,
            reasoning_cost,
        ) {
            tracing::warn!(conversation_id, "failed to record token usage: {}", e);
        }
    }

    /// Tokenizer-based estimate used when the provider omits usage
    fn estimate_usage(&self, messages: &[ChatMessage], assistant_text: &str) -> UsageData {
        let input: usize = messages
            .iter()
            .map(|m| self.bpe.encode_with_special_tokens(&m.content).len())
            .sum();
        let output = self.bpe.encode_with_special_tokens(assistant_text).len();
        UsageData {
            input_tokens: input as u32,
            output_tokens: output as u32,
            reasoning_tokens: 0,
            estimated: true,
        }
    }

    fn emit(&self, response: ApiResponse) {
        if let Err(e) = self.fabric.api_response.send(response) {
            tracing::error!("failed to emit api response: {}", e);
        }
    }

    /// Emission that is fatal to the turn when the response queue is stuck
    fn emit_checked(&self, response: ApiResponse) -> std::result::Result<(), TurnError> {
        self.fabric
            .api_response
            .send(response)
            .map_err(|e| (StreamErrorKind::QueueFull, e.to_string()))
    }
}

fn assistant_message(turn: &StreamTurn) -> ChatMessage {
    let mut message = ChatMessage::assistant(turn.assistant_text.clone());
    message.tool_calls = turn.tool_calls.clone();
    if !turn.thinking.is_empty() {
        message.thinking = Some(turn.thinking.clone());
        message.thinking_encrypted = turn.thinking_encrypted;
    }
    message
}

fn cost_for(config: &Config, nickname: &str, usage: UsageData) -> (f64, f64, f64) {
    let Ok(model) = config.model(nickname) else {
        return (0.0, 0.0, 0.0);
    };
    let per_tok = |rate: Option<f64>, tokens: u32| {
        rate.map(|r| r * tokens as f64 / 1_000_000.0).unwrap_or(0.0)
    };
    (
        per_tok(model.input_cost_per_mtok, usage.input_tokens),
        per_tok(model.output_cost_per_mtok, usage.output_tokens),
        per_tok(model.reasoning_cost_per_mtok, usage.reasoning_tokens),
    )
}
