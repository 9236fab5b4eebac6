//! Channel fabric - typed queues wiring the worker threads together
//!
//! Four bounded multi-producer/multi-consumer queues connect the UI thread,
//! API worker, tool worker, and output handler. Enqueue never blocks
//! indefinitely: a full queue is retried with a short sleep up to a deadline,
//! then surfaces `QueueError::Full`. Dequeue blocks with a timeout so workers
//! can observe the shutdown flag and publish heartbeats between messages.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::config::ModelConfig;
use crate::llm::types::{ChatMessage, StreamErrorKind, ToolCall, ToolDefinition, UsageData};

/// Queue capacity for every fabric queue
const QUEUE_CAPACITY: usize = 256;

/// Sleep between enqueue retries while a queue is full
const ENQUEUE_RETRY_SLEEP: Duration = Duration::from_millis(10);

/// Default deadline for a full-queue enqueue before giving up
pub const DEFAULT_ENQUEUE_DEADLINE: Duration = Duration::from_secs(2);

/// One streaming chat turn handed to the API worker
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub request_id: String,
    pub messages: Vec<ChatMessage>,
    /// Wire-level model identifier
    pub model: String,
    /// Config nickname the usage rows are recorded under
    pub model_nickname: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub base_url: String,
    pub api_key: String,
    pub enable_tools: bool,
    pub tools: Vec<ToolDefinition>,
    /// Calling agent, for the tool worker's allow-list check
    pub agent_name: Option<String>,
    /// Conversation to persist into; None runs the turn without persistence
    pub conversation_id: Option<i64>,
    /// How long to wait for each tool result
    pub tool_timeout: Duration,
}

/// UI/agent -> API worker
#[derive(Debug, Clone)]
pub enum ApiRequest {
    Chat(Box<ChatRequest>),
    StreamCancel { request_id: String },
    ConfigureModel { model: Box<ModelConfig> },
}

/// API worker -> UI/agent/output handler
#[derive(Debug, Clone)]
pub enum ApiResponse {
    /// Request accepted; stream is being opened
    Ready { request_id: String },
    /// Content or thinking delta
    StreamChunk {
        request_id: String,
        content: Option<String>,
        thinking: Option<String>,
        is_encrypted: bool,
    },
    /// A tool call is about to be dispatched (for display)
    ToolCallRequest {
        request_id: String,
        tool_call: ToolCall,
    },
    /// A tool call finished (for display)
    ToolCallResult {
        request_id: String,
        tool_call_id: String,
        tool_name: String,
        success: bool,
        result: String,
        elapsed: Duration,
    },
    /// Turn finished; exactly one of StreamComplete/StreamError per request
    StreamComplete {
        request_id: String,
        usage: UsageData,
    },
    StreamError {
        request_id: String,
        kind: StreamErrorKind,
        message: String,
    },
}

impl ApiResponse {
    /// The request this response belongs to, for demultiplexing
    pub fn request_id(&self) -> &str {
        match self {
            ApiResponse::Ready { request_id }
            | ApiResponse::StreamChunk { request_id, .. }
            | ApiResponse::ToolCallRequest { request_id, .. }
            | ApiResponse::ToolCallResult { request_id, .. }
            | ApiResponse::StreamComplete { request_id, .. }
            | ApiResponse::StreamError { request_id, .. } => request_id,
        }
    }
}

/// API worker -> tool worker
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub tool_call_id: String,
    pub name: String,
    /// Unparsed JSON arguments as the model emitted them
    pub arguments: String,
    pub agent_name: Option<String>,
    pub conversation_id: Option<i64>,
}

/// Tool worker -> API worker
#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub tool_call_id: String,
    pub success: bool,
    /// JSON for structured tools, raw text otherwise
    pub result: String,
    pub elapsed: Duration,
}

/// Enqueue failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue-full: gave up after {0:?}")]
    Full(Duration),

    #[error("queue disconnected")]
    Disconnected,
}

/// One typed bounded queue
#[derive(Clone)]
pub struct TypedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> TypedQueue<T> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    /// Non-blocking enqueue with bounded retry up to `deadline`
    pub fn send_deadline(&self, mut item: T, deadline: Duration) -> Result<(), QueueError> {
        let started = Instant::now();
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(_)) => return Err(QueueError::Disconnected),
                Err(TrySendError::Full(back)) => {
                    if started.elapsed() >= deadline {
                        return Err(QueueError::Full(deadline));
                    }
                    item = back;
                    std::thread::sleep(ENQUEUE_RETRY_SLEEP);
                }
            }
        }
    }

    /// Enqueue with the default deadline
    pub fn send(&self, item: T) -> Result<(), QueueError> {
        self.send_deadline(item, DEFAULT_ENQUEUE_DEADLINE)
    }

    /// Blocking dequeue with timeout; None on timeout or disconnect
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Non-blocking dequeue
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Decrements the active-thread counter when the worker exits
pub struct ThreadGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The in-process fabric shared by all workers
#[derive(Clone)]
pub struct ChannelFabric {
    pub api_request: TypedQueue<ApiRequest>,
    pub api_response: TypedQueue<ApiResponse>,
    pub tool_request: TypedQueue<ToolRequest>,
    pub tool_response: TypedQueue<ToolResponse>,
    shutdown: Arc<AtomicBool>,
    active_threads: Arc<AtomicUsize>,
}

impl ChannelFabric {
    pub fn new() -> Self {
        Self {
            api_request: TypedQueue::new(QUEUE_CAPACITY),
            api_response: TypedQueue::new(QUEUE_CAPACITY),
            tool_request: TypedQueue::new(QUEUE_CAPACITY),
            tool_response: TypedQueue::new(QUEUE_CAPACITY),
            shutdown: Arc::new(AtomicBool::new(false)),
            active_threads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Flag all workers to drain and exit
    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Register a worker thread; hold the guard for the thread's lifetime
    pub fn register_thread(&self) -> ThreadGuard {
        self.active_threads.fetch_add(1, Ordering::SeqCst);
        ThreadGuard {
            counter: self.active_threads.clone(),
        }
    }

    /// Number of live worker threads; used by teardown assertions
    pub fn active_threads(&self) -> usize {
        self.active_threads.load(Ordering::SeqCst)
    }

    /// Block until all registered workers have exited or `timeout` elapses
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.active_threads() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }
}

impl Default for ChannelFabric {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_recv_round_trip() {
        let fabric = ChannelFabric::new();
        fabric
            .tool_response
            .send(ToolResponse {
                tool_call_id: "call_1".into(),
                success: true,
                result: "{}".into(),
                elapsed: Duration::from_millis(3),
            })
            .unwrap();

        let got = fabric
            .tool_response
            .recv_timeout(Duration::from_millis(100))
            .unwrap();
        assert_eq!(got.tool_call_id, "call_1");
        assert!(got.success);
    }

    #[test]
    fn test_recv_timeout_expires() {
        let fabric = ChannelFabric::new();
        let started = Instant::now();
        assert!(fabric
            .api_response
            .recv_timeout(Duration::from_millis(50))
            .is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_queue_full_surfaces_after_deadline() {
        let queue: TypedQueue<u32> = TypedQueue::new(2);
        queue.send(1).unwrap();
        queue.send(2).unwrap();

        let err = queue
            .send_deadline(3, Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, QueueError::Full(_)));

        // Draining one slot makes room again
        assert_eq!(queue.try_recv(), Some(1));
        queue.send_deadline(3, Duration::from_millis(30)).unwrap();
    }

    #[test]
    fn test_shutdown_flag_visible_across_clones() {
        let fabric = ChannelFabric::new();
        let clone = fabric.clone();
        assert!(!clone.is_shutdown());
        fabric.signal_shutdown();
        assert!(clone.is_shutdown());
    }

    #[test]
    fn test_active_thread_counter() {
        let fabric = ChannelFabric::new();
        assert_eq!(fabric.active_threads(), 0);

        let fabric_worker = fabric.clone();
        let handle = std::thread::spawn(move || {
            let _guard = fabric_worker.register_thread();
            while !fabric_worker.is_shutdown() {
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        // Worker registers itself shortly after spawn
        let deadline = Instant::now() + Duration::from_secs(1);
        while fabric.active_threads() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fabric.active_threads(), 1);

        fabric.signal_shutdown();
        handle.join().unwrap();
        assert!(fabric.wait_for_exit(Duration::from_secs(2)));
        assert_eq!(fabric.active_threads(), 0);
    }

    #[test]
    fn test_response_request_id_accessor() {
        let resp = ApiResponse::Ready {
            request_id: "req-9".into(),
        };
        assert_eq!(resp.request_id(), "req-9");

        let resp = ApiResponse::StreamError {
            request_id: "req-10".into(),
            kind: StreamErrorKind::Cancelled,
            message: "cancelled".into(),
        };
        assert_eq!(resp.request_id(), "req-10");
    }
}
