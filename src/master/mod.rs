//! Master runtime - routes `@agent` input over the bus
//!
//! The master keeps no conversation state. It parses `@agent rest` targets,
//! tracks the focused agent, publishes requests fire-and-forget, and prints
//! streamed responses on a background listener thread. Chunks from different
//! requests may interleave; the listener demultiplexes by request id.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bus::{
    agent_request_subject, generate_request_id, BusClient, NatsRequest, NatsResponse,
    NatsStatusUpdate, RESPONSE_SUBJECT, STATUS_SUBJECT,
};
use crate::error::{NifflerError, Result};

const LISTENER_POLL: Duration = Duration::from_millis(50);
const SINGLE_SHOT_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of routing one line of input
#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Published to an agent; responses stream in on the listener
    Sent { agent: String, request_id: String },
    /// A bare `@agent` just moved the focus; nothing was published
    Focused { agent: String },
    /// No target agent; the caller falls back to local handling
    Unhandled,
    /// Routing failed (agent missing, bus trouble)
    Error(String),
}

pub struct Master {
    bus: BusClient,
    default_agent: Option<String>,
    current_agent: Option<String>,
    listener: Option<JoinHandle<()>>,
    listener_stop: Arc<AtomicBool>,
}

impl Master {
    pub fn connect(nats_url: &str, default_agent: Option<String>, presence_ttl: Duration) -> Result<Self> {
        let bus = BusClient::connect(nats_url, "master", presence_ttl)
            .map_err(|e| NifflerError::Bus(e.to_string()))?;
        Ok(Self {
            bus,
            current_agent: default_agent.clone(),
            default_agent,
            listener: None,
            listener_stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn current_agent(&self) -> Option<&str> {
        self.current_agent.as_deref()
    }

    /// Agents with a live presence record (the master's own record excluded)
    pub fn present_agents(&self) -> Vec<String> {
        self.bus
            .list_present()
            .unwrap_or_default()
            .into_iter()
            .filter(|name| name != self.bus.client_id())
            .collect()
    }

    /// Route one line of input to an agent (fire-and-forget)
    pub fn handle_agent_request(&mut self, input: &str) -> RouteOutcome {
        let (explicit_target, rest) = parse_agent_target(input);

        let agent = match &explicit_target {
            Some(agent) => agent.clone(),
            None => match self.current_agent.clone().or_else(|| self.default_agent.clone()) {
                Some(agent) => agent,
                None => return RouteOutcome::Unhandled,
            },
        };

        if !self.bus.is_present(&agent) {
            let available = self.present_agents();
            return RouteOutcome::Error(format!(
                "@{}: ❌ agent not available (present: {})",
                agent,
                if available.is_empty() {
                    "none".to_string()
                } else {
                    available.join(", ")
                }
            ));
        }

        if explicit_target.is_some() {
            self.current_agent = Some(agent.clone());
            if rest.is_empty() {
                return RouteOutcome::Focused { agent };
            }
        }

        let request_id = generate_request_id();
        let request = NatsRequest {
            request_id: request_id.clone(),
            input: rest,
            agent_name: Some(agent.clone()),
            timestamp: Some(chrono::Utc::now().timestamp()),
        };
        let payload = match serde_json::to_string(&request) {
            Ok(payload) => payload,
            Err(e) => return RouteOutcome::Error(format!("❌ {}", e)),
        };
        if let Err(e) = self.bus.publish(&agent_request_subject(&agent), &payload) {
            return RouteOutcome::Error(format!("@{}: ❌ {}", agent, e));
        }
        tracing::debug!(%agent, %request_id, "request published");
        RouteOutcome::Sent { agent, request_id }
    }

    /// Start the background thread that prints responses and status lines
    pub fn start_listener(&mut self) -> Result<()> {
        let responses = self
            .bus
            .subscribe(RESPONSE_SUBJECT)
            .map_err(|e| NifflerError::Bus(e.to_string()))?;
        let statuses = self
            .bus
            .subscribe(STATUS_SUBJECT)
            .map_err(|e| NifflerError::Bus(e.to_string()))?;
        let stop = self.listener_stop.clone();

        let handle = thread::Builder::new()
            .name("master-listener".into())
            .spawn(move || listener_loop(responses, statuses, stop))
            .expect("failed to spawn master listener thread");
        self.listener = Some(handle);
        Ok(())
    }

    /// `--prompt --wait`: send one request and block for its final response
    pub fn run_single_shot(&mut self, agent: &str, prompt: &str) -> Result<String> {
        let mut subscription = self
            .bus
            .subscribe(RESPONSE_SUBJECT)
            .map_err(|e| NifflerError::Bus(e.to_string()))?;

        let outcome = self.handle_agent_request(&format!("@{} {}", agent, prompt));
        let request_id = match outcome {
            RouteOutcome::Sent { request_id, .. } => request_id,
            RouteOutcome::Error(message) => return Err(NifflerError::Bus(message)),
            RouteOutcome::Focused { .. } | RouteOutcome::Unhandled => {
                return Err(NifflerError::Bus("nothing to send".to_string()))
            }
        };

        let deadline = Instant::now() + SINGLE_SHOT_TIMEOUT;
        while Instant::now() < deadline {
            let Some(payload) = subscription.next_msg(Duration::from_millis(500)) else {
                continue;
            };
            let Ok(response) = serde_json::from_str::<NatsResponse>(&payload) else {
                continue;
            };
            if response.request_id == request_id && response.done {
                subscription.unsubscribe();
                return Ok(response.content);
            }
        }
        Err(NifflerError::Bus(format!(
            "no final response for {} within {:?}",
            request_id, SINGLE_SHOT_TIMEOUT
        )))
    }

    pub fn shutdown(mut self) {
        self.listener_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
        let _ = self.bus.remove_presence();
        self.bus.close();
    }
}

/// Split `@agent rest` into an explicit target and the remaining input
pub fn parse_agent_target(input: &str) -> (Option<String>, String) {
    let trimmed = input.trim();
    let Some(rest) = trimmed.strip_prefix('@') else {
        return (None, trimmed.to_string());
    };
    match rest.split_once(' ') {
        Some((agent, remainder)) if !agent.is_empty() => {
            (Some(agent.to_string()), remainder.trim().to_string())
        }
        None if !rest.is_empty() => (Some(rest.to_string()), String::new()),
        _ => (None, trimmed.to_string()),
    }
}

fn listener_loop(
    mut responses: crate::bus::BusSubscription,
    mut statuses: crate::bus::BusSubscription,
    stop: Arc<AtomicBool>,
) {
    // Bytes of each in-flight response already printed, keyed by request id
    let mut printed: HashMap<String, usize> = HashMap::new();

    while !stop.load(Ordering::SeqCst) {
        if let Some(payload) = responses.next_msg(LISTENER_POLL) {
            if let Ok(response) = serde_json::from_str::<NatsResponse>(&payload) {
                print_response(&mut printed, &response);
            }
        }
        if let Some(payload) = statuses.next_msg(LISTENER_POLL) {
            if let Ok(status) = serde_json::from_str::<NatsStatusUpdate>(&payload) {
                let color = agent_color(&status.agent_name);
                print!(
                    "\r\n{}[{}]{} {}\r\n",
                    color,
                    status.agent_name,
                    RESET,
                    normalize_newlines(&status.status)
                );
                let _ = std::io::stdout().flush();
            }
        }
    }
}

fn print_response(printed: &mut HashMap<String, usize>, response: &NatsResponse) {
    let seen = printed.entry(response.request_id.clone()).or_insert(0);
    let content = response.content.as_str();

    // Responses carry the accumulated content; print only the new suffix
    let new = if *seen <= content.len() && content.is_char_boundary(*seen) {
        &content[*seen..]
    } else {
        content
    };

    if *seen == 0 && !(new.is_empty() && !response.done) {
        let color = agent_color(&response.agent_name);
        print!("\r\n{}@{}:{} ", color, response.agent_name, RESET);
    }
    if !new.is_empty() {
        print!("{}", normalize_newlines(new));
    }
    *seen = content.len();

    if response.done {
        print!("\r\n");
        printed.remove(&response.request_id);
    }
    let _ = std::io::stdout().flush();
}

const RESET: &str = "\x1b[0m";

/// Deterministic per-agent color: FNV-1a over the name onto 8 ANSI colors
pub fn agent_color(name: &str) -> &'static str {
    const COLORS: [&str; 8] = [
        "\x1b[36m", // cyan
        "\x1b[32m", // green
        "\x1b[33m", // yellow
        "\x1b[34m", // blue
        "\x1b[35m", // magenta
        "\x1b[31m", // red
        "\x1b[96m", // bright cyan
        "\x1b[92m", // bright green
    ];
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in name.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    COLORS[(hash % COLORS.len() as u64) as usize]
}

/// Terminal output in raw-ish mode wants CRLF
pub fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_explicit_target() {
        assert_eq!(
            parse_agent_target("@coder fix bug"),
            (Some("coder".into()), "fix bug".into())
        );
        assert_eq!(parse_agent_target("@coder"), (Some("coder".into()), String::new()));
    }

    #[test]
    fn test_parse_without_target() {
        assert_eq!(parse_agent_target("refactor it"), (None, "refactor it".into()));
        // A bare '@' is not a target
        assert_eq!(parse_agent_target("@ nothing"), (None, "@ nothing".into()));
    }

    #[test]
    fn test_agent_color_is_deterministic() {
        assert_eq!(agent_color("coder"), agent_color("coder"));
        // Not all names may differ, but the function must never panic
        for name in ["a", "researcher", "x1", ""] {
            let _ = agent_color(name);
        }
    }

    #[test]
    fn test_normalize_newlines() {
        assert_eq!(normalize_newlines("a\nb"), "a\r\nb");
        assert_eq!(normalize_newlines("a\r\nb"), "a\r\nb");
    }
}
