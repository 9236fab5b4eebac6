//! Bus wire protocol: subject layout and JSON payloads
//!
//! Subjects carry UTF-8 JSON. Agents listen on a per-name request subject
//! and publish responses and status updates on the shared master subjects.

use serde::{Deserialize, Serialize};

/// Streamed and final agent responses land here
pub const RESPONSE_SUBJECT: &str = "niffler.master.response";

/// Informational progress updates land here
pub const STATUS_SUBJECT: &str = "niffler.master.status";

/// KV bucket holding presence records, with the configured TTL as max age
pub const PRESENCE_BUCKET: &str = "niffler-presence";

/// Request subject for one agent
pub fn agent_request_subject(agent: &str) -> String {
    format!("niffler.agent.{}.request", agent)
}

/// Presence key for one client. NATS KV keys cannot contain ':', so the
/// record is `present.<name>` rather than `present:<name>`.
pub fn presence_key(client_id: &str) -> String {
    format!("present.{}", client_id)
}

/// Strip a presence key back to the client name
pub fn presence_name(key: &str) -> Option<&str> {
    key.strip_prefix("present.")
}

/// Routed user input for one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatsRequest {
    pub request_id: String,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// One response chunk; `done=true` exactly once per request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatsResponse {
    pub request_id: String,
    pub agent_name: String,
    pub content: String,
    pub done: bool,
}

/// Progress line shown by the master without disturbing the response stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatsStatusUpdate {
    pub request_id: String,
    pub agent_name: String,
    pub status: String,
}

/// `<unix>-<rand6>` request id, unique enough for demultiplexing
pub fn generate_request_id() -> String {
    use rand::distr::Alphanumeric;
    use rand::Rng;

    let unix = chrono::Utc::now().timestamp();
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{}-{}", unix, suffix)
}
