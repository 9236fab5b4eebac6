//! Process-wide session state

use chrono::{DateTime, Utc};

use crate::config::Config;

/// Single instance per process; owned by the runtime that drives the UI or
/// agent loop and handed out by shared reference.
#[derive(Debug, Clone)]
pub struct Session {
    /// Conversation currently bound to this process, if any
    pub conversation_id: Option<i64>,
    /// Process start time; session cost filters usage rows against this
    pub started_at: DateTime<Utc>,
    /// Focused agent (master only)
    #[allow(dead_code)]
    pub current_agent: Option<String>,
    /// Active model nickname
    pub model_nickname: String,
}

impl Session {
    pub fn new(config: &Config) -> Self {
        Self {
            conversation_id: None,
            started_at: Utc::now(),
            current_agent: config.defaults.default_agent.clone(),
            model_nickname: config.default_model().to_string(),
        }
    }

    /// Username for prompt decoration
    pub fn username() -> String {
        std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "user".to_string())
    }
}
