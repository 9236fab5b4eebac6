//! Persistent entities: conversations, stored messages, usage rows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::types::{ChatMessage, MessageRole, ToolCall};

/// Per-conversation mode; plan mode restricts edits to files created in the
/// same plan session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationMode {
    Plan,
    Code,
}

impl ConversationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationMode::Plan => "plan",
            ConversationMode::Code => "code",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plan" => Some(ConversationMode::Plan),
            "code" => Some(ConversationMode::Code),
            _ => None,
        }
    }
}

/// One conversation record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub title: String,
    pub mode: ConversationMode,
    pub model_nickname: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Count of non-system messages
    pub message_count: i64,
    /// False once archived
    pub is_active: bool,
}

/// A message as persisted, with its assigned id and sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
    pub thinking: Option<String>,
    pub thinking_encrypted: bool,
    /// Strictly increasing, contiguous from 1 within a conversation
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Strip persistence fields for wire use
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
            thinking: self.thinking.clone(),
            thinking_encrypted: self.thinking_encrypted,
        }
    }
}

/// Append-only token accounting row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsageRow {
    pub id: i64,
    pub conversation_id: i64,
    pub message_id: Option<i64>,
    pub model_nickname: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub reasoning_tokens: i64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub reasoning_cost: f64,
    pub timestamp: DateTime<Utc>,
}

/// One row of the `/cost` table, aggregated per model nickname
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCostRow {
    pub model_nickname: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub reasoning_tokens: i64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub reasoning_cost: f64,
}

impl ModelCostRow {
    pub fn total_cost(&self) -> f64 {
        self.input_cost + self.output_cost + self.reasoning_cost
    }
}

/// Per-model rows plus a grand total
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub rows: Vec<ModelCostRow>,
    pub total: ModelCostRow,
}

impl CostBreakdown {
    pub fn from_rows(rows: Vec<ModelCostRow>) -> Self {
        let mut total = ModelCostRow {
            model_nickname: "total".to_string(),
            ..Default::default()
        };
        for row in &rows {
            total.input_tokens += row.input_tokens;
            total.output_tokens += row.output_tokens;
            total.reasoning_tokens += row.reasoning_tokens;
            total.input_cost += row.input_cost;
            total.output_cost += row.output_cost;
            total.reasoning_cost += row.reasoning_cost;
        }
        Self { rows, total }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trip() {
        assert_eq!(
            ConversationMode::parse(ConversationMode::Plan.as_str()),
            Some(ConversationMode::Plan)
        );
        assert_eq!(ConversationMode::parse("yolo"), None);
    }

    #[test]
    fn test_cost_breakdown_totals() {
        let breakdown = CostBreakdown::from_rows(vec![
            ModelCostRow {
                model_nickname: "a".into(),
                input_tokens: 100,
                output_tokens: 20,
                input_cost: 0.5,
                output_cost: 0.2,
                ..Default::default()
            },
            ModelCostRow {
                model_nickname: "b".into(),
                input_tokens: 50,
                output_tokens: 10,
                reasoning_tokens: 5,
                input_cost: 0.1,
                output_cost: 0.05,
                reasoning_cost: 0.01,
                ..Default::default()
            },
        ]);

        assert_eq!(breakdown.total.input_tokens, 150);
        assert_eq!(breakdown.total.output_tokens, 30);
        assert_eq!(breakdown.total.reasoning_tokens, 5);
        assert!((breakdown.total.total_cost() - 0.86).abs() < 1e-9);
    }
}
