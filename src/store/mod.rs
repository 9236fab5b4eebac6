//! Conversation store - durable persistence on SQLite
//!
//! All access goes through `ConversationStore`, which serializes writes on a
//! single connection. Transient lock errors are retried with linear backoff
//! (5 attempts at a 200 ms base) before surfacing; callers on the turn path
//! treat exhaustion as fail-open.

mod types;

pub use types::{
    Conversation, ConversationMode, CostBreakdown, ModelCostRow, StoredMessage, TokenUsageRow,
};

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::llm::types::{ChatMessage, MessageRole, ToolCall, UsageData};

const LOCK_RETRY_ATTEMPTS: u32 = 5;
const LOCK_RETRY_BASE: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Database locked after {0} retries")]
    Locked(u32),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(i64),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable store for conversations, messages, and token usage
#[derive(Clone)]
pub struct ConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl ConversationStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory database for tests
    #[cfg(test)]
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_millis(250))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run an operation with the lock-retry policy
    fn with_retry<R>(
        &self,
        mut op: impl FnMut(&mut Connection) -> rusqlite::Result<R>,
    ) -> StoreResult<R> {
        for attempt in 1..=LOCK_RETRY_ATTEMPTS {
            let mut conn = self.conn.lock().expect("store mutex poisoned");
            match op(&mut conn) {
                Ok(value) => return Ok(value),
                Err(e) if is_locked(&e) => {
                    drop(conn);
                    tracing::debug!(attempt, "database locked, backing off");
                    std::thread::sleep(LOCK_RETRY_BASE * attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::warn!("database still locked after {} attempts", LOCK_RETRY_ATTEMPTS);
        Err(StoreError::Locked(LOCK_RETRY_ATTEMPTS))
    }

    // ── Conversations ──────────────────────────────────────────────────────

    pub fn create_conversation(
        &self,
        title: &str,
        mode: ConversationMode,
        model_nickname: &str,
    ) -> StoreResult<Conversation> {
        let now = Utc::now();
        let title = title.to_string();
        let nickname = model_nickname.to_string();
        let id = self.with_retry(move |conn| {
            conn.execute(
                "INSERT INTO conversation (title, mode, model_nickname, created_at, last_activity, is_active)
                 VALUES (?, ?, ?, ?, ?, 1)",
                params![title, mode.as_str(), nickname, now.to_rfc3339(), now.to_rfc3339()],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        self.get_conversation(id)?
            .ok_or(StoreError::ConversationNotFound(id))
    }

    pub fn get_conversation(&self, id: i64) -> StoreResult<Option<Conversation>> {
        self.with_retry(|conn| {
            conn.query_row(
                "SELECT c.id, c.title, c.mode, c.model_nickname, c.created_at, c.last_activity,
                        c.is_active,
                        (SELECT COUNT(*) FROM message m
                          WHERE m.conversation_id = c.id AND m.role != 'system')
                 FROM conversation c WHERE c.id = ?",
                params![id],
                row_to_conversation,
            )
            .optional()
        })
    }

    pub fn list_active(&self) -> StoreResult<Vec<Conversation>> {
        self.list_where("WHERE c.is_active = 1")
    }

    pub fn list_all(&self) -> StoreResult<Vec<Conversation>> {
        self.list_where("")
    }

    fn list_where(&self, filter: &str) -> StoreResult<Vec<Conversation>> {
        let sql = format!(
            "SELECT c.id, c.title, c.mode, c.model_nickname, c.created_at, c.last_activity,
                    c.is_active,
                    (SELECT COUNT(*) FROM message m
                      WHERE m.conversation_id = c.id AND m.role != 'system')
             FROM conversation c {} ORDER BY c.last_activity DESC",
            filter
        );
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_conversation)?;
            rows.collect()
        })
    }

    /// Case-insensitive substring search over titles, falling back to message
    /// content; ordered by last activity, newest first
    pub fn search_conversations(&self, query: &str) -> StoreResult<Vec<Conversation>> {
        let pattern = format!("%{}%", query.to_lowercase());
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT c.id, c.title, c.mode, c.model_nickname, c.created_at,
                        c.last_activity, c.is_active,
                        (SELECT COUNT(*) FROM message m
                          WHERE m.conversation_id = c.id AND m.role != 'system')
                 FROM conversation c
                 LEFT JOIN message msg ON msg.conversation_id = c.id
                 WHERE LOWER(c.title) LIKE ?1 OR LOWER(msg.content) LIKE ?1
                 ORDER BY c.last_activity DESC",
            )?;
            let rows = stmt.query_map(params![pattern], row_to_conversation)?;
            rows.collect()
        })
    }

    pub fn archive(&self, id: i64) -> StoreResult<bool> {
        self.set_active(id, false)
    }

    pub fn unarchive(&self, id: i64) -> StoreResult<bool> {
        self.set_active(id, true)
    }

    fn set_active(&self, id: i64, active: bool) -> StoreResult<bool> {
        let changed = self.with_retry(move |conn| {
            conn.execute(
                "UPDATE conversation SET is_active = ? WHERE id = ?",
                params![active, id],
            )
        })?;
        Ok(changed > 0)
    }

    pub fn update_conversation_mode(&self, id: i64, mode: ConversationMode) -> StoreResult<bool> {
        let changed = self.with_retry(move |conn| {
            conn.execute(
                "UPDATE conversation SET mode = ?, last_activity = ? WHERE id = ?",
                params![mode.as_str(), Utc::now().to_rfc3339(), id],
            )
        })?;
        Ok(changed > 0)
    }

    pub fn update_conversation_model(&self, id: i64, nickname: &str) -> StoreResult<bool> {
        let nickname = nickname.to_string();
        let changed = self.with_retry(move |conn| {
            conn.execute(
                "UPDATE conversation SET model_nickname = ?, last_activity = ? WHERE id = ?",
                params![nickname, Utc::now().to_rfc3339(), id],
            )
        })?;
        Ok(changed > 0)
    }

    // ── Messages ───────────────────────────────────────────────────────────

    /// Append a message; the store assigns the next contiguous sequence
    pub fn append_message(
        &self,
        conversation_id: i64,
        message: &ChatMessage,
    ) -> StoreResult<StoredMessage> {
        let msg = message.clone();
        let now = Utc::now();
        let (id, sequence) = self.with_retry(move |conn| {
            let tx = conn.transaction()?;

            let sequence: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM message WHERE conversation_id = ?",
                params![conversation_id],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO message (conversation_id, role, content, tool_call_id, thinking,
                                      thinking_encrypted, sequence, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    conversation_id,
                    msg.role.as_str(),
                    msg.content,
                    msg.tool_call_id,
                    msg.thinking,
                    msg.thinking_encrypted,
                    sequence,
                    now.to_rfc3339(),
                ],
            )?;
            let message_id = tx.last_insert_rowid();

            for (position, call) in msg.tool_calls.iter().enumerate() {
                tx.execute(
                    "INSERT INTO tool_call (message_id, call_id, name, arguments, position)
                     VALUES (?, ?, ?, ?, ?)",
                    params![message_id, call.id, call.name, call.arguments, position as i64],
                )?;
            }

            tx.execute(
                "UPDATE conversation SET last_activity = ? WHERE id = ?",
                params![now.to_rfc3339(), conversation_id],
            )?;

            tx.commit()?;
            Ok((message_id, sequence))
        })?;

        Ok(StoredMessage {
            id,
            conversation_id,
            role: message.role,
            content: message.content.clone(),
            tool_calls: message.tool_calls.clone(),
            tool_call_id: message.tool_call_id.clone(),
            thinking: message.thinking.clone(),
            thinking_encrypted: message.thinking_encrypted,
            sequence,
            created_at: now,
        })
    }

    /// All messages of a conversation in sequence order
    pub fn get_messages(&self, conversation_id: i64) -> StoreResult<Vec<StoredMessage>> {
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, role, content, tool_call_id, thinking,
                        thinking_encrypted, sequence, created_at
                 FROM message WHERE conversation_id = ? ORDER BY sequence ASC",
            )?;
            let mut messages: Vec<StoredMessage> = stmt
                .query_map(params![conversation_id], row_to_message)?
                .collect::<rusqlite::Result<_>>()?;

            let mut call_stmt = conn.prepare(
                "SELECT message_id, call_id, name, arguments FROM tool_call
                 WHERE message_id IN (SELECT id FROM message WHERE conversation_id = ?)
                 ORDER BY position ASC",
            )?;
            let calls = call_stmt.query_map(params![conversation_id], |row| {
                let message_id: i64 = row.get(0)?;
                Ok((
                    message_id,
                    ToolCall {
                        id: row.get(1)?,
                        name: row.get(2)?,
                        arguments: row.get(3)?,
                    },
                ))
            })?;

            let mut by_message: std::collections::HashMap<i64, Vec<ToolCall>> =
                std::collections::HashMap::new();
            for entry in calls {
                let (message_id, call) = entry?;
                by_message.entry(message_id).or_default().push(call);
            }
            for message in &mut messages {
                if let Some(calls) = by_message.remove(&message.id) {
                    message.tool_calls = calls;
                }
            }
            Ok(messages)
        })
    }

    /// Most recent distinct user prompts, newest first
    pub fn get_recent_prompts(&self, limit: usize) -> StoreResult<Vec<String>> {
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT content FROM message
                 WHERE role = 'user' AND content != ''
                 GROUP BY content ORDER BY MAX(id) DESC LIMIT ?",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| row.get(0))?;
            rows.collect()
        })
    }

    // ── Token usage ────────────────────────────────────────────────────────

    /// Record one append-only usage row; corrections are new rows
    #[allow(clippy::too_many_arguments)]
    pub fn record_token_usage(
        &self,
        conversation_id: i64,
        message_id: Option<i64>,
        model_nickname: &str,
        usage: UsageData,
        input_cost: f64,
        output_cost: f64,
        reasoning_cost: f64,
    ) -> StoreResult<i64> {
        let nickname = model_nickname.to_string();
        let now = Utc::now();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT INTO model_token_usage
                   (conversation_id, message_id, model_nickname, input_tokens, output_tokens,
                    reasoning_tokens, input_cost, output_cost, reasoning_cost, timestamp)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    conversation_id,
                    message_id,
                    nickname,
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                    usage.reasoning_tokens as i64,
                    input_cost,
                    output_cost,
                    reasoning_cost,
                    now.to_rfc3339(),
                ],
            )?;
            let row_id = conn.last_insert_rowid();
            if usage.reasoning_tokens > 0 {
                conn.execute(
                    "INSERT INTO conversation_thinking_token
                       (conversation_id, message_id, tokens, timestamp)
                     VALUES (?, ?, ?, ?)",
                    params![
                        conversation_id,
                        message_id,
                        usage.reasoning_tokens as i64,
                        now.to_rfc3339()
                    ],
                )?;
            }
            Ok(row_id)
        })
    }

    /// Raw usage rows for one conversation, oldest first
    pub fn get_usage_rows(&self, conversation_id: i64) -> StoreResult<Vec<TokenUsageRow>> {
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, message_id, model_nickname, input_tokens,
                        output_tokens, reasoning_tokens, input_cost, output_cost,
                        reasoning_cost, timestamp
                 FROM model_token_usage WHERE conversation_id = ? ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![conversation_id], |row| {
                let timestamp: String = row.get(10)?;
                Ok(TokenUsageRow {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    message_id: row.get(2)?,
                    model_nickname: row.get(3)?,
                    input_tokens: row.get(4)?,
                    output_tokens: row.get(5)?,
                    reasoning_tokens: row.get(6)?,
                    input_cost: row.get(7)?,
                    output_cost: row.get(8)?,
                    reasoning_cost: row.get(9)?,
                    timestamp: parse_timestamp(timestamp),
                })
            })?;
            rows.collect()
        })
    }

    /// Per-model cost table for one conversation, plus a grand total
    pub fn get_conversation_cost_detailed(
        &self,
        conversation_id: i64,
    ) -> StoreResult<CostBreakdown> {
        self.cost_grouped(
            "WHERE conversation_id = ?",
            params![conversation_id].to_vec(),
        )
    }

    /// Cost across all conversations since `since` (session cost)
    pub fn get_cost_since(&self, since: DateTime<Utc>) -> StoreResult<CostBreakdown> {
        let ts = since.to_rfc3339();
        self.cost_grouped("WHERE timestamp >= ?", params![ts].to_vec())
    }

    fn cost_grouped(
        &self,
        filter: &str,
        bound: Vec<&dyn rusqlite::ToSql>,
    ) -> StoreResult<CostBreakdown> {
        let sql = format!(
            "SELECT model_nickname, SUM(input_tokens), SUM(output_tokens), SUM(reasoning_tokens),
                    SUM(input_cost), SUM(output_cost), SUM(reasoning_cost)
             FROM model_token_usage {} GROUP BY model_nickname ORDER BY model_nickname",
            filter
        );
        let rows = self.with_retry(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(&bound[..], |row| {
                Ok(ModelCostRow {
                    model_nickname: row.get(0)?,
                    input_tokens: row.get(1)?,
                    output_tokens: row.get(2)?,
                    reasoning_tokens: row.get(3)?,
                    input_cost: row.get(4)?,
                    output_cost: row.get(5)?,
                    reasoning_cost: row.get(6)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(CostBreakdown::from_rows(rows))
    }

    // ── Plan-mode created files ────────────────────────────────────────────

    pub fn add_created_file(&self, conversation_id: i64, path: &str) -> StoreResult<()> {
        let path = path.to_string();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO conversation_created_files (conversation_id, path)
                 VALUES (?, ?)",
                params![conversation_id, path],
            )?;
            Ok(())
        })
    }

    pub fn is_created_file(&self, conversation_id: i64, path: &str) -> StoreResult<bool> {
        let path = path.to_string();
        self.with_retry(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM conversation_created_files
                 WHERE conversation_id = ? AND path = ?",
                params![conversation_id, path],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    pub fn created_files(&self, conversation_id: i64) -> StoreResult<Vec<String>> {
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT path FROM conversation_created_files
                 WHERE conversation_id = ? ORDER BY path",
            )?;
            let rows = stmt.query_map(params![conversation_id], |row| row.get(0))?;
            rows.collect()
        })
    }
}

fn is_locked(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::DatabaseBusy
                || err.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn parse_timestamp(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let mode_raw: String = row.get(2)?;
    let created_at: String = row.get(4)?;
    let last_activity: String = row.get(5)?;
    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        mode: ConversationMode::parse(&mode_raw).unwrap_or(ConversationMode::Code),
        model_nickname: row.get(3)?,
        created_at: parse_timestamp(created_at),
        last_activity: parse_timestamp(last_activity),
        is_active: row.get(6)?,
        message_count: row.get(7)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role_raw: String = row.get(2)?;
    let created_at: String = row.get(8)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: MessageRole::parse(&role_raw).unwrap_or(MessageRole::User),
        content: row.get(3)?,
        tool_calls: Vec::new(),
        tool_call_id: row.get(4)?,
        thinking: row.get(5)?,
        thinking_encrypted: row.get(6)?,
        sequence: row.get(7)?,
        created_at: parse_timestamp(created_at),
    })
}

fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS conversation (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            mode TEXT NOT NULL,
            model_nickname TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_activity TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS message (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            tool_call_id TEXT,
            thinking TEXT,
            thinking_encrypted INTEGER NOT NULL DEFAULT 0,
            sequence INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(conversation_id) REFERENCES conversation(id),
            UNIQUE(conversation_id, sequence)
        );
        CREATE INDEX IF NOT EXISTS idx_message_conv_seq
            ON message(conversation_id, sequence);

        CREATE TABLE IF NOT EXISTS tool_call (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id INTEGER NOT NULL,
            call_id TEXT NOT NULL,
            name TEXT NOT NULL,
            arguments TEXT NOT NULL,
            position INTEGER NOT NULL,
            FOREIGN KEY(message_id) REFERENCES message(id)
        );

        CREATE TABLE IF NOT EXISTS model_token_usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL,
            message_id INTEGER,
            model_nickname TEXT NOT NULL,
            input_tokens INTEGER NOT NULL,
            output_tokens INTEGER NOT NULL,
            reasoning_tokens INTEGER NOT NULL DEFAULT 0,
            input_cost REAL NOT NULL DEFAULT 0,
            output_cost REAL NOT NULL DEFAULT 0,
            reasoning_cost REAL NOT NULL DEFAULT 0,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_conv_ts
            ON model_token_usage(conversation_id, timestamp);

        CREATE TABLE IF NOT EXISTS conversation_thinking_token (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL,
            message_id INTEGER,
            tokens INTEGER NOT NULL,
            timestamp TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversation_created_files (
            conversation_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            UNIQUE(conversation_id, path)
        );
        "#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> ConversationStore {
        ConversationStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_and_get_conversation() {
        let store = store();
        let conv = store
            .create_conversation("First", ConversationMode::Code, "gpt4o")
            .unwrap();
        assert_eq!(conv.title, "First");
        assert_eq!(conv.mode, ConversationMode::Code);
        assert_eq!(conv.message_count, 0);
        assert!(conv.is_active);

        let loaded = store.get_conversation(conv.id).unwrap().unwrap();
        assert_eq!(loaded.id, conv.id);
    }

    #[test]
    fn test_sequences_are_contiguous_from_one() {
        let store = store();
        let conv = store
            .create_conversation("seq", ConversationMode::Code, "gpt4o")
            .unwrap();

        for i in 0..4 {
            store
                .append_message(conv.id, &ChatMessage::user(format!("msg {}", i)))
                .unwrap();
        }

        let messages = store.get_messages(conv.id).unwrap();
        let sequences: Vec<i64> = messages.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
        assert!(messages.iter().all(|m| m.conversation_id == conv.id));
    }

    #[test]
    fn test_message_count_excludes_system() {
        let store = store();
        let conv = store
            .create_conversation("count", ConversationMode::Code, "gpt4o")
            .unwrap();
        store
            .append_message(conv.id, &ChatMessage::system("prompt"))
            .unwrap();
        store
            .append_message(conv.id, &ChatMessage::user("hi"))
            .unwrap();
        store
            .append_message(conv.id, &ChatMessage::assistant("Hello!"))
            .unwrap();

        let loaded = store.get_conversation(conv.id).unwrap().unwrap();
        assert_eq!(loaded.message_count, 2);
    }

    #[test]
    fn test_tool_calls_round_trip_in_order() {
        let store = store();
        let conv = store
            .create_conversation("tools", ConversationMode::Code, "gpt4o")
            .unwrap();

        let mut assistant = ChatMessage::assistant("");
        assistant.tool_calls = vec![
            ToolCall {
                id: "call_a".into(),
                name: "list".into(),
                arguments: "{\"path\":\".\"}".into(),
            },
            ToolCall {
                id: "call_b".into(),
                name: "read".into(),
                arguments: "{\"path\":\"a\"}".into(),
            },
        ];
        store.append_message(conv.id, &assistant).unwrap();
        store
            .append_message(conv.id, &ChatMessage::tool_result("call_a", "{}"))
            .unwrap();
        store
            .append_message(conv.id, &ChatMessage::tool_result("call_b", "{}"))
            .unwrap();

        let messages = store.get_messages(conv.id).unwrap();
        assert_eq!(messages[0].tool_calls.len(), 2);
        assert_eq!(messages[0].tool_calls[0].id, "call_a");
        assert_eq!(messages[0].tool_calls[1].id, "call_b");
        // Tool results follow the assistant message in call order
        assert_eq!(messages[1].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_b"));
    }

    #[test]
    fn test_archive_unarchive_round_trip() {
        let store = store();
        let conv = store
            .create_conversation("arch", ConversationMode::Code, "gpt4o")
            .unwrap();
        store.append_message(conv.id, &ChatMessage::user("hi")).unwrap();

        assert!(store.archive(conv.id).unwrap());
        assert!(!store.get_conversation(conv.id).unwrap().unwrap().is_active);
        assert!(store.list_active().unwrap().is_empty());

        assert!(store.unarchive(conv.id).unwrap());
        let restored = store.get_conversation(conv.id).unwrap().unwrap();
        assert!(restored.is_active);
        // Messages untouched by the archive cycle
        assert_eq!(store.get_messages(conv.id).unwrap().len(), 1);
    }

    #[test]
    fn test_search_matches_title_and_content() {
        let store = store();
        let by_title = store
            .create_conversation("Rust borrow checker", ConversationMode::Code, "gpt4o")
            .unwrap();
        let by_content = store
            .create_conversation("untitled", ConversationMode::Code, "gpt4o")
            .unwrap();
        store
            .append_message(by_content.id, &ChatMessage::user("explain the BORROW rules"))
            .unwrap();
        store
            .create_conversation("unrelated", ConversationMode::Code, "gpt4o")
            .unwrap();

        let hits = store.search_conversations("borrow").unwrap();
        let ids: Vec<i64> = hits.iter().map(|c| c.id).collect();
        assert!(ids.contains(&by_title.id));
        assert!(ids.contains(&by_content.id));
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_cost_breakdown_groups_by_model() {
        let store = store();
        let conv = store
            .create_conversation("cost", ConversationMode::Code, "gpt4o")
            .unwrap();
        let usage = UsageData {
            input_tokens: 100,
            output_tokens: 50,
            reasoning_tokens: 0,
            estimated: false,
        };
        store
            .record_token_usage(conv.id, None, "gpt4o", usage, 0.01, 0.02, 0.0)
            .unwrap();
        store
            .record_token_usage(conv.id, None, "gpt4o", usage, 0.01, 0.02, 0.0)
            .unwrap();
        store
            .record_token_usage(conv.id, None, "fast", usage, 0.001, 0.002, 0.0)
            .unwrap();

        let breakdown = store.get_conversation_cost_detailed(conv.id).unwrap();
        assert_eq!(breakdown.rows.len(), 2);
        let gpt = breakdown
            .rows
            .iter()
            .find(|r| r.model_nickname == "gpt4o")
            .unwrap();
        assert_eq!(gpt.input_tokens, 200);
        assert!((breakdown.total.total_cost() - 0.063).abs() < 1e-9);
    }

    #[test]
    fn test_session_cost_filters_by_timestamp() {
        let store = store();
        let conv = store
            .create_conversation("sess", ConversationMode::Code, "gpt4o")
            .unwrap();
        let usage = UsageData {
            input_tokens: 10,
            output_tokens: 5,
            reasoning_tokens: 0,
            estimated: false,
        };
        store
            .record_token_usage(conv.id, None, "gpt4o", usage, 0.0, 0.0, 0.0)
            .unwrap();

        let past = Utc::now() - chrono::Duration::hours(1);
        let future = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(store.get_cost_since(past).unwrap().rows.len(), 1);
        assert!(store.get_cost_since(future).unwrap().rows.is_empty());
    }

    #[test]
    fn test_reasoning_tokens_recorded_separately() {
        let store = store();
        let conv = store
            .create_conversation("think", ConversationMode::Code, "r1")
            .unwrap();
        let usage = UsageData {
            input_tokens: 10,
            output_tokens: 5,
            reasoning_tokens: 42,
            estimated: false,
        };
        store
            .record_token_usage(conv.id, None, "r1", usage, 0.0, 0.0, 0.003)
            .unwrap();

        let breakdown = store.get_conversation_cost_detailed(conv.id).unwrap();
        assert_eq!(breakdown.total.reasoning_tokens, 42);
        assert!((breakdown.total.reasoning_cost - 0.003).abs() < 1e-12);
    }

    #[test]
    fn test_created_files_survive_mode_switches() {
        let store = store();
        let conv = store
            .create_conversation("plan", ConversationMode::Plan, "gpt4o")
            .unwrap();

        store.add_created_file(conv.id, "notes.md").unwrap();
        assert!(store.is_created_file(conv.id, "notes.md").unwrap());
        assert!(!store.is_created_file(conv.id, "README.md").unwrap());

        store
            .update_conversation_mode(conv.id, ConversationMode::Code)
            .unwrap();
        store
            .update_conversation_mode(conv.id, ConversationMode::Plan)
            .unwrap();
        // The set is bound to the conversation, not the mode transition
        assert_eq!(store.created_files(conv.id).unwrap(), vec!["notes.md"]);
    }

    #[test]
    fn test_created_files_insert_is_idempotent() {
        let store = store();
        let conv = store
            .create_conversation("plan", ConversationMode::Plan, "gpt4o")
            .unwrap();
        store.add_created_file(conv.id, "a.txt").unwrap();
        store.add_created_file(conv.id, "a.txt").unwrap();
        assert_eq!(store.created_files(conv.id).unwrap().len(), 1);
    }

    #[test]
    fn test_update_model_keeps_history_in_usage_rows() {
        let store = store();
        let conv = store
            .create_conversation("switch", ConversationMode::Code, "gpt4o")
            .unwrap();
        let usage = UsageData {
            input_tokens: 1,
            output_tokens: 1,
            reasoning_tokens: 0,
            estimated: false,
        };
        store
            .record_token_usage(conv.id, None, "gpt4o", usage, 0.0, 0.0, 0.0)
            .unwrap();
        store.update_conversation_model(conv.id, "fast").unwrap();
        store
            .record_token_usage(conv.id, None, "fast", usage, 0.0, 0.0, 0.0)
            .unwrap();

        let conv = store.get_conversation(conv.id).unwrap().unwrap();
        assert_eq!(conv.model_nickname, "fast");
        // Rows retain the nickname active when they were produced
        let rows = store.get_usage_rows(conv.id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].model_nickname, "gpt4o");
        assert_eq!(rows[1].model_nickname, "fast");
    }

    #[test]
    fn test_recent_prompts_newest_first_distinct() {
        let store = store();
        let conv = store
            .create_conversation("hist", ConversationMode::Code, "gpt4o")
            .unwrap();
        for text in ["one", "two", "one", "three"] {
            store
                .append_message(conv.id, &ChatMessage::user(text))
                .unwrap();
        }
        let prompts = store.get_recent_prompts(10).unwrap();
        assert_eq!(prompts, vec!["three", "one", "two"]);
    }
}
