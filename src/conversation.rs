//! Conversation window
//!
//! Rolling per-scope window of recent turns, used for intent context
//! and dialogue prompt assembly. Raw history, not semantic facts —
//! those live in the memory store.

use anyhow::Result;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Maximum turns kept per scope (rolling window)
const MAX_TURNS_PER_SCOPE: usize = 50;

/// Default TTL in seconds (7 days)
const DEFAULT_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

/// One turn of a conversation.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub sender: String,
    pub content: String,
    pub timestamp: i64,
}

/// Conversation store with SQLite backend.
pub struct ConversationStore {
    conn: Mutex<Connection>,
    max_turns: usize,
    ttl_seconds: i64,
}

impl ConversationStore {
    /// Open or create the conversation database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            max_turns: MAX_TURNS_PER_SCOPE,
            ttl_seconds: DEFAULT_TTL_SECONDS,
        };
        store.init_schema()?;

        info!("conversation store opened: {}", path.display());
        Ok(store)
    }

    /// Open with custom limits.
    pub fn open_with_config(path: &Path, max_turns: usize, ttl_seconds: i64) -> Result<Self> {
        let mut store = Self::open(path)?;
        store.max_turns = max_turns;
        store.ttl_seconds = ttl_seconds;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scope_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_turns_scope_time
                ON turns(scope_id, timestamp DESC);
            "#,
        )?;
        Ok(())
    }

    /// Record one turn and trim the scope's window.
    pub fn add_turn(&self, scope_id: &str, sender: &str, content: &str) -> Result<()> {
        // Milliseconds so rapid-fire messages keep their order.
        let timestamp = chrono::Utc::now().timestamp_millis();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO turns (scope_id, sender, content, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![scope_id, sender, content, timestamp],
        )?;

        conn.execute(
            "DELETE FROM turns
             WHERE scope_id = ?1 AND id NOT IN (
                 SELECT id FROM turns
                 WHERE scope_id = ?1
                 ORDER BY timestamp DESC
                 LIMIT ?2
             )",
            params![scope_id, self.max_turns],
        )?;

        debug!(scope_id, sender, "turn recorded");
        Ok(())
    }

    /// Recent turns, oldest first.
    pub fn recent_turns(&self, scope_id: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sender, content, timestamp FROM turns
             WHERE scope_id = ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;

        let mut turns: Vec<ConversationTurn> = stmt
            .query_map(params![scope_id, limit], |row| {
                Ok(ConversationTurn {
                    sender: row.get(0)?,
                    content: row.get(1)?,
                    timestamp: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        turns.reverse();
        Ok(turns)
    }

    /// Recent turns formatted for prompt injection.
    pub fn context_block(&self, scope_id: &str, limit: usize) -> Result<String> {
        let turns = self.recent_turns(scope_id, limit)?;
        if turns.is_empty() {
            return Ok(String::new());
        }

        let mut block = String::from("[Recent conversation:]\n");
        for turn in turns {
            let content = truncate_chars(&turn.content, 500);
            block.push_str(&format!("{}: {}\n", turn.sender, content));
        }
        Ok(block)
    }

    /// Drop a scope's history entirely.
    pub fn clear(&self, scope_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM turns WHERE scope_id = ?1", params![scope_id])?;
        info!(scope_id, rows, "conversation cleared");
        Ok(rows)
    }

    /// Remove turns older than the TTL.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp_millis() - self.ttl_seconds * 1000;
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM turns WHERE timestamp < ?1", params![cutoff])?;
        if rows > 0 {
            info!(rows, "expired conversation turns removed");
        }
        Ok(rows)
    }
}

/// Char-boundary-safe truncation for prompt blocks.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{}...", truncated)
}
