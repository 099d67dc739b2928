//! Memory store
//!
//! Persistent structured facts per user and scope, SQLite-backed with
//! FTS5 relevance ranking. Adds reconcile against existing records
//! (model-assisted when a matcher is configured, token-overlap
//! heuristic otherwise); forgets match by semantic reference, not exact
//! string equality.

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::capability::CapabilityConfig;
use crate::model::{extract_json, ChatMessage, ModelInvoker};
use crate::rate_limit::RateLimiter;
use crate::scope::ScopeId;
use crate::tokenizer::TokenCounter;

/// A remembered fact.
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub id: String,
    pub owner_id: String,
    pub scope_id: String,
    pub content: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

/// Matcher confidence at or above which an add updates an existing
/// record instead of inserting a duplicate.
const MERGE_THRESHOLD: f64 = 0.8;
/// Heuristic overlap treated as a confident duplicate.
const HEURISTIC_MERGE_THRESHOLD: f64 = 0.6;
/// Relevance at or above which a forget removes a record.
const FORGET_THRESHOLD: f64 = 0.5;

/// How many recent records an add is reconciled against.
const RECONCILE_WINDOW: usize = 32;

/// Semantic matching between free-text facts. `None` means the matcher
/// is unavailable right now (budget exhausted, call failed) and the
/// caller should fall back to the heuristic.
#[async_trait]
pub trait MemoryMatcher: Send + Sync {
    /// How strongly `candidate` restates the fact in `existing`, 0..1.
    async fn overlap(&self, scope: &ScopeId, existing: &str, candidate: &str) -> Option<f64>;

    /// How relevant `record` is to a forget/query `reference`, 0..1.
    async fn relevance(&self, scope: &ScopeId, record: &str, reference: &str) -> Option<f64>;
}

/// Memory store with SQLite backend and optional semantic matcher.
pub struct MemoryStore {
    conn: Mutex<Connection>,
    matcher: Option<Arc<dyn MemoryMatcher>>,
}

impl MemoryStore {
    /// Open or create the memory database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            matcher: None,
        };
        store.init_schema()?;

        info!("memory store opened: {}", path.display());
        Ok(store)
    }

    /// Attach a semantic matcher (model-backed in production, a stub in
    /// tests).
    pub fn set_matcher(&mut self, matcher: Arc<dyn MemoryMatcher>) {
        self.matcher = Some(matcher);
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (unixepoch()),
                expires_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_memories_owner_scope
                ON memories(owner_id, scope_id, created_at DESC);

            CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
                content,
                content='memories',
                content_rowid='rowid'
            );

            -- Triggers to keep FTS in sync
            CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
                INSERT INTO memories_fts(rowid, content) VALUES (new.rowid, new.content);
            END;

            CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
                INSERT INTO memories_fts(memories_fts, rowid, content) VALUES('delete', old.rowid, old.content);
            END;

            CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
                INSERT INTO memories_fts(memories_fts, rowid, content) VALUES('delete', old.rowid, old.content);
                INSERT INTO memories_fts(rowid, content) VALUES (new.rowid, new.content);
            END;
            "#,
        )?;
        Ok(())
    }

    fn record_id(owner: &str, scope: &str, content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(owner.as_bytes());
        hasher.update(b"|");
        hasher.update(scope.as_bytes());
        hasher.update(b"|");
        hasher.update(content.as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    /// Append a fact, merging into an existing record when it restates
    /// one the store already holds.
    pub async fn add(&self, owner: &str, scope: &str, content: &str) -> Result<MemoryRecord> {
        self.add_with_expiry(owner, scope, content, None).await
    }

    pub async fn add_with_expiry(
        &self,
        owner: &str,
        scope: &str,
        content: &str,
        expires_at: Option<i64>,
    ) -> Result<MemoryRecord> {
        let existing = self.recent(owner, scope, RECONCILE_WINDOW)?;
        let match_scope = ScopeId::chat(scope);

        let mut best: Option<(f64, f64, MemoryRecord)> = None;
        for record in existing {
            let (score, threshold) = match &self.matcher {
                Some(matcher) => match matcher.overlap(&match_scope, &record.content, content).await {
                    Some(score) => (score, MERGE_THRESHOLD),
                    None => (token_overlap(&record.content, content), HEURISTIC_MERGE_THRESHOLD),
                },
                None => (token_overlap(&record.content, content), HEURISTIC_MERGE_THRESHOLD),
            };
            if best.as_ref().map_or(true, |(b, _, _)| score > *b) {
                best = Some((score, threshold, record));
            }
        }

        let now = chrono::Utc::now().timestamp();

        if let Some((score, threshold, record)) = best {
            if score >= threshold {
                let conn = self.conn.lock().unwrap();
                conn.execute(
                    "UPDATE memories SET content = ?1, created_at = ?2, expires_at = ?3 WHERE id = ?4",
                    params![content, now, expires_at, record.id],
                )?;
                debug!(id = %record.id, score, "merged into existing memory");
                return Ok(MemoryRecord {
                    content: content.to_string(),
                    created_at: now,
                    expires_at,
                    ..record
                });
            }
        }

        let id = Self::record_id(owner, scope, content);
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                r#"
                INSERT INTO memories (id, owner_id, scope_id, content, created_at, expires_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(id) DO UPDATE SET
                    created_at = excluded.created_at,
                    expires_at = excluded.expires_at
                "#,
                params![id, owner, scope, content, now, expires_at],
            )?;
        }

        debug!(id = %id, owner, scope, "memory added");
        Ok(MemoryRecord {
            id,
            owner_id: owner.to_string(),
            scope_id: scope.to_string(),
            content: content.to_string(),
            created_at: now,
            expires_at,
        })
    }

    /// Remove records matching `reference` by semantic relevance.
    /// Matching nothing is not an error; the count is 0.
    pub async fn forget(&self, owner: &str, scope: &str, reference: &str) -> Result<usize> {
        let mut candidates = self.search_fts(owner, scope, reference, 16)?;
        if candidates.is_empty() {
            // Relevance terms may not match FTS tokens; fall back to a
            // scan of the scope's records.
            candidates = self.recent(owner, scope, RECONCILE_WINDOW)?;
        }

        let match_scope = ScopeId::chat(scope);
        let mut doomed: Vec<String> = Vec::new();
        for record in candidates {
            let score = match &self.matcher {
                Some(matcher) => matcher
                    .relevance(&match_scope, &record.content, reference)
                    .await
                    .unwrap_or_else(|| reference_containment(&record.content, reference)),
                None => reference_containment(&record.content, reference),
            };
            if score >= FORGET_THRESHOLD {
                doomed.push(record.id);
            }
        }

        if doomed.is_empty() {
            debug!(owner, scope, reference, "forget matched no records");
            return Ok(0);
        }

        let conn = self.conn.lock().unwrap();
        let mut removed = 0;
        for id in &doomed {
            removed += conn.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        }
        info!(owner, scope, removed, "memories forgotten");
        Ok(removed)
    }

    /// Most relevant/recent records for prompt injection. With a hint,
    /// FTS-ranked matches come first and recency fills the remainder.
    /// Expired records are never returned.
    pub fn query(
        &self,
        owner: &str,
        scope: &str,
        hint: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let mut results = match hint {
            Some(hint) => self.search_fts(owner, scope, hint, limit)?,
            None => Vec::new(),
        };

        if results.len() < limit {
            for record in self.recent(owner, scope, limit)? {
                if results.len() >= limit {
                    break;
                }
                if !results.iter().any(|r| r.id == record.id) {
                    results.push(record);
                }
            }
        }

        Ok(results)
    }

    /// FTS5 search scoped to one owner, best match first.
    fn search_fts(
        &self,
        owner: &str,
        scope: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        // Quote terms so punctuation cannot break the FTS parser.
        let fts_query = query
            .split_whitespace()
            .map(|w| format!("\"{}\"", w.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR ");
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT m.id, m.owner_id, m.scope_id, m.content, m.created_at, m.expires_at
            FROM memories_fts
            JOIN memories m ON memories_fts.rowid = m.rowid
            WHERE memories_fts MATCH ?1
              AND m.owner_id = ?2 AND m.scope_id = ?3
              AND (m.expires_at IS NULL OR m.expires_at > ?4)
            ORDER BY bm25(memories_fts)
            LIMIT ?5
            "#,
        )?;

        let records = stmt
            .query_map(params![fts_query, owner, scope, now, limit], row_to_record)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(records)
    }

    /// Most recent live records for an owner/scope.
    fn recent(&self, owner: &str, scope: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, owner_id, scope_id, content, created_at, expires_at
            FROM memories
            WHERE owner_id = ?1 AND scope_id = ?2
              AND (expires_at IS NULL OR expires_at > ?3)
            ORDER BY created_at DESC
            LIMIT ?4
            "#,
        )?;

        let records = stmt
            .query_map(params![owner, scope, now, limit], row_to_record)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(records)
    }

    /// Delete records past their expiry.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM memories WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        if removed > 0 {
            info!(removed, "expired memories purged");
        }
        Ok(removed)
    }

    /// Live record count for an owner/scope.
    pub fn count(&self, owner: &str, scope: &str) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM memories
            WHERE owner_id = ?1 AND scope_id = ?2
              AND (expires_at IS NULL OR expires_at > ?3)
            "#,
            params![owner, scope, now],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    Ok(MemoryRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        scope_id: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
        expires_at: row.get(5)?,
    })
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Symmetric token overlap (Jaccard) between two facts.
fn token_overlap(a: &str, b: &str) -> f64 {
    let ta: std::collections::HashSet<_> = tokenize(a).into_iter().collect();
    let tb: std::collections::HashSet<_> = tokenize(b).into_iter().collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    shared as f64 / union as f64
}

/// Fraction of the reference's terms present in the record. Directional
/// on purpose: "forget my birthday" should hit "birthday is June 15".
fn reference_containment(record: &str, reference: &str) -> f64 {
    let record_tokens: std::collections::HashSet<_> = tokenize(record).into_iter().collect();
    let reference_tokens = tokenize(reference);
    if reference_tokens.is_empty() {
        return 0.0;
    }
    let hits = reference_tokens
        .iter()
        .filter(|t| record_tokens.contains(*t))
        .count();
    hits as f64 / reference_tokens.len() as f64
}

const OVERLAP_PROMPT: &str = "\
You compare two remembered facts about a chat participant. Respond with \
ONLY a JSON object: {\"score\": 0.0-1.0}, where 1.0 means the second \
fact restates or updates the first and 0.0 means they are unrelated.";

const RELEVANCE_PROMPT: &str = "\
You judge whether a remembered fact matches what a user asked to forget \
or look up. Respond with ONLY a JSON object: {\"score\": 0.0-1.0}, \
where 1.0 means the fact is exactly what was referenced.";

#[derive(serde::Deserialize)]
struct ScoreReply {
    score: f64,
}

/// Model-backed matcher over the `memory` capability. Carries its own
/// rate limiter so matcher traffic never eats the dialogue budget.
pub struct ModelMatcher {
    invoker: Arc<dyn ModelInvoker>,
    config: CapabilityConfig,
    limiter: RateLimiter,
    counter: TokenCounter,
}

impl ModelMatcher {
    pub fn new(
        invoker: Arc<dyn ModelInvoker>,
        config: CapabilityConfig,
        rate_limit_tokens: u64,
        rate_limit_window_secs: u64,
    ) -> Self {
        Self {
            invoker,
            config,
            limiter: RateLimiter::new(rate_limit_tokens, rate_limit_window_secs),
            counter: TokenCounter::new(),
        }
    }

    async fn score(&self, scope: &ScopeId, system: &str, user: String) -> Option<f64> {
        let estimate = self.counter.estimate_request(&user, self.config.max_tokens);
        if !self.limiter.reserve(scope, estimate) {
            debug!(scope = %scope, "memory matcher budget exhausted");
            return None;
        }

        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        match self.invoker.complete(&self.config, &messages).await {
            Ok(raw) => extract_json(&raw)
                .and_then(|json| serde_json::from_str::<ScoreReply>(&json).ok())
                .map(|reply| reply.score.clamp(0.0, 1.0)),
            Err(e) => {
                warn!("memory matcher call failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl MemoryMatcher for ModelMatcher {
    async fn overlap(&self, scope: &ScopeId, existing: &str, candidate: &str) -> Option<f64> {
        let user = format!("Fact A: {}\nFact B: {}", existing, candidate);
        self.score(scope, OVERLAP_PROMPT, user).await
    }

    async fn relevance(&self, scope: &ScopeId, record: &str, reference: &str) -> Option<f64> {
        let user = format!("Fact: {}\nReference: {}", record, reference);
        self.score(scope, RELEVANCE_PROMPT, user).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store(name: &str) -> (MemoryStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::open(&dir.path().join(format!("{}.db", name))).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn add_then_query_round_trip() {
        let (store, _dir) = temp_store("round_trip");

        store.add("u1", "g1", "birthday is June 15").await.unwrap();
        let records = store.query("u1", "g1", None, 10).unwrap();

        assert_eq!(records.len(), 1);
        assert!(records[0].content.contains("June 15"));
    }

    #[tokio::test]
    async fn forget_by_partial_reference() {
        let (store, _dir) = temp_store("forget");

        store.add("u1", "g1", "birthday is June 15").await.unwrap();
        store.add("u1", "g1", "favorite food is ramen").await.unwrap();

        let removed = store.forget("u1", "g1", "birthday").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count("u1", "g1").unwrap(), 1);
    }

    #[tokio::test]
    async fn forget_with_no_match_returns_zero() {
        let (store, _dir) = temp_store("forget_none");

        store.add("u1", "g1", "birthday is June 15").await.unwrap();
        let removed = store.forget("u1", "g1", "blockchain").await.unwrap();
        assert_eq!(removed, 0);
        assert_eq!(store.count("u1", "g1").unwrap(), 1);
    }

    #[tokio::test]
    async fn near_duplicate_merges_instead_of_inserting() {
        let (store, _dir) = temp_store("merge");

        store.add("u1", "g1", "birthday is June 15").await.unwrap();
        store.add("u1", "g1", "birthday is June 16").await.unwrap();

        assert_eq!(store.count("u1", "g1").unwrap(), 1);
        let records = store.query("u1", "g1", None, 10).unwrap();
        assert!(records[0].content.contains("June 16"));
    }

    #[tokio::test]
    async fn unrelated_facts_do_not_merge() {
        let (store, _dir) = temp_store("no_merge");

        store.add("u1", "g1", "birthday is June 15").await.unwrap();
        store.add("u1", "g1", "allergic to peanuts").await.unwrap();

        assert_eq!(store.count("u1", "g1").unwrap(), 2);
    }

    #[tokio::test]
    async fn owners_and_scopes_are_isolated() {
        let (store, _dir) = temp_store("isolation");

        store.add("u1", "g1", "fact one").await.unwrap();
        store.add("u2", "g1", "fact two").await.unwrap();
        store.add("u1", "g2", "fact three").await.unwrap();

        assert_eq!(store.count("u1", "g1").unwrap(), 1);
        assert_eq!(store.count("u2", "g1").unwrap(), 1);
        assert_eq!(store.count("u1", "g2").unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_records_are_invisible() {
        let (store, _dir) = temp_store("expiry");

        let past = chrono::Utc::now().timestamp() - 10;
        store
            .add_with_expiry("u1", "g1", "temporary note", Some(past))
            .await
            .unwrap();

        assert_eq!(store.count("u1", "g1").unwrap(), 0);
        assert!(store.query("u1", "g1", None, 10).unwrap().is_empty());
        assert_eq!(store.purge_expired().unwrap(), 1);
    }

    #[tokio::test]
    async fn query_hint_prefers_relevant_records() {
        let (store, _dir) = temp_store("hint");

        store.add("u1", "g1", "birthday is June 15").await.unwrap();
        store.add("u1", "g1", "works as a nurse").await.unwrap();
        store.add("u1", "g1", "favorite food is ramen").await.unwrap();

        let records = store.query("u1", "g1", Some("when is the birthday"), 2).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].content.contains("birthday"));
    }

    struct AlwaysMatcher(f64);

    #[async_trait]
    impl MemoryMatcher for AlwaysMatcher {
        async fn overlap(&self, _s: &ScopeId, _a: &str, _b: &str) -> Option<f64> {
            Some(self.0)
        }
        async fn relevance(&self, _s: &ScopeId, _a: &str, _b: &str) -> Option<f64> {
            Some(self.0)
        }
    }

    #[tokio::test]
    async fn matcher_verdict_drives_merge() {
        let (mut store, _dir) = temp_store("matcher_merge");
        store.set_matcher(Arc::new(AlwaysMatcher(0.95)));

        store.add("u1", "g1", "lives in Berlin").await.unwrap();
        // Heuristically unrelated, but the matcher says it's the same fact.
        store.add("u1", "g1", "moved to Munich").await.unwrap();

        assert_eq!(store.count("u1", "g1").unwrap(), 1);
    }

    #[tokio::test]
    async fn matcher_low_score_blocks_forget() {
        let (mut store, _dir) = temp_store("matcher_forget");
        store.set_matcher(Arc::new(AlwaysMatcher(0.1)));

        store.add("u1", "g1", "birthday is June 15").await.unwrap();
        let removed = store.forget("u1", "g1", "birthday").await.unwrap();
        assert_eq!(removed, 0);
    }

    struct ScoringInvoker(String);

    #[async_trait]
    impl crate::model::ModelInvoker for ScoringInvoker {
        async fn complete(
            &self,
            _cfg: &CapabilityConfig,
            _messages: &[ChatMessage],
        ) -> Result<String, crate::error::ModelError> {
            Ok(self.0.clone())
        }

        async fn describe_image(
            &self,
            _cfg: &CapabilityConfig,
            _image_base64: &str,
            _instruction: &str,
        ) -> Result<String, crate::error::ModelError> {
            Ok(String::new())
        }
    }

    fn memory_capability() -> CapabilityConfig {
        let base = crate::capability::CapabilitySection {
            base_url: "http://localhost".to_string(),
            ..Default::default()
        };
        crate::capability::resolve(
            crate::capability::CapabilityScope::Memory,
            &crate::capability::CapabilitySection::default(),
            &base,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn model_matcher_parses_score() {
        let matcher = ModelMatcher::new(
            Arc::new(ScoringInvoker(r#"{"score": 0.9}"#.to_string())),
            memory_capability(),
            100_000,
            60,
        );
        let scope = ScopeId::chat("g1");

        let score = matcher.overlap(&scope, "fact a", "fact b").await;
        assert_eq!(score, Some(0.9));
    }

    #[tokio::test]
    async fn model_matcher_degrades_when_budget_exhausted() {
        // Budget too small for even one call.
        let matcher = ModelMatcher::new(
            Arc::new(ScoringInvoker(r#"{"score": 0.9}"#.to_string())),
            memory_capability(),
            1,
            60,
        );
        let scope = ScopeId::chat("g1");

        assert_eq!(matcher.overlap(&scope, "fact a", "fact b").await, None);
    }

    #[tokio::test]
    async fn model_matcher_degrades_on_garbage_output() {
        let matcher = ModelMatcher::new(
            Arc::new(ScoringInvoker("not json at all".to_string())),
            memory_capability(),
            100_000,
            60,
        );
        let scope = ScopeId::chat("g1");

        assert_eq!(matcher.relevance(&scope, "fact", "reference").await, None);
    }

    #[test]
    fn heuristics_score_sensibly() {
        assert!(token_overlap("birthday is June 15", "birthday is June 16") > 0.5);
        assert!(token_overlap("birthday is June 15", "allergic to peanuts") < 0.2);
        assert_eq!(reference_containment("birthday is June 15", "birthday"), 1.0);
        assert_eq!(reference_containment("favorite food is ramen", "birthday"), 0.0);
    }
}
