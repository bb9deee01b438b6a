//! Long-term memory: lessons and operator preferences that outlive a task.
//!
//! Every entry is a short piece of text with a category (`lesson`,
//! `preference`, ...) and free-form tags. Retrieval is keyword overlap
//! scored against content and tags; there are no embeddings.
//!
//! # Scoring
//!
//! Only the 100 most recent entries are candidates. For a lowercased query:
//!
//! | match | score |
//! |---|---|
//! | whole query is a substring of the content | +3.0 |
//! | query term equals a content term | +1.5 per term |
//! | query term is only a substring of the content | +0.5 per term |
//! | a tag is a substring of the query | +2.0 per tag |
//! | otherwise, tag terms shared with the query | +1.0 per shared term |
//!
//! Entries scoring zero are dropped. Ties keep the most recent first.
//!
//! # Example
//!
//! ```rust
//! use warden_memory::SqliteMemoryStore;
//! use warden_runtime::MemoryCapability;
//!
//! let store = SqliteMemoryStore::open_in_memory().unwrap();
//! store.save("lesson", "Compress logs before upload", &["logs".into()]).unwrap();
//! let hits = store.retrieve_relevant("upload the logs", 5).unwrap();
//! assert_eq!(hits, vec!["[lesson] Compress logs before upload".to_string()]);
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;
use warden_runtime::MemoryCapability;
use warden_types::WardenError;

use crate::error::StoreError;
use crate::task_store::{bad_column, timestamp};

const CANDIDATE_LIMIT: usize = 100;
const LESSON_CHARS: usize = 200;

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "to", "of", "in", "for", "on",
    "with", "at", "by", "from", "没有", "自己",
];

const LESSON_INDICATORS: &[&str] = &[
    "user prefers",
    "always",
    "never",
    "important to note",
    "lesson learned",
    "pattern",
    "remember that",
    "用户偏好",
    "总是",
    "不要",
    "重要",
    "经验",
    "规律",
];

/// A single stored memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub content: String,
    pub tags: Vec<String>,
    /// Task the entry was extracted from, if any.
    pub source_task: Option<Uuid>,
}

impl MemoryEntry {
    pub fn new(category: impl Into<String>, content: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            category: category.into(),
            content: content.into(),
            tags,
            source_task: None,
        }
    }

    /// Prompt form: `[category] content`.
    pub fn as_prompt_line(&self) -> String {
        format!("[{}] {}", self.category, self.content)
    }
}

fn terms(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| w.chars().count() >= 2 && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

fn score(entry: &MemoryEntry, query: &str, query_terms: &[String]) -> f64 {
    let content = entry.content.to_lowercase();
    let content_terms: HashSet<String> = terms(&content).into_iter().collect();
    let mut score = 0.0;

    if !query.is_empty() && content.contains(query) {
        score += 3.0;
    }
    for term in query_terms {
        if content_terms.contains(term) {
            score += 1.5;
        } else if content.contains(term.as_str()) {
            score += 0.5;
        }
    }
    for tag in &entry.tags {
        let tag = tag.to_lowercase();
        if tag.is_empty() {
            continue;
        }
        if query.contains(tag.as_str()) {
            score += 2.0;
        } else {
            let shared = terms(&tag)
                .into_iter()
                .collect::<HashSet<_>>()
                .into_iter()
                .filter(|t| query_terms.contains(t))
                .count();
            score += shared as f64;
        }
    }
    score
}

/// SQLite-backed [`MemoryCapability`].
pub struct SqliteMemoryStore {
    conn: Mutex<Connection>,
}

impl SqliteMemoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening memory store");
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS memories (
                id          TEXT NOT NULL PRIMARY KEY,
                timestamp   TEXT NOT NULL,
                category    TEXT NOT NULL,
                content     TEXT NOT NULL,
                tags        TEXT NOT NULL,
                source_task TEXT
            );",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Insert or replace `entry`.
    pub fn insert(&self, entry: &MemoryEntry) -> Result<(), StoreError> {
        let tags = serde_json::to_string(&entry.tags)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO memories (id, timestamp, category, content, tags, source_task)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.id.to_string(),
                timestamp(&entry.timestamp),
                entry.category,
                entry.content,
                tags,
                entry.source_task.map(|id| id.to_string()),
            ],
        )?;
        info!(category = %entry.category, content = %entry.content.chars().take(50).collect::<String>(), "memory saved");
        Ok(())
    }

    /// Remove one entry. Returns `false` when no entry had that id.
    pub fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let removed = self
            .conn()?
            .execute("DELETE FROM memories WHERE id = ?1", params![id.to_string()])?;
        Ok(removed > 0)
    }

    /// Every entry, most recent first.
    pub fn all_entries(&self) -> Result<Vec<MemoryEntry>, StoreError> {
        self.recent(None)
    }

    fn recent(&self, limit: Option<usize>) -> Result<Vec<MemoryEntry>, StoreError> {
        let conn = self.conn()?;
        let limit = limit.map_or(-1, |n| n as i64);
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, category, content, tags, source_task
             FROM memories ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_entry)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Entries scoring above zero for `query`, best first, at most `limit`.
    pub fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>, StoreError> {
        let query = query.to_lowercase();
        let query_terms = terms(&query);
        let mut scored: Vec<(f64, MemoryEntry)> = self
            .recent(Some(CANDIDATE_LIMIT))?
            .into_iter()
            .map(|entry| (score(&entry, &query, &query_terms), entry))
            .filter(|(s, _)| *s > 0.0)
            .collect();
        // Stable: equal scores stay most recent first.
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        debug!(query = %query, hits = scored.len(), "memory retrieval");
        Ok(scored.into_iter().take(limit).map(|(_, e)| e).collect())
    }

    /// Save a `lesson` when `response` reads like one. Returns the new entry.
    pub fn extract_lesson(
        &self,
        task_id: Uuid,
        response: &str,
        step_title: &str,
    ) -> Result<Option<MemoryEntry>, StoreError> {
        let lower = response.to_lowercase();
        if !LESSON_INDICATORS.iter().any(|i| lower.contains(i)) {
            return Ok(None);
        }
        let excerpt: String = response.chars().take(LESSON_CHARS).collect();
        let tags = if step_title.is_empty() {
            Vec::new()
        } else {
            vec![step_title.to_string()]
        };
        let mut entry = MemoryEntry::new("lesson", format!("From '{step_title}': {excerpt}"), tags);
        entry.source_task = Some(task_id);
        self.insert(&entry)?;
        Ok(Some(entry))
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let id: String = row.get(0)?;
    let ts: String = row.get(1)?;
    let tags: String = row.get(4)?;
    let source: Option<String> = row.get(5)?;
    Ok(MemoryEntry {
        id: Uuid::parse_str(&id).map_err(|e| bad_column(0, e.to_string()))?,
        timestamp: ts
            .parse()
            .map_err(|e: chrono::ParseError| bad_column(1, e.to_string()))?,
        category: row.get(2)?,
        content: row.get(3)?,
        tags: serde_json::from_str(&tags).map_err(|e| bad_column(4, e.to_string()))?,
        source_task: source
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| bad_column(5, e.to_string()))?,
    })
}

impl MemoryCapability for SqliteMemoryStore {
    fn retrieve_relevant(&self, query: &str, limit: usize) -> Result<Vec<String>, WardenError> {
        Ok(self
            .retrieve(query, limit)?
            .iter()
            .map(MemoryEntry::as_prompt_line)
            .collect())
    }

    fn save(&self, category: &str, content: &str, tags: &[String]) -> Result<(), WardenError> {
        Ok(self.insert(&MemoryEntry::new(category, content, tags.to_vec()))?)
    }

    fn extract(&self, task_id: Uuid, response: &str, step_title: &str) -> Result<(), WardenError> {
        self.extract_lesson(task_id, response, step_title)?;
        Ok(())
    }
}
