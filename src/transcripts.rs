//! Call transcript storage.
//!
//! Calls are ingested from JSON files of the form
//!
//! ```json
//! { "id": "call-42", "title": "Acme intro",
//!   "utterances": [ { "speaker": "Rep", "start_ms": 0, "end_ms": 4100, "text": "Hi!" } ] }
//! ```
//!
//! and loaded back by call id through [`TranscriptSource`].

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use scorecard_core::models::{Transcript, Utterance};

#[async_trait]
pub trait TranscriptSource: Send + Sync {
    async fn load(&self, call_id: &str) -> Result<Option<Transcript>>;
}

/// A call as read from an ingest file.
#[derive(Debug, Clone, Deserialize)]
pub struct CallFile {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub started_at: Option<i64>,
    pub utterances: Vec<Utterance>,
}

impl CallFile {
    pub fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let call: CallFile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse call file {}", path.display()))?;
        call.validate()?;
        Ok(call)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            bail!("call id must not be empty");
        }
        for (i, u) in self.utterances.iter().enumerate() {
            if u.end_ms < u.start_ms {
                bail!("utterance {} ends before it starts", i);
            }
        }
        Ok(())
    }

    pub fn transcript(&self) -> Transcript {
        Transcript::new(self.id.clone(), self.utterances.clone())
    }
}

/// Transcripts in SQLite (`calls` + `utterances`).
pub struct SqliteTranscripts {
    pool: SqlitePool,
}

impl SqliteTranscripts {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a call, replacing any previous utterances for the same id.
    pub async fn ingest(&self, call: &CallFile) -> Result<()> {
        call.validate()?;
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO calls (id, title, started_at, ingested_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                started_at = excluded.started_at,
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(&call.id)
        .bind(&call.title)
        .bind(call.started_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM utterances WHERE call_id = ?")
            .bind(&call.id)
            .execute(&mut *tx)
            .await?;

        for (seq, u) in call.utterances.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO utterances (call_id, seq, speaker, start_ms, end_ms, text)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&call.id)
            .bind(seq as i64)
            .bind(&u.speaker)
            .bind(u.start_ms as i64)
            .bind(u.end_ms as i64)
            .bind(&u.text)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Call ids with utterance counts, most recently ingested first.
    pub async fn list(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id AS id, COUNT(u.seq) AS n
            FROM calls c LEFT JOIN utterances u ON u.call_id = c.id
            GROUP BY c.id
            ORDER BY c.ingested_at DESC, c.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("id"), r.get("n")))
            .collect())
    }
}

#[async_trait]
impl TranscriptSource for SqliteTranscripts {
    async fn load(&self, call_id: &str) -> Result<Option<Transcript>> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM calls WHERE id = ?")
            .bind(call_id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Ok(None);
        }

        let rows = sqlx::query(
            r#"
            SELECT speaker, start_ms, end_ms, text
            FROM utterances
            WHERE call_id = ?
            ORDER BY seq
            "#,
        )
        .bind(call_id)
        .fetch_all(&self.pool)
        .await?;

        let utterances = rows
            .into_iter()
            .map(|r| {
                let start_ms: i64 = r.get("start_ms");
                let end_ms: i64 = r.get("end_ms");
                Utterance {
                    speaker: r.get("speaker"),
                    start_ms: start_ms.max(0) as u64,
                    end_ms: end_ms.max(0) as u64,
                    text: r.get("text"),
                }
            })
            .collect();

        Ok(Some(Transcript::new(call_id, utterances)))
    }
}

/// In-memory transcripts for tests and embedding.
#[derive(Default)]
pub struct MemoryTranscripts {
    calls: RwLock<HashMap<String, Transcript>>,
}

impl MemoryTranscripts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, transcript: Transcript) {
        self.calls
            .write()
            .unwrap()
            .insert(transcript.call_id.clone(), transcript);
    }
}

#[async_trait]
impl TranscriptSource for MemoryTranscripts {
    async fn load(&self, call_id: &str) -> Result<Option<Transcript>> {
        Ok(self.calls.read().unwrap().get(call_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    fn call(id: &str, texts: &[&str]) -> CallFile {
        CallFile {
            id: id.to_string(),
            title: Some("Intro".to_string()),
            started_at: None,
            utterances: texts
                .iter()
                .enumerate()
                .map(|(i, t)| Utterance {
                    speaker: "Rep".to_string(),
                    start_ms: i as u64 * 1000,
                    end_ms: i as u64 * 1000 + 500,
                    text: t.to_string(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_ingest_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = db::connect_path(&dir.path().join("t.sqlite")).await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        let store = SqliteTranscripts::new(pool);

        let c = call("call-1", &["hello", "how are you"]);
        store.ingest(&c).await.unwrap();
        assert_eq!(store.load("call-1").await.unwrap(), Some(c.transcript()));
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reingest_replaces_utterances() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = db::connect_path(&dir.path().join("t.sqlite")).await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        let store = SqliteTranscripts::new(pool);

        store.ingest(&call("c", &["a", "b", "c"])).await.unwrap();
        store.ingest(&call("c", &["only"])).await.unwrap();
        let t = store.load("c").await.unwrap().unwrap();
        assert_eq!(t.utterances.len(), 1);
        assert_eq!(store.list().await.unwrap(), vec![("c".to_string(), 1)]);
    }

    #[test]
    fn test_validate_rejects_bad_call() {
        let mut c = call("c", &["x"]);
        c.utterances[0].end_ms = 0;
        c.utterances[0].start_ms = 10;
        assert!(c.validate().is_err());
        assert!(call(" ", &[]).validate().is_err());
    }
}
