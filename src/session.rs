//! Per-user chat-session persistence.
//!
//! Sessions tie a user to a collection; turns are the append-only log of
//! question/answer exchanges within a session. No turn is ever edited or
//! removed individually — only whole-session deletion is supported.
//!
//! `append_turn` assigns the next `sequence_index` and inserts in a single
//! SQL statement, so concurrent appends to the same session are serialized
//! by SQLite's writer lock and the `(session_id, sequence_index)` primary
//! key; interleaved writers can never produce a gap or a duplicate index.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::EngineError;
use crate::models::{ChatSession, Turn};

pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the session if it does not exist yet. Sessions are created
    /// lazily on the first question; re-registering an existing session is
    /// a no-op.
    pub async fn ensure_session(
        &self,
        session_id: &str,
        user_id: &str,
        collection_id: &str,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, user_id, collection_id, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(session_id) DO NOTHING
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(collection_id)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append a turn with the next sequence index and return it.
    pub async fn append_turn(
        &self,
        session_id: &str,
        question: &str,
        answer: &str,
        citations: &[String],
    ) -> Result<Turn, EngineError> {
        let citations_json = serde_json::to_string(citations)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let now = Utc::now().timestamp();

        // Index assignment and insert are one atomic statement.
        let row = sqlx::query(
            r#"
            INSERT INTO turns (session_id, sequence_index, question, answer, citations_json, created_at)
            SELECT ?1, COALESCE(MAX(sequence_index), -1) + 1, ?2, ?3, ?4, ?5
            FROM turns WHERE session_id = ?1
            RETURNING sequence_index
            "#,
        )
        .bind(session_id)
        .bind(question)
        .bind(answer)
        .bind(&citations_json)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(Turn {
            session_id: session_id.to_string(),
            sequence_index: row.get::<i64, _>(0),
            question: question.to_string(),
            answer: answer.to_string(),
            citations: citations.to_vec(),
            created_at: to_datetime(now),
        })
    }

    /// All turns of a session in creation order.
    pub async fn list_turns(&self, session_id: &str) -> Result<Vec<Turn>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, sequence_index, question, answer, citations_json, created_at
            FROM turns WHERE session_id = ? ORDER BY sequence_index ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| row_to_turn(&row)).collect()
    }

    /// All sessions of a user, newest first.
    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<ChatSession>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, user_id, collection_id, created_at
            FROM sessions WHERE user_id = ? ORDER BY created_at DESC, session_id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ChatSession {
                session_id: row.get(0),
                user_id: row.get(1),
                collection_id: row.get(2),
                created_at: to_datetime(row.get(3)),
            })
            .collect())
    }

    /// Remove a session and all its turns.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM turns WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn row_to_turn(row: &sqlx::sqlite::SqliteRow) -> Result<Turn, EngineError> {
    let citations_json: String = row.get(4);
    let citations: Vec<String> = serde_json::from_str(&citations_json)
        .map_err(|e| EngineError::Storage(format!("corrupt citations column: {}", e)))?;

    Ok(Turn {
        session_id: row.get(0),
        sequence_index: row.get(1),
        question: row.get(2),
        answer: row.get(3),
        citations,
        created_at: to_datetime(row.get(5)),
    })
}

fn to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
