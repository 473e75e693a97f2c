//! Session database repository.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use super::models::{SessionMode, SessionRecord};
use super::state::SessionState;

const SELECT_COLUMNS: &str =
    "id, asset_id, analyst_id, state, mode, locked_by, created_at, terminated_at";

/// Repository for session persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, session: &SessionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, asset_id, analyst_id, state, mode, locked_by, created_at, terminated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.asset_id)
        .bind(&session.analyst_id)
        .bind(session.state.to_string())
        .bind(session.mode.to_string())
        .bind(&session.locked_by)
        .bind(&session.created_at)
        .bind(&session.terminated_at)
        .execute(&self.pool)
        .await
        .context("creating session")?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        let session = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SELECT_COLUMNS} FROM sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")?;

        Ok(session)
    }

    pub async fn list(&self) -> Result<Vec<SessionRecord>> {
        let sessions = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SELECT_COLUMNS} FROM sessions ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing sessions")?;

        Ok(sessions)
    }

    pub async fn update_state(&self, id: &str, state: SessionState) -> Result<()> {
        if state == SessionState::Terminated {
            sqlx::query("UPDATE sessions SET state = ?, terminated_at = ? WHERE id = ?")
                .bind(state.to_string())
                .bind(Utc::now().to_rfc3339())
                .bind(id)
                .execute(&self.pool)
                .await
                .context("updating session state")?;
        } else {
            sqlx::query("UPDATE sessions SET state = ? WHERE id = ?")
                .bind(state.to_string())
                .bind(id)
                .execute(&self.pool)
                .await
                .context("updating session state")?;
        }

        Ok(())
    }

    pub async fn update_mode(&self, id: &str, mode: SessionMode) -> Result<()> {
        sqlx::query("UPDATE sessions SET mode = ? WHERE id = ?")
            .bind(mode.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session mode")?;

        Ok(())
    }

    pub async fn update_lock(&self, id: &str, locked_by: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE sessions SET locked_by = ? WHERE id = ?")
            .bind(locked_by)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session lock")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn record(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            asset_id: "asset-1".into(),
            analyst_id: "alice".into(),
            state: SessionState::Initializing,
            mode: SessionMode::Ai,
            locked_by: None,
            created_at: Utc::now().to_rfc3339(),
            terminated_at: None,
        }
    }

    async fn seeded_pool() -> Database {
        let db = Database::in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO assets (id, hostname, created_at, updated_at) VALUES ('asset-1', 'h', '', '')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn create_and_update_state() {
        let db = seeded_pool().await;
        let repo = SessionRepository::new(db.pool().clone());

        repo.create(&record("s1")).await.unwrap();
        repo.update_state("s1", SessionState::Running).await.unwrap();

        let fetched = repo.get("s1").await.unwrap().unwrap();
        assert_eq!(fetched.state, SessionState::Running);
        assert!(fetched.terminated_at.is_none());

        repo.update_state("s1", SessionState::Terminated)
            .await
            .unwrap();
        let fetched = repo.get("s1").await.unwrap().unwrap();
        assert!(fetched.is_terminal());
        assert!(fetched.terminated_at.is_some());
    }

    #[tokio::test]
    async fn lock_round_trip() {
        let db = seeded_pool().await;
        let repo = SessionRepository::new(db.pool().clone());

        repo.create(&record("s1")).await.unwrap();
        repo.update_lock("s1", Some("alice")).await.unwrap();
        assert_eq!(
            repo.get("s1").await.unwrap().unwrap().locked_by.as_deref(),
            Some("alice")
        );
        repo.update_lock("s1", None).await.unwrap();
        assert!(repo.get("s1").await.unwrap().unwrap().locked_by.is_none());
    }
}
