//! Hunt database repository.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::types::Json;
use sqlx::SqlitePool;

use super::models::{HuntRecord, HuntStatus, Observation};

const SELECT_COLUMNS: &str = r#"
    id, session_id, asset_id, module_id, run_ai, status, started_at,
    ended_at, findings_count, error, ai_report_text
"#;

/// Repository for hunt persistence.
#[derive(Debug, Clone)]
pub struct HuntRepository {
    pool: SqlitePool,
}

impl HuntRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, hunt: &HuntRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hunts (id, session_id, asset_id, module_id, run_ai, status, started_at, findings_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&hunt.id)
        .bind(&hunt.session_id)
        .bind(&hunt.asset_id)
        .bind(&hunt.module_id)
        .bind(hunt.run_ai)
        .bind(hunt.status.to_string())
        .bind(&hunt.started_at)
        .bind(hunt.findings_count)
        .execute(&self.pool)
        .await
        .context("creating hunt")?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<HuntRecord>> {
        let hunt = sqlx::query_as::<_, HuntRecord>(&format!(
            "SELECT {SELECT_COLUMNS} FROM hunts WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching hunt")?;

        Ok(hunt)
    }

    pub async fn update_status(&self, id: &str, status: HuntStatus) -> Result<()> {
        sqlx::query("UPDATE hunts SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating hunt status")?;

        Ok(())
    }

    /// Close out a hunt: terminal status, end time, observations, counters.
    pub async fn finish(
        &self,
        id: &str,
        status: HuntStatus,
        findings_count: i64,
        observations: &[Observation],
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE hunts
            SET status = ?, ended_at = ?, findings_count = ?, observations = ?, error = ?
            WHERE id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(findings_count)
        .bind(Json(observations))
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("finishing hunt")?;

        Ok(())
    }

    pub async fn save_report(&self, id: &str, report_text: &str) -> Result<()> {
        sqlx::query("UPDATE hunts SET ai_report_text = ? WHERE id = ?")
            .bind(report_text)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("saving hunt ai report")?;

        Ok(())
    }

    pub async fn delete_report(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE hunts SET ai_report_text = NULL WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting hunt ai report")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn observations(&self, id: &str) -> Result<Vec<Observation>> {
        let row: Option<(Json<Vec<Observation>>,)> =
            sqlx::query_as("SELECT observations FROM hunts WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("fetching hunt observations")?;

        Ok(row.map(|(json,)| json.0).unwrap_or_default())
    }

    /// Hunts with a saved AI report for one session, newest first.
    pub async fn reports_for_session(&self, session_id: &str) -> Result<Vec<HuntRecord>> {
        let hunts = sqlx::query_as::<_, HuntRecord>(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM hunts
            WHERE session_id = ? AND ai_report_text IS NOT NULL
            ORDER BY started_at DESC
            "#
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("listing session reports")?;

        Ok(hunts)
    }

    /// Hunts with a saved AI report across all sessions of an asset.
    pub async fn reports_for_asset(&self, asset_id: &str) -> Result<Vec<HuntRecord>> {
        let hunts = sqlx::query_as::<_, HuntRecord>(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM hunts
            WHERE asset_id = ? AND ai_report_text IS NOT NULL
            ORDER BY started_at DESC
            "#
        ))
        .bind(asset_id)
        .fetch_all(&self.pool)
        .await
        .context("listing asset reports")?;

        Ok(hunts)
    }
}
