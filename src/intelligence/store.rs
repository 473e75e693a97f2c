//! Finding persistence with fingerprint-keyed upsert.

use anyhow::{Context, Result};
use chrono::Utc;
use log::info;
use sqlx::types::Json;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use uuid::Uuid;

use super::fingerprint;
use super::models::{Finding, FindingStatus, NewFinding};

const SELECT_COLUMNS: &str = r#"
    id, asset_id, session_id, hunt_id, kind, title, severity, confidence,
    status, fingerprint, sighting_count, first_seen, last_seen,
    tags, technique_ids, stix_bundle, remediation, evidence
"#;

/// Result of an upsert: the stored finding and whether it was new.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub finding: Finding,
    pub created: bool,
}

/// Store for intelligence findings.
#[derive(Debug, Clone)]
pub struct FindingStore {
    pool: SqlitePool,
}

impl FindingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a finding, or fold it into the existing record with the same
    /// `(asset_id, fingerprint)`: sighting count increments, `last_seen`
    /// advances, severity promotes to the max, tags merge as a set union,
    /// confidence keeps the max, remediation is overwritten with the latest.
    pub async fn upsert(&self, new: NewFinding) -> Result<UpsertOutcome> {
        let fp = fingerprint::compute(new.kind, &new.title, &new.technique_ids);
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await.context("starting upsert tx")?;

        let existing = sqlx::query_as::<_, Finding>(&format!(
            "SELECT {SELECT_COLUMNS} FROM findings WHERE asset_id = ? AND fingerprint = ?"
        ))
        .bind(&new.asset_id)
        .bind(&fp)
        .fetch_optional(&mut *tx)
        .await
        .context("looking up finding by fingerprint")?;

        if let Some(mut finding) = existing {
            finding.sighting_count += 1;
            finding.last_seen = now;
            finding.severity = finding.severity.max(new.severity);
            finding.confidence = finding.confidence.max(new.confidence);
            finding.remediation = new.remediation.map(Json);

            let merged: BTreeSet<String> = finding
                .tags
                .0
                .iter()
                .cloned()
                .chain(new.tags.iter().cloned())
                .collect();
            finding.tags = Json(merged.into_iter().collect());

            sqlx::query(
                r#"
                UPDATE findings SET
                    sighting_count = ?, last_seen = ?, severity = ?,
                    confidence = ?, tags = ?, remediation = ?
                WHERE id = ?
                "#,
            )
            .bind(finding.sighting_count)
            .bind(&finding.last_seen)
            .bind(finding.severity.to_string())
            .bind(finding.confidence)
            .bind(&finding.tags)
            .bind(&finding.remediation)
            .bind(&finding.id)
            .execute(&mut *tx)
            .await
            .context("updating finding sighting")?;

            tx.commit().await.context("committing upsert")?;
            info!(
                "finding dedup hit: id={} sightings={}",
                finding.id, finding.sighting_count
            );
            return Ok(UpsertOutcome {
                finding,
                created: false,
            });
        }

        let finding = Finding {
            id: Uuid::new_v4().to_string(),
            asset_id: new.asset_id,
            session_id: new.session_id,
            hunt_id: new.hunt_id,
            kind: new.kind,
            title: new.title,
            severity: new.severity,
            confidence: new.confidence,
            status: FindingStatus::Open,
            fingerprint: fp,
            sighting_count: 1,
            first_seen: now.clone(),
            last_seen: now,
            tags: Json(new.tags),
            technique_ids: Json(new.technique_ids),
            stix_bundle: new.stix_bundle.map(Json),
            remediation: new.remediation.map(Json),
            evidence: new.evidence,
        };

        sqlx::query(
            r#"
            INSERT INTO findings (
                id, asset_id, session_id, hunt_id, kind, title, severity,
                confidence, status, fingerprint, sighting_count, first_seen,
                last_seen, tags, technique_ids, stix_bundle, remediation, evidence
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&finding.id)
        .bind(&finding.asset_id)
        .bind(&finding.session_id)
        .bind(&finding.hunt_id)
        .bind(finding.kind.to_string())
        .bind(&finding.title)
        .bind(finding.severity.to_string())
        .bind(finding.confidence)
        .bind(finding.status.to_string())
        .bind(&finding.fingerprint)
        .bind(finding.sighting_count)
        .bind(&finding.first_seen)
        .bind(&finding.last_seen)
        .bind(&finding.tags)
        .bind(&finding.technique_ids)
        .bind(&finding.stix_bundle)
        .bind(&finding.remediation)
        .bind(&finding.evidence)
        .execute(&mut *tx)
        .await
        .context("inserting finding")?;

        tx.commit().await.context("committing upsert")?;
        info!(
            "new finding persisted: id={} severity={}",
            finding.id, finding.severity
        );
        Ok(UpsertOutcome {
            finding,
            created: true,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<Finding>> {
        let finding = sqlx::query_as::<_, Finding>(&format!(
            "SELECT {SELECT_COLUMNS} FROM findings WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching finding")?;

        Ok(finding)
    }

    pub async fn list(
        &self,
        asset_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<Vec<Finding>> {
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM findings WHERE 1=1");
        if asset_id.is_some() {
            sql.push_str(" AND asset_id = ?");
        }
        if session_id.is_some() {
            sql.push_str(" AND session_id = ?");
        }
        sql.push_str(" ORDER BY first_seen DESC");

        let mut query = sqlx::query_as::<_, Finding>(&sql);
        if let Some(asset_id) = asset_id {
            query = query.bind(asset_id);
        }
        if let Some(session_id) = session_id {
            query = query.bind(session_id);
        }

        let findings = query
            .fetch_all(&self.pool)
            .await
            .context("listing findings")?;

        Ok(findings)
    }

    pub async fn update_status(&self, id: &str, status: FindingStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE findings SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating finding status")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM findings WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting finding")?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::intelligence::models::{FindingKind, Severity};

    async fn store() -> FindingStore {
        let db = Database::in_memory().await.unwrap();
        for sql in [
            "INSERT INTO assets (id, hostname, created_at, updated_at) VALUES ('a1', 'h', '', '')",
            "INSERT INTO sessions (id, asset_id, analyst_id, created_at) VALUES ('s1', 'a1', 'alice', '')",
        ] {
            sqlx::query(sql).execute(db.pool()).await.unwrap();
        }
        FindingStore::new(db.pool().clone())
    }

    fn sample(severity: Severity, tags: Vec<String>) -> NewFinding {
        NewFinding {
            asset_id: "a1".into(),
            session_id: "s1".into(),
            hunt_id: None,
            kind: FindingKind::Detection,
            title: "Suspicious cron entry".into(),
            severity,
            confidence: 0.6,
            tags,
            technique_ids: vec!["T1053.003".into()],
            stix_bundle: None,
            remediation: None,
            evidence: "crontab output".into(),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_under_fingerprint() {
        let store = store().await;

        let first = store.upsert(sample(Severity::Medium, vec![])).await.unwrap();
        assert!(first.created);
        assert_eq!(first.finding.sighting_count, 1);

        for n in 2..=5_i64 {
            let outcome = store.upsert(sample(Severity::Medium, vec![])).await.unwrap();
            assert!(!outcome.created);
            assert_eq!(outcome.finding.sighting_count, n);
            assert_eq!(outcome.finding.id, first.finding.id);
        }

        assert_eq!(store.list(Some("a1"), None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn severity_promotes_monotonically() {
        let store = store().await;

        store.upsert(sample(Severity::High, vec![])).await.unwrap();
        let low = store.upsert(sample(Severity::Low, vec![])).await.unwrap();
        assert_eq!(low.finding.severity, Severity::High);

        let critical = store
            .upsert(sample(Severity::Critical, vec![]))
            .await
            .unwrap();
        assert_eq!(critical.finding.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn tags_merge_as_set_union() {
        let store = store().await;

        store
            .upsert(sample(Severity::Medium, vec!["cron".into(), "persistence".into()]))
            .await
            .unwrap();
        let merged = store
            .upsert(sample(Severity::Medium, vec!["cron".into(), "linux".into()]))
            .await
            .unwrap();

        let mut tags = merged.finding.tags.0.clone();
        tags.sort();
        assert_eq!(tags, vec!["cron", "linux", "persistence"]);

        // Re-applying the same tags leaves the set stable.
        let again = store
            .upsert(sample(Severity::Medium, vec!["linux".into()]))
            .await
            .unwrap();
        assert_eq!(again.finding.tags.0.len(), 3);
    }

    #[tokio::test]
    async fn status_and_delete() {
        let store = store().await;
        let outcome = store.upsert(sample(Severity::Medium, vec![])).await.unwrap();
        let id = outcome.finding.id;

        assert!(store
            .update_status(&id, FindingStatus::Acknowledged)
            .await
            .unwrap());
        assert_eq!(
            store.get(&id).await.unwrap().unwrap().status,
            FindingStatus::Acknowledged
        );

        assert!(store.delete(&id).await.unwrap());
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(!store.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn list_filters_by_session() {
        let store = store().await;
        store.upsert(sample(Severity::Medium, vec![])).await.unwrap();

        assert_eq!(store.list(None, Some("s1")).await.unwrap().len(), 1);
        assert_eq!(store.list(None, Some("s2")).await.unwrap().len(), 0);
    }
}
