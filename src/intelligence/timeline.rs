//! Per-asset append-only timeline.

use anyhow::{Context, Result};
use chrono::Utc;
use log::debug;
use sqlx::types::Json;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use super::models::TimelineEvent;
use crate::events::{EventBus, EventKind};

/// Records timeline events and announces them on the bus.
#[derive(Clone)]
pub struct TimelineRecorder {
    pool: SqlitePool,
    bus: Arc<EventBus>,
}

impl TimelineRecorder {
    pub fn new(pool: SqlitePool, bus: Arc<EventBus>) -> Self {
        Self { pool, bus }
    }

    /// Persist a timeline event and emit `timeline.event_recorded`.
    pub async fn record(
        &self,
        asset_id: &str,
        event_type: &str,
        analyst_id: &str,
        payload: serde_json::Value,
        session_id: Option<&str>,
    ) -> Result<String> {
        let event = TimelineEvent {
            id: Uuid::new_v4().to_string(),
            asset_id: asset_id.to_string(),
            session_id: session_id.map(str::to_string),
            event_type: event_type.to_string(),
            payload: Json(payload),
            occurred_at: Utc::now().to_rfc3339(),
            analyst_id: analyst_id.to_string(),
        };

        sqlx::query(
            r#"
            INSERT INTO timeline_events (id, asset_id, session_id, event_type, payload, occurred_at, analyst_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.asset_id)
        .bind(&event.session_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.occurred_at)
        .bind(&event.analyst_id)
        .execute(&self.pool)
        .await
        .context("recording timeline event")?;

        self.bus.publish(EventKind::TimelineEventRecorded {
            asset_id: event.asset_id.clone(),
            event_id: event.id.clone(),
            event_type_name: event.event_type.clone(),
        });

        debug!(
            "timeline event recorded: type={} asset={}",
            event.event_type, event.asset_id
        );
        Ok(event.id)
    }

    pub async fn list(&self, asset_id: &str, limit: i64) -> Result<Vec<TimelineEvent>> {
        let events = sqlx::query_as::<_, TimelineEvent>(
            r#"
            SELECT id, asset_id, session_id, event_type, payload, occurred_at, analyst_id
            FROM timeline_events
            WHERE asset_id = ?
            ORDER BY occurred_at DESC
            LIMIT ?
            "#,
        )
        .bind(asset_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing timeline events")?;

        Ok(events)
    }

    pub async fn clear(&self, asset_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM timeline_events WHERE asset_id = ?")
            .bind(asset_id)
            .execute(&self.pool)
            .await
            .context("clearing timeline")?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::events::Room;

    #[tokio::test]
    async fn record_list_clear() {
        let db = Database::in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO assets (id, hostname, created_at, updated_at) VALUES ('a1', 'h', '', '')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe_default(Room::Asset("a1".into()), "timeline");
        let recorder = TimelineRecorder::new(db.pool().clone(), bus.clone());

        recorder
            .record(
                "a1",
                "hunt.started",
                "alice",
                serde_json::json!({"hunt_id": "h1"}),
                Some("s1"),
            )
            .await
            .unwrap();

        let events = recorder.list("a1", 50).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "hunt.started");
        assert_eq!(events[0].payload.0["hunt_id"], "h1");

        match sub.try_recv().unwrap().kind {
            EventKind::TimelineEventRecorded {
                event_type_name, ..
            } => assert_eq!(event_type_name, "hunt.started"),
            other => panic!("unexpected event: {other:?}"),
        }

        assert_eq!(recorder.clear("a1").await.unwrap(), 1);
        assert!(recorder.list("a1", 50).await.unwrap().is_empty());
    }
}
