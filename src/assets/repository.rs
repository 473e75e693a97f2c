//! Asset database repository.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::types::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::{Asset, CreateAssetRequest, OsType, PatchAssetRequest};

const SELECT_COLUMNS: &str = r#"
    id, hostname, ip_address, os_type, os_version, ssh_port,
    ssh_username, ssh_password, ssh_key, pinned_fingerprint,
    sudo_method, sudo_password, tags, created_at, updated_at, last_seen
"#;

/// Repository for asset persistence.
#[derive(Debug, Clone)]
pub struct AssetRepository {
    pool: SqlitePool,
}

impl AssetRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, req: CreateAssetRequest) -> Result<Asset> {
        let now = Utc::now().to_rfc3339();
        let asset = Asset {
            id: Uuid::new_v4().to_string(),
            hostname: req.hostname,
            ip_address: req.ip_address,
            os_type: req.os_type,
            os_version: None,
            ssh_port: req.ssh_port,
            ssh_username: req.ssh_username,
            ssh_password: req.ssh_password,
            ssh_key: req.ssh_key,
            pinned_fingerprint: None,
            sudo_method: req.sudo_method,
            sudo_password: req.sudo_password,
            tags: Json(req.tags),
            created_at: now.clone(),
            updated_at: now,
            last_seen: None,
        };

        sqlx::query(
            r#"
            INSERT INTO assets (
                id, hostname, ip_address, os_type, os_version, ssh_port,
                ssh_username, ssh_password, ssh_key, pinned_fingerprint,
                sudo_method, sudo_password, tags, created_at, updated_at, last_seen
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&asset.id)
        .bind(&asset.hostname)
        .bind(&asset.ip_address)
        .bind(asset.os_type.to_string())
        .bind(&asset.os_version)
        .bind(asset.ssh_port)
        .bind(&asset.ssh_username)
        .bind(&asset.ssh_password)
        .bind(&asset.ssh_key)
        .bind(&asset.pinned_fingerprint)
        .bind(&asset.sudo_method)
        .bind(&asset.sudo_password)
        .bind(&asset.tags)
        .bind(&asset.created_at)
        .bind(&asset.updated_at)
        .bind(&asset.last_seen)
        .execute(&self.pool)
        .await
        .context("creating asset")?;

        Ok(asset)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Asset>> {
        let asset = sqlx::query_as::<_, Asset>(&format!(
            "SELECT {SELECT_COLUMNS} FROM assets WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching asset")?;

        Ok(asset)
    }

    pub async fn list(&self) -> Result<Vec<Asset>> {
        let assets = sqlx::query_as::<_, Asset>(&format!(
            "SELECT {SELECT_COLUMNS} FROM assets ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing assets")?;

        Ok(assets)
    }

    pub async fn patch(&self, id: &str, patch: PatchAssetRequest) -> Result<Option<Asset>> {
        let Some(mut asset) = self.get(id).await? else {
            return Ok(None);
        };

        if let Some(hostname) = patch.hostname {
            asset.hostname = hostname;
        }
        if let Some(ip) = patch.ip_address {
            asset.ip_address = Some(ip);
        }
        if let Some(os_type) = patch.os_type {
            asset.os_type = os_type;
        }
        if let Some(port) = patch.ssh_port {
            asset.ssh_port = port;
        }
        if let Some(user) = patch.ssh_username {
            asset.ssh_username = Some(user);
        }
        if let Some(pw) = patch.ssh_password {
            asset.ssh_password = Some(pw);
        }
        if let Some(key) = patch.ssh_key {
            asset.ssh_key = Some(key);
        }
        if let Some(method) = patch.sudo_method {
            asset.sudo_method = Some(method);
        }
        if let Some(pw) = patch.sudo_password {
            asset.sudo_password = Some(pw);
        }
        if let Some(tags) = patch.tags {
            asset.tags = Json(tags);
        }
        asset.updated_at = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            UPDATE assets SET
                hostname = ?, ip_address = ?, os_type = ?, ssh_port = ?,
                ssh_username = ?, ssh_password = ?, ssh_key = ?,
                sudo_method = ?, sudo_password = ?, tags = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&asset.hostname)
        .bind(&asset.ip_address)
        .bind(asset.os_type.to_string())
        .bind(asset.ssh_port)
        .bind(&asset.ssh_username)
        .bind(&asset.ssh_password)
        .bind(&asset.ssh_key)
        .bind(&asset.sudo_method)
        .bind(&asset.sudo_password)
        .bind(&asset.tags)
        .bind(&asset.updated_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("updating asset")?;

        Ok(Some(asset))
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM assets WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting asset")?;

        Ok(result.rows_affected() > 0)
    }

    /// Record OS detection results after a successful connect.
    pub async fn update_os_info(
        &self,
        id: &str,
        os_type: OsType,
        os_version: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE assets SET os_type = ?, os_version = ?, last_seen = ?, updated_at = ? WHERE id = ?",
        )
        .bind(os_type.to_string())
        .bind(os_version)
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("updating asset os info")?;

        Ok(())
    }

    /// Pin the server host-key fingerprint observed on first connect.
    pub async fn pin_fingerprint(&self, id: &str, fingerprint: &str) -> Result<()> {
        sqlx::query("UPDATE assets SET pinned_fingerprint = ?, updated_at = ? WHERE id = ?")
            .bind(fingerprint)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("pinning asset fingerprint")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn sample_request() -> CreateAssetRequest {
        CreateAssetRequest {
            hostname: "web-01".into(),
            ip_address: Some("10.0.0.5".into()),
            os_type: OsType::Linux,
            ssh_port: 22,
            ssh_username: Some("root".into()),
            ssh_password: Some("hunter2".into()),
            ssh_key: None,
            sudo_method: None,
            sudo_password: None,
            tags: vec!["prod".into()],
        }
    }

    #[tokio::test]
    async fn create_get_list_delete() {
        let db = Database::in_memory().await.unwrap();
        let repo = AssetRepository::new(db.pool().clone());

        let asset = repo.create(sample_request()).await.unwrap();
        let fetched = repo.get(&asset.id).await.unwrap().unwrap();
        assert_eq!(fetched.hostname, "web-01");
        assert_eq!(fetched.os_type, OsType::Linux);
        assert_eq!(fetched.tags.0, vec!["prod".to_string()]);

        assert_eq!(repo.list().await.unwrap().len(), 1);
        assert!(repo.delete(&asset.id).await.unwrap());
        assert!(repo.get(&asset.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn patch_updates_selected_fields() {
        let db = Database::in_memory().await.unwrap();
        let repo = AssetRepository::new(db.pool().clone());
        let asset = repo.create(sample_request()).await.unwrap();

        let patched = repo
            .patch(
                &asset.id,
                PatchAssetRequest {
                    hostname: Some("web-02".into()),
                    sudo_method: Some("nopasswd".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(patched.hostname, "web-02");
        assert_eq!(patched.sudo_method.as_deref(), Some("nopasswd"));
        // Untouched fields survive.
        assert_eq!(patched.ip_address.as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn os_info_update() {
        let db = Database::in_memory().await.unwrap();
        let repo = AssetRepository::new(db.pool().clone());
        let asset = repo.create(sample_request()).await.unwrap();

        repo.update_os_info(&asset.id, OsType::Linux, Some("Ubuntu 22.04"))
            .await
            .unwrap();
        let fetched = repo.get(&asset.id).await.unwrap().unwrap();
        assert_eq!(fetched.os_version.as_deref(), Some("Ubuntu 22.04"));
        assert!(fetched.last_seen.is_some());
    }
}
