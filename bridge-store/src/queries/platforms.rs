use crate::error::{Result, StoreError};
use crate::models::{PlatformConfig, PlatformConfigUpdate};
use crate::store::{Store, json_column, platform_column};
use bridge_channels::PlatformType;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

const PLATFORM_COLUMNS: &str =
    "id, platform_type, platform_name, config_data, webhook_url, is_enabled, updated_at";

fn platform_from_row(row: &Row<'_>) -> rusqlite::Result<PlatformConfig> {
    Ok(PlatformConfig {
        id: row.get(0)?,
        platform_type: platform_column(row, 1)?,
        platform_name: row.get(2)?,
        config_data: json_column(row, 3)?,
        webhook_url: row.get(4)?,
        is_enabled: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn load_platform(conn: &Connection, platform: PlatformType) -> Result<Option<PlatformConfig>> {
    Ok(conn
        .query_row(
            &format!("SELECT {PLATFORM_COLUMNS} FROM platform_configs WHERE platform_type = ?1"),
            params![platform.as_str()],
            platform_from_row,
        )
        .optional()?)
}

impl Store {
    /// Inserts or replaces the single config row of `platform`.
    pub async fn upsert_platform_config(
        &self,
        platform: PlatformType,
        update: PlatformConfigUpdate,
        now: DateTime<Utc>,
    ) -> Result<PlatformConfig> {
        let config_data = serde_json::to_string(&update.config_data)?;
        let platform_name = update
            .platform_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| platform.display_name().to_string());
        let webhook_url = update
            .webhook_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO platform_configs
                     (platform_type, platform_name, config_data, webhook_url, is_enabled,
                      updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(platform_type) DO UPDATE SET
                     platform_name = excluded.platform_name,
                     config_data = excluded.config_data,
                     webhook_url = excluded.webhook_url,
                     is_enabled = excluded.is_enabled,
                     updated_at = excluded.updated_at",
                params![
                    platform.as_str(),
                    platform_name,
                    config_data,
                    webhook_url,
                    update.is_enabled,
                    now
                ],
            )?;
            load_platform(conn, platform)?
                .ok_or_else(|| StoreError::not_found("platform", platform))
        })
        .await
    }

    pub async fn get_platform_config(
        &self,
        platform: PlatformType,
    ) -> Result<Option<PlatformConfig>> {
        self.call(move |conn| load_platform(conn, platform)).await
    }

    pub async fn list_platform_configs(&self) -> Result<Vec<PlatformConfig>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PLATFORM_COLUMNS} FROM platform_configs ORDER BY platform_type"
            ))?;
            let rows = stmt.query_map([], platform_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    pub async fn delete_platform_config(&self, platform: PlatformType) -> Result<bool> {
        self.call(move |conn| {
            Ok(conn.execute(
                "DELETE FROM platform_configs WHERE platform_type = ?1",
                params![platform.as_str()],
            )? > 0)
        })
        .await
    }

    /// Sets one key inside `config_data`, leaving the rest of the document untouched.
    pub async fn set_platform_config_value(
        &self,
        platform: PlatformType,
        key: &str,
        value: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<PlatformConfig> {
        let key = key.to_string();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut config = load_platform(&tx, platform)?
                .ok_or_else(|| StoreError::not_found("platform", platform))?;
            config.config_data.insert(key, value);
            tx.execute(
                "UPDATE platform_configs SET config_data = ?1, updated_at = ?2 WHERE id = ?3",
                params![serde_json::to_string(&config.config_data)?, now, config.id],
            )?;
            let updated = load_platform(&tx, platform)?
                .ok_or_else(|| StoreError::not_found("platform", platform))?;
            tx.commit()?;
            Ok(updated)
        })
        .await
    }
}
