use chrono::Utc;
use sqlx::Row;
use tracing::{info, instrument};

use super::core::Database;
use crate::retag::stats::DictionaryStatistics;
use crate::TARGET_DB;

impl Database {
    /// Inserts or replaces the statistics row of one dictionary.
    #[instrument(target = "db", level = "info", skip(self, statistics))]
    pub async fn save_statistics(
        &self,
        name: &str,
        statistics: &DictionaryStatistics,
    ) -> Result<(), sqlx::Error> {
        let data = serde_json::to_string(statistics)
            .map_err(|e| sqlx::Error::Protocol(format!("Failed to encode statistics: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO statistics (name, data, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(data)
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;

        info!(target: TARGET_DB, "Saved statistics for '{}'", name);
        Ok(())
    }

    pub async fn load_statistics(&self, name: &str) -> Result<Option<DictionaryStatistics>, sqlx::Error> {
        let data: Option<String> = sqlx::query_scalar("SELECT data FROM statistics WHERE name = ?1")
            .bind(name)
            .fetch_optional(self.pool())
            .await?;

        data.map(|data| serde_json::from_str(&data).map_err(|e| sqlx::Error::Decode(Box::new(e))))
            .transpose()
    }

    /// Names and last update times of all stored statistics.
    pub async fn list_statistics(&self) -> Result<Vec<(String, String)>, sqlx::Error> {
        let rows = sqlx::query("SELECT name, updated_at FROM statistics ORDER BY name")
            .fetch_all(self.pool())
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("name"), row.get("updated_at")))
            .collect())
    }
}
