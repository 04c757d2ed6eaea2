//! Repository for the `settings` key-value table.

use sqlx::SqlitePool;

use crate::models::setting::SettingRow;

const COLUMNS: &str = "key, value, updated_at";

pub struct SettingRepo;

impl SettingRepo {
    pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<SettingRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM settings WHERE key = $1");
        sqlx::query_as::<_, SettingRow>(&query)
            .bind(key)
            .fetch_optional(pool)
            .await
    }

    pub async fn set(pool: &SqlitePool, key: &str, value: &str) -> Result<SettingRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO settings (key, value, updated_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE SET \
                 value = excluded.value, \
                 updated_at = excluded.updated_at \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, SettingRow>(&query)
            .bind(key)
            .bind(value)
            .bind(chrono::Utc::now())
            .fetch_one(pool)
            .await
    }
}
