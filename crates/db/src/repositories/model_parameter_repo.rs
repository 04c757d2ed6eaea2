//! Repository for the `model_parameters` table.

use sqlx::SqlitePool;

use crate::models::model_parameter::ModelParameterRow;

/// Column list for `model_parameters` queries.
const COLUMNS: &str = "model_id, record_json, updated_at";

/// Provides data access for per-model parameter records.
pub struct ModelParameterRepo;

impl ModelParameterRepo {
    /// Find the stored record for a model.
    ///
    /// Returns `None` if the model has never completed a generation.
    pub async fn find(
        pool: &SqlitePool,
        model_id: &str,
    ) -> Result<Option<ModelParameterRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM model_parameters WHERE model_id = $1");
        sqlx::query_as::<_, ModelParameterRow>(&query)
            .bind(model_id)
            .fetch_optional(pool)
            .await
    }

    /// Insert or replace the record for a model.
    ///
    /// The whole record is overwritten; concurrent writers for the same
    /// model resolve as last writer wins.
    pub async fn upsert(
        pool: &SqlitePool,
        model_id: &str,
        record_json: &str,
    ) -> Result<ModelParameterRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO model_parameters (model_id, record_json, updated_at) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (model_id) DO UPDATE SET \
                 record_json = excluded.record_json, \
                 updated_at = excluded.updated_at \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ModelParameterRow>(&query)
            .bind(model_id)
            .bind(record_json)
            .bind(chrono::Utc::now())
            .fetch_one(pool)
            .await
    }

    /// Ids of every model with a stored record, most recently used first.
    pub async fn list_ids(pool: &SqlitePool) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            "SELECT model_id FROM model_parameters ORDER BY updated_at DESC, model_id",
        )
        .fetch_all(pool)
        .await
    }
}
