//! Model Parameter Store.
//!
//! The single interface through which generation defaults are read and
//! written. Records are keyed by model id and stored whole after every
//! successful generation; reads of a model with no record fall back to
//! the heuristic family defaults, and records missing fields are filled
//! per field from the same defaults.
//!
//! There is no eviction: one row per distinct model id ever used.

use imagegen_core::model_defaults::{heuristic_defaults, ParameterRecord, StoredParameters};

use crate::models::setting::LAST_MODEL_KEY;
use crate::repositories::{ModelParameterRepo, SettingRepo};
use crate::DbPool;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid stored record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable per-model parameter records plus the last used model.
#[derive(Debug, Clone)]
pub struct ModelParameterStore {
    pool: DbPool,
}

impl ModelParameterStore {
    /// Open the database at `database_url` and apply migrations.
    ///
    /// Call once at startup.
    pub async fn init(database_url: &str) -> Result<Self, StoreError> {
        let pool = crate::create_pool(database_url).await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, applying migrations.
    pub async fn from_pool(pool: DbPool) -> Result<Self, StoreError> {
        crate::run_migrations(&pool).await?;
        tracing::debug!("Model parameter store ready");
        Ok(Self { pool })
    }

    /// A migrated store over a private in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::from_pool(crate::open_in_memory().await?).await
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// The stored record for `model_id`, if one was ever written.
    ///
    /// Fields absent from an older stored record are filled from the
    /// heuristic defaults for the model's family.
    pub async fn lookup(&self, model_id: &str) -> Result<Option<ParameterRecord>, StoreError> {
        let Some(row) = ModelParameterRepo::find(&self.pool, model_id).await? else {
            return Ok(None);
        };
        let stored: StoredParameters = serde_json::from_str(&row.record_json)?;
        Ok(Some(stored.resolve(heuristic_defaults(model_id))))
    }

    /// Parameters to use for `model_id`: the stored record, or the
    /// heuristic defaults when nothing is stored.
    pub async fn get(&self, model_id: &str) -> Result<ParameterRecord, StoreError> {
        match self.lookup(model_id).await? {
            Some(record) => Ok(record),
            None => {
                tracing::debug!(model_id, "No stored parameters, using heuristic defaults");
                Ok(heuristic_defaults(model_id))
            }
        }
    }

    /// Overwrite the record for `model_id`.
    pub async fn set(&self, model_id: &str, record: &ParameterRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(&StoredParameters::from(record))?;
        ModelParameterRepo::upsert(&self.pool, model_id, &json).await?;
        tracing::debug!(model_id, steps = record.steps, "Stored model parameters");
        Ok(())
    }

    /// Ids of every model with a stored record.
    pub async fn known_models(&self) -> Result<Vec<String>, StoreError> {
        Ok(ModelParameterRepo::list_ids(&self.pool).await?)
    }

    /// Model used by the last successful generation.
    pub async fn last_model(&self) -> Result<Option<String>, StoreError> {
        Ok(SettingRepo::get(&self.pool, LAST_MODEL_KEY)
            .await?
            .map(|row| row.value))
    }

    pub async fn set_last_model(&self, model_id: &str) -> Result<(), StoreError> {
        SettingRepo::set(&self.pool, LAST_MODEL_KEY, model_id).await?;
        Ok(())
    }
}
