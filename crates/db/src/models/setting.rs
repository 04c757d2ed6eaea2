use imagegen_core::types::Timestamp;
use serde::Serialize;
use sqlx::FromRow;

/// Setting key holding the id of the model used by the last successful
/// generation.
pub const LAST_MODEL_KEY: &str = "last_model";

/// A row from the `settings` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SettingRow {
    pub key: String,
    pub value: String,
    pub updated_at: Timestamp,
}
