//! Stored per-model parameter rows.

use imagegen_core::types::Timestamp;
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `model_parameters` table.
///
/// `record_json` holds a serialized
/// [`StoredParameters`](imagegen_core::model_defaults::StoredParameters).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ModelParameterRow {
    pub model_id: String,
    pub record_json: String,
    pub updated_at: Timestamp,
}
