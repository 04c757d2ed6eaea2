/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier of a checkpoint as advertised by the backend
/// (usually its file name, e.g. `sd_xl_base_1.0.safetensors`).
pub type ModelId = String;
