//! Backend socket messages.
//!
//! Text frames are JSON envelopes `{"type": "<kind>", "data": {...}}` and
//! map onto [`ComfyUIMessage`]. Binary frames carry rendered images and
//! are decoded by [`parse_binary_frame`].
//!
//! Only the fields the session and executor act on are modelled; unknown
//! fields are ignored, unknown message kinds fail to parse.

use serde::Deserialize;

use crate::api::ImageRef;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ComfyUIMessage {
    Status(StatusPayload),
    ExecutionStart(PromptRef),
    ExecutionCached(CachedNodes),
    /// `node: None` marks the end of the prompt.
    Executing(NodeActivity),
    Progress(StepProgress),
    Executed(NodeResult),
    ExecutionSuccess(PromptRef),
    ExecutionError(ExecutionFailure),
    ExecutionInterrupted(PromptRef),
}

impl ComfyUIMessage {
    /// Prompt this message belongs to. `None` for broadcasts and for
    /// older backends that omit the id on progress frames.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            ComfyUIMessage::Status(_) => None,
            ComfyUIMessage::Executing(NodeActivity { prompt_id, .. })
            | ComfyUIMessage::Progress(StepProgress { prompt_id, .. }) => prompt_id.as_deref(),
            ComfyUIMessage::ExecutionStart(p)
            | ComfyUIMessage::ExecutionSuccess(p)
            | ComfyUIMessage::ExecutionInterrupted(p) => Some(&p.prompt_id),
            ComfyUIMessage::ExecutionCached(c) => Some(&c.prompt_id),
            ComfyUIMessage::Executed(r) => Some(&r.prompt_id),
            ComfyUIMessage::ExecutionError(f) => Some(&f.prompt_id),
        }
    }

    /// Message kind as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ComfyUIMessage::Status(_) => "status",
            ComfyUIMessage::ExecutionStart(_) => "execution_start",
            ComfyUIMessage::ExecutionCached(_) => "execution_cached",
            ComfyUIMessage::Executing(_) => "executing",
            ComfyUIMessage::Progress(_) => "progress",
            ComfyUIMessage::Executed(_) => "executed",
            ComfyUIMessage::ExecutionSuccess(_) => "execution_success",
            ComfyUIMessage::ExecutionError(_) => "execution_error",
            ComfyUIMessage::ExecutionInterrupted(_) => "execution_interrupted",
        }
    }
}

/// Queue broadcast. `sid` is only present on the first one after connect.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusPayload {
    status: QueueState,
    #[serde(default)]
    pub sid: Option<String>,
}

impl StatusPayload {
    pub fn queue_remaining(&self) -> u32 {
        self.status.exec_info.queue_remaining
    }
}

#[derive(Debug, Clone, Deserialize)]
struct QueueState {
    exec_info: QueueCounters,
}

#[derive(Debug, Clone, Deserialize)]
struct QueueCounters {
    #[serde(default)]
    queue_remaining: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CachedNodes {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeActivity {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Sampler step counter for the running node.
#[derive(Debug, Clone, Deserialize)]
pub struct StepProgress {
    pub value: u32,
    pub max: u32,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeResult {
    pub node: String,
    pub prompt_id: String,
    #[serde(default)]
    pub output: NodeOutput,
}

/// Files a node wrote. Non-image outputs are dropped.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionFailure {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

/// Parse one text frame.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}

// ---------------------------------------------------------------------------
// Binary frames
// ---------------------------------------------------------------------------

/// Binary event: encoded image, `[u32 event][u32 format][bytes]`.
const EVENT_PREVIEW_IMAGE: u32 = 1;

/// Binary event: image with JSON metadata, `[u32 event][u32 len][json][bytes]`.
const EVENT_PREVIEW_IMAGE_WITH_METADATA: u32 = 4;

const FORMAT_JPEG: u32 = 1;
const FORMAT_PNG: u32 = 2;

/// An image carried by a binary frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryImage {
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Why a binary frame could not be decoded into an image.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BinaryFrameError {
    #[error("binary frame too short ({0} bytes)")]
    Truncated(usize),

    #[error("unsupported binary event type {0}")]
    UnsupportedEvent(u32),

    #[error("unsupported image format {0}")]
    UnsupportedFormat(u32),

    #[error("invalid image metadata: {0}")]
    Metadata(String),
}

#[derive(Deserialize)]
struct ImageMetadata {
    image_type: String,
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, BinaryFrameError> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or(BinaryFrameError::Truncated(data.len()))
}

/// Decode a binary frame into an image with its mime type.
pub fn parse_binary_frame(data: &[u8]) -> Result<BinaryImage, BinaryFrameError> {
    match read_u32(data, 0)? {
        EVENT_PREVIEW_IMAGE => {
            let mime = match read_u32(data, 4)? {
                FORMAT_JPEG => "image/jpeg",
                FORMAT_PNG => "image/png",
                other => return Err(BinaryFrameError::UnsupportedFormat(other)),
            };
            Ok(BinaryImage {
                mime: mime.to_string(),
                bytes: data[8..].to_vec(),
            })
        }
        EVENT_PREVIEW_IMAGE_WITH_METADATA => {
            let len = read_u32(data, 4)? as usize;
            let json = data
                .get(8..8 + len)
                .ok_or(BinaryFrameError::Truncated(data.len()))?;
            let meta: ImageMetadata = serde_json::from_slice(json)
                .map_err(|e| BinaryFrameError::Metadata(e.to_string()))?;
            Ok(BinaryImage {
                mime: meta.image_type,
                bytes: data[8 + len..].to_vec(),
            })
        }
        other => Err(BinaryFrameError::UnsupportedEvent(other)),
    }
}
