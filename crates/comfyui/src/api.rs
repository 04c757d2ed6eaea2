//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, interruption,
//! memory release, image upload/download, node metadata and system
//! telemetry) using [`reqwest`]. [`ComfyUIBackend`] is the seam the
//! catalog loader and executor program against.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

/// Per-request ceiling for HTTP calls; no request may wait forever.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Mime type assumed when `/view` does not report one.
const FALLBACK_IMAGE_MIME: &str = "image/png";

// ---------------------------------------------------------------------------
// Response DTOs
// ---------------------------------------------------------------------------

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
}

/// Response of `/upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    /// Stored file name, to be referenced by `LoadImage` nodes.
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
}

/// Reference to an image stored by the backend, as found in `executed`
/// node outputs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_image_kind")]
    pub kind: String,
}

fn default_image_kind() -> String {
    "output".to_string()
}

/// Metadata for one node class from `/object_info/{class}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub input: NodeInputs,
}

/// Input declarations of a node class.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeInputs {
    #[serde(default)]
    pub required: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub optional: HashMap<String, serde_json::Value>,
}

impl NodeInfo {
    /// The selectable values of a combo input.
    ///
    /// Accepts both the legacy `[["a", "b"], {...}]` declaration and the
    /// newer `["COMBO", {"options": ["a", "b"]}]` form. Returns `None`
    /// when the input is missing or is not a combo.
    pub fn choices(&self, input: &str) -> Option<Vec<String>> {
        let spec = self
            .input
            .required
            .get(input)
            .or_else(|| self.input.optional.get(input))?
            .as_array()?;

        match spec.first()? {
            serde_json::Value::Array(values) => string_list(values),
            serde_json::Value::String(kind) if kind == "COMBO" => {
                let options = spec.get(1)?.get("options")?.as_array()?;
                string_list(options)
            }
            _ => None,
        }
    }
}

fn string_list(values: &[serde_json::Value]) -> Option<Vec<String>> {
    values
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// Response of `/system_stats`.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemStats {
    #[serde(default)]
    pub system: SystemInfo,
    #[serde(default)]
    pub devices: Vec<DeviceStats>,
}

/// Host-level information from `/system_stats`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub ram_total: u64,
    #[serde(default)]
    pub ram_free: u64,
}

/// One compute device from `/system_stats`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceStats {
    pub name: String,
    /// `cuda`, `mps`, `cpu`, ...
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub vram_total: u64,
    #[serde(default)]
    pub vram_free: u64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The response body did not have the expected shape.
    #[error("Unexpected response from ComfyUI: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// Operations the core needs from the backend's HTTP surface.
#[async_trait]
pub trait ComfyUIBackend: Send + Sync {
    /// Queue a workflow addressed to the socket identified by `client_id`.
    async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError>;

    /// Remove a queued prompt.
    async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError>;

    /// Interrupt whatever is executing right now.
    async fn interrupt(&self) -> Result<(), ComfyUIApiError>;

    /// Ask the backend to unload models and release memory.
    async fn free_memory(&self) -> Result<(), ComfyUIApiError>;

    /// Upload an input image, returning the stored name.
    async fn upload_image(
        &self,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadResponse, ComfyUIApiError>;

    /// Download a stored image, returning its bytes and mime type.
    async fn view_image(&self, image: &ImageRef) -> Result<(Vec<u8>, String), ComfyUIApiError>;

    /// Metadata for one node class.
    async fn object_info(&self, node_class: &str) -> Result<NodeInfo, ComfyUIApiError>;

    /// Host and device telemetry.
    async fn system_stats(&self) -> Result<SystemStats, ComfyUIApiError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self::with_client(client, api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// Base HTTP URL.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ComfyUIBackend for ComfyUIApi {
    /// Sends `POST /prompt` with the workflow JSON and client ID.
    async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Sends `POST /queue` asking ComfyUI to delete the prompt.
    async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Sends `POST /interrupt`. This does not target a specific prompt.
    async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Sends `POST /free` with both unload and free flags set.
    async fn free_memory(&self) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "unload_models": true,
            "free_memory": true,
        });

        let response = self
            .client
            .post(format!("{}/free", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Sends a multipart `POST /upload/image`, overwriting same-named files.
    async fn upload_image(
        &self,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(name.to_string());
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", "true");

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Sends `GET /view` and keeps the served content type.
    async fn view_image(&self, image: &ImageRef) -> Result<(Vec<u8>, String), ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(FALLBACK_IMAGE_MIME)
            .to_string();
        let bytes = response.bytes().await?;
        Ok((bytes.to_vec(), mime))
    }

    /// Sends `GET /object_info/{class}` and extracts that class's entry.
    async fn object_info(&self, node_class: &str) -> Result<NodeInfo, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/object_info/{}", self.api_url, node_class))
            .send()
            .await?;

        let mut classes: HashMap<String, NodeInfo> = Self::parse_response(response).await?;
        classes
            .remove(node_class)
            .ok_or_else(|| ComfyUIApiError::Decode(format!("node class {node_class} not installed")))
    }

    /// Sends `GET /system_stats`.
    async fn system_stats(&self) -> Result<SystemStats, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(json: &str) -> NodeInfo {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn legacy_combo_choices() {
        let info = node(
            r#"{"input":{"required":{"ckpt_name":[["a.safetensors","b.ckpt"],{"tooltip":"x"}]}},"output":["MODEL"]}"#,
        );
        assert_eq!(
            info.choices("ckpt_name").unwrap(),
            vec!["a.safetensors", "b.ckpt"]
        );
    }

    #[test]
    fn combo_keyword_choices() {
        let info = node(
            r#"{"input":{"required":{"lora_name":["COMBO",{"options":["ink.safetensors"]}]}}}"#,
        );
        assert_eq!(info.choices("lora_name").unwrap(), vec!["ink.safetensors"]);
    }

    #[test]
    fn optional_inputs_are_searched() {
        let info = node(r#"{"input":{"optional":{"vae_name":[["ae.sft"]]}}}"#);
        assert_eq!(info.choices("vae_name").unwrap(), vec!["ae.sft"]);
    }

    #[test]
    fn non_combo_input_has_no_choices() {
        let info = node(r#"{"input":{"required":{"steps":["INT",{"default":20}]}}}"#);
        assert!(info.choices("steps").is_none());
        assert!(info.choices("missing").is_none());
    }

    #[test]
    fn empty_combo_is_empty_list() {
        let info = node(r#"{"input":{"required":{"control_net_name":[[]]}}}"#);
        assert_eq!(info.choices("control_net_name").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn system_stats_ignores_unknown_fields() {
        let stats: SystemStats = serde_json::from_str(
            r#"{"system":{"os":"posix","ram_total":32,"ram_free":16,"python_version":"3.11"},
                "devices":[{"name":"cuda:0 RTX","type":"cuda","index":0,"vram_total":24,"vram_free":20}]}"#,
        )
        .unwrap();
        assert_eq!(stats.system.ram_free, 16);
        assert_eq!(stats.devices.len(), 1);
        assert_eq!(stats.devices[0].kind, "cuda");
    }

    #[test]
    fn device_without_name_is_parse_error() {
        let result: Result<SystemStats, _> =
            serde_json::from_str(r#"{"devices":[{"type":"cuda"}]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn image_ref_defaults_to_output_kind() {
        let image: ImageRef = serde_json::from_str(r#"{"filename":"x_00001_.png"}"#).unwrap();
        assert_eq!(image.kind, "output");
        assert!(image.subfolder.is_empty());
    }
}
