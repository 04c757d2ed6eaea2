//! In-memory stand-ins for the socket and HTTP seams.
//!
//! Enabled for this crate's tests and, through the `testing` feature,
//! for downstream test suites. [`FakeConnector`] hands out sockets backed
//! by unbounded channels; [`FakeBackend`] answers REST calls and, on
//! submission, plays a scripted [`JobScript`] into the newest socket.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;

use crate::api::{
    ComfyUIApiError, ComfyUIBackend, ImageRef, NodeInfo, SubmitResponse, SystemStats,
    UploadResponse,
};
use crate::client::{ComfyUIClientError, Frame, FrameStream, SocketConnector};

type FrameSender = mpsc::UnboundedSender<Result<Frame, ComfyUIClientError>>;

// ---------------------------------------------------------------------------
// FakeConnector
// ---------------------------------------------------------------------------

/// How the next `connect` call behaves.
#[derive(Debug, Clone)]
pub enum ConnectBehavior {
    Open,
    /// Open after a delay.
    Delay(Duration),
    Fail(String),
    /// Never resolve.
    Hang,
}

/// Socket connector backed by in-memory channels.
#[derive(Default)]
pub struct FakeConnector {
    connects: AtomicUsize,
    plan: Mutex<VecDeque<ConnectBehavior>>,
    sockets: Mutex<Vec<FrameSender>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue behaviours for upcoming connects; afterwards sockets open.
    pub fn plan(&self, behaviors: impl IntoIterator<Item = ConnectBehavior>) {
        if let Ok(mut plan) = self.plan.lock() {
            plan.extend(behaviors);
        }
    }

    /// Number of `connect` calls so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of sockets that actually opened.
    pub fn open_count(&self) -> usize {
        self.sockets.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Push a frame into the newest socket. Returns `false` if none is
    /// open or its reader has gone away.
    pub fn push(&self, frame: Frame) -> bool {
        let sockets = match self.sockets.lock() {
            Ok(sockets) => sockets,
            Err(_) => return false,
        };
        sockets
            .last()
            .is_some_and(|tx| tx.unbounded_send(Ok(frame)).is_ok())
    }

    pub fn push_text(&self, json: serde_json::Value) -> bool {
        self.push(Frame::Text(json.to_string()))
    }

    /// Simulate the backend dropping the newest socket.
    pub fn drop_latest(&self) {
        self.push(Frame::Close(Some("server shutdown".into())));
    }

    /// Whether the newest socket's reader has been dropped.
    pub fn latest_closed(&self) -> bool {
        self.sockets
            .lock()
            .ok()
            .and_then(|s| s.last().map(|tx| tx.is_closed()))
            .unwrap_or(true)
    }

    fn next_behavior(&self) -> ConnectBehavior {
        self.plan
            .lock()
            .ok()
            .and_then(|mut plan| plan.pop_front())
            .unwrap_or(ConnectBehavior::Open)
    }

    fn open_socket(&self) -> FrameStream {
        let (tx, rx) = mpsc::unbounded();
        if let Ok(mut sockets) = self.sockets.lock() {
            sockets.push(tx);
        }
        rx.boxed()
    }
}

#[async_trait]
impl SocketConnector for FakeConnector {
    fn endpoint(&self) -> &str {
        "ws://fake-backend"
    }

    async fn connect(&self, _client_id: &str) -> Result<FrameStream, ComfyUIClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.next_behavior() {
            ConnectBehavior::Open => Ok(self.open_socket()),
            ConnectBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.open_socket())
            }
            ConnectBehavior::Fail(reason) => Err(ComfyUIClientError::Connection(reason)),
            ConnectBehavior::Hang => futures::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// FakeBackend
// ---------------------------------------------------------------------------

/// What the backend does with a submitted prompt.
#[derive(Debug, Clone)]
pub enum JobScript {
    /// Report progress, stream these `(mime, bytes)` images from the
    /// output node, then finish.
    Complete(Vec<(String, Vec<u8>)>),
    /// Finish with `executed` outputs naming stored files, served by
    /// [`FakeBackend::view_image`].
    CompleteWithFiles(Vec<(String, String, Vec<u8>)>),
    /// Report an execution error with this message.
    Fail(String),
    /// Accept the prompt and never report anything.
    Silent,
}

/// Scriptable REST backend.
pub struct FakeBackend {
    connector: Arc<FakeConnector>,
    scripts: Mutex<VecDeque<JobScript>>,
    default_script: JobScript,
    submissions: Mutex<Vec<serde_json::Value>>,
    uploads: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, (String, Vec<u8>)>>,
    node_info: Mutex<HashMap<String, serde_json::Value>>,
    stats: Mutex<Option<serde_json::Value>>,
    reject_submit: Mutex<Option<String>>,
    pub interrupts: AtomicUsize,
    pub queue_deletes: AtomicUsize,
    pub frees: AtomicUsize,
}

impl FakeBackend {
    /// A backend whose prompts complete with one PNG image by default.
    pub fn new(connector: Arc<FakeConnector>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            scripts: Mutex::new(VecDeque::new()),
            default_script: JobScript::Complete(vec![("image/png".into(), tiny_png())]),
            submissions: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            node_info: Mutex::new(default_node_info()),
            stats: Mutex::new(Some(serde_json::json!({
                "system": {"os": "posix", "ram_total": 64, "ram_free": 48},
                "devices": [{"name": "cuda:0 Fake GPU", "type": "cuda", "vram_total": 24, "vram_free": 22}]
            }))),
            reject_submit: Mutex::new(None),
            interrupts: AtomicUsize::new(0),
            queue_deletes: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        })
    }

    /// Queue scripts for the next submissions.
    pub fn script(&self, scripts: impl IntoIterator<Item = JobScript>) {
        if let Ok(mut queue) = self.scripts.lock() {
            queue.extend(scripts);
        }
    }

    /// Make `object_info` for `node_class` fail with a 500.
    pub fn break_node(&self, node_class: &str) {
        if let Ok(mut info) = self.node_info.lock() {
            info.remove(node_class);
        }
    }

    /// Make `/system_stats` fail.
    pub fn break_stats(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            *stats = None;
        }
    }

    /// Make `/prompt` reject submissions with this body.
    pub fn reject_submissions(&self, body: &str) {
        if let Ok(mut reject) = self.reject_submit.lock() {
            *reject = Some(body.to_string());
        }
    }

    /// Workflows submitted so far.
    pub fn submissions(&self) -> Vec<serde_json::Value> {
        self.submissions.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Names of uploaded images.
    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().map(|u| u.clone()).unwrap_or_default()
    }

    fn play(&self, prompt_id: &str, workflow: &serde_json::Value, script: JobScript) {
        let output_node = output_node_id(workflow).unwrap_or_default();
        let c = &self.connector;
        let msg = |kind: &str, data: serde_json::Value| {
            c.push_text(serde_json::json!({"type": kind, "data": data}));
        };

        match script {
            JobScript::Silent => {}
            JobScript::Fail(message) => {
                msg("execution_start", serde_json::json!({"prompt_id": prompt_id}));
                msg(
                    "execution_error",
                    serde_json::json!({
                        "prompt_id": prompt_id,
                        "node_id": "5",
                        "exception_message": message,
                        "exception_type": "RuntimeError",
                    }),
                );
            }
            JobScript::Complete(images) => {
                msg("execution_start", serde_json::json!({"prompt_id": prompt_id}));
                msg("executing", serde_json::json!({"node": "5", "prompt_id": prompt_id}));
                msg("progress", serde_json::json!({"value": 1, "max": 2, "prompt_id": prompt_id}));
                msg("progress", serde_json::json!({"value": 2, "max": 2, "prompt_id": prompt_id}));
                msg("executing", serde_json::json!({"node": output_node, "prompt_id": prompt_id}));
                for (mime, bytes) in images {
                    c.push(Frame::Binary(image_frame(&mime, &bytes)));
                }
                msg("execution_success", serde_json::json!({"prompt_id": prompt_id}));
                msg("executing", serde_json::json!({"node": null, "prompt_id": prompt_id}));
            }
            JobScript::CompleteWithFiles(files) => {
                msg("execution_start", serde_json::json!({"prompt_id": prompt_id}));
                let mut refs = Vec::new();
                if let Ok(mut stored) = self.files.lock() {
                    for (filename, mime, bytes) in files {
                        refs.push(serde_json::json!({"filename": filename, "subfolder": "", "type": "output"}));
                        stored.insert(filename, (mime, bytes));
                    }
                }
                msg(
                    "executed",
                    serde_json::json!({"node": output_node, "output": {"images": refs}, "prompt_id": prompt_id}),
                );
                msg("executing", serde_json::json!({"node": null, "prompt_id": prompt_id}));
            }
        }
    }
}

#[async_trait]
impl ComfyUIBackend for FakeBackend {
    async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        _client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        if let Some(body) = self.reject_submit.lock().ok().and_then(|r| r.clone()) {
            return Err(ComfyUIApiError::ApiError { status: 400, body });
        }
        let number = match self.submissions.lock() {
            Ok(mut submissions) => {
                submissions.push(workflow.clone());
                submissions.len()
            }
            Err(_) => 0,
        };
        let prompt_id = format!("prompt-{number}");
        let script = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| self.default_script.clone());
        self.play(&prompt_id, workflow, script);
        Ok(SubmitResponse {
            prompt_id,
            number: number as i64,
        })
    }

    async fn cancel_execution(&self, _prompt_id: &str) -> Result<(), ComfyUIApiError> {
        self.queue_deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn free_memory(&self) -> Result<(), ComfyUIApiError> {
        self.frees.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn upload_image(
        &self,
        name: &str,
        _bytes: Vec<u8>,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        if let Ok(mut uploads) = self.uploads.lock() {
            uploads.push(name.to_string());
        }
        Ok(UploadResponse {
            name: format!("uploaded-{name}"),
            subfolder: String::new(),
        })
    }

    async fn view_image(&self, image: &ImageRef) -> Result<(Vec<u8>, String), ComfyUIApiError> {
        self.files
            .lock()
            .ok()
            .and_then(|files| files.get(&image.filename).cloned())
            .map(|(mime, bytes)| (bytes, mime))
            .ok_or(ComfyUIApiError::ApiError {
                status: 404,
                body: "not found".into(),
            })
    }

    async fn object_info(&self, node_class: &str) -> Result<NodeInfo, ComfyUIApiError> {
        let json = self
            .node_info
            .lock()
            .ok()
            .and_then(|info| info.get(node_class).cloned())
            .ok_or(ComfyUIApiError::ApiError {
                status: 500,
                body: format!("{node_class} unavailable"),
            })?;
        serde_json::from_value(json).map_err(|e| ComfyUIApiError::Decode(e.to_string()))
    }

    async fn system_stats(&self) -> Result<SystemStats, ComfyUIApiError> {
        let json = self
            .stats
            .lock()
            .ok()
            .and_then(|s| s.clone())
            .ok_or(ComfyUIApiError::ApiError {
                status: 503,
                body: "stats unavailable".into(),
            })?;
        serde_json::from_value(json).map_err(|e| ComfyUIApiError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn default_node_info() -> HashMap<String, serde_json::Value> {
    let combo = |input: &str, values: &[&str]| {
        serde_json::json!({"input": {"required": {input: [values, {}]}}})
    };
    HashMap::from([
        (
            "CheckpointLoaderSimple".to_string(),
            combo("ckpt_name", &["sd_xl_base_1.0.safetensors", "flux1-dev.safetensors"]),
        ),
        (
            "ControlNetLoader".to_string(),
            combo("control_net_name", &["control_canny.safetensors"]),
        ),
        ("LoraLoader".to_string(), combo("lora_name", &["ink_style.safetensors"])),
        ("VAELoader".to_string(), combo("vae_name", &["sdxl_vae.safetensors"])),
        ("UpscaleModelLoader".to_string(), combo("model_name", &["4x-UltraSharp.pth"])),
        (
            "KSampler".to_string(),
            serde_json::json!({"input": {"required": {
                "sampler_name": [["euler", "dpmpp_2m"], {}],
                "scheduler": [["normal", "karras"], {}],
                "steps": ["INT", {"default": 20}],
            }}}),
        ),
    ])
}

/// Id of the node streaming images back over the socket.
pub fn output_node_id(workflow: &serde_json::Value) -> Option<String> {
    workflow.as_object()?.iter().find_map(|(id, node)| {
        (node.get("class_type")?.as_str()? == "SaveImageWebsocket").then(|| id.clone())
    })
}

/// Encode an image as a preview binary frame.
pub fn image_frame(mime: &str, bytes: &[u8]) -> Vec<u8> {
    let format: u32 = if mime == "image/jpeg" { 1 } else { 2 };
    let mut frame = 1u32.to_be_bytes().to_vec();
    frame.extend_from_slice(&format.to_be_bytes());
    frame.extend_from_slice(bytes);
    frame
}

/// A valid 1x1 RGBA PNG.
pub fn tiny_png() -> Vec<u8> {
    vec![
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
        0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
        0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0xDA, 0x63, 0x64,
        0x60, 0xF8, 0x5F, 0x0F, 0x00, 0x02, 0x87, 0x01, 0x80, 0xEB, 0x47, 0xBA, 0x92, 0x00, 0x00,
        0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
    ]
}
