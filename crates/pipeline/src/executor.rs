//! Generation executor.
//!
//! [`Executor::execute`] runs one [`PipelineSpec`] at a time:
//!
//! 1. upload the input image, if any;
//! 2. acquire an open session (reconnecting transparently if the active
//!    one has errored) and subscribe to its messages;
//! 3. submit the compiled graph addressed to that session's client id;
//! 4. collect progress and images until the backend reports completion.
//!
//! All four steps race one hard generation ceiling, counted from the
//! `execute` call.
//!
//! [`Executor::cancel`] is client-authoritative: the job is marked
//! cancelled immediately and the in-flight call returns
//! [`GenerationError::Cancelled`] without waiting for the backend to
//! acknowledge the interrupt. A timed-out job is left running on the
//! backend.
//!
//! On success the backend is asked to free memory, the parameters used
//! are written to the [`ModelParameterStore`], and the result is appended
//! to the caller's [`ResultHistory`].

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine};
use imagegen_comfyui::api::{ComfyUIApiError, ComfyUIBackend, ImageRef};
use imagegen_comfyui::messages::ComfyUIMessage;
use imagegen_comfyui::processor::SessionMessage;
use imagegen_comfyui::session::{Session, SessionError, SessionManager, SessionState};
use imagegen_core::error::CoreError;
use imagegen_core::generation::{GenerationJob, GenerationOptions, JobStatus, Progress};
use imagegen_db::ModelParameterStore;
use imagegen_events::{EventBus, GenerationEvent};
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::builder::{build, PipelineSpec};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Default hard ceiling for one generation.
pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How long to wait for completion after submission.
    pub generation_timeout: Duration,
    /// Ask the backend to unload models after each success.
    pub free_memory_after_success: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            generation_timeout: DEFAULT_GENERATION_TIMEOUT,
            free_memory_after_success: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A decoded output image.
#[derive(Clone, PartialEq)]
pub struct Artifact {
    pub mime: String,
    pub bytes: Vec<u8>,
    /// Read from the image header; `None` if the header is unreadable.
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Artifact {
    pub fn new(mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        let dimensions = image::ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()
            .ok()
            .and_then(|reader| reader.into_dimensions().ok());
        Self {
            mime: mime.into(),
            width: dimensions.map(|(w, _)| w),
            height: dimensions.map(|(_, h)| h),
            bytes,
        }
    }

    /// `data:` URL preserving the artifact's mime type.
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime,
            general_purpose::STANDARD.encode(&self.bytes)
        )
    }

    /// File extension matching the mime type.
    pub fn extension(&self) -> &'static str {
        match self.mime.as_str() {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        }
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Outcome of a successful generation. Owned by the caller.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub job_id: Uuid,
    pub prompt_id: String,
    pub model_id: String,
    pub seed: u64,
    /// Fingerprint of the pipeline spec that produced this result.
    pub fingerprint: String,
    pub artifacts: Vec<Artifact>,
    pub elapsed: Duration,
}

/// Caller-owned list of successful results, newest last.
#[derive(Debug, Default)]
pub struct ResultHistory {
    results: Mutex<Vec<GenerationResult>>,
}

impl ResultHistory {
    pub async fn push(&self, result: GenerationResult) {
        self.results.lock().await.push(result);
    }

    pub async fn snapshot(&self) -> Vec<GenerationResult> {
        self.results.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.results.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.lock().await.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    #[error("Backend connection did not open within {}s", .0.as_secs())]
    ConnectionTimeout(Duration),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Generation timed out after {0}s")]
    GenerationTimeout(u64),

    /// The backend reported an error; the message is passed through as is.
    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("A generation is already in progress")]
    Busy,

    #[error("Retry is only allowed after a failed or timed-out generation")]
    RetryNotAllowed,

    #[error("Invalid generation options: {0}")]
    InvalidOptions(String),

    #[error("Input image upload failed: {0}")]
    Upload(String),
}

impl GenerationError {
    /// Terminal job status recorded for this error.
    fn job_status(&self) -> JobStatus {
        match self {
            GenerationError::GenerationTimeout(secs) => JobStatus::timed_out(*secs),
            GenerationError::Cancelled => JobStatus::cancelled(),
            GenerationError::GenerationFailed(message) => JobStatus::failed(message),
            other => JobStatus::failed(&other.to_string()),
        }
    }

    fn from_submit(error: ComfyUIApiError) -> Self {
        match error {
            ComfyUIApiError::Request(e) => GenerationError::BackendUnavailable(e.to_string()),
            other => GenerationError::GenerationFailed(other.to_string()),
        }
    }
}

impl From<SessionError> for GenerationError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::ConnectionTimeout { budget } => GenerationError::ConnectionTimeout(budget),
            SessionError::BackendUnavailable(detail) => GenerationError::BackendUnavailable(detail),
        }
    }
}

impl From<CoreError> for GenerationError {
    fn from(error: CoreError) -> Self {
        GenerationError::InvalidOptions(error.to_string())
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// The current (or last) job together with what is needed to cancel or
/// retry it.
struct Tracked {
    job: GenerationJob,
    spec: PipelineSpec,
    cancel: CancellationToken,
    orphan_interrupted: bool,
}

struct Completed {
    prompt_id: String,
    artifacts: Vec<Artifact>,
}

/// Runs generation jobs, one at a time.
pub struct Executor {
    sessions: Arc<SessionManager>,
    backend: Arc<dyn ComfyUIBackend>,
    store: ModelParameterStore,
    bus: Arc<EventBus>,
    history: Arc<ResultHistory>,
    config: ExecutorConfig,
    current: Mutex<Option<Tracked>>,
}

impl Executor {
    pub fn new(
        sessions: Arc<SessionManager>,
        backend: Arc<dyn ComfyUIBackend>,
        store: ModelParameterStore,
        bus: Arc<EventBus>,
        history: Arc<ResultHistory>,
    ) -> Self {
        Self {
            sessions,
            backend,
            store,
            bus,
            history,
            config: ExecutorConfig::default(),
            current: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Snapshot of the current or most recent job.
    pub async fn current_job(&self) -> Option<GenerationJob> {
        self.current.lock().await.as_ref().map(|t| t.job.clone())
    }

    /// Build a spec from `options` and execute it.
    pub async fn generate(
        &self,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, GenerationError> {
        let spec = build(options)?;
        self.execute(spec).await
    }

    /// Execute `spec`. Fails with [`GenerationError::Busy`] if another
    /// job is still running.
    pub async fn execute(&self, spec: PipelineSpec) -> Result<GenerationResult, GenerationError> {
        let (job_id, cancel) = self.begin(&spec).await?;
        let started = tokio::time::Instant::now();
        tracing::info!(
            job_id = %job_id,
            model_id = %spec.model_id(),
            variant = ?spec.variant(),
            "Generation started",
        );
        self.bus
            .publish(GenerationEvent::status(job_id, JobStatus::Running));

        // The ceiling covers the whole job, upload and session wait included.
        let ceiling = self.config.generation_timeout;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GenerationError::Cancelled),
            outcome = tokio::time::timeout(ceiling, self.run(job_id, &spec)) => outcome
                .unwrap_or_else(|_| Err(GenerationError::GenerationTimeout(ceiling.as_secs()))),
        };

        self.finish(job_id, &spec, outcome, started.elapsed()).await
    }

    /// Cancel the running job.
    ///
    /// Returns `true` if a running job was cancelled. After a timed-out
    /// job, the first call sends a best-effort interrupt for the job left
    /// on the backend but changes nothing locally. Otherwise a no-op.
    pub async fn cancel(&self) -> bool {
        let mut current = self.current.lock().await;
        let Some(tracked) = current.as_mut() else {
            return false;
        };

        let running = matches!(tracked.job.status, JobStatus::Running);
        let orphaned = matches!(tracked.job.status, JobStatus::TimedOut { .. });

        if running {
            tracked.job.status = JobStatus::cancelled();
            tracked.cancel.cancel();
            self.bus
                .publish(GenerationEvent::status(tracked.job.id, tracked.job.status.clone()));
            tracing::info!(job_id = %tracked.job.id, "Generation cancelled");
            // Nothing reached the backend before submission.
            if let Some(prompt_id) = tracked.job.prompt_id.clone() {
                self.interrupt_backend(prompt_id);
            }
            true
        } else {
            let orphan = match tracked.job.prompt_id.clone() {
                Some(prompt_id) if orphaned && !tracked.orphan_interrupted => Some(prompt_id),
                _ => None,
            };
            if let Some(prompt_id) = orphan {
                tracked.orphan_interrupted = true;
                tracing::info!(
                    job_id = %tracked.job.id,
                    prompt_id = %prompt_id,
                    "Interrupting timed-out job left on the backend",
                );
                self.interrupt_backend(prompt_id);
            }
            false
        }
    }

    /// Re-run the last spec after a failed or timed-out job.
    ///
    /// Forces a reconnect first if the session is not open. The pipeline spec is
    /// reused unchanged, seed included.
    pub async fn retry(&self) -> Result<GenerationResult, GenerationError> {
        let spec = {
            let current = self.current.lock().await;
            match current.as_ref() {
                Some(t) if t.job.status.is_retryable() => t.spec.clone(),
                Some(t) if !t.job.status.is_terminal() => return Err(GenerationError::Busy),
                _ => return Err(GenerationError::RetryNotAllowed),
            }
        };

        if !self.sessions.is_open().await {
            tracing::info!("Session not open, reconnecting before retry");
            self.sessions.reconnect().await?;
        }
        self.execute(spec).await
    }

    // -- internals ----------------------------------------------------------

    async fn begin(
        &self,
        spec: &PipelineSpec,
    ) -> Result<(Uuid, CancellationToken), GenerationError> {
        let mut current = self.current.lock().await;
        if current
            .as_ref()
            .is_some_and(|t| !t.job.status.is_terminal())
        {
            return Err(GenerationError::Busy);
        }

        let job = GenerationJob::start();
        let job_id = job.id;
        let cancel = CancellationToken::new();
        *current = Some(Tracked {
            job,
            spec: spec.clone(),
            cancel: cancel.clone(),
            orphan_interrupted: false,
        });
        Ok((job_id, cancel))
    }

    async fn run(&self, job_id: Uuid, spec: &PipelineSpec) -> Result<Completed, GenerationError> {
        let uploaded = match spec.input_image() {
            Some(image) => {
                let stored = self
                    .backend
                    .upload_image(&image.name, image.bytes.clone())
                    .await
                    .map_err(|e| GenerationError::Upload(e.to_string()))?;
                tracing::debug!(job_id = %job_id, name = %stored.name, "Input image uploaded");
                Some(if stored.subfolder.is_empty() {
                    stored.name
                } else {
                    format!("{}/{}", stored.subfolder, stored.name)
                })
            }
            None => None,
        };
        let graph = spec.to_graph(uploaded.as_deref());
        let output_node = graph.output_node_id().unwrap_or_default().to_string();

        let session = self.sessions.acquire().await?;
        let mut messages = session.subscribe();
        let submitted = self
            .backend
            .submit_workflow(&graph.to_prompt_json(), session.client_id())
            .await
            .map_err(GenerationError::from_submit)?;
        let prompt_id = submitted.prompt_id;
        tracing::info!(
            job_id = %job_id,
            prompt_id = %prompt_id,
            session_id = %session.id(),
            "Workflow submitted",
        );
        self.update_job(job_id, |job| job.prompt_id = Some(prompt_id.clone()))
            .await;
        self.bus.publish(GenerationEvent::Progress {
            job_id,
            progress: None,
        });

        let artifacts = self
            .collect(job_id, &session, &mut messages, &prompt_id, &output_node)
            .await?;

        Ok(Completed {
            prompt_id,
            artifacts,
        })
    }

    /// Consume session messages for `prompt_id` until it completes.
    async fn collect(
        &self,
        job_id: Uuid,
        session: &Session,
        messages: &mut broadcast::Receiver<SessionMessage>,
        prompt_id: &str,
        output_node: &str,
    ) -> Result<Vec<Artifact>, GenerationError> {
        let mut state = session.watch_state();
        let mut artifacts = Vec::new();
        let mut stored: Vec<ImageRef> = Vec::new();
        // Binary frames only belong to us while our output node runs.
        let mut streaming = false;

        loop {
            let received = tokio::select! {
                biased;
                received = messages.recv() => received,
                _ = connection_lost(&mut state) => {
                    let detail = session
                        .last_error()
                        .unwrap_or_else(|| "session closed".to_string());
                    return Err(GenerationError::BackendUnavailable(format!(
                        "connection lost during generation: {detail}"
                    )));
                }
            };

            let message = match received {
                Ok(message) => message,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(job_id = %job_id, skipped, "Session messages dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(GenerationError::BackendUnavailable(
                        "session message channel closed".to_string(),
                    ));
                }
            };

            match message {
                SessionMessage::Image(image) => {
                    if streaming {
                        self.bus.publish(GenerationEvent::ArtifactReceived {
                            job_id,
                            mime: image.mime.clone(),
                            size: image.bytes.len(),
                        });
                        artifacts.push(Artifact::new(image.mime, image.bytes));
                    }
                }
                SessionMessage::Message(msg) => {
                    if msg.prompt_id().is_some_and(|id| id != prompt_id) {
                        continue;
                    }
                    match msg {
                        ComfyUIMessage::Executing(data) => match data.node {
                            Some(node) => streaming = node == output_node,
                            None if data.prompt_id.as_deref() == Some(prompt_id) => break,
                            None => {}
                        },
                        ComfyUIMessage::Progress(data) => {
                            let progress = Progress {
                                value: data.value,
                                max: data.max,
                            };
                            self.update_job(job_id, |job| job.progress = Some(progress))
                                .await;
                            self.bus.publish(GenerationEvent::Progress {
                                job_id,
                                progress: Some(progress),
                            });
                        }
                        ComfyUIMessage::Executed(data) => stored.extend(data.output.images),
                        ComfyUIMessage::ExecutionSuccess(_) => break,
                        ComfyUIMessage::ExecutionError(data) => {
                            return Err(GenerationError::GenerationFailed(data.exception_message));
                        }
                        ComfyUIMessage::ExecutionInterrupted(_) => {
                            return Err(GenerationError::GenerationFailed(
                                "execution was interrupted on the backend".to_string(),
                            ));
                        }
                        _ => {}
                    }
                }
            }
        }

        for image in stored.iter().filter(|i| i.kind == "output") {
            let (bytes, mime) = self.backend.view_image(image).await.map_err(|e| {
                GenerationError::GenerationFailed(format!(
                    "could not download {}: {e}",
                    image.filename
                ))
            })?;
            self.bus.publish(GenerationEvent::ArtifactReceived {
                job_id,
                mime: mime.clone(),
                size: bytes.len(),
            });
            artifacts.push(Artifact::new(mime, bytes));
        }
        Ok(artifacts)
    }

    async fn finish(
        &self,
        job_id: Uuid,
        spec: &PipelineSpec,
        outcome: Result<Completed, GenerationError>,
        elapsed: Duration,
    ) -> Result<GenerationResult, GenerationError> {
        let outcome = {
            let mut current = self.current.lock().await;
            match current.as_mut().filter(|t| t.job.id == job_id) {
                // Cancellation already published; it wins over any late result.
                Some(t) if matches!(t.job.status, JobStatus::Cancelled { .. }) => {
                    Err(GenerationError::Cancelled)
                }
                Some(t) => {
                    t.job.status = match &outcome {
                        Ok(_) => JobStatus::Succeeded,
                        Err(e) => e.job_status(),
                    };
                    self.bus
                        .publish(GenerationEvent::status(job_id, t.job.status.clone()));
                    outcome
                }
                None => outcome,
            }
        };

        let done = match outcome {
            Ok(done) => done,
            Err(GenerationError::Cancelled) => {
                tracing::info!(job_id = %job_id, "Generation ended by cancellation");
                return Err(GenerationError::Cancelled);
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Generation failed");
                return Err(e);
            }
        };

        tracing::info!(
            job_id = %job_id,
            prompt_id = %done.prompt_id,
            artifacts = done.artifacts.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Generation succeeded",
        );
        self.after_success(spec).await;

        let result = GenerationResult {
            job_id,
            prompt_id: done.prompt_id,
            model_id: spec.model_id().to_string(),
            seed: spec.base().seed,
            fingerprint: spec.fingerprint(),
            artifacts: done.artifacts,
            elapsed,
        };
        self.history.push(result.clone()).await;
        Ok(result)
    }

    async fn after_success(&self, spec: &PipelineSpec) {
        if self.config.free_memory_after_success {
            if let Err(e) = self.backend.free_memory().await {
                tracing::warn!(error = %e, "Backend memory cleanup failed");
            }
        }

        let model_id = spec.model_id();
        if let Err(e) = self
            .store
            .set(model_id, &spec.base().parameter_record())
            .await
        {
            tracing::error!(model_id, error = %e, "Failed to store model parameters");
        }
        if let Err(e) = self.store.set_last_model(model_id).await {
            tracing::error!(model_id, error = %e, "Failed to store last used model");
        }
    }

    async fn update_job(&self, job_id: Uuid, apply: impl FnOnce(&mut GenerationJob)) {
        if let Some(tracked) = self
            .current
            .lock()
            .await
            .as_mut()
            .filter(|t| t.job.id == job_id)
        {
            apply(&mut tracked.job);
        }
    }

    fn interrupt_backend(&self, prompt_id: String) {
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            if let Err(e) = backend.interrupt().await {
                tracing::warn!(error = %e, "Interrupt request failed");
            }
            if let Err(e) = backend.cancel_execution(&prompt_id).await {
                tracing::debug!(prompt_id = %prompt_id, error = %e, "Queue removal failed");
            }
        });
    }
}

/// Resolves once the session is no longer open.
async fn connection_lost(state: &mut watch::Receiver<SessionState>) {
    loop {
        if *state.borrow_and_update() != SessionState::Open {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagegen_comfyui::testing::tiny_png;

    #[test]
    fn artifact_reads_dimensions_and_keeps_mime() {
        let artifact = Artifact::new("image/png", tiny_png());
        assert_eq!(artifact.width, Some(1));
        assert_eq!(artifact.height, Some(1));
        assert_eq!(artifact.extension(), "png");
        assert!(artifact.to_data_url().starts_with("data:image/png;base64,iVBORw0KGgo"));
    }

    #[test]
    fn unreadable_artifact_has_no_dimensions() {
        let artifact = Artifact::new("image/jpeg", vec![0, 1, 2]);
        assert_eq!(artifact.width, None);
        assert_eq!(artifact.extension(), "jpg");
        assert_eq!(artifact.to_data_url(), "data:image/jpeg;base64,AAEC");
    }

    #[test]
    fn terminal_reasons_are_distinct() {
        let timeout = GenerationError::GenerationTimeout(300).job_status();
        let failed = GenerationError::GenerationFailed("CUDA out of memory".into()).job_status();
        let cancelled = GenerationError::Cancelled.job_status();

        assert_eq!(timeout.label(), "timed_out");
        assert!(timeout.reason().unwrap().contains("300s"));
        assert_eq!(failed.reason(), Some("Generation failed: CUDA out of memory"));
        assert_eq!(cancelled.label(), "cancelled");
        assert_ne!(timeout.reason(), failed.reason());
        assert_ne!(timeout.reason(), cancelled.reason());
    }

    #[test]
    fn session_errors_map_to_generation_errors() {
        let budget = Duration::from_secs(15);
        assert_eq!(
            GenerationError::from(SessionError::ConnectionTimeout { budget }),
            GenerationError::ConnectionTimeout(budget)
        );
        assert_eq!(
            GenerationError::from(SessionError::BackendUnavailable("refused".into())),
            GenerationError::BackendUnavailable("refused".into())
        );
    }

    #[test]
    fn default_ceiling_is_five_minutes() {
        assert_eq!(
            ExecutorConfig::default().generation_timeout,
            Duration::from_secs(300)
        );
    }
}
