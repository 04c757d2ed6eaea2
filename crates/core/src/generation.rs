//! Generation options and job bookkeeping.
//!
//! [`GenerationOptions`] is the user-selected option set handed to the
//! pipeline builder. [`JobStatus`] and [`GenerationJob`] describe one
//! execution attempt as seen by display collaborators.

use std::fmt;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::model_defaults::ParameterRecord;
use crate::resolution::ResolutionChoice;
use crate::types::Timestamp;

/* --------------------------------------------------------------------------
Limits
-------------------------------------------------------------------------- */

/// Maximum sampling steps accepted.
pub const MAX_STEPS: u32 = 200;

/// Maximum classifier-free guidance scale accepted.
pub const MAX_GUIDANCE: f64 = 30.0;

/// Strength applied to a style adapter when none is selected.
pub const DEFAULT_STYLE_STRENGTH: f64 = 0.75;

/// Strength applied to an auxiliary (control) adapter when none is selected.
pub const DEFAULT_CONTROL_STRENGTH: f64 = 1.0;

/* --------------------------------------------------------------------------
Options
-------------------------------------------------------------------------- */

/// An image supplied by the user, either as img2img source or as the
/// conditioning image of an auxiliary adapter.
#[derive(Clone, PartialEq)]
pub struct InputImage {
    /// File name used when uploading to the backend.
    pub name: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for InputImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputImage")
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Everything the user selected for one generation.
#[derive(Debug, Clone, PartialEq, Validate)]
pub struct GenerationOptions {
    #[validate(length(min = 1, message = "a model must be selected"))]
    pub model_id: String,
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub resolution: ResolutionChoice,
    /// Explicit size used when `resolution` is the custom sentinel.
    pub custom_width: Option<u32>,
    pub custom_height: Option<u32>,
    #[validate(range(min = 1, max = 200))]
    pub steps: u32,
    #[validate(range(min = 0.0, max = 30.0))]
    pub guidance: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub denoise: f64,
    #[validate(length(min = 1))]
    pub sampler: String,
    #[validate(length(min = 1))]
    pub scheduler: String,
    /// Fixed seed; a random one is drawn at build time when absent.
    pub seed: Option<u64>,
    pub input_image: Option<InputImage>,
    /// Auxiliary (control) adapter file name.
    pub control_adapter: Option<String>,
    #[validate(range(min = 0.0, max = 2.0))]
    pub control_strength: Option<f64>,
    /// Style adapter file name.
    pub style_adapter: Option<String>,
    #[validate(range(min = -4.0, max = 4.0))]
    pub style_strength: Option<f64>,
}

impl GenerationOptions {
    /// Seed an option set from the parameters remembered for `model_id`.
    pub fn from_parameters(
        model_id: impl Into<String>,
        positive_prompt: impl Into<String>,
        params: &ParameterRecord,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            positive_prompt: positive_prompt.into(),
            negative_prompt: params.negative_prompt(),
            resolution: ResolutionChoice::default(),
            custom_width: None,
            custom_height: None,
            steps: params.steps,
            guidance: params.guidance,
            denoise: params.denoise,
            sampler: params.sampler.clone(),
            scheduler: params.scheduler.clone(),
            seed: None,
            input_image: None,
            control_adapter: None,
            control_strength: None,
            style_adapter: None,
            style_strength: None,
        }
    }

    /// Run field validation, mapping failures into [`CoreError::Validation`].
    pub fn check(&self) -> Result<(), CoreError> {
        self.validate()?;
        // Range validators let NaN through.
        let floats = [
            ("guidance", Some(self.guidance)),
            ("denoise", Some(self.denoise)),
            ("control_strength", self.control_strength),
            ("style_strength", self.style_strength),
        ];
        for (name, value) in floats {
            if value.is_some_and(|v| !v.is_finite()) {
                return Err(CoreError::Validation(format!("{name} must be a finite number")));
            }
        }
        Ok(())
    }

    /// Explicit custom size, if both fields are set.
    pub fn custom_size(&self) -> Option<(u32, u32)> {
        self.custom_width.zip(self.custom_height)
    }

    /// Whether any attachment needing per-node graph extension is selected.
    pub fn has_attachments(&self) -> bool {
        self.input_image.is_some() || self.control_adapter.is_some() || self.style_adapter.is_some()
    }
}

/* --------------------------------------------------------------------------
Job status
-------------------------------------------------------------------------- */

/// Step-level progress reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub value: u32,
    pub max: u32,
}

impl Progress {
    /// Completion percentage (0-100).
    pub fn percent(&self) -> u8 {
        if self.max == 0 {
            return 0;
        }
        ((u64::from(self.value.min(self.max)) * 100) / u64::from(self.max)) as u8
    }
}

/// Lifecycle of one generation job.
///
/// Every terminal variant other than `Succeeded` carries a reason string
/// phrased so the three failure kinds can be told apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed { reason: String },
    Cancelled { reason: String },
    TimedOut { reason: String },
}

impl JobStatus {
    pub fn failed(message: &str) -> Self {
        JobStatus::Failed {
            reason: format!("Generation failed: {message}"),
        }
    }

    pub fn cancelled() -> Self {
        JobStatus::Cancelled {
            reason: "Generation cancelled by user".to_string(),
        }
    }

    pub fn timed_out(after_secs: u64) -> Self {
        JobStatus::TimedOut {
            reason: format!(
                "Generation timed out after {after_secs}s; the backend may still be processing it"
            ),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    /// `retry()` is only valid after these states.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobStatus::Failed { .. } | JobStatus::TimedOut { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            JobStatus::Failed { reason }
            | JobStatus::Cancelled { reason }
            | JobStatus::TimedOut { reason } => Some(reason),
            JobStatus::Running | JobStatus::Succeeded => None,
        }
    }

    /// Short machine-friendly label.
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed { .. } => "failed",
            JobStatus::Cancelled { .. } => "cancelled",
            JobStatus::TimedOut { .. } => "timed_out",
        }
    }
}

/// Snapshot of one in-flight or completed generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationJob {
    pub id: uuid::Uuid,
    pub started_at: Timestamp,
    /// Backend-assigned prompt id once submitted.
    pub prompt_id: Option<String>,
    pub progress: Option<Progress>,
    pub status: JobStatus,
}

impl GenerationJob {
    pub fn start() -> Self {
        Self {
            id: uuid::Uuid::now_v7(),
            started_at: chrono::Utc::now(),
            prompt_id: None,
            progress: None,
            status: JobStatus::Running,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_defaults::heuristic_defaults;

    fn options() -> GenerationOptions {
        GenerationOptions::from_parameters("sdxl.safetensors", "a lighthouse", &heuristic_defaults("sdxl"))
    }

    #[test]
    fn options_from_parameters_copy_sampling_fields() {
        let opts = options();
        assert_eq!(opts.steps, 22);
        assert_eq!(opts.sampler, "euler");
        assert!(opts.negative_prompt.contains("lowres"));
        assert!(!opts.has_attachments());
        assert!(opts.check().is_ok());
    }

    #[test]
    fn empty_model_rejected() {
        let mut opts = options();
        opts.model_id.clear();
        assert!(opts.check().is_err());
    }

    #[test]
    fn non_finite_floats_rejected() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let setters: [fn(&mut GenerationOptions, f64); 4] = [
                |o, v| o.guidance = v,
                |o, v| o.denoise = v,
                |o, v| o.control_strength = Some(v),
                |o, v| o.style_strength = Some(v),
            ];
            for set in setters {
                let mut opts = options();
                set(&mut opts, bad);
                assert!(
                    matches!(opts.check(), Err(CoreError::Validation(_))),
                    "{bad} accepted"
                );
            }
        }
    }

    #[test]
    fn out_of_range_steps_rejected() {
        let mut opts = options();
        opts.steps = 0;
        assert!(opts.check().is_err());
        opts.steps = MAX_STEPS + 1;
        assert!(opts.check().is_err());
    }

    #[test]
    fn custom_size_requires_both_fields() {
        let mut opts = options();
        opts.custom_width = Some(640);
        assert_eq!(opts.custom_size(), None);
        opts.custom_height = Some(480);
        assert_eq!(opts.custom_size(), Some((640, 480)));
    }

    #[test]
    fn any_single_attachment_counts() {
        let mut opts = options();
        opts.style_adapter = Some("ink.safetensors".into());
        assert!(opts.has_attachments());

        let mut opts = options();
        opts.control_adapter = Some("canny.safetensors".into());
        assert!(opts.has_attachments());

        let mut opts = options();
        opts.input_image = Some(InputImage {
            name: "in.png".into(),
            bytes: vec![1, 2, 3],
        });
        assert!(opts.has_attachments());
    }

    #[test]
    fn terminal_reasons_are_distinct() {
        let failed = JobStatus::failed("CUDA out of memory");
        let timed_out = JobStatus::timed_out(300);
        let cancelled = JobStatus::cancelled();

        assert_eq!(failed.reason(), Some("Generation failed: CUDA out of memory"));
        assert!(timed_out.reason().unwrap().contains("timed out after 300s"));
        assert_ne!(failed.reason(), timed_out.reason());
        assert_ne!(timed_out.reason(), cancelled.reason());
        assert_ne!(failed.reason(), cancelled.reason());
    }

    #[test]
    fn only_failed_and_timed_out_are_retryable() {
        assert!(JobStatus::failed("x").is_retryable());
        assert!(JobStatus::timed_out(1).is_retryable());
        assert!(!JobStatus::cancelled().is_retryable());
        assert!(!JobStatus::Succeeded.is_retryable());
        assert!(!JobStatus::Running.is_retryable());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn progress_percent_handles_zero_max() {
        assert_eq!(Progress { value: 5, max: 20 }.percent(), 25);
        assert_eq!(Progress { value: 3, max: 0 }.percent(), 0);
        assert_eq!(Progress { value: 30, max: 20 }.percent(), 100);
    }
}
