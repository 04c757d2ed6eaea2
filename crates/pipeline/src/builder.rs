//! Pipeline builder.
//!
//! [`build`] turns a [`GenerationOptions`] set into a [`PipelineSpec`],
//! one of two tagged constructors:
//!
//! - [`MinimalSpec`]: base parameters only. It has no way to hold
//!   attachments.
//! - [`ExtendedSpec`]: base parameters plus an ordered list of
//!   [`Attachment`]s, added one step at a time through the pure
//!   [`ExtendedSpec::apply`].
//!
//! The extended variant is chosen whenever an input image, a control
//! adapter or a style adapter is selected. Attachments are applied in a
//! fixed order (control adapter, input image, style adapter) so the
//! compiled graph always has the same shape for the same options.

use imagegen_core::error::CoreError;
use imagegen_core::generation::{
    GenerationOptions, InputImage, DEFAULT_CONTROL_STRENGTH, DEFAULT_STYLE_STRENGTH,
};
use imagegen_core::model_defaults::ParameterRecord;
use imagegen_core::resolution;
use serde::Serialize;

use crate::graph::WorkflowGraph;

/// Parameters every pipeline carries, fully resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaseParams {
    pub model_id: String,
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f64,
    pub denoise: f64,
    pub sampler: String,
    pub scheduler: String,
    pub seed: u64,
}

impl BaseParams {
    /// The record remembered for the model after a successful run.
    pub fn parameter_record(&self) -> ParameterRecord {
        ParameterRecord {
            denoise: self.denoise,
            steps: self.steps,
            guidance: self.guidance,
            sampler: self.sampler.clone(),
            scheduler: self.scheduler.clone(),
            negative_terms: split_terms(&self.negative_prompt),
        }
    }
}

/// A per-node graph extension. Only [`ExtendedSpec`] holds these.
#[derive(Debug, Clone, PartialEq)]
pub enum Attachment {
    /// Guidance-conditioning adapter driven by the input image.
    ControlAdapter {
        name: String,
        image: InputImage,
        strength: f64,
    },
    /// Image-to-image source.
    InputImage { image: InputImage },
    /// Weight-blended style adapter.
    StyleAdapter { name: String, strength: f64 },
}

impl Attachment {
    pub fn kind(&self) -> &'static str {
        match self {
            Attachment::ControlAdapter { .. } => "control_adapter",
            Attachment::InputImage { .. } => "input_image",
            Attachment::StyleAdapter { .. } => "style_adapter",
        }
    }

    pub fn image(&self) -> Option<&InputImage> {
        match self {
            Attachment::ControlAdapter { image, .. } | Attachment::InputImage { image } => {
                Some(image)
            }
            Attachment::StyleAdapter { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MinimalSpec {
    pub base: BaseParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedSpec {
    pub base: BaseParams,
    pub attachments: Vec<Attachment>,
}

impl ExtendedSpec {
    pub fn new(base: BaseParams) -> Self {
        Self {
            base,
            attachments: Vec::new(),
        }
    }

    /// Return a new spec with `step` appended.
    #[must_use]
    pub fn apply(self, step: Attachment) -> Self {
        let mut attachments = self.attachments;
        attachments.push(step);
        Self {
            base: self.base,
            attachments,
        }
    }
}

/// Which builder variant produced a spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderVariant {
    Minimal,
    Extended,
}

/// Fully resolved description of one generation request.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineSpec {
    Minimal(MinimalSpec),
    Extended(ExtendedSpec),
}

impl PipelineSpec {
    pub fn base(&self) -> &BaseParams {
        match self {
            PipelineSpec::Minimal(spec) => &spec.base,
            PipelineSpec::Extended(spec) => &spec.base,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.base().model_id
    }

    pub fn variant(&self) -> BuilderVariant {
        match self {
            PipelineSpec::Minimal(_) => BuilderVariant::Minimal,
            PipelineSpec::Extended(_) => BuilderVariant::Extended,
        }
    }

    pub fn attachments(&self) -> &[Attachment] {
        match self {
            PipelineSpec::Minimal(_) => &[],
            PipelineSpec::Extended(spec) => &spec.attachments,
        }
    }

    /// The input image referenced by any attachment.
    pub fn input_image(&self) -> Option<&InputImage> {
        self.attachments().iter().find_map(Attachment::image)
    }

    /// Compile into a node graph, referring to the input image by
    /// `uploaded_name` when it has been stored on the backend.
    pub fn to_graph(&self, uploaded_name: Option<&str>) -> WorkflowGraph {
        WorkflowGraph::compile(self, uploaded_name)
    }

    /// SHA-256 of the compiled graph, independent of upload naming.
    pub fn fingerprint(&self) -> String {
        self.to_graph(None).fingerprint()
    }
}

/// Build a pipeline spec from user options.
///
/// The custom resolution sentinel is replaced first, then the options
/// are validated and a seed is drawn if none was fixed.
pub fn build(options: &GenerationOptions) -> Result<PipelineSpec, CoreError> {
    let (width, height) = resolution::resolve(options.resolution, options.custom_size())?;
    options.check()?;

    let base = BaseParams {
        model_id: options.model_id.clone(),
        positive_prompt: options.positive_prompt.clone(),
        negative_prompt: options.negative_prompt.clone(),
        width,
        height,
        steps: options.steps,
        guidance: options.guidance,
        denoise: options.denoise,
        sampler: options.sampler.clone(),
        scheduler: options.scheduler.clone(),
        seed: options.seed.unwrap_or_else(rand::random),
    };

    let spec = if options.has_attachments() {
        PipelineSpec::Extended(attach(ExtendedSpec::new(base), options))
    } else {
        PipelineSpec::Minimal(MinimalSpec { base })
    };

    tracing::debug!(
        model_id = %spec.model_id(),
        variant = ?spec.variant(),
        attachments = spec.attachments().len(),
        fingerprint = %spec.fingerprint(),
        "Pipeline spec built",
    );
    Ok(spec)
}

/// Apply the selected attachments in their fixed order.
fn attach(mut spec: ExtendedSpec, options: &GenerationOptions) -> ExtendedSpec {
    if let (Some(name), Some(image)) = (&options.control_adapter, &options.input_image) {
        spec = spec.apply(Attachment::ControlAdapter {
            name: name.clone(),
            image: image.clone(),
            strength: options.control_strength.unwrap_or(DEFAULT_CONTROL_STRENGTH),
        });
    }
    if let Some(image) = &options.input_image {
        spec = spec.apply(Attachment::InputImage {
            image: image.clone(),
        });
    }
    if let Some(name) = &options.style_adapter {
        spec = spec.apply(Attachment::StyleAdapter {
            name: name.clone(),
            strength: options.style_strength.unwrap_or(DEFAULT_STYLE_STRENGTH),
        });
    }

    spec
}

fn split_terms(negative_prompt: &str) -> Vec<String> {
    negative_prompt
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use imagegen_core::model_defaults::heuristic_defaults;
    use imagegen_core::resolution::ResolutionChoice;

    use super::*;

    fn options() -> GenerationOptions {
        let mut options = GenerationOptions::from_parameters(
            "sd_xl_base_1.0.safetensors",
            "a lighthouse at dusk",
            &heuristic_defaults("sd_xl_base_1.0.safetensors"),
        );
        options.seed = Some(42);
        options
    }

    fn image() -> InputImage {
        InputImage {
            name: "sketch.png".into(),
            bytes: vec![1, 2, 3],
        }
    }

    #[test]
    fn plain_options_build_minimal_spec() {
        let spec = build(&options()).unwrap();
        assert_matches!(spec, PipelineSpec::Minimal(_));
        assert!(spec.attachments().is_empty());
        assert_eq!(spec.base().seed, 42);
        assert_eq!((spec.base().width, spec.base().height), (1024, 1024));
    }

    #[test]
    fn attachments_apply_in_fixed_order() {
        let mut opts = options();
        opts.style_adapter = Some("ink.safetensors".into());
        opts.input_image = Some(image());
        opts.control_adapter = Some("canny.safetensors".into());

        let spec = build(&opts).unwrap();
        let kinds: Vec<_> = spec.attachments().iter().map(Attachment::kind).collect();
        assert_eq!(kinds, vec!["control_adapter", "input_image", "style_adapter"]);
    }

    #[test]
    fn control_adapter_without_image_is_ignored() {
        let mut opts = options();
        opts.control_adapter = Some("canny.safetensors".into());

        let spec = build(&opts).unwrap();
        assert_eq!(spec.variant(), BuilderVariant::Extended);
        assert!(spec.attachments().is_empty());
    }

    #[test]
    fn strengths_default_when_unset() {
        let mut opts = options();
        opts.style_adapter = Some("ink.safetensors".into());
        opts.input_image = Some(image());
        opts.control_adapter = Some("canny.safetensors".into());

        let spec = build(&opts).unwrap();
        assert_matches!(
            &spec.attachments()[0],
            Attachment::ControlAdapter { strength, .. } if *strength == DEFAULT_CONTROL_STRENGTH
        );
        assert_matches!(
            &spec.attachments()[2],
            Attachment::StyleAdapter { strength, .. } if *strength == DEFAULT_STYLE_STRENGTH
        );
    }

    #[test]
    fn explicit_style_strength_is_kept() {
        let mut opts = options();
        opts.style_adapter = Some("ink.safetensors".into());
        opts.style_strength = Some(0.4);

        let spec = build(&opts).unwrap();
        assert_matches!(
            &spec.attachments()[0],
            Attachment::StyleAdapter { strength, .. } if *strength == 0.4
        );
    }

    #[test]
    fn apply_returns_new_value() {
        let base = build(&options()).unwrap().base().clone();
        let empty = ExtendedSpec::new(base);
        let extended = empty.clone().apply(Attachment::StyleAdapter {
            name: "ink".into(),
            strength: 1.0,
        });
        assert!(empty.attachments.is_empty());
        assert_eq!(extended.attachments.len(), 1);
    }

    #[test]
    fn missing_seed_is_drawn() {
        let mut opts = options();
        opts.seed = None;
        let a = build(&opts).unwrap();
        let b = build(&opts).unwrap();
        // Two draws colliding is a 1 in 2^64 event.
        assert_ne!(a.base().seed, b.base().seed);
    }

    #[test]
    fn custom_resolution_is_substituted() {
        let mut opts = options();
        opts.resolution = ResolutionChoice::Custom;
        opts.custom_width = Some(640);
        opts.custom_height = Some(960);

        let spec = build(&opts).unwrap();
        assert_eq!((spec.base().width, spec.base().height), (640, 960));
    }

    #[test]
    fn custom_resolution_without_size_is_rejected() {
        let mut opts = options();
        opts.resolution = ResolutionChoice::Custom;
        opts.custom_width = Some(640);

        assert_matches!(build(&opts), Err(CoreError::Validation(_)));
    }

    #[test]
    fn invalid_options_are_rejected() {
        let mut opts = options();
        opts.steps = 0;
        assert_matches!(build(&opts), Err(CoreError::Validation(_)));

        let mut opts = options();
        opts.model_id.clear();
        assert_matches!(build(&opts), Err(CoreError::Validation(_)));
    }

    #[test]
    fn parameter_record_splits_negative_terms() {
        let mut opts = options();
        opts.negative_prompt = "blurry,  watermark , ,text".into();
        let record = build(&opts).unwrap().base().parameter_record();
        assert_eq!(record.negative_terms, vec!["blurry", "watermark", "text"]);
        assert_eq!(record.steps, 22);
    }
}
