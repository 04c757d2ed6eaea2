//! Per-model generation defaults.
//!
//! A [`ParameterRecord`] holds the sampling parameters remembered for one
//! model. When nothing is stored for a model, [`heuristic_defaults`]
//! picks a tuple by recognising the model family from its identifier.
//! Stored records that predate a field fall back to the heuristic value
//! for that field only (see [`StoredParameters::resolve`]).

use serde::{Deserialize, Serialize};

/// Sampling parameters remembered for a single model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    pub denoise: f64,
    pub steps: u32,
    pub guidance: f64,
    pub sampler: String,
    pub scheduler: String,
    pub negative_terms: Vec<String>,
}

impl ParameterRecord {
    /// Negative terms joined into a prompt string.
    pub fn negative_prompt(&self) -> String {
        self.negative_terms.join(", ")
    }
}

/// Model families recognisable from the identifier string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Flux,
    Xl,
    Sd15,
    Unknown,
}

impl ModelFamily {
    /// Match the identifier against known family markers.
    ///
    /// Checked in order `flux`, `xl`, `1.5`, so `flux-xl-merge` is Flux.
    pub fn detect(model_id: &str) -> Self {
        let id = model_id.to_ascii_lowercase();
        if id.contains("flux") {
            ModelFamily::Flux
        } else if id.contains("xl") {
            ModelFamily::Xl
        } else if id.contains("1.5") || id.contains("1-5") || id.contains("1_5") {
            ModelFamily::Sd15
        } else {
            ModelFamily::Unknown
        }
    }
}

const COMMON_NEGATIVES: &[&str] = &["lowres", "bad anatomy", "blurry", "watermark", "text"];

fn terms(list: &[&str]) -> Vec<String> {
    list.iter().map(|t| (*t).to_string()).collect()
}

/// Fixed default tuple for a family.
pub fn family_defaults(family: ModelFamily) -> ParameterRecord {
    match family {
        ModelFamily::Flux => ParameterRecord {
            denoise: 1.0,
            steps: 20,
            guidance: 1.0,
            sampler: "euler".into(),
            scheduler: "simple".into(),
            negative_terms: Vec::new(),
        },
        ModelFamily::Xl => ParameterRecord {
            denoise: 1.0,
            steps: 22,
            guidance: 8.0,
            sampler: "euler".into(),
            scheduler: "normal".into(),
            negative_terms: terms(COMMON_NEGATIVES),
        },
        ModelFamily::Sd15 => ParameterRecord {
            denoise: 1.0,
            steps: 25,
            guidance: 7.5,
            sampler: "dpmpp_2m".into(),
            scheduler: "karras".into(),
            negative_terms: terms(&[
                "lowres",
                "bad anatomy",
                "bad hands",
                "blurry",
                "watermark",
                "text",
            ]),
        },
        ModelFamily::Unknown => ParameterRecord {
            denoise: 1.0,
            steps: 30,
            guidance: 7.5,
            sampler: "euler".into(),
            scheduler: "normal".into(),
            negative_terms: terms(COMMON_NEGATIVES),
        },
    }
}

/// Heuristic defaults for a model without stored parameters.
pub fn heuristic_defaults(model_id: &str) -> ParameterRecord {
    family_defaults(ModelFamily::detect(model_id))
}

/// Persisted shape of a [`ParameterRecord`].
///
/// Every field is optional so that records written by an older schema
/// still deserialize; missing fields are filled per field from the
/// heuristic defaults at read time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredParameters {
    pub denoise: Option<f64>,
    pub steps: Option<u32>,
    pub guidance: Option<f64>,
    pub sampler: Option<String>,
    pub scheduler: Option<String>,
    pub negative_terms: Option<Vec<String>>,
}

impl StoredParameters {
    /// Fill missing fields from `defaults`.
    pub fn resolve(self, defaults: ParameterRecord) -> ParameterRecord {
        ParameterRecord {
            denoise: self.denoise.unwrap_or(defaults.denoise),
            steps: self.steps.unwrap_or(defaults.steps),
            guidance: self.guidance.unwrap_or(defaults.guidance),
            sampler: self.sampler.unwrap_or(defaults.sampler),
            scheduler: self.scheduler.unwrap_or(defaults.scheduler),
            negative_terms: self.negative_terms.unwrap_or(defaults.negative_terms),
        }
    }
}

impl From<&ParameterRecord> for StoredParameters {
    fn from(record: &ParameterRecord) -> Self {
        Self {
            denoise: Some(record.denoise),
            steps: Some(record.steps),
            guidance: Some(record.guidance),
            sampler: Some(record.sampler.clone()),
            scheduler: Some(record.scheduler.clone()),
            negative_terms: Some(record.negative_terms.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdxl_model_gets_xl_defaults() {
        let record = heuristic_defaults("sdxl_base_1.0.safetensors");
        assert_eq!(record.steps, 22);
        assert_eq!(record.guidance, 8.0);
        assert_eq!(record.sampler, "euler");
        assert_eq!(record.scheduler, "normal");
    }

    #[test]
    fn family_detection_is_case_insensitive() {
        assert_eq!(ModelFamily::detect("FLUX1-dev.safetensors"), ModelFamily::Flux);
        assert_eq!(ModelFamily::detect("JuggernautXL_v9"), ModelFamily::Xl);
        assert_eq!(ModelFamily::detect("v1-5-pruned-emaonly"), ModelFamily::Sd15);
        assert_eq!(ModelFamily::detect("sd 1.5 realistic"), ModelFamily::Sd15);
        assert_eq!(ModelFamily::detect("dreamshaper_8"), ModelFamily::Unknown);
    }

    #[test]
    fn flux_marker_wins_over_xl_marker() {
        assert_eq!(ModelFamily::detect("flux-xl-merge"), ModelFamily::Flux);
    }

    #[test]
    fn unknown_family_uses_global_default() {
        let record = heuristic_defaults("mystery-model");
        assert_eq!(record, family_defaults(ModelFamily::Unknown));
        assert_eq!(record.steps, 30);
    }

    #[test]
    fn flux_has_no_negative_terms() {
        assert!(heuristic_defaults("flux1-schnell").negative_terms.is_empty());
    }

    #[test]
    fn missing_stored_fields_fall_back_per_field() {
        let stored: StoredParameters =
            serde_json::from_str(r#"{"steps": 40, "sampler": "dpmpp_sde"}"#).unwrap();
        let record = stored.resolve(heuristic_defaults("sdxl"));
        assert_eq!(record.steps, 40);
        assert_eq!(record.sampler, "dpmpp_sde");
        assert_eq!(record.scheduler, "normal");
        assert_eq!(record.guidance, 8.0);
    }

    #[test]
    fn unknown_stored_fields_are_ignored() {
        let stored: StoredParameters =
            serde_json::from_str(r#"{"steps": 12, "clip_skip": 2}"#).unwrap();
        assert_eq!(stored.steps, Some(12));
    }

    #[test]
    fn negative_prompt_joins_terms() {
        let record = family_defaults(ModelFamily::Xl);
        assert_eq!(
            record.negative_prompt(),
            "lowres, bad anatomy, blurry, watermark, text"
        );
    }
}
