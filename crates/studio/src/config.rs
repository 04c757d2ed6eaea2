use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use imagegen_comfyui::readiness::ReadinessConfig;
use imagegen_core::resolution::ResolutionChoice;
use imagegen_pipeline::ExecutorConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Studio configuration loaded from environment variables.
///
/// | Env Var                    | Default                          |
/// |----------------------------|----------------------------------|
/// | `COMFYUI_URL`              | `http://127.0.0.1:8188`          |
/// | `IMAGEGEN_DB_URL`          | `sqlite://imagegen.db?mode=rwc`  |
/// | `IMAGEGEN_OUTPUT_DIR`      | `./outputs`                      |
/// | `IMAGEGEN_MODEL`           | last used, else first checkpoint |
/// | `IMAGEGEN_PROMPT`          | first CLI argument (required)    |
/// | `IMAGEGEN_RESOLUTION`      | `1024x1024`                      |
/// | `SESSION_WAIT_SECS`        | `15`                             |
/// | `GENERATION_TIMEOUT_SECS`  | `300`                            |
#[derive(Debug, Clone)]
pub struct StudioConfig {
    pub comfyui_url: String,
    pub database_url: String,
    pub output_dir: PathBuf,
    pub model: Option<String>,
    pub prompt: String,
    pub resolution: ResolutionChoice,
    pub custom_width: Option<u32>,
    pub custom_height: Option<u32>,
    pub style_adapter: Option<String>,
    pub style_strength: Option<f64>,
    pub control_adapter: Option<String>,
    pub input_image: Option<PathBuf>,
    pub session_wait: Duration,
    pub generation_timeout: Duration,
}

impl StudioConfig {
    /// Load from the process environment. `prompt_arg` (the first CLI
    /// argument) wins over `IMAGEGEN_PROMPT`.
    pub fn from_env(prompt_arg: Option<String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok(), prompt_arg)
    }

    fn from_lookup(
        var: impl Fn(&str) -> Option<String>,
        prompt_arg: Option<String>,
    ) -> Result<Self, ConfigError> {
        let var = |name: &str| var(name).filter(|v| !v.trim().is_empty());

        let prompt = prompt_arg
            .filter(|p| !p.trim().is_empty())
            .or_else(|| var("IMAGEGEN_PROMPT"))
            .ok_or(ConfigError::Missing("IMAGEGEN_PROMPT"))?;

        let resolution = match var("IMAGEGEN_RESOLUTION") {
            Some(raw) => ResolutionChoice::from_str(&raw).map_err(|e| ConfigError::Invalid {
                name: "IMAGEGEN_RESOLUTION",
                reason: e.to_string(),
            })?,
            None => ResolutionChoice::default(),
        };

        Ok(Self {
            comfyui_url: var("COMFYUI_URL").unwrap_or_else(|| "http://127.0.0.1:8188".into()),
            database_url: var("IMAGEGEN_DB_URL")
                .unwrap_or_else(|| "sqlite://imagegen.db?mode=rwc".into()),
            output_dir: var("IMAGEGEN_OUTPUT_DIR")
                .unwrap_or_else(|| "./outputs".into())
                .into(),
            model: var("IMAGEGEN_MODEL"),
            prompt,
            resolution,
            custom_width: parse(&var, "IMAGEGEN_CUSTOM_WIDTH")?,
            custom_height: parse(&var, "IMAGEGEN_CUSTOM_HEIGHT")?,
            style_adapter: var("IMAGEGEN_STYLE_ADAPTER"),
            style_strength: parse(&var, "IMAGEGEN_STYLE_STRENGTH")?,
            control_adapter: var("IMAGEGEN_CONTROL_ADAPTER"),
            input_image: var("IMAGEGEN_INPUT_IMAGE").map(PathBuf::from),
            session_wait: Duration::from_secs(
                parse(&var, "SESSION_WAIT_SECS")?.unwrap_or(15),
            ),
            generation_timeout: Duration::from_secs(
                parse(&var, "GENERATION_TIMEOUT_SECS")?.unwrap_or(300),
            ),
        })
    }

    pub fn readiness(&self) -> ReadinessConfig {
        ReadinessConfig {
            wait_budget: self.session_wait,
            ..ReadinessConfig::default()
        }
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            generation_timeout: self.generation_timeout,
            ..ExecutorConfig::default()
        }
    }
}

fn parse<T>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            })
        })
        .transpose()
}
