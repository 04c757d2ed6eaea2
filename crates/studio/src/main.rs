use std::path::{Path, PathBuf};
use std::sync::Arc;

use imagegen_comfyui::catalog::CatalogError;
use imagegen_comfyui::{CatalogLoader, ComfyUIApi, ComfyUIClient, SessionManager};
use imagegen_core::generation::{GenerationOptions, InputImage};
use imagegen_db::{ModelParameterStore, StoreError};
use imagegen_events::{EventBus, GenerationEvent};
use imagegen_pipeline::{Executor, GenerationError, GenerationResult, ResultHistory};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

use config::{ConfigError, StudioConfig};

#[derive(Debug, thiserror::Error)]
enum StudioError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("No model selected and the backend reports no checkpoints")]
    NoModel,

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "imagegen_studio=info,imagegen_comfyui=info,imagegen_pipeline=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Studio run failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StudioError> {
    let config = StudioConfig::from_env(std::env::args().nth(1))?;

    let client = ComfyUIClient::from_base_url(&config.comfyui_url);
    let api = Arc::new(ComfyUIApi::new(client.api_url().to_string()));
    let sessions = Arc::new(SessionManager::new(Arc::new(client), config.readiness()));
    tracing::info!(url = %config.comfyui_url, "Using ComfyUI backend");

    let store = ModelParameterStore::init(&config.database_url).await?;
    imagegen_db::health_check(store.pool())
        .await
        .map_err(StoreError::from)?;
    tracing::info!("Model parameter store ready");

    let catalog = Arc::new(CatalogLoader::new(api.clone(), sessions.clone()));
    let refresh = catalog.refresh().await?;
    if refresh.is_partial() {
        tracing::warn!(
            failed_categories = refresh.failures.len(),
            "Continuing with a partial capability catalog",
        );
    }
    let background = CancellationToken::new();
    let watcher = catalog
        .clone()
        .spawn_refresh_on_reconnect(background.clone());

    let last_model = match config.model {
        Some(_) => None,
        None => store.last_model().await?,
    };
    let model_id = choose_model(
        config.model.as_deref(),
        &refresh.catalog.checkpoints,
        last_model.as_deref(),
    )
    .ok_or(StudioError::NoModel)?;
    if !refresh.catalog.checkpoints.is_empty() && !refresh.catalog.checkpoints.contains(&model_id)
    {
        tracing::warn!(model_id = %model_id, "Model is not in the backend catalog");
    }

    let options = options_for(&config, &store, &model_id).await?;

    let bus = Arc::new(EventBus::default());
    let progress = spawn_progress_log(&bus);
    let history = Arc::new(ResultHistory::default());
    let executor = Arc::new(
        Executor::new(sessions.clone(), api, store, bus, history).with_config(config.executor()),
    );

    let on_interrupt = tokio::spawn({
        let executor = executor.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                executor.cancel().await;
            }
        }
    });

    let outcome = executor.generate(&options).await;
    on_interrupt.abort();
    background.cancel();
    let _ = watcher.await;
    progress.abort();
    sessions.teardown().await;

    let result = outcome?;
    write_artifacts(&config.output_dir, &result).await
}

/// Model for this run: the explicit choice, else the last used model if
/// the backend still has it, else the first checkpoint. With an empty
/// catalog the last used model is taken on trust.
fn choose_model(
    explicit: Option<&str>,
    checkpoints: &[String],
    last: Option<&str>,
) -> Option<String> {
    if let Some(model) = explicit {
        return Some(model.to_string());
    }
    match last {
        Some(last) if checkpoints.is_empty() || checkpoints.iter().any(|c| c == last) => {
            Some(last.to_string())
        }
        _ => checkpoints.first().cloned(),
    }
}

/// Seed options from the parameters remembered for the model, then apply
/// the per-run overrides.
async fn options_for(
    config: &StudioConfig,
    store: &ModelParameterStore,
    model_id: &str,
) -> Result<GenerationOptions, StudioError> {
    let params = store.get(model_id).await?;
    let mut options = GenerationOptions::from_parameters(model_id, &config.prompt, &params);
    options.resolution = config.resolution;
    options.custom_width = config.custom_width;
    options.custom_height = config.custom_height;
    options.style_adapter = config.style_adapter.clone();
    options.style_strength = config.style_strength;
    options.control_adapter = config.control_adapter.clone();

    if let Some(path) = &config.input_image {
        let bytes = tokio::fs::read(path).await.map_err(|source| StudioError::Io {
            path: path.clone(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input.png".to_string());
        options.input_image = Some(InputImage { name, bytes });
    }
    Ok(options)
}

fn spawn_progress_log(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut events = bus.stream();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                GenerationEvent::Progress {
                    job_id,
                    progress: Some(p),
                } => tracing::info!(job_id = %job_id, percent = p.percent(), "Progress"),
                GenerationEvent::StatusChanged { job_id, status, .. } => {
                    tracing::info!(job_id = %job_id, status = status.label(), "Status changed")
                }
                _ => {}
            }
        }
    })
}

async fn write_artifacts(dir: &Path, result: &GenerationResult) -> Result<(), StudioError> {
    let io = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| StudioError::Io { path, source }
    };

    tokio::fs::create_dir_all(dir).await.map_err(io(dir))?;
    for (index, artifact) in result.artifacts.iter().enumerate() {
        let path = dir.join(format!(
            "{}_{index}.{}",
            result.job_id,
            artifact.extension()
        ));
        tokio::fs::write(&path, &artifact.bytes)
            .await
            .map_err(io(&path))?;
        tracing::info!(
            path = %path.display(),
            mime = %artifact.mime,
            width = ?artifact.width,
            height = ?artifact.height,
            "Artifact written",
        );
    }
    tracing::info!(
        job_id = %result.job_id,
        seed = result.seed,
        fingerprint = %result.fingerprint,
        elapsed_ms = result.elapsed.as_millis() as u64,
        "Generation complete",
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<String> {
        vec!["sd15.safetensors".into(), "sdxl.safetensors".into()]
    }

    #[test]
    fn explicit_model_wins() {
        assert_eq!(
            choose_model(Some("flux.safetensors"), &catalog(), Some("sdxl.safetensors")).as_deref(),
            Some("flux.safetensors")
        );
    }

    #[test]
    fn last_model_preferred_when_backend_has_it() {
        assert_eq!(
            choose_model(None, &catalog(), Some("sdxl.safetensors")).as_deref(),
            Some("sdxl.safetensors")
        );
    }

    #[test]
    fn stale_last_model_falls_back_to_first_checkpoint() {
        assert_eq!(
            choose_model(None, &catalog(), Some("removed.safetensors")).as_deref(),
            Some("sd15.safetensors")
        );
        assert_eq!(choose_model(None, &catalog(), None).as_deref(), Some("sd15.safetensors"));
    }

    #[test]
    fn empty_catalog_uses_last_model_or_nothing() {
        assert_eq!(
            choose_model(None, &[], Some("sdxl.safetensors")).as_deref(),
            Some("sdxl.safetensors")
        );
        assert_eq!(choose_model(None, &[], None), None);
    }
}
