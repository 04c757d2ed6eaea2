//! Capability catalog loader.
//!
//! Fetches what the backend can currently do: checkpoints, auxiliary
//! modules (control adapters, style adapters, auto-encoders,
//! upscalers), sampler/scheduler names and device telemetry. Each
//! category is fetched and may fail independently; a failed category
//! yields an empty list and is reported in [`CatalogRefresh::failures`]
//! rather than failing the whole refresh.

use std::sync::Arc;

use imagegen_core::types::Timestamp;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::{ComfyUIApiError, ComfyUIBackend, SystemStats};
use crate::session::{SessionManager, SessionState};

/// Device and memory telemetry, in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Telemetry {
    pub ram_total: u64,
    pub ram_free: u64,
    pub vram_total: u64,
    pub vram_free: u64,
    /// Whether any non-CPU device is present.
    pub has_accelerator: bool,
    pub device_name: Option<String>,
}

impl From<SystemStats> for Telemetry {
    fn from(stats: SystemStats) -> Self {
        let accelerator = stats.devices.iter().find(|d| d.kind != "cpu");
        Self {
            ram_total: stats.system.ram_total,
            ram_free: stats.system.ram_free,
            vram_total: accelerator.map_or(0, |d| d.vram_total),
            vram_free: accelerator.map_or(0, |d| d.vram_free),
            has_accelerator: accelerator.is_some(),
            device_name: stats
                .devices
                .first()
                .map(|d| d.name.clone()),
        }
    }
}

/// Snapshot of the backend's advertised capabilities.
///
/// Immutable once fetched; the backend stays authoritative.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CapabilityCatalog {
    pub checkpoints: Vec<String>,
    /// Guidance-conditioning adapters (ControlNet models).
    pub control_adapters: Vec<String>,
    /// Weight-blended style adapters (LoRA files).
    pub style_adapters: Vec<String>,
    pub vaes: Vec<String>,
    pub upscalers: Vec<String>,
    pub samplers: Vec<String>,
    pub schedulers: Vec<String>,
    pub telemetry: Option<Telemetry>,
    pub fetched_at: Option<Timestamp>,
}

/// A catalog category fetched independently of the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogCategory {
    Checkpoints,
    ControlAdapters,
    StyleAdapters,
    Vaes,
    Upscalers,
    Samplers,
    Telemetry,
}

/// A category that could not be fetched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryFailure {
    pub category: CatalogCategory,
    pub error: String,
}

/// Result of a refresh: the catalog plus any categories that failed.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogRefresh {
    pub catalog: Arc<CapabilityCatalog>,
    pub failures: Vec<CategoryFailure>,
}

impl CatalogRefresh {
    /// Whether some categories are empty because their fetch failed.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Errors that abort a refresh entirely.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
}

/// Loads and keeps the most recent [`CapabilityCatalog`].
pub struct CatalogLoader {
    backend: Arc<dyn ComfyUIBackend>,
    sessions: Arc<SessionManager>,
    latest: RwLock<Option<Arc<CapabilityCatalog>>>,
}

impl CatalogLoader {
    pub fn new(backend: Arc<dyn ComfyUIBackend>, sessions: Arc<SessionManager>) -> Self {
        Self {
            backend,
            sessions,
            latest: RwLock::new(None),
        }
    }

    /// Last catalog returned by [`refresh`](Self::refresh).
    pub async fn latest(&self) -> Option<Arc<CapabilityCatalog>> {
        self.latest.read().await.clone()
    }

    /// Fetch every category from the backend.
    ///
    /// Fails only when no session can be acquired. Individual category
    /// failures leave that list empty and are reported in the result.
    pub async fn refresh(&self) -> Result<CatalogRefresh, CatalogError> {
        self.sessions
            .acquire()
            .await
            .map_err(|e| CatalogError::BackendUnavailable(e.to_string()))?;

        let backend = self.backend.as_ref();
        let (checkpoints, control, style, vaes, upscalers, sampling, stats) = tokio::join!(
            fetch_choices(backend, "CheckpointLoaderSimple", "ckpt_name"),
            fetch_choices(backend, "ControlNetLoader", "control_net_name"),
            fetch_choices(backend, "LoraLoader", "lora_name"),
            fetch_choices(backend, "VAELoader", "vae_name"),
            fetch_choices(backend, "UpscaleModelLoader", "model_name"),
            fetch_sampling(backend),
            backend.system_stats(),
        );

        let mut failures = Vec::new();
        let mut catalog = CapabilityCatalog {
            fetched_at: Some(chrono::Utc::now()),
            ..Default::default()
        };
        catalog.checkpoints = take(checkpoints, CatalogCategory::Checkpoints, &mut failures);
        catalog.control_adapters = take(control, CatalogCategory::ControlAdapters, &mut failures);
        catalog.style_adapters = take(style, CatalogCategory::StyleAdapters, &mut failures);
        catalog.vaes = take(vaes, CatalogCategory::Vaes, &mut failures);
        catalog.upscalers = take(upscalers, CatalogCategory::Upscalers, &mut failures);
        (catalog.samplers, catalog.schedulers) =
            take(sampling, CatalogCategory::Samplers, &mut failures);
        catalog.telemetry = match stats {
            Ok(stats) => Some(Telemetry::from(stats)),
            Err(e) => {
                failures.push(CategoryFailure {
                    category: CatalogCategory::Telemetry,
                    error: e.to_string(),
                });
                None
            }
        };

        for failure in &failures {
            tracing::warn!(
                category = ?failure.category,
                error = %failure.error,
                "Catalog category unavailable",
            );
        }
        tracing::info!(
            checkpoints = catalog.checkpoints.len(),
            control_adapters = catalog.control_adapters.len(),
            style_adapters = catalog.style_adapters.len(),
            failed_categories = failures.len(),
            "Capability catalog refreshed",
        );

        let catalog = Arc::new(catalog);
        *self.latest.write().await = Some(Arc::clone(&catalog));
        Ok(CatalogRefresh { catalog, failures })
    }

    /// Refresh whenever a newly created session reports `open`.
    ///
    /// Runs until `cancel` fires or the session manager is dropped.
    pub fn spawn_refresh_on_reconnect(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let mut health = self.sessions.health();
        tokio::spawn(async move {
            let mut refreshed_for: Option<Uuid> = None;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = health.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                let snapshot = health.borrow_and_update().clone();
                if snapshot.state != SessionState::Open || snapshot.session_id == refreshed_for {
                    continue;
                }
                refreshed_for = snapshot.session_id;
                if let Err(e) = self.refresh().await {
                    tracing::warn!(error = %e, "Catalog refresh after reconnect failed");
                }
            }
        })
    }
}

fn take<T: Default>(
    result: Result<T, ComfyUIApiError>,
    category: CatalogCategory,
    failures: &mut Vec<CategoryFailure>,
) -> T {
    result.unwrap_or_else(|e| {
        failures.push(CategoryFailure {
            category,
            error: e.to_string(),
        });
        T::default()
    })
}

async fn fetch_choices(
    backend: &dyn ComfyUIBackend,
    node_class: &str,
    input: &str,
) -> Result<Vec<String>, ComfyUIApiError> {
    let info = backend.object_info(node_class).await?;
    info.choices(input).ok_or_else(|| {
        ComfyUIApiError::Decode(format!("{node_class}.{input} is not a selectable input"))
    })
}

async fn fetch_sampling(
    backend: &dyn ComfyUIBackend,
) -> Result<(Vec<String>, Vec<String>), ComfyUIApiError> {
    let info = backend.object_info("KSampler").await?;
    let samplers = info.choices("sampler_name").unwrap_or_default();
    let schedulers = info.choices("scheduler").unwrap_or_default();
    Ok((samplers, schedulers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DeviceStats, SystemInfo};

    #[test]
    fn telemetry_prefers_accelerator_memory() {
        let stats = SystemStats {
            system: SystemInfo {
                os: "posix".into(),
                ram_total: 64,
                ram_free: 32,
            },
            devices: vec![DeviceStats {
                name: "cuda:0 NVIDIA RTX 4090".into(),
                kind: "cuda".into(),
                vram_total: 24,
                vram_free: 20,
            }],
        };
        let telemetry = Telemetry::from(stats);
        assert!(telemetry.has_accelerator);
        assert_eq!(telemetry.vram_free, 20);
        assert_eq!(telemetry.ram_free, 32);
        assert_eq!(telemetry.device_name.as_deref(), Some("cuda:0 NVIDIA RTX 4090"));
    }

    #[test]
    fn cpu_only_host_has_no_accelerator() {
        let stats = SystemStats {
            system: SystemInfo::default(),
            devices: vec![DeviceStats {
                name: "cpu".into(),
                kind: "cpu".into(),
                vram_total: 0,
                vram_free: 0,
            }],
        };
        let telemetry = Telemetry::from(stats);
        assert!(!telemetry.has_accelerator);
        assert_eq!(telemetry.vram_total, 0);
    }

    use std::time::Duration;

    use crate::readiness::ReadinessConfig;
    use crate::testing::{ConnectBehavior, FakeBackend, FakeConnector};

    fn loader() -> (Arc<FakeConnector>, Arc<FakeBackend>, Arc<CatalogLoader>) {
        let connector = FakeConnector::new();
        let backend = FakeBackend::new(connector.clone());
        let sessions = Arc::new(SessionManager::new(
            connector.clone(),
            ReadinessConfig::default(),
        ));
        let loader = Arc::new(CatalogLoader::new(backend.clone(), sessions));
        (connector, backend, loader)
    }

    #[tokio::test(start_paused = true)]
    async fn full_refresh_fills_every_category() {
        let (_, _, loader) = loader();
        assert!(loader.latest().await.is_none());

        let refresh = loader.refresh().await.unwrap();

        assert!(!refresh.is_partial());
        let catalog = &refresh.catalog;
        assert_eq!(
            catalog.checkpoints,
            vec!["sd_xl_base_1.0.safetensors", "flux1-dev.safetensors"]
        );
        assert_eq!(catalog.control_adapters, vec!["control_canny.safetensors"]);
        assert_eq!(catalog.style_adapters, vec!["ink_style.safetensors"]);
        assert_eq!(catalog.vaes, vec!["sdxl_vae.safetensors"]);
        assert_eq!(catalog.upscalers, vec!["4x-UltraSharp.pth"]);
        assert_eq!(catalog.samplers, vec!["euler", "dpmpp_2m"]);
        assert_eq!(catalog.schedulers, vec!["normal", "karras"]);
        assert!(catalog.telemetry.as_ref().unwrap().has_accelerator);
        assert_eq!(loader.latest().await, Some(refresh.catalog.clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_adapter_category_leaves_the_rest() {
        let (_, backend, loader) = loader();
        backend.break_node("ControlNetLoader");

        let refresh = loader.refresh().await.unwrap();

        assert!(refresh.is_partial());
        assert!(!refresh.catalog.checkpoints.is_empty());
        assert!(refresh.catalog.control_adapters.is_empty());
        assert!(!refresh.catalog.style_adapters.is_empty());
        assert_eq!(refresh.failures.len(), 1);
        assert_eq!(refresh.failures[0].category, CatalogCategory::ControlAdapters);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_telemetry_is_a_partial_failure() {
        let (_, backend, loader) = loader();
        backend.break_stats();

        let refresh = loader.refresh().await.unwrap();

        assert!(refresh.catalog.telemetry.is_none());
        assert_eq!(refresh.failures[0].category, CatalogCategory::Telemetry);
        assert!(!refresh.catalog.checkpoints.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_backend_fails_the_refresh() {
        let (connector, _, loader) = loader();
        connector.plan([ConnectBehavior::Fail("connection refused".into())]);

        let err = loader.refresh().await.unwrap_err();

        assert_matches::assert_matches!(err, CatalogError::BackendUnavailable(msg) if msg.contains("connection refused"));
        assert!(loader.latest().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_triggers_refresh() {
        let (connector, _, loader) = loader();
        let cancel = CancellationToken::new();
        let watcher = Arc::clone(&loader).spawn_refresh_on_reconnect(cancel.clone());

        loader.sessions.acquire().await.unwrap();
        let mut waited = Duration::ZERO;
        while loader.latest().await.is_none() && waited < Duration::from_secs(1) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        let first = loader.latest().await.unwrap();

        connector.drop_latest();
        tokio::time::sleep(Duration::from_millis(10)).await;
        loader.sessions.acquire().await.unwrap();
        let mut waited = Duration::ZERO;
        while loader
            .latest()
            .await
            .is_some_and(|latest| Arc::ptr_eq(&latest, &first))
            && waited < Duration::from_secs(1)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        assert!(!Arc::ptr_eq(&loader.latest().await.unwrap(), &first));

        cancel.cancel();
        watcher.await.unwrap();
    }

    #[test]
    fn refresh_without_failures_is_not_partial() {
        let refresh = CatalogRefresh {
            catalog: Arc::new(CapabilityCatalog::default()),
            failures: vec![],
        };
        assert!(!refresh.is_partial());
    }
}
