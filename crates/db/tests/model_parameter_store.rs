use imagegen_core::model_defaults::{heuristic_defaults, ParameterRecord};
use imagegen_db::repositories::ModelParameterRepo;
use imagegen_db::ModelParameterStore;

async fn store() -> ModelParameterStore {
    ModelParameterStore::in_memory()
        .await
        .expect("in-memory store should open")
}

fn record() -> ParameterRecord {
    ParameterRecord {
        denoise: 0.65,
        steps: 34,
        guidance: 5.5,
        sampler: "dpmpp_2m_sde".into(),
        scheduler: "karras".into(),
        negative_terms: vec!["blurry".into(), "watermark".into()],
    }
}

#[tokio::test]
async fn set_then_get_round_trips() {
    let store = store().await;
    let record = record();

    store.set("my_model.safetensors", &record).await.unwrap();

    assert_eq!(store.get("my_model.safetensors").await.unwrap(), record);
    assert_eq!(store.lookup("my_model.safetensors").await.unwrap(), Some(record));
}

#[tokio::test]
async fn unknown_sdxl_model_gets_family_defaults() {
    let store = store().await;

    let params = store.get("juggernaut_sdxl_v9.safetensors").await.unwrap();

    assert_eq!(params.steps, 22);
    assert_eq!(params.guidance, 8.0);
    assert_eq!(params.sampler, "euler");
    assert_eq!(params.scheduler, "normal");
    assert_eq!(store.lookup("juggernaut_sdxl_v9.safetensors").await.unwrap(), None);
}

#[tokio::test]
async fn miss_matches_heuristic_for_every_family() {
    let store = store().await;
    for model in [
        "flux1-dev.safetensors",
        "sd_xl_base_1.0.safetensors",
        "v1-5-pruned-emaonly.safetensors",
        "mystery.ckpt",
    ] {
        assert_eq!(store.get(model).await.unwrap(), heuristic_defaults(model));
    }
}

#[tokio::test]
async fn second_write_overwrites_first() {
    let store = store().await;
    let mut first = record();
    store.set("model", &first).await.unwrap();

    first.steps = 12;
    first.negative_terms.clear();
    store.set("model", &first).await.unwrap();

    let stored = store.get("model").await.unwrap();
    assert_eq!(stored.steps, 12);
    assert!(stored.negative_terms.is_empty());
    assert_eq!(store.known_models().await.unwrap(), vec!["model".to_string()]);
}

#[tokio::test]
async fn records_for_different_models_are_independent() {
    let store = store().await;
    let a = record();
    let mut b = record();
    b.sampler = "euler_ancestral".into();

    store.set("a.safetensors", &a).await.unwrap();
    store.set("b.safetensors", &b).await.unwrap();

    assert_eq!(store.get("a.safetensors").await.unwrap(), a);
    assert_eq!(store.get("b.safetensors").await.unwrap(), b);
    let mut known = store.known_models().await.unwrap();
    known.sort();
    assert_eq!(known, vec!["a.safetensors", "b.safetensors"]);
}

#[tokio::test]
async fn missing_fields_fall_back_per_field() {
    let store = store().await;
    // A record written before `scheduler` and `negative_terms` existed.
    ModelParameterRepo::upsert(
        store.pool(),
        "sdxl_turbo.safetensors",
        r#"{"denoise": 0.9, "steps": 6, "guidance": 2.0, "sampler": "lcm"}"#,
    )
    .await
    .unwrap();

    let params = store.get("sdxl_turbo.safetensors").await.unwrap();
    let defaults = heuristic_defaults("sdxl_turbo.safetensors");

    assert_eq!(params.steps, 6);
    assert_eq!(params.sampler, "lcm");
    assert_eq!(params.scheduler, defaults.scheduler);
    assert_eq!(params.negative_terms, defaults.negative_terms);
}

#[tokio::test]
async fn corrupt_record_is_reported() {
    let store = store().await;
    ModelParameterRepo::upsert(store.pool(), "broken", "not json")
        .await
        .unwrap();

    let err = store.get("broken").await.unwrap_err();
    assert!(err.to_string().starts_with("Invalid stored record"));
}

#[tokio::test]
async fn last_model_is_remembered() {
    let store = store().await;
    assert_eq!(store.last_model().await.unwrap(), None);

    store.set_last_model("first.safetensors").await.unwrap();
    store.set_last_model("second.safetensors").await.unwrap();

    assert_eq!(
        store.last_model().await.unwrap().as_deref(),
        Some("second.safetensors")
    );
}

#[tokio::test]
async fn file_store_persists_across_reopen() {
    let path = std::env::temp_dir().join(format!(
        "imagegen-store-{}-{}.db",
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    let url = format!("sqlite://{}", path.display());

    {
        let store = ModelParameterStore::init(&url).await.unwrap();
        store.set("persisted", &record()).await.unwrap();
        store.pool().close().await;
    }
    let reopened = ModelParameterStore::init(&url).await.unwrap();
    assert_eq!(reopened.get("persisted").await.unwrap(), record());
    reopened.pool().close().await;

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn health_check_reports_closed_pool() {
    let store = store().await;
    imagegen_db::health_check(store.pool()).await.unwrap();

    store.pool().close().await;
    assert!(imagegen_db::health_check(store.pool()).await.is_err());
}
