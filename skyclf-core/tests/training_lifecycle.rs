//! End-to-end lifecycle tests: orchestrator runs against the mock container
//! platform, and a successful run hot-swaps the inference engine.

use serde_json::json;
use skyclf_core::inference::MockSessionLoader;
use skyclf_core::registry::{CLASSES_FILE, DEFAULT_ARTIFACT, DEFAULT_TASK};
use skyclf_core::trainer::{ContainerSpec, MockContainerPlatform, TrainStatus};
use skyclf_core::{
    InferenceEngine, JobPhase, TrainConfig, TrainerSettings, TrainingOrchestrator,
    reload_on_completion,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const NAME: &str = "skyclf-trainer";

fn idle_spec() -> ContainerSpec {
    ContainerSpec::new(
        json!({"Image": "skyclf-trainer:latest", "Cmd": ["sleep", "infinity"]}),
        json!({"Binds": ["/srv/skyclf/models:/models"]}),
    )
}

fn setup() -> (TrainingOrchestrator, Arc<MockContainerPlatform>) {
    let mock = Arc::new(MockContainerPlatform::new());
    mock.seed(NAME, idle_spec(), true);
    let orch = TrainingOrchestrator::new(mock.clone(), TrainerSettings::default());
    (orch, mock)
}

fn export_version(root: &Path, version: &str) {
    let dir = root.join(DEFAULT_TASK).join(version);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(DEFAULT_ARTIFACT), b"onnx").unwrap();
    std::fs::write(dir.join(CLASSES_FILE), r#"{"clear":0,"cloudy":1,"overcast":2}"#).unwrap();
    std::fs::write(dir.join("meta.json"), r#"{"created_at":"2026-10-01T12:00:00Z"}"#).unwrap();
}

async fn poll_until(
    orch: &TrainingOrchestrator,
    done: impl Fn(&TrainStatus) -> bool,
) -> TrainStatus {
    let cancel = CancellationToken::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = orch.status(&cancel).await;
            if done(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("status never reached the expected state")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_during_slow_start_then_running() {
    let (orch, mock) = setup();
    mock.set_start_delay(Duration::from_millis(100));

    let starter = {
        let orch = orch.clone();
        tokio::spawn(async move {
            orch.start(TrainConfig::default(), &CancellationToken::new())
                .await
        })
    };

    // Status while the remote start is still in flight must not fail or block.
    let early = orch.status(&CancellationToken::new()).await;
    assert!(!early.running);

    let running = poll_until(&orch, |s| s.running).await;
    assert!(running.started_at.is_some());
    assert_eq!(running.phase, JobPhase::Training);
    starter.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_launch_one_run() {
    let (orch, mock) = setup();
    mock.set_start_delay(Duration::from_millis(50));

    let starters: Vec<_> = (0..6)
        .map(|_| {
            let orch = orch.clone();
            tokio::spawn(async move {
                orch.start(TrainConfig::default(), &CancellationToken::new())
                    .await
            })
        })
        .collect();
    let mut launched = 0;
    for starter in starters {
        match starter.await.unwrap() {
            Ok(()) => launched += 1,
            Err(e) => assert!(e.is_conflict(), "unexpected error: {e}"),
        }
    }
    assert_eq!(launched, 1);

    let create = format!("create {NAME}");
    let creates = mock.journal().iter().filter(|c| **c == create).count();
    assert_eq!(creates, 1);
    let status = orch.status(&CancellationToken::new()).await;
    assert!(status.running);
    assert_eq!(status.run_id, 1);

    mock.finish(NAME, 0);
    poll_until(&orch, |s| s.phase == JobPhase::Idle && !s.running).await;
}

#[tokio::test]
async fn test_successful_training_reloads_engine() {
    let models = tempfile::tempdir().unwrap();
    export_version(models.path(), "v1");
    let engine = Arc::new(
        InferenceEngine::new(models.path(), Arc::new(MockSessionLoader::new()))
            .open()
            .unwrap(),
    );
    assert_eq!(engine.model_summary().active.as_deref(), Some("v1"));

    let (orch, mock) = setup();
    reload_on_completion(&orch, engine.clone());
    let cancel = CancellationToken::new();

    orch.start(
        TrainConfig {
            epochs: 1,
            ..Default::default()
        },
        &cancel,
    )
    .await
    .unwrap();
    // The training run exports a new version, then exits cleanly.
    export_version(models.path(), "v2");
    mock.push_log(NAME, "exported v2\n");
    mock.finish(NAME, 0);

    let status = poll_until(&orch, |s| s.phase == JobPhase::Idle).await;
    assert_eq!(status.exit_code, Some(0));
    assert_eq!(status.last_completed_run, 1);
    assert_eq!(status.logs, "exported v2\n");
    assert_eq!(status.last_config.unwrap().epochs, 1);

    let summary = engine.model_summary();
    assert_eq!(summary.active.as_deref(), Some("v2"));
    assert_eq!(summary.classes, vec!["clear", "cloudy", "overcast"]);

    let idle = mock.snapshot(NAME).unwrap();
    assert!(idle.running);
    assert_eq!(idle.spec, idle_spec());
}

#[tokio::test]
async fn test_failed_training_keeps_serving_model() {
    let models = tempfile::tempdir().unwrap();
    export_version(models.path(), "v1");
    let engine = Arc::new(
        InferenceEngine::new(models.path(), Arc::new(MockSessionLoader::new()))
            .open()
            .unwrap(),
    );
    let (orch, mock) = setup();
    reload_on_completion(&orch, engine.clone());
    let cancel = CancellationToken::new();

    orch.start(TrainConfig::default(), &cancel).await.unwrap();
    export_version(models.path(), "v2");
    mock.finish(NAME, 1);

    let status = poll_until(&orch, |s| s.phase == JobPhase::Idle).await;
    assert_eq!(status.error, "training failed with exit code 1");
    assert_eq!(status.last_completed_run, 0);
    assert_eq!(engine.model_summary().active.as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_back_to_back_runs() {
    let (orch, mock) = setup();
    let mut completions = orch.subscribe_completions();
    let cancel = CancellationToken::new();

    for run in 1..=3u64 {
        orch.start(TrainConfig::default(), &cancel).await.unwrap();
        mock.finish(NAME, 0);
        completions.changed().await.unwrap();
        assert_eq!(*completions.borrow_and_update(), run);
        let status = poll_until(&orch, |s| s.phase == JobPhase::Idle).await;
        assert_eq!(status.run_id, run);
    }

    let journal = mock.journal();
    let idle_restores = journal
        .iter()
        .filter(|c| c.as_str() == format!("create {NAME}"))
        .count();
    // One create for each run plus one for each idle restoration.
    assert_eq!(idle_restores, 6);
}
