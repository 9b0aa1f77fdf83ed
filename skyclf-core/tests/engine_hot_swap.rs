//! Concurrency tests for the inference engine: predictions racing a reload.

use image::{Rgb, RgbImage};
use skyclf_core::inference::MockSessionLoader;
use skyclf_core::registry::{CLASSES_FILE, DEFAULT_ARTIFACT, DEFAULT_TASK};
use skyclf_core::{InferenceEngine, ReloadOutcome};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

fn write_version(root: &Path, version: &str, classes: &str) -> PathBuf {
    let dir = root.join(DEFAULT_TASK).join(version);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(DEFAULT_ARTIFACT), b"onnx").unwrap();
    std::fs::write(dir.join(CLASSES_FILE), classes).unwrap();
    dir.join(DEFAULT_ARTIFACT)
}

fn write_image(dir: &Path) -> PathBuf {
    let path = dir.join("sky.jpg");
    RgbImage::from_fn(40, 30, |x, y| Rgb([(x * 6) as u8, (y * 8) as u8, 180]))
        .save(&path)
        .unwrap();
    path
}

#[test]
fn test_predictions_stay_consistent_during_reloads() {
    let tmp = tempfile::tempdir().unwrap();
    let image = write_image(tmp.path());
    let loader = Arc::new(MockSessionLoader::new());
    let v1 = write_version(tmp.path(), "v1", r#"{"clear":0,"cloudy":1}"#);
    loader.set_logits(&v1, vec![3.0, -1.0]);

    let engine = Arc::new(
        InferenceEngine::new(tmp.path(), loader.clone())
            .with_image_size(32)
            .open()
            .unwrap(),
    );
    let v2 = write_version(tmp.path(), "v2", r#"{"clear":0,"cloudy":1,"fog":2}"#);
    loader.set_logits(&v2, vec![-2.0, 0.5, 4.0]);

    let done = Arc::new(AtomicBool::new(false));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let done = Arc::clone(&done);
            let image = image.clone();
            thread::spawn(move || {
                let mut seen = 0usize;
                while !done.load(Ordering::SeqCst) || seen < 20 {
                    let prediction = engine.predict(&image).unwrap().unwrap();
                    let sum: f32 = prediction.probs.values().sum();
                    assert!((sum - 1.0).abs() < 1e-4, "probabilities sum to {sum}");
                    match prediction.model_version.as_str() {
                        "v1" => {
                            assert_eq!(prediction.probs.len(), 2);
                            assert_eq!(prediction.label, "clear");
                        }
                        "v2" => {
                            assert_eq!(prediction.probs.len(), 3);
                            assert_eq!(prediction.label, "fog");
                        }
                        other => panic!("unexpected version {other}"),
                    }
                    seen += 1;
                }
                seen
            })
        })
        .collect();

    assert_eq!(
        engine.reload_latest().unwrap(),
        ReloadOutcome::Loaded {
            version: "v2".into()
        }
    );
    assert_eq!(
        engine.reload_latest().unwrap(),
        ReloadOutcome::Unchanged {
            version: "v2".into()
        }
    );
    done.store(true, Ordering::SeqCst);

    for worker in workers {
        assert!(worker.join().unwrap() >= 20);
    }
    assert_eq!(loader.builds(), 2);
    assert_eq!(
        engine.predict(&image).unwrap().unwrap().model_version,
        "v2"
    );
}

#[test]
fn test_pinned_version_reload() {
    let tmp = tempfile::tempdir().unwrap();
    write_version(tmp.path(), "v1", r#"{"clear":0,"cloudy":1}"#);
    write_version(tmp.path(), "v2", r#"{"clear":0,"cloudy":1}"#);
    let engine = InferenceEngine::new(tmp.path(), Arc::new(MockSessionLoader::new()));

    assert_eq!(
        engine.reload(tmp.path(), Some("v1")).unwrap(),
        ReloadOutcome::Loaded {
            version: "v1".into()
        }
    );
    assert_eq!(engine.model_summary().active.as_deref(), Some("v1"));
    assert_eq!(
        engine.reload(tmp.path(), Some("v3")).unwrap(),
        ReloadOutcome::NoModel
    );
    assert_eq!(engine.model_summary().classes, vec!["clear", "cloudy"]);
}
