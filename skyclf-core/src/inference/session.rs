//! Inference session abstraction.
//!
//! A session is built once per model version with fixed input/output shapes
//! and then run repeatedly against caller-owned buffers.

use crate::error::SkyError;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tract_onnx::prelude::*;
use tracing::debug;

/// Everything a loader needs to build a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSpec<'a> {
    pub artifact: &'a Path,
    /// Directory side files (external tensor data) are resolved against.
    pub base_dir: &'a Path,
    /// NCHW input shape, batch first.
    pub input_shape: [usize; 4],
    pub num_classes: usize,
}

impl SessionSpec<'_> {
    pub fn input_len(&self) -> usize {
        self.input_shape.iter().product()
    }
}

/// A loaded model ready to run. Owns native resources; dropping it releases them.
pub trait InferenceSession: Send {
    /// Run one forward pass. `output` receives the raw logits.
    fn run(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), SkyError>;
}

/// Builds sessions from model artifacts.
pub trait SessionLoader: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self, spec: &SessionSpec<'_>) -> Result<Box<dyn InferenceSession>, SkyError>;
}

/// ONNX loader backed by tract (pure Rust, no shared library to locate).
#[derive(Debug, Default, Clone, Copy)]
pub struct TractSessionLoader;

impl SessionLoader for TractSessionLoader {
    fn name(&self) -> &str {
        "tract-onnx"
    }

    fn load(&self, spec: &SessionSpec<'_>) -> Result<Box<dyn InferenceSession>, SkyError> {
        let file_name = spec.artifact.file_name().ok_or_else(|| {
            SkyError::inference(format!("artifact path has no file name: {}", spec.artifact.display()))
        })?;
        let path = spec.base_dir.join(file_name);
        debug!(path = %path.display(), shape = ?spec.input_shape, "Building tract session");

        let plan = tract_onnx::onnx()
            .model_for_path(&path)
            .and_then(|model| model.with_input_fact(0, f32::fact(spec.input_shape).into()))
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|e| SkyError::inference(format!("create session for {}: {e}", path.display())))?;

        Ok(Box::new(TractSession {
            plan,
            shape: spec.input_shape,
        }))
    }
}

struct TractSession {
    plan: TypedRunnableModel<TypedModel>,
    shape: [usize; 4],
}

impl InferenceSession for TractSession {
    fn run(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), SkyError> {
        let tensor = Tensor::from_shape(&self.shape, input)
            .map_err(|e| SkyError::inference(format!("build input tensor: {e}")))?;
        let outputs = self
            .plan
            .run(tvec!(tensor.into()))
            .map_err(|e| SkyError::inference(format!("onnx run: {e}")))?;
        let logits = outputs
            .first()
            .ok_or_else(|| SkyError::inference("model produced no outputs"))?
            .as_slice::<f32>()
            .map_err(|e| SkyError::inference(format!("read logits: {e}")))?;
        if logits.len() != output.len() {
            return Err(SkyError::inference(format!(
                "model produced {} logits, expected {}",
                logits.len(),
                output.len()
            )));
        }
        output.copy_from_slice(logits);
        Ok(())
    }
}

/// Deterministic loader for tests and dry runs.
///
/// Each artifact yields fixed logits (configurable per artifact path, else
/// `0, 1, 2, ...`), and every successful `load` is counted.
#[derive(Debug, Default)]
pub struct MockSessionLoader {
    builds: AtomicUsize,
    logits: Mutex<HashMap<PathBuf, Vec<f32>>>,
    failing: Mutex<HashSet<PathBuf>>,
    base_dirs: Mutex<Vec<PathBuf>>,
}

impl MockSessionLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the logits produced by sessions built from `artifact`.
    pub fn set_logits(&self, artifact: impl Into<PathBuf>, logits: Vec<f32>) {
        self.logits.lock().unwrap().insert(artifact.into(), logits);
    }

    /// Make session construction for `artifact` fail.
    pub fn fail_on(&self, artifact: impl Into<PathBuf>) {
        self.failing.lock().unwrap().insert(artifact.into());
    }

    /// Number of sessions built so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Base directories passed to every load, in order.
    pub fn base_dirs(&self) -> Vec<PathBuf> {
        self.base_dirs.lock().unwrap().clone()
    }
}

impl SessionLoader for MockSessionLoader {
    fn name(&self) -> &str {
        "mock"
    }

    fn load(&self, spec: &SessionSpec<'_>) -> Result<Box<dyn InferenceSession>, SkyError> {
        self.base_dirs.lock().unwrap().push(spec.base_dir.to_path_buf());
        if self.failing.lock().unwrap().contains(spec.artifact) {
            return Err(SkyError::inference(format!(
                "create session for {}: mock failure",
                spec.artifact.display()
            )));
        }
        let logits = self
            .logits
            .lock()
            .unwrap()
            .get(spec.artifact)
            .cloned()
            .unwrap_or_else(|| (0..spec.num_classes).map(|i| i as f32).collect());
        if logits.len() != spec.num_classes {
            return Err(SkyError::inference(format!(
                "mock logits have {} entries, model has {} classes",
                logits.len(),
                spec.num_classes
            )));
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            logits,
            input_len: spec.input_len(),
        }))
    }
}

struct MockSession {
    logits: Vec<f32>,
    input_len: usize,
}

impl InferenceSession for MockSession {
    fn run(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), SkyError> {
        if input.len() != self.input_len || output.len() != self.logits.len() {
            return Err(SkyError::inference("buffer shape mismatch"));
        }
        output.copy_from_slice(&self.logits);
        Ok(())
    }
}
