//! Inference engine: serves one active model and hot-swaps it on reload.
//!
//! Predictions and swaps serialize on a single lock because each loaded model
//! owns one preallocated input/output buffer pair that every call reuses.
//! Reload builds the replacement session outside the lock, swaps it in under
//! the lock, and drops the old session only after the swap, so a request sees
//! either the old model or the new one in full.
//!
//! Concurrent reloads that resolve to the same new artifact may each build a
//! session. The first swap wins and later ones find the artifact unchanged and
//! drop their build, so "at most one rebuild" only holds for sequential calls.

pub mod preprocess;
pub mod scores;
pub mod session;

pub use session::{
    InferenceSession, MockSessionLoader, SessionLoader, SessionSpec, TractSessionLoader,
};

use crate::config::SkyConfig;
use crate::error::SkyError;
use crate::registry::{ModelLocator, ModelVersion};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of classifying one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Winning class name.
    pub label: String,
    pub confidence: f32,
    /// Probability for every class, keyed by class name.
    pub probs: BTreeMap<String, f32>,
    pub task: String,
    pub model_version: String,
    pub model_path: PathBuf,
}

/// What a reload did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReloadOutcome {
    /// A new session was built and swapped in.
    Loaded { version: String },
    /// The resolved artifact is already active.
    Unchanged { version: String },
    /// Nothing to load yet; the active model, if any, stays.
    NoModel,
}

/// Read-only description of the active model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub active: Option<String>,
    pub path: Option<PathBuf>,
    pub classes: Vec<String>,
    pub loaded_at: Option<DateTime<Utc>>,
}

struct ActiveModel {
    model: Arc<ModelVersion>,
    session: Box<dyn InferenceSession>,
    input: Vec<f32>,
    output: Vec<f32>,
    loaded_at: DateTime<Utc>,
}

enum EngineState {
    Unloaded,
    Loaded(ActiveModel),
    Closed,
}

/// Hot-swappable single-model classifier.
pub struct InferenceEngine {
    models_dir: PathBuf,
    locator: ModelLocator,
    image_size: usize,
    loader: Arc<dyn SessionLoader>,
    state: Mutex<EngineState>,
}

impl InferenceEngine {
    /// Create an unloaded engine. Nothing is read from disk yet.
    pub fn new(models_dir: impl Into<PathBuf>, loader: Arc<dyn SessionLoader>) -> Self {
        Self {
            models_dir: models_dir.into(),
            locator: ModelLocator::default(),
            image_size: 224,
            loader,
            state: Mutex::new(EngineState::Unloaded),
        }
    }

    /// Create an engine from configuration (task, artifact name, image size).
    pub fn from_config(config: &SkyConfig, loader: Arc<dyn SessionLoader>) -> Self {
        Self::new(config.models_dir(), loader)
            .with_locator(ModelLocator::new(
                config.inference.task.clone(),
                config.inference.artifact_file.clone(),
            ))
            .with_image_size(config.inference.image_size)
    }

    pub fn with_locator(mut self, locator: ModelLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_image_size(mut self, image_size: usize) -> Self {
        self.image_size = image_size;
        self
    }

    /// Load the latest model if one exists. An empty model store leaves the
    /// engine unloaded, which is not an error.
    pub fn open(self) -> Result<Self, SkyError> {
        info!(models_dir = %self.models_dir.display(), loader = self.loader.name(), "Scanning models");
        let outcome = self.reload_latest()?;
        if outcome == ReloadOutcome::NoModel {
            info!("No model found; engine stays unloaded until the first reload");
        }
        Ok(self)
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        // Every mutation is a single assignment, so a poisoned state is still coherent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Classify the image at `image_path`.
    ///
    /// `Ok(None)` when no model is loaded yet.
    pub fn predict(&self, image_path: &Path) -> Result<Option<Prediction>, SkyError> {
        let start = Instant::now();
        let mut state = self.lock();
        let active = match &mut *state {
            EngineState::Unloaded => return Ok(None),
            EngineState::Closed => return Err(SkyError::Closed),
            EngineState::Loaded(active) => active,
        };

        if let Err(e) = preprocess::load_nchw_into(image_path, self.image_size, &mut active.input) {
            warn!(path = %image_path.display(), error = %e, "Preprocess failed");
            return Err(e);
        }
        active.session.run(&active.input, &mut active.output)?;

        let probs = scores::softmax(&active.output);
        let (best, confidence) = scores::argmax(&probs)
            .ok_or_else(|| SkyError::inference("model produced no logits"))?;
        let model = &active.model;
        let prediction = Prediction {
            label: model.class_names[best].clone(),
            confidence,
            probs: model
                .class_names
                .iter()
                .cloned()
                .zip(probs.iter().copied())
                .collect(),
            task: self.locator.task().to_string(),
            model_version: model.version.clone(),
            model_path: model.artifact_path.clone(),
        };

        debug!(
            label = %prediction.label,
            confidence = prediction.confidence,
            version = %prediction.model_version,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Prediction"
        );
        Ok(Some(prediction))
    }

    /// Reload the latest version from the engine's own models directory.
    pub fn reload_latest(&self) -> Result<ReloadOutcome, SkyError> {
        self.reload(&self.models_dir, None)
    }

    /// Resolve `version` (latest when `None`) under `models_root` and make it active.
    ///
    /// A no-op when the resolved artifact is already active. On any failure the
    /// previously active model keeps serving.
    pub fn reload(
        &self,
        models_root: &Path,
        version: Option<&str>,
    ) -> Result<ReloadOutcome, SkyError> {
        info!(models_root = %models_root.display(), version = version.unwrap_or("latest"), "Reloading model");

        let Some(model) = self.locator.find(models_root, version)? else {
            info!("No model found during reload");
            return Ok(ReloadOutcome::NoModel);
        };

        if let Some(outcome) = self.unchanged(&model)? {
            info!(version = %model.version, "Model unchanged");
            return Ok(outcome);
        }

        info!(
            version = %model.version,
            path = %model.artifact_path.display(),
            classes = ?model.class_names,
            "Loading new model"
        );
        let candidate = self.build(model)?;
        let version = candidate.model.version.clone();

        let previous = {
            let mut state = self.lock();
            if let Some(outcome) = check_unchanged(&state, &candidate.model)? {
                return Ok(outcome);
            }
            std::mem::replace(&mut *state, EngineState::Loaded(candidate))
        };
        // Old session is released strictly after the swap, outside the lock.
        drop(previous);

        info!(version = %version, "Model reloaded");
        Ok(ReloadOutcome::Loaded { version })
    }

    fn unchanged(&self, model: &ModelVersion) -> Result<Option<ReloadOutcome>, SkyError> {
        let state = self.lock();
        check_unchanged(&state, model)
    }

    /// Build a complete session plus buffers without touching active state.
    fn build(&self, model: ModelVersion) -> Result<ActiveModel, SkyError> {
        let input_shape = [1, preprocess::CHANNELS, self.image_size, self.image_size];
        let base_dir = model
            .artifact_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| model.dir.clone());
        let spec = SessionSpec {
            artifact: &model.artifact_path,
            base_dir: &base_dir,
            input_shape,
            num_classes: model.num_classes(),
        };
        let session = self.loader.load(&spec)?;
        let input = vec![0.0; spec.input_len()];
        let output = vec![0.0; model.num_classes()];

        Ok(ActiveModel {
            model: Arc::new(model),
            session,
            input,
            output,
            loaded_at: Utc::now(),
        })
    }

    /// Version currently serving requests.
    pub fn active_model(&self) -> Option<Arc<ModelVersion>> {
        match &*self.lock() {
            EngineState::Loaded(active) => Some(Arc::clone(&active.model)),
            _ => None,
        }
    }

    pub fn model_summary(&self) -> ModelSummary {
        match &*self.lock() {
            EngineState::Loaded(active) => ModelSummary {
                active: Some(active.model.version.clone()),
                path: Some(active.model.artifact_path.clone()),
                classes: active.model.class_names.clone(),
                loaded_at: Some(active.loaded_at),
            },
            _ => ModelSummary::default(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(&*self.lock(), EngineState::Loaded(_))
    }

    /// Release the active session. Later `predict`/`reload` calls fail with
    /// [`SkyError::Closed`]; closing twice is a no-op.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock(), EngineState::Closed);
        if let EngineState::Loaded(active) = previous {
            info!(version = %active.model.version, "Inference engine closed");
        }
    }
}

fn check_unchanged(
    state: &EngineState,
    model: &ModelVersion,
) -> Result<Option<ReloadOutcome>, SkyError> {
    match state {
        EngineState::Closed => Err(SkyError::Closed),
        EngineState::Loaded(active) if active.model.artifact_path == model.artifact_path => {
            Ok(Some(ReloadOutcome::Unchanged {
                version: active.model.version.clone(),
            }))
        }
        _ => Ok(None),
    }
}
