//! Glue between training and serving: reload the engine after a successful run.

use crate::inference::{InferenceEngine, ReloadOutcome};
use crate::trainer::{CompletionListener, TrainingOrchestrator};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Completion listener that hot-swaps the engine to the newest export.
pub struct ReloadOnCompletion {
    engine: Arc<InferenceEngine>,
    models_dir: PathBuf,
}

impl ReloadOnCompletion {
    pub fn new(engine: Arc<InferenceEngine>, models_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            models_dir: models_dir.into(),
        }
    }

    /// Reload from the engine's own models directory.
    pub fn for_engine(engine: Arc<InferenceEngine>) -> Self {
        let models_dir = engine.models_dir().to_path_buf();
        Self::new(engine, models_dir)
    }
}

#[async_trait]
impl CompletionListener for ReloadOnCompletion {
    async fn training_completed(&self) {
        let engine = Arc::clone(&self.engine);
        let models_dir = self.models_dir.clone();
        // Session construction is CPU-bound native work.
        let result = tokio::task::spawn_blocking(move || engine.reload(&models_dir, None)).await;

        match result {
            Ok(Ok(ReloadOutcome::Loaded { version })) => {
                info!(version = %version, "Serving newly trained model");
            }
            Ok(Ok(ReloadOutcome::Unchanged { version })) => {
                warn!(version = %version, "Training completed but latest model is unchanged");
            }
            Ok(Ok(ReloadOutcome::NoModel)) => {
                warn!(models_dir = %self.models_dir.display(), "Training completed but no model was exported");
            }
            Ok(Err(e)) => {
                error!(error = %e, "Reload after training failed; previous model keeps serving");
            }
            Err(e) => {
                error!(error = %e, "Reload task panicked");
            }
        }
    }
}

/// Wire the orchestrator so every successful run reloads `engine`.
pub fn reload_on_completion(orchestrator: &TrainingOrchestrator, engine: Arc<InferenceEngine>) {
    orchestrator.on_complete(Arc::new(ReloadOnCompletion::for_engine(engine)));
}
