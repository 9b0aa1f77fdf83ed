//! # skyclf-core — model lifecycle for the sky-state classifier
//!
//! - [`registry`] discovers versioned model exports on disk.
//! - [`inference`] serves one active model and hot-swaps it on reload.
//! - [`trainer`] runs training in a managed container and restores the idle
//!   container afterwards.
//! - [`lifecycle`] reloads the engine when a training run succeeds.

pub mod config;
pub mod error;
pub mod inference;
pub mod lifecycle;
pub mod registry;
pub mod trainer;

// Re-exports
pub use config::{SkyConfig, TrainerConfig, load_config};
pub use error::SkyError;
pub use inference::{
    InferenceEngine, ModelSummary, Prediction, ReloadOutcome, SessionLoader, TractSessionLoader,
};
pub use lifecycle::{ReloadOnCompletion, reload_on_completion};
pub use registry::{ModelLocator, ModelVersion, VersionEntry, find_model, list_versions};
pub use trainer::{
    CompletionListener, ContainerPlatform, DockerEngine, JobPhase, TrainConfig, TrainStatus,
    TrainerSettings, TrainingOrchestrator,
};
