//! Configuration for the SkyClf model lifecycle core.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! `skyclf.toml` -> environment -> explicit overrides.

use crate::error::SkyError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the workspace-level config file.
pub const CONFIG_FILE: &str = "skyclf.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkyConfig {
    /// Root of all on-disk state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Model store root. Falls back to `<data_dir>/models` when unset.
    #[serde(default)]
    pub models_dir: Option<PathBuf>,
    /// One of `debug`, `info`, `warn`, `error`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
}

impl Default for SkyConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            models_dir: None,
            log_level: default_log_level(),
            inference: InferenceConfig::default(),
            trainer: TrainerConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Inference engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Model family directory below the models root.
    #[serde(default = "default_task")]
    pub task: String,
    /// Artifact file name inside a version directory.
    #[serde(default = "default_artifact_file")]
    pub artifact_file: String,
    /// Square input edge in pixels.
    #[serde(default = "default_image_size")]
    pub image_size: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            task: default_task(),
            artifact_file: default_artifact_file(),
            image_size: default_image_size(),
        }
    }
}

fn default_task() -> String {
    "skystate".to_string()
}

fn default_artifact_file() -> String {
    "model.onnx".to_string()
}

fn default_image_size() -> usize {
    224
}

/// Training orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Name of the long-lived trainer container from the compose stack.
    #[serde(default = "default_container_name")]
    pub container_name: String,
    /// Docker Engine endpoint (`http://` or `tcp://`).
    #[serde(default = "default_docker_host")]
    pub docker_host: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Timeout for every platform call except `wait`.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Grace period before a stopped container is killed.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    /// Log lines fetched live by `status()` while training.
    #[serde(default = "default_status_log_tail")]
    pub status_log_tail: usize,
    /// Log lines captured into the job record when a run ends.
    #[serde(default = "default_final_log_tail")]
    pub final_log_tail: usize,
    /// Training entry point; config-derived flags are appended.
    #[serde(default = "default_entrypoint")]
    pub entrypoint: Vec<String>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            container_name: default_container_name(),
            docker_host: default_docker_host(),
            api_version: default_api_version(),
            request_timeout_secs: default_request_timeout(),
            stop_grace_secs: default_stop_grace(),
            status_log_tail: default_status_log_tail(),
            final_log_tail: default_final_log_tail(),
            entrypoint: default_entrypoint(),
        }
    }
}

impl TrainerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

fn default_container_name() -> String {
    "skyclf-trainer".to_string()
}

fn default_docker_host() -> String {
    "http://127.0.0.1:2375".to_string()
}

fn default_api_version() -> String {
    "v1.43".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_stop_grace() -> u64 {
    10
}

fn default_status_log_tail() -> usize {
    100
}

fn default_final_log_tail() -> usize {
    500
}

fn default_entrypoint() -> Vec<String> {
    ["python", "-m", "trainer.train"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl SkyConfig {
    /// Effective model store root.
    pub fn models_dir(&self) -> PathBuf {
        self.models_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("models"))
    }

    /// Directory for rolling JSON log files.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Reject values that would only fail later, at a worse moment.
    pub fn validate(&self) -> Result<(), SkyError> {
        let mut errs = Vec::new();
        if !matches!(self.log_level.as_str(), "debug" | "info" | "warn" | "error") {
            errs.push(format!(
                "log_level must be one of debug, info, warn, error (got {:?})",
                self.log_level
            ));
        }
        if self.inference.image_size == 0 {
            errs.push("inference.image_size must be > 0".to_string());
        }
        if self.inference.task.trim().is_empty() {
            errs.push("inference.task must not be empty".to_string());
        }
        if self.trainer.container_name.trim().is_empty() {
            errs.push("trainer.container_name must not be empty".to_string());
        }
        if self.trainer.request_timeout_secs == 0 {
            errs.push("trainer.request_timeout_secs must be > 0".to_string());
        }
        if self.trainer.entrypoint.is_empty() {
            errs.push("trainer.entrypoint must not be empty".to_string());
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(SkyError::Config(errs.join("; ")))
        }
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (`SKYCLF_MODELS_DIR`, `SKYCLF_TRAINER__CONTAINER_NAME`, ...)
/// 3. `config_file`, or `./skyclf.toml` when no file is given
/// 4. User config (`~/.config/skyclf/skyclf.toml`)
/// 5. Built-in defaults
pub fn load_config(
    config_file: Option<&Path>,
    overrides: Option<&SkyConfig>,
) -> Result<SkyConfig, SkyError> {
    let mut figment = Figment::from(Serialized::defaults(SkyConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("org", "skyclf", "skyclf") {
        let user_config = dirs.config_dir().join(CONFIG_FILE);
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    match config_file {
        Some(path) => {
            if !path.exists() {
                return Err(SkyError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        None => {
            let local = Path::new(CONFIG_FILE);
            if local.exists() {
                figment = figment.merge(Toml::file(local));
            }
        }
    }

    figment = figment.merge(Env::prefixed("SKYCLF_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: SkyConfig = figment
        .extract()
        .map_err(|e| SkyError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
