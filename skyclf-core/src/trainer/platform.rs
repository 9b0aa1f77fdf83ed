//! Container platform abstraction.
//!
//! The orchestrator only ever talks to the training process through this
//! trait: inspect/remove by name, create with a spec, and start/stop/wait/logs
//! by id.

use crate::error::SkyError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Everything needed to recreate a container: the engine-level config
/// (image, env, command, ...) and host config (mounts, limits, network).
/// Passed through verbatim so no setting is lost on recreate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub config: Value,
    pub host_config: Value,
}

impl ContainerSpec {
    pub fn new(config: Value, host_config: Value) -> Self {
        Self {
            config,
            host_config,
        }
    }

    /// The container's command (`Cmd`), empty when unset.
    pub fn command(&self) -> Vec<String> {
        self.config
            .get("Cmd")
            .and_then(Value::as_array)
            .map(|args| {
                args.iter()
                    .filter_map(|a| a.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A copy of this spec with `Cmd` replaced.
    pub fn with_command(&self, command: &[String]) -> Self {
        let mut config = match &self.config {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        config.insert("Cmd".to_string(), Value::from(command.to_vec()));
        Self {
            config: Value::Object(config),
            host_config: self.host_config.clone(),
        }
    }
}

/// Live state of a named container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    pub running: bool,
    pub spec: ContainerSpec,
}

/// How a container left the running state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOutcome {
    pub status_code: i64,
    /// Platform-reported error, if any (distinct from a nonzero exit).
    pub error: Option<String>,
}

#[async_trait]
pub trait ContainerPlatform: Send + Sync {
    fn name(&self) -> &str;

    /// Look up a container by name. `SkyError::NotFound` when absent.
    async fn inspect(&self, name: &str) -> Result<ContainerInfo, SkyError>;

    /// Forcibly remove a container by name, killing it if running.
    async fn remove(&self, name: &str) -> Result<(), SkyError>;

    /// Create (but do not start) a container; returns its id.
    async fn create(&self, name: &str, spec: &ContainerSpec) -> Result<String, SkyError>;

    async fn start(&self, id: &str) -> Result<(), SkyError>;

    /// Graceful stop; the platform kills the container after `grace`.
    async fn stop(&self, id: &str, grace: Duration) -> Result<(), SkyError>;

    /// Block until the container is no longer running.
    async fn wait(&self, id: &str) -> Result<WaitOutcome, SkyError>;

    /// Trailing `tail` lines of combined stdout/stderr, still framed.
    async fn logs(&self, id: &str, tail: usize) -> Result<Vec<u8>, SkyError>;
}
