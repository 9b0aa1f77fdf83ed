//! Training job parameters, state record and status snapshot.

use crate::error::SkyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Training parameters chosen by the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub epochs: u32,
    pub batch_size: u32,
    pub lr: f64,
    pub img_size: u32,
    pub seed: u64,
    pub val_split: f64,
    /// Train from scratch instead of resuming from the latest export.
    #[serde(default)]
    pub from_scratch: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 16,
            lr: 0.001,
            img_size: 224,
            seed: 42,
            val_split: 0.2,
            from_scratch: false,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<(), SkyError> {
        if self.epochs == 0 {
            return Err(SkyError::invalid_input("epochs must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(SkyError::invalid_input("batch_size must be > 0"));
        }
        if self.img_size == 0 {
            return Err(SkyError::invalid_input("img_size must be > 0"));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(SkyError::invalid_input(format!(
                "lr must be a positive number (got {})",
                self.lr
            )));
        }
        if !(0.0..1.0).contains(&self.val_split) {
            return Err(SkyError::invalid_input(format!(
                "val_split must be in [0, 1) (got {})",
                self.val_split
            )));
        }
        Ok(())
    }

    /// Full training argv: `entrypoint` followed by the config flags.
    pub fn command(&self, entrypoint: &[String]) -> Vec<String> {
        let mut cmd = entrypoint.to_vec();
        cmd.extend(
            [
                ("--epochs", self.epochs.to_string()),
                ("--batch", self.batch_size.to_string()),
                ("--lr", self.lr.to_string()),
                ("--img", self.img_size.to_string()),
                ("--seed", self.seed.to_string()),
                ("--val", self.val_split.to_string()),
            ]
            .into_iter()
            .flat_map(|(flag, value)| [flag.to_string(), value]),
        );
        if self.from_scratch {
            cmd.push("--from-scratch".to_string());
        }
        cmd
    }
}

/// Where the orchestrator is in a run's lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobPhase {
    #[default]
    Idle,
    Starting,
    Training,
    Completed {
        exit_code: i64,
    },
    Failed {
        error: String,
    },
    RestoringIdle,
}

/// The orchestrator's single job record, overwritten on every start.
#[derive(Debug, Clone, Default)]
pub(crate) struct TrainingJob {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub error: String,
    pub logs: String,
    pub config: Option<TrainConfig>,
    pub phase: JobPhase,
    pub run_id: u64,
    /// Set from a successful start until the monitor has restored the idle container.
    pub finalizing: bool,
}

/// Point-in-time view of training, safe to render directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainStatus {
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_config: Option<TrainConfig>,
    pub phase: JobPhase,
    pub run_id: u64,
    pub last_completed_run: u64,
}
