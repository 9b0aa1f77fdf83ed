//! Training orchestrator: drives one named container between idle and training.
//!
//! The container slot always holds a process: an idle placeholder, or a
//! training run created from the idle container's own settings with its
//! command swapped for the training entry point. A detached monitor task
//! waits for each run to end, records the outcome, notifies the completion
//! listener on success, and recreates the idle container.

pub mod docker;
pub mod job;
pub mod logs;
pub mod mock;
pub mod platform;

pub use docker::DockerEngine;
pub use job::{JobPhase, TrainConfig, TrainStatus};
pub use logs::{encode_log_frame, strip_log_framing};
pub use mock::MockContainerPlatform;
pub use platform::{ContainerInfo, ContainerPlatform, ContainerSpec, WaitOutcome};

use crate::config::TrainerConfig;
use crate::error::SkyError;
use async_trait::async_trait;
use chrono::Utc;
use job::TrainingJob;
use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const TRAINING_IN_PROGRESS: &str = "training already in progress";
const NO_TRAINING: &str = "no training in progress";

/// Notified once per training run that exits with code 0.
#[async_trait]
pub trait CompletionListener: Send + Sync {
    async fn training_completed(&self);
}

struct FnListener<F>(F);

#[async_trait]
impl<F> CompletionListener for FnListener<F>
where
    F: Fn() + Send + Sync + 'static,
{
    async fn training_completed(&self) {
        (self.0)()
    }
}

/// Orchestrator knobs, usually derived from [`TrainerConfig`].
#[derive(Debug, Clone)]
pub struct TrainerSettings {
    pub container_name: String,
    pub entrypoint: Vec<String>,
    pub stop_grace: Duration,
    pub status_log_tail: usize,
    pub final_log_tail: usize,
}

impl From<&TrainerConfig> for TrainerSettings {
    fn from(config: &TrainerConfig) -> Self {
        Self {
            container_name: config.container_name.clone(),
            entrypoint: config.entrypoint.clone(),
            stop_grace: config.stop_grace(),
            status_log_tail: config.status_log_tail,
            final_log_tail: config.final_log_tail,
        }
    }
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self::from(&TrainerConfig::default())
    }
}

struct Inner {
    platform: Arc<dyn ContainerPlatform>,
    settings: TrainerSettings,
    /// Idle container template. Holding this lock is what serializes slot mutations.
    slot: Mutex<Option<ContainerSpec>>,
    job: RwLock<TrainingJob>,
    listener: std::sync::Mutex<Option<Arc<dyn CompletionListener>>>,
    completions: watch::Sender<u64>,
}

/// Cloneable handle to the training orchestrator.
#[derive(Clone)]
pub struct TrainingOrchestrator {
    inner: Arc<Inner>,
}

impl TrainingOrchestrator {
    pub fn new(platform: Arc<dyn ContainerPlatform>, settings: TrainerSettings) -> Self {
        let (completions, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                platform,
                settings,
                slot: Mutex::new(None),
                job: RwLock::new(TrainingJob::default()),
                listener: std::sync::Mutex::new(None),
                completions,
            }),
        }
    }

    /// Orchestrator talking to the Docker Engine described by `config`.
    pub fn from_config(config: &TrainerConfig) -> Result<Self, SkyError> {
        let engine = DockerEngine::from_config(config)?;
        Ok(Self::new(Arc::new(engine), TrainerSettings::from(config)))
    }

    pub fn container_name(&self) -> &str {
        &self.inner.settings.container_name
    }

    pub fn settings(&self) -> &TrainerSettings {
        &self.inner.settings
    }

    /// Register the listener invoked after each successful run, replacing any previous one.
    pub fn on_complete(&self, listener: Arc<dyn CompletionListener>) {
        *self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    pub fn on_complete_fn<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_complete(Arc::new(FnListener(f)));
    }

    /// Observe the id of the last run that completed successfully (0 = none yet).
    pub fn subscribe_completions(&self) -> watch::Receiver<u64> {
        self.inner.completions.subscribe()
    }

    pub fn last_completed_run(&self) -> u64 {
        *self.inner.completions.borrow()
    }

    /// Launch a training run in the managed container slot.
    ///
    /// Fails with [`SkyError::Conflict`] while a run is active or still
    /// finishing. A running idle container is replaced, not a conflict.
    pub async fn start(
        &self,
        config: TrainConfig,
        cancel: &CancellationToken,
    ) -> Result<(), SkyError> {
        config.validate()?;
        let inner = &self.inner;
        let name = inner.settings.container_name.as_str();
        let mut template = inner.slot.lock().await;

        {
            let job = inner.job.read().await;
            if job.finalizing {
                return Err(SkyError::conflict(if job.running {
                    TRAINING_IN_PROGRESS
                } else {
                    "previous training run is still finishing"
                }));
            }
        }

        let live = match guarded(cancel, "inspect", inner.platform.inspect(name)).await {
            Ok(live) => live,
            Err(e @ SkyError::Cancelled(_)) => return Err(e),
            Err(e) => {
                return Err(SkyError::remote(format!(
                    "trainer container not found (is the compose stack up?): {e}"
                )));
            }
        };
        if inner.is_training(&live).await {
            return Err(SkyError::conflict(TRAINING_IN_PROGRESS));
        }

        if inner.is_training_command(&live.spec) {
            if template.is_none() {
                warn!(
                    container = name,
                    "Slot holds a leftover training container; no idle template to restore afterwards"
                );
            }
        } else {
            *template = Some(live.spec.clone());
        }

        inner.job.write().await.phase = JobPhase::Starting;
        if let Err(e) = guarded(cancel, "remove", inner.platform.remove(name)).await {
            warn!(container = name, error = %e, "Failed to remove existing container");
        }

        let command = config.command(&inner.settings.entrypoint);
        let train_spec = live.spec.with_command(&command);
        let launched = async {
            let id = guarded(cancel, "create", inner.platform.create(name, &train_spec)).await?;
            guarded(cancel, "start", inner.platform.start(&id)).await?;
            Ok::<_, SkyError>(id)
        }
        .await;

        let id = match launched {
            Ok(id) => id,
            Err(e) => {
                error!(container = name, error = %e, "Failed to launch training container");
                {
                    let mut job = inner.job.write().await;
                    let run_id = job.run_id;
                    *job = TrainingJob {
                        running: false,
                        started_at: None,
                        exit_code: None,
                        error: e.to_string(),
                        logs: String::new(),
                        config: Some(config),
                        phase: JobPhase::Failed {
                            error: e.to_string(),
                        },
                        run_id,
                        finalizing: false,
                    };
                }
                inner.restore_idle_locked(&template).await;
                inner.job.write().await.phase = JobPhase::Idle;
                return Err(e);
            }
        };

        let run_id = {
            let mut job = inner.job.write().await;
            let run_id = job.run_id + 1;
            *job = TrainingJob {
                running: true,
                started_at: Some(Utc::now()),
                exit_code: None,
                error: String::new(),
                logs: String::new(),
                config: Some(config),
                phase: JobPhase::Training,
                run_id,
                finalizing: true,
            };
            run_id
        };

        tokio::spawn(monitor(Arc::clone(&self.inner), id.clone(), run_id));
        info!(container = name, id = %id, run_id, command = ?command, "Training started");
        Ok(())
    }

    /// Ask the training container to stop, killing it after the grace period.
    ///
    /// Idle restoration happens in the monitor, as for a natural exit.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<(), SkyError> {
        let inner = &self.inner;
        let name = inner.settings.container_name.as_str();
        let _slot = inner.slot.lock().await;

        let live = match guarded(cancel, "inspect", inner.platform.inspect(name)).await {
            Ok(live) => live,
            Err(e @ SkyError::Cancelled(_)) => return Err(e),
            Err(e) => {
                debug!(container = name, error = %e, "Inspect failed during stop");
                return Err(SkyError::conflict(NO_TRAINING));
            }
        };
        if !inner.is_training(&live).await {
            return Err(SkyError::conflict(NO_TRAINING));
        }

        info!(container = name, id = %live.id, grace_secs = inner.settings.stop_grace.as_secs(), "Stopping training");
        guarded(
            cancel,
            "stop",
            inner.platform.stop(&live.id, inner.settings.stop_grace),
        )
        .await
    }

    /// Current training state, re-derived from the live container.
    ///
    /// Never fails: platform errors show up as `running: false`.
    pub async fn status(&self, cancel: &CancellationToken) -> TrainStatus {
        let inner = &self.inner;
        let name = inner.settings.container_name.as_str();

        let live = match guarded(cancel, "inspect", inner.platform.inspect(name)).await {
            Ok(live) => Some(live),
            Err(e) => {
                debug!(container = name, error = %e, "Inspect failed during status");
                None
            }
        };
        let job = inner.job.read().await.clone();
        let running = job.running && live.as_ref().is_some_and(|c| c.running);

        let mut logs = job.logs;
        if running {
            if let Some(live) = &live {
                match guarded(
                    cancel,
                    "logs",
                    inner.platform.logs(&live.id, inner.settings.status_log_tail),
                )
                .await
                {
                    Ok(raw) => logs = strip_log_framing(&raw),
                    Err(e) => warn!(container = name, error = %e, "Failed to fetch training logs"),
                }
            }
        }

        TrainStatus {
            running,
            container_id: live.map(|c| c.id),
            started_at: job.started_at,
            exit_code: job.exit_code,
            error: job.error,
            logs,
            last_config: job.config,
            phase: job.phase,
            run_id: job.run_id,
            last_completed_run: *inner.completions.borrow(),
        }
    }
}

impl Inner {
    fn is_training_command(&self, spec: &ContainerSpec) -> bool {
        let entrypoint = &self.settings.entrypoint;
        !entrypoint.is_empty() && spec.command().starts_with(entrypoint)
    }

    async fn is_training(&self, live: &ContainerInfo) -> bool {
        live.running && (self.job.read().await.running || self.is_training_command(&live.spec))
    }

    /// Replace whatever occupies the slot with a fresh idle container.
    /// Best effort; the caller must hold the slot lock.
    async fn restore_idle_locked(&self, template: &Option<ContainerSpec>) {
        let name = self.settings.container_name.as_str();
        let Some(spec) = template else {
            debug!(container = name, "No idle template captured; leaving slot as is");
            return;
        };

        self.job.write().await.phase = JobPhase::RestoringIdle;
        if let Err(e) = self.platform.remove(name).await {
            warn!(container = name, error = %e, "Failed to remove training container");
        }
        let id = match self.platform.create(name, spec).await {
            Ok(id) => id,
            Err(e) => {
                warn!(container = name, error = %e, "Failed to recreate idle container");
                return;
            }
        };
        match self.platform.start(&id).await {
            Ok(()) => info!(container = name, id = %id, "Idle container ready"),
            Err(e) => warn!(container = name, id = %id, error = %e, "Failed to start idle container"),
        }
    }
}

/// Race a platform call against cancellation.
async fn guarded<T>(
    cancel: &CancellationToken,
    op: &str,
    call: impl Future<Output = Result<T, SkyError>>,
) -> Result<T, SkyError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SkyError::Cancelled(op.to_string())),
        result = call => result,
    }
}

/// Follow one run to its end. Not cancellable; always attempts idle restoration.
async fn monitor(inner: Arc<Inner>, id: String, run_id: u64) {
    let name = inner.settings.container_name.clone();

    let succeeded = match inner.platform.wait(&id).await {
        Err(e) => {
            warn!(container = %name, id = %id, error = %e, "Lost track of training container");
            let mut job = inner.job.write().await;
            job.running = false;
            job.error = e.to_string();
            job.phase = JobPhase::Failed {
                error: e.to_string(),
            };
            false
        }
        Ok(outcome) => {
            let logs = match inner.platform.logs(&id, inner.settings.final_log_tail).await {
                Ok(raw) => Some(strip_log_framing(&raw)),
                Err(e) => {
                    warn!(container = %name, error = %e, "Failed to fetch final training logs");
                    None
                }
            };
            let code = outcome.status_code;
            let error = match outcome.error {
                Some(msg) => msg,
                None if code == 0 => String::new(),
                None => SkyError::JobFailure(code).to_string(),
            };
            let succeeded = code == 0 && error.is_empty();

            let mut job = inner.job.write().await;
            job.running = false;
            job.exit_code = Some(code);
            if let Some(logs) = logs {
                job.logs = logs;
            }
            job.phase = if succeeded {
                JobPhase::Completed { exit_code: code }
            } else {
                JobPhase::Failed {
                    error: error.clone(),
                }
            };
            job.error = error;

            if succeeded {
                info!(container = %name, run_id, exit_code = code, "Training completed");
            } else {
                warn!(container = %name, run_id, exit_code = code, error = %job.error, "Training failed");
            }
            succeeded
        }
    };

    if succeeded {
        let listener = inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            // A panicking listener must not skip idle restoration below.
            let notified = tokio::spawn(async move { listener.training_completed().await }).await;
            if let Err(e) = notified {
                error!(container = %name, run_id, error = %e, "Completion listener panicked");
            }
        }
        inner.completions.send_replace(run_id);
    }

    let template = inner.slot.lock().await;
    inner.restore_idle_locked(&template).await;
    let mut job = inner.job.write().await;
    job.phase = JobPhase::Idle;
    job.finalizing = false;
}
