//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::ModelsAction;
use crate::TrainAction;
use crate::TrainArgs;
use serde::Serialize;
use skyclf_core::config::CONFIG_FILE;
use skyclf_core::{
    InferenceEngine, JobPhase, ModelLocator, Prediction, SkyConfig, SkyError, TrainConfig,
    TrainStatus, TractSessionLoader, TrainingOrchestrator, reload_on_completion,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config: &SkyConfig) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, config),
        Commands::Models { action } => handle_models(action, config),
        Commands::Predict { image, version } => handle_predict(image, version, config).await,
        Commands::Train { action } => handle_train(action, config).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn handle_config(action: ConfigAction, config: &SkyConfig) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            print!("{}", toml::to_string_pretty(config)?);
            Ok(())
        }
        ConfigAction::Init => {
            let path = Path::new(CONFIG_FILE);
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            let toml_str = toml::to_string_pretty(&SkyConfig::default())?;
            std::fs::write(path, &toml_str)?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
    }
}

fn locator(config: &SkyConfig) -> ModelLocator {
    ModelLocator::new(
        config.inference.task.clone(),
        config.inference.artifact_file.clone(),
    )
}

fn handle_models(action: ModelsAction, config: &SkyConfig) -> anyhow::Result<()> {
    let models_dir = config.models_dir();
    match action {
        ModelsAction::List => {
            let versions = locator(config).list(&models_dir)?;
            if versions.is_empty() {
                println!("No model versions under {}", models_dir.display());
                return Ok(());
            }
            print_json(&versions)
        }
        ModelsAction::Show { version } => {
            match locator(config).find(&models_dir, version.as_deref())? {
                Some(model) => print_json(&model),
                None => {
                    println!(
                        "No model {} under {}",
                        version.as_deref().unwrap_or("trained yet"),
                        models_dir.display()
                    );
                    Ok(())
                }
            }
        }
    }
}

/// Open an engine on the ONNX runtime, pinned to `version` when given.
fn open_engine(config: &SkyConfig, version: Option<&str>) -> Result<InferenceEngine, SkyError> {
    let engine = InferenceEngine::from_config(config, Arc::new(TractSessionLoader));
    match version {
        Some(version) => {
            engine.reload(&config.models_dir(), Some(version))?;
            Ok(engine)
        }
        None => engine.open(),
    }
}

async fn handle_predict(
    image: PathBuf,
    version: Option<String>,
    config: &SkyConfig,
) -> anyhow::Result<()> {
    let config = config.clone();
    let prediction = tokio::task::spawn_blocking(move || -> Result<Option<Prediction>, SkyError> {
        let engine = open_engine(&config, version.as_deref())?;
        let prediction = engine.predict(&image);
        engine.close();
        prediction
    })
    .await??;

    match prediction {
        Some(prediction) => print_json(&prediction),
        None => {
            println!("No model available yet; train one first");
            Ok(())
        }
    }
}

fn train_config(args: &TrainArgs) -> TrainConfig {
    TrainConfig {
        epochs: args.epochs,
        batch_size: args.batch_size,
        lr: args.lr,
        img_size: args.img_size,
        seed: args.seed,
        val_split: args.val_split,
        from_scratch: args.from_scratch,
    }
}

async fn handle_train(action: TrainAction, config: &SkyConfig) -> anyhow::Result<()> {
    let orchestrator = TrainingOrchestrator::from_config(&config.trainer)?;
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted");
                cancel.cancel();
            }
        });
    }

    match action {
        TrainAction::Start { args, detach } => {
            let engine = if detach {
                None
            } else {
                let engine_config = config.clone();
                match tokio::task::spawn_blocking(move || open_engine(&engine_config, None)).await? {
                    Ok(engine) => Some(Arc::new(engine)),
                    Err(e) => {
                        warn!(error = %e, "Inference engine unavailable; the new model will not be loaded here");
                        None
                    }
                }
            };
            if let Some(engine) = &engine {
                reload_on_completion(&orchestrator, Arc::clone(engine));
            }

            orchestrator.start(train_config(&args), &cancel).await?;
            println!(
                "Training started in container {}",
                orchestrator.container_name()
            );
            if detach {
                println!("Detached; the idle container is not restored by this process");
                return Ok(());
            }

            let Some(status) = follow(&orchestrator, &cancel).await else {
                println!(
                    "Stopped following; training continues. Run `skyclf train stop` to abort."
                );
                return Ok(());
            };
            print_json(&status)?;
            if let Some(engine) = &engine {
                print_json(&engine.model_summary())?;
            }
            match status.exit_code {
                Some(0) => Ok(()),
                _ => anyhow::bail!("training did not complete: {}", status.error),
            }
        }
        TrainAction::Stop => {
            orchestrator.stop(&cancel).await?;
            println!("Stop requested for {}", orchestrator.container_name());
            Ok(())
        }
        TrainAction::Status => print_json(&orchestrator.status(&cancel).await),
    }
}

/// Poll until the run has ended and the idle container is back.
/// `None` when interrupted.
async fn follow(
    orchestrator: &TrainingOrchestrator,
    cancel: &CancellationToken,
) -> Option<TrainStatus> {
    let mut last_line = String::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
        let status = orchestrator.status(cancel).await;
        if status.phase == JobPhase::Idle && !status.running {
            return Some(status);
        }
        if let Some(line) = status.logs.lines().rev().find(|l| !l.trim().is_empty()) {
            if line != last_line {
                info!(phase = ?status.phase, "{line}");
                last_line = line.to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_train_config_from_args() {
        let args = TrainArgs {
            epochs: 5,
            batch_size: 32,
            lr: 0.0005,
            img_size: 256,
            seed: 7,
            val_split: 0.1,
            from_scratch: true,
        };
        let config = train_config(&args);
        assert_eq!(
            config,
            TrainConfig {
                epochs: 5,
                batch_size: 32,
                lr: 0.0005,
                img_size: 256,
                seed: 7,
                val_split: 0.1,
                from_scratch: true,
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_locator_uses_configured_task() {
        let mut config = SkyConfig::default();
        config.inference.task = "horizon".to_string();
        let locator = locator(&config);
        assert_eq!(locator.task(), "horizon");
        assert_eq!(
            locator.task_root(Path::new("/models")),
            PathBuf::from("/models/horizon")
        );
    }
}
