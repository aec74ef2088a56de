use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::config::JepaConfig;
use crate::context::ExecutionContext;
use crate::data::{TrajectoryDataset, TrajectoryLoader};
use crate::error::JepaError;
use crate::format::{format_duration, format_params};
use crate::model::WorldModel;
use crate::trainer::{CheckpointSink, SafetensorsSink, Trainer};

/// Inputs of one training run.
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub states_path: PathBuf,
    pub actions_path: PathBuf,
    /// Final weights; the best epoch goes next to it as `<stem>_best.safetensors`.
    pub out_path: PathBuf,
    pub config: JepaConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub epochs: usize,
    pub micro_steps: u64,
    pub optimizer_steps: u64,
    pub skipped_steps: usize,
    /// Lowest mean epoch loss, if any epoch produced one.
    pub best_loss: Option<f32>,
    pub out_path: PathBuf,
    pub best_path: PathBuf,
}

pub fn best_path_for(out_path: &Path) -> PathBuf {
    let stem = out_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("jepa_world");
    out_path.with_file_name(format!("{stem}_best.safetensors"))
}

/// Train over the dataset for `config.epochs` epochs.
///
/// Steps whose loss is not finite are skipped with a warning, as are
/// single-trajectory batches, which have no batch statistics. Every other
/// error aborts the run.
pub fn run(options: &TrainOptions, ctx: &ExecutionContext) -> Result<TrainSummary> {
    let config = &options.config;
    config.validate()?;

    let dataset = TrajectoryDataset::open(&options.states_path, &options.actions_path)
        .with_context(|| format!("open trajectories {:?}", options.states_path))?;
    dataset.check_config(config)?;
    if dataset.trajectory_len() < 2 {
        bail!(
            "trajectories have {} frame(s); training needs at least two",
            dataset.trajectory_len()
        );
    }
    let loader = TrajectoryLoader::new(&dataset, config.batch_size, config.seed)?;

    let model = WorldModel::new(config, ctx)?;
    info!(
        trajectories = dataset.len(),
        frames = dataset.trajectory_len(),
        batches = loader.num_batches(),
        parameters = %format_params(model.parameter_count()),
        "training world model"
    );
    let mut trainer = Trainer::new(model, ctx)?;

    let best_path = best_path_for(&options.out_path);
    let mut best_sink = SafetensorsSink::new(&best_path);
    let mut final_sink = SafetensorsSink::new(&options.out_path);
    let mut best_loss: Option<f32> = None;
    let mut skipped_steps = 0usize;
    let started = Instant::now();

    for epoch in 0..config.epochs {
        trainer.begin_epoch(epoch);
        let epoch_started = Instant::now();
        let mut loss_sum = 0f64;
        let mut loss_count = 0usize;

        for batch in loader.batches(epoch, ctx) {
            let batch = batch?;
            if batch.batch_size() < 2 {
                warn!(epoch, "skipping single-trajectory batch");
                skipped_steps += 1;
                continue;
            }
            match trainer.train_step(&batch) {
                Ok(report) => {
                    if let Some(loss) = report.loss {
                        loss_sum += loss.total as f64;
                        loss_count += 1;
                    }
                }
                Err(JepaError::NonFiniteLoss { step, value }) => {
                    warn!(step, value, epoch, "skipping step with non-finite loss");
                    skipped_steps += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if loss_count == 0 {
            warn!(epoch, "epoch produced no finite loss");
            continue;
        }
        let mean = (loss_sum / loss_count as f64) as f32;
        let improved = best_loss.map_or(true, |best| mean < best);
        info!(
            epoch = epoch + 1,
            epochs = config.epochs,
            loss = mean,
            lr = trainer.learning_rate(),
            accumulation_steps = trainer.accumulation_steps(),
            optimizer_steps = trainer.optimizer_steps(),
            elapsed = %format_duration(epoch_started.elapsed()),
            best = improved,
            "epoch done"
        );
        if improved {
            best_loss = Some(mean);
            best_sink.save(&trainer.model().snapshot()?)?;
        }
    }

    final_sink.save(&trainer.model().snapshot()?)?;
    info!(
        total = %format_duration(started.elapsed()),
        skipped_steps,
        out = %options.out_path.display(),
        "training finished"
    );

    Ok(TrainSummary {
        epochs: config.epochs,
        micro_steps: trainer.micro_steps(),
        optimizer_steps: trainer.optimizer_steps(),
        skipped_steps,
        best_loss,
        out_path: options.out_path.clone(),
        best_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::npy::write_f32;
    use crate::trainer::load_snapshot;

    fn tiny_config() -> JepaConfig {
        JepaConfig {
            in_channels: 1,
            observation_height: 8,
            observation_width: 8,
            encoder_channels: vec![4],
            state_dim: 16,
            latent_channels: 1,
            latent_height: 4,
            latent_width: 4,
            hidden_dim: 8,
            cnn_channels: 4,
            epochs: 2,
            batch_size: 2,
            initial_accumulation_steps: 2,
            final_accumulation_steps: 1,
            ..JepaConfig::default()
        }
    }

    #[test]
    fn best_path_sits_next_to_output() {
        assert_eq!(
            best_path_for(Path::new("runs/model.safetensors")),
            PathBuf::from("runs/model_best.safetensors")
        );
    }

    #[test]
    fn trains_and_saves_both_checkpoints() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (n, t) = (5, 3);
        let states: Vec<f32> = (0..n * t * 64).map(|i| ((i * 37) % 101) as f32 / 101.0).collect();
        let actions: Vec<f32> = (0..n * (t - 1) * 2).map(|i| (i % 7) as f32 - 3.0).collect();
        let states_path = dir.path().join("states.npy");
        let actions_path = dir.path().join("actions.npy");
        write_f32(&states_path, &[n, t, 1, 8, 8], &states)?;
        write_f32(&actions_path, &[n, t - 1, 2], &actions)?;

        let options = TrainOptions {
            states_path,
            actions_path,
            out_path: dir.path().join("model.safetensors"),
            config: tiny_config(),
        };
        let ctx = ExecutionContext::cpu();
        let summary = run(&options, &ctx)?;

        assert_eq!(summary.epochs, 2);
        // Batches of 2, 2 and 1 per epoch; the last is skipped.
        assert_eq!(summary.micro_steps, 4);
        assert_eq!(summary.skipped_steps, 2);
        assert_eq!(summary.optimizer_steps, 2);
        assert!(summary.best_loss.is_some_and(f32::is_finite));
        assert!(summary.out_path.exists());
        assert!(summary.best_path.exists());
        assert!(!load_snapshot(&summary.out_path, &ctx)?.is_empty());
        Ok(())
    }

    #[test]
    fn non_finite_steps_are_skipped_and_weights_stay_finite() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (n, t) = (4, 3);
        let mut states: Vec<f32> = (0..n * t * 64).map(|i| ((i * 13) % 29) as f32 / 29.0).collect();
        // One bad pixel in the first trajectory poisons whichever batch holds it.
        states[5] = f32::NAN;
        let actions: Vec<f32> = (0..n * (t - 1) * 2).map(|i| (i % 5) as f32 - 2.0).collect();
        let states_path = dir.path().join("states.npy");
        let actions_path = dir.path().join("actions.npy");
        write_f32(&states_path, &[n, t, 1, 8, 8], &states)?;
        write_f32(&actions_path, &[n, t - 1, 2], &actions)?;

        let options = TrainOptions {
            states_path,
            actions_path,
            out_path: dir.path().join("model.safetensors"),
            config: JepaConfig {
                initial_accumulation_steps: 1,
                ..tiny_config()
            },
        };
        let ctx = ExecutionContext::cpu();
        let summary = run(&options, &ctx)?;

        assert_eq!(summary.micro_steps, 4);
        assert_eq!(summary.skipped_steps, 2);
        assert_eq!(summary.optimizer_steps, 2);
        assert!(summary.best_loss.is_some_and(f32::is_finite));
        let snapshot = load_snapshot(&summary.out_path, &ctx)?;
        for (name, tensor) in snapshot.tensors() {
            let values = tensor.flatten_all()?.to_vec1::<f32>()?;
            assert!(values.iter().all(|v| v.is_finite()), "{name}");
        }
        Ok(())
    }

    #[test]
    fn mismatched_dataset_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let states_path = dir.path().join("states.npy");
        let actions_path = dir.path().join("actions.npy");
        write_f32(&states_path, &[2, 2, 3, 8, 8], &[0.0; 2 * 2 * 3 * 64])?;
        write_f32(&actions_path, &[2, 1, 2], &[0.0; 4])?;
        let options = TrainOptions {
            states_path,
            actions_path,
            out_path: dir.path().join("model.safetensors"),
            config: tiny_config(),
        };
        assert!(run(&options, &ExecutionContext::cpu()).is_err());
        Ok(())
    }
}
