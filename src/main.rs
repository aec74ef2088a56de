use anyhow::{anyhow, bail, Result};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use jepa_world::tasks::{run_training, TrainOptions};
use jepa_world::{ExecutionContext, JepaConfig};

struct TrainArgs {
    states_path: PathBuf,
    actions_path: PathBuf,
    config_path: Option<PathBuf>,
    out_path: PathBuf,
    epochs: Option<usize>,
    batch_size: Option<usize>,
    lr: Option<f64>,
    cpu: bool,
}

impl TrainArgs {
    fn from_args_after(args: &[String]) -> Result<Self> {
        let mut positional = Vec::new();
        let mut parsed = Self {
            states_path: PathBuf::new(),
            actions_path: PathBuf::new(),
            config_path: None,
            out_path: PathBuf::from("jepa_world.safetensors"),
            epochs: None,
            batch_size: None,
            lr: None,
            cpu: false,
        };
        let mut i = 0usize;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = || {
                args.get(i + 1)
                    .ok_or_else(|| anyhow!("{flag} requires a value"))
            };
            match flag {
                "--config" => parsed.config_path = Some(PathBuf::from(value()?)),
                "--out" => parsed.out_path = PathBuf::from(value()?),
                "--epochs" => parsed.epochs = Some(parse_value(flag, value()?)?),
                "--batch" => parsed.batch_size = Some(parse_value(flag, value()?)?),
                "--lr" => parsed.lr = Some(parse_value(flag, value()?)?),
                "--cpu" => {
                    parsed.cpu = true;
                    i += 1;
                    continue;
                }
                other if other.starts_with("--") => bail!("unknown option {other}"),
                other => {
                    positional.push(other.to_string());
                    i += 1;
                    continue;
                }
            }
            i += 2;
        }
        let [states, actions] = positional.as_slice() else {
            bail!("usage: train <states.npy> <actions.npy> [--config <cfg.json>] [--out <model.safetensors>] [--epochs N] [--batch N] [--lr F] [--cpu]");
        };
        parsed.states_path = PathBuf::from(states);
        parsed.actions_path = PathBuf::from(actions);
        Ok(parsed)
    }

    fn config(&self) -> Result<JepaConfig> {
        let mut config = match &self.config_path {
            Some(path) => JepaConfig::from_json_file(path)?,
            None => JepaConfig::default(),
        };
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(lr) = self.lr {
            config.learning_rate = lr;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("{flag} got unparseable value {value:?}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("jepa-world");

    if args.len() >= 2 && (args[1] == "train" || args[1] == "--train") {
        let train = TrainArgs::from_args_after(&args[2..])?;
        let config = train.config()?;
        let ctx = if train.cpu {
            ExecutionContext::cpu()
        } else {
            ExecutionContext::cuda_if_available(0)
        };
        let options = TrainOptions {
            states_path: train.states_path,
            actions_path: train.actions_path,
            out_path: train.out_path,
            config,
        };
        let summary = run_training(&options, &ctx)?;
        println!(
            "trained {} epochs ({} optimizer steps, {} skipped), best loss {}",
            summary.epochs,
            summary.optimizer_steps,
            summary.skipped_steps,
            summary
                .best_loss
                .map_or_else(|| "n/a".to_string(), |l| format!("{l:.4}"))
        );
        println!("weights: {}", summary.out_path.display());
        println!("best:    {}", summary.best_path.display());
        return Ok(());
    }

    if args.len() >= 2 && (args[1] == "config" || args[1] == "--config") {
        let config = if args.iter().skip(2).any(|a| a == "--compact") {
            JepaConfig::compact()
        } else {
            JepaConfig::default()
        };
        println!("{}", config.to_json_pretty()?);
        return Ok(());
    }

    eprintln!("usage (choose one):");
    eprintln!("  Training:");
    eprintln!(
        "    {program} train <states.npy> <actions.npy> [--config <cfg.json>] [--out <model.safetensors>] [--epochs N] [--batch N] [--lr F] [--cpu]"
    );
    eprintln!("  Configuration:");
    eprintln!("    {program} config [--compact]");
    bail!("specify a mode: train or config");
}
