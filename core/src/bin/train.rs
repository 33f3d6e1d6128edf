//! `revlm-train`: trains the reversible language model on a byte-level corpus.
//!
//! ```text
//! revlm-train --config run.json --data corpus.txt --steps 2000 --devices 4
//! ```
//!
//! Without `--data` (or `data.path` in the config) the model trains on a
//! synthetic periodic sequence.

use clap::Parser;
use revlm::checkpoint::{Checkpointer, LocalStore};
use revlm::config::Config;
use revlm::data::{ByteCorpus, SyntheticCorpus, TokenBatches};
use revlm::logging::{self, LogFormat};
use revlm::train::Trainer;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "revlm-train", about = "Train a reversible transformer language model")]
struct Args {
    /// JSON configuration; omitted fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Byte-level training corpus
    #[arg(long)]
    data: Option<PathBuf>,

    #[arg(long)]
    steps: Option<usize>,

    /// Data-parallel replicas
    #[arg(long)]
    devices: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// Checkpoint directory
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Resume from the checkpoint directory if it holds a checkpoint
    #[arg(long)]
    resume: bool,

    #[arg(long)]
    seed: Option<u64>,

    /// Log filter in RUST_LOG syntax
    #[arg(long)]
    log: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
}

impl Args {
    fn into_config(self) -> revlm::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_json_file(path)?,
            None => Config::default(),
        };
        if let Some(data) = self.data {
            config.data.path = Some(data);
        }
        if let Some(steps) = self.steps {
            config.training.steps = steps;
        }
        if let Some(devices) = self.devices {
            config.training.devices = devices;
        }
        if let Some(lr) = self.learning_rate {
            config.optimizer.learning_rate = lr;
        }
        if let Some(path) = self.checkpoint {
            config.checkpoint.path = path;
        }
        if self.resume {
            config.checkpoint.load = true;
        }
        if let Some(seed) = self.seed {
            config.model.seed = seed;
            config.data.seed = seed;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    logging::init(args.log.as_deref(), args.log_format)?;
    let config = args.into_config()?;

    let checkpointer = Checkpointer::new(LocalStore::new(config.checkpoint.path.clone()), config.checkpoint.clone());
    let trainer = Trainer::new(config.clone())?.with_checkpointer(checkpointer);

    let state = match &config.data.path {
        Some(path) => {
            info!(path = %path.display(), "training on byte corpus");
            trainer.run(&mut TokenBatches::new(ByteCorpus::open(path)?, &config)?)?
        }
        None => {
            info!("training on synthetic corpus");
            let length = 64 * (config.dims.sequence + 1);
            let corpus = SyntheticCorpus::periodic(config.data.vocab_size, 17, length, config.data.seed)?;
            trainer.run(&mut TokenBatches::new(corpus, &config)?)?
        }
    };
    info!(
        step = state.step,
        loss = state.loss,
        accuracy = state.accuracy,
        "done"
    );
    Ok(())
}
