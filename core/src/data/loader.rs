//! Batch iterator.

use super::{RandomSampler, Sampler, TokenSource};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::TokenBatch;
use std::sync::Arc;

/// One iterator item: `inner_steps` entries of `devices` batches each.
pub type DeviceBatches = Vec<Vec<TokenBatch>>;

/// Endless iterator of training batches.
///
/// Every window is `sequence + 1` tokens long so that inputs and targets
/// can be cut from it with a one-token shift.
pub struct TokenBatches<S: TokenSource> {
    source: Arc<S>,
    batch: usize,
    sequence: usize,
    devices: usize,
    inner_steps: usize,
    vocab_size: usize,
    sampler: Box<dyn Sampler>,
}

impl<S: TokenSource> TokenBatches<S> {
    /// Creates a batch iterator with a random sampler seeded from `config.data.seed`.
    pub fn new(source: S, config: &Config) -> Result<Self> {
        let batches = Self {
            source: Arc::new(source),
            batch: config.dims.batch,
            sequence: config.dims.sequence,
            devices: config.training.devices.max(1),
            inner_steps: config.training.device_steps.max(1),
            vocab_size: config.data.vocab_size,
            sampler: Box::new(RandomSampler::new(config.data.seed)),
        };
        if batches.source.len() < batches.sequence + 1 {
            return Err(Error::Data(format!(
                "corpus of {} tokens is shorter than one window of {}",
                batches.source.len(),
                batches.sequence + 1
            )));
        }
        Ok(batches)
    }

    /// Sets the sampler to use.
    pub fn with_sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.sampler = Box::new(sampler);
        self
    }

    fn next_batches(&mut self) -> Result<DeviceBatches> {
        let window = self.sequence + 1;
        let max_offset = self.source.len() - window;
        let mut steps = Vec::with_capacity(self.inner_steps);
        for _ in 0..self.inner_steps {
            let mut devices = Vec::with_capacity(self.devices);
            for _ in 0..self.devices {
                let mut tokens = Vec::with_capacity(self.batch * window);
                for offset in self.sampler.sample(self.batch, max_offset) {
                    tokens.extend(self.source.window(offset, window)?);
                }
                if let Some(bad) = tokens.iter().find(|&&t| t >= self.vocab_size) {
                    return Err(Error::Data(format!(
                        "token {bad} outside a vocabulary of {}",
                        self.vocab_size
                    )));
                }
                devices.push(TokenBatch::from_windows(&tokens, self.batch, self.sequence)?);
            }
            steps.push(devices);
        }
        Ok(steps)
    }
}

impl<S: TokenSource> Iterator for TokenBatches<S> {
    type Item = Result<DeviceBatches>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batches())
    }
}
