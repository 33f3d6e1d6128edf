//! Token corpora and batching.
//!
//! # Components
//!
//! - **TokenSource**: a flat sequence of token ids with random access.
//! - **Sampler**: picks where each training window starts.
//! - **TokenBatches**: an endless iterator of `[inner_steps, devices, batch, sequence + 1]`
//!   windows, split into shifted inputs and targets.

use crate::error::{Error, Result};
use memmap2::Mmap;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Uniform};
use std::fs::File;
use std::path::Path;

pub mod loader;
pub mod sampler;

pub use loader::{DeviceBatches, TokenBatches};
pub use sampler::{RandomSampler, Sampler, SequentialSampler};

/// A flat sequence of token ids.
pub trait TokenSource: Send + Sync {
    /// Total number of tokens.
    fn len(&self) -> usize;

    /// Returns `true` if the source holds no tokens.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tokens `[start, start + len)`.
    fn window(&self, start: usize, len: usize) -> Result<Vec<usize>>;
}

fn check_range(start: usize, len: usize, total: usize) -> Result<()> {
    if start + len > total {
        return Err(Error::Data(format!(
            "window [{start}, {}) past the end of a {total}-token source",
            start + len
        )));
    }
    Ok(())
}

/// A file read as one token per byte, memory-mapped.
pub struct ByteCorpus {
    mmap: Mmap,
}

impl ByteCorpus {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        // SAFETY: the corpus is opened read-only and not modified while training.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))?;
        Ok(Self { mmap })
    }
}

impl TokenSource for ByteCorpus {
    fn len(&self) -> usize {
        self.mmap.len()
    }

    fn window(&self, start: usize, len: usize) -> Result<Vec<usize>> {
        check_range(start, len, self.mmap.len())?;
        Ok(self.mmap[start..start + len].iter().map(|&b| b as usize).collect())
    }
}

/// Tokens held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticCorpus {
    tokens: Vec<usize>,
}

impl SyntheticCorpus {
    pub fn new(tokens: Vec<usize>) -> Self {
        Self { tokens }
    }

    /// `length` tokens repeating a random pattern of `period` ids below `vocab`.
    ///
    /// Every token is predictable from the previous `period` ones, which makes
    /// it a useful smoke-test corpus.
    pub fn periodic(vocab: usize, period: usize, length: usize, seed: u64) -> Result<Self> {
        if vocab == 0 || period == 0 {
            return Err(Error::Data("periodic corpus needs a vocabulary and a period".to_string()));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let dist = Uniform::new(0, vocab).map_err(|e| Error::Data(e.to_string()))?;
        let pattern: Vec<usize> = (0..period).map(|_| dist.sample(&mut rng)).collect();
        Ok(Self::new((0..length).map(|i| pattern[i % period]).collect()))
    }
}

impl TokenSource for SyntheticCorpus {
    fn len(&self) -> usize {
        self.tokens.len()
    }

    fn window(&self, start: usize, len: usize) -> Result<Vec<usize>> {
        check_range(start, len, self.tokens.len())?;
        Ok(self.tokens[start..start + len].to_vec())
    }
}
