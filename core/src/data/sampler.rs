//! Strategies for choosing where training windows start.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Uniform};

/// A trait for determining the order of data access.
pub trait Sampler: Send {
    /// Returns `count` window offsets, each at most `max_offset`.
    fn sample(&mut self, count: usize, max_offset: usize) -> Vec<usize>;
}

/// Consecutive windows of `stride` tokens, wrapping around at the end.
#[derive(Debug, Clone)]
pub struct SequentialSampler {
    stride: usize,
    next: usize,
}

impl SequentialSampler {
    pub fn new(stride: usize) -> Self {
        Self {
            stride: stride.max(1),
            next: 0,
        }
    }
}

impl Sampler for SequentialSampler {
    fn sample(&mut self, count: usize, max_offset: usize) -> Vec<usize> {
        (0..count)
            .map(|_| {
                if self.next > max_offset {
                    self.next = 0;
                }
                let offset = self.next;
                self.next += self.stride;
                offset
            })
            .collect()
    }
}

/// Uniformly random offsets from a seeded generator.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    rng: StdRng,
}

impl RandomSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Sampler for RandomSampler {
    fn sample(&mut self, count: usize, max_offset: usize) -> Vec<usize> {
        match Uniform::new_inclusive(0, max_offset) {
            Ok(dist) => (0..count).map(|_| dist.sample(&mut self.rng)).collect(),
            Err(_) => vec![0; count],
        }
    }
}
