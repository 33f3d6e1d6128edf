//! Learning Rate Schedulers.

use crate::config::OptimizerConfig;

/// A trait for learning rate schedulers.
pub trait LRScheduler {
    /// Calculates the learning rate for a given step.
    fn get_lr(&self, step: usize) -> f64;
}

/// Linear warmup followed by exponential decay.
///
/// $$
/// \eta_t = \eta \cdot \frac{\min(t, w)}{w} \cdot (1 - d)^{\max(t - w, 0)}
/// $$
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmupExponentialDecay {
    pub max_lr: f64,
    pub warmup_steps: usize,
    pub decay: f64,
}

impl WarmupExponentialDecay {
    pub fn new(max_lr: f64, warmup_steps: usize, decay: f64) -> Self {
        Self {
            max_lr,
            warmup_steps,
            decay,
        }
    }

    pub fn from_config(config: &OptimizerConfig) -> Self {
        Self::new(config.learning_rate, config.warmup_end, config.exponential_decay)
    }
}

impl LRScheduler for WarmupExponentialDecay {
    fn get_lr(&self, step: usize) -> f64 {
        let warmup = self.warmup_steps.max(1);
        let ramp = step.min(warmup) as f64 / warmup as f64;
        let decay_steps = step.saturating_sub(self.warmup_steps);
        self.max_lr * ramp * (1.0 - self.decay).powf(decay_steps as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup() {
        let sched = WarmupExponentialDecay::new(1.0, 10, 0.1);
        assert_eq!(sched.get_lr(0), 0.0);
        assert!((sched.get_lr(5) - 0.5).abs() < 1e-12);
        assert!((sched.get_lr(10) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_decay_starts_after_warmup() {
        let sched = WarmupExponentialDecay::new(1.0, 10, 0.1);
        assert!((sched.get_lr(11) - 0.9).abs() < 1e-12);
        assert!((sched.get_lr(12) - 0.81).abs() < 1e-12);
        assert!(sched.get_lr(1000) < 1e-10);
    }

    #[test]
    fn test_zero_warmup() {
        let sched = WarmupExponentialDecay::new(0.5, 0, 0.0);
        assert_eq!(sched.get_lr(0), 0.0);
        assert_eq!(sched.get_lr(3), 0.5);
    }
}
