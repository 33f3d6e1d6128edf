//! Training configuration.
//!
//! Every subsystem gets its own statically typed section with documented
//! defaults, so a JSON file only needs to mention what it changes:
//!
//! ```rust
//! use revlm::config::Config;
//!
//! let config = Config::from_json_str(r#"{ "model": { "depth": 2 }, "dims": { "heads": 2 } }"#).unwrap();
//! assert_eq!(config.model.depth, 2);
//! assert_eq!(config.dims.heads, 2);
//! assert_eq!(config.optimizer.block_size, 512);
//! ```

use crate::error::{Error, Result};
use crate::tensor::StorageDtype;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Symbolic dimension names used by parameter declarations.
pub mod dims {
    pub const BATCH: &str = "batch";
    pub const SEQUENCE: &str = "sequence";
    pub const HEADS: &str = "heads";
    pub const FEATURES_PER_HEAD: &str = "features_per_head";
    pub const INTERMEDIATE: &str = "intermediate";
    pub const VOCAB: &str = "vocab";
    pub const ONE: &str = "one";
    pub const DEPTH: &str = "depth";
    pub const DEPTHWISE_CONV_KERNEL: &str = "depthwise_conv_kernel";
    pub const EXPERTS: &str = "experts";
    pub const SPATIAL_MIXING_KERNEL: &str = "spatial_mixing_kernel";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub vocab_size: usize,
    /// Byte-level corpus for the training binary.
    pub path: Option<PathBuf>,
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            vocab_size: 256,
            path: None,
            seed: 0,
        }
    }
}

/// Concrete sizes for the symbolic dims.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DimConfig {
    pub batch: usize,
    pub sequence: usize,
    pub heads: usize,
    pub features_per_head: usize,
    pub intermediate: usize,
    pub depthwise_conv_kernel: usize,
    pub experts: usize,
    /// Width of one spatial mixing step. `sequence` must be a power of it.
    pub spatial_mixing_kernel: usize,
}

impl Default for DimConfig {
    fn default() -> Self {
        Self {
            batch: 16,
            sequence: 256,
            heads: 8,
            features_per_head: 64,
            intermediate: 1024,
            depthwise_conv_kernel: 5,
            experts: 4,
            spatial_mixing_kernel: 16,
        }
    }
}

/// Number of nested `kernel`-sized axes that make up `sequence`, or `None`
/// when `sequence` is not a positive power of `kernel`.
pub fn spatial_mixing_levels(sequence: usize, kernel: usize) -> Option<u32> {
    if kernel < 2 {
        return None;
    }
    let (mut span, mut levels) = (1usize, 0u32);
    while span < sequence {
        span = span.checked_mul(kernel)?;
        levels += 1;
    }
    (span == sequence && levels > 0).then_some(levels)
}

/// One sub-computation inside a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    FeedForward,
    GroupFeedForward,
    Attention,
    SpatialMixing,
    DepthwiseConv,
    Moe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of layers; each layer applies every entry of `blocks`.
    pub depth: usize,
    pub blocks: Vec<BlockKind>,
    pub leaky_relu_slope: f32,
    pub norm_eps: f32,
    /// Wrap blocks as a momentum network (`momentumnet_beta` decay).
    pub momentumnet: bool,
    pub momentumnet_beta: f64,
    pub storage_dtype: StorageDtype,
    pub seed: u64,
    pub z_loss: f32,
    /// Fraction of the batch (highest losses first) that forms the top loss.
    pub loss_top_p: f64,
    pub loss_top_snap: usize,
    /// Per-expert capacity as a multiple of `tokens / experts`, rounded down.
    pub moe_capacity_factor: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            depth: 16,
            blocks: vec![BlockKind::Attention, BlockKind::FeedForward],
            leaky_relu_slope: 0.02,
            norm_eps: 1e-5,
            momentumnet: false,
            momentumnet_beta: 0.99,
            storage_dtype: StorageDtype::F32,
            seed: 0,
            z_loss: 0.0,
            loss_top_p: 1.0,
            loss_top_snap: 1,
            moe_capacity_factor: 1.0,
        }
    }
}

impl ModelConfig {
    /// Standard deviation of `leaky_relu(x)` for `x ~ N(0, 1)`.
    pub fn activation_std(&self) -> f64 {
        let slope = f64::from(self.leaky_relu_slope);
        let mean = (1.0 - slope) / (2.0 * std::f64::consts::PI).sqrt();
        let second_moment = (1.0 + slope * slope) / 2.0;
        (second_moment - mean * mean).sqrt()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InitializerConfig {
    /// Dims treated as independent stacking axes by orthogonal init.
    pub split_dims: Vec<String>,
    pub column_axes: usize,
}

impl Default for InitializerConfig {
    fn default() -> Self {
        Self {
            split_dims: vec![dims::HEADS.to_string()],
            column_axes: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecondMoment {
    #[default]
    Adam,
    Sm3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub warmup_end: usize,
    pub exponential_decay: f64,
    pub gradient_clip: f64,
    pub epsilon: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub momentum_beta: f64,
    pub shampoo_beta2: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
    pub heavyball: bool,
    pub second_moment: SecondMoment,
    /// Axes longer than this are split into block-diagonal preconditioners.
    pub block_size: usize,
    /// Preconditioner roots are refreshed on steps divisible by this.
    pub statistics_compute_steps: usize,
    pub root_iterations: usize,
    pub root_ridge_epsilon: f64,
    pub root_error_tolerance: f64,
    /// Iterative roots with a larger residual fall back to eigendecomposition.
    pub root_fallback_threshold: f64,
    /// Store momentum buffers of large parameters in bf16.
    pub quantize_state: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            warmup_end: 1000,
            exponential_decay: 1e-5,
            gradient_clip: 0.01,
            epsilon: 1e-16,
            adam_beta1: 0.9,
            adam_beta2: 0.99,
            momentum_beta: 0.9,
            shampoo_beta2: 0.99,
            weight_decay: 0.001,
            nesterov: false,
            heavyball: false,
            second_moment: SecondMoment::Adam,
            block_size: 512,
            statistics_compute_steps: 4,
            root_iterations: 100,
            root_ridge_epsilon: 1e-6,
            root_error_tolerance: 1e-6,
            root_fallback_threshold: 1e-3,
            quantize_state: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub steps: usize,
    /// Optimizer steps run per batch pulled from the iterator.
    pub device_steps: usize,
    /// Data-parallel replicas.
    pub devices: usize,
    pub print_interval: usize,
    pub checkpoint_interval: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            steps: 1000,
            device_steps: 1,
            devices: 1,
            print_interval: 10,
            checkpoint_interval: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    /// Load `path` before training if it holds a checkpoint.
    pub load: bool,
    /// Number of shards written; tensors are split along their `heads` axis.
    pub shards: usize,
    /// Threads used to download shards (one per local device).
    pub local_device_count: usize,
    pub retry_delay_ms: u64,
    /// Names matching this pattern keep their current values when loading.
    pub ignore_pattern: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("checkpoints"),
            load: false,
            shards: 1,
            local_device_count: 1,
            retry_delay_ms: 0,
            ignore_pattern: ".*optimizer.*".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data: DataConfig,
    pub dims: DimConfig,
    pub model: ModelConfig,
    pub initializer: InitializerConfig,
    pub optimizer: OptimizerConfig,
    pub training: TrainingConfig,
    pub checkpoint: CheckpointConfig,
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_json_str(&text)
    }

    /// Size of a symbolic dim.
    pub fn dim(&self, name: &str) -> Result<usize> {
        Ok(match name {
            dims::BATCH => self.dims.batch,
            dims::SEQUENCE => self.dims.sequence,
            dims::HEADS => self.dims.heads,
            dims::FEATURES_PER_HEAD => self.dims.features_per_head,
            dims::INTERMEDIATE => self.dims.intermediate,
            dims::VOCAB => self.data.vocab_size,
            dims::ONE => 1,
            dims::DEPTH => self.model.depth,
            dims::DEPTHWISE_CONV_KERNEL => self.dims.depthwise_conv_kernel,
            dims::EXPERTS => self.dims.experts,
            dims::SPATIAL_MIXING_KERNEL => self.dims.spatial_mixing_kernel,
            other => return Err(Error::UnknownDim(other.to_string())),
        })
    }

    pub fn shape_of(&self, dims: &[&str]) -> Result<Vec<usize>> {
        dims.iter().map(|d| self.dim(d)).collect()
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("data.vocab_size", self.data.vocab_size),
            ("dims.batch", self.dims.batch),
            ("dims.sequence", self.dims.sequence),
            ("dims.heads", self.dims.heads),
            ("dims.features_per_head", self.dims.features_per_head),
            ("dims.intermediate", self.dims.intermediate),
            ("dims.depthwise_conv_kernel", self.dims.depthwise_conv_kernel),
            ("dims.experts", self.dims.experts),
            ("dims.spatial_mixing_kernel", self.dims.spatial_mixing_kernel),
            ("model.depth", self.model.depth),
            ("model.loss_top_snap", self.model.loss_top_snap),
            ("optimizer.warmup_end", self.optimizer.warmup_end),
            ("optimizer.statistics_compute_steps", self.optimizer.statistics_compute_steps),
            ("training.device_steps", self.training.device_steps),
            ("training.devices", self.training.devices),
            ("checkpoint.shards", self.checkpoint.shards),
            ("checkpoint.local_device_count", self.checkpoint.local_device_count),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{name} must be positive")));
        }
        if self.model.blocks.is_empty() {
            return Err(Error::Config("model.blocks must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.model.loss_top_p) || self.model.loss_top_p == 0.0 {
            return Err(Error::Config("model.loss_top_p must be in (0, 1]".to_string()));
        }
        if self.model.momentumnet && !(self.model.momentumnet_beta > 0.0 && self.model.momentumnet_beta < 1.0) {
            return Err(Error::Config("model.momentumnet_beta must be in (0, 1)".to_string()));
        }
        if self.model.blocks.contains(&BlockKind::SpatialMixing)
            && spatial_mixing_levels(self.dims.sequence, self.dims.spatial_mixing_kernel).is_none()
        {
            return Err(Error::Config(format!(
                "dims.sequence ({}) must be a power of dims.spatial_mixing_kernel ({})",
                self.dims.sequence, self.dims.spatial_mixing_kernel
            )));
        }
        if self.dims.heads % self.checkpoint.shards != 0 {
            return Err(Error::Config(format!(
                "checkpoint.shards ({}) must divide dims.heads ({})",
                self.checkpoint.shards, self.dims.heads
            )));
        }
        for name in &self.initializer.split_dims {
            self.dim(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = Config::from_json_str(
            r#"{ "model": { "blocks": ["feed_forward", "moe"], "storage_dtype": "bf16" } }"#,
        )
        .unwrap();
        assert_eq!(config.model.blocks, vec![BlockKind::FeedForward, BlockKind::Moe]);
        assert_eq!(config.model.storage_dtype, StorageDtype::Bf16);
        assert_eq!(config.model.depth, 16);
        assert_eq!(config.checkpoint.ignore_pattern, ".*optimizer.*");
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(matches!(
            Config::from_json_str(r#"{ "dims": { "heads": 0 } }"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_json_str(r#"{ "checkpoint": { "shards": 3 } }"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_json_str(r#"{ "initializer": { "split_dims": ["nope"] } }"#),
            Err(Error::UnknownDim(_))
        ));
    }

    #[test]
    fn test_spatial_mixing_levels() {
        assert_eq!(spatial_mixing_levels(256, 16), Some(2));
        assert_eq!(spatial_mixing_levels(8, 2), Some(3));
        assert_eq!(spatial_mixing_levels(5, 5), Some(1));
        assert_eq!(spatial_mixing_levels(12, 2), None);
        assert_eq!(spatial_mixing_levels(1, 4), None);
        assert_eq!(spatial_mixing_levels(4, 1), None);

        let err = Config::from_json_str(
            r#"{ "model": { "blocks": ["spatial_mixing"] }, "dims": { "sequence": 100 } }"#,
        );
        assert!(matches!(err, Err(Error::Config(_))));
        // only checked when the block is in use
        Config::from_json_str(r#"{ "dims": { "sequence": 100 } }"#).unwrap();
    }

    #[test]
    fn test_dim_lookup() {
        let config = Config::default();
        assert_eq!(config.dim(dims::VOCAB).unwrap(), 256);
        assert_eq!(config.shape_of(&[dims::HEADS, dims::ONE]).unwrap(), vec![8, 1]);
    }

    #[test]
    fn test_activation_std() {
        // plain ReLU: sqrt(1/2 - 1/(2*pi))
        let relu = ModelConfig {
            leaky_relu_slope: 0.0,
            ..ModelConfig::default()
        };
        assert!((relu.activation_std() - 0.5838).abs() < 1e-3);
    }
}
