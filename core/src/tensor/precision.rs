//! Storage precision.
//!
//! Parameters may be stored in `bf16` while all model math runs in `f32`.
//! Storage is simulated by rounding values through `half::bf16` on write, so
//! the in-memory representation stays `Tensor<f32>` and reads are free.

use super::Tensor;
use half::bf16;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDtype {
    #[default]
    F32,
    Bf16,
}

impl StorageDtype {
    /// Rounds `value` to what this dtype can represent.
    pub fn round(self, value: &Tensor<f32>) -> Tensor<f32> {
        match self {
            StorageDtype::F32 => value.clone(),
            StorageDtype::Bf16 => value.map(|x| bf16::from_f32(x).to_f32()),
        }
    }
}
