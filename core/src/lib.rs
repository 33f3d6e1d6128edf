//! # revlm
//!
//! `revlm` is the training core of a reversible transformer language model,
//! running on CPU threads.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: Dynamic-rank tensors and storage dtypes.
//! - [`autograd`]: Tape-based reverse-mode differentiation with custom gradients.
//! - [`context`]: Hierarchical parameter naming, the shared parameter store and initializers.
//! - [`reversible`]: Reversible residual blocks whose backward pass recomputes inputs.
//! - [`model`]: Embeddings, attention/feed-forward/convolution/MoE blocks and the loss.
//! - [`optim`]: Adam/SM3 with a grafted, blocked Shampoo preconditioner.
//! - [`distributed`]: Collective communication between data-parallel replicas.
//! - [`checkpoint`]: Sharded npz checkpoints over an object store.
//! - [`data`], [`train`]: Batch iteration and the training loop.
//!
//! ## Example
//!
//! ```rust
//! use revlm::config::Config;
//! use revlm::context::{Context, Mode};
//! use revlm::model::{self, TokenBatch};
//!
//! let mut config = Config::default();
//! config.data.vocab_size = 4;
//! config.dims.batch = 1;
//! config.dims.sequence = 4;
//! config.dims.heads = 2;
//! config.dims.features_per_head = 2;
//! config.dims.intermediate = 4;
//! config.model.depth = 2;
//!
//! let batch = TokenBatch::from_windows(&[0, 1, 2, 3, 0], 1, 4).unwrap();
//! let mut init = Context::new(config, Mode::Init);
//! model::init_params(&mut init, &batch).unwrap();
//!
//! let mut ctx = Context::with_store(init.config_rc(), init.store_rc(), Mode::Compute);
//! let out = model::compute(&mut ctx, &batch).unwrap();
//! assert!(out.loss.is_finite());
//! ```

/// Macro for creating a Tensor with compile-time shape checking.
///
/// # Examples
///
/// ```rust
/// use revlm::tensor;
/// use revlm::tensor::Tensor;
///
/// // Works
/// let t: Tensor = tensor!([1.0, 2.0, 3.0, 4.0], [2, 2]);
///
/// // Fails to compile:
/// // let t = tensor!([1.0, 2.0, 3.0], [2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($data:expr, $shape:expr) => {{
        // Constants to force compile-time evaluation
        const DATA_LEN: usize = (&$data as &[_]).len();
        const SHAPE: [usize; (&$shape as &[_]).len()] = $shape;
        const EXPECTED_SIZE: usize = {
            let mut size = 1;
            let mut i = 0;
            while i < (&SHAPE as &[_]).len() {
                size *= SHAPE[i];
                i += 1;
            }
            size
        };

        // This assertion triggers a compile-time error if false
        const _: () = assert!(
            DATA_LEN == EXPECTED_SIZE,
            "Shape mismatch: data length does not match shape product"
        );

        // Safe to unwrap because we checked at compile time
        $crate::tensor::Tensor::new($data.to_vec(), $shape.to_vec()).unwrap()
    }};
}

pub mod autograd;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod data;
pub mod distributed;
pub mod error;
pub mod logging;
pub mod model;
pub mod optim;
pub mod reversible;
pub mod tensor;
pub mod train;

pub use autograd::Variable;
pub use config::Config;
pub use context::{Context, Mode};
pub use error::{Error, Result};
pub use tensor::{StorageDtype, Tensor, TensorElem, TensorError};
