//! # Collectives
//!
//! Data-parallel training keeps one full replica of the parameters per
//! device and gives each device a different slice of the batch. After the
//! backward pass the replicas agree on one gradient with an **All-Reduce**,
//! apply the same optimizer step, and stay identical without ever exchanging
//! weights.
//!
//! ## Module Contents
//!
//! *   [`Collective`](backend::Collective): the blocking communication interface.
//! *   [`LocalCollective`](local::LocalCollective): a single device; every collective is the identity.
//! *   [`CpuMesh`](cpu_backend::CpuMesh): threads connected by `crossbeam` channels,
//!     with a **Ring All-Reduce** for the reductions.
//!
//! ```rust
//! use revlm::distributed::{Collective, CpuMesh};
//! use revlm::tensor::Tensor;
//!
//! let handles: Vec<_> = CpuMesh::mesh(2)
//!     .into_iter()
//!     .map(|mesh| {
//!         std::thread::spawn(move || {
//!             let local = Tensor::full(&[3], mesh.rank() as f32 + 1.0);
//!             mesh.all_reduce_sum(&local).unwrap()
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     assert_eq!(handle.join().unwrap().data(), &[3.0, 3.0, 3.0]);
//! }
//! ```

pub mod backend;
pub mod cpu_backend;
pub mod local;

pub use backend::Collective;
pub use cpu_backend::CpuMesh;
pub use local::LocalCollective;
