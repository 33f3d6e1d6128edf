use crate::tensor::TensorError;
use std::path::PathBuf;
use thiserror::Error;

/// Crate-level error.
///
/// Tensor-math failures bubble up unchanged; everything else describes which
/// subsystem gave up and on what.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Tensor(#[from] TensorError),
    /// A parameter was looked up in compute mode but never created during init.
    #[error("parameter `{0}` is missing; init and compute passes disagree on naming")]
    UnknownParameter(String),
    #[error("unknown dimension `{0}`")]
    UnknownDim(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("npz read: {0}")]
    NpzRead(#[from] ndarray_npy::ReadNpzError),
    #[error("npz write: {0}")]
    NpzWrite(#[from] ndarray_npy::WriteNpzError),
    #[error(transparent)]
    Regex(#[from] regex::Error),
    #[error("object `{0}` not found")]
    NotFound(String),
    /// Uploads are durable or fatal: this aborts the writing process.
    #[error("upload of `{key}` failed after {attempts} attempts: {reason}")]
    UploadFailed {
        key: String,
        attempts: usize,
        reason: String,
    },
    #[error("malformed checkpoint: {0}")]
    Checkpoint(String),
    #[error("collective failed: {0}")]
    Collective(String),
    #[error("data: {0}")]
    Data(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
