use std::path::PathBuf;

use thiserror::Error;

/// Everything that can abort a pipeline step.
///
/// Nothing is retried: the first error ends the run.
#[derive(Debug, Error)]
pub enum FerError {
    #[error("input file not found: {}", path.display())]
    MissingInput { path: PathBuf },

    #[error("row {row}: {reason}")]
    MalformedRow { row: usize, reason: String },

    #[error("row {row}: emotion label {value} is outside 0..=6")]
    InvalidLabel { row: usize, value: i64 },

    #[error("best-model checkpoint not found: {}", path.display())]
    MissingCheckpoint { path: PathBuf },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("empty input: {0}")]
    Empty(&'static str),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("CSV error")]
    Csv(#[from] csv::Error),

    #[error("cache encode error")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("cache decode error")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("image error")]
    Image(#[from] image::ImageError),

    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    #[error("checkpoint recorder error: {0}")]
    Recorder(String),

    #[error("tensor data error: {0}")]
    Tensor(String),
}

pub type Result<T, E = FerError> = std::result::Result<T, E>;
