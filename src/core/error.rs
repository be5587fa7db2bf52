use thiserror::Error;

/// Setup-time errors. Raised while wiring stages, never at runtime.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid watermarks: high ({high}) must be greater than low ({low})")]
    InvalidWatermarks { high: usize, low: usize },

    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(usize),
}

/// Outcome of a failed pipe run.
#[derive(Debug, Error)]
pub enum PipeError {
    #[error("pipe configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("stream source failed: {0}")]
    Source(anyhow::Error),

    #[error("transform failed: {0}")]
    Transform(anyhow::Error),

    #[error("consumer failed: {0}")]
    Consumer(anyhow::Error),
}
