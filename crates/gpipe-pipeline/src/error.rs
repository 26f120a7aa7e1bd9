#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("batch error: {0}")]
    Batch(String),

    #[error("fence error: {0}")]
    Fence(String),

    #[error("partition {partition} failed on micro-batch {micro_batch}")]
    Compute {
        partition: usize,
        micro_batch: usize,
        /// Failures from other cells of the same clock cycle that were absorbed.
        suppressed: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("finalize error: {0}")]
    Finalize(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("micro-batch balance error: {0}")]
    Balance(String),

    #[error("invalid cell transition: {from} → {to}")]
    InvalidTransition { from: String, to: String },

    #[error(transparent)]
    Types(#[from] gpipe_types::GPipeError),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
