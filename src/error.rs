//! Error taxonomy for the pipeline.
//!
//! I/O-facing components convert transport failures into these variants;
//! the pure stages (splitting, budgeting, rendering) never construct them
//! on well-formed input. Retrieval and resolution failures degrade
//! silently inside the pipeline; generation failure is the only variant
//! surfaced to the end user.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The chunk store is unreachable. Downstream degrades to the
    /// "no relevant information found" sentinel.
    #[error("chunk store unavailable: {0}")]
    RetrievalUnavailable(String),

    /// The reference-resolution call failed; the original query is used
    /// unresolved.
    #[error("reference resolution failed: {0}")]
    ResolutionFailed(String),

    /// The final answer call failed. Surfaced to the user, never papered
    /// over with a fabricated answer.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// Configured token budget is below the usefulness floor. A
    /// configuration error, not a per-request failure.
    #[error("token budget {budget} is below the usefulness floor {floor}")]
    BudgetTooSmall { budget: usize, floor: usize },

    /// Malformed input rejected at the boundary before the pipeline runs.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
