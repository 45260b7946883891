//! Pipeline error types.

use crate::schema::ConfigError;

use super::fitness::FitnessError;

/// Failure reported by a [`Problem`](super::Problem) while scoring a genome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProblemError {
    message: String,
}

impl ProblemError {
    /// Create an error with a description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Error description.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors that fault a pipeline stage.
///
/// A faulted stage stops accepting input and closes its output, which
/// completes every stage linked downstream of it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("Scoring genome `{hash}` failed: {source}")]
    Scoring {
        hash: String,
        #[source]
        source: ProblemError,
    },
    #[error(transparent)]
    Fitness(#[from] FitnessError),
    #[error("Stage task failed: {0}")]
    StageFailed(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::StageFailed(err.to_string())
    }
}
