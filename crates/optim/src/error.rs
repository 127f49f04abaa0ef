//! Error type shared by every optimizer in the crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OptimError>;

#[derive(Debug, Error)]
pub enum OptimError {
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("invalid optimizer config: {0}")]
    Json(#[from] serde_json::Error),

    /// More than one predicate of a `CaseOptimizer` returned true.
    #[error("variable `{variable}` claimed by multiple optimizers {claimants:?}")]
    ClaimConflict {
        variable: String,
        claimants: Vec<usize>,
    },

    /// A constructor or config-import argument has the wrong shape.
    #[error("expected {expected} at `{position}` but got {found}")]
    InvalidArgument {
        position: String,
        expected: String,
        found: String,
    },

    /// No factory registered under this class name.
    #[error("unknown {kind} class `{class_name}`")]
    UnknownClass {
        kind: &'static str,
        class_name: String,
    },

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl OptimError {
    pub(crate) fn invalid(
        position: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::InvalidArgument {
            position: position.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }
}
