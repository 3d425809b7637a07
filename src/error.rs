use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Fewer satellites in sight than the ongoing operation requires.
    /// Two are needed to form a double difference, four to resolve
    /// a complete baseline. The epoch is skipped for the affected
    /// output, previous results remain available.
    #[error("not enough satellites in sight (need {required}, got {found})")]
    InsufficientSatellites { required: usize, found: usize },

    /// The single resolved hypothesis was requested before the
    /// resolution engine converged on one. Not a numerical failure:
    /// keep feeding epochs and try again.
    #[error("integer ambiguities not resolved yet")]
    NotResolved,

    /// The double difference geometry matrix is rank deficient
    /// (nearly collinear satellites), or the filter covariance lost
    /// positive definiteness past tolerance. The ongoing epoch is
    /// discarded, previous state is retained.
    #[error("degenerate observation geometry")]
    DegenerateGeometry,

    /// A rebase was requested against a satellite set whose dimension
    /// does not match the current filter/pool state. This is a caller
    /// sequencing bug, not a recoverable condition.
    #[error("internal error: inconsistent rebase dimensions")]
    InvalidRebase,

    /// Bad observations or a collapsed covariance may cause the
    /// algebraic calculations to wind up here.
    #[error("failed to invert matrix")]
    MatrixInversion,

    /// LᵗDL factorization of the ambiguity covariance failed
    /// (matrix not positive definite).
    #[error("ambiguity factorization error")]
    AmbiguityFactorization,

    /// Matrix inversion error during the ambiguity search
    /// back-transformation.
    #[error("ambiguity inverse error")]
    AmbiguityInverse,

    /// A query was made before the first epoch was processed.
    #[error("internal error: filter is not initialized (bad op)")]
    UninitializedFilter,
}
