//! Error types for the rig coordinator.
//!
//! Every variant is recoverable: the operation that raised it is aborted and
//! previously committed state (history, alignment, camera poses, drone
//! command) is left as it was.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RigError {
    /// Alignment matrix is singular, non-finite, or produced w == 0
    #[error("degenerate world transform")]
    DegenerateTransform,

    /// Wholesale edit of the calibration observations was rejected
    #[error("malformed observation set: {0}")]
    MalformedObservationSet(String),

    /// Extrinsic solve was refused or the solver reported an error
    #[error("camera pose solve failed: {0}")]
    PoseSolveFailed(String),

    /// World adjustment requested before any frame was accumulated
    #[error("no accumulated frames to work with")]
    InsufficientHistory,

    /// Trusted overwrite (camera poses, alignment) failed shape validation
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Scale / floor / origin request failed on the solver side
    #[error("{operation} failed: {reason}")]
    AdjustmentFailed {
        operation: &'static str,
        reason: String,
    },

    /// Link to the vision service or the drone is unusable
    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, RigError>;
