// src/runtime/error.rs

use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Every failure aborts the current gradient step; the training loop may
/// retry with a fresh call after fixing model or configuration.
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("Duplicate statement name '{name}' within one execution")]
    DuplicateSite { name: String },

    #[error("Replay miss: statement '{name}' not found in the reference trace")]
    ReplayMiss { name: String },

    #[error("Shape conflict at '{site}': plate '{plate}' (dim {dim}) declares size {expected}, found shape {found:?}")]
    ShapeConflict {
        site: String,
        plate: String,
        dim: isize,
        expected: usize,
        found: Vec<usize>,
    },

    #[error("Plate '{name}' at dim {dim} exceeds max_plate_nesting = {max}")]
    PlateNesting { name: String, dim: isize, max: usize },

    #[error("Plate '{name}' requested dim {dim}, already held by an enclosing plate")]
    DimCollision { name: String, dim: isize },

    #[error("Distribution error: {message}")]
    DistributionError { message: String },

    #[error("Shape mismatch: {message}")]
    ShapeMismatch { message: String },

    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },
}
