// src/runtime/plate.rs

use std::sync::Arc;

/// A conditionally-independent batch dimension, active while its scope runs.
/// `dim` is a negative offset from the rightmost axis. Purely a dynamic
/// annotation: frames are copied onto every statement executed inside.
#[derive(Debug, Clone)]
pub struct PlateFrame {
    pub name: String,
    pub size: usize,
    pub dim: isize,
    pub subsample: Option<Arc<Vec<usize>>>,
    pub scale: f64,
}

impl PlateFrame {
    /// The realized axis length: the subsample size when subsampling,
    /// otherwise the declared size.
    pub fn axis_len(&self) -> usize {
        match &self.subsample {
            Some(idx) => idx.len(),
            None => self.size,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlateOptions {
    /// Explicit dimension (negative). Allocated from -1 inward when unset.
    pub dim: Option<isize>,
    /// Draw this many distinct indices instead of covering 0..size; the
    /// densities of statements inside are rescaled by size / subsample_size.
    pub subsample_size: Option<usize>,
}

/// The shape the active frames impose on a draw: each frame's axis length
/// at its dim, 1 everywhere else.
pub fn frames_shape(frames: &[PlateFrame]) -> Vec<usize> {
    let ndim = frames.iter().map(|f| (-f.dim) as usize).max().unwrap_or(0);
    let mut shape = vec![1usize; ndim];
    for f in frames {
        let i = (ndim as isize + f.dim) as usize;
        shape[i] = f.axis_len();
    }
    shape
}
