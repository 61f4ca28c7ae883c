//! Utility functions shared by the quantizers
//!
//! This module provides bit packing, the threading shim and a few flat-array
//! helpers used throughout the library.

pub mod bitstring;
pub mod threads;

pub use bitstring::{BitstringReader, BitstringWriter};

use crate::{Error, Result};

/// Check that a flat buffer holds at least `n` rows of `dim` values
pub fn check_buffer<T>(buf: &[T], n: usize, dim: usize) -> Result<()> {
    let expected = n * dim;
    if buf.len() < expected {
        return Err(Error::DimensionMismatch {
            expected,
            actual: buf.len(),
        }
        .into());
    }
    Ok(())
}

/// Copy columns `[start, start + width)` of `n` rows with stride `d` into a
/// contiguous `n x width` buffer
pub fn extract_columns(x: &[f32], n: usize, d: usize, start: usize, width: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(n * width);
    for row in x.chunks_exact(d).take(n) {
        out.extend_from_slice(&row[start..start + width]);
    }
    out
}

/// Generate random vectors in `[-1, 1)` for testing, flattened row-major
#[cfg(test)]
pub fn generate_random_vectors(num_vectors: usize, dimension: usize, seed: u64) -> Vec<f32> {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    (0..num_vectors * dimension)
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect()
}
