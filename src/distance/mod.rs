//! Distance metrics and vector kernels
//!
//! The quantizers only need a handful of primitives: squared L2 distance,
//! dot product, squared norm and element-wise add/subtract. They are
//! implemented with portable SIMD in [`simd`] and re-exported here.

/// Portable SIMD implementations using pure Rust
pub mod simd;

/// Scalar (non-SIMD) reference implementations
#[cfg(test)]
pub(crate) mod scalar;

pub use simd::{add_assign, inner_product, l2_squared, norm_squared, sub_assign};

/// Metric used when evaluating distances from lookup tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MetricType {
    /// Squared L2 (Euclidean) distance
    L2,
    /// Inner product (larger is more similar)
    InnerProduct,
}

/// Squared norms of `n` rows of dimension `d`
pub fn norms_squared(x: &[f32], d: usize, n: usize) -> Vec<f32> {
    debug_assert!(x.len() >= n * d);
    x.chunks_exact(d).take(n).map(norm_squared).collect()
}

/// Per-dimension standard deviation of `n` rows of dimension `d`
pub fn column_stddev(x: &[f32], d: usize, n: usize) -> Vec<f32> {
    if n == 0 {
        return vec![0.0; d];
    }

    let mut mean = vec![0.0f64; d];
    let mut sum_sq = vec![0.0f64; d];
    for row in x.chunks_exact(d).take(n) {
        for j in 0..d {
            let v = row[j] as f64;
            mean[j] += v;
            sum_sq[j] += v * v;
        }
    }

    (0..d)
        .map(|j| {
            let m = mean[j] / n as f64;
            let var = sum_sq[j] / n as f64 - m * m;
            var.max(0.0).sqrt() as f32
        })
        .collect()
}
