//! aqcore: additive vector quantization for approximate nearest neighbor search
//!
//! This crate compresses high-dimensional `f32` vectors into compact
//! multi-codebook codes and reconstructs approximate vectors and distances
//! from them. A vector is approximated by the *sum* of one entry picked from
//! each of `M` codebooks.
//!
//! Quantizers provided:
//!
//! - [`LocalSearchQuantizer`]: LSQ++ training with ICM encoding and
//!   simulated-annealing perturbations
//! - [`ResidualQuantizer`]: sequential residual quantization with beam search
//! - [`ProductAdditiveQuantizer`]: splits the vector space into contiguous
//!   ranges, each handled by its own additive quantizer
//!   ([`ProductLocalSearchQuantizer`], [`ProductResidualQuantizer`])
//!
//! Every quantizer implements [`AdditiveQuantizer`], which is all a calling
//! index needs: `train`, `compute_codes`, `decode` and `compute_lut`.
//!
//! ```ignore
//! use aqcore::{AdditiveQuantizer, LocalSearchQuantizer, SearchType};
//!
//! let mut lsq = LocalSearchQuantizer::new(64, 8, 8, SearchType::Decompress)?;
//! lsq.train(n, &training_data)?;
//!
//! let mut codes = vec![0u8; n * lsq.code_size()];
//! lsq.compute_codes(&data, &mut codes, n)?;
//! ```

#![warn(missing_docs)]

/// Distance metrics and SIMD vector kernels
pub mod distance;

/// Additive quantizer contract and shared state
pub mod aq;

/// Local search quantizer (LSQ++)
pub mod lsq;

/// Residual quantizer
pub mod rq;

/// Product additive quantizers
pub mod product;

/// Binary persistence of quantizer state
pub mod formats;

/// General utilities and helpers
pub mod utils;

// Re-export commonly used types
pub use aq::{AdditiveQuantizer, AqState, SearchType};
pub use distance::MetricType;
pub use lsq::icm::{CpuIcmEncoder, DefaultIcmEncoderFactory, IcmEncoder, IcmEncoderFactory};
pub use lsq::timer::LsqTimer;
pub use lsq::{LocalSearchQuantizer, LsqParams, LsqTrainingResult};
pub use product::{ProductAdditiveQuantizer, ProductLocalSearchQuantizer, ProductResidualQuantizer};
pub use rq::{ResidualQuantizer, RqParams};

/// Result type for quantizer operations
pub type Result<T> = anyhow::Result<T>;

/// Error types for quantizer operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Buffer or vector dimension does not match the quantizer
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected size
        expected: usize,
        /// Actual size
        actual: usize,
    },

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Encode, decode or LUT requested before training
    #[error("Quantizer is not trained")]
    NotTrained,

    /// Product split ranges do not partition the vector dimension
    #[error("Invalid split: {0}")]
    InvalidSplit(String),

    /// Requested capability is not available for this quantizer
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Numerical failure (e.g. a singular least-squares system)
    #[error("Numerical error: {0}")]
    Numerical(String),

    /// Invalid serialized format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(String),
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
