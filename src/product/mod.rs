//! Product additive quantization
//!
//! The vector space is cut into contiguous dimension ranges, one per split,
//! and each split is handled by its own additive quantizer. The composite
//! code is the concatenation of the split codes, so its codebook count and
//! code size are the sums of those of the splits.
//!
//! The composite codebook table lists every split's entries, zero-padded to
//! the full dimension, which keeps the generic [`AdditiveQuantizer`]
//! operations valid on the composite.

use crate::aq::{AdditiveQuantizer, AqState, SearchType};
use crate::distance::norms_squared;
use crate::lsq::LocalSearchQuantizer;
use crate::rq::ResidualQuantizer;
use crate::utils::{check_buffer, extract_columns, threads};
use crate::{Error, Result};
use rayon::prelude::*;
use std::ops::Range;

/// Additive quantizer over a partition of the dimensions
#[derive(Debug)]
pub struct ProductAdditiveQuantizer<Q: AdditiveQuantizer> {
    state: AqState,
    quantizers: Vec<Q>,
    ranges: Vec<Range<usize>>,
}

/// Product of local search quantizers
pub type ProductLocalSearchQuantizer = ProductAdditiveQuantizer<LocalSearchQuantizer>;

/// Product of residual quantizers
pub type ProductResidualQuantizer = ProductAdditiveQuantizer<ResidualQuantizer>;

impl<Q: AdditiveQuantizer> ProductAdditiveQuantizer<Q> {
    /// Split `[0, d)` in order, each quantizer taking as many dimensions as
    /// its own dimension
    pub fn init(d: usize, quantizers: Vec<Q>, search_type: SearchType) -> Result<Self> {
        let mut start = 0;
        let splits = quantizers
            .into_iter()
            .map(|q| {
                let range = start..start + q.d();
                start = range.end;
                (range, q)
            })
            .collect();
        Self::with_splits(d, splits, search_type)
    }

    /// Build from explicit `(range, quantizer)` pairs
    ///
    /// Ranges must be ordered, contiguous and cover `[0, d)` exactly, and each
    /// range must be as wide as its quantizer's dimension.
    pub fn with_splits(d: usize, splits: Vec<(Range<usize>, Q)>, search_type: SearchType) -> Result<Self> {
        if splits.is_empty() {
            return Err(Error::InvalidSplit("at least one split is required".to_string()).into());
        }

        let mut expected_start = 0;
        for (i, (range, q)) in splits.iter().enumerate() {
            if range.start < expected_start {
                return Err(Error::InvalidSplit(format!(
                    "split {} ({:?}) overlaps the previous split ending at {}",
                    i, range, expected_start
                ))
                .into());
            }
            if range.start > expected_start {
                return Err(Error::InvalidSplit(format!(
                    "gap between {} and {} before split {}",
                    expected_start, range.start, i
                ))
                .into());
            }
            if range.is_empty() {
                return Err(Error::InvalidSplit(format!("split {} is empty", i)).into());
            }
            if range.len() != q.d() {
                return Err(Error::DimensionMismatch {
                    expected: range.len(),
                    actual: q.d(),
                }
                .into());
            }
            if q.state().norm_bits > 0 {
                return Err(Error::Unsupported(format!(
                    "split {} stores norms in its codes ({:?})",
                    i,
                    q.state().search_type
                ))
                .into());
            }
            expected_start = range.end;
        }
        if expected_start != d {
            return Err(Error::InvalidSplit(format!(
                "splits cover [0, {}) but the dimension is {}",
                expected_start, d
            ))
            .into());
        }

        let nbits: Vec<usize> = splits.iter().flat_map(|(_, q)| q.state().nbits.iter().copied()).collect();
        let segments: Vec<usize> = splits.iter().map(|(_, q)| q.m()).collect();
        let state = AqState::with_segments(d, nbits, segments, search_type)?;

        let (ranges, quantizers) = splits.into_iter().unzip();
        let mut paq = Self {
            state,
            quantizers,
            ranges,
        };
        if paq.quantizers.iter().all(|q| q.is_trained()) {
            paq.sync_codebooks();
            paq.state.is_trained = true;
        }
        Ok(paq)
    }

    /// Number of splits
    pub fn nsplits(&self) -> usize {
        self.quantizers.len()
    }

    /// Dimension range of split `i`
    pub fn split_range(&self, i: usize) -> Range<usize> {
        self.ranges[i].clone()
    }

    /// Quantizer of split `i`
    pub fn subquantizer(&self, i: usize) -> &Q {
        &self.quantizers[i]
    }

    /// Mutable quantizer of split `i`
    ///
    /// Call [`ProductAdditiveQuantizer::sync_codebooks`] after changing its
    /// codebooks.
    pub fn subquantizer_mut(&mut self, i: usize) -> &mut Q {
        &mut self.quantizers[i]
    }

    /// Index of the first codebook of split `i` in the composite
    fn first_codebook(&self, i: usize) -> usize {
        self.quantizers[..i].iter().map(|q| q.m()).sum()
    }

    /// Rebuild the zero-padded composite codebook table from the splits
    pub fn sync_codebooks(&mut self) {
        let d = self.state.d;
        let mut codebooks = vec![0.0f32; self.state.total_codebook_size * d];
        let mut row = 0;
        for (q, range) in self.quantizers.iter().zip(&self.ranges) {
            let sub = q.state();
            for entry in sub.codebooks.chunks_exact(sub.d).take(sub.total_codebook_size) {
                codebooks[row * d + range.start..row * d + range.end].copy_from_slice(entry);
                row += 1;
            }
        }
        self.state.codebooks = codebooks;
    }

    /// Unpacked codes of split `i` from composite codes with stride `ld`
    fn split_codes(&self, i: usize, codes: &[i32], n: usize, ld: usize) -> Vec<i32> {
        let m0 = self.first_codebook(i);
        let msub = self.quantizers[i].m();
        let mut out = Vec::with_capacity(n * msub);
        for row in 0..n {
            out.extend_from_slice(&codes[row * ld + m0..row * ld + m0 + msub]);
        }
        out
    }
}

impl<Q: AdditiveQuantizer> AdditiveQuantizer for ProductAdditiveQuantizer<Q> {
    fn state(&self) -> &AqState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut AqState {
        &mut self.state
    }

    fn train(&mut self, n: usize, x: &[f32]) -> Result<()> {
        let d = self.state.d;
        if n == 0 {
            return Err(Error::InvalidParameter("Cannot train on empty dataset".to_string()).into());
        }
        check_buffer(x, n, d)?;
        self.state.is_trained = false;

        let ranges = &self.ranges;
        let quantizers = &mut self.quantizers;
        threads::install(|| {
            quantizers
                .par_iter_mut()
                .zip(ranges.par_iter())
                .enumerate()
                .try_for_each(|(i, (q, range))| -> Result<()> {
                    let xs = extract_columns(x, n, d, range.start, range.len());
                    q.train(n, &xs)?;
                    log::debug!("PAQ split {} ({:?}) trained", i, range);
                    Ok(())
                })
        })??;

        self.sync_codebooks();
        self.state.is_trained = true;

        if self.state.norm_bits > 0 {
            let mut codes = vec![0i32; n * self.state.m];
            self.compute_unpacked_codes(x, &mut codes, n)?;
            let mut recons = vec![0.0f32; n * d];
            self.decode_unpacked(&codes, &mut recons, n, None)?;
            let norms = norms_squared(&recons, d, n);
            self.state.train_norm(&norms);
        }
        if self.state.search_type == SearchType::NormFromLut {
            self.state.compute_codebook_tables();
        }

        log::info!(
            "PAQ trained: {} splits, {} codebooks, {} bytes per code",
            self.nsplits(),
            self.state.m,
            self.state.code_size
        );
        Ok(())
    }

    fn compute_unpacked_codes(&self, x: &[f32], codes: &mut [i32], n: usize) -> Result<()> {
        self.state.check_trained()?;
        let (d, m) = (self.state.d, self.state.m);
        check_buffer(x, n, d)?;
        check_buffer(codes, n, m)?;

        let parts: Vec<Vec<i32>> = self
            .quantizers
            .par_iter()
            .zip(self.ranges.par_iter())
            .map(|(q, range)| -> Result<Vec<i32>> {
                let xs = extract_columns(x, n, d, range.start, range.len());
                let mut sub = vec![0i32; n * q.m()];
                q.compute_unpacked_codes(&xs, &mut sub, n)?;
                Ok(sub)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut m0 = 0;
        for (q, sub) in self.quantizers.iter().zip(&parts) {
            let msub = q.m();
            for (row, sub_row) in codes.chunks_exact_mut(m).zip(sub.chunks_exact(msub)).take(n) {
                row[m0..m0 + msub].copy_from_slice(sub_row);
            }
            m0 += msub;
        }
        Ok(())
    }

    fn decode_unpacked(&self, codes: &[i32], x: &mut [f32], n: usize, ld_codes: Option<usize>) -> Result<()> {
        self.state.check_trained()?;
        let (d, m) = (self.state.d, self.state.m);
        let ld = ld_codes.unwrap_or(m);
        if n > 0 {
            check_buffer(codes, n - 1, ld)?;
            check_buffer(&codes[(n - 1) * ld..], 1, m)?;
        }
        check_buffer(x, n, d)?;

        for (i, (q, range)) in self.quantizers.iter().zip(&self.ranges).enumerate() {
            let sub_codes = self.split_codes(i, codes, n, ld);
            let mut sub_x = vec![0.0f32; n * range.len()];
            q.decode_unpacked(&sub_codes, &mut sub_x, n, None)?;
            for (row, sub_row) in x.chunks_exact_mut(d).zip(sub_x.chunks_exact(range.len())).take(n) {
                row[range.clone()].copy_from_slice(sub_row);
            }
        }
        Ok(())
    }

    fn compute_lut(&self, n: usize, xq: &[f32], lut: &mut [f32], alpha: f32, ld_lut: Option<usize>) -> Result<()> {
        self.state.check_trained()?;
        let (d, total) = (self.state.d, self.state.total_codebook_size);
        check_buffer(xq, n, d)?;
        let ld = ld_lut.unwrap_or(total);
        if ld < total {
            return Err(Error::InvalidParameter(format!(
                "LUT leading dimension {} is smaller than the codebook size {}",
                ld, total
            ))
            .into());
        }
        if n > 0 {
            check_buffer(lut, 1, (n - 1) * ld + total)?;
        }

        for (i, (q, range)) in self.quantizers.iter().zip(&self.ranges).enumerate() {
            let offset = self.state.codebook_offsets[self.first_codebook(i)];
            let sub_total = q.total_codebook_size();
            let xs = extract_columns(xq, n, d, range.start, range.len());
            let mut sub_lut = vec![0.0f32; n * sub_total];
            q.compute_lut(n, &xs, &mut sub_lut, alpha, None)?;
            for row in 0..n {
                lut[row * ld + offset..row * ld + offset + sub_total]
                    .copy_from_slice(&sub_lut[row * sub_total..(row + 1) * sub_total]);
            }
        }
        Ok(())
    }
}

fn split_dimension(d: usize, nsplits: usize) -> Result<usize> {
    if nsplits == 0 || d % nsplits != 0 {
        return Err(Error::InvalidSplit(format!(
            "dimension {} is not divisible into {} splits",
            d, nsplits
        ))
        .into());
    }
    Ok(d / nsplits)
}

impl ProductAdditiveQuantizer<LocalSearchQuantizer> {
    /// `nsplits` local search quantizers with `msub` codebooks of `2^nbits`
    /// entries each
    pub fn new(d: usize, nsplits: usize, msub: usize, nbits: usize, search_type: SearchType) -> Result<Self> {
        let dsub = split_dimension(d, nsplits)?;
        let quantizers = (0..nsplits)
            .map(|_| LocalSearchQuantizer::new(dsub, msub, nbits, SearchType::Decompress))
            .collect::<Result<Vec<_>>>()?;
        Self::init(d, quantizers, search_type)
    }
}

impl ProductAdditiveQuantizer<ResidualQuantizer> {
    /// `nsplits` residual quantizers with `msub` codebooks of `2^nbits`
    /// entries each
    pub fn new(d: usize, nsplits: usize, msub: usize, nbits: usize, search_type: SearchType) -> Result<Self> {
        let dsub = split_dimension(d, nsplits)?;
        let quantizers = (0..nsplits)
            .map(|_| ResidualQuantizer::new(dsub, msub, nbits, SearchType::Decompress))
            .collect::<Result<Vec<_>>>()?;
        Self::init(d, quantizers, search_type)
    }
}
