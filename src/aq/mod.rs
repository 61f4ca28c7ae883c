//! Additive quantization contract and shared quantizer state
//!
//! An additive quantizer approximates a vector as the sum of one entry picked
//! from each of `M` codebooks. Codebooks are stored in one flat row-major
//! table: row `codebook_offsets[m] + k` holds entry `k` of codebook `m`.
//!
//! Concrete quantizers only implement training and encoding to unpacked codes;
//! packing, norm encoding, decoding and lookup tables are provided by the
//! [`AdditiveQuantizer`] trait on top of [`AqState`].

pub mod kmeans;

use crate::distance::{add_assign, inner_product, norm_squared, norms_squared, sub_assign, MetricType};
use crate::utils::{check_buffer, BitstringReader, BitstringWriter};
use crate::{Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Largest supported number of bits per codebook entry
pub const MAX_NBITS: usize = 16;

/// How codes are searched and whether a norm is stored with them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SearchType {
    /// Decode vectors before computing distances, no norm stored
    #[default]
    Decompress,
    /// LUT-only search, the norm term is dropped
    LutNonorm,
    /// Norm recomputed from centroid norms and cross products
    NormFromLut,
    /// Norm stored as a raw 32-bit float
    NormFloat,
    /// Norm scalar-quantized to 8 bits
    NormQint8,
    /// Norm scalar-quantized to 4 bits
    NormQint4,
}

impl SearchType {
    /// Number of bits appended to each code for the norm
    pub fn norm_bits(self) -> usize {
        match self {
            SearchType::NormFloat => 32,
            SearchType::NormQint8 => 8,
            SearchType::NormQint4 => 4,
            SearchType::Decompress | SearchType::LutNonorm | SearchType::NormFromLut => 0,
        }
    }

    /// Stable numeric tag used by the binary format
    pub fn to_tag(self) -> u32 {
        match self {
            SearchType::Decompress => 0,
            SearchType::LutNonorm => 1,
            SearchType::NormFromLut => 2,
            SearchType::NormFloat => 3,
            SearchType::NormQint8 => 4,
            SearchType::NormQint4 => 5,
        }
    }

    /// Inverse of [`SearchType::to_tag`]
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(SearchType::Decompress),
            1 => Some(SearchType::LutNonorm),
            2 => Some(SearchType::NormFromLut),
            3 => Some(SearchType::NormFloat),
            4 => Some(SearchType::NormQint8),
            5 => Some(SearchType::NormQint4),
            _ => None,
        }
    }
}

/// Quantize `x` in `[amin, amax]` to one of `levels` buckets
pub fn encode_qint(x: f32, amin: f32, amax: f32, levels: u32) -> u64 {
    if !(amax > amin) {
        return 0;
    }
    let x1 = (x - amin) / (amax - amin) * levels as f32;
    (x1.floor() as i64).clamp(0, levels as i64 - 1) as u64
}

/// Center of bucket `code` produced by [`encode_qint`]
pub fn decode_qint(code: u64, amin: f32, amax: f32, levels: u32) -> f32 {
    (code as f32 + 0.5) / levels as f32 * (amax - amin) + amin
}

/// State shared by every additive quantizer
#[derive(Debug, Clone)]
pub struct AqState {
    /// Vector dimension
    pub d: usize,
    /// Number of codebooks
    pub m: usize,
    /// Bits per entry of each codebook
    pub nbits: Vec<usize>,
    /// Number of codebooks in each byte-aligned segment of a packed code
    pub segments: Vec<usize>,
    /// Row of the first entry of each codebook, `M + 1` values
    pub codebook_offsets: Vec<usize>,
    /// Total number of codebook entries over all codebooks
    pub total_codebook_size: usize,
    /// Bytes per packed code, norm included
    pub code_size: usize,
    /// Bits used by the stored norm
    pub norm_bits: usize,
    /// Search type
    pub search_type: SearchType,
    /// Codebook table, `total_codebook_size x d`
    pub codebooks: Vec<f32>,
    /// Whether codebooks are populated
    pub is_trained: bool,
    /// Smallest squared norm seen during training
    pub norm_min: f32,
    /// Largest squared norm seen during training
    pub norm_max: f32,
    /// Squared norm of every codebook entry (`NormFromLut` only)
    pub centroid_norms: Vec<f32>,
    /// Dot products between entries of codebook pairs `m2 < m1` (`NormFromLut` only)
    pub codebook_cross_products: Vec<f32>,
    cross_offsets: Vec<usize>,
    code_bit_offsets: Vec<usize>,
}

impl AqState {
    /// State with all codebooks packed in a single segment
    pub fn new(d: usize, nbits: Vec<usize>, search_type: SearchType) -> Result<Self> {
        let m = nbits.len();
        Self::with_segments(d, nbits, vec![m], search_type)
    }

    /// State whose packed codes are split into byte-aligned segments
    pub fn with_segments(
        d: usize,
        nbits: Vec<usize>,
        segments: Vec<usize>,
        search_type: SearchType,
    ) -> Result<Self> {
        if d == 0 {
            return Err(Error::InvalidParameter("dimension must be positive".to_string()).into());
        }
        if nbits.is_empty() {
            return Err(Error::InvalidParameter("at least one codebook is required".to_string()).into());
        }
        if let Some(&bad) = nbits.iter().find(|&&b| b == 0 || b > MAX_NBITS) {
            return Err(Error::InvalidParameter(format!(
                "bits per codebook must be between 1 and {}, got {}",
                MAX_NBITS, bad
            ))
            .into());
        }
        if segments.iter().sum::<usize>() != nbits.len() || segments.iter().any(|&s| s == 0) {
            return Err(Error::InvalidParameter(format!(
                "segments {:?} do not cover {} codebooks",
                segments,
                nbits.len()
            ))
            .into());
        }

        let mut state = Self {
            d,
            m: nbits.len(),
            nbits,
            segments,
            codebook_offsets: Vec::new(),
            total_codebook_size: 0,
            code_size: 0,
            norm_bits: 0,
            search_type,
            codebooks: Vec::new(),
            is_trained: false,
            norm_min: f32::INFINITY,
            norm_max: f32::NEG_INFINITY,
            centroid_norms: Vec::new(),
            codebook_cross_products: Vec::new(),
            cross_offsets: Vec::new(),
            code_bit_offsets: Vec::new(),
        };
        state.set_derived_values();
        Ok(state)
    }

    /// Recompute offsets and sizes from `nbits`, `segments` and `search_type`
    pub fn set_derived_values(&mut self) {
        self.m = self.nbits.len();
        self.codebook_offsets = Vec::with_capacity(self.m + 1);
        self.codebook_offsets.push(0);
        for &nb in &self.nbits {
            let last = *self.codebook_offsets.last().unwrap_or(&0);
            self.codebook_offsets.push(last + (1 << nb));
        }
        self.total_codebook_size = self.codebook_offsets[self.m];
        self.norm_bits = self.search_type.norm_bits();

        // Bit position of every code in a packed code, segments start on byte boundaries
        self.code_bit_offsets = Vec::with_capacity(self.m + 1);
        let mut segment_start = 0;
        let mut m0 = 0;
        for (&count, bytes) in self.segments.iter().zip(self.segment_bytes()) {
            let mut bit = segment_start * 8;
            for m in m0..m0 + count {
                self.code_bit_offsets.push(bit);
                bit += self.nbits[m];
            }
            segment_start += bytes;
            m0 += count;
        }
        self.code_bit_offsets.push(segment_start * 8);

        self.code_size = segment_start + (self.norm_bits + 7) / 8;
    }

    /// Entry index of codebook `m` read in place from one packed code
    #[inline]
    pub fn read_code(&self, code: &[u8], m: usize) -> usize {
        BitstringReader::at(code, self.code_bit_offsets[m]).read(self.nbits[m]) as usize
    }

    /// Byte length of every segment of a packed code
    pub fn segment_bytes(&self) -> Vec<usize> {
        let mut m0 = 0;
        self.segments
            .iter()
            .map(|&count| {
                let bits: usize = self.nbits[m0..m0 + count].iter().sum();
                m0 += count;
                (bits + 7) / 8
            })
            .collect()
    }

    /// Number of entries `K_m` of codebook `m`
    pub fn ksub(&self, m: usize) -> usize {
        1 << self.nbits[m]
    }

    /// Entry `k` of codebook `m`
    pub fn centroid(&self, m: usize, k: usize) -> &[f32] {
        let row = self.codebook_offsets[m] + k;
        &self.codebooks[row * self.d..(row + 1) * self.d]
    }

    /// Fail with [`Error::NotTrained`] unless codebooks are populated
    pub fn check_trained(&self) -> Result<()> {
        if !self.is_trained {
            return Err(Error::NotTrained.into());
        }
        Ok(())
    }

    /// Reset the norm range from training-set squared norms
    pub fn train_norm(&mut self, norms: &[f32]) {
        self.norm_min = f32::INFINITY;
        self.norm_max = f32::NEG_INFINITY;
        for &v in norms {
            self.norm_min = self.norm_min.min(v);
            self.norm_max = self.norm_max.max(v);
        }
    }

    /// Encode a squared norm into `norm_bits` bits
    pub fn encode_norm(&self, norm: f32) -> u64 {
        match self.search_type {
            SearchType::NormFloat => norm.to_bits() as u64,
            SearchType::NormQint8 => encode_qint(norm, self.norm_min, self.norm_max, 256),
            SearchType::NormQint4 => encode_qint(norm, self.norm_min, self.norm_max, 16),
            _ => 0,
        }
    }

    /// Decode a squared norm written by [`AqState::encode_norm`]
    pub fn decode_norm(&self, bits: u64) -> f32 {
        match self.search_type {
            SearchType::NormFloat => f32::from_bits(bits as u32),
            SearchType::NormQint8 => decode_qint(bits, self.norm_min, self.norm_max, 256),
            SearchType::NormQint4 => decode_qint(bits, self.norm_min, self.norm_max, 16),
            _ => 0.0,
        }
    }

    /// Precompute centroid norms and codebook cross products
    pub fn compute_codebook_tables(&mut self) {
        let d = self.d;
        self.centroid_norms = norms_squared(&self.codebooks, d, self.total_codebook_size);

        self.cross_offsets.clear();
        let mut size = 0;
        for m1 in 1..self.m {
            for m2 in 0..m1 {
                self.cross_offsets.push(size);
                size += self.ksub(m1) * self.ksub(m2);
            }
        }

        let mut cross = vec![0.0f32; size];
        for m1 in 1..self.m {
            for m2 in 0..m1 {
                let (k1, k2) = (self.ksub(m1), self.ksub(m2));
                let base = self.cross_offsets[m1 * (m1 - 1) / 2 + m2];
                for a in 0..k1 {
                    let ca = self.centroid(m1, a);
                    for b in 0..k2 {
                        cross[base + a * k2 + b] = inner_product(ca, self.centroid(m2, b));
                    }
                }
            }
        }
        self.codebook_cross_products = cross;
    }

    /// Squared norm of the reconstruction of `codes`, from the precomputed tables
    pub fn norm_from_tables(&self, codes: &[i32]) -> f32 {
        self.norm_from_tables_with(|m| codes[m] as usize)
    }

    fn norm_from_tables_with<F: Fn(usize) -> usize>(&self, code_of: F) -> f32 {
        let mut norm = 0.0f32;
        for m1 in 0..self.m {
            let c1 = code_of(m1);
            norm += self.centroid_norms[self.codebook_offsets[m1] + c1];
            for m2 in 0..m1 {
                let base = self.cross_offsets[m1 * (m1 - 1) / 2 + m2];
                norm += 2.0 * self.codebook_cross_products[base + c1 * self.ksub(m2) + code_of(m2)];
            }
        }
        norm
    }

    /// Squared norm of a reconstruction from pairwise centroid products
    fn norm_from_centroids_with<F: Fn(usize) -> usize>(&self, code_of: F) -> f32 {
        let mut norm = 0.0f32;
        for m1 in 0..self.m {
            let c1 = self.centroid(m1, code_of(m1));
            norm += norm_squared(c1);
            for m2 in 0..m1 {
                norm += 2.0 * inner_product(c1, self.centroid(m2, code_of(m2)));
            }
        }
        norm
    }

    fn check_code(&self, m: usize, code: i32) -> Result<usize> {
        if code < 0 || code as usize >= self.ksub(m) {
            return Err(Error::InvalidParameter(format!(
                "Invalid code {} for codebook {} (max {})",
                code,
                m,
                self.ksub(m) - 1
            ))
            .into());
        }
        Ok(code as usize)
    }
}

/// Interface every additive quantizer exposes to a calling index
///
/// Implementors provide training and encoding to unpacked codes; everything
/// else has a default built on [`AqState`]. All methods except `train` are
/// read-only.
pub trait AdditiveQuantizer: Send + Sync {
    /// Shared quantizer state
    fn state(&self) -> &AqState;

    /// Mutable shared quantizer state
    fn state_mut(&mut self) -> &mut AqState;

    /// Fit the codebooks to `n` training vectors of dimension `d`
    fn train(&mut self, n: usize, x: &[f32]) -> Result<()>;

    /// Encode `n` vectors into unpacked codes, `n x M` values
    fn compute_unpacked_codes(&self, x: &[f32], codes: &mut [i32], n: usize) -> Result<()>;

    /// Vector dimension
    fn d(&self) -> usize {
        self.state().d
    }

    /// Number of codebooks
    fn m(&self) -> usize {
        self.state().m
    }

    /// Bytes per packed code
    fn code_size(&self) -> usize {
        self.state().code_size
    }

    /// Total number of codebook entries (LUT row width)
    fn total_codebook_size(&self) -> usize {
        self.state().total_codebook_size
    }

    /// Whether the quantizer has been trained
    fn is_trained(&self) -> bool {
        self.state().is_trained
    }

    /// Encode `n` vectors into packed codes of `code_size` bytes
    fn compute_codes(&self, x: &[f32], codes: &mut [u8], n: usize) -> Result<()> {
        self.compute_codes_add_centroids(x, codes, n, None)
    }

    /// Encode `x - centroids` and store the norm of `reconstruction + centroids`
    fn compute_codes_add_centroids(
        &self,
        x: &[f32],
        codes: &mut [u8],
        n: usize,
        centroids: Option<&[f32]>,
    ) -> Result<()> {
        let st = self.state();
        st.check_trained()?;
        check_buffer(x, n, st.d)?;
        check_buffer(codes, n, st.code_size)?;

        let mut unpacked = vec![0i32; n * st.m];
        match centroids {
            Some(c) => {
                check_buffer(c, n, st.d)?;
                let mut residuals = x[..n * st.d].to_vec();
                for (r, c) in residuals.chunks_exact_mut(st.d).zip(c.chunks_exact(st.d)) {
                    sub_assign(r, c);
                }
                self.compute_unpacked_codes(&residuals, &mut unpacked, n)?;
            }
            None => self.compute_unpacked_codes(x, &mut unpacked, n)?,
        }

        self.pack_codes(n, &unpacked, codes, None, None, centroids)
    }

    /// Pack unpacked codes (row stride `ld_codes`, default `M`), appending
    /// the encoded norm when the search type stores one
    ///
    /// Norms are taken from `norms` when given, otherwise computed from the
    /// reconstruction (plus `centroids`).
    fn pack_codes(
        &self,
        n: usize,
        codes: &[i32],
        packed: &mut [u8],
        ld_codes: Option<usize>,
        norms: Option<&[f32]>,
        centroids: Option<&[f32]>,
    ) -> Result<()> {
        let st = self.state();
        let ld = ld_codes.unwrap_or(st.m);
        if n > 0 {
            check_buffer(codes, n - 1, ld)?;
            check_buffer(&codes[(n - 1) * ld..], 1, st.m)?;
        }
        check_buffer(packed, n, st.code_size)?;

        let norm_values: Option<Vec<f32>> = if st.norm_bits > 0 {
            match (norms, centroids) {
                (Some(v), None) => {
                    check_buffer(v, n, 1)?;
                    Some(v[..n].to_vec())
                }
                _ => {
                    let mut recons = vec![0.0f32; n * st.d];
                    self.decode_unpacked(codes, &mut recons, n, Some(ld))?;
                    if let Some(c) = centroids {
                        check_buffer(c, n, st.d)?;
                        for (r, c) in recons.chunks_exact_mut(st.d).zip(c.chunks_exact(st.d)) {
                            add_assign(r, c);
                        }
                    }
                    Some(norms_squared(&recons, st.d, n))
                }
            }
        } else {
            None
        };

        let seg_bytes = st.segment_bytes();
        for i in 0..n {
            let row = &codes[i * ld..i * ld + st.m];
            let out = &mut packed[i * st.code_size..(i + 1) * st.code_size];

            let mut byte_offset = 0;
            let mut m0 = 0;
            for (seg, &count) in st.segments.iter().enumerate() {
                let mut writer = BitstringWriter::new(&mut out[byte_offset..byte_offset + seg_bytes[seg]]);
                for m in m0..m0 + count {
                    let k = st.check_code(m, row[m])?;
                    writer.write(k as u64, st.nbits[m]);
                }
                byte_offset += seg_bytes[seg];
                m0 += count;
            }

            if let Some(norms) = &norm_values {
                let mut writer = BitstringWriter::new(&mut out[byte_offset..]);
                writer.write(st.encode_norm(norms[i]), st.norm_bits);
            }
        }

        Ok(())
    }

    /// Expand `n` packed codes into `n x M` integers
    fn unpack_codes(&self, packed: &[u8], n: usize) -> Result<Vec<i32>> {
        let st = self.state();
        check_buffer(packed, n, st.code_size)?;

        let seg_bytes = st.segment_bytes();
        let mut codes = vec![0i32; n * st.m];
        for i in 0..n {
            let code = &packed[i * st.code_size..(i + 1) * st.code_size];
            let row = &mut codes[i * st.m..(i + 1) * st.m];

            let mut byte_offset = 0;
            let mut m0 = 0;
            for (seg, &count) in st.segments.iter().enumerate() {
                let mut reader = BitstringReader::new(&code[byte_offset..byte_offset + seg_bytes[seg]]);
                for m in m0..m0 + count {
                    row[m] = reader.read(st.nbits[m]) as i32;
                }
                byte_offset += seg_bytes[seg];
                m0 += count;
            }
        }
        Ok(codes)
    }

    /// Decoded squared norm stored at the end of one packed code
    fn read_norm(&self, code: &[u8]) -> Result<f32> {
        let st = self.state();
        if st.norm_bits == 0 {
            return Err(Error::Unsupported(format!("search type {:?} stores no norm", st.search_type)).into());
        }
        check_buffer(code, 1, st.code_size)?;
        let offset: usize = st.segment_bytes().iter().sum();
        let mut reader = BitstringReader::new(&code[offset..st.code_size]);
        Ok(st.decode_norm(reader.read(st.norm_bits)))
    }

    /// Reconstruct `n` vectors from packed codes
    fn decode(&self, codes: &[u8], x: &mut [f32], n: usize) -> Result<()> {
        self.state().check_trained()?;
        let unpacked = self.unpack_codes(codes, n)?;
        self.decode_unpacked(&unpacked, x, n, None)
    }

    /// Reconstruct `n` vectors from unpacked codes with row stride `ld_codes`
    fn decode_unpacked(&self, codes: &[i32], x: &mut [f32], n: usize, ld_codes: Option<usize>) -> Result<()> {
        let st = self.state();
        st.check_trained()?;
        let ld = ld_codes.unwrap_or(st.m);
        if n > 0 {
            check_buffer(codes, n - 1, ld)?;
            check_buffer(&codes[(n - 1) * ld..], 1, st.m)?;
        }
        check_buffer(x, n, st.d)?;

        x[..n * st.d]
            .par_chunks_mut(st.d)
            .enumerate()
            .try_for_each(|(i, row)| -> Result<()> {
                row.fill(0.0);
                for m in 0..st.m {
                    let k = st.check_code(m, codes[i * ld + m])?;
                    add_assign(row, st.centroid(m, k));
                }
                Ok(())
            })
    }

    /// Inner-product lookup tables: `lut[i * ld_lut + j] = alpha * <xq_i, entry_j>`
    fn compute_lut(&self, n: usize, xq: &[f32], lut: &mut [f32], alpha: f32, ld_lut: Option<usize>) -> Result<()> {
        let st = self.state();
        st.check_trained()?;
        check_buffer(xq, n, st.d)?;
        let ld = ld_lut.unwrap_or(st.total_codebook_size);
        if ld < st.total_codebook_size {
            return Err(Error::InvalidParameter(format!(
                "LUT leading dimension {} is smaller than the codebook size {}",
                ld, st.total_codebook_size
            ))
            .into());
        }
        if n > 0 {
            check_buffer(lut, 1, (n - 1) * ld + st.total_codebook_size)?;
        }

        lut.par_chunks_mut(ld).take(n).enumerate().for_each(|(i, row)| {
            let q = &xq[i * st.d..(i + 1) * st.d];
            for (j, entry) in st.codebooks.chunks_exact(st.d).enumerate() {
                row[j] = alpha * inner_product(q, entry);
            }
        });
        Ok(())
    }

    /// Approximate distance between a query and one packed code from the
    /// query's LUT (computed with `alpha = 1`)
    ///
    /// For L2 the result omits the constant `|q|^2` term.
    fn lut_distance(&self, metric: MetricType, code: &[u8], lut: &[f32]) -> Result<f32> {
        let st = self.state();
        st.check_trained()?;
        check_buffer(lut, 1, st.total_codebook_size)?;
        check_buffer(code, 1, st.code_size)?;

        let code_of = |m: usize| st.read_code(code, m);

        let mut ip = 0.0f32;
        for m in 0..st.m {
            ip += lut[st.codebook_offsets[m] + code_of(m)];
        }

        match metric {
            MetricType::InnerProduct => Ok(ip),
            MetricType::L2 => {
                let norm = match st.search_type {
                    SearchType::LutNonorm => 0.0,
                    SearchType::Decompress => st.norm_from_centroids_with(code_of),
                    SearchType::NormFromLut => {
                        if st.centroid_norms.len() != st.total_codebook_size {
                            return Err(Error::InvalidParameter("codebook tables not computed".to_string()).into());
                        }
                        st.norm_from_tables_with(code_of)
                    }
                    SearchType::NormFloat | SearchType::NormQint8 | SearchType::NormQint4 => {
                        let mut reader = BitstringReader::at(code, st.code_bit_offsets[st.m]);
                        st.decode_norm(reader.read(st.norm_bits))
                    }
                };
                Ok(norm - 2.0 * ip)
            }
        }
    }

    /// Mean squared reconstruction error of `n` vectors
    fn reconstruction_error(&self, x: &[f32], n: usize) -> Result<f32> {
        if n == 0 {
            return Ok(0.0);
        }
        let st = self.state();
        let mut codes = vec![0u8; n * st.code_size];
        self.compute_codes(x, &mut codes, n)?;
        let mut recons = vec![0.0f32; n * st.d];
        self.decode(&codes, &mut recons, n)?;

        let total: f64 = x
            .chunks_exact(st.d)
            .zip(recons.chunks_exact(st.d))
            .take(n)
            .map(|(a, b)| crate::distance::l2_squared(a, b) as f64)
            .sum();
        Ok((total / n as f64) as f32)
    }
}

impl<Q: AdditiveQuantizer + ?Sized> AdditiveQuantizer for Box<Q> {
    fn state(&self) -> &AqState {
        (**self).state()
    }

    fn state_mut(&mut self) -> &mut AqState {
        (**self).state_mut()
    }

    fn train(&mut self, n: usize, x: &[f32]) -> Result<()> {
        (**self).train(n, x)
    }

    fn compute_unpacked_codes(&self, x: &[f32], codes: &mut [i32], n: usize) -> Result<()> {
        (**self).compute_unpacked_codes(x, codes, n)
    }

    fn compute_codes_add_centroids(
        &self,
        x: &[f32],
        codes: &mut [u8],
        n: usize,
        centroids: Option<&[f32]>,
    ) -> Result<()> {
        (**self).compute_codes_add_centroids(x, codes, n, centroids)
    }

    fn decode_unpacked(&self, codes: &[i32], x: &mut [f32], n: usize, ld_codes: Option<usize>) -> Result<()> {
        (**self).decode_unpacked(codes, x, n, ld_codes)
    }

    fn compute_lut(&self, n: usize, xq: &[f32], lut: &mut [f32], alpha: f32, ld_lut: Option<usize>) -> Result<()> {
        (**self).compute_lut(n, xq, lut, alpha, ld_lut)
    }
}

/// Train the norm range (and LUT tables when needed) from the reconstructions
/// of a freshly trained quantizer's unpacked training codes
pub(crate) fn finish_training<Q: AdditiveQuantizer + ?Sized>(q: &mut Q, codes: &[i32], n: usize) -> Result<()> {
    let d = q.d();
    let mut recons = vec![0.0f32; n * d];
    q.decode_unpacked(codes, &mut recons, n, None)?;
    let norms = norms_squared(&recons, d, n);

    let st = q.state_mut();
    st.train_norm(&norms);
    if st.search_type == SearchType::NormFromLut {
        st.compute_codebook_tables();
    }
    Ok(())
}
