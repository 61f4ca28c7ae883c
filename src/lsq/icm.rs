//! Iterated conditional modes (ICM) encoders
//!
//! An encoder improves a batch of codes one codebook at a time. For codebook
//! `m` every vector picks the entry minimising
//!
//! `unary[i, m, k] + sum over m' != m of binary[m', m, c_m', k]`
//!
//! with all other entries held fixed, so the encoding energy never increases.
//!
//! Layouts: unaries are `n x M x K` (`i * M * K + m * K + k`), binaries are
//! `M x M x K x K` (`m1 * M * K * K + m2 * K * K + k1 * K + k2`).

use crate::utils::check_buffer;
use crate::{Error, Result};

/// One ICM encoder bound to the energy tables of a chunk of vectors
pub trait IcmEncoder<'a>: Send {
    /// Attach the unary terms of `n` vectors
    fn set_unary_term(&mut self, n: usize, unaries: &'a [f32]);

    /// Attach the pairwise terms
    fn set_binary_term(&mut self, binaries: &'a [f32]);

    /// One sweep over all codebooks, updating `n x M` codes in place
    fn encode(&mut self, codes: &mut [i32], n: usize) -> Result<()>;
}

/// Creates encoders for a given number of codebooks and entries
pub trait IcmEncoderFactory: Send + Sync {
    /// Fresh encoder for `m` codebooks of `k` entries
    fn get<'a>(&self, m: usize, k: usize) -> Box<dyn IcmEncoder<'a> + 'a>;
}

/// Default single-threaded encoder
#[derive(Debug)]
pub struct CpuIcmEncoder<'a> {
    m: usize,
    k: usize,
    n: usize,
    unaries: Option<&'a [f32]>,
    binaries: Option<&'a [f32]>,
}

impl<'a> CpuIcmEncoder<'a> {
    /// Encoder for `m` codebooks of `k` entries
    pub fn new(m: usize, k: usize) -> Self {
        Self {
            m,
            k,
            n: 0,
            unaries: None,
            binaries: None,
        }
    }

    fn tables(&self, n: usize) -> Result<(&'a [f32], &'a [f32])> {
        let unaries = self
            .unaries
            .ok_or_else(|| Error::InvalidParameter("unary terms not set".to_string()))?;
        let binaries = self
            .binaries
            .ok_or_else(|| Error::InvalidParameter("binary terms not set".to_string()))?;
        if n > self.n {
            return Err(Error::DimensionMismatch {
                expected: self.n,
                actual: n,
            }
            .into());
        }
        check_buffer(unaries, n, self.m * self.k)?;
        check_buffer(binaries, self.m * self.m, self.k * self.k)?;
        Ok((unaries, binaries))
    }

    /// Re-optimize codebook `m` of every vector with the others fixed
    pub fn icm_step(&self, m: usize, codes: &mut [i32], n: usize) -> Result<()> {
        if m >= self.m {
            return Err(Error::InvalidParameter(format!("codebook {} out of range (M = {})", m, self.m)).into());
        }
        let (unaries, binaries) = self.tables(n)?;
        check_buffer(codes, n, self.m)?;

        let (mm, k) = (self.m, self.k);
        let mut objs = vec![0.0f32; k];
        for i in 0..n {
            let row = &mut codes[i * mm..(i + 1) * mm];
            objs.copy_from_slice(&unaries[i * mm * k + m * k..i * mm * k + (m + 1) * k]);

            for other in (0..mm).filter(|&o| o != m) {
                let code2 = row[other] as usize;
                let base = other * mm * k * k + m * k * k + code2 * k;
                for (o, &b) in objs.iter_mut().zip(&binaries[base..base + k]) {
                    *o += b;
                }
            }

            let mut best = 0;
            for (idx, &v) in objs.iter().enumerate().skip(1) {
                if v < objs[best] {
                    best = idx;
                }
            }
            row[m] = best as i32;
        }
        Ok(())
    }
}

impl<'a> IcmEncoder<'a> for CpuIcmEncoder<'a> {
    fn set_unary_term(&mut self, n: usize, unaries: &'a [f32]) {
        self.n = n;
        self.unaries = Some(unaries);
    }

    fn set_binary_term(&mut self, binaries: &'a [f32]) {
        self.binaries = Some(binaries);
    }

    fn encode(&mut self, codes: &mut [i32], n: usize) -> Result<()> {
        for m in 0..self.m {
            self.icm_step(m, codes, n)?;
        }
        Ok(())
    }
}

/// Factory producing [`CpuIcmEncoder`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultIcmEncoderFactory;

impl IcmEncoderFactory for DefaultIcmEncoderFactory {
    fn get<'a>(&self, m: usize, k: usize) -> Box<dyn IcmEncoder<'a> + 'a> {
        Box::new(CpuIcmEncoder::new(m, k))
    }
}

/// Encoding energy of each of `n` codes
///
/// Equals `|x_i - reconstruction_i|^2 - |x_i|^2` for the tables the codes
/// were optimized against.
pub fn icm_energy(unaries: &[f32], binaries: &[f32], codes: &[i32], n: usize, m: usize, k: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let row = &codes[i * m..(i + 1) * m];
            let mut e = 0.0f32;
            for m1 in 0..m {
                let c1 = row[m1] as usize;
                e += unaries[i * m * k + m1 * k + c1];
                for m2 in (m1 + 1)..m {
                    e += binaries[m1 * m * k * k + m2 * k * k + c1 * k + row[m2] as usize];
                }
            }
            e
        })
        .collect()
}
