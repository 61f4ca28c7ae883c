//! Local search quantization (LSQ++)
//!
//! Codebooks are learned by alternating three steps on a fixed compute
//! budget: a simulated-annealing perturbation of the codebooks, ICM encoding
//! of the training set with iterated local search restarts, and a ridge
//! least-squares update of the codebooks given the codes.
//!
//! Encoding runs ICM from random codes. Work is split in chunks of
//! `chunk_size` vectors processed in parallel; each chunk draws its
//! perturbations from its own generator, seeded serially, so results do not
//! depend on the number of threads.

pub mod icm;
pub mod timer;

use crate::aq::{finish_training, AdditiveQuantizer, AqState, SearchType};
use crate::distance::{add_assign, column_stddev, l2_squared, norms_squared};
use crate::utils::threads::{self, Lock};
use crate::utils::check_buffer;
use crate::{Error, Result};
use icm::{DefaultIcmEncoderFactory, IcmEncoderFactory};
use nalgebra::DMatrix;
use rand::prelude::*;
use rand_distr::Normal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use timer::LsqTimer;

/// LSQ training and encoding parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LsqParams {
    /// Number of training iterations
    pub train_iters: usize,
    /// Local search restarts when encoding
    pub encode_ils_iters: usize,
    /// Local search restarts when encoding during training
    pub train_ils_iters: usize,
    /// ICM sweeps per restart
    pub icm_iters: usize,
    /// Temperature decay exponent
    pub p: f32,
    /// Ridge regularization of the codebook update
    pub lambd: f32,
    /// Vectors encoded per parallel chunk
    pub chunk_size: usize,
    /// Seed for every random generator
    pub random_seed: u64,
    /// Code entries perturbed per vector before each restart
    pub nperts: usize,
}

impl Default for LsqParams {
    fn default() -> Self {
        Self {
            train_iters: 25,
            encode_ils_iters: 16,
            train_ils_iters: 8,
            icm_iters: 4,
            p: 0.5,
            lambd: 1e-2,
            chunk_size: 10000,
            random_seed: 0x12345,
            nperts: 4,
        }
    }
}

impl LsqParams {
    /// Set the number of training iterations
    pub fn with_train_iters(mut self, train_iters: usize) -> Self {
        self.train_iters = train_iters;
        self
    }

    /// Set the restarts used for encoding and training
    pub fn with_ils_iters(mut self, encode_ils_iters: usize, train_ils_iters: usize) -> Self {
        self.encode_ils_iters = encode_ils_iters;
        self.train_ils_iters = train_ils_iters;
        self
    }

    /// Set the number of ICM sweeps per restart
    pub fn with_icm_iters(mut self, icm_iters: usize) -> Self {
        self.icm_iters = icm_iters;
        self
    }

    /// Set the encoding chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the random seed
    pub fn with_seed(mut self, random_seed: u64) -> Self {
        self.random_seed = random_seed;
        self
    }

    /// Set the number of perturbed entries per vector
    pub fn with_nperts(mut self, nperts: usize) -> Self {
        self.nperts = nperts;
        self
    }

    /// Validate the parameters for a quantizer with `m` codebooks
    pub fn validate(&self, m: usize) -> Result<()> {
        if self.nperts > m {
            return Err(Error::InvalidParameter(format!(
                "nperts ({}) cannot exceed the number of codebooks ({})",
                self.nperts, m
            ))
            .into());
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidParameter("chunk_size must be positive".to_string()).into());
        }
        if self.icm_iters == 0 {
            return Err(Error::InvalidParameter("icm_iters must be positive".to_string()).into());
        }
        if !(self.lambd > 0.0) {
            return Err(Error::InvalidParameter(format!("lambd must be positive, got {}", self.lambd)).into());
        }
        if !(self.p >= 0.0) {
            return Err(Error::InvalidParameter(format!("p must be non-negative, got {}", self.p)).into());
        }
        Ok(())
    }
}

/// Statistics collected by [`LocalSearchQuantizer::train_with_timer`]
#[derive(Debug, Clone)]
pub struct LsqTrainingResult {
    /// Mean squared reconstruction error after each iteration
    pub objectives: Vec<f32>,
    /// Objective of the final codes and codebooks
    pub final_objective: f32,
    /// Total time spent training
    pub total_training_time: Duration,
    /// Seconds spent per phase, from the timer
    pub phase_times: Vec<(String, f64)>,
}

/// Local search quantizer
pub struct LocalSearchQuantizer {
    state: AqState,
    params: LsqParams,
    k: usize,
    icm_encoder_factory: Box<dyn IcmEncoderFactory>,
}

impl std::fmt::Debug for LocalSearchQuantizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSearchQuantizer")
            .field("d", &self.state.d)
            .field("m", &self.state.m)
            .field("k", &self.k)
            .field("search_type", &self.state.search_type)
            .field("is_trained", &self.state.is_trained)
            .field("params", &self.params)
            .finish()
    }
}

impl LocalSearchQuantizer {
    /// Untrained quantizer with `m` codebooks of `2^nbits` entries
    pub fn new(d: usize, m: usize, nbits: usize, search_type: SearchType) -> Result<Self> {
        Self::with_params(d, m, nbits, search_type, LsqParams::default().with_nperts(4.min(m)))
    }

    /// Untrained quantizer with explicit parameters
    pub fn with_params(d: usize, m: usize, nbits: usize, search_type: SearchType, params: LsqParams) -> Result<Self> {
        let state = AqState::new(d, vec![nbits; m], search_type)?;
        Self::from_parts(state, params)
    }

    /// Rebuild a quantizer from its state and parameters
    pub fn from_parts(state: AqState, params: LsqParams) -> Result<Self> {
        params.validate(state.m)?;
        let k = state.ksub(0);
        if state.nbits.iter().any(|&nb| nb != state.nbits[0]) {
            return Err(Error::InvalidParameter("LSQ codebooks must share one size".to_string()).into());
        }
        Ok(Self {
            state,
            params,
            k,
            icm_encoder_factory: Box::new(DefaultIcmEncoderFactory),
        })
    }

    /// Current parameters
    pub fn params(&self) -> &LsqParams {
        &self.params
    }

    /// Replace the parameters
    pub fn set_params(&mut self, params: LsqParams) -> Result<()> {
        params.validate(self.state.m)?;
        self.params = params;
        Ok(())
    }

    /// Entries per codebook
    pub fn k(&self) -> usize {
        self.k
    }

    /// Replace the factory that creates ICM encoders
    pub fn set_icm_encoder_factory(&mut self, factory: Box<dyn IcmEncoderFactory>) {
        self.icm_encoder_factory = factory;
    }

    /// Train on `n` vectors, recording phase timings in `timer`
    pub fn train_with_timer(&mut self, n: usize, x: &[f32], timer: &mut LsqTimer) -> Result<LsqTrainingResult> {
        let (d, m, k) = (self.state.d, self.state.m, self.k);
        self.params.validate(m)?;
        if n == 0 {
            return Err(Error::InvalidParameter("Cannot train on empty dataset".to_string()).into());
        }
        check_buffer(x, n, d)?;
        if n < k {
            log::warn!(
                "LSQ training with {} vectors for {} entries per codebook, some entries will be degenerate",
                n,
                k
            );
        }

        let training_start = Instant::now();
        timer.start("train")?;
        let trained = self.run_training(x, n, timer);
        if trained.is_err() {
            timer.end_all();
        }
        let (objectives, final_objective) = trained?;
        timer.end("train")?;

        log::debug!(
            "LSQ training done in {:.3}s (encode {:.3}s, update {:.3}s)",
            timer.get("train"),
            timer.get("icm_encode"),
            timer.get("update_codebooks")
        );

        Ok(LsqTrainingResult {
            objectives,
            final_objective,
            total_training_time: training_start.elapsed(),
            phase_times: timer.summary(),
        })
    }

    /// Annealed training loop; returns the per-iteration objectives and the
    /// final objective
    fn run_training(&mut self, x: &[f32], n: usize, timer: &mut LsqTimer) -> Result<(Vec<f32>, f32)> {
        let (d, m, k) = (self.state.d, self.state.m, self.k);
        self.state.is_trained = false;

        let stddev = column_stddev(x, d, n);
        let mut rng = StdRng::seed_from_u64(self.params.random_seed);

        let mut codes: Vec<i32> = (0..n * m).map(|_| rng.gen_range(0..k as i32)).collect();
        self.state.codebooks = vec![0.0; self.state.total_codebook_size * d];

        timer.start("update_codebooks")?;
        self.update_codebooks(x, &codes, n)?;
        timer.end("update_codebooks")?;

        let train_iters = self.params.train_iters;
        let mut objectives = Vec::with_capacity(train_iters);
        for iter in 0..train_iters {
            let temperature = (1.0 - (iter + 1) as f32 / train_iters as f32).powf(self.params.p);

            timer.start("perturb_codebooks")?;
            self.perturb_codebooks(temperature, &stddev, &mut rng)?;
            timer.end("perturb_codebooks")?;

            timer.start("icm_encode")?;
            self.icm_encode(x, &mut codes, n, self.params.train_ils_iters, &mut rng)?;
            timer.end("icm_encode")?;

            timer.start("update_codebooks")?;
            self.update_codebooks(x, &codes, n)?;
            timer.end("update_codebooks")?;

            let obj = self.evaluate(&codes, x, n, None)?;
            log::info!(
                "LSQ iteration {}/{}: obj = {:.6}, T = {:.4}",
                iter + 1,
                train_iters,
                obj,
                temperature
            );
            objectives.push(obj);
        }

        let final_objective = self.evaluate(&codes, x, n, None)?;
        self.state.is_trained = true;
        finish_training(self, &codes, n)?;
        Ok((objectives, final_objective))
    }

    /// Ridge least-squares codebook update: solves `(B^T B + lambd I) C = B^T X`
    /// where `B` is the one-hot encoding of `codes`
    pub fn update_codebooks(&mut self, x: &[f32], codes: &[i32], n: usize) -> Result<()> {
        let (d, m, k) = (self.state.d, self.state.m, self.k);
        let mk = m * k;
        check_buffer(x, n, d)?;
        check_buffer(codes, n, m)?;
        if let Some(&bad) = codes[..n * m].iter().find(|&&c| c < 0 || c as usize >= k) {
            return Err(Error::InvalidParameter(format!("Invalid code {} (K = {})", bad, k)).into());
        }

        let mut btb = DMatrix::<f64>::zeros(mk, mk);
        let mut btx = DMatrix::<f64>::zeros(mk, d);
        for (row, xi) in codes.chunks_exact(m).zip(x.chunks_exact(d)).take(n) {
            for m1 in 0..m {
                let r = m1 * k + row[m1] as usize;
                for m2 in 0..m {
                    btb[(r, m2 * k + row[m2] as usize)] += 1.0;
                }
                for (j, &v) in xi.iter().enumerate() {
                    btx[(r, j)] += v as f64;
                }
            }
        }
        for i in 0..mk {
            btb[(i, i)] += self.params.lambd as f64;
        }

        let cholesky = btb
            .cholesky()
            .ok_or_else(|| Error::Numerical("codebook normal equations are not positive definite".to_string()))?;
        let solution = cholesky.solve(&btx);

        let codebooks = &mut self.state.codebooks;
        codebooks.resize(mk * d, 0.0);
        for r in 0..mk {
            for j in 0..d {
                codebooks[r * d + j] = solution[(r, j)] as f32;
            }
        }
        Ok(())
    }

    /// Encode `n` vectors in place with ICM, `ils_iters` restarts per chunk
    pub fn icm_encode(&self, x: &[f32], codes: &mut [i32], n: usize, ils_iters: usize, rng: &mut StdRng) -> Result<()> {
        let (d, m, k) = (self.state.d, self.state.m, self.k);
        check_buffer(x, n, d)?;
        check_buffer(codes, n, m)?;
        if n == 0 {
            return Ok(());
        }

        let mut binaries = vec![0.0f32; m * m * k * k];
        self.compute_binary_terms(&mut binaries)?;

        let chunk = self.params.chunk_size;
        let nchunks = (n + chunk - 1) / chunk;
        let seeds: Vec<u64> = (0..nchunks).map(|_| rng.gen()).collect();
        let improved = Lock::new(0usize);

        let binaries = &binaries;
        let improved_ref = &improved;
        threads::install(|| {
            codes[..n * m]
                .par_chunks_mut(chunk * m)
                .zip(x[..n * d].par_chunks(chunk * d))
                .zip(seeds.par_iter())
                .enumerate()
                .try_for_each(|(index, ((chunk_codes, chunk_x), &seed))| -> Result<()> {
                    let ni = chunk_codes.len() / m;
                    let mut chunk_rng = StdRng::seed_from_u64(seed);
                    let count =
                        self.icm_encode_partial(index, chunk_x, chunk_codes, ni, binaries, ils_iters, &mut chunk_rng)?;
                    *improved_ref.acquire() += count;
                    Ok(())
                })
        })??;

        log::debug!(
            "ICM encoded {} vectors in {} chunks, {} improved by local search",
            n,
            nchunks,
            improved.into_inner()
        );
        Ok(())
    }

    /// Encode one chunk; returns how many vectors local search improved
    #[allow(clippy::too_many_arguments)]
    pub fn icm_encode_partial(
        &self,
        index: usize,
        x: &[f32],
        codes: &mut [i32],
        n: usize,
        binaries: &[f32],
        ils_iters: usize,
        rng: &mut StdRng,
    ) -> Result<usize> {
        let (m, k) = (self.state.m, self.k);
        check_buffer(codes, n, m)?;

        let mut unaries = vec![0.0f32; n * m * k];
        self.compute_unary_terms(x, &mut unaries, n)?;

        let mut best_objs = vec![0.0f32; n];
        self.evaluate(codes, x, n, Some(&mut best_objs))?;
        let initial_objs = best_objs.clone();

        let mut encoder = self.icm_encoder_factory.get(m, k);
        encoder.set_unary_term(n, &unaries);
        encoder.set_binary_term(binaries);

        let mut candidate = codes[..n * m].to_vec();
        let mut objs = vec![0.0f32; n];
        for _ in 0..ils_iters {
            self.perturb_codes(&mut candidate, n, rng);
            for _ in 0..self.params.icm_iters {
                encoder.encode(&mut candidate, n)?;
            }
            self.evaluate(&candidate, x, n, Some(&mut objs))?;

            for i in 0..n {
                let row = i * m..(i + 1) * m;
                if objs[i] < best_objs[i] {
                    best_objs[i] = objs[i];
                    codes[row].copy_from_slice(&candidate[i * m..(i + 1) * m]);
                } else {
                    candidate[row.clone()].copy_from_slice(&codes[row]);
                }
            }
        }

        let improved = best_objs.iter().zip(&initial_objs).filter(|(b, i)| b < i).count();
        log::debug!("ICM chunk {}: {} vectors, {} improved", index, n, improved);
        Ok(improved)
    }

    /// Add annealing noise `temperature * N(0, stddev_j) / M` to every entry
    pub fn perturb_codebooks(&mut self, temperature: f32, stddev: &[f32], rng: &mut StdRng) -> Result<()> {
        let d = self.state.d;
        check_buffer(stddev, 1, d)?;
        let dists = stddev[..d]
            .iter()
            .map(|&s| Normal::new(0.0f32, s))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Numerical(format!("invalid perturbation stddev: {}", e)))?;

        let scale = temperature / self.state.m as f32;
        for entry in self.state.codebooks.chunks_exact_mut(d) {
            for (v, dist) in entry.iter_mut().zip(&dists) {
                *v += scale * dist.sample(rng);
            }
        }
        Ok(())
    }

    /// Reassign `nperts` random entries of every code to random values
    pub fn perturb_codes(&self, codes: &mut [i32], n: usize, rng: &mut StdRng) {
        let m = self.state.m;
        for row in codes.chunks_exact_mut(m).take(n) {
            for _ in 0..self.params.nperts {
                let pos = rng.gen_range(0..m);
                row[pos] = rng.gen_range(0..self.k as i32);
            }
        }
    }

    /// Pairwise terms `binaries[m1, m2, k1, k2] = 2 <c_m1k1, c_m2k2>`
    pub fn compute_binary_terms(&self, binaries: &mut [f32]) -> Result<()> {
        let (d, m, k) = (self.state.d, self.state.m, self.k);
        let mk = m * k;
        check_buffer(binaries, mk, mk)?;
        check_buffer(&self.state.codebooks, mk, d)?;

        let cb = DMatrix::<f32>::from_row_slice(mk, d, &self.state.codebooks[..mk * d]);
        let gram = &cb * cb.transpose();

        for m1 in 0..m {
            for m2 in 0..m {
                for k1 in 0..k {
                    let out = &mut binaries[m1 * m * k * k + m2 * k * k + k1 * k..][..k];
                    for (k2, o) in out.iter_mut().enumerate() {
                        *o = 2.0 * gram[(m1 * k + k1, m2 * k + k2)];
                    }
                }
            }
        }
        Ok(())
    }

    /// Unary terms `unaries[i, m, k] = |c_mk|^2 - 2 <x_i, c_mk>`
    pub fn compute_unary_terms(&self, x: &[f32], unaries: &mut [f32], n: usize) -> Result<()> {
        let (d, m, k) = (self.state.d, self.state.m, self.k);
        let mk = m * k;
        check_buffer(x, n, d)?;
        check_buffer(unaries, n, mk)?;
        if n == 0 {
            return Ok(());
        }

        let cb = DMatrix::<f32>::from_row_slice(mk, d, &self.state.codebooks[..mk * d]);
        let xm = DMatrix::<f32>::from_row_slice(n, d, &x[..n * d]);
        let ip = xm * cb.transpose();
        let norms = norms_squared(&self.state.codebooks, d, mk);

        for (i, row) in unaries.chunks_exact_mut(mk).take(n).enumerate() {
            for (j, u) in row.iter_mut().enumerate() {
                *u = norms[j] - 2.0 * ip[(i, j)];
            }
        }
        Ok(())
    }

    /// Mean squared reconstruction error of `n` codes, per-vector errors
    /// written to `objs` when given
    pub fn evaluate(&self, codes: &[i32], x: &[f32], n: usize, objs: Option<&mut [f32]>) -> Result<f32> {
        let (d, m) = (self.state.d, self.state.m);
        check_buffer(codes, n, m)?;
        check_buffer(x, n, d)?;
        if n == 0 {
            return Ok(0.0);
        }
        if let Some(&bad) = codes[..n * m].iter().find(|&&c| c < 0 || c as usize >= self.k) {
            return Err(Error::InvalidParameter(format!("Invalid code {} (K = {})", bad, self.k)).into());
        }

        let errors: Vec<f32> = codes[..n * m]
            .par_chunks_exact(m)
            .zip(x[..n * d].par_chunks_exact(d))
            .map(|(row, xi)| {
                let mut recons = vec![0.0f32; d];
                for (mi, &c) in row.iter().enumerate() {
                    add_assign(&mut recons, self.state.centroid(mi, c as usize));
                }
                l2_squared(xi, &recons)
            })
            .collect();

        let mean = (errors.iter().map(|&e| e as f64).sum::<f64>() / n as f64) as f32;
        if let Some(objs) = objs {
            check_buffer(objs, n, 1)?;
            objs[..n].copy_from_slice(&errors);
        }
        Ok(mean)
    }
}

impl AdditiveQuantizer for LocalSearchQuantizer {
    fn state(&self) -> &AqState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut AqState {
        &mut self.state
    }

    fn train(&mut self, n: usize, x: &[f32]) -> Result<()> {
        let mut timer = LsqTimer::new();
        self.train_with_timer(n, x, &mut timer)?;
        Ok(())
    }

    fn compute_unpacked_codes(&self, x: &[f32], codes: &mut [i32], n: usize) -> Result<()> {
        self.state.check_trained()?;
        let m = self.state.m;
        check_buffer(x, n, self.state.d)?;
        check_buffer(codes, n, m)?;

        let mut rng = StdRng::seed_from_u64(self.params.random_seed);
        for c in codes[..n * m].iter_mut() {
            *c = rng.gen_range(0..self.k as i32);
        }
        self.icm_encode(x, codes, n, self.params.encode_ils_iters, &mut rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::inner_product;
    use crate::lsq::icm::{CpuIcmEncoder, IcmEncoder};
    use crate::utils::generate_random_vectors;
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn small_params() -> LsqParams {
        LsqParams::default()
            .with_train_iters(4)
            .with_ils_iters(4, 2)
            .with_nperts(2)
    }

    #[test]
    fn test_default_params() {
        let params = LsqParams::default();
        assert_eq!(params.train_iters, 25);
        assert_eq!(params.encode_ils_iters, 16);
        assert_eq!(params.train_ils_iters, 8);
        assert_eq!(params.icm_iters, 4);
        assert_eq!(params.chunk_size, 10000);
        assert_eq!(params.random_seed, 0x12345);
        assert_eq!(params.nperts, 4);
    }

    #[test]
    fn test_perturbation_count_clamped_for_two_codebooks() {
        let err = LocalSearchQuantizer::with_params(8, 2, 4, SearchType::Decompress, LsqParams::default()).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidParameter(_))));

        let params = LsqParams::default().with_nperts(4.min(2));
        let lsq = LocalSearchQuantizer::with_params(8, 2, 4, SearchType::Decompress, params).unwrap();
        assert_eq!(lsq.params().nperts, 2);
        assert_eq!(LocalSearchQuantizer::new(8, 2, 4, SearchType::Decompress).unwrap().params().nperts, 2);
    }

    #[test]
    fn test_invalid_params() {
        assert!(LsqParams::default().with_nperts(5).validate(4).is_err());
        assert!(LsqParams::default().with_chunk_size(0).validate(4).is_err());
        assert!(LsqParams::default().with_icm_iters(0).validate(4).is_err());
        assert!(LocalSearchQuantizer::with_params(8, 2, 4, SearchType::Decompress, LsqParams::default()).is_err());
    }

    #[test]
    fn test_train_and_reconstruct() {
        init_logs();
        let (d, n) = (8, 500);
        let x = generate_random_vectors(n, d, 1);
        let mut lsq = LocalSearchQuantizer::with_params(d, 2, 4, SearchType::Decompress, small_params()).unwrap();

        let mut timer = LsqTimer::new();
        let result = lsq.train_with_timer(n, &x, &mut timer).unwrap();
        assert!(lsq.is_trained());
        assert_eq!(result.objectives.len(), 4);
        assert!(timer.get("icm_encode") > 0.0);

        // Uniform data in [-1, 1): mean squared norm is d / 3
        let mean_norm = d as f32 / 3.0;
        assert!(result.final_objective < mean_norm);
        assert!(lsq.reconstruction_error(&x, n).unwrap() < mean_norm);
    }

    #[test]
    fn test_unary_terms_match_definition() {
        let (d, n) = (6, 5);
        let mut lsq = LocalSearchQuantizer::with_params(d, 2, 2, SearchType::Decompress, small_params()).unwrap();
        lsq.state.codebooks = generate_random_vectors(8, d, 2);
        let x = generate_random_vectors(n, d, 3);

        let mut unaries = vec![0.0; n * 8];
        lsq.compute_unary_terms(&x, &mut unaries, n).unwrap();

        for i in 0..n {
            for m in 0..2 {
                for k in 0..4 {
                    let c = lsq.state.centroid(m, k);
                    let expected = inner_product(c, c) - 2.0 * inner_product(&x[i * d..(i + 1) * d], c);
                    assert_relative_eq!(unaries[i * 8 + m * 4 + k], expected, epsilon = 1e-4);
                }
            }
        }
    }

    #[test]
    fn test_binary_terms_symmetric() {
        let d = 4;
        let mut lsq = LocalSearchQuantizer::with_params(d, 3, 2, SearchType::Decompress, small_params()).unwrap();
        lsq.state.codebooks = generate_random_vectors(12, d, 4);

        let (m, k) = (3, 4);
        let mut binaries = vec![0.0; m * m * k * k];
        lsq.compute_binary_terms(&mut binaries).unwrap();

        let at = |m1: usize, m2: usize, k1: usize, k2: usize| binaries[m1 * m * k * k + m2 * k * k + k1 * k + k2];
        assert_relative_eq!(
            at(0, 2, 1, 3),
            2.0 * inner_product(lsq.state.centroid(0, 1), lsq.state.centroid(2, 3)),
            epsilon = 1e-5
        );
        assert_relative_eq!(at(0, 2, 1, 3), at(2, 0, 3, 1), epsilon = 1e-6);

        let mut short = vec![0.0; m * m * k * k - 1];
        let err = lsq.compute_binary_terms(&mut short).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::DimensionMismatch { .. })));
    }

    #[test]
    fn test_update_codebooks_single_codebook_is_shrunk_mean() {
        let d = 2;
        let params = small_params().with_nperts(1);
        let mut lsq = LocalSearchQuantizer::with_params(d, 1, 1, SearchType::Decompress, params).unwrap();

        let x = vec![1.0, 1.0, 3.0, 3.0, -2.0, 4.0];
        let codes = vec![0, 0, 1];
        lsq.update_codebooks(&x, &codes, 3).unwrap();

        let lambd = lsq.params.lambd;
        assert_relative_eq!(lsq.state.codebooks[0], 4.0 / (2.0 + lambd), epsilon = 1e-5);
        assert_relative_eq!(lsq.state.codebooks[3], 4.0 / (1.0 + lambd), epsilon = 1e-5);

        assert!(lsq.update_codebooks(&x, &[0, 2, 1], 3).is_err());
    }

    #[test]
    fn test_perturb_codes_touches_at_most_nperts() {
        let lsq = LocalSearchQuantizer::with_params(4, 4, 4, SearchType::Decompress, small_params()).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let original = vec![0i32; 40];
        let mut codes = original.clone();
        lsq.perturb_codes(&mut codes, 10, &mut rng);

        for (row, orig) in codes.chunks(4).zip(original.chunks(4)) {
            let changed = row.iter().zip(orig).filter(|(a, b)| a != b).count();
            assert!(changed <= 2);
            assert!(row.iter().all(|&c| (0..16).contains(&c)));
        }
    }

    #[test]
    fn test_zero_temperature_keeps_codebooks() {
        let mut lsq = LocalSearchQuantizer::with_params(4, 2, 2, SearchType::Decompress, small_params()).unwrap();
        lsq.state.codebooks = generate_random_vectors(8, 4, 5);
        let before = lsq.state.codebooks.clone();

        let mut rng = StdRng::seed_from_u64(1);
        lsq.perturb_codebooks(0.0, &[1.0; 4], &mut rng).unwrap();
        assert_eq!(lsq.state.codebooks, before);

        lsq.perturb_codebooks(1.0, &[1.0; 4], &mut rng).unwrap();
        assert_ne!(lsq.state.codebooks, before);
    }

    #[test]
    fn test_training_is_deterministic() {
        let (d, n) = (8, 300);
        let x = generate_random_vectors(n, d, 6);
        let params = small_params().with_chunk_size(64);

        let mut a = LocalSearchQuantizer::with_params(d, 2, 4, SearchType::Decompress, params.clone()).unwrap();
        let mut b = LocalSearchQuantizer::with_params(d, 2, 4, SearchType::Decompress, params).unwrap();
        a.train(n, &x).unwrap();
        b.train(n, &x).unwrap();
        assert_eq!(a.state.codebooks, b.state.codebooks);

        let mut ca = vec![0u8; n * a.code_size()];
        let mut cb = vec![0u8; n * b.code_size()];
        a.compute_codes(&x, &mut ca, n).unwrap();
        b.compute_codes(&x, &mut cb, n).unwrap();
        assert_eq!(ca, cb);
    }

    struct CountingFactory {
        calls: Arc<AtomicUsize>,
    }

    impl IcmEncoderFactory for CountingFactory {
        fn get<'a>(&self, m: usize, k: usize) -> Box<dyn IcmEncoder<'a> + 'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::new(CpuIcmEncoder::new(m, k))
        }
    }

    #[test]
    fn test_custom_encoder_factory_is_used() {
        let (d, n) = (4, 100);
        let x = generate_random_vectors(n, d, 8);
        let params = small_params().with_chunk_size(40);
        let mut lsq = LocalSearchQuantizer::with_params(d, 2, 3, SearchType::Decompress, params).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        lsq.set_icm_encoder_factory(Box::new(CountingFactory { calls: calls.clone() }));
        lsq.train(n, &x).unwrap();

        // 4 iterations, 3 chunks each
        assert_eq!(calls.load(Ordering::SeqCst), 12);
    }

    struct FailingEncoder;

    impl<'a> IcmEncoder<'a> for FailingEncoder {
        fn set_unary_term(&mut self, _n: usize, _unaries: &'a [f32]) {}

        fn set_binary_term(&mut self, _binaries: &'a [f32]) {}

        fn encode(&mut self, _codes: &mut [i32], _n: usize) -> Result<()> {
            Err(Error::Numerical("encoder failure".to_string()).into())
        }
    }

    struct FailingFactory;

    impl IcmEncoderFactory for FailingFactory {
        fn get<'a>(&self, _m: usize, _k: usize) -> Box<dyn IcmEncoder<'a> + 'a> {
            Box::new(FailingEncoder)
        }
    }

    #[test]
    fn test_failed_training_leaves_timer_reusable() {
        let (d, n) = (4, 100);
        let x = generate_random_vectors(n, d, 12);
        let mut lsq = LocalSearchQuantizer::with_params(d, 2, 3, SearchType::Decompress, small_params()).unwrap();
        let mut timer = LsqTimer::new();

        lsq.set_icm_encoder_factory(Box::new(FailingFactory));
        let err = lsq.train_with_timer(n, &x, &mut timer).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Numerical(_))));
        assert!(!lsq.is_trained());
        assert!(!timer.is_running("train"));
        assert!(!timer.is_running("icm_encode"));

        lsq.set_icm_encoder_factory(Box::new(DefaultIcmEncoderFactory));
        lsq.train_with_timer(n, &x, &mut timer).unwrap();
        assert!(lsq.is_trained());
    }

    #[test]
    fn test_training_errors_and_degenerate_sets() {
        let mut lsq = LocalSearchQuantizer::with_params(4, 2, 4, SearchType::Decompress, small_params()).unwrap();
        let err = lsq.train(0, &[]).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidParameter(_))));

        let mut codes = vec![0u8; lsq.code_size()];
        let err = lsq.compute_codes(&[0.0; 4], &mut codes, 1).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotTrained)));

        // Fewer vectors than codebook entries still trains
        let x = generate_random_vectors(5, 4, 10);
        lsq.train(5, &x).unwrap();
        assert!(lsq.is_trained());
        assert!(lsq.state.codebooks.iter().all(|v| v.is_finite()));
    }
}
