//! Residual quantization with beam search
//!
//! Codebook `m` quantizes what codebooks `0..m` left over. Training fits each
//! codebook with k-means on the current residuals; encoding keeps the
//! `max_beam_size` best partial codes at each step instead of committing
//! greedily.

use crate::aq::kmeans::{KMeans, KMeansParams};
use crate::aq::{finish_training, AdditiveQuantizer, AqState, SearchType};
use crate::distance::{l2_squared, sub_assign};
use crate::utils::check_buffer;
use crate::{Error, Result};
use rand::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Residual quantizer parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RqParams {
    /// Partial codes kept per vector during beam search
    pub max_beam_size: usize,
    /// K-means iterations per codebook
    pub niter: usize,
    /// Seed for k-means and training subsampling
    pub random_seed: u64,
    /// Train on a random subset of this size when larger (0 = no limit)
    pub max_train_points: usize,
}

impl Default for RqParams {
    fn default() -> Self {
        Self {
            max_beam_size: 5,
            niter: 25,
            random_seed: 1234,
            max_train_points: 0,
        }
    }
}

impl RqParams {
    /// Set the beam size
    pub fn with_beam_size(mut self, max_beam_size: usize) -> Self {
        self.max_beam_size = max_beam_size;
        self
    }

    /// Set the number of k-means iterations
    pub fn with_niter(mut self, niter: usize) -> Self {
        self.niter = niter;
        self
    }

    /// Set the random seed
    pub fn with_seed(mut self, random_seed: u64) -> Self {
        self.random_seed = random_seed;
        self
    }

    /// Validate parameters
    pub fn validate(&self) -> Result<()> {
        if self.max_beam_size == 0 {
            return Err(Error::InvalidParameter("max_beam_size must be positive".to_string()).into());
        }
        if self.niter == 0 {
            return Err(Error::InvalidParameter("niter must be positive".to_string()).into());
        }
        Ok(())
    }
}

/// Partial codes of every vector after some encoding steps
struct Beam {
    /// `n x width x depth`
    codes: Vec<i32>,
    /// `n x width x d`
    residuals: Vec<f32>,
    /// `n x width`, ascending per vector
    distances: Vec<f32>,
    width: usize,
    depth: usize,
}

impl Beam {
    fn start(x: &[f32], n: usize, d: usize) -> Self {
        let residuals = x[..n * d].to_vec();
        let distances = residuals.chunks_exact(d).map(crate::distance::norm_squared).collect();
        Self {
            codes: Vec::new(),
            residuals,
            distances,
            width: 1,
            depth: 0,
        }
    }

    /// Codes of the best candidate of every vector
    fn best_codes(&self, n: usize) -> Vec<i32> {
        let mut out = Vec::with_capacity(n * self.depth);
        for i in 0..n {
            let start = i * self.width * self.depth;
            out.extend_from_slice(&self.codes[start..start + self.depth]);
        }
        out
    }

    fn mean_best_distance(&self, n: usize) -> f32 {
        let total: f64 = (0..n).map(|i| self.distances[i * self.width] as f64).sum();
        (total / n.max(1) as f64) as f32
    }
}

/// Residual quantizer
#[derive(Debug, Clone)]
pub struct ResidualQuantizer {
    state: AqState,
    params: RqParams,
}

impl ResidualQuantizer {
    /// Untrained quantizer with `m` codebooks of `2^nbits` entries
    pub fn new(d: usize, m: usize, nbits: usize, search_type: SearchType) -> Result<Self> {
        Self::with_params(d, m, nbits, search_type, RqParams::default())
    }

    /// Untrained quantizer with explicit parameters
    pub fn with_params(d: usize, m: usize, nbits: usize, search_type: SearchType, params: RqParams) -> Result<Self> {
        let state = AqState::new(d, vec![nbits; m], search_type)?;
        Self::from_parts(state, params)
    }

    /// Rebuild a quantizer from its state and parameters
    pub fn from_parts(state: AqState, params: RqParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { state, params })
    }

    /// Current parameters
    pub fn params(&self) -> &RqParams {
        &self.params
    }

    /// Extend every candidate of `beam` with an entry of codebook `m`,
    /// keeping the `new_width` best
    fn refine_beam(&self, beam: &Beam, n: usize, m: usize, new_width: usize) -> Beam {
        let d = self.state.d;
        let k = self.state.ksub(m);
        let (width, depth) = (beam.width, beam.depth);

        let per_vector: Vec<(Vec<i32>, Vec<f32>, Vec<f32>)> = (0..n)
            .into_par_iter()
            .map(|i| {
                let mut candidates: Vec<(f32, usize, usize)> = Vec::with_capacity(width * k);
                for b in 0..width {
                    let res = &beam.residuals[(i * width + b) * d..(i * width + b + 1) * d];
                    for c in 0..k {
                        candidates.push((l2_squared(res, self.state.centroid(m, c)), b, c));
                    }
                }
                let keep = new_width.min(candidates.len());
                if keep < candidates.len() {
                    candidates.select_nth_unstable_by(keep - 1, |a, b| a.0.total_cmp(&b.0));
                    candidates.truncate(keep);
                }
                candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

                let mut codes = Vec::with_capacity(keep * (depth + 1));
                let mut residuals = Vec::with_capacity(keep * d);
                let mut distances = Vec::with_capacity(keep);
                for &(dist, b, c) in &candidates {
                    let prev = (i * width + b) * depth;
                    codes.extend_from_slice(&beam.codes[prev..prev + depth]);
                    codes.push(c as i32);

                    let start = residuals.len();
                    residuals.extend_from_slice(&beam.residuals[(i * width + b) * d..(i * width + b + 1) * d]);
                    sub_assign(&mut residuals[start..], self.state.centroid(m, c));
                    distances.push(dist);
                }
                (codes, residuals, distances)
            })
            .collect();

        let width = new_width.min(width * k);
        let mut next = Beam {
            codes: Vec::with_capacity(n * width * (depth + 1)),
            residuals: Vec::with_capacity(n * width * d),
            distances: Vec::with_capacity(n * width),
            width,
            depth: depth + 1,
        };
        for (codes, residuals, distances) in per_vector {
            next.codes.extend(codes);
            next.residuals.extend(residuals);
            next.distances.extend(distances);
        }
        next
    }

    /// Fill codebook `m` from `npts` training residuals
    fn train_codebook(&mut self, m: usize, residuals: &[f32], npts: usize) -> Result<()> {
        let d = self.state.d;
        let k = self.state.ksub(m);
        let offset = self.state.codebook_offsets[m] * d;

        let centroids = if npts < k {
            log::warn!(
                "RQ codebook {}: {} training points for {} entries, repeating points",
                m,
                npts,
                k
            );
            (0..k)
                .flat_map(|c| residuals[(c % npts) * d..(c % npts + 1) * d].iter().copied())
                .collect::<Vec<f32>>()
        } else {
            let params = KMeansParams {
                k,
                max_iterations: self.params.niter,
                seed: Some(self.params.random_seed.wrapping_add(m as u64)),
                ..Default::default()
            };
            let result = KMeans::new(params, d).fit(residuals, npts)?;
            log::debug!(
                "RQ codebook {}: k-means {} iterations, inertia {:.4}",
                m,
                result.iterations,
                result.inertia
            );
            result.centroids
        };

        self.state.codebooks[offset..offset + k * d].copy_from_slice(&centroids);
        Ok(())
    }
}

impl AdditiveQuantizer for ResidualQuantizer {
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
        self.params.validate()?;
        self.state.is_trained = false;

        let sample;
        let (x, n) = if self.params.max_train_points > 0 && n > self.params.max_train_points {
            let mut rng = StdRng::seed_from_u64(self.params.random_seed);
            let mut indices = rand::seq::index::sample(&mut rng, n, self.params.max_train_points).into_vec();
            indices.sort_unstable();
            sample = indices
                .iter()
                .flat_map(|&i| x[i * d..(i + 1) * d].iter().copied())
                .collect::<Vec<f32>>();
            log::debug!("RQ training on a subset of {} / {} vectors", indices.len(), n);
            (&sample[..], indices.len())
        } else {
            (x, n)
        };

        self.state.codebooks = vec![0.0; self.state.total_codebook_size * d];
        let mut beam = Beam::start(x, n, d);
        for m in 0..self.state.m {
            self.train_codebook(m, &beam.residuals, n * beam.width)?;
            let new_width = self.params.max_beam_size.min(beam.width * self.state.ksub(m));
            beam = self.refine_beam(&beam, n, m, new_width);
            log::info!(
                "RQ step {}/{}: mean residual = {:.6}, beam = {}",
                m + 1,
                self.state.m,
                beam.mean_best_distance(n),
                beam.width
            );
        }

        self.state.is_trained = true;
        let codes = beam.best_codes(n);
        finish_training(self, &codes, n)
    }

    fn compute_unpacked_codes(&self, x: &[f32], codes: &mut [i32], n: usize) -> Result<()> {
        self.state.check_trained()?;
        let (d, m) = (self.state.d, self.state.m);
        check_buffer(x, n, d)?;
        check_buffer(codes, n, m)?;

        let mut beam = Beam::start(x, n, d);
        for step in 0..m {
            let new_width = self.params.max_beam_size.min(beam.width * self.state.ksub(step));
            beam = self.refine_beam(&beam, n, step, new_width);
        }
        codes[..n * m].copy_from_slice(&beam.best_codes(n));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::generate_random_vectors;

    #[test]
    fn test_train_reduces_error_per_step() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (d, n) = (8, 400);
        let x = generate_random_vectors(n, d, 21);

        let mut shallow = ResidualQuantizer::new(d, 1, 4, SearchType::Decompress).unwrap();
        let mut deep = ResidualQuantizer::new(d, 3, 4, SearchType::Decompress).unwrap();
        shallow.train(n, &x).unwrap();
        deep.train(n, &x).unwrap();

        let e1 = shallow.reconstruction_error(&x, n).unwrap();
        let e3 = deep.reconstruction_error(&x, n).unwrap();
        assert!(e1 < d as f32 / 3.0);
        assert!(e3 < e1);
    }

    #[test]
    fn test_full_beam_finds_best_pair() {
        let (d, n) = (6, 50);
        let x = generate_random_vectors(n, d, 22);

        // Beam wider than K: the second step sees every (k1, k2) pair
        let params = RqParams::default().with_beam_size(64);
        let mut rq = ResidualQuantizer::with_params(d, 2, 3, SearchType::Decompress, params).unwrap();
        rq.train(n, &x).unwrap();

        let mut codes = vec![0i32; n * 2];
        rq.compute_unpacked_codes(&x, &mut codes, n).unwrap();
        let mut recons = vec![0.0f32; n * d];
        rq.decode_unpacked(&codes, &mut recons, n, None).unwrap();

        for i in 0..n {
            let xi = &x[i * d..(i + 1) * d];
            let mut best = f32::INFINITY;
            for k1 in 0..8 {
                for k2 in 0..8 {
                    let mut r = xi.to_vec();
                    sub_assign(&mut r, rq.state().centroid(0, k1));
                    sub_assign(&mut r, rq.state().centroid(1, k2));
                    best = best.min(crate::distance::norm_squared(&r));
                }
            }
            let got = l2_squared(xi, &recons[i * d..(i + 1) * d]);
            assert!(got <= best + 1e-4, "vector {}: {} > {}", i, got, best);
        }
    }

    #[test]
    fn test_small_training_set_repeats_points() {
        let d = 4;
        let x = generate_random_vectors(3, d, 23);
        let mut rq = ResidualQuantizer::new(d, 1, 3, SearchType::Decompress).unwrap();
        rq.train(3, &x).unwrap();

        // Entry 4 repeats training point 1
        assert_eq!(rq.state().centroid(0, 4), &x[d..2 * d]);
        assert!(rq.reconstruction_error(&x, 3).unwrap() < 1e-10);
    }

    #[test]
    fn test_subsampled_training() {
        let (d, n) = (4, 300);
        let x = generate_random_vectors(n, d, 24);
        let params = RqParams {
            max_train_points: 100,
            ..Default::default()
        };
        let mut rq = ResidualQuantizer::with_params(d, 2, 4, SearchType::NormQint8, params).unwrap();
        rq.train(n, &x).unwrap();
        assert!(rq.is_trained());
        assert!(rq.state().norm_max >= rq.state().norm_min);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(ResidualQuantizer::with_params(4, 2, 4, SearchType::Decompress, RqParams::default().with_beam_size(0))
            .is_err());

        let mut rq = ResidualQuantizer::new(4, 2, 4, SearchType::Decompress).unwrap();
        assert!(rq.train(0, &[]).is_err());
        assert!(rq.train(2, &[0.0; 4]).is_err());
    }
}
