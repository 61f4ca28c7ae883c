//! K-means clustering for codebook initialization
//!
//! Used by the residual quantizer to fit one codebook per step. Data and
//! centroids are flat row-major buffers.

use crate::distance::l2_squared;
use crate::utils::check_buffer;
use crate::Result;
use rand::prelude::*;
use rayon::prelude::*;

/// K-means clustering parameters
#[derive(Debug, Clone)]
pub struct KMeansParams {
    /// Number of clusters (centroids)
    pub k: usize,
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Convergence tolerance (relative change in inertia)
    pub tolerance: f32,
    /// Random seed for reproducible results
    pub seed: Option<u64>,
    /// Use K-means++ initialization
    pub use_plus_plus_init: bool,
}

impl Default for KMeansParams {
    fn default() -> Self {
        Self {
            k: 256,
            max_iterations: 25,
            tolerance: 1e-4,
            seed: None,
            use_plus_plus_init: true,
        }
    }
}

/// K-means clustering result
#[derive(Debug)]
pub struct KMeansResult {
    /// Cluster centroids, `k x dimension`
    pub centroids: Vec<f32>,
    /// Assignment of each point to a cluster
    pub assignments: Vec<usize>,
    /// Final inertia (sum of squared distances to centroids)
    pub inertia: f32,
    /// Number of iterations performed
    pub iterations: usize,
    /// Whether convergence was achieved
    pub converged: bool,
}

/// Lloyd's k-means over flat vectors
pub struct KMeans {
    params: KMeansParams,
    dimension: usize,
    rng: StdRng,
}

impl KMeans {
    /// Create a new K-means clusterer
    pub fn new(params: KMeansParams, dimension: usize) -> Self {
        let seed = params.seed.unwrap_or_else(rand::random);
        Self {
            params,
            dimension,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Fit K-means to `n` points
    pub fn fit(&mut self, data: &[f32], n: usize) -> Result<KMeansResult> {
        if n == 0 {
            return Err(anyhow::anyhow!("Cannot cluster empty dataset"));
        }
        if n < self.params.k {
            return Err(anyhow::anyhow!(
                "Number of data points ({}) must be >= k ({})",
                n,
                self.params.k
            ));
        }
        check_buffer(data, n, self.dimension)?;
        let data = &data[..n * self.dimension];

        let mut centroids = if self.params.use_plus_plus_init {
            self.init_plus_plus(data, n)
        } else {
            self.init_random(data, n)
        };

        let mut assignments = vec![0usize; n];
        let mut prev_inertia = f32::INFINITY;

        for iteration in 0..self.params.max_iterations {
            let (new_assignments, inertia) = self.assign(data, &centroids);
            let changed = new_assignments != assignments;
            assignments = new_assignments;

            if !changed || (prev_inertia - inertia).abs() <= self.params.tolerance * inertia {
                return Ok(KMeansResult {
                    centroids,
                    assignments,
                    inertia,
                    iterations: iteration + 1,
                    converged: true,
                });
            }

            centroids = self.update_centroids(data, &assignments);
            prev_inertia = inertia;
        }

        let (assignments, inertia) = self.assign(data, &centroids);
        Ok(KMeansResult {
            centroids,
            assignments,
            inertia,
            iterations: self.params.max_iterations,
            converged: false,
        })
    }

    /// Initialize centroids using K-means++
    fn init_plus_plus(&mut self, data: &[f32], n: usize) -> Vec<f32> {
        let d = self.dimension;
        let k = self.params.k;
        let mut centroids = Vec::with_capacity(k * d);

        let first = self.rng.gen_range(0..n);
        centroids.extend_from_slice(&data[first * d..(first + 1) * d]);

        // Running minimum squared distance to the chosen centroids
        let mut min_dists: Vec<f32> = data
            .par_chunks_exact(d)
            .map(|p| l2_squared(p, &centroids[..d]))
            .collect();

        for c in 1..k {
            let total: f64 = min_dists.iter().map(|&v| v as f64).sum();
            let idx = if total <= 0.0 {
                self.rng.gen_range(0..n)
            } else {
                let target = self.rng.gen::<f64>() * total;
                let mut cumulative = 0.0f64;
                let mut chosen = n - 1;
                for (i, &w) in min_dists.iter().enumerate() {
                    cumulative += w as f64;
                    if cumulative >= target {
                        chosen = i;
                        break;
                    }
                }
                chosen
            };
            centroids.extend_from_slice(&data[idx * d..(idx + 1) * d]);

            let newest = &centroids[c * d..(c + 1) * d];
            min_dists
                .par_iter_mut()
                .zip(data.par_chunks_exact(d))
                .for_each(|(m, p)| *m = m.min(l2_squared(p, newest)));
        }

        centroids
    }

    /// Initialize centroids from a random sample of points
    fn init_random(&mut self, data: &[f32], n: usize) -> Vec<f32> {
        let d = self.dimension;
        let mut indices: Vec<usize> = (0..n).collect();
        indices.shuffle(&mut self.rng);

        indices
            .into_iter()
            .take(self.params.k)
            .flat_map(|i| data[i * d..(i + 1) * d].iter().copied())
            .collect()
    }

    /// Nearest centroid of every point and the resulting inertia
    fn assign(&self, data: &[f32], centroids: &[f32]) -> (Vec<usize>, f32) {
        let pairs: Vec<(usize, f32)> = data
            .par_chunks_exact(self.dimension)
            .map(|p| nearest(p, centroids, self.dimension))
            .collect();
        let inertia = pairs.iter().map(|&(_, dist)| dist as f64).sum::<f64>() as f32;
        (pairs.into_iter().map(|(c, _)| c).collect(), inertia)
    }

    /// Recompute centroids as the mean of assigned points
    fn update_centroids(&mut self, data: &[f32], assignments: &[usize]) -> Vec<f32> {
        let d = self.dimension;
        let k = self.params.k;
        let mut sums = vec![0.0f64; k * d];
        let mut counts = vec![0usize; k];

        for (point, &cluster) in data.chunks_exact(d).zip(assignments) {
            counts[cluster] += 1;
            for (s, &v) in sums[cluster * d..(cluster + 1) * d].iter_mut().zip(point) {
                *s += v as f64;
            }
        }

        let n = assignments.len();
        let mut centroids = vec![0.0f32; k * d];
        for cluster in 0..k {
            let out = &mut centroids[cluster * d..(cluster + 1) * d];
            if counts[cluster] == 0 {
                // Empty cluster: reseed from a random point
                let i = self.rng.gen_range(0..n);
                out.copy_from_slice(&data[i * d..(i + 1) * d]);
            } else {
                let inv = 1.0 / counts[cluster] as f64;
                for (o, &s) in out.iter_mut().zip(&sums[cluster * d..(cluster + 1) * d]) {
                    *o = (s * inv) as f32;
                }
            }
        }
        centroids
    }

    /// Predict cluster assignments for new points
    pub fn predict(&self, data: &[f32], n: usize, centroids: &[f32]) -> Result<Vec<usize>> {
        check_buffer(data, n, self.dimension)?;
        Ok(data[..n * self.dimension]
            .par_chunks_exact(self.dimension)
            .map(|p| nearest(p, centroids, self.dimension).0)
            .collect())
    }
}

/// Index and squared distance of the centroid closest to `point`
fn nearest(point: &[f32], centroids: &[f32], d: usize) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (idx, c) in centroids.chunks_exact(d).enumerate() {
        let dist = l2_squared(point, c);
        if dist < best.1 {
            best = (idx, dist);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::generate_random_vectors;

    #[test]
    fn test_kmeans_basic() {
        // Two well separated clusters
        let data = vec![
            0.0, 0.0, 0.1, 0.1, 0.0, 0.1, //
            5.0, 5.0, 5.1, 5.1, 5.0, 5.1,
        ];

        let params = KMeansParams {
            k: 2,
            max_iterations: 50,
            seed: Some(42),
            ..Default::default()
        };

        let mut kmeans = KMeans::new(params, 2);
        let result = kmeans.fit(&data, 6).unwrap();

        assert_eq!(result.centroids.len(), 4);
        assert!(result.converged);
        assert_eq!(result.assignments[0], result.assignments[2]);
        assert_eq!(result.assignments[3], result.assignments[5]);
        assert_ne!(result.assignments[0], result.assignments[3]);
        assert!(result.inertia < 0.1);
    }

    #[test]
    fn test_kmeans_plus_plus_init() {
        let data = generate_random_vectors(100, 16, 7);

        let params = KMeansParams {
            k: 8,
            seed: Some(42),
            ..Default::default()
        };

        let mut kmeans = KMeans::new(params, 16);
        let result = kmeans.fit(&data, 100).unwrap();

        assert_eq!(result.centroids.len(), 8 * 16);
        assert!(result.assignments.iter().all(|&a| a < 8));
    }

    #[test]
    fn test_random_init_is_seeded() {
        let data = generate_random_vectors(64, 4, 1);
        let params = KMeansParams {
            k: 4,
            seed: Some(3),
            use_plus_plus_init: false,
            ..Default::default()
        };

        let a = KMeans::new(params.clone(), 4).fit(&data, 64).unwrap();
        let b = KMeans::new(params, 4).fit(&data, 64).unwrap();
        assert_eq!(a.centroids, b.centroids);
    }

    #[test]
    fn test_empty_and_insufficient_data() {
        let mut kmeans = KMeans::new(KMeansParams::default(), 16);
        assert!(kmeans.fit(&[], 0).is_err());

        let params = KMeansParams {
            k: 2,
            ..Default::default()
        };
        let mut kmeans = KMeans::new(params, 2);
        assert!(kmeans.fit(&[1.0, 2.0], 1).is_err());
    }

    #[test]
    fn test_predict() {
        let train = vec![0.0, 0.0, 0.1, 0.1, 5.0, 5.0, 5.1, 5.1];
        let params = KMeansParams {
            k: 2,
            seed: Some(42),
            ..Default::default()
        };

        let mut kmeans = KMeans::new(params, 2);
        let result = kmeans.fit(&train, 4).unwrap();

        let predictions = kmeans.predict(&[0.05, 0.05, 5.05, 5.05], 2, &result.centroids).unwrap();
        assert_eq!(predictions[0], result.assignments[0]);
        assert_eq!(predictions[1], result.assignments[2]);
    }
}
