//! Encoding results must not depend on the worker count
//!
//! Kept in its own test binary: the thread count is process-global.

use aqcore::utils::threads;
use aqcore::{AdditiveQuantizer, LocalSearchQuantizer, LsqParams, SearchType};
use rand::prelude::*;

fn generate_random_vectors(n: usize, dimension: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * dimension).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

#[test]
fn test_results_independent_of_thread_count() {
    let (d, n) = (16, 2000);
    let data = generate_random_vectors(n, d, 13);
    let params = LsqParams::default()
        .with_train_iters(2)
        .with_ils_iters(2, 2)
        .with_chunk_size(300);

    let mut runs = Vec::new();
    for num_threads in [1, 4] {
        threads::set_num_threads(num_threads);
        let mut lsq = LocalSearchQuantizer::with_params(d, 4, 6, SearchType::Decompress, params.clone()).unwrap();
        lsq.train(n, &data).unwrap();

        let mut codes = vec![0u8; n * lsq.code_size()];
        lsq.compute_codes(&data, &mut codes, n).unwrap();
        runs.push((lsq.state().codebooks.clone(), codes));
    }
    threads::set_num_threads(0);

    assert_eq!(runs[0].0, runs[1].0);
    assert_eq!(runs[0].1, runs[1].1);
}
