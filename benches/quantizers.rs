//! Benchmarks for quantizer encoding, decoding and lookup tables

use aqcore::{AdditiveQuantizer, LocalSearchQuantizer, LsqParams, ProductResidualQuantizer, SearchType};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;

fn generate_random_vectors(n: usize, dim: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n * dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn trained_lsq(d: usize, m: usize, nbits: usize, data: &[f32], n: usize) -> LocalSearchQuantizer {
    let params = LsqParams::default().with_train_iters(3).with_nperts(4.min(m));
    let mut lsq = LocalSearchQuantizer::with_params(d, m, nbits, SearchType::NormFloat, params).unwrap();
    lsq.train(n, data).unwrap();
    lsq
}

fn benchmark_lsq_encode(c: &mut Criterion) {
    let d = 32;
    let n_train = 2000;
    let train = generate_random_vectors(n_train, d);

    let mut group = c.benchmark_group("lsq_encode");
    group.sample_size(10);

    for m in [2, 4, 8] {
        let lsq = trained_lsq(d, m, 8, &train, n_train);
        let n = 256;
        let mut codes = vec![0u8; n * lsq.code_size()];

        group.bench_with_input(BenchmarkId::new("codebooks", m), &m, |bencher, _| {
            bencher.iter(|| lsq.compute_codes(black_box(&train[..n * d]), &mut codes, n).unwrap());
        });
    }

    group.finish();
}

fn benchmark_decode_and_lut(c: &mut Criterion) {
    let d = 32;
    let n = 2000;
    let data = generate_random_vectors(n, d);
    let lsq = trained_lsq(d, 4, 8, &data, n);

    let mut codes = vec![0u8; n * lsq.code_size()];
    lsq.compute_codes(&data, &mut codes, n).unwrap();

    c.bench_function("lsq_decode_2000", |bencher| {
        let mut recons = vec![0.0f32; n * d];
        bencher.iter(|| lsq.decode(black_box(&codes), &mut recons, n).unwrap());
    });

    c.bench_function("lsq_lut_distance_2000", |bencher| {
        let mut lut = vec![0.0f32; lsq.total_codebook_size()];
        lsq.compute_lut(1, &data[..d], &mut lut, 1.0, None).unwrap();
        let cs = lsq.code_size();
        bencher.iter(|| {
            let mut best = f32::INFINITY;
            for code in codes.chunks_exact(cs) {
                let dist = lsq.lut_distance(aqcore::MetricType::L2, code, &lut).unwrap();
                best = best.min(dist);
            }
            black_box(best)
        });
    });
}

fn benchmark_product_rq_train(c: &mut Criterion) {
    let d = 32;
    let n = 2000;
    let data = generate_random_vectors(n, d);

    let mut group = c.benchmark_group("product_rq_train");
    group.sample_size(10);

    for nsplits in [1, 2, 4] {
        group.bench_with_input(BenchmarkId::new("splits", nsplits), &nsplits, |bencher, &nsplits| {
            bencher.iter(|| {
                let mut prq = ProductResidualQuantizer::new(d, nsplits, 2, 6, SearchType::Decompress).unwrap();
                prq.train(n, black_box(&data)).unwrap();
                prq
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_lsq_encode,
    benchmark_decode_and_lut,
    benchmark_product_rq_train
);
criterion_main!(benches);
