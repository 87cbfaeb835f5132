use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fairvae::cluster::{retry_clustering, Dendrogram};
use fairvae::config::Linkage;
use fairvae::data::Matrix;
use fairvae::metrics::sweep_thresholds;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// Latent means around a handful of centres, as the prior model produces them.
fn latent_points(n: usize, dim: usize) -> Matrix {
    let mut rng = StdRng::seed_from_u64(1903);
    let centres: Vec<Vec<f32>> = (0..8).map(|_| (0..dim).map(|_| rng.gen_range(-2.0..2.0)).collect()).collect();
    let mut data = Vec::with_capacity(n * dim);
    for i in 0..n {
        for v in &centres[i % centres.len()] {
            data.push(v + rng.gen_range(-0.1..0.1));
        }
    }
    Matrix::new(data, n, dim).unwrap()
}

fn probabilities(n: usize, labels: usize) -> (Matrix, Matrix) {
    let mut rng = StdRng::seed_from_u64(1903);
    let y: Vec<f32> = (0..n * labels).map(|_| if rng.gen_bool(0.3) { 1.0 } else { 0.0 }).collect();
    let p: Vec<f32> = y.iter().map(|v| 0.6 * v + rng.gen_range(0.0..0.4)).collect();
    (Matrix::new(p, n, labels).unwrap(), Matrix::new(y, n, labels).unwrap())
}

pub fn clustering_benchmarks(c: &mut Criterion) {
    let points = latent_points(1_000, 8);
    c.bench_function("ward dendrogram 1k", |b| {
        b.iter(|| Dendrogram::build(black_box(&points), Linkage::Ward))
    });
    c.bench_function("average dendrogram 1k", |b| {
        b.iter(|| Dendrogram::build(black_box(&points), Linkage::Average))
    });
    c.bench_function("retry clustering 1k", |b| {
        b.iter(|| retry_clustering(black_box(&points), 0.1, 4, 10, Linkage::Ward).unwrap())
    });
}

pub fn metric_benchmarks(c: &mut Criterion) {
    let (probs, labels) = probabilities(5_000, 14);
    c.bench_function("threshold sweep 5k x 14", |b| {
        b.iter(|| sweep_thresholds(black_box(&probs), black_box(&labels)).unwrap())
    });
}

criterion_group!(benches, clustering_benchmarks, metric_benchmarks);
criterion_main!(benches);
