use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rlkit_gym::{GaussianSampler, GreedyActionSampler, Sampler, Scores, SoftmaxActionSampler};

fn random_scores(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
}

fn discrete_samplers(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0);
    let mut group = c.benchmark_group("discrete_samplers");
    for batch in [1, 64, 1024] {
        let scores = Scores::Discrete(random_scores(&mut rng, batch, 16));
        let softmax = SoftmaxActionSampler::new(1.0).unwrap();
        group.bench_with_input(BenchmarkId::new("softmax", batch), &scores, |b, s| {
            let mut rng = StdRng::seed_from_u64(1);
            b.iter(|| softmax.sample_action_with_rng(black_box(s), &mut rng));
        });
        group.bench_with_input(BenchmarkId::new("greedy", batch), &scores, |b, s| {
            let mut rng = StdRng::seed_from_u64(1);
            b.iter(|| GreedyActionSampler.sample_action_with_rng(black_box(s), &mut rng));
        });
    }
    group.finish();
}

fn gaussian_sampler(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(2);
    let scores = Scores::Gaussian {
        loc: random_scores(&mut rng, 256, 4),
        scale_log: Array2::from_elem((256, 4), -1.0),
    };
    c.bench_function("gaussian_256x4", |b| {
        let mut rng = StdRng::seed_from_u64(3);
        b.iter(|| GaussianSampler.sample_action_with_rng(black_box(&scores), &mut rng));
    });
}

criterion_group!(benches, discrete_samplers, gaussian_sampler);
criterion_main!(benches);
