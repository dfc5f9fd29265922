use compinj::{
    metrics::Evaluator,
    snr::{windowed_snr, SnrWindow},
    CompressorKind, ErrorBound, Harness, InjectionSite, Shape, Tensor,
};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

fn criterion_benchmark(c: &mut Criterion) {
    const NX: usize = 256;
    const NY: usize = 256;
    const NZ: usize = 16;

    let shape = Shape::new(&[NX, NY, NZ]).unwrap();
    let original: Vec<f32> = (0..shape.len()).map(|_| rand::random::<f32>() - 0.5).collect();
    let reconstructed: Vec<f32> = original
        .iter()
        .map(|a| a + (rand::random::<f32>() - 0.5) * 1e-3)
        .collect();

    let mut metrics_group = c.benchmark_group("metrics");
    let g = metrics_group.sample_size(20);
    g.bench_function("evaluate_abs", |b| {
        let evaluator = Evaluator::new(ErrorBound::Abs(1e-4));
        b.iter(|| evaluator.evaluate(black_box(&original), black_box(&reconstructed)))
    });
    g.bench_function("evaluate_pw_rel", |b| {
        let evaluator = Evaluator::new(ErrorBound::PwRel(1e-3));
        b.iter(|| evaluator.evaluate(black_box(&original), black_box(&reconstructed)))
    });
    g.bench_function("snr_full", |b| {
        let window = SnrWindow::full();
        b.iter(|| windowed_snr(black_box(&original), black_box(&reconstructed), &shape, &window))
    });
    g.bench_function("snr_window", |b| {
        let window = SnrWindow::from_bounds(&[32, 96, 32, 96, 4, 12]).unwrap();
        b.iter(|| windowed_snr(black_box(&original), black_box(&reconstructed), &shape, &window))
    });
    metrics_group.finish();

    let tensor = Tensor::new(original, shape).unwrap();
    let mut cycle_group = c.benchmark_group("cycle");
    let g = cycle_group.sample_size(10);
    for (kind, bound) in [
        (CompressorKind::Sz, ErrorBound::Abs(1e-3)),
        (CompressorKind::Zfp, ErrorBound::Rate(16.0)),
    ] {
        g.bench_function(format!("{kind}_{}", bound.name()), |b| {
            b.iter_batched_ref(
                || Harness::new(kind, bound).unwrap(),
                |harness| harness.run(black_box(&tensor), &InjectionSite::inactive()),
                BatchSize::LargeInput,
            )
        });
    }
    cycle_group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
