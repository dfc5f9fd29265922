use compinj::{metrics::evaluate, CompressorKind, ErrorBound, Harness, InjectionSite, Tensor};

fn main() {
    // A smooth 1-D signal
    let original = Tensor::from_vec((0..100_000).map(|i| (i as f32 * 1e-3).sin()).collect()).unwrap();

    // Compress with an absolute bound, flip bit 5 of compressed byte 64, decompress
    let bound = ErrorBound::Abs(1e-4);
    let mut harness = Harness::new(CompressorKind::Sz, bound).unwrap();
    let site = InjectionSite::new(64, 5, true).unwrap();

    match harness.run(&original, &site) {
        Ok(outcome) => {
            let metrics = evaluate(original.data(), outcome.reconstructed.data(), bound).unwrap();
            println!(
                "ratio {:.2}, {} of {} values outside {bound}, max diff {:.3e}",
                outcome.stats.compression_ratio,
                metrics.violation_count(),
                original.len(),
                metrics.max_abs_diff,
            );
        }
        // A corrupted stream may also be rejected outright
        Err(e) => println!("decompression failed with code {}: {e}", e.exit_code()),
    }
}
