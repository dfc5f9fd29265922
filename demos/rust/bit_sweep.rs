use compinj::{
    sweep::{write_csv, Summary, Sweep},
    CompressorKind, ErrorBound, Evaluator, Harness, Tensor,
};

fn main() {
    // Random data in [-0.5, 0.5]
    let original = Tensor::from_vec((0..65_536).map(|_| rand::random::<f32>() - 0.5).collect()).unwrap();

    // Flip every bit of the first 64 compressed bytes, one trial each
    let bound = ErrorBound::Accuracy(1e-3);
    let harness = Harness::new(CompressorKind::Zfp, bound).unwrap();
    let records = Sweep::new(harness, Evaluator::new(bound))
        .run(&original, 0..64)
        .unwrap();

    let summary = Summary::from_records(&records);
    println!("{summary:#?}");

    write_csv(std::io::stdout().lock(), &records).unwrap();
}
