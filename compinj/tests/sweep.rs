use std::{
    error::Error,
    process::{Command, Stdio},
    time::Duration,
};

use compinj::{
    sweep::{write_csv, Summary, Sweep, TrialStatus},
    Compressor, CompressorKind, EngineError, EngineMetrics, ErrorBound, Evaluation, Evaluator,
    Harness, HarnessError, InjectionSite, IsolatedSweep, Shape, Tensor,
};

fn ramp(n: usize) -> Tensor {
    Tensor::from_vec((0..n).map(|i| (i as f32 * 0.1).cos() * 4.0).collect()).unwrap()
}

#[test]
fn one_record_per_bit_in_order() -> Result<(), Box<dyn Error>> {
    let original = ramp(512);
    let bound = ErrorBound::Abs(1e-2);
    let mut sweep = Sweep::new(Harness::new(CompressorKind::Sz, bound)?, Evaluator::new(bound));
    let records = sweep.run(&original, 20..36)?;

    assert_eq!(records.len(), 8 * 16);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.byte_location, 20 + i / 8);
        assert_eq!(record.flip_location as usize, i % 8);
        assert_eq!(record.data_size, 512 * 4);
    }

    let summary = Summary::from_records(&records);
    assert_eq!(
        summary.completed + summary.engine_errors + summary.panicked + summary.length_mismatches,
        summary.trials
    );
    Ok(())
}

#[test]
fn trials_agree_with_single_runs() -> Result<(), Box<dyn Error>> {
    let original = ramp(256);
    let bound = ErrorBound::Rate(12.0);
    let evaluator = Evaluator::new(bound).with_reference_bound(Some(1e-2));
    let mut sweep = Sweep::new(Harness::new(CompressorKind::Zfp, bound)?, evaluator);
    let records = sweep.run(&original, 30..34)?;

    let mut harness = Harness::new(CompressorKind::Zfp, bound)?;
    for record in &records {
        let site = InjectionSite::new(record.byte_location, record.flip_location as u32, true)?;
        let outcome = harness.run(&original, &site)?;
        let evaluation = evaluator.evaluate(original.data(), outcome.reconstructed.data())?;
        let Evaluation::Complete(m) = evaluation else {
            panic!("full pass expected");
        };

        assert_eq!(record.status, TrialStatus::Completed);
        assert_eq!(record.incorrect, m.violation_count());
        assert_eq!(record.max_difference, m.max_abs_diff);
        assert_eq!(record.rmse, m.rmse);
        assert_eq!(record.psnr, m.psnr);
        // fixed rate codes are isolated, one damaged value per flip
        assert!(record.incorrect <= 1);
    }
    Ok(())
}

#[test]
fn engine_errors_keep_sentinels() -> Result<(), Box<dyn Error>> {
    let original = ramp(64);
    let bound = ErrorBound::Precision(16);
    let mut sweep = Sweep::new(Harness::new(CompressorKind::Zfp, bound)?, Evaluator::new(bound));
    // the mode tag byte
    let records = sweep.run(&original, 4..5)?;
    for record in &records {
        assert_eq!(record.status, TrialStatus::EngineError);
        assert_eq!(record.incorrect, -1);
        assert_eq!(record.rmse, -1.0);
        assert!(record.detail.contains("mode tag"));
    }
    Ok(())
}

#[test]
fn empty_range_yields_no_trials() -> Result<(), Box<dyn Error>> {
    let original = ramp(64);
    let bound = ErrorBound::Abs(1e-3);
    let mut sweep = Sweep::new(Harness::new(CompressorKind::Sz, bound)?, Evaluator::new(bound));
    assert!(sweep.run(&original, 10_000..20_000)?.is_empty());
    assert!(sweep.run(&original, 8..8)?.is_empty());
    Ok(())
}

#[test]
fn csv_rows_match_records() -> Result<(), Box<dyn Error>> {
    let original = ramp(128);
    let bound = ErrorBound::Psnr(50.0);
    let mut sweep = Sweep::new(Harness::new(CompressorKind::Sz, bound)?, Evaluator::new(bound));
    let records = sweep.run(&original, 24..26)?;

    let mut out = Vec::new();
    write_csv(&mut out, &records)?;
    let mut reader = csv::Reader::from_reader(out.as_slice());
    let headers = reader.headers()?.clone();
    assert_eq!(&headers[3], "ByteLocation");
    let rows: Vec<csv::StringRecord> = reader.records().collect::<Result<_, _>>()?;
    assert_eq!(rows.len(), records.len());
    for (row, record) in rows.iter().zip(&records) {
        assert_eq!(row[3].parse::<usize>()?, record.byte_location);
        assert_eq!(row[4].parse::<u8>()?, record.flip_location);
    }

    // PSNR mode has no per-element bound
    for record in records.iter().filter(|r| r.status == TrialStatus::Completed) {
        assert_eq!(record.incorrect, -1);
    }
    Ok(())
}

/// Stores samples verbatim, but faults on a corrupted byte 3 and hangs when
/// bit 0 of byte 5 is flipped.
#[cfg(unix)]
#[derive(Default)]
struct Faulty {
    clean: Vec<u8>,
    metrics: EngineMetrics,
}

#[cfg(unix)]
impl Compressor for Faulty {
    fn kind(&self) -> CompressorKind {
        CompressorKind::Sz
    }

    fn bound(&self) -> ErrorBound {
        ErrorBound::Abs(0.0)
    }

    fn compress(&mut self, tensor: &Tensor) -> Result<Vec<u8>, EngineError> {
        self.clean = tensor.data().iter().flat_map(|v| v.to_le_bytes()).collect();
        self.metrics = EngineMetrics::new(self.clean.len(), self.clean.len());
        Ok(self.clean.clone())
    }

    fn decompress(&self, compressed: &[u8], _shape: &Shape) -> Result<Vec<f32>, EngineError> {
        if compressed[3] != self.clean[3] {
            unsafe {
                libc::raise(libc::SIGSEGV);
            }
        }
        if compressed[5] ^ self.clean[5] == 1 {
            std::thread::sleep(Duration::from_secs(600));
        }
        Ok(compressed
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn metrics(&self) -> EngineMetrics {
        self.metrics
    }
}

#[cfg(unix)]
const TRIAL_ENV: &str = "COMPINJ_TEST_TRIAL";

#[cfg(unix)]
fn faulty_sweep_data() -> Tensor {
    Tensor::from_vec((0..16).map(|i| 1.0 + i as f32 * 0.25).collect()).unwrap()
}

#[cfg(unix)]
#[test]
fn isolated_sweep_survives_faulting_engine() -> Result<(), Box<dyn Error>> {
    // child side: run the one trial named in the environment
    if let Ok(site) = std::env::var(TRIAL_ENV) {
        let (byte, bit) = site.split_once(':').ok_or("malformed trial site")?;
        compinj::crash::install()?;
        let mut sweep = Sweep::new(
            Harness::with_engine(Box::<Faulty>::default()),
            Evaluator::new(ErrorBound::Abs(0.0)),
        );
        let record = sweep.trial_at(&faulty_sweep_data(), byte.parse::<usize>()?, bit.parse::<u8>()?)?;
        println!("\n{}", serde_json::to_string(&record)?);
        return Ok(());
    }

    let exe = std::env::current_exe()?;
    let command = |byte: usize, bit: u8| {
        let mut command = Command::new(&exe);
        command
            .args([
                "isolated_sweep_survives_faulting_engine",
                "--exact",
                "--nocapture",
                "--test-threads=1",
            ])
            .env(TRIAL_ENV, format!("{byte}:{bit}"))
            .stderr(Stdio::null());
        command
    };
    let mut sweep = IsolatedSweep::new(Harness::with_engine(Box::<Faulty>::default()), command)
        .timeout(Duration::from_secs(10));

    let mut rows = Vec::new();
    let emitted = sweep.run_with(&faulty_sweep_data(), 0..8, |row| {
        rows.push(row);
        Ok::<(), HarnessError>(())
    })?;
    assert_eq!(emitted, 64);

    let summary = Summary::from_records(&rows);
    assert_eq!(summary.crashed, 8);
    assert_eq!(summary.timed_out, 1);
    assert_eq!(summary.completed, 55);
    for row in &rows {
        match (row.byte_location, row.flip_location) {
            (3, _) => {
                assert_eq!(row.status, TrialStatus::Crashed);
                assert_eq!(row.detail, format!("signal {}", libc::SIGSEGV));
                assert_eq!(row.incorrect, -1);
            }
            (5, 0) => assert_eq!(row.status, TrialStatus::Timeout),
            _ => {
                assert_eq!(row.status, TrialStatus::Completed);
                assert_eq!(row.data_size, 64);
            }
        }
    }
    Ok(())
}
