//! Exhaustive single-bit sweeps over a range of compressed bytes.
//!
//! The data is compressed once. Every trial then flips one bit of a private
//! copy of the clean stream, decompresses it and evaluates the result, so
//! trials are independent and can run in parallel. Rows reach the caller's
//! sink batch by batch, in site order, while the sweep is still running.
//!
//! In-process trials survive engine errors and panics but not fatal signals;
//! [`crate::isolate`] runs each trial in its own process for engines that may
//! fault.

use std::{
    io::Write,
    ops::Range,
    panic::{self, AssertUnwindSafe},
};

#[cfg(feature = "parallel")]
use rayon::prelude::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ConfigError, HarnessError},
    harness::Harness,
    inject::flip_bit,
    metrics::{Evaluation, Evaluator, MetricsError},
    tensor::Tensor,
};

/// Trials handed to the pool at once; rows are emitted after each batch.
const BATCH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialStatus {
    Completed,
    /// The engine rejected the corrupted stream.
    EngineError,
    /// The engine panicked while decoding.
    Panicked,
    /// The engine returned the wrong number of samples.
    LengthMismatch,
    /// The trial process died on a fatal signal; `Detail` names it.
    Crashed,
    /// The trial process was killed after the sweep's timeout.
    Timeout,
}

/// One row of sweep output. Numeric fields hold `-1` unless the trial completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    #[serde(rename = "DataSize")]
    pub data_size: usize,
    #[serde(rename = "CompressionRatio")]
    pub compression_ratio: f64,
    #[serde(rename = "ErrorInfo")]
    pub error_info: String,
    #[serde(rename = "ByteLocation")]
    pub byte_location: usize,
    #[serde(rename = "FlipLocation")]
    pub flip_location: u8,
    #[serde(rename = "DecompressionTime")]
    pub decompression_time: f64,
    #[serde(rename = "Incorrect")]
    pub incorrect: i64,
    #[serde(rename = "MaxDifference")]
    pub max_difference: f64,
    #[serde(rename = "RMSE")]
    pub rmse: f64,
    #[serde(rename = "PSNR")]
    pub psnr: f64,
    #[serde(rename = "Status")]
    pub status: TrialStatus,
    #[serde(rename = "Detail")]
    pub detail: String,
}

impl TrialRecord {
    /// A row for `byte`/`bit` with every measurement still at `-1`.
    pub(crate) fn pending(
        original: &Tensor,
        harness: &Harness,
        compression_ratio: f64,
        byte: usize,
        bit: u8,
    ) -> TrialRecord {
        TrialRecord {
            data_size: original.byte_len(),
            compression_ratio,
            error_info: harness.bound().to_string(),
            byte_location: byte,
            flip_location: bit,
            decompression_time: -1.0,
            incorrect: -1,
            max_difference: -1.0,
            rmse: -1.0,
            psnr: -1.0,
            status: TrialStatus::Completed,
            detail: String::new(),
        }
    }
}

/// Every `(byte, bit)` of `bytes`, clamped to a stream of `len` bytes.
pub(crate) fn plan(bytes: Range<usize>, len: usize) -> Vec<(usize, u8)> {
    let end = bytes.end.min(len);
    let start = bytes.start.min(end);
    tracing::info!(start, end, compressed_size = len, trials = 8 * (end - start), "starting sweep");
    (start..end)
        .flat_map(|byte| (0..8).map(move |bit| (byte, bit)))
        .collect()
}

/// Runs `trial` over `sites` batch by batch, passing rows to `sink` in site order.
pub(crate) fn drive<T, S, E>(sites: &[(usize, u8)], trial: T, mut sink: S) -> Result<usize, E>
where
    T: Fn(usize, u8) -> Result<TrialRecord, HarnessError> + Sync,
    S: FnMut(TrialRecord) -> Result<(), E>,
    E: From<HarnessError>,
{
    let mut emitted = 0;
    for batch in sites.chunks(BATCH) {
        #[cfg(feature = "parallel")]
        let records: Result<Vec<TrialRecord>, HarnessError> =
            batch.par_iter().map(|&(byte, bit)| trial(byte, bit)).collect();
        #[cfg(not(feature = "parallel"))]
        let records: Result<Vec<TrialRecord>, HarnessError> =
            batch.iter().map(|&(byte, bit)| trial(byte, bit)).collect();

        for record in records? {
            sink(record)?;
            emitted += 1;
        }
    }
    Ok(emitted)
}

pub struct Sweep {
    harness: Harness,
    evaluator: Evaluator,
}

impl Sweep {
    /// Trials always run the full comparison pass, whatever `evaluator` asks for.
    pub fn new(harness: Harness, evaluator: Evaluator) -> Sweep {
        Sweep {
            harness,
            evaluator: evaluator.stop_at_first_violation(false),
        }
    }

    /// Flips every bit of every byte in `bytes`, clamped to the compressed length.
    pub fn run(&mut self, original: &Tensor, bytes: Range<usize>) -> Result<Vec<TrialRecord>, HarnessError> {
        let mut records = Vec::new();
        self.run_with(original, bytes, |record| {
            records.push(record);
            Ok::<(), HarnessError>(())
        })?;
        Ok(records)
    }

    /// Like [`Sweep::run`], but hands each row to `sink` as soon as its batch
    /// finishes. Returns the number of rows emitted.
    pub fn run_with<S, E>(&mut self, original: &Tensor, bytes: Range<usize>, sink: S) -> Result<usize, E>
    where
        S: FnMut(TrialRecord) -> Result<(), E>,
        E: From<HarnessError>,
    {
        let (compressed, _) = self.harness.compress(original)?;
        let ratio = self.harness.engine().metrics().compression_ratio();
        let sites = plan(bytes, compressed.len());

        let this = &*self;
        drive(
            &sites,
            |byte, bit| Ok(this.trial(original, &compressed, ratio, byte, bit)),
            sink,
        )
    }

    /// Compresses `original` and runs the one trial at `byte`/`bit`.
    pub fn trial_at(&mut self, original: &Tensor, byte: usize, bit: u8) -> Result<TrialRecord, HarnessError> {
        if bit > 7 {
            return Err(ConfigError::BitOffsetOutOfRange(bit as u32).into());
        }
        let (compressed, _) = self.harness.compress(original)?;
        if byte >= compressed.len() {
            return Err(ConfigError::ByteOffsetOutOfRange {
                offset: byte,
                len: compressed.len(),
            }
            .into());
        }
        let ratio = self.harness.engine().metrics().compression_ratio();
        Ok(self.trial(original, &compressed, ratio, byte, bit))
    }

    fn trial(
        &self,
        original: &Tensor,
        compressed: &[u8],
        compression_ratio: f64,
        byte: usize,
        bit: u8,
    ) -> TrialRecord {
        let mut record = TrialRecord::pending(original, &self.harness, compression_ratio, byte, bit);

        let mut buffer = compressed.to_vec();
        flip_bit(&mut buffer, byte, bit);

        let harness = &self.harness;
        let decoded = panic::catch_unwind(AssertUnwindSafe(|| harness.decompress(&buffer, original)));
        match decoded {
            Ok(Ok((reconstructed, elapsed))) => {
                record.decompression_time = elapsed.as_secs_f64();
                match self.evaluator.evaluate(original.data(), reconstructed.data()) {
                    Ok(Evaluation::Complete(metrics)) => {
                        record.incorrect = metrics.violation_count();
                        record.max_difference = metrics.max_abs_diff;
                        record.rmse = metrics.rmse;
                        record.psnr = metrics.psnr;
                    }
                    Ok(Evaluation::FirstViolation(_)) => unreachable!("sweeps run full passes"),
                    Err(e @ MetricsError::LengthMismatch { .. }) => {
                        record.status = TrialStatus::LengthMismatch;
                        record.detail = e.to_string();
                    }
                    Err(MetricsError::Empty) => unreachable!("shapes hold at least one sample"),
                }
            }
            Ok(Err(HarnessError::LengthMismatch { expected, found })) => {
                record.status = TrialStatus::LengthMismatch;
                record.detail = format!("expected {expected} samples, got {found}");
            }
            Ok(Err(e)) => {
                record.status = TrialStatus::EngineError;
                record.detail = e.to_string();
            }
            Err(payload) => {
                record.status = TrialStatus::Panicked;
                record.detail = panic_message(payload.as_ref());
                tracing::warn!(byte, bit, detail = %record.detail, "engine panicked");
            }
        }
        record
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Writes `records` as CSV with a header row.
pub fn write_csv<W: Write>(writer: W, records: &[TrialRecord]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Status counts over a sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub trials: usize,
    pub completed: usize,
    pub engine_errors: usize,
    pub panicked: usize,
    pub length_mismatches: usize,
    pub crashed: usize,
    pub timed_out: usize,
    /// Completed trials with at least one bound violation.
    pub with_violations: usize,
    /// Largest violation count of any completed trial, `-1` if none completed
    /// or the mode has no per-element bound.
    pub max_violations: i64,
}

impl Default for Summary {
    fn default() -> Summary {
        Summary {
            trials: 0,
            completed: 0,
            engine_errors: 0,
            panicked: 0,
            length_mismatches: 0,
            crashed: 0,
            timed_out: 0,
            with_violations: 0,
            max_violations: -1,
        }
    }
}

impl Summary {
    pub fn from_records(records: &[TrialRecord]) -> Summary {
        let mut summary = Summary::default();
        for record in records {
            summary.record(record);
        }
        summary
    }

    /// Folds one more row into the counts.
    pub fn record(&mut self, record: &TrialRecord) {
        self.trials += 1;
        match record.status {
            TrialStatus::Completed => {
                self.completed += 1;
                if record.incorrect > 0 {
                    self.with_violations += 1;
                }
                self.max_violations = self.max_violations.max(record.incorrect);
            }
            TrialStatus::EngineError => self.engine_errors += 1,
            TrialStatus::Panicked => self.panicked += 1,
            TrialStatus::LengthMismatch => self.length_mismatches += 1,
            TrialStatus::Crashed => self.crashed += 1,
            TrialStatus::Timeout => self.timed_out += 1,
        }
    }
}
