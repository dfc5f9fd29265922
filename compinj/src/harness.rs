//! The compress → corrupt → decompress cycle.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::{
    engine::{self, Compressor},
    error::{ConfigError, HarnessError},
    inject::{inject, InjectionSite},
    metrics::{Evaluation, Metrics, Violation},
    mode::{CompressorKind, ErrorBound},
    snr::SnrReport,
    tensor::{Shape, Tensor},
};

/// Everything one cycle produced besides the reconstruction itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CycleStats {
    pub compressed_size: usize,
    pub compression_ratio: f64,
    #[serde(serialize_with = "serialize_secs")]
    pub compress_time: Duration,
    #[serde(serialize_with = "serialize_secs")]
    pub decompress_time: Duration,
}

pub(crate) fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub reconstructed: Tensor,
    pub stats: CycleStats,
}

/// Serializable record of one experiment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub compressor: CompressorKind,
    pub bound: ErrorBound,
    pub shape: Shape,
    pub injection: InjectionSite,
    pub stats: CycleStats,
    /// Absent when evaluation stopped at `first_violation`.
    pub metrics: Option<Metrics>,
    pub first_violation: Option<Violation>,
    pub snr: Option<SnrReport>,
}

impl RunReport {
    pub fn new(
        harness: &Harness,
        injection: InjectionSite,
        outcome: &RunOutcome,
        evaluation: Evaluation,
        snr: Option<SnrReport>,
    ) -> RunReport {
        let (metrics, first_violation) = match evaluation {
            Evaluation::Complete(metrics) => (Some(metrics), None),
            Evaluation::FirstViolation(violation) => (None, Some(violation)),
        };
        RunReport {
            compressor: harness.kind(),
            bound: harness.bound(),
            shape: outcome.reconstructed.shape().clone(),
            injection,
            stats: outcome.stats,
            metrics,
            first_violation,
            snr,
        }
    }
}

/// Drives one engine through a fault-injection cycle.
pub struct Harness {
    engine: Box<dyn Compressor>,
}

impl Harness {
    /// Selects and configures the engine. Unknown or mismatched modes and
    /// invalid bounds are reported here, before any data is touched.
    pub fn new(kind: CompressorKind, bound: ErrorBound) -> Result<Harness, HarnessError> {
        Ok(Harness {
            engine: engine::configure(kind, bound)?,
        })
    }

    /// Wraps an already configured engine.
    pub fn with_engine(engine: Box<dyn Compressor>) -> Harness {
        Harness { engine }
    }

    pub fn kind(&self) -> CompressorKind {
        self.engine.kind()
    }

    pub fn bound(&self) -> ErrorBound {
        self.engine.bound()
    }

    pub(crate) fn engine(&self) -> &dyn Compressor {
        self.engine.as_ref()
    }

    /// Compresses and times the compression.
    pub fn compress(&mut self, original: &Tensor) -> Result<(Vec<u8>, Duration), HarnessError> {
        tracing::debug!(compressor = %self.kind(), "compressing data");
        let start = Instant::now();
        let compressed = self.engine.compress(original)?;
        Ok((compressed, start.elapsed()))
    }

    /// Decompresses into a tensor of the original's shape and times it.
    pub fn decompress(
        &self,
        compressed: &[u8],
        original: &Tensor,
    ) -> Result<(Tensor, Duration), HarnessError> {
        tracing::debug!(compressor = %self.kind(), "decompressing data");
        let start = Instant::now();
        let values = self.engine.decompress(compressed, original.shape())?;
        let elapsed = start.elapsed();
        if values.len() != original.len() {
            return Err(HarnessError::LengthMismatch {
                expected: original.len(),
                found: values.len(),
            });
        }
        Ok((Tensor::new(values, original.shape().clone())?, elapsed))
    }

    /// Runs the full cycle with `site` applied between the two phases.
    pub fn run(&mut self, original: &Tensor, site: &InjectionSite) -> Result<RunOutcome, HarnessError> {
        let (mut compressed, compress_time) = self.compress(original)?;

        if site.is_active() && site.byte_offset() >= compressed.len() {
            return Err(ConfigError::ByteOffsetOutOfRange {
                offset: site.byte_offset(),
                len: compressed.len(),
            }
            .into());
        }
        if site.is_active() {
            tracing::debug!(
                byte = site.byte_offset(),
                bit = site.bit_offset(),
                before = compressed[site.byte_offset()],
                "injecting bit flip"
            );
        }
        inject(&mut compressed, site);

        let (reconstructed, decompress_time) = self.decompress(&compressed, original)?;

        let metrics = self.engine.metrics();
        let stats = CycleStats {
            compressed_size: compressed.len(),
            compression_ratio: metrics.compression_ratio(),
            compress_time,
            decompress_time,
        };
        tracing::info!(
            compression_ratio = stats.compression_ratio,
            compressed_size = stats.compressed_size,
            compress_secs = compress_time.as_secs_f64(),
            decompress_secs = decompress_time.as_secs_f64(),
            "decompressed data"
        );
        tracing::trace!(
            original = ?&original.data()[..original.len().min(10)],
            reconstructed = ?&reconstructed.data()[..reconstructed.len().min(10)],
            "leading samples"
        );

        Ok(RunOutcome {
            reconstructed,
            stats,
        })
    }
}
