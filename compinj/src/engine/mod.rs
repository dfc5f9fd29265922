//! The compression engine seam.
//!
//! The harness treats the compressor as an opaque service: configure it,
//! compress a tensor into bytes, decompress (possibly corrupted) bytes back
//! into a tensor of a known shape, and ask for size metrics. The bundled
//! `sz` and `zfp` engines are small pure Rust stand-ins for the codecs of
//! the same name; anything implementing [`Compressor`] can be driven instead.

use serde::Serialize;

use crate::{
    error::{ConfigError, EngineError, HarnessError},
    mode::{CompressorKind, ErrorBound},
    tensor::{Shape, Tensor},
};

pub(crate) mod stream;
pub mod sz;
pub mod zfp;

pub use sz::SzCompressor;
pub use zfp::ZfpCompressor;

/// A configured lossy compressor.
///
/// `decompress` takes `&self` so a single configured engine can serve many
/// independent trials at once.
pub trait Compressor: Send + Sync {
    fn kind(&self) -> CompressorKind;

    fn bound(&self) -> ErrorBound;

    /// Compresses `tensor` and records size metrics for [`Compressor::metrics`].
    fn compress(&mut self, tensor: &Tensor) -> Result<Vec<u8>, EngineError>;

    /// Decompresses `compressed` into exactly `shape.len()` samples or fails.
    fn decompress(&self, compressed: &[u8], shape: &Shape) -> Result<Vec<f32>, EngineError>;

    /// Metrics of the most recent compression.
    fn metrics(&self) -> EngineMetrics;
}

/// Size metrics reported by an engine after compressing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EngineMetrics {
    pub uncompressed_size: usize,
    pub compressed_size: usize,
}

impl EngineMetrics {
    pub fn new(uncompressed_size: usize, compressed_size: usize) -> Self {
        EngineMetrics {
            uncompressed_size,
            compressed_size,
        }
    }

    /// Uncompressed over compressed size; zero before anything was compressed.
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed_size == 0 {
            return 0.0;
        }
        self.uncompressed_size as f64 / self.compressed_size as f64
    }
}

/// Selects and configures an engine.
///
/// The mode must belong to the compressor's family; the engine then validates
/// the bound value itself.
pub fn configure(
    kind: CompressorKind,
    bound: ErrorBound,
) -> Result<Box<dyn Compressor>, HarnessError> {
    if !kind.supports(&bound) {
        return Err(ConfigError::ModeMismatch {
            compressor: kind.name(),
            mode: bound.name(),
        }
        .into());
    }
    let engine: Box<dyn Compressor> = match kind {
        CompressorKind::Sz => Box::new(SzCompressor::new(bound)?),
        CompressorKind::Zfp => Box::new(ZfpCompressor::new(bound)?),
    };
    tracing::debug!(compressor = %kind, %bound, "configured engine");
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_mode_is_a_config_error() {
        let err = configure(CompressorKind::Sz, ErrorBound::Rate(8.0)).err().unwrap();
        assert!(matches!(
            err,
            HarnessError::Config(ConfigError::ModeMismatch {
                compressor: "sz",
                mode: "Rate"
            })
        ));
    }

    #[test]
    fn invalid_bound_keeps_engine_code() {
        let err = configure(CompressorKind::Zfp, ErrorBound::Precision(64))
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn ratio_before_compression() {
        assert_eq!(EngineMetrics::default().compression_ratio(), 0.0);
        assert_eq!(EngineMetrics::new(400, 100).compression_ratio(), 4.0);
    }
}
