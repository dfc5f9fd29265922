//! Error types shared across the harness.
//!
//! Every error that can reach the process boundary knows its exit code, so the
//! binary only has to forward it.

use thiserror::Error;

/// Exit code used for any configuration mistake made by the caller.
pub const CONFIG_EXIT_CODE: i32 = 1;

/// Exit code used for raw data I/O failures.
pub const IO_EXIT_CODE: i32 = 2;

const SHAPE_MISMATCH_CODE: i32 = 6;

/// Caller mistakes. These are never retried.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid compressor `{0}` (expected `sz` or `zfp`)")]
    UnknownCompressor(String),

    #[error("invalid error bounding mode `{0}`")]
    UnknownMode(String),

    #[error("error bounding mode {mode} is not supported by compressor {compressor}")]
    ModeMismatch {
        compressor: &'static str,
        mode: &'static str,
    },

    #[error("flip location {0} out of bounds (expected 0..=7)")]
    BitOffsetOutOfRange(u32),

    #[error("byte location {offset} outside compressed buffer of {len} bytes")]
    ByteOffsetOutOfRange { offset: usize, len: usize },

    #[error("invalid data dimensions: {0}")]
    InvalidDims(String),

    #[error("invalid SNR window: {0}")]
    InvalidWindow(String),
}

impl ConfigError {
    pub fn exit_code(&self) -> i32 {
        CONFIG_EXIT_CODE
    }
}

/// Failures reported by a compression engine.
///
/// A decompression failure after a bit flip is usually the experimental
/// outcome rather than a bug, so these carry enough detail to be recorded.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("{engine}: invalid option: {message}")]
    InvalidOption {
        engine: &'static str,
        message: String,
    },

    #[error("{engine}: compression failed: {message}")]
    Compression {
        engine: &'static str,
        message: String,
    },

    #[error("{engine}: corrupted stream: {message}")]
    Corrupt {
        engine: &'static str,
        message: String,
    },

    #[error("{engine}: stream holds {found} elements, expected {expected}")]
    ShapeMismatch {
        engine: &'static str,
        expected: usize,
        found: usize,
    },
}

impl EngineError {
    pub fn corrupt(engine: &'static str, message: impl Into<String>) -> Self {
        EngineError::Corrupt {
            engine,
            message: message.into(),
        }
    }

    pub fn corrupt_at(engine: &'static str, message: impl Into<String>, offset: usize) -> Self {
        EngineError::Corrupt {
            engine,
            message: format!("{} at offset {}", message.into(), offset),
        }
    }

    pub fn invalid_option(engine: &'static str, message: impl Into<String>) -> Self {
        EngineError::InvalidOption {
            engine,
            message: message.into(),
        }
    }

    /// The engine's own error code, forwarded as the process exit status.
    pub fn code(&self) -> i32 {
        match self {
            EngineError::InvalidOption { .. } => 3,
            EngineError::Compression { .. } => 4,
            EngineError::Corrupt { .. } => 5,
            EngineError::ShapeMismatch { .. } => SHAPE_MISMATCH_CODE,
        }
    }
}

/// Raw tensor loading and storing.
#[derive(Debug, Error)]
pub enum TensorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short read: expected {expected} bytes, file holds {found}")]
    ShortRead { expected: usize, found: usize },

    #[error("tensor holds {found} samples but shape describes {expected}")]
    LengthMismatch { expected: usize, found: usize },
}

impl TensorError {
    pub fn exit_code(&self) -> i32 {
        match self {
            TensorError::Io(_) | TensorError::ShortRead { .. } => IO_EXIT_CODE,
            TensorError::LengthMismatch { .. } => CONFIG_EXIT_CODE,
        }
    }
}

/// Anything that can stop a single compress → corrupt → decompress cycle.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error("decompressed {found} samples, expected {expected}")]
    LengthMismatch { expected: usize, found: usize },

    /// A trial process could not be started or waited on.
    #[error("trial process failed: {0}")]
    Child(#[source] std::io::Error),
}

impl HarnessError {
    pub fn exit_code(&self) -> i32 {
        match self {
            HarnessError::Config(e) => e.exit_code(),
            HarnessError::Engine(e) => e.code(),
            HarnessError::Tensor(e) => e.exit_code(),
            HarnessError::LengthMismatch { .. } => SHAPE_MISMATCH_CODE,
            HarnessError::Child(_) => IO_EXIT_CODE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_layer() {
        let config = HarnessError::from(ConfigError::BitOffsetOutOfRange(9));
        let corrupt = HarnessError::from(EngineError::corrupt("sz", "bad magic"));
        let io = HarnessError::from(TensorError::ShortRead {
            expected: 8,
            found: 4,
        });

        assert_eq!(config.exit_code(), CONFIG_EXIT_CODE);
        assert_eq!(corrupt.exit_code(), 5);
        assert_eq!(io.exit_code(), IO_EXIT_CODE);
        assert_ne!(config.exit_code(), 0);
    }

    #[test]
    fn corrupt_at_mentions_offset() {
        let e = EngineError::corrupt_at("zfp", "truncated code", 17);
        assert_eq!(
            e.to_string(),
            "zfp: corrupted stream: truncated code at offset 17"
        );
    }
}
