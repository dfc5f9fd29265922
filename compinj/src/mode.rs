//! Compressor selection and error-bounding modes.

use std::fmt;

use serde::Serialize;

use crate::error::ConfigError;

/// The lossy compressors the harness knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressorKind {
    /// Prediction-based, supports `ABS`, `PW_REL` and `PSNR`.
    Sz,
    /// Transform/fixed-width based, supports `Accuracy`, `Rate` and `Precision`.
    Zfp,
}

impl CompressorKind {
    pub const ALL: [CompressorKind; 2] = [CompressorKind::Sz, CompressorKind::Zfp];

    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name {
            "sz" => Ok(CompressorKind::Sz),
            "zfp" => Ok(CompressorKind::Zfp),
            other => Err(ConfigError::UnknownCompressor(other.to_string())),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            CompressorKind::Sz => "sz",
            CompressorKind::Zfp => "zfp",
        }
    }

    /// Whether `bound` belongs to this compressor's family of modes.
    pub fn supports(self, bound: &ErrorBound) -> bool {
        matches!(
            (self, bound),
            (
                CompressorKind::Sz,
                ErrorBound::Abs(_) | ErrorBound::PwRel(_) | ErrorBound::Psnr(_)
            ) | (
                CompressorKind::Zfp,
                ErrorBound::Accuracy(_) | ErrorBound::Rate(_) | ErrorBound::Precision(_)
            )
        )
    }
}

impl fmt::Display for CompressorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An error-bounding mode together with its bound value.
///
/// The mode decides both how the compressor is configured and how the
/// reconstruction is judged afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "mode", content = "bound")]
pub enum ErrorBound {
    /// Absolute bound: `|a - b| <= e`.
    #[serde(rename = "ABS")]
    Abs(f64),
    /// Point-wise relative bound: `|a - b| <= |e * a|`.
    #[serde(rename = "PW_REL")]
    PwRel(f64),
    /// Target PSNR in decibels. No per-element bound.
    #[serde(rename = "PSNR")]
    Psnr(f64),
    /// Absolute tolerance, zfp style.
    #[serde(rename = "Accuracy")]
    Accuracy(f64),
    /// Fixed bits per value. No intrinsic per-element bound.
    #[serde(rename = "Rate")]
    Rate(f64),
    /// Fixed number of retained bits per value. No per-element bound.
    #[serde(rename = "Precision")]
    Precision(u32),
}

impl ErrorBound {
    pub const NAMES: [&'static str; 6] = ["ABS", "PW_REL", "PSNR", "Accuracy", "Rate", "Precision"];

    /// Builds a mode from its name and the numeric bound given on the command line.
    pub fn parse(mode: &str, value: f64) -> Result<Self, ConfigError> {
        Ok(match mode {
            "ABS" => ErrorBound::Abs(value),
            "PW_REL" => ErrorBound::PwRel(value),
            "PSNR" => ErrorBound::Psnr(value),
            "Accuracy" => ErrorBound::Accuracy(value),
            "Rate" => ErrorBound::Rate(value),
            // precision is an unsigned bit count; fractional or negative input truncates
            "Precision" => ErrorBound::Precision(value.max(0.0) as u32),
            other => return Err(ConfigError::UnknownMode(other.to_string())),
        })
    }

    pub const fn name(&self) -> &'static str {
        match self {
            ErrorBound::Abs(_) => "ABS",
            ErrorBound::PwRel(_) => "PW_REL",
            ErrorBound::Psnr(_) => "PSNR",
            ErrorBound::Accuracy(_) => "Accuracy",
            ErrorBound::Rate(_) => "Rate",
            ErrorBound::Precision(_) => "Precision",
        }
    }

    pub fn value(&self) -> f64 {
        match *self {
            ErrorBound::Abs(v)
            | ErrorBound::PwRel(v)
            | ErrorBound::Psnr(v)
            | ErrorBound::Accuracy(v)
            | ErrorBound::Rate(v) => v,
            ErrorBound::Precision(p) => p as f64,
        }
    }

    /// Stable one-byte tag used in compressed stream headers.
    pub(crate) const fn tag(&self) -> u8 {
        match self {
            ErrorBound::Abs(_) => 0,
            ErrorBound::PwRel(_) => 1,
            ErrorBound::Psnr(_) => 2,
            ErrorBound::Accuracy(_) => 3,
            ErrorBound::Rate(_) => 4,
            ErrorBound::Precision(_) => 5,
        }
    }
}

impl fmt::Display for ErrorBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:.12}", self.name(), self.value())
    }
}
