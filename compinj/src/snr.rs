//! Signal-to-noise ratio over an axis-aligned window.
//!
//! Tensors are viewed as three axes `[nx, ny, nz]` (see [`Shape::folded3`]),
//! with `x` varying fastest: linear index `i = x + nx * (y + ny * z)`.
//! Means and standard deviations use two passes over the window; a single
//! pass sum-of-squares would cancel catastrophically on offset data.

use std::ops::Range;

use serde::Serialize;
use thiserror::Error;

use crate::{error::ConfigError, tensor::Shape};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SnrError {
    #[error("window x {x:?}, y {y:?}, z {z:?} contains no elements")]
    EmptyWindow {
        x: Range<usize>,
        y: Range<usize>,
        z: Range<usize>,
    },

    #[error("original has {original} samples, reconstruction {reconstructed}, shape {shape}")]
    LengthMismatch {
        original: usize,
        reconstructed: usize,
        shape: usize,
    },
}

/// Half-open ranges per axis. `None` means the full extent of that axis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnrWindow {
    pub x: Option<Range<usize>>,
    pub y: Option<Range<usize>>,
    pub z: Option<Range<usize>>,
}

impl SnrWindow {
    /// The whole tensor.
    pub fn full() -> Self {
        SnrWindow::default()
    }

    /// Builds a window from up to six bounds:
    /// `xStart, xEnd, yStart, yEnd, zStart, zEnd`.
    ///
    /// Missing starts default to 0 and missing ends to the axis extent.
    pub fn from_bounds(bounds: &[usize]) -> Result<Self, ConfigError> {
        if bounds.len() > 6 {
            return Err(ConfigError::InvalidWindow(format!(
                "{} bounds given, at most 6 accepted",
                bounds.len()
            )));
        }
        let axis = |i: usize| match (bounds.get(2 * i), bounds.get(2 * i + 1)) {
            (Some(&start), Some(&end)) => Some(start..end),
            (Some(&start), None) => Some(start..usize::MAX),
            _ => None,
        };
        Ok(SnrWindow {
            x: axis(0),
            y: axis(1),
            z: axis(2),
        })
    }

    /// Parses bounds separated by whitespace and/or commas, e.g. `"0 10 0 10 5 6"`.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let bounds = text
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<usize>()
                    .map_err(|_| ConfigError::InvalidWindow(format!("`{s}` is not an index")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        SnrWindow::from_bounds(&bounds)
    }

    /// Concrete ranges clamped to `extent`. Ends are clamped to the extent and
    /// starts to the ends, so the result may be empty but is always in bounds.
    pub fn clamp(&self, extent: [usize; 3]) -> [Range<usize>; 3] {
        let clamp_axis = |range: &Option<Range<usize>>, n: usize| {
            let range = range.clone().unwrap_or(0..n);
            let end = range.end.min(n);
            range.start.min(end)..end
        };
        [
            clamp_axis(&self.x, extent[0]),
            clamp_axis(&self.y, extent[1]),
            clamp_axis(&self.z, extent[2]),
        ]
    }
}

/// Windowed statistics of the raw, reconstructed and absolute error signals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnrReport {
    pub x: Range<usize>,
    pub y: Range<usize>,
    pub z: Range<usize>,
    pub count: usize,
    pub mean_raw: f64,
    pub mean_reconstructed: f64,
    pub mean_error: f64,
    pub stdev_raw: f64,
    pub stdev_reconstructed: f64,
    pub stdev_error: f64,
    /// `20 log10(stdev_raw / stdev_error)`; infinite when the error is constant.
    pub snr_db: f64,
}

/// Calls `f(a, b)` for every pair inside the window, in increasing linear
/// index order.
#[inline(always)]
fn for_each_in_window(
    original: &[f32],
    reconstructed: &[f32],
    nx: usize,
    ny: usize,
    [x, y, z]: &[Range<usize>; 3],
    mut f: impl FnMut(f64, f64),
) {
    for k in z.clone() {
        for j in y.clone() {
            let row = nx * (j + ny * k);
            let a = &original[row + x.start..row + x.end];
            let b = &reconstructed[row + x.start..row + x.end];
            for (&a, &b) in a.iter().zip(b) {
                f(a as f64, b as f64);
            }
        }
    }
}

pub fn windowed_snr(
    original: &[f32],
    reconstructed: &[f32],
    shape: &Shape,
    window: &SnrWindow,
) -> Result<SnrReport, SnrError> {
    if original.len() != shape.len() || reconstructed.len() != shape.len() {
        return Err(SnrError::LengthMismatch {
            original: original.len(),
            reconstructed: reconstructed.len(),
            shape: shape.len(),
        });
    }

    let [nx, ny, nz] = shape.folded3();
    let ranges = window.clamp([nx, ny, nz]);
    let count = ranges.iter().map(|r| r.len()).product::<usize>();
    if count == 0 {
        let [x, y, z] = ranges;
        return Err(SnrError::EmptyWindow { x, y, z });
    }
    let n = count as f64;

    // pass 1: means
    let (mut sum_raw, mut sum_rec, mut sum_err) = (0.0, 0.0, 0.0);
    for_each_in_window(original, reconstructed, nx, ny, &ranges, |a, b| {
        sum_raw += a;
        sum_rec += b;
        sum_err += (a - b).abs();
    });
    let mean_raw = sum_raw / n;
    let mean_reconstructed = sum_rec / n;
    let mean_error = sum_err / n;

    // pass 2: deviations from the means
    let (mut var_raw, mut var_rec, mut var_err) = (0.0, 0.0, 0.0);
    for_each_in_window(original, reconstructed, nx, ny, &ranges, |a, b| {
        let e = (a - b).abs() - mean_error;
        let r = a - mean_raw;
        let s = b - mean_reconstructed;
        var_raw += r * r;
        var_rec += s * s;
        var_err += e * e;
    });
    let stdev_raw = (var_raw / n).sqrt();
    let stdev_reconstructed = (var_rec / n).sqrt();
    let stdev_error = (var_err / n).sqrt();

    let snr_db = 20.0 * (stdev_raw / stdev_error).log10();

    let [x, y, z] = ranges;
    tracing::debug!(?x, ?y, ?z, count, snr_db, "windowed snr");
    Ok(SnrReport {
        x,
        y,
        z,
        count,
        mean_raw,
        mean_reconstructed,
        mean_error,
        stdev_raw,
        stdev_reconstructed,
        stdev_error,
        snr_db,
    })
}
