//! Global accuracy metrics of a reconstruction, judged by the active
//! error-bounding mode.

use serde::Serialize;
use thiserror::Error;

use crate::mode::ErrorBound;

/// PSNR reported for a perfect reconstruction; its negation replaces any
/// non-finite PSNR.
pub const PSNR_CONTROL_VALUE: f64 = 10_000.0;

/// Replacement for a non-finite RMSE or maximum difference.
pub const NON_FINITE_REPLACEMENT: f64 = f32::MAX as f64;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MetricsError {
    #[error("original has {original} samples, reconstruction has {reconstructed}")]
    LengthMismatch {
        original: usize,
        reconstructed: usize,
    },

    #[error("nothing to compare")]
    Empty,
}

/// Result of a completed comparison pass. All floating fields are finite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Metrics {
    /// `None` when the mode has no per-element bound.
    #[serde(serialize_with = "serialize_violations")]
    pub violations: Option<u64>,
    pub max_abs_diff: f64,
    pub rmse: f64,
    pub psnr: f64,
}

impl Metrics {
    /// Violation count with `-1` standing in for "not evaluated".
    pub fn violation_count(&self) -> i64 {
        match self.violations {
            Some(n) => n as i64,
            None => -1,
        }
    }
}

fn serialize_violations<S: serde::Serializer>(v: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i64(v.map_or(-1, |n| n as i64))
}

/// The first element found outside its bound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Violation {
    pub index: usize,
    pub original: f32,
    pub reconstructed: f32,
    pub diff: f64,
    pub bound: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Evaluation {
    Complete(Metrics),
    /// Only produced when stopping at the first violation was requested.
    FirstViolation(Violation),
}

/// Per-element bound policy derived from the mode.
#[derive(Debug, Clone, Copy)]
enum Policy {
    Absolute(f64),
    Relative(f64),
    Unchecked,
}

impl Policy {
    #[inline(always)]
    fn bound_for(&self, a: f64) -> Option<f64> {
        match *self {
            Policy::Absolute(e) => Some(e),
            Policy::Relative(rel) => Some((rel * a).abs()),
            Policy::Unchecked => None,
        }
    }
}

/// Compares an original tensor with its reconstruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluator {
    pub bound: ErrorBound,
    /// Bound used to judge `Rate` reconstructions, which carry none of their own.
    pub reference_bound: Option<f64>,
    /// Return at the first violation instead of finishing the pass.
    pub stop_at_first_violation: bool,
}

impl Evaluator {
    pub fn new(bound: ErrorBound) -> Self {
        Evaluator {
            bound,
            reference_bound: None,
            stop_at_first_violation: false,
        }
    }

    /// Negative values mean "no reference bound", as the `-1` default of the
    /// experiment drivers does.
    pub fn with_reference_bound(mut self, reference_bound: Option<f64>) -> Self {
        self.reference_bound = reference_bound.filter(|b| *b >= 0.0);
        self
    }

    pub fn stop_at_first_violation(mut self, stop: bool) -> Self {
        self.stop_at_first_violation = stop;
        self
    }

    fn policy(&self) -> Policy {
        match self.bound {
            ErrorBound::Abs(e) | ErrorBound::Accuracy(e) => Policy::Absolute(e),
            ErrorBound::PwRel(rel) => Policy::Relative(rel),
            ErrorBound::Rate(_) => match self.reference_bound {
                Some(e) => Policy::Absolute(e),
                None => Policy::Unchecked,
            },
            ErrorBound::Psnr(_) | ErrorBound::Precision(_) => Policy::Unchecked,
        }
    }

    pub fn evaluate(&self, original: &[f32], reconstructed: &[f32]) -> Result<Evaluation, MetricsError> {
        if original.len() != reconstructed.len() {
            return Err(MetricsError::LengthMismatch {
                original: original.len(),
                reconstructed: reconstructed.len(),
            });
        }
        if original.is_empty() {
            return Err(MetricsError::Empty);
        }

        let policy = self.policy();
        let mut violations: Option<u64> = match policy {
            Policy::Unchecked => None,
            _ => Some(0),
        };
        let mut sum_sq = 0.0_f64;
        let mut max_diff = 0.0_f64;
        let mut min_val = original[0] as f64;
        let mut max_val = original[0] as f64;

        for (index, (&a32, &b32)) in original.iter().zip(reconstructed).enumerate() {
            let (a, b) = (a32 as f64, b32 as f64);
            let diff = (a - b).abs();

            sum_sq += diff * diff;
            if a > max_val {
                max_val = a;
            }
            if a < min_val {
                min_val = a;
            }

            if let Some(bound) = policy.bound_for(a) {
                // a NaN diff compares false and is not counted
                if diff > bound {
                    if self.stop_at_first_violation {
                        let violation = Violation {
                            index,
                            original: a32,
                            reconstructed: b32,
                            diff,
                            bound,
                        };
                        tracing::debug!(?violation, "stopping at first violation");
                        return Ok(Evaluation::FirstViolation(violation));
                    }
                    if let Some(n) = violations.as_mut() {
                        *n += 1;
                    }
                }
            }
            if diff > max_diff {
                max_diff = diff;
            }
        }

        // sample (n - 1) normalization
        let n = original.len() as f64;
        let rmse = finite_or((sum_sq / (n - 1.0)).sqrt(), NON_FINITE_REPLACEMENT);
        let psnr = if rmse == 0.0 {
            PSNR_CONTROL_VALUE
        } else {
            finite_or(20.0 * ((max_val - min_val) / rmse).log10(), -PSNR_CONTROL_VALUE)
        };
        let max_abs_diff = finite_or(max_diff, NON_FINITE_REPLACEMENT);

        Ok(Evaluation::Complete(Metrics {
            violations,
            max_abs_diff,
            rmse,
            psnr,
        }))
    }
}

#[inline]
fn finite_or(value: f64, replacement: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        replacement
    }
}

/// Full-pass evaluation without a reference bound.
pub fn evaluate(original: &[f32], reconstructed: &[f32], bound: ErrorBound) -> Result<Metrics, MetricsError> {
    match Evaluator::new(bound).evaluate(original, reconstructed)? {
        Evaluation::Complete(metrics) => Ok(metrics),
        Evaluation::FirstViolation(_) => unreachable!("full pass requested"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn single_violation_scenario() {
        let original = [1.0, 2.0, 3.0, 4.0];
        let reconstructed = [1.0, 2.6, 3.0, 4.0];
        let m = evaluate(&original, &reconstructed, ErrorBound::Abs(0.5)).unwrap();

        assert_eq!(m.violation_count(), 1);
        assert!(close(m.max_abs_diff, 0.6));
        assert!(close(m.rmse, (0.36_f64 / 3.0).sqrt()));
        assert!(close(m.psnr, 20.0 * (3.0 / m.rmse).log10()));
    }

    #[test]
    fn identical_psnr_mode() {
        let data = vec![0.75_f32; 100];
        let m = evaluate(&data, &data, ErrorBound::Psnr(80.0)).unwrap();
        assert_eq!(m.violation_count(), -1);
        assert_eq!(m.rmse, 0.0);
        assert_eq!(m.psnr, PSNR_CONTROL_VALUE);
        assert_eq!(m.max_abs_diff, 0.0);
    }

    #[test]
    fn pointwise_relative_scales_with_value() {
        let original = [100.0, 1.0, -50.0];
        let reconstructed = [100.5, 1.02, -50.4];
        // bounds: 1.0, 0.01, 0.5
        let m = evaluate(&original, &reconstructed, ErrorBound::PwRel(0.01)).unwrap();
        assert_eq!(m.violations, Some(1));
    }

    #[test]
    fn rate_uses_reference_bound_only_when_given() {
        let original = [0.0, 1.0, 2.0];
        let reconstructed = [0.1, 1.0, 2.3];

        let m = evaluate(&original, &reconstructed, ErrorBound::Rate(8.0)).unwrap();
        assert_eq!(m.violations, None);

        let evaluator = Evaluator::new(ErrorBound::Rate(8.0)).with_reference_bound(Some(0.2));
        let Evaluation::Complete(m) = evaluator.evaluate(&original, &reconstructed).unwrap() else {
            panic!("full pass expected");
        };
        assert_eq!(m.violations, Some(1));

        // the drivers pass -1 to mean "absent"
        let evaluator = Evaluator::new(ErrorBound::Rate(8.0)).with_reference_bound(Some(-1.0));
        assert_eq!(evaluator.reference_bound, None);
    }

    #[test]
    fn precision_is_never_checked() {
        let m = evaluate(&[1.0, 2.0], &[5.0, 9.0], ErrorBound::Precision(8)).unwrap();
        assert_eq!(m.violation_count(), -1);
        assert!(close(m.max_abs_diff, 7.0));
    }

    #[test]
    fn stops_at_first_violation() {
        let original = [0.0, 0.0, 0.0, 0.0];
        let reconstructed = [0.0, 0.3, 0.9, 0.0];
        let evaluator = Evaluator::new(ErrorBound::Accuracy(0.1)).stop_at_first_violation(true);
        match evaluator.evaluate(&original, &reconstructed).unwrap() {
            Evaluation::FirstViolation(v) => {
                assert_eq!(v.index, 1);
                assert_eq!(v.bound, 0.1);
                assert_eq!(v.reconstructed, 0.3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_finite_results_are_sanitized() {
        let original = [1.0, 2.0, 3.0];
        let reconstructed = [1.0, f32::NAN, f32::INFINITY];
        let m = evaluate(&original, &reconstructed, ErrorBound::Abs(0.1)).unwrap();

        assert_eq!(m.rmse, NON_FINITE_REPLACEMENT);
        assert_eq!(m.max_abs_diff, NON_FINITE_REPLACEMENT);
        assert!(m.psnr.is_finite());
        // NaN never counts, infinity does
        assert_eq!(m.violations, Some(1));
    }

    #[test]
    fn psnr_of_constant_original_with_error_is_sanitized() {
        // zero range gives log10(0) = -inf
        let m = evaluate(&[2.0, 2.0], &[2.0, 2.5], ErrorBound::Psnr(40.0)).unwrap();
        assert_eq!(m.psnr, -PSNR_CONTROL_VALUE);
    }

    #[test]
    fn length_mismatch() {
        assert_eq!(
            evaluate(&[1.0], &[1.0, 2.0], ErrorBound::Abs(0.0)),
            Err(MetricsError::LengthMismatch {
                original: 1,
                reconstructed: 2
            })
        );
        assert_eq!(evaluate(&[], &[], ErrorBound::Abs(0.0)), Err(MetricsError::Empty));
    }
}
