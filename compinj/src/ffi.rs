//! C ABI for the injector and the metrics engines, for drivers that bring
//! their own compressor.
//!
//! Mode tags follow the compressed stream headers:
//! `0 ABS, 1 PW_REL, 2 PSNR, 3 Accuracy, 4 Rate, 5 Precision`.

use crate::{
    error::ConfigError,
    inject::{inject, InjectionSite},
    metrics::{Evaluation, Evaluator},
    mode::ErrorBound,
    snr::{windowed_snr, SnrWindow},
    tensor::Shape,
};

/// Returned in `status` when the call succeeded.
pub const STATUS_OK: i32 = 0;
/// Returned in `status` when the inputs were rejected.
pub const STATUS_INVALID: i32 = 1;

/// An auxiliary ffi type for returning metrics.
///
/// # SAFETY
/// If the fields of this type ever change review the extern "C" functions in this module for safety.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct MetricsResult {
    pub status: i32,
    /// `-1` when the mode has no per-element bound.
    pub violations: i64,
    pub max_abs_diff: f64,
    pub rmse: f64,
    pub psnr: f64,
}

/// An auxiliary ffi type for returning windowed SNR.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct SnrResult {
    pub status: i32,
    pub count: u64,
    pub stdev_raw: f64,
    pub stdev_error: f64,
    pub snr_db: f64,
}

fn bound_from_tag(mode: u32, value: f64) -> Option<ErrorBound> {
    Some(match mode {
        0 => ErrorBound::Abs(value),
        1 => ErrorBound::PwRel(value),
        2 => ErrorBound::Psnr(value),
        3 => ErrorBound::Accuracy(value),
        4 => ErrorBound::Rate(value),
        5 => ErrorBound::Precision(value.max(0.0) as u32),
        _ => return None,
    })
}

/// Flips bit `bit_offset` of byte `byte_offset` in the `len` byte buffer at `buffer`.
///
/// Returns [`STATUS_OK`], or the configuration exit code when either offset
/// is out of range, in which case the buffer is untouched.
///
/// # Safety
/// `buffer` must point to `len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn compinj_flip_bit(
    buffer: *mut u8,
    len: u64,
    byte_offset: u64,
    bit_offset: u32,
) -> i32 {
    let site = match InjectionSite::new(byte_offset as usize, bit_offset, true) {
        Ok(site) => site,
        Err(e) => return e.exit_code(),
    };
    if byte_offset >= len {
        return ConfigError::ByteOffsetOutOfRange {
            offset: byte_offset as usize,
            len: len as usize,
        }
        .exit_code();
    }
    let buffer: &mut [u8] = std::slice::from_raw_parts_mut(buffer, len as usize);
    inject(buffer, &site);
    STATUS_OK
}

/// Compares `len` original samples against their reconstruction under the
/// given mode. A negative `reference_bound` means none.
///
/// # Safety
/// `original` and `reconstructed` must each point to `len` readable `f32`s.
#[no_mangle]
pub unsafe extern "C" fn compinj_evaluate(
    original: *const f32,
    reconstructed: *const f32,
    len: u64,
    mode: u32,
    bound: f64,
    reference_bound: f64,
) -> MetricsResult {
    let invalid = MetricsResult {
        status: STATUS_INVALID,
        violations: -1,
        ..MetricsResult::default()
    };
    let Some(bound) = bound_from_tag(mode, bound) else {
        return invalid;
    };
    let original: &[f32] = std::slice::from_raw_parts(original, len as usize);
    let reconstructed: &[f32] = std::slice::from_raw_parts(reconstructed, len as usize);

    let evaluator = Evaluator::new(bound).with_reference_bound(Some(reference_bound));
    match evaluator.evaluate(original, reconstructed) {
        Ok(Evaluation::Complete(m)) => MetricsResult {
            status: STATUS_OK,
            violations: m.violation_count(),
            max_abs_diff: m.max_abs_diff,
            rmse: m.rmse,
            psnr: m.psnr,
        },
        Ok(Evaluation::FirstViolation(_)) | Err(_) => invalid,
    }
}

/// SNR over a window of a tensor with `ndims` dimensions.
///
/// `window` holds `nwindow` (at most six) bounds
/// `xStart, xEnd, yStart, yEnd, zStart, zEnd`; it may be null when `nwindow` is 0.
///
/// # Safety
/// `original` and `reconstructed` must each hold the product of `dims`
/// samples, `dims` must point to `ndims` values and `window` to `nwindow`.
#[no_mangle]
pub unsafe extern "C" fn compinj_windowed_snr(
    original: *const f32,
    reconstructed: *const f32,
    dims: *const u64,
    ndims: u64,
    window: *const u64,
    nwindow: u64,
) -> SnrResult {
    let invalid = SnrResult {
        status: STATUS_INVALID,
        ..SnrResult::default()
    };
    let dims: Vec<usize> = std::slice::from_raw_parts(dims, ndims as usize)
        .iter()
        .map(|&d| d as usize)
        .collect();
    let bounds: Vec<usize> = if nwindow == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(window, nwindow as usize)
            .iter()
            .map(|&b| b as usize)
            .collect()
    };
    let (Ok(shape), Ok(window)) = (Shape::new(&dims), SnrWindow::from_bounds(&bounds)) else {
        return invalid;
    };

    let original: &[f32] = std::slice::from_raw_parts(original, shape.len());
    let reconstructed: &[f32] = std::slice::from_raw_parts(reconstructed, shape.len());
    match windowed_snr(original, reconstructed, &shape, &window) {
        Ok(report) => SnrResult {
            status: STATUS_OK,
            count: report.count as u64,
            stdev_raw: report.stdev_raw,
            stdev_error: report.stdev_error,
            snr_db: report.snr_db,
        },
        Err(_) => invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flip_through_c_abi() {
        let mut buffer = [0u8; 4];
        let status = unsafe { compinj_flip_bit(buffer.as_mut_ptr(), 4, 2, 7) };
        assert_eq!(status, STATUS_OK);
        assert_eq!(buffer, [0, 0, 0x80, 0]);

        let status = unsafe { compinj_flip_bit(buffer.as_mut_ptr(), 4, 4, 0) };
        assert_eq!(status, 1);
        let status = unsafe { compinj_flip_bit(buffer.as_mut_ptr(), 4, 0, 8) };
        assert_eq!(status, 1);
        assert_eq!(buffer, [0, 0, 0x80, 0]);
    }

    #[test]
    fn evaluate_through_c_abi() {
        let original = [1.0_f32, 2.0, 3.0, 4.0];
        let reconstructed = [1.0_f32, 2.6, 3.0, 4.0];
        let result = unsafe {
            compinj_evaluate(original.as_ptr(), reconstructed.as_ptr(), 4, 0, 0.5, -1.0)
        };
        assert_eq!(result.status, STATUS_OK);
        assert_eq!(result.violations, 1);
        assert!((result.max_abs_diff - 0.6).abs() < 1e-6);

        let result = unsafe {
            compinj_evaluate(original.as_ptr(), reconstructed.as_ptr(), 4, 9, 0.5, -1.0)
        };
        assert_eq!(result.status, STATUS_INVALID);
    }

    #[test]
    fn snr_through_c_abi() {
        let original = [0.0_f32, 2.0, 0.0, 2.0];
        let reconstructed = [0.0_f32, 2.0, 0.5, 2.0];
        let dims = [4_u64];
        let result = unsafe {
            compinj_windowed_snr(
                original.as_ptr(),
                reconstructed.as_ptr(),
                dims.as_ptr(),
                1,
                std::ptr::null(),
                0,
            )
        };
        assert_eq!(result.status, STATUS_OK);
        assert_eq!(result.count, 4);
        assert_eq!(result.stdev_raw, 1.0);
    }
}
