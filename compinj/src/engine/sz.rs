//! Prediction based reference engine for the `ABS`, `PW_REL` and `PSNR` modes.
//!
//! Each value is predicted from the previous reconstructed value and the
//! residual is quantized to a multiple of `2 * eb`. Quantization codes are
//! zigzag LEB128 varints offset by one; code `0` escapes to a verbatim `f32`
//! for values the quantizer cannot represent within the bound.
//!
//! ```text
//! header | eb f64 | codes...
//! ```
//!
//! `PW_REL` runs the same scheme on `ln |a|` with `eb = ln(1 + rel)` and folds
//! the sign into the low bit of each code.
//!
//! Because every value depends on its predecessor, a flipped bit in the code
//! stream propagates to everything after it.

use crate::{
    error::EngineError,
    mode::{CompressorKind, ErrorBound},
    tensor::{Shape, Tensor},
};

use super::{
    stream::{read_header, unzigzag, write_header, write_varint, zigzag, ByteReader},
    Compressor, EngineMetrics,
};

const NAME: &str = "sz";
const MAGIC: [u8; 4] = *b"SZR\x01";

/// Residual codes at or beyond this magnitude are escaped.
const QUANT_RADIUS: f64 = (1_u64 << 30) as f64;

const ESCAPE: u64 = 0;

#[derive(Debug, Clone)]
pub struct SzCompressor {
    bound: ErrorBound,
    metrics: EngineMetrics,
}

impl SzCompressor {
    pub fn new(bound: ErrorBound) -> Result<Self, EngineError> {
        match bound {
            ErrorBound::Abs(e) | ErrorBound::PwRel(e) if !(e.is_finite() && e >= 0.0) => {
                Err(EngineError::invalid_option(
                    NAME,
                    format!("{} bound must be finite and non-negative, got {e}", bound.name()),
                ))
            }
            ErrorBound::Psnr(p) if !p.is_finite() => Err(EngineError::invalid_option(
                NAME,
                format!("PSNR target must be finite, got {p}"),
            )),
            ErrorBound::Abs(_) | ErrorBound::PwRel(_) | ErrorBound::Psnr(_) => Ok(SzCompressor {
                bound,
                metrics: EngineMetrics::default(),
            }),
            other => Err(EngineError::invalid_option(
                NAME,
                format!("unsupported error bounding mode {}", other.name()),
            )),
        }
    }

    /// The absolute (or log-domain) bound actually used for quantization.
    fn effective_bound(&self, data: &[f32]) -> f64 {
        match self.bound {
            ErrorBound::Abs(e) => e,
            ErrorBound::PwRel(rel) => rel.ln_1p(),
            ErrorBound::Psnr(psnr) => {
                // uniform quantization error in [-eb, eb] has rmse eb / sqrt(3)
                let range = value_range(data);
                3_f64.sqrt() * range * 10_f64.powf(-psnr / 20.0)
            }
            _ => unreachable!("mode checked on construction"),
        }
    }
}

impl Compressor for SzCompressor {
    fn kind(&self) -> CompressorKind {
        CompressorKind::Sz
    }

    fn bound(&self) -> ErrorBound {
        self.bound
    }

    fn compress(&mut self, tensor: &Tensor) -> Result<Vec<u8>, EngineError> {
        let data = tensor.data();
        let eb = self.effective_bound(data);
        if !eb.is_finite() {
            return Err(EngineError::Compression {
                engine: NAME,
                message: format!("derived error bound {eb} is not finite"),
            });
        }

        let mut out = Vec::with_capacity(data.len() / 2 + 32);
        write_header(&mut out, &MAGIC, self.bound.tag(), tensor.shape());
        out.extend_from_slice(&eb.to_le_bytes());
        match self.bound {
            ErrorBound::PwRel(rel) => encode_log(data, eb, rel, &mut out),
            _ => encode_linear(data, eb, &mut out),
        }

        self.metrics = EngineMetrics::new(tensor.byte_len(), out.len());
        Ok(out)
    }

    fn decompress(&self, compressed: &[u8], shape: &Shape) -> Result<Vec<f32>, EngineError> {
        let mut reader = ByteReader::new(compressed, NAME);
        read_header(&mut reader, NAME, &MAGIC, self.bound.tag(), shape)?;
        let eb = reader.read_f64()?;
        let values = match self.bound {
            ErrorBound::PwRel(_) => decode_log(&mut reader, shape.len(), eb)?,
            _ => decode_linear(&mut reader, shape.len(), eb)?,
        };
        reader.finish()?;
        Ok(values)
    }

    fn metrics(&self) -> EngineMetrics {
        self.metrics
    }
}

/// `max - min` over the finite samples, zero if there are none.
fn value_range(data: &[f32]) -> f64 {
    let (min, max) = data
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v as f64), hi.max(v as f64))
        });
    if max >= min {
        max - min
    } else {
        0.0
    }
}

fn escape(out: &mut Vec<u8>, a: f32) {
    write_varint(out, ESCAPE);
    out.extend_from_slice(&a.to_le_bytes());
}

fn encode_linear(data: &[f32], eb: f64, out: &mut Vec<u8>) {
    let step = 2.0 * eb;
    let mut pred = 0.0_f64;
    for &a in data {
        let exact = a as f64;
        if eb > 0.0 && a.is_finite() {
            let q = ((exact - pred) / step).round();
            if q.abs() < QUANT_RADIUS {
                let recon = (pred + step * q) as f32;
                if recon.is_finite() && (recon as f64 - exact).abs() <= eb {
                    write_varint(out, zigzag(q as i64) + 1);
                    pred = recon as f64;
                    continue;
                }
            }
        }
        escape(out, a);
        if a.is_finite() {
            pred = exact;
        }
    }
}

fn decode_linear(reader: &mut ByteReader<'_>, n: usize, eb: f64) -> Result<Vec<f32>, EngineError> {
    let step = 2.0 * eb;
    let mut pred = 0.0_f64;
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        let code = reader.read_varint()?;
        let value = if code == ESCAPE {
            let v = reader.read_f32()?;
            if v.is_finite() {
                pred = v as f64;
            }
            v
        } else {
            let q = unzigzag(code - 1) as f64;
            let recon = (pred + step * q) as f32;
            pred = recon as f64;
            recon
        };
        values.push(value);
    }
    Ok(values)
}

fn encode_log(data: &[f32], leb: f64, rel: f64, out: &mut Vec<u8>) {
    let step = 2.0 * leb;
    let mut pred = 0.0_f64;
    for &a in data {
        let exact = a as f64;
        if leb > 0.0 && a.is_finite() && a != 0.0 {
            let l = exact.abs().ln();
            let q = ((l - pred) / step).round();
            if q.abs() < QUANT_RADIUS {
                let lr = pred + step * q;
                let recon = (lr.exp() as f32).copysign(a);
                if recon.is_finite()
                    && recon != 0.0
                    && (recon as f64 - exact).abs() <= (rel * exact).abs()
                {
                    let sign = a.is_sign_negative() as u64;
                    write_varint(out, ((zigzag(q as i64) << 1) | sign) + 1);
                    pred = lr;
                    continue;
                }
            }
        }
        escape(out, a);
        if a.is_finite() && a != 0.0 {
            pred = exact.abs().ln();
        }
    }
}

fn decode_log(reader: &mut ByteReader<'_>, n: usize, leb: f64) -> Result<Vec<f32>, EngineError> {
    let step = 2.0 * leb;
    let mut pred = 0.0_f64;
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        let code = reader.read_varint()?;
        let value = if code == ESCAPE {
            let v = reader.read_f32()?;
            if v.is_finite() && v != 0.0 {
                pred = (v as f64).abs().ln();
            }
            v
        } else {
            let code = code - 1;
            let q = unzigzag(code >> 1) as f64;
            let lr = pred + step * q;
            pred = lr;
            let magnitude = lr.exp() as f32;
            if code & 1 == 1 {
                -magnitude
            } else {
                magnitude
            }
        };
        values.push(value);
    }
    Ok(values)
}
