//! Fixed-accuracy, fixed-rate and fixed-precision reference engine.
//!
//! ```text
//! Accuracy:  header | tol f64 | codes...          (varints, escape = 0)
//! Rate:      header | bits u8 | min f32 | max f32 | packed codes
//! Precision: header | bits u8 | packed leading bits of each f32
//! ```
//!
//! None of the modes predict across values, so a flipped payload bit damages
//! one value (or, for varints, resynchronises at the next code boundary).

use crate::{
    error::EngineError,
    mode::{CompressorKind, ErrorBound},
    tensor::{Shape, Tensor},
};

use super::{
    stream::{
        packed_len, read_header, unzigzag, write_header, write_varint, zigzag, BitReader,
        BitWriter, ByteReader,
    },
    Compressor, EngineMetrics,
};

const NAME: &str = "zfp";
const MAGIC: [u8; 4] = *b"ZFR\x01";

const QUANT_RADIUS: f64 = (1_u64 << 40) as f64;

const ESCAPE: u64 = 0;

#[derive(Debug, Clone)]
pub struct ZfpCompressor {
    bound: ErrorBound,
    metrics: EngineMetrics,
}

impl ZfpCompressor {
    pub fn new(bound: ErrorBound) -> Result<Self, EngineError> {
        match bound {
            ErrorBound::Accuracy(tol) if !(tol.is_finite() && tol >= 0.0) => {
                Err(EngineError::invalid_option(
                    NAME,
                    format!("accuracy must be finite and non-negative, got {tol}"),
                ))
            }
            ErrorBound::Rate(rate) if !(1.0..=32.0).contains(&rate.round()) => {
                Err(EngineError::invalid_option(
                    NAME,
                    format!("rate must be between 1 and 32 bits per value, got {rate}"),
                ))
            }
            ErrorBound::Precision(p) if !(1..=32).contains(&p) => Err(EngineError::invalid_option(
                NAME,
                format!("precision must be between 1 and 32 bits, got {p}"),
            )),
            ErrorBound::Accuracy(_) | ErrorBound::Rate(_) | ErrorBound::Precision(_) => {
                Ok(ZfpCompressor {
                    bound,
                    metrics: EngineMetrics::default(),
                })
            }
            other => Err(EngineError::invalid_option(
                NAME,
                format!("unsupported error bounding mode {}", other.name()),
            )),
        }
    }
}

impl Compressor for ZfpCompressor {
    fn kind(&self) -> CompressorKind {
        CompressorKind::Zfp
    }

    fn bound(&self) -> ErrorBound {
        self.bound
    }

    fn compress(&mut self, tensor: &Tensor) -> Result<Vec<u8>, EngineError> {
        let mut out = Vec::with_capacity(tensor.byte_len() / 2 + 32);
        write_header(&mut out, &MAGIC, self.bound.tag(), tensor.shape());
        let out = match self.bound {
            ErrorBound::Accuracy(tol) => {
                out.extend_from_slice(&tol.to_le_bytes());
                encode_accuracy(tensor.data(), tol, &mut out);
                out
            }
            ErrorBound::Rate(rate) => encode_rate(tensor.data(), rate.round() as u32, out),
            ErrorBound::Precision(p) => encode_precision(tensor.data(), p, out),
            _ => unreachable!("mode checked on construction"),
        };
        self.metrics = EngineMetrics::new(tensor.byte_len(), out.len());
        Ok(out)
    }

    fn decompress(&self, compressed: &[u8], shape: &Shape) -> Result<Vec<f32>, EngineError> {
        let mut reader = ByteReader::new(compressed, NAME);
        read_header(&mut reader, NAME, &MAGIC, self.bound.tag(), shape)?;
        let n = shape.len();
        match self.bound {
            ErrorBound::Accuracy(_) => {
                let tol = reader.read_f64()?;
                let values = decode_accuracy(&mut reader, n, tol)?;
                reader.finish()?;
                Ok(values)
            }
            ErrorBound::Rate(_) => {
                let bits = read_width(&mut reader)?;
                let min = reader.read_f32()? as f64;
                let max = reader.read_f32()? as f64;
                let levels = max_code(bits) as f64;
                let codes = read_packed(reader, n, bits)?;
                Ok(codes
                    .into_iter()
                    .map(|q| (min + (q as f64 / levels) * (max - min)) as f32)
                    .collect())
            }
            ErrorBound::Precision(_) => {
                let bits = read_width(&mut reader)?;
                let codes = read_packed(reader, n, bits)?;
                Ok(codes
                    .into_iter()
                    .map(|q| f32::from_bits(q << (32 - bits)))
                    .collect())
            }
            _ => unreachable!("mode checked on construction"),
        }
    }

    fn metrics(&self) -> EngineMetrics {
        self.metrics
    }
}

fn encode_accuracy(data: &[f32], tol: f64, out: &mut Vec<u8>) {
    let step = 2.0 * tol;
    for &a in data {
        let exact = a as f64;
        if tol > 0.0 && a.is_finite() {
            let q = (exact / step).round();
            if q.abs() < QUANT_RADIUS {
                let recon = (step * q) as f32;
                if (recon as f64 - exact).abs() <= tol {
                    write_varint(out, zigzag(q as i64) + 1);
                    continue;
                }
            }
        }
        write_varint(out, ESCAPE);
        out.extend_from_slice(&a.to_le_bytes());
    }
}

fn decode_accuracy(reader: &mut ByteReader<'_>, n: usize, tol: f64) -> Result<Vec<f32>, EngineError> {
    let step = 2.0 * tol;
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        let code = reader.read_varint()?;
        let value = if code == ESCAPE {
            reader.read_f32()?
        } else {
            (step * unzigzag(code - 1) as f64) as f32
        };
        values.push(value);
    }
    Ok(values)
}

#[inline(always)]
fn max_code(bits: u32) -> u32 {
    if bits == 32 {
        u32::MAX
    } else {
        (1 << bits) - 1
    }
}

fn encode_rate(data: &[f32], bits: u32, mut out: Vec<u8>) -> Vec<u8> {
    let (min, max) = data
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let (min, max) = if min <= max { (min, max) } else { (0.0, 0.0) };

    out.push(bits as u8);
    out.extend_from_slice(&min.to_le_bytes());
    out.extend_from_slice(&max.to_le_bytes());

    let levels = max_code(bits) as f64;
    let span = max as f64 - min as f64;
    let mut writer = BitWriter::new(out);
    for &a in data {
        let q = if span > 0.0 {
            // NaN saturates to 0 in the cast, infinities to the ends
            (((a as f64 - min as f64) / span) * levels)
                .round()
                .clamp(0.0, levels) as u32
        } else {
            0
        };
        writer.write(q, bits);
    }
    writer.finish()
}

fn encode_precision(data: &[f32], bits: u32, mut out: Vec<u8>) -> Vec<u8> {
    out.push(bits as u8);
    let mut writer = BitWriter::new(out);
    for &a in data {
        writer.write(a.to_bits() >> (32 - bits), bits);
    }
    writer.finish()
}

fn read_width(reader: &mut ByteReader<'_>) -> Result<u32, EngineError> {
    let offset = reader.position();
    let bits = reader.read_u8()? as u32;
    if !(1..=32).contains(&bits) {
        return Err(EngineError::corrupt_at(
            NAME,
            format!("code width {bits}"),
            offset,
        ));
    }
    Ok(bits)
}

/// Reads exactly `n` packed codes; the payload must end with the last code.
fn read_packed(reader: ByteReader<'_>, n: usize, bits: u32) -> Result<Vec<u32>, EngineError> {
    let offset = reader.position();
    let payload = reader.remaining();
    let expected = packed_len(n, bits);
    if payload.len() != expected {
        return Err(EngineError::corrupt_at(
            NAME,
            format!(
                "payload of {} bytes, {n} codes of {bits} bits need {expected}",
                payload.len()
            ),
            offset,
        ));
    }
    let mut bit_reader = BitReader::new(payload);
    (0..n)
        .map(|_| {
            bit_reader
                .read(bits)
                .ok_or_else(|| EngineError::corrupt_at(NAME, "truncated code", offset))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Tensor {
        Tensor::from_vec((0..n).map(|i| i as f32 * 0.37 - 40.0).collect()).unwrap()
    }

    fn round_trip(bound: ErrorBound, tensor: &Tensor) -> Vec<f32> {
        let mut zfp = ZfpCompressor::new(bound).unwrap();
        let bytes = zfp.compress(tensor).unwrap();
        zfp.decompress(&bytes, tensor.shape()).unwrap()
    }

    #[test]
    fn accuracy_respects_tolerance() {
        let tensor = ramp(300);
        let out = round_trip(ErrorBound::Accuracy(0.01), &tensor);
        for (a, b) in tensor.data().iter().zip(&out) {
            assert!((*a as f64 - *b as f64).abs() <= 0.01);
        }
    }

    #[test]
    fn rate_quantizes_onto_range() {
        let tensor = ramp(256);
        let out = round_trip(ErrorBound::Rate(8.0), &tensor);
        let span = 255.0 * 0.37;
        let step = span / 255.0;
        for (a, b) in tensor.data().iter().zip(&out) {
            assert!((*a as f64 - *b as f64).abs() <= step / 2.0 + 1e-4);
        }
        let mut zfp = ZfpCompressor::new(ErrorBound::Rate(8.0)).unwrap();
        let bytes = zfp.compress(&tensor).unwrap();
        // header: 4 magic + 1 tag + 1 ndims + 8 dim, then 1 + 4 + 4, then one byte per value
        assert_eq!(bytes.len(), 14 + 9 + 256);
    }

    #[test]
    fn full_precision_is_lossless() {
        let tensor = Tensor::from_vec(vec![1.0, -3.25, f32::MIN_POSITIVE, 7e30]).unwrap();
        let out = round_trip(ErrorBound::Precision(32), &tensor);
        assert_eq!(out, tensor.data());
    }

    #[test]
    fn reduced_precision_truncates_mantissa() {
        let tensor = Tensor::from_vec(vec![1.0 + f32::EPSILON, -2.5]).unwrap();
        let out = round_trip(ErrorBound::Precision(12), &tensor);
        assert_eq!(out, vec![1.0, -2.5]);
    }

    #[test]
    fn rejects_bad_options() {
        assert!(ZfpCompressor::new(ErrorBound::Rate(0.2)).is_err());
        assert!(ZfpCompressor::new(ErrorBound::Rate(40.0)).is_err());
        assert!(ZfpCompressor::new(ErrorBound::Precision(0)).is_err());
        assert!(ZfpCompressor::new(ErrorBound::Accuracy(-0.5)).is_err());
        assert!(ZfpCompressor::new(ErrorBound::Abs(0.5)).is_err());
    }

    #[test]
    fn corrupted_width_is_reported() {
        let tensor = ramp(16);
        let mut zfp = ZfpCompressor::new(ErrorBound::Precision(16)).unwrap();
        let mut bytes = zfp.compress(&tensor).unwrap();
        // width byte sits right after the 14 byte header
        bytes[14] = 0;
        assert!(matches!(
            zfp.decompress(&bytes, tensor.shape()),
            Err(EngineError::Corrupt { .. })
        ));
    }
}
