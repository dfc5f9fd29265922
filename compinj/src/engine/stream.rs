//! Byte and bit level primitives shared by the reference engines.
//!
//! Stream layout common to both engines:
//!
//! ```text
//! magic[4] | mode tag u8 | ndims u8 | dims u64 LE * ndims | engine payload
//! ```

use crate::{error::EngineError, tensor::Shape, tensor::MAX_DIMS};

/// Writes the common header.
pub(crate) fn write_header(out: &mut Vec<u8>, magic: &[u8; 4], tag: u8, shape: &Shape) {
    out.extend_from_slice(magic);
    out.push(tag);
    out.push(shape.dims().len() as u8);
    for &d in shape.dims() {
        out.extend_from_slice(&(d as u64).to_le_bytes());
    }
}

/// Reads and validates the common header against the configured mode and
/// the shape the caller expects back.
pub(crate) fn read_header(
    reader: &mut ByteReader<'_>,
    engine: &'static str,
    magic: &[u8; 4],
    tag: u8,
    shape: &Shape,
) -> Result<(), EngineError> {
    let found = reader.take(4)?;
    if found != magic {
        return Err(EngineError::corrupt_at(engine, "bad magic", 0));
    }
    let found_tag = reader.read_u8()?;
    if found_tag != tag {
        return Err(EngineError::corrupt_at(
            engine,
            format!("mode tag {found_tag}, configured {tag}"),
            4,
        ));
    }
    let ndims = reader.read_u8()? as usize;
    if ndims == 0 || ndims > MAX_DIMS {
        return Err(EngineError::corrupt_at(
            engine,
            format!("{ndims} dimensions"),
            5,
        ));
    }
    let mut count: u64 = 1;
    for _ in 0..ndims {
        let d = reader.read_u64()?;
        count = count.checked_mul(d).ok_or_else(|| {
            EngineError::corrupt_at(engine, "dimension product overflows", reader.position())
        })?;
    }
    if count != shape.len() as u64 {
        return Err(EngineError::ShapeMismatch {
            engine,
            expected: shape.len(),
            found: count.min(usize::MAX as u64) as usize,
        });
    }
    Ok(())
}

/// Maps signed integers onto unsigned ones so small magnitudes stay small.
#[inline(always)]
pub(crate) const fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline(always)]
pub(crate) const fn unzigzag(u: u64) -> i64 {
    ((u >> 1) as i64) ^ -((u & 1) as i64)
}

/// LEB128.
pub(crate) fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

/// Cursor over a compressed stream. Every read is bounds checked and reports
/// the offset it failed at.
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    engine: &'static str,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8], engine: &'static str) -> Self {
        ByteReader {
            bytes,
            pos: 0,
            engine,
        }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], EngineError> {
        if self.bytes.len() - self.pos < n {
            return Err(EngineError::corrupt_at(
                self.engine,
                format!("unexpected end of stream reading {n} bytes"),
                self.pos,
            ));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, EngineError> {
        Ok(self.take(1)?[0])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], EngineError> {
        let mut array = [0; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64, EngineError> {
        self.read_array().map(u64::from_le_bytes)
    }

    pub(crate) fn read_f64(&mut self) -> Result<f64, EngineError> {
        self.read_array().map(f64::from_le_bytes)
    }

    pub(crate) fn read_f32(&mut self) -> Result<f32, EngineError> {
        self.read_array().map(f32::from_le_bytes)
    }

    pub(crate) fn read_varint(&mut self) -> Result<u64, EngineError> {
        let start = self.pos;
        let mut value: u64 = 0;
        for shift in (0..64).step_by(7) {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(EngineError::corrupt_at(self.engine, "varint too long", start))
    }

    /// Fails if anything is left after the payload.
    pub(crate) fn finish(self) -> Result<(), EngineError> {
        if self.pos != self.bytes.len() {
            return Err(EngineError::corrupt_at(
                self.engine,
                format!("{} trailing bytes", self.bytes.len() - self.pos),
                self.pos,
            ));
        }
        Ok(())
    }
}

/// Packs fixed-width codes LSB first.
pub(crate) struct BitWriter {
    out: Vec<u8>,
    acc: u64,
    filled: u32,
}

impl BitWriter {
    /// Appends to `out`, which may already hold a header.
    pub(crate) fn new(out: Vec<u8>) -> Self {
        BitWriter {
            out,
            acc: 0,
            filled: 0,
        }
    }

    #[inline]
    pub(crate) fn write(&mut self, value: u32, nbits: u32) {
        debug_assert!((1..=32).contains(&nbits));
        let v = (value as u64) & low_mask(nbits);
        self.acc |= v << self.filled;
        self.filled += nbits;
        while self.filled >= 8 {
            self.out.push(self.acc as u8);
            self.acc >>= 8;
            self.filled -= 8;
        }
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        if self.filled > 0 {
            self.out.push(self.acc as u8);
        }
        self.out
    }
}

pub(crate) struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    acc: u64,
    avail: u32,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        BitReader {
            bytes,
            pos: 0,
            acc: 0,
            avail: 0,
        }
    }

    /// `None` once the input runs out.
    #[inline]
    pub(crate) fn read(&mut self, nbits: u32) -> Option<u32> {
        while self.avail < nbits {
            let byte = *self.bytes.get(self.pos)?;
            self.pos += 1;
            self.acc |= (byte as u64) << self.avail;
            self.avail += 8;
        }
        let v = (self.acc & low_mask(nbits)) as u32;
        self.acc >>= nbits;
        self.avail -= nbits;
        Some(v)
    }
}

/// Number of bytes taken by `count` codes of `nbits` each.
pub(crate) fn packed_len(count: usize, nbits: u32) -> usize {
    (count * nbits as usize).div_ceil(8)
}

#[inline(always)]
const fn low_mask(nbits: u32) -> u64 {
    (1_u64 << nbits) - 1
}
