//! Single-bit corruption of a compressed byte stream.

use serde::Serialize;

use crate::error::ConfigError;

/// Where to flip, and whether to flip at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InjectionSite {
    byte_offset: usize,
    bit_offset: u8,
    active: bool,
}

impl InjectionSite {
    /// Rejects `bit_offset > 7`.
    pub fn new(byte_offset: usize, bit_offset: u32, active: bool) -> Result<Self, ConfigError> {
        if bit_offset > 7 {
            return Err(ConfigError::BitOffsetOutOfRange(bit_offset));
        }
        Ok(InjectionSite {
            byte_offset,
            bit_offset: bit_offset as u8,
            active,
        })
    }

    /// A site that never corrupts anything.
    pub const fn inactive() -> Self {
        InjectionSite {
            byte_offset: 0,
            bit_offset: 0,
            active: false,
        }
    }

    pub const fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub const fn bit_offset(&self) -> u8 {
        self.bit_offset
    }

    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// The XOR mask applied to the target byte.
    #[inline(always)]
    pub const fn mask(&self) -> u8 {
        1 << self.bit_offset
    }
}

/// Flips the bit described by `site` in place. A no-op for inactive sites.
///
/// ## Panics
///
/// If the site is active and `site.byte_offset() >= buffer.len()`. Callers
/// check the offset against the real compressed length first.
#[inline]
pub fn inject(buffer: &mut [u8], site: &InjectionSite) {
    if site.active {
        buffer[site.byte_offset] ^= site.mask();
    }
}

/// Raw form of [`inject`] for callers that already validated `bit_offset`.
///
/// ## Panics
///
/// If `byte_offset` is out of range or `bit_offset > 7`.
#[inline]
pub fn flip_bit(buffer: &mut [u8], byte_offset: usize, bit_offset: u8) {
    assert!(bit_offset < 8, "bit offset {bit_offset} out of range");
    buffer[byte_offset] ^= 1 << bit_offset;
}
