//! Flat `f32` tensors and their raw little-endian file layout.

use std::{
    fs::File,
    io::{BufWriter, Read, Write},
    path::Path,
};

use serde::Serialize;

use crate::error::{ConfigError, TensorError};

/// Maximum number of dimensions accepted on input.
pub const MAX_DIMS: usize = 5;

/// Dimension sizes, fastest-varying axis first.
///
/// Zero entries are accepted on input and ignored, so `[100, 500, 500, 0, 0]`
/// and `[100, 500, 500]` describe the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Result<Shape, ConfigError> {
        if dims.len() > MAX_DIMS {
            return Err(ConfigError::InvalidDims(format!(
                "{} dimensions given, at most {MAX_DIMS} supported",
                dims.len()
            )));
        }
        let dims: Vec<usize> = dims.iter().copied().filter(|&d| d != 0).collect();
        if dims.is_empty() {
            return Err(ConfigError::InvalidDims(
                "at least one non-zero dimension is required".into(),
            ));
        }
        if dims.iter().try_fold(1_usize, |acc, &d| acc.checked_mul(d)).is_none() {
            return Err(ConfigError::InvalidDims("element count overflows".into()));
        }
        Ok(Shape { dims })
    }

    /// Parses sizes separated by whitespace and/or commas, e.g. `"100 500 500"`.
    pub fn parse(text: &str) -> Result<Shape, ConfigError> {
        let dims = text
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<usize>()
                    .map_err(|_| ConfigError::InvalidDims(format!("`{s}` is not a size")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Shape::new(&dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of elements, the product of the dimensions.
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The shape seen as three axes `[nx, ny, nz]`.
    ///
    /// Missing axes have extent 1 and every axis past the second is folded
    /// into `nz`.
    pub fn folded3(&self) -> [usize; 3] {
        let nx = self.dims[0];
        let ny = self.dims.get(1).copied().unwrap_or(1);
        let nz = self.dims.iter().skip(2).product();
        [nx, ny, nz]
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for d in &self.dims {
            if !first {
                f.write_str(" x ")?;
            }
            write!(f, "{d}")?;
            first = false;
        }
        Ok(())
    }
}

/// Samples plus the shape they are laid out in.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Shape,
}

impl Tensor {
    pub fn new(data: Vec<f32>, shape: Shape) -> Result<Tensor, TensorError> {
        if data.len() != shape.len() {
            return Err(TensorError::LengthMismatch {
                expected: shape.len(),
                found: data.len(),
            });
        }
        Ok(Tensor { data, shape })
    }

    /// A one dimensional tensor over `data`.
    pub fn from_vec(data: Vec<f32>) -> Result<Tensor, TensorError> {
        let shape = Shape::new(&[data.len()]).map_err(|_| TensorError::LengthMismatch {
            expected: 1,
            found: 0,
        })?;
        Tensor::new(data, shape)
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the samples in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len() * core::mem::size_of::<f32>()
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Reads `shape.len()` little-endian `f32`s. Bytes past that are ignored.
    pub fn read_raw<R: Read>(mut reader: R, shape: Shape) -> Result<Tensor, TensorError> {
        let expected = shape.len() * core::mem::size_of::<f32>();
        let mut bytes = Vec::with_capacity(expected);
        reader
            .by_ref()
            .take(expected as u64)
            .read_to_end(&mut bytes)?;
        if bytes.len() < expected {
            return Err(TensorError::ShortRead {
                expected,
                found: bytes.len(),
            });
        }
        Tensor::new(deserialize_slice(&bytes), shape)
    }

    pub fn load_raw(path: impl AsRef<Path>, shape: Shape) -> Result<Tensor, TensorError> {
        let file = File::open(path.as_ref())?;
        Tensor::read_raw(file, shape)
    }

    pub fn write_raw<W: Write>(&self, writer: W) -> Result<(), TensorError> {
        let mut writer = BufWriter::new(writer);
        for value in &self.data {
            writer.write_all(&value.to_le_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn store_raw(&self, path: impl AsRef<Path>) -> Result<(), TensorError> {
        self.write_raw(File::create(path.as_ref())?)
    }
}

fn deserialize_slice(slice: &[u8]) -> Vec<f32> {
    slice
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_dims_are_ignored() {
        let shape = Shape::new(&[100, 500, 500, 0, 0]).unwrap();
        assert_eq!(shape.dims(), &[100, 500, 500]);
        assert_eq!(shape.len(), 25_000_000);
    }

    #[test]
    fn too_many_dims() {
        assert!(Shape::new(&[1, 2, 3, 4, 5, 6]).is_err());
        assert!(Shape::new(&[0, 0]).is_err());
        assert!(Shape::new(&[]).is_err());
    }

    #[test]
    fn parse_accepts_spaces_and_commas() {
        assert_eq!(Shape::parse("4 5,6").unwrap().dims(), &[4, 5, 6]);
        assert_eq!(Shape::parse(" 7 ").unwrap().dims(), &[7]);
        assert!(Shape::parse("4 x 5").is_err());
    }

    #[test]
    fn folding() {
        assert_eq!(Shape::new(&[8]).unwrap().folded3(), [8, 1, 1]);
        assert_eq!(Shape::new(&[8, 4]).unwrap().folded3(), [8, 4, 1]);
        assert_eq!(Shape::new(&[8, 4, 2, 3]).unwrap().folded3(), [8, 4, 6]);
    }

    #[test]
    fn raw_layout_is_little_endian() {
        let bytes: Vec<u8> = [1.5_f32, -2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let tensor = Tensor::read_raw(&bytes[..], Shape::new(&[2]).unwrap()).unwrap();
        assert_eq!(tensor.data(), &[1.5, -2.0]);

        let mut out = Vec::new();
        tensor.write_raw(&mut out).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn short_read_is_an_error() {
        let bytes = [0_u8; 7];
        let err = Tensor::read_raw(&bytes[..], Shape::new(&[2]).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            TensorError::ShortRead {
                expected: 8,
                found: 7
            }
        ));
    }
}
