use crate::error::{Result, TensorError};
use std::fmt;

/// A tensor shape, wrapping a vector of dimension sizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Create a new shape from a vector of dimensions.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape { dims }
    }

    /// Create a shape from a slice of dimensions.
    pub fn from_slice(dims: &[usize]) -> Self {
        Shape {
            dims: dims.to_vec(),
        }
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements (product of all dimension sizes).
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Returns the size of dimension `i`.
    ///
    /// # Panics
    /// Panics if `i >= ndim()`.
    pub fn dim(&self, i: usize) -> usize {
        self.dims[i]
    }

    /// Size of the innermost dimension, or 1 for a scalar shape.
    pub fn last_dim(&self) -> usize {
        self.dims.last().copied().unwrap_or(1)
    }

    /// Returns a reference to the underlying dimension sizes.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Row-major element offset of a full coordinate tuple.
    pub fn offset_of(&self, indices: &[usize]) -> Result<usize> {
        if indices.len() != self.dims.len() {
            return Err(TensorError::DimensionMismatch {
                expected: self.dims.len(),
                got: indices.len(),
            });
        }
        self.leading_offset(indices)
    }

    /// Fixes the leading `indices.len()` coordinates.
    ///
    /// Returns the element offset of the selected sub-array and the shape of
    /// the remaining dimensions. At least one dimension must remain.
    pub fn narrow_leading(&self, indices: &[usize]) -> Result<(usize, Shape)> {
        if indices.len() >= self.dims.len() {
            return Err(TensorError::DimensionMismatch {
                expected: self.dims.len().saturating_sub(1),
                got: indices.len(),
            });
        }
        let offset = self.leading_offset(indices)?;
        let inner = Shape::from_slice(&self.dims[indices.len()..]);
        Ok((offset * inner.numel(), inner))
    }

    fn leading_offset(&self, indices: &[usize]) -> Result<usize> {
        let mut offset = 0usize;
        for (axis, (&index, &size)) in indices.iter().zip(self.dims.iter()).enumerate() {
            if index >= size {
                return Err(TensorError::IndexOutOfRange { index, axis, size });
            }
            offset = offset * size + index;
        }
        Ok(offset)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::from_slice(dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_shape() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.ndim(), 3);
        assert_eq!(s.numel(), 24);
        assert_eq!(s.dim(0), 2);
        assert_eq!(s.dim(1), 3);
        assert_eq!(s.dim(2), 4);
        assert_eq!(s.last_dim(), 4);
    }

    #[test]
    fn test_scalar_shape() {
        let s = Shape::new(vec![]);
        assert_eq!(s.ndim(), 0);
        assert_eq!(s.numel(), 1); // product of empty = 1
        assert_eq!(s.offset_of(&[]).unwrap(), 0);
    }

    #[test]
    fn test_offset_of_is_row_major() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.offset_of(&[0, 0, 1]).unwrap(), 1);
        assert_eq!(s.offset_of(&[0, 1, 0]).unwrap(), 4);
        assert_eq!(s.offset_of(&[1, 2, 3]).unwrap(), 23);
    }

    #[test]
    fn test_offset_of_wrong_arity() {
        let s = Shape::new(vec![2, 3]);
        assert!(matches!(
            s.offset_of(&[1]),
            Err(TensorError::DimensionMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_offset_of_out_of_range() {
        let s = Shape::new(vec![2, 3]);
        assert!(matches!(
            s.offset_of(&[1, 3]),
            Err(TensorError::IndexOutOfRange { index: 3, axis: 1, size: 3 })
        ));
    }

    #[test]
    fn test_narrow_leading() {
        let s = Shape::new(vec![4, 2, 8]);
        let (offset, inner) = s.narrow_leading(&[3]).unwrap();
        assert_eq!(offset, 48);
        assert_eq!(inner.dims(), &[2, 8]);

        let (offset, inner) = s.narrow_leading(&[1, 1]).unwrap();
        assert_eq!(offset, 24);
        assert_eq!(inner.dims(), &[8]);
    }

    #[test]
    fn test_narrow_leading_must_keep_a_dimension() {
        let s = Shape::new(vec![4, 8]);
        assert!(s.narrow_leading(&[1, 1]).is_err());
        assert!(s.narrow_leading(&[4]).is_err());
    }
}
