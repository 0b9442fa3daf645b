use thiserror::Error;

use crate::dtype::DType;

#[derive(Error, Debug)]
pub enum TensorError {
    #[error("dimension mismatch: expected {expected} coordinates, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("index {index} out of range for axis {axis} of size {size}")]
    IndexOutOfRange {
        index: usize,
        axis: usize,
        size: usize,
    },
    #[error("range error: offset {offset} + length {length} exceeds {size} elements")]
    Range {
        offset: usize,
        length: usize,
        size: usize,
    },
    #[error("dtype mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: DType, got: DType },
    #[error("read-only tensor: {0}")]
    ReadOnly(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("construction error: {0}")]
    Construction(String),
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TensorError>;
