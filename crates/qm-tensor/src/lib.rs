//! `qm-tensor` - Quantized tensor storage and kernels for the MOE inference core.
//!
//! This crate provides:
//! - A `Tensor` type over owned or memory-mapped storage in six formats
//!   (F32, F16, BF16, Q8, Q4, Q5)
//! - Borrowed `TensorView` / `TensorViewMut` slices
//! - Block quantization codecs with a fixed binary layout
//! - A `ComputeBackend` trait and a reference `CpuBackend`
//! - Fork-join parallel primitives, softmax and top-k selection
//! - A budgeted pool of scratch tensors with RAII release

pub mod backend;
pub mod cpu;
pub mod dtype;
pub mod error;
pub mod math;
pub mod parallel;
pub mod pool;
pub mod quant;
pub mod shape;
pub mod storage;
pub mod tensor;
pub mod view;

// Re-export primary types at the crate root for convenience.
pub use backend::ComputeBackend;
pub use cpu::CpuBackend;
pub use dtype::{DType, BLOCK_SIZE};
pub use error::{Result, TensorError};
pub use pool::{PooledTensor, TensorPool};
pub use shape::Shape;
pub use storage::{map_file, Region, TensorParts};
pub use tensor::Tensor;
pub use view::{TensorView, TensorViewMut};
