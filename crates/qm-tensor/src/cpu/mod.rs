pub(crate) mod dot;
pub(crate) mod elementwise;

use crate::backend::ComputeBackend;
use crate::error::Result;
use crate::view::{TensorView, TensorViewMut};

/// Pure-Rust CPU compute backend.
///
/// Kernels are single-threaded; callers fan out across rows with the
/// primitives in [`crate::parallel`] and hand each worker a disjoint
/// destination view.
#[derive(Debug, Clone)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn dot_product(
        &self,
        a: &TensorView<'_>,
        b: &TensorView<'_>,
        a_offset: usize,
        b_offset: usize,
        length: usize,
    ) -> Result<f32> {
        dot::dot(a, b, a_offset, b_offset, length)
    }

    fn dot_product_chunk(
        &self,
        dest: &mut TensorViewMut<'_>,
        a: &TensorView<'_>,
        b: &TensorView<'_>,
        a_offset: usize,
        b_offset: usize,
        length: usize,
        chunk_start: usize,
    ) -> Result<()> {
        dot::dot_chunk(dest, a, b, a_offset, b_offset, length, chunk_start)
    }

    fn dot_product_batch_chunk(
        &self,
        dests: &mut [TensorViewMut<'_>],
        a: &TensorView<'_>,
        weights: &[TensorView<'_>],
        a_offset: usize,
        length: usize,
        chunk_start: usize,
    ) -> Result<()> {
        dot::dot_batch_chunk(dests, a, weights, a_offset, length, chunk_start)
    }

    fn accumulate(
        &self,
        dest: &mut TensorViewMut<'_>,
        src: &TensorView<'_>,
        offset: usize,
        length: usize,
    ) -> Result<()> {
        elementwise::binary(dest, src, offset, length, |d, s| d + s)
    }

    fn maccumulate(
        &self,
        dest: &mut TensorViewMut<'_>,
        src: &TensorView<'_>,
        offset: usize,
        length: usize,
    ) -> Result<()> {
        elementwise::binary(dest, src, offset, length, |d, s| d * s)
    }

    fn scale(
        &self,
        factor: f32,
        dest: &mut TensorViewMut<'_>,
        offset: usize,
        length: usize,
    ) -> Result<()> {
        elementwise::scale(dest, factor, offset, length)
    }
}
