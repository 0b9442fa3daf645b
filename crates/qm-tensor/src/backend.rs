use std::fmt::Debug;

use crate::error::Result;
use crate::view::{TensorView, TensorViewMut};

/// Trait for pluggable compute backends.
///
/// Kernels read operands in whatever format they are stored in and
/// accumulate in f32. Every kernel checks that `offset + length` lies inside
/// each operand and fails with `TensorError::Range` otherwise. Destinations
/// are mutable views, so callers that fan work out across threads hand each
/// worker a disjoint view.
pub trait ComputeBackend: Send + Sync + Debug {
    /// Returns the name of this backend (e.g., "cpu").
    fn name(&self) -> &str;

    /// Sum of `a[a_offset + i] * b[b_offset + i]` for `i` in `0..length`.
    fn dot_product(
        &self,
        a: &TensorView<'_>,
        b: &TensorView<'_>,
        a_offset: usize,
        b_offset: usize,
        length: usize,
    ) -> Result<f32>;

    /// Row-chunked matrix-vector product.
    ///
    /// `b` is 2-D `[rows, cols]`. For each `j` in `0..dest.numel()`:
    ///   dest[j] = dot(a[a_offset..], b[chunk_start + j][b_offset..], length)
    #[allow(clippy::too_many_arguments)]
    fn dot_product_chunk(
        &self,
        dest: &mut TensorViewMut<'_>,
        a: &TensorView<'_>,
        b: &TensorView<'_>,
        a_offset: usize,
        b_offset: usize,
        length: usize,
        chunk_start: usize,
    ) -> Result<()>;

    /// [`ComputeBackend::dot_product_chunk`] for several weight matrices
    /// sharing one input, reading each input tile once per chunk row.
    ///
    /// `dests` and `weights` are parallel arrays; the same `a_offset` is used
    /// for the input and for every weight row.
    fn dot_product_batch_chunk(
        &self,
        dests: &mut [TensorViewMut<'_>],
        a: &TensorView<'_>,
        weights: &[TensorView<'_>],
        a_offset: usize,
        length: usize,
        chunk_start: usize,
    ) -> Result<()>;

    /// `dest[i] += src[i]` for `i` in `offset..offset + length`.
    fn accumulate(
        &self,
        dest: &mut TensorViewMut<'_>,
        src: &TensorView<'_>,
        offset: usize,
        length: usize,
    ) -> Result<()>;

    /// `dest[i] *= src[i]` for `i` in `offset..offset + length`.
    fn maccumulate(
        &self,
        dest: &mut TensorViewMut<'_>,
        src: &TensorView<'_>,
        offset: usize,
        length: usize,
    ) -> Result<()>;

    /// `dest[i] *= factor` for `i` in `offset..offset + length`.
    fn scale(
        &self,
        factor: f32,
        dest: &mut TensorViewMut<'_>,
        offset: usize,
        length: usize,
    ) -> Result<()>;
}
