//! Dot-product kernels over packed storage.
//!
//! Operands are decoded one tile at a time into stack buffers, so no kernel
//! ever materializes a whole tensor as f32. When the right-hand row is
//! block-quantized and the tile lines up with a block, the tile is reduced
//! on the raw codes and multiplied by the block scale once.

use crate::dtype::BLOCK_SIZE;
use crate::error::{Result, TensorError};
use crate::view::{Data, TensorView, TensorViewMut};

const TILE: usize = BLOCK_SIZE;
const LANES: usize = 8;

/// Eight independent accumulators, reduced at the end.
pub(crate) fn dot_lanes(x: &[f32], y: &[f32]) -> f32 {
    let xs = x.chunks_exact(LANES);
    let ys = y.chunks_exact(LANES);
    let (x_tail, y_tail) = (xs.remainder(), ys.remainder());

    let mut acc = [0.0f32; LANES];
    for (xc, yc) in xs.zip(ys) {
        for lane in 0..LANES {
            acc[lane] += xc[lane] * yc[lane];
        }
    }
    let mut sum: f32 = acc.iter().sum();
    for (a, b) in x_tail.iter().zip(y_tail) {
        sum += a * b;
    }
    sum
}

/// Dot of an already decoded tile against `row[offset..offset + x.len()]`.
fn tile_against(x: &[f32], row: Data<'_>, offset: usize, scratch: &mut [f32; TILE]) -> f32 {
    let n = x.len();
    if n == BLOCK_SIZE && row.dtype().is_quantized() && offset % BLOCK_SIZE == 0 {
        let scale = row.block_codes(offset / BLOCK_SIZE, scratch);
        return scale * dot_lanes(x, scratch);
    }
    row.decode_into(offset, &mut scratch[..n]);
    dot_lanes(x, &scratch[..n])
}

/// Unchecked dot over `length` elements. Callers validate ranges.
fn dot_data(a: Data<'_>, b: Data<'_>, a_offset: usize, b_offset: usize, length: usize) -> f32 {
    // Keep the quantized operand on the right so it takes the block path.
    let (a, b, a_offset, b_offset) = if a.dtype().is_quantized() && !b.dtype().is_quantized() {
        (b, a, b_offset, a_offset)
    } else {
        (a, b, a_offset, b_offset)
    };

    let mut x = [0.0f32; TILE];
    let mut scratch = [0.0f32; TILE];
    let mut sum = 0.0f32;
    let mut done = 0;
    while done < length {
        let n = TILE.min(length - done);
        a.decode_into(a_offset + done, &mut x[..n]);
        sum += tile_against(&x[..n], b, b_offset + done, &mut scratch);
        done += n;
    }
    sum
}

pub(crate) fn dot(
    a: &TensorView<'_>,
    b: &TensorView<'_>,
    a_offset: usize,
    b_offset: usize,
    length: usize,
) -> Result<f32> {
    a.check_range(a_offset, length)?;
    b.check_range(b_offset, length)?;
    Ok(dot_data(a.data(), b.data(), a_offset, b_offset, length))
}

/// Rows and columns of a 2-D weight matrix.
fn matrix_dims(b: &TensorView<'_>) -> Result<(usize, usize)> {
    let shape = b.shape();
    if shape.ndim() != 2 {
        return Err(TensorError::DimensionMismatch {
            expected: 2,
            got: shape.ndim(),
        });
    }
    Ok((shape.dim(0), shape.dim(1)))
}

fn check_span(offset: usize, length: usize, size: usize) -> Result<()> {
    if offset.checked_add(length).map_or(true, |end| end > size) {
        return Err(TensorError::Range {
            offset,
            length,
            size,
        });
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn dot_chunk(
    dest: &mut TensorViewMut<'_>,
    a: &TensorView<'_>,
    b: &TensorView<'_>,
    a_offset: usize,
    b_offset: usize,
    length: usize,
    chunk_start: usize,
) -> Result<()> {
    let (rows, cols) = matrix_dims(b)?;
    a.check_range(a_offset, length)?;
    check_span(b_offset, length, cols)?;
    check_span(chunk_start, dest.numel(), rows)?;

    let mut out = vec![0.0f32; dest.numel()];
    for (j, o) in out.iter_mut().enumerate() {
        let row = b.slice(&[chunk_start + j])?;
        *o = dot_data(a.data(), row.data(), a_offset, b_offset, length);
    }
    dest.write_from(0, &out)
}

pub(crate) fn dot_batch_chunk(
    dests: &mut [TensorViewMut<'_>],
    a: &TensorView<'_>,
    weights: &[TensorView<'_>],
    a_offset: usize,
    length: usize,
    chunk_start: usize,
) -> Result<()> {
    if dests.len() != weights.len() {
        return Err(TensorError::ShapeMismatch {
            expected: vec![weights.len()],
            got: vec![dests.len()],
        });
    }
    let Some(chunk_rows) = dests.first().map(|d| d.numel()) else {
        return Ok(());
    };
    a.check_range(a_offset, length)?;
    for (dest, weight) in dests.iter().zip(weights) {
        let (rows, cols) = matrix_dims(weight)?;
        if dest.numel() != chunk_rows {
            return Err(TensorError::ShapeMismatch {
                expected: vec![chunk_rows],
                got: vec![dest.numel()],
            });
        }
        check_span(a_offset, length, cols)?;
        check_span(chunk_start, chunk_rows, rows)?;
    }

    let input = a.data();
    let mut x = [0.0f32; TILE];
    let mut scratch = [0.0f32; TILE];
    let mut sums = vec![0.0f32; weights.len()];
    for j in 0..chunk_rows {
        let rows = weights
            .iter()
            .map(|w| w.slice(&[chunk_start + j]))
            .collect::<Result<Vec<_>>>()?;
        sums.fill(0.0);

        let mut done = 0;
        while done < length {
            let n = TILE.min(length - done);
            let at = a_offset + done;
            input.decode_into(at, &mut x[..n]);
            for (sum, row) in sums.iter_mut().zip(&rows) {
                *sum += tile_against(&x[..n], row.data(), at, &mut scratch);
            }
            done += n;
        }

        for (dest, sum) in dests.iter_mut().zip(&sums) {
            dest.write_from(j, &[*sum])?;
        }
    }
    Ok(())
}
