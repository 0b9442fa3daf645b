//! Element-wise kernels: tiled decode, combine in f32, re-encode.

use crate::dtype::BLOCK_SIZE;
use crate::error::Result;
use crate::view::{TensorView, TensorViewMut};

const TILE: usize = BLOCK_SIZE;

/// `dest[i] = op(dest[i], src[i])` over `offset..offset + length`.
pub(crate) fn binary<F>(
    dest: &mut TensorViewMut<'_>,
    src: &TensorView<'_>,
    offset: usize,
    length: usize,
    op: F,
) -> Result<()>
where
    F: Fn(f32, f32) -> f32,
{
    dest.check_range(offset, length)?;
    src.check_range(offset, length)?;

    let mut x = [0.0f32; TILE];
    let mut y = [0.0f32; TILE];
    let mut done = 0;
    while done < length {
        let n = TILE.min(length - done);
        let at = offset + done;
        dest.decode_into(at, &mut x[..n])?;
        src.decode_into(at, &mut y[..n])?;
        for (d, s) in x[..n].iter_mut().zip(&y[..n]) {
            *d = op(*d, *s);
        }
        dest.write_from(at, &x[..n])?;
        done += n;
    }
    Ok(())
}

/// `dest[i] *= factor` over `offset..offset + length`.
pub(crate) fn scale(
    dest: &mut TensorViewMut<'_>,
    factor: f32,
    offset: usize,
    length: usize,
) -> Result<()> {
    dest.check_range(offset, length)?;

    let mut x = [0.0f32; TILE];
    let mut done = 0;
    while done < length {
        let n = TILE.min(length - done);
        let at = offset + done;
        dest.decode_into(at, &mut x[..n])?;
        for v in &mut x[..n] {
            *v *= factor;
        }
        dest.write_from(at, &x[..n])?;
        done += n;
    }
    Ok(())
}
