//! Fork-join primitives over rayon's global pool.
//!
//! Every primitive returns only after all iterations have finished. Writers
//! receive disjoint mutable views, so two iterations can never touch the
//! same element.

use rayon::prelude::*;
use tracing::trace;

use crate::error::{Result, TensorError};
use crate::view::TensorViewMut;

/// Invoke `body(i)` for every `i` in `start..end`, in any order.
pub fn parallel_for<F>(start: usize, end: usize, body: F)
where
    F: Fn(usize) + Sync + Send,
{
    (start..end).into_par_iter().for_each(body);
}

/// Fallible [`parallel_for`]. The first error observed is returned once the
/// remaining iterations have been cancelled or finished.
pub fn try_parallel_for<F>(start: usize, end: usize, body: F) -> Result<()>
where
    F: Fn(usize) -> Result<()> + Sync + Send,
{
    (start..end).into_par_iter().try_for_each(body)
}

/// Number of chunks used for a span of `span` units.
pub fn default_chunks(span: usize) -> usize {
    rayon::current_num_threads().min(span).max(1)
}

/// Split `start..end` into at most `chunks` contiguous `(chunk_start,
/// chunk_size)` pairs whose sizes differ by at most one.
pub fn chunk_bounds(start: usize, end: usize, chunks: usize) -> Vec<(usize, usize)> {
    let span = end.saturating_sub(start);
    if span == 0 {
        return Vec::new();
    }
    let chunks = chunks.clamp(1, span);
    let base = span / chunks;
    let extra = span % chunks;

    let mut bounds = Vec::with_capacity(chunks);
    let mut at = start;
    for c in 0..chunks {
        let size = base + usize::from(c < extra);
        bounds.push((at, size));
        at += size;
    }
    bounds
}

/// Invoke `body(chunk_start, chunk_size)` once per chunk of `start..end`.
pub fn parallel_chunks<F>(start: usize, end: usize, body: F) -> Result<()>
where
    F: Fn(usize, usize) -> Result<()> + Sync + Send,
{
    let bounds = chunk_bounds(start, end, default_chunks(end.saturating_sub(start)));
    trace!(start, end, chunks = bounds.len(), "parallel chunks");
    bounds
        .into_par_iter()
        .try_for_each(|(chunk_start, size)| body(chunk_start, size))
}

/// Split `dest` into disjoint chunk views and invoke
/// `body(chunk_start, chunk)` on each in parallel.
///
/// `chunk_start` is the flat offset of the chunk inside `dest`.
pub fn try_parallel_chunks_mut<F>(dest: TensorViewMut<'_>, body: F) -> Result<()>
where
    F: Fn(usize, &mut TensorViewMut<'_>) -> Result<()> + Sync + Send,
{
    let n = dest.numel();
    let bounds = chunk_bounds(0, n, default_chunks(n));
    let chunks = dest.into_chunks(bounds.iter().map(|&(_, size)| size))?;
    trace!(len = n, chunks = chunks.len(), "parallel chunks over view");
    chunks
        .into_par_iter()
        .zip(bounds)
        .try_for_each(|(mut chunk, (chunk_start, _))| body(chunk_start, &mut chunk))
}

/// [`try_parallel_chunks_mut`] over several equally sized destinations.
///
/// Every destination is cut at the same boundaries, and `body` receives the
/// matching chunk of each one.
pub fn try_parallel_chunks_mut_batch<F>(dests: Vec<TensorViewMut<'_>>, body: F) -> Result<()>
where
    F: Fn(usize, &mut [TensorViewMut<'_>]) -> Result<()> + Sync + Send,
{
    let Some(n) = dests.first().map(|d| d.numel()) else {
        return Ok(());
    };
    if let Some(bad) = dests.iter().find(|d| d.numel() != n) {
        return Err(TensorError::ShapeMismatch {
            expected: vec![n],
            got: vec![bad.numel()],
        });
    }

    let bounds = chunk_bounds(0, n, default_chunks(n));
    let mut per_chunk: Vec<Vec<TensorViewMut<'_>>> =
        (0..bounds.len()).map(|_| Vec::with_capacity(dests.len())).collect();
    for dest in dests {
        let pieces = dest.into_chunks(bounds.iter().map(|&(_, size)| size))?;
        for (slot, piece) in per_chunk.iter_mut().zip(pieces) {
            slot.push(piece);
        }
    }

    per_chunk
        .into_par_iter()
        .zip(bounds)
        .try_for_each(|(mut group, (chunk_start, _))| body(chunk_start, &mut group))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::shape::Shape;
    use crate::tensor::Tensor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parallel_for_visits_each_index_once() {
        let hits: Vec<AtomicUsize> = (0..100).map(|_| AtomicUsize::new(0)).collect();
        parallel_for(10, 90, |i| {
            hits[i].fetch_add(1, Ordering::Relaxed);
        });
        for (i, h) in hits.iter().enumerate() {
            let expected = usize::from((10..90).contains(&i));
            assert_eq!(h.load(Ordering::Relaxed), expected, "index {}", i);
        }
    }

    #[test]
    fn test_try_parallel_for_propagates_error() {
        let result = try_parallel_for(0, 64, |i| {
            if i == 37 {
                return Err(TensorError::UnsupportedOperation(format!("index {}", i)));
            }
            Ok(())
        });
        assert!(matches!(result, Err(TensorError::UnsupportedOperation(_))));
    }

    #[test]
    fn test_chunk_bounds_cover_range() {
        let bounds = chunk_bounds(5, 15, 3);
        assert_eq!(bounds, vec![(5, 4), (9, 3), (12, 3)]);

        assert_eq!(chunk_bounds(0, 3, 8), vec![(0, 1), (1, 1), (2, 1)]);
        assert!(chunk_bounds(4, 4, 2).is_empty());
        assert_eq!(chunk_bounds(0, 7, 0), vec![(0, 7)]);
    }

    #[test]
    fn test_parallel_chunks_sum_to_span() {
        let total = AtomicUsize::new(0);
        parallel_chunks(3, 1003, |_, size| {
            total.fetch_add(size, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();
        assert_eq!(total.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn test_parallel_chunks_mut_disjoint_writes() {
        let mut t = Tensor::zeros(DType::F32, Shape::new(vec![257])).unwrap();
        try_parallel_chunks_mut(t.view_mut().unwrap(), |chunk_start, chunk| {
            let values: Vec<f32> = (0..chunk.numel()).map(|j| (chunk_start + j) as f32).collect();
            chunk.write_from(0, &values)
        })
        .unwrap();
        let expected: Vec<f32> = (0..257).map(|i| i as f32).collect();
        assert_eq!(t.to_f32_vec(), expected);
    }

    #[test]
    fn test_parallel_chunks_mut_batch() {
        let mut a = Tensor::zeros(DType::F32, Shape::new(vec![40])).unwrap();
        let mut b = Tensor::zeros(DType::BF16, Shape::new(vec![40])).unwrap();
        try_parallel_chunks_mut_batch(
            vec![a.view_mut().unwrap(), b.view_mut().unwrap()],
            |chunk_start, group| {
                assert_eq!(group.len(), 2);
                for (k, dest) in group.iter_mut().enumerate() {
                    for j in 0..dest.numel() {
                        dest.set((chunk_start + j + k) as f32, &[j])?;
                    }
                }
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(a.get(&[39]).unwrap(), 39.0);
        assert_eq!(b.get(&[0]).unwrap(), 1.0);
    }

    #[test]
    fn test_parallel_chunks_mut_batch_rejects_uneven() {
        let mut a = Tensor::zeros(DType::F32, Shape::new(vec![4])).unwrap();
        let mut b = Tensor::zeros(DType::F32, Shape::new(vec![5])).unwrap();
        let result = try_parallel_chunks_mut_batch(
            vec![a.view_mut().unwrap(), b.view_mut().unwrap()],
            |_, _| Ok(()),
        );
        assert!(matches!(result, Err(TensorError::ShapeMismatch { .. })));
    }
}
