use crate::error::{Result, TensorError};

/// In-place, numerically stable softmax.
///
/// The maximum is subtracted before exponentiating so large logits do not
/// overflow. An empty slice is left untouched.
pub fn softmax(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if values.is_empty() {
        return;
    }
    let mut sum = 0.0f32;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in values.iter_mut() {
        *v /= sum;
    }
}

/// Write the indices of the `out.len()` largest entries of `values` to `out`.
///
/// `out` starts as `0..k`. Each later index replaces the current minimum of
/// `out` when its value is strictly greater; the minimum is the first slot
/// holding the smallest value. The result is not sorted.
pub fn select_top_k(values: &[f32], out: &mut [usize]) -> Result<()> {
    let k = out.len();
    if k > values.len() {
        return Err(TensorError::Range {
            offset: 0,
            length: k,
            size: values.len(),
        });
    }
    if k == 0 {
        return Ok(());
    }
    for (slot, index) in out.iter_mut().enumerate() {
        *index = slot;
    }
    for (i, &v) in values.iter().enumerate().skip(k) {
        let mut min = 0;
        for j in 1..k {
            if values[out[j]] < values[out[min]] {
                min = j;
            }
        }
        if v > values[out[min]] {
            out[min] = i;
        }
    }
    Ok(())
}
