//! A byte-budgeted cache of scratch tensors.
//!
//! [`TensorPool::acquire`] hands out a [`PooledTensor`] guard. The guard
//! returns its tensor to the pool when dropped, so release happens exactly
//! once on every exit path, `?` and panics included, and a released tensor
//! can no longer be reached through the guard.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::dtype::DType;
use crate::error::Result;
use crate::shape::Shape;
use crate::tensor::Tensor;

#[derive(Debug, Default)]
struct PoolInner {
    free: HashMap<(DType, Shape), Vec<Tensor>>,
    cached_bytes: usize,
}

/// Pool of owned dense tensors keyed by dtype and shape.
#[derive(Debug)]
pub struct TensorPool {
    inner: Mutex<PoolInner>,
    budget_bytes: usize,
}

impl TensorPool {
    /// A pool that caches at most `budget_bytes` of released tensors.
    pub fn new(budget_bytes: usize) -> Self {
        TensorPool {
            inner: Mutex::new(PoolInner::default()),
            budget_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // A panic while holding the lock leaves the free lists consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a zero-filled tensor, reusing a cached one when available.
    ///
    /// # Errors
    /// Quantized dtypes return `UnsupportedOperation`.
    pub fn acquire(&self, dtype: DType, shape: Shape) -> Result<PooledTensor<'_>> {
        let cached = {
            let mut inner = self.lock();
            let tensor = inner
                .free
                .get_mut(&(dtype, shape.clone()))
                .and_then(|list| list.pop());
            if let Some(t) = &tensor {
                inner.cached_bytes -= t.data_bytes().len();
            }
            tensor
        };

        let tensor = match cached {
            Some(mut tensor) => {
                trace!(%dtype, %shape, "reusing pooled tensor");
                tensor.clear()?;
                tensor
            }
            None => {
                debug!(%dtype, %shape, "allocating pooled tensor");
                Tensor::zeros(dtype, shape)?
            }
        };
        Ok(PooledTensor { pool: self, tensor })
    }

    fn release(&self, tensor: Tensor) {
        let bytes = tensor.data_bytes().len();
        let mut inner = self.lock();
        if inner.cached_bytes + bytes > self.budget_bytes {
            trace!(bytes, budget = self.budget_bytes, "pool over budget, dropping tensor");
            return;
        }
        inner.cached_bytes += bytes;
        inner
            .free
            .entry((tensor.dtype(), tensor.shape().clone()))
            .or_default()
            .push(tensor);
    }

    /// Number of tensors currently cached.
    pub fn cached(&self) -> usize {
        self.lock().free.values().map(Vec::len).sum()
    }

    /// Bytes currently held by cached tensors.
    pub fn cached_bytes(&self) -> usize {
        self.lock().cached_bytes
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }
}

/// A tensor on loan from a [`TensorPool`].
#[derive(Debug)]
pub struct PooledTensor<'p> {
    pool: &'p TensorPool,
    tensor: Tensor,
}

impl Deref for PooledTensor<'_> {
    type Target = Tensor;

    fn deref(&self) -> &Tensor {
        &self.tensor
    }
}

impl DerefMut for PooledTensor<'_> {
    fn deref_mut(&mut self) -> &mut Tensor {
        &mut self.tensor
    }
}

impl Drop for PooledTensor<'_> {
    fn drop(&mut self) {
        let tensor = std::mem::replace(&mut self.tensor, Tensor::empty());
        self.pool.release(tensor);
    }
}
