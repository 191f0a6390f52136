//! A decoded [Resource] and the pooled buffer backing it.
use std::sync::Arc;

use parking_lot::Mutex;

use crate::*;

/// A decoded value plus the pooled buffer the decoder wrote into.
///
/// The buffer goes back to its pool exactly once: either when the memory cache evicts the resource (see
/// [Resource::recycle]), or when the last reference to the resource is dropped, whichever happens first.  After a
/// recycle the value is still readable but the buffer is gone, since another load may already be reusing it.
pub struct Resource<T, B> {
    value: T,
    buffer: Mutex<Option<Pooled<B>>>,
    pool: Arc<BlockingPool<B>>,
}

impl<T, B> Resource<T, B> {
    pub(crate) fn new(value: T, buffer: Pooled<B>, pool: Arc<BlockingPool<B>>) -> Resource<T, B> {
        Resource {
            value,
            buffer: Mutex::new(Some(buffer)),
            pool,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Run `f` over the backing buffer, or return `None` if it has been recycled.
    pub fn with_buffer<U>(&self, f: impl FnOnce(&B) -> U) -> Option<U> {
        self.buffer.lock().as_ref().map(|b| f(b.get()))
    }

    pub fn is_recycled(&self) -> bool {
        self.buffer.lock().is_none()
    }

    /// Give the backing buffer back to the pool now.
    ///
    /// Returns `Ok(false)` if it was already given back.
    pub fn recycle(&self) -> Result<bool, PoolError> {
        let taken = self.buffer.lock().take();
        match taken {
            Some(b) => self.pool.release(b).map(|_| true),
            None => Ok(false),
        }
    }
}

impl<T, B> Drop for Resource<T, B> {
    fn drop(&mut self) {
        if let Some(b) = self.buffer.get_mut().take() {
            // After a drain the pool no longer knows this buffer; that is expected during shutdown.
            if let Err(e) = self.pool.release(b) {
                tracing::debug!(error = %e, "buffer not returned to pool on drop");
            }
        }
    }
}

impl<T: std::fmt::Debug, B> std::fmt::Debug for Resource<T, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("value", &self.value)
            .field("recycled", &self.is_recycled())
            .finish()
    }
}
