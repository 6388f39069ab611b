use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use bytes::BytesMut;
use tracing::debug;

use crate::conversions::{Payload, Serializer};

use super::{BufferRelease, ItemSource, ItemSourceError, ItemSourceFactory};

/// A bounded free-list of serialization buffers.
///
/// When the pool is empty a new buffer is allocated; released buffers beyond
/// `max_pooled` are dropped instead of kept.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    buffer_capacity: usize,
    max_pooled: usize,
    allocated: AtomicUsize,
}

impl BufferPool {
    pub fn new(initial: usize, max_pooled: usize, buffer_capacity: usize) -> Arc<Self> {
        let free = (0..initial.min(max_pooled))
            .map(|_| BytesMut::with_capacity(buffer_capacity))
            .collect::<Vec<_>>();
        let allocated = AtomicUsize::new(free.len());
        Arc::new(BufferPool {
            free: Mutex::new(free),
            buffer_capacity,
            max_pooled,
            allocated,
        })
    }

    pub fn acquire(&self) -> BytesMut {
        #[allow(clippy::expect_used)]
        let pooled = self.free.lock().expect("lock poisoned").pop();
        match pooled {
            Some(buf) => buf,
            None => {
                let total = self.allocated.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("buffer pool empty, allocating buffer #{total}");
                BytesMut::with_capacity(self.buffer_capacity)
            }
        }
    }

    /// Buffers currently sitting in the pool.
    #[allow(clippy::expect_used)]
    pub fn available(&self) -> usize {
        self.free.lock().expect("lock poisoned").len()
    }
}

impl BufferRelease for BufferPool {
    fn release(&self, mut buf: BytesMut) {
        buf.clear();
        #[allow(clippy::expect_used)]
        let mut free = self.free.lock().expect("lock poisoned");
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }
}

pub struct PooledItemSourceFactory<S: Serializer> {
    serializer: S,
    pool: Arc<BufferPool>,
}

impl<S: Serializer> PooledItemSourceFactory<S> {
    pub fn new(serializer: S, pool: Arc<BufferPool>) -> Self {
        PooledItemSourceFactory { serializer, pool }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

impl<S: Serializer> ItemSourceFactory for PooledItemSourceFactory<S> {
    fn create(&self, payload: &Payload) -> Result<ItemSource, ItemSourceError> {
        let mut buf = self.pool.acquire();
        if let Err(e) = self.serializer.serialize_into(payload, &mut buf) {
            self.pool.release(buf);
            return Err(e.into());
        }
        Ok(ItemSource::pooled(buf, self.pool.clone()))
    }
}
