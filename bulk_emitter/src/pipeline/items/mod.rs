use std::{fmt, sync::Arc};

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::conversions::{Payload, SerializeError, Serializer};

pub mod pooled;

#[derive(Debug, Error)]
pub enum ItemSourceError {
    #[error("serialization error: {0}")]
    Serialize(#[from] SerializeError),
}

/// Returns the backing storage of an item to wherever it came from.
pub trait BufferRelease: Send + Sync {
    fn release(&self, buf: BytesMut);
}

/// One serialized item together with the hook that releases its storage.
///
/// Storage is released when the item is dropped. Moving an item into a
/// batch moves the obligation to release it along with it.
pub struct ItemSource {
    payload: BytesMut,
    release: Option<Arc<dyn BufferRelease>>,
    attempts: u32,
}

impl ItemSource {
    pub fn new(payload: impl Into<BytesMut>) -> Self {
        ItemSource {
            payload: payload.into(),
            release: None,
            attempts: 0,
        }
    }

    pub fn pooled(payload: BytesMut, release: Arc<dyn BufferRelease>) -> Self {
        ItemSource {
            payload,
            release: Some(release),
            attempts: 0,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Number of delivery attempts this item has already been part of.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn release(self) {
        drop(self)
    }
}

impl Drop for ItemSource {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release.release(std::mem::take(&mut self.payload));
        }
    }
}

impl fmt::Debug for ItemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemSource")
            .field("len", &self.payload.len())
            .field("pooled", &self.release.is_some())
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl From<&str> for ItemSource {
    fn from(payload: &str) -> Self {
        ItemSource::new(payload.as_bytes())
    }
}

impl From<Vec<u8>> for ItemSource {
    fn from(payload: Vec<u8>) -> Self {
        // a uniquely owned `Bytes` converts back without copying
        ItemSource::new(BytesMut::from(Bytes::from(payload)))
    }
}

pub trait ItemSourceFactory: Send + Sync {
    fn create(&self, payload: &Payload) -> Result<ItemSource, ItemSourceError>;
}

/// Allocates a fresh buffer for every item.
pub struct UnpooledItemSourceFactory<S: Serializer> {
    serializer: S,
    initial_capacity: usize,
}

impl<S: Serializer> UnpooledItemSourceFactory<S> {
    pub fn new(serializer: S) -> Self {
        UnpooledItemSourceFactory {
            serializer,
            initial_capacity: 256,
        }
    }
}

impl<S: Serializer> ItemSourceFactory for UnpooledItemSourceFactory<S> {
    fn create(&self, payload: &Payload) -> Result<ItemSource, ItemSourceError> {
        let mut buf = BytesMut::with_capacity(self.initial_capacity);
        self.serializer.serialize_into(payload, &mut buf)?;
        Ok(ItemSource::new(buf))
    }
}
