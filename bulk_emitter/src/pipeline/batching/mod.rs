use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::pipeline::items::ItemSource;

pub mod emitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(u64);

impl BatchId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    max_batch_size: usize,
    max_batch_bytes: Option<usize>,
}

impl BatchConfig {
    pub fn new(max_batch_size: usize) -> BatchConfig {
        BatchConfig {
            max_batch_size,
            max_batch_bytes: None,
        }
    }

    pub fn with_max_batch_bytes(mut self, max_batch_bytes: usize) -> BatchConfig {
        self.max_batch_bytes = Some(max_batch_bytes);
        self
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

/// Mutable accumulator for the next batch.
///
/// [`BatchOperations::build`] takes the builder by value, so nothing can be
/// appended to a builder once it has been turned into a batch.
#[derive(Debug)]
pub struct BatchBuilder {
    items: Vec<ItemSource>,
    bytes: usize,
}

impl BatchBuilder {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// An immutable, ordered group of items submitted as one delivery unit.
#[derive(Debug)]
pub struct Batch {
    id: BatchId,
    items: Vec<ItemSource>,
}

impl Batch {
    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn items(&self) -> &[ItemSource] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn payload_bytes(&self) -> usize {
        self.items.iter().map(ItemSource::len).sum()
    }

    pub(crate) fn into_items(self) -> Vec<ItemSource> {
        self.items
    }

    /// Releases every item of the batch.
    pub fn release(self) {
        drop(self)
    }
}

/// Size policy and id sequence shared by every batch of one emitter.
#[derive(Debug)]
pub struct BatchOperations {
    config: BatchConfig,
    next_id: AtomicU64,
}

impl BatchOperations {
    pub fn new(config: BatchConfig) -> Self {
        BatchOperations {
            config,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn create_batch_builder(&self) -> BatchBuilder {
        BatchBuilder {
            items: Vec::with_capacity(self.config.max_batch_size),
            bytes: 0,
        }
    }

    pub fn add(&self, builder: &mut BatchBuilder, item: ItemSource) {
        builder.bytes += item.len();
        builder.items.push(item);
    }

    pub fn is_ready(&self, builder: &BatchBuilder) -> bool {
        builder.items.len() >= self.config.max_batch_size
            || self
                .config
                .max_batch_bytes
                .is_some_and(|max| builder.bytes >= max)
    }

    pub fn build(&self, builder: BatchBuilder) -> Batch {
        Batch {
            id: BatchId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            items: builder.items,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}
