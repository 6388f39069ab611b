use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, Span};

use crate::pipeline::items::ItemSource;

use super::{Batch, BatchBuilder, BatchId, BatchOperations};

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("emitter is stopped, item was not accepted")]
    Stopped(ItemSource),
}

impl EmitError {
    /// Hands the rejected item back to the caller.
    pub fn into_item(self) -> ItemSource {
        match self {
            EmitError::Stopped(item) => item,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Timer,
    Manual,
    Shutdown,
}

struct Current {
    builder: BatchBuilder,
    // `None` while stopped
    sink: Option<mpsc::UnboundedSender<Batch>>,
}

struct EmitterInner {
    current: Mutex<Current>,
    ops: BatchOperations,
    span: Span,
}

/// Owns the accumulating batch and performs the flush transition.
///
/// The current builder and the delivery sink live behind one mutex. A flush
/// takes the full builder out, installs an empty one and pushes the built
/// batch onto the delivery channel without leaving the critical section, so
/// size and timer triggers can race freely: whichever takes the lock first
/// closes the batch, the other one sees the fresh builder. Nothing in the
/// critical section waits on I/O.
#[derive(Clone)]
pub struct BatchEmitter {
    inner: Arc<EmitterInner>,
}

impl BatchEmitter {
    pub fn new(ops: BatchOperations, span: Span) -> Self {
        let builder = ops.create_batch_builder();
        BatchEmitter {
            inner: Arc::new(EmitterInner {
                current: Mutex::new(Current {
                    builder,
                    sink: None,
                }),
                ops,
                span,
            }),
        }
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, Current> {
        self.inner.current.lock().expect("lock poisoned")
    }

    /// Starts accepting items; closed batches are sent to `sink`.
    pub(crate) fn open(&self, sink: mpsc::UnboundedSender<Batch>) {
        let mut current = self.lock();
        current.sink = Some(sink);
    }

    /// Performs the final flush and stops accepting items.
    ///
    /// Dropping the sink here lets the delivery worker observe the end of the
    /// channel once the last batch has been received.
    pub(crate) fn close(&self) -> Option<BatchId> {
        let mut current = self.lock();
        let flushed = self.flush_locked(&mut current, FlushTrigger::Shutdown);
        current.sink = None;
        flushed
    }

    pub fn is_open(&self) -> bool {
        self.lock().sink.is_some()
    }

    /// Items waiting in the current, not yet closed, batch.
    pub fn pending(&self) -> usize {
        self.lock().builder.len()
    }

    pub fn add(&self, item: ItemSource) -> Result<(), EmitError> {
        let mut current = self.lock();
        if current.sink.is_none() {
            return Err(EmitError::Stopped(item));
        }

        self.inner.ops.add(&mut current.builder, item);
        if self.inner.ops.is_ready(&current.builder) {
            self.flush_locked(&mut current, FlushTrigger::Size);
        }

        Ok(())
    }

    /// Puts items of a failed delivery back into the current batch.
    ///
    /// Returns the items unchanged when the emitter no longer accepts input.
    pub(crate) fn requeue(&self, items: Vec<ItemSource>) -> Result<(), Vec<ItemSource>> {
        let mut current = self.lock();
        if current.sink.is_none() {
            return Err(items);
        }

        for item in items {
            self.inner.ops.add(&mut current.builder, item);
            if self.inner.ops.is_ready(&current.builder) {
                self.flush_locked(&mut current, FlushTrigger::Size);
            }
        }

        Ok(())
    }

    pub fn notify_on_timer(&self) -> Option<BatchId> {
        self.flush(FlushTrigger::Timer)
    }

    pub fn flush(&self, trigger: FlushTrigger) -> Option<BatchId> {
        let mut current = self.lock();
        self.flush_locked(&mut current, trigger)
    }

    fn flush_locked(&self, current: &mut Current, trigger: FlushTrigger) -> Option<BatchId> {
        if current.builder.is_empty() {
            return None;
        }
        let sink = current.sink.as_ref()?;

        let full = std::mem::replace(&mut current.builder, self.inner.ops.create_batch_builder());
        let batch = self.inner.ops.build(full);
        let id = batch.id();

        debug!(parent: &self.inner.span, batch = %id, items = batch.len(), ?trigger, "closing batch");

        if let Err(mpsc::error::SendError(batch)) = sink.send(batch) {
            error!(
                parent: &self.inner.span,
                "delivery worker is gone, dropping batch {} with {} items",
                id,
                batch.len()
            );
            return None;
        }

        Some(id)
    }
}
