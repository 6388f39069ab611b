use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::{runtime::Handle, sync::mpsc};
use tracing::{debug, info, warn, Span};

use super::{
    batching::{
        emitter::{BatchEmitter, EmitError, FlushTrigger},
        BatchId, BatchOperations,
    },
    config::{ConfigError, DeliveryConfig},
    destinations::{ClientObjectFactory, DestinationError},
    items::ItemSource,
    publisher::{Publisher, PublisherHandle},
    scheduler::Scheduler,
};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("batch delivery is already started")]
    AlreadyStarted,

    #[error("batch delivery is still stopping")]
    Stopping,

    #[error("start must be called from within a tokio runtime")]
    NoRuntime,

    #[error("unable to create client: {0}")]
    Client(#[from] DestinationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Started,
    Stopping,
}

struct Running<F: ClientObjectFactory> {
    scheduler: Scheduler,
    publisher: PublisherHandle<F::Client>,
}

enum Lifecycle<F: ClientObjectFactory> {
    Stopped,
    Started(Running<F>),
    // owned by the `stop` call in progress
    Stopping,
}

impl<F: ClientObjectFactory> Lifecycle<F> {
    fn state(&self) -> LifecycleState {
        match self {
            Lifecycle::Stopped => LifecycleState::Stopped,
            Lifecycle::Started(_) => LifecycleState::Started,
            Lifecycle::Stopping => LifecycleState::Stopping,
        }
    }
}

/// Producer-facing entry point of the delivery core.
///
/// `add` may be called from any thread and only ever waits for the short
/// critical section of the emitter. Delivery failures are never reported back
/// to producers; they end up in the client factory's failure handler.
pub struct BatchDelivery<F: ClientObjectFactory> {
    config: DeliveryConfig,
    factory: F,
    emitter: BatchEmitter,
    lifecycle: Mutex<Lifecycle<F>>,
    span: Span,
}

impl<F: ClientObjectFactory> BatchDelivery<F> {
    pub fn new(config: DeliveryConfig, factory: F, span: Span) -> Result<Self, ConfigError> {
        config.validate()?;
        let emitter = BatchEmitter::new(BatchOperations::new(config.batch_config()), span.clone());

        Ok(BatchDelivery {
            config,
            factory,
            emitter,
            lifecycle: Mutex::new(Lifecycle::Stopped),
            span,
        })
    }

    #[allow(clippy::expect_used)]
    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle<F>> {
        self.lifecycle.lock().expect("lock poisoned")
    }

    pub fn start(&self) -> Result<(), LifecycleError> {
        Handle::try_current().map_err(|_| LifecycleError::NoRuntime)?;

        let mut lifecycle = self.lock_lifecycle();
        match *lifecycle {
            Lifecycle::Stopped => {}
            Lifecycle::Started(_) => return Err(LifecycleError::AlreadyStarted),
            Lifecycle::Stopping => return Err(LifecycleError::Stopping),
        }

        let client = Arc::new(self.factory.create_client()?);
        let (sink, batches) = mpsc::unbounded_channel();

        let publisher = Publisher::new(
            client,
            self.emitter.clone(),
            self.factory.failure_handler(),
            self.config.retry.clone(),
            self.config.max_in_flight,
            self.span.clone(),
        )
        .spawn(batches);
        let scheduler = Scheduler::start(
            self.config.delivery_interval(),
            self.emitter.clone(),
            self.span.clone(),
        );

        self.emitter.open(sink);
        *lifecycle = Lifecycle::Started(Running {
            scheduler,
            publisher,
        });

        info!(
            parent: &self.span,
            "started batch delivery: max_batch_size={}, delivery_interval={:?}, max_in_flight={}",
            self.config.max_batch_size,
            self.config.delivery_interval(),
            self.config.max_in_flight
        );
        Ok(())
    }

    /// Stops the timer, flushes what is left and waits for in-flight
    /// deliveries for at most the configured grace period.
    ///
    /// The instance reports `Stopping` until this returns; `start` is
    /// rejected meanwhile and a concurrent `stop` returns right away.
    pub async fn stop(&self) {
        let running = {
            let mut lifecycle = self.lock_lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
                Lifecycle::Started(running) => running,
                other => {
                    debug!(
                        parent: &self.span,
                        "batch delivery is not running: {:?}",
                        other.state()
                    );
                    *lifecycle = other;
                    return;
                }
            }
        };

        running.scheduler.stop().await;

        if let Some(id) = self.emitter.close() {
            debug!(parent: &self.span, "final flush closed batch {id}");
        }

        running
            .publisher
            .shutdown(self.config.shutdown_grace_period())
            .await;

        *self.lock_lifecycle() = Lifecycle::Stopped;
        info!(parent: &self.span, "stopped batch delivery");
    }

    pub fn state(&self) -> LifecycleState {
        self.lock_lifecycle().state()
    }

    pub fn is_started(&self) -> bool {
        self.state() == LifecycleState::Started
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == LifecycleState::Stopped
    }

    pub fn add(&self, item: ItemSource) -> Result<(), EmitError> {
        self.emitter.add(item)
    }

    /// Closes the current batch right away instead of waiting for the timer.
    pub fn flush(&self) -> Option<BatchId> {
        self.emitter.flush(FlushTrigger::Manual)
    }

    pub fn emitter(&self) -> &BatchEmitter {
        &self.emitter
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }
}

impl<F: ClientObjectFactory> Drop for BatchDelivery<F> {
    fn drop(&mut self) {
        let lifecycle = match self.lifecycle.get_mut() {
            Ok(lifecycle) => std::mem::replace(lifecycle, Lifecycle::Stopped),
            Err(poisoned) => std::mem::replace(poisoned.into_inner(), Lifecycle::Stopped),
        };
        if let Lifecycle::Started(running) = lifecycle {
            // the publisher keeps delivering in the background until the channel ends
            warn!(parent: &self.span, "batch delivery dropped without stop");
            running.scheduler.cancel();
            self.emitter.close();
        }
    }
}
