use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::{mpsc, AcquireError, Semaphore},
    task::JoinHandle,
    time::{timeout_at, Instant},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, Instrument, Span};

use super::{
    batching::{emitter::BatchEmitter, Batch, BatchId},
    destinations::{Client, DeliveryOutcome, FailureKind},
    failure::{FailedItems, FailureHandler, FailureReason, RetryPolicy},
    items::ItemSource,
};

#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("unable to acquire semaphore")]
    SemaphoreError(#[from] AcquireError),
}

/// Decides what happens to the items of a batch once its outcome is known.
struct OutcomeResolver {
    emitter: BatchEmitter,
    failure_handler: Arc<dyn FailureHandler>,
    retry: RetryPolicy,
    shutting_down: CancellationToken,
    // fired when the grace period runs out
    abandoned: CancellationToken,
    pending_items: AtomicUsize,
    abandoned_items: AtomicUsize,
}

impl OutcomeResolver {
    /// Hands a batch that will never be delivered to the failure handler.
    fn abandon(&self, batch: Batch) {
        let total = batch.len();
        self.failure_handler.on_failure(FailedItems {
            batch_id: batch.id(),
            items: batch.into_items(),
            reason: FailureReason::Abandoned,
        });
        self.pending_items.fetch_sub(total, Ordering::SeqCst);
        self.abandoned_items.fetch_add(total, Ordering::SeqCst);
    }

    async fn resolve(&self, batch: Batch, outcome: DeliveryOutcome) {
        let id = batch.id();
        let total = batch.len();

        match outcome {
            DeliveryOutcome::Accepted => {
                debug!("batch {id} accepted, releasing {total} items");
                batch.release();
            }
            DeliveryOutcome::PartialFailure(failures) => {
                let mut items: Vec<Option<ItemSource>> =
                    batch.into_items().into_iter().map(Some).collect();
                let mut transient = Vec::new();
                let mut last_error = String::new();
                let mut rejected: Vec<(String, Vec<ItemSource>)> = Vec::new();

                for failure in failures {
                    let Some(item) = items.get_mut(failure.index).and_then(Option::take) else {
                        error!(
                            "batch {id}: ignoring failure for unknown or repeated item index {}",
                            failure.index
                        );
                        continue;
                    };
                    match failure.kind {
                        FailureKind::Transient => {
                            transient.push(item);
                            last_error = failure.reason;
                        }
                        FailureKind::Permanent => {
                            match rejected.iter_mut().find(|(reason, _)| *reason == failure.reason) {
                                Some((_, group)) => group.push(item),
                                None => rejected.push((failure.reason, vec![item])),
                            }
                        }
                    }
                }

                let delivered = items.into_iter().flatten().count();
                info!(
                    "batch {id} partially delivered: {delivered} accepted, {} transient, {} rejected",
                    transient.len(),
                    rejected.iter().map(|(_, group)| group.len()).sum::<usize>()
                );

                for (reason, group) in rejected {
                    self.failure_handler.on_failure(FailedItems {
                        batch_id: id,
                        items: group,
                        reason: FailureReason::Rejected(reason),
                    });
                }
                self.retry_or_drop(id, transient, last_error).await;
            }
            DeliveryOutcome::Failure(e) => {
                error!("delivery of batch {id} with {total} items failed: {e}");
                let items = batch.into_items();
                match e.kind() {
                    FailureKind::Permanent => self.failure_handler.on_failure(FailedItems {
                        batch_id: id,
                        items,
                        reason: FailureReason::Rejected(e.to_string()),
                    }),
                    FailureKind::Transient => self.retry_or_drop(id, items, e.to_string()).await,
                }
            }
        }

        self.pending_items.fetch_sub(total, Ordering::SeqCst);
    }

    async fn retry_or_drop(&self, id: BatchId, items: Vec<ItemSource>, last_error: String) {
        let mut retry = Vec::new();
        let mut exhausted = Vec::new();
        for mut item in items {
            item.record_attempt();
            if self.retry.allows_retry(item.attempts()) {
                retry.push(item);
            } else {
                exhausted.push(item);
            }
        }

        if !exhausted.is_empty() {
            let attempts = exhausted.iter().map(ItemSource::attempts).max().unwrap_or_default();
            self.failure_handler.on_failure(FailedItems {
                batch_id: id,
                items: exhausted,
                reason: FailureReason::RetriesExhausted {
                    attempts,
                    last_error: last_error.clone(),
                },
            });
        }

        if retry.is_empty() {
            return;
        }

        let attempt = retry.iter().map(ItemSource::attempts).max().unwrap_or(1);
        let delay = self.retry.backoff_delay(attempt);
        debug!("requeueing {} items of batch {id} in {delay:?}", retry.len());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutting_down.cancelled() => {}
        }

        if let Err(items) = self.emitter.requeue(retry) {
            self.failure_handler.on_failure(FailedItems {
                batch_id: id,
                items,
                reason: FailureReason::ShuttingDown(last_error),
            });
        }
    }
}

/// Delivers closed batches on their own tasks, at most `max_in_flight` at a time.
pub struct Publisher<C: Client> {
    client: Arc<C>,
    semaphore: Arc<Semaphore>,
    task_tracker: TaskTracker,
    resolver: Arc<OutcomeResolver>,
    span: Span,
}

impl<C: Client + 'static> Publisher<C> {
    pub fn new(
        client: Arc<C>,
        emitter: BatchEmitter,
        failure_handler: Arc<dyn FailureHandler>,
        retry: RetryPolicy,
        max_concurrency: usize,
        span: Span,
    ) -> Self {
        Publisher {
            client,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            task_tracker: TaskTracker::new(),
            resolver: Arc::new(OutcomeResolver {
                emitter,
                failure_handler,
                retry,
                shutting_down: CancellationToken::new(),
                abandoned: CancellationToken::new(),
                pending_items: AtomicUsize::new(0),
                abandoned_items: AtomicUsize::new(0),
            }),
            span,
        }
    }

    /// Waits for a delivery slot and starts delivering `batch`.
    ///
    /// The batch is handed back if the publisher is abandoned first.
    pub async fn publish(&self, batch: Batch) -> Result<Option<Batch>, PublisherError> {
        let permit = tokio::select! {
            biased;
            _ = self.resolver.abandoned.cancelled() => return Ok(Some(batch)),
            permit = self.semaphore.clone().acquire_owned() => permit?,
        };
        let client = self.client.clone();
        let resolver = self.resolver.clone();

        self.task_tracker.spawn(
            async move {
                let outcome = tokio::select! {
                    outcome = client.deliver(&batch) => outcome,
                    _ = resolver.abandoned.cancelled() => {
                        resolver.abandon(batch);
                        return;
                    }
                };
                drop(permit);
                resolver.resolve(batch, outcome).await;
            }
            .instrument(self.span.clone()),
        );

        Ok(None)
    }

    /// Returns the batches that were received but never handed to the client.
    async fn run(
        self,
        mut batches: mpsc::UnboundedReceiver<Batch>,
    ) -> Result<Vec<Batch>, PublisherError> {
        let mut undelivered = Vec::new();

        loop {
            let batch = tokio::select! {
                biased;
                _ = self.resolver.abandoned.cancelled() => break,
                batch = batches.recv() => match batch {
                    Some(batch) => batch,
                    None => {
                        info!("delivery channel closed");
                        return Ok(undelivered);
                    }
                },
            };
            self.resolver.pending_items.fetch_add(batch.len(), Ordering::SeqCst);

            if let Some(batch) = self.publish(batch).await? {
                undelivered.push(batch);
                break;
            }
        }

        batches.close();
        while let Ok(batch) = batches.try_recv() {
            self.resolver.pending_items.fetch_add(batch.len(), Ordering::SeqCst);
            undelivered.push(batch);
        }
        Ok(undelivered)
    }

    /// Spawns the worker loop consuming `batches`.
    pub fn spawn(self, batches: mpsc::UnboundedReceiver<Batch>) -> PublisherHandle<C> {
        let span = self.span.clone();
        let handle = PublisherHandle {
            client: self.client.clone(),
            task_tracker: self.task_tracker.clone(),
            resolver: self.resolver.clone(),
            join: None,
            span: span.clone(),
        };
        let join = tokio::spawn(self.run(batches).instrument(span));
        PublisherHandle {
            join: Some(join),
            ..handle
        }
    }
}

pub struct PublisherHandle<C: Client> {
    client: Arc<C>,
    task_tracker: TaskTracker,
    resolver: Arc<OutcomeResolver>,
    join: Option<JoinHandle<Result<Vec<Batch>, PublisherError>>>,
    span: Span,
}

impl<C: Client> PublisherHandle<C> {
    /// Items received by the worker and not yet resolved.
    pub fn pending_items(&self) -> usize {
        self.resolver.pending_items.load(Ordering::SeqCst)
    }

    /// Waits for the worker to drain its channel and for in-flight
    /// deliveries to finish, for at most `grace_period` in total.
    ///
    /// Whatever is left when the grace period runs out is handed to the
    /// failure handler as abandoned before the client is closed. Must be
    /// called after the emitter has been closed, otherwise the channel
    /// never ends.
    pub async fn shutdown(mut self, grace_period: Duration) {
        self.resolver.shutting_down.cancel();
        let deadline = Instant::now() + grace_period;

        let mut undelivered = Vec::new();
        if let Some(mut join) = self.join.take() {
            let joined = match timeout_at(deadline, &mut join).await {
                Ok(joined) => joined,
                Err(_) => {
                    self.resolver.abandoned.cancel();
                    join.await
                }
            };
            match joined {
                Ok(Ok(batches)) => undelivered = batches,
                Ok(Err(e)) => error!(parent: &self.span, "publisher stopped with error: {e}"),
                Err(e) => error!(parent: &self.span, "publisher task failed: {e}"),
            }
        }

        self.task_tracker.close();
        if timeout_at(deadline, self.task_tracker.wait()).await.is_err() {
            self.resolver.abandoned.cancel();
        }
        for batch in undelivered {
            self.resolver.abandon(batch);
        }
        // abandoned deliveries resolve right away once their future is dropped
        self.task_tracker.wait().await;

        let abandoned = self.abandoned_items();
        if abandoned > 0 {
            error!(
                parent: &self.span,
                "abandoned {abandoned} undelivered items after {grace_period:?} grace period"
            );
        }

        self.client.close().await;
        info!(parent: &self.span, "stopped publisher");
    }

    /// Items handed to the failure handler because the grace period ran out.
    pub fn abandoned_items(&self) -> usize {
        self.resolver.abandoned_items.load(Ordering::SeqCst)
    }
}
