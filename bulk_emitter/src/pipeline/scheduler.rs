use std::time::Duration;

use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument, Span};

use super::batching::emitter::BatchEmitter;

/// Fires the time-triggered flush once per delivery interval.
///
/// The flush runs inline in the timer task, so a slow tick delays the next
/// one instead of overlapping with it; ticks missed meanwhile are skipped.
pub struct Scheduler {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    span: Span,
}

impl Scheduler {
    pub fn start(interval: Duration, emitter: BatchEmitter, span: Span) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(
            async move {
                let mut ticker = interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Some(id) = emitter.notify_on_timer() {
                                debug!("timer flushed batch {id}");
                            }
                        }
                    }
                }
                debug!("scheduler stopped");
            }
            .instrument(span.clone()),
        );

        Scheduler { cancel, task, span }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signals the timer task without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stops the timer; no time-triggered flush starts after this returns.
    pub async fn stop(self) {
        self.cancel();
        let Scheduler { task, span, .. } = self;
        if let Err(e) = task.await {
            error!(parent: &span, "scheduler task failed: {e}");
        }
    }
}
