//! Controller runtime: feeds intent changes into the work queue and runs the
//! reconcile workers until shutdown.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ReconcileError;
use crate::metrics;
use crate::queue::WorkQueue;
use crate::reconcile::{Reconciler, Requeue};
use crate::resources::RewriteIntent;
use crate::store::{LabelSelector, ObjectKey, ObjectStore, WatchEvent};

/// Whether a change is worth a reconcile.
///
/// Status-only and finalizer-only writes are the controller's own and are
/// ignored; spec changes, annotation changes and deletion requests are not.
pub fn should_reconcile(event: &WatchEvent<RewriteIntent>) -> bool {
    match event {
        WatchEvent::Created(_) | WatchEvent::Deleted(_) => true,
        WatchEvent::Updated { old, new } => {
            old.meta.generation != new.meta.generation
                || old.meta.annotations != new.meta.annotations
                || (new.meta.is_deleting() && !old.meta.is_deleting())
        }
    }
}

fn event_kind(event: &WatchEvent<RewriteIntent>) -> (&'static str, ObjectKey) {
    match event {
        WatchEvent::Created(intent) => ("created", intent.meta.key()),
        WatchEvent::Updated { new, .. } => ("updated", new.meta.key()),
        WatchEvent::Deleted(intent) => ("deleted", intent.meta.key()),
    }
}

/// Watches intents and reconciles them with a pool of workers.
pub struct Controller {
    intents: Arc<dyn ObjectStore<RewriteIntent>>,
    reconciler: Arc<Reconciler>,
    workers: usize,
}

impl Controller {
    /// Create a controller running `workers` concurrent reconciles.
    pub fn new(intents: Arc<dyn ObjectStore<RewriteIntent>>, reconciler: Reconciler, workers: usize) -> Self {
        Self {
            intents,
            reconciler: Arc::new(reconciler),
            workers: workers.max(1),
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ReconcileError> {
        let queue = WorkQueue::new(shutdown.clone());

        // Subscribe before listing so nothing falls between the two.
        let events = self.intents.watch();
        let existing = self
            .intents
            .list(None, &LabelSelector::new())
            .await
            .map_err(ReconcileError::store("error listing intents"))?;
        info!(
            intents = existing.len(),
            workers = self.workers,
            artifact = %self.reconciler.settings().artifact,
            "Starting controller"
        );
        for intent in existing {
            queue.add(intent.meta.key());
        }

        let mut tasks = JoinSet::new();
        tasks.spawn(feed(events, queue.clone(), shutdown.clone()));
        for id in 0..self.workers {
            tasks.spawn(work(id, self.reconciler.clone(), queue.clone()));
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Controller task panicked: {}", e);
                shutdown.cancel();
            }
        }

        info!("Controller stopped");
        Ok(())
    }
}

async fn feed(
    mut events: futures::stream::BoxStream<'static, WatchEvent<RewriteIntent>>,
    queue: WorkQueue<ObjectKey>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!("watch feeder shutting down");
                return;
            }

            event = events.next() => {
                let Some(event) = event else {
                    warn!("intent watch stream ended");
                    return;
                };
                let (kind, key) = event_kind(&event);
                let enqueue = should_reconcile(&event);
                metrics::record_watch_event(kind, enqueue);
                if enqueue {
                    debug!(intent = %key, kind, "enqueue");
                    queue.add(key);
                }
            }
        }
    }
}

async fn work(id: usize, reconciler: Arc<Reconciler>, queue: WorkQueue<ObjectKey>) {
    debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        match reconciler.reconcile(&key).await {
            Ok(Requeue::Now) => {
                queue.forget(&key);
                queue.add(key.clone());
            }
            Ok(Requeue::After(delay)) => {
                queue.forget(&key);
                queue.add_after(key.clone(), delay);
            }
            Ok(Requeue::Never) => queue.forget(&key),
            Err(e) => {
                let delay = queue.add_rate_limited(key.clone());
                debug!(intent = %key, error = %e, delay_ms = delay.as_millis() as u64, "reconcile failed; backing off");
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}
