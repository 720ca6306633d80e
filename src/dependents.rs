//! Intents derived from annotated resources.
//!
//! A resource carrying the `masquerade-to` annotation asks for one intent per
//! host it exposes, all pointing at the annotated target. [`DependentManager`]
//! keeps that set of dependent intents in line with the resource: it creates
//! missing ones, deletes stale ones, and holds a finalizer on the resource for
//! as long as any dependent still exists. [`DependentController`] runs the
//! manager for every change of an owner kind.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ReconcileError;
use crate::metrics;
use crate::queue::WorkQueue;
use crate::reconcile::CONFLICT_REQUEUE;
use crate::resources::{Ingress, IntentSpec, RewriteIntent};
use crate::store::{LabelSelector, Object, ObjectKey, ObjectMeta, ObjectStore, OwnerReference, WatchEvent};

/// Group of the owning resource.
pub const LABEL_CONTROLLER_GROUP: &str = "dns.cs.sap.com/controller-group";
/// Version of the owning resource.
pub const LABEL_CONTROLLER_VERSION: &str = "dns.cs.sap.com/controller-version";
/// Kind of the owning resource.
pub const LABEL_CONTROLLER_KIND: &str = "dns.cs.sap.com/controller-kind";
/// Name of the owning resource.
pub const LABEL_CONTROLLER_NAME: &str = "dns.cs.sap.com/controller-name";
/// Uid of the owning resource; dependents are selected by it.
pub const LABEL_CONTROLLER_UID: &str = "dns.cs.sap.com/controller-uid";

/// Annotation naming the target of all hosts of a resource.
pub const ANNOTATION_MASQUERADE_TO: &str = "dns.cs.sap.com/masquerade-to";
/// Previous name of [`ANNOTATION_MASQUERADE_TO`], still honored.
pub const ANNOTATION_MASQUERADE_TO_LEGACY: &str = "masquerading-operator.dns.sap.com/masquerade-to";

/// Target requested by the resource's annotations, if any.
pub fn masquerade_target(meta: &ObjectMeta) -> Option<&str> {
    [ANNOTATION_MASQUERADE_TO, ANNOTATION_MASQUERADE_TO_LEGACY]
        .into_iter()
        .filter_map(|key| meta.annotations.get(key))
        .map(String::as_str)
        .find(|to| !to.is_empty())
}

/// Keeps the dependent intents of resources of kind `O` in sync.
pub struct DependentManager<O: Object> {
    owners: Arc<dyn ObjectStore<O>>,
    intents: Arc<dyn ObjectStore<RewriteIntent>>,
    api_version: String,
    finalizer: String,
}

impl<O: Object> DependentManager<O> {
    /// Manager for owners of API version `api_version` (`group/version` or
    /// just `version` for the core group).
    pub fn new(
        owners: Arc<dyn ObjectStore<O>>,
        intents: Arc<dyn ObjectStore<RewriteIntent>>,
        api_version: impl Into<String>,
        finalizer: impl Into<String>,
    ) -> Self {
        Self {
            owners,
            intents,
            api_version: api_version.into(),
            finalizer: finalizer.into(),
        }
    }

    /// Bring the dependents of `owner` in line with `hosts`.
    ///
    /// Writes `owner` back when its finalizer changes, so `owner` is replaced
    /// by the stored version. Returns the number of dependents kept; those
    /// being deleted no longer count.
    pub async fn sync(&self, owner: &mut O, hosts: &[String]) -> Result<usize, ReconcileError> {
        let meta = owner.meta();
        let selector = LabelSelector::from([(LABEL_CONTROLLER_UID.to_string(), meta.uid.clone())]);
        let existing = self
            .intents
            .list(Some(&meta.namespace), &selector)
            .await
            .map_err(ReconcileError::store("error listing dependent intents"))?;
        let mut remaining = existing.len();

        let mut keep: Vec<String> = Vec::new();
        if !meta.is_deleting() {
            if let Some(to) = masquerade_target(meta).map(str::to_string) {
                if owner.meta_mut().add_finalizer(&self.finalizer) {
                    *owner = self
                        .owners
                        .update(owner.clone())
                        .await
                        .map_err(ReconcileError::store("error adding finalizer"))?;
                }

                for from in hosts {
                    let found = existing
                        .iter()
                        .find(|intent| intent.spec.from == *from && intent.spec.to == to);
                    match found {
                        Some(intent) => keep.push(intent.meta.uid.clone()),
                        None => {
                            let created = self
                                .intents
                                .create(self.build_intent(owner.meta(), from, &to))
                                .await
                                .map_err(ReconcileError::store("error creating dependent intent"))?;
                            info!(intent = %created.meta.key(), from = %from, to = %to, "created dependent intent");
                            remaining += 1;
                            keep.push(created.meta.uid);
                        }
                    }
                }
            }
        }

        for intent in existing.iter().filter(|i| !keep.contains(&i.meta.uid)) {
            if !intent.meta.is_deleting() {
                self.intents
                    .delete(&intent.meta.key())
                    .await
                    .map_err(ReconcileError::store("error deleting dependent intent"))?;
                debug!(intent = %intent.meta.key(), "deleted stale dependent intent");
            }
            remaining -= 1;
        }

        if remaining == 0 && owner.meta_mut().remove_finalizer(&self.finalizer) {
            *owner = self
                .owners
                .update(owner.clone())
                .await
                .map_err(ReconcileError::store("error removing finalizer"))?;
        }
        Ok(remaining)
    }

    /// Fetch the owner stored under `key` and sync it against its own hosts.
    /// A missing owner has nothing left to sync.
    pub async fn sync_key(&self, key: &ObjectKey) -> Result<(), ReconcileError>
    where
        O: HostOwner,
    {
        let Some(mut owner) = self
            .owners
            .get(key)
            .await
            .map_err(ReconcileError::store("error getting owner"))?
        else {
            debug!(owner = %key, "owner not found; ignoring");
            return Ok(());
        };
        let hosts = owner.hosts();
        let remaining = self.sync(&mut owner, &hosts).await?;
        debug!(owner = %key, hosts = hosts.len(), remaining, "dependents synced");
        Ok(())
    }

    fn build_intent(&self, owner: &ObjectMeta, from: &str, to: &str) -> RewriteIntent {
        let (group, version) = match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        };
        let mut meta = ObjectMeta::named(&owner.namespace, "");
        meta.generate_name = Some(format!("{}-", owner.name));
        meta.labels = [
            (LABEL_CONTROLLER_GROUP, group),
            (LABEL_CONTROLLER_VERSION, version),
            (LABEL_CONTROLLER_KIND, O::KIND),
            (LABEL_CONTROLLER_NAME, owner.name.as_str()),
            (LABEL_CONTROLLER_UID, owner.uid.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        meta.owner_references.push(OwnerReference {
            api_version: self.api_version.clone(),
            kind: O::KIND.to_string(),
            name: owner.name.clone(),
            uid: owner.uid.clone(),
        });

        RewriteIntent {
            meta,
            spec: IntentSpec {
                from: from.to_string(),
                to: to.to_string(),
            },
            status: Default::default(),
        }
    }
}

/// A resource kind whose host names can be masqueraded.
pub trait HostOwner: Object {
    /// Distinct, non-empty host names exposed by the resource.
    fn hosts(&self) -> Vec<String>;
}

impl HostOwner for Ingress {
    fn hosts(&self) -> Vec<String> {
        self.rules
            .iter()
            .filter(|host| !host.is_empty())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Watches owners of kind `O` and syncs their dependent intents.
pub struct DependentController<O: HostOwner> {
    manager: Arc<DependentManager<O>>,
}

impl<O: HostOwner> DependentController<O> {
    /// Create a controller driving `manager`.
    pub fn new(manager: DependentManager<O>) -> Self {
        Self {
            manager: Arc::new(manager),
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ReconcileError> {
        let queue = WorkQueue::new(shutdown.clone());

        let events = self.manager.owners.watch();
        let existing = self
            .manager
            .owners
            .list(None, &LabelSelector::new())
            .await
            .map_err(ReconcileError::store("error listing owners"))?;
        info!(kind = O::KIND, owners = existing.len(), "Starting dependent controller");
        for owner in existing {
            queue.add(owner.meta().key());
        }

        let mut tasks = JoinSet::new();
        tasks.spawn(feed_owners::<O>(events, queue.clone(), shutdown.clone()));
        tasks.spawn(sync_owners(self.manager.clone(), queue));

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Dependent controller task panicked: {}", e);
                shutdown.cancel();
            }
        }

        info!(kind = O::KIND, "Dependent controller stopped");
        Ok(())
    }
}

async fn feed_owners<O: HostOwner>(
    mut events: BoxStream<'static, WatchEvent<O>>,
    queue: WorkQueue<ObjectKey>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;

            _ = shutdown.cancelled() => return,

            event = events.next() => event,
        };
        let (kind, key) = match event {
            Some(WatchEvent::Created(owner)) => ("created", owner.meta().key()),
            Some(WatchEvent::Updated { new, .. }) => ("updated", new.meta().key()),
            Some(WatchEvent::Deleted(_)) => {
                metrics::record_watch_event("deleted", false);
                continue;
            }
            None => {
                warn!(kind = O::KIND, "owner watch stream ended");
                return;
            }
        };
        metrics::record_watch_event(kind, true);
        queue.add(key);
    }
}

async fn sync_owners<O: HostOwner>(manager: Arc<DependentManager<O>>, queue: WorkQueue<ObjectKey>) {
    while let Some(key) = queue.get().await {
        match manager.sync_key(&key).await {
            Ok(()) => queue.forget(&key),
            Err(e) if e.is_transient() => {
                queue.forget(&key);
                queue.add_after(key.clone(), CONFLICT_REQUEUE);
            }
            Err(e) => {
                let delay = queue.add_rate_limited(key.clone());
                warn!(owner = %key, error = %e, delay_ms = delay.as_millis() as u64, "dependent sync failed; backing off");
            }
        }
        queue.done(&key);
    }
}
