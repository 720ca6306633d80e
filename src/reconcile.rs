//! The per-intent state machine.
//!
//! Each pass loads one [`RewriteIntent`], moves it one step towards having
//! its rule in the shared artifact (or out of it, when deleting), and reports
//! when it wants to be looked at again:
//!
//! ```text
//!   (unset) ──► New ──► Processing ⇄ Ready
//!                 │         │
//!                 │         └──► Error (any failure; retried with backoff)
//!                 └─ deleting ─► DeletionBlocked (foreign finalizers)
//!                              └► Deleting ──► finalizer released
//! ```
//!
//! All intents write the same artifact. There is no lock around it: writes
//! are compare-and-swap against the store, and a lost race is retried quietly.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ControllerConfig;
use crate::debounce::{Clock, Debounce, Gate, SystemClock};
use crate::error::ReconcileError;
use crate::events::{Event, EventRecorder, EventTarget, EventType, LogEventRecorder};
use crate::metrics::{self, ReconcileOutcome, Timer};
use crate::names::{self, NameValidator};
use crate::resolver::RecordChecker;
use crate::resources::{ConfigResource, IntentState, RewriteIntent};
use crate::rule::RewriteRule;
use crate::ruleset::RewriteRuleSet;
use crate::store::{Object, ObjectKey, ObjectStore};

/// Delay after writing the artifact, before checking convergence.
pub const WRITE_REQUEUE: Duration = Duration::from_secs(1);
/// Delay between convergence checks that came back negative.
pub const CHECK_REQUEUE: Duration = Duration::from_secs(10);
/// Delay between drift checks once converged.
pub const READY_REQUEUE: Duration = Duration::from_secs(600);
/// Delay while deletion is blocked by foreign finalizers.
pub const BLOCKED_REQUEUE: Duration = Duration::from_secs(10);
/// Delay after losing a write race.
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Event reason for reaching `Ready`.
pub const REASON_SUCCEEDED: &str = "ReconciliationSucceeded";
/// Event reason for reaching `Error`.
pub const REASON_FAILED: &str = "ReconciliationFailed";

/// When to reconcile an intent again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Right away.
    Now,
    /// After a delay.
    After(Duration),
    /// Only on the next change.
    Never,
}

/// Where the artifact lives and how it is written.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Resource holding the artifact.
    pub artifact: ObjectKey,
    /// Data key of the artifact.
    pub artifact_key: String,
    /// Finalizer guarding rule removal.
    pub finalizer: String,
    /// Write spacing.
    pub debounce: Debounce,
}

impl From<&ControllerConfig> for ReconcilerSettings {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            artifact: ObjectKey::new(&config.artifact_namespace, &config.artifact_name),
            artifact_key: config.artifact_key.clone(),
            finalizer: config.finalizer.clone(),
            debounce: Debounce::new(config.debounce_delay()),
        }
    }
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

enum Step {
    Requeue(Requeue),
    /// Finalizer released; the intent is about to vanish.
    Released,
}

enum Write {
    Done,
    Deferred(Duration),
}

/// Drives intents through their lifecycle.
pub struct Reconciler {
    intents: Arc<dyn ObjectStore<RewriteIntent>>,
    configs: Arc<dyn ObjectStore<ConfigResource>>,
    checker: Arc<dyn RecordChecker>,
    events: Arc<dyn EventRecorder>,
    clock: Arc<dyn Clock>,
    validator: NameValidator,
    settings: ReconcilerSettings,
}

impl Reconciler {
    /// Create a reconciler logging its events and using the wall clock.
    pub fn new(
        intents: Arc<dyn ObjectStore<RewriteIntent>>,
        configs: Arc<dyn ObjectStore<ConfigResource>>,
        checker: Arc<dyn RecordChecker>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            intents,
            configs,
            checker,
            events: Arc::new(LogEventRecorder),
            clock: Arc::new(SystemClock),
            validator: NameValidator::new(),
            settings,
        }
    }

    /// Send events to `events`.
    pub fn with_events(mut self, events: Arc<dyn EventRecorder>) -> Self {
        self.events = events;
        self
    }

    /// Take time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Settings in use.
    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Run one pass for the intent at `key`.
    ///
    /// Failures are recorded on the intent (state `Error`, warning event) and
    /// returned; lost write races are not, and come back as a short requeue.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Requeue, ReconcileError> {
        let span = info_span!("reconcile", intent = %key);
        self.reconcile_inner(key).instrument(span).await
    }

    async fn reconcile_inner(&self, key: &ObjectKey) -> Result<Requeue, ReconcileError> {
        let timer = Timer::start();
        debug!("running reconcile");

        let Some(mut intent) = self
            .intents
            .get(key)
            .await
            .map_err(ReconcileError::store("error reading intent"))?
        else {
            info!("not found; ignoring");
            metrics::record_reconcile(ReconcileOutcome::Gone, timer.elapsed());
            return Ok(Requeue::Never);
        };
        let previous = intent.state();
        intent.status.observed_generation = intent.meta.generation;

        let outcome = match self.step(&mut intent).await {
            Ok(Step::Released) => {
                metrics::record_reconcile(ReconcileOutcome::Finalized, timer.elapsed());
                return Ok(Requeue::Never);
            }
            Ok(Step::Requeue(requeue)) => Ok(requeue),
            Err(err) if err.is_transient() => {
                debug!(error = %err, "lost write race; retrying");
                metrics::record_write_conflict();
                metrics::record_reconcile(ReconcileOutcome::Retry, timer.elapsed());
                return Ok(Requeue::After(CONFLICT_REQUEUE));
            }
            Err(err) => {
                warn!(error = %err, "reconcile failed");
                intent.set_state(IntentState::Error, err.to_string());
                self.emit(&intent_target(&intent), EventType::Warning, REASON_FAILED, err.to_string())
                    .await;
                Err(err)
            }
        };

        if let Err(update_err) = self.intents.update(intent.clone()).await {
            if update_err.is_write_conflict() {
                debug!(error = %update_err, "status update lost write race; retrying");
                metrics::record_write_conflict();
                metrics::record_reconcile(ReconcileOutcome::Retry, timer.elapsed());
                return Ok(Requeue::After(CONFLICT_REQUEUE));
            }
            warn!(error = %update_err, "status update failed");
            // Prefer the reconcile failure over the status write failure.
            return match outcome {
                Err(err) => Err(err),
                Ok(_) => Err(ReconcileError::Store {
                    action: "error updating intent status",
                    source: update_err,
                }),
            };
        }

        self.notify_owners(&intent, previous).await;
        metrics::record_reconcile(outcome_of(&intent, previous), timer.elapsed());
        outcome
    }

    async fn step(&self, intent: &mut RewriteIntent) -> Result<Step, ReconcileError> {
        if intent.state().is_none() {
            intent.set_state(IntentState::New, "First seen");
            return Ok(Step::Requeue(Requeue::Now));
        }

        let artifact = self
            .configs
            .get(&self.settings.artifact)
            .await
            .map_err(ReconcileError::store("error reading artifact"))?;
        if artifact.is_none() {
            info!(artifact = %self.settings.artifact, "artifact not found");
        }
        let owner = intent.owner_id();
        let finalizer = self.settings.finalizer.as_str();

        if !intent.meta.is_deleting() {
            if intent.meta.add_finalizer(finalizer) {
                *intent = self
                    .intents
                    .update(intent.clone())
                    .await
                    .map_err(ReconcileError::store("error setting finalizer"))?;
            }

            let rule = RewriteRule::new(&self.validator, &owner, &intent.spec.from, &intent.spec.to)?;
            let mut rules = self.load_rules(artifact.as_ref())?;
            if rules.add_rule(rule)? {
                return match self.write_rules(artifact, &rules).await? {
                    Write::Done => {
                        intent.set_state(IntentState::Processing, "waiting for rewrite rule to be reconciled");
                        Ok(Step::Requeue(Requeue::After(WRITE_REQUEUE)))
                    }
                    Write::Deferred(remaining) => {
                        intent.set_state(IntentState::Processing, "waiting for artifact write window");
                        Ok(Step::Requeue(Requeue::After(remaining.max(WRITE_REQUEUE))))
                    }
                };
            }

            let host = names::wildcard_query_name(&intent.spec.from);
            if self.checker.check_record(&host, &intent.spec.to).await? {
                debug!(host, "dns record active");
                intent.set_state(IntentState::Ready, "rewrite rule completely reconciled");
                Ok(Step::Requeue(Requeue::After(READY_REQUEUE)))
            } else {
                debug!(host, "dns record not active; rechecking");
                intent.set_state(IntentState::Processing, "waiting for rewrite rule to be reconciled");
                Ok(Step::Requeue(Requeue::After(CHECK_REQUEUE)))
            }
        } else if intent.meta.finalizers.iter().any(|f| f != finalizer) {
            intent.set_state(IntentState::DeletionBlocked, "Deletion blocked due to foreign finalizers");
            Ok(Step::Requeue(Requeue::After(BLOCKED_REQUEUE)))
        } else {
            let mut rules = self.load_rules(artifact.as_ref())?;
            if rules.remove_rule(&owner) {
                return match self.write_rules(artifact, &rules).await? {
                    Write::Done => {
                        intent.set_state(IntentState::Deleting, "waiting for rewrite intent to be deleted");
                        Ok(Step::Requeue(Requeue::After(WRITE_REQUEUE)))
                    }
                    Write::Deferred(remaining) => {
                        intent.set_state(IntentState::Deleting, "waiting for artifact write window");
                        Ok(Step::Requeue(Requeue::After(remaining.max(WRITE_REQUEUE))))
                    }
                };
            }

            if intent.meta.remove_finalizer(finalizer) {
                self.intents
                    .update(intent.clone())
                    .await
                    .map_err(ReconcileError::store("error clearing finalizer"))?;
                debug!("finalizer released");
            }
            Ok(Step::Released)
        }
    }

    fn load_rules(&self, artifact: Option<&ConfigResource>) -> Result<RewriteRuleSet, ReconcileError> {
        let Some(artifact) = artifact else {
            return Ok(RewriteRuleSet::new());
        };
        let text = artifact
            .data
            .get(&self.settings.artifact_key)
            .map(String::as_str)
            .unwrap_or_default();
        RewriteRuleSet::parse(&self.validator, text).map_err(|source| ReconcileError::Parse {
            artifact: format!("{}[{}]", self.settings.artifact, self.settings.artifact_key),
            source,
        })
    }

    async fn write_rules(
        &self,
        artifact: Option<ConfigResource>,
        rules: &RewriteRuleSet,
    ) -> Result<Write, ReconcileError> {
        let now = self.clock.now();
        if let Gate::Closed(remaining) = self.settings.debounce.gate(artifact.as_ref(), now) {
            metrics::record_debounce_deferral();
            return Ok(Write::Deferred(remaining));
        }

        let text = rules.to_string();
        let created = artifact.is_none();
        let mut resource = artifact.unwrap_or_else(|| {
            ConfigResource::new(&self.settings.artifact.namespace, &self.settings.artifact.name)
        });
        resource.data.insert(self.settings.artifact_key.clone(), text);
        self.settings.debounce.stamp(&mut resource, now);

        if created {
            self.configs
                .create(resource)
                .await
                .map_err(ReconcileError::store("error creating artifact"))?;
        } else {
            self.configs
                .update(resource)
                .await
                .map_err(ReconcileError::store("error updating artifact"))?;
        }

        let (addresses, hostnames) = rules.counts();
        metrics::record_artifact_write(created);
        metrics::record_rule_counts(addresses, hostnames);
        info!(artifact = %self.settings.artifact, created, rules = rules.len(), "artifact written");
        Ok(Write::Done)
    }

    async fn notify_owners(&self, intent: &RewriteIntent, previous: Option<IntentState>) {
        let current = intent.state();
        if current == previous {
            return;
        }
        let (event_type, reason, verb) = match current {
            Some(IntentState::Ready) => (EventType::Normal, REASON_SUCCEEDED, "successfully reconciled"),
            Some(IntentState::Error) => (EventType::Warning, REASON_FAILED, "reconciliation failed"),
            _ => return,
        };
        for owner in &intent.meta.owner_references {
            let target = EventTarget {
                kind: owner.kind.clone(),
                key: ObjectKey::new(&intent.meta.namespace, &owner.name),
            };
            let message = format!(
                "Rewrite intent {}/{} (host {}) {verb}",
                intent.meta.namespace, intent.meta.name, intent.spec.from
            );
            self.emit(&target, event_type, reason, message).await;
        }
    }

    async fn emit(&self, target: &EventTarget, event_type: EventType, reason: &str, message: String) {
        self.events
            .record(Event {
                target: target.clone(),
                event_type,
                reason: reason.to_string(),
                message,
            })
            .await;
    }
}

fn intent_target(intent: &RewriteIntent) -> EventTarget {
    EventTarget {
        kind: RewriteIntent::KIND.to_string(),
        key: intent.meta.key(),
    }
}

fn outcome_of(intent: &RewriteIntent, previous: Option<IntentState>) -> ReconcileOutcome {
    match intent.state() {
        Some(IntentState::New) if previous.is_none() => ReconcileOutcome::Initialized,
        Some(IntentState::Ready) => ReconcileOutcome::Ready,
        Some(IntentState::Error) => ReconcileOutcome::Error,
        Some(IntentState::DeletionBlocked) => ReconcileOutcome::DeletionBlocked,
        Some(IntentState::Deleting) => ReconcileOutcome::Deleting,
        _ => ReconcileOutcome::Processing,
    }
}
