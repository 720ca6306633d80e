//! Rate limiting of artifact writes.
//!
//! The DNS server reloads the artifact on a polling cycle, so writes are spaced
//! by at least the configured delay. The time of the last write travels with
//! the artifact as an RFC 3339 annotation, which keeps the policy correct
//! across restarts and across controller replicas.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::resources::ConfigResource;

/// Annotation carrying the last write time.
pub const LAST_WRITE_ANNOTATION: &str = "dns.cs.sap.com/last-write";

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock.
#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct ManualClock {
    now: std::sync::Arc<parking_lot::Mutex<DateTime<Utc>>>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Arc::new(parking_lot::Mutex::new(start)),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Outcome of asking whether a write may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Write now.
    Open,
    /// Try again after the given time.
    Closed(Duration),
}

/// Minimum spacing between two writes of the artifact.
#[derive(Debug, Clone, Copy)]
pub struct Debounce {
    delay: Duration,
}

impl Debounce {
    /// Policy with the given delay; zero disables it.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Whether the artifact may be written at `now`. A missing artifact or
    /// timestamp never blocks.
    pub fn gate(&self, artifact: Option<&ConfigResource>, now: DateTime<Utc>) -> Gate {
        if self.delay.is_zero() {
            return Gate::Open;
        }
        let Some(last) = artifact.and_then(last_write) else {
            return Gate::Open;
        };

        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= self.delay {
            Gate::Open
        } else {
            let remaining = self.delay - elapsed;
            debug!(last_write = %last, remaining_ms = remaining.as_millis() as u64, "artifact write deferred");
            Gate::Closed(remaining)
        }
    }

    /// Record a write at `now` on the artifact about to be persisted.
    pub fn stamp(&self, artifact: &mut ConfigResource, now: DateTime<Utc>) {
        artifact
            .meta
            .annotations
            .insert(LAST_WRITE_ANNOTATION.to_string(), now.to_rfc3339());
    }
}

fn last_write(artifact: &ConfigResource) -> Option<DateTime<Utc>> {
    let raw = artifact.meta.annotations.get(LAST_WRITE_ANNOTATION)?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
