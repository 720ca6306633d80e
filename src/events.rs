//! Notifications about intents and their owners.

use std::fmt;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::store::ObjectKey;

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Expected progress.
    Normal,
    /// Something needs attention.
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        })
    }
}

/// Object an event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTarget {
    /// Kind of the object.
    pub kind: String,
    /// Namespace and name.
    pub key: ObjectKey,
}

/// A recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Object concerned.
    pub target: EventTarget,
    /// Severity.
    pub event_type: EventType,
    /// Machine-readable reason.
    pub reason: String,
    /// Human-readable message.
    pub message: String,
}

/// Sink for events.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Record an event; failures are the recorder's concern.
    async fn record(&self, event: Event);
}

/// Writes events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEventRecorder;

#[async_trait]
impl EventRecorder for LogEventRecorder {
    async fn record(&self, event: Event) {
        match event.event_type {
            EventType::Normal => info!(
                kind = %event.target.kind,
                object = %event.target.key,
                reason = %event.reason,
                "{}",
                event.message
            ),
            EventType::Warning => warn!(
                kind = %event.target.kind,
                object = %event.target.key,
                reason = %event.reason,
                "{}",
                event.message
            ),
        }
    }
}

/// Keeps events in memory, in recording order.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryEventRecorder {
    events: std::sync::Arc<parking_lot::Mutex<Vec<Event>>>,
}

#[cfg(test)]
impl MemoryEventRecorder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub(crate) fn with_reason(&self, reason: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.reason == reason)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl EventRecorder for MemoryEventRecorder {
    async fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}
