//! Diagnostics reported by functions while they run.
//!
//! Functions report through [`Environment::report`](crate::Environment::report). Events are
//! buffered per attempt and only reach the [`EventSink`] when the attempt commits, so a
//! function that is restarted several times reports each event once.

use parking_lot::Mutex;

/// Severity of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventKind {
    /// Informational message.
    Info,
    /// Progress report.
    Progress,
    /// Something looks wrong but evaluation continues.
    Warning,
    /// A non-fatal error, e.g. a problem the function recovered from.
    Error,
}

/// A diagnostic emitted while evaluating `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<K> {
    /// Severity.
    pub kind: EventKind,
    /// The key whose function reported the event.
    pub key: K,
    /// Human readable message.
    pub message: String,
}

/// Receiver of committed events.
pub trait EventSink<K>: Send + Sync + 'static {
    /// Handle one event.
    fn handle(&self, event: Event<K>);
}

impl<K, S: EventSink<K>> EventSink<K> for std::sync::Arc<S> {
    fn handle(&self, event: Event<K>) {
        (**self).handle(event)
    }
}

/// Sink that drops every event.
pub struct NoopEventSink;

impl<K> EventSink<K> for NoopEventSink {
    fn handle(&self, _event: Event<K>) {}
}

/// Sink that keeps every event in memory.
pub struct StoredEvents<K> {
    events: Mutex<Vec<Event<K>>>,
}

impl<K> Default for StoredEvents<K> {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }
}

impl<K: Clone> StoredEvents<K> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events received so far.
    pub fn events(&self) -> Vec<Event<K>> {
        self.events.lock().clone()
    }

    /// Remove and return the events received so far.
    pub fn take(&self) -> Vec<Event<K>> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of events received so far.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if nothing was received.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl<K: Send + 'static> EventSink<K> for StoredEvents<K> {
    fn handle(&self, event: Event<K>) {
        self.events.lock().push(event);
    }
}
