//! Change notification bus.
//!
//! Synchronisation emits a stream of events per cycle: a `SynchroniseStart`
//! envelope, then per-file `ChangeStart`/`ChangeSuccess` (or `ChangeFailure`)
//! envelopes wrapping the individual graph changes, then `SynchroniseEnd`.
//! Events fire while the corresponding transaction is still open, so a
//! subscriber observes changes that may yet roll back; `ChangeSuccess` and
//! `ChangeFailure` tell it which.
//!
//! Subscribers are isolated: a failing listener is logged and counted but
//! never affects other listeners or the cycle itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use thiserror::Error;
use tracing::warn;

use crate::graph::NodeId;

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("listener rejected event: {0}")]
    Rejected(String),

    #[error("listener failed: {0}")]
    Failed(String),
}

/// One observable change.
///
/// The `transient` flag marks element/attribute/reference events fired from a
/// batch load of a brand-new file; consumers that mirror the graph can skip
/// transient events and read the file wholesale afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    SynchroniseStart,
    SynchroniseEnd,

    /// Opens the per-file envelope. `file` is the full file identifier
    /// (repository URL and path).
    ChangeStart { file: String },
    ChangeSuccess { file: String },
    ChangeFailure { file: String },

    MetamodelAdded { uri: String },
    TypeAdded { metamodel: String, name: String },

    FileAdded { repository: String, path: String },
    FileRemoved { repository: String, path: String },

    ElementAdded { element: NodeId, transient: bool },
    ElementRemoved { element: NodeId, transient: bool },
    AttributeUpdated {
        element: NodeId,
        name: String,
        transient: bool,
    },
    AttributeRemoved {
        element: NodeId,
        name: String,
        transient: bool,
    },
    ReferenceAdded {
        source: NodeId,
        target: NodeId,
        label: String,
        transient: bool,
    },
    ReferenceRemoved {
        source: NodeId,
        target: NodeId,
        label: String,
        transient: bool,
    },
}

/// Receives every event emitted during synchronisation.
///
/// Callbacks run on the synchronisation task and must not block; anything
/// slow belongs on a channel drained elsewhere.
pub trait ChangeListener: Send + Sync {
    /// Stable name; subscribing a second listener under the same name
    /// replaces the first.
    fn name(&self) -> &str;

    fn on_event(&self, event: &ChangeEvent) -> Result<(), ListenerError>;
}

#[derive(Default)]
pub struct ChangeBus {
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
    error_counts: Mutex<HashMap<String, u64>>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener`, replacing any existing listener with the same
    /// name.
    pub fn subscribe(&self, listener: Arc<dyn ChangeListener>) {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|l| l.name() != listener.name());
        listeners.push(listener);
    }

    /// Removes the listener registered under `name`, if any. Returns whether
    /// one was removed.
    pub fn unsubscribe(&self, name: &str) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| l.name() != name);
        listeners.len() != before
    }

    pub fn listener_names(&self) -> Vec<String> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|l| l.name().to_string())
            .collect()
    }

    /// Delivers `event` to every subscriber. Listener failures are logged,
    /// counted against the listener, and otherwise swallowed.
    pub fn emit(&self, event: &ChangeEvent) {
        let snapshot: Vec<Arc<dyn ChangeListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in snapshot {
            if let Err(err) = listener.on_event(event) {
                warn!(listener = listener.name(), %err, "change listener failed");
                let mut counts = self
                    .error_counts
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                *counts.entry(listener.name().to_string()).or_insert(0) += 1;
            }
        }
    }

    /// How many events the listener registered under `name` has failed on.
    pub fn error_count(&self, name: &str) -> u64 {
        self.error_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        name: String,
        seen: Mutex<Vec<ChangeEvent>>,
    }

    impl Recorder {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl ChangeListener for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_event(&self, event: &ChangeEvent) -> Result<(), ListenerError> {
            self.seen.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Failing {
        calls: AtomicUsize,
    }

    impl ChangeListener for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_event(&self, _event: &ChangeEvent) -> Result<(), ListenerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ListenerError::Failed("boom".to_string()))
        }
    }

    #[test]
    fn test_emit_reaches_all_listeners() {
        let bus = ChangeBus::new();
        let a = Recorder::new("a");
        let b = Recorder::new("b");
        bus.subscribe(a.clone());
        bus.subscribe(b.clone());

        bus.emit(&ChangeEvent::SynchroniseStart);

        assert_eq!(a.seen.lock().unwrap().len(), 1);
        assert_eq!(b.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_subscribe_same_name_replaces() {
        let bus = ChangeBus::new();
        let first = Recorder::new("mirror");
        let second = Recorder::new("mirror");
        bus.subscribe(first.clone());
        bus.subscribe(second.clone());

        bus.emit(&ChangeEvent::SynchroniseStart);

        assert!(first.seen.lock().unwrap().is_empty());
        assert_eq!(second.seen.lock().unwrap().len(), 1);
        assert_eq!(bus.listener_names(), vec!["mirror".to_string()]);
    }

    #[test]
    fn test_failing_listener_is_isolated_and_counted() {
        let bus = ChangeBus::new();
        let failing = Arc::new(Failing {
            calls: AtomicUsize::new(0),
        });
        let healthy = Recorder::new("healthy");
        bus.subscribe(failing.clone());
        bus.subscribe(healthy.clone());

        bus.emit(&ChangeEvent::SynchroniseStart);
        bus.emit(&ChangeEvent::SynchroniseEnd);

        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
        assert_eq!(healthy.seen.lock().unwrap().len(), 2);
        assert_eq!(bus.error_count("failing"), 2);
        assert_eq!(bus.error_count("healthy"), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = ChangeBus::new();
        let listener = Recorder::new("a");
        bus.subscribe(listener.clone());

        assert!(bus.unsubscribe("a"));
        assert!(!bus.unsubscribe("a"));
        bus.emit(&ChangeEvent::SynchroniseStart);
        assert!(listener.seen.lock().unwrap().is_empty());
    }
}
