//! Ledger lifecycle events
//!
//! Events are dispatched to registered observers in registration order, after
//! the change that produced them has been committed. A failing observer is
//! logged and does not stop the others.

use std::sync::{Arc, RwLock};

use derive_more::Display;
use tracing::{error, trace};

use super::punishment::Sanction;
use super::record::{AccountName, WarningRecord};
use crate::LEDGER_TARGET;

/// Field changed by an edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EditField {
    #[display("reason")]
    Reason,
    #[display("expiration")]
    Expiration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    Added {
        record: WarningRecord,
    },
    Removed {
        record: WarningRecord,
    },
    /// A field changed; `old` is the stored value right before this edit
    Edited {
        record: WarningRecord,
        field: EditField,
        old: String,
        new: String,
    },
    Expired {
        record: WarningRecord,
    },
    Punished {
        account: AccountName,
        sanction: Sanction,
        issuer: String,
        reason: String,
        warning_count: Option<u64>,
    },
}

impl LedgerEvent {
    /// Account the event concerns
    #[must_use]
    pub fn account(&self) -> &AccountName {
        match self {
            Self::Added { record }
            | Self::Removed { record }
            | Self::Edited { record, .. }
            | Self::Expired { record } => &record.account,
            Self::Punished { account, .. } => account,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Removed { .. } => "removed",
            Self::Edited { .. } => "edited",
            Self::Expired { .. } => "expired",
            Self::Punished { .. } => "punished",
        }
    }
}

/// Receives ledger events
pub trait LedgerObserver: Send + Sync {
    /// Handle one event
    ///
    /// # Errors
    /// Errors are logged by the registry and never reach the ledger caller.
    fn on_event(&self, event: &LedgerEvent) -> Result<(), crate::Error>;
}

/// Ordered list of observers
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    observers: Arc<RwLock<Vec<Arc<dyn LedgerObserver>>>>,
}

impl ObserverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer after all existing ones
    pub fn register(&self, observer: Arc<dyn LedgerObserver>) {
        match self.observers.write() {
            Ok(mut observers) => observers.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn LedgerObserver>> {
        match self.observers.read() {
            Ok(observers) => observers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Deliver an event to every observer in order
    pub fn dispatch(&self, event: &LedgerEvent) {
        trace!(target: LEDGER_TARGET, event = event.name(), account = %event.account(), "Dispatching ledger event");
        for observer in self.snapshot() {
            if let Err(e) = observer.on_event(event) {
                error!(
                    target: LEDGER_TARGET,
                    event = event.name(),
                    account = %event.account(),
                    "Ledger observer failed: {e}"
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Observer that remembers every event it sees
    #[derive(Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<LedgerEvent>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<LedgerEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn names(&self) -> Vec<&'static str> {
            self.events().iter().map(LedgerEvent::name).collect()
        }
    }

    impl LedgerObserver for RecordingObserver {
        fn on_event(&self, event: &LedgerEvent) -> Result<(), crate::Error> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::testing::RecordingObserver;
    use super::*;

    struct Tagged {
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl LedgerObserver for Tagged {
        fn on_event(&self, _event: &LedgerEvent) -> Result<(), crate::Error> {
            self.log.lock().unwrap().push(self.tag);
            if self.fail {
                return Err("observer exploded".into());
            }
            Ok(())
        }
    }

    fn punished() -> LedgerEvent {
        LedgerEvent::Punished {
            account: "steve".into(),
            sanction: Sanction::Kick,
            issuer: "Console".to_string(),
            reason: "spam".to_string(),
            warning_count: Some(3),
        }
    }

    #[test]
    fn test_dispatch_order_and_isolation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ObserverRegistry::new();
        for (tag, fail) in [("first", false), ("second", true), ("third", false)] {
            registry.register(Arc::new(Tagged {
                tag,
                log: Arc::clone(&log),
                fail,
            }));
        }

        registry.dispatch(&punished());
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_recording_observer() {
        let registry = ObserverRegistry::new();
        let recorder = Arc::new(RecordingObserver::default());
        registry.register(recorder.clone());
        assert_eq!(registry.len(), 1);

        registry.dispatch(&punished());
        assert_eq!(recorder.names(), vec!["punished"]);
        assert_eq!(recorder.events()[0].account().as_str(), "steve");
    }
}
