//! Session lifecycle observers.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::state::IdleReason;

/// Receives lifecycle notifications.
///
/// Callbacks run synchronously on the thread performing the transition.
/// Calling `request_start` or `request_stop` from inside one fails with
/// `SessionError::Reentrant`; spawn a task instead.
pub trait SessionObserver: Send + Sync {
    /// The session entered Active.
    fn on_active(&self) {}

    /// The session went from Active back to Idle.
    fn on_idle(&self, _reason: &IdleReason) {}
}

/// Registration token returned by `register_observer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

thread_local! {
    static NOTIFYING: Cell<bool> = const { Cell::new(false) };
}

/// Returns true while this thread is inside an observer callback.
pub(crate) fn in_callback() -> bool {
    NOTIFYING.with(Cell::get)
}

#[derive(Default)]
pub(crate) struct ObserverRegistry {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ObserverId, Arc<dyn SessionObserver>)>>,
}

impl ObserverRegistry {
    pub(crate) fn register(&self, observer: Arc<dyn SessionObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, observer));
        id
    }

    pub(crate) fn unregister(&self, id: ObserverId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn notify_active(&self) {
        self.notify(|observer| observer.on_active());
    }

    pub(crate) fn notify_idle(&self, reason: &IdleReason) {
        self.notify(|observer| observer.on_idle(reason));
    }

    fn notify(&self, f: impl Fn(&dyn SessionObserver)) {
        // Snapshot so callbacks may register or unregister.
        let snapshot: Vec<_> = self.entries.read().clone();
        let previous = NOTIFYING.with(|flag| flag.replace(true));

        for (id, observer) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                tracing::warn!("Session observer {:?} panicked", id);
            }
        }

        NOTIFYING.with(|flag| flag.set(previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl SessionObserver for Recorder {
        fn on_active(&self) {
            assert!(in_callback());
            self.log.lock().push(format!("{}:active", self.name));
        }

        fn on_idle(&self, reason: &IdleReason) {
            self.log.lock().push(format!("{}:idle:{}", self.name, reason));
        }
    }

    struct Panicky;

    impl SessionObserver for Panicky {
        fn on_active(&self) {
            panic!("observer bug");
        }
    }

    #[test]
    fn notifies_in_registration_order() {
        let registry = ObserverRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            registry.register(Arc::new(Recorder {
                name,
                log: log.clone(),
            }));
        }

        registry.notify_active();
        registry.notify_idle(&IdleReason::Stopped);

        assert_eq!(
            *log.lock(),
            vec![
                "first:active",
                "second:active",
                "first:idle:stopped",
                "second:idle:stopped"
            ]
        );
        assert!(!in_callback());
    }

    #[test]
    fn unregister_removes_only_that_observer() {
        let registry = ObserverRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = registry.register(Arc::new(Recorder {
            name: "first",
            log: log.clone(),
        }));
        registry.register(Arc::new(Recorder {
            name: "second",
            log: log.clone(),
        }));

        assert!(registry.unregister(first));
        assert!(!registry.unregister(first));
        assert_eq!(registry.len(), 1);

        registry.notify_active();
        assert_eq!(*log.lock(), vec!["second:active"]);
    }

    #[test]
    fn panicking_observer_does_not_stop_others() {
        let registry = ObserverRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(Arc::new(Panicky));
        registry.register(Arc::new(Recorder {
            name: "after",
            log: log.clone(),
        }));

        registry.notify_active();
        assert_eq!(*log.lock(), vec!["after:active"]);
        assert!(!in_callback());
    }
}
