//! Rate-state event notification.
//!
//! Listeners hang off a connection's [`crate::RateMonitor`] and hear about
//! snapshot installs, server corrections, and limited-flag transitions.
//! Registration is append-only under a mutex; firing iterates over a
//! snapshot copy taken under that mutex and invokes callbacks strictly
//! outside it, so a callback may register or remove listeners (taking
//! effect from the next event) without corrupting an in-flight
//! notification.

use crate::{RateChangeCode, RateClassId, TRACE_TARGET};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A change in the locally tracked rate state of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateEvent {
    /// A snapshot replaced the connection's whole class set.
    ClassesReplaced {
        /// Ids of the classes now in effect.
        ids: Vec<RateClassId>,
    },
    /// A server correction updated one class's parameters.
    ClassUpdated {
        /// The class the correction applied to.
        id: RateClassId,
        /// The code the server sent with it.
        code: RateChangeCode,
    },
    /// The class crossed into the limited state.
    Limited {
        /// The class that tripped the limit.
        id: RateClassId,
    },
    /// The class recovered from the limited state.
    LimitCleared {
        /// The class that recovered.
        id: RateClassId,
    },
}

/// Callback invoked for every rate event on a connection.
///
/// Callbacks run on whatever thread triggered the transition - the queue
/// worker or an event-routing caller - and must not block for long.
pub type RateListener = Arc<dyn Fn(&RateEvent) + Send + Sync>;

/// Handle for removing a previously registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Append-only listener registry shared by a connection's monitors.
#[derive(Default)]
pub(crate) struct ListenerSet {
    entries: Mutex<Vec<(ListenerId, RateListener)>>,
    next_id: AtomicU64,
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: RateListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.entries
            .lock()
            .expect("listener set mutex poisoned")
            .push((id, listener));
        id
    }

    /// Removes a listener; returns whether it was still registered.
    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock().expect("listener set mutex poisoned");
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Delivers `event` to every listener registered at the time of the call.
    ///
    /// A panicking listener is reported and skipped; the rest still run.
    pub(crate) fn notify(&self, event: &RateEvent) {
        let snapshot: Vec<RateListener> = {
            let entries = self.entries.lock().expect("listener set mutex poisoned");
            entries.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in snapshot {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                let reason = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .map(String::from)
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_owned());
                tracing::warn!(
                    target: TRACE_TARGET,
                    panic = %reason,
                    ?event,
                    "rate listener panicked; remaining listeners still run"
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().expect("listener set mutex poisoned").len()
    }
}
