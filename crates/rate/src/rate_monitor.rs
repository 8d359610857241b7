//! Connection-wide rate tracking.

use crate::events::ListenerSet;
use crate::monitor::RateClassMonitor;
use crate::{
    ListenerId, RateChangeCode, RateClassId, RateClassInfo, RateError, RateEvent, RateListener,
    TRACE_TARGET,
};
use rustc_hash::FxHashMap;
use snac::CmdType;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Default connection-wide error margin, in milliseconds.
///
/// Predictions aim this much above the server's true thresholds to absorb
/// measurement skew between the two ends of the connection.
pub const DEFAULT_ERROR_MARGIN_MS: u64 = 100;

#[derive(Default)]
struct ClassTable {
    by_command: FxHashMap<CmdType, Arc<RateClassMonitor>>,
    by_class: FxHashMap<RateClassId, Arc<RateClassMonitor>>,
    fallback: Option<Arc<RateClassMonitor>>,
}

/// Every rate class the server has advertised for one connection.
///
/// Routes commands to their class monitors, applies snapshots and
/// corrections, and carries the connection's listener registry. Snapshot
/// installation builds the replacement table off to the side and swaps it
/// in under a write lock: readers observe the old class set or the new one,
/// never a mixture.
pub struct RateMonitor {
    table: RwLock<ClassTable>,
    listeners: Arc<ListenerSet>,
    // Shared with every class monitor; margin changes apply in place
    default_margin: Arc<AtomicU64>,
}

impl Default for RateMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl RateMonitor {
    /// Creates a monitor with the standard error margin.
    #[must_use]
    pub fn new() -> Self {
        Self::with_error_margin(Duration::from_millis(DEFAULT_ERROR_MARGIN_MS))
    }

    /// Creates a monitor with a custom connection-wide error margin.
    #[must_use]
    pub fn with_error_margin(margin: Duration) -> Self {
        Self {
            table: RwLock::new(ClassTable::default()),
            listeners: Arc::new(ListenerSet::default()),
            default_margin: Arc::new(AtomicU64::new(
                u64::try_from(margin.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }

    /// Installs a full rate-class snapshot, replacing every monitor.
    ///
    /// Replaying an identical snapshot is idempotent aside from resetting
    /// each class's send history: averages re-seed from the snapshot's
    /// `current_avg` and `last sent` starts over as never.
    pub fn set_rate_classes(&self, classes: Vec<RateClassInfo>) {
        let mut fresh = ClassTable::default();
        let mut ids = Vec::with_capacity(classes.len());
        for info in classes {
            let id = info.id;
            let commands = info.commands.clone();
            let is_default = info.is_default();
            let monitor = Arc::new(RateClassMonitor::with_listeners(
                info,
                Arc::clone(&self.default_margin),
                Arc::clone(&self.listeners),
            ));
            for cmd in commands {
                fresh.by_command.insert(cmd, Arc::clone(&monitor));
            }
            if is_default {
                fresh.fallback = Some(Arc::clone(&monitor));
            }
            fresh.by_class.insert(id, monitor);
            ids.push(id);
        }

        {
            let mut table = self.table.write().expect("rate table lock poisoned");
            *table = fresh;
        }
        tracing::debug!(
            target: TRACE_TARGET,
            classes = ids.len(),
            "rate class snapshot installed"
        );
        self.listeners.notify(&RateEvent::ClassesReplaced { ids });
    }

    /// Applies a server "rate changed" notification to the class it names.
    pub fn rate_changed(
        &self,
        code: RateChangeCode,
        new_info: RateClassInfo,
    ) -> Result<(), RateError> {
        let id = new_info.id;
        let monitor = self
            .monitor_for_class(id)
            .ok_or(RateError::UnknownClass(id))?;
        monitor.update_rate_info(code, new_info)?;
        self.listeners.notify(&RateEvent::ClassUpdated { id, code });
        Ok(())
    }

    /// Routes a completed send to the monitor that counts it.
    ///
    /// Commands neither claimed by a class nor covered by a default class
    /// are not rate limited; their sends leave no trace here.
    pub fn command_sent(&self, cmd_type: CmdType, sent_time: Instant) {
        if let Some(monitor) = self.monitor_for(cmd_type) {
            monitor.register_send(sent_time);
        } else {
            tracing::trace!(
                target: TRACE_TARGET,
                cmd = %cmd_type,
                "send of unclassified command ignored"
            );
        }
    }

    /// The monitor governing `cmd_type`.
    ///
    /// Exact table hit first, then the connection's default class. `None`
    /// means the command is not rate limited - typically because no
    /// snapshot has arrived yet - and callers should send immediately.
    pub fn monitor_for(&self, cmd_type: CmdType) -> Option<Arc<RateClassMonitor>> {
        let table = self.table.read().expect("rate table lock poisoned");
        table
            .by_command
            .get(&cmd_type)
            .or(table.fallback.as_ref())
            .cloned()
    }

    /// The monitor for a specific class id.
    pub fn monitor_for_class(&self, id: RateClassId) -> Option<Arc<RateClassMonitor>> {
        self.table
            .read()
            .expect("rate table lock poisoned")
            .by_class
            .get(&id)
            .cloned()
    }

    /// All installed class monitors, ordered by class id.
    pub fn monitors(&self) -> Vec<Arc<RateClassMonitor>> {
        let table = self.table.read().expect("rate table lock poisoned");
        let mut monitors: Vec<_> = table.by_class.values().cloned().collect();
        monitors.sort_by_key(|monitor| monitor.class_id());
        monitors
    }

    /// The connection-wide default error margin.
    #[must_use]
    pub fn default_error_margin(&self) -> Duration {
        Duration::from_millis(self.default_margin.load(Ordering::Relaxed))
    }

    /// Changes the connection-wide default error margin.
    ///
    /// Takes effect immediately for every installed class that has not set
    /// a per-class override, and for classes installed by later snapshots.
    pub fn set_default_error_margin(&self, margin: Duration) {
        let millis = u64::try_from(margin.as_millis()).unwrap_or(u64::MAX);
        self.default_margin.store(millis, Ordering::Relaxed);
        tracing::debug!(
            target: TRACE_TARGET,
            margin_ms = millis,
            "connection error margin changed"
        );
    }

    /// Registers a listener for this connection's rate events.
    pub fn add_listener(&self, listener: RateListener) -> ListenerId {
        self.listeners.add(listener)
    }

    /// Removes a listener; returns whether it was still registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RateState;
    use snac::family;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn class(id: u16, commands: Vec<CmdType>) -> RateClassInfo {
        RateClassInfo {
            id: RateClassId(id),
            window_size: 10,
            clear_avg: 3000,
            warn_avg: 4000,
            limited_avg: 2500,
            disconnect_avg: 2000,
            current_avg: 6000,
            max: 6000,
            server_state: RateState::Normal,
            commands,
        }
    }

    fn im() -> CmdType {
        CmdType::new(family::ICBM, 0x0006)
    }

    fn user_info() -> CmdType {
        CmdType::new(family::LOCATE, 0x0015)
    }

    #[test]
    fn routes_exact_hit_then_default_then_none() {
        let monitor = RateMonitor::new();
        monitor.set_rate_classes(vec![class(1, vec![im()]), class(2, Vec::new())]);

        let exact = monitor.monitor_for(im()).expect("class 1 claims ICBM");
        assert_eq!(exact.class_id(), RateClassId(1));

        let fallback = monitor.monitor_for(user_info()).expect("default class");
        assert_eq!(fallback.class_id(), RateClassId(2));

        monitor.set_rate_classes(vec![class(1, vec![im()])]);
        assert!(monitor.monitor_for(user_info()).is_none());
    }

    #[test]
    fn no_snapshot_means_nothing_is_classified() {
        let monitor = RateMonitor::new();
        assert!(monitor.monitor_for(im()).is_none());
        assert!(monitor.monitors().is_empty());
    }

    #[test]
    fn rate_changed_routes_by_class_id() {
        let monitor = RateMonitor::new();
        monitor.set_rate_classes(vec![class(1, vec![im()]), class(2, Vec::new())]);

        let mut update = class(1, vec![im()]);
        update.current_avg = 2000;
        monitor
            .rate_changed(RateChangeCode::Limited, update)
            .expect("class 1 exists");

        assert!(monitor.monitor_for(im()).expect("class 1").is_limited());
        assert!(!monitor
            .monitor_for_class(RateClassId(2))
            .expect("class 2")
            .is_limited());
    }

    #[test]
    fn rate_changed_for_unknown_class_is_rejected() {
        let monitor = RateMonitor::new();
        monitor.set_rate_classes(vec![class(1, vec![im()])]);

        let err = monitor
            .rate_changed(RateChangeCode::Warning, class(9, Vec::new()))
            .expect_err("class 9 was never advertised");
        assert_eq!(err, RateError::UnknownClass(RateClassId(9)));
    }

    #[test]
    fn replaying_a_snapshot_resets_send_history() {
        let monitor = RateMonitor::new();
        let snapshot = vec![class(1, vec![im()])];
        monitor.set_rate_classes(snapshot.clone());

        let t0 = Instant::now();
        monitor.command_sent(im(), t0);
        monitor.command_sent(im(), t0 + Duration::from_millis(100));
        assert_eq!(monitor.monitor_for(im()).expect("class 1").current_avg(), 5410);

        monitor.set_rate_classes(snapshot);
        let replayed = monitor.monitor_for(im()).expect("class 1");
        assert_eq!(replayed.current_avg(), 6000);
        assert_eq!(replayed.last_sent(), None);
    }

    #[test]
    fn command_sent_counts_against_the_default_class() {
        let monitor = RateMonitor::new();
        monitor.set_rate_classes(vec![class(1, Vec::new())]);

        let t0 = Instant::now();
        monitor.command_sent(im(), t0);
        monitor.command_sent(im(), t0 + Duration::from_millis(100));

        let fallback = monitor.monitor_for_class(RateClassId(1)).expect("default");
        assert_eq!(fallback.current_avg(), 5410);
    }

    #[test]
    fn unclassified_send_is_ignored() {
        let monitor = RateMonitor::new();
        monitor.set_rate_classes(vec![class(1, vec![im()])]);

        // No panic, no bookkeeping anywhere
        monitor.command_sent(user_info(), Instant::now());
        assert_eq!(monitor.monitor_for(im()).expect("class 1").last_sent(), None);
    }

    #[test]
    fn connection_margin_change_reaches_installed_monitors() {
        let monitor = RateMonitor::new();
        monitor.set_rate_classes(vec![class(1, vec![im()])]);
        let class_monitor = monitor.monitor_for(im()).expect("class 1 claims ICBM");
        assert_eq!(class_monitor.error_margin(), Duration::from_millis(100));

        monitor.set_default_error_margin(Duration::from_millis(400));
        assert_eq!(monitor.default_error_margin(), Duration::from_millis(400));
        assert_eq!(class_monitor.error_margin(), Duration::from_millis(400));

        // A per-class override still wins over the connection default
        class_monitor.set_error_margin(50).expect("non-negative");
        assert_eq!(class_monitor.error_margin(), Duration::from_millis(50));
    }

    #[test]
    fn margin_change_moves_the_safety_threshold() {
        let monitor = RateMonitor::new();
        monitor.set_rate_classes(vec![class(1, vec![im()])]);
        let class_monitor = monitor.monitor_for(im()).expect("class 1 claims ICBM");

        let t0 = Instant::now();
        class_monitor.register_send(t0);
        while class_monitor.safe_to_send_at(t0) {
            class_monitor.register_send(t0);
        }
        let before = class_monitor.optimal_wait_time_at(t0);

        monitor.set_default_error_margin(Duration::from_millis(600));
        assert!(class_monitor.optimal_wait_time_at(t0) > before);
    }

    #[test]
    fn snapshot_replacement_is_atomic_for_readers() {
        let monitor = Arc::new(RateMonitor::new());
        monitor.set_rate_classes(vec![class(1, vec![im()]), class(2, Vec::new())]);

        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let monitor = Arc::clone(&monitor);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let seen = monitor.monitors().len();
                    assert!(seen == 2 || seen == 3, "partial table visible: {seen}");
                    assert!(monitor.monitor_for(im()).is_some());
                }
            })
        };

        for _ in 0..200 {
            monitor.set_rate_classes(vec![
                class(1, vec![im()]),
                class(2, Vec::new()),
                class(3, vec![user_info()]),
            ]);
            monitor.set_rate_classes(vec![class(1, vec![im()]), class(2, Vec::new())]);
        }
        stop.store(true, Ordering::SeqCst);
        reader.join().expect("reader thread panicked");
    }

    #[test]
    fn events_reach_listeners_until_removed() {
        let monitor = RateMonitor::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let id = {
            let events = Arc::clone(&events);
            monitor.add_listener(Arc::new(move |event| {
                events.lock().expect("event log poisoned").push(event.clone());
            }))
        };

        monitor.set_rate_classes(vec![class(1, vec![im()]), class(2, Vec::new())]);
        let mut update = class(1, vec![im()]);
        update.current_avg = 2000;
        monitor
            .rate_changed(RateChangeCode::Limited, update)
            .expect("class 1 exists");

        {
            let log = events.lock().expect("event log poisoned");
            assert_eq!(
                log.as_slice(),
                &[
                    RateEvent::ClassesReplaced {
                        ids: vec![RateClassId(1), RateClassId(2)],
                    },
                    RateEvent::Limited { id: RateClassId(1) },
                    RateEvent::ClassUpdated {
                        id: RateClassId(1),
                        code: RateChangeCode::Limited,
                    },
                ]
            );
        }

        assert!(monitor.remove_listener(id));
        monitor.set_rate_classes(vec![class(1, vec![im()])]);
        assert_eq!(events.lock().expect("event log poisoned").len(), 3);
    }
}
