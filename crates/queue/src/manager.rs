//! Connection registry and the public scheduling entry points.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rate::{RateChangeCode, RateClassInfo, RateMonitor};
use snac::{CmdType, OutgoingSnac, SnacTransport};

use crate::TRACE_TARGET;
use crate::connection::{ConnectionQueueMgr, QueueStats};
use crate::error::QueueError;

/// Opaque handle for one attached connection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Returns the numeric value of this connection id.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rate-limited outgoing-command scheduling for a whole client session.
///
/// One instance serves every OSCAR connection the client holds. Each
/// attached transport gets its own rate monitor, per-class queues, and
/// worker; connections never share rate state. All entry points are safe
/// to call from any thread.
pub struct RateLimitingQueueMgr {
    connections: DashMap<ConnectionId, Arc<ConnectionQueueMgr>>,
    next_id: AtomicU64,
}

impl Default for RateLimitingQueueMgr {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitingQueueMgr {
    /// Creates a manager with no attached connections.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attaches a connection, wiring a fresh monitor and queue set to its
    /// transport.
    pub fn attach(&self, transport: Arc<dyn SnacTransport>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections
            .insert(id, Arc::new(ConnectionQueueMgr::new(transport)));
        tracing::debug!(target: TRACE_TARGET, connection = %id, "connection attached");
        id
    }

    /// Detaches a connection, stopping its runner and dropping all of its
    /// state, pending commands included.
    pub fn detach(&self, id: ConnectionId) -> Result<(), QueueError> {
        let (_, connection) = self
            .connections
            .remove(&id)
            .ok_or(QueueError::UnknownConnection(id))?;
        connection.shut_down();
        tracing::debug!(target: TRACE_TARGET, connection = %id, "connection detached");
        Ok(())
    }

    /// Queues one outgoing command, or sends it immediately when no rate
    /// class claims it.
    pub fn queue_snac(
        &self,
        id: ConnectionId,
        request: Box<dyn OutgoingSnac>,
    ) -> Result<(), QueueError> {
        self.connection(id)?.queue_snac(request);
        Ok(())
    }

    /// Installs a full rate-class snapshot for a connection.
    pub fn rate_classes_received(
        &self,
        id: ConnectionId,
        classes: Vec<RateClassInfo>,
    ) -> Result<(), QueueError> {
        self.connection(id)?.rate_classes_received(classes);
        Ok(())
    }

    /// Applies a single-class server correction.
    pub fn rate_changed(
        &self,
        id: ConnectionId,
        code: RateChangeCode,
        new_info: RateClassInfo,
    ) -> Result<(), QueueError> {
        self.connection(id)?.rate_changed(code, new_info)?;
        Ok(())
    }

    /// Reports a command actually written to the wire.
    pub fn command_sent(
        &self,
        id: ConnectionId,
        cmd_type: CmdType,
        sent_time: Instant,
    ) -> Result<(), QueueError> {
        self.connection(id)?.command_sent(cmd_type, sent_time);
        Ok(())
    }

    /// Holds all of a connection's queued commands until unpaused.
    pub fn pause(&self, id: ConnectionId) -> Result<(), QueueError> {
        self.connection(id)?.pause();
        Ok(())
    }

    /// Releases a pause and immediately re-triggers delivery.
    pub fn unpause(&self, id: ConnectionId) -> Result<(), QueueError> {
        self.connection(id)?.unpause();
        Ok(())
    }

    /// Discards a connection's pending commands and clears its pause flag.
    pub fn clear_queue(&self, id: ConnectionId) -> Result<(), QueueError> {
        self.connection(id)?.clear_queue();
        Ok(())
    }

    /// Makes new sends bypass the queues; queued work still drains at
    /// pace.
    pub fn set_avoid_limiting(&self, id: ConnectionId, avoid: bool) -> Result<(), QueueError> {
        self.connection(id)?.set_avoid_limiting(avoid);
        Ok(())
    }

    /// Sets the connection-wide error margin.
    ///
    /// Classes that set their own margin through
    /// [`rate::RateClassMonitor::set_error_margin`] keep their override;
    /// everything else follows the new default immediately.
    pub fn set_error_margin(&self, id: ConnectionId, margin: Duration) -> Result<(), QueueError> {
        self.connection(id)?.set_error_margin(margin);
        Ok(())
    }

    /// Whether new sends on the connection currently bypass the queues.
    pub fn avoids_limiting(&self, id: ConnectionId) -> Result<bool, QueueError> {
        Ok(self.connection(id)?.avoids_limiting())
    }

    /// The connection's rate monitor, for listener registration and rate
    /// inspection.
    pub fn rate_monitor(&self, id: ConnectionId) -> Result<Arc<RateMonitor>, QueueError> {
        Ok(self.connection(id)?.rate_monitor())
    }

    /// Pending-queue counts for a connection.
    pub fn queue_stats(&self, id: ConnectionId) -> Result<QueueStats, QueueError> {
        Ok(self.connection(id)?.queue_stats())
    }

    /// Whether `id` names an attached connection.
    #[must_use]
    pub fn is_attached(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Number of attached connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // Clones the connection handle out so no registry shard guard is held
    // across calls into the connection
    fn connection(&self, id: ConnectionId) -> Result<Arc<ConnectionQueueMgr>, QueueError> {
        self.connections
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(QueueError::UnknownConnection(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rate::{RateClassId, RateError, RateState};
    use snac::family;

    struct NullTransport;

    impl SnacTransport for NullTransport {
        fn send_now(&self, _snac: Box<dyn OutgoingSnac>) {}
    }

    struct Cmd(CmdType);

    impl OutgoingSnac for Cmd {
        fn cmd_type(&self) -> CmdType {
            self.0
        }
    }

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

    #[test]
    fn attach_mints_distinct_ids_and_detach_forgets() {
        let mgr = RateLimitingQueueMgr::new();
        let a = mgr.attach(Arc::new(NullTransport));
        let b = mgr.attach(Arc::new(NullTransport));
        assert_ne!(a, b);
        assert_eq!(mgr.connection_count(), 2);
        assert!(mgr.is_attached(a));

        mgr.detach(a).expect("a is attached");
        assert!(!mgr.is_attached(a));
        assert_eq!(mgr.connection_count(), 1);
        assert_eq!(mgr.detach(a), Err(QueueError::UnknownConnection(a)));
    }

    #[test]
    fn operations_on_unknown_ids_are_rejected() {
        let mgr = RateLimitingQueueMgr::new();
        let id = mgr.attach(Arc::new(NullTransport));
        mgr.detach(id).expect("attached");

        let unknown = QueueError::UnknownConnection(id);
        assert_eq!(
            mgr.queue_snac(id, Box::new(Cmd(im()))).expect_err("gone"),
            unknown
        );
        assert_eq!(mgr.pause(id).expect_err("gone"), unknown);
        assert_eq!(mgr.clear_queue(id).expect_err("gone"), unknown);
        assert_eq!(
            mgr.command_sent(id, im(), Instant::now()).expect_err("gone"),
            unknown
        );
        assert_eq!(mgr.queue_stats(id).expect_err("gone"), unknown);
        assert_eq!(mgr.avoids_limiting(id).expect_err("gone"), unknown);
    }

    #[test]
    fn rate_changed_distinguishes_unknown_connection_from_unknown_class() {
        let mgr = RateLimitingQueueMgr::new();
        let id = mgr.attach(Arc::new(NullTransport));
        mgr.rate_classes_received(id, vec![class(1, vec![im()])])
            .expect("attached");

        let err = mgr
            .rate_changed(id, RateChangeCode::Warning, class(9, Vec::new()))
            .expect_err("class 9 was never advertised");
        assert_eq!(
            err,
            QueueError::Rate(RateError::UnknownClass(RateClassId(9)))
        );

        mgr.detach(id).expect("attached");
        let err = mgr
            .rate_changed(id, RateChangeCode::Warning, class(1, vec![im()]))
            .expect_err("connection is gone");
        assert_eq!(err, QueueError::UnknownConnection(id));
    }

    #[test]
    fn rate_monitor_accessor_shares_connection_state() {
        let mgr = RateLimitingQueueMgr::new();
        let id = mgr.attach(Arc::new(NullTransport));
        mgr.rate_classes_received(id, vec![class(1, vec![im()])])
            .expect("attached");

        let monitor = mgr.rate_monitor(id).expect("attached");
        let im_monitor = monitor.monitor_for(im()).expect("class 1 claims ICBM");
        assert_eq!(im_monitor.class_id(), RateClassId(1));
    }

    #[test]
    fn error_margin_is_settable_per_attached_connection() {
        let mgr = RateLimitingQueueMgr::new();
        let id = mgr.attach(Arc::new(NullTransport));
        mgr.rate_classes_received(id, vec![class(1, vec![im()])])
            .expect("attached");

        mgr.set_error_margin(id, Duration::from_millis(400))
            .expect("attached");
        let monitor = mgr.rate_monitor(id).expect("attached");
        assert_eq!(monitor.default_error_margin(), Duration::from_millis(400));
        assert_eq!(
            monitor.monitor_for(im()).expect("class 1").error_margin(),
            Duration::from_millis(400)
        );

        mgr.detach(id).expect("attached");
        assert_eq!(
            mgr.set_error_margin(id, Duration::ZERO).expect_err("gone"),
            QueueError::UnknownConnection(id)
        );
    }

    #[test]
    fn queue_stats_are_empty_without_pending_work() {
        let mgr = RateLimitingQueueMgr::new();
        let id = mgr.attach(Arc::new(NullTransport));
        let stats = mgr.queue_stats(id).expect("attached");
        assert_eq!(stats.total, 0);
        assert!(stats.per_class.is_empty());
    }
}
