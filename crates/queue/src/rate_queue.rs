//! One class's FIFO of deferred commands.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rate::RateClassMonitor;
use snac::{OutgoingSnac, SnacTransport};

use crate::TRACE_TARGET;

/// FIFO buffer of commands waiting on one rate class.
///
/// The queue owns a small leaf lock over its contents. Commands are popped
/// under it and handed to the transport after it is released, so a slow
/// wire never blocks enqueues or other classes.
pub(crate) struct RateQueue {
    monitor: Arc<RateClassMonitor>,
    pending: Mutex<VecDeque<Box<dyn OutgoingSnac>>>,
}

impl RateQueue {
    pub(crate) fn new(monitor: Arc<RateClassMonitor>) -> Self {
        Self {
            monitor,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn monitor(&self) -> &Arc<RateClassMonitor> {
        &self.monitor
    }

    /// Appends at the tail. Strict FIFO, no priority reordering.
    pub(crate) fn enqueue(&self, request: Box<dyn OutgoingSnac>) {
        self.pending
            .lock()
            .expect("rate queue mutex poisoned")
            .push_back(request);
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().expect("rate queue mutex poisoned").len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains every pending command in order, for clearing and migration.
    pub(crate) fn take_all(&self) -> VecDeque<Box<dyn OutgoingSnac>> {
        std::mem::take(&mut *self.pending.lock().expect("rate queue mutex poisoned"))
    }

    /// Sends from the head while the class stays safe, judged at `now`.
    ///
    /// Returns `true` when the queue ended empty. The monitor only moves
    /// when the transport reports each send back, so a transport that
    /// reports synchronously makes every pop re-judge against the updated
    /// average.
    pub(crate) fn send_ready_at(&self, transport: &Arc<dyn SnacTransport>, now: Instant) -> bool {
        loop {
            if !self.monitor.safe_to_send_at(now) {
                return self.is_empty();
            }
            let request = {
                let mut pending = self.pending.lock().expect("rate queue mutex poisoned");
                match pending.pop_front() {
                    Some(request) => request,
                    None => return true,
                }
            };
            tracing::trace!(
                target: TRACE_TARGET,
                cmd = %request.cmd_type(),
                class = %self.monitor.class_id(),
                "sending deferred command"
            );
            transport.send_now(request);
        }
    }
}
