//! Per-connection queue state: monitor, queue table, runner, and flags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rate::{RateChangeCode, RateClassId, RateClassInfo, RateError, RateMonitor};
use rustc_hash::FxHashMap;
use snac::{CmdType, OutgoingSnac, SnacTransport};

use crate::TRACE_TARGET;
use crate::rate_queue::RateQueue;
use crate::runner::{FutureEventQueue, QueueRunner};

/// Pending-queue snapshot for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Pending command count per rate class, ordered by class id.
    pub per_class: Vec<(RateClassId, usize)>,
    /// Total pending commands across all classes.
    pub total: usize,
}

/// The flushable queue set the runner drives for one connection.
struct ConnectionQueues {
    transport: Arc<dyn SnacTransport>,
    table: Mutex<FxHashMap<RateClassId, Arc<RateQueue>>>,
    paused: AtomicBool,
}

impl ConnectionQueues {
    /// Flush pass with the safety clock injected; waits are still measured
    /// against the live clock, so a class that turned safe mid-pass can
    /// floor to zero and must be normalized.
    fn flush_at(&self, now: Instant) -> Option<Duration> {
        // Paused queues are never ready and carry no deadline
        if self.paused.load(Ordering::SeqCst) {
            return None;
        }
        let queues: Vec<Arc<RateQueue>> = {
            let table = self.table.lock().expect("queue table mutex poisoned");
            table.values().cloned().collect()
        };

        let mut next_wait: Option<Duration> = None;
        for queue in queues {
            if queue.send_ready_at(&self.transport, now) {
                continue;
            }
            let wait = queue.monitor().optimal_wait_time();
            next_wait = Some(next_wait.map_or(wait, |current| current.min(wait)));
        }
        // A zero wait would make the runner spin on clock quantization
        next_wait.map(|wait| wait.max(Duration::from_millis(1)))
    }
}

impl FutureEventQueue for ConnectionQueues {
    fn flush_queues(&self) -> Option<Duration> {
        self.flush_at(Instant::now())
    }
}

/// Everything the scheduler tracks for one attached connection.
pub(crate) struct ConnectionQueueMgr {
    transport: Arc<dyn SnacTransport>,
    monitor: Arc<RateMonitor>,
    queues: Arc<ConnectionQueues>,
    runner: QueueRunner<ConnectionQueues>,
    avoid_limiting: AtomicBool,
}

impl ConnectionQueueMgr {
    pub(crate) fn new(transport: Arc<dyn SnacTransport>) -> Self {
        let monitor = Arc::new(RateMonitor::new());
        let queues = Arc::new(ConnectionQueues {
            transport: Arc::clone(&transport),
            table: Mutex::new(FxHashMap::default()),
            paused: AtomicBool::new(false),
        });
        let runner = QueueRunner::new(Arc::clone(&queues));
        Self {
            transport,
            monitor,
            queues,
            runner,
            avoid_limiting: AtomicBool::new(false),
        }
    }

    pub(crate) fn rate_monitor(&self) -> Arc<RateMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Routes one outgoing command: bypass, enqueue, or immediate send.
    pub(crate) fn queue_snac(&self, request: Box<dyn OutgoingSnac>) {
        let cmd = request.cmd_type();
        if self.avoid_limiting.load(Ordering::SeqCst) {
            tracing::trace!(target: TRACE_TARGET, cmd = %cmd, "avoid-limiting on, sending directly");
            self.transport.send_now(request);
            return;
        }
        let Some(monitor) = self.monitor.monitor_for(cmd) else {
            tracing::trace!(target: TRACE_TARGET, cmd = %cmd, "command not rate limited, sending directly");
            self.transport.send_now(request);
            return;
        };
        let queue = {
            let table = self.queues.table.lock().expect("queue table mutex poisoned");
            table.get(&monitor.class_id()).cloned()
        };
        match queue {
            Some(queue) => {
                tracing::trace!(
                    target: TRACE_TARGET,
                    cmd = %cmd,
                    class = %monitor.class_id(),
                    "deferring command"
                );
                queue.enqueue(request);
                self.runner.update();
            }
            None => {
                // The class table and queue table are rebuilt in two
                // steps; a command classified in the gap goes straight out
                self.transport.send_now(request);
            }
        }
    }

    /// Installs a snapshot and rebuilds the queue table around it.
    pub(crate) fn rate_classes_received(&self, classes: Vec<RateClassInfo>) {
        self.monitor.set_rate_classes(classes);
        self.rebuild_queues();
        self.runner.update();
    }

    fn rebuild_queues(&self) {
        let fresh: FxHashMap<RateClassId, Arc<RateQueue>> = self
            .monitor
            .monitors()
            .into_iter()
            .map(|monitor| (monitor.class_id(), Arc::new(RateQueue::new(monitor))))
            .collect();

        let mut orphaned: Vec<Box<dyn OutgoingSnac>> = Vec::new();
        {
            let mut table = self.queues.table.lock().expect("queue table mutex poisoned");
            for (id, queue) in table.drain() {
                let pending = queue.take_all();
                if pending.is_empty() {
                    continue;
                }
                if let Some(surviving) = fresh.get(&id) {
                    tracing::debug!(
                        target: TRACE_TARGET,
                        class = %id,
                        moved = pending.len(),
                        "migrating pending commands to the replacement class"
                    );
                    for request in pending {
                        surviving.enqueue(request);
                    }
                } else {
                    tracing::debug!(
                        target: TRACE_TARGET,
                        class = %id,
                        orphaned = pending.len(),
                        "rate class disappeared, reclassifying its pending commands"
                    );
                    orphaned.extend(pending);
                }
            }
            *table = fresh;
        }

        // Reclassification re-enters queue_snac, so the table lock is
        // released first
        for request in orphaned {
            self.queue_snac(request);
        }
    }

    pub(crate) fn rate_changed(
        &self,
        code: RateChangeCode,
        new_info: RateClassInfo,
    ) -> Result<(), RateError> {
        self.monitor.rate_changed(code, new_info)?;
        // A relaxed limit can make queued work sendable at once
        self.runner.update();
        Ok(())
    }

    pub(crate) fn command_sent(&self, cmd_type: CmdType, sent_time: Instant) {
        self.monitor.command_sent(cmd_type, sent_time);
    }

    pub(crate) fn pause(&self) {
        self.queues.paused.store(true, Ordering::SeqCst);
        tracing::debug!(target: TRACE_TARGET, "outgoing queues paused");
    }

    pub(crate) fn unpause(&self) {
        self.queues.paused.store(false, Ordering::SeqCst);
        tracing::debug!(target: TRACE_TARGET, "outgoing queues unpaused");
        self.runner.update();
    }

    /// Discards all pending commands and clears the pause flag.
    pub(crate) fn clear_queue(&self) {
        let queues: Vec<Arc<RateQueue>> = {
            let table = self.queues.table.lock().expect("queue table mutex poisoned");
            table.values().cloned().collect()
        };
        let mut dropped = 0;
        for queue in queues {
            dropped += queue.take_all().len();
        }
        self.queues.paused.store(false, Ordering::SeqCst);
        tracing::debug!(target: TRACE_TARGET, dropped, "cleared pending queues");
    }

    /// Changes the connection-wide error margin for classes without a
    /// per-class override.
    pub(crate) fn set_error_margin(&self, margin: Duration) {
        self.monitor.set_default_error_margin(margin);
        // A narrower margin can make queued work sendable at once
        self.runner.update();
    }

    pub(crate) fn set_avoid_limiting(&self, avoid: bool) {
        self.avoid_limiting.store(avoid, Ordering::SeqCst);
        tracing::debug!(target: TRACE_TARGET, avoid, "avoid-limiting toggled");
    }

    pub(crate) fn avoids_limiting(&self) -> bool {
        self.avoid_limiting.load(Ordering::SeqCst)
    }

    pub(crate) fn queue_stats(&self) -> QueueStats {
        let table = self.queues.table.lock().expect("queue table mutex poisoned");
        let mut per_class: Vec<(RateClassId, usize)> = table
            .iter()
            .map(|(id, queue)| (*id, queue.len()))
            .collect();
        per_class.sort_by_key(|(id, _)| *id);
        let total = per_class.iter().map(|(_, count)| *count).sum();
        QueueStats { per_class, total }
    }

    pub(crate) fn shut_down(&self) {
        self.runner.stop_current_run();
    }
}
