//! Worker-thread lifecycle for deferred flushing.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::{QueueError, TRACE_TARGET};

/// Idle window after which a worker with nothing to do exits.
///
/// The next `update` transparently restarts it, so this is resource
/// reclamation, not a lifecycle event callers have to care about.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// A set of deferred-work queues the runner drives.
pub trait FutureEventQueue: Send + Sync {
    /// Sends everything currently safe and reports how long until the next
    /// pending command becomes sendable.
    ///
    /// `None` means no pending work anywhere. A nonzero wait is required
    /// when work remains; implementations normalize a computed zero to the
    /// smallest positive unit so the runner cannot spin on clock
    /// quantization.
    fn flush_queues(&self) -> Option<Duration>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Stopped,
    Starting,
    Running,
    StopRequested,
}

struct RunnerState {
    phase: Phase,
    update_requested: bool,
}

struct Shared {
    state: Mutex<RunnerState>,
    wake: Condvar,
}

impl Shared {
    fn request_stop(&self) {
        let mut state = self.state.lock().expect("queue runner mutex poisoned");
        if matches!(state.phase, Phase::Starting | Phase::Running) {
            state.phase = Phase::StopRequested;
            self.wake.notify_all();
        }
    }
}

/// Drives a [`FutureEventQueue`] from a dedicated worker thread.
///
/// The worker flushes, sleeps until the earliest reported deadline, and
/// flushes again. Every lifecycle transition runs under one mutex, so an
/// enqueue racing the idle-exit check is decided by lock order and can
/// never be dropped: either the worker sees the update flag before
/// exiting, or the updater sees the stopped state and spawns a fresh
/// worker.
pub struct QueueRunner<Q> {
    queues: Arc<Q>,
    shared: Arc<Shared>,
    idle_timeout: Duration,
}

impl<Q: FutureEventQueue + 'static> QueueRunner<Q> {
    /// Creates a stopped runner with the default idle timeout.
    ///
    /// No thread exists until the first [`update`](Self::update).
    #[must_use]
    pub fn new(queues: Arc<Q>) -> Self {
        Self {
            queues,
            shared: Arc::new(Shared {
                state: Mutex::new(RunnerState {
                    phase: Phase::Stopped,
                    update_requested: false,
                }),
                wake: Condvar::new(),
            }),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Creates a stopped runner with a custom idle timeout.
    pub fn with_idle_timeout(queues: Arc<Q>, idle_timeout: Duration) -> Result<Self, QueueError> {
        if idle_timeout.is_zero() {
            return Err(QueueError::InvalidIdleTimeout);
        }
        let mut runner = Self::new(queues);
        runner.idle_timeout = idle_timeout;
        Ok(runner)
    }

    /// Signals that new work arrived or deadlines may have moved.
    ///
    /// Spawns the worker if none is live and blocks until it runs, so a
    /// deferred command can never sit in a queue with no worker to flush
    /// it once this returns. Against a live worker it only nudges the next
    /// flush forward. A runner caught winding down is restarted once the
    /// old worker has fully exited.
    pub fn update(&self) {
        let mut state = self.shared.state.lock().expect("queue runner mutex poisoned");
        state.update_requested = true;
        loop {
            match state.phase {
                Phase::Running => {
                    self.shared.wake.notify_all();
                    return;
                }
                Phase::Stopped => {
                    state.phase = Phase::Starting;
                    self.spawn_worker();
                }
                Phase::Starting | Phase::StopRequested => {}
            }
            state = self
                .shared
                .wake
                .wait(state)
                .expect("queue runner mutex poisoned");
        }
    }

    /// Requests a graceful worker stop.
    ///
    /// The worker finishes any in-progress flush and exits at its next
    /// wake; pending commands stay queued for a later restart.
    pub fn stop_current_run(&self) {
        self.shared.request_stop();
    }

    /// Whether a worker thread is live, including one winding down.
    #[must_use]
    pub fn is_running(&self) -> bool {
        let state = self.shared.state.lock().expect("queue runner mutex poisoned");
        state.phase != Phase::Stopped
    }

    /// The configured idle window.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn spawn_worker(&self) {
        let queues = Arc::clone(&self.queues);
        let shared = Arc::clone(&self.shared);
        let idle_timeout = self.idle_timeout;
        thread::spawn(move || run_worker(queues, shared, idle_timeout));
    }
}

impl<Q> std::fmt::Debug for QueueRunner<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRunner")
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl<Q> Drop for QueueRunner<Q> {
    fn drop(&mut self) {
        self.shared.request_stop();
    }
}

fn run_worker<Q: FutureEventQueue>(queues: Arc<Q>, shared: Arc<Shared>, idle_timeout: Duration) {
    {
        let mut state = shared.state.lock().expect("queue runner mutex poisoned");
        if state.phase == Phase::Starting {
            state.phase = Phase::Running;
        }
        shared.wake.notify_all();
    }
    tracing::debug!(target: TRACE_TARGET, "queue runner worker started");

    let reason = 'run: loop {
        {
            let mut state = shared.state.lock().expect("queue runner mutex poisoned");
            if state.phase != Phase::Running {
                break 'run "stop requested";
            }
            state.update_requested = false;
        }

        // The flush happens with no runner lock held; sends must never
        // stall lifecycle transitions.
        let next_wait = queues.flush_queues();
        let wait_for = next_wait.map_or(idle_timeout, |wait| wait.min(idle_timeout));
        let deadline = Instant::now() + wait_for;

        let mut state = shared.state.lock().expect("queue runner mutex poisoned");
        loop {
            if state.phase != Phase::Running {
                break 'run "stop requested";
            }
            if state.update_requested {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                if next_wait.is_none() {
                    break 'run "idle timeout";
                }
                break;
            }
            let (reacquired, _) = shared
                .wake
                .wait_timeout(state, deadline - now)
                .expect("queue runner mutex poisoned");
            state = reacquired;
        }
    };

    {
        let mut state = shared.state.lock().expect("queue runner mutex poisoned");
        state.phase = Phase::Stopped;
        shared.wake.notify_all();
    }
    tracing::debug!(target: TRACE_TARGET, reason, "queue runner worker exited");
}
