//! Per-class send bookkeeping.

use crate::average::{average_after_send, wait_until_average};
use crate::events::{ListenerSet, RateEvent};
use crate::{RateChangeCode, RateClassId, RateClassInfo, RateError, RateState, TRACE_TARGET};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Sentinel accepted by [`RateClassMonitor::set_error_margin`]: inherit the
/// connection-wide default margin. The only legal negative margin value.
pub const INHERIT_ERROR_MARGIN: i64 = -1;

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

struct ClassState {
    info: RateClassInfo,
    running_avg: u64,
    last_sent: Option<Instant>,
    limited: bool,
    error_margin: i64,
}

impl ClassState {
    fn effective_margin(&self, default_margin: u64) -> u64 {
        if self.error_margin == INHERIT_ERROR_MARGIN {
            default_margin
        } else {
            // every other negative value was rejected at set time
            u64::try_from(self.error_margin).unwrap_or(0)
        }
    }

    fn min_safe_avg(&self) -> u64 {
        if self.limited {
            self.info.clear_avg
        } else {
            self.info.limited_avg
        }
    }

    fn safety_threshold(&self, default_margin: u64) -> u64 {
        self.min_safe_avg()
            .saturating_add(self.effective_margin(default_margin))
    }

    fn wait_at(&self, target_avg: u64, now: Instant) -> u64 {
        let Some(last) = self.last_sent else {
            return 0;
        };
        let elapsed = duration_millis(now.saturating_duration_since(last));
        wait_until_average(target_avg, self.running_avg, elapsed, self.info.window_size)
    }

    fn resolve_limited(&mut self, default_margin: u64) -> Option<RateEvent> {
        let clear_at = self
            .info
            .clear_avg
            .saturating_add(self.effective_margin(default_margin));
        if self.limited && self.running_avg > clear_at {
            self.limited = false;
            return Some(RateEvent::LimitCleared { id: self.info.id });
        }
        None
    }

    fn set_limited(&mut self, limited: bool) -> Option<RateEvent> {
        if self.limited == limited {
            return None;
        }
        self.limited = limited;
        Some(if limited {
            RateEvent::Limited { id: self.info.id }
        } else {
            RateEvent::LimitCleared { id: self.info.id }
        })
    }
}

/// Client-side bookkeeping for one rate class on one connection.
///
/// Mirrors the server's windowed average for the class, predicts when the
/// next send stays safe, and tracks the limited flag with hysteresis: while
/// limited, the average must climb back above `clear_avg` (not merely
/// `limited_avg`) plus the error margin before the class recovers. The
/// stored average moves only on recorded sends and server corrections -
/// wall-clock passage alone never changes what the monitor reports.
///
/// All mutable state sits behind one mutex. Listener callbacks fire strictly
/// outside it.
pub struct RateClassMonitor {
    id: RateClassId,
    state: Mutex<ClassState>,
    // Shared with the owning RateMonitor so a connection-wide margin
    // change reaches every installed class at once
    default_margin: Arc<AtomicU64>,
    listeners: Arc<ListenerSet>,
}

impl RateClassMonitor {
    /// Creates a standalone monitor seeded from one snapshot entry.
    ///
    /// The running average starts at the snapshot's `current_avg` (clamped
    /// to `max`) and the limited flag follows the snapshot's `server_state`.
    /// Monitors owned by a [`crate::RateMonitor`] share its listener
    /// registry instead; one built here keeps its own.
    #[must_use]
    pub fn new(info: RateClassInfo, default_error_margin: Duration) -> Self {
        Self::with_listeners(
            info,
            Arc::new(AtomicU64::new(duration_millis(default_error_margin))),
            Arc::new(ListenerSet::default()),
        )
    }

    pub(crate) fn with_listeners(
        info: RateClassInfo,
        default_margin: Arc<AtomicU64>,
        listeners: Arc<ListenerSet>,
    ) -> Self {
        if info.current_avg > info.max {
            tracing::debug!(
                target: TRACE_TARGET,
                class = %info.id,
                current_avg = info.current_avg,
                max = info.max,
                "clamping out-of-range snapshot average"
            );
        }
        let id = info.id;
        let state = ClassState {
            running_avg: info.current_avg.min(info.max),
            last_sent: None,
            limited: matches!(info.server_state, RateState::Limited),
            error_margin: INHERIT_ERROR_MARGIN,
            info,
        };
        Self {
            id,
            state: Mutex::new(state),
            default_margin,
            listeners,
        }
    }

    fn default_margin_ms(&self) -> u64 {
        self.default_margin.load(Ordering::Relaxed)
    }

    /// Records a send at `sent_time`, folding the gap since the previous
    /// send into the running average.
    ///
    /// The first recorded send leaves the average untouched: there is no gap
    /// to fold in yet. Send times must be non-decreasing; an earlier
    /// timestamp counts as a zero gap.
    pub fn register_send(&self, sent_time: Instant) {
        let event = {
            let mut state = self.state.lock().expect("rate class mutex poisoned");
            if let Some(last) = state.last_sent {
                let gap = duration_millis(sent_time.saturating_duration_since(last));
                state.running_avg = average_after_send(
                    state.running_avg,
                    gap,
                    state.info.window_size,
                    state.info.max,
                );
                state.last_sent = Some(sent_time.max(last));
                tracing::trace!(
                    target: TRACE_TARGET,
                    class = %self.id,
                    gap,
                    avg = state.running_avg,
                    "send folded into running average"
                );
            } else {
                state.last_sent = Some(sent_time);
                tracing::trace!(
                    target: TRACE_TARGET,
                    class = %self.id,
                    avg = state.running_avg,
                    "first send recorded"
                );
            }
            state.resolve_limited(self.default_margin_ms())
        };
        self.fire(event);
    }

    /// Applies a server correction to this class.
    ///
    /// The stored parameters are replaced and the server's `current_avg`,
    /// clamped to the new `max` (servers have shipped absurdly large values
    /// in these messages), becomes the local running average.
    /// `Limited`/`LimitCleared` codes move the limited flag; informational
    /// codes leave it alone, though an adopted average above the clear
    /// threshold still recovers a limited class.
    pub fn update_rate_info(
        &self,
        code: RateChangeCode,
        new_info: RateClassInfo,
    ) -> Result<(), RateError> {
        let event = {
            let mut state = self.state.lock().expect("rate class mutex poisoned");
            if new_info.id != self.id {
                return Err(RateError::ClassMismatch {
                    expected: self.id,
                    actual: new_info.id,
                });
            }
            if new_info.current_avg > new_info.max {
                tracing::debug!(
                    target: TRACE_TARGET,
                    class = %self.id,
                    current_avg = new_info.current_avg,
                    max = new_info.max,
                    "clamping out-of-range server average"
                );
            }
            state.running_avg = new_info.current_avg.min(new_info.max);
            state.info = new_info;
            tracing::debug!(
                target: TRACE_TARGET,
                class = %self.id,
                code = code.as_raw(),
                avg = state.running_avg,
                "rate parameters updated"
            );
            match code {
                RateChangeCode::Limited => state.set_limited(true),
                RateChangeCode::LimitCleared => state.set_limited(false),
                _ => state.resolve_limited(self.default_margin_ms()),
            }
        };
        self.fire(event);
        Ok(())
    }

    /// Whether the class is currently rate-limited.
    ///
    /// Re-derives the flag first: a class whose average climbed back above
    /// `clear_avg` plus the margin (through sends or corrections) reports -
    /// and announces - the recovery here at the latest.
    pub fn is_limited(&self) -> bool {
        let (limited, event) = {
            let mut state = self.state.lock().expect("rate class mutex poisoned");
            let event = state.resolve_limited(self.default_margin_ms());
            (state.limited, event)
        };
        self.fire(event);
        limited
    }

    /// The lowest average considered safe right now: `clear_avg` while
    /// limited, `limited_avg` otherwise.
    pub fn min_safe_avg(&self) -> u64 {
        self.state
            .lock()
            .expect("rate class mutex poisoned")
            .min_safe_avg()
    }

    /// The effective error margin: the per-class override if set, else the
    /// connection-wide default.
    pub fn error_margin(&self) -> Duration {
        let state = self.state.lock().expect("rate class mutex poisoned");
        Duration::from_millis(state.effective_margin(self.default_margin_ms()))
    }

    /// Overrides this class's error margin, in milliseconds.
    ///
    /// [`INHERIT_ERROR_MARGIN`] (`-1`) selects the connection default; any
    /// other negative value is rejected.
    pub fn set_error_margin(&self, margin: i64) -> Result<(), RateError> {
        if margin < INHERIT_ERROR_MARGIN {
            return Err(RateError::InvalidErrorMargin(margin));
        }
        self.state
            .lock()
            .expect("rate class mutex poisoned")
            .error_margin = margin;
        Ok(())
    }

    /// Recommended wait before the next send of this class.
    ///
    /// Zero means a send now keeps the average at or above `min_safe_avg`
    /// plus the error margin. A class that has never sent waits zero.
    pub fn optimal_wait_time(&self) -> Duration {
        self.optimal_wait_time_at(Instant::now())
    }

    /// Clock-explicit variant of [`Self::optimal_wait_time`].
    pub fn optimal_wait_time_at(&self, now: Instant) -> Duration {
        let state = self.state.lock().expect("rate class mutex poisoned");
        let target = state.safety_threshold(self.default_margin_ms());
        Duration::from_millis(state.wait_at(target, now))
    }

    /// Wait until a send would keep the average at or above `target_avg`.
    pub fn time_until(&self, target_avg: u64) -> Duration {
        self.time_until_at(target_avg, Instant::now())
    }

    /// Clock-explicit variant of [`Self::time_until`].
    pub fn time_until_at(&self, target_avg: u64, now: Instant) -> Duration {
        let state = self.state.lock().expect("rate class mutex poisoned");
        Duration::from_millis(state.wait_at(target_avg, now))
    }

    /// Whether a send right now keeps this class safe.
    pub fn safe_to_send_now(&self) -> bool {
        self.safe_to_send_at(Instant::now())
    }

    /// Clock-explicit variant of [`Self::safe_to_send_now`].
    pub fn safe_to_send_at(&self, now: Instant) -> bool {
        self.optimal_wait_time_at(now).is_zero()
    }

    /// How many commands could go out back-to-back before the class turns
    /// unsafe. `u64::MAX` when the safety threshold is zero (such a class
    /// can never turn unsafe).
    pub fn possible_cmd_count(&self) -> u64 {
        self.possible_cmd_count_at(Instant::now())
    }

    /// Clock-explicit variant of [`Self::possible_cmd_count`].
    pub fn possible_cmd_count_at(&self, now: Instant) -> u64 {
        let state = self.state.lock().expect("rate class mutex poisoned");
        Self::count_safe_sends(&state, state.running_avg, now, self.default_margin_ms())
    }

    /// Burst capacity from a fully recovered average; the ceiling that
    /// [`Self::possible_cmd_count`] approaches after a long quiet period.
    pub fn max_cmd_count(&self) -> u64 {
        self.max_cmd_count_at(Instant::now())
    }

    /// Clock-explicit variant of [`Self::max_cmd_count`].
    pub fn max_cmd_count_at(&self, now: Instant) -> u64 {
        let state = self.state.lock().expect("rate class mutex poisoned");
        Self::count_safe_sends(&state, state.info.max, now, self.default_margin_ms())
    }

    /// Simulates back-to-back sends: the first uses the real elapsed gap
    /// (none at all if the class has never sent), the rest a zero gap, and
    /// each must leave the average at or above the safety threshold.
    fn count_safe_sends(state: &ClassState, from_avg: u64, now: Instant, default_margin: u64) -> u64 {
        let threshold = state.safety_threshold(default_margin);
        if threshold == 0 {
            return u64::MAX;
        }
        let mut gap = state
            .last_sent
            .map(|last| duration_millis(now.saturating_duration_since(last)));
        let mut avg = from_avg;
        let mut count = 0;
        loop {
            let next = match gap {
                Some(gap) => {
                    average_after_send(avg, gap, state.info.window_size, state.info.max)
                }
                // a first-ever send leaves the average unchanged
                None => avg,
            };
            if next < threshold {
                return count;
            }
            count += 1;
            avg = next;
            gap = Some(0);
        }
    }

    /// The class this monitor tracks.
    #[must_use]
    pub fn class_id(&self) -> RateClassId {
        self.id
    }

    /// Locally tracked running average, in milliseconds.
    pub fn current_avg(&self) -> u64 {
        self.state
            .lock()
            .expect("rate class mutex poisoned")
            .running_avg
    }

    /// Time of the most recent recorded send, if any.
    pub fn last_sent(&self) -> Option<Instant> {
        self.state
            .lock()
            .expect("rate class mutex poisoned")
            .last_sent
    }

    /// Copy of the stored class parameters.
    pub fn rate_info(&self) -> RateClassInfo {
        self.state
            .lock()
            .expect("rate class mutex poisoned")
            .info
            .clone()
    }

    fn fire(&self, event: Option<RateEvent>) {
        if let Some(event) = event {
            self.listeners.notify(&event);
        }
    }
}
