//! Windowed running-average math.
//!
//! OSCAR servers rate-limit on the average gap between a client's commands,
//! smoothed over a fixed window of recent sends. The functions here are the
//! whole of that arithmetic: pure, clock-free, and lock-free, so every
//! decision the monitors make can be reproduced in a test from plain numbers.
//!
//! All values are in milliseconds. Intermediate products are widened to
//! `u128` because `window_size * max` does not fit in 32 bits for real server
//! parameters and is not guaranteed to fit in 64 for hostile ones.

/// Running average after a send that followed the previous send by `gap`.
///
/// Computes `(last_avg * (window_size - 1) + gap) / window_size`, capped at
/// `max`. A `window_size` of zero or one degenerates to `min(gap, max)`: the
/// window holds only the newest gap.
#[must_use]
pub fn average_after_send(last_avg: u64, gap: u64, window_size: u64, max: u64) -> u64 {
    let window = window_size.max(1);
    let weighted = u128::from(last_avg)
        .saturating_mul(u128::from(window - 1))
        .saturating_add(u128::from(gap));
    let avg = weighted / u128::from(window);
    u64::try_from(avg).unwrap_or(u64::MAX).min(max)
}

/// Additional wait needed before a send keeps the average at `target_avg`.
///
/// Inverts [`average_after_send`]: returns the smallest `w` such that a send
/// `elapsed_since_last + w` after the previous one yields an average of at
/// least `target_avg`. Returns zero when the elapsed gap already suffices;
/// never returns a negative-equivalent value. Callers with no previous send
/// treat the wait as zero and skip the call.
#[must_use]
pub fn wait_until_average(
    target_avg: u64,
    running_avg: u64,
    elapsed_since_last: u64,
    window_size: u64,
) -> u64 {
    let window = window_size.max(1);
    let needed = u128::from(target_avg).saturating_mul(u128::from(window));
    let carried = u128::from(running_avg).saturating_mul(u128::from(window - 1));
    let required_gap = u64::try_from(needed.saturating_sub(carried)).unwrap_or(u64::MAX);
    required_gap.saturating_sub(elapsed_since_last)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests for average_after_send
    #[test]
    fn average_folds_gap_into_window() {
        // (6000 * 9 + 100) / 10 = 5410
        assert_eq!(average_after_send(6000, 100, 10, 6000), 5410);
    }

    #[test]
    fn average_never_exceeds_max() {
        assert_eq!(average_after_send(6000, 80_000, 10, 6000), 6000);
        assert_eq!(average_after_send(0, u64::MAX, 10, 6000), 6000);
    }

    #[test]
    fn average_rounds_down() {
        // (100 * 9 + 5) / 10 = 90.5, floored
        assert_eq!(average_after_send(100, 5, 10, 6000), 90);
    }

    #[test]
    fn window_of_one_keeps_only_the_new_gap() {
        assert_eq!(average_after_send(5000, 250, 1, 6000), 250);
    }

    #[test]
    fn window_of_zero_behaves_like_one() {
        assert_eq!(average_after_send(5000, 250, 0, 6000), 250);
    }

    #[test]
    fn huge_parameters_do_not_overflow() {
        // window_size * max far beyond u64; the clamp still applies
        let avg = average_after_send(u64::MAX, u64::MAX, u64::MAX, u64::MAX);
        assert!(avg <= u64::MAX);
        assert_eq!(average_after_send(u64::MAX, 0, u64::MAX, 6000), 6000);
    }

    #[test]
    fn rapid_sends_drag_the_average_down() {
        let mut avg = 6000;
        for _ in 0..10 {
            avg = average_after_send(avg, 0, 10, 6000);
        }
        assert!(avg < 6000 * 4 / 10);
    }

    // Tests for wait_until_average
    #[test]
    fn wait_is_zero_when_already_safe() {
        // Sending now would give (5000*9 + 10_000)/10 = 5500 >= 3000
        assert_eq!(wait_until_average(3000, 5000, 10_000, 10), 0);
    }

    #[test]
    fn wait_matches_exact_inversion() {
        // target*w - running*(w-1) = 2500*10 - 2000*9 = 7000; elapsed 1000
        assert_eq!(wait_until_average(2500, 2000, 1000, 10), 6000);
    }

    #[test]
    fn waiting_the_returned_time_reaches_the_target() {
        let (target, running, elapsed, window) = (2500, 2000, 1000, 10);
        let wait = wait_until_average(target, running, elapsed, window);
        let avg = average_after_send(running, elapsed + wait, window, 6000);
        assert!(avg >= target);
        // One millisecond earlier still falls short
        let early = average_after_send(running, elapsed + wait - 1, window, 6000);
        assert!(early < target);
    }

    #[test]
    fn wait_never_underflows() {
        assert_eq!(wait_until_average(0, 0, u64::MAX, 10), 0);
        assert_eq!(wait_until_average(100, 6000, 0, 10), 0);
    }

    #[test]
    fn wait_with_window_of_one_is_the_target_gap() {
        assert_eq!(wait_until_average(2500, 0, 0, 1), 2500);
        assert_eq!(wait_until_average(2500, 0, 600, 1), 1900);
    }
}
