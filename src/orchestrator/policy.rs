//! Pure restart-policy arithmetic, kept free of async/process concerns so
//! the backoff and minUptime laws in spec.md §8 can be tested directly
//! without spawning real children.

/// `min(maxRestartDelay, restartDelay * 2^restarts)`, saturating instead of
/// overflowing if `restarts` is large.
pub fn backoff_delay_ms(restart_delay_ms: u64, max_restart_delay_ms: u64, restarts: u32) -> u64 {
    let multiplier = 1u64.checked_shl(restarts.min(63)).unwrap_or(u64::MAX);
    let delay = restart_delay_ms.saturating_mul(multiplier);
    delay.min(max_restart_delay_ms)
}

/// Outcome of evaluating the restart policy after an instance exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitDecision {
    /// The restart counter after applying the minUptime reset rule, before
    /// any increment for a newly scheduled attempt.
    pub restarts_after_reset: u32,
    /// `Some(delay_ms)` if a restart should be scheduled; `None` if the
    /// ManagedProcess should give up (ceiling reached).
    pub scheduled_delay_ms: Option<u64>,
}

/// Implements spec.md §4.1's restart-policy steps 2-3, given the uptime of
/// the instance that just exited.
pub fn decide_after_exit(
    uptime_ms: u64,
    min_uptime_ms: u64,
    restarts_before: u32,
    max_restarts: u32,
    restart_delay_ms: u64,
    max_restart_delay_ms: u64,
) -> ExitDecision {
    let restarts = if uptime_ms >= min_uptime_ms { 0 } else { restarts_before };

    if restarts < max_restarts {
        let delay = backoff_delay_ms(restart_delay_ms, max_restart_delay_ms, restarts);
        ExitDecision { restarts_after_reset: restarts, scheduled_delay_ms: Some(delay) }
    } else {
        ExitDecision { restarts_after_reset: restarts, scheduled_delay_ms: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_geometrically_until_the_cap() {
        assert_eq!(backoff_delay_ms(100, 10_000, 0), 100);
        assert_eq!(backoff_delay_ms(100, 10_000, 1), 200);
        assert_eq!(backoff_delay_ms(100, 10_000, 2), 400);
        assert_eq!(backoff_delay_ms(100, 10_000, 10), 10_000);
    }

    #[test]
    fn backoff_never_overflows() {
        assert_eq!(backoff_delay_ms(u64::MAX, u64::MAX, 200), u64::MAX);
    }

    #[test]
    fn scenario_s2_crash_loop_hits_ceiling_after_three_restarts() {
        // maxRestarts=3, restartDelay=100, minUptime=100000; crash.js exits
        // after 10ms each time, so uptime never clears minUptime.
        let mut restarts = 0u32;
        let mut delays = Vec::new();
        loop {
            let decision = decide_after_exit(10, 100_000, restarts, 3, 100, 10_000);
            restarts = decision.restarts_after_reset;
            match decision.scheduled_delay_ms {
                Some(d) => {
                    delays.push(d);
                    restarts += 1;
                }
                None => break,
            }
        }
        assert_eq!(delays, vec![100, 200, 400]);
        assert_eq!(restarts, 3);
    }

    #[test]
    fn scenario_s3_min_uptime_resets_the_counter() {
        // minUptime=1000; the instance ran 2000ms before exiting, so the
        // next restart always schedules from restarts=0 regardless of the
        // incoming counter value.
        let decision = decide_after_exit(2000, 1000, 5, 3, 100, 10_000);
        assert_eq!(decision.restarts_after_reset, 0);
        assert_eq!(decision.scheduled_delay_ms, Some(100));
    }

    #[test]
    fn backoff_is_monotonic_non_decreasing() {
        let mut prev = 0;
        for restarts in 0..20 {
            let d = backoff_delay_ms(50, 5_000, restarts);
            assert!(d >= prev);
            prev = d;
        }
    }
}
