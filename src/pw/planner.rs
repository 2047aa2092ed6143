use crate::pw::engine::pw_event;
use crate::pw::entry::{EntryState, SupervisedEntry};
use std::time::Duration;

/// An incarnation that ran at least this long before dying is considered
/// stable, and its death starts a fresh incident: the restart counter is
/// reset so a long-lived service is never permanently exhausted by old
/// crashes.
pub const STABILITY_THRESHOLD: Duration = Duration::from_secs(60);

/// Upper bound on a computed backoff delay. Keeps pathological
/// factor/attempt combinations finite without affecting any realistic
/// configuration.
const MAX_RESTART_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of evaluating a stopped entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Spawn again after the delay; `attempt` is the 1-based attempt number
    /// within the current incident.
    Retry { delay: Duration, attempt: u32 },
    /// The restart budget is exhausted; the entry has been moved to `Failed`.
    GiveUp,
}

/// Decides whether and when a stopped entry is restarted.
///
/// Order matters: the stability reset runs before the budget check, so a
/// service that was up for more than [`STABILITY_THRESHOLD`] gets a full
/// fresh budget even if earlier crashes had nearly exhausted it.
pub fn plan_restart(entry: &mut SupervisedEntry) -> Decision {
    if entry.last_uptime > STABILITY_THRESHOLD && entry.restarts > 0 {
        pw_event(
            "plan",
            Some(&entry.name),
            format!(
                "stable for {:?} before exit, resetting restart counter",
                entry.last_uptime
            ),
        );
        entry.restarts = 0;
    }

    if entry.restarts >= entry.max_restarts {
        entry.state = EntryState::Failed;
        pw_event(
            "plan",
            Some(&entry.name),
            format!(
                "restart budget exhausted ({}/{}), entry failed, not restarting",
                entry.restarts, entry.max_restarts
            ),
        );
        return Decision::GiveUp;
    }

    entry.restarts += 1;
    let delay = restart_delay(entry.restart_delay, entry.backoff_factor, entry.restarts);
    Decision::Retry {
        delay,
        attempt: entry.restarts,
    }
}

/// Exponential backoff: `base * factor^(attempt - 1)`, capped.
pub fn restart_delay(base: Duration, factor: f64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let scaled = base.as_secs_f64() * factor.powi(exponent as i32);
    if !scaled.is_finite() {
        return MAX_RESTART_DELAY;
    }
    Duration::from_secs_f64(scaled.min(MAX_RESTART_DELAY.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_entry(max_restarts: u32) -> SupervisedEntry {
        let mut entry = SupervisedEntry::new("svc", "/bin/true", vec![]);
        entry.max_restarts = max_restarts;
        entry.restart_delay = Duration::from_secs(1);
        entry.backoff_factor = 2.0;
        entry
    }

    #[test]
    fn delays_double_per_attempt() {
        let base = Duration::from_secs(1);
        assert_eq!(restart_delay(base, 2.0, 1), Duration::from_secs(1));
        assert_eq!(restart_delay(base, 2.0, 2), Duration::from_secs(2));
        assert_eq!(restart_delay(base, 2.0, 3), Duration::from_secs(4));
        assert_eq!(restart_delay(base, 2.0, 4), Duration::from_secs(8));
        assert_eq!(restart_delay(base, 2.0, 5), Duration::from_secs(16));
    }

    #[test]
    fn factor_one_keeps_delay_constant() {
        let base = Duration::from_millis(500);
        assert_eq!(restart_delay(base, 1.0, 1), base);
        assert_eq!(restart_delay(base, 1.0, 7), base);
    }

    #[test]
    fn delays_are_monotone_within_an_incident() {
        let base = Duration::from_millis(250);
        let mut prev = Duration::ZERO;
        for attempt in 1..=20 {
            let d = restart_delay(base, 1.5, attempt);
            assert!(d >= prev, "delay shrank at attempt {attempt}");
            prev = d;
        }
    }

    #[test]
    fn absurd_parameters_stay_capped() {
        let d = restart_delay(Duration::from_secs(3600), 10.0, u32::MAX);
        assert_eq!(d, MAX_RESTART_DELAY);
    }

    #[test]
    fn consecutive_plans_consume_the_budget_then_fail() {
        let mut entry = test_entry(3);
        for attempt in 1..=3u32 {
            entry.mark_exited(1, Duration::from_secs(1));
            match plan_restart(&mut entry) {
                Decision::Retry { delay, attempt: a } => {
                    assert_eq!(a, attempt);
                    assert_eq!(
                        delay,
                        restart_delay(Duration::from_secs(1), 2.0, attempt)
                    );
                }
                Decision::GiveUp => panic!("budget should not be exhausted yet"),
            }
            // The engine would respawn here; the next death re-enters.
        }

        entry.mark_exited(1, Duration::from_secs(1));
        assert_eq!(plan_restart(&mut entry), Decision::GiveUp);
        assert_eq!(entry.state(), EntryState::Failed);
        assert_eq!(entry.restarts(), 3);
    }

    #[test]
    fn stable_uptime_resets_the_counter() {
        let mut entry = test_entry(2);

        // Two quick crashes eat the budget.
        entry.mark_exited(1, Duration::from_secs(1));
        assert!(matches!(plan_restart(&mut entry), Decision::Retry { .. }));
        entry.mark_exited(1, Duration::from_secs(1));
        assert!(matches!(plan_restart(&mut entry), Decision::Retry { .. }));
        assert_eq!(entry.restarts(), 2);

        // A stable incarnation dies: counter resets, entry restarts again
        // despite the budget having been full.
        entry.mark_exited(1, Duration::from_secs(65));
        match plan_restart(&mut entry) {
            Decision::Retry { attempt, .. } => assert_eq!(attempt, 1),
            Decision::GiveUp => panic!("stability reset should refresh the budget"),
        }
    }

    #[test]
    fn uptime_exactly_at_threshold_does_not_reset() {
        let mut entry = test_entry(1);
        entry.mark_exited(1, Duration::from_secs(1));
        assert!(matches!(plan_restart(&mut entry), Decision::Retry { .. }));

        entry.mark_exited(1, STABILITY_THRESHOLD);
        assert_eq!(plan_restart(&mut entry), Decision::GiveUp);
    }

    #[test]
    fn zero_budget_fails_immediately() {
        let mut entry = test_entry(0);
        entry.mark_exited(1, Duration::from_secs(1));
        assert_eq!(plan_restart(&mut entry), Decision::GiveUp);
        assert_eq!(entry.state(), EntryState::Failed);
    }
}
