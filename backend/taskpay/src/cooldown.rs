//! Launch policy for tasks: the in-progress lock and the post-completion
//! cooldown window.
//!
//! Nothing here is stored. Both windows are computed from the phase
//! timestamps and `now`, so a completed task drifts back to startable without
//! any write.

use crate::config::Policy;
use crate::models::TaskPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownGate {
    cooldown_secs: i64,
    max_task_window_secs: i64,
}

impl CooldownGate {
    pub fn new(cooldown_secs: i64, max_task_window_secs: i64) -> Self {
        CooldownGate {
            cooldown_secs,
            max_task_window_secs,
        }
    }

    pub fn from_policy(policy: &Policy) -> Self {
        Self::new(policy.cooldown_secs, policy.max_task_window_secs)
    }

    /// Whether a fresh run of the task may begin at `now`.
    ///
    /// An in-progress task holds the lock until it has run for the maximum
    /// task window; a completed one until the cooldown window has passed
    /// since completion.
    pub fn can_start(&self, phase: &TaskPhase, now: i64) -> bool {
        match *phase {
            TaskPhase::Idle => true,
            TaskPhase::Running { .. } | TaskPhase::Paused { .. } => self.lock_expired(phase, now),
            TaskPhase::Completed { completed_at } => now - completed_at >= self.cooldown_secs,
        }
    }

    /// Seconds until a completed task can be started again. Display only.
    pub fn remaining_cooldown(&self, phase: &TaskPhase, now: i64) -> i64 {
        match *phase {
            TaskPhase::Completed { completed_at } => {
                (completed_at + self.cooldown_secs - now).max(0)
            }
            _ => 0,
        }
    }

    /// True when an in-progress task has run for longer than the maximum task
    /// window and should be force-completed. Paused time does not count.
    pub fn lock_expired(&self, phase: &TaskPhase, now: i64) -> bool {
        let ran_for = match *phase {
            TaskPhase::Running { started_at, .. } => now - started_at,
            TaskPhase::Paused {
                started_at,
                paused_at,
                ..
            } => paused_at - started_at,
            _ => return false,
        };
        ran_for >= self.max_task_window_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3_600;
    const DAY: i64 = 24 * HOUR;

    fn gate() -> CooldownGate {
        CooldownGate::new(DAY, HOUR)
    }

    #[test]
    fn idle_tasks_can_start() {
        assert!(gate().can_start(&TaskPhase::Idle, 0));
        assert_eq!(gate().remaining_cooldown(&TaskPhase::Idle, 0), 0);
    }

    #[test]
    fn cooldown_boundary() {
        let done = TaskPhase::Completed {
            completed_at: 10_000,
        };
        assert!(!gate().can_start(&done, 10_000));
        assert!(!gate().can_start(&done, 10_000 + DAY - 1));
        assert!(gate().can_start(&done, 10_000 + DAY));

        assert_eq!(gate().remaining_cooldown(&done, 10_000 + DAY - 1), 1);
        assert_eq!(gate().remaining_cooldown(&done, 10_000 + DAY), 0);
        assert_eq!(gate().remaining_cooldown(&done, 10_000 + 2 * DAY), 0);
    }

    #[test]
    fn in_progress_lock_holds_until_window_passes() {
        let running = TaskPhase::Running {
            started_at: 500,
            remaining_secs: 60,
        };
        assert!(!gate().can_start(&running, 500));
        assert!(!gate().can_start(&running, 500 + HOUR - 1));
        assert!(gate().can_start(&running, 500 + HOUR));
        assert!(gate().lock_expired(&running, 500 + HOUR));
    }

    #[test]
    fn time_spent_paused_does_not_expire_the_lock() {
        let paused = TaskPhase::Paused {
            started_at: 0,
            paused_at: 30,
            remaining_secs: 90,
        };
        assert!(!gate().can_start(&paused, 120));
        assert!(!gate().lock_expired(&paused, 120));
        assert!(!gate().lock_expired(&paused, 10 * DAY));

        let overran = TaskPhase::Paused {
            started_at: 0,
            paused_at: HOUR,
            remaining_secs: 0,
        };
        assert!(gate().lock_expired(&overran, HOUR + 1));
    }

    #[test]
    fn in_progress_lock_reports_no_cooldown() {
        let running = TaskPhase::Running {
            started_at: 0,
            remaining_secs: 60,
        };
        assert!(!gate().can_start(&running, 10));
        assert_eq!(gate().remaining_cooldown(&running, 10), 0);
    }
}
