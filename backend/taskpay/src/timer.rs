//! Per-task countdown state machine with durable pause/resume and
//! auto-completion on expiry.
//!
//! The phase transitions are pure functions over [`TaskPhase`]; the
//! [`TaskTimerEngine`] loads and persists phases around them and owns the
//! single completion path that credits the reward.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cooldown::CooldownGate;
use crate::db;
use crate::errors::{Result, TaskPayError};
use crate::models::{Amount, Task, TaskPhase};

// ─────────────────────────────────────────────────────────
// Pure transitions
// ─────────────────────────────────────────────────────────

/// Seconds left on the clock as the user should see it at `now`.
///
/// A running task is charged for wall-clock time since its effective start,
/// so closing the app does not stop the clock. A paused task keeps the
/// stored value untouched.
pub fn countdown(phase: &TaskPhase, task: &Task, now: i64) -> u32 {
    match *phase {
        TaskPhase::Idle | TaskPhase::Completed { .. } => task.duration_secs,
        TaskPhase::Paused { remaining_secs, .. } => remaining_secs,
        TaskPhase::Running {
            started_at,
            remaining_secs,
        } => {
            let elapsed = u32::try_from((now - started_at).max(0)).unwrap_or(u32::MAX);
            remaining_secs.min(task.duration_secs.saturating_sub(elapsed))
        }
    }
}

fn start(task: &Task, now: i64) -> TaskPhase {
    TaskPhase::Running {
        started_at: now,
        remaining_secs: task.duration_secs,
    }
}

/// Paused → Running, moving the effective start forward by the paused span.
fn resume(phase: TaskPhase, now: i64) -> TaskPhase {
    match phase {
        TaskPhase::Paused {
            started_at,
            paused_at,
            remaining_secs,
        } => TaskPhase::Running {
            started_at: started_at + (now - paused_at).max(0),
            remaining_secs,
        },
        other => other,
    }
}

/// Running → Paused, freezing the clock at its wall-clock value.
fn pause(phase: TaskPhase, task: &Task, now: i64) -> TaskPhase {
    match phase {
        TaskPhase::Running { started_at, .. } => TaskPhase::Paused {
            started_at,
            paused_at: now,
            remaining_secs: countdown(&phase, task, now),
        },
        other => other,
    }
}

/// One second off a running clock, never leaving it above the wall-clock
/// countdown. The flag is set when the clock hits zero.
fn tick(phase: TaskPhase, task: &Task, now: i64) -> (TaskPhase, bool) {
    match phase {
        TaskPhase::Running {
            started_at,
            remaining_secs,
        } => {
            let remaining_secs = remaining_secs
                .saturating_sub(1)
                .min(countdown(&phase, task, now));
            (
                TaskPhase::Running {
                    started_at,
                    remaining_secs,
                },
                remaining_secs == 0,
            )
        }
        other => (other, false),
    }
}

/// `m:ss`, as shown on the task card.
pub fn format_countdown(secs: u32) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

// ─────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────

/// What the UI needs after opening a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Opened {
    pub phase: TaskPhase,
    pub remaining_secs: u32,
    pub display: String,
    /// Whether `begin` would succeed (fresh start or resume).
    pub can_begin: bool,
    pub cooldown_remaining_secs: i64,
    /// Set when opening found an expired run and completed it.
    pub completion: Option<Completion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Begun {
    pub phase: TaskPhase,
    pub resumed: bool,
    /// Link the client should open alongside the countdown.
    pub external_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub task_id: String,
    pub reward: Amount,
    pub completed_at: i64,
    /// `false` when the task had already been completed by another path.
    pub credited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Running { remaining_secs: u32 },
    Completed(Completion),
    /// The task is not running; the ticker should stop.
    Stopped(TaskPhase),
}

pub struct TaskTimerEngine {
    pool: SqlitePool,
    gate: CooldownGate,
    tick_period: Duration,
}

impl TaskTimerEngine {
    pub fn new(pool: SqlitePool, gate: CooldownGate) -> Self {
        TaskTimerEngine {
            pool,
            gate,
            tick_period: Duration::from_secs(1),
        }
    }

    /// Override the ticker cadence. Each tick still counts as one second.
    pub fn with_tick_period(mut self, tick_period: Duration) -> Self {
        self.tick_period = tick_period;
        self
    }

    pub fn gate(&self) -> &CooldownGate {
        &self.gate
    }

    /// Stored phase, `Idle` if the task was never opened.
    pub async fn phase(&self, user_id: &str, task_id: &str) -> Result<TaskPhase> {
        Ok(db::load_task_state(&self.pool, user_id, task_id)
            .await?
            .unwrap_or(TaskPhase::Idle))
    }

    /// Load (creating on first open) the task state and report the countdown.
    /// Does not start the clock.
    pub async fn open(&self, user_id: &str, task: &Task, now: i64) -> Result<Opened> {
        db::get_user(&self.pool, user_id).await?;

        let phase = match db::load_task_state(&self.pool, user_id, &task.id).await? {
            Some(phase) => phase,
            None => {
                db::save_task_state(&self.pool, user_id, &task.id, &TaskPhase::Idle, now).await?;
                TaskPhase::Idle
            }
        };
        let (phase, completion) = self.settle_overdue(user_id, task, phase, now).await?;

        let remaining_secs = countdown(&phase, task, now);
        Ok(Opened {
            phase,
            remaining_secs,
            display: format_countdown(remaining_secs),
            can_begin: matches!(phase, TaskPhase::Paused { .. })
                || self.gate.can_start(&phase, now),
            cooldown_remaining_secs: self.gate.remaining_cooldown(&phase, now),
            completion,
        })
    }

    /// Start or resume the task clock. The account must be active.
    pub async fn begin(&self, user_id: &str, task: &Task, now: i64) -> Result<Begun> {
        let user = db::get_user(&self.pool, user_id).await?;
        if !user.is_active {
            return Err(TaskPayError::AccountInactive);
        }

        let phase = self.phase(user_id, &task.id).await?;
        let (phase, _) = self.settle_overdue(user_id, task, phase, now).await?;

        let (next, resumed) = match phase {
            TaskPhase::Running { .. } => {
                return Ok(Begun {
                    phase,
                    resumed: false,
                    external_link: task.external_link.clone(),
                })
            }
            TaskPhase::Paused { .. } => (resume(phase, now), true),
            TaskPhase::Idle | TaskPhase::Completed { .. } => {
                if !self.gate.can_start(&phase, now) {
                    return Err(TaskPayError::TaskUnavailable {
                        task_id: task.id.clone(),
                        remaining_secs: self.gate.remaining_cooldown(&phase, now),
                    });
                }
                (start(task, now), false)
            }
        };

        db::save_task_state(&self.pool, user_id, &task.id, &next, now).await?;
        info!(
            user_id,
            task_id = %task.id,
            resumed,
            remaining_secs = next.remaining_secs().unwrap_or_default(),
            "Task running"
        );

        Ok(Begun {
            phase: next,
            resumed,
            external_link: task.external_link.clone(),
        })
    }

    /// Advance a running clock by one second, completing the task at zero.
    pub async fn tick(&self, user_id: &str, task: &Task, now: i64) -> Result<Tick> {
        let phase = self.phase(user_id, &task.id).await?;
        if !matches!(phase, TaskPhase::Running { .. }) {
            return Ok(Tick::Stopped(phase));
        }

        let (next, expired) = tick(phase, task, now);
        if expired {
            return Ok(Tick::Completed(self.complete(user_id, task, now).await?));
        }

        db::save_task_state(&self.pool, user_id, &task.id, &next, now).await?;
        let remaining_secs = next.remaining_secs().unwrap_or_default();
        debug!(user_id, task_id = %task.id, remaining_secs, "tick");
        Ok(Tick::Running { remaining_secs })
    }

    /// Freeze a running clock and persist it immediately.
    pub async fn pause(&self, user_id: &str, task: &Task, now: i64) -> Result<TaskPhase> {
        let phase = self.phase(user_id, &task.id).await?;
        if !matches!(phase, TaskPhase::Running { .. }) {
            return Ok(phase);
        }

        let paused = pause(phase, task, now);
        db::save_task_state(&self.pool, user_id, &task.id, &paused, now).await?;
        info!(
            user_id,
            task_id = %task.id,
            remaining_secs = paused.remaining_secs().unwrap_or_default(),
            "Task paused"
        );
        Ok(paused)
    }

    /// Credit the reward and mark the task completed, atomically.
    ///
    /// Only an in-progress task can be completed; a repeated call finds the
    /// task already completed and credits nothing.
    pub async fn complete(&self, user_id: &str, task: &Task, now: i64) -> Result<Completion> {
        let user = db::get_user(&self.pool, user_id).await?;
        if !user.is_active {
            return Err(TaskPayError::AccountInactive);
        }

        let mut tx = self.pool.begin().await?;
        let completion = |credited| Completion {
            task_id: task.id.clone(),
            reward: task.reward,
            completed_at: now,
            credited,
        };

        if !db::mark_task_completed(&mut *tx, user_id, &task.id, now).await? {
            debug!(user_id, task_id = %task.id, "Task already completed, nothing to credit");
            return Ok(completion(false));
        }
        if !db::credit_active_balance(&mut *tx, user_id, task.reward).await? {
            return Err(TaskPayError::AccountInactive);
        }
        tx.commit().await?;

        info!(user_id, task_id = %task.id, reward = %task.reward, "Task completed");
        Ok(completion(true))
    }

    /// Complete an in-progress run whose clock has already run out, or which
    /// has held its lock past the maximum task window.
    async fn settle_overdue(
        &self,
        user_id: &str,
        task: &Task,
        phase: TaskPhase,
        now: i64,
    ) -> Result<(TaskPhase, Option<Completion>)> {
        let clock_ran_out =
            matches!(phase, TaskPhase::Running { .. }) && countdown(&phase, task, now) == 0;
        if !(clock_ran_out || self.gate.lock_expired(&phase, now)) {
            return Ok((phase, None));
        }

        info!(user_id, task_id = %task.id, "Completing overdue task");
        let completion = self.complete(user_id, task, now).await?;
        let phase = self.phase(user_id, &task.id).await?;
        Ok((phase, Some(completion)))
    }

    /// Drive `tick` once per tick period until the task completes, stops
    /// running, or `cancel` fires.
    pub fn spawn_ticker(
        self: &Arc<Self>,
        user_id: String,
        task: Task,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<Option<Completion>>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.tick_period);
            // The first tick of an interval fires immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(user_id, task_id = %task.id, "Ticker cancelled");
                        return Ok(None);
                    }
                    _ = interval.tick() => {}
                }

                let now = chrono::Utc::now().timestamp();
                match engine.tick(&user_id, &task, now).await? {
                    Tick::Running { .. } => continue,
                    Tick::Completed(completion) => return Ok(Some(completion)),
                    Tick::Stopped(_) => return Ok(None),
                }
            }
        })
    }
}
