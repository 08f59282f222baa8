//! Domain types shared by every component: users, the task catalog entry,
//! task timer phases, payment transactions and ledger entries.

use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TaskPayError};

/// A currency amount in whole Kenyan shillings.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn kes(value: i64) -> Self {
        Amount(value)
    }

    pub const fn as_kes(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KES {}", self.0)
    }
}

// ─────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    /// Canonical `254…` form.
    pub phone: String,
    pub balance: Amount,
    pub is_active: bool,
    pub has_claimed_welcome_bonus: bool,
    pub referral_code: Option<String>,
    pub created_at: i64,
}

/// Partial profile update. `None` fields are left untouched.
///
/// Balance and the activation/bonus flags are absent: they only
/// change through the conditional writes in [`crate::db`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

// ─────────────────────────────────────────────────────────
// Tasks
// ─────────────────────────────────────────────────────────

/// A catalog entry. Immutable for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub reward: Amount,
    pub duration_secs: u32,
    pub external_link: Option<String>,
}

/// Where a user stands on one task.
///
/// ```text
/// Idle ──begin──► Running ──pause──► Paused
///                   │  ▲               │
///                   │  └────begin──────┘
///                   └──tick to zero──► Completed ──cooldown elapses──► (startable)
/// ```
///
/// `started_at` is the *effective* start: resuming shifts it forward by the
/// paused interval so that `now - started_at` only counts running time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TaskPhase {
    Idle,
    Running {
        started_at: i64,
        remaining_secs: u32,
    },
    Paused {
        started_at: i64,
        paused_at: i64,
        remaining_secs: u32,
    },
    Completed {
        completed_at: i64,
    },
}

impl TaskPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running { .. } => "running",
            Self::Paused { .. } => "paused",
            Self::Completed { .. } => "completed",
        }
    }

    /// Running or paused.
    pub fn in_progress(&self) -> bool {
        matches!(self, Self::Running { .. } | Self::Paused { .. })
    }

    pub fn remaining_secs(&self) -> Option<u32> {
        match self {
            Self::Running { remaining_secs, .. } | Self::Paused { remaining_secs, .. } => {
                Some(*remaining_secs)
            }
            _ => None,
        }
    }
}

/// Flat storage form of [`TaskPhase`], one row in `task_states`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskStateRow {
    pub phase: String,
    pub started_at: Option<i64>,
    pub paused_at: Option<i64>,
    pub remaining_secs: Option<i64>,
    pub completed_at: Option<i64>,
}

impl TryFrom<TaskStateRow> for TaskPhase {
    type Error = TaskPayError;

    fn try_from(row: TaskStateRow) -> Result<Self> {
        let missing = |field: &str| {
            TaskPayError::StateDecode(format!("{} task state without {field}", row.phase))
        };
        let remaining = |v: Option<i64>| -> Result<u32> {
            let v = v.ok_or_else(|| missing("remaining_secs"))?;
            u32::try_from(v).map_err(|_| {
                TaskPayError::StateDecode(format!("remaining_secs out of range: {v}"))
            })
        };

        match row.phase.as_str() {
            "idle" => Ok(TaskPhase::Idle),
            "running" => Ok(TaskPhase::Running {
                started_at: row.started_at.ok_or_else(|| missing("started_at"))?,
                remaining_secs: remaining(row.remaining_secs)?,
            }),
            "paused" => Ok(TaskPhase::Paused {
                started_at: row.started_at.ok_or_else(|| missing("started_at"))?,
                paused_at: row.paused_at.ok_or_else(|| missing("paused_at"))?,
                remaining_secs: remaining(row.remaining_secs)?,
            }),
            "completed" => Ok(TaskPhase::Completed {
                completed_at: row.completed_at.ok_or_else(|| missing("completed_at"))?,
            }),
            other => Err(TaskPayError::StateDecode(format!(
                "unknown task phase {other:?}"
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Transactions
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "lowercase")]
pub enum TransactionKind {
    Activation,
    Withdrawal,
}

/// `Queued` is the only non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Queued,
    Success,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    /// Map a gateway status word onto the closed status set.
    ///
    /// Gateways disagree on vocabulary; unknown words yield `None`.
    pub fn from_gateway(word: &str) -> Option<Self> {
        match word.trim().to_ascii_uppercase().as_str() {
            "QUEUED" | "PENDING" | "PROCESSING" | "INITIATED" => Some(Self::Queued),
            "SUCCESS" | "SUCCESSFUL" | "COMPLETED" => Some(Self::Success),
            "FAILED" | "FAILURE" | "ERROR" => Some(Self::Failed),
            "CANCELLED" | "CANCELED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Transaction {
    pub client_reference: String,
    pub gateway_reference: String,
    pub user_id: String,
    pub amount: Amount,
    pub phone: String,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub created_at: i64,
    pub settled_at: Option<i64>,
}

// ─────────────────────────────────────────────────────────
// Ledger
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BonusRecord {
    pub id: i64,
    pub user_id: String,
    pub amount: Amount,
    pub source: String,
    pub received_at: i64,
}

/// A withdrawal as shown in history. The record itself is immutable; its
/// status is read through from the owning transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WithdrawalRecord {
    pub id: i64,
    pub user_id: String,
    pub client_reference: String,
    pub phone: String,
    pub amount: Amount,
    pub status: TransactionStatus,
    pub created_at: i64,
}
