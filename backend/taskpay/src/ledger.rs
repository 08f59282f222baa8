//! Bonus and withdrawal history with a per-month summary for the wallet charts.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db;
use crate::errors::Result;
use crate::models::{Amount, BonusRecord, TransactionStatus, WithdrawalRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthlyTotal {
    /// e.g. `"Jan 2025"`
    pub month: String,
    pub bonuses: Amount,
    pub withdrawals: Amount,
}

#[derive(Debug, Clone, Serialize)]
pub struct History {
    pub bonuses: Vec<BonusRecord>,
    pub withdrawals: Vec<WithdrawalRecord>,
    pub monthly: Vec<MonthlyTotal>,
}

/// Bonuses and withdrawals newest first, plus their monthly totals.
pub async fn history(pool: &SqlitePool, user_id: &str) -> Result<History> {
    db::get_user(pool, user_id).await?;
    let bonuses = db::get_bonuses(pool, user_id).await?;
    let withdrawals = db::get_withdrawals(pool, user_id).await?;
    let monthly = monthly_summary(&bonuses, &withdrawals);
    Ok(History {
        bonuses,
        withdrawals,
        monthly,
    })
}

/// Totals per calendar month (UTC), oldest month first.
///
/// Failed and cancelled withdrawals were refunded and are left out.
pub fn monthly_summary(
    bonuses: &[BonusRecord],
    withdrawals: &[WithdrawalRecord],
) -> Vec<MonthlyTotal> {
    let mut months: BTreeMap<(i32, u32), MonthlyTotal> = BTreeMap::new();

    for bonus in bonuses {
        let entry = bucket(&mut months, bonus.received_at);
        entry.bonuses = entry.bonuses + bonus.amount;
    }
    for withdrawal in withdrawals.iter().filter(|w| {
        !matches!(
            w.status,
            TransactionStatus::Failed | TransactionStatus::Cancelled
        )
    }) {
        let entry = bucket(&mut months, withdrawal.created_at);
        entry.withdrawals = entry.withdrawals + withdrawal.amount;
    }

    months.into_values().collect()
}

fn bucket(months: &mut BTreeMap<(i32, u32), MonthlyTotal>, ts: i64) -> &mut MonthlyTotal {
    let date = DateTime::from_timestamp(ts, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    months
        .entry((date.year(), date.month()))
        .or_insert_with(|| MonthlyTotal {
            month: date.format("%b %Y").to_string(),
            bonuses: Amount::ZERO,
            withdrawals: Amount::ZERO,
        })
}
