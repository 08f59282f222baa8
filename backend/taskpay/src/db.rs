//! Database layer: migrations, profile store, task state persistence,
//! transactions and the append-only ledger.
//!
//! Balance writes are always relative (`balance = balance ± ?`) and debits are
//! conditional on sufficient funds, so concurrent flows never overwrite each
//! other's updates. Functions that take a generic executor can run either on
//! the pool or inside a caller-owned SQL transaction.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::info;

use crate::errors::{Result, TaskPayError};
use crate::models::{
    Amount, BonusRecord, TaskPhase, TaskStateRow, Transaction, TransactionStatus, User, UserPatch,
    WithdrawalRecord,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    // Make sure the file is created if it doesn't exist yet.
    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied successfully");
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────

const USER_COLUMNS: &str = "id, name, email, phone, balance, is_active, \
                            has_claimed_welcome_bonus, referral_code, created_at";

/// Insert a user together with the bcrypt hash of their password. The hash
/// never leaves this module except through [`password_hash`].
pub async fn create_user(pool: &SqlitePool, user: &User, password_hash: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO users
            (id, name, email, phone, balance, is_active, has_claimed_welcome_bonus,
             referral_code, created_at, password_hash)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(&user.id)
    .bind(&user.name)
    .bind(&user.email)
    .bind(&user.phone)
    .bind(user.balance)
    .bind(user.is_active)
    .bind(user.has_claimed_welcome_bonus)
    .bind(&user.referral_code)
    .bind(user.created_at)
    .bind(password_hash)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_user<'e, E>(executor: E, user_id: &str) -> Result<User>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"))
        .bind(user_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| TaskPayError::UserNotFound(user_id.to_string()))
}

pub async fn find_user_by_phone(pool: &SqlitePool, phone: &str) -> Result<Option<User>> {
    let user =
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE phone = ?1"))
            .bind(phone)
            .fetch_optional(pool)
            .await?;
    Ok(user)
}

pub async fn find_user_by_email(pool: &SqlitePool, email: &str) -> Result<Option<User>> {
    let user =
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"))
            .bind(email)
            .fetch_optional(pool)
            .await?;
    Ok(user)
}

pub async fn password_hash(pool: &SqlitePool, user_id: &str) -> Result<String> {
    sqlx::query_scalar::<_, String>("SELECT password_hash FROM users WHERE id = ?1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| TaskPayError::UserNotFound(user_id.to_string()))
}

/// Merge `patch` into the stored profile; absent fields keep their values.
pub async fn update_user(pool: &SqlitePool, user_id: &str, patch: &UserPatch) -> Result<User> {
    let rows = sqlx::query(
        r#"
        UPDATE users
        SET    name  = COALESCE(?2, name),
               email = COALESCE(?3, email),
               phone = COALESCE(?4, phone)
        WHERE  id = ?1
        "#,
    )
    .bind(user_id)
    .bind(&patch.name)
    .bind(&patch.email)
    .bind(&patch.phone)
    .execute(pool)
    .await?
    .rows_affected();

    if rows == 0 {
        return Err(TaskPayError::UserNotFound(user_id.to_string()));
    }
    get_user(pool, user_id).await
}

/// Add `amount` to the balance. Returns `false` when the user does not exist.
pub async fn credit_balance<'e, E>(executor: E, user_id: &str, amount: Amount) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("UPDATE users SET balance = balance + ?2 WHERE id = ?1")
        .bind(user_id)
        .bind(amount)
        .execute(executor)
        .await?
        .rows_affected();
    Ok(rows == 1)
}

/// Credit only if the account is active. Returns `false` otherwise.
pub async fn credit_active_balance<'e, E>(
    executor: E,
    user_id: &str,
    amount: Amount,
) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows =
        sqlx::query("UPDATE users SET balance = balance + ?2 WHERE id = ?1 AND is_active = 1")
            .bind(user_id)
            .bind(amount)
            .execute(executor)
            .await?
            .rows_affected();
    Ok(rows == 1)
}

/// Subtract `amount` if the balance covers it. Returns `false` when it does not.
pub async fn debit_balance<'e, E>(executor: E, user_id: &str, amount: Amount) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "UPDATE users SET balance = balance - ?2 WHERE id = ?1 AND balance >= ?2",
    )
    .bind(user_id)
    .bind(amount)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Flip `is_active` on. Returns `false` if it was already set.
pub async fn set_active<'e, E>(executor: E, user_id: &str) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("UPDATE users SET is_active = 1 WHERE id = ?1 AND is_active = 0")
        .bind(user_id)
        .execute(executor)
        .await?
        .rows_affected();
    Ok(rows == 1)
}

/// Mark the welcome bonus as claimed. Returns `false` if it already was.
pub async fn mark_bonus_claimed<'e, E>(executor: E, user_id: &str) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "UPDATE users SET has_claimed_welcome_bonus = 1 \
         WHERE id = ?1 AND has_claimed_welcome_bonus = 0",
    )
    .bind(user_id)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Store a referral code unless one is already set; returns the code in effect.
pub async fn set_referral_code(pool: &SqlitePool, user_id: &str, code: &str) -> Result<String> {
    sqlx::query("UPDATE users SET referral_code = ?2 WHERE id = ?1 AND referral_code IS NULL")
        .bind(user_id)
        .bind(code)
        .execute(pool)
        .await?;

    get_user(pool, user_id)
        .await?
        .referral_code
        .ok_or_else(|| TaskPayError::StateDecode(format!("referral code missing for {user_id}")))
}

// ─────────────────────────────────────────────────────────
// Task state
// ─────────────────────────────────────────────────────────

/// `None` when the user has never opened this task.
pub async fn load_task_state(
    pool: &SqlitePool,
    user_id: &str,
    task_id: &str,
) -> Result<Option<TaskPhase>> {
    let row = sqlx::query_as::<_, TaskStateRow>(
        r#"
        SELECT phase, started_at, paused_at, remaining_secs, completed_at
        FROM   task_states
        WHERE  user_id = ?1 AND task_id = ?2
        "#,
    )
    .bind(user_id)
    .bind(task_id)
    .fetch_optional(pool)
    .await?;

    row.map(TaskPhase::try_from).transpose()
}

/// Upsert the phase for `(user_id, task_id)`.
pub async fn save_task_state<'e, E>(
    executor: E,
    user_id: &str,
    task_id: &str,
    phase: &TaskPhase,
    now: i64,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let (started_at, paused_at, remaining, completed_at) = match *phase {
        TaskPhase::Idle => (None, None, None, None),
        TaskPhase::Running {
            started_at,
            remaining_secs,
        } => (Some(started_at), None, Some(remaining_secs as i64), None),
        TaskPhase::Paused {
            started_at,
            paused_at,
            remaining_secs,
        } => (
            Some(started_at),
            Some(paused_at),
            Some(remaining_secs as i64),
            None,
        ),
        TaskPhase::Completed { completed_at } => (None, None, None, Some(completed_at)),
    };

    sqlx::query(
        r#"
        INSERT INTO task_states
            (user_id, task_id, phase, started_at, paused_at, remaining_secs, completed_at,
             updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT (user_id, task_id) DO UPDATE SET
            phase          = excluded.phase,
            started_at     = excluded.started_at,
            paused_at      = excluded.paused_at,
            remaining_secs = excluded.remaining_secs,
            completed_at   = excluded.completed_at,
            updated_at     = excluded.updated_at
        "#,
    )
    .bind(user_id)
    .bind(task_id)
    .bind(phase.as_str())
    .bind(started_at)
    .bind(paused_at)
    .bind(remaining)
    .bind(completed_at)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(())
}

/// Move an in-progress task to `completed`. Returns `false` if the stored
/// state was not running or paused, i.e. someone else completed it first.
pub async fn mark_task_completed<'e, E>(
    executor: E,
    user_id: &str,
    task_id: &str,
    completed_at: i64,
) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        r#"
        UPDATE task_states
        SET    phase = 'completed', started_at = NULL, paused_at = NULL,
               remaining_secs = NULL, completed_at = ?3, updated_at = ?3
        WHERE  user_id = ?1 AND task_id = ?2 AND phase IN ('running', 'paused')
        "#,
    )
    .bind(user_id)
    .bind(task_id)
    .bind(completed_at)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

// ─────────────────────────────────────────────────────────
// Transactions
// ─────────────────────────────────────────────────────────

const TRANSACTION_COLUMNS: &str = "client_reference, gateway_reference, user_id, amount, phone, \
                                   kind, status, created_at, settled_at";

pub async fn insert_transaction<'e, E>(executor: E, tx: &Transaction) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO transactions
            (client_reference, gateway_reference, user_id, amount, phone, kind, status,
             created_at, settled_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(&tx.client_reference)
    .bind(&tx.gateway_reference)
    .bind(&tx.user_id)
    .bind(tx.amount)
    .bind(&tx.phone)
    .bind(tx.kind)
    .bind(tx.status)
    .bind(tx.created_at)
    .bind(tx.settled_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_transaction(pool: &SqlitePool, client_reference: &str) -> Result<Transaction> {
    sqlx::query_as::<_, Transaction>(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE client_reference = ?1"
    ))
    .bind(client_reference)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| TaskPayError::TransactionNotFound(client_reference.to_string()))
}

/// Transactions still awaiting a terminal status, oldest first.
pub async fn queued_transactions_for_user(
    pool: &SqlitePool,
    user_id: &str,
) -> Result<Vec<Transaction>> {
    let rows = sqlx::query_as::<_, Transaction>(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions \
         WHERE user_id = ?1 AND status = 'QUEUED' \
         ORDER BY created_at ASC, client_reference ASC"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Write a terminal status onto a still-queued transaction. Returns `false`
/// when the transaction had already left `QUEUED`.
pub async fn settle_transaction<'e, E>(
    executor: E,
    client_reference: &str,
    status: TransactionStatus,
    settled_at: i64,
) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        r#"
        UPDATE transactions
        SET    status = ?2, settled_at = ?3
        WHERE  client_reference = ?1 AND status = 'QUEUED'
        "#,
    )
    .bind(client_reference)
    .bind(status)
    .bind(settled_at)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

// ─────────────────────────────────────────────────────────
// Ledger writes
// ─────────────────────────────────────────────────────────

pub async fn insert_bonus<'e, E>(
    executor: E,
    user_id: &str,
    amount: Amount,
    source: &str,
    received_at: i64,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO bonuses (user_id, amount, source, received_at) VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(user_id)
    .bind(amount)
    .bind(source)
    .bind(received_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn insert_withdrawal<'e, E>(executor: E, tx: &Transaction) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO withdrawals (user_id, client_reference, phone, amount, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&tx.user_id)
    .bind(&tx.client_reference)
    .bind(&tx.phone)
    .bind(tx.amount)
    .bind(tx.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Ledger reads
// ─────────────────────────────────────────────────────────

/// All bonuses for a user, newest first.
pub async fn get_bonuses(pool: &SqlitePool, user_id: &str) -> Result<Vec<BonusRecord>> {
    let rows = sqlx::query_as::<_, BonusRecord>(
        r#"
        SELECT id, user_id, amount, source, received_at
        FROM   bonuses
        WHERE  user_id = ?1
        ORDER  BY received_at DESC, id DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// All withdrawals for a user with their transaction status, newest first.
pub async fn get_withdrawals(pool: &SqlitePool, user_id: &str) -> Result<Vec<WithdrawalRecord>> {
    let rows = sqlx::query_as::<_, WithdrawalRecord>(
        r#"
        SELECT w.id, w.user_id, w.client_reference, w.phone, w.amount, t.status,
               w.created_at
        FROM   withdrawals w
        JOIN   transactions t ON t.client_reference = w.client_reference
        WHERE  w.user_id = ?1
        ORDER  BY w.created_at DESC, w.id DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
