//! Polls the gateway for the outcome of queued transactions and applies each
//! terminal outcome exactly once.
//!
//! ## Resilience
//!
//! * Every poll job carries its own consecutive-failure counter. A successful
//!   query resets it; reaching the configured maximum abandons the job and
//!   leaves the stored transaction `QUEUED` for later reconciliation.
//! * The terminal status and its side effects (activation flag, withdrawal
//!   compensation) are written in one SQL transaction guarded by
//!   `status = 'QUEUED'`, so duplicate deliveries and racing pollers are
//!   no-ops.
//! * A poll loop stops as soon as its cancellation token fires, dropping any
//!   in-flight gateway call before its result can be applied.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db;
use crate::errors::{Result, TaskPayError};
use crate::gateway::PaymentGateway;
use crate::models::{Transaction, TransactionKind, TransactionStatus};

/// Polling state for one queued transaction.
#[derive(Debug, Clone)]
pub struct PollJob {
    transaction: Transaction,
    consecutive_failures: u32,
}

impl PollJob {
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn client_reference(&self) -> &str {
        &self.transaction.client_reference
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The gateway still reports the payment as queued, or the query failed
    /// and will be retried.
    Pending,
    /// A terminal status was recorded (or had already been recorded).
    Settled(TransactionStatus),
}

pub struct TransactionReconciler<G> {
    pool: SqlitePool,
    gateway: Arc<G>,
    interval: Duration,
    max_failures: u32,
    active: Mutex<HashSet<String>>,
}

impl<G: PaymentGateway> TransactionReconciler<G> {
    pub fn new(pool: SqlitePool, gateway: Arc<G>, interval: Duration, max_failures: u32) -> Self {
        TransactionReconciler {
            pool,
            gateway,
            interval,
            max_failures: max_failures.max(1),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Register a queued transaction for polling.
    pub fn track(&self, transaction: Transaction) -> PollJob {
        self.active_set()
            .insert(transaction.client_reference.clone());
        debug!(client_reference = %transaction.client_reference, "Tracking transaction");
        PollJob {
            transaction,
            consecutive_failures: 0,
        }
    }

    pub fn is_tracked(&self, client_reference: &str) -> bool {
        self.active_set().contains(client_reference)
    }

    pub fn tracked_count(&self) -> usize {
        self.active_set().len()
    }

    fn retire(&self, client_reference: &str) {
        self.active_set().remove(client_reference);
    }

    fn active_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // The set holds plain strings, so a poisoned lock is still consistent.
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Query the gateway once and act on the answer.
    ///
    /// Returns `TransactionVerificationExhausted` once the job has failed
    /// `max_failures` times in a row; the job is retired and the stored
    /// transaction stays `QUEUED`.
    pub async fn poll(&self, job: &mut PollJob) -> Result<PollOutcome> {
        let client_reference = job.transaction.client_reference.clone();

        let status = match self
            .gateway
            .query_status(&job.transaction.gateway_reference)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                job.consecutive_failures += 1;
                if job.consecutive_failures >= self.max_failures {
                    self.retire(&client_reference);
                    error!(
                        %client_reference,
                        attempts = job.consecutive_failures,
                        "Giving up on transaction verification: {e}"
                    );
                    return Err(TaskPayError::TransactionVerificationExhausted {
                        client_reference,
                        attempts: job.consecutive_failures,
                    });
                }
                warn!(
                    %client_reference,
                    attempts = job.consecutive_failures,
                    "Status query failed (will retry): {e}"
                );
                return Ok(PollOutcome::Pending);
            }
        };

        job.consecutive_failures = 0;
        if !status.is_terminal() {
            debug!(%client_reference, "Transaction still queued");
            return Ok(PollOutcome::Pending);
        }

        // A storage error here keeps the job tracked so the next tick retries.
        self.settle(&job.transaction, status).await?;
        self.retire(&client_reference);
        Ok(PollOutcome::Settled(status))
    }

    /// Record a terminal status and apply its side effects in one SQL
    /// transaction. Returns `false` if the transaction was already settled.
    pub async fn settle(
        &self,
        transaction: &Transaction,
        status: TransactionStatus,
    ) -> Result<bool> {
        let client_reference = transaction.client_reference.as_str();
        let user_id = transaction.user_id.as_str();
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;
        if !db::settle_transaction(&mut *tx, client_reference, status, now).await? {
            debug!(client_reference, "Transaction already settled; ignoring {status:?}");
            return Ok(false);
        }

        match (transaction.kind, status) {
            (TransactionKind::Activation, TransactionStatus::Success) => {
                if db::set_active(&mut *tx, user_id).await? {
                    info!(user_id, client_reference, "Account activated");
                }
            }
            (
                TransactionKind::Withdrawal,
                TransactionStatus::Failed | TransactionStatus::Cancelled,
            ) => {
                if !db::credit_balance(&mut *tx, user_id, transaction.amount).await? {
                    return Err(TaskPayError::UserNotFound(user_id.to_string()));
                }
                info!(
                    user_id,
                    client_reference,
                    amount = %transaction.amount,
                    "Withdrawal {}; reserved funds returned",
                    status.as_str()
                );
            }
            // The withdrawal debit was applied at initiation; a failed
            // activation charge never touched the balance.
            _ => {}
        }

        tx.commit().await?;
        info!(user_id, client_reference, "Transaction settled as {}", status.as_str());
        Ok(true)
    }

    /// Poll on the configured interval until the transaction settles,
    /// verification is exhausted, or `cancel` fires (`Ok(None)`).
    pub async fn run(
        &self,
        mut job: PollJob,
        cancel: CancellationToken,
    ) -> Result<Option<TransactionStatus>> {
        let client_reference = job.client_reference().to_string();
        let mut interval = tokio::time::interval(self.interval);
        info!(%client_reference, "Polling transaction status");

        loop {
            // Cancellation wins over a ready poll.
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = async {
                    interval.tick().await;
                    self.poll(&mut job).await
                } => Some(outcome),
            };

            match outcome {
                None => {
                    self.retire(&client_reference);
                    info!(%client_reference, "Polling cancelled");
                    return Ok(None);
                }
                Some(Ok(PollOutcome::Settled(status))) => return Ok(Some(status)),
                Some(Ok(PollOutcome::Pending)) => {}
                Some(Err(e @ TaskPayError::TransactionVerificationExhausted { .. })) => {
                    return Err(e)
                }
                Some(Err(e)) => {
                    error!(%client_reference, "Failed to apply transaction outcome: {e}");
                }
            }
        }
    }
}
