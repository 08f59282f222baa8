//! Builds and submits activation and withdrawal payments.
//!
//! Validation happens before any network or storage call. A withdrawal
//! reserves the funds with a conditional debit before the gateway is
//! contacted and releases them again if the gateway refuses, so the balance
//! the user sees already reflects the pending payout and two concurrent
//! flows can never spend the same shillings.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::config::Policy;
use crate::db;
use crate::errors::{Result, TaskPayError};
use crate::gateway::{PaymentGateway, PaymentRequest};
use crate::models::{Amount, Transaction, TransactionKind, TransactionStatus};
use crate::phone;

/// Allocates `"{user_id}:{millis}"` references. Millis never repeat within a
/// process, even for calls inside the same millisecond.
#[derive(Debug, Default)]
pub struct ReferenceGenerator {
    last_millis: AtomicI64,
}

impl ReferenceGenerator {
    pub fn next(&self, user_id: &str) -> String {
        let now = chrono::Utc::now().timestamp_millis();
        let previous = self
            .last_millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        format!("{user_id}:{}", now.max(previous + 1))
    }
}

pub struct PaymentRequestIssuer<G> {
    pool: SqlitePool,
    gateway: Arc<G>,
    policy: Policy,
    references: ReferenceGenerator,
}

impl<G: PaymentGateway> PaymentRequestIssuer<G> {
    pub fn new(pool: SqlitePool, gateway: Arc<G>, policy: Policy) -> Self {
        PaymentRequestIssuer {
            pool,
            gateway,
            policy,
            references: ReferenceGenerator::default(),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Validate, submit to the gateway and record a `QUEUED` transaction.
    ///
    /// The returned transaction carries both the client and the gateway
    /// reference; poll it with the reconciler.
    pub async fn initiate(
        &self,
        user_id: &str,
        kind: TransactionKind,
        amount: Amount,
        phone: &str,
    ) -> Result<Transaction> {
        let user = db::get_user(&self.pool, user_id).await?;
        let phone = phone::to_canonical(phone)?;

        match kind {
            TransactionKind::Withdrawal => {
                if !user.is_active {
                    return Err(TaskPayError::AccountInactive);
                }
                if amount < self.policy.minimum_withdrawal {
                    return Err(TaskPayError::BelowMinimumWithdrawal {
                        requested: amount.as_kes(),
                        minimum: self.policy.minimum_withdrawal.as_kes(),
                    });
                }
                if amount > user.balance {
                    return Err(insufficient(amount, user.balance));
                }
            }
            TransactionKind::Activation => {
                if user.is_active {
                    return Err(TaskPayError::AlreadyClaimed(
                        "account is already active".to_string(),
                    ));
                }
                if !amount.is_positive() {
                    return Err(TaskPayError::GatewayRejected(format!(
                        "invalid activation amount {amount}"
                    )));
                }
            }
        }

        let client_reference = self.references.next(user_id);

        if kind == TransactionKind::Withdrawal
            && !db::debit_balance(&self.pool, user_id, amount).await?
        {
            // Another flow spent the funds between the read and the debit.
            let current = db::get_user(&self.pool, user_id).await?.balance;
            return Err(insufficient(amount, current));
        }

        let request = PaymentRequest::new(&phone, amount, &client_reference);
        let gateway_reference = match self.gateway.initiate(&request).await {
            Ok(reference) => reference,
            Err(e) => {
                warn!(user_id, %client_reference, "Payment initiation failed: {e}");
                if kind == TransactionKind::Withdrawal {
                    self.release(user_id, amount, &client_reference).await;
                }
                return Err(e);
            }
        };

        let transaction = Transaction {
            client_reference,
            gateway_reference,
            user_id: user_id.to_string(),
            amount,
            phone: phone.into_inner(),
            kind,
            status: TransactionStatus::Queued,
            created_at: chrono::Utc::now().timestamp(),
            settled_at: None,
        };

        let mut tx = self.pool.begin().await?;
        db::insert_transaction(&mut *tx, &transaction).await?;
        if kind == TransactionKind::Withdrawal {
            db::insert_withdrawal(&mut *tx, &transaction).await?;
        }
        if let Err(e) = tx.commit().await {
            error!(
                user_id,
                client_reference = %transaction.client_reference,
                gateway_reference = %transaction.gateway_reference,
                "Gateway accepted a payment that could not be recorded: {e}"
            );
            return Err(e.into());
        }

        info!(
            user_id,
            client_reference = %transaction.client_reference,
            gateway_reference = %transaction.gateway_reference,
            kind = ?kind,
            amount = %amount,
            "Payment queued"
        );
        Ok(transaction)
    }

    async fn release(&self, user_id: &str, amount: Amount, client_reference: &str) {
        match db::credit_balance(&self.pool, user_id, amount).await {
            Ok(_) => info!(user_id, client_reference, "Released reserved {amount}"),
            Err(e) => error!(
                user_id,
                client_reference, "Failed to release reserved {amount}: {e}"
            ),
        }
    }
}

fn insufficient(requested: Amount, available: Amount) -> TaskPayError {
    TaskPayError::InsufficientBalance {
        requested: requested.as_kes(),
        available: available.as_kes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{memory_pool, seed_user, Scripted, ScriptedGateway};

    async fn issuer_with(
        balance: i64,
        active: bool,
    ) -> (PaymentRequestIssuer<ScriptedGateway>, Arc<ScriptedGateway>, SqlitePool) {
        let pool = memory_pool().await;
        seed_user(&pool, "u1", Amount::kes(balance), active).await;
        let gateway = Arc::new(ScriptedGateway::new());
        let issuer = PaymentRequestIssuer::new(pool.clone(), gateway.clone(), Policy::default());
        (issuer, gateway, pool)
    }

    async fn transaction_count(pool: &SqlitePool) -> i64 {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM transactions")
            .fetch_one(pool)
            .await
            .unwrap();
        n
    }

    #[test]
    fn references_are_unique_and_increasing() {
        let generator = ReferenceGenerator::default();
        let refs: Vec<i64> = (0..100)
            .map(|_| {
                let r = generator.next("u1");
                r.strip_prefix("u1:").unwrap().parse().unwrap()
            })
            .collect();
        assert!(refs.windows(2).all(|w| w[1] > w[0]));
    }

    #[tokio::test]
    async fn withdrawal_debits_and_queues() {
        let (issuer, gateway, pool) = issuer_with(2000, true).await;

        let tx = issuer
            .initiate(
                "u1",
                TransactionKind::Withdrawal,
                Amount::kes(1800),
                "0712345678",
            )
            .await
            .unwrap();

        assert_eq!(tx.status, TransactionStatus::Queued);
        assert_eq!(tx.gateway_reference, "GW-1");
        assert!(tx.client_reference.starts_with("u1:"));
        assert_eq!(tx.phone, "254712345678");

        let sent = gateway.initiated.lock().unwrap()[0].clone();
        assert_eq!(sent.phone_number, "254712345678");
        assert_eq!(sent.amount, 1800);
        assert_eq!(sent.reference, tx.client_reference);

        assert_eq!(
            db::get_user(&pool, "u1").await.unwrap().balance,
            Amount::kes(200)
        );
        assert_eq!(db::get_transaction(&pool, &tx.client_reference).await.unwrap(), tx);

        let history = db::get_withdrawals(&pool, "u1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TransactionStatus::Queued);
    }

    #[tokio::test]
    async fn below_minimum_writes_nothing() {
        let (issuer, gateway, pool) = issuer_with(5000, true).await;

        let err = issuer
            .initiate(
                "u1",
                TransactionKind::Withdrawal,
                Amount::kes(1499),
                "0712345678",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TaskPayError::BelowMinimumWithdrawal { .. }));
        assert_eq!(transaction_count(&pool).await, 0);
        assert_eq!(gateway.initiated_count(), 0);
    }

    #[tokio::test]
    async fn overdraw_writes_nothing_and_keeps_balance() {
        let (issuer, gateway, pool) = issuer_with(2000, true).await;

        let err = issuer
            .initiate(
                "u1",
                TransactionKind::Withdrawal,
                Amount::kes(2001),
                "0712345678",
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TaskPayError::InsufficientBalance {
                requested: 2001,
                available: 2000
            }
        ));
        assert_eq!(transaction_count(&pool).await, 0);
        assert_eq!(gateway.initiated_count(), 0);
        assert_eq!(
            db::get_user(&pool, "u1").await.unwrap().balance,
            Amount::kes(2000)
        );
    }

    #[tokio::test]
    async fn inactive_account_cannot_withdraw() {
        let (issuer, _gateway, _pool) = issuer_with(2000, false).await;
        let err = issuer
            .initiate(
                "u1",
                TransactionKind::Withdrawal,
                Amount::kes(1500),
                "0712345678",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskPayError::AccountInactive));
    }

    #[tokio::test]
    async fn invalid_phone_is_rejected_before_the_gateway() {
        let (issuer, gateway, _pool) = issuer_with(2000, true).await;
        let err = issuer
            .initiate("u1", TransactionKind::Withdrawal, Amount::kes(1500), "12345")
            .await
            .unwrap_err();
        assert!(matches!(err, TaskPayError::InvalidPhoneFormat(_)));
        assert_eq!(gateway.initiated_count(), 0);
    }

    #[tokio::test]
    async fn gateway_rejection_releases_the_reservation() {
        let (issuer, gateway, pool) = issuer_with(2000, true).await;
        gateway.fail_initiate(Scripted::Rejected);

        let err = issuer
            .initiate(
                "u1",
                TransactionKind::Withdrawal,
                Amount::kes(1800),
                "0712345678",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TaskPayError::GatewayRejected(_)));
        assert_eq!(transaction_count(&pool).await, 0);
        assert_eq!(
            db::get_user(&pool, "u1").await.unwrap().balance,
            Amount::kes(2000)
        );
    }

    #[tokio::test]
    async fn unreachable_gateway_is_surfaced() {
        let (issuer, gateway, pool) = issuer_with(2000, true).await;
        gateway.fail_initiate(Scripted::Unreachable);

        let err = issuer
            .initiate(
                "u1",
                TransactionKind::Withdrawal,
                Amount::kes(1600),
                "0712345678",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TaskPayError::GatewayUnreachable(_)));
        assert_eq!(
            db::get_user(&pool, "u1").await.unwrap().balance,
            Amount::kes(2000)
        );
    }

    #[tokio::test]
    async fn activation_queues_without_touching_balance() {
        let (issuer, _gateway, pool) = issuer_with(0, false).await;

        let tx = issuer
            .initiate(
                "u1",
                TransactionKind::Activation,
                Amount::kes(300),
                "+254712345678",
            )
            .await
            .unwrap();

        assert_eq!(tx.kind, TransactionKind::Activation);
        assert_eq!(tx.status, TransactionStatus::Queued);
        let user = db::get_user(&pool, "u1").await.unwrap();
        assert_eq!(user.balance, Amount::ZERO);
        assert!(!user.is_active);
        assert!(db::get_withdrawals(&pool, "u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn active_account_cannot_activate_again() {
        let (issuer, gateway, _pool) = issuer_with(0, true).await;
        let err = issuer
            .initiate(
                "u1",
                TransactionKind::Activation,
                Amount::kes(300),
                "0712345678",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskPayError::AlreadyClaimed(_)));
        assert_eq!(gateway.initiated_count(), 0);
    }

    #[tokio::test]
    async fn unknown_user_is_reported() {
        let (issuer, _gateway, _pool) = issuer_with(0, true).await;
        let err = issuer
            .initiate(
                "ghost",
                TransactionKind::Withdrawal,
                Amount::kes(1500),
                "0712345678",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskPayError::UserNotFound(_)));
    }
}
