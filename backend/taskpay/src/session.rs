//! Per-user session context and the background jobs it owns.
//!
//! A [`Session`] exists between login and logout and owns every job started on
//! the user's behalf: at most one payment poll plus one ticker per running
//! task. All jobs hang off the session's root [`CancellationToken`], so logout
//! stops them together.
//!
//! The session map lock is never held across a gateway call or while waiting
//! for a background job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accounts;
use crate::catalog::Catalog;
use crate::config::Policy;
use crate::cooldown::CooldownGate;
use crate::db;
use crate::errors::{Result, TaskPayError};
use crate::gateway::PaymentGateway;
use crate::issuer::PaymentRequestIssuer;
use crate::models::{
    Amount, Task, TaskPhase, Transaction, TransactionKind, TransactionStatus, User,
};
use crate::reconciler::TransactionReconciler;
use crate::timer::{Begun, Opened, TaskTimerEngine};

/// Where the session's most recent payment stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PaymentProgress {
    Polling {
        client_reference: String,
    },
    Settled {
        client_reference: String,
        status: TransactionStatus,
    },
    /// Verification gave up; the transaction stays queued until next login.
    Unverified {
        client_reference: String,
    },
}

struct ActivePayment {
    /// `None` while the gateway call is still in flight.
    client_reference: Option<String>,
}

struct Ticker {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Session {
    user: User,
    /// Bearer token issued at login.
    token: String,
    root: CancellationToken,
    payment: Option<ActivePayment>,
    last_payment: Option<PaymentProgress>,
    tickers: HashMap<String, Ticker>,
}

impl Session {
    fn new(user: User, token: String) -> Self {
        Session {
            user,
            token,
            root: CancellationToken::new(),
            payment: None,
            last_payment: None,
            tickers: HashMap::new(),
        }
    }
}

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct LoggedIn {
    pub user: User,
    pub token: String,
}

type Sessions = Arc<RwLock<HashMap<String, Session>>>;

pub struct SessionManager<G> {
    pool: SqlitePool,
    policy: Policy,
    catalog: Catalog,
    engine: Arc<TaskTimerEngine>,
    issuer: PaymentRequestIssuer<G>,
    reconciler: Arc<TransactionReconciler<G>>,
    sessions: Sessions,
    ticker_generation: AtomicU64,
}

impl<G: PaymentGateway + 'static> SessionManager<G> {
    pub fn new(pool: SqlitePool, gateway: Arc<G>, policy: Policy, catalog: Catalog) -> Self {
        let gate = CooldownGate::from_policy(&policy);
        SessionManager {
            engine: Arc::new(TaskTimerEngine::new(pool.clone(), gate)),
            issuer: PaymentRequestIssuer::new(pool.clone(), gateway.clone(), policy.clone()),
            reconciler: Arc::new(TransactionReconciler::new(
                pool.clone(),
                gateway,
                policy.poll_interval,
                policy.max_poll_failures,
            )),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ticker_generation: AtomicU64::new(0),
            pool,
            policy,
            catalog,
        }
    }

    /// Override the task ticker cadence.
    pub fn with_tick_period(mut self, tick_period: Duration) -> Self {
        let gate = CooldownGate::from_policy(&self.policy);
        self.engine =
            Arc::new(TaskTimerEngine::new(self.pool.clone(), gate).with_tick_period(tick_period));
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    // ─────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────

    /// Check the phone number and password, then open a session (or refresh an
    /// existing one) under a fresh bearer token. Polling resumes for the
    /// oldest transaction left queued by an earlier session.
    pub async fn login(&self, phone: &str, password: &str) -> Result<LoggedIn> {
        let user = accounts::authenticate(&self.pool, phone, password).await?;
        let user_id = user.id.as_str();
        let queued = db::queued_transactions_for_user(&self.pool, user_id).await?;
        let token = uuid::Uuid::new_v4().simple().to_string();

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(user.id.clone())
            .or_insert_with(|| Session::new(user.clone(), token.clone()));
        session.user = user.clone();
        session.token = token.clone();

        if session.payment.is_none() {
            if let Some(transaction) = queued.into_iter().next() {
                info!(
                    user_id,
                    client_reference = %transaction.client_reference,
                    "Resuming verification of queued transaction"
                );
                self.arm_poll(session, transaction);
            }
        }

        info!(user_id, "Session opened");
        Ok(LoggedIn { user, token })
    }

    /// Accept `token` only if it is the one issued to `user_id`'s session.
    pub async fn authorize(&self, user_id: &str, token: &str) -> Result<()> {
        match self.sessions.read().await.get(user_id) {
            Some(session) if session.token == token => Ok(()),
            _ => {
                debug!(user_id, "Rejected session token");
                Err(TaskPayError::Unauthorized)
            }
        }
    }

    /// Close the session and cancel every job it owns.
    pub async fn logout(&self, user_id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(user_id)
            .ok_or_else(|| TaskPayError::SessionNotFound(user_id.to_string()))?;

        session.root.cancel();
        info!(
            user_id,
            tickers = session.tickers.len(),
            polling = session.payment.is_some(),
            "Session closed"
        );
        Ok(())
    }

    pub async fn is_logged_in(&self, user_id: &str) -> bool {
        self.sessions.read().await.contains_key(user_id)
    }

    /// The cached profile.
    pub async fn user(&self, user_id: &str) -> Result<User> {
        self.sessions
            .read()
            .await
            .get(user_id)
            .map(|s| s.user.clone())
            .ok_or_else(|| TaskPayError::SessionNotFound(user_id.to_string()))
    }

    /// Reload the cached profile from storage.
    pub async fn refresh(&self, user_id: &str) -> Result<User> {
        let user = db::get_user(&self.pool, user_id).await?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(user_id)
            .ok_or_else(|| TaskPayError::SessionNotFound(user_id.to_string()))?;
        session.user = user.clone();
        Ok(user)
    }

    // ─────────────────────────────────────────────────────
    // Payments
    // ─────────────────────────────────────────────────────

    /// Charge the activation fee to `phone`.
    pub async fn activate(&self, user_id: &str, phone: &str) -> Result<Transaction> {
        self.start_payment(
            user_id,
            TransactionKind::Activation,
            self.policy.activation_fee,
            phone,
        )
        .await
    }

    pub async fn withdraw(
        &self,
        user_id: &str,
        amount: Amount,
        phone: &str,
    ) -> Result<Transaction> {
        self.start_payment(user_id, TransactionKind::Withdrawal, amount, phone)
            .await
    }

    /// Initiate a payment and start polling its outcome. Fails with
    /// `PaymentPending` while another payment of the session is unresolved.
    pub async fn start_payment(
        &self,
        user_id: &str,
        kind: TransactionKind,
        amount: Amount,
        phone: &str,
    ) -> Result<Transaction> {
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(user_id)
                .ok_or_else(|| TaskPayError::SessionNotFound(user_id.to_string()))?;
            if let Some(active) = &session.payment {
                let pending = active
                    .client_reference
                    .clone()
                    .unwrap_or_else(|| "initiating".to_string());
                return Err(TaskPayError::PaymentPending(pending));
            }
            session.payment = Some(ActivePayment {
                client_reference: None,
            });
        }

        let initiated = self.issuer.initiate(user_id, kind, amount, phone).await;
        let user = db::get_user(&self.pool, user_id).await;

        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(user_id) else {
            // Logged out mid-call; a queued transaction is picked up at next login.
            return initiated;
        };
        session.payment = None;
        if let Ok(user) = user {
            session.user = user;
        }

        let transaction = initiated?;
        self.arm_poll(session, transaction.clone());
        Ok(transaction)
    }

    pub async fn payment_progress(&self, user_id: &str) -> Result<Option<PaymentProgress>> {
        self.sessions
            .read()
            .await
            .get(user_id)
            .map(|s| s.last_payment.clone())
            .ok_or_else(|| TaskPayError::SessionNotFound(user_id.to_string()))
    }

    fn arm_poll(&self, session: &mut Session, transaction: Transaction) {
        let cancel = session.root.child_token();
        let client_reference = transaction.client_reference.clone();
        let user_id = transaction.user_id.clone();

        session.payment = Some(ActivePayment {
            client_reference: Some(client_reference.clone()),
        });
        session.last_payment = Some(PaymentProgress::Polling {
            client_reference: client_reference.clone(),
        });

        let job = self.reconciler.track(transaction);
        let reconciler = Arc::clone(&self.reconciler);
        let sessions = Arc::clone(&self.sessions);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let progress = match reconciler.run(job, cancel.clone()).await {
                Ok(Some(status)) => PaymentProgress::Settled {
                    client_reference: client_reference.clone(),
                    status,
                },
                Ok(None) => return,
                Err(e) => {
                    warn!(user_id, %client_reference, "Payment left unverified: {e}");
                    PaymentProgress::Unverified {
                        client_reference: client_reference.clone(),
                    }
                }
            };

            let user = db::get_user(&pool, &user_id).await;
            let mut sessions = sessions.write().await;
            if cancel.is_cancelled() {
                return;
            }
            let Some(session) = sessions.get_mut(&user_id) else {
                return;
            };
            let owns_slot = session
                .payment
                .as_ref()
                .is_some_and(|p| p.client_reference.as_deref() == Some(client_reference.as_str()));
            if owns_slot {
                session.payment = None;
            }
            session.last_payment = Some(progress);
            if let Ok(user) = user {
                session.user = user;
            }
        });
    }

    // ─────────────────────────────────────────────────────
    // Tasks
    // ─────────────────────────────────────────────────────

    pub async fn open_task(&self, user_id: &str, task_id: &str) -> Result<Opened> {
        self.require_session(user_id).await?;
        let task = self.catalog.get(task_id)?;
        let opened = self.engine.open(user_id, task, now()).await?;
        if opened.completion.as_ref().is_some_and(|c| c.credited) {
            self.refresh(user_id).await?;
        }
        Ok(opened)
    }

    /// Start or resume the task and keep its clock ticking in the background.
    pub async fn begin_task(&self, user_id: &str, task_id: &str) -> Result<Begun> {
        self.require_session(user_id).await?;
        let task = self.catalog.get(task_id)?.clone();
        let begun = self.engine.begin(user_id, &task, now()).await?;
        if matches!(begun.phase, TaskPhase::Running { .. }) {
            self.ensure_ticker(user_id, task).await?;
        }
        Ok(begun)
    }

    /// Stop the ticker, then freeze the clock.
    pub async fn pause_task(&self, user_id: &str, task_id: &str) -> Result<TaskPhase> {
        let ticker = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(user_id)
                .ok_or_else(|| TaskPayError::SessionNotFound(user_id.to_string()))?;
            session.tickers.remove(task_id)
        };

        // The ticker must be gone before the pause is written, or a late tick
        // could overwrite the paused state.
        if let Some(ticker) = ticker {
            ticker.cancel.cancel();
            if let Err(e) = ticker.handle.await {
                warn!(user_id, task_id, "Ticker ended abnormally: {e}");
            }
        }

        let task = self.catalog.get(task_id)?;
        self.engine.pause(user_id, task, now()).await
    }

    async fn ensure_ticker(&self, user_id: &str, task: Task) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(user_id)
            .ok_or_else(|| TaskPayError::SessionNotFound(user_id.to_string()))?;

        if session
            .tickers
            .get(&task.id)
            .is_some_and(|t| !t.handle.is_finished())
        {
            return Ok(());
        }

        let generation = self.ticker_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = session.root.child_token();
        let task_id = task.id.clone();
        let ticker = self
            .engine
            .spawn_ticker(user_id.to_string(), task, cancel.clone());

        let sessions_ref = Arc::clone(&self.sessions);
        let pool = self.pool.clone();
        let owner = user_id.to_string();
        let watched_task = task_id.clone();
        let handle = tokio::spawn(async move {
            let completion = match ticker.await {
                Ok(Ok(completion)) => completion,
                Ok(Err(e)) => {
                    warn!(user_id = %owner, task_id = %watched_task, "Ticker failed: {e}");
                    None
                }
                Err(e) => {
                    warn!(user_id = %owner, task_id = %watched_task, "Ticker panicked: {e}");
                    None
                }
            };
            let user = match &completion {
                Some(c) if c.credited => db::get_user(&pool, &owner).await.ok(),
                _ => None,
            };

            let mut sessions = sessions_ref.write().await;
            let Some(session) = sessions.get_mut(&owner) else {
                return;
            };
            if session
                .tickers
                .get(&watched_task)
                .is_some_and(|t| t.generation == generation)
            {
                session.tickers.remove(&watched_task);
            }
            if let Some(user) = user {
                debug!(
                    user_id = %owner,
                    task_id = %watched_task,
                    "Refreshing balance after completion"
                );
                session.user = user;
            }
        });

        session.tickers.insert(
            task_id,
            Ticker {
                generation,
                cancel,
                handle,
            },
        );
        Ok(())
    }

    async fn require_session(&self, user_id: &str) -> Result<()> {
        if self.is_logged_in(user_id).await {
            Ok(())
        } else {
            Err(TaskPayError::SessionNotFound(user_id.to_string()))
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
