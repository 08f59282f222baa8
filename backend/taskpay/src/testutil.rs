//! Shared fixtures for unit tests: an in-memory database and a scripted gateway.

use std::collections::VecDeque;
use std::sync::Mutex;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::db;
use crate::errors::{Result, TaskPayError};
use crate::gateway::{PaymentGateway, PaymentRequest};
use crate::models::{Amount, Task, TransactionStatus, User};

/// Single-connection in-memory pool with migrations applied.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    db::migrate(&pool).await.expect("migrations");
    pool
}

/// Password every seeded user logs in with.
pub const TEST_PASSWORD: &str = "correct horse";

pub async fn seed_user(pool: &SqlitePool, id: &str, balance: Amount, active: bool) -> User {
    let user = User {
        id: id.to_string(),
        name: format!("User {id}"),
        email: format!("{id}@example.com"),
        phone: format!("254700{:06}", pool_unique(id)),
        balance,
        is_active: active,
        has_claimed_welcome_bonus: false,
        referral_code: None,
        created_at: 1_700_000_000,
    };
    let hash = bcrypt::hash(TEST_PASSWORD, 4).expect("hash");
    db::create_user(pool, &user, &hash).await.expect("seed user");
    user
}

fn pool_unique(id: &str) -> u32 {
    id.bytes()
        .fold(7u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32))
        % 1_000_000
}

pub fn quiz_task(duration_secs: u32, reward: i64) -> Task {
    Task {
        id: "task1".to_string(),
        title: "Climate Action Quiz".to_string(),
        description: "Test your knowledge.".to_string(),
        reward: Amount::kes(reward),
        duration_secs,
        external_link: None,
    }
}

/// What the next status query should produce.
#[derive(Debug, Clone)]
pub enum Scripted {
    Status(TransactionStatus),
    Unreachable,
    Rejected,
}

/// Gateway double: records initiate calls and replays scripted status answers.
/// Once the script runs out the last entry repeats.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    pub initiated: Mutex<Vec<PaymentRequest>>,
    initiate_result: Mutex<Option<Scripted>>,
    statuses: Mutex<VecDeque<Scripted>>,
    last: Mutex<Option<Scripted>>,
    pub status_queries: Mutex<u32>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statuses(statuses: impl IntoIterator<Item = Scripted>) -> Self {
        let gw = Self::new();
        gw.statuses.lock().unwrap().extend(statuses);
        gw
    }

    /// Make the next initiate call fail.
    pub fn fail_initiate(&self, how: Scripted) {
        *self.initiate_result.lock().unwrap() = Some(how);
    }

    pub fn initiated_count(&self) -> usize {
        self.initiated.lock().unwrap().len()
    }

    pub fn query_count(&self) -> u32 {
        *self.status_queries.lock().unwrap()
    }
}

impl PaymentGateway for ScriptedGateway {
    async fn initiate(&self, request: &PaymentRequest) -> Result<String> {
        if let Some(failure) = self.initiate_result.lock().unwrap().take() {
            return Err(match failure {
                Scripted::Unreachable => TaskPayError::GatewayUnreachable("timeout".to_string()),
                _ => TaskPayError::GatewayRejected("Invalid MSISDN".to_string()),
            });
        }
        let mut initiated = self.initiated.lock().unwrap();
        initiated.push(request.clone());
        Ok(format!("GW-{}", initiated.len()))
    }

    async fn query_status(&self, _gateway_reference: &str) -> Result<TransactionStatus> {
        *self.status_queries.lock().unwrap() += 1;
        let next = {
            let mut queue = self.statuses.lock().unwrap();
            let mut last = self.last.lock().unwrap();
            if let Some(entry) = queue.pop_front() {
                *last = Some(entry.clone());
            }
            last.clone()
        };
        match next {
            Some(Scripted::Status(status)) => Ok(status),
            Some(Scripted::Rejected) => {
                Err(TaskPayError::GatewayRejected("unknown reference".to_string()))
            }
            Some(Scripted::Unreachable) | None => {
                Err(TaskPayError::GatewayUnreachable("connection reset".to_string()))
            }
        }
    }
}
