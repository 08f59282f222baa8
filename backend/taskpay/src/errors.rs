//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskPayError {
    #[error("Invalid phone number format: {0}")]
    InvalidPhoneFormat(String),

    #[error("Account is not active. Please activate your account to continue.")]
    AccountInactive,

    #[error("Insufficient balance: requested KES {requested}, available KES {available}")]
    InsufficientBalance { requested: i64, available: i64 },

    #[error("Withdrawal amount KES {requested} is below the minimum of KES {minimum}")]
    BelowMinimumWithdrawal { requested: i64, minimum: i64 },

    #[error("Payment gateway rejected the request: {0}")]
    GatewayRejected(String),

    #[error("Payment gateway unreachable: {0}")]
    GatewayUnreachable(String),

    #[error("Could not verify transaction {client_reference} after {attempts} attempts")]
    TransactionVerificationExhausted {
        client_reference: String,
        attempts: u32,
    },

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Already claimed: {0}")]
    AlreadyClaimed(String),

    #[error("Phone number already registered")]
    PhoneAlreadyRegistered,

    #[error("Email already registered")]
    EmailAlreadyRegistered,

    #[error("Password is required")]
    PasswordRequired,

    #[error("Invalid phone number or password")]
    InvalidCredentials,

    #[error("Missing or invalid session token")]
    Unauthorized,

    #[error("Could not allocate a unique referral code")]
    ReferralCodeUnavailable,

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task {task_id} is unavailable for another {remaining_secs}s")]
    TaskUnavailable { task_id: String, remaining_secs: i64 },

    #[error("A payment is still being verified: {0}")]
    PaymentPending(String),

    #[error("No active session for user {0}")]
    SessionNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Stored state could not be decoded: {0}")]
    StateDecode(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Password hashing error: {0}")]
    PasswordHash(#[from] bcrypt::BcryptError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TaskPayError>;
