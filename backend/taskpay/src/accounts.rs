//! Registration, profile, welcome bonus and referral codes.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::Policy;
use crate::db;
use crate::errors::{Result, TaskPayError};
use crate::models::{Amount, User, UserPatch};
use crate::phone;

pub const WELCOME_BONUS_SOURCE: &str = "Digital Pay Jobs KE";

const HASH_COST: u32 = if cfg!(test) { 4 } else { 10 };

const REFERRAL_CODE_ATTEMPTS: usize = 5;

#[derive(Clone, Deserialize)]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub password: String,
}

/// The user as shown in the app: local phone format, no internals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub balance: Amount,
    pub is_active: bool,
    pub has_claimed_welcome_bonus: bool,
    pub referral_code: Option<String>,
}

impl From<User> for Profile {
    fn from(user: User) -> Self {
        Profile {
            phone: phone::to_display(&user.phone),
            id: user.id,
            name: user.name,
            email: user.email,
            balance: user.balance,
            is_active: user.is_active,
            has_claimed_welcome_bonus: user.has_claimed_welcome_bonus,
            referral_code: user.referral_code,
        }
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

async fn hash_password(password: String) -> Result<String> {
    Ok(tokio::task::spawn_blocking(move || bcrypt::hash(password, HASH_COST)).await??)
}

async fn verify_password(password: String, hash: String) -> Result<bool> {
    Ok(tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await??)
}

/// Create an inactive account with a zero balance. Phone and email must both
/// be unused; the password is stored as a bcrypt hash.
pub async fn register(pool: &SqlitePool, registration: Registration, now: i64) -> Result<User> {
    let phone = phone::to_canonical(&registration.phone)?;
    let email = normalize_email(&registration.email);
    if registration.password.trim().is_empty() {
        return Err(TaskPayError::PasswordRequired);
    }
    if db::find_user_by_phone(pool, phone.as_str()).await?.is_some() {
        return Err(TaskPayError::PhoneAlreadyRegistered);
    }
    if db::find_user_by_email(pool, &email).await?.is_some() {
        return Err(TaskPayError::EmailAlreadyRegistered);
    }

    let password_hash = hash_password(registration.password).await?;
    let user = User {
        id: uuid::Uuid::new_v4().to_string(),
        name: registration.name.trim().to_string(),
        email,
        phone: phone.into_inner(),
        balance: Amount::ZERO,
        is_active: false,
        has_claimed_welcome_bonus: false,
        referral_code: None,
        created_at: now,
    };

    // Two registrations racing past the lookups meet the UNIQUE constraints.
    match db::create_user(pool, &user, &password_hash).await {
        Err(TaskPayError::Database(sqlx::Error::Database(e))) if e.is_unique_violation() => {
            return Err(if e.message().contains("users.email") {
                TaskPayError::EmailAlreadyRegistered
            } else {
                TaskPayError::PhoneAlreadyRegistered
            });
        }
        other => other?,
    }

    info!(user_id = %user.id, "User registered");
    Ok(user)
}

/// Check a phone number and password pair. Unknown numbers and wrong
/// passwords fail the same way.
pub async fn authenticate(pool: &SqlitePool, phone: &str, password: &str) -> Result<User> {
    let phone = phone::to_canonical(phone)?;
    let Some(user) = db::find_user_by_phone(pool, phone.as_str()).await? else {
        return Err(TaskPayError::InvalidCredentials);
    };

    let hash = db::password_hash(pool, &user.id).await?;
    if !verify_password(password.to_string(), hash).await? {
        warn!(user_id = %user.id, "Login rejected: wrong password");
        return Err(TaskPayError::InvalidCredentials);
    }
    Ok(user)
}

pub async fn profile(pool: &SqlitePool, user_id: &str) -> Result<Profile> {
    Ok(db::get_user(pool, user_id).await?.into())
}

/// Apply a partial profile edit. A new phone number is canonicalized, and
/// neither it nor a new email may belong to another account.
pub async fn update_profile(
    pool: &SqlitePool,
    user_id: &str,
    mut patch: UserPatch,
) -> Result<User> {
    if let Some(raw) = patch.phone.take() {
        let phone = phone::to_canonical(&raw)?;
        if let Some(owner) = db::find_user_by_phone(pool, phone.as_str()).await? {
            if owner.id != user_id {
                return Err(TaskPayError::PhoneAlreadyRegistered);
            }
        }
        patch.phone = Some(phone.into_inner());
    }
    if let Some(raw) = patch.email.take() {
        let email = normalize_email(&raw);
        if let Some(owner) = db::find_user_by_email(pool, &email).await? {
            if owner.id != user_id {
                return Err(TaskPayError::EmailAlreadyRegistered);
            }
        }
        patch.email = Some(email);
    }
    db::update_user(pool, user_id, &patch).await
}

/// Credit the one-time welcome bonus and record it in the ledger.
pub async fn claim_welcome_bonus(
    pool: &SqlitePool,
    policy: &Policy,
    user_id: &str,
    now: i64,
) -> Result<User> {
    let user = db::get_user(pool, user_id).await?;
    if !user.is_active {
        return Err(TaskPayError::AccountInactive);
    }

    let mut tx = pool.begin().await?;
    if !db::mark_bonus_claimed(&mut *tx, user_id).await? {
        return Err(TaskPayError::AlreadyClaimed("welcome bonus".to_string()));
    }
    db::credit_balance(&mut *tx, user_id, policy.welcome_bonus).await?;
    db::insert_bonus(
        &mut *tx,
        user_id,
        policy.welcome_bonus,
        WELCOME_BONUS_SOURCE,
        now,
    )
    .await?;
    let user = db::get_user(&mut *tx, user_id).await?;
    tx.commit().await?;

    info!(user_id, amount = %policy.welcome_bonus, "Welcome bonus claimed");
    Ok(user)
}

/// The user's referral code, generating and storing one on first request.
pub async fn referral_code(pool: &SqlitePool, user_id: &str) -> Result<String> {
    let candidates = std::iter::repeat_with(|| hex::encode_upper(rand::random::<[u8; 4]>()));
    assign_referral_code(pool, user_id, candidates.take(REFERRAL_CODE_ATTEMPTS)).await
}

/// Store the first candidate no other user holds.
async fn assign_referral_code<I>(pool: &SqlitePool, user_id: &str, candidates: I) -> Result<String>
where
    I: IntoIterator<Item = String>,
    I::IntoIter: Send,
{
    if let Some(code) = db::get_user(pool, user_id).await?.referral_code {
        return Ok(code);
    }

    for candidate in candidates {
        match db::set_referral_code(pool, user_id, &candidate).await {
            Err(TaskPayError::Database(sqlx::Error::Database(e))) if e.is_unique_violation() => {
                warn!(user_id, "Referral code already taken, drawing another");
            }
            other => return other,
        }
    }
    Err(TaskPayError::ReferralCodeUnavailable)
}
