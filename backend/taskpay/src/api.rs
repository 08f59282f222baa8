//! Axum REST API for the mobile client.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use serde::{Deserialize, Serialize};

use crate::accounts::{self, Profile, Registration};
use crate::db;
use crate::errors::TaskPayError;
use crate::gateway::PaymentGateway;
use crate::ledger::{self, History};
use crate::models::{Amount, Task, TaskPhase, Transaction, UserPatch};
use crate::session::{PaymentProgress, SessionManager};
use crate::timer::{Begun, Opened};

pub struct ApiState<G> {
    pub sessions: SessionManager<G>,
}

type SharedState<G> = Arc<ApiState<G>>;
type ApiResult<T> = Result<T, TaskPayError>;

pub fn router<G: PaymentGateway + 'static>(state: SharedState<G>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", get(list_tasks::<G>))
        .route("/users", post(register::<G>))
        .route(
            "/users/:user_id",
            get(get_profile::<G>).patch(update_profile::<G>),
        )
        .route("/sessions", post(login::<G>))
        .route("/sessions/:user_id", delete(logout::<G>))
        .route("/sessions/:user_id/payment", get(payment_progress::<G>))
        .route("/users/:user_id/tasks/:task_id", get(open_task::<G>))
        .route("/users/:user_id/tasks/:task_id/begin", post(begin_task::<G>))
        .route("/users/:user_id/tasks/:task_id/pause", post(pause_task::<G>))
        .route("/users/:user_id/activation", post(activate::<G>))
        .route("/users/:user_id/withdrawals", post(withdraw::<G>))
        .route("/transactions/:client_reference", get(get_transaction::<G>))
        .route("/users/:user_id/bonus", post(claim_bonus::<G>))
        .route("/users/:user_id/referral", get(referral::<G>))
        .route("/users/:user_id/history", get(history::<G>))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct TasksResponse {
    pub count: usize,
    pub tasks: Vec<Task>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub phone: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: Profile,
}

#[derive(Deserialize)]
pub struct ActivationRequest {
    pub phone: String,
}

#[derive(Deserialize)]
pub struct WithdrawalRequest {
    pub amount: i64,
    pub phone: String,
}

#[derive(Serialize)]
pub struct ReferralResponse {
    pub referral_code: String,
}

#[derive(Serialize)]
pub struct PaymentProgressResponse {
    pub payment: Option<PaymentProgress>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Serialize)]
pub struct ErrorDetails {
    pub code: &'static str,
    pub message: String,
}

// ─────────────────────────────────────────────────────────
// Error mapping
// ─────────────────────────────────────────────────────────

impl TaskPayError {
    pub fn error_code(&self) -> &'static str {
        match self {
            TaskPayError::InvalidPhoneFormat(_) => "INVALID_PHONE_FORMAT",
            TaskPayError::AccountInactive => "ACCOUNT_INACTIVE",
            TaskPayError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            TaskPayError::BelowMinimumWithdrawal { .. } => "BELOW_MINIMUM_WITHDRAWAL",
            TaskPayError::GatewayRejected(_) => "GATEWAY_REJECTED",
            TaskPayError::GatewayUnreachable(_) => "GATEWAY_UNREACHABLE",
            TaskPayError::TransactionVerificationExhausted { .. } => "VERIFICATION_EXHAUSTED",
            TaskPayError::UserNotFound(_) => "USER_NOT_FOUND",
            TaskPayError::AlreadyClaimed(_) => "ALREADY_CLAIMED",
            TaskPayError::PhoneAlreadyRegistered => "PHONE_ALREADY_REGISTERED",
            TaskPayError::EmailAlreadyRegistered => "EMAIL_ALREADY_REGISTERED",
            TaskPayError::PasswordRequired => "PASSWORD_REQUIRED",
            TaskPayError::InvalidCredentials => "INVALID_CREDENTIALS",
            TaskPayError::Unauthorized => "UNAUTHORIZED",
            TaskPayError::ReferralCodeUnavailable => "REFERRAL_CODE_UNAVAILABLE",
            TaskPayError::TaskNotFound(_) => "TASK_NOT_FOUND",
            TaskPayError::TaskUnavailable { .. } => "TASK_UNAVAILABLE",
            TaskPayError::PaymentPending(_) => "PAYMENT_PENDING",
            TaskPayError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            TaskPayError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            TaskPayError::StateDecode(_)
            | TaskPayError::Database(_)
            | TaskPayError::Migrate(_)
            | TaskPayError::Json(_)
            | TaskPayError::PasswordHash(_)
            | TaskPayError::Join(_)
            | TaskPayError::Config(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            TaskPayError::InvalidPhoneFormat(_)
            | TaskPayError::BelowMinimumWithdrawal { .. }
            | TaskPayError::PasswordRequired => StatusCode::BAD_REQUEST,
            TaskPayError::SessionNotFound(_)
            | TaskPayError::InvalidCredentials
            | TaskPayError::Unauthorized => StatusCode::UNAUTHORIZED,
            TaskPayError::AccountInactive => StatusCode::FORBIDDEN,
            TaskPayError::UserNotFound(_)
            | TaskPayError::TaskNotFound(_)
            | TaskPayError::TransactionNotFound(_) => StatusCode::NOT_FOUND,
            TaskPayError::AlreadyClaimed(_)
            | TaskPayError::PhoneAlreadyRegistered
            | TaskPayError::EmailAlreadyRegistered
            | TaskPayError::TaskUnavailable { .. }
            | TaskPayError::PaymentPending(_) => StatusCode::CONFLICT,
            TaskPayError::InsufficientBalance { .. } | TaskPayError::GatewayRejected(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            TaskPayError::GatewayUnreachable(_) => StatusCode::BAD_GATEWAY,
            TaskPayError::TransactionVerificationExhausted { .. } => StatusCode::GATEWAY_TIMEOUT,
            TaskPayError::ReferralCodeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            TaskPayError::StateDecode(_)
            | TaskPayError::Database(_)
            | TaskPayError::Migrate(_)
            | TaskPayError::Json(_)
            | TaskPayError::PasswordHash(_)
            | TaskPayError::Join(_)
            | TaskPayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TaskPayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        // Internal details stay in the log.
        let message = if code == "INTERNAL_ERROR" {
            tracing::error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(ErrorResponse {
                error: ErrorDetails { code, message },
            }),
        )
            .into_response()
    }
}

// ─────────────────────────────────────────────────────────
// Authentication
// ─────────────────────────────────────────────────────────

/// Bearer token from the `Authorization` header. Handlers check it against
/// the session of the user they act for.
pub struct SessionToken(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for SessionToken
where
    S: Send + Sync,
{
    type Rejection = TaskPayError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| TaskPayError::Unauthorized)?;
        Ok(SessionToken(bearer.token().to_string()))
    }
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /tasks`
pub async fn list_tasks<G: PaymentGateway + 'static>(
    State(state): State<SharedState<G>>,
) -> Json<TasksResponse> {
    let tasks = state.sessions.catalog().tasks().to_vec();
    Json(TasksResponse {
        count: tasks.len(),
        tasks,
    })
}

/// `POST /users`
pub async fn register<G: PaymentGateway + 'static>(
    State(state): State<SharedState<G>>,
    Json(registration): Json<Registration>,
) -> ApiResult<(StatusCode, Json<Profile>)> {
    let now = chrono::Utc::now().timestamp();
    let user = accounts::register(state.sessions.pool(), registration, now).await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

/// `GET /users/:user_id`
pub async fn get_profile<G: PaymentGateway + 'static>(
    State(state): State<SharedState<G>>,
    token: SessionToken,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Profile>> {
    state.sessions.authorize(&user_id, &token.0).await?;
    Ok(Json(accounts::profile(state.sessions.pool(), &user_id).await?))
}

/// `PATCH /users/:user_id`
pub async fn update_profile<G: PaymentGateway + 'static>(
    State(state): State<SharedState<G>>,
    token: SessionToken,
    Path(user_id): Path<String>,
    Json(patch): Json<UserPatch>,
) -> ApiResult<Json<Profile>> {
    state.sessions.authorize(&user_id, &token.0).await?;
    let user = accounts::update_profile(state.sessions.pool(), &user_id, patch).await?;
    state.sessions.refresh(&user_id).await?;
    Ok(Json(user.into()))
}

/// `POST /sessions`
pub async fn login<G: PaymentGateway + 'static>(
    State(state): State<SharedState<G>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let logged_in = state.sessions.login(&req.phone, &req.password).await?;
    Ok(Json(LoginResponse {
        token: logged_in.token,
        user: logged_in.user.into(),
    }))
}

/// `DELETE /sessions/:user_id`
pub async fn logout<G: PaymentGateway + 'static>(
    State(state): State<SharedState<G>>,
    token: SessionToken,
    Path(user_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.sessions.authorize(&user_id, &token.0).await?;
    state.sessions.logout(&user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /sessions/:user_id/payment`
pub async fn payment_progress<G: PaymentGateway + 'static>(
    State(state): State<SharedState<G>>,
    token: SessionToken,
    Path(user_id): Path<String>,
) -> ApiResult<Json<PaymentProgressResponse>> {
    state.sessions.authorize(&user_id, &token.0).await?;
    let payment = state.sessions.payment_progress(&user_id).await?;
    Ok(Json(PaymentProgressResponse { payment }))
}

/// `GET /users/:user_id/tasks/:task_id`
pub async fn open_task<G: PaymentGateway + 'static>(
    State(state): State<SharedState<G>>,
    token: SessionToken,
    Path((user_id, task_id)): Path<(String, String)>,
) -> ApiResult<Json<Opened>> {
    state.sessions.authorize(&user_id, &token.0).await?;
    Ok(Json(state.sessions.open_task(&user_id, &task_id).await?))
}

/// `POST /users/:user_id/tasks/:task_id/begin`
pub async fn begin_task<G: PaymentGateway + 'static>(
    State(state): State<SharedState<G>>,
    token: SessionToken,
    Path((user_id, task_id)): Path<(String, String)>,
) -> ApiResult<Json<Begun>> {
    state.sessions.authorize(&user_id, &token.0).await?;
    Ok(Json(state.sessions.begin_task(&user_id, &task_id).await?))
}

/// `POST /users/:user_id/tasks/:task_id/pause`
pub async fn pause_task<G: PaymentGateway + 'static>(
    State(state): State<SharedState<G>>,
    token: SessionToken,
    Path((user_id, task_id)): Path<(String, String)>,
) -> ApiResult<Json<TaskPhase>> {
    state.sessions.authorize(&user_id, &token.0).await?;
    Ok(Json(state.sessions.pause_task(&user_id, &task_id).await?))
}

/// `POST /users/:user_id/activation`
pub async fn activate<G: PaymentGateway + 'static>(
    State(state): State<SharedState<G>>,
    token: SessionToken,
    Path(user_id): Path<String>,
    Json(req): Json<ActivationRequest>,
) -> ApiResult<(StatusCode, Json<Transaction>)> {
    state.sessions.authorize(&user_id, &token.0).await?;
    let tx = state.sessions.activate(&user_id, &req.phone).await?;
    Ok((StatusCode::ACCEPTED, Json(tx)))
}

/// `POST /users/:user_id/withdrawals`
pub async fn withdraw<G: PaymentGateway + 'static>(
    State(state): State<SharedState<G>>,
    token: SessionToken,
    Path(user_id): Path<String>,
    Json(req): Json<WithdrawalRequest>,
) -> ApiResult<(StatusCode, Json<Transaction>)> {
    state.sessions.authorize(&user_id, &token.0).await?;
    let tx = state
        .sessions
        .withdraw(&user_id, Amount::kes(req.amount), &req.phone)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(tx)))
}

/// `GET /transactions/:client_reference`, visible to its owner only.
pub async fn get_transaction<G: PaymentGateway + 'static>(
    State(state): State<SharedState<G>>,
    token: SessionToken,
    Path(client_reference): Path<String>,
) -> ApiResult<Json<Transaction>> {
    let transaction = db::get_transaction(state.sessions.pool(), &client_reference).await?;
    state
        .sessions
        .authorize(&transaction.user_id, &token.0)
        .await?;
    Ok(Json(transaction))
}

/// `POST /users/:user_id/bonus`
pub async fn claim_bonus<G: PaymentGateway + 'static>(
    State(state): State<SharedState<G>>,
    token: SessionToken,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Profile>> {
    state.sessions.authorize(&user_id, &token.0).await?;
    let now = chrono::Utc::now().timestamp();
    let user = accounts::claim_welcome_bonus(
        state.sessions.pool(),
        state.sessions.policy(),
        &user_id,
        now,
    )
    .await?;
    state.sessions.refresh(&user_id).await?;
    Ok(Json(user.into()))
}

/// `GET /users/:user_id/referral`
pub async fn referral<G: PaymentGateway + 'static>(
    State(state): State<SharedState<G>>,
    token: SessionToken,
    Path(user_id): Path<String>,
) -> ApiResult<Json<ReferralResponse>> {
    state.sessions.authorize(&user_id, &token.0).await?;
    let referral_code = accounts::referral_code(state.sessions.pool(), &user_id).await?;
    state.sessions.refresh(&user_id).await?;
    Ok(Json(ReferralResponse { referral_code }))
}

/// `GET /users/:user_id/history`
pub async fn history<G: PaymentGateway + 'static>(
    State(state): State<SharedState<G>>,
    token: SessionToken,
    Path(user_id): Path<String>,
) -> ApiResult<Json<History>> {
    state.sessions.authorize(&user_id, &token.0).await?;
    Ok(Json(ledger::history(state.sessions.pool(), &user_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::Policy;
    use crate::models::TransactionStatus;
    use crate::testutil::{memory_pool, seed_user, Scripted, ScriptedGateway, TEST_PASSWORD};
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        phones: Vec<(String, String)>,
    }

    async fn app() -> TestApp {
        let pool = memory_pool().await;
        let active = seed_user(&pool, "active", Amount::kes(2000), true).await;
        let inactive = seed_user(&pool, "inactive", Amount::ZERO, false).await;
        let gateway = Arc::new(ScriptedGateway::with_statuses([Scripted::Status(
            TransactionStatus::Queued,
        )]));
        let sessions = SessionManager::new(pool, gateway, Policy::default(), Catalog::builtin());
        TestApp {
            router: router(Arc::new(ApiState { sessions })),
            phones: vec![
                (active.id, active.phone),
                (inactive.id, inactive.phone),
            ],
        }
    }

    async fn call(
        app: &TestApp,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    /// Log a seeded user in and return their bearer token.
    async fn login(app: &TestApp, user_id: &str) -> String {
        let (_, phone) = app.phones.iter().find(|(id, _)| id == user_id).unwrap();
        let (status, body) = call(
            app,
            Method::POST,
            "/sessions",
            None,
            Some(json!({ "phone": phone, "password": TEST_PASSWORD })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["id"], user_id);
        body["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app().await;
        let (status, body) = call(&app, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn lists_the_catalog() {
        let app = app().await;
        let (status, body) = call(&app, Method::GET, "/tasks", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 10);
        assert_eq!(body["tasks"][0]["id"], "task1");
    }

    #[tokio::test]
    async fn register_then_conflict_on_same_phone_or_email() {
        let app = app().await;
        let registration = json!({
            "name": "Otieno",
            "email": "otieno@example.com",
            "phone": "0722000111",
            "password": "otieno-pass",
        });

        let (status, body) =
            call(&app, Method::POST, "/users", None, Some(registration.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["phone"], "0722000111");
        assert_eq!(body["is_active"], false);
        assert!(body.get("password").is_none());
        assert!(body.get("password_hash").is_none());

        let (status, body) = call(&app, Method::POST, "/users", None, Some(registration)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "PHONE_ALREADY_REGISTERED");

        let same_email = json!({
            "name": "Otieno",
            "email": "otieno@example.com",
            "phone": "0722000222",
            "password": "otieno-pass",
        });
        let (status, body) = call(&app, Method::POST, "/users", None, Some(same_email)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "EMAIL_ALREADY_REGISTERED");
    }

    #[tokio::test]
    async fn registered_user_logs_in_with_password() {
        let app = app().await;
        let registration = json!({
            "name": "Akinyi",
            "email": "akinyi@example.com",
            "phone": "0733000111",
            "password": "akinyi-pass",
        });
        let (_, created) = call(&app, Method::POST, "/users", None, Some(registration)).await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/sessions",
            None,
            Some(json!({ "phone": "+254733000111", "password": "nope" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "INVALID_CREDENTIALS");

        let (status, body) = call(
            &app,
            Method::POST,
            "/sessions",
            None,
            Some(json!({ "phone": "0733000111", "password": "akinyi-pass" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["id"], created["id"]);

        let uri = format!("/users/{}", created["id"].as_str().unwrap());
        let token = body["token"].as_str().unwrap();
        let (status, profile) = call(&app, Method::GET, &uri, Some(token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(profile["email"], "akinyi@example.com");
    }

    #[tokio::test]
    async fn user_routes_reject_missing_or_foreign_tokens() {
        let app = app().await;
        let inactive = login(&app, "inactive").await;

        let (status, body) = call(&app, Method::GET, "/users/active", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");

        for (method, uri) in [
            (Method::GET, "/users/active"),
            (Method::POST, "/users/active/bonus"),
            (Method::GET, "/users/active/referral"),
            (Method::GET, "/users/active/history"),
            (Method::POST, "/users/active/tasks/task1/begin"),
            (Method::DELETE, "/sessions/active"),
        ] {
            let (status, _) = call(&app, method, uri, Some(inactive.as_str()), None).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
        }

        let (status, _) = call(
            &app,
            Method::POST,
            "/users/active/withdrawals",
            Some("not-a-token"),
            Some(json!({ "amount": 1500, "phone": "0712345678" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn withdrawal_needs_a_session_and_the_minimum() {
        let app = app().await;
        let uri = "/users/active/withdrawals";

        let (status, _) = call(
            &app,
            Method::POST,
            uri,
            None,
            Some(json!({ "amount": 1500, "phone": "0712345678" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let token = login(&app, "active").await;
        let token = Some(token.as_str());

        let (status, body) = call(
            &app,
            Method::POST,
            uri,
            token,
            Some(json!({ "amount": 1000, "phone": "0712345678" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "BELOW_MINIMUM_WITHDRAWAL");

        let (status, tx) = call(
            &app,
            Method::POST,
            uri,
            token,
            Some(json!({ "amount": 1800, "phone": "0712345678" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(tx["status"], "QUEUED");
        assert_eq!(tx["phone"], "254712345678");

        let reference = tx["client_reference"].as_str().unwrap();
        let tx_uri = format!("/transactions/{reference}");
        let (status, stored) = call(&app, Method::GET, &tx_uri, token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stored["amount"], 1800);

        let other = login(&app, "inactive").await;
        let (status, _) = call(&app, Method::GET, &tx_uri, Some(other.as_str()), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (_, profile) = call(&app, Method::GET, "/users/active", token, None).await;
        assert_eq!(profile["balance"], 200);

        let (status, body) = call(
            &app,
            Method::POST,
            uri,
            token,
            Some(json!({ "amount": 100, "phone": "0712345678" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "PAYMENT_PENDING");

        let (status, progress) =
            call(&app, Method::GET, "/sessions/active/payment", token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(progress["payment"]["state"], "polling");
    }

    #[tokio::test]
    async fn inactive_user_cannot_begin_a_task() {
        let app = app().await;
        let token = login(&app, "inactive").await;
        let token = Some(token.as_str());

        let (status, opened) =
            call(&app, Method::GET, "/users/inactive/tasks/task2", token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(opened["display"], "1:30");
        assert_eq!(opened["phase"]["phase"], "idle");

        let (status, body) = call(
            &app,
            Method::POST,
            "/users/inactive/tasks/task2/begin",
            token,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "ACCOUNT_INACTIVE");
    }

    #[tokio::test]
    async fn begin_then_pause_a_task() {
        let app = app().await;
        let token = login(&app, "active").await;
        let token = Some(token.as_str());

        let (status, begun) = call(
            &app,
            Method::POST,
            "/users/active/tasks/task1/begin",
            token,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(begun["phase"]["phase"], "running");

        let (status, paused) = call(
            &app,
            Method::POST,
            "/users/active/tasks/task1/pause",
            token,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(paused["phase"], "paused");

        let (status, _) = call(&app, Method::DELETE, "/sessions/active", token, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(&app, Method::GET, "/users/active", token, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bonus_referral_and_history() {
        let app = app().await;
        let token = login(&app, "active").await;
        let token = Some(token.as_str());

        let (status, profile) = call(&app, Method::POST, "/users/active/bonus", token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(profile["balance"], 2499);

        let (status, body) = call(&app, Method::POST, "/users/active/bonus", token, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "ALREADY_CLAIMED");

        let (_, first) = call(&app, Method::GET, "/users/active/referral", token, None).await;
        let (_, second) = call(&app, Method::GET, "/users/active/referral", token, None).await;
        assert_eq!(first["referral_code"], second["referral_code"]);

        let (status, history) =
            call(&app, Method::GET, "/users/active/history", token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history["bonuses"][0]["amount"], 499);
        assert_eq!(history["monthly"].as_array().unwrap().len(), 1);
    }
}
