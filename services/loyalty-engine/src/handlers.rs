use crate::accounts::AccountService;
use crate::auth::{AuthenticatedUser, SessionKeys, SESSION_COOKIE};
use crate::errors::ApiError;
use crate::metrics::{self, ORDERS_SUBMITTED, SESSIONS_ISSUED, WITHDRAWALS};
use crate::models::{BalanceView, Credentials, OrderView, WithdrawRequest, WithdrawalView};
use actix_web::cookie::Cookie;
use actix_web::http::header;
use actix_web::{web, HttpResponse};
use loyalty_core::{Error as LedgerError, LoyaltyService, SubmitOutcome, UserId};
use serde_json::json;
use tracing::info;

/// Health check endpoint
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "loyalty-engine",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

fn session_response(keys: &SessionKeys, user_id: UserId, kind: &str) -> Result<HttpResponse, ApiError> {
    let token = keys.issue(user_id)?;
    SESSIONS_ISSUED.with_label_values(&[kind]).inc();

    let cookie = Cookie::build(SESSION_COOKIE, token.clone())
        .path("/")
        .http_only(true)
        .finish();

    Ok(HttpResponse::Ok()
        .cookie(cookie)
        .insert_header((header::AUTHORIZATION, format!("Bearer {}", token)))
        .finish())
}

/// Register a user and open a session
pub async fn register(
    accounts: web::Data<AccountService>,
    keys: web::Data<SessionKeys>,
    request: web::Json<Credentials>,
) -> Result<HttpResponse, ApiError> {
    let user = accounts.register(&request.login, &request.password).await?;
    session_response(&keys, user.id, "register")
}

/// Authenticate and open a session
pub async fn login(
    accounts: web::Data<AccountService>,
    keys: web::Data<SessionKeys>,
    request: web::Json<Credentials>,
) -> Result<HttpResponse, ApiError> {
    let user = accounts.authenticate(&request.login, &request.password).await?;
    info!("User {} logged in", user.id);
    session_response(&keys, user.id, "login")
}

fn submission_outcome(result: &Result<SubmitOutcome, LedgerError>) -> &'static str {
    match result {
        Ok(SubmitOutcome::Accepted(_)) => "accepted",
        Ok(SubmitOutcome::AlreadyUploaded) => "already_uploaded",
        Err(LedgerError::InvalidOrderNumber { .. }) => "invalid",
        Err(LedgerError::OrderOwnedByAnotherUser { .. }) | Err(LedgerError::DuplicateOrder { .. }) => "conflict",
        Err(_) => "error",
    }
}

/// Upload an order number (plain-text body)
pub async fn submit_order(
    service: web::Data<LoyaltyService>,
    user: AuthenticatedUser,
    body: String,
) -> Result<HttpResponse, ApiError> {
    let number = body.trim();
    if number.is_empty() {
        return Err(ApiError::BadRequest("order number is required".to_string()));
    }

    let result = service.submit_order(user.0, number).await;
    ORDERS_SUBMITTED
        .with_label_values(&[submission_outcome(&result)])
        .inc();

    match result? {
        SubmitOutcome::Accepted(_) => Ok(HttpResponse::Accepted().finish()),
        SubmitOutcome::AlreadyUploaded => Ok(HttpResponse::Ok().finish()),
    }
}

/// Orders of the caller, newest first
pub async fn list_orders(
    service: web::Data<LoyaltyService>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, ApiError> {
    let orders = service.list_orders(user.0).await?;
    if orders.is_empty() {
        return Ok(HttpResponse::NoContent().finish());
    }

    let views: Vec<OrderView> = orders.into_iter().map(OrderView::from).collect();
    Ok(HttpResponse::Ok().json(views))
}

/// Current balance of the caller
pub async fn get_balance(
    service: web::Data<LoyaltyService>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, ApiError> {
    let balance = service.balance(user.0).await?;
    Ok(HttpResponse::Ok().json(BalanceView::from(balance)))
}

fn withdrawal_outcome<T>(result: &Result<T, LedgerError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(LedgerError::InsufficientFunds { .. }) => "insufficient_funds",
        Err(LedgerError::OrderNumberReused { .. }) => "reused",
        Err(LedgerError::InvalidOrderNumber { .. }) | Err(LedgerError::InvalidAmount(_)) => "invalid",
        Err(_) => "error",
    }
}

/// Spend points against a new order number
pub async fn withdraw(
    service: web::Data<LoyaltyService>,
    user: AuthenticatedUser,
    request: web::Json<WithdrawRequest>,
) -> Result<HttpResponse, ApiError> {
    let request = request.into_inner();
    let result = service.withdraw(user.0, request.order.trim(), request.sum).await;
    WITHDRAWALS
        .with_label_values(&[withdrawal_outcome(&result)])
        .inc();

    result?;
    Ok(HttpResponse::Ok().finish())
}

/// Withdrawals of the caller, newest first
pub async fn list_withdrawals(
    service: web::Data<LoyaltyService>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, ApiError> {
    let withdrawals = service.list_withdrawals(user.0).await?;
    if withdrawals.is_empty() {
        return Ok(HttpResponse::NoContent().finish());
    }

    let views: Vec<WithdrawalView> = withdrawals.into_iter().map(WithdrawalView::from).collect();
    Ok(HttpResponse::Ok().json(views))
}

/// Prometheus metrics endpoint
pub async fn metrics_endpoint() -> HttpResponse {
    match metrics::metrics_handler() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => HttpResponse::InternalServerError().json(json!({
            "error": "Failed to gather metrics",
            "details": e.to_string()
        })),
    }
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .error_handler(|err, _req| ApiError::BadRequest(err.to_string()).into()),
    )
    .service(
        web::scope("/api/user")
            .route("/register", web::post().to(register))
            .route("/login", web::post().to(login))
            .route("/orders", web::post().to(submit_order))
            .route("/orders", web::get().to(list_orders))
            .route("/balance", web::get().to(get_balance))
            .route("/balance/withdraw", web::post().to(withdraw))
            .route("/withdrawals", web::get().to(list_withdrawals)),
    )
    .route("/metrics", web::get().to(metrics_endpoint))
    .route("/health", web::get().to(health_check));
}
