// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! JSON HTTP surface over the [`CheckoutCoordinator`].
//!
//! # Example requests
//!
//! ```bash
//! # Create an order
//! curl -X POST http://localhost:8080/orders \
//!   -H "x-buyer-id: alice" -H "Content-Type: application/json" \
//!   -d '{"items": [{"product_id": 1, "quantity": 2}]}'
//!
//! # Start payment
//! curl -X POST http://localhost:8080/orders/<id>/payment \
//!   -H "x-buyer-id: alice" -H "Content-Type: application/json" \
//!   -d '{"provider": "wallet"}'
//!
//! # Cancel
//! curl -X POST http://localhost:8080/orders/<id>/cancel -H "x-buyer-id: alice"
//! ```

use crate::base::OrderId;
use crate::coordinator::{BuyerContext, CheckoutCoordinator};
use crate::error::{CheckoutError, ErrorKind};
use crate::gateway::{GatewayCallback, PaymentSessionHandle, ProviderKind};
use crate::order::{ItemRequest, Order};
use crate::redirect_gateway::RedirectGateway;
use crate::wallet_gateway::WEBHOOK_SIGNATURE_HEADER;
use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, RawQuery, State},
    http::{HeaderMap, Request, StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::Span;

pub const BUYER_HEADER: &str = "x-buyer-id";
pub const SESSION_HEADER: &str = "x-session-id";

// === Request/Response DTOs ===

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub items: Vec<ItemRequest>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentRequest {
    pub provider: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// === Application State ===

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<CheckoutCoordinator>,
}

// === Error Handling ===

#[derive(Debug)]
pub enum AppError {
    Checkout(CheckoutError),
    MissingBuyer,
    /// A blocking task panicked or was cancelled
    Internal(String),
}

impl From<CheckoutError> for AppError {
    fn from(err: CheckoutError) -> Self {
        AppError::Checkout(err)
    }
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        let err = match self {
            AppError::MissingBuyer => return (StatusCode::UNAUTHORIZED, "MISSING_BUYER"),
            AppError::Internal(_) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR");
            }
            AppError::Checkout(err) => err,
        };

        let status = match err.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InsufficientStock => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::InvalidTransition | ErrorKind::ConcurrencyConflict => StatusCode::CONFLICT,
            ErrorKind::ForgedCallback => StatusCode::UNAUTHORIZED,
            ErrorKind::GatewayUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        let code = match err {
            CheckoutError::Validation(_) => "VALIDATION_FAILED",
            CheckoutError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            CheckoutError::ProductNotFound(_) => "PRODUCT_NOT_FOUND",
            CheckoutError::ReservationNotFound(_) => "RESERVATION_NOT_FOUND",
            CheckoutError::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            CheckoutError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CheckoutError::ReservationSettled { .. } => "RESERVATION_SETTLED",
            CheckoutError::ForgedCallback { .. } => "FORGED_CALLBACK",
            CheckoutError::ConcurrencyConflict(_) => "CONCURRENCY_CONFLICT",
            CheckoutError::GatewayUnavailable { .. } => "GATEWAY_UNAVAILABLE",
        };
        (status, code)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let error = match &self {
            AppError::Checkout(err) => err.to_string(),
            AppError::MissingBuyer => format!("missing {BUYER_HEADER} header"),
            AppError::Internal(detail) => {
                tracing::error!(%detail, "request failed internally");
                "internal error".to_string()
            }
        };

        (
            status,
            Json(ErrorResponse {
                error,
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

// === Request Tracing ===

/// Span for one request: method, path and the caller's session id.
///
/// Only the path is recorded. Callback queries carry signatures and
/// payment references that do not belong in logs.
#[derive(Clone, Debug)]
pub struct RequestSpan;

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        tracing::info_span!(
            "request",
            method = %request.method(),
            path = %request.uri().path(),
            session_id = header_value(request.headers(), SESSION_HEADER).unwrap_or("-"),
        )
    }
}

// === Extractors ===

impl<S> FromRequestParts<S> for BuyerContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let buyer = header_value(&parts.headers, BUYER_HEADER).ok_or(AppError::MissingBuyer)?;
        let mut ctx = BuyerContext::new(buyer);
        if let Some(session) = header_value(&parts.headers, SESSION_HEADER) {
            ctx = ctx.with_session(session);
        }
        Ok(ctx)
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn parse_order_id(raw: &str) -> Result<OrderId, CheckoutError> {
    raw.parse()
        .map_err(|_| CheckoutError::Validation(format!("malformed order id: {raw}")))
}

// === Handlers ===

/// POST /orders - Create an order for the calling buyer.
async fn create_order(
    State(state): State<AppState>,
    ctx: BuyerContext,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<Order>), AppError> {
    let order = state.coordinator.create_order(&ctx, &request.items)?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /orders/{id}
async fn get_order(
    State(state): State<AppState>,
    ctx: BuyerContext,
    Path(id): Path<String>,
) -> Result<Json<Order>, AppError> {
    let order = state.coordinator.order_for(&ctx, parse_order_id(&id)?)?;
    Ok(Json(order))
}

/// POST /orders/{id}/payment - Open a payment session.
async fn initiate_payment(
    State(state): State<AppState>,
    ctx: BuyerContext,
    Path(id): Path<String>,
    Json(request): Json<PaymentRequest>,
) -> Result<Json<PaymentSessionHandle>, AppError> {
    let order_id = parse_order_id(&id)?;
    let provider: ProviderKind = request.provider.parse()?;
    let handle = state
        .coordinator
        .initiate_payment(&ctx, order_id, provider)
        .await?;
    Ok(Json(handle))
}

/// POST /orders/{id}/cancel
async fn cancel_order(
    State(state): State<AppState>,
    ctx: BuyerContext,
    Path(id): Path<String>,
) -> Result<Json<Order>, AppError> {
    let order = state.coordinator.cancel(&ctx, parse_order_id(&id)?)?;
    Ok(Json(order))
}

/// POST /orders/{id}/fulfill - Merchant-side shipping; not buyer scoped.
async fn fulfill_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Order>, AppError> {
    let order = state.coordinator.fulfill(parse_order_id(&id)?)?;
    Ok(Json(order))
}

/// GET /payments/redirect/return - Signed return from the hosted checkout.
async fn redirect_return(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Result<Json<Order>, AppError> {
    let query = query.ok_or_else(|| CheckoutError::Validation("missing callback query".into()))?;
    let callback = RedirectGateway::callback_from_query(&query);
    let order = apply_callback(Arc::clone(&state.coordinator), callback).await?;
    Ok(Json(order))
}

/// POST /payments/wallet/webhook - Signed JSON notification from the wallet.
async fn wallet_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Order>, AppError> {
    let signature = header_value(&headers, WEBHOOK_SIGNATURE_HEADER)
        .unwrap_or_default()
        .to_string();
    let callback = GatewayCallback {
        provider: ProviderKind::Wallet,
        payload: body,
        signature,
    };
    let order = apply_callback(Arc::clone(&state.coordinator), callback).await?;
    Ok(Json(order))
}

/// Callback handling waits on order and product locks, bounded by the lock
/// policy, so it runs on the blocking pool instead of an async worker.
async fn apply_callback(
    coordinator: Arc<CheckoutCoordinator>,
    callback: GatewayCallback,
) -> Result<Order, AppError> {
    let span = Span::current();
    let order = tokio::task::spawn_blocking(move || {
        span.in_scope(|| coordinator.handle_callback(&callback))
    })
    .await
    .map_err(|err| AppError::Internal(format!("callback task failed: {err}")))??;
    Ok(order)
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut providers: Vec<_> = state.coordinator.providers().map(ProviderKind::as_str).collect();
    providers.sort_unstable();
    Json(json!({
        "status": "ok",
        "orders": state.coordinator.store().len(),
        "providers": providers,
    }))
}

// === Router ===

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/orders", post(create_order))
        .route("/orders/{id}", get(get_order))
        .route("/orders/{id}/payment", post(initiate_payment))
        .route("/orders/{id}/cancel", post(cancel_order))
        .route("/orders/{id}/fulfill", post(fulfill_order))
        .route("/payments/redirect/return", get(redirect_return))
        .route("/payments/wallet/webhook", post(wallet_webhook))
        .layer(TraceLayer::new_for_http().make_span_with(RequestSpan))
        .with_state(state)
}
