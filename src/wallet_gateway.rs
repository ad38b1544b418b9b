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

//! Wallet gateway.
//!
//! Sessions are opened server-to-server: exchange the client credentials for
//! an access token, then create a checkout order whose approval link the buyer
//! follows. The outcome arrives as a JSON webhook signed with
//! `sha256=<hex HMAC-SHA256(body)>`.

use crate::base::OrderId;
use crate::error::CheckoutError;
use crate::gateway::{
    GatewayCallback, NormalizedCallback, PaymentGateway, PaymentOutcome, PaymentSessionHandle,
    ProviderKind, SessionRequest,
};
use crate::signing::{hmac_sha256_hex, verify_hmac_sha256_hex};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Header carrying the webhook signature.
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-wallet-signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletMode {
    Sandbox,
    Live,
}

impl WalletMode {
    pub fn api_base(self) -> &'static str {
        match self {
            Self::Sandbox => "https://api-m.sandbox.paypal.com",
            Self::Live => "https://api-m.paypal.com",
        }
    }
}

impl FromStr for WalletMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sandbox" => Ok(Self::Sandbox),
            "live" | "production" => Ok(Self::Live),
            other => Err(format!("unknown wallet mode: {other}")),
        }
    }
}

#[derive(Clone)]
pub struct WalletGatewayConfig {
    pub client_id: String,
    pub client_secret: String,
    pub webhook_secret: String,
    pub mode: WalletMode,
    pub api_base: String,
    pub return_url: String,
    pub cancel_url: String,
    pub currency: String,
}

impl WalletGatewayConfig {
    pub fn test() -> Self {
        Self {
            client_id: "test-client".to_string(),
            client_secret: "test-client-secret".to_string(),
            webhook_secret: "wallet-webhook-secret".to_string(),
            ..Default::default()
        }
    }
}

impl Default for WalletGatewayConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            webhook_secret: String::new(),
            mode: WalletMode::Sandbox,
            api_base: WalletMode::Sandbox.api_base().to_string(),
            return_url: "http://localhost:8080/checkout/wallet/return".to_string(),
            cancel_url: "http://localhost:8080/checkout/wallet/cancel".to_string(),
            currency: "USD".to_string(),
        }
    }
}

impl fmt::Debug for WalletGatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletGatewayConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("webhook_secret", &"<redacted>")
            .field("mode", &self.mode)
            .field("api_base", &self.api_base)
            .field("return_url", &self.return_url)
            .field("cancel_url", &self.cancel_url)
            .field("currency", &self.currency)
            .finish()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletApiError {
    #[error("wallet api request failed: {0}")]
    Transport(String),

    #[error("wallet api returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("wallet api response missing {0}")]
    MissingField(&'static str),
}

impl From<reqwest::Error> for WalletApiError {
    fn from(err: reqwest::Error) -> Self {
        WalletApiError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletCheckoutRequest {
    pub order_id: OrderId,
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub return_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletCheckout {
    pub id: String,
    pub approval_url: String,
}

/// Outbound wallet API calls.
///
/// Implementations:
/// - [`HttpWalletApi`] - OAuth client-credentials + checkout order creation over HTTPS
#[async_trait]
pub trait WalletApi: Send + Sync {
    async fn create_checkout(
        &self,
        request: &WalletCheckoutRequest,
    ) -> Result<WalletCheckout, WalletApiError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct CheckoutResponse {
    id: String,
    #[serde(default)]
    links: Vec<CheckoutLink>,
}

#[derive(Debug, Deserialize)]
struct CheckoutLink {
    href: String,
    rel: String,
}

#[derive(Debug, Clone)]
pub struct HttpWalletApi {
    client: reqwest::Client,
    api_base: String,
    client_id: String,
    client_secret: String,
}

impl HttpWalletApi {
    pub fn new(config: &WalletGatewayConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: &WalletGatewayConfig) -> Self {
        Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        }
    }

    async fn access_token(&self) -> Result<String, WalletApiError> {
        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.api_base))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        let token: TokenResponse = Self::ok_json(response).await?;
        Ok(token.access_token)
    }

    async fn ok_json<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, WalletApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WalletApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl WalletApi for HttpWalletApi {
    async fn create_checkout(
        &self,
        request: &WalletCheckoutRequest,
    ) -> Result<WalletCheckout, WalletApiError> {
        let token = self.access_token().await?;

        let body = serde_json::json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.order_id.to_string(),
                "description": request.description,
                "amount": {
                    "currency_code": request.currency,
                    "value": format!("{:.2}", request.amount),
                },
            }],
            "application_context": {
                "return_url": request.return_url,
                "cancel_url": request.cancel_url,
            },
        });

        let response = self
            .client
            .post(format!("{}/v2/checkout/orders", self.api_base))
            .bearer_auth(token)
            .header("PayPal-Request-Id", request.order_id.to_string())
            .json(&body)
            .send()
            .await?;
        let checkout: CheckoutResponse = Self::ok_json(response).await?;

        let approval_url = checkout
            .links
            .into_iter()
            .find(|link| link.rel == "approve" || link.rel == "payer-action")
            .map(|link| link.href)
            .ok_or(WalletApiError::MissingField("approval link"))?;

        Ok(WalletCheckout {
            id: checkout.id,
            approval_url,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WalletWebhook {
    resource: WebhookResource,
}

#[derive(Debug, Deserialize)]
struct WebhookResource {
    id: String,
    reference_id: String,
    status: String,
    #[serde(default)]
    capture_id: Option<String>,
}

pub struct WalletGateway {
    config: WalletGatewayConfig,
    api: Arc<dyn WalletApi>,
}

impl WalletGateway {
    pub fn new(config: WalletGatewayConfig, api: Arc<dyn WalletApi>) -> Self {
        Self { config, api }
    }

    /// Header value for `body` signed with `secret`.
    pub fn sign_webhook(secret: &str, body: &str) -> String {
        format!("sha256={}", hmac_sha256_hex(secret, body.as_bytes()))
    }

    fn outcome_for(status: &str) -> PaymentOutcome {
        match status.to_ascii_uppercase().as_str() {
            "COMPLETED" => PaymentOutcome::Succeeded,
            "DECLINED" | "DENIED" | "VOIDED" => PaymentOutcome::Declined,
            // Checkout and capture states that still move on to a final one.
            "CREATED" | "SAVED" | "APPROVED" | "PENDING" | "PAYER_ACTION_REQUIRED" => {
                PaymentOutcome::Pending
            }
            _ => PaymentOutcome::Error,
        }
    }
}

impl fmt::Debug for WalletGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletGateway")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PaymentGateway for WalletGateway {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Wallet
    }

    async fn start_session(
        &self,
        request: &SessionRequest,
    ) -> Result<PaymentSessionHandle, CheckoutError> {
        let checkout_request = WalletCheckoutRequest {
            order_id: request.order_id,
            amount: request.amount,
            currency: self.config.currency.clone(),
            description: request.description.clone(),
            return_url: self.config.return_url.clone(),
            cancel_url: self.config.cancel_url.clone(),
        };

        let checkout = self
            .api
            .create_checkout(&checkout_request)
            .await
            .map_err(|err| CheckoutError::GatewayUnavailable {
                provider: ProviderKind::Wallet,
                reason: err.to_string(),
            })?;

        tracing::debug!(order_id = %request.order_id, checkout_id = %checkout.id, "wallet checkout created");

        Ok(PaymentSessionHandle {
            order_id: request.order_id,
            provider: ProviderKind::Wallet,
            session_ref: checkout.id,
            redirect_url: checkout.approval_url,
            expires_at: None,
        })
    }

    fn verify_signature(&self, callback: &GatewayCallback) -> bool {
        let provided = callback
            .signature
            .strip_prefix("sha256=")
            .unwrap_or(&callback.signature);
        if provided.is_empty() {
            return false;
        }
        verify_hmac_sha256_hex(
            &self.config.webhook_secret,
            callback.payload.as_bytes(),
            provided,
        )
    }

    fn parse_callback(
        &self,
        callback: &GatewayCallback,
    ) -> Result<NormalizedCallback, CheckoutError> {
        let webhook: WalletWebhook = serde_json::from_str(&callback.payload)
            .map_err(|err| CheckoutError::Validation(format!("malformed wallet webhook: {err}")))?;
        let resource = webhook.resource;

        let order_id: OrderId = resource.reference_id.parse().map_err(|_| {
            CheckoutError::Validation("wallet webhook reference_id is not an order id".into())
        })?;

        Ok(NormalizedCallback {
            order_id,
            outcome: Self::outcome_for(&resource.status),
            external_tx_id: resource.capture_id.or(Some(resource.id)),
            payload_hash: callback.payload_hash(),
        })
    }
}
