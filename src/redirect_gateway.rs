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

//! Hosted-checkout gateway.
//!
//! The buyer is redirected to the provider with a signed query string and
//! comes back (and the provider notifies us) with another signed query string.
//! Both directions sign the form-urlencoded, key-sorted parameters with
//! HMAC-SHA512; the signature travels as `secure_hash`.

use crate::base::OrderId;
use crate::error::CheckoutError;
use crate::gateway::{
    GatewayCallback, NormalizedCallback, PaymentGateway, PaymentOutcome, PaymentSessionHandle,
    ProviderKind, SessionRequest,
};
use crate::signing::{hmac_sha512_hex, payload_hash, verify_hmac_sha512_hex};
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

const PROTOCOL_VERSION: &str = "2.1.0";
const HASH_PARAM: &str = "secure_hash";
const HASH_TYPE_PARAM: &str = "secure_hash_type";
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Provider response codes.
const CODE_SUCCESS: &str = "00";
const CODE_ABANDONED: &str = "24";
const CODE_SYSTEM_ERROR: &str = "99";

#[derive(Clone)]
pub struct RedirectGatewayConfig {
    pub merchant_code: String,
    pub hash_secret: String,
    pub payment_url: String,
    pub return_url: String,
    pub currency: String,
    pub locale: String,
    pub session_ttl: Duration,
}

impl RedirectGatewayConfig {
    pub fn test() -> Self {
        Self {
            merchant_code: "TESTSHOP".to_string(),
            hash_secret: "redirect-test-secret".to_string(),
            ..Default::default()
        }
    }
}

impl Default for RedirectGatewayConfig {
    fn default() -> Self {
        Self {
            merchant_code: String::new(),
            hash_secret: String::new(),
            payment_url: "https://sandbox.pay.example/checkout".to_string(),
            return_url: "http://localhost:8080/payments/redirect/return".to_string(),
            currency: "VND".to_string(),
            locale: "vn".to_string(),
            session_ttl: Duration::from_secs(15 * 60),
        }
    }
}

// Keeps the hash secret out of logs.
impl fmt::Debug for RedirectGatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedirectGatewayConfig")
            .field("merchant_code", &self.merchant_code)
            .field("hash_secret", &"<redacted>")
            .field("payment_url", &self.payment_url)
            .field("return_url", &self.return_url)
            .field("currency", &self.currency)
            .field("locale", &self.locale)
            .field("session_ttl", &self.session_ttl)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RedirectGateway {
    config: RedirectGatewayConfig,
}

impl RedirectGateway {
    pub fn new(config: RedirectGatewayConfig) -> Self {
        Self { config }
    }

    /// Builds a callback from the raw query string the provider sent back.
    pub fn callback_from_query(query: &str) -> GatewayCallback {
        let query = query.trim_start_matches('?');
        let signature = url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == HASH_PARAM)
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default();

        GatewayCallback {
            provider: ProviderKind::Redirect,
            payload: query.to_string(),
            signature,
        }
    }

    /// Encodes `params` in canonical order and appends their signature.
    pub fn signed_query<'a>(&self, params: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
        let params: BTreeMap<&str, &str> = params.into_iter().collect();
        let query = canonical_query(params.iter().map(|(k, v)| (*k, *v)));
        let signature = hmac_sha512_hex(&self.config.hash_secret, query.as_bytes());
        format!("{query}&{HASH_PARAM}={signature}")
    }

    fn amount_in_minor_units(amount: Decimal) -> Result<u64, CheckoutError> {
        (amount * Decimal::ONE_HUNDRED)
            .round()
            .to_u64()
            .ok_or_else(|| CheckoutError::Validation(format!("amount {amount} out of range")))
    }

    fn outcome_for(code: &str) -> PaymentOutcome {
        match code {
            CODE_SUCCESS => PaymentOutcome::Succeeded,
            CODE_SYSTEM_ERROR => PaymentOutcome::Error,
            CODE_ABANDONED => PaymentOutcome::Declined,
            _ => PaymentOutcome::Declined,
        }
    }
}

/// Sorted, form-urlencoded `key=value` pairs joined by `&`.
fn canonical_query<'a>(params: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish()
}

/// Callback parameters without the signature fields, sorted by key.
fn signed_params(payload: &str) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(payload.as_bytes())
        .filter(|(key, _)| key != HASH_PARAM && key != HASH_TYPE_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

/// The exact bytes the provider signs. Encoding, parameter order and the
/// signature fields do not change it, so it also identifies a callback for
/// replay detection.
fn canonical_signed_query(payload: &str) -> String {
    let params = signed_params(payload);
    canonical_query(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
}

#[async_trait]
impl PaymentGateway for RedirectGateway {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Redirect
    }

    async fn start_session(
        &self,
        request: &SessionRequest,
    ) -> Result<PaymentSessionHandle, CheckoutError> {
        let created = Utc::now();
        let ttl = TimeDelta::from_std(self.config.session_ttl).unwrap_or(TimeDelta::minutes(15));
        let expires = created + ttl;

        let amount = Self::amount_in_minor_units(request.amount)?.to_string();
        let order_ref = request.order_id.to_string();
        let created_at = created.format(TIMESTAMP_FORMAT).to_string();
        let expires_at = expires.format(TIMESTAMP_FORMAT).to_string();

        let query = self.signed_query([
            ("version", PROTOCOL_VERSION),
            ("command", "pay"),
            ("merchant", self.config.merchant_code.as_str()),
            ("amount", amount.as_str()),
            ("currency", self.config.currency.as_str()),
            ("txn_ref", order_ref.as_str()),
            ("order_info", request.description.as_str()),
            ("order_type", "other"),
            ("locale", self.config.locale.as_str()),
            ("return_url", self.config.return_url.as_str()),
            ("created_at", created_at.as_str()),
            ("expires_at", expires_at.as_str()),
        ]);

        tracing::debug!(order_id = %request.order_id, "built hosted checkout url");

        Ok(PaymentSessionHandle {
            order_id: request.order_id,
            provider: ProviderKind::Redirect,
            session_ref: order_ref,
            redirect_url: format!("{}?{}", self.config.payment_url, query),
            expires_at: Some(expires),
        })
    }

    fn verify_signature(&self, callback: &GatewayCallback) -> bool {
        if callback.signature.is_empty() {
            return false;
        }
        let query = canonical_signed_query(&callback.payload);
        verify_hmac_sha512_hex(&self.config.hash_secret, query.as_bytes(), &callback.signature)
    }

    fn parse_callback(
        &self,
        callback: &GatewayCallback,
    ) -> Result<NormalizedCallback, CheckoutError> {
        let params = signed_params(&callback.payload);
        let field = |name: &str| {
            params
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| CheckoutError::Validation(format!("callback missing {name}")))
        };

        let order_id: OrderId = field("txn_ref")?
            .parse()
            .map_err(|_| CheckoutError::Validation("callback txn_ref is not an order id".into()))?;
        let outcome = Self::outcome_for(field("response_code")?);
        let external_tx_id = params
            .get("transaction_no")
            .filter(|no| !no.is_empty() && no.as_str() != "0")
            .cloned();

        Ok(NormalizedCallback {
            order_id,
            outcome,
            external_tx_id,
            payload_hash: payload_hash(canonical_signed_query(&callback.payload).as_bytes()),
        })
    }
}
