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

//! Payment gateway port.
//!
//! Each provider implements [`PaymentGateway`]; the coordinator only ever sees
//! the normalized [`NormalizedCallback`] produced by `parse_callback`.
//!
//! Implementations:
//! - [`RedirectGateway`](crate::RedirectGateway) - hosted checkout, signed query-string return
//! - [`WalletGateway`](crate::WalletGateway) - server-to-server token exchange, signed JSON webhook

use crate::base::{BuyerRef, OrderId};
use crate::error::CheckoutError;
use crate::order::{Order, OrderStatus};
use crate::signing::payload_hash;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Redirect,
    Wallet,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Redirect => "redirect",
            Self::Wallet => "wallet",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = CheckoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "redirect" => Ok(Self::Redirect),
            "wallet" => Ok(Self::Wallet),
            other => Err(CheckoutError::Validation(format!(
                "unknown payment provider: {other}"
            ))),
        }
    }
}

/// Normalized payment result reported by a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentOutcome {
    Succeeded,
    Declined,
    Error,
    /// The provider has not reached a final state yet
    Pending,
}

impl PaymentOutcome {
    /// Order status this outcome resolves an awaiting order to, or `None`
    /// while the payment is still in flight.
    pub fn target_status(self) -> Option<OrderStatus> {
        match self {
            Self::Succeeded => Some(OrderStatus::Paid),
            Self::Declined | Self::Error => Some(OrderStatus::Failed),
            Self::Pending => None,
        }
    }
}

/// Outgoing request to open a payment session for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRequest {
    pub order_id: OrderId,
    pub buyer: BuyerRef,
    pub amount: Decimal,
    pub description: String,
}

impl SessionRequest {
    pub fn for_order(order: &Order) -> Self {
        Self {
            order_id: order.id(),
            buyer: order.buyer().clone(),
            amount: order.total(),
            description: format!("Payment for order {}", order.id()),
        }
    }

    /// Hash of the canonical JSON encoding, recorded on the payment attempt.
    pub fn payload_hash(&self) -> String {
        // Serializing plain fields cannot fail
        let body = serde_json::to_vec(self).unwrap_or_default();
        payload_hash(&body)
    }
}

/// What the buyer needs to continue at the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSessionHandle {
    pub order_id: OrderId,
    pub provider: ProviderKind,
    /// Provider-side session or checkout id
    pub session_ref: String,
    /// Where to send the buyer
    pub redirect_url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Unverified inbound gateway message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCallback {
    pub provider: ProviderKind,
    /// Raw payload exactly as received (query string or JSON body)
    pub payload: String,
    pub signature: String,
}

impl GatewayCallback {
    pub fn payload_hash(&self) -> String {
        payload_hash(self.payload.as_bytes())
    }
}

/// Provider-independent view of a verified callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedCallback {
    pub order_id: OrderId,
    pub outcome: PaymentOutcome,
    pub external_tx_id: Option<String>,
    pub payload_hash: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Opens a payment session at the provider.
    ///
    /// Network failures are reported as [`CheckoutError::GatewayUnavailable`];
    /// the coordinator bounds this call with its own timeout.
    async fn start_session(
        &self,
        request: &SessionRequest,
    ) -> Result<PaymentSessionHandle, CheckoutError>;

    /// Returns `true` if the callback was signed with this gateway's secret.
    fn verify_signature(&self, callback: &GatewayCallback) -> bool;

    /// Extracts the normalized result from a verified callback.
    fn parse_callback(&self, callback: &GatewayCallback)
    -> Result<NormalizedCallback, CheckoutError>;
}
