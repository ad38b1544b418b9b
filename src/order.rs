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

//! Order aggregate, line items, payment attempts and the order state machine.
//!
//! ```text
//!  Created ──initiate──► AwaitingPayment ──success──► Paid ──ship──► Fulfilled
//!     │                       │
//!     │                       ├──declined/error/expired──► Failed
//!     │                       │
//!     └───────cancel──────────┴──cancel──► Cancelled
//! ```
//!
//! `Fulfilled`, `Failed` and `Cancelled` are terminal.

use crate::base::{BuyerRef, OrderId, ProductId, ReservationToken};
use crate::gateway::{PaymentOutcome, ProviderKind};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Created,
    AwaitingPayment,
    Paid,
    Failed,
    Cancelled,
    Fulfilled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 6] = [
        Self::Created,
        Self::AwaitingPayment,
        Self::Paid,
        Self::Failed,
        Self::Cancelled,
        Self::Fulfilled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Fulfilled | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` if `self -> target` is an edge of the state machine.
    pub fn can_transition_to(self, target: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, target),
            (Created, AwaitingPayment)
                | (AwaitingPayment, Paid)
                | (AwaitingPayment, Failed)
                | (Paid, Fulfilled)
                | (Created, Cancelled)
                | (AwaitingPayment, Cancelled)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A priced order line. The unit price is the catalog price at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price: Decimal,
}

impl LineItem {
    pub fn subtotal(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Buyer-supplied line request, validated by the store.
///
/// Quantity is signed so that zero and negative input can be rejected
/// explicitly instead of failing deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRequest {
    pub product_id: ProductId,
    pub quantity: i64,
}

impl ItemRequest {
    pub fn new(product_id: ProductId, quantity: i64) -> Self {
        Self {
            product_id,
            quantity,
        }
    }
}

/// Outcome recorded on a [`PaymentAttempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    /// Gateway session opened; buyer sent to the provider
    SessionOpened,
    /// Gateway timed out or failed while opening a session
    GatewayUnavailable,
    Succeeded,
    Declined,
    Errored,
    /// Provider reported an intermediate state; the order keeps waiting
    Pending,
    /// Callback arrived after the order was already resolved
    Superseded,
    /// Reconciliation sweep gave up waiting for a callback
    Expired,
}

impl From<PaymentOutcome> for AttemptOutcome {
    fn from(outcome: PaymentOutcome) -> Self {
        match outcome {
            PaymentOutcome::Succeeded => Self::Succeeded,
            PaymentOutcome::Declined => Self::Declined,
            PaymentOutcome::Error => Self::Errored,
            PaymentOutcome::Pending => Self::Pending,
        }
    }
}

/// Append-only audit record of one gateway interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub provider: ProviderKind,
    pub request_hash: Option<String>,
    pub callback_hash: Option<String>,
    pub external_tx_id: Option<String>,
    pub outcome: AttemptOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl PaymentAttempt {
    pub fn session(provider: ProviderKind, request_hash: String, outcome: AttemptOutcome) -> Self {
        Self {
            provider,
            request_hash: Some(request_hash),
            callback_hash: None,
            external_tx_id: None,
            outcome,
            recorded_at: Utc::now(),
        }
    }

    pub fn callback(
        provider: ProviderKind,
        callback_hash: String,
        external_tx_id: Option<String>,
        outcome: AttemptOutcome,
    ) -> Self {
        Self {
            provider,
            request_hash: None,
            callback_hash: Some(callback_hash),
            external_tx_id,
            outcome,
            recorded_at: Utc::now(),
        }
    }
}

/// Supporting facts for a status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionEvidence {
    PaymentStarted { provider: ProviderKind },
    PaymentResolved { external_tx_id: Option<String> },
    BuyerCancelled,
    Expired,
    Shipped,
}

impl TransitionEvidence {
    /// Whether this evidence can justify moving into `target`.
    pub fn supports(&self, target: OrderStatus) -> bool {
        use OrderStatus::*;
        match self {
            Self::PaymentStarted { .. } => target == AwaitingPayment,
            Self::PaymentResolved { .. } => matches!(target, Paid | Failed),
            Self::BuyerCancelled => target == Cancelled,
            Self::Expired => target == Failed,
            Self::Shipped => target == Fulfilled,
        }
    }
}

/// Order aggregate root.
///
/// Owns its line items and payment attempts. Reservations are referenced by
/// token; their state lives in the inventory ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub(crate) id: OrderId,
    pub(crate) buyer: BuyerRef,
    pub(crate) items: Vec<LineItem>,
    pub(crate) total: Decimal,
    pub(crate) status: OrderStatus,
    pub(crate) provider: Option<ProviderKind>,
    pub(crate) external_tx_id: Option<String>,
    pub(crate) reservations: Vec<ReservationToken>,
    pub(crate) attempts: Vec<PaymentAttempt>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl Order {
    pub(crate) fn new(
        buyer: BuyerRef,
        items: Vec<LineItem>,
        reservations: Vec<ReservationToken>,
    ) -> Self {
        let total = items.iter().map(LineItem::subtotal).sum();
        let now = Utc::now();
        Self {
            id: OrderId::new(),
            buyer,
            items,
            total,
            status: OrderStatus::Created,
            provider: None,
            external_tx_id: None,
            reservations,
            attempts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> OrderId {
        self.id
    }

    pub fn buyer(&self) -> &BuyerRef {
        &self.buyer
    }

    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    pub fn total(&self) -> Decimal {
        self.total
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn provider(&self) -> Option<ProviderKind> {
        self.provider
    }

    pub fn external_tx_id(&self) -> Option<&str> {
        self.external_tx_id.as_deref()
    }

    pub fn reservations(&self) -> &[ReservationToken] {
        &self.reservations
    }

    pub fn attempts(&self) -> &[PaymentAttempt] {
        &self.attempts
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns `true` if a callback with this payload hash was already recorded.
    pub fn has_callback(&self, provider: ProviderKind, callback_hash: &str) -> bool {
        self.attempts.iter().any(|attempt| {
            attempt.provider == provider && attempt.callback_hash.as_deref() == Some(callback_hash)
        })
    }

    pub(crate) fn record_attempt(&mut self, attempt: PaymentAttempt) {
        self.attempts.push(attempt);
        self.updated_at = Utc::now();
    }

    pub(crate) fn assert_invariants(&self) {
        debug_assert_eq!(
            self.total,
            self.items.iter().map(LineItem::subtotal).sum::<Decimal>(),
            "Invariant violated: order total drifted from its line items"
        );
        debug_assert!(
            self.items.iter().all(|item| item.quantity > 0),
            "Invariant violated: zero quantity line item"
        );
        debug_assert_eq!(
            self.items.len(),
            self.reservations.len(),
            "Invariant violated: every line item owns exactly one reservation"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_order() -> Order {
        Order::new(
            BuyerRef::new("buyer-1"),
            vec![
                LineItem {
                    product_id: ProductId(1),
                    quantity: 2,
                    unit_price: dec!(10.50),
                },
                LineItem {
                    product_id: ProductId(2),
                    quantity: 1,
                    unit_price: dec!(3.25),
                },
            ],
            vec![ReservationToken(1), ReservationToken(2)],
        )
    }

    #[test]
    fn new_order_totals_line_items() {
        let order = sample_order();
        assert_eq!(order.total(), dec!(24.25));
        assert_eq!(order.status(), OrderStatus::Created);
        assert!(order.attempts().is_empty());
        order.assert_invariants();
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in OrderStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in OrderStatus::ALL {
                assert!(
                    !from.can_transition_to(to),
                    "{from} must not transition to {to}"
                );
            }
        }
    }

    #[test]
    fn allowed_edges() {
        use OrderStatus::*;
        assert!(Created.can_transition_to(AwaitingPayment));
        assert!(Created.can_transition_to(Cancelled));
        assert!(AwaitingPayment.can_transition_to(Paid));
        assert!(AwaitingPayment.can_transition_to(Failed));
        assert!(AwaitingPayment.can_transition_to(Cancelled));
        assert!(Paid.can_transition_to(Fulfilled));

        assert!(!Created.can_transition_to(Paid));
        assert!(!Paid.can_transition_to(Cancelled));
        assert!(!Paid.can_transition_to(Failed));
        assert!(!AwaitingPayment.can_transition_to(AwaitingPayment));
    }

    #[test]
    fn evidence_matches_targets() {
        assert!(
            TransitionEvidence::PaymentStarted {
                provider: ProviderKind::Redirect
            }
            .supports(OrderStatus::AwaitingPayment)
        );
        assert!(
            TransitionEvidence::PaymentResolved {
                external_tx_id: None
            }
            .supports(OrderStatus::Failed)
        );
        assert!(TransitionEvidence::Expired.supports(OrderStatus::Failed));
        assert!(!TransitionEvidence::Shipped.supports(OrderStatus::Paid));
        assert!(!TransitionEvidence::BuyerCancelled.supports(OrderStatus::Failed));
    }

    #[test]
    fn has_callback_is_scoped_to_provider() {
        let mut order = sample_order();
        order.record_attempt(PaymentAttempt::callback(
            ProviderKind::Wallet,
            "abc".into(),
            Some("tx-1".into()),
            AttemptOutcome::Succeeded,
        ));

        assert!(order.has_callback(ProviderKind::Wallet, "abc"));
        assert!(!order.has_callback(ProviderKind::Redirect, "abc"));
        assert!(!order.has_callback(ProviderKind::Wallet, "abd"));
    }

    #[test]
    fn order_serializes_amounts_as_strings() {
        let order = sample_order();
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["total"], "24.25");
        assert_eq!(json["status"], "Created");
        assert_eq!(json["items"][0]["unit_price"], "10.50");
    }
}
