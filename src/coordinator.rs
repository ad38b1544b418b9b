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

//! Checkout coordinator.
//!
//! The [`CheckoutCoordinator`] drives orders through payment. It owns no order
//! state of its own; every decision is taken under the order lock in the
//! [`OrderStore`].
//!
//! # Operations
//!
//! - **Create**: price and reserve the buyer's items.
//! - **Initiate payment**: move to `AwaitingPayment` and open a gateway session.
//! - **Handle callback**: verify, deduplicate and apply a gateway result.
//! - **Cancel**: release stock for an unpaid order.
//! - **Fulfill**: ship a paid order.
//! - **Expire stale**: fail orders whose callback never came.
//!
//! # Thread Safety
//!
//! No lock is held across an await point or a gateway call. Callbacks racing
//! on one order serialize on its lock; the first one wins and later ones are
//! recorded as superseded.

use crate::base::{BuyerRef, OrderId};
use crate::config::CheckoutSettings;
use crate::error::CheckoutError;
use crate::gateway::{
    GatewayCallback, PaymentGateway, PaymentOutcome, PaymentSessionHandle, ProviderKind,
    SessionRequest,
};
use crate::notification::NotificationDispatcher;
use crate::order::{
    AttemptOutcome, ItemRequest, Order, OrderStatus, PaymentAttempt, TransitionEvidence,
};
use crate::store::{OrderStore, apply_transition};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Request-scoped identity of the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyerContext {
    pub buyer: BuyerRef,
    pub session_id: Option<String>,
}

impl BuyerContext {
    pub fn new(buyer: impl Into<String>) -> Self {
        Self {
            buyer: BuyerRef::new(buyer),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Session id for log correlation, `-` when the caller sent none.
    pub fn session(&self) -> &str {
        self.session_id.as_deref().unwrap_or("-")
    }

    /// Span tagging every log line of one buyer request.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("buyer", buyer = %self.buyer, session_id = self.session())
    }

    /// Orders of other buyers are reported as missing.
    fn ensure_owns(&self, order: &Order) -> Result<(), CheckoutError> {
        if order.buyer() == &self.buyer {
            Ok(())
        } else {
            Err(CheckoutError::OrderNotFound(order.id()))
        }
    }
}

pub struct CheckoutCoordinator {
    store: Arc<OrderStore>,
    gateways: HashMap<ProviderKind, Arc<dyn PaymentGateway>>,
    notifier: Arc<dyn NotificationDispatcher>,
    settings: CheckoutSettings,
}

impl CheckoutCoordinator {
    pub fn new(
        store: Arc<OrderStore>,
        notifier: Arc<dyn NotificationDispatcher>,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            store,
            gateways: HashMap::new(),
            notifier,
            settings,
        }
    }

    /// Registers a gateway, replacing any previous one for the same provider.
    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateways.insert(gateway.provider(), gateway);
        self
    }

    pub fn store(&self) -> &Arc<OrderStore> {
        &self.store
    }

    pub fn providers(&self) -> impl Iterator<Item = ProviderKind> + '_ {
        self.gateways.keys().copied()
    }

    pub fn create_order(
        &self,
        ctx: &BuyerContext,
        items: &[ItemRequest],
    ) -> Result<Order, CheckoutError> {
        ctx.span()
            .in_scope(|| self.store.create_order(ctx.buyer.clone(), items))
    }

    /// Unscoped lookup.
    pub fn get(&self, order_id: OrderId) -> Result<Order, CheckoutError> {
        self.store.get(order_id)
    }

    /// Lookup scoped to the calling buyer.
    pub fn order_for(&self, ctx: &BuyerContext, order_id: OrderId) -> Result<Order, CheckoutError> {
        let order = self.store.get(order_id)?;
        ctx.ensure_owns(&order)?;
        Ok(order)
    }

    /// Moves a `Created` order to `AwaitingPayment` and opens a session at `provider`.
    ///
    /// The gateway is called after the order lock is released, bounded by the
    /// configured timeout and retried up to the configured attempt count.
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::Validation`] - Provider is not configured.
    /// - [`CheckoutError::OrderNotFound`] - Unknown order or owned by another buyer.
    /// - [`CheckoutError::InvalidTransition`] - Order is not `Created`.
    /// - [`CheckoutError::GatewayUnavailable`] - Every attempt timed out or failed.
    ///   The order stays `AwaitingPayment` for the reconciliation sweep.
    pub async fn initiate_payment(
        &self,
        ctx: &BuyerContext,
        order_id: OrderId,
        provider: ProviderKind,
    ) -> Result<PaymentSessionHandle, CheckoutError> {
        let gateway = self.gateway(provider)?;

        let request = self.store.with_order(order_id, |order, ledger| {
            ctx.ensure_owns(order)?;
            apply_transition(
                order,
                ledger,
                OrderStatus::AwaitingPayment,
                TransitionEvidence::PaymentStarted { provider },
            )?;
            Ok(SessionRequest::for_order(order))
        })?;
        let request_hash = request.payload_hash();

        match self.open_session(gateway.as_ref(), &request).await {
            Ok(handle) => {
                self.store.append_attempt(
                    order_id,
                    PaymentAttempt::session(provider, request_hash, AttemptOutcome::SessionOpened),
                )?;
                tracing::info!(
                    %order_id,
                    %provider,
                    session_id = ctx.session(),
                    session_ref = %handle.session_ref,
                    "payment session opened"
                );
                Ok(handle)
            }
            Err(err) => {
                self.store.append_attempt(
                    order_id,
                    PaymentAttempt::session(
                        provider,
                        request_hash,
                        AttemptOutcome::GatewayUnavailable,
                    ),
                )?;
                tracing::warn!(%order_id, %provider, session_id = ctx.session(), error = %err, "payment session failed");
                Err(err)
            }
        }
    }

    /// Applies a gateway callback.
    ///
    /// Signatures are checked before the order is looked up. A replayed
    /// payload returns the order unchanged, and a callback for an order that
    /// was already resolved is recorded as superseded without changing status.
    /// A pending outcome is recorded and the order keeps waiting.
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::Validation`] - Provider not configured, malformed payload,
    ///   or the order is paying through another provider.
    /// - [`CheckoutError::ForgedCallback`] - Signature did not verify.
    /// - [`CheckoutError::OrderNotFound`] - Payload names an unknown order.
    /// - [`CheckoutError::InvalidTransition`] - Order is `Created` or `Cancelled`.
    pub fn handle_callback(&self, callback: &GatewayCallback) -> Result<Order, CheckoutError> {
        let provider = callback.provider;
        let gateway = self.gateway(provider)?;

        if !gateway.verify_signature(callback) {
            tracing::error!(%provider, "forged callback rejected");
            return Err(CheckoutError::ForgedCallback { provider });
        }
        let parsed = gateway.parse_callback(callback)?;

        let (order, resolved) = self.store.with_order(parsed.order_id, |order, ledger| {
            if order.has_callback(provider, &parsed.payload_hash) {
                tracing::debug!(order_id = %order.id(), %provider, "replayed callback ignored");
                return Ok((order.clone(), false));
            }

            match order.status() {
                OrderStatus::AwaitingPayment => {
                    if order.provider().is_some_and(|p| p != provider) {
                        tracing::warn!(
                            order_id = %order.id(),
                            %provider,
                            expected = ?order.provider(),
                            "callback from unexpected provider"
                        );
                        return Err(CheckoutError::Validation(format!(
                            "order {} is not paying through {provider}",
                            order.id()
                        )));
                    }
                    let Some(target) = parsed.outcome.target_status() else {
                        tracing::info!(order_id = %order.id(), %provider, "payment still pending at provider");
                        order.record_attempt(PaymentAttempt::callback(
                            provider,
                            parsed.payload_hash.clone(),
                            parsed.external_tx_id.clone(),
                            AttemptOutcome::Pending,
                        ));
                        return Ok((order.clone(), false));
                    };
                    apply_transition(
                        order,
                        ledger,
                        target,
                        TransitionEvidence::PaymentResolved {
                            external_tx_id: parsed.external_tx_id.clone(),
                        },
                    )?;
                    order.record_attempt(PaymentAttempt::callback(
                        provider,
                        parsed.payload_hash.clone(),
                        parsed.external_tx_id.clone(),
                        parsed.outcome.into(),
                    ));
                    Ok((order.clone(), true))
                }
                OrderStatus::Paid | OrderStatus::Failed | OrderStatus::Fulfilled => {
                    tracing::warn!(
                        order_id = %order.id(),
                        %provider,
                        status = %order.status(),
                        outcome = ?parsed.outcome,
                        external_tx_id = ?parsed.external_tx_id,
                        "callback for resolved order needs reconciliation"
                    );
                    order.record_attempt(PaymentAttempt::callback(
                        provider,
                        parsed.payload_hash.clone(),
                        parsed.external_tx_id.clone(),
                        AttemptOutcome::Superseded,
                    ));
                    Ok((order.clone(), false))
                }
                from @ (OrderStatus::Created | OrderStatus::Cancelled) => {
                    let to = parsed
                        .outcome
                        .target_status()
                        .unwrap_or(OrderStatus::AwaitingPayment);
                    tracing::warn!(order_id = %order.id(), %from, %to, "callback for order not awaiting payment");
                    Err(CheckoutError::InvalidTransition { from, to })
                }
            }
        })?;

        if resolved {
            self.notify(&order, parsed.outcome);
        }
        Ok(order)
    }

    /// Cancels an unpaid order and releases its stock.
    pub fn cancel(&self, ctx: &BuyerContext, order_id: OrderId) -> Result<Order, CheckoutError> {
        let _span = ctx.span().entered();
        self.store.with_order(order_id, |order, ledger| {
            ctx.ensure_owns(order)?;
            apply_transition(
                order,
                ledger,
                OrderStatus::Cancelled,
                TransitionEvidence::BuyerCancelled,
            )?;
            Ok(order.clone())
        })
    }

    /// Marks a paid order as shipped.
    pub fn fulfill(&self, order_id: OrderId) -> Result<Order, CheckoutError> {
        self.store
            .transition(order_id, OrderStatus::Fulfilled, TransitionEvidence::Shipped)
    }

    /// Fails every `AwaitingPayment` order idle for longer than the configured
    /// staleness window, releasing its stock. Returns the ids that expired.
    ///
    /// Errors on individual orders are logged and retried on the next sweep.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Vec<OrderId> {
        let Some(cutoff) = TimeDelta::from_std(self.settings.stale_after)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
        else {
            return Vec::new();
        };

        let mut expired = Vec::new();
        for candidate in self.store.orders_with_status(OrderStatus::AwaitingPayment) {
            if candidate.updated_at() > cutoff {
                continue;
            }

            let result = self.store.with_order(candidate.id(), |order, ledger| {
                // Re-check under the lock; a callback may have landed meanwhile.
                if order.status() != OrderStatus::AwaitingPayment || order.updated_at() > cutoff {
                    return Ok(None);
                }
                apply_transition(order, ledger, OrderStatus::Failed, TransitionEvidence::Expired)?;
                if let Some(provider) = order.provider() {
                    order.record_attempt(PaymentAttempt {
                        provider,
                        request_hash: None,
                        callback_hash: None,
                        external_tx_id: None,
                        outcome: AttemptOutcome::Expired,
                        recorded_at: now,
                    });
                }
                Ok(Some(order.clone()))
            });

            match result {
                Ok(Some(order)) => {
                    tracing::info!(order_id = %order.id(), "stale payment expired");
                    self.notify(&order, PaymentOutcome::Error);
                    expired.push(order.id());
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(order_id = %candidate.id(), error = %e, "failed to expire stale order");
                }
            }
        }
        expired
    }

    fn gateway(&self, provider: ProviderKind) -> Result<&Arc<dyn PaymentGateway>, CheckoutError> {
        self.gateways.get(&provider).ok_or_else(|| {
            CheckoutError::Validation(format!("payment provider {provider} is not configured"))
        })
    }

    async fn open_session(
        &self,
        gateway: &dyn PaymentGateway,
        request: &SessionRequest,
    ) -> Result<PaymentSessionHandle, CheckoutError> {
        let provider = gateway.provider();
        let max_attempts = self.settings.gateway_max_attempts.max(1);
        let timeout = self.settings.gateway_timeout;

        let mut last_error = None;
        for attempt in 1..=max_attempts {
            let err = match tokio::time::timeout(timeout, gateway.start_session(request)).await {
                Ok(Ok(handle)) => return Ok(handle),
                Ok(Err(err @ CheckoutError::GatewayUnavailable { .. })) => err,
                Ok(Err(err)) => return Err(err),
                Err(_) => CheckoutError::GatewayUnavailable {
                    provider,
                    reason: format!("no response within {} ms", timeout.as_millis()),
                },
            };
            tracing::debug!(%provider, attempt, max_attempts, error = %err, "gateway attempt failed");
            last_error = Some(err);
        }

        Err(last_error.unwrap_or_else(|| CheckoutError::GatewayUnavailable {
            provider,
            reason: "no attempts made".into(),
        }))
    }

    fn notify(&self, order: &Order, outcome: PaymentOutcome) {
        if let Err(e) = self.notifier.dispatch(order, outcome) {
            tracing::warn!(order_id = %order.id(), error = %e, "notification dispatch failed");
        }
    }
}
