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

//! In-memory order store.
//!
//! Orders live behind one lock each, so mutations of the same order serialize
//! while different orders proceed in parallel. Inventory is always touched
//! while the order lock is held, never the other way round, which keeps the
//! lock order fixed at order then product.

use crate::base::{BuyerRef, OrderId, ReservationToken};
use crate::catalog::Catalog;
use crate::config::LockPolicy;
use crate::error::CheckoutError;
use crate::inventory::{InventoryLedger, Reservation};
use crate::order::{ItemRequest, LineItem, Order, OrderStatus, PaymentAttempt, TransitionEvidence};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Order repository with per-order serialization.
///
/// # Invariants
///
/// - An order is visible only after all of its reservations were opened.
/// - Every stored order has exactly one reservation per line item.
/// - Reservation state follows order status: `Paid` commits, `Failed` and
///   `Cancelled` release.
pub struct OrderStore {
    orders: DashMap<OrderId, Arc<Mutex<Order>>>,
    ledger: Arc<InventoryLedger>,
    catalog: Arc<dyn Catalog>,
    locks: LockPolicy,
}

impl OrderStore {
    pub fn new(ledger: Arc<InventoryLedger>, catalog: Arc<dyn Catalog>, locks: LockPolicy) -> Self {
        Self {
            orders: DashMap::new(),
            ledger,
            catalog,
            locks,
        }
    }

    pub fn ledger(&self) -> &Arc<InventoryLedger> {
        &self.ledger
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Prices the items from the catalog, reserves stock for each line and
    /// stores the order in `Created`.
    ///
    /// Either every reservation is opened and the order is stored, or any
    /// reservation already taken is released and nothing is stored.
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::Validation`] - Empty item list or a non-positive quantity.
    /// - [`CheckoutError::ProductNotFound`] - An item references an unknown product.
    /// - [`CheckoutError::InsufficientStock`] - A reservation could not be satisfied.
    /// - [`CheckoutError::ConcurrencyConflict`] - A product lock stayed contended.
    pub fn create_order(
        &self,
        buyer: BuyerRef,
        items: &[ItemRequest],
    ) -> Result<Order, CheckoutError> {
        let lines = self.price_items(items)?;

        let mut tokens = Vec::with_capacity(lines.len());
        for line in &lines {
            match self.ledger.reserve(line.product_id, line.quantity) {
                Ok(token) => tokens.push(token),
                Err(err) => {
                    self.release_all(&tokens);
                    return Err(err);
                }
            }
        }

        let order = Order::new(buyer, lines, tokens);
        order.assert_invariants();
        tracing::info!(
            order_id = %order.id(),
            buyer = %order.buyer(),
            total = %order.total(),
            "order created"
        );
        self.orders
            .insert(order.id(), Arc::new(Mutex::new(order.clone())));
        Ok(order)
    }

    /// Moves an order along one edge of the state machine.
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::OrderNotFound`] - Unknown order id.
    /// - [`CheckoutError::InvalidTransition`] - Edge not allowed from the current status.
    /// - [`CheckoutError::Validation`] - Evidence does not fit the target status.
    /// - [`CheckoutError::ConcurrencyConflict`] - Order or product lock stayed contended.
    pub fn transition(
        &self,
        order_id: OrderId,
        target: OrderStatus,
        evidence: TransitionEvidence,
    ) -> Result<Order, CheckoutError> {
        self.with_order(order_id, |order, ledger| {
            apply_transition(order, ledger, target, evidence)?;
            Ok(order.clone())
        })
    }

    pub fn get(&self, order_id: OrderId) -> Result<Order, CheckoutError> {
        self.with_order(order_id, |order, _| Ok(order.clone()))
    }

    /// Appends an audit record. Attempts are never modified afterwards.
    pub fn append_attempt(
        &self,
        order_id: OrderId,
        attempt: PaymentAttempt,
    ) -> Result<(), CheckoutError> {
        self.with_order(order_id, |order, _| {
            order.record_attempt(attempt);
            Ok(())
        })
    }

    /// Snapshot of every order currently in `status`, oldest first.
    ///
    /// Orders whose lock is contended are skipped; the caller sees them on a
    /// later pass.
    pub fn orders_with_status(&self, status: OrderStatus) -> Vec<Order> {
        let entries: Vec<_> = self
            .orders
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut orders: Vec<Order> = entries
            .iter()
            .filter_map(|entry| entry.try_lock_for(self.locks.timeout))
            .filter(|order| order.status() == status)
            .map(|order| order.clone())
            .collect();
        orders.sort_by_key(Order::created_at);
        orders
    }

    /// Current reservation records backing an order, in line item order.
    pub fn reservations(&self, order_id: OrderId) -> Result<Vec<Reservation>, CheckoutError> {
        let tokens = self.with_order(order_id, |order, _| Ok(order.reservations().to_vec()))?;
        Ok(tokens
            .into_iter()
            .filter_map(|token| self.ledger.reservation(token))
            .collect())
    }

    /// Runs `f` with exclusive access to one order.
    ///
    /// The order lock is held for the duration of `f`, which may reach into the
    /// inventory ledger but must not block on anything else.
    pub(crate) fn with_order<T>(
        &self,
        order_id: OrderId,
        f: impl FnOnce(&mut Order, &InventoryLedger) -> Result<T, CheckoutError>,
    ) -> Result<T, CheckoutError> {
        let entry = self.entry(order_id)?;
        let mut order = self.lock_order(order_id, &entry)?;
        let result = f(&mut order, &self.ledger);
        order.assert_invariants();
        result
    }

    fn entry(&self, order_id: OrderId) -> Result<Arc<Mutex<Order>>, CheckoutError> {
        self.orders
            .get(&order_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(CheckoutError::OrderNotFound(order_id))
    }

    fn lock_order<'a>(
        &self,
        order_id: OrderId,
        entry: &'a Mutex<Order>,
    ) -> Result<MutexGuard<'a, Order>, CheckoutError> {
        self.locks
            .acquire(entry)
            .ok_or_else(|| CheckoutError::ConcurrencyConflict(format!("order {order_id}")))
    }

    fn price_items(&self, items: &[ItemRequest]) -> Result<Vec<LineItem>, CheckoutError> {
        if items.is_empty() {
            return Err(CheckoutError::Validation(
                "order must contain at least one item".into(),
            ));
        }

        items
            .iter()
            .map(|item| {
                let quantity = u32::try_from(item.quantity)
                    .ok()
                    .filter(|quantity| *quantity > 0)
                    .ok_or_else(|| {
                        CheckoutError::Validation(format!(
                            "quantity for product {} must be between 1 and {}, got {}",
                            item.product_id,
                            u32::MAX,
                            item.quantity
                        ))
                    })?;
                let product = self
                    .catalog
                    .product(item.product_id)
                    .ok_or(CheckoutError::ProductNotFound(item.product_id))?;
                Ok(LineItem {
                    product_id: product.id,
                    quantity,
                    unit_price: product.price,
                })
            })
            .collect()
    }

    fn release_all(&self, tokens: &[ReservationToken]) {
        for token in tokens {
            if let Err(e) = self.ledger.release(*token) {
                tracing::error!(token = %token, error = %e, "failed to roll back reservation");
            }
        }
    }
}

/// Applies one state machine edge to a locked order.
///
/// Inventory is settled before the status flips, and settlement covers all of
/// the order's reservations or none of them. A failure here leaves the order
/// and its stock untouched, so the call can be retried.
pub(crate) fn apply_transition(
    order: &mut Order,
    ledger: &InventoryLedger,
    target: OrderStatus,
    evidence: TransitionEvidence,
) -> Result<(), CheckoutError> {
    let from = order.status();
    if !from.can_transition_to(target) {
        tracing::warn!(order_id = %order.id(), %from, to = %target, "invalid transition rejected");
        return Err(CheckoutError::InvalidTransition { from, to: target });
    }
    if !evidence.supports(target) {
        return Err(CheckoutError::Validation(format!(
            "{evidence:?} cannot move an order to {target}"
        )));
    }

    match target {
        OrderStatus::Paid => ledger.commit_all(order.reservations())?,
        OrderStatus::Failed | OrderStatus::Cancelled => ledger.release_all(order.reservations())?,
        _ => {}
    }

    match evidence {
        TransitionEvidence::PaymentStarted { provider } => order.provider = Some(provider),
        TransitionEvidence::PaymentResolved {
            external_tx_id: Some(tx_id),
        } => order.external_tx_id = Some(tx_id),
        _ => {}
    }
    order.status = target;
    order.updated_at = Utc::now();

    tracing::info!(order_id = %order.id(), %from, to = %target, "order transitioned");
    Ok(())
}
