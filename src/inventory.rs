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

//! Inventory ledger.
//!
//! Tracks available, reserved and committed stock per product. All operations
//! on one product serialize on that product's lock.
//!
//! # Example
//!
//! ```
//! use checkout_core::{InventoryLedger, ProductId};
//!
//! let ledger = InventoryLedger::default();
//! ledger.restock(ProductId(1), 5).unwrap();
//!
//! let token = ledger.reserve(ProductId(1), 2).unwrap();
//! assert_eq!(ledger.stock(ProductId(1)).unwrap().available, 3);
//!
//! ledger.commit(token).unwrap();
//! assert_eq!(ledger.stock(ProductId(1)).unwrap().committed, 2);
//! ```

use crate::base::{ProductId, ReservationToken};
use crate::config::LockPolicy;
use crate::error::CheckoutError;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

//  Reserved ──commit──► Committed
//     │
//     └──release──► Released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationState {
    Reserved,
    Committed,
    Released,
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub token: ReservationToken,
    pub product_id: ProductId,
    pub quantity: u32,
    pub state: ReservationState,
}

/// Point-in-time view of one product's stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StockSnapshot {
    pub available: u32,
    pub reserved: u32,
    pub committed: u32,
}

#[derive(Debug, Default)]
pub(crate) struct StockLevel {
    available: u32,
    reserved: u32,
    committed: u32,
}

impl StockLevel {
    fn snapshot(&self) -> StockSnapshot {
        StockSnapshot {
            available: self.available,
            reserved: self.reserved,
            committed: self.committed,
        }
    }

    fn reserve(&mut self, product_id: ProductId, quantity: u32) -> Result<(), CheckoutError> {
        if self.available < quantity {
            return Err(CheckoutError::InsufficientStock {
                product_id,
                requested: quantity,
                available: self.available,
            });
        }
        self.available -= quantity;
        self.reserved += quantity;
        Ok(())
    }

    /// Moves reserved stock to committed (permanent decrement).
    fn commit(&mut self, quantity: u32) {
        debug_assert!(
            self.reserved >= quantity,
            "Invariant violated: committing more than reserved"
        );
        self.reserved -= quantity;
        self.committed += quantity;
    }

    /// Returns reserved stock to available.
    fn release(&mut self, quantity: u32) {
        debug_assert!(
            self.reserved >= quantity,
            "Invariant violated: releasing more than reserved"
        );
        self.reserved -= quantity;
        self.available += quantity;
    }
}

/// Per-product stock ledger with reservation tracking.
#[derive(Debug)]
pub struct InventoryLedger {
    stock: DashMap<ProductId, Arc<Mutex<StockLevel>>>,
    reservations: DashMap<ReservationToken, Reservation>,
    next_token: AtomicU64,
    locks: LockPolicy,
}

impl InventoryLedger {
    pub fn new(locks: LockPolicy) -> Self {
        Self {
            stock: DashMap::new(),
            reservations: DashMap::new(),
            next_token: AtomicU64::new(1),
            locks,
        }
    }

    /// Adds `quantity` units to a product's available stock, creating it if needed.
    pub fn restock(&self, product_id: ProductId, quantity: u32) -> Result<(), CheckoutError> {
        let level = Arc::clone(self.stock.entry(product_id).or_default().value());
        let mut level = self.lock_stock(product_id, &level)?;
        level.available = level.available.checked_add(quantity).ok_or_else(|| {
            CheckoutError::Validation(format!("stock overflow for product {product_id}"))
        })?;
        Ok(())
    }

    pub fn stock(&self, product_id: ProductId) -> Option<StockSnapshot> {
        let level = self.stock_entry(product_id).ok()?;
        let snapshot = level.lock().snapshot();
        Some(snapshot)
    }

    pub fn reservation(&self, token: ReservationToken) -> Option<Reservation> {
        self.reservations.get(&token).map(|r| r.value().clone())
    }

    /// Holds `quantity` units of `product_id`.
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::Validation`] - Quantity is zero.
    /// - [`CheckoutError::ProductNotFound`] - Product has no stock record.
    /// - [`CheckoutError::InsufficientStock`] - Available stock is below `quantity`.
    /// - [`CheckoutError::ConcurrencyConflict`] - Product lock not acquired within the bound.
    pub fn reserve(
        &self,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<ReservationToken, CheckoutError> {
        if quantity == 0 {
            return Err(CheckoutError::Validation(
                "reservation quantity must be positive".into(),
            ));
        }

        let level = self.stock_entry(product_id)?;
        let mut level = self.lock_stock(product_id, &level)?;
        level.reserve(product_id, quantity)?;

        let token = ReservationToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.reservations.insert(
            token,
            Reservation {
                token,
                product_id,
                quantity,
                state: ReservationState::Reserved,
            },
        );
        Ok(token)
    }

    /// Makes a reservation permanent. Committing twice is a no-op.
    pub fn commit(&self, token: ReservationToken) -> Result<(), CheckoutError> {
        self.settle(std::slice::from_ref(&token), ReservationState::Committed)
    }

    /// Returns a reservation to available stock. Releasing twice is a no-op.
    pub fn release(&self, token: ReservationToken) -> Result<(), CheckoutError> {
        self.settle(std::slice::from_ref(&token), ReservationState::Released)
    }

    /// Commits every reservation in `tokens`, or none of them.
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::ReservationNotFound`] - A token is unknown.
    /// - [`CheckoutError::ReservationSettled`] - A reservation was already released.
    /// - [`CheckoutError::ConcurrencyConflict`] - A product lock was not acquired within the bound.
    ///
    /// On error no reservation and no stock level has changed.
    pub fn commit_all(&self, tokens: &[ReservationToken]) -> Result<(), CheckoutError> {
        self.settle(tokens, ReservationState::Committed)
    }

    /// Releases every reservation in `tokens`, or none of them.
    pub fn release_all(&self, tokens: &[ReservationToken]) -> Result<(), CheckoutError> {
        self.settle(tokens, ReservationState::Released)
    }

    /// All-or-nothing settlement. Product locks are taken in `ProductId` order
    /// and every reservation is checked before any of them moves.
    fn settle(&self, tokens: &[ReservationToken], target: ReservationState) -> Result<(), CheckoutError> {
        // Product id and quantity never change after reserve, so reading them
        // before taking the product locks is safe.
        let mut planned = Vec::with_capacity(tokens.len());
        for &token in tokens {
            let (product_id, quantity) = self
                .reservations
                .get(&token)
                .map(|r| (r.product_id, r.quantity))
                .ok_or(CheckoutError::ReservationNotFound(token))?;
            planned.push((token, product_id, quantity));
        }

        let mut product_ids: Vec<ProductId> = planned.iter().map(|(_, id, _)| *id).collect();
        product_ids.sort_unstable();
        product_ids.dedup();

        let levels = product_ids
            .into_iter()
            .map(|id| self.stock_entry(id).map(|level| (id, level)))
            .collect::<Result<Vec<_>, _>>()?;
        let mut guards = HashMap::with_capacity(levels.len());
        for (product_id, level) in &levels {
            guards.insert(*product_id, self.lock_stock(*product_id, level)?);
        }

        for (token, _, _) in &planned {
            let current = self
                .reservations
                .get(token)
                .map(|r| r.state)
                .ok_or(CheckoutError::ReservationNotFound(*token))?;
            if current != target && current != ReservationState::Reserved {
                return Err(CheckoutError::ReservationSettled {
                    token: *token,
                    state: current,
                });
            }
        }

        for (token, product_id, quantity) in planned {
            let (Some(mut reservation), Some(level)) =
                (self.reservations.get_mut(&token), guards.get_mut(&product_id))
            else {
                continue;
            };
            if reservation.state == target {
                continue;
            }
            match target {
                ReservationState::Committed => level.commit(quantity),
                ReservationState::Released => level.release(quantity),
                ReservationState::Reserved => continue,
            }
            reservation.state = target;
        }
        Ok(())
    }

    pub(crate) fn stock_entry(
        &self,
        product_id: ProductId,
    ) -> Result<Arc<Mutex<StockLevel>>, CheckoutError> {
        // Clone the Arc out so the map shard is not held while waiting on the product lock.
        self.stock
            .get(&product_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(CheckoutError::ProductNotFound(product_id))
    }

    fn lock_stock<'a>(
        &self,
        product_id: ProductId,
        level: &'a Mutex<StockLevel>,
    ) -> Result<parking_lot::MutexGuard<'a, StockLevel>, CheckoutError> {
        self.locks
            .acquire(level)
            .ok_or_else(|| CheckoutError::ConcurrencyConflict(format!("product {product_id}")))
    }
}

impl Default for InventoryLedger {
    fn default() -> Self {
        Self::new(LockPolicy::default())
    }
}
