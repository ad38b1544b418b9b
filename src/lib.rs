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

//! # Checkout Core
//!
//! This library provides the order and payment core of a storefront: it turns
//! a buyer's items into an order with reserved stock, drives the order through
//! an external payment gateway, and settles inventory from verified gateway
//! callbacks.
//!
//! ## Core Components
//!
//! - [`CheckoutCoordinator`]: Order state machine and payment orchestration
//! - [`OrderStore`]: Order repository with per-order serialization
//! - [`InventoryLedger`]: Per-product stock with reservation tracking
//! - [`PaymentGateway`]: Port implemented by [`RedirectGateway`] and [`WalletGateway`]
//! - [`NotificationDispatcher`]: Fire-and-forget payment notifications
//! - [`CheckoutError`]: Error types for checkout failures
//!
//! ## Example
//!
//! ```
//! use checkout_core::{
//!     BuyerContext, CheckoutCoordinator, CheckoutSettings, InMemoryCatalog, InventoryLedger,
//!     ItemRequest, OrderStatus, OrderStore, Product, ProductId, QueuedDispatcher,
//! };
//! use rust_decimal_macros::dec;
//! use std::sync::Arc;
//!
//! let catalog = InMemoryCatalog::new();
//! catalog.upsert(Product { id: ProductId(1), name: "Mug".into(), price: dec!(8.50) });
//! let ledger = InventoryLedger::default();
//! ledger.restock(ProductId(1), 5).unwrap();
//!
//! let store = Arc::new(OrderStore::new(
//!     Arc::new(ledger),
//!     Arc::new(catalog),
//!     Default::default(),
//! ));
//! let (dispatcher, _notifications) = QueuedDispatcher::bounded(16);
//! let coordinator =
//!     CheckoutCoordinator::new(store, Arc::new(dispatcher), CheckoutSettings::default());
//!
//! let buyer = BuyerContext::new("alice");
//! let order = coordinator
//!     .create_order(&buyer, &[ItemRequest::new(ProductId(1), 2)])
//!     .unwrap();
//! assert_eq!(order.status(), OrderStatus::Created);
//! assert_eq!(order.total(), dec!(17.00));
//!
//! let cancelled = coordinator.cancel(&buyer, order.id()).unwrap();
//! assert_eq!(cancelled.status(), OrderStatus::Cancelled);
//! ```
//!
//! ## Thread Safety
//!
//! Operations on one order serialize on that order's lock and operations on
//! one product serialize on that product's lock; everything else runs in
//! parallel. Lock waits are bounded and surface as
//! [`CheckoutError::ConcurrencyConflict`].

mod base;
pub mod catalog;
pub mod config;
mod coordinator;
pub mod error;
mod gateway;
pub mod http;
mod inventory;
pub mod logging;
pub mod notification;
mod order;
mod redirect_gateway;
pub mod seed;
pub mod signing;
mod store;
mod wallet_gateway;

pub use base::{BuyerRef, OrderId, ProductId, ReservationToken};
pub use catalog::{Catalog, InMemoryCatalog, Product};
pub use config::{CheckoutSettings, Config, LockPolicy};
pub use coordinator::{BuyerContext, CheckoutCoordinator};
pub use error::{CheckoutError, ErrorKind};
pub use gateway::{
    GatewayCallback, NormalizedCallback, PaymentGateway, PaymentOutcome, PaymentSessionHandle,
    ProviderKind, SessionRequest,
};
pub use inventory::{InventoryLedger, Reservation, ReservationState, StockSnapshot};
pub use notification::{NotificationDispatcher, QueuedDispatcher};
pub use order::{
    AttemptOutcome, ItemRequest, LineItem, Order, OrderStatus, PaymentAttempt, TransitionEvidence,
};
pub use redirect_gateway::{RedirectGateway, RedirectGatewayConfig};
pub use store::OrderStore;
pub use wallet_gateway::{
    HttpWalletApi, WEBHOOK_SIGNATURE_HEADER, WalletApi, WalletApiError, WalletCheckout,
    WalletCheckoutRequest, WalletGateway, WalletGatewayConfig, WalletMode,
};
