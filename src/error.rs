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

//! Error types for checkout processing.

use crate::base::{OrderId, ProductId, ReservationToken};
use crate::gateway::ProviderKind;
use crate::inventory::ReservationState;
use crate::order::OrderStatus;
use thiserror::Error;

/// Checkout processing errors.
///
/// Every variant is a per-request failure; none of them is fatal to the process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckoutError {
    /// Malformed input from the caller
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown order, or an order owned by another buyer
    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    /// Unknown product
    #[error("product {0} not found")]
    ProductNotFound(ProductId),

    /// Unknown reservation token
    #[error("reservation {0} not found")]
    ReservationNotFound(ReservationToken),

    /// Not enough available stock to reserve
    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },

    /// Requested edge is not part of the order state machine
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    /// Reservation already settled the other way (commit after release or vice versa)
    #[error("reservation {token} is already {state}")]
    ReservationSettled {
        token: ReservationToken,
        state: ReservationState,
    },

    /// Callback signature did not verify
    #[error("forged callback from {provider} gateway")]
    ForgedCallback { provider: ProviderKind },

    /// Lock could not be acquired within the retry bound
    #[error("concurrency conflict on {0}")]
    ConcurrencyConflict(String),

    /// External gateway timed out or failed
    #[error("{provider} gateway unavailable: {reason}")]
    GatewayUnavailable {
        provider: ProviderKind,
        reason: String,
    },
}

/// Coarse error category callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    InsufficientStock,
    InvalidTransition,
    ForgedCallback,
    ConcurrencyConflict,
    GatewayUnavailable,
}

impl CheckoutError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::OrderNotFound(_) | Self::ProductNotFound(_) | Self::ReservationNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            Self::InvalidTransition { .. } | Self::ReservationSettled { .. } => {
                ErrorKind::InvalidTransition
            }
            Self::ForgedCallback { .. } => ErrorKind::ForgedCallback,
            Self::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            Self::GatewayUnavailable { .. } => ErrorKind::GatewayUnavailable,
        }
    }

    /// Transient failures that the caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConcurrencyConflict | ErrorKind::GatewayUnavailable
        )
    }
}
