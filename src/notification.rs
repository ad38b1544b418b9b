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

//! Fire-and-forget payment notifications.
//!
//! The coordinator hands a [`Notification`] to a [`NotificationDispatcher`]
//! and never waits on delivery. [`QueuedDispatcher`] pushes onto a bounded
//! channel drained by a background worker that feeds a [`NotificationSink`].

use crate::base::{BuyerRef, OrderId};
use crate::gateway::PaymentOutcome;
use crate::order::{Order, OrderStatus};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use rust_decimal::Decimal;
use std::thread::{self, JoinHandle};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("notification queue is full")]
    QueueFull,

    #[error("notification worker has stopped")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub order_id: OrderId,
    pub buyer: BuyerRef,
    pub status: OrderStatus,
    pub total: Decimal,
    pub outcome: PaymentOutcome,
}

impl Notification {
    pub fn new(order: &Order, outcome: PaymentOutcome) -> Self {
        Self {
            order_id: order.id(),
            buyer: order.buyer().clone(),
            status: order.status(),
            total: order.total(),
            outcome,
        }
    }
}

pub trait NotificationDispatcher: Send + Sync {
    /// Enqueues a notification. Must return without waiting on delivery.
    fn dispatch(&self, order: &Order, outcome: PaymentOutcome) -> Result<(), NotificationError>;
}

/// Delivery backend run by the notification worker.
pub trait NotificationSink: Send {
    fn deliver(&mut self, notification: &Notification) -> Result<(), String>;
}

/// Sink that records deliveries in the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&mut self, notification: &Notification) -> Result<(), String> {
        tracing::info!(
            order_id = %notification.order_id,
            buyer = %notification.buyer,
            status = %notification.status,
            total = %notification.total,
            outcome = ?notification.outcome,
            "payment notification"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct QueuedDispatcher {
    sender: Sender<Notification>,
}

impl QueuedDispatcher {
    /// Creates a dispatcher and the receiving end of its bounded queue.
    pub fn bounded(capacity: usize) -> (Self, Receiver<Notification>) {
        let (sender, receiver) = channel::bounded(capacity);
        (Self { sender }, receiver)
    }
}

impl NotificationDispatcher for QueuedDispatcher {
    fn dispatch(&self, order: &Order, outcome: PaymentOutcome) -> Result<(), NotificationError> {
        self.sender
            .try_send(Notification::new(order, outcome))
            .map_err(|err| match err {
                TrySendError::Full(_) => NotificationError::QueueFull,
                TrySendError::Disconnected(_) => NotificationError::Closed,
            })
    }
}

/// Drains `receiver` into `sink` on a dedicated thread until every sender is dropped.
pub fn spawn_worker<S>(receiver: Receiver<Notification>, mut sink: S) -> JoinHandle<()>
where
    S: NotificationSink + 'static,
{
    thread::spawn(move || {
        for notification in receiver.iter() {
            if let Err(e) = sink.deliver(&notification) {
                tracing::warn!(order_id = %notification.order_id, error = %e, "notification delivery failed");
            }
        }
        tracing::debug!("notification worker stopped");
    })
}
