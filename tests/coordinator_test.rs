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

//! End-to-end checkout flows through the coordinator.

mod common;

use checkout_core::{
    AttemptOutcome, BuyerContext, CheckoutError, GatewayCallback, ItemRequest, LockPolicy,
    OrderId, OrderStatus, ProviderKind, ReservationState,
};
use chrono::{TimeDelta, Utc};
use common::{Harness, MUG, MUG_STOCK, PEN, redirect_return, settings, wallet_webhook};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn alice() -> BuyerContext {
    BuyerContext::new("alice")
}

// === Order Creation ===

#[test]
fn create_then_get_is_created_with_total() {
    let h = Harness::new();
    let order = h
        .coordinator
        .create_order(
            &alice(),
            &[ItemRequest::new(MUG, 2), ItemRequest::new(PEN, 3)],
        )
        .unwrap();

    let fetched = h.coordinator.get(order.id()).unwrap();
    assert_eq!(fetched.status(), OrderStatus::Created);
    assert_eq!(fetched.total(), dec!(27.50));
    assert_eq!(fetched.items().len(), 2);
    assert_eq!(fetched.buyer().as_str(), "alice");
}

#[test]
fn insufficient_stock_stores_nothing() {
    let h = Harness::new();
    let result = h.coordinator.create_order(
        &alice(),
        &[ItemRequest::new(PEN, 1), ItemRequest::new(MUG, MUG_STOCK as i64 + 1)],
    );

    assert_eq!(
        result,
        Err(CheckoutError::InsufficientStock {
            product_id: MUG,
            requested: MUG_STOCK + 1,
            available: MUG_STOCK,
        })
    );
    assert!(h.coordinator.store().is_empty());
    assert_eq!(h.ledger.stock(PEN).unwrap().reserved, 0);
}

// === Payment Success ===

#[tokio::test]
async fn redirect_success_commits_and_replay_is_ignored() {
    let h = Harness::new();
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 2)])
        .unwrap();
    assert_eq!(h.ledger.stock(MUG).unwrap().available, 3);

    let handle = h
        .coordinator
        .initiate_payment(&alice(), order.id(), ProviderKind::Redirect)
        .await
        .unwrap();
    assert_eq!(handle.provider, ProviderKind::Redirect);
    assert!(handle.redirect_url.contains("secure_hash="));
    assert_eq!(
        h.coordinator.get(order.id()).unwrap().status(),
        OrderStatus::AwaitingPayment
    );

    let callback = redirect_return(order.id(), "00");
    let paid = h.coordinator.handle_callback(&callback).unwrap();
    assert_eq!(paid.status(), OrderStatus::Paid);
    assert_eq!(paid.external_tx_id(), Some("14123456"));
    assert_eq!(h.ledger.stock(MUG).unwrap().committed, 2);
    let reservations = h.coordinator.store().reservations(order.id()).unwrap();
    assert!(
        reservations
            .iter()
            .all(|r| r.state == ReservationState::Committed)
    );

    let replayed = h.coordinator.handle_callback(&callback).unwrap();
    assert_eq!(replayed, paid);
    assert_eq!(h.ledger.stock(MUG).unwrap().committed, 2);
    assert_eq!(h.ledger.stock(MUG).unwrap().available, 3);
    assert_eq!(h.notification_count(), 1);
}

#[tokio::test]
async fn reencoded_redirect_returns_are_replays() {
    let h = Harness::new();
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 1)])
        .unwrap();
    h.coordinator
        .initiate_payment(&alice(), order.id(), ProviderKind::Redirect)
        .await
        .unwrap();

    let callback = redirect_return(order.id(), "00");
    let paid = h.coordinator.handle_callback(&callback).unwrap();
    assert_eq!(paid.attempts().len(), 2);

    // The signature still verifies for each of these, but none is a new callback.
    let mut reversed: Vec<&str> = callback.payload.split('&').collect();
    reversed.reverse();
    let mut variants = vec![
        reversed.join("&"),
        callback.payload.replace("txn_ref=", "txn%5Fref="),
    ];
    for i in 0..100 {
        variants.push(format!("{}&secure_hash_type=HmacSHA512-{i}", callback.payload));
    }

    for payload in variants {
        let variant = GatewayCallback {
            payload,
            ..callback.clone()
        };
        let replayed = h.coordinator.handle_callback(&variant).unwrap();
        assert_eq!(replayed, paid);
    }

    let order = h.coordinator.get(order.id()).unwrap();
    assert_eq!(order.status(), OrderStatus::Paid);
    assert_eq!(order.attempts().len(), 2);
    assert_eq!(h.ledger.stock(MUG).unwrap().committed, 1);
    assert_eq!(h.notification_count(), 1);
}

#[tokio::test]
async fn wallet_success_records_capture_id() {
    let h = Harness::new();
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 1)])
        .unwrap();

    let handle = h
        .coordinator
        .initiate_payment(&alice(), order.id(), ProviderKind::Wallet)
        .await
        .unwrap();
    assert_eq!(handle.session_ref, "WC-1");
    assert!(handle.redirect_url.starts_with("https://wallet.test/approve"));

    let paid = h
        .coordinator
        .handle_callback(&wallet_webhook(order.id(), "COMPLETED", "CAP-7"))
        .unwrap();

    assert_eq!(paid.status(), OrderStatus::Paid);
    assert_eq!(paid.provider(), Some(ProviderKind::Wallet));
    assert_eq!(paid.external_tx_id(), Some("CAP-7"));

    let outcomes: Vec<_> = paid.attempts().iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        vec![AttemptOutcome::SessionOpened, AttemptOutcome::Succeeded]
    );
    assert!(paid.attempts()[0].request_hash.is_some());
    assert!(paid.attempts()[1].callback_hash.is_some());
}

// === Payment Failure ===

#[tokio::test]
async fn declined_payment_releases_stock() {
    let h = Harness::new();
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 2)])
        .unwrap();
    h.coordinator
        .initiate_payment(&alice(), order.id(), ProviderKind::Wallet)
        .await
        .unwrap();

    let failed = h
        .coordinator
        .handle_callback(&wallet_webhook(order.id(), "DECLINED", "CAP-1"))
        .unwrap();

    assert_eq!(failed.status(), OrderStatus::Failed);
    assert_eq!(h.ledger.stock(MUG).unwrap().available, MUG_STOCK);
    assert_eq!(h.ledger.stock(MUG).unwrap().reserved, 0);
    assert!(
        h.coordinator
            .store()
            .reservations(order.id())
            .unwrap()
            .iter()
            .all(|r| r.state == ReservationState::Released)
    );
}

#[tokio::test]
async fn pending_wallet_status_keeps_order_awaiting() {
    let h = Harness::new();
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 2)])
        .unwrap();
    h.coordinator
        .initiate_payment(&alice(), order.id(), ProviderKind::Wallet)
        .await
        .unwrap();

    let approved = wallet_webhook(order.id(), "APPROVED", "CAP-3");
    let waiting = h.coordinator.handle_callback(&approved).unwrap();
    assert_eq!(waiting.status(), OrderStatus::AwaitingPayment);
    assert_eq!(
        waiting.attempts().last().map(|a| a.outcome),
        Some(AttemptOutcome::Pending)
    );
    assert_eq!(h.ledger.stock(MUG).unwrap().reserved, 2);
    assert_eq!(h.notification_count(), 0);

    // The same intermediate webhook again is a replay.
    let again = h.coordinator.handle_callback(&approved).unwrap();
    assert_eq!(again.attempts().len(), waiting.attempts().len());

    let paid = h
        .coordinator
        .handle_callback(&wallet_webhook(order.id(), "COMPLETED", "CAP-3"))
        .unwrap();
    assert_eq!(paid.status(), OrderStatus::Paid);
    assert_eq!(paid.external_tx_id(), Some("CAP-3"));
    let outcomes: Vec<_> = paid.attempts().iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            AttemptOutcome::SessionOpened,
            AttemptOutcome::Pending,
            AttemptOutcome::Succeeded
        ]
    );
    assert_eq!(h.ledger.stock(MUG).unwrap().committed, 2);
    assert_eq!(h.notification_count(), 1);
}

#[tokio::test]
async fn redirect_abandoned_code_fails_order() {
    let h = Harness::new();
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 1)])
        .unwrap();
    h.coordinator
        .initiate_payment(&alice(), order.id(), ProviderKind::Redirect)
        .await
        .unwrap();

    let failed = h
        .coordinator
        .handle_callback(&redirect_return(order.id(), "24"))
        .unwrap();

    assert_eq!(failed.status(), OrderStatus::Failed);
    assert_eq!(
        failed.attempts().last().unwrap().outcome,
        AttemptOutcome::Declined
    );
}

// === Forged Callbacks ===

#[tokio::test]
async fn tampered_signature_is_rejected_without_state_change() {
    let h = Harness::new();
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 2)])
        .unwrap();
    h.coordinator
        .initiate_payment(&alice(), order.id(), ProviderKind::Wallet)
        .await
        .unwrap();

    let mut forged = wallet_webhook(order.id(), "COMPLETED", "CAP-1");
    forged.signature = "sha256=00".into();

    assert_eq!(
        h.coordinator.handle_callback(&forged),
        Err(CheckoutError::ForgedCallback {
            provider: ProviderKind::Wallet
        })
    );
    let order = h.coordinator.get(order.id()).unwrap();
    assert_eq!(order.status(), OrderStatus::AwaitingPayment);
    assert_eq!(order.attempts().len(), 1);
    assert_eq!(h.ledger.stock(MUG).unwrap().reserved, 2);
}

#[tokio::test]
async fn tampered_payload_is_rejected() {
    let h = Harness::new();
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 1)])
        .unwrap();
    h.coordinator
        .initiate_payment(&alice(), order.id(), ProviderKind::Wallet)
        .await
        .unwrap();

    let declined = wallet_webhook(order.id(), "DECLINED", "CAP-1");
    let forged = GatewayCallback {
        payload: declined.payload.replace("DECLINED", "COMPLETED"),
        ..declined
    };

    assert!(matches!(
        h.coordinator.handle_callback(&forged),
        Err(CheckoutError::ForgedCallback { .. })
    ));
}

#[test]
fn forged_callback_for_unknown_order_does_not_reveal_existence() {
    let h = Harness::new();
    let mut forged = redirect_return(OrderId::new(), "00");
    forged.signature = "deadbeef".into();

    assert!(matches!(
        h.coordinator.handle_callback(&forged),
        Err(CheckoutError::ForgedCallback { .. })
    ));
}

#[test]
fn signed_callback_for_unknown_order_is_not_found() {
    let h = Harness::new();
    let id = OrderId::new();
    assert_eq!(
        h.coordinator.handle_callback(&redirect_return(id, "00")),
        Err(CheckoutError::OrderNotFound(id))
    );
}

// === Invalid Transitions ===

#[test]
fn callback_for_created_order_is_invalid() {
    let h = Harness::new();
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 1)])
        .unwrap();

    assert_eq!(
        h.coordinator
            .handle_callback(&redirect_return(order.id(), "00")),
        Err(CheckoutError::InvalidTransition {
            from: OrderStatus::Created,
            to: OrderStatus::Paid,
        })
    );
    assert_eq!(h.ledger.stock(MUG).unwrap().committed, 0);
}

#[tokio::test]
async fn initiate_twice_is_invalid() {
    let h = Harness::new();
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 1)])
        .unwrap();
    h.coordinator
        .initiate_payment(&alice(), order.id(), ProviderKind::Redirect)
        .await
        .unwrap();

    let second = h
        .coordinator
        .initiate_payment(&alice(), order.id(), ProviderKind::Wallet)
        .await;

    assert_eq!(
        second,
        Err(CheckoutError::InvalidTransition {
            from: OrderStatus::AwaitingPayment,
            to: OrderStatus::AwaitingPayment,
        })
    );
    assert_eq!(h.wallet_api.calls(), 0);
}

#[tokio::test]
async fn callback_from_other_provider_is_rejected() {
    let h = Harness::new();
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 1)])
        .unwrap();
    h.coordinator
        .initiate_payment(&alice(), order.id(), ProviderKind::Redirect)
        .await
        .unwrap();

    assert!(matches!(
        h.coordinator
            .handle_callback(&wallet_webhook(order.id(), "COMPLETED", "CAP-1")),
        Err(CheckoutError::Validation(_))
    ));
    assert_eq!(
        h.coordinator.get(order.id()).unwrap().status(),
        OrderStatus::AwaitingPayment
    );
}

// === Cancel and Fulfill ===

#[test]
fn cancel_created_releases_stock() {
    let h = Harness::new();
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 2)])
        .unwrap();

    let cancelled = h.coordinator.cancel(&alice(), order.id()).unwrap();

    assert_eq!(cancelled.status(), OrderStatus::Cancelled);
    assert_eq!(h.ledger.stock(MUG).unwrap().available, MUG_STOCK);
    assert!(
        h.coordinator
            .store()
            .reservations(order.id())
            .unwrap()
            .iter()
            .all(|r| r.state == ReservationState::Released)
    );
}

#[tokio::test]
async fn cancel_awaiting_then_late_success_is_invalid() {
    let h = Harness::new();
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 2)])
        .unwrap();
    h.coordinator
        .initiate_payment(&alice(), order.id(), ProviderKind::Redirect)
        .await
        .unwrap();
    h.coordinator.cancel(&alice(), order.id()).unwrap();

    assert_eq!(
        h.coordinator
            .handle_callback(&redirect_return(order.id(), "00")),
        Err(CheckoutError::InvalidTransition {
            from: OrderStatus::Cancelled,
            to: OrderStatus::Paid,
        })
    );
    assert_eq!(h.ledger.stock(MUG).unwrap().available, MUG_STOCK);
    assert_eq!(h.ledger.stock(MUG).unwrap().committed, 0);
}

#[tokio::test]
async fn paid_order_can_be_fulfilled_but_not_cancelled() {
    let h = Harness::new();
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 1)])
        .unwrap();
    h.coordinator
        .initiate_payment(&alice(), order.id(), ProviderKind::Redirect)
        .await
        .unwrap();
    h.coordinator
        .handle_callback(&redirect_return(order.id(), "00"))
        .unwrap();

    assert_eq!(
        h.coordinator.cancel(&alice(), order.id()),
        Err(CheckoutError::InvalidTransition {
            from: OrderStatus::Paid,
            to: OrderStatus::Cancelled,
        })
    );

    let shipped = h.coordinator.fulfill(order.id()).unwrap();
    assert_eq!(shipped.status(), OrderStatus::Fulfilled);
    assert!(h.coordinator.fulfill(order.id()).is_err());
    assert!(h.coordinator.cancel(&alice(), order.id()).is_err());
    assert_eq!(h.ledger.stock(MUG).unwrap().committed, 1);
}

// === Gateway Timeout and Reconciliation ===

#[tokio::test]
async fn gateway_timeout_leaves_order_awaiting_payment() {
    let h = Harness::with(
        settings(),
        LockPolicy::default(),
        Duration::from_millis(500),
    );
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 2)])
        .unwrap();

    let result = h
        .coordinator
        .initiate_payment(&alice(), order.id(), ProviderKind::Wallet)
        .await;

    assert!(matches!(
        result,
        Err(CheckoutError::GatewayUnavailable {
            provider: ProviderKind::Wallet,
            ..
        })
    ));
    assert_eq!(h.wallet_api.calls(), settings().gateway_max_attempts);

    let order = h.coordinator.get(order.id()).unwrap();
    assert_eq!(order.status(), OrderStatus::AwaitingPayment);
    assert_eq!(order.attempts().len(), 1);
    assert_eq!(
        order.attempts()[0].outcome,
        AttemptOutcome::GatewayUnavailable
    );
    assert_eq!(h.ledger.stock(MUG).unwrap().reserved, 2);

    // The sweep picks it up once the staleness window has passed.
    let expired = h
        .coordinator
        .expire_stale(Utc::now() + TimeDelta::seconds(120));
    assert_eq!(expired, vec![order.id()]);
    assert_eq!(
        h.coordinator.get(order.id()).unwrap().status(),
        OrderStatus::Failed
    );
    assert_eq!(h.ledger.stock(MUG).unwrap().available, MUG_STOCK);
}

#[tokio::test]
async fn sweep_ignores_fresh_and_resolved_orders() {
    let h = Harness::new();
    let fresh = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(PEN, 1)])
        .unwrap();
    let paid = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(PEN, 1)])
        .unwrap();
    let untouched = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(PEN, 1)])
        .unwrap();
    for id in [fresh.id(), paid.id()] {
        h.coordinator
            .initiate_payment(&alice(), id, ProviderKind::Redirect)
            .await
            .unwrap();
    }
    h.coordinator
        .handle_callback(&redirect_return(paid.id(), "00"))
        .unwrap();

    assert!(h.coordinator.expire_stale(Utc::now()).is_empty());

    let expired = h
        .coordinator
        .expire_stale(Utc::now() + TimeDelta::seconds(61));
    assert_eq!(expired, vec![fresh.id()]);
    assert_eq!(
        h.coordinator.get(paid.id()).unwrap().status(),
        OrderStatus::Paid
    );
    assert_eq!(
        h.coordinator.get(untouched.id()).unwrap().status(),
        OrderStatus::Created
    );

    // A callback after expiry is a superseded duplicate.
    let late = h
        .coordinator
        .handle_callback(&redirect_return(fresh.id(), "00"))
        .unwrap();
    assert_eq!(late.status(), OrderStatus::Failed);
    assert_eq!(
        late.attempts().last().unwrap().outcome,
        AttemptOutcome::Superseded
    );
}

// === Racing Callbacks ===

#[tokio::test]
async fn racing_conflicting_callbacks_have_one_winner() {
    let h = Harness::patient();
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 2)])
        .unwrap();
    h.coordinator
        .initiate_payment(&alice(), order.id(), ProviderKind::Wallet)
        .await
        .unwrap();

    let success = wallet_webhook(order.id(), "COMPLETED", "CAP-OK");
    let decline = wallet_webhook(order.id(), "DECLINED", "CAP-NO");

    let handles: Vec<_> = [success, decline]
        .into_iter()
        .map(|callback| {
            let coordinator = Arc::clone(&h.coordinator);
            thread::spawn(move || coordinator.handle_callback(&callback))
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap().is_ok());
    }

    let order = h.coordinator.get(order.id()).unwrap();
    let outcomes: Vec<_> = order.attempts().iter().map(|a| a.outcome).collect();
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[2], AttemptOutcome::Superseded);

    let stock = h.ledger.stock(MUG).unwrap();
    match order.status() {
        OrderStatus::Paid => {
            assert_eq!(outcomes[1], AttemptOutcome::Succeeded);
            assert_eq!(stock.committed, 2);
            assert_eq!(stock.available, 3);
        }
        OrderStatus::Failed => {
            assert_eq!(outcomes[1], AttemptOutcome::Declined);
            assert_eq!(stock.committed, 0);
            assert_eq!(stock.available, MUG_STOCK);
        }
        other => panic!("unexpected status {other}"),
    }
    assert_eq!(stock.reserved, 0);
    assert_eq!(h.notification_count(), 1);
}

#[tokio::test]
async fn concurrent_replays_apply_once() {
    let h = Harness::patient();
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 3)])
        .unwrap();
    h.coordinator
        .initiate_payment(&alice(), order.id(), ProviderKind::Redirect)
        .await
        .unwrap();

    let callback = redirect_return(order.id(), "00");
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let coordinator = Arc::clone(&h.coordinator);
            let callback = callback.clone();
            thread::spawn(move || coordinator.handle_callback(&callback))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap().status(), OrderStatus::Paid);
    }

    let order = h.coordinator.get(order.id()).unwrap();
    assert_eq!(order.attempts().len(), 2);
    assert_eq!(h.ledger.stock(MUG).unwrap().committed, 3);
    assert_eq!(h.notification_count(), 1);
}

// === Buyer Scoping ===

#[tokio::test]
async fn other_buyer_sees_not_found() {
    let h = Harness::new();
    let order = h
        .coordinator
        .create_order(&alice(), &[ItemRequest::new(MUG, 1)])
        .unwrap();
    let bob = BuyerContext::new("bob").with_session("s-1");

    assert_eq!(
        h.coordinator.order_for(&bob, order.id()),
        Err(CheckoutError::OrderNotFound(order.id()))
    );
    assert_eq!(
        h.coordinator.cancel(&bob, order.id()),
        Err(CheckoutError::OrderNotFound(order.id()))
    );
    assert_eq!(
        h.coordinator
            .initiate_payment(&bob, order.id(), ProviderKind::Redirect)
            .await,
        Err(CheckoutError::OrderNotFound(order.id()))
    );
    assert_eq!(
        h.coordinator.order_for(&alice(), order.id()).unwrap().status(),
        OrderStatus::Created
    );
}
