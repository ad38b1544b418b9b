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

//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use checkout_core::notification::Notification;
use checkout_core::{
    CheckoutCoordinator, CheckoutSettings, GatewayCallback, InMemoryCatalog, InventoryLedger,
    LockPolicy, OrderId, OrderStore, Product, ProductId, QueuedDispatcher, RedirectGateway,
    RedirectGatewayConfig, WalletApi, WalletApiError, WalletCheckout, WalletCheckoutRequest,
    WalletGateway, WalletGatewayConfig,
};
use crossbeam::channel::Receiver;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Price 10.00, opening stock 5.
pub const MUG: ProductId = ProductId(1);
/// Price 2.50, opening stock 1000.
pub const PEN: ProductId = ProductId(2);

pub const MUG_STOCK: u32 = 5;
pub const PEN_STOCK: u32 = 1000;

/// Wallet API that answers locally after an optional delay.
#[derive(Debug, Default)]
pub struct StubWalletApi {
    pub delay: Duration,
    pub calls: AtomicU32,
}

impl StubWalletApi {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WalletApi for StubWalletApi {
    async fn create_checkout(
        &self,
        request: &WalletCheckoutRequest,
    ) -> Result<WalletCheckout, WalletApiError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(WalletCheckout {
            id: format!("WC-{n}"),
            approval_url: format!("https://wallet.test/approve?token=WC-{n}&ref={}", request.order_id),
        })
    }
}

pub struct Harness {
    pub coordinator: Arc<CheckoutCoordinator>,
    pub ledger: Arc<InventoryLedger>,
    pub notifications: Receiver<Notification>,
    pub wallet_api: Arc<StubWalletApi>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(settings(), LockPolicy::default(), Duration::ZERO)
    }

    /// Lock bounds generous enough that contention never surfaces as a conflict.
    pub fn patient() -> Self {
        Self::with(
            settings(),
            LockPolicy {
                timeout: Duration::from_secs(1),
                max_attempts: 10,
            },
            Duration::ZERO,
        )
    }

    pub fn with(settings: CheckoutSettings, locks: LockPolicy, wallet_delay: Duration) -> Self {
        let catalog = InMemoryCatalog::new();
        catalog.upsert(Product {
            id: MUG,
            name: "Mug".into(),
            price: dec!(10.00),
        });
        catalog.upsert(Product {
            id: PEN,
            name: "Pen".into(),
            price: dec!(2.50),
        });

        let ledger = Arc::new(InventoryLedger::new(locks));
        ledger.restock(MUG, MUG_STOCK).unwrap();
        ledger.restock(PEN, PEN_STOCK).unwrap();

        let store = Arc::new(OrderStore::new(
            Arc::clone(&ledger),
            Arc::new(catalog),
            locks,
        ));
        let (dispatcher, notifications) = QueuedDispatcher::bounded(1024);
        let wallet_api = Arc::new(StubWalletApi::with_delay(wallet_delay));

        let coordinator = CheckoutCoordinator::new(store, Arc::new(dispatcher), settings)
            .with_gateway(Arc::new(RedirectGateway::new(RedirectGatewayConfig::test())))
            .with_gateway(Arc::new(WalletGateway::new(
                WalletGatewayConfig::test(),
                wallet_api.clone(),
            )));

        Self {
            coordinator: Arc::new(coordinator),
            ledger,
            notifications,
            wallet_api,
        }
    }

    pub fn notification_count(&self) -> usize {
        self.notifications.try_iter().count()
    }
}

pub fn settings() -> CheckoutSettings {
    CheckoutSettings {
        gateway_timeout: Duration::from_millis(100),
        gateway_max_attempts: 2,
        stale_after: Duration::from_secs(60),
        sweep_interval: Duration::from_secs(1),
        notification_queue: 1024,
    }
}

/// Signed hosted-checkout return for `order_id` with `response_code`.
pub fn redirect_return(order_id: OrderId, response_code: &str) -> GatewayCallback {
    let gateway = RedirectGateway::new(RedirectGatewayConfig::test());
    let order_ref = order_id.to_string();
    let query = gateway.signed_query([
        ("txn_ref", order_ref.as_str()),
        ("amount", "2000"),
        ("response_code", response_code),
        ("transaction_no", "14123456"),
    ]);
    RedirectGateway::callback_from_query(&query)
}

pub fn wallet_body(order_id: OrderId, status: &str, capture_id: &str) -> String {
    serde_json::json!({
        "id": format!("WH-{capture_id}"),
        "event_type": "PAYMENT.CAPTURE.COMPLETED",
        "resource": {
            "id": "WC-1",
            "reference_id": order_id.to_string(),
            "status": status,
            "capture_id": capture_id,
        }
    })
    .to_string()
}

/// Signed wallet webhook for `order_id`.
pub fn wallet_webhook(order_id: OrderId, status: &str, capture_id: &str) -> GatewayCallback {
    let payload = wallet_body(order_id, status, capture_id);
    let signature = WalletGateway::sign_webhook(&WalletGatewayConfig::test().webhook_secret, &payload);
    GatewayCallback {
        provider: checkout_core::ProviderKind::Wallet,
        payload,
        signature,
    }
}
