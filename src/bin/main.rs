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

use checkout_core::http::{self, AppState};
use checkout_core::logging::init_logging;
use checkout_core::notification::{LogSink, spawn_worker};
use checkout_core::seed::load_products;
use checkout_core::{
    CheckoutCoordinator, Config, HttpWalletApi, InMemoryCatalog, InventoryLedger, OrderStore,
    QueuedDispatcher, RedirectGateway, WalletGateway,
};
use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Checkout server - order, inventory and payment API
///
/// Configuration comes from `CHECKOUT_*` environment variables (and an
/// optional `.env` file); the flags below override them.
#[derive(Parser, Debug)]
#[command(name = "checkout-server")]
#[command(about = "Order and payment API for a storefront", long_about = None)]
struct Args {
    /// Path to a product seed CSV
    ///
    /// Expected format: product_id,name,price,stock
    #[arg(long, value_name = "FILE")]
    seed: Option<PathBuf>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Directory for daily rotating log files
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(dir) = args.log_dir {
        config.logging.dir = Some(dir);
    }

    let _log_guard = match init_logging(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error initializing logging: {e}");
            process::exit(1);
        }
    };

    let catalog = Arc::new(InMemoryCatalog::new());
    let ledger = Arc::new(InventoryLedger::new(config.locks));
    if let Some(path) = &args.seed {
        let loaded = File::open(path)
            .map_err(csv::Error::from)
            .and_then(|file| load_products(BufReader::new(file), &catalog, &ledger));
        if let Err(e) = loaded {
            tracing::error!(path = %path.display(), error = %e, "failed to load seed data");
            process::exit(1);
        }
    }

    let (dispatcher, notifications) = QueuedDispatcher::bounded(config.checkout.notification_queue);
    let _worker = spawn_worker(notifications, LogSink);

    let store = Arc::new(OrderStore::new(ledger, catalog, config.locks));
    let mut coordinator =
        CheckoutCoordinator::new(store, Arc::new(dispatcher), config.checkout.clone());
    if let Some(redirect) = config.redirect.clone() {
        coordinator = coordinator.with_gateway(Arc::new(RedirectGateway::new(redirect)));
    }
    if let Some(wallet) = config.wallet.clone() {
        let api = Arc::new(HttpWalletApi::new(&wallet));
        coordinator = coordinator.with_gateway(Arc::new(WalletGateway::new(wallet, api)));
    }
    let providers: Vec<_> = coordinator.providers().collect();
    if providers.is_empty() {
        tracing::warn!("no payment gateway configured; payments will be rejected");
    }
    let coordinator = Arc::new(coordinator);

    spawn_sweeper(Arc::clone(&coordinator), config.checkout.sweep_interval);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%addr, error = %e, "failed to bind");
            process::exit(1);
        }
    };
    tracing::info!(%addr, ?providers, "checkout server listening");

    let app = http::router(AppState { coordinator });
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server stopped");
        process::exit(1);
    }
}

/// Periodically fails payments whose callback never arrived.
fn spawn_sweeper(coordinator: Arc<CheckoutCoordinator>, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let expired = coordinator.expire_stale(chrono::Utc::now());
            if !expired.is_empty() {
                tracing::info!(count = expired.len(), "reconciliation sweep expired orders");
            }
        }
    });
}
