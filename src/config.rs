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

//! Runtime configuration.
//!
//! Loaded from `CHECKOUT_*` environment variables (and an optional `.env`
//! file). A payment gateway is only enabled when its credentials are present.

use crate::redirect_gateway::RedirectGatewayConfig;
use crate::wallet_gateway::{WalletGatewayConfig, WalletMode};
use parking_lot::{Mutex, MutexGuard};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub checkout: CheckoutSettings,
    pub locks: LockPolicy,
    pub redirect: Option<RedirectGatewayConfig>,
    pub wallet: Option<WalletGatewayConfig>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Directory for daily-rolling log files; console only when unset
    pub dir: Option<PathBuf>,
}

/// Coordinator tuning knobs.
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    /// Bound on a single outbound gateway session call
    pub gateway_timeout: Duration,
    /// Total session attempts per `initiate_payment`, including the first
    pub gateway_max_attempts: u32,
    /// Age after which an order still awaiting payment is expired by the sweep
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub notification_queue: usize,
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            gateway_timeout: Duration::from_secs(10),
            gateway_max_attempts: 2,
            stale_after: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
            notification_queue: 1024,
        }
    }
}

/// Bounded lock acquisition used for per-order and per-product serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(50),
            max_attempts: 3,
        }
    }
}

impl LockPolicy {
    /// Tries to lock `mutex` up to `max_attempts` times, waiting `timeout` each.
    ///
    /// Returns `None` once the bound is exhausted.
    pub(crate) fn acquire<'a, T>(&self, mutex: &'a Mutex<T>) -> Option<MutexGuard<'a, T>> {
        for attempt in 1..=self.max_attempts.max(1) {
            if let Some(guard) = mutex.try_lock_for(self.timeout) {
                return Some(guard);
            }
            tracing::debug!(attempt, max_attempts = self.max_attempts, "lock contended");
        }
        None
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is fine
        let _ = dotenvy::dotenv();

        let server = ServerConfig {
            host: var_or("CHECKOUT_HOST", "0.0.0.0"),
            port: parse_or("CHECKOUT_PORT", 8080)?,
        };

        let logging = LoggingConfig {
            level: var_or("CHECKOUT_LOG_LEVEL", "info"),
            dir: env::var("CHECKOUT_LOG_DIR").ok().map(PathBuf::from),
        };

        let defaults = CheckoutSettings::default();
        let checkout = CheckoutSettings {
            gateway_timeout: millis_or("CHECKOUT_GATEWAY_TIMEOUT_MS", defaults.gateway_timeout)?,
            gateway_max_attempts: positive_or(
                "CHECKOUT_GATEWAY_MAX_ATTEMPTS",
                defaults.gateway_max_attempts,
            )?,
            stale_after: secs_or("CHECKOUT_STALE_AFTER_SECS", defaults.stale_after)?,
            sweep_interval: secs_or("CHECKOUT_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            notification_queue: positive_or(
                "CHECKOUT_NOTIFICATION_QUEUE",
                defaults.notification_queue,
            )?,
        };

        let lock_defaults = LockPolicy::default();
        let locks = LockPolicy {
            timeout: millis_or("CHECKOUT_LOCK_TIMEOUT_MS", lock_defaults.timeout)?,
            max_attempts: positive_or("CHECKOUT_LOCK_MAX_ATTEMPTS", lock_defaults.max_attempts)?,
        };

        Ok(Self {
            server,
            logging,
            checkout,
            locks,
            redirect: Self::load_redirect()?,
            wallet: Self::load_wallet()?,
        })
    }

    /// Deterministic configuration for tests: both gateways enabled with fixed secrets.
    pub fn test() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                dir: None,
            },
            checkout: CheckoutSettings {
                gateway_timeout: Duration::from_millis(200),
                gateway_max_attempts: 2,
                stale_after: Duration::from_secs(60),
                sweep_interval: Duration::from_secs(1),
                notification_queue: 64,
            },
            locks: LockPolicy::default(),
            redirect: Some(RedirectGatewayConfig::test()),
            wallet: Some(WalletGatewayConfig::test()),
        }
    }

    fn load_redirect() -> Result<Option<RedirectGatewayConfig>, ConfigError> {
        let (Ok(merchant_code), Ok(hash_secret)) = (
            env::var("CHECKOUT_REDIRECT_MERCHANT_CODE"),
            env::var("CHECKOUT_REDIRECT_HASH_SECRET"),
        ) else {
            return Ok(None);
        };

        let defaults = RedirectGatewayConfig::default();
        Ok(Some(RedirectGatewayConfig {
            merchant_code,
            hash_secret,
            payment_url: var_or("CHECKOUT_REDIRECT_PAYMENT_URL", &defaults.payment_url),
            return_url: var_or("CHECKOUT_REDIRECT_RETURN_URL", &defaults.return_url),
            currency: var_or("CHECKOUT_REDIRECT_CURRENCY", &defaults.currency),
            locale: var_or("CHECKOUT_REDIRECT_LOCALE", &defaults.locale),
            session_ttl: secs_or("CHECKOUT_REDIRECT_SESSION_TTL_SECS", defaults.session_ttl)?,
        }))
    }

    fn load_wallet() -> Result<Option<WalletGatewayConfig>, ConfigError> {
        let (Ok(client_id), Ok(client_secret), Ok(webhook_secret)) = (
            env::var("CHECKOUT_WALLET_CLIENT_ID"),
            env::var("CHECKOUT_WALLET_CLIENT_SECRET"),
            env::var("CHECKOUT_WALLET_WEBHOOK_SECRET"),
        ) else {
            return Ok(None);
        };

        let mode: WalletMode = parse_or("CHECKOUT_WALLET_MODE", WalletMode::Sandbox)?;
        let defaults = WalletGatewayConfig::default();
        Ok(Some(WalletGatewayConfig {
            client_id,
            client_secret,
            webhook_secret,
            api_base: var_or("CHECKOUT_WALLET_API_BASE", mode.api_base()),
            mode,
            return_url: var_or("CHECKOUT_WALLET_RETURN_URL", &defaults.return_url),
            cancel_url: var_or("CHECKOUT_WALLET_CANCEL_URL", &defaults.cancel_url),
            currency: var_or("CHECKOUT_WALLET_CURRENCY", &defaults.currency),
        }))
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

fn positive_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let value = parse_or(key, default)?;
    if value <= T::default() {
        return Err(ConfigError::Zero(key));
    }
    Ok(value)
}

fn millis_or(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let millis = positive_or(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

fn secs_or(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let secs = positive_or(key, default.as_secs())?;
    Ok(Duration::from_secs(secs))
}
