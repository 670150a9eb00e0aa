// ble-bridge Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Thin CLI wrapper: environment parsing, logging setup, signal handling.
//! Everything interesting lives in the library.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use ble_bridge::bridge::Bridge;
use ble_bridge::config::BridgeConfig;
use ble_bridge::transport::btle::BtleTransportFactory;

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_var(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring unparseable {}={}", name, raw);
            None
        }
    }
}

fn config_from_env() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    if let Some(host) = env_var("BRIDGE_WS_HOST") {
        config.ws_host = host;
    }
    if let Some(port) = env_parsed("BRIDGE_WS_PORT") {
        config.ws_port = port;
    }
    if let Some(port) = env_parsed("BRIDGE_OBSERVABILITY_PORT") {
        config.observability_port = port;
    }
    if let Some(secs) = env_parsed("BRIDGE_GRACE_PERIOD_SEC") {
        config.grace_period = Duration::from_secs(secs);
    }
    if let Some(secs) = env_parsed("BRIDGE_IDLE_TIMEOUT_SEC") {
        config.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = env_parsed("BRIDGE_SCAN_TIMEOUT_MS") {
        config.scan_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = env_parsed("BRIDGE_HANDSHAKE_TIMEOUT_MS") {
        config.handshake_timeout = Duration::from_millis(ms);
    }
    if let Some(size) = env_parsed("BRIDGE_LOG_BUFFER_SIZE") {
        config.log_buffer_size = size;
    }
    config.admin_token = env_var("BRIDGE_ADMIN_TOKEN");
    config
}

#[tokio::main]
async fn main() {
    pretty_env_logger::init();
    let config = config_from_env();
    let factory = Arc::new(BtleTransportFactory::new(&config));
    let bridge = Bridge::new(config, factory);
    let manager = bridge.manager().clone();

    tokio::select! {
        result = bridge.run() => {
            if let Err(err) = result {
                error!("bridge stopped: {}", err);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            manager.force_cleanup_all("process shutdown").await;
        }
    }
}
