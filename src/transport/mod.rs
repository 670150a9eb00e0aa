// ble-bridge Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The narrow interface a session drives the BLE radio through.
//!
//! [`Transport`] encapsulates every OS-BLE interaction: scan, connect,
//! discover, subscribe, write, disconnect, and a resource probe for leak
//! verification. The production implementation in [`btle`] binds to the
//! OS central role through btleplug; [`mock`] is a deterministic in-memory
//! implementation used by the test suite.

pub mod btle;
pub mod mock;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::Stream;
use uuid::Uuid;

use crate::Result;

/// Thresholds past which a post-cleanup resource probe counts as a leak.
pub const SCAN_STOP_LISTENER_LIMIT: usize = 90;
pub const DISCOVER_LISTENER_LIMIT: usize = 10;
pub const PERIPHERAL_CACHE_LIMIT: usize = 100;

/// The BLE endpoint a session is configured to reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Advertised-name prefix (or exact peripheral id) to accept. Empty
    /// accepts any device advertising the service.
    pub device_prefix: String,
    pub service_uuid: Uuid,
    pub write_uuid: Uuid,
    pub notify_uuid: Uuid,
}

/// Snapshot of adapter-side resources, used for leak detection around
/// cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceState {
    /// Size of the adapter's peripheral cache.
    pub peripherals: usize,
    /// Outstanding scan-stop listener registrations.
    pub scan_stop_listeners: usize,
    /// Outstanding service-discovery listener registrations.
    pub discover_listeners: usize,
}

impl ResourceState {
    /// Whether any count exceeds its leak threshold.
    pub fn exceeds_thresholds(&self) -> bool {
        self.scan_stop_listeners > SCAN_STOP_LISTENER_LIMIT
            || self.discover_listeners > DISCOVER_LISTENER_LIMIT
            || self.peripherals > PERIPHERAL_CACHE_LIMIT
    }
}

/// A boxed stream of raw notify chunks, ending when the peripheral link
/// goes away.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// One session's handle on the BLE radio.
///
/// Implementations own whatever adapter-side state a live link needs and
/// must release all of it on [`disconnect`](Transport::disconnect), which
/// is idempotent. Writes that fail in a retriable way are reported with
/// [`Error::WriteBusy`](crate::Error::WriteBusy) or
/// [`Error::Disconnected`](crate::Error::Disconnected); retrying is the
/// caller's decision, never the transport's.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Scan for, connect to, and set up the configured peripheral:
    /// service lookup, write/notify characteristic lookup, notification
    /// subscription. Returns the advertised local name, or the peripheral
    /// id when the advertisement carries no name. Anything half-built on
    /// failure is torn down before the error propagates.
    async fn connect(&self, config: &DeviceConfig) -> Result<String>;

    /// Write without response on the write characteristic.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Release the peripheral and every adapter-side resource held.
    /// Idempotent; calling without a live link is a no-op.
    async fn disconnect(&self) -> Result<()>;

    /// Unconditional teardown for when [`disconnect`](Transport::disconnect)
    /// fails: drop listeners and peripheral handles without caring about
    /// stack errors.
    async fn force_teardown(&self);

    /// Best-effort adapter-wide reset, the escalation path after a leak
    /// survives ordinary cleanup.
    async fn reset_adapter(&self) -> Result<()>;

    /// Probe adapter-side resource usage.
    async fn resource_state(&self) -> ResourceState;

    /// The raw notify byte stream for the current link.
    async fn notifications(&self) -> Result<NotificationStream>;
}

/// Builds the transport a session will own. The registry holds one
/// factory; tests substitute the mock.
pub trait TransportFactory: Send + Sync + 'static {
    fn create(&self) -> Arc<dyn Transport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leak_thresholds() {
        let clean = ResourceState::default();
        assert!(!clean.exceeds_thresholds());

        let scan_leak = ResourceState {
            scan_stop_listeners: SCAN_STOP_LISTENER_LIMIT + 1,
            ..ResourceState::default()
        };
        assert!(scan_leak.exceeds_thresholds());

        let discover_leak = ResourceState {
            discover_listeners: DISCOVER_LISTENER_LIMIT + 1,
            ..ResourceState::default()
        };
        assert!(discover_leak.exceeds_thresholds());

        let cache_leak = ResourceState {
            peripherals: PERIPHERAL_CACHE_LIMIT + 1,
            ..ResourceState::default()
        };
        assert!(cache_leak.exceeds_thresholds());

        let at_limit = ResourceState {
            peripherals: PERIPHERAL_CACHE_LIMIT,
            scan_stop_listeners: SCAN_STOP_LISTENER_LIMIT,
            discover_listeners: DISCOVER_LISTENER_LIMIT,
        };
        assert!(!at_limit.exceeds_thresholds());
    }
}
