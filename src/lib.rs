// ble-bridge Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! A WebSocket to Bluetooth Low Energy bridge.
//!
//! `ble-bridge` lets browser (and headless) test clients exercise a real BLE
//! peripheral over a WebSocket. Clients attach to a *session*, the session
//! owns at most one BLE transport, and the bridge multiplexes any number of
//! WebSocket attachments onto that single transport while preserving the
//! peripheral connection across transient client disconnects.
//!
//! The interesting pieces live in:
//!
//! * [`session`]: the per-session state machine (grace and idle timers,
//!   write serialization, deterministic cleanup) and the registry enforcing
//!   the at-most-one-peripheral admission policy.
//! * [`transport`]: the narrow interface over the OS BLE central role,
//!   with a production implementation on top of
//!   [btleplug](https://github.com/deviceplug/btleplug) and a deterministic
//!   in-memory implementation for tests.
//! * [`reassembly`]: the ring-buffered framer that turns a fragmented
//!   notify byte stream into whole vendor packets.
//! * [`bridge`]: the WebSocket front end, covering upgrade handling, the
//!   legacy URL-parameter handshake and the RPC handshake.
//!
//! A minimal server looks like:
//!
//! ```no_run
//! use std::sync::Arc;
//! use ble_bridge::bridge::Bridge;
//! use ble_bridge::config::BridgeConfig;
//! use ble_bridge::transport::btle::BtleTransportFactory;
//!
//! # async fn example() -> ble_bridge::Result<()> {
//! let config = BridgeConfig::default();
//! let factory = Arc::new(BtleTransportFactory::new(&config));
//! let bridge = Bridge::new(config, factory);
//! bridge.run().await
//! # }
//! ```

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

pub mod bleuuid;
pub mod bridge;
pub mod config;
pub mod observability;
pub mod reassembly;
pub mod session;
pub mod transport;
pub mod ws;

/// The main error type, returned by most fallible methods in the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The registry refused a new session because another session currently
    /// holds the radio (connected or in its grace period).
    #[error("Device is busy with another session")]
    AdmissionDenied {
        /// Session id of the incumbent, when known.
        blocking_session: Option<String>,
    },

    /// No peripheral matching the device prefix appeared within the scan
    /// deadline.
    #[error("Device {prefix} not found")]
    ScanTimeout { prefix: String },

    /// The peripheral does not expose the configured service.
    #[error("Service {0} not found on device")]
    ServiceMissing(Uuid),

    /// The configured service is missing the write or notify characteristic.
    #[error("Characteristic {0} not found on device")]
    CharacteristicMissing(Uuid),

    /// The host adapter is absent or not in the powered-on state.
    #[error("Bluetooth adapter is not powered on")]
    AdapterOff,

    /// A write was rejected because the stack reported it busy. Transient;
    /// the session's write loop retries these with back-off.
    #[error("Write is busy")]
    WriteBusy,

    /// The peripheral dropped the connection. Transient for in-flight
    /// writes; fatal for the session once retries are exhausted.
    #[error("Device disconnected")]
    Disconnected,

    /// An operation that requires a live peripheral ran without one.
    #[error("Not connected to a device")]
    NotConnected,

    /// The per-session write queue is at capacity.
    #[error("Write queue is full")]
    WriteQueueFull,

    /// A malformed or out-of-place inbound WebSocket frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Missing or wrong admin token on an `admin_cleanup` request.
    #[error("Unauthorized")]
    Unauthorized,

    /// Post-cleanup resource verification exceeded the leak thresholds.
    #[error("Resource leak detected: {peripherals} peripherals, {scan_stop_listeners} scan-stop listeners, {discover_listeners} discover listeners")]
    ResourceLeak {
        peripherals: usize,
        scan_stop_listeners: usize,
        discover_listeners: usize,
    },

    /// The upgrade handshake did not complete within its deadline.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// The session was already terminating when the operation arrived.
    #[error("Session is closed")]
    SessionClosed,

    /// A UUID on the wire was not one of the recognized forms.
    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a failed write may succeed if retried after a back-off.
    pub fn is_transient_write(&self) -> bool {
        matches!(self, Error::WriteBusy | Error::Disconnected)
    }

    /// Best-effort duplication for fan-out to multiple waiters. Variants
    /// wrapping foreign non-`Clone` errors degrade to [`Error::Other`].
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::AdmissionDenied { blocking_session } => Error::AdmissionDenied {
                blocking_session: blocking_session.clone(),
            },
            Error::ScanTimeout { prefix } => Error::ScanTimeout {
                prefix: prefix.clone(),
            },
            Error::ServiceMissing(uuid) => Error::ServiceMissing(*uuid),
            Error::CharacteristicMissing(uuid) => Error::CharacteristicMissing(*uuid),
            Error::AdapterOff => Error::AdapterOff,
            Error::WriteBusy => Error::WriteBusy,
            Error::Disconnected => Error::Disconnected,
            Error::NotConnected => Error::NotConnected,
            Error::WriteQueueFull => Error::WriteQueueFull,
            Error::Protocol(msg) => Error::Protocol(msg.clone()),
            Error::Unauthorized => Error::Unauthorized,
            Error::ResourceLeak {
                peripherals,
                scan_stop_listeners,
                discover_listeners,
            } => Error::ResourceLeak {
                peripherals: *peripherals,
                scan_stop_listeners: *scan_stop_listeners,
                discover_listeners: *discover_listeners,
            },
            Error::HandshakeTimeout => Error::HandshakeTimeout,
            Error::SessionClosed => Error::SessionClosed,
            Error::InvalidUuid(raw) => Error::InvalidUuid(raw.clone()),
            Error::TimedOut(duration) => Error::TimedOut(*duration),
            other => Error::Other(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
