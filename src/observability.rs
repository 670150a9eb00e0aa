// ble-bridge Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Read-only state the observability collaborator consumes.
//!
//! The core hands entries to the [`LogBuffer`] and keeps
//! [`SharedState`] current; the observability HTTP server (a separate
//! process-level collaborator) only ever reads through these types and
//! never mutates core state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::config::{LOG_BUFFER_MAX, LOG_BUFFER_MIN};

/// Direction tag on a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogDirection {
    Tx,
    Rx,
    Info,
}

/// One entry in the observability log ring.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Monotonic within the process.
    pub id: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub direction: LogDirection,
    /// Space-separated uppercase hex for data entries, free text for INFO.
    pub hex: String,
    pub size: usize,
}

/// Bounded ring of [`LogEntry`] values with monotonic ids.
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    next_id: AtomicU64,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(LOG_BUFFER_MIN, LOG_BUFFER_MAX);
        LogBuffer {
            capacity,
            next_id: AtomicU64::new(0),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record a data entry; `bytes` are rendered as spaced uppercase hex.
    pub fn push(&self, direction: LogDirection, bytes: &[u8]) {
        self.insert(LogEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp_ms: now_ms(),
            direction,
            hex: to_hex(bytes),
            size: bytes.len(),
        });
    }

    /// Record a free-text INFO entry.
    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        let size = message.len();
        self.insert(LogEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp_ms: now_ms(),
            direction: LogDirection::Info,
            hex: message,
            size,
        });
    }

    fn insert(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Snapshot of the ring, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

/// Bridge-wide connection state, as the observability reader sees it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionState {
    pub connected: bool,
    pub device_name: Option<String>,
    /// Set while the bridge is recovering leaked adapter resources.
    pub recovering: bool,
}

/// Serializable snapshot of one session, produced by the registry.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub device_name: Option<String>,
    pub has_transport: bool,
    pub connected: bool,
    pub active_websockets: usize,
    pub grace_period_active: bool,
    pub idle_seconds: u64,
    pub age_seconds: u64,
    pub packets_per_second: u32,
    pub frames_received: u64,
    pub chunks_dropped: u64,
}

/// Live, internally mutable status of one session. The session actor is
/// the only writer; the registry and the observability reader take
/// [`SessionStatusCell::snapshot`]s.
#[derive(Debug)]
pub struct SessionStatusCell {
    inner: Mutex<CellInner>,
}

#[derive(Debug)]
struct CellInner {
    session_id: String,
    device_name: Option<String>,
    has_transport: bool,
    active_websockets: usize,
    grace_period_active: bool,
    closed: bool,
    last_activity: std::time::Instant,
    created: std::time::Instant,
    packets_per_second: u32,
    frames_received: u64,
    chunks_dropped: u64,
}

impl SessionStatusCell {
    pub(crate) fn new(session_id: &str) -> Self {
        let now = std::time::Instant::now();
        SessionStatusCell {
            inner: Mutex::new(CellInner {
                session_id: session_id.to_string(),
                device_name: None,
                has_transport: false,
                active_websockets: 0,
                grace_period_active: false,
                closed: false,
                last_activity: now,
                created: now,
                packets_per_second: 0,
                frames_received: 0,
                chunks_dropped: 0,
            }),
        }
    }

    pub(crate) fn update(
        &self,
        device_name: Option<&str>,
        has_transport: bool,
        active_websockets: usize,
        grace_period_active: bool,
        closed: bool,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.device_name = device_name.map(str::to_string);
        inner.has_transport = has_transport;
        inner.active_websockets = active_websockets;
        inner.grace_period_active = grace_period_active;
        inner.closed = closed;
    }

    pub(crate) fn touch(&self) {
        self.inner.lock().unwrap().last_activity = std::time::Instant::now();
    }

    pub(crate) fn record_traffic(&self, packets_per_second: u32, frames: u64, dropped: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.packets_per_second = packets_per_second;
        inner.frames_received = frames;
        inner.chunks_dropped = dropped;
    }

    pub(crate) fn idle(&self) -> std::time::Duration {
        self.inner.lock().unwrap().last_activity.elapsed()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().unwrap();
        SessionSnapshot {
            session_id: inner.session_id.clone(),
            device_name: inner.device_name.clone(),
            has_transport: inner.has_transport,
            connected: inner.device_name.is_some(),
            active_websockets: inner.active_websockets,
            grace_period_active: inner.grace_period_active,
            idle_seconds: inner.last_activity.elapsed().as_secs(),
            age_seconds: inner.created.elapsed().as_secs(),
            packets_per_second: inner.packets_per_second,
            frames_received: inner.frames_received,
            chunks_dropped: inner.chunks_dropped,
        }
    }
}

/// Cheaply cloneable handle over the bridge's observable state.
#[derive(Clone)]
pub struct SharedState {
    connection: Arc<Mutex<ConnectionState>>,
    sessions: Arc<dashmap::DashMap<String, Arc<SessionStatusCell>>>,
    log: Arc<LogBuffer>,
}

impl SharedState {
    pub fn new(log_capacity: usize) -> Self {
        SharedState {
            connection: Arc::new(Mutex::new(ConnectionState::default())),
            sessions: Arc::new(dashmap::DashMap::new()),
            log: Arc::new(LogBuffer::new(log_capacity)),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.lock().unwrap().clone()
    }

    /// Snapshots of every registered session.
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions.iter().map(|cell| cell.snapshot()).collect()
    }

    pub fn log_buffer(&self) -> Arc<LogBuffer> {
        Arc::clone(&self.log)
    }

    pub(crate) fn register_session(&self, id: &str, cell: Arc<SessionStatusCell>) {
        self.sessions.insert(id.to_string(), cell);
    }

    pub(crate) fn unregister_session(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub(crate) fn set_connected(&self, device_name: &str) {
        let mut state = self.connection.lock().unwrap();
        state.connected = true;
        state.device_name = Some(device_name.to_string());
        state.recovering = false;
    }

    pub(crate) fn set_disconnected(&self, recovering: bool) {
        let mut state = self.connection.lock().unwrap();
        state.connected = false;
        state.device_name = None;
        state.recovering = recovering;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_ring_is_bounded() {
        let log = LogBuffer::new(0); // clamps up to LOG_BUFFER_MIN
        assert_eq!(log.capacity(), LOG_BUFFER_MIN);
        for i in 0..(LOG_BUFFER_MIN + 10) {
            log.push(LogDirection::Tx, &[i as u8]);
        }
        let entries = log.entries();
        assert_eq!(entries.len(), LOG_BUFFER_MIN);
        // The ten oldest entries fell off the front.
        assert_eq!(entries[0].id, 10);
        for pair in entries.windows(2) {
            assert_eq!(pair[1].id, pair[0].id + 1);
        }
    }

    #[test]
    fn hex_rendering() {
        let log = LogBuffer::new(LOG_BUFFER_MIN);
        log.push(LogDirection::Rx, &[0xA7, 0xB3, 0x02]);
        let entries = log.entries();
        assert_eq!(entries[0].hex, "A7 B3 02");
        assert_eq!(entries[0].size, 3);
        assert_eq!(entries[0].direction, LogDirection::Rx);
    }

    #[test]
    fn connection_state_round_trip() {
        let shared = SharedState::new(LOG_BUFFER_MIN);
        assert!(!shared.connection_state().connected);
        shared.set_connected("CS108-123");
        let state = shared.connection_state();
        assert!(state.connected);
        assert_eq!(state.device_name.as_deref(), Some("CS108-123"));
        shared.set_disconnected(true);
        let state = shared.connection_state();
        assert!(!state.connected);
        assert!(state.recovering);
        assert!(state.device_name.is_none());
    }
}
