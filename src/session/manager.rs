// ble-bridge Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The session registry and admission policy.
//!
//! The radio is a single-holder resource: a returning client with a known
//! session id is always welcome, a new id is admitted only while no other
//! session holds a transport (connected *or* in its grace period). Sessions
//! publish [`SessionEvent`]s to a bus the manager drains; a periodic
//! sweeper collects zombies and stale sessions that slipped past the
//! ordinary timers.

use std::sync::Arc;

use dashmap::DashMap;
use log::{info, warn};
use tokio::sync::{mpsc, Mutex};

use crate::config::BridgeConfig;
use crate::observability::{SessionSnapshot, SharedState};
use crate::session::{Session, SessionEvent, SessionHandle};
use crate::transport::{DeviceConfig, TransportFactory};
use crate::{Error, Result};

/// Global registry of sessions, cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

struct Shared {
    config: Arc<BridgeConfig>,
    factory: Arc<dyn TransportFactory>,
    registry: DashMap<String, SessionHandle>,
    /// Serializes the scan-then-insert admission path against itself and
    /// against takeovers.
    admission: Mutex<()>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    state: SharedState,
}

impl SessionManager {
    pub fn new(config: BridgeConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let config = Arc::new(config);
        let state = SharedState::new(config.clamped_log_buffer_size());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config: Arc::clone(&config),
            factory,
            registry: DashMap::new(),
            admission: Mutex::new(()),
            events_tx,
            state,
        });

        tokio::spawn(run_event_bus(events_rx, Arc::downgrade(&shared)));
        tokio::spawn(run_sweeper(Arc::downgrade(&shared)));

        SessionManager { shared }
    }

    pub fn config(&self) -> Arc<BridgeConfig> {
        Arc::clone(&self.shared.config)
    }

    /// The read-only surface the observability collaborator consumes.
    pub fn shared_state(&self) -> SharedState {
        self.shared.state.clone()
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.shared.state.sessions()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionHandle> {
        self.shared
            .registry
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    /// Return the session registered under `session_id`, or admit a new
    /// one. Admission is denied while any other live session holds a
    /// transport.
    pub async fn get_or_create(
        &self,
        session_id: &str,
        device: DeviceConfig,
    ) -> Result<SessionHandle> {
        let _guard = self.shared.admission.lock().await;

        if let Some(existing) = self.shared.registry.get(session_id) {
            if !existing.is_closed() {
                return Ok(existing.value().clone());
            }
            // Terminating leftover; never hand it out.
            drop(existing);
            self.remove(session_id);
        }

        for entry in self.shared.registry.iter() {
            if entry.key() == session_id || entry.is_closed() {
                continue;
            }
            if entry.status().snapshot().has_transport {
                return Err(Error::AdmissionDenied {
                    blocking_session: Some(entry.key().clone()),
                });
            }
        }

        let handle = Session::spawn(
            session_id,
            device,
            Arc::clone(&self.shared.config),
            Arc::clone(&self.shared.factory),
            self.shared.events_tx.clone(),
            self.shared.state.log_buffer(),
        );
        self.shared
            .state
            .register_session(session_id, handle.status());
        self.shared
            .registry
            .insert(session_id.to_string(), handle.clone());
        info!("session {} registered", session_id);
        Ok(handle)
    }

    /// Admission with eviction: on denial, clean up the blocking session
    /// and retry once.
    pub async fn force_takeover(
        &self,
        session_id: &str,
        device: DeviceConfig,
    ) -> Result<SessionHandle> {
        match self.get_or_create(session_id, device.clone()).await {
            Err(Error::AdmissionDenied {
                blocking_session: Some(blocking),
            }) => {
                warn!(
                    "session {} taking over from {}",
                    session_id, blocking
                );
                if let Some(victim) = self.session(&blocking) {
                    victim.force_cleanup("forced takeover").await;
                }
                self.remove(&blocking);
                self.get_or_create(session_id, device).await
            }
            other => other,
        }
    }

    /// Best-effort cleanup of every session; empties the registry.
    pub async fn force_cleanup_all(&self, reason: &str) {
        let handles: Vec<SessionHandle> = self
            .shared
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!("cleaning up all {} sessions ({})", handles.len(), reason);
        for handle in handles {
            handle.force_cleanup(reason).await;
            self.remove(handle.id());
        }
    }

    /// Cleanup whichever session is connected to the named device.
    pub async fn force_cleanup_device(&self, device_name: &str, reason: &str) {
        let victim = self.shared.registry.iter().find_map(|entry| {
            (entry.status().snapshot().device_name.as_deref() == Some(device_name))
                .then(|| entry.value().clone())
        });
        if let Some(handle) = victim {
            handle.force_cleanup(reason).await;
            self.remove(handle.id());
        }
    }

    fn remove(&self, session_id: &str) {
        self.shared.registry.remove(session_id);
        self.shared.state.unregister_session(session_id);
    }
}

/// Drains session events: deregisters cleaned-up sessions and keeps the
/// bridge-wide connection state current.
async fn run_event_bus(
    mut events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    shared: std::sync::Weak<Shared>,
) {
    while let Some(event) = events_rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match event {
            SessionEvent::Connected {
                session_id,
                device_name,
            } => {
                shared.state.set_connected(&device_name);
                shared
                    .state
                    .log_buffer()
                    .info(format!("session {session_id}: holds {device_name}"));
            }
            SessionEvent::Cleanup {
                session_id,
                reason,
                resources_freed,
            } => {
                shared.registry.remove(&session_id);
                shared.state.unregister_session(&session_id);
                let any_connected = shared
                    .registry
                    .iter()
                    .any(|entry| entry.status().snapshot().connected);
                if !any_connected {
                    shared.state.set_disconnected(!resources_freed);
                }
                info!("session {} removed ({})", session_id, reason);
            }
        }
    }
}

/// Collects sessions the ordinary timers missed: zombies stuck half-way
/// through a connect, and idle leftovers with no WebSockets and no grace
/// timer.
async fn run_sweeper(shared: std::sync::Weak<Shared>) {
    let period = match shared.upgrade() {
        Some(shared) => shared.config.sweep_interval,
        None => return,
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };

        let mut victims = Vec::new();
        for entry in shared.registry.iter() {
            if entry.is_closed() {
                continue;
            }
            let snapshot = entry.status().snapshot();
            let idle = entry.status().idle();
            let zombie = snapshot.has_transport
                && !snapshot.connected
                && !snapshot.grace_period_active
                && idle > shared.config.zombie_threshold;
            let stale = snapshot.active_websockets == 0
                && !snapshot.grace_period_active
                && idle > shared.config.idle_timeout + shared.config.stale_margin;
            if zombie {
                victims.push((entry.value().clone(), "zombie session"));
            } else if stale {
                victims.push((entry.value().clone(), "stale session"));
            }
        }

        for (handle, reason) in victims {
            warn!("sweeper collecting session {} ({})", handle.id(), reason);
            handle.force_cleanup(reason).await;
            shared.registry.remove(handle.id());
            shared.state.unregister_session(handle.id());
        }
    }
}
