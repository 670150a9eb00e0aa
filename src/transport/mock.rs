// ble-bridge Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Deterministic in-memory [`Transport`] used by the test suite and by
//! hardware-free bridge deployments.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;

use crate::transport::{DeviceConfig, NotificationStream, ResourceState, Transport, TransportFactory};
use crate::{Error, Result};

/// Scripted, observable transport. Tests queue failures and inject notify
/// chunks; the session under test cannot tell it from the real radio.
pub struct MockTransport {
    device_name: String,
    connect_delay: Duration,
    write_delay: Duration,
    connect_failures: Mutex<VecDeque<Error>>,
    write_failures: AtomicUsize,
    fail_disconnect: AtomicBool,
    connected: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    forced_teardowns: AtomicUsize,
    adapter_resets: AtomicUsize,
    written: Mutex<Vec<Vec<u8>>>,
    notify_tx: broadcast::Sender<Vec<u8>>,
    link_down_tx: watch::Sender<bool>,
    resources: Mutex<ResourceState>,
    resources_after_reset: Mutex<Option<ResourceState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::named("Stub")
    }

    pub fn named(device_name: &str) -> Self {
        let (notify_tx, _) = broadcast::channel(256);
        let (link_down_tx, _) = watch::channel(false);
        MockTransport {
            device_name: device_name.to_string(),
            connect_delay: Duration::ZERO,
            write_delay: Duration::ZERO,
            connect_failures: Mutex::new(VecDeque::new()),
            write_failures: AtomicUsize::new(0),
            fail_disconnect: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            forced_teardowns: AtomicUsize::new(0),
            adapter_resets: AtomicUsize::new(0),
            written: Mutex::new(Vec::new()),
            notify_tx,
            link_down_tx,
            resources: Mutex::new(ResourceState::default()),
            resources_after_reset: Mutex::new(None),
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Queue an error for the next `connect` call.
    pub fn fail_next_connect(&self, err: Error) {
        self.connect_failures.lock().unwrap().push_back(err);
    }

    /// Make the next `n` writes fail with [`Error::WriteBusy`].
    pub fn fail_writes(&self, n: usize) {
        self.write_failures.store(n, Ordering::SeqCst);
    }

    /// Make `disconnect` fail so callers exercise the force path.
    pub fn fail_disconnect(&self) {
        self.fail_disconnect.store(true, Ordering::SeqCst);
    }

    /// Scripted resource probe result.
    pub fn set_resource_state(&self, state: ResourceState) {
        *self.resources.lock().unwrap() = state;
    }

    /// Resource probe result that takes effect after an adapter reset.
    pub fn set_resource_state_after_reset(&self, state: ResourceState) {
        *self.resources_after_reset.lock().unwrap() = Some(state);
    }

    /// Inject a raw notify chunk, as the peripheral would.
    pub fn push_notify(&self, chunk: &[u8]) {
        let _ = self.notify_tx.send(chunk.to_vec());
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn forced_teardown_count(&self) -> usize {
        self.forced_teardowns.load(Ordering::SeqCst)
    }

    pub fn adapter_reset_count(&self) -> usize {
        self.adapter_resets.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _config: &DeviceConfig) -> Result<String> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if let Some(err) = self.connect_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.link_down_tx.send(false);
        self.resources.lock().unwrap().peripherals = 1;
        Ok(self.device_name.clone())
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        let remaining = self.write_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.write_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::WriteBusy);
        }
        self.written.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(Error::Other("scripted disconnect failure".to_string()));
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.resources.lock().unwrap().peripherals = 0;
        }
        let _ = self.link_down_tx.send(true);
        Ok(())
    }

    async fn force_teardown(&self) {
        self.forced_teardowns.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.resources.lock().unwrap().peripherals = 0;
        let _ = self.link_down_tx.send(true);
    }

    async fn reset_adapter(&self) -> Result<()> {
        self.adapter_resets.fetch_add(1, Ordering::SeqCst);
        if let Some(state) = self.resources_after_reset.lock().unwrap().take() {
            *self.resources.lock().unwrap() = state;
        }
        Ok(())
    }

    async fn resource_state(&self) -> ResourceState {
        *self.resources.lock().unwrap()
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let chunks = BroadcastStream::new(self.notify_tx.subscribe())
            .filter_map(|chunk| futures::future::ready(chunk.ok()));
        let mut link_down = self.link_down_tx.subscribe();
        let until_down = async move {
            let _ = link_down.wait_for(|down| *down).await;
        };
        Ok(Box::pin(chunks.take_until(until_down)))
    }
}

/// Factory that hands every session the same scripted transport and
/// counts how many transports the registry asked for.
pub struct MockTransportFactory {
    transport: Arc<MockTransport>,
    creates: AtomicUsize,
}

impl MockTransportFactory {
    pub fn new(transport: Arc<MockTransport>) -> Self {
        MockTransportFactory {
            transport,
            creates: AtomicUsize::new(0),
        }
    }

    pub fn transport(&self) -> Arc<MockTransport> {
        Arc::clone(&self.transport)
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self) -> Arc<dyn Transport> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.transport()
    }
}
