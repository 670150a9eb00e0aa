// ble-bridge Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Production [`Transport`] bound to the OS central role through btleplug.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use log::{debug, info, trace, warn};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};

use crate::bleuuid::BleUuid;
use crate::config::BridgeConfig;
use crate::transport::{DeviceConfig, NotificationStream, ResourceState, Transport, TransportFactory};
use crate::{Error, Result};

/// Attempts at starting a scan while the adapter comes up. Some stacks
/// report transient failures for a second or two after power-on.
const SCAN_START_ATTEMPTS: usize = 6;
const SCAN_START_RETRY_DELAY: Duration = Duration::from_millis(500);

struct Link {
    adapter: Adapter,
    peripheral: Peripheral,
    write_char: Characteristic,
    notify_char: Characteristic,
}

/// [`Transport`] implementation over the platform adapter.
pub struct BtleTransport {
    scan_timeout: Duration,
    link: Mutex<Option<Link>>,
    scan_stop_listeners: AtomicUsize,
    discover_listeners: AtomicUsize,
}

impl BtleTransport {
    pub fn new(scan_timeout: Duration) -> Self {
        BtleTransport {
            scan_timeout,
            link: Mutex::new(None),
            scan_stop_listeners: AtomicUsize::new(0),
            discover_listeners: AtomicUsize::new(0),
        }
    }

    async fn first_adapter() -> Result<Adapter> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        adapters.into_iter().next().ok_or(Error::AdapterOff)
    }

    /// Start scanning, retrying while the adapter finishes powering on.
    async fn start_scan(&self, adapter: &Adapter, config: &DeviceConfig) -> Result<()> {
        let filter = ScanFilter {
            services: vec![config.service_uuid],
        };
        for attempt in 0..SCAN_START_ATTEMPTS {
            match adapter.start_scan(filter.clone()).await {
                Ok(()) => {
                    self.scan_stop_listeners.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(err) if attempt + 1 < SCAN_START_ATTEMPTS => {
                    debug!("start_scan attempt {} failed: {}", attempt + 1, err);
                    sleep(SCAN_START_RETRY_DELAY).await;
                }
                Err(err) => {
                    warn!("adapter refused to scan: {}", err);
                    return Err(Error::AdapterOff);
                }
            }
        }
        Err(Error::AdapterOff)
    }

    async fn stop_scan(&self, adapter: &Adapter) {
        if adapter.stop_scan().await.is_ok() {
            let _ = self
                .scan_stop_listeners
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
    }

    /// Whether a discovered peripheral satisfies the config: name-prefix
    /// match, exact id match, or any device when the prefix is empty (the
    /// scan filter has already narrowed by service).
    async fn matches(peripheral: &Peripheral, config: &DeviceConfig) -> bool {
        if config.device_prefix.is_empty() {
            return true;
        }
        if peripheral.id().to_string() == config.device_prefix {
            return true;
        }
        match peripheral.properties().await {
            Ok(Some(props)) => props
                .local_name
                .map(|name| name.starts_with(&config.device_prefix))
                .unwrap_or(false),
            _ => false,
        }
    }

    async fn wait_for_peripheral(
        &self,
        adapter: &Adapter,
        config: &DeviceConfig,
    ) -> Result<Peripheral> {
        let mut events = adapter.events().await?;
        let deadline = Instant::now() + self.scan_timeout;

        // Devices already in the cache never re-announce; check them first.
        for peripheral in adapter.peripherals().await.unwrap_or_default() {
            if Self::matches(&peripheral, config).await {
                return Ok(peripheral);
            }
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::ScanTimeout {
                    prefix: config.device_prefix.clone(),
                });
            }
            let event = match timeout(remaining, events.next()).await {
                Ok(Some(event)) => event,
                Ok(None) | Err(_) => {
                    return Err(Error::ScanTimeout {
                        prefix: config.device_prefix.clone(),
                    });
                }
            };
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };
            trace!("scan event for {:?}", id);
            if let Ok(peripheral) = adapter.peripheral(&id).await {
                if Self::matches(&peripheral, config).await {
                    return Ok(peripheral);
                }
            }
        }
    }

    /// Connect, discover, and subscribe on an already matched peripheral.
    async fn setup_link(
        &self,
        peripheral: &Peripheral,
        config: &DeviceConfig,
    ) -> Result<(Characteristic, Characteristic)> {
        peripheral.connect().await?;
        peripheral.discover_services().await?;
        self.discover_listeners.fetch_add(1, Ordering::Relaxed);

        let service = peripheral
            .services()
            .into_iter()
            .find(|service| service.uuid == config.service_uuid)
            .ok_or(Error::ServiceMissing(config.service_uuid))?;
        let write_char = service
            .characteristics
            .iter()
            .find(|c| c.uuid == config.write_uuid)
            .cloned()
            .ok_or(Error::CharacteristicMissing(config.write_uuid))?;
        let notify_char = service
            .characteristics
            .iter()
            .find(|c| c.uuid == config.notify_uuid)
            .cloned()
            .ok_or(Error::CharacteristicMissing(config.notify_uuid))?;

        peripheral.subscribe(&notify_char).await?;
        Ok((write_char, notify_char))
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn connect(&self, config: &DeviceConfig) -> Result<String> {
        let mut link = self.link.lock().await;
        if link.is_some() {
            return Err(Error::Other("transport already connected".to_string()));
        }

        let adapter = Self::first_adapter().await?;
        self.start_scan(&adapter, config).await?;

        let peripheral = match self.wait_for_peripheral(&adapter, config).await {
            Ok(peripheral) => peripheral,
            Err(err) => {
                self.stop_scan(&adapter).await;
                return Err(err);
            }
        };
        self.stop_scan(&adapter).await;

        let device_name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|props| props.local_name)
            .unwrap_or_else(|| peripheral.id().to_string());

        match self.setup_link(&peripheral, config).await {
            Ok((write_char, notify_char)) => {
                info!(
                    "connected to {} (service {})",
                    device_name,
                    config.service_uuid.to_short_string()
                );
                *link = Some(Link {
                    adapter,
                    peripheral,
                    write_char,
                    notify_char,
                });
                Ok(device_name)
            }
            Err(err) => {
                // Tear down whatever was half-built before propagating.
                let _ = peripheral.disconnect().await;
                self.discover_listeners.store(0, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(Error::NotConnected)?;
        link.peripheral
            .write(&link.write_char, data, WriteType::WithoutResponse)
            .await
            .map_err(map_write_error)
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.link.lock().await;
        let Some(link) = guard.take() else {
            return Ok(());
        };
        let _ = link.peripheral.unsubscribe(&link.notify_char).await;
        let result = link.peripheral.disconnect().await;
        self.stop_scan(&link.adapter).await;
        self.discover_listeners.store(0, Ordering::Relaxed);
        result.map_err(Error::from)
    }

    async fn force_teardown(&self) {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.take() {
            let _ = link.peripheral.unsubscribe(&link.notify_char).await;
            let _ = link.peripheral.disconnect().await;
            let _ = link.adapter.stop_scan().await;
        }
        self.scan_stop_listeners.store(0, Ordering::Relaxed);
        self.discover_listeners.store(0, Ordering::Relaxed);
    }

    async fn reset_adapter(&self) -> Result<()> {
        info!("resetting adapter");
        self.force_teardown().await;
        // Recreating the platform manager releases any cached handles the
        // stack still holds for this process.
        let adapter = Self::first_adapter().await?;
        let _ = adapter.stop_scan().await;
        Ok(())
    }

    async fn resource_state(&self) -> ResourceState {
        let peripherals = match self.link.lock().await.as_ref() {
            Some(link) => link
                .adapter
                .peripherals()
                .await
                .map(|list| list.len())
                .unwrap_or(0),
            None => 0,
        };
        ResourceState {
            peripherals,
            scan_stop_listeners: self.scan_stop_listeners.load(Ordering::Relaxed),
            discover_listeners: self.discover_listeners.load(Ordering::Relaxed),
        }
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(Error::NotConnected)?;
        let notify_uuid = link.notify_char.uuid;
        let stream = link.peripheral.notifications().await?;
        Ok(Box::pin(stream.filter_map(move |notification| {
            futures::future::ready(
                (notification.uuid == notify_uuid).then_some(notification.value),
            )
        })))
    }
}

/// Classify a write failure so the session can decide whether to retry.
fn map_write_error(err: btleplug::Error) -> Error {
    match err {
        btleplug::Error::NotConnected | btleplug::Error::DeviceNotFound => Error::Disconnected,
        btleplug::Error::Other(ref inner) => {
            let text = inner.to_string().to_ascii_lowercase();
            if text.contains("busy") || text.contains("in progress") {
                Error::WriteBusy
            } else {
                Error::Ble(err)
            }
        }
        btleplug::Error::RuntimeError(ref msg)
            if msg.to_ascii_lowercase().contains("busy")
                || msg.to_ascii_lowercase().contains("in progress") =>
        {
            Error::WriteBusy
        }
        other => Error::Ble(other),
    }
}

/// Factory handing each session a fresh [`BtleTransport`].
pub struct BtleTransportFactory {
    scan_timeout: Duration,
}

impl BtleTransportFactory {
    pub fn new(config: &BridgeConfig) -> Self {
        BtleTransportFactory {
            scan_timeout: config.scan_timeout,
        }
    }
}

impl TransportFactory for BtleTransportFactory {
    fn create(&self) -> Arc<dyn Transport> {
        Arc::new(BtleTransport::new(self.scan_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_errors_are_classified_for_retry() {
        assert!(matches!(
            map_write_error(btleplug::Error::NotConnected),
            Error::Disconnected
        ));
        assert!(matches!(
            map_write_error(btleplug::Error::DeviceNotFound),
            Error::Disconnected
        ));
        assert!(matches!(
            map_write_error(btleplug::Error::RuntimeError("operation busy".to_string())),
            Error::WriteBusy
        ));
        assert!(matches!(
            map_write_error(btleplug::Error::RuntimeError("gatt failure".to_string())),
            Error::Ble(_)
        ));
        assert!(map_write_error(btleplug::Error::NotConnected).is_transient_write());
    }
}
