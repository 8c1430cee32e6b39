//! Generic BLE peripheral client (spec §4.2): connect, subscribe to one
//! notify characteristic, forward raw notification payloads on a bounded
//! channel, and reconnect with exponential backoff on unexpected disconnect.
//!
//! `TimerClient` and `SensorClient` are thin wrappers that attach a parser;
//! this module owns nothing vendor-specific. Service/characteristic UUIDs
//! come from `Config`, never from a constant here.

use std::str::FromStr;
use std::time::Duration;

use btleplug::api::{BDAddr, Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bridge_types::{DeviceStatus, DeviceStatusKind};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TransportError;

#[derive(Debug, Clone)]
pub struct BleClientConfig {
    pub device_id: String,
    pub service_uuid: Uuid,
    pub notify_uuid: Uuid,
    pub connect_deadline: Duration,
    pub backoff_initial: Duration,
    pub backoff_cap: Duration,
}

/// Owns the connect/subscribe/reconnect lifecycle for one BLE peripheral.
pub struct BleClient {
    config: BleClientConfig,
    status_tx: mpsc::Sender<DeviceStatus>,
}

impl BleClient {
    pub fn new(config: BleClientConfig, status_tx: mpsc::Sender<DeviceStatus>) -> Self {
        Self { config, status_tx }
    }

    /// Runs until `shutdown` is signaled. Every unexpected disconnect is
    /// retried with exponential backoff (capped), forever, per spec §4.2 —
    /// this never returns an error to the caller; it logs and keeps going.
    pub async fn run(&self, raw_tx: mpsc::Sender<Vec<u8>>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.config.backoff_initial;
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.connect_and_stream(&raw_tx, &mut shutdown).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(device_id = %self.config.device_id, error = %err, "BLE session ended, reconnecting");
                    self.publish_status(DeviceStatusKind::Disconnected, serde_json::json!({ "error": err.to_string() }))
                        .await;
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => return,
                    }
                    backoff = (backoff * 2).min(self.config.backoff_cap);
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        raw_tx: &mpsc::Sender<Vec<u8>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        self.publish_status(DeviceStatusKind::Connecting, serde_json::Value::Null)
            .await;

        let manager = Manager::new().await?;
        let adapter = first_adapter(&manager).await?;
        let peripheral = self.find_peripheral(&adapter).await?;

        match tokio::time::timeout(self.config.connect_deadline, self.connect_and_subscribe(&peripheral)).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::ConnectTimeout(self.config.device_id.clone())),
        }

        info!(device_id = %self.config.device_id, "BLE device connected and subscribed");
        self.publish_status(DeviceStatusKind::Connected, serde_json::Value::Null)
            .await;

        let mut notifications = peripheral.notifications().await?;
        loop {
            tokio::select! {
                maybe_data = notifications.next() => {
                    match maybe_data {
                        Some(data) => {
                            if raw_tx.send(data.value).await.is_err() {
                                // Downstream task loop exited; nothing left to feed.
                                return Ok(());
                            }
                        }
                        None => return Err(TransportError::TransportUnavailable),
                    }
                }
                _ = shutdown.changed() => {
                    let _ = peripheral.disconnect().await;
                    return Ok(());
                }
            }
        }
    }

    /// Connect, discover services, and subscribe to the notify characteristic.
    /// Wrapped by `connect_and_stream` in an overall deadline — a peripheral
    /// that accepts the connection but never finishes GATT discovery would
    /// otherwise hang this task forever instead of retrying with backoff.
    async fn connect_and_subscribe(&self, peripheral: &Peripheral) -> Result<(), TransportError> {
        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == self.config.notify_uuid)
            .ok_or_else(|| TransportError::CharacteristicMissing(self.config.notify_uuid.to_string()))?;
        peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn find_peripheral(&self, adapter: &Adapter) -> Result<Peripheral, TransportError> {
        let target = BDAddr::from_str(&self.config.device_id)
            .map_err(|_| TransportError::DeviceNotFound(self.config.device_id.clone()))?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(TransportError::Btleplug)?;

        let deadline = Instant::now() + self.config.connect_deadline;
        loop {
            let peripherals = adapter.peripherals().await?;
            if let Some(peripheral) = peripherals.into_iter().find(|p| p.address() == target) {
                return Ok(peripheral);
            }
            if Instant::now() >= deadline {
                return Err(TransportError::DeviceNotFound(self.config.device_id.clone()));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn publish_status(&self, kind: DeviceStatusKind, payload: serde_json::Value) {
        debug!(device_id = %self.config.device_id, ?kind, "status transition");
        let status = DeviceStatus {
            device_id: self.config.device_id.clone(),
            ts_wall_ms: chrono::Utc::now().timestamp_millis(),
            kind,
            payload,
        };
        let _ = self.status_tx.send(status).await;
    }
}

async fn first_adapter(manager: &Manager) -> Result<Adapter, TransportError> {
    manager
        .adapters()
        .await
        .map_err(TransportError::Btleplug)?
        .into_iter()
        .next()
        .ok_or(TransportError::TransportUnavailable)
}
