// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Session gateway.
//!
//! Validates commands coming from the channel, turns them into session
//! operations and turns adapter events into state codes.

mod scan;

pub use scan::ScanSession;

use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::bluetooth::{AdapterState, BackendConnector, BluetoothBackend, PermissionBroker};
use crate::config::SessionConfig;
use crate::error::GatewayError;
use crate::events::{Notification, NotificationSink, StateSubscription};
use crate::executor::OperationFailure;
use crate::session::{SessionManager, SlotId};

/// A command as received from the channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, args: Value) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }

    fn arg(&self, key: &str) -> Option<&Value> {
        self.args.get(key).filter(|value| !value.is_null())
    }
}

struct Bluetooth {
    backend: Arc<dyn BluetoothBackend>,
    session: Arc<SessionManager>,
}

/// Boundary between the channel and the session core.
pub struct Gateway {
    bluetooth: Option<Bluetooth>,
    permissions: Arc<dyn PermissionBroker>,
    notifications: NotificationSink,
    notification_rx: Option<async_channel::Receiver<Notification>>,
    scan: ScanSession,
}

impl Gateway {
    /// Create a gateway. `backend` is `None` when no adapter is present; every
    /// command except `isAvailable` then fails with `bluetooth_unavailable`.
    pub fn new(
        backend: Option<Arc<dyn BluetoothBackend>>,
        permissions: Arc<dyn PermissionBroker>,
        config: &SessionConfig,
    ) -> Self {
        let (notifications, notification_rx) = NotificationSink::channel();
        let bluetooth = backend.map(|backend| {
            let connector = Arc::new(BackendConnector(backend.clone()));
            let session = Arc::new(SessionManager::new(
                connector,
                notifications.clone(),
                config,
            ));
            Bluetooth { backend, session }
        });

        Self {
            bluetooth,
            permissions,
            notifications,
            notification_rx: Some(notification_rx),
            scan: ScanSession::new(),
        }
    }

    /// Take the notification receiver (can only be called once).
    pub fn take_notifications(&mut self) -> Option<async_channel::Receiver<Notification>> {
        self.notification_rx.take()
    }

    /// Failures of queued operations. `None` without an adapter.
    pub fn subscribe_failures(&self) -> Option<broadcast::Receiver<OperationFailure>> {
        self.bluetooth
            .as_ref()
            .map(|bluetooth| bluetooth.session.subscribe_failures())
    }

    /// Session manager behind the gateway.
    pub fn session(&self) -> Option<&Arc<SessionManager>> {
        self.bluetooth.as_ref().map(|bluetooth| &bluetooth.session)
    }

    fn bluetooth(&self) -> Result<&Bluetooth, GatewayError> {
        self.bluetooth
            .as_ref()
            .ok_or(GatewayError::BluetoothUnavailable)
    }

    /// Dispatch a channel command.
    pub async fn handle(&self, call: &MethodCall) -> Result<Value, GatewayError> {
        debug!("Handling method call: {}", call.method);

        if call.method == "isAvailable" {
            return Ok(json!(self.is_available()));
        }
        self.bluetooth()?;

        match call.method.as_str() {
            "state" => Ok(json!(self.state().await?.code())),
            "isOn" => Ok(json!(self.is_on().await?)),
            "isConnected" => Ok(json!(self.is_connected()?)),
            "startScan" => self.start_scan().await.map(|_| Value::Null),
            "stopScan" => self.stop_scan().map(|_| Value::Null),
            "connect" => {
                let address = call
                    .arg("address")
                    .and_then(Value::as_str)
                    .ok_or(GatewayError::InvalidArgument("address"))?;
                Ok(json!(self.connect(address).await?))
            }
            "disconnect" => Ok(json!(self.disconnect().await?)),
            "destroy" => Ok(json!(self.destroy().await?)),
            "writeData" => {
                let bytes = call.arg("bytes").ok_or(GatewayError::BytesEmpty)?;
                let values = bytes
                    .as_array()
                    .and_then(|values| values.iter().map(Value::as_i64).collect::<Option<Vec<_>>>())
                    .ok_or(GatewayError::InvalidArgument("bytes"))?;
                self.write_data(values)?;
                Ok(Value::Null)
            }
            other => Err(GatewayError::NotImplemented(other.to_string())),
        }
    }

    pub fn is_available(&self) -> bool {
        self.bluetooth.is_some()
    }

    pub async fn state(&self) -> Result<AdapterState, GatewayError> {
        self.bluetooth()?.backend.state().await.map_err(|e| {
            error!("Failed to read adapter state: {:#}", e);
            GatewayError::BluetoothUnavailable
        })
    }

    pub async fn is_on(&self) -> Result<bool, GatewayError> {
        self.bluetooth()?.backend.is_on().await.map_err(|e| {
            error!("Failed to read adapter power: {:#}", e);
            GatewayError::BluetoothUnavailable
        })
    }

    /// Whether an executor exists. This does not mean a transport is open.
    #[cfg(not(feature = "session-aware-is-connected"))]
    pub fn is_connected(&self) -> Result<bool, GatewayError> {
        Ok(self.bluetooth()?.session.is_executor_alive())
    }

    /// Whether the default slot holds an open transport.
    #[cfg(feature = "session-aware-is-connected")]
    pub fn is_connected(&self) -> Result<bool, GatewayError> {
        use crate::session::SlotState;
        Ok(self.bluetooth()?.session.slot_state(SlotId::DEFAULT) == SlotState::Open)
    }

    /// Start scanning, asking for permission first if needed.
    pub async fn start_scan(&self) -> Result<(), GatewayError> {
        let bluetooth = self.bluetooth()?;

        if !self.permissions.has_scan_permission() {
            info!("Scan permission missing, requesting it");
            if !self.permissions.request_scan_permission().await {
                warn!("Scan permission denied");
                return Err(GatewayError::NoPermissions);
            }
        }

        self.scan
            .start(bluetooth.backend.as_ref(), self.notifications.clone())
            .await
            .map_err(|e| {
                error!("Failed to start scan: {:#}", e);
                GatewayError::StartScan(e.to_string())
            })
    }

    pub fn stop_scan(&self) -> Result<(), GatewayError> {
        self.bluetooth()?;
        self.scan.stop();
        Ok(())
    }

    /// Replace the current session with one to `address`. Returns once the
    /// open is queued, not once it succeeded.
    pub async fn connect(&self, address: &str) -> Result<bool, GatewayError> {
        let session = &self.bluetooth()?.session;
        if let Err(e) = session.connect(SlotId::DEFAULT, address).await {
            error!("Could not queue open of {}: {}", address, e);
        }
        Ok(true)
    }

    pub async fn disconnect(&self) -> Result<bool, GatewayError> {
        Ok(self.bluetooth()?.session.disconnect(SlotId::DEFAULT).await)
    }

    pub async fn destroy(&self) -> Result<bool, GatewayError> {
        Ok(self.bluetooth()?.session.destroy().await)
    }

    /// Queue a write of byte values in `0..=255`.
    pub fn write_data(&self, values: Vec<i64>) -> Result<(), GatewayError> {
        let session = &self.bluetooth()?.session;
        if let Err(e) = session.write(SlotId::DEFAULT, values) {
            error!("Could not queue write: {}", e);
        }
        Ok(())
    }

    /// Subscribe to adapter state codes.
    ///
    /// Adapter state changes and device disconnects also release the current
    /// executor, so `isConnected` turns false.
    pub async fn listen(&self) -> Result<StateSubscription, GatewayError> {
        let bluetooth = self.bluetooth()?;
        let mut events = bluetooth.backend.events().await.map_err(|e| {
            error!("Failed to watch adapter events: {:#}", e);
            GatewayError::BluetoothUnavailable
        })?;

        let session = bluetooth.session.clone();
        let (tx, rx) = async_channel::unbounded();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                debug!("Adapter event: {:?}", event);
                if event.resets_executor() {
                    session.release_executor();
                }
                if tx.send(event.state_code()).await.is_err() {
                    break;
                }
            }
            debug!("Adapter event stream ended");
        });

        info!("State stream subscribed");
        Ok(StateSubscription::new(rx, forwarder))
    }

    /// Drop everything tied to the channel being attached.
    pub fn detach(&self) {
        self.scan.stop();
    }
}
