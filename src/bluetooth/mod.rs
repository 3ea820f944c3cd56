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

//! Bluetooth collaborators.
//!
//! The session core only talks to the adapter through [`BluetoothBackend`],
//! [`Connector`] and [`PermissionBroker`]. [`BluerBackend`] implements them on
//! top of BlueZ.

mod bluer_backend;
mod constants;
mod transport;

pub use bluer_backend::BluerBackend;
pub use constants::{DEFAULT_RFCOMM_CHANNEL, SPP_UUID};
pub use transport::{BoxedReader, BoxedWriter, Transport, TransportHandle};

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Serialize, Serializer};
use std::sync::Arc;

/// Adapter power state. Codes match the values the channel protocol carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Off,
    TurningOn,
    On,
    TurningOff,
    Unknown,
}

impl AdapterState {
    pub fn code(&self) -> i32 {
        match self {
            Self::Off => 10,
            Self::TurningOn => 11,
            Self::On => 12,
            Self::TurningOff => 13,
            Self::Unknown => 0,
        }
    }
}

/// Device transport type as reported with scan results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Unknown,
    Classic,
    Le,
    Dual,
}

impl DeviceType {
    pub fn code(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Classic => 1,
            Self::Le => 2,
            Self::Dual => 3,
        }
    }
}

impl Serialize for DeviceType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

/// A device seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
}

impl DiscoveredDevice {
    /// Name if it is present and non-empty.
    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.is_empty())
    }
}

/// Adapter and device events delivered on the state stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    StateChanged(AdapterState),
    DeviceConnected(String),
    DeviceDisconnected(String),
}

impl AdapterEvent {
    /// Integer pushed to state stream subscribers.
    pub fn state_code(&self) -> i32 {
        match self {
            Self::StateChanged(state) => state.code(),
            Self::DeviceConnected(_) => 1,
            Self::DeviceDisconnected(_) => 0,
        }
    }

    /// Whether the event invalidates the current executor.
    pub fn resets_executor(&self) -> bool {
        !matches!(self, Self::DeviceConnected(_))
    }
}

/// Opens transports to remote devices.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, address: &str) -> Result<Transport>;
}

/// The local Bluetooth adapter.
#[async_trait]
pub trait BluetoothBackend: Send + Sync {
    /// Current power state.
    async fn state(&self) -> Result<AdapterState>;

    async fn is_on(&self) -> Result<bool> {
        Ok(self.state().await? == AdapterState::On)
    }

    /// Open a raw byte transport to `address`.
    async fn open(&self, address: &str) -> Result<Transport>;

    /// Start a low-latency scan. Dropping the stream stops the scan.
    async fn start_scan(&self) -> Result<BoxStream<'static, DiscoveredDevice>>;

    /// Watch adapter and device events. Dropping the stream stops the watch.
    async fn events(&self) -> Result<BoxStream<'static, AdapterEvent>>;
}

/// [`Connector`] view over a backend.
pub struct BackendConnector(pub Arc<dyn BluetoothBackend>);

#[async_trait]
impl Connector for BackendConnector {
    async fn open(&self, address: &str) -> Result<Transport> {
        self.0.open(address).await
    }
}

/// Grants or denies the permission scanning needs.
#[async_trait]
pub trait PermissionBroker: Send + Sync {
    fn has_scan_permission(&self) -> bool;

    /// Prompt for the permission; resolves once the user answered.
    async fn request_scan_permission(&self) -> bool;
}

/// BlueZ scanning needs no extra permission.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrantedPermissions;

#[async_trait]
impl PermissionBroker for GrantedPermissions {
    fn has_scan_permission(&self) -> bool {
        true
    }

    async fn request_scan_permission(&self) -> bool {
        true
    }
}
