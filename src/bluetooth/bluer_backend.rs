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

//! BlueZ backend.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::{
    Adapter, AdapterProperty, Address, AddressType, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport, Session,
};
use futures::stream::{self, BoxStream, SelectAll};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::constants::SPP_UUID;
use super::{AdapterEvent, AdapterState, BluetoothBackend, DeviceType, DiscoveredDevice, Transport};
use crate::config::BluetoothConfig;

/// Adapter, scanner and RFCOMM connector backed by BlueZ.
pub struct BluerBackend {
    _session: Session,
    adapter: Adapter,
    rfcomm_channel: u8,
}

impl BluerBackend {
    /// Connect to BlueZ and pick the configured (or default) adapter.
    pub async fn new(config: &BluetoothConfig) -> Result<Self> {
        info!("Initializing Bluetooth backend...");

        // Create BlueZ session
        let session = Session::new().await.context("failed to connect to BlueZ")?;
        debug!("BlueZ session created");

        let adapter = match config.adapter.as_deref() {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!(
            "Using Bluetooth adapter: {} ({})",
            adapter.name(),
            adapter.address().await?
        );

        Ok(Self {
            _session: session,
            adapter,
            rfcomm_channel: config.rfcomm_channel,
        })
    }

    async fn describe(adapter: &Adapter, address: Address) -> Option<DiscoveredDevice> {
        let device = match adapter.device(address) {
            Ok(device) => device,
            Err(e) => {
                debug!("Lost device {} during scan: {}", address, e);
                return None;
            }
        };

        let name = device.name().await.unwrap_or_default();
        // BlueZ only knows a class of device from BR/EDR inquiry
        let has_class = matches!(device.class().await, Ok(Some(_)));
        let device_type = match device.address_type().await {
            Ok(address_type) => device_type_for(address_type, has_class),
            Err(_) => DeviceType::Unknown,
        };

        Some(DiscoveredDevice {
            address: address.to_string(),
            name,
            device_type,
        })
    }
}

#[async_trait]
impl BluetoothBackend for BluerBackend {
    async fn state(&self) -> Result<AdapterState> {
        Ok(state_for_powered(self.adapter.is_powered().await?))
    }

    async fn open(&self, address: &str) -> Result<Transport> {
        let target: Address = address
            .parse()
            .map_err(|_| anyhow!("invalid Bluetooth address '{}'", address))?;

        let device = self.adapter.device(target)?;
        if let Ok(Some(uuids)) = device.uuids().await {
            if !uuids.contains(&SPP_UUID) {
                warn!("{} does not advertise the serial port profile", address);
            }
        }

        info!("Opening RFCOMM channel {} to {}", self.rfcomm_channel, address);
        let stream = Stream::connect(SocketAddr::new(target, self.rfcomm_channel))
            .await
            .with_context(|| format!("failed to connect to {}", address))?;

        let (reader, writer) = stream.into_split();
        Ok(Transport::new(reader, writer))
    }

    async fn start_scan(&self) -> Result<BoxStream<'static, DiscoveredDevice>> {
        if !self.adapter.is_powered().await? {
            bail!("Bluetooth scanner unavailable. Is the adapter on?");
        }

        // BlueZ has no scan mode knob; an unfiltered active discovery is its
        // lowest latency setting.
        let filter = DiscoveryFilter {
            transport: DiscoveryTransport::Auto,
            ..Default::default()
        };
        self.adapter.set_discovery_filter(filter).await?;

        let discovery = self
            .adapter
            .discover_devices()
            .await
            .context("failed to start discovery")?;
        info!("Discovery started on {}", self.adapter.name());

        let adapter = self.adapter.clone();
        let results = discovery.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    bluer::AdapterEvent::DeviceAdded(address) => {
                        Self::describe(&adapter, address).await
                    }
                    _ => None,
                }
            }
        });

        Ok(results.boxed())
    }

    async fn events(&self) -> Result<BoxStream<'static, AdapterEvent>> {
        let adapter_events = self.adapter.events().await?.boxed();
        let mut watch = EventWatch {
            adapter: self.adapter.clone(),
            adapter_events,
            devices: SelectAll::new(),
        };

        for address in self.adapter.device_addresses().await? {
            watch.watch_device(address).await;
        }

        Ok(stream::unfold(watch, |mut watch| async move {
            let event = watch.next().await?;
            Some((event, watch))
        })
        .boxed())
    }
}

/// Merges adapter power changes with per-device connection changes.
struct EventWatch {
    adapter: Adapter,
    adapter_events: BoxStream<'static, bluer::AdapterEvent>,
    devices: SelectAll<BoxStream<'static, (Address, DeviceEvent)>>,
}

enum Step {
    Adapter(Option<bluer::AdapterEvent>),
    Device((Address, DeviceEvent)),
}

impl EventWatch {
    async fn watch_device(&mut self, address: Address) {
        let device = match self.adapter.device(address) {
            Ok(device) => device,
            Err(e) => {
                warn!("Cannot watch device {}: {}", address, e);
                return;
            }
        };

        match device.events().await {
            Ok(events) => self
                .devices
                .push(events.map(move |event| (address, event)).boxed()),
            Err(e) => warn!("Cannot watch device {}: {}", address, e),
        }
    }

    async fn next(&mut self) -> Option<AdapterEvent> {
        loop {
            let step = tokio::select! {
                event = self.adapter_events.next() => Step::Adapter(event),
                Some(event) = self.devices.next(), if !self.devices.is_empty() => Step::Device(event),
            };

            match step {
                Step::Adapter(None) => return None,
                Step::Adapter(Some(bluer::AdapterEvent::PropertyChanged(
                    AdapterProperty::Powered(powered),
                ))) => return Some(AdapterEvent::StateChanged(state_for_powered(powered))),
                Step::Adapter(Some(bluer::AdapterEvent::DeviceAdded(address))) => {
                    self.watch_device(address).await;
                }
                Step::Adapter(Some(_)) => {}
                Step::Device((address, DeviceEvent::PropertyChanged(DeviceProperty::Connected(true)))) => {
                    return Some(AdapterEvent::DeviceConnected(address.to_string()));
                }
                Step::Device((address, DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)))) => {
                    return Some(AdapterEvent::DeviceDisconnected(address.to_string()));
                }
                Step::Device(_) => {}
            }
        }
    }
}

fn state_for_powered(powered: bool) -> AdapterState {
    if powered {
        AdapterState::On
    } else {
        AdapterState::Off
    }
}

#[allow(unreachable_patterns)]
fn device_type_for(address_type: AddressType, has_class: bool) -> DeviceType {
    match address_type {
        AddressType::BrEdr => DeviceType::Classic,
        AddressType::LePublic | AddressType::LeRandom if has_class => DeviceType::Dual,
        AddressType::LePublic | AddressType::LeRandom => DeviceType::Le,
        _ => DeviceType::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_mapping() {
        assert_eq!(state_for_powered(true), AdapterState::On);
        assert_eq!(state_for_powered(false), AdapterState::Off);
    }

    #[test]
    fn test_device_type_mapping() {
        assert_eq!(device_type_for(AddressType::BrEdr, false), DeviceType::Classic);
        assert_eq!(device_type_for(AddressType::BrEdr, true), DeviceType::Classic);
        assert_eq!(device_type_for(AddressType::LePublic, false), DeviceType::Le);
        assert_eq!(device_type_for(AddressType::LeRandom, false), DeviceType::Le);
        assert_eq!(device_type_for(AddressType::LePublic, true), DeviceType::Dual);
        assert_eq!(device_type_for(AddressType::LeRandom, true), DeviceType::Dual);
    }
}
