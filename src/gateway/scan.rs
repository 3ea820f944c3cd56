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

//! Scan session.

use anyhow::Result;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bluetooth::BluetoothBackend;
use crate::events::{Notification, NotificationSink};

/// Forwards named scan results while a scan is running.
#[derive(Default)]
pub struct ScanSession {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ScanSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start scanning, replacing a scan that is already running.
    pub async fn start(&self, backend: &dyn BluetoothBackend, sink: NotificationSink) -> Result<()> {
        self.stop();

        let mut results = backend.start_scan().await?;
        let task = tokio::spawn(async move {
            while let Some(device) = results.next().await {
                if device.display_name().is_some() {
                    debug!("Scan result: {} ({:?})", device.address, device.name);
                    sink.post(Notification::ScanResult(device));
                } else {
                    debug!("Ignoring unnamed device {}", device.address);
                }
            }
            debug!("Scan result stream ended");
        });

        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        info!("Scan started");
        Ok(())
    }

    /// Stop scanning. Returns false if no scan was running.
    pub fn stop(&self) -> bool {
        match self.task.lock().take() {
            Some(task) => {
                task.abort();
                info!("Scan stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
