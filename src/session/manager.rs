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

//! Session manager: slot table plus the serial executor.

use anyhow::anyhow;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::slot::{InstallOutcome, ReaderTask, SlotId, SlotState, SlotTable};
use super::wire;
use crate::bluetooth::{Connector, TransportHandle};
use crate::config::SessionConfig;
use crate::error::ExecutorError;
use crate::events::NotificationSink;
use crate::executor::{OperationFailure, OperationKind, SerialExecutor};

/// Owns every device session and the executor that performs their I/O.
///
/// Teardown (`disconnect`, `destroy`) runs on the caller's task; open and
/// write run on the executor, one at a time. Only `destroy` retires the
/// executor, so there is never more than one worker doing device I/O.
pub struct SessionManager {
    connector: Arc<dyn Connector>,
    slots: Arc<SlotTable>,
    executor: Mutex<Option<Arc<SerialExecutor>>>,
    released: AtomicBool,
    failures: broadcast::Sender<OperationFailure>,
    notifications: NotificationSink,
    shutdown_grace: Duration,
    read_buffer_size: usize,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        notifications: NotificationSink,
        config: &SessionConfig,
    ) -> Self {
        let (failures, _) = broadcast::channel(64);
        Self {
            connector,
            slots: Arc::new(SlotTable::new()),
            executor: Mutex::new(None),
            released: AtomicBool::new(false),
            failures,
            notifications,
            shutdown_grace: config.shutdown_grace(),
            read_buffer_size: config.read_buffer_size,
        }
    }

    /// Executor, created on first use. Using it again clears a release.
    fn executor(&self) -> Arc<SerialExecutor> {
        let executor = self
            .executor
            .lock()
            .get_or_insert_with(|| {
                Arc::new(SerialExecutor::new(
                    self.failures.clone(),
                    self.shutdown_grace,
                ))
            })
            .clone();
        self.released.store(false, Ordering::SeqCst);
        executor
    }

    /// Executor currently in use, if any.
    pub fn current_executor(&self) -> Option<Arc<SerialExecutor>> {
        self.executor.lock().clone()
    }

    /// Whether an executor is in use and has not been released since.
    pub fn is_executor_alive(&self) -> bool {
        self.executor.lock().is_some() && !self.released.load(Ordering::SeqCst)
    }

    /// Mark the executor as released, so it no longer counts as alive.
    ///
    /// The worker keeps running and the next `connect` or `write` is queued
    /// behind whatever it still has to do.
    pub fn release_executor(&self) {
        if self.executor.lock().is_some() && !self.released.swap(true, Ordering::SeqCst) {
            debug!("Executor released");
        }
    }

    /// Receive failures of queued operations.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<OperationFailure> {
        self.failures.subscribe()
    }

    /// Replace the session of `slot` with one to `address`.
    ///
    /// Any prior session is torn down before this returns; the open itself
    /// is only queued.
    pub async fn connect(&self, slot: SlotId, address: &str) -> Result<(), ExecutorError> {
        self.disconnect(slot).await;

        let (generation, leftover) = self.slots.begin(slot, address);
        if let Some(leftover) = leftover {
            leftover.run().await;
        }

        let connector = self.connector.clone();
        let slots = self.slots.clone();
        let notifications = self.notifications.clone();
        let buffer_size = self.read_buffer_size;
        let address = address.to_string();

        info!("Queueing open of {} on slot {}", address, slot);
        self.executor()
            .submit(OperationKind::Open, slot, async move {
                let transport = match connector.open(&address).await {
                    Ok(transport) => transport,
                    Err(e) => {
                        slots.abandon(slot, generation);
                        return Err(e.context(format!("failed to open session to {}", address)));
                    }
                };

                let (reader, writer) = transport.into_parts();
                let handle = Arc::new(TransportHandle::new(address.clone(), writer));
                let outcome = slots.install(slot, generation, handle.clone(), || {
                    ReaderTask::spawn(slot, reader, buffer_size, notifications)
                });

                match outcome {
                    InstallOutcome::Installed(replaced) => {
                        if let Some(replaced) = replaced {
                            replaced.run().await;
                        }
                        info!("Session to {} open on slot {}", address, slot);
                    }
                    InstallOutcome::Stale => {
                        info!(
                            "Slot {} changed while opening {}, closing the new transport",
                            slot, address
                        );
                        handle.close().await?;
                    }
                }
                Ok(())
            })
    }

    /// Tear down the session of `slot`. Safe to call on an empty slot.
    pub async fn disconnect(&self, slot: SlotId) -> bool {
        if let Some(teardown) = self.slots.remove(slot) {
            teardown.run().await;
            info!("Slot {} disconnected", slot);
        }
        true
    }

    /// Queue a write of caller byte values (`0..=255`) to `slot`.
    ///
    /// Range errors and a missing session surface as operation failures, not
    /// as an error of this call.
    pub fn write(&self, slot: SlotId, values: Vec<i64>) -> Result<(), ExecutorError> {
        let slots = self.slots.clone();
        self.executor()
            .submit(OperationKind::Write, slot, async move {
                let bytes = wire::to_wire_bytes(&values)?;
                let transport = slots
                    .transport(slot)
                    .ok_or_else(|| anyhow!("no open session on slot {}", slot))?;
                transport.write(&wire::to_octets(&bytes)).await
            })
    }

    /// Disconnect every slot and shut the executor down.
    ///
    /// The next `connect` or `write` starts a new executor.
    pub async fn destroy(&self) -> bool {
        for teardown in self.slots.drain() {
            teardown.run().await;
        }

        let executor = self.executor.lock().take();
        self.released.store(false, Ordering::SeqCst);
        if let Some(executor) = executor {
            executor.shutdown().await;
        }
        info!("Sessions destroyed");
        true
    }

    /// Wait for everything queued so far.
    pub async fn flush(&self) {
        let executor = self.current_executor();
        if let Some(executor) = executor {
            if let Err(e) = executor.flush().await {
                debug!("Flush skipped: {}", e);
            }
        }
    }

    pub fn slot_state(&self, slot: SlotId) -> SlotState {
        self.slots.state(slot)
    }

    pub fn slot_address(&self, slot: SlotId) -> Option<String> {
        self.slots.address(slot)
    }

    /// Number of slots with an open transport.
    pub fn open_sessions(&self) -> usize {
        self.slots.open_count()
    }
}
