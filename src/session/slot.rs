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

//! Connection slots.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bluetooth::{BoxedReader, TransportHandle};
use crate::events::{Notification, NotificationSink};

/// Identifier of a connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SlotId(pub u32);

impl SlotId {
    /// The only slot the gateway uses.
    pub const DEFAULT: SlotId = SlotId(0);
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    /// Open operation submitted, no transport yet.
    Connecting,
    Open,
}

/// Background loop forwarding inbound bytes of a session.
pub struct ReaderTask {
    handle: JoinHandle<()>,
}

impl ReaderTask {
    pub fn spawn(
        slot: SlotId,
        mut reader: BoxedReader,
        buffer_size: usize,
        notifications: NotificationSink,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; buffer_size.max(1)];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        info!("Session on slot {} closed by remote", slot);
                        break;
                    }
                    Ok(n) => {
                        debug!("Received {} bytes on slot {}", n, slot);
                        notifications.post(Notification::DataReceived {
                            slot,
                            bytes: buf[..n].to_vec(),
                        });
                    }
                    Err(e) => {
                        warn!("Read error on slot {}: {}", slot, e);
                        break;
                    }
                }
            }
        });

        Self { handle }
    }

    /// Best-effort cancel; a blocked read is dropped at its next poll.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One device session holder.
pub struct ConnectionSlot {
    id: SlotId,
    address: String,
    generation: u64,
    transport: Option<Arc<TransportHandle>>,
    reader: Option<ReaderTask>,
}

impl ConnectionSlot {
    fn new(id: SlotId, address: String, generation: u64) -> Self {
        Self {
            id,
            address,
            generation,
            transport: None,
            reader: None,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SlotState {
        if self.transport.is_some() {
            SlotState::Open
        } else {
            SlotState::Connecting
        }
    }

    fn into_teardown(self) -> Teardown {
        Teardown {
            slot: self.id,
            transport: self.transport,
            reader: self.reader,
        }
    }
}

/// Resources released from a slot, closed outside the table lock.
pub struct Teardown {
    slot: SlotId,
    transport: Option<Arc<TransportHandle>>,
    reader: Option<ReaderTask>,
}

impl Teardown {
    /// Cancel the reader, then close the transport.
    pub async fn run(self) {
        if let Some(reader) = self.reader {
            reader.cancel();
        }
        if let Some(transport) = self.transport {
            if let Err(e) = transport.close().await {
                warn!("Error closing session on slot {}: {:#}", self.slot, e);
            }
        }
    }
}

/// Result of installing an opened transport.
pub enum InstallOutcome {
    /// The slot now owns the transport. Carries whatever it held before.
    Installed(Option<Teardown>),
    /// The slot was cleared or reassigned since the open was submitted.
    Stale,
}

/// All slots, keyed by id.
pub struct SlotTable {
    slots: Mutex<HashMap<SlotId, ConnectionSlot>>,
    next_generation: AtomicU64,
}

impl SlotTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Assign `address` to a slot. Returns the new generation and whatever
    /// session the slot still held.
    pub fn begin(&self, id: SlotId, address: &str) -> (u64, Option<Teardown>) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let slot = ConnectionSlot::new(id, address.to_string(), generation);
        let previous = self.slots.lock().insert(id, slot);
        (generation, previous.map(ConnectionSlot::into_teardown))
    }

    /// Hand an opened transport to the slot if it still belongs to
    /// `generation`. The reader is only started when the install succeeds.
    pub fn install<F>(
        &self,
        id: SlotId,
        generation: u64,
        transport: Arc<TransportHandle>,
        start_reader: F,
    ) -> InstallOutcome
    where
        F: FnOnce() -> ReaderTask,
    {
        let mut slots = self.slots.lock();
        match slots.get_mut(&id) {
            Some(slot) if slot.generation == generation => {
                let replaced = if slot.transport.is_some() || slot.reader.is_some() {
                    Some(Teardown {
                        slot: id,
                        transport: slot.transport.take(),
                        reader: slot.reader.take(),
                    })
                } else {
                    None
                };
                slot.transport = Some(transport);
                slot.reader = Some(start_reader());
                InstallOutcome::Installed(replaced)
            }
            _ => InstallOutcome::Stale,
        }
    }

    /// Clear a slot whose open failed, unless it was reassigned meanwhile.
    pub fn abandon(&self, id: SlotId, generation: u64) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(&id) {
            Some(slot) if slot.generation == generation && slot.transport.is_none() => {
                slots.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Clear a slot.
    pub fn remove(&self, id: SlotId) -> Option<Teardown> {
        self.slots
            .lock()
            .remove(&id)
            .map(ConnectionSlot::into_teardown)
    }

    /// Clear every slot.
    pub fn drain(&self) -> Vec<Teardown> {
        self.slots
            .lock()
            .drain()
            .map(|(_, slot)| slot.into_teardown())
            .collect()
    }

    pub fn transport(&self, id: SlotId) -> Option<Arc<TransportHandle>> {
        self.slots.lock().get(&id).and_then(|slot| slot.transport.clone())
    }

    pub fn state(&self, id: SlotId) -> SlotState {
        self.slots
            .lock()
            .get(&id)
            .map(ConnectionSlot::state)
            .unwrap_or(SlotState::Empty)
    }

    pub fn address(&self, id: SlotId) -> Option<String> {
        self.slots.lock().get(&id).map(|slot| slot.address.clone())
    }

    /// Number of slots holding an open transport.
    pub fn open_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.transport.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}
