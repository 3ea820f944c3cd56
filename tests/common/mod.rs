//! Fake adapter and permission prompt shared by the integration tests.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use bluetooth_basic::bluetooth::{
    AdapterEvent, AdapterState, BluetoothBackend, DeviceType, DiscoveredDevice, PermissionBroker,
    Transport,
};
use bluetooth_basic::config::SessionConfig;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::DuplexStream;

/// In-memory adapter. Every opened transport is a duplex pipe whose far end
/// the test can take with [`FakeBackend::take_peer`].
pub struct FakeBackend {
    state: Mutex<Option<AdapterState>>,
    opens: Mutex<Vec<String>>,
    peers: Mutex<Vec<(String, DuplexStream)>>,
    unreachable: Mutex<HashSet<String>>,
    open_delay: Mutex<Duration>,
    scan_error: Mutex<Option<String>>,
    scans_started: AtomicUsize,
    opening: AtomicUsize,
    peak_opening: AtomicUsize,
    scan_tx: Mutex<Option<mpsc::UnboundedSender<DiscoveredDevice>>>,
    event_tx: Mutex<Option<mpsc::UnboundedSender<AdapterEvent>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Some(AdapterState::On)),
            opens: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
            unreachable: Mutex::new(HashSet::new()),
            open_delay: Mutex::new(Duration::ZERO),
            scan_error: Mutex::new(None),
            scans_started: AtomicUsize::new(0),
            opening: AtomicUsize::new(0),
            peak_opening: AtomicUsize::new(0),
            scan_tx: Mutex::new(None),
            event_tx: Mutex::new(None),
        }
    }

    /// `None` makes state queries fail.
    pub fn set_state(&self, state: Option<AdapterState>) {
        *self.state.lock() = state;
    }

    pub fn set_unreachable(&self, address: &str) {
        self.unreachable.lock().insert(address.to_string());
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    pub fn fail_scans(&self, message: &str) {
        *self.scan_error.lock() = Some(message.to_string());
    }

    /// Addresses passed to `open`, in call order.
    pub fn opens(&self) -> Vec<String> {
        self.opens.lock().clone()
    }

    /// Most opens that were ever in progress at the same time.
    pub fn peak_concurrent_opens(&self) -> usize {
        self.peak_opening.load(Ordering::SeqCst)
    }

    pub fn scans_started(&self) -> usize {
        self.scans_started.load(Ordering::SeqCst)
    }

    /// Far end of the oldest transport opened to `address`.
    pub fn take_peer(&self, address: &str) -> Option<DuplexStream> {
        let mut peers = self.peers.lock();
        let index = peers.iter().position(|(peer, _)| peer == address)?;
        Some(peers.remove(index).1)
    }

    /// Report a device on the running scan. False when no scan listens.
    pub fn discover(&self, address: &str, name: Option<&str>) -> bool {
        let device = DiscoveredDevice {
            address: address.to_string(),
            name: name.map(str::to_string),
            device_type: DeviceType::Classic,
        };
        match self.scan_tx.lock().as_ref() {
            Some(tx) => tx.unbounded_send(device).is_ok(),
            None => false,
        }
    }

    /// Deliver an adapter event. False when nobody watches.
    pub fn emit(&self, event: AdapterEvent) -> bool {
        match self.event_tx.lock().as_ref() {
            Some(tx) => tx.unbounded_send(event).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl BluetoothBackend for FakeBackend {
    async fn state(&self) -> Result<AdapterState> {
        match *self.state.lock() {
            Some(state) => Ok(state),
            None => bail!("adapter went away"),
        }
    }

    async fn open(&self, address: &str) -> Result<Transport> {
        self.opens.lock().push(address.to_string());
        let opening = self.opening.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_opening.fetch_max(opening, Ordering::SeqCst);

        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.opening.fetch_sub(1, Ordering::SeqCst);

        if self.unreachable.lock().contains(address) {
            bail!("host is down");
        }

        let (local, remote) = tokio::io::duplex(1024);
        self.peers.lock().push((address.to_string(), remote));
        Ok(Transport::from_stream(local))
    }

    async fn start_scan(&self) -> Result<BoxStream<'static, DiscoveredDevice>> {
        if let Some(message) = self.scan_error.lock().clone() {
            bail!(message);
        }
        self.scans_started.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded();
        *self.scan_tx.lock() = Some(tx);
        Ok(rx.boxed())
    }

    async fn events(&self) -> Result<BoxStream<'static, AdapterEvent>> {
        let (tx, rx) = mpsc::unbounded();
        *self.event_tx.lock() = Some(tx);
        Ok(rx.boxed())
    }
}

/// Permission prompt with a fixed answer.
pub struct FakePermissions {
    granted: AtomicBool,
    answer: bool,
    requests: AtomicUsize,
    prompt_time: Duration,
}

impl FakePermissions {
    pub fn new(granted: bool, answer: bool) -> Self {
        Self {
            granted: AtomicBool::new(granted),
            answer,
            requests: AtomicUsize::new(0),
            prompt_time: Duration::from_millis(5),
        }
    }

    /// The user takes `prompt_time` to answer.
    pub fn slow(answer: bool, prompt_time: Duration) -> Self {
        Self {
            prompt_time,
            ..Self::new(false, answer)
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionBroker for FakePermissions {
    fn has_scan_permission(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    async fn request_scan_permission(&self) -> bool {
        self.requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.prompt_time).await;
        if self.answer {
            self.granted.store(true, Ordering::SeqCst);
        }
        self.answer
    }
}

/// Session settings with a short drain period.
pub fn session_config() -> SessionConfig {
    SessionConfig {
        shutdown_grace_ms: 500,
        read_buffer_size: 64,
    }
}
