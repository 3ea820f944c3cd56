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

//! Serial executor.
//!
//! A single worker task drains a FIFO queue of device operations, so at most
//! one open/write/close is in flight at any time.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ExecutorError;
use crate::session::SlotId;

/// Kind of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Open,
    Write,
    Close,
    /// Internal marker used by [`SerialExecutor::flush`].
    Barrier,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Write => "write",
            Self::Close => "close",
            Self::Barrier => "barrier",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed operation, published on the failure channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFailure {
    pub kind: OperationKind,
    pub slot: SlotId,
    pub message: String,
}

struct PendingOperation {
    kind: OperationKind,
    slot: SlotId,
    task: BoxFuture<'static, anyhow::Result<()>>,
}

/// Single-worker FIFO queue.
pub struct SerialExecutor {
    queue: Mutex<Option<mpsc::UnboundedSender<PendingOperation>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    grace: Duration,
}

impl SerialExecutor {
    /// Spawn the worker. Must be called from within a tokio runtime.
    ///
    /// Failed operations are logged and sent to `failures`; having no
    /// receivers on that channel is fine.
    pub fn new(failures: broadcast::Sender<OperationFailure>, grace: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::run(rx, failures));
        debug!("Serial executor started");

        Self {
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            grace,
        }
    }

    async fn run(
        mut rx: mpsc::UnboundedReceiver<PendingOperation>,
        failures: broadcast::Sender<OperationFailure>,
    ) {
        while let Some(op) = rx.recv().await {
            let PendingOperation { kind, slot, task } = op;
            debug!("Running {} operation on slot {}", kind, slot);

            let message = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(_) => "operation panicked".to_string(),
            };

            error!("{} operation on slot {} failed: {}", kind, slot, message);
            let _ = failures.send(OperationFailure {
                kind,
                slot,
                message,
            });
        }
        debug!("Serial executor worker exited");
    }

    /// Queue an operation behind everything submitted before it.
    pub fn submit<F>(&self, kind: OperationKind, slot: SlotId, task: F) -> Result<(), ExecutorError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let queue = self.queue.lock();
        let tx = queue.as_ref().ok_or(ExecutorError::ShutDown)?;
        tx.send(PendingOperation {
            kind,
            slot,
            task: task.boxed(),
        })
        .map_err(|_| ExecutorError::ShutDown)
    }

    /// Wait until every operation submitted before this call has finished.
    pub async fn flush(&self) -> Result<(), ExecutorError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(OperationKind::Barrier, SlotId::DEFAULT, async move {
            let _ = done_tx.send(());
            Ok(())
        })?;
        done_rx.await.map_err(|_| ExecutorError::ShutDown)
    }

    /// Whether the executor still accepts operations.
    pub fn is_running(&self) -> bool {
        self.queue.lock().is_some()
    }

    /// Stop accepting operations and release the worker.
    ///
    /// Queued work gets the grace period to drain, anything still running
    /// after that is cancelled.
    pub async fn shutdown(&self) {
        let Some(sender) = self.queue.lock().take() else {
            return;
        };
        drop(sender);

        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            match tokio::time::timeout(self.grace, &mut worker).await {
                Ok(_) => info!("Serial executor stopped"),
                Err(_) => {
                    warn!(
                        "Serial executor did not drain within {:?}, cancelling pending work",
                        self.grace
                    );
                    worker.abort();
                }
            }
        }
    }
}
