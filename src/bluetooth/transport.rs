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

//! Raw byte transports.

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::debug;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A freshly opened connection, split into its two directions.
pub struct Transport {
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl Transport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Split a bidirectional stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }

    pub fn into_parts(self) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }
}

/// Write side of an open session, owned by a connection slot.
///
/// Closing interrupts a write that is stuck on a device which stopped reading.
pub struct TransportHandle {
    address: String,
    writer: Mutex<Option<BoxedWriter>>,
    closed: watch::Sender<bool>,
}

impl TransportHandle {
    pub fn new(address: impl Into<String>, writer: BoxedWriter) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            address: address.into(),
            writer: Mutex::new(Some(writer)),
            closed,
        }
    }

    /// Remote device address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Write all of `data` and flush.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            bail!("transport to {} is closed", self.address);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| anyhow!("transport to {} is closed", self.address))?;

        let send = async {
            writer.write_all(data).await?;
            writer.flush().await
        };
        let interrupted = async {
            let _ = closed.wait_for(|closed| *closed).await;
        };
        tokio::select! {
            result = send => {
                result.with_context(|| format!("failed to write to {}", self.address))?;
            }
            _ = interrupted => {
                bail!("transport to {} closed during write", self.address);
            }
        }
        debug!("Wrote {} bytes to {}", data.len(), self.address);
        Ok(())
    }

    /// Shut the write side down, aborting a pending write. Closing twice is a
    /// no-op.
    pub async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            writer
                .shutdown()
                .await
                .with_context(|| format!("failed to close transport to {}", self.address))?;
            debug!("Transport to {} closed", self.address);
        }
        Ok(())
    }

    pub async fn is_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }
}
