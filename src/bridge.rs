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

//! JSON-lines bridge between a caller and the [`Gateway`].
//!
//! Every input line is a request, every output line is a response or an
//! event frame:
//!
//! ```text
//! -> {"id":1,"method":"connect","args":{"address":"00:11:22:33:44:55"}}
//! <- {"id":1,"result":true}
//! <- {"event":"state","value":12}
//! ```

use anyhow::{anyhow, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::events::{Notification, StateSubscription};
use crate::executor::OperationFailure;
use crate::gateway::{Gateway, MethodCall};

/// Subscribe to the adapter state stream.
pub const METHOD_LISTEN: &str = "listen";
/// Drop the adapter state stream subscription.
pub const METHOD_CANCEL: &str = "cancel";
/// Answered off the request loop, since it may wait on a permission prompt.
const METHOD_START_SCAN: &str = "startScan";

/// A request line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// An output line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Frame {
    Result { id: Value, result: Value },
    Error { id: Value, error: ErrorBody },
    State { event: &'static str, value: i32 },
    Event { event: &'static str, args: Value },
}

impl Frame {
    pub fn result(id: Value, result: Value) -> Self {
        Self::Result { id, result }
    }

    pub fn error(id: Value, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    pub fn gateway_error(id: Value, err: &GatewayError) -> Self {
        Self::error(id, err.code(), err.message())
    }

    pub fn state(value: i32) -> Self {
        Self::State {
            event: "state",
            value,
        }
    }

    pub fn notification(notification: &Notification) -> Self {
        match notification {
            Notification::ScanResult(device) => Self::Event {
                event: "ScanResult",
                args: json!(device),
            },
            Notification::DataReceived { slot, bytes } => Self::Event {
                event: "DataReceived",
                args: json!({ "slot": slot, "bytes": bytes }),
            },
        }
    }

    pub fn failure(failure: &OperationFailure) -> Self {
        Self::Event {
            event: "OperationFailed",
            args: json!({
                "operation": failure.kind.as_str(),
                "slot": failure.slot,
                "message": failure.message,
            }),
        }
    }

    /// Serialize to JSON string with newline delimiter.
    pub fn to_json(&self) -> Result<String> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{}\n", json))
    }
}

type Subscription = Option<Pin<Box<StateSubscription>>>;

/// Drives a [`Gateway`] from a line-based input and output.
///
/// Requests are answered in order, except `startScan`, whose reply is
/// written once the scan is running. Other requests are served meanwhile.
pub struct Bridge {
    gateway: Arc<Gateway>,
    notifications: Option<async_channel::Receiver<Notification>>,
}

impl Bridge {
    pub fn new(mut gateway: Gateway) -> Self {
        let notifications = gateway.take_notifications();
        Self {
            gateway: Arc::new(gateway),
            notifications,
        }
    }

    /// Serve requests until the input closes or `shutdown` resolves, then
    /// stop scanning and destroy all sessions.
    pub async fn run<R, W, S>(mut self, input: R, mut output: W, shutdown: S) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        S: Future<Output = ()>,
    {
        let notifications = self
            .notifications
            .take()
            .ok_or_else(|| anyhow!("notification receiver already taken"))?;
        let mut failures = self.gateway.subscribe_failures();
        let mut subscription: Subscription = None;
        let mut pending_replies = JoinSet::new();
        let mut lines = input.lines();
        tokio::pin!(shutdown);

        info!("Bridge running");
        let result = loop {
            let frame = tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => {
                        let frame = self
                            .handle_line(&line, &mut subscription, &mut pending_replies)
                            .await;
                        match frame {
                            Some(frame) => frame,
                            None => continue,
                        }
                    }
                    Ok(None) => {
                        info!("Input closed");
                        break Ok(());
                    }
                    Err(e) => break Err(e.into()),
                },
                Ok(notification) = notifications.recv() => Frame::notification(&notification),
                Some(code) = next_state(&mut subscription) => Frame::state(code),
                Some(failure) = next_failure(&mut failures) => Frame::failure(&failure),
                Some(joined) = pending_replies.join_next() => match joined {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Request task failed: {}", e);
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
            };

            if let Err(e) = write_frame(&mut output, &frame).await {
                break Err(e);
            }
        };

        pending_replies.abort_all();
        drop(subscription);
        self.gateway.detach();
        if self.gateway.is_available() {
            if let Err(e) = self.gateway.destroy().await {
                warn!("Failed to destroy sessions: {}", e);
            }
        }
        info!("Bridge stopped");
        result
    }

    /// Answer a request line. `None` when the reply comes from `pending`.
    async fn handle_line(
        &self,
        line: &str,
        subscription: &mut Subscription,
        pending: &mut JoinSet<Frame>,
    ) -> Option<Frame> {
        let request: Request = match serde_json::from_str(line.trim()) {
            Ok(request) => request,
            Err(e) => {
                warn!("Invalid request: {}", e);
                return Some(Frame::error(Value::Null, "invalid_request", e.to_string()));
            }
        };

        if request.method == METHOD_START_SCAN {
            let gateway = self.gateway.clone();
            pending.spawn(async move {
                let call = MethodCall::new(request.method, request.args);
                reply(&gateway, request.id, &call).await
            });
            return None;
        }

        let frame = match request.method.as_str() {
            METHOD_LISTEN => match self.gateway.listen().await {
                Ok(stream) => {
                    // Replacing drops the previous subscription
                    *subscription = Some(Box::pin(stream));
                    Frame::result(request.id, Value::Null)
                }
                Err(e) => Frame::gateway_error(request.id, &e),
            },
            METHOD_CANCEL => {
                if subscription.take().is_some() {
                    debug!("State subscription cancelled");
                }
                Frame::result(request.id, Value::Null)
            }
            _ => {
                let call = MethodCall::new(request.method, request.args);
                reply(&self.gateway, request.id, &call).await
            }
        };
        Some(frame)
    }
}

async fn reply(gateway: &Gateway, id: Value, call: &MethodCall) -> Frame {
    match gateway.handle(call).await {
        Ok(result) => Frame::result(id, result),
        Err(e) => {
            debug!("{} failed: {}", call.method, e);
            Frame::gateway_error(id, &e)
        }
    }
}

async fn next_state(subscription: &mut Subscription) -> Option<i32> {
    let Some(stream) = subscription.as_mut() else {
        return pending().await;
    };
    let code = stream.next().await;
    if code.is_none() {
        debug!("State stream ended");
        *subscription = None;
    }
    code
}

async fn next_failure(
    failures: &mut Option<broadcast::Receiver<OperationFailure>>,
) -> Option<OperationFailure> {
    let Some(receiver) = failures.as_mut() else {
        return pending().await;
    };
    loop {
        match receiver.recv().await {
            Ok(failure) => return Some(failure),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Dropped {} operation failures", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                *failures = None;
                return None;
            }
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(output: &mut W, frame: &Frame) -> Result<()> {
    output.write_all(frame.to_json()?.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}
