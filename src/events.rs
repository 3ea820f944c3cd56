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

//! Outbound notifications and the adapter state stream.

use futures::Stream;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bluetooth::DiscoveredDevice;
use crate::session::SlotId;

/// Notifications pushed to the consumer loop, independent of any request.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A named device was seen while scanning.
    ScanResult(DiscoveredDevice),
    /// Bytes read from an open session.
    DataReceived { slot: SlotId, bytes: Vec<u8> },
}

/// Sending side of the notification queue.
///
/// Posting never blocks; notifications are dropped once the consumer is gone.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: async_channel::Sender<Notification>,
}

impl NotificationSink {
    /// Create a sink and the receiver the consumer loop drains.
    pub fn channel() -> (Self, async_channel::Receiver<Notification>) {
        let (tx, rx) = async_channel::unbounded();
        (Self { tx }, rx)
    }

    /// Hand a notification over to the consumer.
    pub fn post(&self, notification: Notification) {
        if self.tx.try_send(notification).is_err() {
            debug!("Notification consumer is gone, dropping notification");
        }
    }
}

pin_project! {
    /// Subscription to adapter state codes.
    ///
    /// Yields adapter state codes, `1` when a device connects and `0` when it
    /// disconnects. Dropping the subscription (or calling [`cancel`]) stops the
    /// underlying event watch before returning.
    ///
    /// [`cancel`]: StateSubscription::cancel
    pub struct StateSubscription {
        #[pin]
        rx: async_channel::Receiver<i32>,
        forwarder: JoinHandle<()>,
    }

    impl PinnedDrop for StateSubscription {
        fn drop(this: Pin<&mut Self>) {
            this.project().forwarder.abort();
        }
    }
}

impl StateSubscription {
    pub(crate) fn new(rx: async_channel::Receiver<i32>, forwarder: JoinHandle<()>) -> Self {
        Self { rx, forwarder }
    }

    /// Stop delivery.
    pub fn cancel(self) {
        debug!("State subscription cancelled");
    }
}

impl Stream for StateSubscription {
    type Item = i32;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().rx.poll_next(cx)
    }
}
