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

//! Error types shared across the crate.

use thiserror::Error;

/// Errors reported synchronously to the caller of a gateway command.
///
/// Each variant maps onto the `(code, message)` pair the channel protocol
/// expects, see [`GatewayError::code`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("Bluetooth is unavailable")]
    BluetoothUnavailable,

    #[error("Argument '{0}' not found")]
    InvalidArgument(&'static str),

    #[error("{0}")]
    StartScan(String),

    #[error("This app requires location permissions for scanning")]
    NoPermissions,

    #[error("Bytes param is empty")]
    BytesEmpty,

    #[error("Method '{0}' is not implemented")]
    NotImplemented(String),
}

impl GatewayError {
    /// Error code as seen by the caller.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BluetoothUnavailable => "bluetooth_unavailable",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::StartScan(_) => "startScan",
            Self::NoPermissions => "no_permissions",
            Self::BytesEmpty => "bytes_empty",
            Self::NotImplemented(_) => "not_implemented",
        }
    }

    /// Human readable message sent along with the code.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Errors from the serial executor itself (not from the operations it runs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("executor has been shut down")]
    ShutDown,
}
