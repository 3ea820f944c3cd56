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

//! Serialized Bluetooth device sessions.
//!
//! A [`gateway::Gateway`] accepts channel commands, a
//! [`session::SessionManager`] owns the connection slots and runs all device
//! I/O on a [`executor::SerialExecutor`], and [`bridge::Bridge`] exposes the
//! gateway over JSON lines.

pub mod bluetooth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod gateway;
pub mod session;
