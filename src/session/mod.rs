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

//! Device sessions.
//!
//! A session is one open transport plus the reader draining it, held in a
//! connection slot. The [`SessionManager`] keeps the slots and routes all
//! opens and writes through the serial executor.

mod manager;
mod slot;
pub mod wire;

pub use manager::SessionManager;
pub use slot::{ConnectionSlot, InstallOutcome, ReaderTask, SlotId, SlotState, SlotTable, Teardown};
