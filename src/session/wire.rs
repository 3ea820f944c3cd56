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

//! Conversion of caller byte values to wire bytes.
//!
//! Callers send unsigned values in `0..=255`. The device side expects signed
//! bytes, so anything above 127 becomes `value - 256`.

use anyhow::{bail, Result};

/// Convert one caller value into a signed wire byte.
pub fn to_wire_byte(value: i64) -> Result<i8> {
    if !(0..=255).contains(&value) {
        bail!("byte value {} is outside 0..=255", value);
    }
    let signed = if value > 127 { value - 256 } else { value };
    Ok(signed as i8)
}

/// Convert a whole payload. Fails on the first out-of-range value.
pub fn to_wire_bytes(values: &[i64]) -> Result<Vec<i8>> {
    values.iter().map(|value| to_wire_byte(*value)).collect()
}

/// Raw octets to put on the transport.
pub fn to_octets(bytes: &[i8]) -> Vec<u8> {
    bytes.iter().map(|byte| *byte as u8).collect()
}
