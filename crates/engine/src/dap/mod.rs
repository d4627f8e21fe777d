// StepSnap - Execution snapshot recorder for debug adapters
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Debug adapter protocol client
//!
//! - [`types`]: the protocol messages and bodies the engine uses
//! - [`codec`]: `Content-Length` framing
//! - [`client`]: the [`DebugClient`] trait and the event fan-out
//! - [`socket`]: [`DapClient`], a client over TCP

pub mod client;
pub mod codec;
pub mod socket;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use client::*;
pub use socket::DapClient;
pub use types::*;
