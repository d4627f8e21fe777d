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

//! StepSnap Engine - Records the execution of a program through a debug adapter
//!
//! A [`Session`] launches the program under a debug backend (brought up by a
//! [`BackendAdapter`]), stops at every breakpoint or step, captures the stack,
//! scopes and variables of each stop as a snapshot, and finally compresses the
//! recording into consecutive [`Patch`] lists.

pub mod adapter;
pub use adapter::*;

pub mod breakpoint;
pub use breakpoint::InstalledBreakpoints;

pub mod dap;

pub mod error;
pub use error::*;

pub mod extract;
pub use extract::*;

pub mod lifecycle;
pub use lifecycle::*;

pub mod patch;
pub use patch::*;

pub mod session;
pub use session::*;
