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

//! StepSnap Common - Shared functionality for StepSnap components
//!
//! This crate provides the data model shared by the engine, the CLI and the
//! test harness: execution snapshots, breakpoint specifications, configuration,
//! logging setup and the process-wide session id allocator.

/// Common types used throughout StepSnap including snapshots and breakpoint specifications
pub mod types;

/// Session id and debug port allocation shared by all sessions of a process
pub mod allocator;
/// Configuration file handling and default settings
pub mod config;
/// Logging setup and utilities for consistent logging across StepSnap components
pub mod logging;

pub use allocator::*;
pub use config::*;
pub use logging::*;
