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

//! Error types of the engine.
//!
//! Only [`SessionError::Configuration`], [`SessionError::SourceRead`] and
//! [`SessionError::BackendConnect`] ever reach the caller of a session start.
//! Everything else is absorbed by the stepping loop and logged.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::patch::PatchError;

/// Errors raised by a debug adapter client.
#[derive(Debug, Error)]
pub enum DapError {
    /// Reading from or writing to the transport failed.
    #[error("debug adapter transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be framed, encoded or decoded.
    #[error("malformed debug adapter message: {0}")]
    Codec(String),

    /// A complete frame whose body is not a protocol message. The stream is
    /// still positioned at the next frame.
    #[error("undecodable debug adapter message: {0}")]
    Undecodable(String),

    /// The backend did not answer a request in time.
    #[error("request `{command}` timed out after {timeout:?}")]
    Timeout {
        /// Command of the request.
        command: String,
        /// How long the client waited.
        timeout: Duration,
    },

    /// The backend answered a request with `success: false`.
    #[error("request `{command}` failed: {message}")]
    ErrorResponse {
        /// Command of the request.
        command: String,
        /// Message reported by the backend.
        message: String,
    },

    /// The transport is closed.
    #[error("debug adapter disconnected")]
    Disconnected,
}

impl From<serde_json::Error> for DapError {
    fn from(error: serde_json::Error) -> Self {
        Self::Codec(error.to_string())
    }
}

/// Errors of a debugging session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Bad source path, unsupported extension or invalid settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The source file could not be read.
    #[error("cannot read source file {path:?}: {source}")]
    SourceRead {
        /// Path of the source file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The adapter failed to spawn, connect or initialize its backend.
    #[error("failed to connect to the debug backend: {0}")]
    BackendConnect(eyre::Report),

    /// A snapshot could not be extracted.
    #[error("snapshot extraction failed: {0}")]
    Extraction(#[source] DapError),

    /// A step or continue request failed.
    #[error("`{command}` failed: {source}")]
    Step {
        /// Command of the failed request.
        command: &'static str,
        /// Underlying client error.
        #[source]
        source: DapError,
    },

    /// The session exceeded its wall-clock budget.
    #[error("time limit of {} seconds exceeded", .0.as_secs())]
    Timeout(Duration),

    /// A cleanup action failed.
    #[error("teardown failed: {0}")]
    Teardown(String),

    /// The recording could not be compressed.
    #[error(transparent)]
    Compression(#[from] PatchError),

    /// The session task panicked or was cancelled.
    #[error("session task aborted: {0}")]
    Aborted(String),
}

impl SessionError {
    /// Whether this error prevents a session from starting.
    pub fn is_start_failure(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::SourceRead { .. } | Self::BackendConnect(_))
    }
}

/// Raised by adapters of compiled languages when the program does not build.
///
/// A session whose adapter fails with this error still starts, then terminates
/// right away with a `compilation` termination message.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CompilationError {
    /// Compiler diagnostics.
    pub message: String,
}
