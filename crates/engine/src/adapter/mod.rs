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

//! Backend adapters
//!
//! A backend adapter knows how to bring up a debug backend for one language
//! and hand back a connected, initialized and launched [`DebugClient`]. It
//! also decides which frames, scopes and variables are worth expanding.
//!
//! The supported languages form a closed set, see [`Language`]. Adapters hold
//! no state shared between sessions.

mod lldb;
mod process;
mod python;

pub use lldb::LldbAdapter;
pub use process::{forward_output, spawn_adapter_server};
pub use python::PythonAdapter;

use std::{fmt, path::Path, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use stepsnap_common::{types::TerminationMessage, StepsnapConfig};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    dap::{DapScope, DapStackFrame, DapVariable, DebugClient, OutputEventBody},
    lifecycle::Cleanables,
    session::OutputBuffer,
    DapError, SessionError,
};

/// Channel through which adapters inject program output into the session.
pub type OutputSink = mpsc::UnboundedSender<OutputEventBody>;

/// Everything an adapter needs to bring up its backend
pub struct ConnectParams<'a> {
    /// Session id, also the TCP port the backend listens on
    pub uid: u16,
    /// Main source file of the program
    pub program_path: &'a Path,
    /// File fed to the program's standard input
    pub input_path: &'a Path,
    /// Resources to release on teardown
    pub cleanables: &'a mut Cleanables,
    /// Output produced outside of the debug adapter's `output` events
    pub output: OutputSink,
}

impl fmt::Debug for ConnectParams<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("uid", &self.uid)
            .field("program_path", &self.program_path)
            .field("input_path", &self.input_path)
            .finish_non_exhaustive()
    }
}

/// Which frames, scopes and variables the extractor may expand
pub trait DigPredicates: Send + Sync {
    /// Whether a frame of a tracked file may be expanded.
    fn can_dig_stack_frame(&self, _frame: &DapStackFrame) -> bool {
        true
    }

    /// Whether the variables of a scope are fetched.
    fn can_dig_scope(&self, _scope: &DapScope) -> bool {
        true
    }

    /// Whether a variable is kept and expanded.
    fn can_dig_variable(&self, _variable: &DapVariable) -> bool {
        true
    }
}

/// Strategy bringing up one kind of debug backend
#[async_trait]
pub trait BackendAdapter: DigPredicates {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Spawns the backend if needed, then returns a client that is connected,
    /// initialized and has launched the program. The program must not run
    /// before `configurationDone`.
    ///
    /// Adapters of compiled languages fail with
    /// [`CompilationError`](crate::CompilationError) when the program does
    /// not build.
    async fn connect(&self, params: ConnectParams<'_>) -> eyre::Result<Arc<dyn DebugClient>>;

    /// Custom termination message for an ended program. `None` falls back to
    /// the default end or error message.
    fn termination_message(
        &self,
        _output: &OutputBuffer,
        _exit_code: Option<i64>,
    ) -> Option<TerminationMessage> {
        None
    }

    /// Bytes read for variables exposing a memory reference, 0 disables reads.
    fn memory_read_bytes(&self) -> u32 {
        0
    }

    /// Backend specific cleanup, run last during teardown.
    async fn after_teardown(&self) {}
}

/// Sends `launch` from its own task.
///
/// Backends may answer the launch only after the configuration is done, so
/// the handshake often stops waiting for it. The task still reports a late
/// failure.
fn spawn_launch(
    client: &Arc<dyn DebugClient>,
    arguments: Value,
    backend: &'static str,
) -> JoinHandle<Result<(), DapError>> {
    let client = Arc::clone(client);
    tokio::spawn(async move {
        let launched = client.launch(arguments).await;
        match &launched {
            Ok(()) => debug!("{backend} launched the program"),
            // The session went away before the backend answered
            Err(DapError::Disconnected) => debug!("{backend} launch abandoned"),
            Err(e) => warn!("{backend} launch failed: {e}"),
        }
        launched
    })
}

/// Languages with a backend adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    /// C, debugged with CodeLLDB
    C,
    /// C++, debugged with CodeLLDB
    Cpp,
    /// Python, debugged with debugpy
    Python,
}

impl Language {
    /// Accepted source file extensions
    pub const EXTENSIONS: [&'static str; 3] = ["c", "cpp", "py"];

    /// Language of a source file, by extension.
    pub fn from_path(path: &Path) -> Result<Self, SessionError> {
        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or_default();
        match extension {
            "c" => Ok(Self::C),
            "cpp" => Ok(Self::Cpp),
            "py" => Ok(Self::Python),
            _ => Err(SessionError::Configuration(format!(
                "unsupported source file {path:?}, accepted extensions: {}",
                Self::EXTENSIONS.map(|ext| format!(".{ext}")).join(", ")
            ))),
        }
    }

    /// Identifier announced to the debug adapter
    pub fn adapter_id(&self) -> &'static str {
        match self {
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::Python => "python",
        }
    }
}

/// The adapter debugging `language`.
pub fn backend_for(language: Language, config: &StepsnapConfig) -> Arc<dyn BackendAdapter> {
    match language {
        Language::C | Language::Cpp => Arc::new(LldbAdapter::new(language, config)),
        Language::Python => Arc::new(PythonAdapter::new(config)),
    }
}

/// The adapter debugging the source file at `path`.
pub fn backend_for_source(
    path: &Path,
    config: &StepsnapConfig,
) -> Result<Arc<dyn BackendAdapter>, SessionError> {
    Ok(backend_for(Language::from_path(path)?, config))
}
