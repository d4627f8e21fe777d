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

//! Debug adapter protocol message types
//!
//! Only the subset of the protocol the engine speaks is modelled. Unknown
//! fields are ignored on the way in and optional fields are skipped on the way
//! out.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepsnap_common::types::Source;

/// Any message exchanged with a debug adapter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProtocolMessage {
    /// Request, sent by the client or, for reverse requests, by the adapter
    Request(Request),
    /// Response to a request
    Response(Response),
    /// Asynchronous notification from the adapter
    Event(Event),
}

/// DAP request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    /// Sequence number of the message
    pub seq: i64,
    /// Command to execute
    pub command: String,
    /// Command arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// DAP response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// Sequence number of the message
    pub seq: i64,
    /// Sequence number of the answered request
    pub request_seq: i64,
    /// Outcome of the request
    pub success: bool,
    /// Command of the answered request
    pub command: String,
    /// Error summary when `success` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Response {
    /// Human readable error of a failed response.
    ///
    /// Adapters put details either in `message` or in `body.error.format`.
    pub fn error_message(&self) -> String {
        self.body
            .as_ref()
            .and_then(|body| body.pointer("/error/format"))
            .and_then(Value::as_str)
            .or(self.message.as_deref())
            .unwrap_or("unknown error")
            .to_string()
    }
}

/// DAP event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Sequence number of the message
    pub seq: i64,
    /// Event name
    pub event: String,
    /// Event payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Arguments of the `initialize` request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitializeArguments {
    /// Identifier of the client
    #[serde(rename = "clientID")]
    pub client_id: String,
    /// Identifier of the adapter
    #[serde(rename = "adapterID")]
    pub adapter_id: String,
    /// Lines start at 1
    pub lines_start_at1: bool,
    /// Columns start at 1
    pub columns_start_at1: bool,
    /// Paths are native paths
    pub path_format: String,
    /// Client understands `runInTerminal`
    pub supports_run_in_terminal_request: bool,
    /// Client understands memory references
    pub supports_memory_references: bool,
    /// Client understands memory events
    pub supports_memory_event: bool,
    /// Client wants variable types
    pub supports_variable_type: bool,
}

impl InitializeArguments {
    /// Arguments announcing this client to adapter `adapter_id`.
    pub fn new(adapter_id: impl Into<String>) -> Self {
        Self {
            client_id: "stepsnap".to_string(),
            adapter_id: adapter_id.into(),
            lines_start_at1: true,
            columns_start_at1: true,
            path_format: "path".to_string(),
            supports_run_in_terminal_request: true,
            supports_memory_references: true,
            supports_memory_event: true,
            supports_variable_type: true,
        }
    }
}

/// Requested breakpoint location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceBreakpoint {
    /// 1-based line
    pub line: u32,
}

/// Arguments of the `setBreakpoints` request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointsArguments {
    /// File the breakpoints belong to
    pub source: Source,
    /// Full breakpoint set of the file, replacing the previous one
    pub breakpoints: Vec<SourceBreakpoint>,
}

/// Breakpoint as installed by the adapter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    /// Adapter-assigned id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Whether the breakpoint could be set
    pub verified: bool,
    /// Actual line, which may differ from the requested one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    /// Why the breakpoint is not verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of the `setBreakpoints` response
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetBreakpointsResponseBody {
    /// One entry per requested breakpoint, in request order
    #[serde(default)]
    pub breakpoints: Vec<Breakpoint>,
}

/// Raw stack frame as reported by `stackTrace`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DapStackFrame {
    /// Frame id
    pub id: i64,
    /// Frame name
    pub name: String,
    /// Source location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    /// 1-based line
    #[serde(default)]
    pub line: i64,
    /// 1-based column
    #[serde(default)]
    pub column: i64,
}

impl DapStackFrame {
    /// Path of the frame's source, if the adapter reported one.
    pub fn source_path(&self) -> Option<&str> {
        self.source.as_ref()?.path.as_deref()
    }
}

/// Body of the `stackTrace` response
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceResponseBody {
    /// Frames, innermost first
    #[serde(default)]
    pub stack_frames: Vec<DapStackFrame>,
}

/// Raw scope as reported by `scopes`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DapScope {
    /// Scope name
    pub name: String,
    /// Reference of the scope's variables
    pub variables_reference: i64,
    /// Whether retrieving the variables is expensive
    #[serde(default)]
    pub expensive: bool,
}

/// Body of the `scopes` response
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopesResponseBody {
    /// Scopes of the frame
    #[serde(default)]
    pub scopes: Vec<DapScope>,
}

/// Raw variable as reported by `variables`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DapVariable {
    /// Variable name
    pub name: String,
    /// Rendered value
    #[serde(default)]
    pub value: String,
    /// Declared type
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Expression evaluating to the variable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluate_name: Option<String>,
    /// Reference of the children, 0 for none
    #[serde(default)]
    pub variables_reference: i64,
    /// Memory location of the variable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_reference: Option<String>,
}

/// Body of the `variables` response
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariablesResponseBody {
    /// Children of the requested reference
    #[serde(default)]
    pub variables: Vec<DapVariable>,
}

/// Arguments of the `readMemory` request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadMemoryArguments {
    /// Where to read
    pub memory_reference: String,
    /// Byte offset from the reference
    pub offset: i64,
    /// Number of bytes to read
    pub count: u32,
}

/// Body of the `readMemory` response
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadMemoryResponseBody {
    /// Address of the first byte read
    pub address: String,
    /// Bytes that could not be read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unreadable_bytes: Option<i64>,
    /// Base64 encoded bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Granularity of a step request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SteppingGranularity {
    /// Statement
    Statement,
    /// Line
    Line,
    /// Machine instruction
    Instruction,
}

/// Arguments of `stepIn`, `next` and `stepOut`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StepArguments {
    /// Thread to step
    pub thread_id: i64,
    /// Step granularity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<SteppingGranularity>,
}

/// Arguments of `continue`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContinueArguments {
    /// Thread to resume
    pub thread_id: i64,
}

/// Body of the `stopped` event
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEventBody {
    /// Why execution stopped (`breakpoint`, `step`, `signal`, ...)
    pub reason: String,
    /// Stopped thread
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    /// Full reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Additional information, such as the signal name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Body of the `exited` event
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExitedEventBody {
    /// Exit code of the debuggee
    pub exit_code: i64,
}

/// Body of the `output` event
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputEventBody {
    /// `stdout`, `stderr`, `console`, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Output text
    pub output: String,
}

impl OutputEventBody {
    /// Program standard output
    pub fn stdout(output: impl Into<String>) -> Self {
        Self { category: Some("stdout".to_string()), output: output.into() }
    }

    /// Program standard error
    pub fn stderr(output: impl Into<String>) -> Self {
        Self { category: Some("stderr".to_string()), output: output.into() }
    }
}

/// Arguments of the `runInTerminal` reverse request
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunInTerminalArguments {
    /// `integrated` or `external`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Terminal title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Working directory
    #[serde(default)]
    pub cwd: String,
    /// Command line, program first
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment changes; `None` values unset a variable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, Option<String>>>,
}

/// Event delivered to subscribers of a debug client
#[derive(Debug, Clone, PartialEq)]
pub enum DebugEvent {
    /// The adapter is ready to accept configuration requests
    Initialized,
    /// Execution stopped
    Stopped(StoppedEventBody),
    /// Execution resumed
    Continued,
    /// The debuggee exited
    Exited(ExitedEventBody),
    /// The debug session ended
    Terminated,
    /// The debuggee or the adapter produced output
    Output(OutputEventBody),
    /// A thread started or exited
    Thread(Value),
    /// The adapter asks the client to run a command in a terminal
    RunInTerminal {
        /// Sequence number to answer with
        seq: i64,
        /// Command to run
        arguments: RunInTerminalArguments,
    },
    /// Any other event or reverse request
    Other {
        /// Event name or reverse request command
        name: String,
        /// Payload
        body: Option<Value>,
    },
}

impl DebugEvent {
    /// Decodes an adapter event. Bodies that do not match the expected shape
    /// degrade to [`DebugEvent::Other`].
    pub fn from_event(event: Event) -> Self {
        fn decode<T: serde::de::DeserializeOwned>(body: &Option<Value>) -> Option<T> {
            serde_json::from_value(body.clone().unwrap_or(Value::Null)).ok()
        }

        let decoded = match event.event.as_str() {
            "initialized" => Some(Self::Initialized),
            "continued" => Some(Self::Continued),
            "terminated" => Some(Self::Terminated),
            "stopped" => decode(&event.body).map(Self::Stopped),
            "exited" => decode(&event.body).map(Self::Exited),
            "output" => decode(&event.body).map(Self::Output),
            "thread" => Some(Self::Thread(event.body.clone().unwrap_or(Value::Null))),
            _ => None,
        };
        decoded.unwrap_or(Self::Other { name: event.event, body: event.body })
    }

    /// Decodes a reverse request sent by the adapter.
    pub fn from_reverse_request(request: Request) -> Self {
        if request.command == "runInTerminal" {
            if let Some(arguments) = request
                .arguments
                .clone()
                .and_then(|arguments| serde_json::from_value(arguments).ok())
            {
                return Self::RunInTerminal { seq: request.seq, arguments };
            }
        }
        Self::Other { name: request.command, body: request.arguments }
    }
}
