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

//! A debug backend playing back a scripted program
//!
//! [`ScriptedClient`] answers the debug adapter protocol requests the engine
//! issues from a [`ScriptedProgram`]: a list of stops with their call stacks,
//! plus the scopes and variables those stacks reference. `configurationDone`
//! moves the program to its first stop, every step or continue request to
//! the next one, and stepping past the last stop ends the program.
//!
//! [`ScriptedAdapter`] hands such a client to a session and records what the
//! session asked of it.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use stepsnap_common::types::Source;
use stepsnap_engine::{
    dap::{
        Breakpoint, DapScope, DapStackFrame, DapVariable, DebugClient, DebugEvent, EventHub,
        EventSubscription, ExitedEventBody, OutputEventBody, SetBreakpointsArguments,
        SetBreakpointsResponseBody, StoppedEventBody, SubscriptionId,
    },
    BackendAdapter, CompilationError, ConnectParams, DapError, DigPredicates,
};
use tracing::trace;

/// Shared record of teardown actions, in the order they happened
pub type Journal = Arc<Mutex<Vec<String>>>;

/// Thread the scripted program stops on
pub const THREAD_ID: i64 = 1;

/// One stop of a scripted program
#[derive(Debug, Clone, Default)]
pub struct ScriptedStop {
    /// Stop reason, `breakpoint` for the first stop and `step` afterwards
    /// when unset
    pub reason: Option<String>,
    /// Extra text of the stop, used for signals
    pub text: Option<String>,
    /// Call stack at the stop, innermost first
    pub frames: Vec<DapStackFrame>,
    /// Output produced on the way to this stop
    pub output: Vec<OutputEventBody>,
}

impl ScriptedStop {
    /// A stop with the given call stack.
    pub fn new(frames: Vec<DapStackFrame>) -> Self {
        Self { frames, ..Default::default() }
    }

    /// A stop caused by a signal.
    pub fn signal(text: &str) -> Self {
        Self {
            reason: Some("signal".to_string()),
            text: Some(text.to_string()),
            ..Default::default()
        }
    }

    /// Adds output produced before the stop.
    pub fn with_output(mut self, output: OutputEventBody) -> Self {
        self.output.push(output);
        self
    }
}

/// A program, as seen through the debug adapter protocol
#[derive(Debug, Clone, Default)]
pub struct ScriptedProgram {
    stops: Vec<ScriptedStop>,
    scopes: HashMap<i64, Vec<DapScope>>,
    variables: HashMap<i64, Vec<DapVariable>>,
    exit_output: Vec<OutputEventBody>,
    exit_code: i64,
    hangs: bool,
    unverified_lines: HashSet<u32>,
    failing_references: HashSet<i64>,
}

impl ScriptedProgram {
    /// An empty program, exiting with code 0 right after configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stop with the given call stack.
    pub fn stop(self, frames: Vec<DapStackFrame>) -> Self {
        self.stop_with(ScriptedStop::new(frames))
    }

    /// Appends a stop.
    pub fn stop_with(mut self, stop: ScriptedStop) -> Self {
        self.stops.push(stop);
        self
    }

    /// Scopes reported for a frame.
    pub fn scopes(mut self, frame_id: i64, scopes: Vec<DapScope>) -> Self {
        self.scopes.insert(frame_id, scopes);
        self
    }

    /// Variables reported for a variables reference.
    pub fn variables(mut self, reference: i64, variables: Vec<DapVariable>) -> Self {
        self.variables.insert(reference, variables);
        self
    }

    /// Output produced after the last stop.
    pub fn exit_output(mut self, output: OutputEventBody) -> Self {
        self.exit_output.push(output);
        self
    }

    /// Exit code of the program.
    pub fn exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    /// The program never ends after its last stop.
    pub fn hangs(mut self) -> Self {
        self.hangs = true;
        self
    }

    /// Breakpoints on `line` are reported unverified.
    pub fn unverified_line(mut self, line: u32) -> Self {
        self.unverified_lines.insert(line);
        self
    }

    /// `variables` requests for `reference` fail.
    pub fn failing_reference(mut self, reference: i64) -> Self {
        self.failing_references.insert(reference);
        self
    }
}

/// Position of the program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    NotStarted,
    Stopped(usize),
    Ended,
}

/// Debug client playing back a [`ScriptedProgram`]
#[derive(Debug)]
pub struct ScriptedClient {
    program: ScriptedProgram,
    position: Mutex<Position>,
    hub: EventHub,
    closed: AtomicBool,
    requests: Mutex<Vec<(String, Value)>>,
    journal: Journal,
}

impl ScriptedClient {
    /// Creates a client for `program`.
    pub fn new(program: ScriptedProgram) -> Arc<Self> {
        Self::with_journal(program, Journal::default())
    }

    /// Creates a client logging its teardown to `journal`.
    pub fn with_journal(program: ScriptedProgram, journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            program,
            position: Mutex::new(Position::NotStarted),
            hub: EventHub::new(),
            closed: AtomicBool::new(false),
            requests: Mutex::default(),
            journal,
        })
    }

    /// Commands received so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.requests.lock().iter().map(|(command, _)| command.clone()).collect()
    }

    /// Step and continue commands received so far, in order
    pub fn step_commands(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|command| {
                matches!(command.as_str(), "stepIn" | "next" | "stepOut" | "continue")
            })
            .collect()
    }

    /// How many times `command` was requested
    pub fn request_count(&self, command: &str) -> usize {
        self.requests.lock().iter().filter(|(name, _)| name == command).count()
    }

    /// How many times the children of `reference` were requested
    pub fn variables_requests(&self, reference: i64) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|(name, arguments)| {
                name == "variables" && arguments["variablesReference"] == json!(reference)
            })
            .count()
    }

    /// Frames whose scopes were requested
    pub fn scope_requests(&self) -> Vec<i64> {
        self.requests
            .lock()
            .iter()
            .filter(|(name, _)| name == "scopes")
            .filter_map(|(_, arguments)| arguments["frameId"].as_i64())
            .collect()
    }

    /// Lines of every `setBreakpoints` request, in order
    pub fn breakpoint_requests(&self) -> Vec<Vec<u32>> {
        self.requests
            .lock()
            .iter()
            .filter(|(name, _)| name == "setBreakpoints")
            .filter_map(|(_, arguments)| {
                serde_json::from_value::<SetBreakpointsArguments>(arguments.clone()).ok()
            })
            .map(|arguments| arguments.breakpoints.iter().map(|bp| bp.line).collect())
            .collect()
    }

    /// Whether the transport was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of live event subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    /// Moves the program to its next stop, publishing what happens on the way.
    fn advance(&self) {
        let mut position = self.position.lock();
        let next = match *position {
            Position::NotStarted => 0,
            Position::Stopped(index) => index + 1,
            Position::Ended => return,
        };

        let Some(stop) = self.program.stops.get(next) else {
            *position = Position::Ended;
            for output in &self.program.exit_output {
                self.hub.publish(DebugEvent::Output(output.clone()));
            }
            if !self.program.hangs {
                self.hub.publish(DebugEvent::Exited(ExitedEventBody {
                    exit_code: self.program.exit_code,
                }));
                self.hub.publish(DebugEvent::Terminated);
            }
            return;
        };

        *position = Position::Stopped(next);
        for output in &stop.output {
            self.hub.publish(DebugEvent::Output(output.clone()));
        }
        let default_reason = if next == 0 { "breakpoint" } else { "step" };
        trace!(stop = next, "scripted program stopped");
        self.hub.publish(DebugEvent::Stopped(StoppedEventBody {
            reason: stop.reason.clone().unwrap_or_else(|| default_reason.to_string()),
            thread_id: Some(THREAD_ID),
            description: None,
            text: stop.text.clone(),
        }));
    }

    fn current_frames(&self) -> Vec<DapStackFrame> {
        match *self.position.lock() {
            Position::Stopped(index) => self.program.stops[index].frames.clone(),
            Position::NotStarted | Position::Ended => Vec::new(),
        }
    }

    fn set_breakpoints(&self, arguments: Value) -> Result<Value, DapError> {
        let arguments: SetBreakpointsArguments = serde_json::from_value(arguments)?;
        let breakpoints = arguments
            .breakpoints
            .iter()
            .map(|requested| Breakpoint {
                id: None,
                verified: !self.program.unverified_lines.contains(&requested.line),
                line: Some(requested.line.into()),
                message: None,
            })
            .collect();
        Ok(serde_json::to_value(SetBreakpointsResponseBody { breakpoints })?)
    }

    fn variables(&self, arguments: &Value) -> Result<Value, DapError> {
        let reference = arguments["variablesReference"].as_i64().unwrap_or_default();
        if self.program.failing_references.contains(&reference) {
            return Err(DapError::ErrorResponse {
                command: "variables".to_string(),
                message: format!("cannot expand {reference}"),
            });
        }
        let variables = self.program.variables.get(&reference).cloned().unwrap_or_default();
        Ok(json!({ "variables": variables }))
    }
}

#[async_trait]
impl DebugClient for ScriptedClient {
    async fn request(&self, command: &str, arguments: Value) -> Result<Value, DapError> {
        self.requests.lock().push((command.to_string(), arguments.clone()));
        if command == "disconnect" {
            self.journal.lock().push("disconnect".to_string());
        }
        if self.is_closed() {
            return Err(DapError::Disconnected);
        }

        match command {
            "initialize" => Ok(json!({ "supportsConfigurationDoneRequest": true })),
            "launch" | "disconnect" => Ok(Value::Null),
            "setBreakpoints" => self.set_breakpoints(arguments),
            "configurationDone" | "stepIn" | "next" | "stepOut" | "continue" => {
                self.advance();
                Ok(Value::Null)
            }
            "stackTrace" => Ok(json!({ "stackFrames": self.current_frames() })),
            "scopes" => {
                let frame_id = arguments["frameId"].as_i64().unwrap_or_default();
                let scopes = self.program.scopes.get(&frame_id).cloned().unwrap_or_default();
                Ok(json!({ "scopes": scopes }))
            }
            "variables" => self.variables(&arguments),
            "readMemory" => {
                let reference = arguments["memoryReference"].as_str().unwrap_or_default();
                Ok(json!({ "address": reference, "data": "AAECAw==" }))
            }
            _ => Err(DapError::ErrorResponse {
                command: command.to_string(),
                message: "unsupported request".to_string(),
            }),
        }
    }

    async fn respond(
        &self,
        _request_seq: i64,
        _command: &str,
        _body: Value,
    ) -> Result<(), DapError> {
        Ok(())
    }

    fn subscribe(&self) -> EventSubscription {
        self.hub.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.journal.lock().push("unsubscribe".to_string());
        self.hub.unsubscribe(id);
    }

    async fn close_transport(&self) {
        self.journal.lock().push("close_transport".to_string());
        self.closed.store(true, Ordering::SeqCst);
        self.hub.close();
    }
}

/// How [`ScriptedAdapter::connect`] fails
#[derive(Debug, Clone)]
enum ConnectFailure {
    Compilation(String),
    Backend(String),
}

/// What a session passed to [`ScriptedAdapter::connect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Session id
    pub uid: u16,
    /// Main source file
    pub program_path: PathBuf,
    /// Standard input file
    pub input_path: PathBuf,
}

/// Backend adapter handing out a [`ScriptedClient`]
#[derive(Debug)]
pub struct ScriptedAdapter {
    client: Arc<ScriptedClient>,
    journal: Journal,
    failure: Option<ConnectFailure>,
    rejected_scopes: HashSet<String>,
    rejected_variables: HashSet<String>,
    memory_read_bytes: u32,
    startup_output: Vec<OutputEventBody>,
    scratch_files: Vec<PathBuf>,
    connections: Mutex<Vec<Connection>>,
    teardowns: AtomicUsize,
}

impl ScriptedAdapter {
    /// An adapter playing back `program`.
    pub fn new(program: ScriptedProgram) -> Self {
        let journal = Journal::default();
        Self {
            client: ScriptedClient::with_journal(program, journal.clone()),
            journal,
            failure: None,
            rejected_scopes: HashSet::new(),
            rejected_variables: HashSet::new(),
            memory_read_bytes: 0,
            startup_output: Vec::new(),
            scratch_files: Vec::new(),
            connections: Mutex::default(),
            teardowns: AtomicUsize::new(0),
        }
    }

    /// Fails to connect as a program that does not compile.
    pub fn failing_compilation(mut self, diagnostics: &str) -> Self {
        self.failure = Some(ConnectFailure::Compilation(diagnostics.to_string()));
        self
    }

    /// Fails to connect as an unreachable backend.
    pub fn failing_backend(mut self, message: &str) -> Self {
        self.failure = Some(ConnectFailure::Backend(message.to_string()));
        self
    }

    /// Never expands scopes named `name`.
    pub fn rejecting_scope(mut self, name: &str) -> Self {
        self.rejected_scopes.insert(name.to_string());
        self
    }

    /// Drops variables named `name`.
    pub fn rejecting_variable(mut self, name: &str) -> Self {
        self.rejected_variables.insert(name.to_string());
        self
    }

    /// Reads `bytes` of memory for variables with a memory reference.
    pub fn with_memory_reads(mut self, bytes: u32) -> Self {
        self.memory_read_bytes = bytes;
        self
    }

    /// Output injected by the adapter right after connecting.
    pub fn with_startup_output(mut self, output: OutputEventBody) -> Self {
        self.startup_output.push(output);
        self
    }

    /// Registers `path` for deletion when the session ends.
    pub fn with_scratch_file(mut self, path: impl AsRef<Path>) -> Self {
        self.scratch_files.push(path.as_ref().to_path_buf());
        self
    }

    /// The client handed to sessions
    pub fn client(&self) -> &Arc<ScriptedClient> {
        &self.client
    }

    /// Teardown actions of the client and the adapter, in order
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    /// Every connection attempt
    pub fn connections(&self) -> Vec<Connection> {
        self.connections.lock().clone()
    }

    /// How many times the adapter cleanup ran
    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}

impl DigPredicates for ScriptedAdapter {
    fn can_dig_scope(&self, scope: &DapScope) -> bool {
        !self.rejected_scopes.contains(&scope.name)
    }

    fn can_dig_variable(&self, variable: &DapVariable) -> bool {
        !self.rejected_variables.contains(&variable.name)
    }
}

#[async_trait]
impl BackendAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn connect(&self, params: ConnectParams<'_>) -> eyre::Result<Arc<dyn DebugClient>> {
        self.connections.lock().push(Connection {
            uid: params.uid,
            program_path: params.program_path.to_path_buf(),
            input_path: params.input_path.to_path_buf(),
        });
        for path in &self.scratch_files {
            params.cleanables.track_path(path);
        }

        match &self.failure {
            Some(ConnectFailure::Compilation(message)) => {
                return Err(CompilationError { message: message.clone() }.into());
            }
            Some(ConnectFailure::Backend(message)) => return Err(eyre::eyre!("{message}")),
            None => {}
        }

        for output in &self.startup_output {
            let _ = params.output.send(output.clone());
        }
        let client: Arc<dyn DebugClient> = self.client.clone();
        Ok(client)
    }

    fn memory_read_bytes(&self) -> u32 {
        self.memory_read_bytes
    }

    async fn after_teardown(&self) {
        self.journal.lock().push("after_teardown".to_string());
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// A frame of `path` at `line`.
pub fn frame(id: i64, name: &str, path: &Path, line: i64) -> DapStackFrame {
    DapStackFrame {
        id,
        name: name.to_string(),
        source: Some(Source {
            name: path.file_name().map(|name| name.to_string_lossy().into_owned()),
            path: Some(path.to_string_lossy().into_owned()),
        }),
        line,
        column: 1,
    }
}

/// A scope named `name`.
pub fn scope(name: &str, reference: i64) -> DapScope {
    DapScope { name: name.to_string(), variables_reference: reference, expensive: false }
}

/// A variable, with children when `reference` is positive.
pub fn variable(name: &str, value: &str, reference: i64) -> DapVariable {
    DapVariable {
        name: name.to_string(),
        value: value.to_string(),
        variables_reference: reference,
        ..Default::default()
    }
}

/// A variable stored at `memory_reference`.
pub fn variable_at(name: &str, value: &str, reference: i64, memory_reference: &str) -> DapVariable {
    DapVariable {
        memory_reference: Some(memory_reference.to_string()),
        ..variable(name, value, reference)
    }
}
