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

//! Stepping engine
//!
//! A session drives one debuggee from its first stop to its end. It runs as a
//! single task reacting to three inputs: events of the debug adapter, output
//! injected by the backend adapter and commands of the [`SessionHandle`]. The
//! whole loop is bounded by a wall-clock budget and can be cancelled at any
//! time with [`SessionHandle::terminate`].
//!
//! ```text
//! Starting -> AwaitingStop -> Extracting -> Advancing -> AwaitingStop ...
//!                                              |
//!                                              +-> Paused (manual driver)
//! any state -> Terminating -> Terminated
//! ```
//!
//! Extraction of a stop always completes before the step or continue request
//! that leaves it is sent, so snapshots are recorded in stop order.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use eyre::WrapErr;
use stepsnap_common::{
    types::{BreakpointSpec, Snapshot, StepMode, TerminationKind, TerminationMessage},
    IdAllocator, StepsnapConfig,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    adapter::{BackendAdapter, ConnectParams},
    breakpoint,
    dap::{
        DebugClient, DebugEvent, EventSubscription, OutputEventBody, SteppingGranularity,
        StoppedEventBody,
    },
    extract::{ExtractDepth, Extractor, TrackedFiles},
    lifecycle::Lifecycle,
    patch::{PatchError, Steps},
    CompilationError, DapError, SessionError,
};

/// Where a session is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Bringing up the backend and installing breakpoints
    Starting,
    /// The program runs until its next stop
    AwaitingStop,
    /// Capturing the current stop
    Extracting,
    /// Sending the request that leaves the current stop
    Advancing,
    /// Stopped in user code, waiting for a step command of the caller
    Paused,
    /// Finishing the recording and releasing resources
    Terminating,
    /// Over, nothing is held anymore
    Terminated,
}

/// Who advances the program after a recorded stop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DriverMode {
    /// The engine steps by itself until the program ends.
    #[default]
    Auto,
    /// The engine pauses on every stop in user code until the caller sends a
    /// step command.
    Manual,
}

/// Notifications streamed to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A snapshot was recorded.
    Snapshot(Snapshot),
    /// The session ended. Sent exactly once, after teardown.
    Terminated(TerminationMessage),
}

/// Settings of one session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Main source file
    pub source_path: PathBuf,
    /// File fed to the program's standard input, an empty file when `None`
    pub input_path: Option<PathBuf>,
    /// Other files whose frames are expanded
    pub tracked_files: Vec<PathBuf>,
    /// Lines receiving the initial breakpoints
    pub breakpoints: BreakpointSpec,
    /// Who advances the program
    pub driver: DriverMode,
    /// Wall-clock budget of the session
    pub time_limit: Duration,
    /// Directory holding the session's temporary files
    pub data_dir: PathBuf,
}

impl SessionOptions {
    /// Options recording every line of `source_path` with the defaults of
    /// `config`.
    pub fn new(source_path: impl Into<PathBuf>, config: &StepsnapConfig) -> Self {
        Self {
            source_path: source_path.into(),
            input_path: None,
            tracked_files: Vec::new(),
            breakpoints: BreakpointSpec::All,
            driver: DriverMode::Auto,
            time_limit: config.time_limit(),
            data_dir: config.data_dir.clone(),
        }
    }

    /// Sets the standard input file.
    pub fn with_input(mut self, input_path: impl Into<PathBuf>) -> Self {
        self.input_path = Some(input_path.into());
        self
    }

    /// Sets the initial breakpoints.
    pub fn with_breakpoints(mut self, breakpoints: BreakpointSpec) -> Self {
        self.breakpoints = breakpoints;
        self
    }

    /// Sets the driver mode.
    pub fn with_driver(mut self, driver: DriverMode) -> Self {
        self.driver = driver;
        self
    }

    /// Sets the wall-clock budget.
    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = time_limit;
        self
    }

    /// Tracks one more file.
    pub fn with_tracked_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.tracked_files.push(path.into());
        self
    }
}

/// Program output not yet attached to a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputBuffer {
    stdout: Vec<String>,
    stderr: Vec<String>,
}

impl OutputBuffer {
    /// Accumulates an output event. One trailing newline is stripped from
    /// the chunk; categories other than `stdout` and `stderr` are dropped.
    pub fn push(&mut self, body: &OutputEventBody) {
        let chunk = body.output.strip_suffix('\n').unwrap_or(&body.output).to_string();
        match body.category.as_deref() {
            Some("stdout") => self.stdout.push(chunk),
            Some("stderr") => self.stderr.push(chunk),
            category => trace!(?category, "dropping output: {chunk}"),
        }
    }

    /// Standard output chunks
    pub fn stdout(&self) -> &[String] {
        &self.stdout
    }

    /// Standard error chunks
    pub fn stderr(&self) -> &[String] {
        &self.stderr
    }

    /// Whether nothing was accumulated
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    /// Moves the accumulated output into `snapshot`, leaving the buffer empty.
    /// Empty streams stay absent from the snapshot.
    pub fn attach_to(&mut self, snapshot: &mut Snapshot) {
        let stdout = std::mem::take(&mut self.stdout);
        let stderr = std::mem::take(&mut self.stderr);
        snapshot.stdout = (!stdout.is_empty()).then_some(stdout);
        snapshot.stderr = (!stderr.is_empty()).then_some(stderr);
    }
}

/// Result of a finished session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Recorded snapshots, the last one marked terminated
    pub snapshots: Vec<Snapshot>,
    /// Why the session ended
    pub termination: TerminationMessage,
}

impl SessionOutcome {
    /// Compresses the recording.
    pub fn steps(&self) -> Result<Steps, PatchError> {
        Steps::from_snapshots(&self.snapshots)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    In,
    Over,
    Out,
    Continue,
}

impl Step {
    fn command(self) -> &'static str {
        match self {
            Self::In => "stepIn",
            Self::Over => "next",
            Self::Out => "stepOut",
            Self::Continue => "continue",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Step(Step),
    SetSpeed(u32),
}

/// Control over a running session
#[derive(Debug)]
pub struct SessionHandle {
    uid: u16,
    commands: mpsc::UnboundedSender<Command>,
    cancel: watch::Sender<bool>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    /// A handle on a session that ended before it could start, because the
    /// program does not build.
    fn compilation_failure(
        uid: u16,
        error: CompilationError,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Self {
        let message = TerminationMessage::new(TerminationKind::Compilation, error.message);
        info!(session = uid, "program does not compile");

        let mut snapshot = Snapshot::default();
        snapshot.mark_terminated(&message);
        if let Some(events) = events {
            let _ = events.send(SessionEvent::Terminated(message.clone()));
        }

        let (commands, _) = mpsc::unbounded_channel();
        let (cancel, _) = watch::channel(false);
        let (_, state) = watch::channel(SessionState::Terminated);
        let outcome = SessionOutcome { snapshots: vec![snapshot], termination: message };
        Self { uid, commands, cancel, state, task: tokio::spawn(async move { outcome }) }
    }

    /// Session id, also the port of its backend
    pub fn uid(&self) -> u16 {
        self.uid
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Steps into the next call, when paused.
    pub fn step_in(&self) -> Result<(), SessionError> {
        self.send(Command::Step(Step::In))
    }

    /// Steps over the current line, when paused.
    pub fn step_over(&self) -> Result<(), SessionError> {
        self.send(Command::Step(Step::Over))
    }

    /// Steps out of the current function, when paused.
    pub fn step_out(&self) -> Result<(), SessionError> {
        self.send(Command::Step(Step::Out))
    }

    /// Records one stop out of `speed`. The others are only stepped through.
    pub fn set_speed(&self, speed: u32) -> Result<(), SessionError> {
        if speed == 0 {
            return Err(SessionError::Configuration("speed must be at least 1".to_string()));
        }
        self.send(Command::SetSpeed(speed))
    }

    /// Ends the session whatever its state. Calling it more than once, or on
    /// a finished session, has no effect.
    pub fn terminate(&self) {
        self.cancel.send_replace(true);
    }

    /// Resolves once the session reached [`SessionState::Terminated`].
    pub async fn terminated(&self) {
        let mut state = self.state.clone();
        // A closed channel means the session is gone as well
        let _ = state.wait_for(|state| *state == SessionState::Terminated).await;
    }

    /// Waits for the session to end.
    pub async fn wait(self) -> Result<SessionOutcome, SessionError> {
        self.task.await.map_err(|e| SessionError::Aborted(e.to_string()))
    }

    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| {
            let name = match command {
                Command::Step(step) => step.command(),
                Command::SetSpeed(_) => "setSpeed",
            };
            SessionError::Step { command: name, source: DapError::Disconnected }
        })
    }
}

/// Starts a session and waits for its recording, compressed.
pub async fn run_to_completion(
    adapter: Arc<dyn BackendAdapter>,
    allocator: Arc<dyn IdAllocator>,
    options: SessionOptions,
) -> Result<Steps, SessionError> {
    let options = options.with_driver(DriverMode::Auto);
    let handle = Session::start(adapter, allocator, options, None).await?;
    let outcome = handle.wait().await?;
    Ok(outcome.steps()?)
}

/// A debugging session
pub struct Session {
    uid: u16,
    adapter: Arc<dyn BackendAdapter>,
    allocator: Arc<dyn IdAllocator>,
    client: Arc<dyn DebugClient>,
    lifecycle: Lifecycle,
    tracked: TrackedFiles,
    source_path: PathBuf,
    step_mode: StepMode,
    driver: DriverMode,
    time_limit: Duration,
    state: watch::Sender<SessionState>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    output: OutputBuffer,
    snapshots: Vec<Snapshot>,
    thread_id: i64,
    speed: u32,
    stops: u32,
    breakpoints_cleared: bool,
}

impl Session {
    /// Brings up the backend of `adapter`, installs the breakpoints and lets
    /// the program run.
    ///
    /// Fails only when the session cannot start: unreadable source, no free
    /// session id, or a backend that cannot be reached. A program that does
    /// not compile still yields a handle, on a session that already ended
    /// with a `compilation` termination. `events` receives snapshots as they
    /// are recorded.
    pub async fn start(
        adapter: Arc<dyn BackendAdapter>,
        allocator: Arc<dyn IdAllocator>,
        options: SessionOptions,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Result<SessionHandle, SessionError> {
        let source_path = tokio::fs::canonicalize(&options.source_path).await.map_err(|source| {
            SessionError::SourceRead { path: options.source_path.clone(), source }
        })?;
        let uid = allocator.reserve().map_err(|e| SessionError::BackendConnect(e.into()))?;
        info!(session = uid, backend = adapter.name(), ?source_path, "starting session");

        let mut lifecycle = Lifecycle::new(uid, &options.data_dir);
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let connected =
            connect(&*adapter, uid, &source_path, &options, &mut lifecycle, output_tx).await;
        let client = match connected {
            Ok(client) => client,
            Err(error) => {
                lifecycle.teardown(None, &*adapter).await;
                allocator.release(uid);
                return match error.downcast::<CompilationError>() {
                    Ok(compilation) => {
                        Ok(SessionHandle::compilation_failure(uid, compilation, events))
                    }
                    Err(error) => Err(SessionError::BackendConnect(error)),
                };
            }
        };

        let subscription = client.subscribe();
        let subscriber = client.clone();
        let subscription_id = subscription.id;
        lifecycle
            .cleanables_mut()
            .track_subscription(move || subscriber.unsubscribe(subscription_id));

        if let Err(error) = configure(&*client, &source_path, &options.breakpoints).await {
            lifecycle.teardown(Some(&client), &*adapter).await;
            allocator.release(uid);
            return Err(error);
        }

        let mut tracked = vec![source_path.clone()];
        tracked.extend(options.tracked_files.iter().cloned());

        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let session = Self {
            uid,
            adapter,
            allocator,
            client,
            lifecycle,
            tracked: TrackedFiles::new(tracked),
            source_path,
            step_mode: options.breakpoints.step_mode(),
            driver: options.driver,
            time_limit: options.time_limit,
            state: state_tx,
            events,
            output: OutputBuffer::default(),
            snapshots: Vec::new(),
            thread_id: 1,
            speed: 1,
            stops: 0,
            breakpoints_cleared: false,
        };
        let task = tokio::spawn(session.run(subscription, output_rx, command_rx, cancel_rx));

        Ok(SessionHandle { uid, commands: command_tx, cancel: cancel_tx, state: state_rx, task })
    }

    async fn run(
        mut self,
        mut subscription: EventSubscription,
        mut output: mpsc::UnboundedReceiver<OutputEventBody>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut cancel: watch::Receiver<bool>,
    ) -> SessionOutcome {
        let uid = self.uid;
        let time_limit = self.time_limit;
        self.set_state(SessionState::AwaitingStop);

        let message = tokio::select! {
            message = self.drive(&mut subscription.events, &mut output, &mut commands) => message,
            _ = cancelled(&mut cancel) => {
                info!(session = uid, "session terminated by the caller");
                TerminationMessage::close()
            }
            _ = tokio::time::sleep(time_limit) => {
                warn!(session = uid, ?time_limit, "time limit exceeded");
                TerminationMessage::timeout(time_limit.as_secs())
            }
        };

        self.set_state(SessionState::Terminating);
        // Output that raced with the end of the program
        while let Ok(body) = output.try_recv() {
            self.output.push(&body);
        }
        while let Ok(event) = subscription.events.try_recv() {
            if let DebugEvent::Output(body) = event {
                self.output.push(&body);
            }
        }
        self.finish(&message);

        self.lifecycle.teardown(Some(&self.client), &*self.adapter).await;
        self.allocator.release(uid);
        self.set_state(SessionState::Terminated);
        info!(session = uid, %message, snapshots = self.snapshots.len(), "session terminated");
        self.emit(SessionEvent::Terminated(message.clone()));

        SessionOutcome { snapshots: self.snapshots, termination: message }
    }

    async fn drive(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<DebugEvent>,
        output: &mut mpsc::UnboundedReceiver<OutputEventBody>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> TerminationMessage {
        let mut commands_open = true;
        loop {
            tokio::select! {
                biased;
                Some(body) = output.recv() => self.output.push(&body),
                event = events.recv() => {
                    let Some(event) = event else {
                        warn!(session = self.uid, "debug adapter closed the connection");
                        return TerminationMessage::new(
                            TerminationKind::Terminated,
                            "Debug adapter connection closed",
                        );
                    };
                    if let Some(message) = self.handle_event(event).await {
                        return message;
                    }
                }
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => commands_open = false,
                },
            }
        }
    }

    async fn handle_event(&mut self, event: DebugEvent) -> Option<TerminationMessage> {
        match event {
            DebugEvent::Stopped(stopped) => return self.on_stopped(stopped).await,
            DebugEvent::Output(body) => self.output.push(&body),
            DebugEvent::Exited(exited) => {
                debug!(session = self.uid, exit_code = exited.exit_code, "program exited");
                return Some(self.end_message(Some(exited.exit_code)));
            }
            DebugEvent::Terminated => {
                debug!(session = self.uid, "debug session terminated");
                return Some(self.end_message(None));
            }
            other => trace!(session = self.uid, ?other, "ignoring event"),
        }
        None
    }

    async fn on_stopped(&mut self, stopped: StoppedEventBody) -> Option<TerminationMessage> {
        if stopped.reason == "signal" {
            let message = stopped
                .text
                .or(stopped.description)
                .unwrap_or_else(|| "Program received a signal".to_string());
            return Some(TerminationMessage::new(TerminationKind::Signal, message));
        }

        match (stopped.reason.as_str(), stopped.thread_id) {
            ("breakpoint" | "step", Some(thread_id)) => self.on_stop(thread_id).await,
            (reason, thread_id) => debug!(session = self.uid, reason, ?thread_id, "ignoring stop"),
        }
        None
    }

    async fn on_stop(&mut self, thread_id: i64) {
        self.thread_id = thread_id;
        self.set_state(SessionState::Extracting);

        // Line breakpoints would interrupt every step over once stepping
        // starts
        if self.step_mode == StepMode::All && !self.breakpoints_cleared {
            self.breakpoints_cleared = true;
            if let Err(e) = breakpoint::clear(&*self.client, &self.source_path).await {
                warn!(session = self.uid, "failed to clear breakpoints: {e}");
            }
        }

        self.stops += 1;
        let recorded = self.stops >= self.speed;
        let depth = if recorded { ExtractDepth::Full } else { ExtractDepth::FramesOnly };

        let extractor = Extractor::new(&*self.client, &*self.adapter, &self.tracked)
            .with_memory_reads(self.adapter.memory_read_bytes());
        let snapshot = match extractor.extract(thread_id, depth).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(session = self.uid, thread_id, "{e}");
                None
            }
        };

        self.set_state(SessionState::Advancing);
        if !recorded {
            trace!(session = self.uid, stops = self.stops, speed = self.speed, "skipping stop");
            self.step(Step::In).await;
            return;
        }
        self.stops = 0;

        // A failed extraction tells nothing about the frames, assume user code
        let user_frame = snapshot.as_ref().is_none_or(Snapshot::has_user_frame);
        if let Some(snapshot) = snapshot.filter(|snapshot| !snapshot.stack_frames.is_empty()) {
            self.record(snapshot);
        }
        self.advance(user_frame).await;
    }

    async fn advance(&mut self, user_frame: bool) {
        let step = match (self.driver, self.step_mode) {
            (DriverMode::Manual, _) if user_frame => {
                self.set_state(SessionState::Paused);
                return;
            }
            (_, StepMode::Explicit) => Step::Continue,
            (_, StepMode::All) if user_frame => Step::In,
            (_, StepMode::All) => Step::Out,
        };
        self.step(step).await;
    }

    async fn step(&mut self, step: Step) {
        let thread_id = self.thread_id;
        let granularity = Some(SteppingGranularity::Instruction);
        trace!(session = self.uid, thread_id, command = step.command(), "advancing");

        let result = match step {
            Step::In => self.client.step_in(thread_id, granularity).await,
            Step::Over => self.client.next(thread_id, granularity).await,
            Step::Out => self.client.step_out(thread_id, granularity).await,
            Step::Continue => self.client.continue_(thread_id).await,
        };
        self.set_state(SessionState::AwaitingStop);

        if let Err(source) = result {
            let error = SessionError::Step { command: step.command(), source };
            warn!(session = self.uid, "{error}");
        }
    }

    async fn handle_command(&mut self, command: Command) {
        let paused = *self.state.borrow() == SessionState::Paused;
        match command {
            Command::SetSpeed(speed) => {
                debug!(session = self.uid, speed, "speed changed");
                self.speed = speed.max(1);
            }
            Command::Step(step) if paused => self.step(step).await,
            Command::Step(step) => {
                debug!(session = self.uid, command = step.command(), "not paused, ignoring step");
            }
        }
    }

    fn record(&mut self, mut snapshot: Snapshot) {
        self.output.attach_to(&mut snapshot);
        debug!(
            session = self.uid,
            index = self.snapshots.len(),
            frames = snapshot.stack_frames.len(),
            "recorded snapshot"
        );
        self.emit(SessionEvent::Snapshot(snapshot.clone()));
        self.snapshots.push(snapshot);
    }

    /// Marks the end of the recording. Output produced after the last
    /// snapshot, or an empty recording, gets a terminal entry of its own.
    fn finish(&mut self, message: &TerminationMessage) {
        match self.snapshots.last_mut() {
            Some(last) if self.output.is_empty() => last.mark_terminated(message),
            _ => {
                let mut terminal = Snapshot::default();
                self.output.attach_to(&mut terminal);
                terminal.mark_terminated(message);
                if terminal.stdout.is_some() || terminal.stderr.is_some() {
                    self.emit(SessionEvent::Snapshot(terminal.clone()));
                }
                self.snapshots.push(terminal);
            }
        }
    }

    fn end_message(&self, exit_code: Option<i64>) -> TerminationMessage {
        self.adapter
            .termination_message(&self.output, exit_code)
            .unwrap_or_else(|| default_end_message(&self.output, exit_code))
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            // The caller may have stopped listening
            let _ = events.send(event);
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            trace!(session = self.uid, ?previous, ?state, "state transition");
        }
    }
}

/// Connects the backend of `adapter`, creating an empty input file when the
/// caller gave none.
async fn connect(
    adapter: &dyn BackendAdapter,
    uid: u16,
    source_path: &Path,
    options: &SessionOptions,
    lifecycle: &mut Lifecycle,
    output: mpsc::UnboundedSender<OutputEventBody>,
) -> eyre::Result<Arc<dyn DebugClient>> {
    let input_path = match &options.input_path {
        Some(path) => path.clone(),
        None => {
            tokio::fs::create_dir_all(&options.data_dir)
                .await
                .wrap_err_with(|| format!("failed to create {:?}", options.data_dir))?;
            let path = options.data_dir.join(format!("input-{uid}.txt"));
            tokio::fs::write(&path, b"")
                .await
                .wrap_err_with(|| format!("failed to create input file {path:?}"))?;
            lifecycle.cleanables_mut().track_path(&path);
            path
        }
    };

    adapter
        .connect(ConnectParams {
            uid,
            program_path: source_path,
            input_path: &input_path,
            cleanables: lifecycle.cleanables_mut(),
            output,
        })
        .await
}

async fn configure(
    client: &dyn DebugClient,
    source_path: &Path,
    breakpoints: &BreakpointSpec,
) -> Result<(), SessionError> {
    let installed = breakpoint::install(client, source_path, breakpoints).await?;
    debug!(
        requested = installed.requested.len(),
        verified = installed.verified.len(),
        "breakpoints installed"
    );
    client.configuration_done().await.map_err(|e| SessionError::BackendConnect(e.into()))
}

/// Resolves once cancellation is requested. Never resolves if the handle is
/// gone without asking.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Termination message used when the adapter has no policy of its own.
fn default_end_message(output: &OutputBuffer, exit_code: Option<i64>) -> TerminationMessage {
    match exit_code {
        Some(code) if code != 0 => {
            let mut message = "Program ended with an error".to_string();
            if !output.stderr().is_empty() {
                message.push_str(":\n");
                message.push_str(&output.stderr().join("\n"));
            }
            TerminationMessage::new(TerminationKind::Terminated, message)
        }
        _ => TerminationMessage::end(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_buffer_strips_one_newline() {
        let mut output = OutputBuffer::default();
        output.push(&OutputEventBody::stdout("A\n"));
        output.push(&OutputEventBody::stdout("B\n\n"));
        output.push(&OutputEventBody::stderr("oops"));
        output.push(&OutputEventBody { category: Some("console".to_string()), output: "x".into() });
        output.push(&OutputEventBody { category: None, output: "y".into() });

        assert_eq!(output.stdout(), ["A", "B\n"]);
        assert_eq!(output.stderr(), ["oops"]);
    }

    #[test]
    fn test_attach_output() {
        let mut output = OutputBuffer::default();
        output.push(&OutputEventBody::stdout("A\n"));

        let mut snapshot = Snapshot::default();
        output.attach_to(&mut snapshot);
        assert_eq!(snapshot.stdout, Some(vec!["A".to_string()]));
        assert_eq!(snapshot.stderr, None);
        assert!(output.is_empty());

        let mut next = Snapshot::default();
        output.attach_to(&mut next);
        assert_eq!(next.stdout, None);
    }

    #[test]
    fn test_default_end_message() {
        let mut output = OutputBuffer::default();
        assert_eq!(default_end_message(&output, Some(0)), TerminationMessage::end());
        assert_eq!(default_end_message(&output, None), TerminationMessage::end());

        let failed = default_end_message(&output, Some(1));
        assert_eq!(failed.kind, TerminationKind::Terminated);
        assert_eq!(failed.message, "Program ended with an error");

        output.push(&OutputEventBody::stderr("Traceback\n"));
        output.push(&OutputEventBody::stderr("ZeroDivisionError\n"));
        let failed = default_end_message(&output, Some(1));
        assert_eq!(failed.message, "Program ended with an error:\nTraceback\nZeroDivisionError");
    }

    #[test]
    fn test_session_options_defaults() {
        let config = StepsnapConfig::default();
        let options = SessionOptions::new("main.c", &config)
            .with_breakpoints("3,4".parse().unwrap())
            .with_driver(DriverMode::Manual)
            .with_tracked_file("util.h");

        assert_eq!(options.time_limit, config.time_limit());
        assert_eq!(options.data_dir, config.data_dir);
        assert_eq!(options.breakpoints, BreakpointSpec::Lines(vec![3, 4]));
        assert_eq!(options.tracked_files, vec![PathBuf::from("util.h")]);
        assert!(options.input_path.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_on_request() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { cancelled(&mut rx).await });
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();

        // Already cancelled before waiting
        let (tx, mut rx) = watch::channel(true);
        cancelled(&mut rx).await;
        drop(tx);
    }
}
