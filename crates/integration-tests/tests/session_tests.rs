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

//! End-to-end session tests against a scripted backend
//!
//! Each test plays back a small program through a full session:
//! - Output attribution and ordering of snapshots
//! - Stepping strategies, manual driving and speed
//! - Every way a session can end
//! - Resources released at teardown

use std::{fs, path::Path, sync::Arc, time::Duration};

use stepsnap_common::types::{BreakpointSpec, Snapshot, TerminationKind};
use stepsnap_engine::{
    dap::{DapStackFrame, OutputEventBody},
    run_to_completion, DriverMode, SessionError, SessionState,
};
use stepsnap_integration_tests::{
    scripted::{frame, scope, variable, ScriptedAdapter, ScriptedProgram, ScriptedStop},
    test_utils::{
        fixtures::SessionFixture,
        init,
        session::{self, next_snapshot, wait_for_state},
    },
};
use tracing::info;

fn main_at(fixture: &SessionFixture, line: i64) -> Vec<DapStackFrame> {
    vec![frame(1, "main", &fixture.source, line)]
}

/// A program stopping once on each of `lines`, all in `main`.
fn straight_line(fixture: &SessionFixture, lines: &[i64]) -> ScriptedProgram {
    lines
        .iter()
        .fold(ScriptedProgram::new(), |program, &line| program.stop(main_at(fixture, line)))
        .scopes(1, vec![scope("Locals", 100)])
        .variables(100, vec![variable("i", "0", 0)])
}

fn lines(snapshots: &[Snapshot]) -> Vec<i64> {
    snapshots.iter().map(|s| s.stack_frames.first().map_or(0, |frame| frame.line)).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_output_attaches_to_the_following_snapshot() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(5);
    let program = ScriptedProgram::new()
        .stop(main_at(&fixture, 1))
        .stop_with(
            ScriptedStop::new(main_at(&fixture, 2)).with_output(OutputEventBody::stdout("A\n")),
        )
        .stop_with(
            ScriptedStop::new(main_at(&fixture, 3)).with_output(OutputEventBody::stdout("B\n")),
        );
    let adapter = Arc::new(ScriptedAdapter::new(program));

    let recording = session::record(adapter.clone(), fixture.allocator(), fixture.options()).await;
    let snapshots = &recording.outcome.snapshots;

    assert_eq!(lines(snapshots), vec![1, 2, 3]);
    assert_eq!(snapshots[0].stdout, None);
    assert_eq!(snapshots[1].stdout, Some(vec!["A".to_string()]));
    assert_eq!(snapshots[2].stdout, Some(vec!["B".to_string()]));
    assert!(snapshots.iter().all(|s| s.stderr.is_none()));

    // Only the last entry is terminated, a clean end has no reason
    assert!(!snapshots[0].terminated && !snapshots[1].terminated);
    assert!(snapshots[2].terminated);
    assert_eq!(snapshots[2].terminated_reason, None);
    assert_eq!(recording.outcome.termination.kind, TerminationKind::End);

    // Snapshots are streamed in recording order, then exactly one termination
    let streamed: Vec<Snapshot> = recording.streamed_snapshots().into_iter().cloned().collect();
    assert_eq!(lines(&streamed), vec![1, 2, 3]);
    assert_eq!(recording.termination_events(), 1);

    // Line breakpoints are dropped once stepping starts
    let client = adapter.client();
    assert_eq!(client.breakpoint_requests(), vec![vec![1, 2, 3, 4, 5], vec![]]);
    assert_eq!(client.step_commands(), ["stepIn", "stepIn", "stepIn"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_startup_output_goes_to_the_first_snapshot() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(3);
    let adapter = Arc::new(
        ScriptedAdapter::new(straight_line(&fixture, &[1, 2]))
            .with_startup_output(OutputEventBody::stdout("hello\n")),
    );

    let recording = session::record(adapter, fixture.allocator(), fixture.options()).await;
    let snapshots = &recording.outcome.snapshots;
    assert_eq!(snapshots[0].stdout, Some(vec!["hello".to_string()]));
    assert_eq!(snapshots[1].stdout, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_output_after_the_last_stop_gets_a_terminal_snapshot() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(3);
    let program =
        straight_line(&fixture, &[1, 2]).exit_output(OutputEventBody::stdout("bye\n"));
    let adapter = Arc::new(ScriptedAdapter::new(program));

    let recording = session::record(adapter, fixture.allocator(), fixture.options()).await;
    let snapshots = &recording.outcome.snapshots;

    assert_eq!(snapshots.len(), 3);
    assert!(!snapshots[1].terminated);
    let terminal = &snapshots[2];
    assert!(terminal.stack_frames.is_empty());
    assert_eq!(terminal.stdout, Some(vec!["bye".to_string()]));
    assert!(terminal.terminated);
    assert_eq!(recording.streamed_snapshots().len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_recording_has_a_single_terminal_snapshot() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(3);
    let adapter = Arc::new(ScriptedAdapter::new(ScriptedProgram::new()));

    let recording = session::record(adapter, fixture.allocator(), fixture.options()).await;
    let snapshots = &recording.outcome.snapshots;
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].stack_frames.is_empty());
    assert!(snapshots[0].terminated);
    assert!(recording.streamed_snapshots().is_empty());
    assert_eq!(recording.outcome.termination.kind, TerminationKind::End);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recursion_keeps_every_frame() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(6);
    let fact = |id| frame(id, "fact", &fixture.source, 3);
    let mut program = ScriptedProgram::new()
        .stop(vec![fact(1)])
        .stop(vec![fact(2), fact(1)])
        .stop(vec![fact(3), fact(2), fact(1)]);
    for id in 1..=3 {
        program = program
            .scopes(id, vec![scope("Locals", 100 + id)])
            .variables(100 + id, vec![variable("n", &(4 - id).to_string(), 0)]);
    }
    let adapter = Arc::new(ScriptedAdapter::new(program));

    let recording = session::record(adapter, fixture.allocator(), fixture.options()).await;
    let deepest = &recording.outcome.snapshots[2];

    assert_eq!(deepest.stack_frames.len(), 3);
    assert!(deepest.stack_frames.iter().all(|frame| frame.user_frame));
    let values: Vec<&str> = deepest
        .stack_frames
        .iter()
        .map(|frame| frame.scopes[0].variables[0].value.as_str())
        .collect();
    assert_eq!(values, ["1", "2", "3"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_steps_out_of_code_without_user_frames() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(4);
    let program = ScriptedProgram::new()
        .stop(main_at(&fixture, 2))
        .stop(vec![frame(9, "__libc_write", Path::new("/usr/lib/libc.so.6"), 0)])
        .stop(main_at(&fixture, 3));
    let adapter = Arc::new(ScriptedAdapter::new(program));

    let recording = session::record(adapter.clone(), fixture.allocator(), fixture.options()).await;

    assert_eq!(adapter.client().step_commands(), ["stepIn", "stepOut", "stepIn"]);
    assert_eq!(recording.outcome.snapshots.len(), 3);
    assert!(!recording.outcome.snapshots[1].has_user_frame());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_explicit_breakpoints_continue_between_stops() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(5);
    let adapter = Arc::new(ScriptedAdapter::new(straight_line(&fixture, &[2, 4])));
    let options = fixture.options().with_breakpoints(BreakpointSpec::Lines(vec![2, 4]));

    let recording = session::record(adapter.clone(), fixture.allocator(), options).await;

    assert_eq!(lines(&recording.outcome.snapshots), vec![2, 4]);
    let client = adapter.client();
    assert_eq!(client.step_commands(), ["continue", "continue"]);
    assert_eq!(client.breakpoint_requests(), vec![vec![2, 4]]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_nonzero_exit_reports_stderr() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::with_file("main.py", 3);
    let program = straight_line(&fixture, &[1])
        .exit_output(OutputEventBody::stderr("Traceback\n"))
        .exit_output(OutputEventBody::stderr("ZeroDivisionError\n"))
        .exit_code(1);
    let adapter = Arc::new(ScriptedAdapter::new(program));

    let recording = session::record(adapter, fixture.allocator(), fixture.options()).await;
    let termination = &recording.outcome.termination;

    assert_eq!(termination.kind, TerminationKind::Terminated);
    assert_eq!(termination.message, "Program ended with an error:\nTraceback\nZeroDivisionError");

    let terminal = recording.outcome.snapshots.last().unwrap();
    let stderr = terminal.stderr.clone().unwrap_or_default();
    assert_eq!(stderr, ["Traceback", "ZeroDivisionError"]);
    assert_eq!(terminal.terminated_reason.as_deref(), Some(termination.message.as_str()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_signal_ends_the_session() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(3);
    let program = straight_line(&fixture, &[1]).stop_with(ScriptedStop::signal("SIGSEGV"));
    let adapter = Arc::new(ScriptedAdapter::new(program));

    let recording = session::record(adapter, fixture.allocator(), fixture.options()).await;
    let snapshots = &recording.outcome.snapshots;

    assert_eq!(recording.outcome.termination.kind, TerminationKind::Signal);
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].terminated);
    assert_eq!(snapshots[0].terminated_reason.as_deref(), Some("SIGSEGV"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_time_limit() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(3);
    let adapter = Arc::new(ScriptedAdapter::new(straight_line(&fixture, &[1]).hangs()));
    let options = fixture.options_with_time_limit(Duration::from_millis(300));

    let recording = session::record(adapter.clone(), fixture.allocator(), options).await;
    let snapshots = &recording.outcome.snapshots;

    assert_eq!(recording.outcome.termination.kind, TerminationKind::Timeout);
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].terminated);
    assert!(snapshots[0].terminated_reason.as_deref().is_some_and(|r| r.contains("Time limit")));
    assert_eq!(adapter.teardowns(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_terminate_is_idempotent() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(3);
    let adapter = Arc::new(ScriptedAdapter::new(straight_line(&fixture, &[1]).hangs()));

    let (handle, mut events) =
        session::start(adapter.clone(), fixture.allocator(), fixture.options()).await.unwrap();
    next_snapshot(&mut events).await;

    handle.terminate();
    handle.terminate();
    handle.terminated().await;
    assert_eq!(handle.state(), SessionState::Terminated);
    handle.terminate();

    let recording = session::finish(handle, events).await;
    assert_eq!(recording.outcome.termination.kind, TerminationKind::Close);
    assert_eq!(recording.termination_events(), 1);
    assert_eq!(adapter.teardowns(), 1);
    assert_eq!(adapter.client().request_count("disconnect"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_manual_driving() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(5);
    let adapter = Arc::new(ScriptedAdapter::new(straight_line(&fixture, &[1, 2, 3])));
    let options = fixture.options().with_driver(DriverMode::Manual);

    let (handle, mut events) =
        session::start(adapter.clone(), fixture.allocator(), options).await.unwrap();

    assert_eq!(next_snapshot(&mut events).await.stack_frames[0].line, 1);
    wait_for_state(&handle, SessionState::Paused).await;
    assert!(adapter.client().step_commands().is_empty());

    handle.step_over().unwrap();
    assert_eq!(next_snapshot(&mut events).await.stack_frames[0].line, 2);
    wait_for_state(&handle, SessionState::Paused).await;

    handle.step_in().unwrap();
    assert_eq!(next_snapshot(&mut events).await.stack_frames[0].line, 3);
    wait_for_state(&handle, SessionState::Paused).await;

    handle.step_out().unwrap();
    let recording = session::finish(handle, events).await;

    assert_eq!(adapter.client().step_commands(), ["next", "stepIn", "stepOut"]);
    assert_eq!(recording.outcome.snapshots.len(), 3);
    assert_eq!(recording.outcome.termination.kind, TerminationKind::End);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_speed_records_one_stop_out_of_n() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(5);
    let adapter = Arc::new(ScriptedAdapter::new(straight_line(&fixture, &[1, 2, 3, 4, 5])));
    let options = fixture.options().with_driver(DriverMode::Manual);

    let (handle, mut events) =
        session::start(adapter.clone(), fixture.allocator(), options).await.unwrap();
    next_snapshot(&mut events).await;
    wait_for_state(&handle, SessionState::Paused).await;

    assert!(matches!(handle.set_speed(0), Err(SessionError::Configuration(_))));
    handle.set_speed(2).unwrap();
    handle.step_in().unwrap();
    assert_eq!(next_snapshot(&mut events).await.stack_frames[0].line, 3);
    wait_for_state(&handle, SessionState::Paused).await;

    handle.terminate();
    let recording = session::finish(handle, events).await;

    assert_eq!(lines(&recording.outcome.snapshots), vec![1, 3]);
    assert_eq!(recording.outcome.termination.kind, TerminationKind::Close);
    // The skipped stop is stepped through without being expanded
    assert_eq!(adapter.client().request_count("scopes"), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_compilation_failure_still_yields_a_session() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(3);
    let diagnostics = "main.c:1:12: error: expected ';' before '}' token";
    let adapter =
        Arc::new(ScriptedAdapter::new(ScriptedProgram::new()).failing_compilation(diagnostics));
    let allocator = fixture.allocator();

    let (handle, events) =
        session::start(adapter.clone(), allocator.clone(), fixture.options()).await.unwrap();
    assert_eq!(handle.state(), SessionState::Terminated);

    let recording = session::finish(handle, events).await;
    assert_eq!(recording.outcome.termination.kind, TerminationKind::Compilation);
    assert_eq!(recording.outcome.termination.message, diagnostics);
    let [terminal] = recording.outcome.snapshots.as_slice() else {
        panic!("expected a single snapshot");
    };
    assert!(terminal.terminated);
    assert_eq!(terminal.terminated_reason.as_deref(), Some(diagnostics));
    assert_eq!(recording.termination_events(), 1);

    assert_eq!(allocator.reserved_count(), 0);
    assert_eq!(adapter.teardowns(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_backend_fails_the_start() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(3);
    let adapter = Arc::new(
        ScriptedAdapter::new(ScriptedProgram::new()).failing_backend("connection refused"),
    );
    let allocator = fixture.allocator();

    let error =
        session::start(adapter.clone(), allocator.clone(), fixture.options()).await.unwrap_err();
    assert!(matches!(error, SessionError::BackendConnect(_)), "unexpected error: {error}");
    assert!(error.to_string().contains("connection refused"));

    assert_eq!(allocator.reserved_count(), 0);
    assert_eq!(adapter.teardowns(), 1);
    let [connection] = adapter.connections().try_into().unwrap();
    assert!(!connection.input_path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_source_fails_the_start() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(3);
    let adapter = Arc::new(ScriptedAdapter::new(ScriptedProgram::new()));
    let mut options = fixture.options();
    options.source_path = fixture.dir.path().join("gone.c");

    let error = session::start(adapter.clone(), fixture.allocator(), options).await.unwrap_err();
    assert!(matches!(error, SessionError::SourceRead { .. }));
    assert!(adapter.connections().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_teardown_releases_every_resource() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(3);
    fs::create_dir_all(fixture.data_dir()).unwrap();
    let scratch = fixture.data_dir().join("a.out");
    let outside = fixture.dir.path().join("keep.txt");
    fs::write(&scratch, b"binary").unwrap();
    fs::write(&outside, b"keep").unwrap();

    let adapter = Arc::new(
        ScriptedAdapter::new(straight_line(&fixture, &[1]))
            .with_scratch_file(&scratch)
            .with_scratch_file(&outside),
    );
    let allocator = fixture.allocator();

    session::record(adapter.clone(), allocator.clone(), fixture.options()).await;

    let [connection] = adapter.connections().try_into().unwrap();
    assert_eq!(connection.uid, fixture.config.uid_range.start);
    assert_eq!(connection.program_path, fixture.source);
    let input = fixture.data_dir().join(format!("input-{}.txt", connection.uid));
    assert_eq!(connection.input_path, input);

    assert!(!connection.input_path.exists());
    assert!(!scratch.exists());
    assert!(outside.exists());

    assert_eq!(
        adapter.journal(),
        ["unsubscribe", "close_transport", "disconnect", "after_teardown"]
    );
    assert!(adapter.client().is_closed());
    assert_eq!(adapter.client().subscriber_count(), 0);
    assert_eq!(allocator.reserved_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_given_input_file_is_kept() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(3);
    let input = fixture.dir.path().join("input.txt");
    fs::write(&input, "42\n").unwrap();
    let adapter = Arc::new(ScriptedAdapter::new(straight_line(&fixture, &[1])));

    session::record(adapter.clone(), fixture.allocator(), fixture.options().with_input(&input))
        .await;

    assert_eq!(adapter.connections()[0].input_path, input);
    assert!(input.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_sessions_get_distinct_ids() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(3);
    let allocator = fixture.allocator();
    let first = Arc::new(ScriptedAdapter::new(straight_line(&fixture, &[1, 2])));
    let second = Arc::new(ScriptedAdapter::new(straight_line(&fixture, &[2, 3])));

    let (a, b) = tokio::join!(
        session::record(first.clone(), allocator.clone(), fixture.options()),
        session::record(second.clone(), allocator.clone(), fixture.options()),
    );

    assert_eq!(lines(&a.outcome.snapshots), vec![1, 2]);
    assert_eq!(lines(&b.outcome.snapshots), vec![2, 3]);
    assert_ne!(first.connections()[0].uid, second.connections()[0].uid);
    assert_eq!(allocator.reserved_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_to_completion_compresses_the_recording() {
    init::init_test_environment();
    info!("Running test");

    let fixture = SessionFixture::new(3);
    let adapter = Arc::new(ScriptedAdapter::new(straight_line(&fixture, &[1, 2, 3])));

    let steps = run_to_completion(adapter, fixture.allocator(), fixture.options()).await.unwrap();
    assert_eq!(steps.len(), 3);

    let snapshots = steps.snapshots().unwrap();
    assert_eq!(lines(&snapshots), vec![1, 2, 3]);
    assert!(snapshots[2].terminated);
    assert_eq!(snapshots[1].stack_frames[0].scopes[0].variables[0].name, "i");
}
