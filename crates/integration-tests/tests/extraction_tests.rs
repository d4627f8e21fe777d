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

//! Snapshot extraction against a scripted backend
//!
//! These tests cover how the extractor walks the variable graph of a stopped
//! program:
//! - Cyclic and shared variables
//! - The depth bound of local scopes
//! - Frames, scopes and variables the backend predicates reject
//! - Partial failures and memory reads

use std::path::Path;

use stepsnap_common::types::{MemoryDump, Snapshot, Variable};
use stepsnap_engine::{
    dap::DebugClient, ExtractDepth, Extractor, SessionError, TrackedFiles, MAX_LOCAL_DEPTH,
};
use stepsnap_integration_tests::{
    scripted::{frame, scope, variable, variable_at, ScriptedAdapter, ScriptedProgram, THREAD_ID},
    test_utils::init,
};
use tracing::info;

const MAIN: &str = "/src/main.c";

fn tracked() -> TrackedFiles {
    TrackedFiles::new([MAIN])
}

/// A program stopped in `main` with a `Locals` scope of reference 100.
fn in_main() -> ScriptedProgram {
    ScriptedProgram::new()
        .stop(vec![frame(1, "main", Path::new(MAIN), 3)])
        .scopes(1, vec![scope("Locals", 100)])
}

async fn extract_with(adapter: &ScriptedAdapter, depth: ExtractDepth, memory: u32) -> Snapshot {
    let client = adapter.client();
    client.configuration_done().await.unwrap();
    let tracked = tracked();
    Extractor::new(&**client, adapter, &tracked)
        .with_memory_reads(memory)
        .extract(THREAD_ID, depth)
        .await
        .unwrap()
}

async fn extract(adapter: &ScriptedAdapter) -> Snapshot {
    extract_with(adapter, ExtractDepth::Full, 0).await
}

fn locals(snapshot: &Snapshot) -> &[Variable] {
    &snapshot.stack_frames[0].scopes[0].variables
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cycle_gets_no_children() {
    init::init_test_environment();
    info!("Running test");

    // node -> next -> node
    let adapter = ScriptedAdapter::new(
        in_main()
            .variables(100, vec![variable("node", "{...}", 10)])
            .variables(10, vec![variable("next", "{...}", 11)])
            .variables(11, vec![variable("next", "{...}", 10)]),
    );
    let snapshot = extract(&adapter).await;

    let node = &locals(&snapshot)[0];
    let next = &node.variables[0];
    assert_eq!(next.variables_reference, 11);
    let back = &next.variables[0];
    assert_eq!(back.variables_reference, 10);
    assert!(back.variables.is_empty());

    assert_eq!(adapter.client().variables_requests(10), 1);
    assert_eq!(adapter.client().variables_requests(11), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shared_identity_is_fetched_once() {
    init::init_test_environment();
    info!("Running test");

    // Two pointers to the same object, each with its own variables reference
    let adapter = ScriptedAdapter::new(
        in_main()
            .variables(
                100,
                vec![
                    variable_at("a", "0x1000", 20, "0x1000"),
                    variable_at("b", "0x1000", 21, "0x1000"),
                ],
            )
            .variables(20, vec![variable("x", "1", 0)])
            .variables(21, vec![variable("x", "1", 0)]),
    );
    let snapshot = extract(&adapter).await;

    let client = adapter.client();
    assert_eq!(client.variables_requests(20) + client.variables_requests(21), 1);
    for pointer in locals(&snapshot) {
        assert_eq!(pointer.variables.len(), 1, "{} lost its children", pointer.name);
        assert_eq!(pointer.variables[0].name, "x");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_local_depth_is_bounded() {
    init::init_test_environment();
    info!("Running test");

    // l0 -> l1 -> ... -> l10, l{i} stored under reference 30 + i
    let mut program = in_main().variables(100, vec![variable("l0", "{...}", 30)]);
    for i in 0..10 {
        program =
            program.variables(30 + i, vec![variable(&format!("l{}", i + 1), "{...}", 31 + i)]);
    }
    let adapter = ScriptedAdapter::new(program);
    let snapshot = extract(&adapter).await;

    let mut depth = 0;
    let mut current = &locals(&snapshot)[0];
    while let Some(child) = current.variables.first() {
        depth += 1;
        current = child;
    }
    assert_eq!(depth, MAX_LOCAL_DEPTH + 1);
    assert_eq!(current.name, format!("l{}", MAX_LOCAL_DEPTH + 1));

    let client = adapter.client();
    let deepest = 30 + MAX_LOCAL_DEPTH as i64;
    assert_eq!(client.variables_requests(deepest), 1);
    assert_eq!(client.variables_requests(deepest + 1), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_local_scopes_are_not_expanded() {
    init::init_test_environment();
    info!("Running test");

    let adapter = ScriptedAdapter::new(
        ScriptedProgram::new()
            .stop(vec![frame(1, "main", Path::new(MAIN), 3)])
            .scopes(1, vec![scope("Locals", 100), scope("Globals", 200)])
            .variables(100, vec![variable("i", "0", 0)])
            .variables(200, vec![variable("table", "{...}", 50)])
            .variables(50, vec![variable("[0]", "1", 0)]),
    );
    let snapshot = extract(&adapter).await;

    let globals = &snapshot.stack_frames[0].scopes[1];
    assert_eq!(globals.name, "Globals");
    assert_eq!(globals.variables.len(), 1);
    assert!(globals.variables[0].variables.is_empty());
    assert_eq!(adapter.client().variables_requests(200), 1);
    assert_eq!(adapter.client().variables_requests(50), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_untracked_frames_keep_empty_scopes() {
    init::init_test_environment();
    info!("Running test");

    let adapter = ScriptedAdapter::new(
        ScriptedProgram::new()
            .stop(vec![
                frame(2, "printf", Path::new("/usr/lib/libc.so.6"), 0),
                frame(1, "main", Path::new(MAIN), 3),
            ])
            .scopes(2, vec![scope("Locals", 400)])
            .scopes(1, vec![scope("Locals", 100)])
            .variables(100, vec![variable("i", "0", 0)]),
    );
    let snapshot = extract(&adapter).await;

    let [printf, main] = snapshot.stack_frames.as_slice() else {
        panic!("expected two frames, got {:?}", snapshot.stack_frames);
    };
    assert!(!printf.user_frame);
    assert!(printf.scopes.is_empty());
    assert!(main.user_frame);
    assert_eq!(main.scopes[0].variables[0].name, "i");

    assert_eq!(adapter.client().scope_requests(), vec![1]);
    assert!(snapshot.has_user_frame());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejected_scopes_and_variables() {
    init::init_test_environment();
    info!("Running test");

    let adapter = ScriptedAdapter::new(
        ScriptedProgram::new()
            .stop(vec![frame(1, "main", Path::new(MAIN), 3)])
            .scopes(1, vec![scope("Locals", 100), scope("Registers", 300)])
            .variables(100, vec![variable("i", "0", 0), variable("$rip", "0x4004", 0)])
            .variables(300, vec![variable("rax", "0", 0)]),
    )
    .rejecting_scope("Registers")
    .rejecting_variable("$rip");
    let snapshot = extract(&adapter).await;

    let scopes = &snapshot.stack_frames[0].scopes;
    assert_eq!(scopes.len(), 2);
    let names: Vec<_> = scopes[0].variables.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, ["i"]);
    assert_eq!(scopes[1].name, "Registers");
    assert!(scopes[1].variables.is_empty());
    assert_eq!(adapter.client().variables_requests(300), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_fetch_leaves_empty_children() {
    init::init_test_environment();
    info!("Running test");

    let adapter = ScriptedAdapter::new(
        in_main()
            .variables(100, vec![variable("broken", "{...}", 10), variable("i", "7", 0)])
            .failing_reference(10),
    );
    let snapshot = extract(&adapter).await;

    let variables = locals(&snapshot);
    assert_eq!(variables.len(), 2);
    assert_eq!(variables[0].name, "broken");
    assert!(variables[0].variables.is_empty());
    assert_eq!(variables[1].value, "7");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_memory_is_read_once_per_reference() {
    init::init_test_environment();
    info!("Running test");

    let adapter = ScriptedAdapter::new(in_main().variables(
        100,
        vec![
            variable_at("buf", "\"abc\"", 0, "0x2000"),
            variable_at("alias", "\"abc\"", 0, "0x2000"),
            variable("n", "3", 0),
        ],
    ));
    let snapshot = extract_with(&adapter, ExtractDepth::Full, 4).await;

    let expected = MemoryDump {
        address: "0x2000".to_string(),
        data: Some("AAECAw==".to_string()),
        unreadable_bytes: None,
    };
    let variables = locals(&snapshot);
    assert_eq!(variables[0].memory, Some(expected.clone()));
    assert_eq!(variables[1].memory, Some(expected));
    assert_eq!(variables[2].memory, None);
    assert_eq!(adapter.client().request_count("readMemory"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_frames_only_skips_scopes() {
    init::init_test_environment();
    info!("Running test");

    let adapter = ScriptedAdapter::new(in_main().variables(100, vec![variable("i", "0", 0)]));
    let snapshot = extract_with(&adapter, ExtractDepth::FramesOnly, 4).await;

    assert_eq!(snapshot.stack_frames.len(), 1);
    assert!(snapshot.stack_frames[0].user_frame);
    assert!(snapshot.stack_frames[0].scopes.is_empty());
    assert_eq!(adapter.client().request_count("scopes"), 0);
    assert_eq!(adapter.client().request_count("variables"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stack_trace_failure_is_an_extraction_error() {
    init::init_test_environment();
    info!("Running test");

    let adapter = ScriptedAdapter::new(in_main());
    let client = adapter.client();
    client.configuration_done().await.unwrap();
    client.close_transport().await;

    let tracked = tracked();
    let error = Extractor::new(&**client, &adapter, &tracked)
        .extract(THREAD_ID, ExtractDepth::Full)
        .await
        .unwrap_err();
    assert!(matches!(error, SessionError::Extraction(_)), "unexpected error: {error}");
}
