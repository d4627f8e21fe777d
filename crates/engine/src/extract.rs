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

//! Snapshot extraction
//!
//! Turns the state of a stopped thread into a [`Snapshot`]. The variable graph
//! exposed by a backend may be cyclic and may share nodes, so extraction runs
//! in two phases:
//!
//! 1. **Fetch**: a breadth-first walk, one level at a time. All requests of a
//!    level are issued concurrently and joined before the next level starts.
//!    Every identity (memory reference, else variables reference) is fetched at
//!    most once; the shallowest occurrence claims it.
//! 2. **Assemble**: a pure pass building the snapshot tree from the fetched
//!    lists. An identity already present on the path from the root is a cycle
//!    and gets no children.
//!
//! Only scopes whose name starts with `Local` are expanded below their
//! immediate variables, down to [`MAX_LOCAL_DEPTH`].

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    ffi::OsString,
    path::{Path, PathBuf},
};

use futures::future::join_all;
use stepsnap_common::types::{variable_identity, MemoryDump, Scope, Snapshot, StackFrame, Variable};
use tracing::{debug, trace, warn};

use crate::{
    adapter::DigPredicates,
    dap::{DapScope, DapStackFrame, DapVariable, DebugClient},
    SessionError,
};

/// Deepest level at which variables of a local scope still get their children
/// fetched. Immediate variables of a scope are at depth 0.
pub const MAX_LOCAL_DEPTH: usize = 3;

/// Files whose frames are expanded
#[derive(Debug, Clone, Default)]
pub struct TrackedFiles {
    paths: Vec<PathBuf>,
    names: HashSet<OsString>,
}

impl TrackedFiles {
    /// Tracks the given files.
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let paths: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
        let names = paths.iter().filter_map(|path| path.file_name()).map(OsString::from).collect();
        Self { paths, names }
    }

    /// Whether `path` designates a tracked file, either exactly or by file
    /// name. Backends do not always report the path the program was launched
    /// with.
    pub fn contains(&self, path: &str) -> bool {
        let path = Path::new(path);
        self.paths.iter().any(|tracked| tracked == path)
            || path.file_name().is_some_and(|name| self.names.contains(name))
    }

    /// The tracked paths
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

/// How much of a stop is captured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractDepth {
    /// Frames, scopes and variables.
    Full,
    /// Frames only, for stops that are not recorded.
    FramesOnly,
}

/// A pending `variables` request of the walk
#[derive(Debug)]
struct Fetch {
    identity: String,
    reference: i64,
    depth: usize,
}

/// Lists fetched during one extraction
#[derive(Debug, Default)]
struct Arena {
    /// Variables of each scope, by variables reference
    scopes: HashMap<i64, Vec<DapVariable>>,
    /// Children of each expanded variable, by identity
    children: HashMap<String, Vec<DapVariable>>,
    /// Memory read for each memory reference
    memory: HashMap<String, MemoryDump>,
}

/// Extracts snapshots of a stopped thread
pub struct Extractor<'a> {
    client: &'a dyn DebugClient,
    predicates: &'a dyn DigPredicates,
    tracked: &'a TrackedFiles,
    memory_read_bytes: u32,
}

impl<'a> Extractor<'a> {
    /// Creates an extractor. Memory reads are disabled.
    pub fn new(
        client: &'a dyn DebugClient,
        predicates: &'a dyn DigPredicates,
        tracked: &'a TrackedFiles,
    ) -> Self {
        Self { client, predicates, tracked, memory_read_bytes: 0 }
    }

    /// Reads `bytes` bytes of memory for every variable exposing a memory
    /// reference. 0 disables reads.
    pub fn with_memory_reads(mut self, bytes: u32) -> Self {
        self.memory_read_bytes = bytes;
        self
    }

    /// Captures the state of `thread_id`.
    ///
    /// Only the stack trace request is fatal. Failing scope, variable and
    /// memory requests leave the corresponding part of the snapshot empty.
    pub async fn extract(
        &self,
        thread_id: i64,
        depth: ExtractDepth,
    ) -> Result<Snapshot, SessionError> {
        let frames = self.client.stack_trace(thread_id).await.map_err(SessionError::Extraction)?;
        let user_frames: Vec<bool> = frames.iter().map(|frame| self.is_user_frame(frame)).collect();

        if depth == ExtractDepth::FramesOnly {
            let frames = frames
                .into_iter()
                .zip(user_frames)
                .map(|(frame, user)| stack_frame(frame, user, Vec::new()))
                .collect();
            return Ok(Snapshot::with_frames(frames));
        }

        // Scopes of every user frame
        let scope_requests = frames
            .iter()
            .zip(&user_frames)
            .filter(|(_, user)| **user)
            .map(|(frame, _)| self.client.scopes(frame.id));
        let mut scope_lists = join_all(scope_requests).await.into_iter();
        let mut frame_scopes: Vec<Vec<DapScope>> = Vec::with_capacity(frames.len());
        for (frame, user) in frames.iter().zip(&user_frames) {
            let scopes = match user.then(|| scope_lists.next()).flatten() {
                Some(Ok(scopes)) => scopes,
                Some(Err(e)) => {
                    warn!(frame = frame.id, "failed to fetch scopes: {e}");
                    Vec::new()
                }
                None => Vec::new(),
            };
            frame_scopes.push(scopes);
        }

        let arena = self.walk(&frame_scopes).await;

        let frames = frames
            .into_iter()
            .zip(user_frames)
            .zip(frame_scopes)
            .map(|((frame, user), scopes)| {
                let scopes = scopes.into_iter().map(|scope| self.assemble_scope(scope, &arena));
                stack_frame(frame, user, scopes.collect())
            })
            .collect::<Vec<_>>();

        debug!(
            thread_id,
            frames = frames.len(),
            expanded = arena.children.len(),
            "extracted snapshot"
        );
        Ok(Snapshot::with_frames(frames))
    }

    fn is_user_frame(&self, frame: &DapStackFrame) -> bool {
        let tracked = frame.source_path().is_some_and(|path| self.tracked.contains(path));
        tracked && self.predicates.can_dig_stack_frame(frame)
    }

    fn diggable(&self, variables: Vec<DapVariable>) -> Vec<DapVariable> {
        variables
            .into_iter()
            .filter(|variable| self.predicates.can_dig_variable(variable))
            .collect()
    }

    /// Fetches every list the snapshot needs.
    async fn walk(&self, frame_scopes: &[Vec<DapScope>]) -> Arena {
        let mut arena = Arena::default();

        let mut scopes: Vec<&DapScope> = Vec::new();
        let mut seen = HashSet::new();
        for scope in frame_scopes.iter().flatten() {
            if scope.variables_reference > 0
                && self.predicates.can_dig_scope(scope)
                && seen.insert(scope.variables_reference)
            {
                scopes.push(scope);
            }
        }

        let lists =
            join_all(scopes.iter().map(|scope| self.client.variables(scope.variables_reference)))
                .await;

        let mut claimed = HashSet::new();
        let mut frontier = Vec::new();
        for (scope, list) in scopes.into_iter().zip(lists) {
            let variables = match list {
                Ok(variables) => self.diggable(variables),
                Err(e) => {
                    warn!(scope = %scope.name, "failed to fetch scope variables: {e}");
                    Vec::new()
                }
            };
            if is_local(&scope.name) {
                claim_children(&variables, 0, &mut claimed, &mut frontier);
            }
            arena.scopes.insert(scope.variables_reference, variables);
        }

        while !frontier.is_empty() {
            trace!(requests = frontier.len(), "fetching variable level");
            let lists =
                join_all(frontier.iter().map(|fetch| self.client.variables(fetch.reference))).await;

            let mut next = Vec::new();
            for (fetch, list) in std::mem::take(&mut frontier).into_iter().zip(lists) {
                let children = match list {
                    Ok(children) => self.diggable(children),
                    Err(e) => {
                        warn!(reference = fetch.reference, "failed to fetch variables: {e}");
                        Vec::new()
                    }
                };
                claim_children(&children, fetch.depth + 1, &mut claimed, &mut next);
                arena.children.insert(fetch.identity, children);
            }
            frontier = next;
        }

        if self.memory_read_bytes > 0 {
            arena.memory = self.read_memory(&arena).await;
        }
        arena
    }

    async fn read_memory(&self, arena: &Arena) -> HashMap<String, MemoryDump> {
        let references: BTreeSet<&str> = arena
            .scopes
            .values()
            .chain(arena.children.values())
            .flatten()
            .filter_map(|variable| variable.memory_reference.as_deref())
            .collect();

        let reads = references
            .iter()
            .map(|reference| self.client.read_memory(reference, self.memory_read_bytes));
        let results = join_all(reads).await;

        let mut memory = HashMap::new();
        for (reference, result) in references.into_iter().zip(results) {
            match result {
                Ok(body) => {
                    memory.insert(
                        reference.to_string(),
                        MemoryDump {
                            address: body.address,
                            data: body.data,
                            unreadable_bytes: body.unreadable_bytes,
                        },
                    );
                }
                Err(e) => debug!(reference, "failed to read memory: {e}"),
            }
        }
        memory
    }

    fn assemble_scope(&self, scope: DapScope, arena: &Arena) -> Scope {
        let expand = is_local(&scope.name);
        let variables = match arena.scopes.get(&scope.variables_reference) {
            Some(list) if self.predicates.can_dig_scope(&scope) => {
                let mut path = HashSet::new();
                list.iter().map(|raw| assemble(raw, 0, expand, arena, &mut path)).collect()
            }
            _ => Vec::new(),
        };
        Scope {
            name: scope.name,
            variables_reference: scope.variables_reference,
            expensive: scope.expensive,
            variables,
        }
    }
}

fn is_local(scope_name: &str) -> bool {
    scope_name.starts_with("Local")
}

/// Queues the children of `variables` that still have to be fetched.
fn claim_children(
    variables: &[DapVariable],
    depth: usize,
    claimed: &mut HashSet<String>,
    frontier: &mut Vec<Fetch>,
) {
    if depth > MAX_LOCAL_DEPTH {
        return;
    }
    for variable in variables {
        let Some(identity) =
            variable_identity(variable.memory_reference.as_deref(), variable.variables_reference)
        else {
            continue;
        };
        if claimed.insert(identity.clone()) {
            frontier.push(Fetch { identity, reference: variable.variables_reference, depth });
        }
    }
}

fn assemble(
    raw: &DapVariable,
    depth: usize,
    expand: bool,
    arena: &Arena,
    path: &mut HashSet<String>,
) -> Variable {
    let identity = variable_identity(raw.memory_reference.as_deref(), raw.variables_reference);

    let mut variables = Vec::new();
    if let Some(identity) = identity.filter(|_| expand && depth <= MAX_LOCAL_DEPTH) {
        if let Some(children) = arena.children.get(&identity) {
            if path.insert(identity.clone()) {
                variables = children
                    .iter()
                    .map(|child| assemble(child, depth + 1, expand, arena, path))
                    .collect();
                path.remove(&identity);
            } else {
                trace!(%identity, "cycle in variable graph");
            }
        }
    }

    Variable {
        name: raw.name.clone(),
        value: raw.value.clone(),
        type_name: raw.type_name.clone(),
        evaluate_name: raw.evaluate_name.clone(),
        variables_reference: raw.variables_reference,
        memory_reference: raw.memory_reference.clone(),
        memory: raw
            .memory_reference
            .as_ref()
            .and_then(|reference| arena.memory.get(reference).cloned()),
        variables,
    }
}

fn stack_frame(frame: DapStackFrame, user_frame: bool, scopes: Vec<Scope>) -> StackFrame {
    StackFrame {
        id: frame.id,
        name: frame.name,
        source: frame.source,
        line: frame.line,
        column: frame.column,
        user_frame,
        scopes,
    }
}
