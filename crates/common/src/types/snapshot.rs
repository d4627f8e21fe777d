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

//! Program state captured at one stop of the debuggee.
//!
//! Field names serialize in camelCase so the JSON produced for consumers keeps
//! the vocabulary of the debug adapter protocol (`variablesReference`,
//! `memoryReference`, `stackFrames`, ...).

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// State of the stopped thread at one stop event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Call stack of the stopped thread, innermost frame first.
    #[serde(default)]
    pub stack_frames: Vec<StackFrame>,
    /// Standard output produced since the previous snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<Vec<String>>,
    /// Standard error produced since the previous snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<Vec<String>>,
    /// Set on the last entry of a session.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terminated: bool,
    /// Why the session ended, absent for a clean end of program.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_reason: Option<String>,
}

impl Snapshot {
    /// Creates a snapshot holding only a call stack.
    pub fn with_frames(stack_frames: Vec<StackFrame>) -> Self {
        Self { stack_frames, ..Default::default() }
    }

    /// Whether any frame of this snapshot belongs to tracked user code.
    pub fn has_user_frame(&self) -> bool {
        self.stack_frames.iter().any(|frame| frame.user_frame)
    }

    /// Marks this snapshot as the end of the session.
    pub fn mark_terminated(&mut self, message: &TerminationMessage) {
        self.terminated = true;
        self.terminated_reason = message.reason();
    }
}

/// A stack frame of the stopped thread.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    /// Backend-assigned frame id, only valid while the thread is stopped.
    pub id: i64,
    /// Human readable frame name, usually the function name.
    pub name: String,
    /// Source location of the frame, if the backend knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    /// 1-based line.
    pub line: i64,
    /// 1-based column.
    pub column: i64,
    /// Whether the frame lies in a tracked file and was expanded.
    #[serde(default)]
    pub user_frame: bool,
    /// Scopes of the frame, always empty for non-user frames.
    #[serde(default)]
    pub scopes: Vec<Scope>,
}

/// A source file reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Short name of the source, usually the file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Path of the source as reported by the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A named group of variables visible from a stack frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    /// Scope name such as `Locals`, `Globals` or `Registers`.
    pub name: String,
    /// Reference used to fetch the scope's variables.
    pub variables_reference: i64,
    /// Whether the backend flags this scope as expensive to retrieve.
    #[serde(default)]
    pub expensive: bool,
    /// Variables of the scope, empty when the scope was not dug into.
    #[serde(default)]
    pub variables: Vec<Variable>,
}

/// A variable and, within the depth bound, its children.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    /// Variable name.
    pub name: String,
    /// Rendered value.
    pub value: String,
    /// Declared type, when the backend reports one.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Expression evaluating to this variable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluate_name: Option<String>,
    /// Reference used to fetch children, `0` for leaves.
    #[serde(default)]
    pub variables_reference: i64,
    /// Stable identity of the underlying memory, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_reference: Option<String>,
    /// Raw memory read at `memory_reference`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryDump>,
    /// Children of the variable.
    #[serde(default)]
    pub variables: Vec<Variable>,
}

impl Variable {
    /// Identity used to deduplicate backend fetches: the memory reference
    /// when the backend provides one, the variables reference otherwise.
    /// Leaves have no identity.
    pub fn identity(&self) -> Option<String> {
        variable_identity(self.memory_reference.as_deref(), self.variables_reference)
    }
}

/// Identity of a variable from its raw references, see [`Variable::identity`].
pub fn variable_identity(
    memory_reference: Option<&str>,
    variables_reference: i64,
) -> Option<String> {
    if variables_reference <= 0 {
        return None;
    }
    Some(match memory_reference {
        Some(reference) => reference.to_string(),
        None => variables_reference.to_string(),
    })
}

/// Bytes read from the debuggee's memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryDump {
    /// Address of the first byte read.
    pub address: String,
    /// Base64 encoded bytes, absent when nothing was readable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Number of bytes that could not be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unreadable_bytes: Option<i64>,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TerminationKind {
    /// The program ran to completion.
    End,
    /// The program ended with a non-zero exit code.
    Terminated,
    /// The program was stopped by a signal.
    Signal,
    /// The caller closed the session.
    Close,
    /// The session exceeded its wall-clock budget.
    Timeout,
    /// The program could not be built.
    Compilation,
}

/// Message delivered exactly once when a session terminates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminationMessage {
    /// Kind of termination.
    #[serde(rename = "type")]
    pub kind: TerminationKind,
    /// Human readable explanation.
    pub message: String,
}

impl TerminationMessage {
    /// Creates a termination message.
    pub fn new(kind: TerminationKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// The clean end of the program.
    pub fn end() -> Self {
        Self::new(TerminationKind::End, "Program ended")
    }

    /// The wall-clock budget was exhausted.
    pub fn timeout(limit_secs: u64) -> Self {
        Self::new(TerminationKind::Timeout, format!("Time limit of {limit_secs} seconds exceeded"))
    }

    /// The caller asked to stop the session.
    pub fn close() -> Self {
        Self::new(TerminationKind::Close, "Client is closing the connection")
    }

    /// Whether the program reached its end normally.
    pub fn is_clean(&self) -> bool {
        self.kind == TerminationKind::End
    }

    /// Reason attached to the final snapshot, `None` for a clean end.
    pub fn reason(&self) -> Option<String> {
        (!self.is_clean()).then(|| self.message.clone())
    }
}

impl Display for TerminationMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(user_frame: bool) -> StackFrame {
        StackFrame {
            id: 1000,
            name: "main".to_string(),
            source: Some(Source {
                name: Some("main.c".to_string()),
                path: Some("/tmp/main.c".to_string()),
            }),
            line: 4,
            column: 1,
            user_frame,
            scopes: vec![],
        }
    }

    #[test]
    fn test_snapshot_serializes_in_camel_case() {
        let snapshot = Snapshot {
            stack_frames: vec![frame(true)],
            stdout: Some(vec!["A".to_string()]),
            ..Default::default()
        };
        let value = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(
            value,
            json!({
                "stackFrames": [{
                    "id": 1000,
                    "name": "main",
                    "source": { "name": "main.c", "path": "/tmp/main.c" },
                    "line": 4,
                    "column": 1,
                    "userFrame": true,
                    "scopes": []
                }],
                "stdout": ["A"]
            })
        );
    }

    #[test]
    fn test_variable_type_field_name() {
        let variable = Variable {
            name: "n".to_string(),
            value: "3".to_string(),
            type_name: Some("int".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&variable).unwrap();
        assert_eq!(value["type"], json!("int"));
        assert!(value.get("memoryReference").is_none());

        let back: Variable = serde_json::from_value(value).unwrap();
        assert_eq!(back, variable);
    }

    #[test]
    fn test_variable_identity() {
        let mut variable = Variable { variables_reference: 7, ..Default::default() };
        assert_eq!(variable.identity(), Some("7".to_string()));

        variable.memory_reference = Some("0x7ffe0010".to_string());
        assert_eq!(variable.identity(), Some("0x7ffe0010".to_string()));

        // Leaves have no identity, whatever their memory reference
        variable.variables_reference = 0;
        assert_eq!(variable.identity(), None);
    }

    #[test]
    fn test_mark_terminated() {
        let mut snapshot = Snapshot::with_frames(vec![frame(true)]);
        snapshot.mark_terminated(&TerminationMessage::end());
        assert!(snapshot.terminated);
        assert_eq!(snapshot.terminated_reason, None);

        snapshot.mark_terminated(&TerminationMessage::timeout(600));
        assert_eq!(
            snapshot.terminated_reason.as_deref(),
            Some("Time limit of 600 seconds exceeded")
        );
    }

    #[test]
    fn test_has_user_frame() {
        assert!(!Snapshot::with_frames(vec![frame(false)]).has_user_frame());
        assert!(Snapshot::with_frames(vec![frame(false), frame(true)]).has_user_frame());
        assert!(!Snapshot::default().has_user_frame());
    }

    #[test]
    fn test_termination_message_shape() {
        let message = TerminationMessage::new(TerminationKind::Signal, "SIGSEGV");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value, json!({ "type": "signal", "message": "SIGSEGV" }));
    }
}
