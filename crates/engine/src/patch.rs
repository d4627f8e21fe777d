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

//! Snapshot diff compression
//!
//! Consecutive snapshots mostly share their content. A recording is stored as
//! one list of [`Patch`]es per snapshot, each turning the previous snapshot
//! (the empty object for the first one) into the next. Patches are applied in
//! order; array removals are emitted from the highest index down so that
//! indices stay valid.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stepsnap_common::types::Snapshot;
use thiserror::Error;

/// One step of a structural path: an object key or an array index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Array index
    Index(usize),
    /// Object key
    Key(String),
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index}"),
            Self::Key(key) => write!(f, "{key}"),
        }
    }
}

/// Atomic change at a structural path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Patch {
    /// Inserts a value: a new object key, or an array element shifting the
    /// following ones.
    Add {
        /// Where to insert
        path: Vec<PathSegment>,
        /// Inserted value
        value: Value,
    },
    /// Overwrites the value at `path`, the whole document for an empty path.
    Replace {
        /// What to overwrite
        path: Vec<PathSegment>,
        /// New value
        value: Value,
    },
    /// Deletes an object key or an array element.
    Remove {
        /// What to delete
        path: Vec<PathSegment>,
    },
}

impl Patch {
    /// Path the patch applies to
    pub fn path(&self) -> &[PathSegment] {
        match self {
            Self::Add { path, .. } | Self::Replace { path, .. } | Self::Remove { path } => path,
        }
    }
}

/// Errors applying patches
#[derive(Debug, Error)]
pub enum PatchError {
    /// The path does not lead to an existing location.
    #[error("invalid patch path {path}")]
    InvalidPath {
        /// Offending path
        path: String,
    },
    /// A path segment does not fit the value it is applied to.
    #[error("type mismatch at {path}: expected {expected}")]
    TypeMismatch {
        /// Offending path
        path: String,
        /// Kind of value the segment needs
        expected: &'static str,
    },
    /// A snapshot could not be converted from or to JSON.
    #[error("snapshot (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A compressed recording, the batch output of a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Steps {
    /// One patch list per snapshot
    pub steps: Vec<Vec<Patch>>,
}

impl Steps {
    /// Compresses `snapshots`.
    pub fn from_snapshots(snapshots: &[Snapshot]) -> Result<Self, PatchError> {
        Ok(Self { steps: compress(snapshots)? })
    }

    /// Rebuilds the recorded snapshots.
    pub fn snapshots(&self) -> Result<Vec<Snapshot>, PatchError> {
        reconstruct(&self.steps)
    }

    /// Number of recorded snapshots
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Diffs every snapshot against its predecessor, the first one against the
/// empty object.
pub fn compress(snapshots: &[Snapshot]) -> Result<Vec<Vec<Patch>>, PatchError> {
    let mut previous = Value::Object(Map::new());
    let mut steps = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        let current = serde_json::to_value(snapshot)?;
        steps.push(diff(&previous, &current));
        previous = current;
    }
    Ok(steps)
}

/// Inverse of [`compress`].
pub fn reconstruct(steps: &[Vec<Patch>]) -> Result<Vec<Snapshot>, PatchError> {
    let mut document = Value::Object(Map::new());
    let mut snapshots = Vec::with_capacity(steps.len());
    for patches in steps {
        apply_all(&mut document, patches)?;
        snapshots.push(serde_json::from_value(document.clone())?);
    }
    Ok(snapshots)
}

/// Patches turning `old` into `new`, empty when both are equal.
pub fn diff(old: &Value, new: &Value) -> Vec<Patch> {
    let mut patches = Vec::new();
    diff_at(&mut Vec::new(), old, new, &mut patches);
    patches
}

fn diff_at(path: &mut Vec<PathSegment>, old: &Value, new: &Value, patches: &mut Vec<Patch>) {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            for key in old.keys().filter(|key| !new.contains_key(*key)) {
                patches.push(Patch::Remove { path: child_path(path, key.as_str()) });
            }
            for (key, value) in new {
                match old.get(key) {
                    Some(previous) => {
                        path.push(PathSegment::Key(key.clone()));
                        diff_at(path, previous, value, patches);
                        path.pop();
                    }
                    None => patches
                        .push(Patch::Add {
                            path: child_path(path, key.as_str()),
                            value: value.clone(),
                        }),
                }
            }
        }
        (Value::Array(old), Value::Array(new)) => {
            let common = old.len().min(new.len());
            for (index, (previous, value)) in old.iter().zip(new).enumerate() {
                path.push(PathSegment::Index(index));
                diff_at(path, previous, value, patches);
                path.pop();
            }
            for (index, value) in new.iter().enumerate().skip(common) {
                patches.push(Patch::Add { path: child_path(path, index), value: value.clone() });
            }
            for index in (common..old.len()).rev() {
                patches.push(Patch::Remove { path: child_path(path, index) });
            }
        }
        _ if old != new => patches.push(Patch::Replace { path: path.clone(), value: new.clone() }),
        _ => {}
    }
}

fn child_path(path: &[PathSegment], segment: impl Into<PathSegment>) -> Vec<PathSegment> {
    let mut child = path.to_vec();
    child.push(segment.into());
    child
}

/// Applies `patches` to `document` in order.
pub fn apply_all(document: &mut Value, patches: &[Patch]) -> Result<(), PatchError> {
    patches.iter().try_for_each(|patch| apply(document, patch))
}

/// Applies one patch to `document`.
pub fn apply(document: &mut Value, patch: &Patch) -> Result<(), PatchError> {
    let path = patch.path();
    let Some((last, parent_path)) = path.split_last() else {
        return match patch {
            Patch::Add { value, .. } | Patch::Replace { value, .. } => {
                *document = value.clone();
                Ok(())
            }
            Patch::Remove { .. } => Err(PatchError::InvalidPath { path: render(path) }),
        };
    };

    let parent = resolve(document, parent_path)?;
    match (patch, parent, last) {
        (
            Patch::Add { value, .. } | Patch::Replace { value, .. },
            Value::Object(map),
            PathSegment::Key(key),
        ) => {
            if matches!(patch, Patch::Replace { .. }) && !map.contains_key(key) {
                return Err(PatchError::InvalidPath { path: render(path) });
            }
            map.insert(key.clone(), value.clone());
        }
        (Patch::Remove { .. }, Value::Object(map), PathSegment::Key(key)) => {
            if map.remove(key).is_none() {
                return Err(PatchError::InvalidPath { path: render(path) });
            }
        }
        (Patch::Add { value, .. }, Value::Array(items), PathSegment::Index(index)) => {
            if *index > items.len() {
                return Err(PatchError::InvalidPath { path: render(path) });
            }
            items.insert(*index, value.clone());
        }
        (Patch::Replace { value, .. }, Value::Array(items), PathSegment::Index(index)) => {
            let slot =
                items
                    .get_mut(*index)
                    .ok_or_else(|| PatchError::InvalidPath { path: render(path) })?;
            *slot = value.clone();
        }
        (Patch::Remove { .. }, Value::Array(items), PathSegment::Index(index)) => {
            if *index >= items.len() {
                return Err(PatchError::InvalidPath { path: render(path) });
            }
            items.remove(*index);
        }
        (_, Value::Object(_), PathSegment::Index(_)) => {
            return Err(PatchError::TypeMismatch { path: render(path), expected: "object key" });
        }
        (_, Value::Array(_), PathSegment::Key(_)) => {
            return Err(PatchError::TypeMismatch { path: render(path), expected: "array index" });
        }
        _ => {
            return Err(PatchError::TypeMismatch {
                path: render(parent_path),
                expected: "object or array",
            });
        }
    }
    Ok(())
}

fn resolve<'a>(document: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value, PatchError> {
    let mut current = document;
    for (depth, segment) in path.iter().enumerate() {
        let here = || render(&path[..=depth]);
        current = match (current, segment) {
            (Value::Object(map), PathSegment::Key(key)) => {
                map.get_mut(key).ok_or_else(|| PatchError::InvalidPath { path: here() })?
            }
            (Value::Array(items), PathSegment::Index(index)) => {
                items.get_mut(*index).ok_or_else(|| PatchError::InvalidPath { path: here() })?
            }
            (Value::Object(_), PathSegment::Index(_)) => {
                return Err(PatchError::TypeMismatch { path: here(), expected: "object key" });
            }
            (Value::Array(_), PathSegment::Key(_)) => {
                return Err(PatchError::TypeMismatch { path: here(), expected: "array index" });
            }
            _ => {
                return Err(PatchError::TypeMismatch { path: here(), expected: "object or array" });
            }
        };
    }
    Ok(current)
}

/// Renders a path as a JSON pointer.
fn render(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.iter().map(|segment| format!("/{segment}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepsnap_common::types::{Scope, Source, StackFrame, Variable};

    fn snapshot(line: i64, n: &str, stdout: Option<&str>) -> Snapshot {
        Snapshot {
            stack_frames: vec![StackFrame {
                id: 1,
                name: "main".to_string(),
                source: Some(Source { name: None, path: Some("/tmp/main.py".to_string()) }),
                line,
                column: 1,
                user_frame: true,
                scopes: vec![Scope {
                    name: "Locals".to_string(),
                    variables_reference: 2,
                    expensive: false,
                    variables: vec![Variable {
                        name: "n".to_string(),
                        value: n.to_string(),
                        ..Default::default()
                    }],
                }],
            }],
            stdout: stdout.map(|line| vec![line.to_string()]),
            ..Default::default()
        }
    }

    #[test]
    fn test_diff_objects() {
        let patches = diff(&json!({ "a": 1, "b": 2 }), &json!({ "b": 3, "c": null }));
        assert_eq!(
            patches,
            vec![
                Patch::Remove { path: vec!["a".into()] },
                Patch::Replace { path: vec!["b".into()], value: json!(3) },
                Patch::Add { path: vec!["c".into()], value: json!(null) },
            ]
        );
    }

    #[test]
    fn test_diff_arrays() {
        let grow = diff(&json!([1, 2]), &json!([1, 5, 6, 7]));
        assert_eq!(
            grow,
            vec![
                Patch::Replace { path: vec![1.into()], value: json!(5) },
                Patch::Add { path: vec![2.into()], value: json!(6) },
                Patch::Add { path: vec![3.into()], value: json!(7) },
            ]
        );

        let shrink = diff(&json!([1, 2, 3]), &json!([1]));
        assert_eq!(
            shrink,
            vec![Patch::Remove { path: vec![2.into()] }, Patch::Remove { path: vec![1.into()] }]
        );

        let mut document = json!([1, 2, 3]);
        apply_all(&mut document, &shrink).unwrap();
        assert_eq!(document, json!([1]));
    }

    #[test]
    fn test_diff_type_change_and_root() {
        assert_eq!(
            diff(&json!({ "a": [1] }), &json!({ "a": { "b": 1 } })),
            vec![Patch::Replace { path: vec!["a".into()], value: json!({ "b": 1 }) }]
        );
        assert_eq!(
            diff(&json!(1), &json!("x")),
            vec![Patch::Replace { path: vec![], value: json!("x") }]
        );
        let nested = json!({ "a": [1, { "b": null }] });
        assert!(diff(&nested, &nested.clone()).is_empty());
    }

    #[test]
    fn test_patch_json_shape() {
        let patch = Patch::Add {
            path: vec!["stackFrames".into(), 0.into(), "line".into()],
            value: json!(4),
        };
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({ "op": "add", "path": ["stackFrames", 0, "line"], "value": 4 })
        );

        let back: Patch =
            serde_json::from_value(json!({ "op": "remove", "path": ["stdout", 1] })).unwrap();
        assert_eq!(back, Patch::Remove { path: vec!["stdout".into(), 1.into()] });
    }

    #[test]
    fn test_compress_and_reconstruct() {
        let snapshots = vec![
            snapshot(1, "0", None),
            snapshot(2, "1", Some("A")),
            snapshot(2, "1", Some("A")),
            snapshot(3, "2", None),
        ];
        let steps = compress(&snapshots).unwrap();
        assert_eq!(steps.len(), 4);
        // Identical neighbours produce an empty step
        assert!(steps[2].is_empty());
        assert_eq!(
            steps[3],
            vec![
                Patch::Remove { path: vec!["stdout".into()] },
                Patch::Replace {
                    path: vec!["stackFrames".into(), 0.into(), "line".into()],
                    value: json!(3)
                },
                Patch::Replace {
                    path: vec![
                        "stackFrames".into(),
                        0.into(),
                        "scopes".into(),
                        0.into(),
                        "variables".into(),
                        0.into(),
                        "value".into()
                    ],
                    value: json!("2")
                },
            ]
        );
        assert_eq!(reconstruct(&steps).unwrap(), snapshots);
    }

    #[test]
    fn test_empty_recording() {
        let steps = Steps::from_snapshots(&[]).unwrap();
        assert!(steps.is_empty());
        assert_eq!(serde_json::to_value(&steps).unwrap(), json!({ "steps": [] }));
        assert!(steps.snapshots().unwrap().is_empty());
    }

    #[test]
    fn test_terminated_snapshot_round_trips() {
        let mut last = snapshot(9, "3", Some("B"));
        last.terminated = true;
        last.terminated_reason = Some("Time limit of 1 seconds exceeded".to_string());
        let snapshots = vec![snapshot(1, "0", None), last, Snapshot::default()];

        let steps = Steps::from_snapshots(&snapshots).unwrap();
        let encoded = serde_json::to_string(&steps).unwrap();
        let decoded: Steps = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.snapshots().unwrap(), snapshots);
    }

    #[test]
    fn test_apply_errors() {
        let mut document = json!({ "a": [1] });

        let missing = Patch::Remove { path: vec!["b".into()] };
        assert!(matches!(apply(&mut document, &missing), Err(PatchError::InvalidPath { .. })));

        let out_of_bounds = Patch::Add { path: vec!["a".into(), 5.into()], value: json!(0) };
        assert!(matches!(
            apply(&mut document, &out_of_bounds),
            Err(PatchError::InvalidPath { path }) if path == "/a/5"
        ));

        let key_on_array = Patch::Replace { path: vec!["a".into(), "x".into()], value: json!(0) };
        assert!(matches!(
            apply(&mut document, &key_on_array),
            Err(PatchError::TypeMismatch { expected: "array index", .. })
        ));

        let through_scalar =
            Patch::Add { path: vec!["a".into(), 0.into(), "x".into()], value: json!(0) };
        assert!(matches!(
            apply(&mut document, &through_scalar),
            Err(PatchError::TypeMismatch { .. })
        ));

        let remove_root = Patch::Remove { path: vec![] };
        assert!(apply(&mut document, &remove_root).is_err());

        // Nothing was modified by the failed patches
        assert_eq!(document, json!({ "a": [1] }));
    }
}
