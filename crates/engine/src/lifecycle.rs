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

//! Session resources and their teardown.
//!
//! Everything a session acquires (event subscriptions, subprocesses, files) is
//! registered in its [`Cleanables`] and released by [`Lifecycle::teardown`],
//! which runs exactly once per session whatever the way the session ended.

use std::{
    fmt,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use tokio::process::Child;
use tracing::{debug, warn};

use crate::{adapter::BackendAdapter, dap::DebugClient};

/// A resource released on teardown
pub enum Cleanable {
    /// An event subscription, released by calling the closure.
    Subscription(Box<dyn FnOnce() + Send>),
    /// A spawned subprocess, killed.
    Process(Child),
    /// A file or directory, deleted if it lies inside the data directory.
    Path(PathBuf),
}

impl fmt::Debug for Cleanable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscription(_) => f.write_str("Subscription"),
            Self::Process(child) => write!(f, "Process({:?})", child.id()),
            Self::Path(path) => write!(f, "Path({path:?})"),
        }
    }
}

/// Resources owned by one session
#[derive(Debug, Default)]
pub struct Cleanables {
    items: Vec<Cleanable>,
}

impl Cleanables {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource.
    pub fn push(&mut self, cleanable: Cleanable) {
        self.items.push(cleanable);
    }

    /// Registers a subscription release.
    pub fn track_subscription(&mut self, release: impl FnOnce() + Send + 'static) {
        self.push(Cleanable::Subscription(Box::new(release)));
    }

    /// Registers a subprocess.
    pub fn track_process(&mut self, child: Child) {
        self.push(Cleanable::Process(child));
    }

    /// Registers a file or directory.
    pub fn track_path(&mut self, path: impl Into<PathBuf>) {
        self.push(Cleanable::Path(path.into()));
    }

    /// Number of registered resources
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Teardown state of a session
#[derive(Debug)]
pub struct Lifecycle {
    uid: u16,
    data_dir: PathBuf,
    cleanables: Cleanables,
    destroyed: bool,
}

impl Lifecycle {
    /// Creates the lifecycle of session `uid`. Paths are only ever deleted
    /// below `data_dir`.
    pub fn new(uid: u16, data_dir: impl Into<PathBuf>) -> Self {
        Self { uid, data_dir: data_dir.into(), cleanables: Cleanables::new(), destroyed: false }
    }

    /// Resources of the session
    pub fn cleanables_mut(&mut self) -> &mut Cleanables {
        &mut self.cleanables
    }

    /// Whether teardown already ran
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Releases every resource of the session.
    ///
    /// Order: subscriptions, processes, paths, transport, `disconnect`,
    /// adapter cleanup. Failures are logged and otherwise ignored. Calling it
    /// again is a no-op.
    pub async fn teardown(
        &mut self,
        client: Option<&Arc<dyn DebugClient>>,
        adapter: &dyn BackendAdapter,
    ) {
        if self.destroyed {
            debug!(session = self.uid, "teardown already performed");
            return;
        }
        debug!(session = self.uid, resources = self.cleanables.len(), "tearing down session");

        let mut processes = Vec::new();
        let mut paths = Vec::new();
        for cleanable in self.cleanables.items.drain(..) {
            match cleanable {
                Cleanable::Subscription(release) => release(),
                Cleanable::Process(child) => processes.push(child),
                Cleanable::Path(path) => paths.push(path),
            }
        }

        for mut child in processes {
            let pid = child.id();
            if let Err(e) = child.kill().await {
                debug!(session = self.uid, ?pid, "failed to kill subprocess: {e}");
            }
        }

        for path in paths {
            remove_path(&self.data_dir, &path).await;
        }

        if let Some(client) = client {
            client.close_transport().await;
            if let Err(e) = client.disconnect().await {
                debug!(session = self.uid, "disconnect failed: {e}");
            }
        }

        adapter.after_teardown().await;
        self.destroyed = true;
        debug!(session = self.uid, "session destroyed");
    }
}

async fn remove_path(data_dir: &Path, path: &Path) {
    let escapes = path.components().any(|component| matches!(component, Component::ParentDir));
    if escapes || !path.starts_with(data_dir) {
        warn!(?path, ?data_dir, "refusing to delete a path outside of the data directory");
        return;
    }

    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        // Already gone
        Err(_) => return,
    };
    if let Err(e) = result {
        debug!(?path, "failed to delete: {e}");
    }
}
