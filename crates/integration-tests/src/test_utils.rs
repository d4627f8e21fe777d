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

//! Test utilities for integration tests

/// Initialization utilities for tests
pub mod init {
    /// Initialize test logging, once per test binary
    pub fn init_test_environment() {
        stepsnap_common::logging::ensure_test_logging(None);
    }
}

/// Source files and configuration of a test session
pub mod fixtures {
    use std::{
        fmt::Write,
        fs,
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    };

    use stepsnap_common::{StepsnapConfig, UidAllocator};
    use stepsnap_engine::SessionOptions;
    use tempfile::TempDir;

    /// A source file inside a scratch directory, with a configuration whose
    /// data directory lives next to it
    pub struct SessionFixture {
        /// Keeps the scratch directory alive
        pub dir: TempDir,
        /// Canonical path of the source file
        pub source: PathBuf,
        /// Configuration pointing at the scratch directory
        pub config: StepsnapConfig,
    }

    impl SessionFixture {
        /// Creates `main.c` with `lines` lines.
        pub fn new(lines: usize) -> Self {
            Self::with_file("main.c", lines)
        }

        /// Creates `name` with `lines` lines.
        pub fn with_file(name: &str, lines: usize) -> Self {
            let dir = tempfile::tempdir().expect("failed to create scratch directory");
            let source = write_source(dir.path(), name, lines);
            let config = StepsnapConfig {
                data_dir: dir.path().join("data"),
                uid_range: 4711..4715,
                time_limit_secs: 10,
                ..Default::default()
            };
            Self { dir, source, config }
        }

        /// Session options for the source file.
        pub fn options(&self) -> SessionOptions {
            SessionOptions::new(&self.source, &self.config)
        }

        /// Session options with a short time limit.
        pub fn options_with_time_limit(&self, time_limit: Duration) -> SessionOptions {
            self.options().with_time_limit(time_limit)
        }

        /// An allocator over the configured id range.
        pub fn allocator(&self) -> Arc<UidAllocator> {
            Arc::new(UidAllocator::new(self.config.uid_range.start, self.config.uid_range.end))
        }

        /// Directory sessions keep their scratch files in
        pub fn data_dir(&self) -> &Path {
            &self.config.data_dir
        }
    }

    /// Writes a source file of `lines` numbered statements, returning its
    /// canonical path.
    pub fn write_source(dir: &Path, name: &str, lines: usize) -> PathBuf {
        let mut contents = String::new();
        for line in 1..=lines {
            let _ = write!(contents, "statement_{line};");
            if line < lines {
                contents.push('\n');
            }
        }
        let path = dir.join(name);
        fs::write(&path, contents).expect("failed to write source file");
        fs::canonicalize(&path).expect("failed to canonicalize source file")
    }
}

/// Running sessions to completion
pub mod session {
    use std::{sync::Arc, time::Duration};

    use stepsnap_common::{types::Snapshot, UidAllocator};
    use stepsnap_engine::{
        BackendAdapter, Session, SessionError, SessionEvent, SessionHandle, SessionOptions,
        SessionOutcome, SessionState,
    };
    use tokio::sync::mpsc;
    use tracing::info;

    /// How long a test waits for a session to end
    pub const SESSION_DEADLINE: Duration = Duration::from_secs(10);

    /// A finished session and everything it emitted
    #[derive(Debug)]
    pub struct Recording {
        /// Outcome returned by the session
        pub outcome: SessionOutcome,
        /// Events, in emission order
        pub events: Vec<SessionEvent>,
    }

    impl Recording {
        /// Snapshots that went through the event stream
        pub fn streamed_snapshots(&self) -> Vec<&Snapshot> {
            self.events
                .iter()
                .filter_map(|event| match event {
                    SessionEvent::Snapshot(snapshot) => Some(snapshot),
                    SessionEvent::Terminated(_) => None,
                })
                .collect()
        }

        /// Number of termination events
        pub fn termination_events(&self) -> usize {
            self.events
                .iter()
                .filter(|event| matches!(event, SessionEvent::Terminated(_)))
                .count()
        }
    }

    /// Starts a session streaming its events.
    pub async fn start(
        adapter: Arc<dyn BackendAdapter>,
        allocator: Arc<UidAllocator>,
        options: SessionOptions,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Session::start(adapter, allocator, options, Some(tx)).await?;
        Ok((handle, rx))
    }

    /// Waits for a started session to end and collects its events.
    pub async fn finish(
        handle: SessionHandle,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Recording {
        let outcome = tokio::time::timeout(SESSION_DEADLINE, handle.wait())
            .await
            .expect("session did not end in time")
            .expect("session task failed");

        let mut collected = Vec::new();
        while let Ok(event) = events.try_recv() {
            collected.push(event);
        }
        info!(
            snapshots = outcome.snapshots.len(),
            termination = %outcome.termination,
            "session finished"
        );
        Recording { outcome, events: collected }
    }

    /// Runs a session to its end.
    pub async fn record(
        adapter: Arc<dyn BackendAdapter>,
        allocator: Arc<UidAllocator>,
        options: SessionOptions,
    ) -> Recording {
        let (handle, events) =
            start(adapter, allocator, options).await.expect("session failed to start");
        finish(handle, events).await
    }

    /// Waits for the next snapshot event.
    pub async fn next_snapshot(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Snapshot {
        loop {
            let event = tokio::time::timeout(SESSION_DEADLINE, events.recv())
                .await
                .expect("no snapshot in time")
                .expect("session ended without a snapshot");
            if let SessionEvent::Snapshot(snapshot) = event {
                return snapshot;
            }
        }
    }

    /// Waits until the session reaches `state`.
    pub async fn wait_for_state(handle: &SessionHandle, state: SessionState) {
        tokio::time::timeout(SESSION_DEADLINE, async {
            while handle.state() != state {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("session never reached {state:?}"));
    }
}
