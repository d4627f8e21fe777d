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

//! Run command - records a program and writes its steps

use std::sync::Arc;

use eyre::{Result, WrapErr};
use stepsnap_common::{StepsnapConfig, UidAllocator};
use stepsnap_engine::{backend_for_source, Session, SessionOptions};

use super::write_json;
use crate::RunArgs;

/// Records the execution of `args.source`.
pub async fn run(args: RunArgs, mut config: StepsnapConfig) -> Result<()> {
    if let Some(time_limit) = args.time_limit {
        config.time_limit_secs = time_limit;
    }
    config.validate()?;

    // Step 1: Pick the backend from the file extension
    let adapter = backend_for_source(&args.source, &config)?;
    tracing::info!("Recording {} with {}", args.source.display(), adapter.name());

    // Step 2: Build the session options
    let mut options =
        SessionOptions::new(&args.source, &config).with_breakpoints(args.breakpoints);
    if let Some(input) = &args.input {
        let input = std::path::absolute(input)
            .wrap_err_with(|| format!("invalid input path {}", input.display()))?;
        options = options.with_input(input);
    }
    for file in &args.tracked_files {
        options = options.with_tracked_file(file);
    }

    // Step 3: Run the program to its end, Ctrl+C ends the session early
    let allocator = Arc::new(UidAllocator::new(config.uid_range.start, config.uid_range.end));
    let handle = Session::start(adapter, allocator, options, None).await?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, terminating session {}", handle.uid());
            handle.terminate();
        }
        _ = handle.terminated() => {}
    }
    let outcome = handle.wait().await?;

    tracing::info!(
        "Recorded {} snapshots ({})",
        outcome.snapshots.len(),
        outcome.termination
    );

    // Step 4: Compress and write the recording
    let steps = outcome.steps()?;
    write_json(args.output.as_deref(), &steps, args.pretty)
}
