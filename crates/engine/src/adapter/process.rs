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

//! Subprocess helpers shared by adapters.

use std::{fs::File, process::Stdio, time::Duration};

use eyre::{eyre, Result, WrapErr};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::mpsc,
};
use tracing::{debug, trace};

use super::OutputSink;
use crate::{dap::OutputEventBody, lifecycle::Cleanables};

/// Spawns a debug adapter server and waits until one of its output lines
/// contains `ready_marker`. The server reads `stdin` if given.
///
/// The process is registered in `cleanables` as soon as it is spawned, so a
/// server that never gets ready is still killed on teardown. Its output keeps
/// being drained afterwards.
pub async fn spawn_adapter_server(
    mut command: Command,
    stdin: Option<File>,
    ready_marker: &str,
    cleanables: &mut Cleanables,
    timeout: Duration,
) -> Result<()> {
    let stdin = stdin.map(Stdio::from).unwrap_or_else(Stdio::null);
    command.stdin(stdin).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);

    let description = format!("{:?}", command.as_std());
    debug!("spawning debug adapter server: {description}");
    let mut child =
        command.spawn().wrap_err_with(|| format!("failed to spawn {description}"))?;

    let (line_tx, mut line_rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(drain_lines(stdout, "stdout", line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_lines(stderr, "stderr", line_tx));
    }
    cleanables.track_process(child);

    let ready = async {
        while let Some(line) = line_rx.recv().await {
            if line.contains(ready_marker) {
                return Ok(());
            }
        }
        Err(eyre!("{description} exited before listening"))
    };
    tokio::time::timeout(timeout, ready)
        .await
        .map_err(|_| eyre!("{description} not ready after {timeout:?}"))?
}

async fn drain_lines<R>(reader: R, origin: &'static str, lines: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        trace!(origin, "[adapter] {line}");
        // Nobody listens once the server is ready
        let _ = lines.send(line);
    }
}

/// Forwards everything `reader` produces to the session as output of
/// `category` (`stdout` or `stderr`), one chunk per line.
pub async fn forward_output<R>(reader: R, category: &'static str, sink: OutputSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let output = OutputEventBody {
                    category: Some(category.to_string()),
                    output: line.clone(),
                };
                if sink.send(output).is_err() {
                    break;
                }
            }
        }
    }
}
