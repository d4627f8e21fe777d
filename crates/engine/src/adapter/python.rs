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

//! Python through debugpy.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use serde_json::{json, Value};
use stepsnap_common::StepsnapConfig;
use tokio::process::Command;
use tracing::debug;

use super::{
    spawn_adapter_server, spawn_launch, BackendAdapter, ConnectParams, DigPredicates, Language,
    OutputSink,
};
use crate::dap::{
    DapClient, DapVariable, DebugClient, DebugEvent, EventSubscription, InitializeArguments,
};

const READY_MARKER: &str = "Listening for incoming Client connections";
const SERVER_READY_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_ATTEMPTS: usize = 20;

/// Housekeeping entries debugpy groups variables under
const UNDIGGABLE_NAMES: [&str; 4] =
    ["special variables", "function variables", "class variables", "__builtins__"];
const UNDIGGABLE_TYPES: [&str; 1] = ["module"];

/// Adapter for Python programs
#[derive(Debug, Clone)]
pub struct PythonAdapter {
    interpreter: String,
    request_timeout: Duration,
}

impl PythonAdapter {
    /// Creates the adapter.
    pub fn new(config: &StepsnapConfig) -> Self {
        Self {
            interpreter: config.python.interpreter.clone(),
            request_timeout: config.request_timeout(),
        }
    }
}

impl DigPredicates for PythonAdapter {
    fn can_dig_variable(&self, variable: &DapVariable) -> bool {
        if UNDIGGABLE_NAMES.contains(&variable.name.as_str()) {
            return false;
        }
        !variable.type_name.as_deref().is_some_and(|ty| UNDIGGABLE_TYPES.contains(&ty))
    }
}

#[async_trait]
impl BackendAdapter for PythonAdapter {
    fn name(&self) -> &str {
        "debugpy"
    }

    async fn connect(&self, params: ConnectParams<'_>) -> Result<Arc<dyn DebugClient>> {
        let ConnectParams { uid, program_path, input_path, cleanables, output } = params;

        // The debuggee inherits the adapter's standard input
        let stdin = std::fs::File::open(input_path)
            .wrap_err_with(|| format!("failed to open input file {input_path:?}"))?;

        let mut server = Command::new(&self.interpreter);
        server
            .args(["-m", "debugpy.adapter", "--host", "127.0.0.1", "--port"])
            .arg(uid.to_string())
            .arg("--log-stderr");
        spawn_adapter_server(server, Some(stdin), READY_MARKER, cleanables, SERVER_READY_TIMEOUT)
            .await?;

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, uid));
        let client: Arc<dyn DebugClient> = Arc::new(
            DapClient::connect_with_retry(addr, self.request_timeout, CONNECT_ATTEMPTS).await?,
        );

        let subscription = client.subscribe();
        let capabilities =
            client.initialize(InitializeArguments::new(Language::Python.adapter_id())).await?;
        debug!(?capabilities, "debugpy initialized");

        let arguments = json!({
            "program": program_path,
            "python": [&self.interpreter],
            "justMyCode": true,
            "console": "internalConsole",
        });
        launch_until_initialized(&client, subscription, arguments, &output).await?;

        Ok(client)
    }
}

/// Launches the program and waits until debugpy accepts its configuration.
///
/// debugpy only answers the launch after `configurationDone`, the
/// `initialized` event is the signal to go on.
async fn launch_until_initialized(
    client: &Arc<dyn DebugClient>,
    mut subscription: EventSubscription,
    arguments: Value,
    output: &OutputSink,
) -> Result<()> {
    let mut launch = spawn_launch(client, arguments, "debugpy");
    loop {
        tokio::select! {
            launched = &mut launch => {
                launched.wrap_err("launch task failed")?.wrap_err("launch failed")?;
                break;
            }
            event = subscription.events.recv() => match event {
                Some(DebugEvent::Initialized) => break,
                Some(DebugEvent::Output(body)) => {
                    let _ = output.send(body);
                }
                Some(other) => debug!(?other, "event during launch"),
                None => return Err(eyre!("debugpy closed the connection during launch")),
            },
        }
    }
    client.unsubscribe(subscription.id);
    Ok(())
}
