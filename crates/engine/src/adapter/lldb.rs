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

//! C and C++ through CodeLLDB.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use parking_lot::Mutex;
use serde_json::{json, Value};
use stepsnap_common::{config::LldbConfig, StepsnapConfig};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::{
    forward_output, spawn_adapter_server, spawn_launch, BackendAdapter, ConnectParams,
    DigPredicates, Language, OutputSink,
};
use crate::{
    dap::{
        DapClient, DapScope, DapVariable, DebugClient, DebugEvent, InitializeArguments,
        RunInTerminalArguments,
    },
    lifecycle::Cleanables,
    CompilationError,
};

const READY_MARKER: &str = "Listening on port";
const SERVER_READY_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_ATTEMPTS: usize = 20;

/// Adapter for native programs
///
/// One instance per session: it remembers the executable it compiled so that
/// [`BackendAdapter::after_teardown`] can delete it.
#[derive(Debug)]
pub struct LldbAdapter {
    language: Language,
    lldb: LldbConfig,
    data_dir: PathBuf,
    request_timeout: Duration,
    memory_read_bytes: u32,
    executable: Mutex<Option<PathBuf>>,
}

impl LldbAdapter {
    /// Creates the adapter of `language`, which must be C or C++.
    pub fn new(language: Language, config: &StepsnapConfig) -> Self {
        Self {
            language,
            lldb: config.lldb.clone(),
            data_dir: config.data_dir.clone(),
            request_timeout: config.request_timeout(),
            memory_read_bytes: config.memory_read_bytes,
            executable: Mutex::new(None),
        }
    }

    fn compiler(&self) -> &str {
        match self.language {
            Language::Cpp => &self.lldb.cpp_compiler,
            _ => &self.lldb.c_compiler,
        }
    }

    /// Builds `source` with debug information into the data directory.
    async fn compile(&self, source: &Path, uid: u16) -> Result<PathBuf> {
        let stem = source.file_stem().and_then(|stem| stem.to_str()).unwrap_or("program");
        let output_dir = self.data_dir.join("bin");
        tokio::fs::create_dir_all(&output_dir)
            .await
            .wrap_err_with(|| format!("failed to create {output_dir:?}"))?;
        let executable = output_dir.join(format!("{stem}-{uid}"));

        debug!(compiler = self.compiler(), ?source, ?executable, "compiling program");
        let output = Command::new(self.compiler())
            .arg("-g")
            .arg(source)
            .arg("-o")
            .arg(&executable)
            .arg("-ldl")
            .stdin(Stdio::null())
            .output()
            .await
            .wrap_err_with(|| format!("failed to run {}", self.compiler()))?;

        if !output.status.success() {
            let message = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
            return Err(CompilationError { message }.into());
        }
        Ok(executable)
    }

    fn launch_arguments(&self, executable: &Path, input_path: &Path) -> Value {
        let mut arguments = json!({
            "program": executable,
            "stdio": [input_path, null, null],
            "terminal": "console",
        });
        if self.language == Language::C {
            arguments["initCommands"] = json!(["settings set target.disable-aslr false"]);
        }
        arguments
    }
}

impl DigPredicates for LldbAdapter {
    fn can_dig_scope(&self, scope: &DapScope) -> bool {
        scope.name != "Registers"
    }

    fn can_dig_variable(&self, variable: &DapVariable) -> bool {
        !variable.name.starts_with("std::")
    }
}

#[async_trait]
impl BackendAdapter for LldbAdapter {
    fn name(&self) -> &str {
        "lldb"
    }

    async fn connect(&self, params: ConnectParams<'_>) -> Result<Arc<dyn DebugClient>> {
        let ConnectParams { uid, program_path, input_path, cleanables, output } = params;

        let executable = self.compile(program_path, uid).await?;
        *self.executable.lock() = Some(executable.clone());

        let mut server = Command::new(&self.lldb.codelldb);
        if let Some(liblldb) = &self.lldb.liblldb {
            server.arg("--liblldb").arg(liblldb);
        }
        server.arg("--port").arg(uid.to_string());
        spawn_adapter_server(server, None, READY_MARKER, cleanables, SERVER_READY_TIMEOUT).await?;

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, uid));
        let client: Arc<dyn DebugClient> = Arc::new(
            DapClient::connect_with_retry(addr, self.request_timeout, CONNECT_ATTEMPTS).await?,
        );

        let capabilities =
            client.initialize(InitializeArguments::new(self.language.adapter_id())).await?;
        debug!(?capabilities, "codelldb initialized");

        let arguments = self.launch_arguments(&executable, input_path);
        launch_in_terminal(&client, arguments, cleanables, &output).await?;

        Ok(client)
    }

    fn memory_read_bytes(&self) -> u32 {
        self.memory_read_bytes
    }

    async fn after_teardown(&self) {
        let executable = self.executable.lock().take();
        if let Some(executable) = executable {
            debug!(?executable, "removing executable");
            // Already deleted is fine
            let _ = tokio::fs::remove_file(&executable).await;
        }
    }
}

/// Launches the program. CodeLLDB either answers the launch or asks us to
/// start the program in a terminal first.
async fn launch_in_terminal(
    client: &Arc<dyn DebugClient>,
    arguments: Value,
    cleanables: &mut Cleanables,
    output: &OutputSink,
) -> Result<()> {
    let mut subscription = client.subscribe();
    let mut launch = spawn_launch(client, arguments, "codelldb");
    loop {
        tokio::select! {
            launched = &mut launch => {
                launched.wrap_err("launch task failed")?.wrap_err("launch failed")?;
                break;
            }
            event = subscription.events.recv() => match event {
                Some(DebugEvent::RunInTerminal { seq, arguments }) => {
                    let child = run_in_terminal(&arguments, output)?;
                    let process_id = child.id();
                    cleanables.track_process(child);
                    client
                        .respond(seq, "runInTerminal", json!({ "processId": process_id }))
                        .await?;
                    info!(?process_id, "started program in terminal");
                    break;
                }
                Some(DebugEvent::Output(body)) => {
                    let _ = output.send(body);
                }
                Some(other) => debug!(?other, "event during launch"),
                None => return Err(eyre!("codelldb closed the connection during launch")),
            },
        }
    }
    client.unsubscribe(subscription.id);
    Ok(())
}

/// Runs the command of a `runInTerminal` request, forwarding its output to
/// the session.
fn run_in_terminal(arguments: &RunInTerminalArguments, output: &OutputSink) -> Result<Child> {
    let (program, args) =
        arguments.args.split_first().ok_or_else(|| eyre!("runInTerminal without a command"))?;

    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    command.kill_on_drop(true);
    if !arguments.cwd.is_empty() {
        command.current_dir(&arguments.cwd);
    }
    for (key, value) in arguments.env.iter().flatten() {
        match value {
            Some(value) => command.env(key, value),
            None => command.env_remove(key),
        };
    }

    let mut child = command.spawn().wrap_err_with(|| format!("failed to run {program}"))?;
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_output(stdout, "stdout", output.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(stderr, "stderr", output.clone()));
    }
    Ok(child)
}
