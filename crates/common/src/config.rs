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

//! Configuration system for StepSnap
//!
//! Settings live in a TOML file (`~/.stepsnap.toml` by default). Every field
//! has a default so a partial file, or no file at all, is valid.

use std::{
    fs,
    ops::Range,
    path::{Path, PathBuf},
    time::Duration,
};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{DEFAULT_UID_RANGE_END, DEFAULT_UID_RANGE_START};

/// Default wall-clock budget of a session, in seconds.
pub const DEFAULT_TIME_LIMIT_SECS: u64 = 600;
/// Default timeout of a single debug adapter request, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
/// Default number of bytes read for variables exposing a memory reference.
pub const DEFAULT_MEMORY_READ_BYTES: u32 = 0;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StepsnapConfig {
    /// Directory holding compiled binaries and temporary sources.
    /// Teardown never deletes anything outside of it.
    pub data_dir: PathBuf,
    /// Session ids, which double as debug adapter ports.
    pub uid_range: Range<u16>,
    /// Wall-clock budget of a session
    pub time_limit_secs: u64,
    /// Timeout of a single debug adapter request
    pub request_timeout_secs: u64,
    /// Bytes read for variables with a memory reference, 0 disables reads
    pub memory_read_bytes: u32,
    /// Native backend settings
    pub lldb: LldbConfig,
    /// Python backend settings
    pub python: PythonConfig,
}

/// Native (C and C++) backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LldbConfig {
    /// Path of the CodeLLDB adapter executable
    pub codelldb: PathBuf,
    /// Path of the liblldb shared library handed to the adapter
    pub liblldb: Option<PathBuf>,
    /// C compiler
    pub c_compiler: String,
    /// C++ compiler
    pub cpp_compiler: String,
}

/// Python backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PythonConfig {
    /// Interpreter used to run both `debugpy.adapter` and the debuggee
    pub interpreter: String,
}

impl Default for StepsnapConfig {
    fn default() -> Self {
        Self {
            data_dir: std::env::temp_dir().join("stepsnap"),
            uid_range: DEFAULT_UID_RANGE_START..DEFAULT_UID_RANGE_END,
            time_limit_secs: DEFAULT_TIME_LIMIT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            memory_read_bytes: DEFAULT_MEMORY_READ_BYTES,
            lldb: LldbConfig::default(),
            python: PythonConfig::default(),
        }
    }
}

impl Default for LldbConfig {
    fn default() -> Self {
        Self {
            codelldb: PathBuf::from("codelldb"),
            liblldb: None,
            c_compiler: "gcc".to_string(),
            cpp_compiler: "g++".to_string(),
        }
    }
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self { interpreter: "python3".to_string() }
    }
}

impl StepsnapConfig {
    /// Get the default config file path (~/.stepsnap.toml)
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs_next::home_dir()
            .ok_or_else(|| eyre::eyre!("Unable to determine home directory"))?;
        Ok(home.join(".stepsnap.toml"))
    }

    /// Load configuration from `path`, falling back to defaults if it doesn't exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path:?}"))?;
        let config: Self =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;
        config.validate()?;

        debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {parent:?}"))?;
        }
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {path:?}"))?;

        debug!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Rejects settings no session could run with.
    pub fn validate(&self) -> Result<()> {
        if self.uid_range.is_empty() {
            eyre::bail!("uid_range {:?} is empty", self.uid_range);
        }
        if self.time_limit_secs == 0 {
            eyre::bail!("time_limit_secs must be positive");
        }
        if self.request_timeout_secs == 0 {
            eyre::bail!("request_timeout_secs must be positive");
        }
        Ok(())
    }

    /// Wall-clock budget of a session
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }

    /// Timeout of a single debug adapter request
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
