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

//! Initial breakpoint installation.

use std::path::Path;

use stepsnap_common::types::BreakpointSpec;
use tracing::debug;

use crate::{
    dap::{DebugClient, SetBreakpointsResponseBody},
    DapError, SessionError,
};

/// Outcome of [`install`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstalledBreakpoints {
    /// Lines sent in the first request
    pub requested: Vec<u32>,
    /// Lines the backend holds once installation is over
    pub verified: Vec<u32>,
}

impl InstalledBreakpoints {
    /// Whether every requested line was verified
    pub fn is_complete(&self) -> bool {
        self.requested.len() == self.verified.len()
    }
}

/// Installs the breakpoints of `spec` on `source_path`.
///
/// All candidate lines go out in one request. If the backend does not verify
/// all of them, only the verified ones are submitted again so the backend does
/// not keep unverified or shifted breakpoints around. Partial coverage is not
/// an error: lines without code never verify.
pub async fn install(
    client: &dyn DebugClient,
    source_path: &Path,
    spec: &BreakpointSpec,
) -> Result<InstalledBreakpoints, SessionError> {
    let source = tokio::fs::read_to_string(source_path)
        .await
        .map_err(|source| SessionError::SourceRead { path: source_path.to_path_buf(), source })?;
    let requested = spec.candidate_lines(source.split('\n').count());

    debug!(?source_path, %spec, count = requested.len(), "setting breakpoints");
    let response = client
        .set_breakpoints(source_path, &requested)
        .await
        .map_err(|e| SessionError::BackendConnect(e.into()))?;

    let verified = verified_lines(&requested, &response);
    if verified.len() == requested.len() {
        return Ok(InstalledBreakpoints { requested, verified });
    }

    debug!(
        requested = requested.len(),
        verified = verified.len(),
        "resubmitting verified breakpoints only"
    );
    client
        .set_breakpoints(source_path, &verified)
        .await
        .map_err(|e| SessionError::BackendConnect(e.into()))?;
    Ok(InstalledBreakpoints { requested, verified })
}

/// Removes every breakpoint of `source_path`.
pub async fn clear(client: &dyn DebugClient, source_path: &Path) -> Result<(), DapError> {
    client.set_breakpoints(source_path, &[]).await.map(drop)
}

/// Verified lines of a `setBreakpoints` response, in request order and
/// without duplicates. The line the backend reports wins over the requested
/// one.
fn verified_lines(requested: &[u32], response: &SetBreakpointsResponseBody) -> Vec<u32> {
    let mut verified = Vec::new();
    for (index, breakpoint) in response.breakpoints.iter().enumerate() {
        if !breakpoint.verified {
            continue;
        }
        let line = breakpoint
            .line
            .and_then(|line| u32::try_from(line).ok())
            .filter(|&line| line > 0)
            .or_else(|| requested.get(index).copied());
        if let Some(line) = line {
            if !verified.contains(&line) {
                verified.push(line);
            }
        }
    }
    verified
}
