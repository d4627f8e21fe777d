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

//! Reconstruct command - expands a steps file into full snapshots

use std::fs;

use eyre::{Result, WrapErr};
use stepsnap_engine::Steps;

use super::write_json;
use crate::ReconstructArgs;

/// Rebuilds the snapshots recorded in `args.steps`.
pub fn reconstruct(args: ReconstructArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.steps)
        .wrap_err_with(|| format!("failed to read {}", args.steps.display()))?;
    let steps: Steps = serde_json::from_str(&raw)
        .wrap_err_with(|| format!("{} is not a steps file", args.steps.display()))?;

    let snapshots = steps.snapshots()?;
    tracing::info!("Reconstructed {} snapshots", snapshots.len());

    write_json(args.output.as_deref(), &snapshots, args.pretty)
}
