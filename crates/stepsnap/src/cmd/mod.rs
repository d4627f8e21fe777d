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

//! Command modules for the StepSnap CLI

pub mod reconstruct;
pub mod run;

pub use reconstruct::reconstruct;
pub use run::run;

use std::{fs, path::Path};

use eyre::{Result, WrapErr};
use serde::Serialize;

/// Writes `value` as JSON to `output`, or to stdout.
pub fn write_json<T: Serialize>(output: Option<&Path>, value: &T, pretty: bool) -> Result<()> {
    let json =
        if pretty { serde_json::to_string_pretty(value)? } else { serde_json::to_string(value)? };
    match output {
        Some(path) => {
            fs::write(path, json).wrap_err_with(|| format!("failed to write {}", path.display()))
        }
        None => {
            println!("{json}");
            Ok(())
        }
    }
}
