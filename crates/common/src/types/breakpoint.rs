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

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The literal that requests a breakpoint on every line of the source file.
pub const WILDCARD: &str = "*";

/// Error returned when a breakpoint specification cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BreakpointSpecError {
    /// One of the comma-separated entries is not a positive integer.
    #[error("invalid breakpoint line {entry:?}: expected a 1-based line number")]
    InvalidLine {
        /// The offending entry, trimmed.
        entry: String,
    },
}

/// Which lines of the main source file should receive breakpoints.
///
/// Parsed from the caller-facing string form: `*` for every line, or a
/// comma-separated list of 1-based line numbers (`"1,2,6,42"`). The empty
/// string installs no breakpoints at all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BreakpointSpec {
    /// A breakpoint on every line of the file.
    All,
    /// Breakpoints on the listed lines only, in the order given.
    Lines(Vec<u32>),
}

impl Default for BreakpointSpec {
    fn default() -> Self {
        Self::All
    }
}

impl Display for BreakpointSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "{WILDCARD}"),
            Self::Lines(lines) => {
                let joined = lines.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
                write!(f, "{joined}")
            }
        }
    }
}

impl FromStr for BreakpointSpec {
    type Err = BreakpointSpecError;

    /// Parses a breakpoint specification.
    /// Format: `*` or `<line>[,<line>...]`
    /// Examples:
    /// - `*` - every line
    /// - `3,7,12` - lines 3, 7 and 12
    /// - `` - no breakpoint
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == WILDCARD {
            return Ok(Self::All);
        }
        if trimmed.is_empty() {
            return Ok(Self::Lines(Vec::new()));
        }

        let lines = trimmed
            .split(',')
            .map(str::trim)
            .map(|entry| match entry.parse::<u32>() {
                Ok(line) if line > 0 => Ok(line),
                _ => Err(BreakpointSpecError::InvalidLine { entry: entry.to_string() }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::Lines(lines))
    }
}

impl BreakpointSpec {
    /// Returns whether this is the wildcard specification.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Candidate breakpoint lines for a file with `line_count` lines.
    pub fn candidate_lines(&self, line_count: usize) -> Vec<u32> {
        match self {
            Self::All => (1..=line_count as u32).collect(),
            Self::Lines(lines) => lines.clone(),
        }
    }

    /// The stepping strategy implied by this specification.
    pub fn step_mode(&self) -> StepMode {
        match self {
            Self::All => StepMode::All,
            Self::Lines(_) => StepMode::Explicit,
        }
    }
}

/// How the stepping engine advances after each extracted snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    /// Step through every line: step into user code, step out of everything else.
    All,
    /// Only stop at the requested lines and continue in between.
    Explicit,
}
