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

//! Session id allocation.
//!
//! Every session needs a unique id which doubles as the TCP port its debug
//! adapter listens on. Ids are handed out from a fixed range and must be
//! released on teardown, otherwise they leak for the lifetime of the process.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use thiserror::Error;

/// Default first id (inclusive).
pub const DEFAULT_UID_RANGE_START: u16 = 15000;
/// Default last id (exclusive).
pub const DEFAULT_UID_RANGE_END: u16 = 20000;

/// Returned when every id of the range is in use.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("no free session id in range {start}..{end}")]
pub struct AllocatorExhausted {
    /// First id of the range.
    pub start: u16,
    /// End of the range (exclusive).
    pub end: u16,
}

/// Hands out unique session ids.
///
/// Sessions receive the allocator at creation time instead of reaching for a
/// global, so tests can substitute their own implementation.
pub trait IdAllocator: Send + Sync {
    /// Reserves a free id.
    fn reserve(&self) -> Result<u16, AllocatorExhausted>;

    /// Returns an id to the pool. Releasing an unknown id is a no-op.
    fn release(&self, id: u16);
}

/// Allocates the lowest free id of a configured range.
#[derive(Debug)]
pub struct UidAllocator {
    /// First id (inclusive).
    start: u16,
    /// Last id (exclusive).
    end: u16,
    /// Ids currently reserved.
    used: Mutex<BTreeSet<u16>>,
}

impl UidAllocator {
    /// Creates an allocator over `start..end`.
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end, used: Mutex::new(BTreeSet::new()) }
    }

    /// Number of ids currently reserved.
    pub fn reserved_count(&self) -> usize {
        self.used.lock().len()
    }

    /// Number of ids still available.
    pub fn available_count(&self) -> usize {
        let total = self.end.saturating_sub(self.start) as usize;
        total.saturating_sub(self.reserved_count())
    }

    /// Whether `id` is inside the range and not reserved.
    pub fn is_available(&self, id: u16) -> bool {
        if id < self.start || id >= self.end {
            return false;
        }
        !self.used.lock().contains(&id)
    }
}

impl Default for UidAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_UID_RANGE_START, DEFAULT_UID_RANGE_END)
    }
}

impl IdAllocator for UidAllocator {
    fn reserve(&self) -> Result<u16, AllocatorExhausted> {
        let mut used = self.used.lock();
        let id = (self.start..self.end)
            .find(|id| !used.contains(id))
            .ok_or(AllocatorExhausted { start: self.start, end: self.end })?;
        used.insert(id);
        Ok(id)
    }

    fn release(&self, id: u16) {
        self.used.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let allocator = UidAllocator::new(15000, 15003);

        assert_eq!(allocator.reserve(), Ok(15000));
        assert_eq!(allocator.reserve(), Ok(15001));
        assert_eq!(allocator.reserve(), Ok(15002));
        assert_eq!(allocator.reserve(), Err(AllocatorExhausted { start: 15000, end: 15003 }));

        allocator.release(15001);
        assert!(allocator.is_available(15001));
        assert_eq!(allocator.reserve(), Ok(15001));
        assert!(allocator.reserve().is_err());
    }

    #[test]
    fn test_counts() {
        let allocator = UidAllocator::new(15000, 15005);
        assert_eq!(allocator.available_count(), 5);

        allocator.reserve().unwrap();
        allocator.reserve().unwrap();
        assert_eq!(allocator.reserved_count(), 2);
        assert_eq!(allocator.available_count(), 3);

        // Unknown ids are ignored
        allocator.release(42);
        assert_eq!(allocator.reserved_count(), 2);
    }

    #[test]
    fn test_out_of_range_is_unavailable() {
        let allocator = UidAllocator::new(15000, 15002);
        assert!(!allocator.is_available(14999));
        assert!(!allocator.is_available(15002));
    }
}
