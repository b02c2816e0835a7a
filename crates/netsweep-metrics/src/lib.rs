// Copyright 2025 NetSweep Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! NetSweep Worker Usage Accounting
//!
//! This crate tracks how busy each discoverer worker is. Workers flip their
//! slot between [`WorkerState::Busy`] and [`WorkerState::Idle`] around check
//! execution; the scheduler collects the accumulated intervals once per tick
//! and answers `USAGE_STATS` queries with per-worker busy fractions over the
//! window since the previous collection.
//!
//! # Thread Safety
//!
//! A [`TimeKeeper`] is shared across workers via `Arc`; each slot is guarded
//! by its own mutex so workers never contend with each other.
//!
//! # Example
//!
//! ```
//! use netsweep_metrics::{TimeKeeper, WorkerState};
//!
//! let keeper = TimeKeeper::new(2);
//! keeper.update(0, WorkerState::Busy);
//! keeper.update(0, WorkerState::Idle);
//! let usage = keeper.usage();
//! assert_eq!(usage.len(), 2);
//! ```

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Activity state reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
}

struct Slot {
    state: WorkerState,
    last_change: Instant,
    busy: Duration,
    total: Duration,
}

impl Slot {
    fn new(now: Instant) -> Self {
        Self {
            state: WorkerState::Idle,
            last_change: now,
            busy: Duration::ZERO,
            total: Duration::ZERO,
        }
    }

    /// Folds the elapsed interval into the accumulators.
    fn account(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_change);
        self.total += elapsed;
        if self.state == WorkerState::Busy {
            self.busy += elapsed;
        }
        self.last_change = now;
    }
}

/// Per-worker busy/idle time accounting.
pub struct TimeKeeper {
    slots: Vec<Mutex<Slot>>,
}

impl TimeKeeper {
    pub fn new(workers: usize) -> Self {
        let now = Instant::now();
        Self {
            slots: (0..workers).map(|_| Mutex::new(Slot::new(now))).collect(),
        }
    }

    pub fn workers(&self) -> usize {
        self.slots.len()
    }

    /// Records a state transition for a worker slot.
    ///
    /// Out-of-range indices are ignored; a worker can only report itself.
    pub fn update(&self, worker_idx: usize, state: WorkerState) {
        let Some(slot) = self.slots.get(worker_idx) else {
            return;
        };
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.account(Instant::now());
        slot.state = state;
    }

    /// Folds the running intervals without changing any state. Called once
    /// per scheduler tick so usage queries see fresh numbers even while a
    /// worker sits in one state for a long time.
    pub fn collect(&self) {
        let now = Instant::now();
        for slot in &self.slots {
            let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
            slot.account(now);
        }
    }

    /// Busy fraction (0..1) per worker over the window since the previous
    /// `usage()` call, which resets the window.
    pub fn usage(&self) -> Vec<f64> {
        let now = Instant::now();
        self.slots
            .iter()
            .map(|slot| {
                let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
                slot.account(now);
                let fraction = if slot.total.is_zero() {
                    0.0
                } else {
                    slot.busy.as_secs_f64() / slot.total.as_secs_f64()
                };
                slot.busy = Duration::ZERO;
                slot.total = Duration::ZERO;
                fraction
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_idle_worker_reports_zero() {
        let keeper = TimeKeeper::new(1);
        sleep(Duration::from_millis(5));
        let usage = keeper.usage();
        assert_eq!(usage, vec![0.0]);
    }

    #[test]
    fn test_busy_interval_is_accounted() {
        let keeper = TimeKeeper::new(2);
        keeper.update(0, WorkerState::Busy);
        sleep(Duration::from_millis(10));
        keeper.update(0, WorkerState::Idle);

        let usage = keeper.usage();
        assert!(usage[0] > 0.0, "busy worker should report usage");
        assert_eq!(usage[1], 0.0);
    }

    #[test]
    fn test_usage_resets_window() {
        let keeper = TimeKeeper::new(1);
        keeper.update(0, WorkerState::Busy);
        sleep(Duration::from_millis(5));
        keeper.update(0, WorkerState::Idle);
        let _ = keeper.usage();

        sleep(Duration::from_millis(5));
        let second = keeper.usage();
        assert!(second[0] < 0.5, "window must reset after usage()");
    }

    #[test]
    fn test_out_of_range_update_is_ignored() {
        let keeper = TimeKeeper::new(1);
        keeper.update(5, WorkerState::Busy);
        assert_eq!(keeper.usage().len(), 1);
    }
}
