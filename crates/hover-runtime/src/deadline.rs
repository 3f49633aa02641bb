// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deadline budget accounting.
//!
//! Every hop derives its downstream timeout from the invocation's absolute
//! deadline and always keeps [`SAFETY_MARGIN_MS`] in reserve, so forced
//! restarts and timeout errors happen before the platform kills the process.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Time reserved at every hop for cleanup and reporting.
pub const SAFETY_MARGIN_MS: i64 = 1_000;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Absolute wall-clock deadline of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    epoch_millis: i64,
}

impl Deadline {
    /// Deadline at the given epoch milliseconds.
    pub fn from_epoch_millis(epoch_millis: i64) -> Self {
        Self { epoch_millis }
    }

    /// Deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self::from_epoch_millis(now_millis() + budget.as_millis() as i64)
    }

    /// Epoch milliseconds of the deadline.
    pub fn epoch_millis(&self) -> i64 {
        self.epoch_millis
    }

    /// Milliseconds left at `now` (negative once the deadline has passed).
    pub fn remaining_at(&self, now: i64) -> i64 {
        self.epoch_millis - now
    }

    /// Milliseconds left right now.
    pub fn remaining_millis(&self) -> i64 {
        self.remaining_at(now_millis())
    }
}

/// Budget for an exchange that was handed `timeout_ms`: the timeout minus the
/// safety margin, clamped at zero.
pub fn budget_after_margin(timeout_ms: i64) -> Duration {
    Duration::from_millis((timeout_ms - SAFETY_MARGIN_MS).max(0) as u64)
}

/// Whole-second budget for subprocess style timeouts:
/// `ceil(timeout / 1000) - 1`, which can be zero or negative when time is
/// already short.
pub fn whole_seconds_budget(timeout_ms: i64) -> i64 {
    let secs = if timeout_ms <= 0 {
        timeout_ms / 1000
    } else {
        (timeout_ms + 999) / 1000
    };
    secs - SAFETY_MARGIN_MS / 1000
}
