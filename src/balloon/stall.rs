// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::StallConfig;
use crate::transport::bytes_to_i64;
use crate::transport::BalloonStats;

/// What the stall detector observed when it declared an inflation stalled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StallStatistics {
    /// Inflation throughput over the last sampling interval.
    pub inflate_bytes_per_sec: i64,
    /// How long the inflation has not been making progress.
    pub stalled_for: Duration,
    /// The guest's actual balloon size when the stall was declared.
    pub actual_bytes: i64,
    /// The tracked balloon target when the stall was declared.
    pub target_bytes: i64,
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum StallCheck {
    /// The inflation reached its target or is progressing. The episode is over.
    Done,
    /// The inflation is slow but hasn't been slow for long enough yet.
    Pending,
    Stalled(StallStatistics),
}

/// Tracks the progress of one inflation episode. Only one episode exists per
/// balloon at a time; inflations that complete during an episode are folded
/// into it.
pub(super) struct StallMonitor {
    min_throughput_bytes_per_sec: i64,
    window: Duration,
    last_actual_bytes: i64,
    last_sample_at: Instant,
    /// When the first sample without progress was taken.
    no_progress_since: Option<Instant>,
}

impl StallMonitor {
    pub(super) fn new(config: &StallConfig, actual_bytes: i64, now: Instant) -> Self {
        Self {
            min_throughput_bytes_per_sec: bytes_to_i64(config.min_throughput_bytes_per_sec),
            window: config.window,
            last_actual_bytes: actual_bytes,
            last_sample_at: now,
            no_progress_since: None,
        }
    }

    pub(super) fn on_sample(&mut self, sample: &BalloonStats, target_bytes: i64) -> StallCheck {
        let actual_bytes = bytes_to_i64(sample.actual_bytes);
        if actual_bytes >= target_bytes {
            return StallCheck::Done;
        }

        let elapsed = sample
            .timestamp
            .saturating_duration_since(self.last_sample_at)
            .as_secs_f64();
        let inflate_bytes_per_sec = if elapsed > 0.0 {
            (actual_bytes.saturating_sub(self.last_actual_bytes) as f64 / elapsed) as i64
        } else {
            0
        };
        self.last_actual_bytes = actual_bytes;
        self.last_sample_at = sample.timestamp;

        if inflate_bytes_per_sec >= self.min_throughput_bytes_per_sec {
            return StallCheck::Done;
        }

        let no_progress_since = *self.no_progress_since.get_or_insert(sample.timestamp);
        let stalled_for = sample.timestamp.saturating_duration_since(no_progress_since);
        if stalled_for < self.window {
            return StallCheck::Pending;
        }

        StallCheck::Stalled(StallStatistics {
            inflate_bytes_per_sec,
            stalled_for,
            actual_bytes,
            target_bytes,
        })
    }
}
