// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::Path;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

use crate::common::read_optional_u64;
use crate::priority::ResizePriority;

pub const BALLOON_ARBITER_CONFIG_DIR: &str = "run/balloon_arbiter";

const HIGH_PRIORITY_BLOCK_DURATION_FILENAME: &str = "high_priority_block_duration_ms";
const LOW_PRIORITY_BLOCK_DURATION_FILENAME: &str = "low_priority_block_duration_ms";
const LOW_PRIORITY_CUTOFF_FILENAME: &str = "low_priority_cutoff";
const STALL_CHECK_DELAY_FILENAME: &str = "stall_check_delay_ms";
const STALL_RECHECK_INTERVAL_FILENAME: &str = "stall_recheck_interval_ms";
const STALL_WINDOW_FILENAME: &str = "stall_window_ms";
const STALL_MIN_THROUGHPUT_FILENAME: &str = "stall_min_throughput_bytes_per_sec";

const DEFAULT_HIGH_PRIORITY_BLOCK_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_LOW_PRIORITY_BLOCK_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_LOW_PRIORITY_CUTOFF: ResizePriority = ResizePriority::CachedApp;
const DEFAULT_STALL_CHECK_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_STALL_RECHECK_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_STALL_WINDOW: Duration = Duration::from_secs(100);
const DEFAULT_STALL_MIN_THROUGHPUT_BYTES_PER_SEC: u64 = 1024 * 1024;

/// How long a recorded request blocks the opposite direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockerConfig {
    /// Used for levels more urgent than `low_priority_cutoff`.
    pub high_priority_block_duration: Duration,
    /// Used for `low_priority_cutoff` and everything less urgent.
    pub low_priority_block_duration: Duration,
    pub low_priority_cutoff: ResizePriority,
}

impl BlockerConfig {
    pub fn block_duration(&self, priority: ResizePriority) -> Duration {
        if priority.is_more_urgent_than(self.low_priority_cutoff) {
            self.high_priority_block_duration
        } else {
            self.low_priority_block_duration
        }
    }
}

impl Default for BlockerConfig {
    fn default() -> Self {
        Self {
            high_priority_block_duration: DEFAULT_HIGH_PRIORITY_BLOCK_DURATION,
            low_priority_block_duration: DEFAULT_LOW_PRIORITY_BLOCK_DURATION,
            low_priority_cutoff: DEFAULT_LOW_PRIORITY_CUTOFF,
        }
    }
}

/// The cadence and threshold of the inflation stall detector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StallConfig {
    /// Delay between a successful inflation and the first progress check.
    pub check_delay: Duration,
    /// Delay between checks once the inflation looks slow.
    pub recheck_interval: Duration,
    /// How long an inflation may make no progress before it is declared stalled.
    pub window: Duration,
    /// Inflation throughput at or above this is considered progress.
    pub min_throughput_bytes_per_sec: u64,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            check_delay: DEFAULT_STALL_CHECK_DELAY,
            recheck_interval: DEFAULT_STALL_RECHECK_INTERVAL,
            window: DEFAULT_STALL_WINDOW,
            min_throughput_bytes_per_sec: DEFAULT_STALL_MIN_THROUGHPUT_BYTES_PER_SEC,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    pub blocker: BlockerConfig,
    pub stall: StallConfig,
}

fn read_duration_ms(dir: &Path, filename: &str) -> Result<Option<Duration>> {
    Ok(read_optional_u64(dir.join(filename))?.map(Duration::from_millis))
}

impl Config {
    /* Expects to find optional override files as follows:
     * * {root}/run/balloon_arbiter/
     *   * high_priority_block_duration_ms
     *   * low_priority_block_duration_ms
     *   * low_priority_cutoff
     *   * stall_check_delay_ms
     *   * stall_recheck_interval_ms
     *   * stall_window_ms
     *   * stall_min_throughput_bytes_per_sec
     */
    pub fn load(root: &Path) -> Result<Self> {
        let mut config = Self::default();

        let dir = root.join(BALLOON_ARBITER_CONFIG_DIR);
        if !dir.exists() {
            return Ok(config);
        } else if !dir.is_dir() {
            bail!("The config directory {} is not a directory.", dir.display());
        }

        if let Some(value) = read_duration_ms(&dir, HIGH_PRIORITY_BLOCK_DURATION_FILENAME)? {
            config.blocker.high_priority_block_duration = value;
        }
        if let Some(value) = read_duration_ms(&dir, LOW_PRIORITY_BLOCK_DURATION_FILENAME)? {
            config.blocker.low_priority_block_duration = value;
        }
        if let Some(ordinal) = read_optional_u64(dir.join(LOW_PRIORITY_CUTOFF_FILENAME))? {
            let cutoff = ResizePriority::from_ordinal(ordinal)
                .with_context(|| format!("Unknown resize priority {}", ordinal))?;
            if !cutoff.is_ordinary() {
                bail!("Low priority cutoff must be an ordinary level, got {}", cutoff);
            }
            config.blocker.low_priority_cutoff = cutoff;
        }

        if let Some(value) = read_duration_ms(&dir, STALL_CHECK_DELAY_FILENAME)? {
            config.stall.check_delay = value;
        }
        if let Some(value) = read_duration_ms(&dir, STALL_RECHECK_INTERVAL_FILENAME)? {
            config.stall.recheck_interval = value;
        }
        if let Some(value) = read_duration_ms(&dir, STALL_WINDOW_FILENAME)? {
            config.stall.window = value;
        }
        if let Some(value) = read_optional_u64(dir.join(STALL_MIN_THROUGHPUT_FILENAME))? {
            config.stall.min_throughput_bytes_per_sec = value;
        }

        Ok(config)
    }
}
