// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;

/// A sample of the guest balloon reported by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BalloonStats {
    /// The size the guest has actually given up to the balloon.
    pub actual_bytes: u64,
    /// When the sample was taken.
    pub timestamp: Instant,
}

/// The control channel to a single VM's balloon device (e.g. the crosvm control
/// socket). Only one [crate::balloon::Balloon] issues commands through a
/// transport.
#[async_trait]
pub trait BalloonTransport: Send + Sync {
    /// Command the balloon to `target_bytes`. Returns once the device accepted the
    /// command, not once the guest reached the target.
    async fn set_balloon_size(&self, target_bytes: u64) -> Result<()>;

    async fn get_balloon_actual_size(&self) -> Result<u64>;

    async fn get_balloon_stats(&self) -> Result<BalloonStats>;
}

pub(crate) fn bytes_to_i64(bytes: u64) -> i64 {
    bytes.try_into().unwrap_or(i64::MAX)
}
