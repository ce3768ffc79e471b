// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Balloon telemetry. The UMA client library only exists in ChromeOS builds and
//! isn't a dependency of this crate, so `send_to_uma` and `send_enum_to_uma`
//! always log the sample instead. Embedders that can reach UMA implement
//! [BalloonMetrics] themselves.

use anyhow::Result;
use log::debug;
use log::warn;

use crate::balloon::ResizeResult;
use crate::balloon::StallStatistics;
use crate::common::MIB;
use crate::priority::ResizeDirection;
use crate::priority::ResizePriority;
use crate::priority::NUM_RESIZE_PRIORITIES;

const RESIZE_SIZE_MAX_MIB: i32 = 16 * 1024;
const STALL_THROUGHPUT_MAX_MIB_PER_SEC: i32 = 1024;
const STALL_DURATION_MAX_SECONDS: i32 = 3600;
const HISTOGRAM_BUCKETS: i32 = 50;

/// Receives the outcome of every balloon resize and stall. Calls are fire and
/// forget.
pub trait BalloonMetrics: Send + Sync {
    /// `direction` is the direction that was requested. A failed or empty resize
    /// has no delta to tell it from.
    fn on_resize(
        &self,
        direction: ResizeDirection,
        result: &ResizeResult,
        priority: ResizePriority,
    );

    fn on_stall(&self, statistics: &StallStatistics);
}

pub fn send_to_uma(name: &str, sample: i32, min: i32, max: i32, nbuckets: i32) -> Result<()> {
    debug!(
        "UMA {}: {} (min {}, max {}, buckets {})",
        name, sample, min, max, nbuckets
    );
    Ok(())
}

pub fn send_enum_to_uma(name: &str, sample: i32, max: i32) -> Result<()> {
    debug!("UMA {}: {} (max {})", name, sample, max);
    Ok(())
}

fn bytes_to_mib_sample(bytes: i64) -> i32 {
    (bytes / MIB).clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

#[derive(Debug, PartialEq, Eq)]
enum UmaSample {
    Histogram {
        name: String,
        sample: i32,
        min: i32,
        max: i32,
    },
    Enum {
        name: String,
        sample: i32,
        max: i32,
    },
}

/// Reports balloon resizes and stalls to UMA, in histograms named after the VM
/// type (e.g. "Memory.BalloonArbiter.ARCVM.Inflate.SizeMiB").
pub struct UmaBalloonMetrics {
    prefix: String,
}

impl UmaBalloonMetrics {
    pub fn new(vm_name: &str) -> Self {
        Self {
            prefix: format!("Memory.BalloonArbiter.{}", vm_name),
        }
    }

    fn histogram(&self, suffix: &str) -> String {
        format!("{}.{}", self.prefix, suffix)
    }

    fn resize_histogram(&self, direction: ResizeDirection, suffix: &str) -> String {
        let direction = match direction {
            ResizeDirection::Inflate => "Inflate",
            ResizeDirection::Deflate => "Deflate",
        };
        self.histogram(&format!("{}.{}", direction, suffix))
    }

    fn resize_samples(
        &self,
        direction: ResizeDirection,
        result: &ResizeResult,
        priority: ResizePriority,
    ) -> Vec<UmaSample> {
        if !result.success {
            return vec![UmaSample::Enum {
                name: self.resize_histogram(direction, "FailedPriority"),
                sample: priority.index() as i32,
                max: NUM_RESIZE_PRIORITIES as i32,
            }];
        }
        vec![
            UmaSample::Enum {
                name: self.resize_histogram(direction, "Priority"),
                sample: priority.index() as i32,
                max: NUM_RESIZE_PRIORITIES as i32,
            },
            UmaSample::Histogram {
                name: self.resize_histogram(direction, "SizeMiB"),
                sample: bytes_to_mib_sample(result.actual_delta_bytes.saturating_abs()),
                min: 1,
                max: RESIZE_SIZE_MAX_MIB,
            },
            UmaSample::Histogram {
                name: self.histogram("TargetMiB"),
                sample: bytes_to_mib_sample(result.new_target),
                min: 1,
                max: RESIZE_SIZE_MAX_MIB,
            },
        ]
    }

    fn stall_samples(&self, statistics: &StallStatistics) -> Vec<UmaSample> {
        vec![
            UmaSample::Histogram {
                name: self.histogram("Stall.InflateMiBPerSecond"),
                sample: bytes_to_mib_sample(statistics.inflate_bytes_per_sec),
                min: 1,
                max: STALL_THROUGHPUT_MAX_MIB_PER_SEC,
            },
            UmaSample::Histogram {
                name: self.histogram("Stall.DurationSeconds"),
                sample: statistics
                    .stalled_for
                    .as_secs()
                    .try_into()
                    .unwrap_or(i32::MAX),
                min: 1,
                max: STALL_DURATION_MAX_SECONDS,
            },
        ]
    }

    fn report(&self, samples: Vec<UmaSample>) {
        for sample in samples {
            let (name, result) = match sample {
                UmaSample::Histogram {
                    name,
                    sample,
                    min,
                    max,
                } => {
                    let result = send_to_uma(&name, sample, min, max, HISTOGRAM_BUCKETS);
                    (name, result)
                }
                UmaSample::Enum { name, sample, max } => {
                    let result = send_enum_to_uma(&name, sample, max);
                    (name, result)
                }
            };
            if let Err(e) = result {
                warn!("Failed to send {} to UMA: {}", name, e);
            }
        }
    }
}

impl BalloonMetrics for UmaBalloonMetrics {
    fn on_resize(
        &self,
        direction: ResizeDirection,
        result: &ResizeResult,
        priority: ResizePriority,
    ) {
        self.report(self.resize_samples(direction, result, priority));
    }

    fn on_stall(&self, statistics: &StallStatistics) {
        self.report(self.stall_samples(statistics));
    }
}
