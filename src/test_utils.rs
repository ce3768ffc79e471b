// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;
use std::sync::Mutex;

use anyhow::bail;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use crate::balloon::ResizeCallback;
use crate::balloon::ResizeResult;
use crate::balloon::StallStatistics;
use crate::metrics::BalloonMetrics;
use crate::priority::ResizeDirection;
use crate::priority::ResizePriority;
use crate::transport::BalloonStats;
use crate::transport::BalloonTransport;

struct FakeDeviceState {
    actual_bytes: u64,
    // Whether the guest immediately reaches every commanded target.
    auto_apply: bool,
    fail_set: bool,
    fail_get: bool,
    fail_stats: bool,
    set_calls: Vec<u64>,
    stats_calls: usize,
}

/// A balloon device whose guest is scripted by the test through the paired
/// [FakeDevice].
pub struct FakeTransport {
    state: Arc<Mutex<FakeDeviceState>>,
}

/// Test side controls of a [FakeTransport].
#[derive(Clone)]
pub struct FakeDevice {
    state: Arc<Mutex<FakeDeviceState>>,
}

pub fn fake_transport(actual_bytes: i64) -> (Box<dyn BalloonTransport>, FakeDevice) {
    let state = Arc::new(Mutex::new(FakeDeviceState {
        actual_bytes: actual_bytes as u64,
        auto_apply: true,
        fail_set: false,
        fail_get: false,
        fail_stats: false,
        set_calls: Vec::new(),
        stats_calls: 0,
    }));
    (
        Box::new(FakeTransport {
            state: state.clone(),
        }),
        FakeDevice { state },
    )
}

#[async_trait]
impl BalloonTransport for FakeTransport {
    async fn set_balloon_size(&self, target_bytes: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_set {
            bail!("injected set_balloon_size failure");
        }
        state.set_calls.push(target_bytes);
        if state.auto_apply {
            state.actual_bytes = target_bytes;
        }
        Ok(())
    }

    async fn get_balloon_actual_size(&self) -> Result<u64> {
        let state = self.state.lock().unwrap();
        if state.fail_get {
            bail!("injected get_balloon_actual_size failure");
        }
        Ok(state.actual_bytes)
    }

    async fn get_balloon_stats(&self) -> Result<BalloonStats> {
        let mut state = self.state.lock().unwrap();
        state.stats_calls += 1;
        if state.fail_stats {
            bail!("injected get_balloon_stats failure");
        }
        Ok(BalloonStats {
            actual_bytes: state.actual_bytes,
            timestamp: Instant::now(),
        })
    }
}

impl FakeDevice {
    pub fn set_actual(&self, actual_bytes: i64) {
        self.state.lock().unwrap().actual_bytes = actual_bytes as u64;
    }

    pub fn set_auto_apply(&self, auto_apply: bool) {
        self.state.lock().unwrap().auto_apply = auto_apply;
    }

    pub fn set_fail_set(&self, fail: bool) {
        self.state.lock().unwrap().fail_set = fail;
    }

    pub fn set_fail_get(&self, fail: bool) {
        self.state.lock().unwrap().fail_get = fail;
    }

    pub fn set_fail_stats(&self, fail: bool) {
        self.state.lock().unwrap().fail_stats = fail;
    }

    /// Every target the device accepted, in order.
    pub fn set_calls(&self) -> Vec<u64> {
        self.state.lock().unwrap().set_calls.clone()
    }

    pub fn stats_calls(&self) -> usize {
        self.state.lock().unwrap().stats_calls
    }
}

/// A completion callback forwarding the result to the returned receiver.
pub fn result_channel() -> (ResizeCallback, UnboundedReceiver<ResizeResult>) {
    let (sender, receiver) = unbounded_channel();
    (
        Box::new(move |result: &ResizeResult| {
            let _ = sender.send(*result);
        }),
        receiver,
    )
}

#[derive(Default)]
pub struct RecordingMetrics {
    resizes: Mutex<Vec<(ResizeDirection, ResizeResult, ResizePriority)>>,
    stalls: Mutex<Vec<StallStatistics>>,
}

impl RecordingMetrics {
    pub fn resizes(&self) -> Vec<(ResizeResult, ResizePriority)> {
        self.resizes
            .lock()
            .unwrap()
            .iter()
            .map(|(_, result, priority)| (*result, *priority))
            .collect()
    }

    /// The requested direction of every reported resize.
    pub fn resize_directions(&self) -> Vec<ResizeDirection> {
        self.resizes
            .lock()
            .unwrap()
            .iter()
            .map(|(direction, _, _)| *direction)
            .collect()
    }

    pub fn stalls(&self) -> Vec<StallStatistics> {
        self.stalls.lock().unwrap().clone()
    }
}

impl BalloonMetrics for RecordingMetrics {
    fn on_resize(
        &self,
        direction: ResizeDirection,
        result: &ResizeResult,
        priority: ResizePriority,
    ) {
        self.resizes
            .lock()
            .unwrap()
            .push((direction, *result, priority));
    }

    fn on_stall(&self, statistics: &StallStatistics) {
        self.stalls.lock().unwrap().push(*statistics);
    }
}
