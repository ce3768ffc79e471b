// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod device;
mod stall;

use std::time::Duration;

use log::error;
use log::info;
use log::warn;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::Instant;

pub use self::stall::StallStatistics;
use self::device::DeviceRequest;
use self::device::DeviceWorker;
use self::stall::StallCheck;
use self::stall::StallMonitor;
use crate::config::StallConfig;
use crate::transport::BalloonStats;
use crate::transport::BalloonTransport;

/// Identifies a VM (its vsock cid).
pub type VmId = u32;

/// The outcome of a single balloon resize.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResizeResult {
    /// Whether the device accepted the command.
    pub success: bool,
    /// The difference between the new target and the size the guest reported
    /// before the command.
    pub actual_delta_bytes: i64,
    /// The balloon target after the command.
    pub new_target: i64,
}

impl ResizeResult {
    pub fn failed(target: i64) -> Self {
        Self {
            success: false,
            actual_delta_bytes: 0,
            new_target: target,
        }
    }
}

/// Invoked on the owning task once a resize completes.
pub type ResizeCallback = Box<dyn FnOnce(&ResizeResult) + Send>;

/// Reported by [Balloon::handle_event] when the balloon corrected a stalled
/// inflation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BalloonStallNotice {
    /// The result of the corrective deflation.
    pub result: ResizeResult,
    pub statistics: StallStatistics,
}

enum Completion {
    Callback(ResizeCallback),
    StallCorrection(StallStatistics),
}

/// An asynchronous outcome of the balloon. Every event must be passed back to
/// [Balloon::handle_event] on the task that owns the balloon.
pub struct BalloonEvent(Event);

enum Event {
    Resized {
        delta_bytes: i64,
        result: ResizeResult,
        completion: Completion,
    },
    StallCheck,
    StatsSampled(anyhow::Result<BalloonStats>),
}

/// The balloon device of one VM.
///
/// Resizes are executed asynchronously by a device worker task, in the order
/// they were issued. Their completions come back through the event receiver
/// returned by [Balloon::new], so that all of the balloon state is only ever
/// mutated by the task that owns the balloon.
///
/// After an inflation the balloon watches the guest's progress. If the guest
/// stops inflating, the balloon deflates back to zero and reports the stall.
pub struct Balloon {
    vm_id: VmId,
    // The target of the last completed resize.
    target_size: i64,
    // The target once every issued resize completes successfully.
    issued_target_size: i64,
    resizes_in_flight: usize,
    stall_config: StallConfig,
    requests: UnboundedSender<DeviceRequest>,
    events: UnboundedSender<BalloonEvent>,
    stall_monitor: Option<StallMonitor>,
    stall_timer: Option<JoinHandle<()>>,
}

impl Balloon {
    /// Creates the balloon and spawns its device worker. Must be called within a
    /// tokio runtime.
    pub fn new(
        vm_id: VmId,
        transport: Box<dyn BalloonTransport>,
        initial_target: i64,
        stall_config: StallConfig,
    ) -> (Self, UnboundedReceiver<BalloonEvent>) {
        let initial_target = initial_target.max(0);
        let (events_tx, events_rx) = unbounded_channel();
        let (requests_tx, requests_rx) = unbounded_channel();

        let worker = DeviceWorker::new(vm_id, transport, initial_target, events_tx.clone());
        tokio::spawn(worker.run(requests_rx));

        let balloon = Self {
            vm_id,
            target_size: initial_target,
            issued_target_size: initial_target,
            resizes_in_flight: 0,
            stall_config,
            requests: requests_tx,
            events: events_tx,
            stall_monitor: None,
            stall_timer: None,
        };
        (balloon, events_rx)
    }

    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    /// The tracked balloon target. Doesn't query the guest.
    pub fn target_size(&self) -> i64 {
        self.target_size
    }

    /// The target the balloon heads to once the resizes still in flight
    /// complete. Equals [Balloon::target_size] when nothing is in flight.
    pub fn issued_target_size(&self) -> i64 {
        self.issued_target_size
    }

    /// Resizes the balloon by `delta_bytes`. `on_complete` is invoked from
    /// [Balloon::handle_event] once the device handled the command.
    pub fn do_resize(&mut self, delta_bytes: i64, on_complete: ResizeCallback) {
        if let Err(request) = self.issue_resize(delta_bytes, Completion::Callback(on_complete)) {
            if let DeviceRequest::Resize {
                completion: Completion::Callback(on_complete),
                ..
            } = request
            {
                on_complete(&ResizeResult::failed(self.target_size));
            }
        }
    }

    fn issue_resize(
        &mut self,
        delta_bytes: i64,
        completion: Completion,
    ) -> std::result::Result<(), DeviceRequest> {
        let request = DeviceRequest::Resize {
            delta_bytes,
            completion,
        };
        if let Err(SendError(request)) = self.requests.send(request) {
            error!("Balloon device worker of VM {} is gone", self.vm_id);
            return Err(request);
        }
        self.resizes_in_flight += 1;
        self.issued_target_size = self.issued_target_size.saturating_add(delta_bytes).max(0);
        Ok(())
    }

    /// Applies an event produced by this balloon. Returns a notice when a stalled
    /// inflation was corrected.
    pub fn handle_event(&mut self, event: BalloonEvent) -> Option<BalloonStallNotice> {
        match event.0 {
            Event::Resized {
                delta_bytes,
                result,
                completion,
            } => {
                if result.success {
                    self.target_size = result.new_target;
                }
                self.resizes_in_flight = self.resizes_in_flight.saturating_sub(1);
                if self.resizes_in_flight == 0 {
                    // Drops the estimates of failed resizes.
                    self.issued_target_size = self.target_size;
                }
                match completion {
                    Completion::Callback(on_complete) => {
                        if result.success && delta_bytes > 0 {
                            self.start_stall_check(&result);
                        }
                        on_complete(&result);
                        None
                    }
                    Completion::StallCorrection(statistics) => {
                        Some(BalloonStallNotice { result, statistics })
                    }
                }
            }
            Event::StallCheck => {
                self.stall_timer = None;
                self.request_stall_sample();
                None
            }
            Event::StatsSampled(stats) => {
                self.on_stall_sample(stats);
                None
            }
        }
    }

    fn start_stall_check(&mut self, result: &ResizeResult) {
        // Inflations completing while a check is pending join the running episode.
        if self.stall_monitor.is_some() {
            return;
        }
        let actual_bytes = result.new_target - result.actual_delta_bytes;
        self.stall_monitor = Some(StallMonitor::new(
            &self.stall_config,
            actual_bytes,
            Instant::now(),
        ));
        self.schedule_stall_check(self.stall_config.check_delay);
    }

    fn schedule_stall_check(&mut self, delay: Duration) {
        let events = self.events.clone();
        self.stall_timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            let _ = events.send(BalloonEvent(Event::StallCheck));
        }));
    }

    fn request_stall_sample(&mut self) {
        if self.stall_monitor.is_none() {
            return;
        }
        if self.requests.send(DeviceRequest::SampleStats).is_err() {
            error!("Balloon device worker of VM {} is gone", self.vm_id);
            self.stall_monitor = None;
        }
    }

    fn on_stall_sample(&mut self, stats: anyhow::Result<BalloonStats>) {
        let Some(monitor) = self.stall_monitor.as_mut() else {
            return;
        };
        let stats = match stats {
            Ok(stats) => stats,
            Err(e) => {
                warn!(
                    "Failed to get balloon stats of VM {}, stopping stall check: {:#}",
                    self.vm_id, e
                );
                self.stall_monitor = None;
                return;
            }
        };

        match monitor.on_sample(&stats, self.target_size) {
            StallCheck::Done => self.stall_monitor = None,
            StallCheck::Pending => self.schedule_stall_check(self.stall_config.recheck_interval),
            StallCheck::Stalled(statistics) => {
                self.stall_monitor = None;
                warn!(
                    "Balloon of VM {} stalled at {} of {} bytes for {:?}",
                    self.vm_id,
                    statistics.actual_bytes,
                    statistics.target_bytes,
                    statistics.stalled_for
                );
                info!("Deflating stalled balloon of VM {}", self.vm_id);
                // Deflating by the whole target lands at zero from wherever the
                // guest actually is.
                let _ = self.issue_resize(
                    -self.target_size,
                    Completion::StallCorrection(statistics),
                );
            }
        }
    }
}

impl Drop for Balloon {
    fn drop(&mut self) {
        if let Some(timer) = self.stall_timer.take() {
            timer.abort();
        }
    }
}
