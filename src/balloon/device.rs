// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::error;
use log::warn;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;

use super::BalloonEvent;
use super::Completion;
use super::Event;
use super::ResizeResult;
use super::VmId;
use crate::transport::bytes_to_i64;
use crate::transport::BalloonTransport;

pub(super) enum DeviceRequest {
    Resize {
        delta_bytes: i64,
        completion: Completion,
    },
    SampleStats,
}

/// Executes device requests for one balloon strictly in the order they were
/// issued, and reports every outcome back to the owning task as a
/// [BalloonEvent].
pub(super) struct DeviceWorker {
    vm_id: VmId,
    transport: Box<dyn BalloonTransport>,
    // The target of the last command the device accepted. Unlike the owner's
    // target this already includes commands whose completion hasn't been
    // handled yet.
    target_bytes: i64,
    events: UnboundedSender<BalloonEvent>,
}

impl DeviceWorker {
    pub(super) fn new(
        vm_id: VmId,
        transport: Box<dyn BalloonTransport>,
        target_bytes: i64,
        events: UnboundedSender<BalloonEvent>,
    ) -> Self {
        Self {
            vm_id,
            transport,
            target_bytes,
            events,
        }
    }

    /// Runs until the owning balloon is dropped.
    pub(super) async fn run(mut self, mut requests: UnboundedReceiver<DeviceRequest>) {
        while let Some(request) = requests.recv().await {
            let event = match request {
                DeviceRequest::Resize {
                    delta_bytes,
                    completion,
                } => Event::Resized {
                    delta_bytes,
                    result: self.resize(delta_bytes).await,
                    completion,
                },
                DeviceRequest::SampleStats => {
                    Event::StatsSampled(self.transport.get_balloon_stats().await)
                }
            };
            if self.events.send(BalloonEvent(event)).is_err() {
                break;
            }
        }
    }

    async fn resize(&mut self, delta_bytes: i64) -> ResizeResult {
        let actual_bytes = match self.transport.get_balloon_actual_size().await {
            Ok(actual_bytes) => Some(bytes_to_i64(actual_bytes)),
            Err(e) => {
                warn!("Failed to get balloon size of VM {}: {:#}", self.vm_id, e);
                None
            }
        };

        // Inflations stack on top of the tracked target so back to back inflations
        // are additive even if the guest is lagging behind. Deflations start from
        // what the guest actually gave up and can't go below zero.
        let (new_target, baseline) = if delta_bytes >= 0 {
            (
                self.target_bytes.saturating_add(delta_bytes),
                actual_bytes.unwrap_or(self.target_bytes),
            )
        } else {
            let Some(actual_bytes) = actual_bytes else {
                return ResizeResult::failed(self.target_bytes);
            };
            (actual_bytes.saturating_add(delta_bytes).max(0), actual_bytes)
        };

        if let Err(e) = self
            .transport
            .set_balloon_size(new_target.unsigned_abs())
            .await
        {
            error!(
                "Failed to resize balloon of VM {} to {}: {:#}",
                self.vm_id, new_target, e
            );
            return ResizeResult::failed(self.target_bytes);
        }

        self.target_bytes = new_target;
        ResizeResult {
            success: true,
            actual_delta_bytes: new_target - baseline,
            new_target,
        }
    }
}
