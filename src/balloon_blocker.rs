// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::sync::Arc;

use log::debug;
use log::info;
use log::warn;
use tokio::time::Instant;

use crate::balloon::Balloon;
use crate::balloon::BalloonEvent;
use crate::balloon::BalloonStallNotice;
use crate::balloon::ResizeResult;
use crate::config::BlockerConfig;
use crate::metrics::BalloonMetrics;
use crate::priority::ResizeDirection;
use crate::priority::ResizePriority;
use crate::priority::ResizeRequest;
use crate::priority::NUM_RESIZE_PRIORITIES;

/// The lowest unblocked priority of both directions at one point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockSummary {
    pub inflate: ResizePriority,
    pub deflate: ResizePriority,
}

impl fmt::Display for BlockSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inflate unblocked down to {}, deflate unblocked down to {}",
            self.inflate, self.deflate
        )
    }
}

/// Arbitrates the resize requests of one balloon.
///
/// Every request blocks the opposite direction for a while, at the level it was
/// recorded at and everything less urgent. This keeps competing producers from
/// repeatedly inflating and deflating the same balloon. A request that arrives
/// while its own direction is already blocking at a less urgent level is recorded
/// one level more urgent than the current boundary, so a producer that keeps
/// asking escalates its block step by step instead of jumping straight to its own
/// level.
pub struct BalloonBlocker {
    balloon: Balloon,
    config: BlockerConfig,
    metrics: Arc<dyn BalloonMetrics>,
    // When each (direction, priority) block expires, indexed by
    // ResizeDirection::index() then ResizePriority::index().
    unblock_at: [[Option<Instant>; NUM_RESIZE_PRIORITIES]; 2],
}

impl BalloonBlocker {
    pub fn new(balloon: Balloon, config: BlockerConfig, metrics: Arc<dyn BalloonMetrics>) -> Self {
        Self {
            balloon,
            config,
            metrics,
            unblock_at: [[None; NUM_RESIZE_PRIORITIES]; 2],
        }
    }

    pub fn balloon(&self) -> &Balloon {
        &self.balloon
    }

    pub fn target_size(&self) -> i64 {
        self.balloon.target_size()
    }

    /// Attempts to resize the balloon. Returns the delta handed to the balloon,
    /// or 0 if the request was rejected or had nothing to do.
    pub fn try_resize(&mut self, request: ResizeRequest) -> i64 {
        let now = Instant::now();
        let priority = request.priority();
        let direction = request.direction();

        self.record_resize_request(request, now);

        if priority == ResizePriority::Unspecified {
            warn!(
                "Rejected {} of VM {} without a priority",
                direction,
                self.balloon.vm_id()
            );
            return 0;
        }

        if !priority.is_override() {
            let threshold = self.lowest_unblocked_priority(direction, now);
            if threshold == ResizePriority::Unspecified || priority.is_less_urgent_than(threshold)
            {
                debug!(
                    "Rejected {} of VM {} by {} bytes at {}: {}",
                    direction,
                    self.balloon.vm_id(),
                    request.delta_bytes(),
                    priority,
                    self.block_summary(now)
                );
                return 0;
            }
        }

        let mut request = request;
        if direction == ResizeDirection::Deflate {
            // Resizes still in flight count, the balloon may be on its way up.
            request.limit_magnitude(self.balloon.issued_target_size());
        }
        let delta_bytes = request.delta_bytes();
        if delta_bytes == 0 {
            return 0;
        }

        let vm_id = self.balloon.vm_id();
        let metrics = self.metrics.clone();
        self.balloon.do_resize(
            delta_bytes,
            Box::new(move |result: &ResizeResult| {
                if result.success {
                    info!(
                        "Resized balloon of VM {} by {} bytes to {} at {}",
                        vm_id, result.actual_delta_bytes, result.new_target, priority
                    );
                } else {
                    warn!(
                        "Failed to {} balloon of VM {} by {} bytes at {}",
                        direction, vm_id, delta_bytes, priority
                    );
                }
                metrics.on_resize(direction, result, priority);
            }),
        );
        delta_bytes
    }

    /// The least urgent priority at which `direction` is allowed at `at_time`.
    /// [ResizePriority::Unspecified] means only override levels get through.
    pub fn lowest_unblocked_priority(
        &self,
        direction: ResizeDirection,
        at_time: Instant,
    ) -> ResizePriority {
        let blocks = &self.unblock_at[direction.opposite().index()];
        ResizePriority::ALL
            .iter()
            .find(|priority| matches!(blocks[priority.index()], Some(t) if t > at_time))
            .map_or(ResizePriority::Lowest, |priority| priority.stronger_ordinary())
    }

    /// Records that `request` was made at `now`, blocking the opposite direction.
    pub fn record_resize_request(&mut self, request: ResizeRequest, now: Instant) {
        let requested = request.priority();
        if matches!(
            requested,
            ResizePriority::Unspecified | ResizePriority::Lowest
        ) {
            return;
        }
        let direction = request.direction();

        // The boundary this direction currently imposes on the opposite one.
        let threshold = self.lowest_unblocked_priority(direction.opposite(), now);
        let priority = if requested.is_more_urgent_than(threshold)
            && requested.is_less_urgent_than(ResizePriority::BalloonStall)
        {
            // Lowest can't block anything.
            if threshold == ResizePriority::Lowest {
                ResizePriority::MglruReclaim
            } else {
                threshold
            }
        } else {
            requested
        };

        let unblock_at = now + self.config.block_duration(priority);
        let blocks = &mut self.unblock_at[direction.index()];
        blocks[priority.index()] = Some(unblock_at);
        for block in &mut blocks[..priority.index()] {
            *block = None;
        }
        debug!(
            "Recorded {} of VM {} at {} (requested {})",
            direction,
            self.balloon.vm_id(),
            priority,
            requested
        );
    }

    /// Passes an event of the owned balloon to it, handling a resulting stall.
    pub fn handle_balloon_event(&mut self, event: BalloonEvent) {
        if let Some(notice) = self.balloon.handle_event(event) {
            self.on_balloon_stall(notice);
        }
    }

    /// Blocks inflation after the balloon corrected a stalled inflation.
    pub fn on_balloon_stall(&mut self, notice: BalloonStallNotice) {
        self.record_resize_request(
            ResizeRequest::new(ResizePriority::BalloonStall, -1),
            Instant::now(),
        );
        warn!(
            "Balloon of VM {} stalled, deflated by {} bytes to {}",
            self.balloon.vm_id(),
            notice.result.actual_delta_bytes,
            notice.result.new_target
        );
        self.metrics.on_resize(
            ResizeDirection::Deflate,
            &notice.result,
            ResizePriority::BalloonStall,
        );
        self.metrics.on_stall(&notice.statistics);
    }

    pub fn block_summary(&self, now: Instant) -> BlockSummary {
        BlockSummary {
            inflate: self.lowest_unblocked_priority(ResizeDirection::Inflate, now),
            deflate: self.lowest_unblocked_priority(ResizeDirection::Deflate, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::balloon::StallStatistics;
    use crate::common::MIB;
    use crate::config::StallConfig;
    use crate::test_utils::fake_transport;
    use crate::test_utils::FakeDevice;
    use crate::test_utils::RecordingMetrics;

    const HIGH: Duration = Duration::from_secs(10);
    const LOW: Duration = Duration::from_secs(60);

    fn new_blocker(
        initial_bytes: i64,
    ) -> (
        BalloonBlocker,
        UnboundedReceiver<BalloonEvent>,
        FakeDevice,
        Arc<RecordingMetrics>,
    ) {
        let (transport, device) = fake_transport(initial_bytes);
        let (balloon, events) = Balloon::new(1, transport, initial_bytes, StallConfig::default());
        let metrics = Arc::new(RecordingMetrics::default());
        let blocker = BalloonBlocker::new(balloon, BlockerConfig::default(), metrics.clone());
        (blocker, events, device, metrics)
    }

    async fn handle_next_event(
        blocker: &mut BalloonBlocker,
        events: &mut UnboundedReceiver<BalloonEvent>,
    ) {
        let event = events.recv().await.unwrap();
        blocker.handle_balloon_event(event);
    }

    fn deflate(priority: ResizePriority) -> ResizeRequest {
        ResizeRequest::new(priority, -MIB)
    }

    fn inflate(priority: ResizePriority) -> ResizeRequest {
        ResizeRequest::new(priority, MIB)
    }

    #[tokio::test]
    async fn test_unblocked_by_default() {
        let (blocker, _events, _device, _metrics) = new_blocker(0);
        let now = Instant::now();
        assert_eq!(
            blocker.block_summary(now),
            BlockSummary {
                inflate: ResizePriority::Lowest,
                deflate: ResizePriority::Lowest,
            }
        );
    }

    #[tokio::test]
    async fn test_block_expires() {
        let (mut blocker, _events, _device, _metrics) = new_blocker(0);
        let now = Instant::now();

        blocker.record_resize_request(deflate(ResizePriority::MglruReclaim), now);
        assert_eq!(
            blocker.lowest_unblocked_priority(ResizeDirection::Inflate, now),
            ResizePriority::StaleCachedTab
        );
        assert_eq!(
            blocker.lowest_unblocked_priority(
                ResizeDirection::Inflate,
                now + LOW - Duration::from_millis(1)
            ),
            ResizePriority::StaleCachedTab
        );
        assert_eq!(
            blocker.lowest_unblocked_priority(ResizeDirection::Inflate, now + LOW),
            ResizePriority::Lowest
        );
        // Deflation isn't affected.
        assert_eq!(
            blocker.lowest_unblocked_priority(ResizeDirection::Deflate, now),
            ResizePriority::Lowest
        );
    }

    #[tokio::test]
    async fn test_override_block() {
        let (mut blocker, _events, _device, _metrics) = new_blocker(0);
        let now = Instant::now();

        blocker.record_resize_request(inflate(ResizePriority::Highest), now);
        assert_eq!(
            blocker.lowest_unblocked_priority(ResizeDirection::Deflate, now),
            ResizePriority::Unspecified
        );
        assert_eq!(
            blocker.lowest_unblocked_priority(ResizeDirection::Deflate, now + HIGH),
            ResizePriority::Lowest
        );
    }

    #[tokio::test]
    async fn test_lowest_and_unspecified_are_not_recorded() {
        let (mut blocker, _events, _device, _metrics) = new_blocker(0);
        let now = Instant::now();

        blocker.record_resize_request(deflate(ResizePriority::Lowest), now);
        blocker.record_resize_request(inflate(ResizePriority::Unspecified), now);
        assert_eq!(
            blocker.block_summary(now),
            BlockSummary {
                inflate: ResizePriority::Lowest,
                deflate: ResizePriority::Lowest,
            }
        );
    }

    #[tokio::test]
    async fn test_escalation() {
        let (mut blocker, _events, _device, _metrics) = new_blocker(0);
        let now = Instant::now();

        let expected_inflate_thresholds = [
            ResizePriority::StaleCachedTab,
            ResizePriority::CachedApp,
            ResizePriority::CachedTab,
            ResizePriority::PerceptibleApp,
            ResizePriority::PerceptibleTab,
            ResizePriority::FocusedApp,
            ResizePriority::FocusedTab,
            // Can't escalate past the requested level.
            ResizePriority::FocusedTab,
        ];
        for expected in expected_inflate_thresholds {
            blocker.record_resize_request(deflate(ResizePriority::FocusedApp), now);
            assert_eq!(
                blocker.lowest_unblocked_priority(ResizeDirection::Inflate, now),
                expected
            );
        }

        assert_eq!(
            blocker.lowest_unblocked_priority(
                ResizeDirection::Inflate,
                now + HIGH - Duration::from_millis(1)
            ),
            ResizePriority::FocusedTab
        );
        // The low priority blocks outlive the escalated ones.
        assert_eq!(
            blocker.lowest_unblocked_priority(ResizeDirection::Inflate, now + HIGH),
            ResizePriority::CachedTab
        );
        assert_eq!(
            blocker.lowest_unblocked_priority(ResizeDirection::Inflate, now + LOW),
            ResizePriority::Lowest
        );
    }

    #[tokio::test]
    async fn test_less_urgent_request_clears_block() {
        let (mut blocker, _events, _device, _metrics) = new_blocker(0);
        let now = Instant::now();

        blocker.record_resize_request(deflate(ResizePriority::Highest), now);
        assert_eq!(
            blocker.lowest_unblocked_priority(ResizeDirection::Inflate, now),
            ResizePriority::Unspecified
        );

        blocker.record_resize_request(deflate(ResizePriority::CachedApp), now);
        assert_eq!(
            blocker.lowest_unblocked_priority(ResizeDirection::Inflate, now),
            ResizePriority::CachedTab
        );
    }

    #[tokio::test]
    async fn test_escalated_deflates_reject_inflate() {
        tokio::time::pause();
        let (mut blocker, mut events, _device, _metrics) = new_blocker(1024 * MIB);

        for _ in 0..7 {
            assert_eq!(blocker.try_resize(deflate(ResizePriority::FocusedApp)), -MIB);
            handle_next_event(&mut blocker, &mut events).await;
        }
        assert_eq!(
            blocker.lowest_unblocked_priority(ResizeDirection::Inflate, Instant::now()),
            ResizePriority::FocusedTab
        );

        assert_eq!(blocker.try_resize(inflate(ResizePriority::CachedTab)), 0);
        assert_eq!(blocker.try_resize(inflate(ResizePriority::FocusedTab)), MIB);
    }

    #[tokio::test]
    async fn test_highest_deflate_is_capped_to_target() {
        tokio::time::pause();
        let (mut blocker, mut events, device, metrics) = new_blocker(0);

        assert_eq!(
            blocker.try_resize(ResizeRequest::new(ResizePriority::Highest, 128 * MIB)),
            128 * MIB
        );
        handle_next_event(&mut blocker, &mut events).await;
        assert_eq!(blocker.target_size(), 128 * MIB);

        assert_eq!(
            blocker.try_resize(ResizeRequest::new(ResizePriority::Highest, -256 * MIB)),
            -128 * MIB
        );
        handle_next_event(&mut blocker, &mut events).await;
        assert_eq!(blocker.target_size(), 0);
        assert_eq!(device.set_calls(), vec![128 * MIB as u64, 0]);

        assert_eq!(
            metrics.resizes(),
            vec![
                (
                    ResizeResult {
                        success: true,
                        actual_delta_bytes: 128 * MIB,
                        new_target: 128 * MIB,
                    },
                    ResizePriority::Highest
                ),
                (
                    ResizeResult {
                        success: true,
                        actual_delta_bytes: -128 * MIB,
                        new_target: 0,
                    },
                    ResizePriority::Highest
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_deflate_is_capped_to_in_flight_target() {
        tokio::time::pause();
        let (mut blocker, mut events, device, _metrics) = new_blocker(0);

        assert_eq!(
            blocker.try_resize(ResizeRequest::new(ResizePriority::Highest, 128 * MIB)),
            128 * MIB
        );
        // The inflation hasn't completed yet.
        assert_eq!(blocker.target_size(), 0);
        assert_eq!(
            blocker.try_resize(ResizeRequest::new(ResizePriority::Highest, -256 * MIB)),
            -128 * MIB
        );

        handle_next_event(&mut blocker, &mut events).await;
        handle_next_event(&mut blocker, &mut events).await;
        assert_eq!(blocker.target_size(), 0);
        assert_eq!(device.set_calls(), vec![128 * MIB as u64, 0]);
    }

    #[tokio::test]
    async fn test_zero_delta_is_recorded_but_not_forwarded() {
        tokio::time::pause();
        let (mut blocker, _events, device, _metrics) = new_blocker(0);

        assert_eq!(
            blocker.try_resize(ResizeRequest::new(ResizePriority::CachedApp, 0)),
            0
        );
        // Deflating an empty balloon is capped to nothing.
        assert_eq!(blocker.try_resize(deflate(ResizePriority::Highest)), 0);
        assert!(device.set_calls().is_empty());

        assert_eq!(
            blocker.lowest_unblocked_priority(ResizeDirection::Deflate, Instant::now()),
            ResizePriority::StaleCachedTab
        );
    }

    #[tokio::test]
    async fn test_unspecified_request_is_rejected() {
        tokio::time::pause();
        let (mut blocker, _events, device, _metrics) = new_blocker(0);

        assert_eq!(blocker.try_resize(inflate(ResizePriority::Unspecified)), 0);
        assert!(device.set_calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_resize_is_reported() {
        tokio::time::pause();
        let (mut blocker, mut events, device, metrics) = new_blocker(0);
        device.set_fail_set(true);

        assert_eq!(blocker.try_resize(inflate(ResizePriority::CachedApp)), MIB);
        handle_next_event(&mut blocker, &mut events).await;
        assert_eq!(
            metrics.resizes(),
            vec![(ResizeResult::failed(0), ResizePriority::CachedApp)]
        );
        assert_eq!(blocker.target_size(), 0);
        assert_eq!(metrics.resize_directions(), vec![ResizeDirection::Inflate]);
    }

    #[tokio::test]
    async fn test_failed_deflate_is_reported_as_deflate() {
        tokio::time::pause();
        let (mut blocker, mut events, device, metrics) = new_blocker(64 * MIB);
        device.set_fail_get(true);

        assert_eq!(blocker.try_resize(deflate(ResizePriority::CachedApp)), -MIB);
        handle_next_event(&mut blocker, &mut events).await;
        assert_eq!(
            metrics.resizes(),
            vec![(ResizeResult::failed(64 * MIB), ResizePriority::CachedApp)]
        );
        assert_eq!(metrics.resize_directions(), vec![ResizeDirection::Deflate]);
    }

    #[tokio::test]
    async fn test_stall_notice_blocks_inflation() {
        tokio::time::pause();
        let (mut blocker, _events, _device, metrics) = new_blocker(0);
        let notice = BalloonStallNotice {
            result: ResizeResult {
                success: true,
                actual_delta_bytes: -16 * MIB,
                new_target: 0,
            },
            statistics: StallStatistics {
                inflate_bytes_per_sec: 0,
                stalled_for: Duration::from_secs(100),
                actual_bytes: 16 * MIB,
                target_bytes: 128 * MIB,
            },
        };

        blocker.on_balloon_stall(notice);
        let now = Instant::now();
        assert_eq!(
            blocker.lowest_unblocked_priority(ResizeDirection::Inflate, now),
            ResizePriority::Unspecified
        );
        assert_eq!(
            blocker.lowest_unblocked_priority(ResizeDirection::Inflate, now + HIGH),
            ResizePriority::Lowest
        );
        assert_eq!(
            metrics.resizes(),
            vec![(notice.result, ResizePriority::BalloonStall)]
        );
        assert_eq!(metrics.stalls(), vec![notice.statistics]);

        assert_eq!(blocker.try_resize(inflate(ResizePriority::FocusedTab)), 0);
        assert_eq!(blocker.try_resize(inflate(ResizePriority::Highest)), MIB);
    }

    #[tokio::test]
    async fn test_stalled_balloon_blocks_inflation() {
        tokio::time::pause();
        let (mut blocker, mut events, device, metrics) = new_blocker(0);
        device.set_auto_apply(false);

        assert_eq!(
            blocker.try_resize(ResizeRequest::new(ResizePriority::Highest, 128 * MIB)),
            128 * MIB
        );
        while metrics.stalls().is_empty() {
            handle_next_event(&mut blocker, &mut events).await;
        }

        assert_eq!(blocker.target_size(), 0);
        assert_eq!(
            blocker.lowest_unblocked_priority(ResizeDirection::Inflate, Instant::now()),
            ResizePriority::Unspecified
        );
        assert_eq!(metrics.resizes().len(), 2);
        assert_eq!(metrics.resizes()[1].1, ResizePriority::BalloonStall);
        assert_eq!(
            metrics.resize_directions(),
            vec![ResizeDirection::Inflate, ResizeDirection::Deflate]
        );
    }

    #[test]
    fn test_block_summary_display() {
        let summary = BlockSummary {
            inflate: ResizePriority::FocusedTab,
            deflate: ResizePriority::Lowest,
        };
        assert_eq!(
            summary.to_string(),
            "inflate unblocked down to focused-tab, deflate unblocked down to lowest"
        );
    }
}
