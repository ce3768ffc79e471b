// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Arbitrates balloon resize requests of VMs.
//!
//! Producers ask a [balloon_blocker::BalloonBlocker] to inflate or deflate a
//! VM's balloon at some [priority::ResizePriority]. Every request blocks the
//! opposite direction for a while, so producers with different goals don't keep
//! undoing each other. The [balloon::Balloon] tracks the target, executes the
//! resizes through a [transport::BalloonTransport] and corrects inflations the
//! guest stops making progress on.

pub mod balloon;
pub mod balloon_blocker;
mod common;
pub mod config;
pub mod metrics;
pub mod priority;
pub mod transport;
pub mod vm_balloon;

#[cfg(test)]
mod test_utils;
