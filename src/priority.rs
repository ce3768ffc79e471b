// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;

/// The urgency of a balloon resize. Smaller ordinals are more urgent.
///
/// The representing numbers are stable and are used to index the block
/// bookkeeping and to read the low priority cutoff from the config directory.
/// Do not renumber existing entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResizePriority {
    /// Nothing is allowed through. Returned by lookups, never requested.
    Unspecified = 0,
    /// Always admitted.
    Highest = 1,
    /// Only used internally when a balloon stall is corrected.
    BalloonStall = 2,
    FocusedTab = 3,
    FocusedApp = 4,
    PerceptibleTab = 5,
    PerceptibleApp = 6,
    CachedTab = 7,
    CachedApp = 8,
    StaleCachedTab = 9,
    MglruReclaim = 10,
    /// Can never block anything.
    Lowest = 11,
}

pub const NUM_RESIZE_PRIORITIES: usize = ResizePriority::Lowest as usize + 1;

impl ResizePriority {
    /// Every level, from the most urgent to the least urgent.
    pub const ALL: [ResizePriority; NUM_RESIZE_PRIORITIES] = [
        ResizePriority::Unspecified,
        ResizePriority::Highest,
        ResizePriority::BalloonStall,
        ResizePriority::FocusedTab,
        ResizePriority::FocusedApp,
        ResizePriority::PerceptibleTab,
        ResizePriority::PerceptibleApp,
        ResizePriority::CachedTab,
        ResizePriority::CachedApp,
        ResizePriority::StaleCachedTab,
        ResizePriority::MglruReclaim,
        ResizePriority::Lowest,
    ];

    pub fn from_ordinal(ordinal: u64) -> Option<Self> {
        Self::ALL.get(usize::try_from(ordinal).ok()?).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_more_urgent_than(self, other: ResizePriority) -> bool {
        self.index() < other.index()
    }

    pub fn is_less_urgent_than(self, other: ResizePriority) -> bool {
        self.index() > other.index()
    }

    /// Levels issued by producers that are subject to blocking.
    pub fn is_ordinary(self) -> bool {
        self.index() >= ResizePriority::FocusedTab.index()
    }

    /// Levels that bypass both admission and escalation capping.
    pub fn is_override(self) -> bool {
        matches!(self, ResizePriority::Highest | ResizePriority::BalloonStall)
    }

    /// The next more urgent level, if any.
    pub fn stronger(self) -> Option<Self> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    /// The next less urgent level, if any.
    pub fn weaker(self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// The next more urgent ordinary level, or [ResizePriority::Unspecified] when
    /// there is none.
    pub fn stronger_ordinary(self) -> Self {
        match self.stronger() {
            Some(priority) if priority.is_ordinary() => priority,
            _ => ResizePriority::Unspecified,
        }
    }

    pub fn to_name(self) -> &'static str {
        match self {
            ResizePriority::Unspecified => "unspecified",
            ResizePriority::Highest => "highest",
            ResizePriority::BalloonStall => "balloon-stall",
            ResizePriority::FocusedTab => "focused-tab",
            ResizePriority::FocusedApp => "focused-app",
            ResizePriority::PerceptibleTab => "perceptible-tab",
            ResizePriority::PerceptibleApp => "perceptible-app",
            ResizePriority::CachedTab => "cached-tab",
            ResizePriority::CachedApp => "cached-app",
            ResizePriority::StaleCachedTab => "stale-cached-tab",
            ResizePriority::MglruReclaim => "mglru-reclaim",
            ResizePriority::Lowest => "lowest",
        }
    }
}

impl fmt::Display for ResizePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResizeDirection {
    Inflate = 0,
    Deflate = 1,
}

impl ResizeDirection {
    pub fn opposite(self) -> Self {
        match self {
            ResizeDirection::Inflate => ResizeDirection::Deflate,
            ResizeDirection::Deflate => ResizeDirection::Inflate,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ResizeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResizeDirection::Inflate => f.write_str("inflate"),
            ResizeDirection::Deflate => f.write_str("deflate"),
        }
    }
}

/// A request to grow (non-negative delta) or shrink (negative delta) a balloon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResizeRequest {
    priority: ResizePriority,
    delta_bytes: i64,
}

impl ResizeRequest {
    pub fn new(priority: ResizePriority, delta_bytes: i64) -> Self {
        Self {
            priority,
            delta_bytes,
        }
    }

    pub fn priority(&self) -> ResizePriority {
        self.priority
    }

    pub fn delta_bytes(&self) -> i64 {
        self.delta_bytes
    }

    pub fn direction(&self) -> ResizeDirection {
        if self.delta_bytes < 0 {
            ResizeDirection::Deflate
        } else {
            ResizeDirection::Inflate
        }
    }

    /// Shrinks the magnitude of the request to at most `limit_bytes`. The sign
    /// of the delta never flips.
    pub fn limit_magnitude(&mut self, limit_bytes: i64) {
        let limit_bytes = limit_bytes.max(0);
        self.delta_bytes = self.delta_bytes.clamp(-limit_bytes, limit_bytes);
    }
}
