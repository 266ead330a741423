// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod fatal;
pub mod fence;
pub mod gpu_types;
pub mod snapshot;
#[cfg(test)]
pub(crate) mod testutils;
pub mod timeline;
// Trace scripts replayed by the binary
pub mod trace;

use std::fmt::{Display, Formatter};

use clap::ValueEnum;

pub use crate::{
    gpu_types::VirtioGpuRing,
    timeline::{FenceCompletionCallback, FenceId, TaskId, VirtioGpuTimelines},
};

/// How fences reached by the timeline get signaled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum FenceDelivery {
    /// Every enqueued fence and every task completion scans the affected ring
    /// and fires ready fences before returning.
    #[default]
    Async,
    /// Fences only fire from an explicit `VirtioGpuTimelines::poll`.
    Polled,
}

impl Display for FenceDelivery {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Async => write!(f, "async"),
            Self::Polled => write!(f, "polled"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Construction time configuration of `VirtioGpuTimelines`.
pub struct TimelineConfig {
    delivery: FenceDelivery,
}

impl TimelineConfig {
    pub const fn new(delivery: FenceDelivery) -> Self {
        Self { delivery }
    }

    pub const fn delivery(&self) -> FenceDelivery {
        self.delivery
    }

    /// Whether fence callbacks fire from the mutating calls themselves.
    pub const fn with_async_callback(&self) -> bool {
        matches!(self.delivery, FenceDelivery::Async)
    }
}
