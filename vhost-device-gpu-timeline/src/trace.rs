// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Timeline trace scripts.
//!
//! A trace is a line oriented list of timeline operations, used to replay
//! submission and completion orders observed on a device:
//!
//! ```text
//! # comment
//! task draw0 1:0      # enqueue a task on ctx 1 ring 0, call it draw0
//! fence 5 1:0         # enqueue fence 5 on ctx 1 ring 0
//! fence 6 global      # enqueue fence 6 on the global ring
//! complete draw0      # the renderer finished draw0
//! poll                # explicit scan, polled delivery only
//! snapshot            # save and restore the timelines
//! ```

use std::{
    collections::{HashMap, HashSet},
    mem,
    sync::{Arc, Mutex},
};

use log::{debug, info};
use thiserror::Error as ThisError;

use crate::{
    gpu_types::VirtioGpuRing,
    snapshot::SnapshotError,
    timeline::{FenceCompletionCallback, FenceId, TaskId, VirtioGpuTimelines},
    FenceDelivery, TimelineConfig,
};

#[derive(Debug, ThisError)]
pub enum TraceError {
    #[error("line {line}: unknown command `{command}`")]
    UnknownCommand { line: usize, command: String },
    #[error("line {line}: `{command}` expects {expected} argument(s)")]
    WrongArgumentCount {
        line: usize,
        command: &'static str,
        expected: usize,
    },
    #[error("line {line}: invalid ring `{ring}`, expected `global` or `<ctx_id>:<ring_idx>`")]
    InvalidRing { line: usize, ring: String },
    #[error("line {line}: invalid fence id `{value}`")]
    InvalidFenceId { line: usize, value: String },
    #[error("line {line}: task label `{label}` is already in use")]
    DuplicateLabel { line: usize, label: String },
    #[error("line {line}: unknown task label `{label}`")]
    UnknownLabel { line: usize, label: String },
    #[error("line {line}: task `{label}` was already completed")]
    AlreadyCompleted { line: usize, label: String },
    #[error("line {line}: poll requires polled fence delivery")]
    PollWithAsyncDelivery { line: usize },
    #[error("line {line}: failed to restore snapshot: {source}")]
    Snapshot { line: usize, source: SnapshotError },
}

type Result<T> = std::result::Result<T, TraceError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceCommand {
    Task { label: String, ring: VirtioGpuRing },
    Fence { fence_id: FenceId, ring: VirtioGpuRing },
    Complete { label: String },
    Poll,
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLine {
    pub line: usize,
    pub command: TraceCommand,
}

fn parse_ring(line: usize, ring: &str) -> Result<VirtioGpuRing> {
    if ring == "global" {
        return Ok(VirtioGpuRing::Global);
    }

    let invalid = || TraceError::InvalidRing {
        line,
        ring: ring.to_string(),
    };
    let (ctx_id, ring_idx) = ring.split_once(':').ok_or_else(invalid)?;
    Ok(VirtioGpuRing::ContextSpecific {
        ctx_id: ctx_id.parse().map_err(|_| invalid())?,
        ring_idx: ring_idx.parse().map_err(|_| invalid())?,
    })
}

fn expect_args(line: usize, command: &'static str, args: &[&str], expected: usize) -> Result<()> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(TraceError::WrongArgumentCount {
            line,
            command,
            expected,
        })
    }
}

/// Parses a whole trace. Line numbers start at 1.
pub fn parse_trace(input: &str) -> Result<Vec<TraceLine>> {
    let mut lines = Vec::new();

    for (index, text) in input.lines().enumerate() {
        let line = index + 1;
        let text = text.split('#').next().unwrap_or_default();
        let mut words = text.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        let args: Vec<&str> = words.collect();

        let command = match command {
            "task" => {
                expect_args(line, "task", &args, 2)?;
                TraceCommand::Task {
                    label: args[0].to_string(),
                    ring: parse_ring(line, args[1])?,
                }
            }
            "fence" => {
                expect_args(line, "fence", &args, 2)?;
                TraceCommand::Fence {
                    fence_id: args[0].parse().map_err(|_| TraceError::InvalidFenceId {
                        line,
                        value: args[0].to_string(),
                    })?,
                    ring: parse_ring(line, args[1])?,
                }
            }
            "complete" => {
                expect_args(line, "complete", &args, 1)?;
                TraceCommand::Complete {
                    label: args[0].to_string(),
                }
            }
            "poll" => {
                expect_args(line, "poll", &args, 0)?;
                TraceCommand::Poll
            }
            "snapshot" => {
                expect_args(line, "snapshot", &args, 0)?;
                TraceCommand::Snapshot
            }
            other => {
                return Err(TraceError::UnknownCommand {
                    line,
                    command: other.to_string(),
                })
            }
        };
        lines.push(TraceLine { line, command });
    }

    Ok(lines)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignaledFence {
    pub ring: VirtioGpuRing,
    pub fence_id: FenceId,
}

type SignaledFences = Arc<Mutex<Vec<SignaledFence>>>;

fn record_signal(
    signaled: &SignaledFences,
    ring: VirtioGpuRing,
    fence_id: FenceId,
) -> FenceCompletionCallback {
    let signaled = signaled.clone();
    Box::new(move || signaled.lock().unwrap().push(SignaledFence { ring, fence_id }))
}

/// Runs trace commands against a `VirtioGpuTimelines` and records the order
/// in which fences are signaled.
pub struct TraceReplay {
    timelines: VirtioGpuTimelines,
    labels: HashMap<String, TaskId>,
    completed: HashSet<TaskId>,
    signaled: SignaledFences,
}

impl TraceReplay {
    pub fn new(config: TimelineConfig) -> Self {
        Self {
            timelines: VirtioGpuTimelines::new(config),
            labels: HashMap::new(),
            completed: HashSet::new(),
            signaled: SignaledFences::default(),
        }
    }

    pub fn step(&mut self, trace_line: &TraceLine) -> Result<()> {
        let line = trace_line.line;
        debug!("Replaying line {line}: {:?}", trace_line.command);

        match &trace_line.command {
            TraceCommand::Task { label, ring } => {
                if self.labels.contains_key(label) {
                    return Err(TraceError::DuplicateLabel {
                        line,
                        label: label.clone(),
                    });
                }
                let task_id = self.timelines.enqueue_task(ring.clone());
                self.labels.insert(label.clone(), task_id);
            }
            TraceCommand::Fence { fence_id, ring } => {
                let callback = record_signal(&self.signaled, ring.clone(), *fence_id);
                self.timelines
                    .enqueue_fence(ring.clone(), *fence_id, callback);
            }
            TraceCommand::Complete { label } => {
                let task_id = *self.labels.get(label).ok_or_else(|| TraceError::UnknownLabel {
                    line,
                    label: label.clone(),
                })?;
                if !self.completed.insert(task_id) {
                    return Err(TraceError::AlreadyCompleted {
                        line,
                        label: label.clone(),
                    });
                }
                self.timelines.notify_task_completion(task_id);
            }
            TraceCommand::Poll => {
                if self.timelines.config().delivery() != FenceDelivery::Polled {
                    return Err(TraceError::PollWithAsyncDelivery { line });
                }
                self.timelines.poll();
            }
            TraceCommand::Snapshot => {
                let bytes = self.timelines.snapshot();
                let signaled = self.signaled.clone();
                self.timelines = VirtioGpuTimelines::restore(
                    &bytes,
                    *self.timelines.config(),
                    |ring, fence_id| record_signal(&signaled, ring.clone(), fence_id),
                )
                .map_err(|source| TraceError::Snapshot { line, source })?;
                info!("Line {line}: timelines restored from a {} byte snapshot", bytes.len());
            }
        }

        Ok(())
    }

    /// Returns the fences signaled since the previous call, in signal order.
    pub fn take_signaled(&self) -> Vec<SignaledFence> {
        mem::take(&mut *self.signaled.lock().unwrap())
    }
}
