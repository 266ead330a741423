// Replay of virtio-gpu fence timelines
//
// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
    process::exit,
};

use clap::Parser;
use log::{error, info};
use thiserror::Error as ThisError;
use vhost_device_gpu_timeline::{
    trace::{parse_trace, TraceError, TraceReplay},
    FenceDelivery, TimelineConfig,
};

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub(crate) enum Error {
    #[error("Could not read trace {0}: {1}")]
    CouldNotReadTrace(PathBuf, io::Error),
    #[error("Invalid trace: {0}")]
    InvalidTrace(TraceError),
    #[error("Replay failed: {0}")]
    ReplayFailed(TraceError),
    #[error("Could not write output: {0}")]
    CouldNotWriteOutput(io::Error),
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct TimelineArgs {
    /// Trace script to replay.
    #[clap(short, long, value_name = "FILE")]
    trace: PathBuf,

    /// How reached fences are signaled
    #[clap(short, long, value_enum, default_value_t = FenceDelivery::Async)]
    delivery: FenceDelivery,
}

#[derive(Debug, PartialEq, Eq)]
struct ReplayConfiguration {
    trace: PathBuf,
    timeline: TimelineConfig,
}

impl From<TimelineArgs> for ReplayConfiguration {
    fn from(args: TimelineArgs) -> Self {
        Self {
            trace: args.trace,
            timeline: TimelineConfig::new(args.delivery),
        }
    }
}

fn replay_trace(config: &ReplayConfiguration, out: &mut impl Write) -> Result<()> {
    let script = fs::read_to_string(&config.trace)
        .map_err(|e| Error::CouldNotReadTrace(config.trace.clone(), e))?;
    let lines = parse_trace(&script).map_err(Error::InvalidTrace)?;
    info!(
        "Replaying {} commands from {} with {} fence delivery",
        lines.len(),
        config.trace.display(),
        config.timeline.delivery()
    );

    let mut replay = TraceReplay::new(config.timeline);
    for line in &lines {
        replay.step(line).map_err(Error::ReplayFailed)?;
        for fence in replay.take_signaled() {
            writeln!(out, "fence {} signaled on {}", fence.fence_id, fence.ring)
                .map_err(Error::CouldNotWriteOutput)?;
        }
    }

    Ok(())
}

fn main() {
    env_logger::init();

    let config = ReplayConfiguration::from(TimelineArgs::parse());
    if let Err(e) = replay_trace(&config, &mut io::stdout().lock()) {
        error!("{e}");
        exit(1);
    }
}
