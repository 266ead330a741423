// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Save and restore of timeline state.
//!
//! The buffer is a header, then for every ring a ring record followed by one
//! item record per queued task or fence, in queue order. All records are
//! fixed-layout little-endian structs.

use std::{
    collections::VecDeque,
    io::{self, Read},
    mem::size_of,
};

use log::{debug, warn};
use thiserror::Error as ThisError;
use vm_memory::{ByteValued, Le32, Le64};

use crate::{
    gpu_types::VirtioGpuRing,
    timeline::{
        Fence, FenceCompletionCallback, FenceId, Task, TimelineItem, TimelinesState,
        VirtioGpuTimelines,
    },
    TimelineConfig,
};

pub const SNAPSHOT_MAGIC: u32 = 0x4C4E_4D54;
pub const SNAPSHOT_VERSION: u32 = 1;

const RING_KIND_GLOBAL: u8 = 0;
const RING_KIND_CONTEXT: u8 = 1;

const ITEM_KIND_TASK: u8 = 0;
const ITEM_KIND_FENCE: u8 = 1;

#[derive(Debug, ThisError)]
pub enum SnapshotError {
    #[error("Snapshot is truncated: {0}")]
    Truncated(io::Error),
    #[error("Invalid snapshot magic {0:#x}")]
    InvalidMagic(u32),
    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("Invalid ring kind {0}")]
    InvalidRingKind(u8),
    #[error("Invalid timeline item kind {0}")]
    InvalidItemKind(u8),
    #[error("Ring {0} appears more than once")]
    DuplicateRing(VirtioGpuRing),
    #[error("Task {0} appears more than once")]
    DuplicateTask(u64),
    #[error("Task {task_id} is not below the saved next task id {next_task_id}")]
    TaskIdOutOfRange { task_id: u64, next_task_id: u64 },
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
struct SnapshotHeader {
    magic: Le32,
    version: Le32,
    num_rings: Le32,
    padding: Le32,
    next_task_id: Le64,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for SnapshotHeader {}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
struct RingRecord {
    kind: u8,
    ring_idx: u8,
    padding: [u8; 2],
    ctx_id: Le32,
    num_items: Le32,
    padding2: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for RingRecord {}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
struct ItemRecord {
    kind: u8,
    completed: u8,
    padding: [u8; 6],
    id: Le64,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for ItemRecord {}

impl From<&VirtioGpuRing> for RingRecord {
    fn from(ring: &VirtioGpuRing) -> Self {
        match *ring {
            VirtioGpuRing::Global => Self {
                kind: RING_KIND_GLOBAL,
                ..Default::default()
            },
            VirtioGpuRing::ContextSpecific { ctx_id, ring_idx } => Self {
                kind: RING_KIND_CONTEXT,
                ring_idx,
                ctx_id: ctx_id.into(),
                ..Default::default()
            },
        }
    }
}

impl TryFrom<RingRecord> for VirtioGpuRing {
    type Error = SnapshotError;

    fn try_from(record: RingRecord) -> Result<Self> {
        match record.kind {
            RING_KIND_GLOBAL => Ok(Self::Global),
            RING_KIND_CONTEXT => Ok(Self::ContextSpecific {
                ctx_id: record.ctx_id.into(),
                ring_idx: record.ring_idx,
            }),
            kind => Err(SnapshotError::InvalidRingKind(kind)),
        }
    }
}

fn read_record<T: ByteValued + Default>(reader: &mut impl Read) -> Result<T> {
    let mut record = T::default();
    reader
        .read_exact(record.as_mut_slice())
        .map_err(SnapshotError::Truncated)?;
    Ok(record)
}

fn item_record(item: &TimelineItem) -> ItemRecord {
    match item {
        TimelineItem::Task(task) => ItemRecord {
            kind: ITEM_KIND_TASK,
            completed: u8::from(task.has_completed()),
            id: task.id.into(),
            ..Default::default()
        },
        TimelineItem::Fence(fence) => ItemRecord {
            kind: ITEM_KIND_FENCE,
            id: fence.id.into(),
            ..Default::default()
        },
    }
}

impl VirtioGpuTimelines {
    /// Serializes every ring's queue, in order, into an opaque buffer.
    ///
    /// Fence callbacks are not saved; [`Self::restore`] asks the caller to
    /// rebuild them.
    pub fn snapshot(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let num_items: usize = state.queues.values().map(VecDeque::len).sum();
        let mut buf = Vec::with_capacity(
            size_of::<SnapshotHeader>()
                + state.queues.len() * size_of::<RingRecord>()
                + num_items * size_of::<ItemRecord>(),
        );

        let header = SnapshotHeader {
            magic: SNAPSHOT_MAGIC.into(),
            version: SNAPSHOT_VERSION.into(),
            num_rings: (state.queues.len() as u32).into(),
            next_task_id: state.next_task_id.into(),
            ..Default::default()
        };
        buf.extend_from_slice(header.as_slice());

        for (ring, queue) in &state.queues {
            let record = RingRecord {
                num_items: (queue.len() as u32).into(),
                ..RingRecord::from(ring)
            };
            buf.extend_from_slice(record.as_slice());
            for item in queue {
                buf.extend_from_slice(item_record(item).as_slice());
            }
        }

        debug!(
            "Saved {} timelines with {num_items} items ({} bytes)",
            state.queues.len(),
            buf.len()
        );
        buf
    }

    /// Rebuilds timelines from a buffer produced by [`Self::snapshot`].
    ///
    /// `fence_factory` is called once per saved fence, in queue order, with
    /// the fence's ring and id, and returns the fence's completion callback.
    /// With async delivery every ring is scanned once restored, firing any
    /// fence that is no longer blocked.
    pub fn restore<F>(
        mut bytes: &[u8],
        config: TimelineConfig,
        mut fence_factory: F,
    ) -> Result<Self>
    where
        F: FnMut(&VirtioGpuRing, FenceId) -> FenceCompletionCallback,
    {
        let header: SnapshotHeader = read_record(&mut bytes)?;
        let magic: u32 = header.magic.into();
        if magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic(magic));
        }
        let version: u32 = header.version.into();
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        let next_task_id: u64 = header.next_task_id.into();
        let mut state = TimelinesState {
            next_task_id,
            ..Default::default()
        };

        for _ in 0..u32::from(header.num_rings) {
            let record: RingRecord = read_record(&mut bytes)?;
            let ring = VirtioGpuRing::try_from(record)?;
            if state.queues.contains_key(&ring) {
                return Err(SnapshotError::DuplicateRing(ring));
            }
            state.queues.insert(ring.clone(), VecDeque::new());

            for _ in 0..u32::from(record.num_items) {
                let item: ItemRecord = read_record(&mut bytes)?;
                let id: u64 = item.id.into();
                match item.kind {
                    ITEM_KIND_TASK => {
                        if id >= next_task_id {
                            return Err(SnapshotError::TaskIdOutOfRange {
                                task_id: id,
                                next_task_id,
                            });
                        }
                        if state.tasks.contains_key(&id) {
                            return Err(SnapshotError::DuplicateTask(id));
                        }
                        state.push_task(Task::new(id, ring.clone(), item.completed != 0));
                    }
                    ITEM_KIND_FENCE => {
                        let completion = fence_factory(&ring, id);
                        state.push_fence(Fence::new(id, ring.clone(), completion));
                    }
                    kind => return Err(SnapshotError::InvalidItemKind(kind)),
                }
            }
        }

        if !bytes.is_empty() {
            warn!("Rejecting timeline snapshot with trailing data");
            return Err(SnapshotError::TrailingBytes(bytes.len()));
        }

        debug!("Restored {} timelines", state.queues.len());
        if config.with_async_callback() {
            state.poll_all();
        }
        Ok(Self::from_state(config, state))
    }
}
