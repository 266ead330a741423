// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

pub const VIRTIO_GPU_FLAG_FENCE: u32 = 1 << 0;
pub const VIRTIO_GPU_FLAG_INFO_RING_IDX: u32 = 1 << 1;

/// Ordering domain of a virtio-gpu command.
///
/// Fences on different rings have no ordering relation to each other.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VirtioGpuRing {
    Global,
    ContextSpecific { ctx_id: u32, ring_idx: u8 },
}

impl VirtioGpuRing {
    /// Selects the ring addressed by a control header's `flags`, `ctx_id`
    /// and `ring_idx` fields.
    pub const fn from_ctrl_hdr(flags: u32, ctx_id: u32, ring_idx: u8) -> Self {
        if flags & VIRTIO_GPU_FLAG_INFO_RING_IDX == 0 {
            Self::Global
        } else {
            Self::ContextSpecific { ctx_id, ring_idx }
        }
    }
}

impl Display for VirtioGpuRing {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::ContextSpecific { ctx_id, ring_idx } => write!(f, "ctx{ctx_id}:ring{ring_idx}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FenceDescriptor {
    pub ring: VirtioGpuRing,
    pub fence_id: u64,
    pub desc_index: u16,
    pub len: u32,
}

#[derive(Default)]
pub struct FenceState {
    pub descs: Vec<FenceDescriptor>,
    pub completed_fences: BTreeMap<VirtioGpuRing, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_from_ctrl_hdr() {
        assert_eq!(
            VirtioGpuRing::from_ctrl_hdr(VIRTIO_GPU_FLAG_FENCE, 3, 1),
            VirtioGpuRing::Global
        );
        assert_eq!(
            VirtioGpuRing::from_ctrl_hdr(VIRTIO_GPU_FLAG_FENCE | VIRTIO_GPU_FLAG_INFO_RING_IDX, 3, 1),
            VirtioGpuRing::ContextSpecific {
                ctx_id: 3,
                ring_idx: 1
            }
        );
    }

    #[test]
    fn ring_display() {
        assert_eq!(VirtioGpuRing::Global.to_string(), "global");
        let ring = VirtioGpuRing::ContextSpecific {
            ctx_id: 7,
            ring_idx: 2,
        };
        assert_eq!(ring.to_string(), "ctx7:ring2");
    }

    #[test]
    fn global_ring_orders_first() {
        let ctx = VirtioGpuRing::ContextSpecific {
            ctx_id: 0,
            ring_idx: 0,
        };
        assert!(VirtioGpuRing::Global < ctx);
    }
}
