// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    io,
    sync::{Arc, Mutex},
};

use log::{debug, error};

use crate::{
    gpu_types::{FenceDescriptor, FenceState, VirtioGpuRing, VIRTIO_GPU_FLAG_FENCE},
    timeline::{FenceCompletionCallback, FenceId},
};

/// The used ring of the control queue, where fenced responses are returned
/// to the guest once their fence has been reached.
#[cfg_attr(test, mockall::automock)]
pub trait FenceSink: Send + Sync {
    fn add_used(&self, desc_index: u16, len: u32) -> io::Result<()>;
    fn signal_used_queue(&self) -> io::Result<()>;
}

/// Holds back fenced responses until the timeline signals their fence.
pub struct FenceTracker<S> {
    sink: S,
    fence_state: Mutex<FenceState>,
}

impl<S: FenceSink + 'static> FenceTracker<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            fence_state: Mutex::new(FenceState::default()),
        }
    }

    /// Returns true if `fence_id` was already reached on `ring`, in which case
    /// the caller returns the response right away. Otherwise the descriptor is
    /// kept until [`Self::fence_completed`] covers it.
    pub fn process_fence(
        &self,
        ring: VirtioGpuRing,
        fence_id: FenceId,
        desc_index: u16,
        len: u32,
    ) -> bool {
        // In case the fence is signaled immediately after creation, don't add a return
        // FenceDescriptor.
        let mut fence_state = self.fence_state.lock().unwrap();
        if fence_id > *fence_state.completed_fences.get(&ring).unwrap_or(&0) {
            fence_state.descs.push(FenceDescriptor {
                ring,
                fence_id,
                desc_index,
                len,
            });

            false
        } else {
            true
        }
    }

    /// Like [`Self::process_fence`], with the ring taken from a control header.
    /// Responses to unfenced commands can always be returned right away.
    pub fn process_ctrl_fence(
        &self,
        flags: u32,
        fence_id: FenceId,
        ctx_id: u32,
        ring_idx: u8,
        desc_index: u16,
        len: u32,
    ) -> bool {
        if flags & VIRTIO_GPU_FLAG_FENCE == 0 {
            return true;
        }
        let ring = VirtioGpuRing::from_ctrl_hdr(flags, ctx_id, ring_idx);
        debug!("Processing fence {fence_id} on {ring} for descriptor {desc_index}");
        self.process_fence(ring, fence_id, desc_index, len)
    }

    /// Returns every held descriptor of `ring` up to `fence_id` to the guest.
    pub fn fence_completed(&self, ring: VirtioGpuRing, fence_id: FenceId) {
        debug!("Fence {fence_id} completed on {ring}");
        let mut fence_state = self.fence_state.lock().unwrap();
        let mut i = 0;

        while i < fence_state.descs.len() {
            if fence_state.descs[i].ring == ring && fence_state.descs[i].fence_id <= fence_id {
                let completed_desc = fence_state.descs.remove(i);
                debug!(
                    "Returning fenced descriptor {} ({} bytes)",
                    completed_desc.desc_index, completed_desc.len
                );

                if let Err(e) = self
                    .sink
                    .add_used(completed_desc.desc_index, completed_desc.len)
                {
                    error!(
                        "Failed to return descriptor {}: {e}",
                        completed_desc.desc_index
                    );
                    continue;
                }
                if let Err(e) = self.sink.signal_used_queue() {
                    error!("Failed to signal used queue: {e}");
                }
            } else {
                i += 1;
            }
        }

        // Update the last completed fence for this ring
        fence_state.completed_fences.insert(ring, fence_id);
    }

    /// The callback to hand to `VirtioGpuTimelines::enqueue_fence` for
    /// `fence_id` on `ring`.
    pub fn completion_callback(
        self: &Arc<Self>,
        ring: VirtioGpuRing,
        fence_id: FenceId,
    ) -> FenceCompletionCallback {
        let tracker = self.clone();
        Box::new(move || tracker.fence_completed(ring, fence_id))
    }

    /// Fence factory for `VirtioGpuTimelines::restore`.
    pub fn fence_factory(
        self: &Arc<Self>,
    ) -> impl FnMut(&VirtioGpuRing, FenceId) -> FenceCompletionCallback {
        let tracker = self.clone();
        move |ring: &VirtioGpuRing, fence_id: FenceId| {
            tracker.completion_callback(ring.clone(), fence_id)
        }
    }

    pub fn pending_descriptors(&self) -> usize {
        self.fence_state.lock().unwrap().descs.len()
    }
}
