// Copyright 2025 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Per-ring ordering of fences behind asynchronously completing GPU tasks.
//!
//! Every ring owns a FIFO of timeline items. A task blocks every item queued
//! after it until the renderer reports it complete; a fence fires as soon as
//! nothing ahead of it on its ring is still pending. Rings are independent.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
};

use log::{debug, trace};

use crate::{
    fatal::{timeline_fatal, AbortReason},
    gpu_types::VirtioGpuRing,
    TimelineConfig,
};

pub type TaskId = u64;
pub type FenceId = u64;

/// Deferred action run once when a fence is reached.
pub type FenceCompletionCallback = Box<dyn FnOnce() + Send>;

pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) ring: VirtioGpuRing,
    completed: AtomicBool,
}

impl Task {
    pub(crate) fn new(id: TaskId, ring: VirtioGpuRing, completed: bool) -> Self {
        Self {
            id,
            ring,
            completed: AtomicBool::new(completed),
        }
    }

    pub(crate) fn has_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

pub(crate) struct Fence {
    pub(crate) id: FenceId,
    pub(crate) ring: VirtioGpuRing,
    completion: FenceCompletionCallback,
}

impl Fence {
    pub(crate) fn new(id: FenceId, ring: VirtioGpuRing, completion: FenceCompletionCallback) -> Self {
        Self {
            id,
            ring,
            completion,
        }
    }

    fn signal(self) {
        debug!("Signaling fence {} on {}", self.id, self.ring);
        (self.completion)();
    }
}

pub(crate) enum TimelineItem {
    /// The queue entry is the only strong reference to a task.
    Task(Arc<Task>),
    Fence(Fence),
}

#[derive(Default)]
pub(crate) struct TimelinesState {
    pub(crate) next_task_id: TaskId,
    pub(crate) queues: BTreeMap<VirtioGpuRing, VecDeque<TimelineItem>>,
    pub(crate) tasks: HashMap<TaskId, Weak<Task>>,
}

impl TimelinesState {
    pub(crate) fn push_task(&mut self, task: Task) {
        let task = Arc::new(task);
        self.tasks.insert(task.id, Arc::downgrade(&task));
        self.queues
            .entry(task.ring.clone())
            .or_default()
            .push_back(TimelineItem::Task(task));
    }

    pub(crate) fn push_fence(&mut self, fence: Fence) {
        self.queues
            .entry(fence.ring.clone())
            .or_default()
            .push_back(TimelineItem::Fence(fence));
    }

    /// Fires every fence at the front of `ring` that is not blocked by a
    /// pending task, and retires the completed tasks passed on the way.
    pub(crate) fn poll_ring(&mut self, ring: &VirtioGpuRing) {
        let Some(queue) = self.queues.get_mut(ring) else {
            timeline_fatal!(AbortReason::UnknownRing, "ring {ring} has no timeline");
        };

        loop {
            let blocked = match queue.front() {
                None => break,
                Some(TimelineItem::Task(task)) => !task.has_completed(),
                Some(TimelineItem::Fence(_)) => false,
            };
            if blocked {
                break;
            }

            match queue.pop_front() {
                Some(TimelineItem::Fence(fence)) => fence.signal(),
                Some(TimelineItem::Task(task)) => {
                    trace!("Retiring task {} on {ring}", task.id);
                    self.tasks.remove(&task.id);
                }
                None => break,
            }
        }
    }

    pub(crate) fn poll_all(&mut self) {
        let rings: Vec<VirtioGpuRing> = self.queues.keys().cloned().collect();
        for ring in &rings {
            self.poll_ring(ring);
        }
    }
}

/// Orders fence completion behind the GPU tasks submitted before each fence.
///
/// All rings share one lock. Fence callbacks run while that lock is held, so
/// a callback must neither call back into the same `VirtioGpuTimelines` nor
/// block, otherwise it deadlocks or stalls every other ring.
pub struct VirtioGpuTimelines {
    config: TimelineConfig,
    pub(crate) state: Mutex<TimelinesState>,
}

impl fmt::Debug for VirtioGpuTimelines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("VirtioGpuTimelines");
        debug.field("config", &self.config);
        if let Ok(state) = self.state.try_lock() {
            debug
                .field("next_task_id", &state.next_task_id)
                .field("rings", &state.queues.len())
                .field("tasks", &state.tasks.len());
        }
        debug.finish_non_exhaustive()
    }
}

impl VirtioGpuTimelines {
    pub fn new(config: TimelineConfig) -> Self {
        Self::from_state(config, TimelinesState::default())
    }

    pub(crate) fn from_state(config: TimelineConfig, state: TimelinesState) -> Self {
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub const fn config(&self) -> &TimelineConfig {
        &self.config
    }

    const fn delivers_async(&self) -> bool {
        self.config.with_async_callback()
    }

    /// Queues a pending task on `ring` and returns its id. The id must be
    /// passed to [`Self::notify_task_completion`] exactly once.
    pub fn enqueue_task(&self, ring: VirtioGpuRing) -> TaskId {
        let mut state = self.state.lock().unwrap();
        let id = state.next_task_id;
        state.next_task_id += 1;
        trace!("Enqueue task {id} on {ring}");
        state.push_task(Task::new(id, ring, false));
        id
    }

    /// Queues a fence on `ring`.
    ///
    /// With async delivery the ring is scanned right away, so a fence with no
    /// pending task ahead of it fires before this returns. `completion` runs
    /// under the timeline lock and must not re-enter this object.
    pub fn enqueue_fence<F>(&self, ring: VirtioGpuRing, fence_id: FenceId, completion: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock().unwrap();
        trace!("Enqueue fence {fence_id} on {ring}");
        state.push_fence(Fence::new(fence_id, ring.clone(), Box::new(completion)));
        if self.delivers_async() {
            state.poll_ring(&ring);
        }
    }

    /// Marks a task as complete and, with async delivery, fires the fences it
    /// was holding back.
    ///
    /// Aborts the process if `task_id` was never issued, was already retired,
    /// or was already reported complete.
    pub fn notify_task_completion(&self, task_id: TaskId) {
        let mut state = self.state.lock().unwrap();
        let Some(task) = state.tasks.get(&task_id) else {
            timeline_fatal!(AbortReason::UnknownTask, "task {task_id} can't be found");
        };
        let Some(task) = task.upgrade() else {
            timeline_fatal!(AbortReason::ExpiredTask, "task {task_id} has been destroyed");
        };
        if task.id != task_id {
            timeline_fatal!(
                AbortReason::TaskIdMismatch,
                "expected task {task_id}, found task {}",
                task.id
            );
        }
        if task.completed.swap(true, Ordering::AcqRel) {
            timeline_fatal!(
                AbortReason::TaskAlreadyCompleted,
                "task {task_id} has already been completed"
            );
        }

        trace!("Task {task_id} on {} completed", task.ring);
        if self.delivers_async() {
            state.poll_ring(&task.ring);
        }
    }

    /// Scans every ring. Only valid with [`crate::FenceDelivery::Polled`]; with
    /// async delivery the mutating calls already scan, and calling this
    /// aborts the process.
    pub fn poll(&self) {
        if self.delivers_async() {
            timeline_fatal!(
                AbortReason::PollUnsupported,
                "can't poll timelines configured for async fence delivery"
            );
        }
        self.state.lock().unwrap().poll_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread};

    use super::*;
    use crate::{testutils::assert_aborts, FenceDelivery};

    fn ctx_ring(ctx_id: u32) -> VirtioGpuRing {
        VirtioGpuRing::ContextSpecific {
            ctx_id,
            ring_idx: 0,
        }
    }

    type Fired = Arc<Mutex<Vec<FenceId>>>;

    fn recorder(fired: &Fired, fence_id: FenceId) -> impl FnOnce() + Send + 'static {
        let fired = fired.clone();
        move || fired.lock().unwrap().push(fence_id)
    }

    fn fired_ids(fired: &Fired) -> Vec<FenceId> {
        fired.lock().unwrap().clone()
    }

    fn async_timelines() -> VirtioGpuTimelines {
        VirtioGpuTimelines::new(TimelineConfig::new(FenceDelivery::Async))
    }

    #[test]
    fn task_ids_are_unique_across_rings() {
        let timelines = async_timelines();
        let mut ids = Vec::new();
        for i in 0..64 {
            let ring = if i % 3 == 0 {
                VirtioGpuRing::Global
            } else {
                ctx_ring(i % 5)
            };
            ids.push(timelines.enqueue_task(ring));
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn fence_waits_for_preceding_task() {
        let timelines = async_timelines();
        let fired = Fired::default();
        let ring = ctx_ring(1);

        let task = timelines.enqueue_task(ring.clone());
        timelines.enqueue_fence(ring, 1, recorder(&fired, 1));
        assert!(fired_ids(&fired).is_empty());

        timelines.notify_task_completion(task);
        assert_eq!(fired_ids(&fired), vec![1]);
    }

    #[test]
    fn out_of_order_completion_fires_in_enqueue_order() {
        let timelines = async_timelines();
        let fired = Fired::default();
        let ring = ctx_ring(1);

        let t1 = timelines.enqueue_task(ring.clone());
        timelines.enqueue_fence(ring.clone(), 1, recorder(&fired, 1));
        let t2 = timelines.enqueue_task(ring.clone());
        timelines.enqueue_fence(ring, 2, recorder(&fired, 2));

        timelines.notify_task_completion(t2);
        assert!(fired_ids(&fired).is_empty());

        timelines.notify_task_completion(t1);
        assert_eq!(fired_ids(&fired), vec![1, 2]);
    }

    #[test]
    fn fence_on_idle_ring_fires_immediately() {
        let timelines = async_timelines();
        let fired = Fired::default();

        timelines.enqueue_fence(VirtioGpuRing::Global, 9, recorder(&fired, 9));
        assert_eq!(fired_ids(&fired), vec![9]);
    }

    #[test]
    fn rings_do_not_block_each_other() {
        let timelines = async_timelines();
        let fired = Fired::default();
        let (r1, r2) = (ctx_ring(1), ctx_ring(2));

        let t1 = timelines.enqueue_task(r1.clone());
        let t2 = timelines.enqueue_task(r2.clone());
        timelines.enqueue_fence(r1, 1, recorder(&fired, 1));
        timelines.enqueue_fence(r2, 2, recorder(&fired, 2));

        timelines.notify_task_completion(t2);
        assert_eq!(fired_ids(&fired), vec![2]);

        timelines.notify_task_completion(t1);
        assert_eq!(fired_ids(&fired), vec![2, 1]);
    }

    #[test]
    fn fence_ahead_of_task_is_unaffected() {
        let timelines = async_timelines();
        let fired = Fired::default();
        let ring = ctx_ring(4);

        let _blocker = timelines.enqueue_task(VirtioGpuRing::Global);
        timelines.enqueue_fence(ring.clone(), 1, recorder(&fired, 1));
        let task = timelines.enqueue_task(ring.clone());
        assert_eq!(fired_ids(&fired), vec![1]);

        timelines.enqueue_fence(ring, 2, recorder(&fired, 2));
        assert_eq!(fired_ids(&fired), vec![1]);
        timelines.notify_task_completion(task);
        assert_eq!(fired_ids(&fired), vec![1, 2]);
    }

    fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for (i, &first) in items.iter().enumerate() {
            let mut rest = items.to_vec();
            rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, first);
                out.push(tail);
            }
        }
        out
    }

    // T0 F0 T1 F1 T2 F2 T3 F3 on one ring, completed in every possible order.
    #[test]
    fn fences_fire_exactly_when_their_prefix_completes() {
        for order in permutations(&[0, 1, 2, 3]) {
            let timelines = async_timelines();
            let fired = Fired::default();
            let ring = ctx_ring(3);

            let mut tasks = Vec::new();
            for i in 0..4 {
                tasks.push(timelines.enqueue_task(ring.clone()));
                timelines.enqueue_fence(ring.clone(), i, recorder(&fired, i as FenceId));
            }

            let mut done = [false; 4];
            for &i in &order {
                timelines.notify_task_completion(tasks[i]);
                done[i] = true;
                let prefix = done.iter().take_while(|d| **d).count() as FenceId;
                let expected: Vec<FenceId> = (0..prefix).collect();
                assert_eq!(fired_ids(&fired), expected, "completion order {order:?}");
            }
        }
    }

    #[test]
    fn retired_tasks_leave_the_index() {
        let timelines = async_timelines();
        let ring = ctx_ring(1);
        let t1 = timelines.enqueue_task(ring.clone());
        let t2 = timelines.enqueue_task(ring.clone());

        let weak = timelines.state.lock().unwrap().tasks[&t2].clone();
        timelines.notify_task_completion(t2);
        // t2 stays queued behind t1.
        assert!(weak.upgrade().is_some());

        timelines.notify_task_completion(t1);
        assert!(weak.upgrade().is_none());

        let state = timelines.state.lock().unwrap();
        assert!(state.tasks.is_empty());
        assert!(state.queues[&ring].is_empty());
    }

    #[test]
    fn polled_delivery_waits_for_poll() {
        let timelines = VirtioGpuTimelines::new(TimelineConfig::new(FenceDelivery::Polled));
        let fired = Fired::default();
        let ring = ctx_ring(1);

        timelines.enqueue_fence(ring.clone(), 1, recorder(&fired, 1));
        let task = timelines.enqueue_task(ring.clone());
        timelines.enqueue_fence(ring, 2, recorder(&fired, 2));
        timelines.enqueue_fence(VirtioGpuRing::Global, 3, recorder(&fired, 3));
        assert!(fired_ids(&fired).is_empty());

        timelines.poll();
        assert_eq!(fired_ids(&fired), vec![3, 1]);

        timelines.notify_task_completion(task);
        assert_eq!(fired_ids(&fired), vec![3, 1]);
        timelines.poll();
        assert_eq!(fired_ids(&fired), vec![3, 1, 2]);
    }

    #[test]
    fn completions_from_another_thread() {
        const RINGS: u32 = 4;
        const FENCES: u64 = 200;

        let timelines = Arc::new(async_timelines());
        let fired: Arc<Mutex<BTreeMap<u32, Vec<FenceId>>>> = Arc::default();
        let (tx, rx) = mpsc::channel::<TaskId>();

        let completer = {
            let timelines = timelines.clone();
            thread::spawn(move || {
                let mut pending: Vec<TaskId> = Vec::new();
                for task in rx {
                    pending.push(task);
                    // Complete in reverse batches to shuffle the order.
                    if pending.len() == 3 {
                        while let Some(task) = pending.pop() {
                            timelines.notify_task_completion(task);
                        }
                    }
                }
                for task in pending {
                    timelines.notify_task_completion(task);
                }
            })
        };

        for fence_id in 0..FENCES {
            let ctx_id = (fence_id % u64::from(RINGS)) as u32;
            let ring = ctx_ring(ctx_id);
            tx.send(timelines.enqueue_task(ring.clone())).unwrap();
            let fired = fired.clone();
            timelines.enqueue_fence(ring, fence_id, move || {
                fired
                    .lock()
                    .unwrap()
                    .entry(ctx_id)
                    .or_default()
                    .push(fence_id);
            });
        }
        drop(tx);
        completer.join().unwrap();

        let fired = fired.lock().unwrap();
        let mut total = 0;
        for ids in fired.values() {
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            total += ids.len() as u64;
        }
        assert_eq!(total, FENCES);
    }

    #[test]
    fn debug_output_summarizes_state() {
        let timelines = async_timelines();
        timelines.enqueue_task(ctx_ring(1));
        timelines.enqueue_task(ctx_ring(2));
        let debug = format!("{timelines:?}");
        assert!(debug.starts_with("VirtioGpuTimelines {"), "{debug}");
        assert!(debug.contains("next_task_id: 2"), "{debug}");
        assert!(debug.contains("rings: 2"), "{debug}");
    }

    #[test]
    fn double_completion_aborts() {
        assert_aborts!(double_completion_aborts, AbortReason::TaskAlreadyCompleted, {
            let timelines = async_timelines();
            let ring = ctx_ring(1);
            let t1 = timelines.enqueue_task(ring.clone());
            let t2 = timelines.enqueue_task(ring);
            timelines.notify_task_completion(t2);
            timelines.notify_task_completion(t2);
            timelines.notify_task_completion(t1);
        });
    }

    #[test]
    fn completion_of_retired_task_aborts() {
        assert_aborts!(completion_of_retired_task_aborts, AbortReason::UnknownTask, {
            let timelines = async_timelines();
            let task = timelines.enqueue_task(VirtioGpuRing::Global);
            timelines.notify_task_completion(task);
            timelines.notify_task_completion(task);
        });
    }

    #[test]
    fn unknown_task_aborts() {
        assert_aborts!(unknown_task_aborts, AbortReason::UnknownTask, {
            async_timelines().notify_task_completion(42);
        });
    }

    #[test]
    fn poll_with_async_delivery_aborts() {
        assert_aborts!(poll_with_async_delivery_aborts, AbortReason::PollUnsupported, {
            async_timelines().poll();
        });
    }

    #[test]
    fn scanning_unknown_ring_aborts() {
        assert_aborts!(scanning_unknown_ring_aborts, AbortReason::UnknownRing, {
            TimelinesState::default().poll_ring(&VirtioGpuRing::Global);
        });
    }
}
