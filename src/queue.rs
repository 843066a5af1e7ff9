//! The serialized submission engine.
//!
//! `CommandQueue` turns accumulated command state into device submissions,
//! tracks them in a bounded in-flight ring until their fences signal, then
//! migrates them to a finished ring for reclamation. Three locks, acquired
//! in submit → complete → release order when nested, keep submission order,
//! completion order and reclamation independent of each other.
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    batch::CommandBatch,
    device::{CommandBuffer, DeviceError, FenceStatus, Framebuffer, GarbageAllocator, GpuDevice, PipelineStages,
             Priority, Protection, RenderPass, Semaphore, SubmitInfo},
    error::{QueueError, Result},
    fence::{FenceRecycler, SharedExternalFence},
    pool::{CommandPoolAccess, SecondaryCommands},
    present::{PresentInfo, PresentResult, SwapchainStatus},
    serial::{QueueSerial, ResourceUse, SerialTracker, INFINITE_SERIAL},
    util::FixedQueue,
};

/// Above this much deferred-free allocator garbage, submission starts forcing
/// batches to finish so the allocator can make progress.
pub const GARBAGE_SIZE_THROTTLE: u64 = 64 * 1024 * 1024;

const DEFAULT_IN_FLIGHT_LIMIT: usize = 50;
const DEFAULT_FINISHED_LIMIT: usize = 64;
const DEFAULT_TASK_QUEUE_LIMIT: usize = 16;
const DEFAULT_MAX_FENCE_WAIT_NS: u64 = 10_000_000_000;

/// Tuning and feature switches for the submission core.
#[derive(Clone, Debug)]
pub struct QueueOptions {
    /// Capacity of the in-flight batch ring.
    pub in_flight_limit: usize,
    /// Capacity of the finished batch ring; must be at least
    /// `in_flight_limit` so any in-flight batch can migrate without
    /// reallocation.
    pub finished_limit: usize,
    /// Capacity of the worker task ring.
    pub task_queue_limit: usize,
    /// Also create the protected command pool and allow protected submits.
    pub protected: bool,
    /// Run command-buffer reset and garbage cleanup on the worker thread.
    pub async_reclaim: bool,
    /// Busy-wait ~5 ms per worker task to shake out threading issues.
    pub slow_worker_for_testing: bool,
    /// Bound for internal fence waits (backpressure, device-lost drain).
    pub max_fence_wait_ns: u64,
}

impl Default for QueueOptions {
    fn default() -> QueueOptions {
        QueueOptions {
            in_flight_limit: DEFAULT_IN_FLIGHT_LIMIT,
            finished_limit: DEFAULT_FINISHED_LIMIT,
            task_queue_limit: DEFAULT_TASK_QUEUE_LIMIT,
            protected: false,
            async_reclaim: false,
            slow_worker_for_testing: false,
            max_fence_wait_ns: DEFAULT_MAX_FENCE_WAIT_NS,
        }
    }
}

/// Whether a one-off submission must be observed submitted before the call
/// returns. Callers that synchronize against the one-off outside the
/// submission order need `EnsureSubmitted`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SubmitPolicy {
    AllowDeferred,
    EnsureSubmitted,
}

#[derive(Default)]
struct PerfState {
    submit_calls: AtomicU64,
    device_submits: AtomicU64,
    wait_semaphores: AtomicU64,
}

/// Snapshot of the queue's submission counters.
#[derive(Copy, Clone, Debug, Default)]
pub struct PerfCounters {
    /// Calls to `submit_commands` / `queue_submit_one_off`.
    pub submit_calls: u64,
    /// Submissions that actually reached the device.
    pub device_submits: u64,
    /// Wait semaphores carried by those submissions.
    pub wait_semaphores: u64,
}

pub struct CommandQueue {
    device: Arc<dyn GpuDevice>,
    allocator: Arc<dyn GarbageAllocator>,
    options: QueueOptions,

    serials: Arc<SerialTracker>,
    pool_access: Arc<CommandPoolAccess>,
    fence_recycler: Arc<FenceRecycler>,

    // Lock order when nested: submit → complete → release.
    submit_mutex: Mutex<()>,
    complete_mutex: Mutex<()>,
    release_mutex: Mutex<()>,

    /// Pushed under the submit lock, popped (migrated) under the complete
    /// lock; the ring synchronizes the storage itself.
    in_flight: FixedQueue<CommandBatch>,
    /// Pushed under the complete lock, drained under the release lock.
    finished: FixedQueue<CommandBatch>,
    /// In-flight + finished; kept at or below the finished ring capacity so
    /// migration never needs to release first.
    num_all_commands: AtomicUsize,

    device_lost: AtomicBool,
    /// Wakes the worker for deferred reclamation when async reclaim is on.
    async_cleanup_waker: OnceCell<Box<dyn Fn() + Send + Sync>>,
    perf: PerfState,
}

impl CommandQueue {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        allocator: Arc<dyn GarbageAllocator>,
        options: QueueOptions,
    ) -> Result<CommandQueue> {
        assert!(
            options.finished_limit >= options.in_flight_limit,
            "finished ring must be able to absorb every in-flight batch"
        );
        let pool_access = Arc::new(CommandPoolAccess::new(device.clone()));
        pool_access.init_pool(Protection::Unprotected)?;
        if options.protected {
            pool_access.init_pool(Protection::Protected)?;
        }
        Ok(CommandQueue {
            submit_mutex: Mutex::new(()),
            complete_mutex: Mutex::new(()),
            release_mutex: Mutex::new(()),
            fence_recycler: Arc::new(FenceRecycler::new(device.clone())),
            serials: Arc::new(SerialTracker::new()),
            in_flight: FixedQueue::new(options.in_flight_limit),
            finished: FixedQueue::new(options.finished_limit),
            num_all_commands: AtomicUsize::new(0),
            device_lost: AtomicBool::new(false),
            async_cleanup_waker: OnceCell::new(),
            perf: PerfState::default(),
            pool_access,
            device,
            allocator,
            options,
        })
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn serial_tracker(&self) -> &Arc<SerialTracker> {
        &self.serials
    }

    pub(crate) fn set_async_cleanup_waker(&self, waker: Box<dyn Fn() + Send + Sync>) {
        let _ = self.async_cleanup_waker.set(waker);
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Command accumulation (delegated to the pool broker)
    ////////////////////////////////////////////////////////////////////////////////////////////////

    pub fn flush_outside_commands(
        &self,
        protection: Protection,
        priority: Priority,
        commands: SecondaryCommands,
    ) -> Result<()> {
        self.pool_access.flush_outside_commands(protection, priority, commands)
    }

    pub fn flush_render_pass_commands(
        &self,
        protection: Protection,
        priority: Priority,
        pass: RenderPass,
        framebuffer: Option<Framebuffer>,
        commands: SecondaryCommands,
    ) -> Result<()> {
        self.pool_access
            .flush_render_pass_commands(protection, priority, pass, framebuffer, commands)
    }

    pub fn flush_wait_semaphores(
        &self,
        protection: Protection,
        priority: Priority,
        semaphores: Vec<Semaphore>,
        stages: Vec<PipelineStages>,
    ) {
        self.pool_access.flush_wait_semaphores(protection, priority, semaphores, stages)
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Submission
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Extracts the accumulated commands for (protection, priority) into a
    /// batch stamped with `serial` and submits it. Submissions with no
    /// commands, semaphores or fence skip the device call but still produce
    /// a batch so the serial completes in order.
    pub fn submit_commands(
        &self,
        protection: Protection,
        priority: Priority,
        signal_semaphore: Option<Semaphore>,
        external_fence: Option<SharedExternalFence>,
        serial: QueueSerial,
    ) -> Result<()> {
        let _submit = self.submit_mutex.lock();
        self.check_device_lost()?;
        self.perf.submit_calls.fetch_add(1, Ordering::Relaxed);

        let mut batch = CommandBatch::new(serial, protection);
        let mut wait_semaphores = Vec::new();
        let mut wait_semaphore_stages = Vec::new();
        self.pool_access.get_commands_and_wait_semaphores(
            protection,
            priority,
            &mut batch,
            &mut wait_semaphores,
            &mut wait_semaphore_stages,
        )?;

        // Don't call the device if there is nothing to submit.
        let needs_device_submit = batch.primary_handle().is_some()
            || signal_semaphore.is_some()
            || external_fence.is_some()
            || !wait_semaphores.is_empty();

        if !needs_device_submit {
            return self.queue_submit_locked(priority, None, batch, serial);
        }

        match external_fence {
            Some(fence) => batch.set_external_fence(fence),
            None => batch.init_fence(&self.fence_recycler)?,
        }

        self.perf
            .wait_semaphores
            .fetch_add(wait_semaphores.len() as u64, Ordering::Relaxed);

        let submit = SubmitInfo {
            commands: batch.primary_handle(),
            wait_semaphores: &wait_semaphores,
            wait_stage_masks: &wait_semaphore_stages,
            signal_semaphore,
            // No protected submission when there are no commands to protect.
            protected: protection == Protection::Protected && batch.primary_handle().is_some(),
        };
        self.queue_submit_locked(priority, Some(&submit), batch, serial)
    }

    /// Submits a caller-recorded command buffer outside the accumulation
    /// path. Always fenced so the serial can be waited on.
    pub fn queue_submit_one_off(
        &self,
        protection: Protection,
        priority: Priority,
        commands: Option<CommandBuffer>,
        wait_semaphore: Option<(Semaphore, PipelineStages)>,
        _policy: SubmitPolicy,
        serial: QueueSerial,
    ) -> Result<()> {
        // The submission is complete when this returns, so both policies are
        // satisfied on the synchronous path.
        let _submit = self.submit_mutex.lock();
        self.check_device_lost()?;
        self.perf.submit_calls.fetch_add(1, Ordering::Relaxed);

        let mut batch = CommandBatch::new(serial, protection);
        batch.init_fence(&self.fence_recycler)?;

        let (wait_semaphores, wait_semaphore_stages) = match wait_semaphore {
            Some((semaphore, stages)) => (vec![semaphore], vec![stages]),
            None => (Vec::new(), Vec::new()),
        };
        let submit = SubmitInfo {
            commands,
            wait_semaphores: &wait_semaphores,
            wait_stage_masks: &wait_semaphore_stages,
            signal_semaphore: None,
            protected: protection == Protection::Protected,
        };
        self.queue_submit_locked(priority, Some(&submit), batch, serial)
    }

    fn queue_submit_locked(
        &self,
        priority: Priority,
        submit: Option<&SubmitInfo<'_>>,
        batch: CommandBatch,
        serial: QueueSerial,
    ) -> Result<()> {
        let result = self.queue_submit_locked_inner(priority, submit, &batch);
        match result {
            Ok(()) => {
                // Increment before the push so a concurrent release cannot
                // observe a count below the ring occupancy.
                self.num_all_commands.fetch_add(1, Ordering::SeqCst);
                self.in_flight.push(batch);
                // Set last so that a submission observed as submitted is
                // already in the in-flight ring.
                self.serials.submitted.set_queue_serial(serial);
                Ok(())
            }
            Err(error) => {
                batch.destroy();
                Err(error)
            }
        }
    }

    fn queue_submit_locked_inner(
        &self,
        priority: Priority,
        submit: Option<&SubmitInfo<'_>>,
        batch: &CommandBatch,
    ) -> Result<()> {
        // Throttle the CPU so the in-flight ring cannot grow unbounded;
        // matters for off-screen rendering that never blocks on present.
        if self.in_flight.is_full() {
            let _complete = self.complete_mutex.lock();
            // Another thread may have finished batches in the meantime.
            if self.in_flight.is_full() {
                self.finish_one_batch_locked(self.options.max_fence_wait_ns)?;
            }
        }
        debug_assert!(!self.in_flight.is_full());

        // Keep room in the finished ring for every in-flight batch so
        // migration never has to release on the completion path.
        debug_assert!(self.num_all_commands.load(Ordering::SeqCst) <= self.finished.capacity());
        if self.num_all_commands.load(Ordering::SeqCst) == self.finished.capacity() {
            let _release = self.release_mutex.lock();
            self.release_finished_locked()?;
        }
        debug_assert!(self.num_all_commands.load(Ordering::SeqCst) < self.finished.capacity());

        if let Some(submit) = submit {
            debug_assert!(batch.has_fence());
            self.perf.device_submits.fetch_add(1, Ordering::Relaxed);
            self.device.submit(priority, submit, batch.fence_handle())?;

            if let Some(external_fence) = batch.external_fence() {
                // The sync-fd export obeys copy semantics, so it must happen
                // after the submit that signals the fence was queued.
                external_fence.export_fd();
            }
        }
        Ok(())
    }

    /// Presents under the submit lock so presents serialize with
    /// submissions. The pending flag on `status` is managed by the caller.
    pub fn queue_present(&self, priority: Priority, present: &PresentInfo, status: &SwapchainStatus) -> PresentResult {
        let _submit = self.submit_mutex.lock();
        let result = self.device.present(priority, present);
        status.set_last_present_result(result);
        result
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Completion
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Polls in-flight fences in order, migrating every signaled batch to
    /// the finished ring. Stops at the first batch that is not ready;
    /// submissions are serialized on one queue, so fences signal in order.
    pub fn check_completed(&self) -> Result<()> {
        let _complete = self.complete_mutex.lock();
        self.check_completed_locked()
    }

    /// Blocks until every serial in `use_` has completed, with `timeout_ns`
    /// bounding each fence wait. Finished batches are reclaimed afterwards.
    pub fn finish_resource_use(&self, use_: &ResourceUse, timeout_ns: u64) -> Result<()> {
        {
            let mut complete = self.complete_mutex.lock();
            while !self.in_flight.is_empty() && !self.serials.has_use_finished(use_) {
                if self.check_one_batch_locked()? {
                    continue;
                }
                let Some(fence) = self.in_flight.front(|batch| batch.fence()).flatten() else {
                    continue;
                };
                // Wait on a local copy of the fence with the lock released;
                // the batch may be migrated and freed by another thread.
                drop(complete);
                let status = fence.wait(timeout_ns);
                complete = self.complete_mutex.lock();
                match status? {
                    FenceStatus::Signaled => {}
                    FenceStatus::Unsignaled => return Err(QueueError::Timeout),
                }
            }
            // The rest may have finished as well.
            self.check_completed_locked()?;
        }
        debug_assert!(self.serials.has_use_finished(use_));

        if !self.finished.is_empty() {
            self.release_finished_and_collect_garbage()?;
        }
        Ok(())
    }

    pub fn finish_queue_serial(&self, serial: QueueSerial, timeout_ns: u64) -> Result<()> {
        self.finish_resource_use(&ResourceUse::from_queue_serial(serial), timeout_ns)
    }

    /// Waits for everything submitted so far.
    pub fn wait_idle(&self, timeout_ns: u64) -> Result<()> {
        let use_ = {
            let _submit = self.submit_mutex.lock();
            match self.in_flight.back(|batch| batch.queue_serial()) {
                None => return Ok(()),
                Some(serial) => ResourceUse::from_queue_serial(serial),
            }
        };
        self.finish_resource_use(&use_, timeout_ns)
    }

    /// Like [`finish_resource_use`], but a timeout is reported as
    /// `Ok(FenceStatus::Unsignaled)` instead of an error.
    ///
    /// [`finish_resource_use`]: Self::finish_resource_use
    pub fn wait_for_resource_use_with_user_timeout(
        &self,
        use_: &ResourceUse,
        timeout_ns: u64,
    ) -> Result<FenceStatus> {
        if !self.serials.has_use_submitted(use_) {
            warn!("waiting on an unsubmitted serial");
            return Ok(FenceStatus::Unsignaled);
        }

        let mut status = FenceStatus::Signaled;
        let finished_count;
        {
            let mut complete = self.complete_mutex.lock();
            while !self.in_flight.is_empty() && !self.serials.has_use_finished(use_) {
                if self.check_one_batch_locked()? {
                    continue;
                }
                let Some(fence) = self.in_flight.front(|batch| batch.fence()).flatten() else {
                    continue;
                };
                drop(complete);
                let wait = fence.wait(timeout_ns);
                complete = self.complete_mutex.lock();
                if let FenceStatus::Unsignaled = wait? {
                    status = FenceStatus::Unsignaled;
                    break;
                }
            }
            self.check_completed_locked()?;
            if self.serials.has_use_finished(use_) {
                status = FenceStatus::Signaled;
            }
            finished_count = self.finished.len();
        }

        if finished_count > 0 {
            self.release_finished_and_collect_garbage()?;
        }
        Ok(status)
    }

    pub fn has_resource_use_submitted(&self, use_: &ResourceUse) -> bool {
        self.serials.has_use_submitted(use_)
    }

    pub fn has_resource_use_finished(&self, use_: &ResourceUse) -> bool {
        self.serials.has_use_finished(use_)
    }

    pub fn has_queue_serial_submitted(&self, serial: QueueSerial) -> bool {
        self.serials.has_serial_submitted(serial)
    }

    pub fn has_queue_serial_finished(&self, serial: QueueSerial) -> bool {
        self.serials.has_serial_finished(serial)
    }

    /// Lock-free; compares last-submitted against last-completed.
    pub fn is_busy(&self) -> bool {
        self.serials.is_busy()
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Reclamation
    ////////////////////////////////////////////////////////////////////////////////////////////////

    pub fn has_finished_commands(&self) -> bool {
        !self.finished.is_empty()
    }

    /// Releases every finished batch: primaries return to their pools,
    /// secondaries to their recyclers, fences to the fence recycler. Safe to
    /// call from the worker thread or directly; a no-op when nothing
    /// finished.
    pub fn release_finished_commands(&self) -> Result<()> {
        let _release = self.release_mutex.lock();
        self.release_finished_locked()
    }

    /// Reclaims finished batches and collects allocator garbage, deferring
    /// to the worker thread when async reclamation is configured.
    pub fn release_finished_and_collect_garbage(&self) -> Result<()> {
        if self.options.async_reclaim {
            if let Some(waker) = self.async_cleanup_waker.get() {
                waker();
                return Ok(());
            }
        }
        self.release_finished_commands()?;
        self.allocator.collect();
        Ok(())
    }

    /// Post-submission housekeeping: harvest completions, then throttle
    /// while the allocator's deferred-free garbage is above
    /// [`GARBAGE_SIZE_THROTTLE`]. At least one batch is always left in
    /// flight to keep the GPU busy.
    pub fn post_submit_check(&self) -> Result<()> {
        self.check_and_release_completed_commands()?;

        let mut garbage_size = self.allocator.garbage_size();
        while garbage_size > GARBAGE_SIZE_THROTTLE {
            const MIN_IN_FLIGHT_BATCHES_TO_KEEP: usize = 1;
            if !self.cleanup_some_garbage(MIN_IN_FLIGHT_BATCHES_TO_KEEP)? {
                break;
            }
            garbage_size = self.allocator.garbage_size();
        }
        Ok(())
    }

    /// Forces progress on the allocator by finishing batches one at a time
    /// until it frees something, keeping at least `min_in_flight_to_keep`
    /// batches in flight. Returns whether any garbage was collected.
    pub fn cleanup_some_garbage(&self, min_in_flight_to_keep: usize) -> Result<bool> {
        let mut collected = self.allocator.collect();
        while !collected {
            {
                let _complete = self.complete_mutex.lock();
                if self.in_flight.len() <= min_in_flight_to_keep {
                    break;
                }
                self.finish_one_batch_locked(self.options.max_fence_wait_ns)?;
            }
            collected = self.allocator.collect();
        }
        Ok(collected)
    }

    /// Direct allocator collection, used by the worker's cleanup pass.
    pub fn collect_garbage(&self) {
        self.allocator.collect();
    }

    pub fn perf_counters(&self) -> PerfCounters {
        PerfCounters {
            submit_calls: self.perf.submit_calls.load(Ordering::Relaxed),
            device_submits: self.perf.device_submits.load(Ordering::Relaxed),
            wait_semaphores: self.perf.wait_semaphores.load(Ordering::Relaxed),
        }
    }

    /// Number of batches whose fences have not been observed signaled.
    pub fn in_flight_batch_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of batches awaiting reclamation.
    pub fn finished_batch_count(&self) -> usize {
        self.finished.len()
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Device loss and teardown
    ////////////////////////////////////////////////////////////////////////////////////////////////

    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }

    /// Drains the in-flight ring after the device reported loss: waits each
    /// fence with a bounded timeout (loss also counts as signaled), advances
    /// the completed serials, and destroys every batch directly, bypassing
    /// pool return. Completed serials end at infinity so all garbage can be
    /// destroyed. The queue accepts no work afterwards.
    pub fn handle_device_lost(&self) {
        let _submit = self.submit_mutex.lock();
        let _complete = self.complete_mutex.lock();
        let _release = self.release_mutex.lock();
        warn!("handling device loss; destroying in-flight submissions");
        self.device_lost.store(true, Ordering::Release);

        while let Some(batch) = self.in_flight.pop_front() {
            match batch.wait_fence(self.options.max_fence_wait_ns) {
                Ok(FenceStatus::Signaled) | Err(DeviceError::DeviceLost) => {}
                Ok(FenceStatus::Unsignaled) => {
                    // Recovery is unlikely if the wait timed out on a lost
                    // device; carry on with destruction.
                    warn!(serial = ?batch.queue_serial(), "fence wait timed out during device-lost teardown");
                }
                Err(error) => {
                    warn!(?error, "fence wait failed during device-lost teardown");
                }
            }
            self.serials.completed.set_queue_serial(batch.queue_serial());
            batch.destroy();
            self.num_all_commands.fetch_sub(1, Ordering::SeqCst);
        }
        self.serials.completed.fill(INFINITE_SERIAL);
    }

    /// Final teardown. All submissions must have been finished and released
    /// (or destroyed through the device-lost path) beforehand.
    pub fn destroy(&self) {
        let _submit = self.submit_mutex.lock();
        let _complete = self.complete_mutex.lock();
        let _release = self.release_mutex.lock();

        for priority in Priority::ALL {
            if let Err(error) = self.device.queue_wait_idle(priority) {
                warn!(?error, ?priority, "queue wait-idle failed during teardown");
            }
        }

        // An infinite completed serial forces destruction of all remaining
        // serial-tagged garbage.
        self.serials.completed.fill(INFINITE_SERIAL);

        self.pool_access.destroy();
        self.fence_recycler.destroy();

        debug_assert!(self.in_flight.is_empty());
        debug_assert!(self.finished.is_empty());
        debug_assert_eq!(self.num_all_commands.load(Ordering::SeqCst), 0);
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Private: callers hold the lock named by the suffix.
    ////////////////////////////////////////////////////////////////////////////////////////////////

    fn check_device_lost(&self) -> Result<()> {
        if self.is_device_lost() {
            return Err(DeviceError::DeviceLost.into());
        }
        Ok(())
    }

    /// Queries the head batch's fence; migrates the batch if signaled.
    /// Returns whether the head finished.
    fn check_one_batch_locked(&self) -> Result<bool> {
        let status = match self.in_flight.front(|batch| batch.fence()) {
            None => return Ok(false),
            // A batch with no fence made no device call; it completes the
            // moment it is observed.
            Some(None) => FenceStatus::Signaled,
            Some(Some(fence)) => fence.status()?,
        };
        if status == FenceStatus::Unsignaled {
            return Ok(false);
        }
        self.on_batch_finished_locked();
        Ok(true)
    }

    /// Waits for the head batch's fence, then migrates it.
    fn finish_one_batch_locked(&self, timeout_ns: u64) -> Result<()> {
        let fence = self.in_flight.front(|batch| batch.fence());
        match fence {
            None => return Ok(()),
            Some(None) => {}
            Some(Some(fence)) => match fence.wait(timeout_ns)? {
                FenceStatus::Signaled => {}
                FenceStatus::Unsignaled => return Err(QueueError::Timeout),
            },
        }
        self.on_batch_finished_locked();
        Ok(())
    }

    fn on_batch_finished_locked(&self) {
        let batch = self
            .in_flight
            .pop_front()
            .expect("in-flight ring emptied while migrating the head batch");
        self.serials.completed.set_queue_serial(batch.queue_serial());
        // Space was reserved at submit time.
        debug_assert!(!self.finished.is_full());
        self.finished.push(batch);
    }

    fn check_completed_locked(&self) -> Result<()> {
        while !self.in_flight.is_empty() {
            if !self.check_one_batch_locked()? {
                break;
            }
        }
        Ok(())
    }

    fn release_finished_locked(&self) -> Result<()> {
        while let Some(batch) = self.finished.pop_front() {
            debug_assert!(self.serials.has_serial_finished(batch.queue_serial()));
            self.num_all_commands.fetch_sub(1, Ordering::SeqCst);
            batch.release()?;
        }
        Ok(())
    }

    fn check_and_release_completed_commands(&self) -> Result<()> {
        self.check_completed()?;
        if self.has_finished_commands() {
            self.release_finished_and_collect_garbage()?;
        }
        Ok(())
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if !self.in_flight.is_empty() || !self.finished.is_empty() {
            debug!("command queue dropped with unreleased batches; destroying them");
            while let Some(batch) = self.in_flight.pop_front() {
                batch.destroy();
            }
            while let Some(batch) = self.finished.pop_front() {
                batch.destroy();
            }
        }
    }
}
