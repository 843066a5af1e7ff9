//! Mock driver layer and allocator for exercising the submission core.
#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use sluice::{
    CommandBuffer, CommandPool, DeviceError, Fence, FenceStatus, GarbageAllocator, GpuDevice, PipelineStages,
    PresentInfo, PresentResult, Priority, Protection, RenderPass, Semaphore, SubmitInfo, Swapchain,
};

#[derive(Clone, Debug)]
pub struct SubmitRecord {
    pub priority: Priority,
    pub commands: Option<CommandBuffer>,
    pub wait_semaphores: Vec<Semaphore>,
    pub wait_stage_masks: Vec<PipelineStages>,
    pub signal_semaphore: Option<Semaphore>,
    pub protected: bool,
    pub fence: Option<Fence>,
}

#[derive(Clone, Debug)]
pub struct PresentRecord {
    pub priority: Priority,
    pub swapchain: Swapchain,
    pub image_index: u32,
    pub wait_semaphore: Option<Semaphore>,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    lost: bool,

    // fence handle -> signaled
    fences: HashMap<u64, bool>,
    created_fences: usize,
    destroyed_fences: usize,

    submits: Vec<SubmitRecord>,
    submit_errors: VecDeque<DeviceError>,

    presents: Vec<PresentRecord>,
    present_results: VecDeque<PresentResult>,

    live_pools: usize,
    allocated_commands: usize,
    freed_commands: usize,
    // (primary, secondary) execution order
    executed: Vec<(CommandBuffer, CommandBuffer)>,
    render_pass_scopes: usize,
    exported_fds: usize,
}

/// In-memory stand-in for the driver: fences are signaled by the test,
/// submissions and presents are recorded in call order, and failures can be
/// scripted.
pub struct MockDevice {
    state: Mutex<MockState>,
    fence_signaled: Condvar,
}

impl MockDevice {
    pub fn new() -> Arc<MockDevice> {
        Arc::new(MockDevice {
            state: Mutex::new(MockState::default()),
            fence_signaled: Condvar::new(),
        })
    }

    pub fn signal_fence(&self, fence: Fence) {
        let mut state = self.state.lock();
        state.fences.insert(fence.as_raw(), true);
        self.fence_signaled.notify_all();
    }

    /// Signals the fence of the n-th recorded submission.
    pub fn signal_submit(&self, index: usize) {
        let fence = {
            let state = self.state.lock();
            state.submits[index].fence.expect("submission has no fence")
        };
        self.signal_fence(fence);
    }

    pub fn signal_all_fences(&self) {
        let mut state = self.state.lock();
        for signaled in state.fences.values_mut() {
            *signaled = true;
        }
        self.fence_signaled.notify_all();
    }

    pub fn fail_next_submit(&self, error: DeviceError) {
        self.state.lock().submit_errors.push_back(error);
    }

    pub fn push_present_result(&self, result: PresentResult) {
        self.state.lock().present_results.push_back(result);
    }

    /// Makes every subsequent device call report loss; wakes blocked waits.
    pub fn set_lost(&self) {
        let mut state = self.state.lock();
        state.lost = true;
        self.fence_signaled.notify_all();
    }

    pub fn submits(&self) -> Vec<SubmitRecord> {
        self.state.lock().submits.clone()
    }

    pub fn submit_count(&self) -> usize {
        self.state.lock().submits.len()
    }

    pub fn presents(&self) -> Vec<PresentRecord> {
        self.state.lock().presents.clone()
    }

    pub fn executed_pairs(&self) -> Vec<(CommandBuffer, CommandBuffer)> {
        self.state.lock().executed.clone()
    }

    pub fn render_pass_scopes(&self) -> usize {
        self.state.lock().render_pass_scopes
    }

    pub fn live_fence_count(&self) -> usize {
        let state = self.state.lock();
        state.created_fences - state.destroyed_fences
    }

    pub fn live_command_count(&self) -> usize {
        let state = self.state.lock();
        state.allocated_commands - state.freed_commands
    }

    pub fn exported_fd_count(&self) -> usize {
        self.state.lock().exported_fds
    }

    fn alloc_handle(state: &mut MockState) -> u64 {
        state.next_handle += 1;
        state.next_handle
    }
}

impl GpuDevice for MockDevice {
    fn submit(&self, priority: Priority, submit: &SubmitInfo<'_>, fence: Option<Fence>) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if let Some(error) = state.submit_errors.pop_front() {
            return Err(error);
        }
        if state.lost {
            return Err(DeviceError::DeviceLost);
        }
        state.submits.push(SubmitRecord {
            priority,
            commands: submit.commands,
            wait_semaphores: submit.wait_semaphores.to_vec(),
            wait_stage_masks: submit.wait_stage_masks.to_vec(),
            signal_semaphore: submit.signal_semaphore,
            protected: submit.protected,
            fence,
        });
        Ok(())
    }

    fn present(&self, priority: Priority, present: &PresentInfo) -> PresentResult {
        let mut state = self.state.lock();
        state.presents.push(PresentRecord {
            priority,
            swapchain: present.swapchain,
            image_index: present.image_index,
            wait_semaphore: present.wait_semaphore,
        });
        if state.lost {
            return PresentResult::Failure(DeviceError::DeviceLost);
        }
        state.present_results.pop_front().unwrap_or(PresentResult::Success)
    }

    fn queue_wait_idle(&self, _priority: Priority) -> Result<(), DeviceError> {
        Ok(())
    }

    fn create_fence(&self) -> Result<Fence, DeviceError> {
        let mut state = self.state.lock();
        let handle = Self::alloc_handle(&mut state);
        state.fences.insert(handle, false);
        state.created_fences += 1;
        Ok(Fence::from_raw(handle))
    }

    fn destroy_fence(&self, fence: Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence.as_raw());
        state.destroyed_fences += 1;
    }

    fn reset_fence(&self, fence: Fence) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        match state.fences.get_mut(&fence.as_raw()) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(DeviceError::Other(-1)),
        }
    }

    fn fence_status(&self, fence: Fence) -> Result<FenceStatus, DeviceError> {
        let state = self.state.lock();
        if state.lost {
            return Err(DeviceError::DeviceLost);
        }
        match state.fences.get(&fence.as_raw()) {
            Some(true) => Ok(FenceStatus::Signaled),
            Some(false) => Ok(FenceStatus::Unsignaled),
            None => Err(DeviceError::Other(-1)),
        }
    }

    fn wait_fence(&self, fence: Fence, timeout_ns: u64) -> Result<FenceStatus, DeviceError> {
        let mut state = self.state.lock();
        // Cap so a test bug cannot hang the suite.
        let timeout = Duration::from_nanos(timeout_ns).min(Duration::from_secs(5));
        let deadline = Instant::now() + timeout;
        loop {
            if state.lost {
                return Err(DeviceError::DeviceLost);
            }
            match state.fences.get(&fence.as_raw()) {
                Some(true) => return Ok(FenceStatus::Signaled),
                Some(false) => {}
                None => return Err(DeviceError::Other(-1)),
            }
            if self.fence_signaled.wait_until(&mut state, deadline).timed_out() {
                return Ok(FenceStatus::Unsignaled);
            }
        }
    }

    fn export_fence_fd(&self, _fence: Fence) -> Result<i32, DeviceError> {
        let mut state = self.state.lock();
        state.exported_fds += 1;
        Ok(42)
    }

    fn create_command_pool(&self, _protection: Protection) -> Result<CommandPool, DeviceError> {
        let mut state = self.state.lock();
        let handle = Self::alloc_handle(&mut state);
        state.live_pools += 1;
        Ok(CommandPool::from_raw(handle))
    }

    fn destroy_command_pool(&self, _pool: CommandPool) {
        self.state.lock().live_pools -= 1;
    }

    fn allocate_primary_commands(&self, _pool: CommandPool) -> Result<CommandBuffer, DeviceError> {
        let mut state = self.state.lock();
        let handle = Self::alloc_handle(&mut state);
        state.allocated_commands += 1;
        Ok(CommandBuffer::from_raw(handle))
    }

    fn free_commands(&self, _commands: CommandBuffer) {
        self.state.lock().freed_commands += 1;
    }

    fn begin_commands(&self, _commands: CommandBuffer) -> Result<(), DeviceError> {
        Ok(())
    }

    fn end_commands(&self, _commands: CommandBuffer) -> Result<(), DeviceError> {
        Ok(())
    }

    fn reset_commands(&self, _commands: CommandBuffer) -> Result<(), DeviceError> {
        Ok(())
    }

    fn execute_commands(&self, primary: CommandBuffer, secondary: CommandBuffer) {
        self.state.lock().executed.push((primary, secondary));
    }

    fn begin_render_pass(&self, _primary: CommandBuffer, _pass: RenderPass, _framebuffer: Option<sluice::Framebuffer>) {
        self.state.lock().render_pass_scopes += 1;
    }

    fn end_render_pass(&self, _primary: CommandBuffer) {}
}

/// Scriptable allocator throttling signal.
pub struct MockAllocator {
    garbage: Mutex<u64>,
    // Scripted collect outcomes; when exhausted, collect frees everything.
    script: Mutex<VecDeque<bool>>,
    collect_calls: AtomicUsize,
}

impl MockAllocator {
    pub fn new() -> Arc<MockAllocator> {
        Arc::new(MockAllocator {
            garbage: Mutex::new(0),
            script: Mutex::new(VecDeque::new()),
            collect_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_garbage(&self, bytes: u64) {
        *self.garbage.lock() = bytes;
    }

    pub fn script_collect(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.script.lock().extend(outcomes);
    }

    pub fn collect_calls(&self) -> usize {
        self.collect_calls.load(Ordering::Relaxed)
    }
}

impl GarbageAllocator for MockAllocator {
    fn garbage_size(&self) -> u64 {
        *self.garbage.lock()
    }

    fn collect(&self) -> bool {
        self.collect_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(outcome) = self.script.lock().pop_front() {
            if outcome {
                *self.garbage.lock() = 0;
            }
            return outcome;
        }
        let mut garbage = self.garbage.lock();
        if *garbage > 0 {
            *garbage = 0;
            true
        } else {
            false
        }
    }
}

/// Polls `condition` for up to two seconds; panics with `what` on timeout.
pub fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
