//! Optional worker-thread front end for the command queue.
//!
//! Tasks are enqueued by rendering contexts and drained either by the worker
//! thread or, under backpressure and in the wait-for-submitted paths, by the
//! calling thread itself. A single dequeue lock keeps dispatch FIFO, so
//! submissions reach the underlying queue in enqueue order.
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::{
    device::{CommandBuffer, Framebuffer, PipelineStages, Priority, Protection, RenderPass, Semaphore},
    error::{DeferredError, QueueError, Result},
    fence::SharedExternalFence,
    pool::SecondaryCommands,
    present::{PresentInfo, PresentResult, SwapchainStatus},
    queue::{CommandQueue, QueueOptions, SubmitPolicy},
    serial::{AtomicSerialArray, QueueSerial, ResourceUse},
    util::FixedQueue,
};

/// One unit of queued work. Every variant carries exactly the payload its
/// handler reads, by value; callers keep no references into a task.
enum Task {
    FlushWaitSemaphores {
        protection: Protection,
        priority: Priority,
        semaphores: Vec<Semaphore>,
        stages: Vec<PipelineStages>,
    },
    ProcessOutsideRenderPassCommands {
        protection: Protection,
        priority: Priority,
        commands: SecondaryCommands,
    },
    ProcessRenderPassCommands {
        protection: Protection,
        priority: Priority,
        pass: RenderPass,
        framebuffer: Option<Framebuffer>,
        commands: SecondaryCommands,
    },
    FlushAndQueueSubmit {
        protection: Protection,
        priority: Priority,
        signal_semaphore: Option<Semaphore>,
        external_fence: Option<SharedExternalFence>,
        serial: QueueSerial,
    },
    OneOffQueueSubmit {
        protection: Protection,
        priority: Priority,
        commands: Option<CommandBuffer>,
        wait_semaphore: Option<(Semaphore, PipelineStages)>,
        serial: QueueSerial,
    },
    Present {
        priority: Priority,
        present: PresentInfo,
        status: Arc<SwapchainStatus>,
    },
}

struct ProcessorInner {
    queue: Arc<CommandQueue>,
    options: QueueOptions,

    tasks: FixedQueue<Task>,
    // Lock order: enqueue → dequeue. The dequeue lock serializes dispatch.
    enqueue_mutex: Mutex<()>,
    dequeue_mutex: Mutex<()>,
    work_available: Condvar,

    exit_requested: AtomicBool,
    needs_cleanup: AtomicBool,

    errors: Mutex<VecDeque<DeferredError>>,
    last_enqueued: AtomicSerialArray,
}

/// Single-consumer worker front end wrapping [`CommandQueue`]. Accepts
/// tasks, preserves FIFO order, and drains on demand from caller threads.
pub struct CommandProcessor {
    inner: Arc<ProcessorInner>,
    worker: Option<thread::JoinHandle<()>>,
}

impl CommandProcessor {
    pub fn new(queue: Arc<CommandQueue>) -> CommandProcessor {
        let options = queue.options().clone();
        let inner = Arc::new(ProcessorInner {
            tasks: FixedQueue::new(options.task_queue_limit),
            enqueue_mutex: Mutex::new(()),
            dequeue_mutex: Mutex::new(()),
            work_available: Condvar::new(),
            exit_requested: AtomicBool::new(false),
            needs_cleanup: AtomicBool::new(false),
            errors: Mutex::new(VecDeque::new()),
            last_enqueued: AtomicSerialArray::new(),
            options,
            queue: queue.clone(),
        });

        // Deferred reclamation requested anywhere in the queue wakes the
        // worker instead of running on the requesting thread.
        let weak = Arc::downgrade(&inner);
        queue.set_async_cleanup_waker(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.request_cleanup();
            }
        }));

        CommandProcessor { inner, worker: None }
    }

    /// Starts the worker thread.
    pub fn init(&mut self) -> Result<()> {
        debug_assert!(self.worker.is_none());
        let inner = self.inner.clone();
        let worker = thread::Builder::new()
            .name("sluice-submit".into())
            .spawn(move || inner.process_tasks())?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Drains outstanding work, stops the worker thread and joins it.
    pub fn destroy(&mut self) {
        {
            let _enqueue = self.inner.enqueue_mutex.lock();
            self.inner.exit_requested.store(true, Ordering::Release);
            self.inner.work_available.notify_one();
        }
        if let Err(err) = self.wait_for_all_work_to_be_submitted() {
            warn!(error = %err, "error while draining the task queue during teardown");
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.inner.queue
    }

    /// Forwards any error deferred by the worker thread. `Ok` means continue;
    /// the first pending error is returned and the rest are logged.
    pub fn check_pending_error(&self) -> Result<()> {
        self.inner.check_pending_error()
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Enqueue API
    ////////////////////////////////////////////////////////////////////////////////////////////////

    pub fn enqueue_flush_wait_semaphores(
        &self,
        protection: Protection,
        priority: Priority,
        semaphores: Vec<Semaphore>,
        stages: Vec<PipelineStages>,
    ) -> Result<()> {
        self.inner.queue_task(Task::FlushWaitSemaphores {
            protection,
            priority,
            semaphores,
            stages,
        })
    }

    pub fn enqueue_flush_outside_commands(
        &self,
        protection: Protection,
        priority: Priority,
        commands: SecondaryCommands,
    ) -> Result<()> {
        self.check_pending_error()?;
        self.inner.queue_task(Task::ProcessOutsideRenderPassCommands {
            protection,
            priority,
            commands,
        })
    }

    pub fn enqueue_flush_render_pass_commands(
        &self,
        protection: Protection,
        priority: Priority,
        pass: RenderPass,
        framebuffer: Option<Framebuffer>,
        commands: SecondaryCommands,
    ) -> Result<()> {
        self.check_pending_error()?;
        self.inner.queue_task(Task::ProcessRenderPassCommands {
            protection,
            priority,
            pass,
            framebuffer,
            commands,
        })
    }

    pub fn enqueue_submit_commands(
        &self,
        protection: Protection,
        priority: Priority,
        signal_semaphore: Option<Semaphore>,
        external_fence: Option<SharedExternalFence>,
        serial: QueueSerial,
    ) -> Result<()> {
        self.check_pending_error()?;
        self.inner.queue_task(Task::FlushAndQueueSubmit {
            protection,
            priority,
            signal_semaphore,
            external_fence,
            serial,
        })?;
        self.inner.last_enqueued.join_queue_serial(serial);
        Ok(())
    }

    pub fn enqueue_submit_one_off(
        &self,
        protection: Protection,
        priority: Priority,
        commands: Option<CommandBuffer>,
        wait_semaphore: Option<(Semaphore, PipelineStages)>,
        policy: SubmitPolicy,
        serial: QueueSerial,
    ) -> Result<()> {
        self.check_pending_error()?;
        self.inner.queue_task(Task::OneOffQueueSubmit {
            protection,
            priority,
            commands,
            wait_semaphore,
            serial,
        })?;
        self.inner.last_enqueued.join_queue_serial(serial);

        if policy == SubmitPolicy::EnsureSubmitted {
            // The caller needs the work in the GPU pipe before it returns.
            self.wait_for_resource_use_to_be_submitted(&ResourceUse::from_queue_serial(serial))?;
        }
        Ok(())
    }

    /// Marks `status` pending and queues the present. The result is reported
    /// through `status`, not through the error bus, so the owner can keep
    /// going until it has to look at it.
    pub fn enqueue_present(&self, priority: Priority, present: PresentInfo, status: &Arc<SwapchainStatus>) {
        status.begin_pending();
        let result = self.inner.queue_task(Task::Present {
            priority,
            present,
            status: status.clone(),
        });
        if let Err(err) = result {
            error!(error = %err, "failed to enqueue a present");
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Caller-driven draining
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Guarantees the use is submitted without waiting on the worker thread:
    /// if it is not yet observed submitted, the calling thread pops and
    /// executes queued tasks itself (bounded by the queue size at entry).
    pub fn wait_for_resource_use_to_be_submitted(&self, use_: &ResourceUse) -> Result<()> {
        if self.inner.queue.has_resource_use_submitted(use_) {
            return self.check_pending_error();
        }

        // Without the enqueue lock, other contexts can keep enqueuing while
        // we drain.
        let _dequeue = self.inner.dequeue_mutex.lock();
        // Inside the lock so no new error can slip in between.
        self.check_pending_error()?;

        let max_tasks = self.inner.tasks.len();
        let mut processed = 0;
        while processed < max_tasks && !self.inner.queue.has_resource_use_submitted(use_) {
            let Some(task) = self.inner.tasks.pop_front() else {
                break;
            };
            self.inner.process_task(task)?;
            processed += 1;
        }
        Ok(())
    }

    /// As above, for a pending present.
    pub fn wait_for_present_to_be_submitted(&self, status: &Arc<SwapchainStatus>) -> Result<()> {
        if !status.is_pending() {
            return Ok(());
        }

        let _dequeue = self.inner.dequeue_mutex.lock();
        let max_tasks = self.inner.tasks.len();
        let mut processed = 0;
        while processed < max_tasks && status.is_pending() {
            let Some(task) = self.inner.tasks.pop_front() else {
                break;
            };
            self.inner.process_task(task)?;
            processed += 1;
        }
        debug_assert!(!status.is_pending());
        Ok(())
    }

    /// Processes every queued task to completion, then reclaims. No work can
    /// be enqueued while this drains.
    pub fn wait_for_all_work_to_be_submitted(&self) -> Result<()> {
        let _enqueue = self.inner.enqueue_mutex.lock();
        let _dequeue = self.inner.dequeue_mutex.lock();
        self.check_pending_error()?;

        while let Some(task) = self.inner.tasks.pop_front() {
            self.inner.process_task(task)?;
        }

        if self.inner.options.async_reclaim {
            self.inner.queue.release_finished_commands()?;
            self.inner.queue.collect_garbage();
        }
        self.inner.needs_cleanup.store(false, Ordering::Release);
        Ok(())
    }

    /// Requests a completed-command check and garbage collection on the
    /// worker thread.
    pub fn request_cleanup(&self) {
        self.inner.request_cleanup();
    }

    /// Caller-thread device-loss handling: drain the task queue, then tear
    /// down the in-flight submissions.
    pub fn handle_device_lost(&self) {
        if let Err(err) = self.wait_for_all_work_to_be_submitted() {
            warn!(error = %err, "error while draining tasks for device loss");
        }
        self.inner.queue.handle_device_lost();
    }

    pub fn has_resource_use_enqueued(&self, use_: &ResourceUse) -> bool {
        self.inner.last_enqueued.satisfies(use_)
    }
}

impl Drop for CommandProcessor {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.destroy();
        }
    }
}

impl ProcessorInner {
    /// Enqueues a task; when the ring is full, one task is executed
    /// synchronously from this thread, which preserves order while shedding
    /// backpressure.
    fn queue_task(&self, task: Task) -> Result<()> {
        let _enqueue = self.enqueue_mutex.lock();
        if self.tasks.is_full() {
            let _dequeue = self.dequeue_mutex.lock();
            // Check again in case the worker just drained it.
            if self.tasks.is_full() {
                if let Some(front) = self.tasks.pop_front() {
                    self.process_task(front)?;
                }
            }
        }
        self.tasks.push(task);
        self.work_available.notify_one();
        Ok(())
    }

    fn request_cleanup(&self) {
        if !self.needs_cleanup.swap(true, Ordering::AcqRel) {
            let _enqueue = self.enqueue_mutex.lock();
            self.work_available.notify_one();
        }
    }

    fn process_tasks(self: Arc<Self>) {
        debug!("submission worker thread running");
        loop {
            {
                let mut enqueue = self.enqueue_mutex.lock();
                if self.tasks.is_empty() && self.exit_requested.load(Ordering::Acquire) {
                    break;
                }
                // Only wake for work, cleanup or exit.
                self.work_available.wait_while(&mut enqueue, |_| {
                    self.tasks.is_empty()
                        && !self.exit_requested.load(Ordering::Acquire)
                        && !self.needs_cleanup.load(Ordering::Acquire)
                });
                // Process with the enqueue mutex released so contexts can
                // keep enqueuing while we work.
            }

            {
                let _dequeue = self.dequeue_mutex.lock();
                if let Some(task) = self.tasks.pop_front() {
                    if self.options.slow_worker_for_testing {
                        // Make tasks artificially slow to shake out races.
                        let start = Instant::now();
                        while start.elapsed() < Duration::from_millis(5) {
                            std::hint::spin_loop();
                        }
                    }
                    if let Err(error) = self.process_task(task) {
                        self.handle_error(error);
                    }
                }
            }

            if self.needs_cleanup.swap(false, Ordering::AcqRel) {
                if let Err(error) = self.cleanup_pass() {
                    self.handle_error(error);
                }
            }
        }
        debug!("submission worker thread exiting");
    }

    fn cleanup_pass(&self) -> Result<()> {
        // Something may have finished since the request was raised.
        self.queue.check_completed()?;
        if self.options.async_reclaim && self.queue.has_finished_commands() {
            self.queue.release_finished_commands()?;
        }
        self.queue.collect_garbage();
        Ok(())
    }

    /// Dispatches one task to the matching queue operation.
    fn process_task(&self, task: Task) -> Result<()> {
        match task {
            Task::FlushWaitSemaphores {
                protection,
                priority,
                semaphores,
                stages,
            } => {
                self.queue.flush_wait_semaphores(protection, priority, semaphores, stages);
            }
            Task::ProcessOutsideRenderPassCommands {
                protection,
                priority,
                commands,
            } => {
                self.queue.flush_outside_commands(protection, priority, commands)?;
            }
            Task::ProcessRenderPassCommands {
                protection,
                priority,
                pass,
                framebuffer,
                commands,
            } => {
                self.queue
                    .flush_render_pass_commands(protection, priority, pass, framebuffer, commands)?;
            }
            Task::FlushAndQueueSubmit {
                protection,
                priority,
                signal_semaphore,
                external_fence,
                serial,
            } => {
                self.queue
                    .submit_commands(protection, priority, signal_semaphore, external_fence, serial)?;
                self.needs_cleanup.store(true, Ordering::Release);
            }
            Task::OneOffQueueSubmit {
                protection,
                priority,
                commands,
                wait_semaphore,
                serial,
            } => {
                self.queue.queue_submit_one_off(
                    protection,
                    priority,
                    commands,
                    wait_semaphore,
                    SubmitPolicy::EnsureSubmitted,
                    serial,
                )?;
                self.needs_cleanup.store(true, Ordering::Release);
            }
            Task::Present { priority, present, status } => {
                let result = self.queue.queue_present(priority, &present, &status);
                // The owner may free the status once it observes the flag
                // cleared; it must not be touched after this.
                status.finish_pending();
                drop(status);

                // Out-of-date and suboptimal are not fatal; the owner reads
                // them from the status.
                if let PresentResult::Failure(error) = result {
                    self.handle_error(QueueError::Device(error));
                }
            }
        }
        Ok(())
    }

    /// Defers a worker-thread error until a caller-observable entry point.
    /// Device loss additionally tears down the queue first.
    #[track_caller]
    fn handle_error(&self, error: QueueError) {
        if error.is_device_lost() {
            warn!("device lost reported on the submission worker");
            self.queue.handle_device_lost();
        }
        self.errors.lock().push_back(DeferredError::new(error));
    }

    fn check_pending_error(&self) -> Result<()> {
        let mut errors = self.errors.lock();
        let Some(first) = errors.pop_front() else {
            return Ok(());
        };
        for deferred in errors.drain(..) {
            error!(
                error = %deferred.error,
                location = %deferred.location,
                "dropping additional deferred error"
            );
        }
        Err(first.error)
    }
}
