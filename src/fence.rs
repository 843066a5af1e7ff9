//! Fence recycling and shared fence ownership.
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{DeviceError, Fence, FenceStatus, GpuDevice};

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Free list of fence handles. Fence creation is expensive; signaled fences
/// come back here and are reset on the way out.
///
/// The list has its own mutex and may be touched while holding any of the
/// queue locks.
pub struct FenceRecycler {
    device: Arc<dyn GpuDevice>,
    free: Mutex<Vec<Fence>>,
}

impl FenceRecycler {
    pub fn new(device: Arc<dyn GpuDevice>) -> FenceRecycler {
        FenceRecycler {
            device,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Pops and resets a pooled fence; `None` when the pool is empty and the
    /// caller should create one.
    pub fn fetch(&self) -> Result<Option<Fence>, DeviceError> {
        let fence = self.free.lock().pop();
        if let Some(fence) = fence {
            self.device.reset_fence(fence)?;
            return Ok(Some(fence));
        }
        Ok(None)
    }

    pub fn recycle(&self, fence: Fence) {
        self.free.lock().push(fence);
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.lock().is_empty()
    }

    /// Destroys every pooled fence. Outstanding shared fences must have been
    /// detached or dropped first.
    pub fn destroy(&self) {
        let mut free = self.free.lock();
        for fence in free.drain(..) {
            self.device.destroy_fence(fence);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// A fence that returns itself to its recycler when the last shared owner
/// drops it, unless the recycler has been detached (device-lost teardown),
/// in which case it is destroyed directly.
pub struct RecyclableFence {
    device: Arc<dyn GpuDevice>,
    fence: Fence,
    recycler: Mutex<Option<Arc<FenceRecycler>>>,
}

/// Shared-ownership fence handle. May be polled, waited on and released from
/// different threads; waiters clone the handle so the owning batch can be
/// freed meanwhile.
pub type SharedFence = Arc<RecyclableFence>;

impl RecyclableFence {
    /// Fetches a fence from `recycler`, creating one if the pool is empty.
    pub fn new(recycler: &Arc<FenceRecycler>) -> Result<SharedFence, DeviceError> {
        let device = recycler.device.clone();
        let fence = match recycler.fetch()? {
            Some(fence) => fence,
            None => device.create_fence()?,
        };
        Ok(Arc::new(RecyclableFence {
            device,
            fence,
            recycler: Mutex::new(Some(recycler.clone())),
        }))
    }

    pub fn handle(&self) -> Fence {
        self.fence
    }

    pub fn status(&self) -> Result<FenceStatus, DeviceError> {
        self.device.fence_status(self.fence)
    }

    pub fn wait(&self, timeout_ns: u64) -> Result<FenceStatus, DeviceError> {
        self.device.wait_fence(self.fence, timeout_ns)
    }

    /// After this, the last drop destroys the fence instead of recycling it.
    pub fn detach_recycler(&self) {
        *self.recycler.lock() = None;
    }
}

impl Drop for RecyclableFence {
    fn drop(&mut self) {
        match self.recycler.get_mut().take() {
            Some(recycler) => recycler.recycle(self.fence),
            None => self.device.destroy_fence(self.fence),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// A caller-supplied fence (sync-fd export). Never recycled; destroyed when
/// the last owner drops it.
pub struct ExternalFence {
    device: Arc<dyn GpuDevice>,
    fence: Fence,
    exported_fd: Mutex<Option<Result<i32, DeviceError>>>,
}

pub type SharedExternalFence = Arc<ExternalFence>;

impl ExternalFence {
    pub fn new(device: Arc<dyn GpuDevice>, fence: Fence) -> SharedExternalFence {
        Arc::new(ExternalFence {
            device,
            fence,
            exported_fd: Mutex::new(None),
        })
    }

    pub fn handle(&self) -> Fence {
        self.fence
    }

    pub fn status(&self) -> Result<FenceStatus, DeviceError> {
        self.device.fence_status(self.fence)
    }

    pub fn wait(&self, timeout_ns: u64) -> Result<FenceStatus, DeviceError> {
        self.device.wait_fence(self.fence, timeout_ns)
    }

    /// Exports the sync-fd. The export obeys copy semantics: the work that
    /// signals the fence must already be in the pipeline, so this is only
    /// called after the submit succeeded.
    pub(crate) fn export_fd(&self) {
        let result = self.device.export_fence_fd(self.fence);
        *self.exported_fd.lock() = Some(result);
    }

    /// The exported fd, once the submission went through.
    pub fn take_exported_fd(&self) -> Option<Result<i32, DeviceError>> {
        self.exported_fd.lock().take()
    }
}

impl Drop for ExternalFence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Either fence source of a batch, cloned out of the batch for waits that
/// run with the queue locks released.
#[derive(Clone)]
pub(crate) enum AnyFence {
    Internal(SharedFence),
    External(SharedExternalFence),
}

impl AnyFence {
    pub(crate) fn handle(&self) -> Fence {
        match self {
            AnyFence::Internal(fence) => fence.handle(),
            AnyFence::External(fence) => fence.handle(),
        }
    }

    pub(crate) fn status(&self) -> Result<FenceStatus, DeviceError> {
        match self {
            AnyFence::Internal(fence) => fence.status(),
            AnyFence::External(fence) => fence.status(),
        }
    }

    pub(crate) fn wait(&self, timeout_ns: u64) -> Result<FenceStatus, DeviceError> {
        match self {
            AnyFence::Internal(fence) => fence.wait(timeout_ns),
            AnyFence::External(fence) => fence.wait(timeout_ns),
        }
    }
}
