//! Opaque device abstraction: handles, submission payloads and the traits
//! implemented by the driver layer and the allocator.
use std::fmt;

use crate::present::{PresentInfo, PresentResult};

////////////////////////////////////////////////////////////////////////////////////////////////////

macro_rules! define_handles {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {$(
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Hash)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn from_raw(raw: u64) -> $name {
                $name(raw)
            }

            pub const fn as_raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }
    )*};
}

define_handles! {
    /// A driver fence object.
    Fence,
    /// A driver semaphore object.
    Semaphore,
    /// A pool that primary command buffers are allocated from.
    CommandPool,
    /// A recorded (or recording) command buffer.
    CommandBuffer,
    /// A swapchain to present into.
    Swapchain,
    /// A render pass object, passed through opaquely.
    RenderPass,
    /// A framebuffer object, passed through opaquely.
    Framebuffer,
}

bitflags::bitflags! {
    /// Pipeline stages a semaphore wait applies to.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const TRANSFER = 1 << 1;
        const COMPUTE = 1 << 2;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 3;
        const BOTTOM_OF_PIPE = 1 << 4;
        const ALL_COMMANDS = Self::TOP_OF_PIPE.bits()
            | Self::TRANSFER.bits()
            | Self::COMPUTE.bits()
            | Self::COLOR_ATTACHMENT_OUTPUT.bits()
            | Self::BOTTOM_OF_PIPE.bits();
    }
}

/// Which device queue a submission goes to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub(crate) const COUNT: usize = 3;
    pub const ALL: [Priority; Priority::COUNT] = [Priority::Low, Priority::Medium, Priority::High];

    pub(crate) fn index(self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        }
    }
}

/// Whether a submission uses the protected-memory device path.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Protection {
    Unprotected,
    Protected,
}

impl Protection {
    pub(crate) const COUNT: usize = 2;
    pub const ALL: [Protection; Protection::COUNT] = [Protection::Unprotected, Protection::Protected];

    pub(crate) fn index(self) -> usize {
        match self {
            Protection::Unprotected => 0,
            Protection::Protected => 1,
        }
    }
}

/// Errors reported by the driver layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("device lost")]
    DeviceLost,
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("device error ({0:#x})")]
    Other(i32),
}

/// Result of a fence query or a bounded fence wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FenceStatus {
    Signaled,
    /// Not signaled yet; for waits this means the timeout elapsed.
    Unsignaled,
}

/// One call into the device submit primitive.
#[derive(Debug)]
pub struct SubmitInfo<'a> {
    pub commands: Option<CommandBuffer>,
    pub wait_semaphores: &'a [Semaphore],
    pub wait_stage_masks: &'a [PipelineStages],
    pub signal_semaphore: Option<Semaphore>,
    /// Set only when the submission carries commands and the batch is protected.
    pub protected: bool,
}

/// The driver layer, reduced to the primitives the submission core needs.
///
/// Handles are opaque; the implementation defines what they mean. All methods
/// must be callable from any thread.
pub trait GpuDevice: Send + Sync {
    // --- queues ---
    fn submit(&self, priority: Priority, submit: &SubmitInfo<'_>, fence: Option<Fence>) -> Result<(), DeviceError>;
    fn present(&self, priority: Priority, present: &PresentInfo) -> PresentResult;
    fn queue_wait_idle(&self, priority: Priority) -> Result<(), DeviceError>;

    // --- fences ---
    fn create_fence(&self) -> Result<Fence, DeviceError>;
    fn destroy_fence(&self, fence: Fence);
    fn reset_fence(&self, fence: Fence) -> Result<(), DeviceError>;
    fn fence_status(&self, fence: Fence) -> Result<FenceStatus, DeviceError>;
    /// Bounded wait; `Ok(Unsignaled)` means the timeout elapsed.
    fn wait_fence(&self, fence: Fence, timeout_ns: u64) -> Result<FenceStatus, DeviceError>;
    /// Exports a sync-fd from the fence. Only valid once the fence's
    /// submission has been queued.
    fn export_fence_fd(&self, fence: Fence) -> Result<i32, DeviceError>;

    // --- command plumbing used by the pool broker ---
    fn create_command_pool(&self, protection: Protection) -> Result<CommandPool, DeviceError>;
    fn destroy_command_pool(&self, pool: CommandPool);
    fn allocate_primary_commands(&self, pool: CommandPool) -> Result<CommandBuffer, DeviceError>;
    fn free_commands(&self, commands: CommandBuffer);
    fn begin_commands(&self, commands: CommandBuffer) -> Result<(), DeviceError>;
    fn end_commands(&self, commands: CommandBuffer) -> Result<(), DeviceError>;
    fn reset_commands(&self, commands: CommandBuffer) -> Result<(), DeviceError>;
    /// Appends the recorded contents of `secondary` onto `primary`.
    fn execute_commands(&self, primary: CommandBuffer, secondary: CommandBuffer);
    fn begin_render_pass(&self, primary: CommandBuffer, pass: RenderPass, framebuffer: Option<Framebuffer>);
    fn end_render_pass(&self, primary: CommandBuffer);
}

/// Throttling signal emitted by the memory allocator.
///
/// Garbage is tagged with queue serials by the allocator; `collect` frees
/// whatever the completed serials allow and reports whether it made progress.
pub trait GarbageAllocator: Send + Sync {
    fn garbage_size(&self) -> u64;
    fn collect(&self) -> bool;
}

/// Allocator stub for embedders without deferred-free garbage.
pub struct NullAllocator;

impl GarbageAllocator for NullAllocator {
    fn garbage_size(&self) -> u64 {
        0
    }

    fn collect(&self) -> bool {
        false
    }
}
