//! Per-submission bookkeeping.
use std::sync::Arc;

use crate::{
    device::{CommandBuffer, DeviceError, Fence, FenceStatus, Protection},
    error::Result,
    fence::{AnyFence, FenceRecycler, RecyclableFence, SharedExternalFence, SharedFence},
    pool::{CommandPoolAccess, SecondaryCommandCollector},
    serial::QueueSerial,
};

/// Bookkeeping for one submission: its queue serial, protection mode,
/// optional primary command buffer (with the broker that owns its pool),
/// the secondary buffers to recycle, and its fence.
///
/// A batch has at most one fence source: the internal recyclable fence or a
/// caller-supplied external fence, never both. A batch without a fence made
/// no device call and completes as soon as it is observed.
pub(crate) struct CommandBatch {
    queue_serial: QueueSerial,
    protection: Protection,
    primary: Option<(CommandBuffer, Arc<CommandPoolAccess>)>,
    secondary: SecondaryCommandCollector,
    fence: Option<SharedFence>,
    external_fence: Option<SharedExternalFence>,
}

impl CommandBatch {
    pub(crate) fn new(queue_serial: QueueSerial, protection: Protection) -> CommandBatch {
        assert!(queue_serial.is_valid());
        CommandBatch {
            queue_serial,
            protection,
            primary: None,
            secondary: SecondaryCommandCollector::default(),
            fence: None,
            external_fence: None,
        }
    }

    pub(crate) fn queue_serial(&self) -> QueueSerial {
        self.queue_serial
    }

    /// The broker pointer rides along so the release path can return the
    /// buffer without knowing which pool applied.
    pub(crate) fn set_primary_commands(&mut self, commands: CommandBuffer, pool_access: Arc<CommandPoolAccess>) {
        debug_assert!(self.primary.is_none());
        self.primary = Some((commands, pool_access));
    }

    pub(crate) fn set_secondary_commands(&mut self, secondary: SecondaryCommandCollector) {
        debug_assert!(self.secondary.is_empty());
        self.secondary = secondary;
    }

    pub(crate) fn primary_handle(&self) -> Option<CommandBuffer> {
        self.primary.as_ref().map(|(commands, _)| *commands)
    }

    pub(crate) fn init_fence(&mut self, recycler: &Arc<FenceRecycler>) -> Result<(), DeviceError> {
        debug_assert!(!self.has_fence());
        self.fence = Some(RecyclableFence::new(recycler)?);
        Ok(())
    }

    pub(crate) fn set_external_fence(&mut self, fence: SharedExternalFence) {
        debug_assert!(!self.has_fence());
        self.external_fence = Some(fence);
    }

    pub(crate) fn has_fence(&self) -> bool {
        debug_assert!(self.fence.is_none() || self.external_fence.is_none());
        self.fence.is_some() || self.external_fence.is_some()
    }

    pub(crate) fn fence_handle(&self) -> Option<Fence> {
        self.fence().map(|fence| fence.handle())
    }

    /// Clones the fence out so waits can run with the queue locks released.
    pub(crate) fn fence(&self) -> Option<AnyFence> {
        if let Some(fence) = &self.fence {
            return Some(AnyFence::Internal(fence.clone()));
        }
        self.external_fence.clone().map(AnyFence::External)
    }

    pub(crate) fn external_fence(&self) -> Option<&SharedExternalFence> {
        self.external_fence.as_ref()
    }

    pub(crate) fn wait_fence(&self, timeout_ns: u64) -> Result<FenceStatus, DeviceError> {
        match self.fence() {
            Some(fence) => fence.wait(timeout_ns),
            None => Ok(FenceStatus::Signaled),
        }
    }

    /// Normal teardown: the primary buffer goes back to its pool, secondary
    /// buffers go back to their recyclers, the fence returns to the fence
    /// recycler on last release.
    pub(crate) fn release(mut self) -> Result<()> {
        if let Some((commands, pool_access)) = self.primary.take() {
            pool_access.collect_primary(self.protection, commands)?;
        }
        self.secondary.release();
        self.fence = None;
        self.external_fence = None;
        Ok(())
    }

    /// Device-lost teardown: destroys the primary buffer outright and
    /// detaches the fence from its recycler so the last drop destroys it.
    pub(crate) fn destroy(mut self) {
        if let Some((commands, pool_access)) = self.primary.take() {
            pool_access.destroy_primary(commands);
        }
        self.secondary.release();
        if let Some(fence) = self.fence.take() {
            fence.detach_recycler();
        }
        self.external_fence = None;
    }
}
