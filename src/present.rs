//! Present payloads and the shared swapchain status cell.
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::device::{DeviceError, Fence, Semaphore, Swapchain};

/// A rectangle of the surface that changed since the last present.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PresentRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Presentation mode requested for this and subsequent presents.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
}

/// One present call: exactly one swapchain image, at most one wait
/// semaphore, plus the supported extension records. The payload is owned so
/// it can cross into the worker thread.
#[derive(Debug)]
pub struct PresentInfo {
    pub swapchain: Swapchain,
    pub image_index: u32,
    pub wait_semaphore: Option<Semaphore>,
    /// Present-regions extension record.
    pub regions: Vec<PresentRect>,
    /// Present-fence extension record; signaled by the driver when the
    /// present completes.
    pub present_fence: Option<Fence>,
    /// Present-mode extension record.
    pub present_mode: Option<PresentMode>,
}

impl PresentInfo {
    pub fn new(swapchain: Swapchain, image_index: u32) -> PresentInfo {
        PresentInfo {
            swapchain,
            image_index,
            wait_semaphore: None,
            regions: Vec::new(),
            present_fence: None,
            present_mode: None,
        }
    }
}

/// Outcome of a present call. `Suboptimal` and `OutOfDate` are surfaced
/// through [`SwapchainStatus`] and are not fatal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PresentResult {
    Success,
    Suboptimal,
    OutOfDate,
    Failure(DeviceError),
}

/// Shared between the swapchain owner and the submission core.
///
/// The owner sets `is_pending` when a present is enqueued; the worker stores
/// the device result and then clears the flag. Once the owner observes the
/// flag cleared it may drop the status; the worker never touches it after
/// clearing.
#[derive(Debug)]
pub struct SwapchainStatus {
    is_pending: AtomicBool,
    last_present_result: Mutex<PresentResult>,
}

impl Default for SwapchainStatus {
    fn default() -> SwapchainStatus {
        SwapchainStatus::new()
    }
}

impl SwapchainStatus {
    pub fn new() -> SwapchainStatus {
        SwapchainStatus {
            is_pending: AtomicBool::new(false),
            last_present_result: Mutex::new(PresentResult::Success),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.is_pending.load(Ordering::Acquire)
    }

    pub fn last_present_result(&self) -> PresentResult {
        *self.last_present_result.lock()
    }

    pub(crate) fn begin_pending(&self) {
        debug_assert!(!self.is_pending());
        // Report success until the real result is known, so the owner can
        // keep going until it has to look.
        *self.last_present_result.lock() = PresentResult::Success;
        self.is_pending.store(true, Ordering::Release);
    }

    pub(crate) fn set_last_present_result(&self, result: PresentResult) {
        *self.last_present_result.lock() = result;
    }

    /// The result must be stored before the flag clears.
    pub(crate) fn finish_pending(&self) {
        debug_assert!(self.is_pending());
        self.is_pending.store(false, Ordering::Release);
    }
}
