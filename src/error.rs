use std::panic::Location;

use crate::device::DeviceError;

pub type Result<T, E = QueueError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("timed out waiting for submitted work")]
    Timeout,
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    pub fn is_device_lost(&self) -> bool {
        matches!(self, QueueError::Device(DeviceError::DeviceLost))
    }
}

/// An error raised on the worker thread, held until a caller-observable
/// entry point can report it.
#[derive(Debug)]
pub(crate) struct DeferredError {
    pub error: QueueError,
    pub location: &'static Location<'static>,
}

impl DeferredError {
    #[track_caller]
    pub(crate) fn new(error: QueueError) -> DeferredError {
        DeferredError {
            error,
            location: Location::caller(),
        }
    }
}
