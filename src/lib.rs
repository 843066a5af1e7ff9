//! Serialized GPU command submission for multi-context renderers.
//!
//! This crate bridges synchronous command recording with an asynchronous
//! GPU: rendering contexts flush recorded command buffers into a
//! per-(priority, protection) accumulation state, and a serialized engine
//! ([`CommandQueue`]) turns that state into fenced device submissions,
//! tracks them until their fences signal, and reclaims their resources.
//! An optional worker thread ([`CommandProcessor`]) moves submission off
//! the rendering threads while preserving submit order.
//!
//! The driver is abstracted behind [`GpuDevice`]; the memory allocator
//! participates only through the [`GarbageAllocator`] throttling signal.

mod batch;
mod device;
mod error;
mod fence;
mod pool;
mod present;
mod processor;
mod queue;
mod serial;
mod util;

pub use device::*;
pub use error::{QueueError, Result};
pub use fence::{ExternalFence, FenceRecycler, RecyclableFence, SharedExternalFence, SharedFence};
pub use pool::{SecondaryCommandRecycler, SecondaryCommands};
pub use present::*;
pub use processor::CommandProcessor;
pub use queue::{CommandQueue, PerfCounters, QueueOptions, SubmitPolicy, GARBAGE_SIZE_THROTTLE};
pub use serial::{QueueSerial, ResourceUse, SerialIndex, SerialTracker, INFINITE_SERIAL, MAX_SERIAL_INDICES};
