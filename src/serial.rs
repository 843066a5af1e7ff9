//! Queue serials and the submitted/completed progress trackers.
use std::{
    cmp::Ordering,
    sync::atomic::{AtomicU64, Ordering as MemOrdering},
};

/// Maximum number of independent serial streams (one per rendering context).
pub const MAX_SERIAL_INDICES: usize = 16;

/// Serial value that compares above every submission; forces completion.
pub const INFINITE_SERIAL: u64 = u64::MAX;

/// Index of a serial stream.
pub type SerialIndex = usize;

/// A point in one serial stream: (index, serial) with per-index comparisons.
///
/// Serial zero means "never submitted" and is the invalid/default value.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct QueueSerial {
    pub index: SerialIndex,
    pub serial: u64,
}

impl QueueSerial {
    pub fn new(index: SerialIndex, serial: u64) -> QueueSerial {
        assert!(index < MAX_SERIAL_INDICES, "serial index out of range");
        QueueSerial { index, serial }
    }

    pub fn is_valid(&self) -> bool {
        self.serial != 0
    }
}

/// The set of submissions that still reference a resource, one serial per
/// stream. Element zero means the stream is not referenced.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct ResourceUse(pub [u64; MAX_SERIAL_INDICES]);

impl Default for ResourceUse {
    fn default() -> ResourceUse {
        ResourceUse::new()
    }
}

impl ResourceUse {
    pub const fn new() -> ResourceUse {
        ResourceUse([0; MAX_SERIAL_INDICES])
    }

    pub fn from_queue_serial(qs: QueueSerial) -> ResourceUse {
        let mut use_ = ResourceUse::new();
        use_.set_queue_serial(qs);
        use_
    }

    /// Joins `qs` into the set, keeping the later serial per stream.
    pub fn set_queue_serial(&mut self, qs: QueueSerial) {
        assert!(qs.index < MAX_SERIAL_INDICES, "serial index out of range");
        self.0[qs.index] = self.0[qs.index].max(qs.serial);
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&s| s == 0)
    }
}

impl PartialOrd for ResourceUse {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let before = self.0.iter().zip(other.0.iter()).all(|(&a, &b)| a <= b);
        let after = self.0.iter().zip(other.0.iter()).all(|(&a, &b)| a >= b);
        match (before, after) {
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (true, true) => Some(Ordering::Equal),
            (false, false) => None,
        }
    }
}

/// One serial per stream, updated under a single writer lock and read
/// lock-free from any thread.
pub(crate) struct AtomicSerialArray([AtomicU64; MAX_SERIAL_INDICES]);

impl AtomicSerialArray {
    pub(crate) fn new() -> AtomicSerialArray {
        AtomicSerialArray(std::array::from_fn(|_| AtomicU64::new(0)))
    }

    pub(crate) fn load(&self, index: SerialIndex) -> u64 {
        self.0[index].load(MemOrdering::Acquire)
    }

    /// Advances the stream to `qs.serial`. Writers are serialized by the
    /// caller's lock; serials never move backwards.
    pub(crate) fn set_queue_serial(&self, qs: QueueSerial) {
        debug_assert!(qs.is_valid());
        debug_assert!(self.load(qs.index) <= qs.serial, "serial went backwards");
        self.0[qs.index].store(qs.serial, MemOrdering::Release);
    }

    /// Joins `qs` into the stream, keeping the later serial. Unlike
    /// [`set_queue_serial`], writers may race.
    ///
    /// [`set_queue_serial`]: Self::set_queue_serial
    pub(crate) fn join_queue_serial(&self, qs: QueueSerial) {
        debug_assert!(qs.is_valid());
        self.0[qs.index].fetch_max(qs.serial, MemOrdering::AcqRel);
    }

    pub(crate) fn fill(&self, value: u64) {
        for slot in &self.0 {
            slot.store(value, MemOrdering::Release);
        }
    }

    /// True if every serial in `use_` is at or below this array.
    pub(crate) fn satisfies(&self, use_: &ResourceUse) -> bool {
        use_.0
            .iter()
            .enumerate()
            .all(|(i, &s)| s == 0 || s <= self.load(i))
    }
}

/// Last-submitted and last-completed serials for every stream.
///
/// `last_submitted` is written under the submit lock; `last_completed` under
/// the completion (or device-lost) lock. Reads take no lock.
pub struct SerialTracker {
    pub(crate) submitted: AtomicSerialArray,
    pub(crate) completed: AtomicSerialArray,
}

impl SerialTracker {
    pub(crate) fn new() -> SerialTracker {
        SerialTracker {
            submitted: AtomicSerialArray::new(),
            completed: AtomicSerialArray::new(),
        }
    }

    pub fn last_submitted(&self, index: SerialIndex) -> u64 {
        self.submitted.load(index)
    }

    pub fn last_completed(&self, index: SerialIndex) -> u64 {
        self.completed.load(index)
    }

    pub fn has_serial_submitted(&self, qs: QueueSerial) -> bool {
        qs.serial <= self.submitted.load(qs.index)
    }

    pub fn has_serial_finished(&self, qs: QueueSerial) -> bool {
        qs.serial <= self.completed.load(qs.index)
    }

    pub fn has_use_submitted(&self, use_: &ResourceUse) -> bool {
        self.submitted.satisfies(use_)
    }

    pub fn has_use_finished(&self, use_: &ResourceUse) -> bool {
        self.completed.satisfies(use_)
    }

    /// Lock-free: any stream with submitted work that has not completed.
    pub fn is_busy(&self) -> bool {
        (0..MAX_SERIAL_INDICES).any(|i| self.submitted.load(i) > self.completed.load(i))
    }
}
