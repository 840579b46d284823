use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

use crate::packet::{NUM_PKTS, PacketRecord, PKT_SIZE, to_record};

/// Result of trying to append to a full-or-not sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Stored(usize),
    /// Sequence was at capacity; `excess` is the running count of dropped writes
    Dropped { excess: u64 },
}

struct Slot {
    written: AtomicBool,
    record: Mutex<PacketRecord>,
}

impl Slot {
    fn new() -> Self {
        Self {
            written: AtomicBool::new(false),
            record: Mutex::new([0u8; PKT_SIZE]),
        }
    }
}

/// Bounded, pre-allocated, index-addressed sequence of packet records.
///
/// Indices are claimed atomically and never exceed capacity. Writes past
/// capacity are dropped and counted rather than stored.
pub struct RecordSequence {
    name: &'static str,
    slots: Box<[Slot]>,
    claimed: AtomicUsize,
    dropped: AtomicU64,
    saturation_reported: AtomicBool,
}

impl RecordSequence {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            claimed: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            saturation_reported: AtomicBool::new(false),
        }
    }

    pub fn record(&self, bytes: &[u8]) -> RecordOutcome {
        let capacity = self.slots.len();
        let claim = self
            .claimed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            });

        let index = match claim {
            Ok(index) => index,
            Err(_) => {
                let excess = self.dropped.fetch_add(1, Ordering::AcqRel) + 1;
                if !self.saturation_reported.swap(true, Ordering::AcqRel) {
                    warn!(
                        "{} history is full ({} records), further packets are counted but not kept",
                        self.name, capacity
                    );
                } else {
                    debug!("{} history full, {} dropped so far", self.name, excess);
                }
                return RecordOutcome::Dropped { excess };
            }
        };

        let slot = &self.slots[index];
        *slot.record.lock() = to_record(bytes);
        slot.written.store(true, Ordering::Release);
        RecordOutcome::Stored(index)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of records kept (never above capacity)
    pub fn len(&self) -> usize {
        self.claimed.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    /// Every write attempt, kept or dropped
    pub fn delivered(&self) -> u64 {
        self.len() as u64 + self.dropped()
    }

    /// Copy of every slot; slots not yet written read as all zeros
    pub fn snapshot(&self) -> Vec<PacketRecord> {
        self.slots
            .iter()
            .map(|slot| {
                if slot.written.load(Ordering::Acquire) {
                    *slot.record.lock()
                } else {
                    [0u8; PKT_SIZE]
                }
            })
            .collect()
    }
}

/// Sent and received sequences. The transmit scheduler is the only writer
/// of `sent`, the receive handler the only writer of `received`.
pub struct PacketHistory {
    pub sent: RecordSequence,
    pub received: RecordSequence,
}

impl Default for PacketHistory {
    fn default() -> Self {
        Self::with_capacity(NUM_PKTS)
    }
}

impl PacketHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sent: RecordSequence::new("sent", capacity),
            received: RecordSequence::new("received", capacity),
        }
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            sent: self.sent.snapshot(),
            received: self.received.snapshot(),
            sent_count: self.sent.len(),
            received_count: self.received.len(),
            received_dropped: self.received.dropped(),
        }
    }
}

/// Immutable view of the history handed to the dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistorySnapshot {
    pub sent: Vec<PacketRecord>,
    pub received: Vec<PacketRecord>,
    pub sent_count: usize,
    pub received_count: usize,
    pub received_dropped: u64,
}

impl HistorySnapshot {
    pub fn rows(&self) -> impl Iterator<Item = (usize, &PacketRecord, &PacketRecord)> {
        self.sent
            .iter()
            .zip(self.received.iter())
            .enumerate()
            .map(|(i, (sent, received))| (i, sent, received))
    }

    /// Rows where both sides were written and are byte-identical
    pub fn matching_rows(&self) -> usize {
        let written = self.sent_count.min(self.received_count);
        self.rows()
            .take(written)
            .filter(|(_, sent, received)| sent == received)
            .count()
    }
}
