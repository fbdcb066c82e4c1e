//! The collector side of the write barrier.
//!
//! Generated barrier code only reads collector state through the root
//! table and calls back into the collector through two native entry
//! points. [`Collector`] is the same interface expressed in Rust, so the
//! protocol can be run without generated code ([`barrier::record_write`])
//! and generated code can be checked against it.

pub mod barrier;
pub mod marking;

/// State and callbacks the write barrier depends on.
pub trait Collector {
    /// Non-zero marking flag in the root table.
    fn region_is_marking_in_progress(&self) -> bool;

    /// Whether `value` is a tagged heap pointer rather than a small integer.
    fn value_is_heap_pointer(&self, value: u64) -> bool;

    /// Whether every object in the region containing `address` is marked.
    fn region_is_fully_marked(&self, address: u64) -> bool;

    /// Record that slot `address` inside `object` was written.
    fn store_buffer_append(&mut self, object: u64, address: u64);

    /// The store buffer reached its limit.
    fn store_buffer_is_full(&self) -> bool {
        false
    }

    /// Drain a full store buffer.
    fn store_buffer_overflow(&mut self);

    /// Grey `object` so the marker visits it.
    fn mark_worklist_push(&mut self, object: u64);
}

/// A collector that only records what the barrier asked of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingCollector {
    pub marking: bool,
    /// Regions (by base address) that are fully marked
    pub fully_marked_regions: Vec<u64>,
    pub region_size_log2: u8,
    pub heap_object_tag_bit: u8,
    pub store_buffer: Vec<(u64, u64)>,
    pub store_buffer_capacity: Option<usize>,
    pub overflows: usize,
    /// Entries handed over by overflows, oldest first
    pub drained: Vec<(u64, u64)>,
    pub worklist: Vec<u64>,
}

impl RecordingCollector {
    pub fn new(region_size_log2: u8, heap_object_tag_bit: u8) -> Self {
        Self {
            region_size_log2,
            heap_object_tag_bit,
            ..Self::default()
        }
    }

    fn region_base(&self, address: u64) -> u64 {
        address & !((1u64 << self.region_size_log2) - 1)
    }
}

impl Collector for RecordingCollector {
    fn region_is_marking_in_progress(&self) -> bool {
        self.marking
    }

    fn value_is_heap_pointer(&self, value: u64) -> bool {
        value & (1 << self.heap_object_tag_bit) != 0
    }

    fn region_is_fully_marked(&self, address: u64) -> bool {
        self.fully_marked_regions.contains(&self.region_base(address))
    }

    fn store_buffer_append(&mut self, object: u64, address: u64) {
        self.store_buffer.push((object, address));
    }

    fn store_buffer_is_full(&self) -> bool {
        self.store_buffer_capacity
            .is_some_and(|capacity| self.store_buffer.len() >= capacity)
    }

    fn store_buffer_overflow(&mut self) {
        self.overflows += 1;
        self.drained.append(&mut self.store_buffer);
    }

    fn mark_worklist_push(&mut self, object: u64) {
        self.worklist.push(object);
    }
}
