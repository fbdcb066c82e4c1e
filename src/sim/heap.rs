//! A heap laid out the way generated stubs expect it.
//!
//! The heap lives entirely in simulator [`Memory`]: a root table, a store
//! buffer, a stack, and size-aligned regions holding objects. It serves the
//! two native entry points the record-write stub calls and implements
//! [`Collector`] over the same memory, so the reference barrier and the
//! generated one can be run against identical state and compared.

use crate::config::{HeapLayout, RegisterTable};
use crate::gc::Collector;
use crate::jit::Reg;
use crate::stubs::dictionary::{ENTRY_SIZE, NameConstant, name_hash, probe_index};

use super::{HostFn, Memory, SimEnvironment, SimError, Simulator};

pub const ROOT_TABLE: u64 = 0x10_0000;
const ROOT_TABLE_SIZE: u64 = 0x8000;
pub const STORE_BUFFER: u64 = 0x20_0000;
pub const STACK_TOP: u64 = 0x40_0000;
const STACK_SIZE: u64 = 0x1_0000;
pub const RECORD_WRITE_FN: u64 = 0xF000_0000;
pub const STORE_BUFFER_OVERFLOW_FN: u64 = 0xF000_0010;
const HEAP_START: u64 = 0x1000_0000;
const DEFAULT_STORE_BUFFER_ENTRIES: usize = 64;

/// Bytes per store buffer entry: object then slot address.
const ENTRY_BYTES: u64 = 16;

#[derive(Debug, Clone)]
pub struct SimHeap {
    layout: HeapLayout,
    memory: Memory,
    region_size: u64,
    region: u64,
    bump: u64,
    store_buffer_entries: usize,
    unique_name_map: u64,
    non_unique_name_map: u64,
    undefined: u64,
    the_hole: u64,
    /// `(value, object, slot)` for every marker call
    pub marker_calls: Vec<(u64, u64, u64)>,
    pub worklist: Vec<u64>,
    /// Store buffer entries handed over by overflows, oldest first
    pub drained: Vec<(u64, u64)>,
    pub overflows: usize,
}

impl SimHeap {
    pub fn new(layout: &HeapLayout) -> Result<Self, SimError> {
        Self::with_store_buffer(layout, DEFAULT_STORE_BUFFER_ENTRIES)
    }

    /// A heap whose store buffer overflows after `entries` appends.
    pub fn with_store_buffer(layout: &HeapLayout, entries: usize) -> Result<Self, SimError> {
        if entries == 0 {
            return Err(SimError::Heap("store buffer needs at least one entry".to_string()));
        }
        layout.validate().map_err(SimError::Heap)?;

        let region_size = 1u64 << layout.region_size_log2;
        let heap_start = HEAP_START.next_multiple_of(region_size);
        let mut memory = Memory::new();
        memory.map(ROOT_TABLE, ROOT_TABLE_SIZE);
        memory.map(STORE_BUFFER, entries as u64 * ENTRY_BYTES);
        memory.map(STACK_TOP - STACK_SIZE, STACK_SIZE);

        let mut heap = Self {
            layout: layout.clone(),
            memory,
            region_size,
            region: heap_start,
            bump: 0,
            store_buffer_entries: entries,
            unique_name_map: 0,
            non_unique_name_map: 0,
            undefined: 0,
            the_hole: 0,
            marker_calls: Vec::new(),
            worklist: Vec::new(),
            drained: Vec::new(),
            overflows: 0,
        };
        heap.map_region(heap_start);

        let not_unique = 1u8 << layout.dictionary.not_unique_name_bit;
        heap.unique_name_map = heap.alloc_map(0)?;
        heap.non_unique_name_map = heap.alloc_map(not_unique)?;
        heap.undefined = heap.alloc_with_map(heap.unique_name_map)?;
        heap.the_hole = heap.alloc_with_map(heap.unique_name_map)?;

        let l = &heap.layout;
        let roots = [
            (l.marking_flag_offset, 0),
            (l.store_buffer_top_offset, STORE_BUFFER),
            (
                l.store_buffer_limit_offset,
                STORE_BUFFER + entries as u64 * ENTRY_BYTES,
            ),
            (l.record_write_fn_offset, RECORD_WRITE_FN),
            (l.store_buffer_overflow_fn_offset, STORE_BUFFER_OVERFLOW_FN),
            (l.undefined_value_offset, heap.undefined),
            (l.the_hole_value_offset, heap.the_hole),
        ];
        for (offset, value) in roots {
            heap.memory.write_u64(ROOT_TABLE + offset as u64, value)?;
        }
        Ok(heap)
    }

    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// Wire a simulator to this heap: root register, stack, host entry
    /// points, and the registers a host call may clobber.
    pub fn attach(&self, sim: &mut Simulator, registers: &RegisterTable) -> Result<(), SimError> {
        let root = Reg::from_code(registers.root)
            .ok_or_else(|| SimError::Heap(format!("root register {} is invalid", registers.root)))?;
        sim.set_x(root, ROOT_TABLE);
        sim.set_sp(STACK_TOP);
        sim.register_host_fn(RECORD_WRITE_FN, HostFn::RecordWrite);
        sim.register_host_fn(STORE_BUFFER_OVERFLOW_FN, HostFn::StoreBufferOverflow);
        sim.set_caller_saved(&registers.caller_saved, &registers.caller_saved_fp);
        Ok(())
    }

    fn root_word(&self, offset: i32) -> u64 {
        self.memory.read_u64(ROOT_TABLE + offset as u64).unwrap_or(0)
    }

    fn set_root_word(&mut self, offset: i32, value: u64) {
        // The root table is always mapped.
        let _ = self.memory.write_u64(ROOT_TABLE + offset as u64, value);
    }

    pub fn set_marking(&mut self, marking: bool) {
        self.set_root_word(self.layout.marking_flag_offset, marking as u64);
    }

    pub fn undefined(&self) -> u64 {
        self.undefined
    }

    pub fn the_hole(&self) -> u64 {
        self.the_hole
    }

    // ---- Regions and objects ----

    fn map_region(&mut self, base: u64) {
        self.memory.map(base, self.region_size);
        self.region = base;
        self.bump = self.region_header_size();
    }

    fn region_header_size(&self) -> u64 {
        (self.layout.region_flags_offset as u64 + 8).next_multiple_of(16)
    }

    /// Start allocating in a fresh region. Returns its base address.
    pub fn new_region(&mut self) -> u64 {
        let base = self.region + self.region_size;
        self.map_region(base);
        base
    }

    /// Region holding tagged or untagged `address`.
    pub fn region_of(&self, address: u64) -> u64 {
        self.layout.region_base(address)
    }

    pub fn set_region_fully_marked(&mut self, address: u64, marked: bool) -> Result<(), SimError> {
        let flags_addr = self.region_of(address) + self.layout.region_flags_offset as u64;
        let bit = 1u64 << self.layout.fully_marked_bit;
        let flags = self.memory.read_u64(flags_addr)?;
        let flags = if marked { flags | bit } else { flags & !bit };
        self.memory.write_u64(flags_addr, flags)
    }

    /// Allocate `bytes` of zeroed memory and return a tagged pointer.
    pub fn alloc(&mut self, bytes: u64) -> Result<u64, SimError> {
        let size = bytes.max(8).next_multiple_of(16);
        if self.region_header_size() + size > self.region_size {
            return Err(SimError::Heap(format!(
                "object of {} bytes does not fit a {} byte region",
                bytes, self.region_size
            )));
        }
        if self.bump + size > self.region_size {
            self.new_region();
        }
        let address = self.region + self.bump;
        self.bump += size;
        Ok(address + self.layout.heap_object_tag() as u64)
    }

    fn untag(&self, object: u64) -> u64 {
        object.wrapping_sub(self.layout.heap_object_tag() as u64)
    }

    pub fn read_field(&self, object: u64, offset: i32) -> Result<u64, SimError> {
        self.memory.read_u64(self.untag(object).wrapping_add(offset as u64))
    }

    pub fn write_field(&mut self, object: u64, offset: i32, value: u64) -> Result<(), SimError> {
        let address = self.untag(object).wrapping_add(offset as u64);
        self.memory.write_u64(address, value)
    }

    /// Untagged address of a field, as stored in the store buffer.
    pub fn field_address(&self, object: u64, offset: i32) -> u64 {
        self.untag(object).wrapping_add(offset as u64)
    }

    fn alloc_map(&mut self, instance_type: u8) -> Result<u64, SimError> {
        let offset = self.layout.dictionary.instance_type_offset;
        let map = self.alloc(offset as u64 + 1)?;
        let address = self.untag(map) + offset as u64;
        self.memory.write_u8(address, instance_type)?;
        Ok(map)
    }

    fn alloc_with_map(&mut self, map: u64) -> Result<u64, SimError> {
        let map_offset = self.layout.dictionary.map_offset;
        let object = self.alloc(map_offset as u64 + 8)?;
        self.write_field(object, map_offset, map)?;
        Ok(object)
    }

    // ---- Names and dictionaries ----

    /// Allocate a name. Unique names are the only keys whose identity
    /// decides equality.
    pub fn alloc_name(&mut self, name: &str, unique: bool) -> Result<NameConstant, SimError> {
        let dict = self.layout.dictionary.clone();
        let map = if unique {
            self.unique_name_map
        } else {
            self.non_unique_name_map
        };
        let size = dict.map_offset.max(dict.name_hash_offset) as u64 + 8;
        let ptr = self.alloc(size)?;
        let hash = name_hash(name);
        self.write_field(ptr, dict.map_offset, map)?;
        self.write_field(ptr, dict.name_hash_offset, (hash as u64) << dict.hash_shift)?;
        Ok(NameConstant { ptr, hash })
    }

    /// Allocate an empty dictionary. `capacity` must be a power of two.
    pub fn alloc_dictionary(&mut self, capacity: u32) -> Result<u64, SimError> {
        if !capacity.is_power_of_two() {
            return Err(SimError::Heap(format!(
                "dictionary capacity {} is not a power of two",
                capacity
            )));
        }
        let dict = self.layout.dictionary.clone();
        let entries = capacity as u64 * ENTRY_SIZE as u64 * 8;
        let size = (dict.capacity_offset as u64 + 8).max(dict.elements_start_offset as u64 + entries);
        let object = self.alloc(size)?;
        self.write_field(object, dict.capacity_offset, capacity as u64)?;
        for index in 0..capacity {
            self.set_entry_key(object, index, self.undefined)?;
        }
        Ok(object)
    }

    fn entry_offset(&self, index: u32) -> i32 {
        self.layout.dictionary.elements_start_offset + (index * ENTRY_SIZE * 8) as i32
    }

    pub fn capacity(&self, dictionary: u64) -> Result<u32, SimError> {
        Ok(self.read_field(dictionary, self.layout.dictionary.capacity_offset)? as u32)
    }

    pub fn entry_key(&self, dictionary: u64, index: u32) -> Result<u64, SimError> {
        self.read_field(dictionary, self.entry_offset(index))
    }

    pub fn set_entry_key(&mut self, dictionary: u64, index: u32, key: u64) -> Result<(), SimError> {
        let offset = self.entry_offset(index);
        self.write_field(dictionary, offset, key)
    }

    /// Insert `name` at the first free entry of its probe sequence and
    /// return the entry index.
    pub fn dictionary_add(&mut self, dictionary: u64, name: NameConstant) -> Result<u32, SimError> {
        let capacity = self.capacity(dictionary)?;
        for i in 0..capacity {
            let index = probe_index(name.hash, i, capacity);
            let key = self.entry_key(dictionary, index)?;
            if key == self.undefined || key == self.the_hole {
                self.set_entry_key(dictionary, index, name.ptr)?;
                return Ok(index);
            }
        }
        Err(SimError::Heap("dictionary is full".to_string()))
    }

    /// Replace the key at `index` with the deleted marker.
    pub fn dictionary_delete(&mut self, dictionary: u64, index: u32) -> Result<(), SimError> {
        let hole = self.the_hole;
        self.set_entry_key(dictionary, index, hole)
    }

    // ---- Store buffer ----

    pub fn store_buffer_top(&self) -> u64 {
        self.root_word(self.layout.store_buffer_top_offset)
    }

    /// Entries appended since the last overflow, oldest first.
    pub fn store_buffer_entries(&self) -> Vec<(u64, u64)> {
        let top = self.store_buffer_top();
        (STORE_BUFFER..top)
            .step_by(ENTRY_BYTES as usize)
            .map(|entry| {
                (
                    self.memory.read_u64(entry).unwrap_or(0),
                    self.memory.read_u64(entry + 8).unwrap_or(0),
                )
            })
            .collect()
    }

    pub fn store_buffer_capacity(&self) -> usize {
        self.store_buffer_entries
    }
}

impl Collector for SimHeap {
    fn region_is_marking_in_progress(&self) -> bool {
        self.root_word(self.layout.marking_flag_offset) != 0
    }

    fn value_is_heap_pointer(&self, value: u64) -> bool {
        value & (1 << self.layout.heap_object_tag_bit) != 0
    }

    fn region_is_fully_marked(&self, address: u64) -> bool {
        let flags_addr = self.region_of(address) + self.layout.region_flags_offset as u64;
        let flags = self.memory.read_u64(flags_addr).unwrap_or(0);
        flags & (1 << self.layout.fully_marked_bit) != 0
    }

    fn store_buffer_append(&mut self, object: u64, address: u64) {
        let top = self.store_buffer_top();
        let _ = self.memory.write_u64(top, object);
        let _ = self.memory.write_u64(top + 8, address);
        self.set_root_word(self.layout.store_buffer_top_offset, top + ENTRY_BYTES);
    }

    fn store_buffer_is_full(&self) -> bool {
        self.store_buffer_top() >= self.root_word(self.layout.store_buffer_limit_offset)
    }

    fn store_buffer_overflow(&mut self) {
        let entries = self.store_buffer_entries();
        self.drained.extend(entries);
        self.set_root_word(self.layout.store_buffer_top_offset, STORE_BUFFER);
        self.overflows += 1;
    }

    fn mark_worklist_push(&mut self, object: u64) {
        self.worklist.push(object);
    }
}

impl SimEnvironment for SimHeap {
    fn memory(&self) -> &Memory {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    fn host_call(&mut self, function: HostFn, args: [u64; 3]) -> Result<u64, SimError> {
        match function {
            HostFn::RecordWrite => {
                let [value, object, slot] = args;
                self.marker_calls.push((value, object, slot));
                self.mark_worklist_push(value);
            }
            HostFn::StoreBufferOverflow => self.store_buffer_overflow(),
        }
        Ok(0)
    }
}
