//! Stub generator configuration types.
//!
//! Everything the generated code assumes about the target and the heap lives
//! here: which registers the VM reserves, where the collector's state sits
//! relative to the root register, and how objects and dictionaries are laid
//! out. All fields have defaults, so a config file only needs to list the
//! values it changes.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::stubs::registers::RegList;

/// Registers the VM depends on globally, plus the calling-convention lists
/// the stubs save around native calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterTable {
    /// Root table pointer
    pub root: u8,
    /// Context pointer
    pub context: u8,
    /// JS stack pointer
    pub js_stack_pointer: u8,
    /// Machine stack pointer (must be 31 on AArch64)
    pub stack_pointer: u8,
    pub frame_pointer: u8,
    pub link_register: u8,
    /// Temporaries owned by the macro assembler; stubs clobber these freely
    pub assembler_temps: Vec<u8>,
    /// General-purpose registers a native call may clobber
    pub caller_saved: Vec<u8>,
    /// Floating-point registers a native call may clobber
    pub caller_saved_fp: Vec<u8>,
}

impl Default for RegisterTable {
    fn default() -> Self {
        Self {
            root: 26,
            context: 27,
            js_stack_pointer: 28,
            stack_pointer: 31,
            frame_pointer: 29,
            link_register: 30,
            assembler_temps: vec![16, 17],
            caller_saved: (0..=18).collect(),
            caller_saved_fp: (0..=7).chain(16..=31).collect(),
        }
    }
}

impl RegisterTable {
    /// Registers with a VM-wide role.
    pub fn reserved(&self) -> RegList {
        RegList::from_codes(&[
            self.root,
            self.context,
            self.js_stack_pointer,
            self.stack_pointer,
            self.frame_pointer,
            self.link_register,
        ])
    }

    pub fn assembler_temps(&self) -> RegList {
        RegList::from_codes(&self.assembler_temps)
    }

    /// Full register file minus reserved roles and assembler temporaries.
    pub fn allocatable(&self) -> RegList {
        RegList::all()
            .difference(self.reserved())
            .difference(self.assembler_temps())
    }

    pub fn caller_saved(&self) -> RegList {
        RegList::from_codes(&self.caller_saved)
    }

    pub fn validate(&self) -> Result<(), String> {
        let roles = [
            ("root", self.root),
            ("context", self.context),
            ("js_stack_pointer", self.js_stack_pointer),
            ("stack_pointer", self.stack_pointer),
            ("frame_pointer", self.frame_pointer),
            ("link_register", self.link_register),
        ];
        for (name, code) in roles {
            if code > 31 {
                return Err(format!("register {} for {} is out of range", code, name));
            }
        }
        if self.stack_pointer != 31 {
            return Err("stack_pointer must be register 31".to_string());
        }
        let lists = [
            ("assembler_temps", &self.assembler_temps),
            ("caller_saved", &self.caller_saved),
            ("caller_saved_fp", &self.caller_saved_fp),
        ];
        for (name, list) in lists {
            if let Some(bad) = list.iter().find(|&&r| r > 31) {
                return Err(format!("register {} in {} is out of range", bad, name));
            }
        }
        if let Some(arg) = (0..3).find(|r| !self.caller_saved.contains(r)) {
            return Err(format!(
                "caller_saved must contain the argument register x{}",
                arg
            ));
        }
        if self.assembler_temps.is_empty() {
            return Err("at least one assembler temporary is required".to_string());
        }
        if !self.assembler_temps().intersection(self.reserved()).is_empty() {
            return Err("assembler temporaries overlap reserved registers".to_string());
        }
        Ok(())
    }
}

/// Layout of name dictionaries and the objects they hold.
///
/// Offsets are untagged byte offsets from the start of the object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DictionaryLayout {
    /// Word holding the (power of two) capacity
    pub capacity_offset: i32,
    /// First entry; entries are three words (key, value, details)
    pub elements_start_offset: i32,
    /// Map pointer of any heap object
    pub map_offset: i32,
    /// Instance type byte inside a map
    pub instance_type_offset: i32,
    /// Instance type bit set for keys that are not unique names
    pub not_unique_name_bit: u8,
    /// Hash field of a name
    pub name_hash_offset: i32,
    /// Hash field = hash << hash_shift
    pub hash_shift: u8,
}

impl Default for DictionaryLayout {
    fn default() -> Self {
        Self {
            capacity_offset: 32,
            elements_start_offset: 40,
            map_offset: 0,
            instance_type_offset: 8,
            not_unique_name_bit: 6,
            name_hash_offset: 8,
            hash_shift: 2,
        }
    }
}

/// Heap and root-table layout the generated code depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapLayout {
    /// Bit set in every tagged heap pointer (clear for small integers)
    pub heap_object_tag_bit: u8,
    /// Regions are 2^region_size_log2 bytes and aligned to their size
    pub region_size_log2: u8,
    /// Flags word inside the region header
    pub region_flags_offset: i32,
    /// Region flag: every object in the region is marked
    pub fully_marked_bit: u8,

    // Root-table words, relative to the root register
    pub marking_flag_offset: i32,
    pub store_buffer_top_offset: i32,
    pub store_buffer_limit_offset: i32,
    pub record_write_fn_offset: i32,
    pub store_buffer_overflow_fn_offset: i32,
    pub undefined_value_offset: i32,
    pub the_hole_value_offset: i32,

    pub dictionary: DictionaryLayout,
}

impl Default for HeapLayout {
    fn default() -> Self {
        Self {
            heap_object_tag_bit: 0,
            region_size_log2: 18,
            region_flags_offset: 8,
            fully_marked_bit: 0,
            marking_flag_offset: 0,
            store_buffer_top_offset: 8,
            store_buffer_limit_offset: 16,
            record_write_fn_offset: 24,
            store_buffer_overflow_fn_offset: 32,
            undefined_value_offset: 40,
            the_hole_value_offset: 48,
            dictionary: DictionaryLayout::default(),
        }
    }
}

impl HeapLayout {
    /// Low-bit tag carried by heap pointers.
    pub fn heap_object_tag(&self) -> i32 {
        1 << self.heap_object_tag_bit
    }

    /// Displacement of a field relative to a tagged pointer.
    pub fn field(&self, offset: i32) -> i32 {
        offset - self.heap_object_tag()
    }

    pub fn region_base(&self, address: u64) -> u64 {
        address & !((1u64 << self.region_size_log2) - 1)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.heap_object_tag_bit > 3 {
            return Err("heap_object_tag_bit must be below 4".to_string());
        }
        if !(3..=40).contains(&self.region_size_log2) {
            return Err(format!(
                "region_size_log2 {} must be within 3..=40",
                self.region_size_log2
            ));
        }
        for (name, bit) in [
            ("fully_marked_bit", self.fully_marked_bit),
            ("not_unique_name_bit", self.dictionary.not_unique_name_bit),
        ] {
            if bit > 63 {
                return Err(format!("{} {} is not a bit of a 64-bit word", name, bit));
            }
        }
        if self.dictionary.not_unique_name_bit > 7 {
            return Err("not_unique_name_bit must index the instance type byte".to_string());
        }

        let root_words = [
            ("marking_flag_offset", self.marking_flag_offset),
            ("store_buffer_top_offset", self.store_buffer_top_offset),
            ("store_buffer_limit_offset", self.store_buffer_limit_offset),
            ("record_write_fn_offset", self.record_write_fn_offset),
            ("store_buffer_overflow_fn_offset", self.store_buffer_overflow_fn_offset),
            ("undefined_value_offset", self.undefined_value_offset),
            ("the_hole_value_offset", self.the_hole_value_offset),
            ("region_flags_offset", self.region_flags_offset),
        ];
        for (name, offset) in root_words {
            if !(0..32768).contains(&offset) || offset % 8 != 0 {
                return Err(format!(
                    "{} {} must be 8-aligned and below 32768",
                    name, offset
                ));
            }
        }

        let d = &self.dictionary;
        let fields = [
            ("capacity_offset", d.capacity_offset),
            ("elements_start_offset", d.elements_start_offset),
            ("map_offset", d.map_offset),
            ("name_hash_offset", d.name_hash_offset),
        ];
        for (name, offset) in fields {
            if !disp_encodable(self.field(offset)) {
                return Err(format!("{} {} cannot be encoded as a load", name, offset));
            }
        }
        if !(-256..256).contains(&self.field(d.instance_type_offset)) {
            return Err(format!(
                "instance_type_offset {} cannot be encoded as a byte load",
                d.instance_type_offset
            ));
        }
        if d.hash_shift > 31 {
            return Err("hash_shift must be below 32".to_string());
        }
        Ok(())
    }
}

fn disp_encodable(disp: i32) -> bool {
    (disp >= 0 && disp % 8 == 0 && disp < 8 * 4096) || (-256..256).contains(&disp)
}

/// Complete configuration for the stub generators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StubConfig {
    /// Print stub generation and patching events to stderr
    pub trace_stubs: bool,
    pub registers: RegisterTable,
    pub layout: HeapLayout,
}

impl StubConfig {
    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        let config: StubConfig =
            toml::from_str(content).map_err(|e| format!("failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_toml_str(&content)
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("failed to serialize config: {}", e))
    }

    pub fn validate(&self) -> Result<(), String> {
        self.registers.validate()?;
        self.layout.validate()
    }
}
