//! barrier-stubs - AArch64 write-barrier and dictionary-probe stubs
//!
//! This library generates the record-write barrier a garbage-collected
//! runtime runs after heap stores, switches installed barriers between
//! their three modes by patching one instruction, and emits the probes used
//! to prove a name absent from a property dictionary.

pub mod config;
pub mod gc;
pub mod jit;
pub mod sim;
pub mod stubs;
pub mod trace;

// Re-export commonly used types
pub use config::{HeapLayout, RegisterTable, StubConfig};
pub use gc::Collector;
pub use gc::marking::{IncrementalMarking, MarkingPhase};
pub use stubs::key::{RecordWriteKey, RememberedSetAction, SaveFpRegsMode};
pub use stubs::patch::{Mode, PatchError, PatchableCode, get_mode, patch};
pub use stubs::{CodeStub, GeneratedStub, MajorKey, StubError};
