//! Machine-code infrastructure for stub generation.
//!
//! This module provides the foundation the stub generators build on:
//! - Executable memory allocation and in-place word patching
//! - Code buffer with label resolution
//! - AArch64 instruction encoding

pub mod aarch64;
pub mod codebuf;
pub mod memory;

pub use aarch64::{AArch64Assembler, Cond, FpReg, Reg};
pub use codebuf::{CodeBuffer, CodeBufferError, Label};
pub use memory::{ExecutableMemory, MemoryError};
