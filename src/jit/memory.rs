//! Executable memory management using mmap.
//!
//! This module provides a safe abstraction over OS-level memory mapping
//! for allocating memory that can be written to and then executed.
//!
//! Barrier stubs are rewritten in place while other threads may be running
//! them, so their pages are mapped read/write/execute and only ever modified
//! through [`ExecutableMemory::patch_word`], which replaces one aligned
//! 32-bit instruction with a single atomic store.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// Error type for memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    AllocationFailed,
    ProtectionFailed,
    InvalidSize,
    MisalignedPatch,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::InvalidSize => write!(f, "invalid memory size"),
            MemoryError::MisalignedPatch => write!(f, "patch offset is not instruction aligned"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// A block of executable memory allocated via mmap.
///
/// Regular memory is initially writable; call `make_executable()` to make
/// it executable (and read-only) before calling the generated code.
/// Patchable memory is writable and executable for its whole lifetime.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    /// Number of code bytes actually written
    len: usize,
    executable: bool,
    patchable: bool,
}

impl ExecutableMemory {
    /// Allocate a new block of memory with the given size.
    /// The memory is initially writable but not executable.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        Self::allocate(size, false)
    }

    /// Allocate a block that stays writable after it becomes executable.
    pub fn new_patchable(size: usize) -> Result<Self, MemoryError> {
        Self::allocate(size, true)
    }

    /// Copy `code` into fresh memory and make it executable.
    pub fn from_code(code: &[u8], patchable: bool) -> Result<Self, MemoryError> {
        let mut mem = Self::allocate(code.len(), patchable)?;
        mem.write(0, code)?;
        mem.make_executable()?;
        Ok(mem)
    }

    fn allocate(size: usize, patchable: bool) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        // Round up to page size
        let page_size = Self::page_size();
        let aligned_size = (size + page_size - 1) & !(page_size - 1);

        let ptr = Self::mmap_alloc(aligned_size)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            len: 0,
            executable: false,
            patchable,
        })
    }

    /// Get the page size for the current system.
    fn page_size() -> usize {
        #[cfg(unix)]
        {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    /// Allocate memory using mmap.
    #[cfg(unix)]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        use std::ptr;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        // Note: This won't actually be executable on most systems
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    /// Get a pointer to the memory.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Get the size of the allocated memory.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of code bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if no code has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check whether this block supports in-place patching.
    pub fn is_patchable(&self) -> bool {
        self.patchable
    }

    /// Write bytes to the memory at the given offset.
    /// Returns an error if the memory is executable or if the write would overflow.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }

        if offset + data.len() > self.size {
            return Err(MemoryError::InvalidSize);
        }

        unsafe {
            let dest = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        }

        self.len = self.len.max(offset + data.len());
        Ok(())
    }

    /// Read the instruction word at `offset`.
    pub fn read_word(&self, offset: usize) -> Result<u32, MemoryError> {
        let word = self.word_ref(offset)?;
        Ok(word.load(Ordering::Acquire))
    }

    /// Atomically replace the instruction word at `offset`.
    ///
    /// Concurrent readers and executing threads observe either the old or
    /// the new word. Fails on executable memory that was not allocated as
    /// patchable.
    pub fn patch_word(&self, offset: usize, word: u32) -> Result<(), MemoryError> {
        if self.executable && !self.patchable {
            return Err(MemoryError::ProtectionFailed);
        }
        let slot = self.word_ref(offset)?;
        slot.store(word, Ordering::Release);
        // SAFETY: the word lies inside our mapping
        unsafe { flush_icache(self.ptr.as_ptr().add(offset), 4) };
        Ok(())
    }

    fn word_ref(&self, offset: usize) -> Result<&AtomicU32, MemoryError> {
        if offset % 4 != 0 {
            return Err(MemoryError::MisalignedPatch);
        }
        if offset + 4 > self.len {
            return Err(MemoryError::InvalidSize);
        }
        // SAFETY: the mapping is page aligned, so a 4-aligned offset gives a
        // 4-aligned address inside the live mapping; all mutation of code
        // words after writing goes through atomics.
        Ok(unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU32) })
    }

    /// Make the memory executable.
    ///
    /// Regular memory becomes read-only; patchable memory stays writable.
    #[cfg(unix)]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }

        let mut prot = libc::PROT_READ | libc::PROT_EXEC;
        if self.patchable {
            prot |= libc::PROT_WRITE;
        }

        let result =
            unsafe { libc::mprotect(self.ptr.as_ptr() as *mut libc::c_void, self.size, prot) };

        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }

        // SAFETY: the whole mapping belongs to us
        unsafe { flush_icache(self.ptr.as_ptr(), self.len) };
        self.executable = true;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        // On non-Unix systems, we can't change protection
        self.executable = true;
        Ok(())
    }

    /// Check if the memory is executable.
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Copy the written code out of the mapping.
    pub fn to_vec(&self) -> Vec<u8> {
        (0..self.len / 4)
            .flat_map(|i| {
                let word = self.word_ref(i * 4).map(|w| w.load(Ordering::Acquire)).unwrap_or(0);
                word.to_le_bytes()
            })
            .collect()
    }
}

/// Make freshly written instructions visible to instruction fetch.
///
/// # Safety
/// `start..start + len` must lie inside a live mapping.
#[cfg(target_arch = "aarch64")]
unsafe fn flush_icache(start: *const u8, len: usize) {
    use std::arch::asm;

    const LINE: usize = 64;
    let begin = start as usize & !(LINE - 1);
    let end = start as usize + len;
    unsafe {
        let mut addr = begin;
        while addr < end {
            asm!("dc cvau, {0}", in(reg) addr, options(nostack));
            addr += LINE;
        }
        asm!("dsb ish", options(nostack));
        addr = begin;
        while addr < end {
            asm!("ic ivau, {0}", in(reg) addr, options(nostack));
            addr += LINE;
        }
        asm!("dsb ish", "isb", options(nostack));
    }
}

/// Instruction caches are coherent with data writes on other targets.
#[cfg(not(target_arch = "aarch64"))]
unsafe fn flush_icache(_start: *const u8, _len: usize) {}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            }
        }
        #[cfg(not(unix))]
        {
            if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, Self::page_size()) {
                unsafe {
                    std::alloc::dealloc(self.ptr.as_ptr(), layout);
                }
            }
        }
    }
}

// ExecutableMemory is Send and Sync because it owns its memory and all
// mutation after construction goes through atomic word stores
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}
