//! Stub generation and patching events.
//!
//! Events go to stderr with a `[STUB]` prefix when tracing is switched on in
//! the configuration. Builds with the `tracing` feature also emit them as
//! `tracing` debug events.

use crate::stubs::patch::Mode;

/// A stub was generated.
pub fn stub_generated(enabled: bool, name: &str, key: u32, bytes: usize) {
    if enabled {
        eprintln!("[STUB] Generated {} (key: {:#x}, {} bytes)", name, key, bytes);
    }
    #[cfg(feature = "tracing")]
    tracing::debug!(stub = name, key, bytes, "stub_generated");
}

/// A stub request was rejected before any code was emitted.
pub fn stub_rejected(enabled: bool, name: &str, error: &dyn std::fmt::Display) {
    if enabled {
        eprintln!("[STUB] Rejected {}: {}", name, error);
    }
    #[cfg(feature = "tracing")]
    tracing::debug!(stub = name, error = %error, "stub_rejected");
}

/// A barrier's mode slot was rewritten.
pub fn mode_patched(enabled: bool, from: Mode, to: Mode) {
    if enabled {
        eprintln!("[STUB] Patched barrier mode: {} -> {}", from, to);
    }
    #[cfg(feature = "tracing")]
    tracing::debug!(from = %from, to = %to, "mode_patched");
}

/// The marking controller changed phase.
pub fn phase_changed(enabled: bool, phase: &str, stubs: usize) {
    if enabled {
        eprintln!("[STUB] Marking phase {} ({} stubs patched)", phase, stubs);
    }
    #[cfg(feature = "tracing")]
    tracing::debug!(phase, stubs, "phase_changed");
}
