//! Incremental marking control.
//!
//! Switching the collector between phases means switching every installed
//! barrier to the matching mode. Barriers generated while a phase is active
//! are activated into that phase's mode before they are first run.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::stubs::CodeStub;
use crate::stubs::patch::{self, MODE_SLOT_OFFSET, Mode, PatchError, PatchableCode};
use crate::trace;

/// Collector phase as far as the write barrier is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkingPhase {
    /// No marking in progress
    Idle,
    /// Incremental marking
    Marking,
    /// Incremental marking with evacuation of selected regions
    MarkingWithCompaction,
}

impl MarkingPhase {
    pub fn name(self) -> &'static str {
        match self {
            MarkingPhase::Idle => "idle",
            MarkingPhase::Marking => "marking",
            MarkingPhase::MarkingWithCompaction => "marking-with-compaction",
        }
    }
}

/// Statistics for phase changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkingStats {
    /// Completed marking cycles (start followed by stop)
    pub cycles: usize,
    /// Mode slots rewritten
    pub patches: usize,
}

pub struct IncrementalMarking {
    phase: MarkingPhase,
    /// Whether a marking phase is active. The collector publishes this to
    /// the root-table marking flag that generated barriers test.
    marking: AtomicBool,
    patches: AtomicUsize,
    cycles: usize,
    trace: bool,
}

impl IncrementalMarking {
    pub fn new(trace: bool) -> Self {
        Self {
            phase: MarkingPhase::Idle,
            marking: AtomicBool::new(false),
            patches: AtomicUsize::new(0),
            cycles: 0,
            trace,
        }
    }

    pub fn phase(&self) -> MarkingPhase {
        self.phase
    }

    /// Barrier mode for the current phase.
    pub fn mode(&self) -> Mode {
        Mode::for_phase(self.phase)
    }

    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> MarkingStats {
        MarkingStats {
            cycles: self.cycles,
            patches: self.patches.load(Ordering::Relaxed),
        }
    }

    /// Enter marking and switch `stubs` to the incremental barrier.
    pub fn start(
        &mut self,
        compacting: bool,
        stubs: &mut [&mut dyn PatchableCode],
    ) -> Result<usize, PatchError> {
        let phase = if compacting {
            MarkingPhase::MarkingWithCompaction
        } else {
            MarkingPhase::Marking
        };
        let patched = self.enter(phase, stubs)?;
        self.marking.store(true, Ordering::Release);
        Ok(patched)
    }

    /// Leave marking and return `stubs` to store-buffer-only mode.
    pub fn stop(&mut self, stubs: &mut [&mut dyn PatchableCode]) -> Result<usize, PatchError> {
        let was_marking = self.phase != MarkingPhase::Idle;
        let patched = self.enter(MarkingPhase::Idle, stubs)?;
        self.marking.store(false, Ordering::Release);
        if was_marking {
            self.cycles += 1;
        }
        Ok(patched)
    }

    /// Patch every stub into the mode for `phase`. Returns how many slots
    /// changed.
    ///
    /// Either every stub ends up in the new mode or none does: all slots are
    /// decoded before the first write, and a failed write restores the slots
    /// already written.
    fn enter(
        &mut self,
        phase: MarkingPhase,
        stubs: &mut [&mut dyn PatchableCode],
    ) -> Result<usize, PatchError> {
        let mode = Mode::for_phase(phase);

        // (stub index, previous mode, old word, new word)
        let mut pending = Vec::new();
        for (i, stub) in stubs.iter().enumerate() {
            let previous = patch::get_mode(&**stub)?;
            if previous != mode {
                let old = patch::mode_slot_word(&**stub, previous)?;
                let new = patch::mode_slot_word(&**stub, mode)?;
                pending.push((i, previous, old, new));
            }
        }

        for (done, &(i, _, _, new)) in pending.iter().enumerate() {
            if let Err(e) = stubs[i].replace_word(MODE_SLOT_OFFSET, new) {
                for &(j, _, old, _) in &pending[..done] {
                    // Best effort
                    let _ = stubs[j].replace_word(MODE_SLOT_OFFSET, old);
                }
                return Err(e);
            }
        }

        for &(_, previous, _, _) in &pending {
            trace::mode_patched(self.trace, previous, mode);
        }
        let patched = pending.len();
        self.phase = phase;
        self.patches.fetch_add(patched, Ordering::Relaxed);
        trace::phase_changed(self.trace, phase.name(), patched);
        Ok(patched)
    }

    /// Bring a freshly generated stub into the current mode.
    pub fn activate_generated_stub<C: PatchableCode + ?Sized>(
        &self,
        stub: &CodeStub,
        code: &mut C,
    ) -> Result<(), PatchError> {
        let before = patch::get_mode(&*code).ok();
        stub.activate(code, self.mode())?;
        if before.is_some_and(|m| m != self.mode()) {
            self.patches.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl Default for IncrementalMarking {
    fn default() -> Self {
        Self::new(false)
    }
}
