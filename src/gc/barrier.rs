//! The write-barrier protocol, run directly against a [`Collector`].
//!
//! This is the behavior the generated record-write stub implements. Runtime
//! paths that store into the heap without going through generated code use
//! it as is.

use super::Collector;
use crate::stubs::key::RememberedSetAction;
use crate::stubs::patch::Mode;
use crate::stubs::record_write::OnNoNeedToInformIncrementalMarker;

/// One piece of collector work a barrier performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierStep {
    /// Append `(object, address)` to the store buffer.
    RecordStore,
    /// Call the marker with `(value, object, address)`.
    Mark,
}

/// Which way a barrier execution went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierPath {
    Done,
    RecordStore,
    Mark,
    MarkThenRecordStore,
}

impl BarrierPath {
    pub fn steps(self) -> &'static [BarrierStep] {
        match self {
            BarrierPath::Done => &[],
            BarrierPath::RecordStore => &[BarrierStep::RecordStore],
            BarrierPath::Mark => &[BarrierStep::Mark],
            BarrierPath::MarkThenRecordStore => &[BarrierStep::Mark, BarrierStep::RecordStore],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BarrierPath::Done => "done",
            BarrierPath::RecordStore => "record-store",
            BarrierPath::Mark => "mark",
            BarrierPath::MarkThenRecordStore => "mark-then-record-store",
        }
    }

    pub fn calls_marker(self) -> bool {
        self.steps().contains(&BarrierStep::Mark)
    }

    pub fn records_store(self) -> bool {
        self.steps().contains(&BarrierStep::RecordStore)
    }
}

/// The fast check failed: marking is on, the value is a heap pointer, and
/// its region still has unmarked objects.
pub fn needs_marking<C: Collector + ?Sized>(collector: &C, value: u64) -> bool {
    collector.region_is_marking_in_progress()
        && collector.value_is_heap_pointer(value)
        && !collector.region_is_fully_marked(value)
}

/// Path a barrier takes given its configuration and the fast-check result.
pub fn select_path(mode: Mode, action: RememberedSetAction, needs_marking: bool) -> BarrierPath {
    match mode {
        Mode::StoreBufferOnly => match action {
            RememberedSetAction::EmitRememberedSet => BarrierPath::RecordStore,
            RememberedSetAction::OmitRememberedSet => BarrierPath::Done,
        },
        _ if !needs_marking => match OnNoNeedToInformIncrementalMarker::for_action(action) {
            OnNoNeedToInformIncrementalMarker::ReturnOnNoNeedToInformIncrementalMarker => {
                BarrierPath::Done
            }
            OnNoNeedToInformIncrementalMarker::UpdateRememberedSetOnNoNeedToInformIncrementalMarker => {
                BarrierPath::RecordStore
            }
        },
        Mode::Incremental => BarrierPath::Mark,
        Mode::IncrementalCompaction => BarrierPath::MarkThenRecordStore,
    }
}

/// Run the barrier for a store of `value` into slot `address` of `object`.
pub fn record_write<C: Collector + ?Sized>(
    collector: &mut C,
    mode: Mode,
    action: RememberedSetAction,
    object: u64,
    address: u64,
    value: u64,
) -> BarrierPath {
    let needs_marking = mode != Mode::StoreBufferOnly && needs_marking(collector, value);
    let path = select_path(mode, action, needs_marking);

    for step in path.steps() {
        match step {
            BarrierStep::Mark => collector.mark_worklist_push(value),
            BarrierStep::RecordStore => {
                collector.store_buffer_append(object, address);
                if collector.store_buffer_is_full() {
                    collector.store_buffer_overflow();
                }
            }
        }
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::RecordingCollector;

    const OBJECT: u64 = 0x4_0001;
    const SLOT: u64 = 0x4_0010;
    const HEAP_VALUE: u64 = 0x8_0041;
    const SMI_VALUE: u64 = 0x2A << 1;

    fn collector(marking: bool) -> RecordingCollector {
        let mut c = RecordingCollector::new(18, 0);
        c.marking = marking;
        c
    }

    #[test]
    fn test_store_buffer_only_never_marks() {
        let mut c = collector(true);
        let path = record_write(
            &mut c,
            Mode::StoreBufferOnly,
            RememberedSetAction::EmitRememberedSet,
            OBJECT,
            SLOT,
            HEAP_VALUE,
        );
        assert_eq!(path, BarrierPath::RecordStore);
        assert_eq!(c.store_buffer, vec![(OBJECT, SLOT)]);
        assert!(c.worklist.is_empty());

        let path = record_write(
            &mut c,
            Mode::StoreBufferOnly,
            RememberedSetAction::OmitRememberedSet,
            OBJECT,
            SLOT,
            HEAP_VALUE,
        );
        assert_eq!(path, BarrierPath::Done);
        assert_eq!(c.store_buffer.len(), 1);
    }

    #[test]
    fn test_fast_check_conditions() {
        let mut c = collector(false);
        assert!(!needs_marking(&c, HEAP_VALUE));

        c.marking = true;
        assert!(needs_marking(&c, HEAP_VALUE));
        assert!(!needs_marking(&c, SMI_VALUE));

        c.fully_marked_regions.push(0x8_0000);
        assert!(!needs_marking(&c, HEAP_VALUE));
    }

    #[test]
    fn test_policies_when_no_marking_needed() {
        for mode in [Mode::Incremental, Mode::IncrementalCompaction] {
            let mut c = collector(false);
            let path = record_write(
                &mut c,
                mode,
                RememberedSetAction::EmitRememberedSet,
                OBJECT,
                SLOT,
                HEAP_VALUE,
            );
            assert_eq!(path, BarrierPath::RecordStore);
            assert!(c.worklist.is_empty());

            let mut c = collector(false);
            let path = record_write(
                &mut c,
                mode,
                RememberedSetAction::OmitRememberedSet,
                OBJECT,
                SLOT,
                HEAP_VALUE,
            );
            assert_eq!(path, BarrierPath::Done);
            assert!(c.store_buffer.is_empty());
        }
    }

    #[test]
    fn test_marking_paths() {
        let mut c = collector(true);
        let path = record_write(
            &mut c,
            Mode::Incremental,
            RememberedSetAction::EmitRememberedSet,
            OBJECT,
            SLOT,
            HEAP_VALUE,
        );
        assert_eq!(path, BarrierPath::Mark);
        assert_eq!(c.worklist, vec![HEAP_VALUE]);
        assert!(c.store_buffer.is_empty());

        let mut c = collector(true);
        let path = record_write(
            &mut c,
            Mode::IncrementalCompaction,
            RememberedSetAction::OmitRememberedSet,
            OBJECT,
            SLOT,
            HEAP_VALUE,
        );
        assert_eq!(path, BarrierPath::MarkThenRecordStore);
        assert_eq!(c.worklist, vec![HEAP_VALUE]);
        assert_eq!(c.store_buffer, vec![(OBJECT, SLOT)]);
    }

    #[test]
    fn test_full_buffer_overflows() {
        let mut c = collector(false);
        c.store_buffer_capacity = Some(2);
        for i in 0..5 {
            record_write(
                &mut c,
                Mode::StoreBufferOnly,
                RememberedSetAction::EmitRememberedSet,
                OBJECT,
                SLOT + 8 * i,
                SMI_VALUE,
            );
        }
        assert_eq!(c.overflows, 2);
        assert_eq!(c.drained.len(), 4);
        assert_eq!(c.store_buffer, vec![(OBJECT, SLOT + 32)]);
    }
}
