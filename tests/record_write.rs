//! Generated record-write barriers run in the simulator and are compared
//! against the reference barrier on a clone of the same heap.

use barrier_stubs::gc::barrier::{self, BarrierPath};
use barrier_stubs::jit::Reg;
use barrier_stubs::sim::heap::STACK_TOP;
use barrier_stubs::sim::{SimHeap, Simulator};
use barrier_stubs::stubs::record_write::RecordWriteStub;
use barrier_stubs::{Mode, RecordWriteKey, RememberedSetAction, SaveFpRegsMode, StubConfig, patch};

const ACTIONS: [RememberedSetAction; 2] = [
    RememberedSetAction::EmitRememberedSet,
    RememberedSetAction::OmitRememberedSet,
];

#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Smi,
    Unmarked,
    FullyMarked,
}

const VALUES: [Value; 3] = [Value::Smi, Value::Unmarked, Value::FullyMarked];

#[derive(Debug, Clone, Copy)]
struct Case {
    object: u8,
    value: u8,
    address: u8,
    action: RememberedSetAction,
    fp: SaveFpRegsMode,
    mode: Mode,
    marking: bool,
    kind: Value,
}

impl Case {
    fn new(mode: Mode, action: RememberedSetAction, marking: bool, kind: Value) -> Self {
        Self {
            object: 1,
            value: 3,
            address: 2,
            action,
            fp: SaveFpRegsMode::DontSaveFpRegs,
            mode,
            marking,
            kind,
        }
    }

    fn registers(mut self, object: u8, value: u8, address: u8) -> Self {
        self.object = object;
        self.value = value;
        self.address = address;
        self
    }
}

struct Outcome {
    heap: SimHeap,
    reference: SimHeap,
    path: BarrierPath,
    sim: Simulator,
    /// Register file before the call, x0-x30
    before: Vec<u64>,
    fp_before: Vec<u64>,
    object: u64,
    slot: u64,
    value: u64,
    steps: usize,
}

fn reg(code: u8) -> Reg {
    Reg::from_code(code).unwrap()
}

fn heap_for(config: &StubConfig, case: &Case, store_buffer: usize) -> (SimHeap, u64, u64, u64) {
    let mut heap = SimHeap::with_store_buffer(&config.layout, store_buffer).unwrap();
    heap.set_marking(case.marking);
    let object = heap.alloc(64).unwrap();
    let slot = heap.field_address(object, 16);
    let value = match case.kind {
        Value::Smi => 0x2A << 1,
        Value::Unmarked | Value::FullyMarked => {
            heap.new_region();
            let value = heap.alloc(32).unwrap();
            if case.kind == Value::FullyMarked {
                heap.set_region_fully_marked(value, true).unwrap();
            }
            value
        }
    };
    (heap, object, slot, value)
}

fn run(case: Case) -> Outcome {
    let config = StubConfig::default();
    let stub = RecordWriteStub::new(
        &config,
        case.object,
        case.value,
        case.address,
        case.action,
        case.fp,
    )
    .unwrap();
    let mut code = stub.generate().unwrap();
    patch(&mut code, case.mode).unwrap();

    let (mut heap, object, slot, value) = heap_for(&config, &case, 64);
    let mut reference = heap.clone();
    let path = barrier::record_write(&mut reference, case.mode, case.action, object, slot, value);

    let mut sim = Simulator::new(code);
    for r in 0..=28u8 {
        sim.set_x(reg(r), 0x5EED_0000 + r as u64);
    }
    for d in 0..32u8 {
        sim.set_d(d, 0x4000_0000_0000_0000 | d as u64);
    }
    heap.attach(&mut sim, &config.registers).unwrap();
    sim.set_x(reg(case.object), object);
    sim.set_x(reg(case.address), slot);
    sim.set_x(reg(case.value), value);
    let before: Vec<u64> = (0..=30u8).map(|r| sim.x(reg(r))).collect();
    let fp_before: Vec<u64> = (0..32u8).map(|d| sim.d(d)).collect();

    let steps = sim.call(&mut heap).unwrap();

    Outcome {
        heap,
        reference,
        path,
        sim,
        before,
        fp_before,
        object,
        slot,
        value,
        steps,
    }
}

fn assert_matches_reference(case: &Case, out: &Outcome) {
    assert_eq!(out.heap.worklist, out.reference.worklist, "{:?}", case);
    assert_eq!(
        out.heap.store_buffer_entries(),
        out.reference.store_buffer_entries(),
        "{:?}",
        case
    );
    assert_eq!(out.heap.drained, out.reference.drained, "{:?}", case);
    assert_eq!(out.heap.overflows, out.reference.overflows, "{:?}", case);
}

/// Everything but the value register, the assembler temporaries, and the
/// link register survives the barrier.
fn assert_registers_preserved(case: &Case, out: &Outcome) {
    let config = StubConfig::default();
    for r in 0..=29u8 {
        if r == case.value || config.registers.assembler_temps.contains(&r) {
            continue;
        }
        assert_eq!(
            out.sim.x(reg(r)),
            out.before[r as usize],
            "x{} clobbered in {:?}",
            r,
            case
        );
    }
    assert_eq!(out.sim.sp(), STACK_TOP, "{:?}", case);
}

#[test]
fn test_matches_reference_in_every_configuration() {
    for mode in Mode::ALL {
        for action in ACTIONS {
            for marking in [false, true] {
                for kind in VALUES {
                    let case = Case::new(mode, action, marking, kind);
                    let out = run(case);
                    assert_matches_reference(&case, &out);
                    assert_registers_preserved(&case, &out);

                    assert_eq!(
                        out.heap.marker_calls.len(),
                        out.path.calls_marker() as usize,
                        "{:?}",
                        case
                    );
                    assert_eq!(
                        out.heap.store_buffer_entries().len(),
                        out.path.records_store() as usize,
                        "{:?}",
                        case
                    );
                }
            }
        }
    }
}

#[test]
fn test_store_buffer_only_records_exactly_once() {
    for marking in [false, true] {
        for kind in VALUES {
            let case = Case::new(
                Mode::StoreBufferOnly,
                RememberedSetAction::EmitRememberedSet,
                marking,
                kind,
            );
            let out = run(case);
            assert_eq!(out.path, BarrierPath::RecordStore);
            assert_eq!(out.heap.store_buffer_entries(), vec![(out.object, out.slot)]);
            assert!(out.heap.marker_calls.is_empty());
        }
    }
}

#[test]
fn test_omit_in_store_buffer_only_mode_returns_at_once() {
    let case = Case::new(
        Mode::StoreBufferOnly,
        RememberedSetAction::OmitRememberedSet,
        true,
        Value::Unmarked,
    );
    let out = run(case);
    assert_eq!(out.path, BarrierPath::Done);
    // nop, two header words, ret
    assert_eq!(out.steps, 4);
    assert!(out.heap.store_buffer_entries().is_empty());
}

#[test]
fn test_fast_check_skips_marker() {
    for mode in [Mode::Incremental, Mode::IncrementalCompaction] {
        for (marking, kind) in [
            (false, Value::Unmarked),
            (true, Value::Smi),
            (true, Value::FullyMarked),
        ] {
            let case = Case::new(mode, RememberedSetAction::EmitRememberedSet, marking, kind);
            let out = run(case);
            assert!(out.heap.marker_calls.is_empty(), "{:?}", case);
            assert_eq!(out.heap.store_buffer_entries().len(), 1, "{:?}", case);

            let case = Case::new(mode, RememberedSetAction::OmitRememberedSet, marking, kind);
            let out = run(case);
            assert!(out.heap.marker_calls.is_empty(), "{:?}", case);
            assert!(out.heap.store_buffer_entries().is_empty(), "{:?}", case);
        }
    }
}

#[test]
fn test_marking_paths() {
    let case = Case::new(
        Mode::Incremental,
        RememberedSetAction::EmitRememberedSet,
        true,
        Value::Unmarked,
    );
    let out = run(case);
    assert_eq!(out.path, BarrierPath::Mark);
    assert_eq!(out.heap.marker_calls, vec![(out.value, out.object, out.slot)]);
    assert!(out.heap.store_buffer_entries().is_empty());

    let case = Case::new(
        Mode::IncrementalCompaction,
        RememberedSetAction::OmitRememberedSet,
        true,
        Value::Unmarked,
    );
    let out = run(case);
    assert_eq!(out.path, BarrierPath::MarkThenRecordStore);
    assert_eq!(out.heap.marker_calls.len(), 1);
    assert_eq!(out.heap.store_buffer_entries(), vec![(out.object, out.slot)]);
}

#[test]
fn test_marker_arguments_survive_register_cycles() {
    // Every input already sits in an argument register, in rotated order.
    let assignments = [(1, 0, 2), (2, 1, 0), (0, 2, 1), (19, 20, 21), (2, 0, 1), (5, 1, 0)];
    for (object, value, address) in assignments {
        for mode in [Mode::Incremental, Mode::IncrementalCompaction] {
            let case = Case::new(mode, RememberedSetAction::EmitRememberedSet, true, Value::Unmarked)
                .registers(object, value, address);
            let out = run(case);
            assert_eq!(
                out.heap.marker_calls,
                vec![(out.value, out.object, out.slot)],
                "{:?}",
                case
            );
            assert_matches_reference(&case, &out);
            assert_registers_preserved(&case, &out);
        }
    }
}

#[test]
fn test_fp_registers() {
    let mut case = Case::new(
        Mode::Incremental,
        RememberedSetAction::EmitRememberedSet,
        true,
        Value::Unmarked,
    );
    case.fp = SaveFpRegsMode::SaveFpRegs;
    let out = run(case);
    assert_eq!(out.heap.marker_calls.len(), 1);
    for d in 0..32u8 {
        assert_eq!(out.sim.d(d), out.fp_before[d as usize], "d{}", d);
    }

    case.fp = SaveFpRegsMode::DontSaveFpRegs;
    let out = run(case);
    assert_ne!(out.sim.d(0), out.fp_before[0]);
    // Callee-saved FP registers are never touched.
    assert_eq!(out.sim.d(8), out.fp_before[8]);
}

#[test]
fn test_overflow_calls_runtime() {
    let config = StubConfig::default();
    for mode in Mode::ALL {
        let case = Case::new(mode, RememberedSetAction::EmitRememberedSet, false, Value::Smi);
        let stub = RecordWriteStub::new(&config, 1, 3, 2, case.action, case.fp).unwrap();
        let mut code = stub.generate().unwrap();
        patch(&mut code, mode).unwrap();

        let (mut heap, object, _, value) = heap_for(&config, &case, 2);
        let mut reference = heap.clone();
        let mut sim = Simulator::new(code);
        heap.attach(&mut sim, &config.registers).unwrap();

        for i in 0..5 {
            let slot = heap.field_address(object, 8 * i);
            sim.set_x(Reg::X1, object);
            sim.set_x(Reg::X2, slot);
            sim.set_x(Reg::X3, value);
            sim.call(&mut heap).unwrap();
            barrier::record_write(&mut reference, mode, case.action, object, slot, value);
        }

        assert_eq!(heap.overflows, 2, "{}", mode);
        assert_eq!(heap.drained.len(), 4, "{}", mode);
        assert_eq!(heap.store_buffer_entries().len(), 1, "{}", mode);
        assert_eq!(heap.drained, reference.drained);
        assert_eq!(heap.store_buffer_entries(), reference.store_buffer_entries());
        assert_eq!(sim.x(Reg::X1), object);
    }
}

#[test]
fn test_minor_key_round_trip() {
    let key = RecordWriteKey::new(
        1,
        3,
        2,
        RememberedSetAction::EmitRememberedSet,
        SaveFpRegsMode::DontSaveFpRegs,
    )
    .unwrap();
    assert_eq!(key.encode(), 0x861);
    assert_eq!(RecordWriteKey::decode(0x861).unwrap(), key);

    let stub = RecordWriteStub::from_minor_key(&StubConfig::default(), 0x861).unwrap();
    assert_eq!(stub.key(), key);
    assert_eq!(stub.plan().object(), Reg::X1);
    assert_eq!(stub.plan().scratch0(), Reg::X3);
    assert_eq!(stub.plan().address(), Reg::X2);
}
