//! Mode switching on generated barriers: in byte buffers, in installed
//! executable memory, and while the simulator is inside a barrier.

use barrier_stubs::gc::marking::{IncrementalMarking, MarkingPhase};
use barrier_stubs::jit::{MemoryError, Reg};
use barrier_stubs::sim::{SimHeap, Simulator};
use barrier_stubs::stubs::key::{RememberedSetAction, SaveFpRegsMode};
use barrier_stubs::stubs::patch::{MODE_SLOT_OFFSET, PatchableCode, mode_slot_word};
use barrier_stubs::stubs::record_write::RecordWriteStub;
use barrier_stubs::stubs::{CodeStub, StubError};
use barrier_stubs::{Mode, StubConfig, get_mode, patch};

fn all_stubs() -> Vec<CodeStub> {
    let config = StubConfig::default();
    let mut stubs = Vec::new();
    for action in [
        RememberedSetAction::EmitRememberedSet,
        RememberedSetAction::OmitRememberedSet,
    ] {
        for fp in [SaveFpRegsMode::DontSaveFpRegs, SaveFpRegsMode::SaveFpRegs] {
            for (object, value, address) in [(1, 3, 2), (0, 1, 2), (19, 4, 5)] {
                let stub = RecordWriteStub::new(&config, object, value, address, action, fp).unwrap();
                stubs.push(CodeStub::RecordWrite(stub));
            }
        }
    }
    stubs
}

/// A fixed walk through the modes that takes every transition.
const WALK: [Mode; 10] = [
    Mode::Incremental,
    Mode::IncrementalCompaction,
    Mode::StoreBufferOnly,
    Mode::IncrementalCompaction,
    Mode::Incremental,
    Mode::Incremental,
    Mode::StoreBufferOnly,
    Mode::StoreBufferOnly,
    Mode::IncrementalCompaction,
    Mode::IncrementalCompaction,
];

#[test]
fn test_patch_round_trips_and_keeps_length() {
    for stub in all_stubs() {
        let original = stub.generate().unwrap().code;
        let mut code = original.clone();
        assert_eq!(get_mode(&code).unwrap(), Mode::StoreBufferOnly);

        let mut current = Mode::StoreBufferOnly;
        for mode in WALK {
            assert_eq!(patch(&mut code, mode).unwrap(), current);
            assert_eq!(get_mode(&code).unwrap(), mode);
            assert_eq!(code.len(), original.len());
            assert_eq!(code[MODE_SLOT_OFFSET + 4..], original[MODE_SLOT_OFFSET + 4..]);
            current = mode;
        }

        patch(&mut code, Mode::StoreBufferOnly).unwrap();
        assert_eq!(code, original);
    }
}

#[test]
fn test_slot_word_depends_only_on_mode() {
    for stub in all_stubs() {
        let mut code = stub.generate().unwrap();
        for mode in Mode::ALL {
            let expected = mode_slot_word(&code, mode).unwrap();
            stub.activate(&mut code, mode).unwrap();
            assert_eq!(code.read_word(MODE_SLOT_OFFSET), Some(expected));
        }
    }
}

#[test]
fn test_in_flight_barrier_finishes_entered_mode() {
    let config = StubConfig::default();
    let stub = RecordWriteStub::new(
        &config,
        1,
        3,
        2,
        RememberedSetAction::OmitRememberedSet,
        SaveFpRegsMode::DontSaveFpRegs,
    )
    .unwrap();
    let mut code = stub.generate().unwrap();
    patch(&mut code, Mode::Incremental).unwrap();

    let mut heap = SimHeap::new(&config.layout).unwrap();
    heap.set_marking(true);
    let object = heap.alloc(32).unwrap();
    heap.new_region();
    let value = heap.alloc(32).unwrap();
    let slot = heap.field_address(object, 8);

    let mut sim = Simulator::new(code);
    heap.attach(&mut sim, &config.registers).unwrap();
    sim.set_x(Reg::X1, object);
    sim.set_x(Reg::X2, slot);
    sim.set_x(Reg::X3, value);
    sim.prepare_call();

    // Take the mode-slot branch, then switch marking off underneath.
    sim.step(&mut heap).unwrap();
    patch(sim.code_mut(), Mode::StoreBufferOnly).unwrap();
    sim.run(&mut heap).unwrap();

    assert_eq!(heap.marker_calls, vec![(value, object, slot)]);
    assert_eq!(get_mode(sim.code()).unwrap(), Mode::StoreBufferOnly);

    // The next entry sees the new mode.
    heap.marker_calls.clear();
    sim.set_x(Reg::X3, value);
    sim.call(&mut heap).unwrap();
    assert!(heap.marker_calls.is_empty());
}

#[test]
fn test_installed_barrier_is_patchable() {
    let stubs = all_stubs();
    let stub = &stubs[0];
    let generated = stub.generate().unwrap();
    let memory = match generated.install() {
        Ok(memory) => memory,
        // Hosts that forbid writable+executable mappings
        Err(StubError::Memory(MemoryError::ProtectionFailed)) => return,
        Err(e) => panic!("install failed: {}", e),
    };
    assert!(memory.is_executable());
    assert!(memory.is_patchable());

    std::thread::scope(|scope| {
        let reader = scope.spawn(|| {
            for _ in 0..10_000 {
                // Every observed slot decodes to a valid mode.
                get_mode(&memory).unwrap();
            }
        });

        let mut handle = &memory;
        for mode in WALK.iter().cycle().take(1_000) {
            patch(&mut handle, *mode).unwrap();
        }
        reader.join().unwrap();
    });

    let mut handle = &memory;
    patch(&mut handle, Mode::StoreBufferOnly).unwrap();
    assert_eq!(memory.to_vec(), generated.code);
}

#[test]
fn test_marking_cycle_patches_every_barrier() {
    let stubs = all_stubs();
    let mut codes: Vec<Vec<u8>> = stubs.iter().map(|s| s.generate().unwrap().code).collect();
    let mut marking = IncrementalMarking::default();

    {
        let mut targets: Vec<&mut dyn PatchableCode> =
            codes.iter_mut().map(|c| c as &mut dyn PatchableCode).collect();
        let patched = marking.start(true, &mut targets).unwrap();
        assert_eq!(patched, stubs.len());
    }
    assert_eq!(marking.phase(), MarkingPhase::MarkingWithCompaction);
    for code in &codes {
        assert_eq!(get_mode(code).unwrap(), Mode::IncrementalCompaction);
    }

    // A barrier generated mid-cycle joins in the current mode.
    let late = &stubs[1];
    let mut late_code = late.generate().unwrap();
    marking.activate_generated_stub(late, &mut late_code).unwrap();
    assert_eq!(get_mode(&late_code).unwrap(), Mode::IncrementalCompaction);

    {
        let mut targets: Vec<&mut dyn PatchableCode> =
            codes.iter_mut().map(|c| c as &mut dyn PatchableCode).collect();
        targets.push(&mut late_code);
        marking.stop(&mut targets).unwrap();
    }
    for code in &codes {
        assert_eq!(get_mode(code).unwrap(), Mode::StoreBufferOnly);
    }
    assert_eq!(get_mode(&late_code).unwrap(), Mode::StoreBufferOnly);
    assert_eq!(marking.stats().cycles, 1);
}
