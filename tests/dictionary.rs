//! Dictionary probes run against dictionaries laid out in simulator memory.

use barrier_stubs::jit::{AArch64Assembler, CodeBuffer, Reg};
use barrier_stubs::sim::{SimHeap, Simulator};
use barrier_stubs::stubs::dictionary::{
    INLINED_PROBES, LookupMode, NameConstant, NameDictionaryLookupStub, TOTAL_PROBES,
    generate_negative_lookup, probe_index,
};
use barrier_stubs::StubConfig;

const CAPACITY: u32 = 8;
const MISS: u64 = 2;
const DONE: u64 = 1;

fn setup() -> (StubConfig, SimHeap) {
    let config = StubConfig::default();
    let heap = SimHeap::new(&config.layout).unwrap();
    (config, heap)
}

/// Inline probes for `name`, ending in `x0 = MISS` or `x0 = DONE`.
fn inline_lookup(config: &StubConfig, name: NameConstant) -> Vec<u8> {
    let mut buf = CodeBuffer::new();
    let mut asm = AArch64Assembler::new(&mut buf);
    let miss = asm.new_label();
    let done = asm.new_label();
    generate_negative_lookup(&mut asm, config, miss, done, Reg::X1, Reg::X2, name, Reg::X3)
        .unwrap();
    asm.bind(miss);
    asm.mov_imm(Reg::X0, MISS as u16);
    asm.ret();
    asm.bind(done);
    asm.mov_imm(Reg::X0, DONE as u16);
    asm.ret();
    buf.resolve_labels().unwrap();
    buf.into_code()
}

fn run_inline(config: &StubConfig, heap: &mut SimHeap, dictionary: u64, name: NameConstant) -> u64 {
    let mut sim = Simulator::new(inline_lookup(config, name));
    heap.attach(&mut sim, &config.registers).unwrap();
    sim.set_x(Reg::X2, dictionary);
    sim.call(heap).unwrap();
    // The receiver and properties registers are inputs only.
    assert_eq!(sim.x(Reg::X2), dictionary);
    sim.x(Reg::X0)
}

fn run_stub(
    config: &StubConfig,
    heap: &mut SimHeap,
    mode: LookupMode,
    dictionary: u64,
    name: NameConstant,
) -> u64 {
    let stub = NameDictionaryLookupStub::new(config, mode).unwrap();
    let mut sim = Simulator::new(stub.generate().unwrap());
    heap.attach(&mut sim, &config.registers).unwrap();
    sim.set_x(NameDictionaryLookupStub::DICTIONARY, dictionary);
    sim.set_x(NameDictionaryLookupStub::NAME, name.ptr);
    sim.call(heap).unwrap();
    sim.x(NameDictionaryLookupStub::RESULT)
}

/// Fill probe positions `positions` of `name` with other unique names.
fn occupy(heap: &mut SimHeap, dictionary: u64, name: NameConstant, positions: std::ops::Range<u32>) {
    for i in positions {
        let other = heap.alloc_name(&format!("other{}", i), true).unwrap();
        let index = probe_index(name.hash, i, CAPACITY);
        heap.set_entry_key(dictionary, index, other.ptr).unwrap();
    }
}

#[test]
fn test_empty_first_probe_is_done() {
    let (config, mut heap) = setup();
    let dict = heap.alloc_dictionary(CAPACITY).unwrap();
    let x = heap.alloc_name("x", true).unwrap();

    // Populate every slot that is not one of the first four probes.
    let probed: Vec<u32> = (0..INLINED_PROBES).map(|i| probe_index(x.hash, i, CAPACITY)).collect();
    for index in (0..CAPACITY).filter(|i| !probed.contains(i)) {
        let other = heap.alloc_name(&format!("filler{}", index), true).unwrap();
        heap.set_entry_key(dict, index, other.ptr).unwrap();
    }

    assert_eq!(run_inline(&config, &mut heap, dict, x), DONE);
    assert!(heap.marker_calls.is_empty());
    assert_eq!(run_stub(&config, &mut heap, LookupMode::Negative, dict, x), 0);
    assert_eq!(run_stub(&config, &mut heap, LookupMode::Positive, dict, x), 0);
}

#[test]
fn test_key_beyond_inlined_probes_is_miss() {
    let (config, mut heap) = setup();
    let dict = heap.alloc_dictionary(CAPACITY).unwrap();
    let x = heap.alloc_name("x", true).unwrap();
    occupy(&mut heap, dict, x, 0..6);
    heap.set_entry_key(dict, probe_index(x.hash, 6, CAPACITY), x.ptr)
        .unwrap();

    assert_eq!(run_inline(&config, &mut heap, dict, x), MISS);
    // The out-of-line lookup settles it.
    assert_eq!(run_stub(&config, &mut heap, LookupMode::Negative, dict, x), 1);
    assert_eq!(run_stub(&config, &mut heap, LookupMode::Positive, dict, x), 1);
}

#[test]
fn test_inline_probe_outcomes() {
    let (config, mut heap) = setup();
    let x = heap.alloc_name("x", true).unwrap();

    // Present in the first probe
    let dict = heap.alloc_dictionary(CAPACITY).unwrap();
    heap.dictionary_add(dict, x).unwrap();
    assert_eq!(run_inline(&config, &mut heap, dict, x), MISS);

    // A non-unique key might equal the name
    let dict = heap.alloc_dictionary(CAPACITY).unwrap();
    let string = heap.alloc_name("not-internalized", false).unwrap();
    heap.set_entry_key(dict, probe_index(x.hash, 0, CAPACITY), string.ptr)
        .unwrap();
    assert_eq!(run_inline(&config, &mut heap, dict, x), MISS);

    // Deleted entries are skipped, then an empty one ends the search
    let dict = heap.alloc_dictionary(CAPACITY).unwrap();
    for i in 0..2 {
        let index = probe_index(x.hash, i, CAPACITY);
        heap.dictionary_delete(dict, index).unwrap();
    }
    assert_eq!(run_inline(&config, &mut heap, dict, x), DONE);

    // Every inlined probe occupied by another unique name
    let dict = heap.alloc_dictionary(CAPACITY).unwrap();
    occupy(&mut heap, dict, x, 0..INLINED_PROBES);
    assert_eq!(run_inline(&config, &mut heap, dict, x), MISS);
}

#[test]
fn test_full_lookup_modes() {
    let (config, mut heap) = setup();
    let x = heap.alloc_name("x", true).unwrap();
    let dict = heap.alloc_dictionary(CAPACITY).unwrap();

    for mode in [LookupMode::Negative, LookupMode::Positive] {
        assert_eq!(run_stub(&config, &mut heap, mode, dict, x), 0, "{:?}", mode);
    }

    heap.dictionary_add(dict, x).unwrap();
    for mode in [LookupMode::Negative, LookupMode::Positive] {
        assert_eq!(run_stub(&config, &mut heap, mode, dict, x), 1, "{:?}", mode);
    }
}

#[test]
fn test_undecided_lookup_answers_by_mode() {
    let (config, mut heap) = setup();
    let x = heap.alloc_name("x", true).unwrap();

    // Only deleted entries: the probes run out without an answer.
    let dict = heap.alloc_dictionary(CAPACITY).unwrap();
    for index in 0..CAPACITY {
        heap.dictionary_delete(dict, index).unwrap();
    }
    assert!(TOTAL_PROBES > CAPACITY);
    assert_eq!(run_stub(&config, &mut heap, LookupMode::Negative, dict, x), 1);
    assert_eq!(run_stub(&config, &mut heap, LookupMode::Positive, dict, x), 0);

    // A non-unique key stops a negative lookup, but a positive one probes on.
    let dict = heap.alloc_dictionary(CAPACITY).unwrap();
    let string = heap.alloc_name("not-internalized", false).unwrap();
    heap.set_entry_key(dict, probe_index(x.hash, 0, CAPACITY), string.ptr)
        .unwrap();
    assert_eq!(run_stub(&config, &mut heap, LookupMode::Negative, dict, x), 1);
    assert_eq!(run_stub(&config, &mut heap, LookupMode::Positive, dict, x), 0);
}

#[test]
fn test_stub_reads_hash_from_name() {
    let (config, mut heap) = setup();
    let dict = heap.alloc_dictionary(64).unwrap();
    let names: Vec<NameConstant> = ["a", "b", "length", "prototype", "constructor"]
        .iter()
        .map(|n| heap.alloc_name(n, true).unwrap())
        .collect();
    for name in &names[..3] {
        heap.dictionary_add(dict, *name).unwrap();
    }

    for (i, name) in names.iter().enumerate() {
        let expected = (i < 3) as u64;
        assert_eq!(
            run_stub(&config, &mut heap, LookupMode::Positive, dict, *name),
            expected,
            "{}",
            i
        );
    }
}
