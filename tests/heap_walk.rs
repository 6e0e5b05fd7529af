//! End-to-end heap walks over synthetic images.

use std::collections::HashSet;

use heapscope::prelude::*;

struct Scenario {
    runtime: ClrRuntime,
    holder_mt: u64,
    plain_mt: u64,
}

/// Three 64-byte objects in the ephemeral segment, one 256-byte object on the large
/// object heap referencing the first two.
fn scenario() -> Scenario {
    let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
    let plain_mt = builder.method_table(TypeSpec::class("App.Plain", 64));
    let holder_mt =
        builder.method_table(TypeSpec::class("App.Holder", 256).with_references(&[16, 24]));

    let ephemeral = builder.segment(SegmentData::ephemeral(0x1000, 0x1000, 0x1000, 0x2000));
    let large = builder.segment(SegmentData::large(0x10000, 0x10100));

    let first = builder.object(ephemeral, plain_mt);
    let second = builder.object(ephemeral, plain_mt);
    builder.object(ephemeral, plain_mt);
    let holder = builder.object(large, holder_mt);
    builder.set_pointer(holder + 16, first);
    builder.set_pointer(holder + 24, second);

    Scenario {
        runtime: builder.build().unwrap().into_runtime().unwrap(),
        holder_mt,
        plain_mt,
    }
}

fn addresses(heap: &Heap) -> Vec<u64> {
    heap.enumerate_objects()
        .unwrap()
        .map(|object| object.address())
        .collect()
}

#[test]
fn concrete_scenario() {
    let scenario = scenario();
    let heap = scenario.runtime.heap().unwrap();

    assert_eq!(addresses(&heap), vec![0x1000, 0x1040, 0x1080, 0x10000]);

    let edges: Vec<(u64, u64)> = heap
        .references(0x10000, false)
        .unwrap()
        .into_iter()
        .map(|r| (r.target, r.offset))
        .collect();
    assert_eq!(edges, vec![(0x1000, 16), (0x1040, 24)]);

    let types: Vec<u64> = heap
        .enumerate_objects()
        .unwrap()
        .map(|o| o.ty().method_table())
        .collect();
    assert_eq!(
        types,
        vec![
            scenario.plain_mt,
            scenario.plain_mt,
            scenario.plain_mt,
            scenario.holder_mt
        ]
    );
}

#[test]
fn segments_partition_the_heap() {
    let scenario = scenario();
    let heap = scenario.runtime.heap().unwrap();

    for segment in heap.segments() {
        assert!(segment.start() <= segment.end());
        assert!(segment.end() <= segment.reserved_end());
    }
    for pair in heap.segments().windows(2) {
        assert!(pair[0].end() <= pair[1].start());
    }
}

#[test]
fn enumeration_is_deterministic() {
    let scenario = scenario();
    let heap = scenario.runtime.heap().unwrap();

    let first = addresses(&heap);
    let second = addresses(&heap);
    assert_eq!(first, second);

    scenario.runtime.flush();
    let rebuilt = scenario.runtime.heap().unwrap();
    assert_eq!(addresses(&rebuilt), first);
}

#[test]
fn every_object_lies_in_its_segment() {
    let scenario = scenario();
    let heap = scenario.runtime.heap().unwrap();

    for object in heap.enumerate_objects().unwrap() {
        let segment = heap.segment_for_address(object.address()).unwrap();
        assert!(segment.start() <= object.address() && object.address() < segment.end());
    }
}

#[test]
fn reference_walk_soundness() {
    let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
    let triple =
        builder.method_table(TypeSpec::class("App.Triple", 48).with_references(&[8, 16, 32]));
    let plain = builder.method_table(TypeSpec::class("App.Plain", 32));
    let segment = builder.segment(SegmentData::gen2(0x4000, 0x5000));

    let full = builder.object(segment, triple);
    let sparse = builder.object(segment, triple);
    let target = builder.object(segment, plain);
    let filled = builder.object(segment, plain);
    builder.set_pointer(filled + 8, 0xDEAD_BEEF);
    for offset in [8, 16, 32] {
        builder.set_pointer(full + offset, target);
    }
    builder.set_pointer(sparse + 16, target);
    let runtime = builder.build().unwrap().into_runtime().unwrap();
    let heap = runtime.heap().unwrap();

    let offsets: Vec<u64> = heap
        .references(full, false)
        .unwrap()
        .iter()
        .map(|r| r.offset)
        .collect();
    assert_eq!(offsets, vec![8, 16, 32]);
    assert_eq!(heap.references(sparse, true).unwrap().len(), 1);
    // pointer-free types report nothing, whatever their memory holds
    assert!(heap.references(filled, false).unwrap().is_empty());
}

#[test]
fn cache_equivalence() {
    let scenario = scenario();
    let heap = scenario.runtime.heap().unwrap();

    let collect = |heap: &Heap| -> Vec<(u64, u64, Vec<ObjectReference>)> {
        heap.enumerate_objects()
            .unwrap()
            .map(|o| {
                (
                    o.address(),
                    o.ty().method_table(),
                    o.references(false).unwrap(),
                )
            })
            .collect()
    };

    let live = collect(&*heap);
    heap.cache_heap(&CancellationToken::new()).unwrap();
    assert!(heap.is_heap_cached());
    assert_eq!(collect(&*heap), live);
}

#[test]
fn cancelled_cache_build_leaves_heap_uncached() {
    let scenario = scenario();
    let heap = scenario.runtime.heap().unwrap();
    let token = CancellationToken::new();
    token.cancel();

    assert!(matches!(heap.cache_heap(&token), Err(Error::Cancelled)));
    assert!(!heap.is_heap_cached());
    assert_eq!(addresses(&heap).len(), 4);
}

#[test]
fn generation_size_accounting() {
    let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
    builder.segment(SegmentData::ephemeral(0x1000, 0x1400, 0x1C00, 0x2000));
    builder.segment(SegmentData::gen2(0x3000, 0x3800));
    builder.segment(SegmentData::large(0x8000, 0x9000));
    let runtime = builder.build().unwrap().into_runtime().unwrap();
    let heap = runtime.heap().unwrap();

    assert_eq!(heap.size_by_generation(Generation::Gen0), 0x400);
    assert_eq!(heap.size_by_generation(Generation::Gen1), 0x800);
    assert_eq!(heap.size_by_generation(Generation::Gen2), 0x400 + 0x800);
    assert_eq!(heap.size_by_generation(Generation::Large), 0x1000);

    let total: u64 = heap.segments().iter().map(Segment::length).sum();
    assert_eq!(heap.total_heap_size(), total);
    assert_eq!(heap.generation_of(0x1500), Some(Generation::Gen1));
    assert_eq!(heap.generation_of(0x3100), Some(Generation::Gen2));
    assert_eq!(heap.generation_of(0x2800), None);
}

#[test]
fn allocation_contexts_and_free_objects() {
    let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
    let plain = builder.method_table(TypeSpec::class("App.Plain", 32));
    let segment = builder.segment(SegmentData::ephemeral(0x1000, 0x1000, 0x1000, 0x3000));

    let a = builder.object(segment, plain);
    let gap = builder.free(segment, 0x80);
    let b = builder.object(segment, plain);
    builder.allocation_context(segment, 0x200);
    let c = builder.object(segment, plain);
    let runtime = builder.build().unwrap().into_runtime().unwrap();
    let heap = runtime.heap().unwrap();

    let objects: Vec<(u64, bool)> = heap
        .enumerate_objects()
        .unwrap()
        .map(|o| (o.address(), o.is_free()))
        .collect();
    assert_eq!(
        objects,
        vec![(a, false), (gap, true), (b, false), (c, false)]
    );
    assert_eq!(heap.object_size(gap), Some(0x80));
    assert!(heap.free_type().unwrap().is_free());
}

#[test]
fn stale_snapshot_after_flush() {
    let scenario = scenario();
    let heap = scenario.runtime.heap().unwrap();
    scenario.runtime.flush();

    assert!(matches!(
        heap.enumerate_objects(),
        Err(Error::StaleSnapshot { .. })
    ));
    assert!(matches!(
        heap.cache_heap(&CancellationToken::new()),
        Err(Error::StaleSnapshot { .. })
    ));
    assert!(matches!(
        heap.reachable_from([0x10000], false),
        Err(Error::StaleSnapshot { .. })
    ));
}

#[test]
fn value_type_arrays_and_strings() {
    let mut builder = HeapImageBuilder::new(PointerSize::Bit32);
    let entry = builder.method_table(TypeSpec::value_array("App.Entry[]", 12, &[4]));
    let segment = builder.segment(SegmentData::gen2(0x1000, 0x2000));

    let name = builder.string(segment, "key");
    let array = builder.value_array(segment, entry, 3);
    // elements start after the method table and length, 12 bytes each
    builder.set_pointer(array + 8 + 4, name);
    builder.set_pointer(array + 8 + 24 + 4, name);
    builder.set_pointer(array + 8 + 12, 0x7777);
    let runtime = builder.build().unwrap().into_runtime().unwrap();
    let heap = runtime.heap().unwrap();

    let offsets: Vec<u64> = heap
        .references(array, false)
        .unwrap()
        .iter()
        .map(|r| r.offset)
        .collect();
    assert_eq!(offsets, vec![12, 36]);

    let object = heap.get_object(array).unwrap();
    assert_eq!(object.array_length(), Some(3));
    assert_eq!(
        heap.get_object(name).unwrap().as_string().as_deref(),
        Some("key")
    );
}

#[test]
fn graph_walk_visits_each_object_once() {
    let scenario = scenario();
    let heap = scenario.runtime.heap().unwrap();

    let reached: Vec<u64> = heap
        .reachable_from([0x10000, 0x1000], true)
        .unwrap()
        .map(|o| o.address())
        .collect();
    let unique: HashSet<u64> = reached.iter().copied().collect();
    assert_eq!(reached.len(), unique.len());
    assert_eq!(unique, HashSet::from([0x1000, 0x1040, 0x10000]));
}

#[test]
fn server_gc_layout() {
    let mut builder = HeapImageBuilder::new(PointerSize::Bit64).with_server_gc(true);
    let plain = builder.method_table(TypeSpec::class("App.Plain", 24));
    let first = builder.segment(SegmentData::gen2(0x20000, 0x21000).with_heap_index(1));
    let second = builder.segment(SegmentData::gen2(0x10000, 0x11000));
    let b = builder.object(first, plain);
    let a = builder.object(second, plain);
    let runtime = builder.build().unwrap().into_runtime().unwrap();
    let heap = runtime.heap().unwrap();

    assert!(heap.server_gc());
    assert_eq!(addresses(&heap), vec![a, b]);
    assert_eq!(heap.segment_for_address(b).unwrap().heap_index(), 1);
}
