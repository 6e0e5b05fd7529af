//! Heap walks over damaged images must degrade, never fail or panic.

use std::sync::Arc;

use heapscope::{config::LARGE_OBJECT_THRESHOLD, prelude::*};

fn addresses(heap: &Heap) -> Vec<u64> {
    heap.enumerate_objects()
        .unwrap()
        .map(|object| object.address())
        .collect()
}

#[test]
fn truncated_segment_ends_its_walk() {
    let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
    let plain = builder.method_table(TypeSpec::class("App.Plain", 64));
    let broken = builder.segment(SegmentData::gen2(0x1000, 0x2000));
    let healthy = builder.segment(SegmentData::gen2(0x4000, 0x5000));

    let a = builder.object(broken, plain);
    let b = builder.object(broken, plain);
    builder.object(broken, plain);
    let c = builder.object(healthy, plain);
    builder.truncate_segment(broken, 0x80);
    let runtime = builder.build().unwrap().into_runtime().unwrap();
    let heap = runtime.heap().unwrap();

    assert_eq!(addresses(&heap), vec![a, b, c]);
}

#[test]
fn unknown_method_table_ends_segment_walk() {
    let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
    let plain = builder.method_table(TypeSpec::class("App.Plain", 32));
    let first = builder.segment(SegmentData::gen2(0x1000, 0x2000));
    let second = builder.segment(SegmentData::gen2(0x3000, 0x4000));

    let a = builder.object(first, plain);
    let garbage = builder.object(first, plain);
    builder.object(first, plain);
    builder.set_pointer(garbage, 0x4141_4140);
    let b = builder.object(second, plain);
    let runtime = builder.build().unwrap().into_runtime().unwrap();
    let heap = runtime.heap().unwrap();

    assert_eq!(addresses(&heap), vec![a, b]);
    assert!(heap.get_object(garbage).is_none());
    assert!(heap.references(garbage, true).unwrap().is_empty());
}

#[test]
fn oversized_array_length_stops_walk() {
    let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
    let plain = builder.method_table(TypeSpec::class("App.Plain", 32));
    let segment = builder.segment(SegmentData::gen2(0x1000, 0x2000));

    let array = builder.reference_array(segment, plain, &[0, 0]);
    builder.object(segment, plain);
    builder.write_u32(array + 8, u32::MAX);
    let runtime = builder.build().unwrap().into_runtime().unwrap();
    let heap = runtime.heap().unwrap();

    assert_eq!(addresses(&heap), vec![array]);
    // the array claims more than its segment holds
    assert!(heap.references(array, true).unwrap().is_empty());
}

#[test]
fn careful_walk_rejects_large_small_heap_objects() {
    let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
    let plain = builder.method_table(TypeSpec::class("App.Plain", 32));
    let segment = builder.segment(SegmentData::gen2(0x10_0000, 0x12_0000));

    let elements = vec![0u64; 11_000];
    let array = builder.reference_array(segment, plain, &elements);
    let target = builder.object(segment, plain);
    builder.set_pointer(array + 32, target);
    let runtime = builder.build().unwrap().into_runtime().unwrap();
    let heap = runtime.heap().unwrap();

    assert!(heap.object_size(array).unwrap() > LARGE_OBJECT_THRESHOLD);
    assert!(heap.references(array, true).unwrap().is_empty());
    assert_eq!(heap.references(array, false).unwrap().len(), 1);
}

#[test]
fn corrupt_gc_descriptor_yields_no_references() {
    let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
    let node = builder.method_table(TypeSpec::class("App.Node", 32).with_references(&[8]));
    let segment = builder.segment(SegmentData::gen2(0x1000, 0x2000));

    let first = builder.object(segment, node);
    let second = builder.object(segment, node);
    builder.set_pointer(first + 8, second);
    let image = builder.build().unwrap();
    let runtime = {
        let mut target = (*image.target).clone();
        // series count far beyond anything a real type carries
        target.write(node - 8, &0x7FFF_FFFF_u64.to_le_bytes()).unwrap();
        ClrRuntime::new(Arc::new(target), image.runtime).unwrap()
    };
    let heap = runtime.heap().unwrap();

    assert_eq!(addresses(&heap), vec![first, second]);
    assert!(heap.references(first, false).unwrap().is_empty());
}

#[test]
fn stuck_allocation_context_ends_segment_walk() {
    let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
    let plain = builder.method_table(TypeSpec::class("App.Plain", 32));
    let segment = builder.segment(SegmentData::gen2(0x1000, 0x2000));
    let other = builder.segment(SegmentData::gen2(0x3000, 0x4000));

    let a = builder.object(segment, plain);
    let b = builder.object(segment, plain);
    builder.object(segment, plain);
    let c = builder.object(other, plain);
    // a context whose limit lies behind its pointer cannot be skipped
    builder.raw_allocation_context(AllocationContext {
        pointer: b + 32,
        limit: 0x10,
    });
    let runtime = builder.build().unwrap().into_runtime().unwrap();
    let heap = runtime.heap().unwrap();

    assert_eq!(addresses(&heap), vec![a, b, c]);
}

#[test]
fn malformed_segments_are_skipped() {
    let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
    let plain = builder.method_table(TypeSpec::class("App.Plain", 32));
    let segment = builder.segment(SegmentData::gen2(0x1000, 0x2000));
    let a = builder.object(segment, plain);
    builder.layout_segment(SegmentData::gen2(0x9000, 0x8000));
    builder.layout_segment(SegmentData::ephemeral(0x20000, 0x24000, 0x22000, 0x28000));
    let runtime = builder.build().unwrap().into_runtime().unwrap();
    let heap = runtime.heap().unwrap();

    assert_eq!(heap.segments().len(), 1);
    assert_eq!(addresses(&heap), vec![a]);
}

#[test]
fn cache_survives_partially_readable_segments() {
    let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
    let plain = builder.method_table(TypeSpec::class("App.Plain", 64));
    let segment = builder.segment(SegmentData::gen2(0x1000, 0x2000));
    let a = builder.object(segment, plain);
    let b = builder.object(segment, plain);
    builder.object(segment, plain);
    builder.truncate_segment(segment, 0x80);
    let runtime = builder.build().unwrap().into_runtime().unwrap();
    let heap = runtime.heap().unwrap();

    heap.cache_heap(&CancellationToken::new()).unwrap();
    let cache = heap.heap_cache().unwrap();
    assert_eq!(cache.object_count(), 2);
    assert_eq!(cache.cached_bytes(), 0x80);
    assert_eq!(addresses(&heap), vec![a, b]);
}

#[test]
fn cache_ignores_implausible_segment_length() {
    let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
    let plain = builder.method_table(TypeSpec::class("App.Plain", 32));
    let segment = builder.segment(SegmentData::gen2(0x1000, 0x2000));
    let a = builder.object(segment, plain);
    // claims 64 TiB of committed memory, none of it readable
    builder.layout_segment(SegmentData::gen2(0x10_0000_0000, 0x10_0000_0000 + (1 << 46)));
    let runtime = builder.build().unwrap().into_runtime().unwrap();
    let heap = runtime.heap().unwrap();

    assert_eq!(heap.segments().len(), 2);
    heap.cache_heap(&CancellationToken::new()).unwrap();
    let cache = heap.heap_cache().unwrap();
    assert_eq!(cache.cached_bytes(), 0x1000);
    assert_eq!(addresses(&heap), vec![a]);
}
