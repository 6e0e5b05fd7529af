#![no_main]

use std::sync::Arc;

use heapscope::prelude::*;
use libfuzzer_sys::fuzz_target;

const SEGMENT: u64 = 0x10_0000;

// Arbitrary bytes as the contents of a segment whose method tables are real.
fuzz_target!(|data: &[u8]| {
    let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
    builder.method_table(TypeSpec::class("Fuzz.Node", 32).with_references(&[8, 16]));
    builder.method_table(TypeSpec::value_array("Fuzz.Pair[]", 16, &[8]));
    builder.segment(SegmentData::gen2(SEGMENT, SEGMENT + 0x1000));
    let Ok(image) = builder.build() else {
        return;
    };

    let mut target = (*image.target).clone();
    let len = data.len().min(0x1000);
    if target.write(SEGMENT, &data[..len]).is_err() {
        return;
    }
    let Ok(runtime) = ClrRuntime::new(Arc::new(target), image.runtime) else {
        return;
    };
    let Ok(heap) = runtime.heap() else {
        return;
    };

    let Ok(objects) = heap.enumerate_objects() else {
        return;
    };
    let roots: Vec<u64> = objects
        .take(256)
        .map(|object| {
            let _ = object.references(true);
            let _ = object.as_string();
            object.address()
        })
        .collect();
    if let Ok(walk) = heap.reachable_from(roots, true) {
        walk.take(1024).for_each(drop);
    }
});
