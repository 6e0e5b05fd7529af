#![no_main]

use heapscope::prelude::*;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for pointer_size in [PointerSize::Bit32, PointerSize::Bit64] {
        let usable = data.len() - data.len() % pointer_size.bytes();
        let _ = GcDesc::parse(&data[..usable], pointer_size);
    }
});
