use crate::{
    config::HeapConfig,
    runtime::{
        snapshot::{HeapImageBuilder, TypeSpec},
        ClrRuntime, SegmentData,
    },
    target::PointerSize,
};

/// The reference heap used across unit tests.
///
/// - ephemeral segment `[0x1000, 0x2000)` holding 64-byte objects at `0x1000`, `0x1040`
///   (stored with a tagged method table pointer) and `0x1080`
/// - large segment `[0x10000, 0x10100)` holding a single 256-byte object whose fields at
///   offsets 16 and 24 point at the first two
pub struct Scenario {
    pub runtime: ClrRuntime,
    pub plain_mt: u64,
    pub holder_mt: u64,
}

pub fn scenario_heap() -> Scenario {
    scenario_heap_with(HeapConfig::default())
}

pub fn scenario_heap_with(config: HeapConfig) -> Scenario {
    let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
    let plain_mt = builder.method_table(TypeSpec::class("Sample.Plain", 64));
    let holder_mt =
        builder.method_table(TypeSpec::class("Sample.Holder", 256).with_references(&[16, 24]));

    let large = builder.segment(SegmentData::large(0x10000, 0x10100));
    let ephemeral = builder.segment(SegmentData::ephemeral(0x1000, 0x1000, 0x1000, 0x2000));

    let first = builder.object(ephemeral, plain_mt);
    let second = builder.object(ephemeral, plain_mt);
    builder.object(ephemeral, plain_mt);
    builder.set_pointer(second, plain_mt | 1);

    let holder = builder.object(large, holder_mt);
    builder.set_pointer(holder + 16, first);
    builder.set_pointer(holder + 24, second);

    let runtime = builder
        .build()
        .expect("scenario image")
        .into_runtime_with(config)
        .expect("scenario runtime");

    Scenario {
        runtime,
        plain_mt,
        holder_mt,
    }
}
