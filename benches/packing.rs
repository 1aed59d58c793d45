//! Benchmarks for the readback packing kernels
//!
//! One 1080p frame per iteration, for each pack operation.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use framelink::transfer::packing::pack;
use framelink::types::{DataFormat, FrameLayout, Resolution};

fn bench_pack_formats(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack_1080p");

    for format in [
        DataFormat::Rgba8,
        DataFormat::Rgb8,
        DataFormat::CbY0CrY1_8,
        DataFormat::YCbCr10_422,
        DataFormat::Rgb10X2Rev,
        DataFormat::P216,
    ] {
        let layout = FrameLayout::new(Resolution::FHD_1080P, format, 8);
        let src: Vec<u8> = (0..layout.readback_bytes()).map(|i| i as u8).collect();
        let mut dst = vec![0u8; layout.buffer_size_bytes()];

        group.throughput(Throughput::Bytes(layout.readback_bytes() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(format.name()), &layout, |b, layout| {
            b.iter(|| {
                pack(format.pack_op(), layout, black_box(&src), &mut dst);
                black_box(&dst);
            });
        });
    }

    group.finish();
}

fn bench_padding_strip(c: &mut Criterion) {
    let mut group = c.benchmark_group("padding_strip");

    // RGB8 rows at 1918 pixels need padding for every alignment above 2
    for alignment in [1usize, 4, 8] {
        let layout = FrameLayout::new(Resolution::new(1918, 1080), DataFormat::Rgb8, alignment);
        let src = vec![0x55u8; layout.readback_bytes()];
        let mut dst = vec![0u8; layout.buffer_size_bytes()];

        group.bench_with_input(BenchmarkId::from_parameter(alignment), &layout, |b, layout| {
            b.iter(|| {
                pack(DataFormat::Rgb8.pack_op(), layout, black_box(&src), &mut dst);
                black_box(&dst);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pack_formats, bench_padding_strip);
criterion_main!(benches);
