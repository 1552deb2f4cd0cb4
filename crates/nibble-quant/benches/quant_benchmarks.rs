//! Benchmarks for block-wise quantization
//!
//! Measures quantize and dequantize throughput per codebook, and the cost of
//! double quantization on top of the plain scales.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nibble_quant::{
    block_absmax, dequantize, quantize, CodebookKind, DoubleQuantizer, QuantConfig, Shape,
    TensorView,
};

/// Generate test data for benchmarks
fn generate_test_data(size: usize) -> Vec<f32> {
    (0..size).map(|i| ((i as f32 * 0.1) % 10.0 - 5.0) * 0.2).collect()
}

fn bench_quantize(c: &mut Criterion) {
    let mut group = c.benchmark_group("quantize");
    for &size in &[4096usize, 65536, 1 << 20] {
        let data = generate_test_data(size);
        let view = TensorView::new(&data, Shape::vector(size)).unwrap();
        group.throughput(Throughput::Elements(size as u64));

        for kind in [CodebookKind::Nf4, CodebookKind::Fp4, CodebookKind::DynamicSigned8] {
            let config = QuantConfig::builder().codebook(kind).build().unwrap();
            group.bench_with_input(BenchmarkId::new(kind.name(), size), &view, |b, view| {
                b.iter(|| quantize(black_box(view), &config).unwrap())
            });
        }
    }
    group.finish();
}

fn bench_dequantize(c: &mut Criterion) {
    let mut group = c.benchmark_group("dequantize");
    for &size in &[4096usize, 65536, 1 << 20] {
        let data = generate_test_data(size);
        let view = TensorView::new(&data, Shape::vector(size)).unwrap();
        group.throughput(Throughput::Elements(size as u64));

        for double_quant in [false, true] {
            let config = QuantConfig::builder().double_quant(double_quant).build().unwrap();
            let quantized = quantize(&view, &config).unwrap();
            let label = if double_quant { "nf4-dq" } else { "nf4" };
            group.bench_with_input(BenchmarkId::new(label, size), &quantized, |b, q| {
                b.iter(|| dequantize(black_box(q), &config).unwrap())
            });
        }
    }
    group.finish();
}

fn bench_double_quant(c: &mut Criterion) {
    let data = generate_test_data(1 << 20);
    let scales = block_absmax(&data, 64).unwrap();
    let quantizer = DoubleQuantizer::default();

    c.bench_function("double_quant_scales", |b| {
        b.iter(|| quantizer.quantize(black_box(&scales)).unwrap())
    });
}

criterion_group!(benches, bench_quantize, bench_dequantize, bench_double_quant);
criterion_main!(benches);
