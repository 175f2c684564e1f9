//! Benchmarks for the PalmDoc codec.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use palmpress::mobi::palmdoc;

fn sample_html(len: usize) -> Vec<u8> {
    let paragraph = "<p>The quick brown fox jumps over the lazy dog. \
        Sphinx of black quartz, judge my vow. </p>\n";
    paragraph.bytes().cycle().take(len).collect()
}

fn bench_compress(c: &mut Criterion) {
    let record = sample_html(4096);
    c.bench_function("palmdoc_compress_record", |b| {
        b.iter(|| palmdoc::compress(black_box(&record)));
    });
}

fn bench_decompress(c: &mut Criterion) {
    let record = palmdoc::compress(&sample_html(4096));
    c.bench_function("palmdoc_decompress_record", |b| {
        b.iter(|| palmdoc::decompress(black_box(&record)).unwrap());
    });
}

fn bench_roundtrip_document(c: &mut Criterion) {
    let document = sample_html(256 * 1024);
    c.bench_function("palmdoc_roundtrip_256k", |b| {
        b.iter(|| {
            for chunk in document.chunks(4096) {
                let compressed = palmdoc::compress(chunk);
                palmdoc::decompress(&compressed).unwrap();
            }
        });
    });
}

criterion_group!(benches, bench_compress, bench_decompress, bench_roundtrip_document);
criterion_main!(benches);
