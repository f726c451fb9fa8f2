use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use scribed::ot::Operation;
use scribed::text::{TextBuffer, TextChunk, TextOperation};

fn buffer_of(len: usize) -> TextBuffer {
    let text: String = "abcdefgh".chars().cycle().take(len).collect();
    TextBuffer::from_chunk(TextChunk::from_text(&text, "bench"))
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_middle");
    for len in [256usize, 4096, 65536] {
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            let base = buffer_of(len);
            let chunk = TextChunk::from_text("xyz", "bench");
            b.iter(|| {
                let mut buf = base.clone();
                buf.insert(len / 2, &chunk).unwrap();
                buf
            });
        });
    }
    group.finish();
}

fn bench_transform_pair(c: &mut Criterion) {
    c.bench_function("transform_delete_vs_insert", |b| {
        let del = TextOperation::delete(10, TextChunk::from_text("0123456789", "bench"));
        let ins = TextOperation::insert(15, TextChunk::from_text("x", "bench"));
        b.iter(|| del.transform(&ins, None));
    });
}

criterion_group!(benches, bench_insert, bench_transform_pair);
criterion_main!(benches);
