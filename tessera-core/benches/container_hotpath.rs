use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tessera_core::{ContentHash, KeyName, RequestContext, StorageConfig, ValueContainer};

fn payload(len: usize) -> Vec<u8> {
    b"lorem ipsum dolor sit amet "
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

fn bench_hashing(c: &mut Criterion) {
    let large = payload(4000);
    c.bench_function("hash/compute_4k", |b| {
        b.iter(|| black_box(ContentHash::compute(black_box(&large))));
    });
}

fn bench_set_value(c: &mut Criterion) {
    let config = StorageConfig::default();
    let ctx = RequestContext::new("127.0.0.1");
    let key = KeyName::new("app1/doc1/note.json").expect("valid key");
    let inline = br#"{"title":"note","tags":["a","b"]}"#.to_vec();
    let addressed = payload(4000);

    c.bench_function("container/set_value_inline", |b| {
        b.iter(|| {
            let mut container = ValueContainer::new(key.clone(), &ctx);
            let pending = container
                .set_value(black_box(inline.clone()), &ctx, &config)
                .expect("set inline value");
            black_box(pending.is_none());
        });
    });

    c.bench_function("container/set_value_addressed", |b| {
        b.iter(|| {
            let mut container = ValueContainer::new(key.clone(), &ctx);
            let pending = container
                .set_value(black_box(addressed.clone()), &ctx, &config)
                .expect("set addressed value");
            black_box(pending.is_some());
        });
    });
}

fn bench_key_names(c: &mut Criterion) {
    c.bench_function("key/parse_depth_4", |b| {
        b.iter(|| {
            let key = KeyName::new(black_box("app1/doc1/attachments/report.pdf")).expect("valid key");
            black_box(key.depth_below("app1"));
        });
    });
}

criterion_group!(benches, bench_hashing, bench_set_value, bench_key_names);
criterion_main!(benches);
