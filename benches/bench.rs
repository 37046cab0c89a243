use criterion::{
    criterion_group,
    criterion_main,
    Criterion,
};

use n00b::types::{Builtin, TypeCtx};
use n00b::{Runtime, RuntimeConfig, ScanPolicy};

fn alloc_and_collect(c: &mut Criterion) {
    let runtime = Runtime::new(RuntimeConfig::default());
    let heap = runtime.new_heap(1 << 20);
    let root = heap.roots(1);

    c.bench_function("alloc 64 bytes", |b| {
        b.iter(|| heap.alloc(64, ScanPolicy::None));
    });

    c.bench_function("alloc 8 words", |b| {
        b.iter(|| heap.alloc_words(8));
    });

    c.bench_function("collect one live record", |b| {
        b.iter(|| {
            root.set(0, heap.alloc(256, ScanPolicy::None).as_ptr());
            heap.collect()
        });
    });
}

fn unify(c: &mut Criterion) {
    c.bench_function("unify dict with variables", |b| {
        b.iter(|| {
            let mut ctx = TypeCtx::new();
            let k = ctx.ttvar();
            let v = ctx.ttvar();
            let open = ctx.tdict(k, v);
            let items = ctx.tlist(Builtin::Int.id());
            let closed = ctx.tdict(Builtin::String.id(), items);

            ctx.unify(open, closed)
        });
    });
}

criterion_group!(benches, alloc_and_collect, unify);
criterion_main!(benches);
