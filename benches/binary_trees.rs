use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use halley::collector::MarkCompactCollector;
use halley::flags::Flags;
use halley::heap::{AllocationSpace, Heap};
use halley::minor::MinorMarkCompactCollector;
use halley::object::{HeapObject, Tagged};

fn bench_flags() -> Flags {
    Flags {
        verify_heap: false,
        worker_threads: 4,
        ..Flags::default()
    }
}

fn bottom_up_tree(heap: &Heap, depth: usize) -> HeapObject {
    let node = heap.new_regular(AllocationSpace::Young, 2);
    if depth > 0 {
        let left = bottom_up_tree(heap, depth - 1);
        let right = bottom_up_tree(heap, depth - 1);
        heap.write_field(node, 0, Tagged::strong(left.address()));
        heap.write_field(node, 1, Tagged::strong(right.address()));
    }
    node
}

fn item_check(node: HeapObject) -> usize {
    match (node.field(0).to_address(), node.field(1).to_address()) {
        (Some(left), Some(right)) => {
            1 + item_check(HeapObject(left)) + item_check(HeapObject(right))
        }
        _ => 1,
    }
}

pub fn bench_gcs(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary trees");
    group.sample_size(20);

    for depth in [8, 10, 12] {
        group.bench_function(BenchmarkId::new("full-mc", depth), |b| {
            b.iter_batched_ref(
                || {
                    let heap = Heap::new(bench_flags());
                    let mut collector = MarkCompactCollector::new(&heap);
                    collector.set_up();
                    (heap, collector)
                },
                |(heap, collector)| {
                    let tree = bottom_up_tree(heap, depth);
                    let root = heap.roots.handles.create_strong(tree.address());
                    collector.collect_garbage();
                    collector.ensure_sweeping_completed();
                    criterion::black_box(item_check(HeapObject(root.get())));
                },
                criterion::BatchSize::LargeInput,
            );
        });

        group.bench_function(BenchmarkId::new("minor-mc", depth), |b| {
            b.iter_batched_ref(
                || {
                    let heap = Heap::new(bench_flags());
                    let minor = MinorMarkCompactCollector::new(&heap);
                    (heap, minor)
                },
                |(heap, minor)| {
                    let tree = bottom_up_tree(heap, depth);
                    let root = heap.roots.handles.create_strong(tree.address());
                    minor.collect_garbage();
                    minor.ensure_sweeping_completed();
                    criterion::black_box(item_check(HeapObject(root.get())));
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_gcs);
criterion_main!(benches);
