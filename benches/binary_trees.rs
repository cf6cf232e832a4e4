use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use quasar::heap::{instantiate_heap, HeapParams};
use quasar::read_barrier::BakerReadBarrier;

pub fn bench_binary_trees(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary trees");
    group.sample_size(20);
    let min_depth = 4;
    for max_depth in [10, 12, 14] {
        group.bench_function(BenchmarkId::new("concurrent copying", max_depth), |b| {
            b.iter_batched_ref(
                || {
                    instantiate_heap::<BakerReadBarrier>(HeapParams {
                        region_space_capacity: 128 * 1024 * 1024,
                        background_gc_watermark: 64 * 1024 * 1024,
                        verify_no_from_space_refs: false,
                        ..HeapParams::default()
                    })
                },
                |mutator| {
                    let mut depth = min_depth;
                    while depth < max_depth {
                        let iterations = 1 << (max_depth - depth + min_depth);
                        for _ in 0..iterations {
                            tree::bottom_up_tree(mutator, depth).item_check();
                        }
                        mutator.collect_garbage();
                        depth += 2;
                    }
                },
                criterion::BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_binary_trees);
criterion_main!(benches);

mod tree {
    use quasar::api::{Collectable, Finalize, Gc, Trace, Visitor};
    use quasar::letroot;
    use quasar::mutator::MutatorRef;
    use quasar::read_barrier::BakerReadBarrier;

    pub struct Tree {
        first: Option<Gc<Self>>,
        second: Option<Gc<Self>>,
    }

    impl Tree {
        pub fn item_check(&self) -> i32 {
            if self.first.is_none() {
                return 1;
            }
            1 + self.first.unwrap().item_check() + self.second.unwrap().item_check()
        }
    }

    unsafe impl Trace for Tree {
        fn trace(&mut self, vis: &mut dyn Visitor) {
            self.first.trace(vis);
            self.second.trace(vis);
        }
    }
    unsafe impl Finalize for Tree {}
    impl Collectable for Tree {}

    pub fn bottom_up_tree(mutator: &MutatorRef<BakerReadBarrier>, mut depth: i32) -> Gc<Tree> {
        if depth > 0 {
            depth -= 1;
            let stack = mutator.shadow_stack();
            letroot!(first = stack, bottom_up_tree(mutator, depth));
            letroot!(second = stack, bottom_up_tree(mutator, depth));
            mutator.allocate(Tree {
                first: Some(*first),
                second: Some(*second),
            })
        } else {
            mutator.allocate(Tree {
                first: None,
                second: None,
            })
        }
    }
}
