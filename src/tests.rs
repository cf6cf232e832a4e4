use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::api::{Array, Collectable, Field, Finalize, Gc, Trace, Visitor};
use crate::header::GC_WHITE;
use crate::heap::{instantiate_heap, GcCause, HeapParams};
use crate::mutator::MutatorRef;
use crate::read_barrier::{BakerReadBarrier, ReadBarrierPolicy, TableLookupReadBarrier};
use crate::region_space::REGION_SIZE;

struct Node {
    value: u32,
    next: Option<Field<Node>>,
}

unsafe impl Trace for Node {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        self.next.trace(vis);
    }
}
unsafe impl Finalize for Node {}
impl Collectable for Node {}

fn test_params() -> HeapParams {
    HeapParams {
        region_space_capacity: 16 * REGION_SIZE,
        non_moving_capacity: 8 * 1024 * 1024,
        large_space_capacity: 8 * 1024 * 1024,
        immune_space_capacity: 2 * 1024 * 1024,
        allocation_stack_capacity: 64 * 1024,
        // Keep cycles explicit in tests.
        background_gc_watermark: usize::MAX,
        ..HeapParams::default()
    }
}

/// Build a linear list of `n` nodes, head last so the head roots the rest.
fn build_list<RB: ReadBarrierPolicy>(mutator: &MutatorRef<RB>, n: u32) -> Gc<Node> {
    let stack = mutator.shadow_stack();
    letroot!(tail = stack, None::<Gc<Node>>);
    for value in (1..n).rev() {
        let node = mutator.allocate(Node {
            value,
            next: tail.map(Gc::to_field),
        });
        *tail = Some(node);
    }
    mutator.allocate(Node {
        value: 0,
        next: tail.map(Gc::to_field),
    })
}

/// Walk the list with barriered loads, checking consecutive values.
fn traverse<RB: ReadBarrierPolicy>(mutator: &MutatorRef<RB>, head: Gc<Node>) -> u32 {
    let stack = mutator.shadow_stack();
    letroot!(cur = stack, Some(head));
    let mut count = 0;
    loop {
        mutator.safepoint();
        let node = match *cur {
            Some(node) => node,
            None => break,
        };
        assert_eq!(node.value, count);
        count += 1;
        *cur = node.next.as_ref().map(|f| mutator.load(node, f));
    }
    count
}

#[test]
fn collect_linear_list_of_1000() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    let stack = mutator.shadow_stack();
    letroot!(head = stack, build_list(&mutator, 1000));

    mutator.collect_garbage();

    let stats = mutator.gc_stats();
    assert_eq!(stats.last_objects_moved.load(Ordering::Relaxed), 1000);
    assert!(stats.last_bytes_moved.load(Ordering::Relaxed) >= 1000 * 8);
    // The from-space has been reclaimed wholesale.
    assert_eq!(mutator.heap_ref().region_space.from_space_size(), 0);

    assert_eq!(traverse(&mutator, *head), 1000);
    // Everything reachable ended up white again.
    let stack2 = mutator.shadow_stack();
    letroot!(cur = stack2, Some(*head));
    while let Some(node) = *cur {
        assert_eq!(node.header().rb_state(), GC_WHITE);
        *cur = node.next.as_ref().map(|f| mutator.load(node, f));
    }
}

#[test]
fn repeated_explicit_cycles_move_every_survivor() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    let stack = mutator.shadow_stack();
    letroot!(head = stack, build_list(&mutator, 200));
    for _ in 0..3 {
        mutator.collect_garbage();
        assert_eq!(
            mutator.gc_stats().last_objects_moved.load(Ordering::Relaxed),
            200
        );
        assert_eq!(traverse(&mutator, *head), 200);
    }
}

#[test]
fn background_cycle_marks_dense_survivors_in_place() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    let stack = mutator.shadow_stack();
    letroot!(head = stack, build_list(&mutator, 300));

    // First cycle evacuates into collector-claimed regions with no live
    // estimate yet.
    mutator.collect_garbage();
    assert_eq!(
        mutator.gc_stats().last_objects_moved.load(Ordering::Relaxed),
        300
    );

    // A background cycle treats those dense regions as unevacuated and marks
    // them in place.
    mutator.request_gc_and_wait(GcCause::Background, false);
    assert_eq!(
        mutator.gc_stats().last_objects_moved.load(Ordering::Relaxed),
        0
    );
    assert_eq!(traverse(&mutator, *head), 300);

    // The in-place cycle produced live estimates; a forced cycle still
    // evacuates everything.
    mutator.collect_garbage();
    assert_eq!(traverse(&mutator, *head), 300);
}

#[test]
fn garbage_is_reclaimed() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    {
        let stack = mutator.shadow_stack();
        letroot!(keep = stack, build_list(&mutator, 10));
        build_list(&mutator, 5000); // dropped on the floor
        mutator.collect_garbage();
        let stats = mutator.gc_stats();
        assert_eq!(stats.last_objects_moved.load(Ordering::Relaxed), 10);
        assert!(stats.last_objects_freed.load(Ordering::Relaxed) >= 5000);
        assert_eq!(traverse(&mutator, *keep), 10);
    }
}

#[test]
fn collection_of_immune_only_heap_moves_nothing() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    let a = mutator.allocate_immune(41u64);
    let b = mutator.allocate_immune(42u64);
    mutator.collect_garbage();
    let stats = mutator.gc_stats();
    assert_eq!(stats.last_objects_moved.load(Ordering::Relaxed), 0);
    assert_eq!(stats.last_bytes_moved.load(Ordering::Relaxed), 0);
    assert_eq!(*a, 41);
    assert_eq!(*b, 42);
    assert_eq!(a.header().rb_state(), GC_WHITE);
}

struct ImmuneHolder {
    node: Option<Field<Node>>,
}
unsafe impl Trace for ImmuneHolder {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        self.node.trace(vis);
    }
}
unsafe impl Finalize for ImmuneHolder {}
impl Collectable for ImmuneHolder {}

#[test]
fn mutated_immune_object_is_rescanned_and_forwarded() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    let mut holder = mutator.allocate_immune(ImmuneHolder { node: None });

    let node = mutator.allocate(Node {
        value: 7,
        next: None,
    });
    holder.node = Some(node.to_field());
    // The store into an immune object dirties its card so the next cycle
    // grays and rescans it.
    mutator.write_barrier(holder);

    mutator.collect_garbage();

    assert_eq!(holder.header().rb_state(), GC_WHITE);
    let field = holder.node.as_ref().unwrap();
    let to = mutator.load(holder, field);
    assert_eq!(to.value, 7);
    assert!(!mutator
        .heap_ref()
        .region_space
        .is_in_from_space(to.base.as_ptr().cast()));

    // And the rescan keeps working on later cycles.
    mutator.collect_garbage();
    let to = mutator.load(holder, holder.node.as_ref().unwrap());
    assert_eq!(to.value, 7);
}

#[test]
fn weak_reference_clears_when_referent_dies() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    let stack = mutator.shadow_stack();

    // Live referent: survives and is forwarded.
    letroot!(live = stack, mutator.allocate(Node { value: 5, next: None }));
    letroot!(weak_live = stack, mutator.allocate_weak(*live));
    // Dead referent: cleared.
    let dead = mutator.allocate(Node { value: 6, next: None });
    letroot!(weak_dead = stack, mutator.allocate_weak(dead));

    mutator.collect_garbage();

    let got = mutator.weak_get(*weak_live).expect("live referent lost");
    assert_eq!(got.value, 5);
    assert!(got.ptr_eq(&*live));
    assert!(mutator.weak_get(*weak_dead).is_none());
}

#[test]
fn soft_references_survive_until_cleared() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    let stack = mutator.shadow_stack();
    let target = mutator.allocate(Node { value: 9, next: None });
    letroot!(soft = stack, mutator.allocate_soft(target));

    // An ordinary cycle preserves softly reachable objects.
    mutator.collect_garbage();
    assert_eq!(mutator.weak_get(*soft).expect("soft cleared early").value, 9);

    // A soft-clearing cycle drops them.
    mutator.collect_garbage_clearing_soft_refs();
    assert!(mutator.weak_get(*soft).is_none());
}

#[test]
fn system_weaks_are_swept_and_forwarded() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    let stack = mutator.shadow_stack();
    letroot!(live = stack, mutator.allocate(Node { value: 1, next: None }));
    let live_handle = mutator.register_system_weak(*live);
    let dead_handle = {
        let dead = mutator.allocate(Node { value: 2, next: None });
        mutator.register_system_weak(dead)
    };

    mutator.collect_garbage();

    let looked_up: Gc<Node> = mutator.get_system_weak(live_handle).expect("live entry swept");
    assert_eq!(looked_up.value, 1);
    assert!(looked_up.ptr_eq(&*live));
    assert!(mutator.get_system_weak::<Node>(dead_handle).is_none());
}

#[test]
fn global_roots_are_forwarded() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    let root = {
        let obj = mutator.allocate(Node {
            value: 77,
            next: None,
        });
        mutator.new_global_root(obj)
    };
    mutator.collect_garbage();
    let got = root.get(&mutator);
    assert_eq!(got.value, 77);
    assert_eq!(
        mutator.gc_stats().last_objects_moved.load(Ordering::Relaxed),
        1
    );
}

#[test]
fn nonmoving_objects_stay_put_and_sweep() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    let stack = mutator.shadow_stack();
    letroot!(pinned = stack, mutator.allocate_nonmoving(Node { value: 3, next: None }));
    let before = pinned.base.as_ptr();
    let _garbage = mutator.allocate_nonmoving(Node { value: 4, next: None });

    mutator.collect_garbage();
    // Survived in place.
    assert_eq!(pinned.base.as_ptr(), before);
    assert_eq!(pinned.value, 3);

    // The unreferenced one is gone after the next cycle's sweep.
    mutator.collect_garbage();
    assert_eq!(pinned.base.as_ptr(), before);
    assert_eq!(pinned.value, 3);
}

struct Counted {
    _payload: u64,
    counter: Arc<AtomicUsize>,
}
unsafe impl Trace for Counted {}
unsafe impl Finalize for Counted {}
impl Collectable for Counted {}
impl Drop for Counted {
    fn drop(&mut self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn finalizers_run_when_nonmoving_objects_are_swept() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let stack = mutator.shadow_stack();
        letroot!(keep = stack, mutator.allocate_nonmoving(Counted {
            _payload: 0,
            counter: counter.clone(),
        }));
        mutator.allocate_nonmoving(Counted {
            _payload: 1,
            counter: counter.clone(),
        });
        mutator.collect_garbage();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(keep.counter.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn large_object_space_allocation_survives() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    let stack = mutator.shadow_stack();
    // 256 KiB: above the large-object threshold, below a region.
    letroot!(blob = stack, mutator.allocate(Array::<u8>::uninit(256 * 1024)));
    let addr = blob.base.as_ptr();
    assert!(mutator
        .heap_ref()
        .large_object_space
        .has_address(addr.cast()));
    unsafe {
        core::ptr::write_bytes(blob.data_mut(), 0xab, blob.len());
    }
    blob.is_inited = true;

    mutator.collect_garbage();

    // Large objects never move.
    assert_eq!(blob.base.as_ptr(), addr);
    assert_eq!(unsafe { *blob.data().add(1234) }, 0xab);

    // An unreferenced large object is reclaimed.
    let before = mutator.heap_ref().large_object_space.bytes_allocated();
    mutator.allocate(Array::<u8>::uninit(256 * 1024));
    mutator.collect_garbage();
    mutator.collect_garbage();
    assert_eq!(
        mutator.heap_ref().large_object_space.bytes_allocated(),
        before
    );
}

#[test]
fn multi_region_object_is_evacuated_through_large_regions() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    let stack = mutator.shadow_stack();
    // One and a half regions: allocated as a large region run.
    let len = REGION_SIZE + REGION_SIZE / 2;
    letroot!(blob = stack, mutator.allocate(Array::<u8>::uninit(len)));
    assert!(mutator.heap_ref().region_space.has_address(blob.base.as_ptr().cast()));
    unsafe {
        core::ptr::write_bytes(blob.data_mut(), 0x5a, 4096);
    }
    blob.is_inited = true;

    mutator.collect_garbage();

    assert_eq!(
        mutator.gc_stats().last_objects_moved.load(Ordering::Relaxed),
        1
    );
    assert!(mutator
        .heap_ref()
        .region_space
        .is_in_to_space(blob.base.as_ptr().cast()));
    assert_eq!(unsafe { *blob.data().add(100) }, 0x5a);
}

#[test]
fn identity_hash_is_stable_across_moves() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    let stack = mutator.shadow_stack();
    letroot!(obj = stack, mutator.allocate(Node { value: 1, next: None }));
    let hash_before = mutator.identity_hash(*obj);
    let addr_before = obj.base.as_ptr();
    mutator.collect_garbage();
    assert_ne!(obj.base.as_ptr(), addr_before);
    assert_eq!(mutator.identity_hash(*obj), hash_before);
}

#[test]
fn skipped_blocks_are_reused_with_dummy_remainders() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    let heap = mutator.heap_ref();
    // Carve a block out of a to-space region and pretend it lost a copy
    // race.
    let mut bytes_allocated = 0;
    let block = heap
        .region_space
        .alloc_nonvirtual(256, &mut bytes_allocated, false);
    assert!(!block.is_null());
    let cc = &heap.collector;
    cc.test_recycle_block(block, 256);

    // An exact-fit request takes the whole block.
    assert_eq!(cc.test_allocate_in_skipped_block(256), block);
    cc.test_recycle_block(block, 256);

    // A smaller request splits it and fills the remainder with a dummy
    // object.
    let again = cc.test_allocate_in_skipped_block(128);
    assert_eq!(again, block);
    let remainder = unsafe { block.add(128) } as *mut crate::header::HeapObjectHeader;
    assert_eq!(unsafe { (*remainder).object_size() }, 128);
    // The remainder is reusable in turn.
    assert_eq!(cc.test_allocate_in_skipped_block(128), unsafe {
        block.add(128)
    });

    // A request whose remainder would be too small for a dummy object is
    // refused rather than splitting.
    cc.test_recycle_block(block, 256);
    assert!(cc
        .test_allocate_in_skipped_block(256 - crate::api::min_object_size() + 8)
        .is_null());
    cc.test_clear_skipped_blocks();
}

#[test]
fn dummy_fill_handles_header_sized_holes() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    let heap = mutator.heap_ref();
    let mut bytes_allocated = 0;
    let block = heap
        .region_space
        .alloc_nonvirtual(1024, &mut bytes_allocated, false);
    let cc = &heap.collector;

    // Smallest possible hole: falls back to a bare unit-typed header.
    let hole = crate::api::min_object_size();
    cc.test_fill_with_dummy_object(block, hole);
    let hdr = block as *mut crate::header::HeapObjectHeader;
    assert_eq!(unsafe { (*hdr).object_size() }, hole);

    // Larger holes become int arrays of the right length.
    let rest = unsafe { block.add(hole) };
    cc.test_fill_with_dummy_object(rest, 1024 - hole);
    let hdr = rest as *mut crate::header::HeapObjectHeader;
    assert_eq!(unsafe { (*hdr).object_size() }, 1024 - hole);

    // The containing region remains walkable across the dummies.
    let region = heap.region_space.region_at(block);
    let mut total = 0;
    let mut seen = 0;
    region.walk(|obj| {
        seen += 1;
        total += unsafe { (*obj).object_size() };
    });
    assert_eq!(seen, 2);
    assert_eq!(total, 1024);
}

#[test]
fn concurrent_mutators_keep_traversing_during_cycles() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    const NODES: u32 = 2000;
    let root = Arc::new({
        let head = build_list(&mutator, NODES);
        mutator.new_global_root(head)
    });

    let mut joins = Vec::new();
    for _ in 0..3 {
        let root = root.clone();
        joins.push(mutator.spawn_mutator(move |thread| {
            for _ in 0..30 {
                let stack = thread.shadow_stack();
                letroot!(cur = stack, Some(root.get(&thread)));
                let mut count = 0;
                loop {
                    thread.safepoint();
                    let node = match *cur {
                        Some(node) => node,
                        None => break,
                    };
                    assert_eq!(node.value, count);
                    count += 1;
                    *cur = node.next.as_ref().map(|f| thread.load(node, f));
                }
                assert_eq!(count, NODES);
            }
        }));
    }

    for _ in 0..3 {
        mutator.collect_garbage();
        // Exactly one copy per survivor, however many threads raced the
        // collector through the same references.
        assert_eq!(
            mutator.gc_stats().last_objects_moved.load(Ordering::Relaxed),
            NODES as u64
        );
    }
    for join in joins {
        join.join(&mutator);
    }
    assert_eq!(traverse(&mutator, root.get(&mutator)), NODES);
}

#[test]
fn concurrent_mutation_during_cycles_stays_coherent() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    const NODES: u32 = 500;
    let root = Arc::new({
        let head = build_list(&mutator, NODES);
        mutator.new_global_root(head)
    });

    let writer_root = root.clone();
    let writer = mutator.spawn_mutator(move |thread| {
        for round in 0..40u32 {
            // Splice a fresh node right behind the head through barriered
            // loads, then unlink it again.
            let stack = thread.shadow_stack();
            letroot!(head = stack, writer_root.get(&thread));
            letroot!(old_next = stack, head.next.as_ref().map(|f| thread.load(*head, f)));
            let fresh = thread.allocate(Node {
                value: u32::MAX - round,
                next: old_next.map(Gc::to_field),
            });
            head.next = Some(fresh.to_field());
            thread.write_barrier(*head);
            thread.safepoint();
            let fresh_now = thread.load(*head, head.next.as_ref().unwrap());
            head.next = fresh_now.next.as_ref().map(|f| thread.load(fresh_now, f).to_field());
            thread.write_barrier(*head);
            thread.safepoint();
        }
    });

    for _ in 0..4 {
        mutator.collect_garbage();
    }
    writer.join(&mutator);
    assert_eq!(traverse(&mutator, root.get(&mutator)), NODES);
}

#[test]
fn table_lookup_read_barrier_collects_too() {
    let mutator = instantiate_heap::<TableLookupReadBarrier>(test_params());
    let stack = mutator.shadow_stack();
    letroot!(head = stack, build_list(&mutator, 400));
    mutator.collect_garbage();
    assert_eq!(
        mutator.gc_stats().last_objects_moved.load(Ordering::Relaxed),
        400
    );
    assert_eq!(traverse(&mutator, *head), 400);
    // The table is fully cleared once marking ends.
    assert!(mutator.heap_ref().rb_table.is_all_cleared());
}

#[test]
fn safepoints_with_many_threads() {
    let mutator = instantiate_heap::<BakerReadBarrier>(test_params());
    const THREADS: usize = 8;
    const ITERATIONS: u32 = 3000;
    let counter = Arc::new(AtomicUsize::new(0));
    let mut joins = Vec::new();
    for _ in 0..THREADS {
        let counter = counter.clone();
        joins.push(mutator.spawn_mutator(move |thread| {
            for i in 0..ITERATIONS {
                counter.fetch_add(1, Ordering::AcqRel);
                let node = thread.allocate(Node {
                    value: i,
                    next: None,
                });
                assert_eq!(node.value, i);
                if i % 100 == 0 {
                    thread.safepoint();
                }
            }
        }));
    }
    for _ in 0..3 {
        mutator.collect_garbage();
    }
    for join in joins {
        join.join(&mutator);
    }
    assert_eq!(
        counter.load(Ordering::Relaxed),
        THREADS * ITERATIONS as usize
    );
}
