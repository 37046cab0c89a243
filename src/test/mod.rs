use crate::fatal::{set_fatal_mode, FatalMode};
use crate::{Runtime, RuntimeConfig, Scan, ScanPolicy};
use std::ptr::NonNull;

#[derive(Scan, Clone, Copy)]
#[repr(C)]
struct Node {
    value: u64,
    #[scan]
    next: Option<NonNull<Node>>,
}

fn small_runtime() -> Runtime {
    Runtime::new(RuntimeConfig {
        default_heap_size: 64 * 1024,
        scratch_heap_size: 64 * 1024,
        ..RuntimeConfig::default()
    })
}

fn fill(p: NonNull<u8>, len: usize, tag: u8) {
    unsafe { p.as_ptr().write_bytes(tag, len) };
}

fn all_bytes_are(p: *const u8, len: usize, tag: u8) -> bool {
    unsafe { std::slice::from_raw_parts(p, len) }
        .iter()
        .all(|b| *b == tag)
}

#[test]
fn pinned_heap_grows_in_place() {
    let runtime = small_runtime();
    let heap = runtime.new_heap(64 * 1024);
    let mut kept = Vec::new();

    heap.set_pinned(true);

    while heap.metrics().arenas < 2 {
        let tag = kept.len() as u8;
        let p = heap.alloc(1000, ScanPolicy::None);

        fill(p, 1000, tag);
        kept.push((p, tag));
    }

    assert!(kept.len() > 50);
    assert_eq!(heap.metrics().collections, 0);
    for (p, tag) in kept {
        assert!(all_bytes_are(p.as_ptr(), 1000, tag));
    }
}

#[test]
fn collecting_heap_moves_rooted_contents() {
    let runtime = small_runtime();
    let heap = runtime.new_heap(64 * 1024);
    let first = heap.alloc(500, ScanPolicy::None);

    fill(first, 500, 0xab);
    let root = heap.root(first.as_ptr());

    // Fill past the first arena with garbage.
    for i in 0..200 {
        fill(heap.alloc(1000, ScanPolicy::None), 1000, i as u8);
    }

    heap.collect();

    let metrics = heap.metrics();
    assert!(metrics.collections >= 1);
    assert_eq!(metrics.arenas, 1);
    assert!(all_bytes_are(root.get(0), 500, 0xab));
    assert!(heap.find_allocation(root.get(0) as usize).is_some());
}

#[test]
fn linked_records_survive_collection() {
    let runtime = small_runtime();
    let heap = runtime.new_heap(64 * 1024);
    let head = heap.roots(1);

    for i in 0..100u64 {
        let node = heap.alloc_value(Node { value: i, next: None });

        unsafe { (*node.as_ptr()).next = head.get_as(0) };
        head.set(0, node.as_ptr());
    }

    for _ in 0..20 {
        heap.alloc(256, ScanPolicy::None);
    }

    let stats = heap.collect();
    assert_eq!(stats.records_copied, 100);

    let mut cur = head.get_as::<Node>(0);
    let mut expected = 100;
    while let Some(node) = cur {
        expected -= 1;
        let node = unsafe { node.as_ref() };
        assert_eq!(node.value, expected);
        assert!(heap.contains(node as *const Node as usize));
        cur = node.next;
    }
    assert_eq!(expected, 0);
}

#[test]
fn pointers_from_other_heaps_are_rewritten() {
    let runtime = small_runtime();
    let young = runtime.new_heap(64 * 1024);
    let old = runtime.new_heap(64 * 1024);

    old.set_pinned(true);

    let target = young.alloc(64, ScanPolicy::None);
    fill(target, 64, 0x5a);

    let holder = old.alloc_words(2);
    unsafe { holder.as_ptr().write(target.as_ptr() as usize) };
    let _holder_root = old.root(holder.as_ptr().cast());

    let stats = young.collect();

    assert_eq!(stats.records_copied, 1);
    assert_eq!(stats.records_traced, 1);

    let moved = unsafe { holder.as_ptr().read() } as *const u8;
    assert_ne!(moved, target.as_ptr() as *const u8);
    assert!(young.contains(moved as usize));
    assert!(all_bytes_are(moved, 64, 0x5a));
}

#[test]
fn no_trace_heaps_are_ignored() {
    let runtime = small_runtime();
    let young = runtime.new_heap(64 * 1024);
    let other = runtime.new_heap(64 * 1024);

    other.set_no_trace(true);

    let target = young.alloc(64, ScanPolicy::None);
    let holder = other.alloc_words(1);
    unsafe { holder.as_ptr().write(target.as_ptr() as usize) };
    let _holder_root = other.root(holder.as_ptr().cast());

    let stats = young.collect();

    assert_eq!(stats.records_copied, 0);
    assert_eq!(stats.records_traced, 0);
}

#[test]
fn overflow_triggers_collection() {
    let runtime = small_runtime();
    let heap = runtime.new_heap(64 * 1024);
    let keep = heap.root(heap.alloc(100, ScanPolicy::None).as_ptr());

    fill(NonNull::new(keep.get(0)).unwrap(), 100, 0x11);

    for _ in 0..500 {
        heap.alloc(1000, ScanPolicy::None);
    }

    let metrics = heap.metrics();
    assert!(metrics.collections >= 1);
    assert!(metrics.total_alloc_count >= 501);
    assert!(all_bytes_are(keep.get(0), 100, 0x11));
}

#[test]
fn suspended_collections_grow_instead() {
    let runtime = small_runtime();
    let heap = runtime.new_heap(64 * 1024);

    runtime.suspend_collections();
    for _ in 0..200 {
        heap.alloc(1000, ScanPolicy::None);
    }
    runtime.allow_collections();

    let metrics = heap.metrics();
    assert_eq!(metrics.collections, 0);
    assert!(metrics.arenas >= 2);
}

#[test]
#[should_panic]
fn forced_collection_while_suspended_is_fatal() {
    set_fatal_mode(FatalMode::Panic);
    let runtime = small_runtime();
    let heap = runtime.new_heap(64 * 1024);

    runtime.suspend_collections();
    heap.collect();
}

#[test]
fn realloc_keeps_contents() {
    let runtime = small_runtime();
    let heap = runtime.new_heap(64 * 1024);
    let p = heap.alloc(40, ScanPolicy::None);

    fill(p, 40, 0x77);

    assert_eq!(heap.realloc(p, 10), p);

    let q = heap.realloc(p, 4000);
    assert_ne!(q, p);
    assert!(all_bytes_are(q.as_ptr(), 40, 0x77));
    assert!(heap.find_allocation(q.as_ptr() as usize).unwrap().len >= 4000);

    heap.free(q);
    assert!(all_bytes_are(q.as_ptr(), 40, 0));
}

#[test]
#[should_panic]
fn freeing_a_foreign_pointer_is_fatal() {
    set_fatal_mode(FatalMode::Panic);
    let runtime = small_runtime();
    let heap = runtime.new_heap(64 * 1024);
    let mut local = [0u8; 64];

    heap.free(NonNull::new(local.as_mut_ptr().wrapping_add(32)).unwrap());
}

#[test]
fn runtime_finds_allocations_across_heaps() {
    let runtime = small_runtime();
    let a = runtime.new_named_heap("a", 64 * 1024);
    let b = runtime.new_named_heap("b", 64 * 1024);
    let pa = a.alloc(24, ScanPolicy::None);
    let pb = b.alloc(24, ScanPolicy::None);

    assert_eq!(runtime.find_heap(pa.as_ptr() as usize).unwrap().id(), a.id());
    assert_eq!(runtime.find_allocation(pb.as_ptr() as usize).unwrap().heap_id, b.id());
    assert!(runtime.find_heap(8).is_none());

    let found = runtime.find_allocation(pa.as_ptr() as usize + 5).unwrap();
    assert_eq!(found.data, pa);
    if cfg!(feature = "alloc-site") {
        assert!(found.site.unwrap().file().ends_with("mod.rs"));
    }
}

#[test]
#[should_panic]
fn realloc_with_a_smashed_guard_is_fatal() {
    set_fatal_mode(FatalMode::Panic);
    let runtime = small_runtime();
    let heap = runtime.new_heap(64 * 1024);
    let p = heap.alloc(32, ScanPolicy::None);

    unsafe { (*crate::header::AllocHeader::of(p.as_ptr())).guard ^= 0xff };

    heap.realloc(p, 64);
}

#[test]
#[should_panic(expected = "exceeds the maximum record size")]
fn huge_requests_are_fatal() {
    set_fatal_mode(FatalMode::Panic);
    let runtime = small_runtime();
    let heap = runtime.new_heap(64 * 1024);

    heap.alloc(usize::MAX - 15, ScanPolicy::None);
}

#[test]
#[should_panic(expected = "exceeds the maximum record size")]
fn huge_word_arrays_are_fatal() {
    set_fatal_mode(FatalMode::Panic);
    let runtime = small_runtime();
    let heap = runtime.new_heap(64 * 1024);

    heap.alloc_words(usize::MAX / 4);
}

#[test]
#[should_panic(expected = "exceeds the maximum record size")]
fn requests_past_the_header_limit_are_fatal() {
    set_fatal_mode(FatalMode::Panic);
    let runtime = small_runtime();
    let heap = runtime.new_heap(64 * 1024);

    heap.alloc(u32::MAX as usize, ScanPolicy::None);
}

#[test]
fn roots_remember_where_they_were_registered() {
    let runtime = small_runtime();
    let heap = runtime.new_heap(64 * 1024);
    let _one = heap.root(heap.alloc(16, ScanPolicy::None).as_ptr());
    let _many = heap.roots(3);

    let dump = heap.debug_roots();

    assert!(dump.contains("has 2 root ranges"), "{dump}");
    assert!(dump.contains(" x1 registered at "), "{dump}");
    assert!(dump.contains(&format!(" x3 registered at {}", file!())), "{dump}");
}
