use super::arena::Arena;
use super::fatal::{self, Fatal};
use super::header::{AllocHeader, HEADER_SIZE, MOVED, PTR_SCAN, TRACED};
use super::heap::{find_record, Heap};
use super::runtime::{Shared, StackRegion};
use super::scan::ScanMap;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What one collection did.
#[derive(Clone, Debug, Default)]
pub struct CollectStats {
    pub heap_id: u64,
    /// Records copied into the new arena.
    pub records_copied: usize,
    /// Records in other heaps that were scanned in place.
    pub records_traced: usize,
    /// Bytes issued from the old arenas.
    pub bytes_before: usize,
    /// Bytes occupied by survivors in the new arena.
    pub bytes_after: usize,
    pub arena_len: usize,
    pub elapsed: Duration,
}

#[derive(Clone, Copy)]
struct Range {
    start: usize,
    end: usize,
    from_space: bool,
}

struct Collection {
    heap_id: u64,
    ranges: Vec<Range>,
    to_next: usize,
    to_end: usize,
    work: Vec<usize>,
    traced: Vec<usize>,
    map: ScanMap,
    copied: usize,
}

impl Collection {
    fn lookup(&self, addr: usize) -> Option<Range> {
        let idx = self.ranges.partition_point(|r| r.start <= addr);

        idx.checked_sub(1)
            .map(|i| self.ranges[i])
            .filter(|r| addr < r.end)
    }

    /// Returns the from-space header `word` resolves to when the word must
    /// be rewritten. Anything newly reached is copied or queued.
    fn check_one_word(&mut self, word: usize) -> Option<usize> {
        let range = self.lookup(word)?;
        let hdr_addr = unsafe { find_record(range.start, word)? };
        let hdr = unsafe { &mut *(hdr_addr as *mut AllocHeader) };

        if !range.from_space {
            if !hdr.is_set(TRACED) {
                hdr.flags |= TRACED;
                self.traced.push(hdr_addr);
                if hdr.is_set(PTR_SCAN) {
                    self.work.push(hdr_addr);
                }
            }
            return None;
        }

        if !hdr.is_set(MOVED) {
            self.copy_record(hdr);
        }

        Some(hdr_addr)
    }

    fn copy_record(&mut self, hdr: &mut AllocHeader) {
        let len = hdr.alloc_len as usize;
        let dst = self.to_next;

        if dst + len > self.to_end {
            fatal::raise(Fatal::ToSpaceExhausted {
                heap: self.heap_id,
                needed: dst + len - self.to_end,
            });
        }

        unsafe {
            ptr::copy_nonoverlapping(hdr as *const AllocHeader as *const u8, dst as *mut u8, len);

            let copy = &mut *(dst as *mut AllocHeader);
            copy.forward = 0;
            copy.flags &= !(MOVED | TRACED);
        }

        self.to_next += len;
        self.copied += 1;

        hdr.forward = dst;
        hdr.flags |= MOVED;

        if hdr.is_set(PTR_SCAN) {
            self.work.push(dst);
        }
    }

    fn rewrite(word: usize, from_hdr: usize) -> usize {
        let forward = unsafe { (*(from_hdr as *const AllocHeader)).forward };

        forward + (word - from_hdr)
    }

    fn visit(&mut self, cell: &AtomicUsize) {
        let word = cell.load(Ordering::Relaxed);

        if let Some(hdr) = self.check_one_word(word) {
            cell.store(Self::rewrite(word, hdr), Ordering::Relaxed);
        }
    }

    /// Treats `count` words at `addr` as roots.
    fn scan_root_set(&mut self, addr: usize, count: usize) {
        for i in 0..count {
            let cell = unsafe { AtomicUsize::from_ptr((addr + i * size_of::<usize>()) as *mut usize) };
            self.visit(cell);
        }
    }

    fn scan_record(&mut self, hdr_addr: usize) {
        let hdr = unsafe { &*(hdr_addr as *const AllocHeader) };
        let data = hdr_addr + HEADER_SIZE;
        let words = hdr.data_words();

        match hdr.scan_fn {
            None => self.scan_root_set(data, words),
            Some(scan_fn) => {
                let mut map = std::mem::take(&mut self.map);

                map.reset(words);
                scan_fn(words, &mut map);
                for w in map.iter() {
                    self.scan_root_set(data + w * size_of::<usize>(), 1);
                }

                self.map = map;
            }
        }
    }

    fn run_all_scans(&mut self) {
        while let Some(hdr) = self.work.pop() {
            self.scan_record(hdr);
        }
    }
}

/// Copies everything reachable in `heap` into one fresh arena.
///
/// Reachability starts from the root sets of every traceable heap and
/// from registered thread stacks. Pointers that land in other heaps are
/// followed so their records get scanned, but those records stay put.
pub(crate) fn collect(rt: Option<&Shared>, heap: &Heap, request: usize) -> CollectStats {
    let start_time = Instant::now();
    let _world = heap.safepoint.stop_the_world();

    if let Some(rt) = rt {
        rt.collector_running.fetch_add(1, Ordering::AcqRel);
    }

    let heaps: Vec<Arc<Heap>> = rt.map(Shared::heap_snapshot).unwrap_or_default();
    let stacks: Vec<StackRegion> = rt.map(Shared::stack_snapshot).unwrap_or_default();
    let local = heap.local_collects.load(Ordering::Acquire);

    let mut arenas = heap.arenas.lock();
    let cursor = heap.next.load(Ordering::Acquire);
    let bytes_before: usize = arenas.iter().map(|a| a.used_bytes(cursor)).sum();
    let factor = if heap.expand.load(Ordering::Acquire) { 2 } else { 1 };
    let to_len = heap
        .min_arena_len
        .load(Ordering::Relaxed)
        .max(bytes_before * factor);

    log::debug!(
        "heap {}: collecting {} bytes over {} arenas into {} bytes",
        heap.id,
        bytes_before,
        arenas.len(),
        to_len
    );

    let to_space = Arena::new(to_len).unwrap_or_else(|e| fatal::raise(Fatal::Map(e)));

    let mut ranges: Vec<Range> = arenas
        .iter()
        .map(|a| Range {
            start: a.addr_start(),
            end: a.addr_end(),
            from_space: true,
        })
        .collect();

    if !local {
        for other in heaps.iter().filter(|h| !ptr::eq(&***h, heap)) {
            if other.no_trace.load(Ordering::Acquire) {
                continue;
            }
            ranges.extend(other.arenas.lock().iter().map(|a| Range {
                start: a.addr_start(),
                end: a.addr_end(),
                from_space: false,
            }));
        }
    }

    ranges.sort_by_key(|r| r.start);

    let mut ctx = Collection {
        heap_id: heap.id,
        ranges,
        to_next: to_space.addr_start(),
        to_end: to_space.addr_end(),
        work: Vec::new(),
        traced: Vec::new(),
        map: ScanMap::default(),
        copied: 0,
    };

    trace_roots(&mut ctx, heap, &heaps);

    for stack in &stacks {
        ctx.scan_root_set(stack.addr, stack.len);
        ctx.run_all_scans();
    }

    for hdr in &ctx.traced {
        unsafe { (*(*hdr as *mut AllocHeader)).flags &= !TRACED };
    }

    let bytes_after = ctx.to_next - to_space.addr_start();
    let arena_len = to_space.user_length();
    let (to_start, to_end, to_next) = (to_space.addr_start(), to_space.addr_end(), ctx.to_next);
    let old = std::mem::replace(&mut *arenas, vec![to_space]);

    heap.install_cursor(to_start, to_end, to_next);
    heap.expand.store(
        bytes_after as f32 > heap.expand_threshold * arena_len as f32,
        Ordering::Release,
    );
    drop(arenas);
    drop(old);

    if to_end - to_next < request {
        heap.add_arena(heap.scratch_len.max(request));
    }

    let allocs = heap.alloc_count.swap(0, Ordering::Relaxed);
    heap.total_alloc_count.fetch_add(allocs, Ordering::Relaxed);
    heap.inherit_count.store(ctx.copied as u64, Ordering::Relaxed);

    if let Some(rt) = rt {
        rt.collector_running.fetch_sub(1, Ordering::AcqRel);
    }

    let stats = CollectStats {
        heap_id: heap.id,
        records_copied: ctx.copied,
        records_traced: ctx.traced.len(),
        bytes_before,
        bytes_after,
        arena_len,
        elapsed: start_time.elapsed(),
    };

    heap.counters.record(stats.elapsed);

    log::debug!(
        "heap {}: collection done, {} records copied ({} -> {} bytes), {} traced elsewhere, {:?}",
        heap.id,
        stats.records_copied,
        stats.bytes_before,
        stats.bytes_after,
        stats.records_traced,
        stats.elapsed
    );

    stats
}

fn trace_roots(ctx: &mut Collection, from: &Heap, heaps: &[Arc<Heap>]) {
    trace_one_rootset(ctx, from);

    for h in heaps.iter().filter(|h| !ptr::eq(&***h, from)) {
        if h.no_trace.load(Ordering::Acquire) {
            continue;
        }
        trace_one_rootset(ctx, h);
    }
}

fn trace_one_rootset(ctx: &mut Collection, heap: &Heap) {
    let roots: Vec<_> = heap.roots.lock().iter().map(|r| (r.addr, r.count, r.site)).collect();

    for (addr, count, site) in roots {
        log::trace!("heap {}: scanning {count} root words at {addr:#x} from {site}", heap.id);
        ctx.scan_root_set(addr, count);
        ctx.run_all_scans();
    }
}
