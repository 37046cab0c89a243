use super::arena::Arena;
use super::collector::{self, CollectStats};
use super::config::RuntimeConfig;
use super::fatal::{self, Fatal};
use super::header::{guard_word, record_len, AllocHeader, AllocSite, HEADER_SIZE, PTR_SCAN};
use super::metrics::{CollectCounters, HeapMetrics};
use super::runtime::Shared;
use super::safepoint::{current_thread_id, Safepoint};
use super::scan::{Scan, ScanPolicy};
use parking_lot::Mutex;
use std::fmt::Write;
use std::mem::size_of;
use std::panic::Location;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

pub(crate) struct RootInfo {
    pub addr: usize,
    pub count: usize,
    pub site: AllocSite,
}

struct HeapMeta {
    name: String,
    site: AllocSite,
}

/// An owner of a chain of arenas with a lock-free bump allocator.
///
/// The cursor (`next` plus the thread that last reserved from it) always
/// refers to the newest arena, whose bounds are mirrored in `cur_start`
/// and `cur_end`. A cursor outside those bounds means another thread is
/// installing a new arena or collecting, and allocators retry.
pub struct Heap {
    pub(crate) id: u64,
    meta: Mutex<HeapMeta>,
    pub(crate) runtime: Weak<Shared>,
    pub(crate) safepoint: Arc<Safepoint>,

    pub(crate) next: AtomicUsize,
    owner: AtomicU64,
    pub(crate) cur_start: AtomicUsize,
    pub(crate) cur_end: AtomicUsize,

    pub(crate) arenas: Mutex<Vec<Arena>>,
    grow_lock: Mutex<()>,
    pub(crate) roots: Mutex<Vec<RootInfo>>,

    pub(crate) min_arena_len: AtomicUsize,
    pub(crate) scratch_len: usize,
    pub(crate) expand_threshold: f32,

    pub(crate) alloc_count: AtomicU64,
    pub(crate) total_alloc_count: AtomicU64,
    pub(crate) inherit_count: AtomicU64,
    pub(crate) counters: CollectCounters,

    pub(crate) pinned: AtomicBool,
    pub(crate) released: AtomicBool,
    pub(crate) expand: AtomicBool,
    pub(crate) no_trace: AtomicBool,
    pub(crate) local_collects: AtomicBool,
}

/// Where an address landed when looked up with
/// [`crate::Runtime::find_allocation`] or [`Heap::find_allocation`].
#[derive(Clone, Copy, Debug)]
pub struct Allocation {
    pub heap_id: u64,
    pub header: NonNull<AllocHeader>,
    pub data: NonNull<u8>,
    /// Usable data bytes.
    pub len: usize,
    pub site: Option<AllocSite>,
}

impl Heap {
    pub(crate) fn new(
        id: u64,
        runtime: Weak<Shared>,
        safepoint: Arc<Safepoint>,
        config: &RuntimeConfig,
        name: String,
        site: AllocSite,
    ) -> Self {
        Self {
            id,
            meta: Mutex::new(HeapMeta { name, site }),
            runtime,
            safepoint,
            next: AtomicUsize::new(0),
            owner: AtomicU64::new(0),
            cur_start: AtomicUsize::new(0),
            cur_end: AtomicUsize::new(0),
            arenas: Mutex::new(Vec::new()),
            grow_lock: Mutex::new(()),
            roots: Mutex::new(Vec::new()),
            min_arena_len: AtomicUsize::new(config.scratch_heap_size),
            scratch_len: config.scratch_heap_size,
            expand_threshold: config.expand_threshold,
            alloc_count: AtomicU64::new(0),
            total_alloc_count: AtomicU64::new(0),
            inherit_count: AtomicU64::new(0),
            counters: CollectCounters::default(),
            pinned: AtomicBool::new(false),
            released: AtomicBool::new(false),
            expand: AtomicBool::new(false),
            no_trace: AtomicBool::new(false),
            local_collects: AtomicBool::new(false),
        }
    }

    /// Prepares a fresh or recycled heap record for use.
    pub(crate) fn init(&self, initial_bytes: usize, name: String, site: AllocSite) {
        {
            let mut meta = self.meta.lock();
            meta.name = name;
            meta.site = site;
        }

        self.released.store(false, Ordering::Release);

        if initial_bytes > 0 {
            self.min_arena_len.store(initial_bytes, Ordering::Relaxed);
            self.add_arena(initial_bytes);
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> String {
        self.meta.lock().name.clone()
    }

    pub fn creation_site(&self) -> AllocSite {
        self.meta.lock().site
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    /// Pinned heaps grow by adding arenas and are never collected
    /// implicitly.
    pub fn set_pinned(&self, pinned: bool) {
        self.pinned.store(pinned, Ordering::Release);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Pointers into this heap are neither followed nor rewritten by
    /// collections of other heaps.
    pub fn set_no_trace(&self, no_trace: bool) {
        self.no_trace.store(no_trace, Ordering::Release);
    }

    /// Collections of this heap only consult its own roots and never scan
    /// records that live in other heaps.
    pub fn set_local_collects(&self, local: bool) {
        self.local_collects.store(local, Ordering::Release);
    }

    /// The thread that most recently reserved memory from the cursor.
    pub fn cursor_owner(&self) -> u64 {
        self.owner.load(Ordering::Relaxed)
    }

    /// Maps a new arena of at least `byte_len` bytes and makes it current.
    pub fn add_arena(&self, byte_len: usize) {
        let arena = Arena::new(byte_len).unwrap_or_else(|e| fatal::raise(Fatal::Map(e)));
        let mut arenas = self.arenas.lock();

        if let Some(newest) = arenas.last() {
            newest.set_last_issued(self.next.load(Ordering::Acquire));
        }

        let (start, end) = (arena.addr_start(), arena.addr_end());

        arenas.push(arena);
        self.install_cursor(start, end, start);

        log::trace!(
            "heap {} added arena {:#x}..{:#x} ({} arenas)",
            self.id,
            start,
            end,
            arenas.len()
        );
    }

    /// Points the cursor at a new arena. The cursor is invalidated first so
    /// a reader never pairs the new bounds with an old `next`.
    pub(crate) fn install_cursor(&self, start: usize, end: usize, next: usize) {
        self.next.store(0, Ordering::SeqCst);
        self.cur_start.store(start, Ordering::SeqCst);
        self.cur_end.store(end, Ordering::SeqCst);
        self.next.store(next, Ordering::SeqCst);
    }

    fn reset_cursor(&self) {
        self.next.store(0, Ordering::SeqCst);
        self.cur_start.store(0, Ordering::SeqCst);
        self.cur_end.store(0, Ordering::SeqCst);
    }

    /// Installs the first arena unless another thread beat us to it.
    fn add_first_arena(&self, record_len: usize) {
        let _grow = self.grow_lock.lock();

        if self.cur_start.load(Ordering::Acquire) == 0 {
            let len = self.min_arena_len.load(Ordering::Relaxed).max(record_len);
            self.add_arena(len);
        }
    }

    /// Grows without collecting unless the cursor already moved on.
    fn add_emergency_arena(&self, record_len: usize, seen_next: usize) {
        let _grow = self.grow_lock.lock();

        if self.next.load(Ordering::Acquire) == seen_next {
            self.add_arena(self.scratch_len.max(record_len));
        }
    }

    fn may_collect(&self) -> bool {
        if self.is_pinned() {
            return false;
        }

        match self.runtime.upgrade() {
            Some(rt) => {
                rt.collector_running.load(Ordering::Acquire) == 0
                    && !rt.collections_suspended.load(Ordering::Acquire)
            }
            None => false,
        }
    }

    fn collector_is_current_thread(&self) -> bool {
        match self.runtime.upgrade() {
            Some(rt) => {
                rt.collector_running.load(Ordering::Acquire) > 0 && self.safepoint.is_requestor()
            }
            None => false,
        }
    }

    /// Reserves `len` bytes of data. Never fails: running out of room
    /// either grows the heap or collects it. The returned pointer is only
    /// stable until the next allocation unless it is reachable from a root.
    #[track_caller]
    pub fn alloc(&self, len: usize, policy: ScanPolicy) -> NonNull<u8> {
        let site = Location::caller();
        let Some(record_len) = record_len(len) else {
            fatal::raise(Fatal::TooLarge { requested: len });
        };

        loop {
            self.safepoint.checkin();

            let next = self.next.load(Ordering::Acquire);
            let start = self.cur_start.load(Ordering::Acquire);
            let end = self.cur_end.load(Ordering::Acquire);

            if start == 0 {
                self.add_first_arena(record_len);
                continue;
            }

            if next < start || next > end {
                if self.collector_is_current_thread() {
                    self.add_emergency_arena(record_len, next);
                } else {
                    thread::yield_now();
                }
                continue;
            }

            let new_next = next + record_len;

            if self
                .next
                .compare_exchange_weak(next, new_next, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            if new_next > end {
                if self.may_collect() {
                    self.collect_for(record_len);
                } else {
                    self.add_emergency_arena(record_len, new_next);
                }
                continue;
            }

            self.owner.store(current_thread_id(), Ordering::Relaxed);
            self.alloc_count.fetch_add(1, Ordering::Relaxed);

            unsafe {
                let header = AllocHeader::init(next, record_len, policy, Some(site));
                return NonNull::new_unchecked((*header).data());
            }
        }
    }

    /// Allocates room for a `T` and moves `value` into it.
    #[track_caller]
    pub fn alloc_value<T: Scan + Copy>(&self, value: T) -> NonNull<T> {
        assert!(std::mem::align_of::<T>() <= super::config::FORCED_ALIGNMENT);

        let ptr = self.alloc(size_of::<T>(), T::POLICY).cast::<T>();

        unsafe { ptr.as_ptr().write(value) };

        ptr
    }

    /// Allocates a pointer-scanned array of `count` words.
    #[track_caller]
    pub fn alloc_words(&self, count: usize) -> NonNull<usize> {
        let Some(len) = count.checked_mul(size_of::<usize>()) else {
            fatal::raise(Fatal::TooLarge { requested: count.saturating_mul(size_of::<usize>()) });
        };

        self.alloc(len, ScanPolicy::All).cast()
    }

    /// Grows the allocation at `ptr` to at least `new_len` bytes.
    ///
    /// Returns `ptr` when the record already has room. Otherwise the data
    /// is copied into a fresh allocation from this heap.
    #[track_caller]
    pub fn realloc(&self, ptr: NonNull<u8>, new_len: usize) -> NonNull<u8> {
        let header = self.own_header(ptr);

        if header.data_len() >= new_len {
            return ptr;
        }

        let policy = match (header.is_set(PTR_SCAN), header.scan_fn) {
            (false, _) => ScanPolicy::None,
            (true, Some(f)) => ScanPolicy::Map(f),
            (true, None) => ScanPolicy::All,
        };
        let old_len = header.data_len();

        // The old record must survive a collection triggered by the alloc.
        let slot = AtomicUsize::new(ptr.as_ptr() as usize);
        unsafe { self.register_root(slot.as_ptr(), 1) };

        let fresh = self.alloc(new_len, policy);

        self.remove_root(slot.as_ptr());

        unsafe {
            let old = slot.load(Ordering::Acquire) as *const u8;
            ptr::copy_nonoverlapping(old, fresh.as_ptr(), old_len);
        }

        fresh
    }

    /// Zeroes the data of the allocation at `ptr`. The memory itself is
    /// only reclaimed by a collection or by clearing the heap.
    #[track_caller]
    pub fn free(&self, ptr: NonNull<u8>) {
        let header = self.own_header(ptr);

        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, header.data_len()) };
    }

    #[track_caller]
    fn own_header(&self, ptr: NonNull<u8>) -> &mut AllocHeader {
        let addr = ptr.as_ptr() as usize;

        if !self.contains(addr) {
            fatal::raise(Fatal::NotAnAllocation { addr });
        }

        unsafe { AllocHeader::validate(ptr.as_ptr()) }
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.arenas.lock().iter().any(|a| a.contains(addr))
    }

    /// Locates the record holding `addr`, which may point anywhere inside
    /// its header or data.
    pub fn find_allocation(&self, addr: usize) -> Option<Allocation> {
        let arenas = self.arenas.lock();
        let arena = arenas.iter().find(|a| a.contains(addr))?;
        let header = unsafe { find_record(arena.addr_start(), addr)? };

        unsafe {
            let h = &*(header as *const AllocHeader);

            Some(Allocation {
                heap_id: self.id,
                header: NonNull::new_unchecked(header as *mut AllocHeader),
                data: NonNull::new_unchecked(h.data()),
                len: h.data_len(),
                site: h.site(),
            })
        }
    }

    /// Registers `count` words starting at `addr` as roots of this heap.
    ///
    /// # Safety
    ///
    /// The words must stay valid and word aligned until
    /// [`Heap::remove_root`] is called for `addr`. The collector rewrites
    /// them while the world is stopped.
    #[track_caller]
    pub unsafe fn register_root(&self, addr: *const usize, count: usize) {
        self.roots.lock().push(RootInfo {
            addr: addr as usize,
            count,
            site: Location::caller(),
        });
    }

    pub fn remove_root(&self, addr: *const usize) {
        let mut roots = self.roots.lock();

        if let Some(idx) = roots.iter().position(|r| r.addr == addr as usize) {
            roots.swap_remove(idx);
        }
    }

    pub fn root_count(&self) -> usize {
        self.roots.lock().len()
    }

    /// Renders each registered root range and the call that registered it.
    pub fn debug_roots(&self) -> String {
        let roots = self.roots.lock();
        let mut out = format!("heap {} has {} root ranges:\n", self.id, roots.len());

        for r in roots.iter() {
            let _ = writeln!(out, "  {:#x} x{} registered at {}", r.addr, r.count, r.site);
        }

        out
    }

    /// A single rooted word holding `ptr`.
    #[track_caller]
    pub fn root(self: &Arc<Self>, ptr: *mut u8) -> Roots {
        let roots = self.roots(1);

        roots.set(0, ptr);
        roots
    }

    /// `count` rooted words, all null to begin with.
    #[track_caller]
    pub fn roots(self: &Arc<Self>, count: usize) -> Roots {
        let words: Box<[AtomicUsize]> = (0..count.max(1)).map(|_| AtomicUsize::new(0)).collect();

        unsafe { self.register_root(words.as_ptr() as *const usize, words.len()) };

        Roots {
            heap: self.clone(),
            words,
        }
    }

    /// Forces a collection of this heap, pinned or not.
    #[track_caller]
    pub fn collect(&self) -> CollectStats {
        self.collect_for(0)
    }

    #[track_caller]
    fn collect_for(&self, request: usize) -> CollectStats {
        let rt = self.runtime.upgrade();

        if let Some(rt) = &rt {
            if rt.collections_suspended.load(Ordering::Acquire) {
                fatal::raise(Fatal::CollectionSuspended(self.id));
            }
        }

        collector::collect(rt.as_deref(), self, request)
    }

    /// Unmaps every arena. The next allocation maps a fresh one.
    pub fn clear(&self) {
        let _grow = self.grow_lock.lock();
        let old = {
            let mut arenas = self.arenas.lock();
            self.reset_cursor();
            std::mem::take(&mut *arenas)
        };

        log::debug!("heap {} cleared ({} arenas)", self.id, old.len());
    }

    /// Unmaps every arena but the newest.
    pub fn prune(&self) {
        let _grow = self.grow_lock.lock();
        let mut arenas = self.arenas.lock();
        let keep_from = arenas.len().saturating_sub(1);
        let dropped: Vec<Arena> = arenas.drain(..keep_from).collect();

        log::debug!("heap {} pruned {} arenas", self.id, dropped.len());
    }

    /// Forgets everything but the id, leaving the record ready for reuse.
    pub(crate) fn release(&self) {
        self.clear();
        self.roots.lock().clear();
        self.alloc_count.store(0, Ordering::Relaxed);
        self.total_alloc_count.store(0, Ordering::Relaxed);
        self.inherit_count.store(0, Ordering::Relaxed);
        self.owner.store(0, Ordering::Relaxed);
        self.min_arena_len.store(self.scratch_len, Ordering::Relaxed);

        for flag in [
            &self.pinned,
            &self.expand,
            &self.no_trace,
            &self.local_collects,
        ] {
            flag.store(false, Ordering::Relaxed);
        }

        self.meta.lock().name.clear();
        self.released.store(true, Ordering::Release);
    }

    pub fn metrics(&self) -> HeapMetrics {
        let arenas = self.arenas.lock();
        let cursor = self.next.load(Ordering::Acquire);

        HeapMetrics {
            heap_id: self.id,
            arenas: arenas.len(),
            bytes_reserved: arenas.iter().map(|a| a.user_length()).sum(),
            bytes_used: arenas.iter().map(|a| a.used_bytes(cursor)).sum(),
            alloc_count: self.alloc_count.load(Ordering::Relaxed),
            total_alloc_count: self.total_alloc_count.load(Ordering::Relaxed)
                + self.alloc_count.load(Ordering::Relaxed),
            inherit_count: self.inherit_count.load(Ordering::Relaxed),
            collections: self.counters.collections(),
            last_collect_time: self.counters.last(),
            avg_collect_time: self.counters.avg(),
        }
    }
}

/// Walks back from `addr` to the nearest guard word and accepts the
/// record if its length covers `addr`. Returns the header address.
///
/// # Safety
///
/// `[arena_start, addr]` must be mapped.
pub(crate) unsafe fn find_record(arena_start: usize, addr: usize) -> Option<usize> {
    let guard = guard_word();
    let mut probe = addr & !(super::config::FORCED_ALIGNMENT - 1);

    loop {
        if probe < arena_start {
            return None;
        }

        if *(probe as *const u64) == guard {
            let len = (*(probe as *const AllocHeader)).alloc_len as usize;

            return (len >= HEADER_SIZE && probe + len > addr).then_some(probe);
        }

        probe = probe.checked_sub(super::config::FORCED_ALIGNMENT)?;
    }
}

/// Words registered as roots for as long as this handle lives.
pub struct Roots {
    heap: Arc<Heap>,
    words: Box<[AtomicUsize]>,
}

impl Roots {
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn get(&self, idx: usize) -> *mut u8 {
        self.words[idx].load(Ordering::Acquire) as *mut u8
    }

    pub fn get_as<T>(&self, idx: usize) -> Option<NonNull<T>> {
        NonNull::new(self.get(idx).cast())
    }

    pub fn set<T>(&self, idx: usize, ptr: *mut T) {
        self.words[idx].store(ptr as usize, Ordering::Release);
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }
}

impl Drop for Roots {
    fn drop(&mut self) {
        self.heap.remove_root(self.words.as_ptr() as *const usize);
    }
}

#[cfg(test)]
mod tests {
    use crate::{Runtime, RuntimeConfig, ScanPolicy};

    #[test]
    fn find_record_accepts_interior_pointers() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let heap = runtime.new_heap(64 * 1024);
        let a = heap.alloc(40, ScanPolicy::None);
        let b = heap.alloc(40, ScanPolicy::None);

        let found = heap.find_allocation(a.as_ptr() as usize + 33).unwrap();
        assert_eq!(found.data, a);
        assert!(found.len >= 40);

        let found = heap.find_allocation(b.as_ptr() as usize).unwrap();
        assert_eq!(found.data, b);
    }

    #[test]
    fn nothing_found_past_the_cursor() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let heap = runtime.new_heap(64 * 1024);
        let a = heap.alloc(16, ScanPolicy::None);

        assert!(heap.find_allocation(a.as_ptr() as usize + 4096).is_none());
    }

    #[test]
    fn clear_then_allocate_maps_again() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let heap = runtime.new_heap(64 * 1024);

        heap.alloc(100, ScanPolicy::None);
        heap.clear();
        assert_eq!(heap.metrics().arenas, 0);

        heap.alloc(100, ScanPolicy::None);
        assert_eq!(heap.metrics().arenas, 1);
    }
}
