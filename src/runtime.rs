use super::collector::CollectStats;
use super::config::RuntimeConfig;
use super::fatal;
use super::heap::{Allocation, Heap};
use super::safepoint::Safepoint;
use super::spin::SpinLock;
use parking_lot::Mutex;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

#[derive(Clone, Copy)]
pub(crate) struct StackRegion {
    pub addr: usize,
    pub len: usize,
}

pub(crate) struct Shared {
    pub config: RuntimeConfig,
    pub safepoint: Arc<Safepoint>,
    /// Heap records, indexed by heap id. Released records stay in place
    /// and are handed out again by `new_heap`.
    pub heaps: SpinLock<Vec<Arc<Heap>>>,
    pub stacks: Mutex<Vec<Option<StackRegion>>>,
    pub collector_running: AtomicUsize,
    pub collections_suspended: AtomicBool,
}

impl Shared {
    pub fn heap_snapshot(&self) -> Vec<Arc<Heap>> {
        self.heaps
            .lock()
            .iter()
            .filter(|h| !h.is_released())
            .cloned()
            .collect()
    }

    pub fn stack_snapshot(&self) -> Vec<StackRegion> {
        self.stacks.lock().iter().flatten().copied().collect()
    }
}

/// The context every heap, lock-aware thread and VM hangs off.
///
/// Runtimes are independent of each other: heaps of one runtime are never
/// traced by collections in another.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
}

/// Keeps a word range scanned as roots by every collection until dropped.
pub(crate) struct StackRegistration {
    shared: Weak<Shared>,
    slot: usize,
}

impl Drop for StackRegistration {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            if let Some(entry) = shared.stacks.lock().get_mut(self.slot) {
                *entry = None;
            }
        }
    }
}

impl Runtime {
    #[track_caller]
    pub fn new(config: RuntimeConfig) -> Self {
        let site = Location::caller();

        if let Some(mode) = config.fatal_mode {
            fatal::set_fatal_mode(mode);
        }

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let safepoint = Safepoint::new();
            let default_heap = Arc::new(Heap::new(
                0,
                weak.clone(),
                safepoint.clone(),
                &config,
                String::new(),
                site,
            ));

            default_heap.init(config.default_heap_size, "default".to_string(), site);

            Shared {
                config,
                safepoint,
                heaps: SpinLock::new(vec![default_heap]),
                stacks: Mutex::new(Vec::new()),
                collector_running: AtomicUsize::new(0),
                collections_suspended: AtomicBool::new(false),
            }
        });

        log::debug!("runtime created at {site}");

        Runtime { shared }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn safepoint(&self) -> &Arc<Safepoint> {
        &self.shared.safepoint
    }

    pub fn default_heap(&self) -> Arc<Heap> {
        self.shared.heaps.lock()[0].clone()
    }

    /// Creates a heap, recycling a released heap record when one exists.
    /// With `initial_bytes > 0` the first arena is mapped right away.
    #[track_caller]
    pub fn new_heap(&self, initial_bytes: usize) -> Arc<Heap> {
        self.new_named_heap("", initial_bytes)
    }

    #[track_caller]
    pub fn new_named_heap(&self, name: &str, initial_bytes: usize) -> Arc<Heap> {
        let site = Location::caller();
        let mut heaps = self.shared.heaps.lock();

        let recycled = heaps.iter().find(|h| h.is_released()).cloned();

        if let Some(heap) = recycled {
            heap.init(initial_bytes, name.to_string(), site);
            drop(heaps);
            log::debug!("recycled heap {} for {site}", heap.id());

            return heap;
        }

        let heap = Arc::new(Heap::new(
            heaps.len() as u64,
            Arc::downgrade(&self.shared),
            self.shared.safepoint.clone(),
            &self.shared.config,
            String::new(),
            site,
        ));

        heaps.push(heap.clone());
        drop(heaps);

        heap.init(initial_bytes, name.to_string(), site);
        log::debug!("created heap {} for {site}", heap.id());

        heap
    }

    /// Unmaps the heap's arenas and marks its record for reuse. The
    /// default heap is never released.
    pub fn delete_heap(&self, heap: &Arc<Heap>) {
        if heap.id() == 0 {
            log::warn!("refusing to delete the default heap");
            return;
        }

        let _heaps = self.shared.heaps.lock();

        heap.release();
        log::debug!("deleted heap {}", heap.id());
    }

    /// Every heap record that is currently in use.
    pub fn heaps(&self) -> Vec<Arc<Heap>> {
        self.shared.heap_snapshot()
    }

    pub fn find_heap(&self, addr: usize) -> Option<Arc<Heap>> {
        self.shared
            .heap_snapshot()
            .into_iter()
            .find(|h| h.contains(addr))
    }

    pub fn find_allocation(&self, addr: usize) -> Option<Allocation> {
        self.shared
            .heap_snapshot()
            .iter()
            .find_map(|h| h.find_allocation(addr))
    }

    /// Registers process-wide pointers as roots on the default heap.
    ///
    /// # Safety
    ///
    /// See [`Heap::register_root`].
    #[track_caller]
    pub unsafe fn register_global_root(&self, addr: *const usize, count: usize) {
        self.default_heap().register_root(addr, count);
    }

    /// Turns a heap into one that only grows, for data that must keep its
    /// address for the rest of the run.
    pub fn long_term_pin(&self, heap: &Heap) {
        heap.set_pinned(true);
    }

    /// While suspended, exhausted heaps grow instead of collecting and an
    /// explicit collection request is fatal.
    pub fn suspend_collections(&self) {
        self.shared.collections_suspended.store(true, Ordering::Release);
    }

    pub fn allow_collections(&self) {
        self.shared
            .collections_suspended
            .store(false, Ordering::Release);
    }

    pub fn collections_suspended(&self) -> bool {
        self.shared.collections_suspended.load(Ordering::Acquire)
    }

    pub fn collector_running(&self) -> bool {
        self.shared.collector_running.load(Ordering::Acquire) > 0
    }

    #[track_caller]
    pub fn collect(&self, heap: &Heap) -> CollectStats {
        heap.collect()
    }

    pub fn checkin(&self) {
        self.shared.safepoint.checkin();
    }

    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        self.shared.safepoint.blocking(f)
    }

    /// Registers `len` atomic words at `addr` to be scanned as roots.
    pub(crate) fn register_stack(&self, addr: *const AtomicUsize, len: usize) -> StackRegistration {
        let region = StackRegion {
            addr: addr as usize,
            len,
        };
        let mut stacks = self.shared.stacks.lock();
        let slot = match stacks.iter().position(Option::is_none) {
            Some(slot) => {
                stacks[slot] = Some(region);
                slot
            }
            None => {
                stacks.push(Some(region));
                stacks.len() - 1
            }
        };

        StackRegistration {
            shared: Arc::downgrade(&self.shared),
            slot,
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new(RuntimeConfig::from_env())
    }
}
