//! Mutexes, read-write locks and condition variables that cooperate with
//! stop-the-world collection and keep enough bookkeeping to explain a
//! deadlock after the fact.
//!
//! Every lock records its creation site, its owner and the last few
//! places it was acquired from. Each thread keeps a stack of the locks it
//! holds and, while blocked, the lock it is waiting on. With the `lock-debug` feature all live locks are also kept in a
//! process-wide registry so [`debug_all_locks`] can dump them.
//!
//! Blocking acquisitions suspend the calling thread in every safepoint
//! it takes part in, so a thread waiting on a lock never holds up a
//! collection.

mod condition;
mod mutex;
mod rwlock;

pub use condition::Condition;
pub use mutex::{Mutex, MutexGuard};
pub use rwlock::RwLock;

use super::config::LOCK_DEBUG_RING;
use super::fatal::{self, Fatal};
use super::safepoint::{current_thread_id, resume_current_thread, suspend_current_thread};
use std::fmt::Write;
use std::panic::Location;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Site = &'static Location<'static>;

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LockKind {
    Mutex,
    RwLock,
    Condition,
}

/// Lock state shared by all three kinds.
pub(crate) trait Lockable: Send + Sync {
    fn info(&self) -> &LockInfo;

    /// Drops every level the current thread holds.
    fn force_release(&self);

    /// Extra state for the debug dump.
    fn describe_extra(&self) -> String {
        String::new()
    }
}

struct Ring {
    sites: [Option<Site>; LOCK_DEBUG_RING],
    next: usize,
}

pub(crate) struct LockInfo {
    id: u64,
    kind: LockKind,
    name: String,
    site: Site,
    owner: AtomicU64,
    level: AtomicU32,
    ring: parking_lot::Mutex<Ring>,
}

impl LockInfo {
    pub fn new(kind: LockKind, name: &str, site: Site) -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            name: name.to_string(),
            site,
            owner: AtomicU64::new(0),
            level: AtomicU32::new(0),
            ring: parking_lot::Mutex::new(Ring {
                sites: [None; LOCK_DEBUG_RING],
                next: 0,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<u64> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            t => Some(t),
        }
    }

    pub fn set_owner(&self, owner: Option<u64>) {
        self.owner.store(owner.unwrap_or(0), Ordering::Release);
    }

    pub fn owned_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_thread_id()
    }

    pub fn level(&self) -> u32 {
        self.level.load(Ordering::Acquire)
    }

    pub fn set_level(&self, level: u32) {
        self.level.store(level, Ordering::Release);
    }

    pub fn nest(&self) {
        self.level.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one nesting level. Returns `false` when the caller holds the
    /// outermost level.
    pub fn unnest(&self) -> bool {
        self.level
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |l| l.checked_sub(1))
            .is_ok()
    }

    pub fn record_site(&self, site: Site) {
        if cfg!(feature = "lock-debug") {
            let mut ring = self.ring.lock();
            let slot = ring.next & (LOCK_DEBUG_RING - 1);

            ring.sites[slot] = Some(site);
            ring.next = ring.next.wrapping_add(1);
        }
    }

    /// Acquisition sites, oldest first.
    pub fn recent_sites(&self) -> Vec<Site> {
        let ring = self.ring.lock();
        let start = ring.next;

        (0..LOCK_DEBUG_RING)
            .filter_map(|i| ring.sites[(start + i) & (LOCK_DEBUG_RING - 1)])
            .collect()
    }

    #[track_caller]
    pub fn fatal(&self, reason: &'static str) -> ! {
        fatal::raise(Fatal::Lock {
            reason,
            name: self.display_name(),
            site: self.site.to_string(),
            owner: self.owner(),
            caller: current_thread_id(),
        })
    }

    fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("{:?} #{}", self.kind, self.id)
        } else {
            format!("{:?} '{}'", self.kind, self.name)
        }
    }

    fn describe(&self, extra: &str, out: &mut String) {
        let _ = write!(out, "{} (created {})", self.display_name(), self.site);

        match self.owner() {
            Some(owner) => {
                let _ = write!(out, " held by thread {owner} at level {}", self.level());
            }
            None => out.push_str(" unlocked"),
        }

        if !extra.is_empty() {
            let _ = write!(out, " {extra}");
        }

        out.push('\n');

        for site in self.recent_sites() {
            let _ = writeln!(out, "    acquired at {site}");
        }
    }
}

struct Held {
    id: u64,
    lock: Arc<dyn Lockable>,
}

#[derive(Default)]
struct ThreadState {
    held: Vec<Held>,
    waiting: Option<(String, Site)>,
}

/// One thread's held stack and wait target, shared with the dump.
struct ThreadLocks {
    thread: u64,
    state: parking_lot::Mutex<ThreadState>,
}

static THREADS: parking_lot::Mutex<Vec<Weak<ThreadLocks>>> = parking_lot::const_mutex(Vec::new());

thread_local! {
    static LOCKS: Arc<ThreadLocks> = {
        let locks = Arc::new(ThreadLocks {
            thread: current_thread_id(),
            state: parking_lot::Mutex::new(ThreadState::default()),
        });
        let mut threads = THREADS.lock();

        if threads.len().is_power_of_two() {
            threads.retain(|t| t.strong_count() > 0);
        }
        threads.push(Arc::downgrade(&locks));

        locks
    };
}

fn with_state<R>(f: impl FnOnce(&mut ThreadState) -> R) -> Option<R> {
    LOCKS.try_with(|locks| f(&mut locks.state.lock())).ok()
}

/// Records that the current thread took `lock` at its outermost level.
pub(crate) fn push_held(lock: Arc<dyn Lockable>) {
    let id = lock.info().id();
    let duplicate = with_state(|state| {
        let duplicate = state.held.iter().any(|h| h.id == id);

        if !duplicate {
            state.held.push(Held { id, lock: lock.clone() });
        }
        duplicate
    })
    .unwrap_or(false);

    if duplicate {
        lock.info().fatal("lock already on the held stack");
    }
}

/// Removes `id` from the held stack, wherever it sits.
pub(crate) fn remove_held(id: u64) {
    let removed = with_state(|state| {
        state
            .held
            .iter()
            .rposition(|h| h.id == id)
            .map(|pos| state.held.remove(pos))
    });

    // The Arc is dropped outside the borrow in case it is the last one.
    drop(removed);
}

/// Number of locks the current thread holds other than `id`.
pub(crate) fn other_held(id: u64) -> usize {
    with_state(|state| state.held.iter().filter(|h| h.id != id).count()).unwrap_or(0)
}

/// Number of locks the current thread holds.
pub fn held_lock_count() -> usize {
    with_state(|state| state.held.len()).unwrap_or(0)
}

/// Runs a blocking wait on `info`, suspended in every safepoint and
/// visible to [`debug_all_locks`] as the thread's wait target.
pub(crate) fn block_on<R>(info: &LockInfo, site: Site, wait: impl FnOnce() -> R) -> R {
    with_state(|state| state.waiting = Some((info.display_name(), site)));
    suspend_current_thread();

    let result = wait();

    resume_current_thread();
    with_state(|state| state.waiting = None);

    result
}

/// Releases every lock the current thread holds, newest first.
pub fn unlock_all() {
    loop {
        let newest = with_state(|state| state.held.last().map(|h| h.lock.clone())).flatten();

        match newest {
            Some(lock) => lock.force_release(),
            None => break,
        }
    }
}

#[cfg(feature = "lock-debug")]
static REGISTRY: parking_lot::Mutex<Vec<Weak<dyn Lockable>>> = parking_lot::const_mutex(Vec::new());

pub(crate) fn register(lock: Weak<dyn Lockable>) {
    #[cfg(feature = "lock-debug")]
    {
        let mut registry = REGISTRY.lock();

        if registry.len().is_power_of_two() {
            registry.retain(|l| l.strong_count() > 0);
        }
        registry.push(lock);
    }

    #[cfg(not(feature = "lock-debug"))]
    let _ = lock;
}

/// Renders every live lock, its owner and its recent acquisition sites,
/// followed by the held stack and wait target of every thread that has
/// either.
pub fn debug_all_locks() -> String {
    let mut out = String::new();

    #[cfg(feature = "lock-debug")]
    {
        let live: Vec<Arc<dyn Lockable>> = REGISTRY.lock().iter().filter_map(Weak::upgrade).collect();

        let _ = writeln!(out, "{} live locks:", live.len());
        for lock in &live {
            out.push_str("  ");
            lock.info().describe(&lock.describe_extra(), &mut out);
        }
    }

    #[cfg(not(feature = "lock-debug"))]
    out.push_str("lock registry disabled (build with the lock-debug feature)\n");

    let threads: Vec<Arc<ThreadLocks>> = THREADS.lock().iter().filter_map(Weak::upgrade).collect();

    for thread in threads {
        // Snapshot first so describing never runs under the thread's lock.
        let (held, waiting): (Vec<Arc<dyn Lockable>>, _) = {
            let state = thread.state.lock();
            (state.held.iter().map(|h| h.lock.clone()).collect(), state.waiting.clone())
        };

        if held.is_empty() && waiting.is_none() {
            continue;
        }

        let _ = writeln!(out, "thread {} holds {} locks:", thread.thread, held.len());
        for lock in &held {
            out.push_str("  ");
            lock.info().describe(&lock.describe_extra(), &mut out);
        }
        if let Some((name, site)) = waiting {
            let _ = writeln!(out, "  waiting on {name} at {site}");
        }
    }

    out
}
