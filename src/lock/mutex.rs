use super::{block_on, push_held, register, remove_held, LockInfo, LockKind, Lockable};
use crate::safepoint::current_thread_id;
use std::mem;
use std::panic::Location;
use std::sync::Arc;

pub(crate) struct MutexInner {
    pub(crate) info: LockInfo,
    pub(crate) raw: parking_lot::Mutex<()>,
}

impl Lockable for MutexInner {
    fn info(&self) -> &LockInfo {
        &self.info
    }

    fn force_release(&self) {
        if self.info.owned_by_current_thread() {
            self.info.set_level(0);
            self.unlock_outermost();
        } else {
            remove_held(self.info.id());
        }
    }
}

impl MutexInner {
    fn unlock_outermost(&self) {
        self.info.set_owner(None);
        remove_held(self.info.id());

        unsafe { self.raw.force_unlock() };
    }
}

/// A re-entrant mutex with owner tracking.
///
/// Unlike a std mutex it is not tied to a guard: `acquire` and `release`
/// are separate calls, and the owning thread may acquire it again, which
/// raises its nesting level. Cloning yields another handle to the same
/// lock.
#[derive(Clone)]
pub struct Mutex {
    pub(crate) inner: Arc<MutexInner>,
}

impl Mutex {
    #[track_caller]
    pub fn new(name: &str) -> Self {
        Self::with_kind(LockKind::Mutex, name, Location::caller())
    }

    pub(crate) fn with_kind(kind: LockKind, name: &str, site: &'static Location<'static>) -> Self {
        let inner = Arc::new(MutexInner {
            info: LockInfo::new(kind, name, site),
            raw: parking_lot::Mutex::new(()),
        });
        let weak = Arc::downgrade(&inner);

        register(weak);

        Self { inner }
    }

    pub fn name(&self) -> &str {
        self.inner.info.name()
    }

    pub fn id(&self) -> u64 {
        self.inner.info.id()
    }

    /// Extra acquisitions by the owner beyond the first.
    pub fn level(&self) -> u32 {
        self.inner.info.level()
    }

    pub fn owner(&self) -> Option<u64> {
        self.inner.info.owner()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.inner.info.owned_by_current_thread()
    }

    fn took_native(&self, site: &'static Location<'static>) {
        let info = &self.inner.info;

        info.set_owner(Some(current_thread_id()));
        info.set_level(0);
        info.record_site(site);
        push_held(self.inner.clone());
    }

    /// Takes the lock if it is free or already ours. Never blocks.
    #[track_caller]
    pub fn try_acquire(&self) -> bool {
        let site = Location::caller();

        if let Some(guard) = self.inner.raw.try_lock() {
            mem::forget(guard);
            self.took_native(site);
            return true;
        }

        if self.is_held_by_current_thread() {
            self.inner.info.nest();
            self.inner.info.record_site(site);
            return true;
        }

        false
    }

    /// Takes the lock, suspending the thread for collection purposes while
    /// it waits.
    #[track_caller]
    pub fn acquire(&self) {
        let site = Location::caller();

        if self.try_acquire() {
            return;
        }

        block_on(&self.inner.info, site, || mem::forget(self.inner.raw.lock()));

        self.took_native(site);
    }

    /// Drops one nesting level, unlocking once the outermost level goes.
    #[track_caller]
    pub fn release(&self) {
        let info = &self.inner.info;

        if !info.owned_by_current_thread() {
            info.fatal("mutex released by a thread that does not own it");
        }

        if !info.unnest() {
            self.inner.unlock_outermost();
        }
    }

    /// Unlocks regardless of nesting level.
    #[track_caller]
    pub fn release_all(&self) {
        if !self.inner.info.owned_by_current_thread() {
            self.inner.info.fatal("mutex released by a thread that does not own it");
        }

        self.inner.force_release();
    }

    /// Acquires and returns a guard that releases on drop.
    #[track_caller]
    pub fn guard(&self) -> MutexGuard<'_> {
        self.acquire();

        MutexGuard { mutex: self }
    }
}

pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::held_lock_count;
    use std::thread;

    #[test]
    fn reentrant_nesting() {
        let m = Mutex::new("nest");

        m.acquire();
        assert!(m.try_acquire());
        m.acquire();
        assert_eq!(m.level(), 2);
        assert_eq!(held_lock_count(), 1);

        m.release();
        m.release();
        assert!(m.is_held_by_current_thread());
        m.release();
        assert!(!m.is_held_by_current_thread());
        assert_eq!(held_lock_count(), 0);
    }

    #[test]
    fn other_threads_cannot_try_acquire() {
        let m = Mutex::new("busy");
        let other = m.clone();

        m.acquire();
        let got = thread::spawn(move || other.try_acquire()).join().unwrap();
        assert!(!got);

        m.release_all();
        let other = m.clone();
        let got = thread::spawn(move || {
            let ok = other.try_acquire();
            other.release();
            ok
        })
        .join()
        .unwrap();
        assert!(got);
    }

    #[test]
    fn guard_releases() {
        let m = Mutex::new("guarded");

        {
            let _g = m.guard();
            assert!(m.is_held_by_current_thread());
        }

        assert_eq!(m.owner(), None);
    }

    #[test]
    fn balanced_nesting_frees_the_lock() {
        for depth in 1..=8 {
            let m = Mutex::new("balanced");

            for _ in 0..depth {
                m.acquire();
            }
            assert_eq!(m.level(), depth - 1);

            for _ in 0..depth {
                m.release();
            }
            assert_eq!(m.owner(), None);
            assert_eq!(held_lock_count(), 0);

            let other = m.clone();
            let got = thread::spawn(move || {
                let ok = other.try_acquire();
                if ok {
                    other.release();
                }
                ok
            })
            .join()
            .unwrap();
            assert!(got, "still held after {depth} balanced releases");
        }
    }

    #[test]
    #[should_panic(expected = "does not own it")]
    fn release_past_the_outermost_level_is_fatal() {
        crate::fatal::set_fatal_mode(crate::fatal::FatalMode::Panic);
        let m = Mutex::new("unbalanced");

        for _ in 0..3 {
            m.acquire();
        }
        for _ in 0..3 {
            m.release();
        }
        m.release();
    }

    #[test]
    #[should_panic]
    fn release_without_owning_is_fatal() {
        crate::fatal::set_fatal_mode(crate::fatal::FatalMode::Panic);
        Mutex::new("stranger").release();
    }
}
