use super::mutex::{Mutex, MutexGuard};
use super::{block_on, other_held, push_held, remove_held, LockKind};
use crate::error::LockError;
use crate::safepoint::current_thread_id;
use std::mem;
use std::panic::Location;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type PreNotify = Box<dyn Fn(usize) + Send + Sync>;

struct ConditionInner {
    mutex: Mutex,
    cv: parking_lot::Condvar,
    aux: AtomicUsize,
    pre_notify: parking_lot::Mutex<Option<PreNotify>>,
}

/// A condition variable bundled with the mutex it waits on.
///
/// Waiting requires holding the condition's lock and nothing else: a
/// native wait only gives up one mutex, so any other lock the waiter held
/// would stay locked while it sleeps.
#[derive(Clone)]
pub struct Condition {
    inner: Arc<ConditionInner>,
}

impl Condition {
    #[track_caller]
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(ConditionInner {
                mutex: Mutex::with_kind(LockKind::Condition, name, Location::caller()),
                cv: parking_lot::Condvar::new(),
                aux: AtomicUsize::new(0),
                pre_notify: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.mutex.name()
    }

    #[track_caller]
    pub fn acquire(&self) {
        self.inner.mutex.acquire();
    }

    #[track_caller]
    pub fn try_acquire(&self) -> bool {
        self.inner.mutex.try_acquire()
    }

    #[track_caller]
    pub fn release(&self) {
        self.inner.mutex.release();
    }

    #[track_caller]
    pub fn guard(&self) -> MutexGuard<'_> {
        self.inner.mutex.guard()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.inner.mutex.is_held_by_current_thread()
    }

    /// The value passed to the most recent notify.
    pub fn aux(&self) -> usize {
        self.inner.aux.load(Ordering::Acquire)
    }

    /// Installs a callback run with the aux value just before each notify.
    pub fn set_pre_notify(&self, f: impl Fn(usize) + Send + Sync + 'static) {
        *self.inner.pre_notify.lock() = Some(Box::new(f));
    }

    #[track_caller]
    fn pre_wait(&self) -> u32 {
        let mutex = &self.inner.mutex.inner;

        if !mutex.info.owned_by_current_thread() {
            mutex.info.fatal("condition wait without holding its lock");
        }

        if other_held(mutex.info.id()) > 0 {
            mutex.info.fatal("condition wait while holding other locks");
        }

        let level = mutex.info.level();

        mutex.info.set_level(0);
        mutex.info.set_owner(None);
        remove_held(mutex.info.id());

        level
    }

    fn post_wait(&self, level: u32) {
        let mutex = &self.inner.mutex.inner;

        mutex.info.set_owner(Some(current_thread_id()));
        mutex.info.set_level(level);
        push_held(mutex.clone());
    }

    /// Waits for a notify. The lock is held again, at the same nesting
    /// level, when this returns.
    #[track_caller]
    pub fn wait(&self) {
        let site = Location::caller();
        let level = self.pre_wait();
        let mutex = &self.inner.mutex.inner;

        block_on(&mutex.info, site, || unsafe {
            let mut guard = mutex.raw.make_guard_unchecked();
            self.inner.cv.wait(&mut guard);
            mem::forget(guard);
        });

        self.post_wait(level);
    }

    /// Like [`Condition::wait`] but gives up after `timeout`. Returns
    /// `true` if it timed out.
    #[track_caller]
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let site = Location::caller();
        let level = self.pre_wait();
        let mutex = &self.inner.mutex.inner;

        let timed_out = block_on(&mutex.info, site, || unsafe {
            let mut guard = mutex.raw.make_guard_unchecked();
            let result = self.inner.cv.wait_for(&mut guard, timeout);
            mem::forget(guard);
            result.timed_out()
        });

        self.post_wait(level);
        timed_out
    }

    #[track_caller]
    pub fn wait_then_unlock(&self) {
        self.wait();
        self.release();
    }

    fn pre_notify(&self, aux: usize) -> Result<(), LockError> {
        if !self.is_held_by_current_thread() {
            return Err(LockError::NotHeld);
        }

        self.inner.aux.store(aux, Ordering::Release);

        if let Some(f) = self.inner.pre_notify.lock().as_ref() {
            f(aux);
        }

        Ok(())
    }

    pub fn notify_one(&self, aux: usize) -> Result<(), LockError> {
        self.pre_notify(aux)?;
        self.inner.cv.notify_one();
        Ok(())
    }

    pub fn notify_all(&self, aux: usize) -> Result<(), LockError> {
        self.pre_notify(aux)?;
        self.inner.cv.notify_all();
        Ok(())
    }
}
