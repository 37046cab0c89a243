use super::{block_on, push_held, register, remove_held, LockInfo, LockKind, Lockable};
use crate::config::LOCK_MAX_READERS;
use crate::error::LockError;
use crate::safepoint::current_thread_id;
use std::mem;
use std::panic::Location;
use std::sync::Arc;

#[derive(Clone, Copy)]
struct ReaderSlot {
    thread: u64,
    nesting: u32,
}

pub(crate) struct RwLockInner {
    info: LockInfo,
    raw: parking_lot::RwLock<()>,
    readers: parking_lot::Mutex<Vec<ReaderSlot>>,
}

impl RwLockInner {
    fn reader_nesting(&self) -> Option<u32> {
        let me = current_thread_id();

        self.readers
            .lock()
            .iter()
            .find(|r| r.thread == me)
            .map(|r| r.nesting)
    }

    fn drop_write(&self) {
        self.info.set_owner(None);
        remove_held(self.info.id());

        unsafe { self.raw.force_unlock_write() };
    }

    fn drop_read(&self, all: bool) -> bool {
        let me = current_thread_id();
        let mut readers = self.readers.lock();
        let Some(pos) = readers.iter().position(|r| r.thread == me) else {
            return false;
        };

        if !all && readers[pos].nesting > 1 {
            readers[pos].nesting -= 1;
            return true;
        }

        readers.swap_remove(pos);
        drop(readers);
        remove_held(self.info.id());

        unsafe { self.raw.force_unlock_read() };
        true
    }
}

impl Lockable for RwLockInner {
    fn info(&self) -> &LockInfo {
        &self.info
    }

    fn force_release(&self) {
        if self.info.owned_by_current_thread() {
            self.info.set_level(0);
            self.drop_write();
        } else if !self.drop_read(true) {
            remove_held(self.info.id());
        }
    }

    fn describe_extra(&self) -> String {
        let readers = self.readers.lock();

        if readers.is_empty() {
            String::new()
        } else {
            let threads: Vec<String> = readers
                .iter()
                .map(|r| format!("{}x{}", r.thread, r.nesting))
                .collect();

            format!("readers [{}]", threads.join(", "))
        }
    }
}

/// A read-write lock with per-reader bookkeeping.
///
/// A thread that already holds the lock, as reader or writer, may take it
/// again; the repeat only bumps a nesting count. At most
/// `LOCK_MAX_READERS` distinct threads may read at once.
#[derive(Clone)]
pub struct RwLock {
    inner: Arc<RwLockInner>,
}

impl RwLock {
    #[track_caller]
    pub fn new(name: &str) -> Self {
        let inner = Arc::new(RwLockInner {
            info: LockInfo::new(LockKind::RwLock, name, Location::caller()),
            raw: parking_lot::RwLock::new(()),
            readers: parking_lot::Mutex::new(Vec::new()),
        });
        let weak = Arc::downgrade(&inner);

        register(weak);

        Self { inner }
    }

    pub fn name(&self) -> &str {
        self.inner.info.name()
    }

    pub fn writer(&self) -> Option<u64> {
        self.inner.info.owner()
    }

    pub fn reader_count(&self) -> usize {
        self.inner.readers.lock().len()
    }

    pub fn is_read_by_current_thread(&self) -> bool {
        self.inner.reader_nesting().is_some()
    }

    pub fn is_written_by_current_thread(&self) -> bool {
        self.inner.info.owned_by_current_thread()
    }

    /// Handles re-entry by a thread that already holds the lock.
    fn reenter(&self, site: &'static Location<'static>) -> bool {
        if self.is_written_by_current_thread() {
            self.inner.info.nest();
            self.inner.info.record_site(site);
            return true;
        }

        let me = current_thread_id();
        let mut readers = self.inner.readers.lock();

        match readers.iter_mut().find(|r| r.thread == me) {
            Some(slot) => {
                slot.nesting += 1;
                drop(readers);
                self.inner.info.record_site(site);
                true
            }
            None => false,
        }
    }

    /// Claims a reader slot before taking the native lock.
    fn reserve_reader(&self) -> Result<(), LockError> {
        let mut readers = self.inner.readers.lock();

        if readers.len() >= LOCK_MAX_READERS {
            return Err(LockError::TooManyReaders {
                max: LOCK_MAX_READERS,
            });
        }

        readers.push(ReaderSlot {
            thread: current_thread_id(),
            nesting: 1,
        });

        Ok(())
    }

    fn unreserve_reader(&self) {
        let me = current_thread_id();

        self.inner.readers.lock().retain(|r| r.thread != me);
    }

    fn took_read(&self, site: &'static Location<'static>) {
        self.inner.info.record_site(site);
        push_held(self.inner.clone());
    }

    #[track_caller]
    pub fn try_read(&self) -> bool {
        let site = Location::caller();

        if self.reenter(site) {
            return true;
        }

        if self.reserve_reader().is_err() {
            return false;
        }

        match self.inner.raw.try_read() {
            Some(guard) => {
                mem::forget(guard);
                self.took_read(site);
                true
            }
            None => {
                self.unreserve_reader();
                false
            }
        }
    }

    /// Takes a shared hold, blocking while a writer holds the lock.
    #[track_caller]
    pub fn read(&self) -> Result<(), LockError> {
        let site = Location::caller();

        if self.reenter(site) {
            return Ok(());
        }

        self.reserve_reader()?;

        match self.inner.raw.try_read() {
            Some(guard) => mem::forget(guard),
            None => {
                block_on(&self.inner.info, site, || mem::forget(self.inner.raw.read()));
            }
        }

        self.took_read(site);
        Ok(())
    }

    fn took_write(&self, site: &'static Location<'static>) {
        let info = &self.inner.info;

        info.set_owner(Some(current_thread_id()));
        info.set_level(0);
        info.record_site(site);
        push_held(self.inner.clone());
    }

    #[track_caller]
    pub fn try_write(&self) -> bool {
        let site = Location::caller();

        if self.is_read_by_current_thread() {
            return false;
        }

        if self.reenter(site) {
            return true;
        }

        match self.inner.raw.try_write() {
            Some(guard) => {
                mem::forget(guard);
                self.took_write(site);
                true
            }
            None => false,
        }
    }

    /// Takes the lock exclusively. Upgrading a read hold is fatal since it
    /// can never succeed.
    #[track_caller]
    pub fn write(&self) {
        let site = Location::caller();

        if self.is_read_by_current_thread() {
            self.inner.info.fatal("write lock requested while holding a read lock");
        }

        if self.reenter(site) {
            return;
        }

        match self.inner.raw.try_write() {
            Some(guard) => mem::forget(guard),
            None => {
                block_on(&self.inner.info, site, || mem::forget(self.inner.raw.write()));
            }
        }

        self.took_write(site);
    }

    /// Drops one level of whichever hold the current thread has.
    #[track_caller]
    pub fn release(&self) {
        let inner = &self.inner;

        if inner.info.owned_by_current_thread() {
            if !inner.info.unnest() {
                inner.drop_write();
            }
            return;
        }

        if !inner.drop_read(false) {
            inner.info.fatal("rwlock released by a thread that does not hold it");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn readers_share_and_nest() {
        let lock = RwLock::new("shared");

        lock.read().unwrap();
        lock.read().unwrap();

        let other = lock.clone();
        let ok = thread::spawn(move || {
            let ok = other.try_read();
            if ok {
                other.release();
            }
            ok
        })
        .join()
        .unwrap();

        assert!(ok);
        assert_eq!(lock.reader_count(), 1);
        assert!(!lock.try_write());

        lock.release();
        assert!(lock.is_read_by_current_thread());
        lock.release();
        assert!(!lock.is_read_by_current_thread());
        assert!(lock.try_write());
        lock.release();
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = RwLock::new("exclusive");

        lock.write();
        lock.write();
        assert_eq!(lock.writer(), Some(current_thread_id()));

        let other = lock.clone();
        assert!(!thread::spawn(move || other.try_read()).join().unwrap());

        lock.release();
        lock.release();
        assert_eq!(lock.writer(), None);
    }

    #[test]
    fn reader_slots_are_bounded() {
        let lock = RwLock::new("crowded");
        let (tx, rx) = crossbeam_channel::unbounded();
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<()>();

        let handles: Vec<_> = (0..LOCK_MAX_READERS)
            .map(|_| {
                let lock = lock.clone();
                let tx = tx.clone();
                let done_rx = done_rx.clone();

                thread::spawn(move || {
                    lock.read().unwrap();
                    tx.send(()).unwrap();
                    let _ = done_rx.recv();
                    lock.release();
                })
            })
            .collect();

        for _ in 0..LOCK_MAX_READERS {
            rx.recv().unwrap();
        }

        assert_eq!(
            lock.read(),
            Err(LockError::TooManyReaders {
                max: LOCK_MAX_READERS
            })
        );
        assert!(!lock.try_read());

        drop(done_tx);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(lock.reader_count(), 0);
    }
}
