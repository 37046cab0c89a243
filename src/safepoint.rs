//! Stop-the-world coordination.
//!
//! A thread takes part in a [`Safepoint`] once it has checked in (or
//! attached explicitly). Participants are either *running*, meaning they
//! must reach a check-in before the world counts as stopped, or
//! *suspended*, meaning they promised not to touch the heap until they
//! resume. A thread leaves automatically when it exits.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SAFEPOINT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    static MEMBERSHIPS: RefCell<Vec<Membership>> = const { RefCell::new(Vec::new()) };
}

/// A process-unique id for the calling thread. Never zero.
pub fn current_thread_id() -> u64 {
    THREAD_ID.try_with(|id| *id).unwrap_or(u64::MAX)
}

struct Membership {
    safepoint: Arc<Safepoint>,
    suspended: usize,
}

impl Drop for Membership {
    fn drop(&mut self) {
        if self.suspended == 0 {
            self.safepoint.leave_running();
        }
    }
}

#[derive(Debug, Default)]
struct State {
    running: usize,
    parked: usize,
    requestor: Option<u64>,
    nesting: usize,
    epoch: u64,
}

pub struct Safepoint {
    id: u64,
    stop_requested: AtomicBool,
    state: Mutex<State>,
    cond: Condvar,
}

/// Held by the thread that stopped the world. Dropping it restarts the
/// world.
pub struct WorldStopped<'a> {
    safepoint: &'a Safepoint,
}

impl Drop for WorldStopped<'_> {
    fn drop(&mut self) {
        self.safepoint.restart();
    }
}

impl Safepoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SAFEPOINT_ID.fetch_add(1, Ordering::Relaxed),
            stop_requested: AtomicBool::new(false),
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        })
    }

    /// `None` if the calling thread is not a participant, otherwise
    /// whether it is currently suspended.
    fn membership(&self) -> Option<bool> {
        MEMBERSHIPS
            .try_with(|m| {
                m.borrow()
                    .iter()
                    .find(|m| m.safepoint.id == self.id)
                    .map(|m| m.suspended > 0)
            })
            .ok()
            .flatten()
    }

    fn with_membership(&self, f: impl FnOnce(&mut Membership)) {
        let _ = MEMBERSHIPS.try_with(|m| {
            if let Some(m) = m.borrow_mut().iter_mut().find(|m| m.safepoint.id == self.id) {
                f(m);
            }
        });
    }

    /// Makes the calling thread a running participant. Waits first if the
    /// world is currently stopped.
    pub fn attach(self: &Arc<Self>) {
        if self.membership().is_some() {
            return;
        }

        self.enter_running();

        let _ = MEMBERSHIPS.try_with(|m| {
            m.borrow_mut().push(Membership {
                safepoint: self.clone(),
                suspended: 0,
            })
        });
    }

    pub fn detach(&self) {
        let _ = MEMBERSHIPS.try_with(|m| {
            m.borrow_mut().retain(|m| m.safepoint.id != self.id);
        });
    }

    fn enter_running(&self) {
        let me = current_thread_id();
        let mut state = self.state.lock();

        while state.requestor.is_some_and(|r| r != me) {
            self.cond.wait(&mut state);
        }

        state.running += 1;
    }

    fn leave_running(&self) {
        let mut state = self.state.lock();

        state.running = state.running.saturating_sub(1);
        drop(state);
        self.cond.notify_all();
    }

    /// Blocks the caller until the current stop ends.
    fn park(&self, state: &mut MutexGuard<'_, State>) {
        let epoch = state.epoch;

        state.parked += 1;
        self.cond.notify_all();

        while state.epoch == epoch {
            self.cond.wait(state);
        }
    }

    /// A point where the world may be stopped. Registers the calling
    /// thread on first use.
    pub fn checkin(self: &Arc<Self>) {
        let suspended = match self.membership() {
            Some(suspended) => suspended,
            None => {
                self.attach();
                false
            }
        };

        if !self.stop_requested.load(Ordering::Acquire) {
            return;
        }

        let me = current_thread_id();
        let mut state = self.state.lock();

        match state.requestor {
            None => {}
            Some(r) if r == me => {}
            Some(_) if suspended => {
                let epoch = state.epoch;
                while state.epoch == epoch {
                    self.cond.wait(&mut state);
                }
            }
            Some(_) => self.park(&mut state),
        }
    }

    /// Leaves the running state until [`Safepoint::resume`]. Calls nest.
    pub fn suspend(&self) {
        let mut leave = false;

        self.with_membership(|m| {
            leave = m.suspended == 0;
            m.suspended += 1;
        });

        if leave {
            self.leave_running();
        }
    }

    pub fn resume(&self) {
        let mut enter = false;

        self.with_membership(|m| {
            if m.suspended > 0 {
                m.suspended -= 1;
                enter = m.suspended == 0;
            }
        });

        if enter {
            self.enter_running();
        }
    }

    /// Runs `f` suspended, for calls that may block on other participants.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        self.suspend();
        let result = f();
        self.resume();

        result
    }

    /// Stops every other running participant at its next check-in.
    ///
    /// Nested calls on the same thread are counted; the world restarts
    /// when the outermost guard drops.
    pub fn stop_the_world(self: &Arc<Self>) -> WorldStopped<'_> {
        if self.membership().is_none() {
            self.attach();
        }

        // A suspended requestor is not part of `running`.
        let counted = usize::from(self.membership() == Some(false));
        let me = current_thread_id();
        let mut state = self.state.lock();

        loop {
            match state.requestor {
                None => break,
                Some(r) if r == me => {
                    state.nesting += 1;
                    return WorldStopped { safepoint: self };
                }
                Some(_) => self.park(&mut state),
            }
        }

        state.requestor = Some(me);
        state.nesting = 1;
        self.stop_requested.store(true, Ordering::Release);

        while state.parked + counted < state.running {
            self.cond.wait(&mut state);
        }

        log::trace!(
            "world stopped by thread {me} ({} parked)",
            state.parked
        );

        WorldStopped { safepoint: self }
    }

    fn restart(&self) {
        let mut state = self.state.lock();

        state.nesting = state.nesting.saturating_sub(1);
        if state.nesting > 0 {
            return;
        }

        state.requestor = None;
        state.parked = 0;
        state.epoch += 1;
        self.stop_requested.store(false, Ordering::Release);
        drop(state);

        log::trace!("world restarted");
        self.cond.notify_all();
    }

    pub fn is_world_stopped(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Whether the calling thread is the one holding the world stopped.
    pub fn is_requestor(&self) -> bool {
        self.state.lock().requestor == Some(current_thread_id())
    }

    pub fn running_threads(&self) -> usize {
        self.state.lock().running
    }
}

/// Suspends the calling thread in every safepoint it participates in.
pub fn suspend_current_thread() {
    let safepoints: Vec<Arc<Safepoint>> = MEMBERSHIPS
        .try_with(|m| m.borrow().iter().map(|m| m.safepoint.clone()).collect())
        .unwrap_or_default();

    for safepoint in safepoints {
        safepoint.suspend();
    }
}

pub fn resume_current_thread() {
    let safepoints: Vec<Arc<Safepoint>> = MEMBERSHIPS
        .try_with(|m| m.borrow().iter().map(|m| m.safepoint.clone()).collect())
        .unwrap_or_default();

    for safepoint in safepoints {
        safepoint.resume();
    }
}
