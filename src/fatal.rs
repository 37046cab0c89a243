//! The process-ending error path.
//!
//! Heap corruption, lock misuse and broken type forwarding are not
//! recoverable. They are reported with as much context as is available
//! and then the process aborts. Debug builds panic instead so the
//! failure can be observed by a test harness.

use super::error::AllocError;
use super::types::TypeId;
use std::panic::Location;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FatalMode {
    Abort,
    Panic,
}

static FATAL_MODE: AtomicU8 = AtomicU8::new(if cfg!(debug_assertions) {
    FatalMode::Panic as u8
} else {
    FatalMode::Abort as u8
});

pub fn fatal_mode() -> FatalMode {
    match FATAL_MODE.load(Ordering::Relaxed) {
        x if x == FatalMode::Abort as u8 => FatalMode::Abort,
        _ => FatalMode::Panic,
    }
}

pub fn set_fatal_mode(mode: FatalMode) {
    FATAL_MODE.store(mode as u8, Ordering::Relaxed);
}

#[derive(Debug, Error)]
pub enum Fatal {
    #[error("allocation guard mismatch for record at {addr:#x} (found {found:#x})")]
    GuardMismatch { addr: usize, found: u64 },
    #[error("end guard overwritten for record at {addr:#x}")]
    EndGuard { addr: usize },
    #[error("{addr:#x} is not a heap allocation")]
    NotAnAllocation { addr: usize },
    #[error("{reason} on {name} (created {site}, owner {owner:?}, caller {caller})")]
    Lock {
        reason: &'static str,
        name: String,
        site: String,
        owner: Option<u64>,
        caller: u64,
    },
    #[error(transparent)]
    Map(#[from] AllocError),
    #[error("allocation of {requested} bytes exceeds the maximum record size")]
    TooLarge { requested: usize },
    #[error("type forwarding cycle reached from {0:?}")]
    TypeCycle(TypeId),
    #[error("survivors of heap {heap} do not fit the new arena ({needed} bytes over)")]
    ToSpaceExhausted { heap: u64, needed: usize },
    #[error("heap {0} was asked to collect while collections are suspended")]
    CollectionSuspended(u64),
}

/// Reports `fatal` and ends the process (or panics, see [`FatalMode`]).
#[cold]
#[track_caller]
pub fn raise(fatal: Fatal) -> ! {
    let caller = Location::caller();

    log::error!("fatal: {fatal} at {caller}");
    eprintln!("fatal: {fatal}\n  at {}:{}", caller.file(), caller.line());

    if let Fatal::Lock { .. } = fatal {
        eprintln!("{}", super::lock::debug_all_locks());
    }

    match fatal_mode() {
        FatalMode::Abort => std::process::abort(),
        FatalMode::Panic => panic!("{fatal}"),
    }
}
