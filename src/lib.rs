//! The n00b runtime core: memory, locks and types.
//!
//! A [`Runtime`] owns a set of heaps. Each [`Heap`] bump-allocates out of
//! mmap'd arenas with guard pages at both ends, and collects by copying
//! everything reachable from its roots into a fresh arena while every
//! other thread is parked at a safepoint.
//! ```rust
//! use n00b::{Runtime, RuntimeConfig, ScanPolicy};
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! let heap = runtime.new_heap(64 * 1024);
//!
//! let p = heap.alloc(32, ScanPolicy::None);
//! unsafe { p.as_ptr().write_bytes(7, 32) };
//!
//! // Raw pointers are only updated by a collection if they are roots.
//! let root = heap.root(p.as_ptr());
//! heap.collect();
//!
//! let moved = root.get(0);
//! assert_eq!(unsafe { *moved.add(31) }, 7);
//! ```
//!
//! Allocations say which of their words may hold pointers through a
//! [`ScanPolicy`], usually derived from the stored type.
//! ```rust
//! use n00b::{Runtime, RuntimeConfig, Scan};
//! use std::ptr::NonNull;
//!
//! #[derive(Scan, Clone, Copy)]
//! #[repr(C)]
//! struct Node {
//!     value: u64,
//!     #[scan]
//!     next: Option<NonNull<Node>>,
//! }
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! let heap = runtime.new_heap(64 * 1024);
//! let tail = heap.alloc_value(Node { value: 2, next: None });
//! let head = heap.alloc_value(Node { value: 1, next: Some(tail) });
//!
//! assert_eq!(unsafe { head.as_ref().value }, 1);
//! ```
//!
//! Locks in [`lock`] cooperate with collection and keep enough history to
//! explain a deadlock. [`types`] holds the unifying type graph and [`vm`]
//! the execution state built on top of both.
extern crate self as n00b;

mod arena;
mod collector;
mod config;
mod error;
mod header;
mod heap;
mod metrics;
mod runtime;
mod safepoint;
mod scan;
mod spin;

pub mod fatal;
pub mod lock;
pub mod types;
pub mod vm;

pub use collector::CollectStats;
pub use config::{RuntimeConfig, FORCED_ALIGNMENT, LOCK_DEBUG_RING, LOCK_MAX_READERS};
pub use error::{AllocError, LockError, TypeError, VmError};
pub use fatal::{Fatal, FatalMode};
pub use header::AllocSite;
pub use heap::{Allocation, Heap, Roots};
pub use lock::{Condition, Mutex, MutexGuard, RwLock};
pub use metrics::HeapMetrics;
pub use n00b_derive::Scan;
pub use runtime::Runtime;
pub use safepoint::{current_thread_id, Safepoint, WorldStopped};
pub use scan::{Scan, ScanFn, ScanMap, ScanPolicy};

#[cfg(test)]
mod test;
