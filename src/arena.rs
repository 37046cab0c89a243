use super::error::AllocError;
use libc::{c_void, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE};
use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

        if size <= 0 {
            4096
        } else {
            size as usize
        }
    })
}

/// `n` rounded up to a power-of-two `align`, or `None` on overflow.
pub const fn round_up(n: usize, align: usize) -> Option<usize> {
    match n.checked_add(align - 1) {
        Some(n) => Some(n & !(align - 1)),
        None => None,
    }
}

/// A contiguous mapping used as one unit of bump allocation.
///
/// The mapping is laid out as `[front guard][content][rear guard]`, both
/// guard pages being `PROT_NONE` so running off either end of the
/// content faults instead of scribbling on a neighbour.
pub struct Arena {
    map: NonNull<u8>,
    map_len: usize,
    user_length: usize,
    last_issued: AtomicUsize,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new(byte_len: usize) -> Result<Arena, AllocError> {
        let page = page_size();
        let too_large = || AllocError::TooLarge { requested: byte_len };
        let user_length = round_up(byte_len.max(1), page).ok_or_else(too_large)?;
        let map_len = user_length.checked_add(2 * page).ok_or_else(too_large)?;

        unsafe {
            let raw = libc::mmap(
                ptr::null_mut(),
                map_len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            );

            if raw == MAP_FAILED {
                return Err(AllocError::Map(io::Error::last_os_error()));
            }

            let base = raw as *mut u8;
            let rear_guard = base.add(page + user_length);

            if libc::mprotect(raw, page, PROT_NONE) != 0
                || libc::mprotect(rear_guard as *mut c_void, page, PROT_NONE) != 0
            {
                let err = io::Error::last_os_error();
                libc::munmap(raw, map_len);
                return Err(AllocError::Map(err));
            }

            log::trace!(
                "mapped arena {:p} ({} bytes, {} usable)",
                base,
                map_len,
                user_length
            );

            Ok(Arena {
                map: NonNull::new_unchecked(base),
                map_len,
                user_length,
                last_issued: AtomicUsize::new(0),
            })
        }
    }

    pub fn addr_start(&self) -> usize {
        self.map.as_ptr() as usize + page_size()
    }

    pub fn addr_end(&self) -> usize {
        self.addr_start() + self.user_length
    }

    pub fn user_length(&self) -> usize {
        self.user_length
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr_start() && addr < self.addr_end()
    }

    /// The cursor position when this arena stopped being the newest one,
    /// or when a collection started. Zero while the arena is current.
    pub fn last_issued(&self) -> usize {
        self.last_issued.load(Ordering::Acquire)
    }

    pub fn set_last_issued(&self, addr: usize) {
        let clamped = addr.clamp(self.addr_start(), self.addr_end());

        self.last_issued.store(clamped, Ordering::Release);
    }

    /// Bytes handed out from this arena, judged by `last_issued` or by
    /// the supplied live cursor when the arena is still current.
    pub fn used_bytes(&self, cursor: usize) -> usize {
        let issued = match self.last_issued() {
            0 => cursor.clamp(self.addr_start(), self.addr_end()),
            n => n,
        };

        issued - self.addr_start()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.map.as_ptr() as *mut c_void, self.map_len) };

        if rc != 0 {
            log::warn!(
                "munmap of arena {:p} failed: {}",
                self.map.as_ptr(),
                io::Error::last_os_error()
            );
        } else {
            log::trace!("unmapped arena {:p}", self.map.as_ptr());
        }
    }
}
