use super::config::FORCED_ALIGNMENT;
use super::fatal::{self, Fatal};
use super::scan::{ScanFn, ScanPolicy};
use std::mem::size_of;
use std::panic::Location;
use std::sync::OnceLock;

/// The record may hold pointers and is scanned by the collector.
pub const PTR_SCAN: u8 = 1 << 0;
/// Reached during the current collection while living outside from-space.
pub const TRACED: u8 = 1 << 1;
/// Copied to to-space; `forward` holds the new header address.
pub const MOVED: u8 = 1 << 2;

/// Smallest data area handed out, used for zero-length requests too.
pub const MIN_DATA_LEN: usize = 16;

#[cfg(feature = "end-guard")]
pub const END_GUARD_LEN: usize = size_of::<u64>();
#[cfg(not(feature = "end-guard"))]
pub const END_GUARD_LEN: usize = 0;

pub type AllocSite = &'static Location<'static>;

/// Metadata written in front of every allocation.
#[repr(C, align(16))]
pub struct AllocHeader {
    pub guard: u64,
    /// Full record length: header, data and end guard, rounded up.
    pub alloc_len: u32,
    pub flags: u8,
    pub scan_fn: Option<ScanFn>,
    pub forward: usize,
    #[cfg(feature = "alloc-site")]
    pub site: Option<AllocSite>,
}

pub const HEADER_SIZE: usize = size_of::<AllocHeader>();

/// Process-wide guard value, chosen once at random. Always odd so it can
/// never be mistaken for an aligned pointer.
pub fn guard_word() -> u64 {
    static GUARD: OnceLock<u64> = OnceLock::new();

    *GUARD.get_or_init(|| rand::random::<u64>() | 1)
}

/// Total bytes a request for `data_len` bytes consumes in an arena, or
/// `None` past what a header can describe.
pub fn record_len(data_len: usize) -> Option<usize> {
    let len = data_len
        .max(MIN_DATA_LEN)
        .checked_add(HEADER_SIZE + END_GUARD_LEN + FORCED_ALIGNMENT - 1)?;
    let len = len & !(FORCED_ALIGNMENT - 1);

    (len <= u32::MAX as usize).then_some(len)
}

impl AllocHeader {
    /// Writes a fresh header at `addr` for a record of `alloc_len` bytes.
    ///
    /// # Safety
    ///
    /// `addr` must be `FORCED_ALIGNMENT` aligned with `alloc_len` writable
    /// bytes behind it.
    pub unsafe fn init(
        addr: usize,
        alloc_len: usize,
        policy: ScanPolicy,
        site: Option<AllocSite>,
    ) -> *mut AllocHeader {
        let header = addr as *mut AllocHeader;
        let flags = if policy.scans() { PTR_SCAN } else { 0 };

        #[cfg(not(feature = "alloc-site"))]
        let _ = site;

        header.write(AllocHeader {
            guard: guard_word(),
            alloc_len: alloc_len as u32,
            flags,
            scan_fn: policy.scan_fn(),
            forward: 0,
            #[cfg(feature = "alloc-site")]
            site,
        });

        #[cfg(feature = "end-guard")]
        ((addr + alloc_len - END_GUARD_LEN) as *mut u64).write(guard_word());

        header
    }

    /// The header of the record whose data starts at `data`.
    pub fn of(data: *const u8) -> *mut AllocHeader {
        (data as usize - HEADER_SIZE) as *mut AllocHeader
    }

    pub fn data(&self) -> *mut u8 {
        (self as *const AllocHeader as usize + HEADER_SIZE) as *mut u8
    }

    /// Usable bytes behind the header.
    pub fn data_len(&self) -> usize {
        self.alloc_len as usize - HEADER_SIZE - END_GUARD_LEN
    }

    pub fn data_words(&self) -> usize {
        self.data_len() / size_of::<usize>()
    }

    pub fn is_set(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    #[cfg(feature = "alloc-site")]
    pub fn site(&self) -> Option<AllocSite> {
        self.site
    }

    #[cfg(not(feature = "alloc-site"))]
    pub fn site(&self) -> Option<AllocSite> {
        None
    }

    /// Checks the guard words of the record whose data starts at `data`,
    /// raising a fatal error on corruption.
    ///
    /// # Safety
    ///
    /// `data` must point into mapped memory at least `HEADER_SIZE` bytes
    /// past the start of its arena.
    #[track_caller]
    pub unsafe fn validate<'a>(data: *const u8) -> &'a mut AllocHeader {
        let header = &mut *Self::of(data);

        if header.guard != guard_word() {
            fatal::raise(Fatal::GuardMismatch {
                addr: header as *const AllocHeader as usize,
                found: header.guard,
            });
        }

        #[cfg(feature = "end-guard")]
        {
            let addr = header as *const AllocHeader as usize;
            let end = (addr + header.alloc_len as usize - END_GUARD_LEN) as *const u64;

            if end.read() != guard_word() {
                fatal::raise(Fatal::EndGuard { addr });
            }
        }

        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_aligned() {
        assert_eq!(HEADER_SIZE % FORCED_ALIGNMENT, 0);
        assert_eq!(std::mem::align_of::<AllocHeader>(), FORCED_ALIGNMENT);
    }

    #[test]
    fn record_len_rounds_and_has_a_floor() {
        assert_eq!(record_len(0), record_len(MIN_DATA_LEN));
        assert_eq!(record_len(1).unwrap() % FORCED_ALIGNMENT, 0);
        assert!(record_len(17) > record_len(16));
        assert!(record_len(100).unwrap() >= HEADER_SIZE + 100);
    }

    #[test]
    fn record_len_refuses_what_a_header_cannot_hold() {
        assert_eq!(record_len(usize::MAX), None);
        assert_eq!(record_len(usize::MAX - 15), None);
        assert_eq!(record_len(u32::MAX as usize), None);
        assert!(record_len(u32::MAX as usize - HEADER_SIZE - 64).is_some());
    }

    #[test]
    fn guard_is_stable_and_odd() {
        assert_eq!(guard_word(), guard_word());
        assert_eq!(guard_word() & 1, 1);
    }

    #[test]
    fn init_then_validate() {
        let mut buf = vec![0u128; 16];
        let addr = buf.as_mut_ptr() as usize;
        let len = record_len(40).unwrap();

        unsafe {
            let header = AllocHeader::init(addr, len, ScanPolicy::All, None);
            let data = (*header).data();

            assert_eq!(data as usize, addr + HEADER_SIZE);
            assert!(AllocHeader::validate(data).is_set(PTR_SCAN));
            assert!((*header).data_len() >= 40);
        }
    }

    #[test]
    #[should_panic]
    fn corrupt_guard_is_fatal() {
        crate::fatal::set_fatal_mode(crate::fatal::FatalMode::Panic);
        let mut buf = vec![0u128; 16];
        let addr = buf.as_mut_ptr() as usize;

        unsafe {
            let header = AllocHeader::init(addr, record_len(16).unwrap(), ScanPolicy::None, None);
            (*header).guard ^= 2;
            AllocHeader::validate((*header).data());
        }
    }
}
