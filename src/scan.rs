use std::ptr::NonNull;

/// Marks the words of an allocation that hold heap pointers.
///
/// Called by the collector with the number of data words in the record.
pub type ScanFn = fn(words: usize, map: &mut ScanMap);

/// How the collector treats the words of an allocation.
#[derive(Copy, Clone, Debug)]
pub enum ScanPolicy {
    /// Every word may be a pointer.
    All,
    /// The allocation holds no pointers.
    None,
    /// Only the words marked by the callback are pointers.
    Map(ScanFn),
}

impl ScanPolicy {
    pub fn scans(&self) -> bool {
        !matches!(self, ScanPolicy::None)
    }

    pub(crate) fn scan_fn(&self) -> Option<ScanFn> {
        match self {
            ScanPolicy::Map(f) => Some(*f),
            _ => None,
        }
    }
}

/// One bit per data word of an allocation.
#[derive(Clone, Debug, Default)]
pub struct ScanMap {
    bits: Vec<u64>,
    words: usize,
}

impl ScanMap {
    pub fn new(words: usize) -> Self {
        Self {
            bits: vec![0; words.div_ceil(64)],
            words,
        }
    }

    /// Clears the map and resizes it for an allocation of `words` words.
    pub fn reset(&mut self, words: usize) {
        self.bits.clear();
        self.bits.resize(words.div_ceil(64), 0);
        self.words = words;
    }

    pub fn words(&self) -> usize {
        self.words
    }

    /// Marks `word` as a pointer. Out of range words are ignored.
    pub fn set(&mut self, word: usize) {
        if word < self.words {
            self.bits[word / 64] |= 1 << (word % 64);
        }
    }

    pub fn set_range(&mut self, start: usize, count: usize) {
        for word in start..start.saturating_add(count) {
            self.set(word);
        }
    }

    pub fn is_set(&self, word: usize) -> bool {
        word < self.words && self.bits[word / 64] & (1 << (word % 64)) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.words).filter(|w| self.is_set(*w))
    }
}

/// Types that know how the collector must scan them.
///
/// # Safety
///
/// `POLICY` must mark every word that can hold a heap pointer. Missing a
/// pointer lets the collector move or drop its target behind its back.
pub unsafe trait Scan {
    const POLICY: ScanPolicy;
}

macro_rules! impl_scan_leaf {
    ($($t:ty),*) => {
        $(
            unsafe impl Scan for $t {
                const POLICY: ScanPolicy = ScanPolicy::None;
            }
        )*
    };
}

impl_scan_leaf!(
    (), bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64
);

unsafe impl<T> Scan for *const T {
    const POLICY: ScanPolicy = ScanPolicy::All;
}

unsafe impl<T> Scan for *mut T {
    const POLICY: ScanPolicy = ScanPolicy::All;
}

unsafe impl<T> Scan for NonNull<T> {
    const POLICY: ScanPolicy = ScanPolicy::All;
}

unsafe impl<T> Scan for Option<NonNull<T>> {
    const POLICY: ScanPolicy = ScanPolicy::All;
}

unsafe impl<T: Scan, const N: usize> Scan for [T; N] {
    const POLICY: ScanPolicy = match T::POLICY {
        ScanPolicy::None => ScanPolicy::None,
        _ => ScanPolicy::All,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_bits() {
        let mut map = ScanMap::new(130);

        map.set(0);
        map.set(64);
        map.set_range(127, 5);

        assert_eq!(map.iter().collect::<Vec<_>>(), vec![0, 64, 127, 128, 129]);
        assert!(!map.is_set(130));

        map.reset(3);
        assert_eq!(map.iter().count(), 0);
        assert_eq!(map.words(), 3);
    }

    #[test]
    fn array_policy_follows_element() {
        assert!(!<[u64; 4] as Scan>::POLICY.scans());
        assert!(<[*mut u8; 4] as Scan>::POLICY.scans());
    }
}
