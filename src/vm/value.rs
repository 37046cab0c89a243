use std::fmt;

/// One stack slot. Nothing in the word says what it holds; the code
/// that pushed it and the code that pops it have to agree.
#[repr(transparent)]
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Value(u64);

impl Value {
    pub const ZERO: Value = Value(0);

    pub fn from_raw(raw: u64) -> Value {
        Value(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_int(v: i64) -> Value {
        Value(v as u64)
    }

    pub fn as_int(self) -> i64 {
        self.0 as i64
    }

    pub fn from_uint(v: u64) -> Value {
        Value(v)
    }

    pub fn as_uint(self) -> u64 {
        self.0
    }

    pub fn from_f64(v: f64) -> Value {
        Value(v.to_bits())
    }

    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    pub fn from_bool(v: bool) -> Value {
        Value(v as u64)
    }

    pub fn as_bool(self) -> bool {
        self.0 != 0
    }

    pub fn from_ptr<T>(p: *const T) -> Value {
        Value(p as usize as u64)
    }

    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({:#x})", self.0)
    }
}
