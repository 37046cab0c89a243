use super::types::TypeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("could not map arena memory: {0}")]
    Map(#[source] std::io::Error),
    #[error("allocation of {requested} bytes exceeds the maximum record size")]
    TooLarge { requested: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("too many concurrent readers to track (max {max})")]
    TooManyReaders { max: usize },
    #[error("the lock must be held before calling notify")]
    NotHeld,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("incompatible types: {left} vs {right}")]
    Incompatible { left: String, right: String },
    #[error("unknown type id {0:?}")]
    UnknownType(TypeId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VmError {
    #[error("value stack overflow")]
    StackOverflow,
    #[error("value stack underflow")]
    StackUnderflow,
    #[error("maximum call depth ({max}) exceeded")]
    CallDepthExceeded { max: usize },
    #[error("no active call frame")]
    NoFrame,
    #[error("no function at index {0}")]
    UnknownFunction(usize),
    #[error("local slot {0} is outside the current frame")]
    LocalOutOfRange(isize),
    #[error("no module with id {0}")]
    UnknownModule(u32),
    #[error("module {module} has no global {index}")]
    GlobalOutOfRange { module: u32, index: usize },
    #[error("no register r{0}")]
    BadRegister(usize),
}
