/// Bookkeeping for one active call, kept beside the value stack for
/// tracebacks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VmFrame {
    pub call_module: u32,
    pub call_line: u32,
    pub target_module: u32,
    /// `None` when the frame runs a module's top level.
    pub target_fn: Option<usize>,
    pub target_line: u32,
    /// Caller's program counter.
    pub pc: u32,
}
