use super::{Value, Vm, VmFrame};
use crate::error::VmError;
use crate::heap::{Heap, Roots};
use crate::runtime::StackRegistration;
use crate::scan::ScanPolicy;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const NUM_REGISTERS: usize = 4;

/// One thread of VM execution.
///
/// The value stack grows down from `stack.len()`. A call pushes the
/// caller's `pc << 32 | module` word and then the caller's frame pointer;
/// the new frame pointer is the slot holding the latter, so arguments sit
/// at positive offsets from it and locals at negative ones.
///
/// The stack is scanned as a root range by every collection of the
/// runtime, and the registers are roots of the thread's own heap.
pub struct VmThread {
    vm: Arc<Vm>,
    heap: Arc<Heap>,
    stack: Box<[AtomicUsize]>,
    _registration: StackRegistration,
    registers: Roots,
    frames: Vec<VmFrame>,
    sp: usize,
    fp: usize,
    pc: u32,
    current_module: u32,
    max_depth: usize,
    running: bool,
    error: bool,
}

impl VmThread {
    pub fn new(vm: &Arc<Vm>) -> Self {
        let runtime = vm.runtime();
        let config = runtime.config();
        let heap = runtime.new_named_heap("vm thread", config.scratch_heap_size);
        let stack: Box<[AtomicUsize]> = (0..config.vm_stack_size.max(2)).map(|_| AtomicUsize::new(0)).collect();
        let registration = runtime.register_stack(stack.as_ptr(), stack.len());
        let registers = heap.roots(NUM_REGISTERS);
        let sp = stack.len();

        VmThread {
            vm: vm.clone(),
            heap,
            _registration: registration,
            registers,
            frames: Vec::new(),
            sp,
            fp: sp,
            pc: 0,
            current_module: vm.object_file().entry,
            max_depth: config.max_call_depth,
            running: false,
            error: false,
            stack,
        }
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    pub fn current_module(&self) -> u32 {
        self.current_module
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    /// Set once any stack or call operation on this thread has failed.
    pub fn has_error(&self) -> bool {
        self.error
    }

    pub fn clear_error(&mut self) {
        self.error = false;
    }

    fn failed<T>(&mut self, err: VmError) -> Result<T, VmError> {
        self.error = true;
        Err(err)
    }

    /// Number of values on the stack.
    pub fn stack_len(&self) -> usize {
        self.stack.len() - self.sp
    }

    fn slot(&self, idx: usize) -> Value {
        Value::from_raw(self.stack[idx].load(Ordering::Relaxed) as u64)
    }

    fn set_slot(&self, idx: usize, v: Value) {
        self.stack[idx].store(v.raw() as usize, Ordering::Relaxed);
    }

    pub fn push(&mut self, v: Value) -> Result<(), VmError> {
        if self.sp == 0 {
            return self.failed(VmError::StackOverflow);
        }

        self.sp -= 1;
        self.set_slot(self.sp, v);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value, VmError> {
        let v = self.peek(0)?;

        self.set_slot(self.sp, Value::ZERO);
        self.sp += 1;
        Ok(v)
    }

    /// The value `n` slots below the top.
    pub fn peek(&mut self, n: usize) -> Result<Value, VmError> {
        if n >= self.stack_len() {
            return self.failed(VmError::StackUnderflow);
        }

        Ok(self.slot(self.sp + n))
    }

    pub fn dup_top(&mut self) -> Result<(), VmError> {
        let top = self.peek(0)?;

        self.push(top)
    }

    pub fn swap(&mut self) -> Result<(), VmError> {
        let a = self.peek(0)?;
        let b = self.peek(1)?;

        self.set_slot(self.sp, b);
        self.set_slot(self.sp + 1, a);
        Ok(())
    }

    /// Reserves `n` zeroed slots, or drops `-n` values.
    pub fn move_sp(&mut self, n: isize) -> Result<(), VmError> {
        if n >= 0 {
            let n = n as usize;

            if n > self.sp {
                return self.failed(VmError::StackOverflow);
            }
            for idx in self.sp - n..self.sp {
                self.set_slot(idx, Value::ZERO);
            }
            self.sp -= n;
        } else {
            let n = n.unsigned_abs();

            if n > self.stack_len() {
                return self.failed(VmError::StackUnderflow);
            }
            for idx in self.sp..self.sp + n {
                self.set_slot(idx, Value::ZERO);
            }
            self.sp += n;
        }

        Ok(())
    }

    fn local_index(&mut self, n: isize) -> Result<usize, VmError> {
        if self.frames.is_empty() {
            return self.failed(VmError::NoFrame);
        }

        match (self.fp as isize).checked_sub(n) {
            Some(idx) if idx >= self.sp as isize && (idx as usize) < self.stack.len() => Ok(idx as usize),
            _ => self.failed(VmError::LocalOutOfRange(n)),
        }
    }

    /// Slot `fp - n` of the current frame: locals for positive `n`,
    /// arguments for `n <= -2`.
    pub fn local(&mut self, n: isize) -> Result<Value, VmError> {
        let idx = self.local_index(n)?;

        Ok(self.slot(idx))
    }

    pub fn set_local(&mut self, n: isize, v: Value) -> Result<(), VmError> {
        let idx = self.local_index(n)?;

        self.set_slot(idx, v);
        Ok(())
    }

    pub fn register(&self, n: usize) -> Result<Value, VmError> {
        if n >= NUM_REGISTERS {
            return Err(VmError::BadRegister(n));
        }

        Ok(Value::from_ptr(self.registers.get(n)))
    }

    pub fn set_register(&mut self, n: usize, v: Value) -> Result<(), VmError> {
        if n >= NUM_REGISTERS {
            return self.failed(VmError::BadRegister(n));
        }

        self.registers.set(n, v.as_ptr::<u8>());
        Ok(())
    }

    fn enter(&mut self, frame: VmFrame) -> Result<(), VmError> {
        if self.frames.len() >= self.max_depth {
            return self.failed(VmError::CallDepthExceeded { max: self.max_depth });
        }

        if self.sp < 2 {
            return self.failed(VmError::StackOverflow);
        }

        let saved = (self.pc as u64) << 32 | self.current_module as u64;

        self.push(Value::from_uint(saved))?;
        self.push(Value::from_uint(self.fp as u64))?;
        self.fp = self.sp;
        self.frames.push(frame);
        Ok(())
    }

    /// Calls function `ix` from source line `line`, reserving its frame.
    pub fn call(&mut self, ix: usize, line: u32) -> Result<(), VmError> {
        let (module, offset, frame_size) = match self.vm.object_file().function(ix) {
            Ok(f) => (f.module, f.offset, f.frame_size),
            Err(e) => return self.failed(e),
        };

        self.enter(VmFrame {
            call_module: self.current_module,
            call_line: line,
            target_module: module,
            target_fn: Some(ix),
            target_line: 0,
            pc: self.pc,
        })?;

        self.pc = offset;
        self.current_module = module;

        if let Err(e) = self.move_sp(frame_size as isize) {
            self.ret()?;
            return Err(e);
        }

        Ok(())
    }

    /// Runs module `module`'s top level as a call.
    pub fn call_module(&mut self, module: u32, line: u32) -> Result<(), VmError> {
        if let Err(e) = self.vm.object_file().module(module) {
            return self.failed(e);
        }

        self.enter(VmFrame {
            call_module: self.current_module,
            call_line: line,
            target_module: module,
            target_fn: None,
            target_line: 0,
            pc: self.pc,
        })?;

        self.pc = 0;
        self.current_module = module;
        Ok(())
    }

    /// Unwinds the current frame, restoring the caller's pc, module and
    /// frame pointer. Return values travel in `r0`.
    pub fn ret(&mut self) -> Result<(), VmError> {
        if self.frames.is_empty() {
            return self.failed(VmError::NoFrame);
        }

        for idx in self.sp..self.fp {
            self.set_slot(idx, Value::ZERO);
        }

        self.sp = self.fp;

        let saved_fp = self.pop()?.as_uint() as usize;
        let saved = self.pop()?.as_uint();

        self.fp = saved_fp;
        self.pc = (saved >> 32) as u32;
        self.current_module = saved as u32;
        self.frames.pop();
        Ok(())
    }

    pub fn current_frame(&self) -> Option<&VmFrame> {
        self.frames.last()
    }

    pub fn frames(&self) -> &[VmFrame] {
        &self.frames
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Allocates from this thread's heap. Raw pointers to earlier
    /// allocations only stay valid if they are kept on the stack, in a
    /// register or in another root.
    #[track_caller]
    pub fn alloc(&mut self, len: usize, policy: ScanPolicy) -> NonNull<u8> {
        self.heap.alloc(len, policy)
    }
}

impl Drop for VmThread {
    fn drop(&mut self) {
        self.vm.runtime().delete_heap(&self.heap);
    }
}
