//! Execution state for the VM: untyped value slots, call frames, per
//! module globals and per thread stacks.
//!
//! There is no instruction set here. A [`VmThread`] exposes the stack and
//! frame operations an interpreter loop is built from, and keeps every
//! slot it owns visible to the collector.

mod frame;
mod object;
mod thread;
mod value;

pub use frame::VmFrame;
pub use object::{FnInfo, ModuleInfo, ObjectFile, Version};
pub use thread::VmThread;
pub use value::Value;

use crate::error::VmError;
use crate::heap::{Heap, Roots};
use crate::runtime::Runtime;
use crate::types::TypeCtx;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Instant;

/// State shared by every thread running one object file.
pub struct Vm {
    runtime: Runtime,
    heap: Arc<Heap>,
    obj: ObjectFile,
    globals: Vec<Roots>,
    types: Mutex<TypeCtx>,
    created: Instant,
}

impl Vm {
    /// Sets up global storage for every module in `obj`. Globals are roots
    /// of the runtime's default heap.
    pub fn new(runtime: &Runtime, obj: ObjectFile, types: TypeCtx) -> Arc<Vm> {
        let heap = runtime.default_heap();
        let globals = obj.modules.iter().map(|m| heap.roots(m.globals)).collect();

        log::debug!(
            "vm for object file v{}.{}.{}: {} modules, {} functions",
            obj.version.major,
            obj.version.minor,
            obj.version.patch,
            obj.modules.len(),
            obj.functions.len()
        );

        Arc::new(Vm {
            runtime: runtime.clone(),
            heap,
            obj,
            globals,
            types: Mutex::new(types),
            created: Instant::now(),
        })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn object_file(&self) -> &ObjectFile {
        &self.obj
    }

    pub fn types(&self) -> MutexGuard<'_, TypeCtx> {
        self.types.lock()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    fn global_slot(&self, module: u32, index: usize) -> Result<&Roots, VmError> {
        let globals = self
            .globals
            .get(module as usize)
            .ok_or(VmError::UnknownModule(module))?;

        if index >= self.obj.module(module)?.globals {
            return Err(VmError::GlobalOutOfRange { module, index });
        }

        Ok(globals)
    }

    pub fn global(&self, module: u32, index: usize) -> Result<Value, VmError> {
        let slots = self.global_slot(module, index)?;

        Ok(Value::from_ptr(slots.get(index)))
    }

    pub fn set_global(&self, module: u32, index: usize, value: Value) -> Result<(), VmError> {
        let slots = self.global_slot(module, index)?;

        slots.set(index, value.as_ptr::<u8>());
        Ok(())
    }
}
