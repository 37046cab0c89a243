use n00b::types::{Builtin, TypeCtx};
use n00b::vm::{FnInfo, ObjectFile, Value, Version, Vm, VmThread};
use n00b::{Runtime, RuntimeConfig, ScanPolicy, VmError};
use std::sync::Arc;

fn build(max_call_depth: usize) -> (Runtime, Arc<Vm>) {
    let runtime = Runtime::new(RuntimeConfig {
        default_heap_size: 1 << 20,
        scratch_heap_size: 64 * 1024,
        vm_stack_size: 1024,
        max_call_depth,
        ..RuntimeConfig::default()
    });
    let mut types = TypeCtx::new();
    let mut obj = ObjectFile::new(Version::new(0, 3, 0));
    let main = obj.add_module("main", 1);
    let fact_ty = types.tfn(&[Builtin::Int.id()], Builtin::Int.id());

    obj.add_function(FnInfo {
        name: "fact".into(),
        module: main,
        offset: 100,
        frame_size: 1,
        ty: fact_ty,
    });

    let vm = Vm::new(&runtime, obj, types);

    (runtime, vm)
}

/// Drives `fact` by hand the way an interpreter loop would: argument on
/// the stack, result in r0.
fn fact(t: &mut VmThread, n: i64) -> Result<i64, VmError> {
    let ix = t.vm().object_file().find_function("fact").unwrap();

    t.push(Value::from_int(n))?;
    t.call(ix, 10)?;

    let arg = t.local(-2)?.as_int();
    let result = if arg <= 1 { 1 } else { arg * fact(t, arg - 1)? };

    t.set_local(1, Value::from_int(result))?;
    let local = t.local(1)?;
    t.set_register(0, local)?;
    t.ret()?;
    t.move_sp(-1)?;

    Ok(t.register(0)?.as_int())
}

#[test]
fn recursive_calls_unwind_cleanly() {
    let (_rt, vm) = build(32);
    let mut t = VmThread::new(&vm);

    assert_eq!(fact(&mut t, 10), Ok(3_628_800));
    assert_eq!(t.depth(), 0);
    assert_eq!(t.stack_len(), 0);
    assert!(!t.has_error());

    let ty = vm.object_file().function(0).unwrap().ty;
    assert_eq!(vm.types().type_name(ty), "(int) -> int");
}

#[test]
fn deep_recursion_hits_the_call_limit() {
    let (_rt, vm) = build(8);
    let mut t = VmThread::new(&vm);

    assert_eq!(fact(&mut t, 20), Err(VmError::CallDepthExceeded { max: 8 }));
    assert!(t.has_error());
    assert_eq!(t.depth(), 8);
}

#[test]
fn frames_record_the_call_chain() {
    let (_rt, vm) = build(8);
    let mut t = VmThread::new(&vm);

    t.set_pc(3);
    t.call_module(0, 1).unwrap();
    t.set_pc(17);
    t.call(0, 42).unwrap();

    let frames = t.frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].target_fn, None);
    assert_eq!(frames[0].pc, 3);
    assert_eq!(frames[1].target_fn, Some(0));
    assert_eq!(frames[1].call_line, 42);
    assert_eq!(frames[1].pc, 17);
    assert_eq!(t.pc(), 100);

    t.ret().unwrap();
    assert_eq!(t.pc(), 17);
    t.ret().unwrap();
    assert_eq!(t.pc(), 3);
}

#[test]
fn heap_values_on_the_stack_follow_collection() {
    let (_rt, vm) = build(8);
    let mut t = VmThread::new(&vm);

    for i in 0..10u8 {
        let p = t.alloc(128, ScanPolicy::None);
        unsafe { p.as_ptr().write_bytes(i, 128) };
        t.push(Value::from_ptr(p.as_ptr())).unwrap();
    }

    let r = t.alloc(8, ScanPolicy::None);
    unsafe { (r.as_ptr() as *mut u64).write(99) };
    t.set_register(2, Value::from_ptr(r.as_ptr())).unwrap();

    let stats = t.heap().collect();
    assert_eq!(stats.records_copied, 11);

    let reg: *const u64 = t.register(2).unwrap().as_ptr();
    assert_eq!(unsafe { *reg }, 99);

    for i in (0..10u8).rev() {
        let p: *const u8 = t.pop().unwrap().as_ptr();
        let bytes = unsafe { std::slice::from_raw_parts(p, 128) };
        assert!(bytes.iter().all(|b| *b == i));
    }
}

#[test]
fn threads_share_globals() {
    let (_rt, vm) = build(8);
    let writer = {
        let vm = vm.clone();
        std::thread::spawn(move || {
            let t = VmThread::new(&vm);
            t.vm().set_global(0, 0, Value::from_int(5)).unwrap();
        })
    };

    vm.runtime().blocking(|| writer.join().unwrap());
    assert_eq!(vm.global(0, 0).unwrap().as_int(), 5);
}
