use super::helpers::*;
use luma_bytecode::builder::ProtoBuilder;
use luma_bytecode::opcode::OpCode;
use luma_vm::{HookAction, Vm};
use std::cell::Cell;
use std::rc::Rc;

/// `local i = 0; while true do i = i + 1 end`
fn spin() -> ProtoBuilder {
    let mut b = ProtoBuilder::new("=spin");
    b.load_num(0, 0.0);
    let top = b.here();
    let one = b.rk_num(1.0);
    b.abc(OpCode::Add, 0, 0, one);
    b.jump_to(OpCode::Jmp, 0, top);
    b.abc(OpCode::Return, 0, 1, 0);
    b
}

#[test]
fn test_hook_aborts_runaway_loop() {
    let mut vm = new_vm();
    let f = load(&mut vm, &spin());
    vm.set_count_hook(1000, Box::new(|_: &mut Vm| HookAction::Abort("timeout".into())));
    let err = vm.call_value(f, &[]).unwrap_err();
    assert_eq!(error_message(&mut vm, err), "spin:1: timeout");
    assert!(vm.call_stack.is_empty());
}

#[test]
fn test_hook_fires_every_count_instructions() {
    // Three LOADKs and a RETURN: four instructions.
    let mut b = ProtoBuilder::new("=test");
    b.load_num(0, 1.0);
    b.load_num(0, 2.0);
    b.load_num(0, 3.0);
    b.abc(OpCode::Return, 0, 2, 0);

    let fired = Rc::new(Cell::new(0));
    let seen = Rc::clone(&fired);
    let mut vm = new_vm();
    vm.set_count_hook(
        2,
        Box::new(move |_: &mut Vm| {
            seen.set(seen.get() + 1);
            HookAction::Continue
        }),
    );
    let results = run_in(&mut vm, &b);
    assert_num(&results, 0, 3.0);
    assert_eq!(fired.get(), 2);
    assert!(vm.has_hook());

    vm.clear_hook();
    assert!(!vm.has_hook());
    run_in(&mut vm, &b);
    assert_eq!(fired.get(), 2);
}

#[test]
fn test_hook_yield_preempts_coroutine() {
    let mut vm = new_vm();
    let f = load(&mut vm, &spin());
    let co = vm.new_thread(f).unwrap();
    vm.set_count_hook(100, Box::new(|_: &mut Vm| HookAction::Yield));

    for _ in 0..3 {
        let values = vm.resume(co, &[]).unwrap();
        assert!(values.is_empty());
        assert_eq!(vm.thread_status(co), Some("suspended"));
    }
    assert!(vm.current_thread == vm.main_thread);
}

#[test]
fn test_hook_yield_ignored_on_main_thread() {
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    let mut vm = new_vm();
    let f = load(&mut vm, &spin());
    vm.set_count_hook(
        10,
        Box::new(move |_: &mut Vm| {
            counter.set(counter.get() + 1);
            if counter.get() < 3 {
                HookAction::Yield
            } else {
                HookAction::Abort("stop".into())
            }
        }),
    );
    let err = vm.call_value(f, &[]).unwrap_err();
    assert_eq!(error_message(&mut vm, err), "spin:1: stop");
    assert_eq!(calls.get(), 3);
}

#[test]
fn test_hook_can_use_host_api() {
    // The callback counts its firings in a global.
    let mut vm = new_vm();
    vm.set_count_hook(
        1,
        Box::new(|vm: &mut Vm| {
            let n = global(vm, "ticks").as_number().unwrap_or(0.0);
            vm.push_number(n + 1.0);
            vm.set_global("ticks").unwrap();
            HookAction::Continue
        }),
    );
    let mut b = ProtoBuilder::new("=test");
    b.load_num(0, 1.0);
    b.abc(OpCode::Return, 0, 2, 0);
    run_in(&mut vm, &b);
    vm.clear_hook();
    assert_eq!(global(&mut vm, "ticks").as_number(), Some(2.0));
}
