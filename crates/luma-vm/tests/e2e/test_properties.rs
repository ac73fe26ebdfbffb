use super::helpers::*;
use luma_bytecode::builder::ProtoBuilder;
use luma_bytecode::opcode::OpCode;
use luma_core::value::TValue;
use luma_vm::{Vm, VmConfig};
use proptest::prelude::*;

/// `function loop(n) if n == 0 then return "done" end return loop(n - 1) end`,
/// with the recursive call made as a tail call or a plain call.
fn countdown(tail: bool) -> ProtoBuilder {
    let mut f = ProtoBuilder::new("").params(1);
    let zero = f.rk_num(0.0);
    f.abc(OpCode::Eq, 0, 0, zero);
    let skip = f.asbx(OpCode::Jmp, 0, 0);
    f.load_str(1, "done");
    f.abc(OpCode::Return, 1, 2, 0);
    let recurse = f.here();
    f.patch_to(skip, recurse);
    f.get_global(1, "loop");
    let one = f.rk_num(1.0);
    f.abc(OpCode::Sub, 2, 0, one);
    if tail {
        f.abc(OpCode::TailCall, 1, 2, 0);
        f.abc(OpCode::Return, 1, 0, 0);
    } else {
        f.abc(OpCode::Call, 1, 2, 2);
        f.abc(OpCode::Return, 1, 2, 0);
    }
    f.abc(OpCode::Return, 0, 1, 0);

    let mut b = ProtoBuilder::new("=test");
    let idx = b.child(f);
    b.abx(OpCode::Closure, 0, idx);
    b.set_global(0, "loop");
    b
}

fn call_countdown(b: &mut ProtoBuilder, n: f64) {
    b.get_global(0, "loop");
    b.load_num(1, n);
    b.abc(OpCode::Call, 0, 2, 2);
    b.abc(OpCode::Return, 0, 2, 0);
}

fn limited_vm(max_depth: usize) -> Vm {
    let mut vm = Vm::with_config(VmConfig::default().max_call_depth(max_depth));
    luma_stdlib::open_libs(&mut vm).unwrap();
    vm
}

#[test]
fn test_million_tail_calls_use_one_frame() {
    let mut b = countdown(true);
    call_countdown(&mut b, 1_000_000.0);

    // Far fewer frames than calls: only tail calls can finish.
    let mut vm = limited_vm(16);
    let results = run_in(&mut vm, &b);
    assert_str(&results, 0, "done", &vm);
    assert!(vm.call_stack.is_empty());
    assert!(vm.stack.len() < 1024, "stack grew to {}", vm.stack.len());
}

#[test]
fn test_plain_recursion_overflows() {
    let mut b = countdown(false);
    call_countdown(&mut b, 1_000.0);

    let mut vm = limited_vm(100);
    let f = load(&mut vm, &b);
    let err = vm.call_value(f, &[]).unwrap_err();
    let msg = error_message(&mut vm, err);
    assert!(msg.contains("stack overflow"), "unexpected message: {msg}");
    // The failed call left nothing behind.
    assert!(vm.call_stack.is_empty());
    assert_eq!(vm.stack_top, 0);
}

fn inc_proto() -> ProtoBuilder {
    let mut inc = ProtoBuilder::new("").upvalues(1);
    inc.abc(OpCode::GetUpval, 0, 0, 0);
    let one = inc.rk_num(1.0);
    inc.abc(OpCode::Add, 0, 0, one);
    inc.abc(OpCode::SetUpval, 0, 0, 0);
    inc.abc(OpCode::Return, 0, 1, 0);
    inc
}

fn get_proto() -> ProtoBuilder {
    let mut get = ProtoBuilder::new("").upvalues(1);
    get.abc(OpCode::GetUpval, 0, 0, 0);
    get.abc(OpCode::Return, 0, 2, 0);
    get.abc(OpCode::Return, 0, 1, 0);
    get
}

#[test]
fn test_open_upvalue_aliases_local() {
    // local x = 0
    // local function inc() x = x + 1 end
    // local function get() return x end
    // inc(); local a = x; local b = get(); x = 10; return a, b, get()
    let mut b = ProtoBuilder::new("=test");
    let inc = b.child(inc_proto());
    let get = b.child(get_proto());
    b.load_num(0, 0.0);
    b.abx(OpCode::Closure, 1, inc);
    b.abc(OpCode::Move, 0, 0, 0);
    b.abx(OpCode::Closure, 2, get);
    b.abc(OpCode::Move, 0, 0, 0);
    b.abc(OpCode::Move, 3, 1, 0);
    b.abc(OpCode::Call, 3, 1, 1);
    b.abc(OpCode::Move, 3, 0, 0);
    b.abc(OpCode::Move, 4, 2, 0);
    b.abc(OpCode::Call, 4, 1, 2);
    b.load_num(0, 10.0);
    b.abc(OpCode::Move, 5, 2, 0);
    b.abc(OpCode::Call, 5, 1, 2);
    b.abc(OpCode::Return, 3, 4, 0);

    run_check_nums(&b, &[1.0, 1.0, 10.0]);
}

#[test]
fn test_closed_upvalue_shared_between_closures() {
    // local function pair() local x = 0; return function() x = x + 1 end,
    //     function() return x end end
    // local inc, get = pair(); inc(); inc(); return get()
    let mut pair = ProtoBuilder::new("");
    let inc = pair.child(inc_proto());
    let get = pair.child(get_proto());
    pair.load_num(0, 0.0);
    pair.abx(OpCode::Closure, 1, inc);
    pair.abc(OpCode::Move, 0, 0, 0);
    pair.abx(OpCode::Closure, 2, get);
    pair.abc(OpCode::Move, 0, 0, 0);
    pair.abc(OpCode::Return, 1, 3, 0);
    pair.abc(OpCode::Return, 0, 1, 0);

    let mut b = ProtoBuilder::new("=test");
    let idx = b.child(pair);
    b.abx(OpCode::Closure, 0, idx);
    b.abc(OpCode::Call, 0, 1, 3);
    b.abc(OpCode::Move, 2, 0, 0);
    b.abc(OpCode::Call, 2, 1, 1);
    b.abc(OpCode::Move, 2, 0, 0);
    b.abc(OpCode::Call, 2, 1, 1);
    b.abc(OpCode::Move, 2, 1, 0);
    b.abc(OpCode::Call, 2, 1, 2);
    b.abc(OpCode::Return, 2, 2, 0);

    run_check_nums(&b, &[2.0]);
}

/// `for i = 1, 3 do coroutine.yield(i) end return "end"`
fn generator() -> ProtoBuilder {
    let mut g = ProtoBuilder::new("=gen");
    g.load_num(0, 1.0);
    g.load_num(1, 3.0);
    g.load_num(2, 1.0);
    let prep = g.asbx(OpCode::ForPrep, 0, 0);
    let body = g.here();
    g.get_global(4, "coroutine");
    let yield_k = g.rk_str("yield");
    g.abc(OpCode::GetTable, 4, 4, yield_k);
    g.abc(OpCode::Move, 5, 3, 0);
    g.abc(OpCode::Call, 4, 2, 1);
    let looptop = g.here();
    g.patch_to(prep, looptop);
    g.jump_to(OpCode::ForLoop, 0, body);
    g.load_str(0, "end");
    g.abc(OpCode::Return, 0, 2, 0);
    g.abc(OpCode::Return, 0, 1, 0);
    g
}

fn render(vm: &Vm, v: TValue) -> String {
    match vm.str_bytes(v) {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None => format!("{}", v.as_number().unwrap_or(f64::NAN)),
    }
}

fn trace_generator() -> Vec<String> {
    let mut vm = new_vm();
    let f = load(&mut vm, &generator());
    let co = vm.new_thread(f).unwrap();
    let mut trace = Vec::new();
    loop {
        match vm.resume(co, &[]) {
            Ok(values) => {
                trace.extend(values.iter().map(|&v| render(&vm, v)));
                trace.push(vm.thread_status(co).unwrap().to_string());
            }
            Err(e) => {
                trace.push(render(&vm, e));
                break;
            }
        }
    }
    trace
}

#[test]
fn test_coroutine_runs_are_deterministic() {
    let first = trace_generator();
    assert_eq!(
        first,
        vec![
            "1",
            "suspended",
            "2",
            "suspended",
            "3",
            "suspended",
            "end",
            "dead",
            "cannot resume dead coroutine",
        ]
    );
    for _ in 0..3 {
        assert_eq!(trace_generator(), first);
    }
}

/// `function(...) return ... end`
fn identity(vm: &mut Vm) -> TValue {
    let mut b = ProtoBuilder::new("=id").vararg();
    b.abc(OpCode::VarArg, 0, 0, 0);
    b.abc(OpCode::Return, 0, 0, 0);
    load(vm, &b)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_pcall_returns_values(x in -1e9f64..1e9, s in "[a-z ]{0,12}") {
        let mut vm = new_vm();
        let pcall = global(&mut vm, "pcall");
        let id = identity(&mut vm);
        let sv = vm.intern(s.as_bytes());
        let results = vm.call_value(pcall, &[id, TValue::from_number(x), sv]).unwrap();
        prop_assert_eq!(results.len(), 3);
        prop_assert_eq!(results[0].as_bool(), Some(true));
        prop_assert_eq!(results[1].as_number(), Some(x));
        prop_assert!(results[2].raw_equal(&sv));
    }

    #[test]
    fn prop_pcall_returns_error_object(s in "[a-z ]{1,12}") {
        let mut vm = new_vm();
        let pcall = global(&mut vm, "pcall");
        let error = global(&mut vm, "error");
        let sv = vm.intern(s.as_bytes());
        let results = vm.call_value(pcall, &[error, sv]).unwrap();
        prop_assert_eq!(results.len(), 2);
        prop_assert_eq!(results[0].as_bool(), Some(false));
        prop_assert!(results[1].raw_equal(&sv));
        prop_assert_eq!(vm.stack_top, 0);
    }
}
