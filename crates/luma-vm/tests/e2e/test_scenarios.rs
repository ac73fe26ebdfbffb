use super::helpers::*;
use luma_bytecode::builder::ProtoBuilder;
use luma_bytecode::opcode::OpCode;

#[test]
fn test_table_border_with_hole() {
    // local t = {1,2,3}; t[5] = 5; return #t
    let mut b = ProtoBuilder::new("=test");
    b.abc(OpCode::NewTable, 0, 3, 0);
    b.load_num(1, 1.0);
    b.load_num(2, 2.0);
    b.load_num(3, 3.0);
    b.set_list(0, 3, 1);
    let five = b.rk_num(5.0);
    b.abc(OpCode::SetTable, 0, five, five);
    b.abc(OpCode::Len, 1, 0, 0);
    b.abc(OpCode::Return, 1, 2, 0);

    let (_vm, results) = run(&b);
    let n = results[0].as_number().unwrap();
    assert!(n == 3.0 || n == 5.0, "#t = {n}, expected a border (3 or 5)");
}

#[test]
fn test_counter_closure() {
    // local function counter() local n = 0; return function() n = n + 1; return n end end
    // local c = counter(); c(); return c()
    let mut inner = ProtoBuilder::new("").upvalues(1);
    inner.abc(OpCode::GetUpval, 0, 0, 0);
    let one = inner.rk_num(1.0);
    inner.abc(OpCode::Add, 0, 0, one);
    inner.abc(OpCode::SetUpval, 0, 0, 0);
    inner.abc(OpCode::GetUpval, 0, 0, 0);
    inner.abc(OpCode::Return, 0, 2, 0);
    inner.abc(OpCode::Return, 0, 1, 0);

    let mut counter = ProtoBuilder::new("");
    counter.load_num(0, 0.0);
    let idx = counter.child(inner);
    counter.abx(OpCode::Closure, 1, idx);
    counter.abc(OpCode::Move, 0, 0, 0);
    counter.abc(OpCode::Return, 1, 2, 0);
    counter.abc(OpCode::Return, 0, 1, 0);

    let mut b = ProtoBuilder::new("=test");
    let idx = b.child(counter);
    b.abx(OpCode::Closure, 0, idx);
    b.abc(OpCode::Move, 1, 0, 0);
    b.abc(OpCode::Call, 1, 1, 2);
    b.abc(OpCode::Move, 2, 1, 0);
    b.abc(OpCode::Call, 2, 1, 1);
    b.abc(OpCode::Move, 2, 1, 0);
    b.abc(OpCode::Call, 2, 1, 2);
    b.abc(OpCode::Return, 2, 2, 0);

    run_check_nums(&b, &[2.0]);
}

#[test]
fn test_string_coerces_in_arithmetic() {
    // return 1 + "2"
    let mut b = ProtoBuilder::new("=test");
    let one = b.rk_num(1.0);
    let two = b.rk_str("2");
    b.abc(OpCode::Add, 0, one, two);
    b.abc(OpCode::Return, 0, 2, 0);
    run_check_nums(&b, &[3.0]);
}

#[test]
fn test_arithmetic_on_table_fails() {
    // return 1 + {}
    let mut b = ProtoBuilder::new("=test");
    b.abc(OpCode::NewTable, 0, 0, 0);
    let one = b.rk_num(1.0);
    b.abc(OpCode::Add, 0, one, 0);
    b.abc(OpCode::Return, 0, 2, 0);

    let msg = run_err(&b);
    assert!(msg.contains("table"), "unexpected message: {msg}");
    assert_eq!(msg, "test:1: attempt to perform arithmetic on a table value");
}

/// `coroutine.create(function() coroutine.yield(1, 2); return 3 end)`
/// resumed three times.
#[test]
fn test_coroutine_yield_then_return_then_dead() {
    let mut body = ProtoBuilder::new("");
    body.get_global(0, "coroutine");
    let yield_k = body.rk_str("yield");
    body.abc(OpCode::GetTable, 0, 0, yield_k);
    body.load_num(1, 1.0);
    body.load_num(2, 2.0);
    body.abc(OpCode::Call, 0, 3, 1);
    body.load_num(0, 3.0);
    body.abc(OpCode::Return, 0, 2, 0);
    body.abc(OpCode::Return, 0, 1, 0);

    let mut b = ProtoBuilder::new("=test");
    b.get_global(0, "coroutine");
    let create = b.rk_str("create");
    b.abc(OpCode::GetTable, 0, 0, create);
    let idx = b.child(body);
    b.abx(OpCode::Closure, 1, idx);
    b.abc(OpCode::Call, 0, 2, 2);
    b.get_global(1, "coroutine");
    let resume = b.rk_str("resume");
    b.abc(OpCode::GetTable, 1, 1, resume);
    // R2..R4 = resume(co)
    b.abc(OpCode::Move, 2, 1, 0);
    b.abc(OpCode::Move, 3, 0, 0);
    b.abc(OpCode::Call, 2, 2, 4);
    // R5..R6 = resume(co)
    b.abc(OpCode::Move, 5, 1, 0);
    b.abc(OpCode::Move, 6, 0, 0);
    b.abc(OpCode::Call, 5, 2, 3);
    // R7..R8 = resume(co)
    b.abc(OpCode::Move, 7, 1, 0);
    b.abc(OpCode::Move, 8, 0, 0);
    b.abc(OpCode::Call, 7, 2, 3);
    b.abc(OpCode::Return, 2, 8, 0);

    let (vm, results) = run(&b);
    assert_eq!(results.len(), 7);
    assert_bool(&results, 0, true);
    assert_num(&results, 1, 1.0);
    assert_num(&results, 2, 2.0);
    assert_bool(&results, 3, true);
    assert_num(&results, 4, 3.0);
    assert_bool(&results, 5, false);
    assert_str(&results, 6, "cannot resume dead coroutine", &vm);
}

#[test]
fn test_pcall_catches_error() {
    // return pcall(function() error("boom") end)
    let mut f = ProtoBuilder::new("");
    f.get_global(0, "error");
    f.load_str(1, "boom");
    f.abc(OpCode::Call, 0, 2, 1);
    f.abc(OpCode::Return, 0, 1, 0);

    let mut b = ProtoBuilder::new("=test");
    b.get_global(0, "pcall");
    let idx = b.child(f);
    b.abx(OpCode::Closure, 1, idx);
    b.abc(OpCode::Call, 0, 2, 0);
    b.abc(OpCode::Return, 0, 0, 0);

    let (vm, results) = run(&b);
    assert_eq!(results.len(), 2);
    assert_bool(&results, 0, false);
    assert_str(&results, 1, "test:1: boom", &vm);
}
