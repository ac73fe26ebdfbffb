use super::helpers::*;
use luma_bytecode::builder::ProtoBuilder;
use luma_bytecode::opcode::OpCode;

/// `R[dst] = (lhs <op> rhs)` as a boolean, the way conditions are compiled.
fn emit_bool(b: &mut ProtoBuilder, op: OpCode, dst: u32, lhs: u32, rhs: u32) {
    b.abc(op, 1, lhs, rhs);
    b.asbx(OpCode::Jmp, 0, 1);
    b.abc(OpCode::LoadBool, dst, 0, 1);
    b.abc(OpCode::LoadBool, dst, 1, 0);
}

/// `R[dst] = setmetatable({}, { <event> = <closure> ... })`, using
/// registers `dst..dst+3`.
fn object_with(b: &mut ProtoBuilder, dst: u32, events: Vec<(&str, ProtoBuilder)>) {
    b.get_global(dst, "setmetatable");
    b.abc(OpCode::NewTable, dst + 1, 0, 0);
    b.abc(OpCode::NewTable, dst + 2, 0, 0);
    for (event, handler) in events {
        let idx = b.child(handler);
        b.abx(OpCode::Closure, dst + 3, idx);
        let key = b.rk_str(event);
        b.abc(OpCode::SetTable, dst + 2, key, dst + 3);
    }
    b.abc(OpCode::Call, dst, 3, 2);
}

/// `R[dst] = setmetatable({}, R[mt])`
fn instance(b: &mut ProtoBuilder, dst: u32, mt: u32) {
    b.get_global(dst, "setmetatable");
    b.abc(OpCode::NewTable, dst + 1, 0, 0);
    b.abc(OpCode::Move, dst + 2, mt, 0);
    b.abc(OpCode::Call, dst, 3, 2);
}

#[test]
fn test_index_function() {
    // function(t, k) return k .. "!" end
    let mut handler = ProtoBuilder::new("").params(2);
    handler.abc(OpCode::Move, 2, 1, 0);
    handler.load_str(3, "!");
    handler.abc(OpCode::Concat, 2, 2, 3);
    handler.abc(OpCode::Return, 2, 2, 0);
    handler.abc(OpCode::Return, 0, 1, 0);

    let mut b = ProtoBuilder::new("=test");
    object_with(&mut b, 0, vec![("__index", handler)]);
    let foo = b.rk_str("foo");
    b.abc(OpCode::GetTable, 1, 0, foo);
    b.abc(OpCode::Return, 1, 2, 0);

    let (vm, results) = run(&b);
    assert_str(&results, 0, "foo!", &vm);
}

#[test]
fn test_index_and_newindex_tables() {
    // local base = {x = 1}
    // local proxy = setmetatable({}, {__index = base, __newindex = base})
    // proxy.y = 2
    // return proxy.x, rawget(proxy, "y"), base.y
    let mut b = ProtoBuilder::new("=test");
    let x = b.rk_str("x");
    let y = b.rk_str("y");
    let one = b.rk_num(1.0);
    let two = b.rk_num(2.0);
    let index = b.rk_str("__index");
    let newindex = b.rk_str("__newindex");
    b.abc(OpCode::NewTable, 0, 0, 1);
    b.abc(OpCode::SetTable, 0, x, one);
    b.get_global(1, "setmetatable");
    b.abc(OpCode::NewTable, 2, 0, 0);
    b.abc(OpCode::NewTable, 3, 0, 2);
    b.abc(OpCode::SetTable, 3, index, 0);
    b.abc(OpCode::SetTable, 3, newindex, 0);
    b.abc(OpCode::Call, 1, 3, 2);
    b.abc(OpCode::SetTable, 1, y, two);
    b.abc(OpCode::GetTable, 2, 1, x);
    b.get_global(3, "rawget");
    b.abc(OpCode::Move, 4, 1, 0);
    b.load_str(5, "y");
    b.abc(OpCode::Call, 3, 3, 2);
    b.abc(OpCode::GetTable, 4, 0, y);
    b.abc(OpCode::Return, 2, 4, 0);

    let (_vm, results) = run(&b);
    assert_eq!(results.len(), 3);
    assert_num(&results, 0, 1.0);
    assert_nil(&results, 1);
    assert_num(&results, 2, 2.0);
}

#[test]
fn test_index_loop_is_detected() {
    // local t = setmetatable({}, {}); getmetatable(t).__index = t; return t.missing
    let mut b = ProtoBuilder::new("=test");
    b.get_global(0, "setmetatable");
    b.abc(OpCode::NewTable, 1, 0, 0);
    b.abc(OpCode::NewTable, 2, 0, 0);
    b.abc(OpCode::Call, 0, 3, 2);
    b.get_global(1, "getmetatable");
    b.abc(OpCode::Move, 2, 0, 0);
    b.abc(OpCode::Call, 1, 2, 2);
    let index = b.rk_str("__index");
    b.abc(OpCode::SetTable, 1, index, 0);
    let missing = b.rk_str("missing");
    b.abc(OpCode::GetTable, 1, 0, missing);
    b.abc(OpCode::Return, 1, 2, 0);

    let msg = run_err(&b);
    assert!(msg.contains("loop in gettable"), "unexpected message: {msg}");
}

#[test]
fn test_newindex_loop_is_detected() {
    // local t = setmetatable({}, {}); getmetatable(t).__newindex = t; t.k = 1
    let mut b = ProtoBuilder::new("=test");
    b.get_global(0, "setmetatable");
    b.abc(OpCode::NewTable, 1, 0, 0);
    b.abc(OpCode::NewTable, 2, 0, 0);
    b.abc(OpCode::Call, 0, 3, 2);
    b.get_global(1, "getmetatable");
    b.abc(OpCode::Move, 2, 0, 0);
    b.abc(OpCode::Call, 1, 2, 2);
    let newindex = b.rk_str("__newindex");
    b.abc(OpCode::SetTable, 1, newindex, 0);
    let k = b.rk_str("k");
    let one = b.rk_num(1.0);
    b.abc(OpCode::SetTable, 0, k, one);
    b.abc(OpCode::Return, 0, 1, 0);

    assert_eq!(run_err(&b), "test:1: loop in settable");
}

#[test]
fn test_call_metamethod() {
    // local obj = setmetatable({}, {__call = function(self, a) return a * 2 end})
    // return obj(21)
    let mut handler = ProtoBuilder::new("").params(2);
    let two = handler.rk_num(2.0);
    handler.abc(OpCode::Mul, 2, 1, two);
    handler.abc(OpCode::Return, 2, 2, 0);
    handler.abc(OpCode::Return, 0, 1, 0);

    let mut b = ProtoBuilder::new("=test");
    object_with(&mut b, 0, vec![("__call", handler)]);
    b.load_num(1, 21.0);
    b.abc(OpCode::Call, 0, 2, 2);
    b.abc(OpCode::Return, 0, 2, 0);

    run_check_nums(&b, &[42.0]);
}

#[test]
fn test_arith_and_unm_metamethods() {
    // __add returns 100, __unm returns -1; return obj + 1, 1 + obj, -obj
    let mut add = ProtoBuilder::new("").params(2);
    add.load_num(2, 100.0);
    add.abc(OpCode::Return, 2, 2, 0);
    add.abc(OpCode::Return, 0, 1, 0);
    let mut unm = ProtoBuilder::new("").params(2);
    unm.load_num(2, -1.0);
    unm.abc(OpCode::Return, 2, 2, 0);
    unm.abc(OpCode::Return, 0, 1, 0);

    let mut b = ProtoBuilder::new("=test");
    object_with(&mut b, 0, vec![("__add", add), ("__unm", unm)]);
    let one = b.rk_num(1.0);
    b.abc(OpCode::Add, 1, 0, one);
    b.abc(OpCode::Add, 2, one, 0);
    b.abc(OpCode::Unm, 3, 0, 0);
    b.abc(OpCode::Return, 1, 4, 0);

    run_check_nums(&b, &[100.0, 100.0, -1.0]);
}

#[test]
fn test_eq_metamethod_needs_shared_handler() {
    // local mt = {__eq = function() return true end}
    // local a, b = setmetatable({}, mt), setmetatable({}, mt)
    // return a == b, rawequal(a, b), a == {}
    let mut always = ProtoBuilder::new("").params(2);
    always.abc(OpCode::LoadBool, 2, 1, 0);
    always.abc(OpCode::Return, 2, 2, 0);
    always.abc(OpCode::Return, 0, 1, 0);

    let mut b = ProtoBuilder::new("=test");
    let eq = b.rk_str("__eq");
    b.abc(OpCode::NewTable, 0, 0, 1);
    let idx = b.child(always);
    b.abx(OpCode::Closure, 1, idx);
    b.abc(OpCode::SetTable, 0, eq, 1);
    instance(&mut b, 1, 0);
    instance(&mut b, 2, 0);
    emit_bool(&mut b, OpCode::Eq, 3, 1, 2);
    b.get_global(4, "rawequal");
    b.abc(OpCode::Move, 5, 1, 0);
    b.abc(OpCode::Move, 6, 2, 0);
    b.abc(OpCode::Call, 4, 3, 2);
    b.abc(OpCode::NewTable, 6, 0, 0);
    emit_bool(&mut b, OpCode::Eq, 5, 1, 6);
    b.abc(OpCode::Return, 3, 4, 0);

    let (_vm, results) = run(&b);
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, false);
    // The plain table has no __eq, so the handlers differ.
    assert_bool(&results, 2, false);
}

#[test]
fn test_lt_metamethod_and_le_fallback() {
    // local mt = {__lt = function(a, b) return a.v < b.v end}
    // local a = setmetatable({}, mt); a.v = 1
    // local b = setmetatable({}, mt); b.v = 2
    // return a < b, b < a, a <= b
    let mut lt = ProtoBuilder::new("").params(2);
    let v = lt.rk_str("v");
    lt.abc(OpCode::GetTable, 2, 0, v);
    lt.abc(OpCode::GetTable, 3, 1, v);
    emit_bool(&mut lt, OpCode::Lt, 4, 2, 3);
    lt.abc(OpCode::Return, 4, 2, 0);
    lt.abc(OpCode::Return, 0, 1, 0);

    let mut b = ProtoBuilder::new("=test");
    let lt_key = b.rk_str("__lt");
    let v = b.rk_str("v");
    let one = b.rk_num(1.0);
    let two = b.rk_num(2.0);
    b.abc(OpCode::NewTable, 0, 0, 1);
    let idx = b.child(lt);
    b.abx(OpCode::Closure, 1, idx);
    b.abc(OpCode::SetTable, 0, lt_key, 1);
    instance(&mut b, 1, 0);
    b.abc(OpCode::SetTable, 1, v, one);
    instance(&mut b, 2, 0);
    b.abc(OpCode::SetTable, 2, v, two);
    emit_bool(&mut b, OpCode::Lt, 3, 1, 2);
    emit_bool(&mut b, OpCode::Lt, 4, 2, 1);
    emit_bool(&mut b, OpCode::Le, 5, 1, 2);
    b.abc(OpCode::Return, 3, 4, 0);

    let (_vm, results) = run(&b);
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, false);
    assert_bool(&results, 2, true);
}

#[test]
fn test_le_metamethod_is_used_directly() {
    // __le answers a.v >= b.v, so it disagrees with `not (b < a)` through __lt.
    // local mt = {__le = ..., __lt = function(a, b) return a.v < b.v end}
    // local a = setmetatable({}, mt); a.v = 1
    // local b = setmetatable({}, mt); b.v = 2
    // return a <= b, b <= a
    let mut le = ProtoBuilder::new("").params(2);
    let v = le.rk_str("v");
    le.abc(OpCode::GetTable, 2, 0, v);
    le.abc(OpCode::GetTable, 3, 1, v);
    emit_bool(&mut le, OpCode::Le, 4, 3, 2);
    le.abc(OpCode::Return, 4, 2, 0);
    le.abc(OpCode::Return, 0, 1, 0);

    let mut lt = ProtoBuilder::new("").params(2);
    let v = lt.rk_str("v");
    lt.abc(OpCode::GetTable, 2, 0, v);
    lt.abc(OpCode::GetTable, 3, 1, v);
    emit_bool(&mut lt, OpCode::Lt, 4, 2, 3);
    lt.abc(OpCode::Return, 4, 2, 0);
    lt.abc(OpCode::Return, 0, 1, 0);

    let mut b = ProtoBuilder::new("=test");
    let le_key = b.rk_str("__le");
    let lt_key = b.rk_str("__lt");
    let v = b.rk_str("v");
    let one = b.rk_num(1.0);
    let two = b.rk_num(2.0);
    b.abc(OpCode::NewTable, 0, 0, 2);
    let idx = b.child(le);
    b.abx(OpCode::Closure, 1, idx);
    b.abc(OpCode::SetTable, 0, le_key, 1);
    let idx = b.child(lt);
    b.abx(OpCode::Closure, 1, idx);
    b.abc(OpCode::SetTable, 0, lt_key, 1);
    instance(&mut b, 1, 0);
    b.abc(OpCode::SetTable, 1, v, one);
    instance(&mut b, 2, 0);
    b.abc(OpCode::SetTable, 2, v, two);
    emit_bool(&mut b, OpCode::Le, 3, 1, 2);
    emit_bool(&mut b, OpCode::Le, 4, 2, 1);
    b.abc(OpCode::Return, 3, 3, 0);

    let (_vm, results) = run(&b);
    assert_bool(&results, 0, false);
    assert_bool(&results, 1, true);
}

#[test]
fn test_compare_errors() {
    // return {} < {}
    let mut b = ProtoBuilder::new("=test");
    b.abc(OpCode::NewTable, 0, 0, 0);
    b.abc(OpCode::NewTable, 1, 0, 0);
    emit_bool(&mut b, OpCode::Lt, 2, 0, 1);
    b.abc(OpCode::Return, 2, 2, 0);
    assert_eq!(run_err(&b), "test:1: attempt to compare two table values");

    // return 1 < "2"
    let mut b = ProtoBuilder::new("=test");
    let one = b.rk_num(1.0);
    let two = b.rk_str("2");
    b.abc(OpCode::Lt, 1, one, two);
    b.asbx(OpCode::Jmp, 0, 0);
    b.abc(OpCode::Return, 0, 1, 0);
    assert_eq!(run_err(&b), "test:1: attempt to compare number with string");
}

#[test]
fn test_concat_metamethod() {
    // return setmetatable({}, {__concat = function(a, b) return "cat" end}) .. "x"
    let mut handler = ProtoBuilder::new("").params(2);
    handler.load_str(2, "cat");
    handler.abc(OpCode::Return, 2, 2, 0);
    handler.abc(OpCode::Return, 0, 1, 0);

    let mut b = ProtoBuilder::new("=test");
    object_with(&mut b, 0, vec![("__concat", handler)]);
    b.load_str(1, "x");
    b.abc(OpCode::Concat, 0, 0, 1);
    b.abc(OpCode::Return, 0, 2, 0);

    let (vm, results) = run(&b);
    assert_str(&results, 0, "cat", &vm);
}

#[test]
fn test_concat_numbers_and_strings() {
    // return "n=" .. 1.5 .. "/" .. 10
    let mut b = ProtoBuilder::new("=test");
    b.load_str(0, "n=");
    b.load_num(1, 1.5);
    b.load_str(2, "/");
    b.load_num(3, 10.0);
    b.abc(OpCode::Concat, 0, 0, 3);
    b.abc(OpCode::Return, 0, 2, 0);

    let (vm, results) = run(&b);
    assert_str(&results, 0, "n=1.5/10", &vm);
}

#[test]
fn test_concat_error_names_type() {
    // return "a" .. {}
    let mut b = ProtoBuilder::new("=test");
    b.load_str(0, "a");
    b.abc(OpCode::NewTable, 1, 0, 0);
    b.abc(OpCode::Concat, 0, 0, 1);
    b.abc(OpCode::Return, 0, 2, 0);
    assert_eq!(run_err(&b), "test:1: attempt to concatenate a table value");
}

#[test]
fn test_tostring_metamethod() {
    // return tostring(setmetatable({}, {__tostring = function() return "obj" end}))
    let mut handler = ProtoBuilder::new("").params(1);
    handler.load_str(1, "obj");
    handler.abc(OpCode::Return, 1, 2, 0);
    handler.abc(OpCode::Return, 0, 1, 0);

    let mut b = ProtoBuilder::new("=test");
    b.get_global(0, "tostring");
    object_with(&mut b, 1, vec![("__tostring", handler)]);
    b.abc(OpCode::Call, 0, 2, 2);
    b.abc(OpCode::Return, 0, 2, 0);

    let (vm, results) = run(&b);
    assert_str(&results, 0, "obj", &vm);
}

#[test]
fn test_protected_metatable() {
    // local t = setmetatable({}, {__metatable = "locked"})
    // return getmetatable(t), pcall(setmetatable, t, {})
    let mut b = ProtoBuilder::new("=test");
    let key = b.rk_str("__metatable");
    let locked = b.rk_str("locked");
    b.get_global(0, "setmetatable");
    b.abc(OpCode::NewTable, 1, 0, 0);
    b.abc(OpCode::NewTable, 2, 0, 1);
    b.abc(OpCode::SetTable, 2, key, locked);
    b.abc(OpCode::Call, 0, 3, 2);
    b.get_global(1, "getmetatable");
    b.abc(OpCode::Move, 2, 0, 0);
    b.abc(OpCode::Call, 1, 2, 2);
    b.get_global(2, "pcall");
    b.get_global(3, "setmetatable");
    b.abc(OpCode::Move, 4, 0, 0);
    b.abc(OpCode::NewTable, 5, 0, 0);
    b.abc(OpCode::Call, 2, 4, 0);
    b.abc(OpCode::Return, 1, 0, 0);

    let (vm, results) = run(&b);
    assert_eq!(results.len(), 3);
    assert_str(&results, 0, "locked", &vm);
    assert_bool(&results, 1, false);
    assert_str_contains(&results, 2, "cannot change a protected metatable", &vm);
}
