use super::helpers::*;
use luma_bytecode::builder::ProtoBuilder;
use luma_bytecode::opcode::OpCode;
use luma_core::value::TValue;
use luma_vm::{call_function, upvalue_index, LuaError, Vm, REGISTRY_INDEX};

fn add(vm: &mut Vm) -> Result<usize, LuaError> {
    let a = vm.check_number(1)?;
    let b = vm.check_number(2)?;
    vm.push_number(a + b);
    Ok(1)
}

/// `return <name>(<args>)` over numeric constants.
fn call_global(name: &str, args: &[f64]) -> ProtoBuilder {
    let mut b = ProtoBuilder::new("=test");
    b.get_global(0, name);
    for (i, &n) in args.iter().enumerate() {
        b.load_num(i as u32 + 1, n);
    }
    b.abc(OpCode::Call, 0, args.len() as u32 + 1, 0);
    b.abc(OpCode::Return, 0, 0, 0);
    b
}

#[test]
fn test_registered_native_called_from_lua() {
    let mut vm = new_vm();
    vm.register("add", add).unwrap();
    let results = run_in(&mut vm, &call_global("add", &[2.0, 3.0]));
    assert_eq!(results.len(), 1);
    assert_num(&results, 0, 5.0);
}

#[test]
fn test_native_argument_errors_name_the_function() {
    // return add("x", 1)
    let mut b = ProtoBuilder::new("=test");
    b.get_global(0, "add");
    b.load_str(1, "x");
    b.load_num(2, 1.0);
    b.abc(OpCode::Call, 0, 3, 0);
    b.abc(OpCode::Return, 0, 0, 0);

    let mut vm = new_vm();
    vm.register("add", add).unwrap();
    let f = load(&mut vm, &b);
    let err = vm.call_value(f, &[]).unwrap_err();
    assert_eq!(
        error_message(&mut vm, err),
        "test:1: bad argument #1 to 'add' (number expected, got string)"
    );
}

/// apply(f, x): calls back into Lua and returns the first result.
fn apply(vm: &mut Vm) -> Result<usize, LuaError> {
    let f = vm.check_function(1)?;
    let x = vm.value_at(2);
    let results = call_function(vm, f, &[x])?;
    vm.push_value(results.first().copied().unwrap_or_default());
    Ok(1)
}

#[test]
fn test_native_calls_back_into_lua() {
    // return apply(function(x) return x * 2 end, 21)
    let mut double = ProtoBuilder::new("").params(1);
    let two = double.rk_num(2.0);
    double.abc(OpCode::Mul, 1, 0, two);
    double.abc(OpCode::Return, 1, 2, 0);
    double.abc(OpCode::Return, 0, 1, 0);

    let mut b = ProtoBuilder::new("=test");
    b.get_global(0, "apply");
    let idx = b.child(double);
    b.abx(OpCode::Closure, 1, idx);
    b.load_num(2, 21.0);
    b.abc(OpCode::Call, 0, 3, 2);
    b.abc(OpCode::Return, 0, 2, 0);

    let mut vm = new_vm();
    vm.register("apply", apply).unwrap();
    let results = run_in(&mut vm, &b);
    assert_num(&results, 0, 42.0);
}

#[test]
fn test_error_inside_callback_propagates() {
    // return pcall(apply, error, "inner")
    let mut b = ProtoBuilder::new("=test");
    b.get_global(0, "pcall");
    b.get_global(1, "apply");
    b.get_global(2, "error");
    b.load_str(3, "inner");
    b.abc(OpCode::Call, 0, 4, 0);
    b.abc(OpCode::Return, 0, 0, 0);

    let mut vm = new_vm();
    vm.register("apply", apply).unwrap();
    let results = run_in(&mut vm, &b);
    assert_bool(&results, 0, false);
    assert_str(&results, 1, "inner", &vm);
    assert_eq!(vm.n_ccalls, 0);
}

struct Point {
    x: f64,
    y: f64,
}

/// __index for Point userdata: fields `x` and `y`.
fn point_index(vm: &mut Vm) -> Result<usize, LuaError> {
    let (x, y) = match vm.userdata_ref::<Point>(1) {
        Some(p) => (p.x, p.y),
        None => return Err(vm.type_error(1, "Point")),
    };
    let key = vm.check_str(2)?;
    let field = match vm.strings.get_bytes(key) {
        b"x" => Some(x),
        b"y" => Some(y),
        _ => None,
    };
    match field {
        Some(n) => vm.push_number(n),
        None => vm.push_nil(),
    }
    Ok(1)
}

#[test]
fn test_userdata_with_metatable() {
    let mut vm = new_vm();
    vm.new_userdata(Box::new(Point { x: 3.0, y: 4.0 })).unwrap();
    vm.new_table().unwrap();
    let index = vm.create_native("point_index", point_index).unwrap();
    vm.push_value(index);
    vm.set_field(-2, "__index").unwrap();
    vm.set_metatable(-2).unwrap();
    vm.set_global("p").unwrap();
    assert_eq!(vm.get_top(), 0);

    // return p.x + p.y, p.z, type(p)
    let mut b = ProtoBuilder::new("=test");
    b.get_global(0, "p");
    let x = b.rk_str("x");
    let y = b.rk_str("y");
    let z = b.rk_str("z");
    b.abc(OpCode::GetTable, 1, 0, x);
    b.abc(OpCode::GetTable, 2, 0, y);
    b.abc(OpCode::Add, 1, 1, 2);
    b.abc(OpCode::GetTable, 2, 0, z);
    b.get_global(3, "type");
    b.abc(OpCode::Move, 4, 0, 0);
    b.abc(OpCode::Call, 3, 2, 2);
    b.abc(OpCode::Return, 1, 4, 0);

    let results = run_in(&mut vm, &b);
    assert_num(&results, 0, 7.0);
    assert_nil(&results, 1);
    assert_str(&results, 2, "userdata", &vm);
}

#[test]
fn test_userdata_payload_is_mutable_from_host() {
    let mut vm = new_vm();
    vm.new_userdata(Box::new(Point { x: 0.0, y: 0.0 })).unwrap();
    if let Some(p) = vm.userdata_mut::<Point>(-1) {
        p.x = 5.0;
    }
    assert_eq!(vm.userdata_ref::<Point>(-1).map(|p| p.x), Some(5.0));
    assert!(vm.userdata_ref::<String>(-1).is_none());
}

/// Returns and increments its upvalue.
fn counter(vm: &mut Vm) -> Result<usize, LuaError> {
    let n = vm.native_upvalue(1).as_number().unwrap_or(0.0) + 1.0;
    vm.push_number(n);
    vm.push_index(-1);
    vm.replace(upvalue_index(1))?;
    Ok(1)
}

#[test]
fn test_native_closure_keeps_upvalues() {
    let mut vm = new_vm();
    vm.push_number(10.0);
    vm.push_native_closure(counter, 1).unwrap();
    let f = vm.value_at(-1);
    vm.pop(1);

    for expected in [11.0, 12.0, 13.0] {
        let results = vm.call_value(f, &[]).unwrap();
        assert_num(&results, 0, expected);
    }
}

#[test]
fn test_registry_is_private_storage() {
    let mut vm = new_vm();
    vm.push_string(b"secret");
    vm.set_field(REGISTRY_INDEX, "key").unwrap();
    vm.get_field(REGISTRY_INDEX, "key").unwrap();
    assert_eq!(vm.to_bytes(-1).as_deref(), Some(&b"secret"[..]));
    vm.pop(1);
    // Not visible as a global.
    assert!(global(&mut vm, "key").is_nil());
}

#[test]
fn test_stack_manipulation() {
    let mut vm = new_vm();
    vm.push_number(1.0);
    vm.push_number(2.0);
    vm.push_number(3.0);
    assert_eq!(vm.get_top(), 3);
    assert_eq!(vm.abs_index(-1), 3);

    // [1, 2, 3] -> [3, 1, 2]
    vm.insert(1);
    assert_eq!(vm.to_number(1), Some(3.0));
    assert_eq!(vm.to_number(-1), Some(2.0));

    // [3, 1, 2] -> [3, 2]
    vm.remove(2);
    assert_eq!(vm.get_top(), 2);
    assert_eq!(vm.to_number(2), Some(2.0));

    vm.set_top(4).unwrap();
    assert!(vm.is_none_or_nil(4));
    assert!(vm.is_none(5));
    vm.set_top(0).unwrap();
    assert_eq!(vm.get_top(), 0);
}

#[test]
fn test_host_table_access_runs_metamethods() {
    // t = setmetatable({}, {__index = function() return "dflt" end})
    let mut handler = ProtoBuilder::new("");
    handler.load_str(0, "dflt");
    handler.abc(OpCode::Return, 0, 2, 0);
    handler.abc(OpCode::Return, 0, 1, 0);

    let mut b = ProtoBuilder::new("=test");
    b.get_global(0, "setmetatable");
    b.abc(OpCode::NewTable, 1, 0, 0);
    b.abc(OpCode::NewTable, 2, 0, 1);
    let idx = b.child(handler);
    b.abx(OpCode::Closure, 3, idx);
    let index = b.rk_str("__index");
    b.abc(OpCode::SetTable, 2, index, 3);
    b.abc(OpCode::Call, 0, 3, 2);
    b.set_global(0, "t");
    b.abc(OpCode::Return, 0, 1, 0);

    let mut vm = new_vm();
    run_in(&mut vm, &b);
    vm.get_global("t").unwrap();
    vm.get_field(-1, "missing").unwrap();
    assert_eq!(vm.to_bytes(-1).as_deref(), Some(&b"dflt"[..]));
    vm.pop(1);
    vm.push_string(b"missing");
    vm.raw_get(-2).unwrap();
    assert!(vm.value_at(-1).is_nil());
    vm.pop(2);
}

#[test]
fn test_host_compare_and_concat() {
    let mut vm = new_vm();
    vm.push_number(1.0);
    vm.push_string(b"2");
    vm.push_number(3.0);
    vm.concat(3).unwrap();
    assert_eq!(vm.to_bytes(-1).as_deref(), Some(&b"123"[..]));

    vm.push_number(10.0);
    assert!(vm.less_than(-1, -2).unwrap_err().to_string().contains("compare"));
    vm.push_number(20.0);
    assert!(vm.less_than(-2, -1).unwrap());
    assert!(!vm.equal(-1, -2).unwrap());
    let v = vm.value_at(-1);
    assert!(v == TValue::from_number(20.0));
}
