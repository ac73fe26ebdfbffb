use super::helpers::*;
use luma_bytecode::builder::ProtoBuilder;
use luma_bytecode::opcode::OpCode;
use luma_core::value::TValue;
use luma_vm::Vm;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

/// Call the global function `name` from the host.
fn call(vm: &mut Vm, name: &str, args: &[TValue]) -> Vec<TValue> {
    let f = global(vm, name);
    vm.call_value(f, args)
        .unwrap_or_else(|e| panic!("{name} failed: {}", error_message(vm, e)))
}

fn call_err(vm: &mut Vm, name: &str, args: &[TValue]) -> String {
    let f = global(vm, name);
    match vm.call_value(f, args) {
        Err(e) => error_message(vm, e),
        Ok(_) => panic!("{name} should have failed"),
    }
}

fn num(n: f64) -> TValue {
    TValue::from_number(n)
}

/// A host-built array table `{1, 2, ..., n}`.
fn array(vm: &mut Vm, n: i64) -> TValue {
    let t = vm.new_table().unwrap();
    for i in 1..=n {
        vm.push_number(i as f64);
        vm.raw_set_int(-2, i).unwrap();
    }
    vm.pop(1);
    t
}

#[test]
fn test_type_names() {
    let mut vm = new_vm();
    let t = array(&mut vm, 0);
    let print = global(&mut vm, "print");
    let s = vm.intern(b"s");
    let cases = [
        (TValue::nil(), "nil"),
        (TValue::from(true), "boolean"),
        (num(1.0), "number"),
        (s, "string"),
        (t, "table"),
        (print, "function"),
    ];
    for (v, expected) in cases {
        let results = call(&mut vm, "type", &[v]);
        assert_str(&results, 0, expected, &vm);
    }
    assert_eq!(
        call_err(&mut vm, "type", &[]),
        "bad argument #1 to 'type' (value expected)"
    );
}

#[test]
fn test_tostring() {
    let mut vm = new_vm();
    for (v, expected) in [
        (TValue::nil(), "nil"),
        (TValue::from(false), "false"),
        (num(12.0), "12"),
        (num(1.5), "1.5"),
        (num(-0.25), "-0.25"),
    ] {
        let results = call(&mut vm, "tostring", &[v]);
        assert_str(&results, 0, expected, &vm);
    }
    let t = array(&mut vm, 0);
    let results = call(&mut vm, "tostring", &[t]);
    assert_str_contains(&results, 0, "table: 0x", &vm);
}

#[test]
fn test_tonumber() {
    let mut vm = new_vm();
    let cases: [(&[u8], Option<f64>, Option<f64>); 6] = [
        (b"0x1F", None, Some(31.0)),
        (b"  12.5  ", None, Some(12.5)),
        (b"abc", None, None),
        (b"z", Some(36.0), Some(35.0)),
        (b"ff", Some(16.0), Some(255.0)),
        (b"8", Some(2.0), None),
    ];
    for (text, base, expected) in cases {
        let s = vm.intern(text);
        let mut args = vec![s];
        args.extend(base.map(num));
        let results = call(&mut vm, "tonumber", &args);
        assert_eq!(results[0].as_number(), expected, "tonumber({text:?})");
    }
    assert!(call(&mut vm, "tonumber", &[TValue::nil()])[0].is_nil());

    let s = vm.intern(b"10");
    assert_eq!(
        call_err(&mut vm, "tonumber", &[s, num(99.0)]),
        "bad argument #2 to 'tonumber' (base out of range)"
    );
}

#[test]
fn test_select() {
    let mut vm = new_vm();
    let (a, b, c) = (vm.intern(b"a"), vm.intern(b"b"), vm.intern(b"c"));

    let results = call(&mut vm, "select", &[num(2.0), a, b, c]);
    assert_eq!(results.len(), 2);
    assert_str(&results, 0, "b", &vm);
    assert_str(&results, 1, "c", &vm);

    let results = call(&mut vm, "select", &[num(-1.0), a, b, c]);
    assert_eq!(results.len(), 1);
    assert_str(&results, 0, "c", &vm);

    let hash = vm.intern(b"#");
    let results = call(&mut vm, "select", &[hash, a, TValue::nil()]);
    assert_num(&results, 0, 2.0);

    assert!(call_err(&mut vm, "select", &[num(-5.0), a]).contains("index out of range"));
}

#[test]
fn test_unpack() {
    let mut vm = new_vm();
    let t = array(&mut vm, 3);
    let results = call(&mut vm, "unpack", &[t]);
    assert_eq!(results.len(), 3);
    assert_num(&results, 2, 3.0);

    let results = call(&mut vm, "unpack", &[t, num(2.0)]);
    assert_eq!(results.len(), 2);
    assert_num(&results, 0, 2.0);

    let results = call(&mut vm, "unpack", &[t, num(2.0), num(5.0)]);
    assert_eq!(results.len(), 4);
    assert_nil(&results, 3);

    assert!(call(&mut vm, "unpack", &[t, num(3.0), num(1.0)]).is_empty());
}

#[test]
fn test_raw_access_bypasses_metamethods() {
    // t = setmetatable({}, {__newindex = function() error("blocked") end})
    // rawset(t, "k", 1); return rawget(t, "k"), rawequal(t, t)
    let mut blocker = ProtoBuilder::new("");
    blocker.get_global(0, "error");
    blocker.load_str(1, "blocked");
    blocker.abc(OpCode::Call, 0, 2, 1);
    blocker.abc(OpCode::Return, 0, 1, 0);

    let mut b = ProtoBuilder::new("=test");
    b.get_global(0, "setmetatable");
    b.abc(OpCode::NewTable, 1, 0, 0);
    b.abc(OpCode::NewTable, 2, 0, 1);
    let idx = b.child(blocker);
    b.abx(OpCode::Closure, 3, idx);
    let newindex = b.rk_str("__newindex");
    b.abc(OpCode::SetTable, 2, newindex, 3);
    b.abc(OpCode::Call, 0, 3, 2);
    b.get_global(1, "rawset");
    b.abc(OpCode::Move, 2, 0, 0);
    b.load_str(3, "k");
    b.load_num(4, 1.0);
    b.abc(OpCode::Call, 1, 4, 1);
    b.get_global(1, "rawget");
    b.abc(OpCode::Move, 2, 0, 0);
    b.load_str(3, "k");
    b.abc(OpCode::Call, 1, 3, 2);
    b.get_global(2, "rawequal");
    b.abc(OpCode::Move, 3, 0, 0);
    b.abc(OpCode::Move, 4, 0, 0);
    b.abc(OpCode::Call, 2, 3, 2);
    b.abc(OpCode::Return, 1, 3, 0);

    let (_vm, results) = run(&b);
    assert_num(&results, 0, 1.0);
    assert_bool(&results, 1, true);
}

#[test]
fn test_next_walks_every_entry() {
    let mut vm = new_vm();
    let empty = array(&mut vm, 0);
    assert!(call(&mut vm, "next", &[empty])[0].is_nil());

    let t = array(&mut vm, 4);
    let mut key = TValue::nil();
    let mut sum = 0.0;
    loop {
        let results = call(&mut vm, "next", &[t, key]);
        if results[0].is_nil() {
            break;
        }
        key = results[0];
        sum += results[1].as_number().unwrap();
    }
    assert_eq!(sum, 10.0);
}

#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_print_writes_to_configured_output() {
    let buf = SharedBuf::default();
    let mut vm = new_vm();
    vm.set_output(Box::new(buf.clone()));
    let s = vm.intern(b"a");
    call(&mut vm, "print", &[num(1.0), s, TValue::nil(), TValue::from(true)]);
    call(&mut vm, "print", &[]);
    assert_eq!(&*buf.0.borrow(), b"1\ta\tnil\ttrue\n\n");
}

#[test]
fn test_setfenv_changes_global_lookup() {
    // local f = function() return x end; setfenv(f, {x = 5}); return f(), x
    let mut getx = ProtoBuilder::new("");
    getx.get_global(0, "x");
    getx.abc(OpCode::Return, 0, 2, 0);
    getx.abc(OpCode::Return, 0, 1, 0);

    let mut b = ProtoBuilder::new("=test");
    let idx = b.child(getx);
    b.abx(OpCode::Closure, 0, idx);
    b.get_global(1, "setfenv");
    b.abc(OpCode::Move, 2, 0, 0);
    b.abc(OpCode::NewTable, 3, 0, 1);
    let x = b.rk_str("x");
    let five = b.rk_num(5.0);
    b.abc(OpCode::SetTable, 3, x, five);
    b.abc(OpCode::Call, 1, 3, 1);
    b.abc(OpCode::Move, 1, 0, 0);
    b.abc(OpCode::Call, 1, 1, 2);
    b.get_global(2, "x");
    b.abc(OpCode::Return, 1, 3, 0);

    let (_vm, results) = run(&b);
    assert_num(&results, 0, 5.0);
    assert_nil(&results, 1);
}

#[test]
fn test_getfenv_defaults_to_globals() {
    let mut vm = new_vm();
    let results = call(&mut vm, "getfenv", &[num(0.0)]);
    assert!(results[0] == TValue::from_table(vm.globals));

    let print = global(&mut vm, "print");
    let env = vm.new_table().unwrap();
    vm.pop(1);
    assert_eq!(
        call_err(&mut vm, "setfenv", &[print, env]),
        "'setfenv' cannot change environment of given object"
    );
}

#[test]
fn test_version_and_global_table() {
    let mut vm = new_vm();
    let v = global(&mut vm, "_VERSION");
    assert_eq!(vm.str_bytes(v), Some(&b"Lua 5.1"[..]));
    let g = global(&mut vm, "_G");
    assert!(g == TValue::from_table(vm.globals));
}

#[test]
fn test_getmetatable_honors_protection() {
    let mut vm = new_vm();
    let t = array(&mut vm, 0);
    let mt = array(&mut vm, 0);
    let hidden = vm.intern(b"hidden");
    let key = vm.intern(b"__metatable");
    vm.gc.table_mut(mt.as_table_idx().unwrap()).raw_set(key, hidden).unwrap();
    call(&mut vm, "setmetatable", &[t, mt]);

    let results = call(&mut vm, "getmetatable", &[t]);
    assert_str(&results, 0, "hidden", &vm);
    assert!(call(&mut vm, "getmetatable", &[num(1.0)])[0].is_nil());
    assert_eq!(
        call_err(&mut vm, "setmetatable", &[t, TValue::nil()]),
        "cannot change a protected metatable"
    );
}
