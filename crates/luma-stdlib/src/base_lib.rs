//! Lua 5.1 base library.

use luma_core::object::LuaType;
use luma_core::value::TValue;
use luma_vm::coerce;
use luma_vm::error::{LuaError, Status};
use luma_vm::heap::{NativeFn, TValueExt};
use luma_vm::{Vm, GLOBALS_INDEX, MULTRET};
use std::io::Write;

/// Register the base functions, `_G` and `_VERSION` into the globals table.
pub fn open_base(vm: &mut Vm) -> Result<(), LuaError> {
    let funcs: &[(&'static str, NativeFn)] = &[
        ("assert", native_assert),
        ("collectgarbage", native_collectgarbage),
        ("error", native_error),
        ("getfenv", native_getfenv),
        ("getmetatable", native_getmetatable),
        ("next", native_next),
        ("pcall", native_pcall),
        ("print", native_print),
        ("rawequal", native_rawequal),
        ("rawget", native_rawget),
        ("rawset", native_rawset),
        ("select", native_select),
        ("setfenv", native_setfenv),
        ("setmetatable", native_setmetatable),
        ("tonumber", native_tonumber),
        ("tostring", native_tostring),
        ("type", native_type),
        ("unpack", native_unpack),
        ("xpcall", native_xpcall),
    ];
    for &(name, f) in funcs {
        vm.register(name, f)?;
    }

    // The iterator factories keep their step function as upvalue 1.
    let next = vm.create_native("next", native_next)?;
    register_with_upvalue(vm, "pairs", native_pairs, next)?;
    let ipairs_step = vm.create_native("ipairs", native_ipairs_aux)?;
    register_with_upvalue(vm, "ipairs", native_ipairs, ipairs_step)?;

    let globals = TValue::from_table(vm.globals);
    vm.push_value(globals);
    vm.set_global("_G")?;
    vm.push_string(b"Lua 5.1");
    vm.set_global("_VERSION")?;
    Ok(())
}

/// Store in global `name` a native holding `upvalue` as its upvalue 1.
pub(crate) fn register_with_upvalue(
    vm: &mut Vm,
    name: &'static str,
    f: NativeFn,
    upvalue: TValue,
) -> Result<(), LuaError> {
    vm.push_value(upvalue);
    vm.push_native_closure(f, 1)?;
    if let Some(nf) = vm.value_at(-1).as_native_idx() {
        vm.gc.native_mut(nf).name = name;
    }
    vm.set_global(name)
}

/// print(...): tostring of each argument, tab-separated, to the VM's output.
fn native_print(vm: &mut Vm) -> Result<usize, LuaError> {
    let n = vm.get_top();
    let mut line = Vec::new();
    for i in 1..=n {
        let v = vm.value_at(i as i32);
        let s = vm.tostring_value(v)?;
        let Some(sid) = s.as_string_id() else {
            return Err(vm.error("'tostring' must return a string to 'print'"));
        };
        if i > 1 {
            line.push(b'\t');
        }
        line.extend_from_slice(vm.strings.get_bytes(sid));
    }
    line.push(b'\n');
    let out = vm.output();
    out.write_all(&line)
        .and_then(|_| out.flush())
        .map_err(|e| LuaError::Runtime(format!("print: {e}")))?;
    Ok(0)
}

/// type(v)
fn native_type(vm: &mut Vm) -> Result<usize, LuaError> {
    let v = vm.check_any(1)?;
    vm.push_string(LuaType::of(v).name().as_bytes());
    Ok(1)
}

/// tostring(v): honors `__tostring`.
fn native_tostring(vm: &mut Vm) -> Result<usize, LuaError> {
    let v = vm.check_any(1)?;
    let s = vm.tostring_value(v)?;
    vm.push_value(s);
    Ok(1)
}

/// tonumber(v [, base])
fn native_tonumber(vm: &mut Vm) -> Result<usize, LuaError> {
    let base = vm.opt_integer(2, 10)?;
    if base == 10 {
        vm.check_any(1)?;
        match vm.to_number(1) {
            Some(n) => vm.push_number(n),
            None => vm.push_nil(),
        }
        return Ok(1);
    }
    let sid = vm.check_str(1)?;
    if !(2..=36).contains(&base) {
        return Err(vm.arg_error(2, "base out of range"));
    }
    match coerce::str_to_number_base(vm.strings.get_bytes(sid), base as u32) {
        Some(n) => vm.push_number(n),
        None => vm.push_nil(),
    }
    Ok(1)
}

/// error(v [, level]): string messages get the position of the function at
/// `level` (1 = the caller of `error`).
fn native_error(vm: &mut Vm) -> Result<usize, LuaError> {
    let level = vm.opt_integer(2, 1)?;
    let v = vm.value_at(1);
    if level > 0 && (v.is_string() || v.is_number()) {
        if let Some(sid) = vm.to_str(1) {
            let mut msg = vm.where_(level as usize).into_bytes();
            msg.extend_from_slice(vm.strings.get_bytes(sid));
            return Err(LuaError::Value(vm.intern(&msg)));
        }
    }
    Err(LuaError::Value(v))
}

/// assert(v [, message])
fn native_assert(vm: &mut Vm) -> Result<usize, LuaError> {
    let v = vm.check_any(1)?;
    if v.is_truthy() {
        return Ok(vm.get_top());
    }
    let msg = match vm.value_at(2).as_string_id() {
        Some(sid) => vm.strings.get_str_lossy(sid),
        None => "assertion failed!".to_string(),
    };
    Err(vm.error(&msg))
}

/// pcall(f, ...): true plus results, or false plus the error object.
fn native_pcall(vm: &mut Vm) -> Result<usize, LuaError> {
    vm.check_any(1)?;
    let nargs = vm.get_top() - 1;
    let status = vm.pcall(nargs, MULTRET, None);
    vm.push_boolean(status == Status::Ok);
    vm.insert(1);
    Ok(vm.get_top())
}

/// xpcall(f, handler): like pcall without arguments; the handler rewrites
/// the error object.
fn native_xpcall(vm: &mut Vm) -> Result<usize, LuaError> {
    let handler = vm.check_any(2)?;
    vm.set_top(1)?;
    let status = vm.pcall(0, MULTRET, Some(handler));
    vm.push_boolean(status == Status::Ok);
    vm.insert(1);
    Ok(vm.get_top())
}

/// select(n, ...) or select('#', ...)
fn native_select(vm: &mut Vm) -> Result<usize, LuaError> {
    let n = vm.get_top() as i64;
    let first = vm.value_at(1);
    if first.is_string() && vm.str_bytes(first).and_then(|b| b.first()) == Some(&b'#') {
        vm.push_number((n - 1) as f64);
        return Ok(1);
    }
    let mut i = vm.check_integer(1)?;
    if i < 0 {
        i += n;
    } else if i > n {
        i = n;
    }
    if i < 1 {
        return Err(vm.arg_error(1, "index out of range"));
    }
    Ok((n - i) as usize)
}

/// rawget(t, k)
fn native_rawget(vm: &mut Vm) -> Result<usize, LuaError> {
    vm.check_table(1)?;
    vm.check_any(2)?;
    vm.set_top(2)?;
    vm.raw_get(1)?;
    Ok(1)
}

/// rawset(t, k, v)
fn native_rawset(vm: &mut Vm) -> Result<usize, LuaError> {
    vm.check_table(1)?;
    vm.check_any(2)?;
    vm.check_any(3)?;
    vm.set_top(3)?;
    vm.raw_set(1).map_err(|e| vm.error(&e.to_string()))?;
    Ok(1)
}

/// rawequal(a, b)
fn native_rawequal(vm: &mut Vm) -> Result<usize, LuaError> {
    vm.check_any(1)?;
    vm.check_any(2)?;
    let eq = vm.raw_equal(1, 2);
    vm.push_boolean(eq);
    Ok(1)
}

/// Field `name` of the metatable of `v`, if any.
fn meta_field(vm: &mut Vm, v: TValue, name: &[u8]) -> Option<TValue> {
    let mt = vm.gc.metatable_of(v)?;
    let key = vm.strings.intern(name);
    let field = vm.gc.table(mt).raw_get_str(key);
    (!field.is_nil()).then_some(field)
}

/// setmetatable(t, mt): refuses to replace a metatable with a `__metatable` field.
fn native_setmetatable(vm: &mut Vm) -> Result<usize, LuaError> {
    let t = vm.check_table(1)?;
    let mt = vm.value_at(2);
    if !mt.is_nil() && !mt.is_table() {
        return Err(vm.type_error(2, "nil or table"));
    }
    if meta_field(vm, TValue::from_table(t), b"__metatable").is_some() {
        return Err(vm.error("cannot change a protected metatable"));
    }
    vm.set_top(2)?;
    vm.set_metatable(1)?;
    Ok(1)
}

/// getmetatable(v): the `__metatable` field stands in for a protected metatable.
fn native_getmetatable(vm: &mut Vm) -> Result<usize, LuaError> {
    let v = vm.check_any(1)?;
    if !vm.get_metatable(1) {
        vm.push_nil();
        return Ok(1);
    }
    if let Some(protected) = meta_field(vm, v, b"__metatable") {
        vm.push_value(protected);
    }
    Ok(1)
}

/// The function at call level `level` (1 = the caller of the running native).
fn function_at_level(vm: &Vm, level: usize) -> Option<TValue> {
    let n = vm.call_stack.len();
    let ci = vm.call_stack.get(n.checked_sub(1 + level)?)?;
    Some(vm.stack[ci.func])
}

/// The function argument of getfenv/setfenv: a function, or a level.
fn fenv_target(vm: &Vm, default_level: i64) -> Result<Option<TValue>, LuaError> {
    let v = vm.value_at(1);
    if v.is_function() {
        return Ok(Some(v));
    }
    let level = if vm.is_none_or_nil(1) {
        default_level
    } else {
        vm.check_integer(1)?
    };
    if level < 0 {
        return Err(vm.arg_error(1, "level must be non-negative"));
    }
    if level == 0 {
        return Ok(None);
    }
    function_at_level(vm, level as usize)
        .map(Some)
        .ok_or_else(|| vm.arg_error(1, "invalid level"))
}

/// getfenv([f]): environment of a function or call level; level 0 is the
/// global environment.
fn native_getfenv(vm: &mut Vm) -> Result<usize, LuaError> {
    match fenv_target(vm, 1)? {
        Some(f) => {
            let env = vm.env_of(f).unwrap_or(vm.globals);
            vm.push_value(TValue::from_table(env));
        }
        None => vm.push_index(GLOBALS_INDEX),
    }
    Ok(1)
}

/// setfenv(f, t): level 0 replaces the global environment.
fn native_setfenv(vm: &mut Vm) -> Result<usize, LuaError> {
    let env = vm.check_table(2)?;
    let Some(f) = fenv_target(vm, 1)? else {
        vm.globals = env;
        return Ok(0);
    };
    if f.as_native_idx().is_some() {
        return Err(vm.error("'setfenv' cannot change environment of given object"));
    }
    vm.set_top(0)?;
    vm.push_value(f);
    vm.push_value(TValue::from_table(env));
    if !vm.set_fenv(1)? {
        return Err(vm.error("'setfenv' cannot change environment of given object"));
    }
    Ok(1)
}

/// next(t [, k])
fn native_next(vm: &mut Vm) -> Result<usize, LuaError> {
    vm.check_table(1)?;
    vm.set_top(2)?;
    if vm.next(1)? {
        Ok(2)
    } else {
        vm.push_nil();
        Ok(1)
    }
}

/// pairs(t): next, t, nil
fn native_pairs(vm: &mut Vm) -> Result<usize, LuaError> {
    let t = vm.check_table(1)?;
    let next = vm.native_upvalue(1);
    vm.push_value(next);
    vm.push_value(TValue::from_table(t));
    vm.push_nil();
    Ok(3)
}

/// ipairs(t): step, t, 0
fn native_ipairs(vm: &mut Vm) -> Result<usize, LuaError> {
    let t = vm.check_table(1)?;
    let step = vm.native_upvalue(1);
    vm.push_value(step);
    vm.push_value(TValue::from_table(t));
    vm.push_number(0.0);
    Ok(3)
}

fn native_ipairs_aux(vm: &mut Vm) -> Result<usize, LuaError> {
    let t = vm.check_table(1)?;
    let i = vm.check_integer(2)? + 1;
    let v = vm.gc.table(t).raw_get_int(i);
    if v.is_nil() {
        return Ok(0);
    }
    vm.push_number(i as f64);
    vm.push_value(v);
    Ok(2)
}

/// unpack(t [, i [, j]])
fn native_unpack(vm: &mut Vm) -> Result<usize, LuaError> {
    let t = vm.check_table(1)?;
    let i = vm.opt_integer(2, 1)?;
    let j = if vm.is_none_or_nil(3) {
        vm.obj_len(1) as i64
    } else {
        vm.check_integer(3)?
    };
    if i > j {
        return Ok(0);
    }
    let n = j
        .checked_sub(i)
        .and_then(|d| usize::try_from(d).ok())
        .and_then(|d| d.checked_add(1));
    let n = match n {
        Some(n) if n < vm.config.max_stack_slots => n,
        _ => return Err(vm.error("too many results to unpack")),
    };
    vm.ensure_stack(vm.stack_top + n)
        .map_err(|_| vm.error("too many results to unpack"))?;
    for k in i..=j {
        let v = vm.gc.table(t).raw_get_int(k);
        vm.push_value(v);
    }
    Ok(n)
}

/// collectgarbage([opt [, arg]]): "count" reports live objects; "collect"
/// and "step" run a collection once the outermost call returns.
fn native_collectgarbage(vm: &mut Vm) -> Result<usize, LuaError> {
    let opt = if vm.is_none_or_nil(1) {
        b"collect".to_vec()
    } else {
        let sid = vm.check_str(1)?;
        vm.strings.get_bytes(sid).to_vec()
    };
    match &opt[..] {
        b"collect" => {
            vm.request_collection();
            vm.push_number(0.0);
        }
        b"step" => {
            vm.request_collection();
            vm.push_boolean(true);
        }
        b"count" => {
            let live = vm.live_objects();
            vm.push_number(live as f64);
        }
        b"stop" | b"restart" | b"setpause" | b"setstepmul" => vm.push_number(0.0),
        other => {
            let msg = format!("invalid option '{}'", String::from_utf8_lossy(other));
            return Err(vm.arg_error(1, &msg));
        }
    }
    Ok(1)
}
