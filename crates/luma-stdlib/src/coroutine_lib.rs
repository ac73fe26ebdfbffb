//! Lua 5.1 coroutine library.
//!
//! Coroutines are thread values; `wrap` returns a native closure holding
//! its thread as upvalue 1.

use luma_core::value::TValue;
use luma_vm::error::LuaError;
use luma_vm::heap::{NativeFn, TValueExt};
use luma_vm::Vm;

pub fn open_coroutine(vm: &mut Vm) -> Result<(), LuaError> {
    let funcs: &[(&'static str, NativeFn)] = &[
        ("create", native_coroutine_create),
        ("resume", native_coroutine_resume),
        ("running", native_coroutine_running),
        ("status", native_coroutine_status),
        ("wrap", native_coroutine_wrap),
        ("yield", native_coroutine_yield),
    ];
    vm.register_lib("coroutine", funcs)?;
    Ok(())
}

/// Argument 1 as a Lua function, the only valid coroutine body.
fn check_lua_function(vm: &Vm) -> Result<TValue, LuaError> {
    let f = vm.value_at(1);
    if f.as_closure_idx().is_some() {
        Ok(f)
    } else {
        Err(vm.arg_error(1, "Lua function expected"))
    }
}

fn check_thread(vm: &Vm, narg: usize) -> Result<TValue, LuaError> {
    let co = vm.value_at(narg as i32);
    if co.as_thread_idx().is_some() {
        Ok(co)
    } else {
        Err(vm.arg_error(narg, "coroutine expected"))
    }
}

/// Arguments from `first` to the top of the window.
fn args_from(vm: &Vm, first: usize) -> Vec<TValue> {
    (first..=vm.get_top()).map(|i| vm.value_at(i as i32)).collect()
}

/// coroutine.create(f)
fn native_coroutine_create(vm: &mut Vm) -> Result<usize, LuaError> {
    let f = check_lua_function(vm)?;
    let co = vm.new_thread(f)?;
    vm.push_value(co);
    Ok(1)
}

/// coroutine.resume(co, ...): true plus the values passed out, or false
/// plus the error object.
fn native_coroutine_resume(vm: &mut Vm) -> Result<usize, LuaError> {
    let co = check_thread(vm, 1)?;
    let args = args_from(vm, 2);
    match vm.resume(co, &args) {
        Ok(values) => {
            vm.ensure_stack(vm.stack_top + values.len() + 1)?;
            vm.push_boolean(true);
            for &v in &values {
                vm.push_value(v);
            }
            Ok(values.len() + 1)
        }
        Err(e) => {
            vm.push_boolean(false);
            vm.push_value(e);
            Ok(2)
        }
    }
}

/// coroutine.yield(...)
fn native_coroutine_yield(vm: &mut Vm) -> Result<usize, LuaError> {
    let n = vm.get_top();
    vm.yield_values(n)
}

/// coroutine.status(co)
fn native_coroutine_status(vm: &mut Vm) -> Result<usize, LuaError> {
    let co = check_thread(vm, 1)?;
    let status = vm.thread_status(co).unwrap_or("dead");
    vm.push_string(status.as_bytes());
    Ok(1)
}

/// coroutine.running(): the running coroutine, or nil on the main thread.
fn native_coroutine_running(vm: &mut Vm) -> Result<usize, LuaError> {
    match vm.running_thread() {
        (_, true) => vm.push_nil(),
        (co, false) => vm.push_value(co),
    }
    Ok(1)
}

/// coroutine.wrap(f): a function that resumes a new coroutine and raises
/// its errors.
fn native_coroutine_wrap(vm: &mut Vm) -> Result<usize, LuaError> {
    let f = check_lua_function(vm)?;
    let co = vm.new_thread(f)?;
    vm.push_value(co);
    vm.push_native_closure(native_wrap_resume, 1)?;
    Ok(1)
}

fn native_wrap_resume(vm: &mut Vm) -> Result<usize, LuaError> {
    let co = vm.native_upvalue(1);
    let args = args_from(vm, 1);
    match vm.resume(co, &args) {
        Ok(values) => {
            vm.ensure_stack(vm.stack_top + values.len())?;
            for &v in &values {
                vm.push_value(v);
            }
            Ok(values.len())
        }
        Err(e) => match e.as_string_id() {
            Some(sid) => {
                let mut msg = vm.where_(1).into_bytes();
                msg.extend_from_slice(vm.strings.get_bytes(sid));
                Err(LuaError::Value(vm.intern(&msg)))
            }
            None => Err(LuaError::Value(e)),
        },
    }
}
