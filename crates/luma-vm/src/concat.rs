//! String concatenation with `__concat` fallback.

use crate::coerce;
use crate::error::LuaError;
use crate::metamethod::get_metamethod;
use crate::vm::Vm;
use luma_core::object::lua_type_name;
use luma_core::value::TValue;

#[inline]
fn is_concatable(v: TValue) -> bool {
    v.is_string() || v.is_number()
}

/// Concatenate the `total` values starting at stack slot `first`, leaving
/// the result in `first`. Runs of strings and numbers are joined in one
/// pass; other operands go through `__concat`, right to left.
pub(crate) fn concat(vm: &mut Vm, first: usize, total: usize) -> Result<(), LuaError> {
    let mut total = total;
    let mut top = first + total;
    while total > 1 {
        let a = vm.stack[top - 2];
        let b = vm.stack[top - 1];
        let consumed = if !is_concatable(a) || !is_concatable(b) {
            let event = vm.mm_names.concat;
            let tm = get_metamethod(a, event, &vm.gc).or_else(|| get_metamethod(b, event, &vm.gc));
            match tm {
                Some(tm) => {
                    vm.stack[top - 2] = vm.call_tm_res(tm, a, b)?;
                }
                None => {
                    let culprit = if is_concatable(a) { b } else { a };
                    return Err(vm.runtime_error(&format!(
                        "attempt to concatenate a {} value",
                        lua_type_name(culprit)
                    )));
                }
            }
            2
        } else {
            let mut n = 2;
            while n < total && is_concatable(vm.stack[top - n - 1]) {
                n += 1;
            }
            let mut buf = Vec::new();
            for i in top - n..top {
                let v = vm.stack[i];
                if let Some(sid) = v.as_string_id() {
                    buf.extend_from_slice(vm.strings.get_bytes(sid));
                } else if let Some(f) = v.as_number() {
                    buf.extend_from_slice(coerce::number_to_str(f).as_bytes());
                }
            }
            vm.stack[top - n] = vm.intern(&buf);
            n
        };
        total -= consumed - 1;
        top -= consumed - 1;
    }
    Ok(())
}
