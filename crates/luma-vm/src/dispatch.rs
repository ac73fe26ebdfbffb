//! Main bytecode dispatch loop.

use crate::arith::{self, ArithOp, ArithResult};
use crate::call::PreCall;
use crate::callinfo::MULTRET;
use crate::coerce;
use crate::compare::{self, CompareResult};
use crate::concat;
use crate::error::LuaError;
use crate::heap::{LuaClosure, TValueExt};
use crate::hook;
use crate::metamethod::{fast_tm, get_comp_tm, get_metamethod};
use crate::vm::Vm;
use luma_bytecode::opcode::{fb2int, index_k, is_k, OpCode, LFIELDS_PER_FLUSH};
use luma_core::object::{lua_type_name, LuaType};
use luma_core::string::StringId;
use luma_core::table::TableKey;
use luma_core::value::TValue;
use std::rc::Rc;

/// Limit for `__index`/`__newindex` chains, to catch loops.
const MAXTAGLOOP: usize = 100;

/// Run Lua frames until the frame at depth `base_depth` returns.
///
/// The frame at `base_depth` must already be pushed (by `precall`). Frames
/// entered by CALL run in this same loop; returning below `base_depth`
/// hands control back to the caller.
pub fn execute(vm: &mut Vm, base_depth: usize) -> Result<(), LuaError> {
    'frames: loop {
        let ci_idx = vm.call_stack.len() - 1;
        let func = vm.call_stack[ci_idx].func;
        let base = vm.call_stack[ci_idx].base;
        let cl_idx = vm.stack[func]
            .as_closure_idx()
            .expect("Lua frame without a Lua closure");
        let proto = Rc::clone(&vm.gc.closure(cl_idx).proto);
        let k = &proto.constants;

        // Operand that names a register or, with the RK bit, a constant.
        macro_rules! rk {
            ($x:expr) => {{
                let x = $x;
                if is_k(x) {
                    k[index_k(x)].to_value()
                } else {
                    vm.stack[base + x as usize]
                }
            }};
        }

        // Take the JMP that follows a test instruction, or skip it.
        macro_rules! cond_jump {
            ($taken:expr) => {{
                let pc = vm.call_stack[ci_idx].pc;
                vm.call_stack[ci_idx].pc = if $taken {
                    (pc as i64 + 1 + proto.code[pc].sbx() as i64) as usize
                } else {
                    pc + 1
                };
            }};
        }

        loop {
            if vm.hook.is_some() {
                hook::count_tick(vm)?;
            }

            let pc = vm.call_stack[ci_idx].pc;
            let inst = proto.code[pc];
            vm.call_stack[ci_idx].pc = pc + 1;
            let a = inst.a() as usize;
            let ra = base + a;

            match inst.opcode() {
                OpCode::Move => {
                    vm.stack[ra] = vm.stack[base + inst.b() as usize];
                }

                OpCode::LoadK => {
                    vm.stack[ra] = k[inst.bx() as usize].to_value();
                }

                OpCode::LoadBool => {
                    vm.stack[ra] = TValue::from_bool(inst.b() != 0);
                    if inst.c() != 0 {
                        vm.call_stack[ci_idx].pc += 1;
                    }
                }

                OpCode::LoadNil => {
                    for slot in &mut vm.stack[ra..=base + inst.b() as usize] {
                        *slot = TValue::nil();
                    }
                }

                OpCode::GetUpval => {
                    let uv = vm.gc.closure(cl_idx).upvalues[inst.b() as usize];
                    vm.stack[ra] = vm.upval_get(uv);
                }

                OpCode::GetGlobal => {
                    let env = TValue::from_table(vm.gc.closure(cl_idx).env);
                    let key = k[inst.bx() as usize].to_value();
                    vm.stack[ra] = index_value(vm, env, key)?;
                }

                OpCode::GetTable => {
                    let t = vm.stack[base + inst.b() as usize];
                    let key = rk!(inst.c());
                    vm.stack[ra] = index_value(vm, t, key)?;
                }

                OpCode::SetGlobal => {
                    let env = TValue::from_table(vm.gc.closure(cl_idx).env);
                    let key = k[inst.bx() as usize].to_value();
                    let val = vm.stack[ra];
                    set_index(vm, env, key, val)?;
                }

                OpCode::SetUpval => {
                    let uv = vm.gc.closure(cl_idx).upvalues[inst.b() as usize];
                    let val = vm.stack[ra];
                    vm.upval_set(uv, val);
                }

                OpCode::SetTable => {
                    let key = rk!(inst.b());
                    let val = rk!(inst.c());
                    let t = vm.stack[ra];
                    set_index(vm, t, key, val)?;
                }

                OpCode::NewTable => {
                    let t = vm
                        .gc
                        .alloc_table(fb2int(inst.b()), fb2int(inst.c()))?;
                    vm.stack[ra] = TValue::from_table(t);
                }

                OpCode::Self_ => {
                    let obj = vm.stack[base + inst.b() as usize];
                    let key = rk!(inst.c());
                    vm.stack[ra + 1] = obj;
                    vm.stack[ra] = index_value(vm, obj, key)?;
                }

                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Pow => {
                    let rb = rk!(inst.b());
                    let rc = rk!(inst.c());
                    let op = match inst.opcode() {
                        OpCode::Add => ArithOp::Add,
                        OpCode::Sub => ArithOp::Sub,
                        OpCode::Mul => ArithOp::Mul,
                        OpCode::Div => ArithOp::Div,
                        OpCode::Mod => ArithOp::Mod,
                        _ => ArithOp::Pow,
                    };
                    vm.stack[ra] = match (rb.as_number(), rc.as_number()) {
                        (Some(x), Some(y)) => TValue::from_number(arith::num_arith(op, x, y)),
                        _ => arith_value(vm, op, rb, rc)?,
                    };
                }

                OpCode::Unm => {
                    let rb = vm.stack[base + inst.b() as usize];
                    vm.stack[ra] = match rb.as_number() {
                        Some(x) => TValue::from_number(-x),
                        None => arith_value(vm, ArithOp::Unm, rb, rb)?,
                    };
                }

                OpCode::Not => {
                    let rb = vm.stack[base + inst.b() as usize];
                    vm.stack[ra] = TValue::from_bool(rb.is_falsy());
                }

                OpCode::Len => {
                    let rb = vm.stack[base + inst.b() as usize];
                    vm.stack[ra] = length_value(vm, rb)?;
                }

                OpCode::Concat => {
                    let b = inst.b() as usize;
                    let c = inst.c() as usize;
                    concat::concat(vm, base + b, c - b + 1)?;
                    vm.stack[ra] = vm.stack[base + b];
                }

                OpCode::Jmp => {
                    let pc = vm.call_stack[ci_idx].pc;
                    vm.call_stack[ci_idx].pc = (pc as i64 + inst.sbx() as i64) as usize;
                }

                OpCode::Eq => {
                    let rb = rk!(inst.b());
                    let rc = rk!(inst.c());
                    let res = values_equal(vm, rb, rc)?;
                    cond_jump!(res == (a != 0));
                }

                OpCode::Lt => {
                    let rb = rk!(inst.b());
                    let rc = rk!(inst.c());
                    let res = less_than(vm, rb, rc)?;
                    cond_jump!(res == (a != 0));
                }

                OpCode::Le => {
                    let rb = rk!(inst.b());
                    let rc = rk!(inst.c());
                    let res = less_equal(vm, rb, rc)?;
                    cond_jump!(res == (a != 0));
                }

                OpCode::Test => {
                    let truthy = vm.stack[ra].is_truthy();
                    cond_jump!(truthy == (inst.c() != 0));
                }

                OpCode::TestSet => {
                    let rb = vm.stack[base + inst.b() as usize];
                    let taken = rb.is_truthy() == (inst.c() != 0);
                    if taken {
                        vm.stack[ra] = rb;
                    }
                    cond_jump!(taken);
                }

                OpCode::Call => {
                    let b = inst.b() as usize;
                    let nresults = inst.c() as i32 - 1;
                    if b != 0 {
                        vm.stack_top = ra + b;
                    }
                    match vm.precall(ra, nresults)? {
                        PreCall::Lua => continue 'frames,
                        PreCall::Native => {
                            if nresults >= 0 {
                                vm.stack_top = vm.call_stack[ci_idx].top;
                            }
                        }
                    }
                }

                OpCode::TailCall => {
                    let b = inst.b() as usize;
                    if b != 0 {
                        vm.stack_top = ra + b;
                    }
                    match vm.precall_tail(ra)? {
                        PreCall::Lua => {
                            // Slide the callee's frame down over this one.
                            let callee = vm
                                .call_stack
                                .pop()
                                .expect("precall pushed a Lua frame");
                            vm.close_upvalues(base);
                            let delta = callee.func - func;
                            vm.stack.copy_within(callee.func..vm.stack_top, func);
                            let ci = &mut vm.call_stack[ci_idx];
                            ci.base = callee.base - delta;
                            ci.top = callee.top - delta;
                            ci.pc = 0;
                            ci.tail_count += 1;
                            vm.stack_top = ci.top;
                            continue 'frames;
                        }
                        PreCall::Native => {
                            // The native already ran; return its results.
                            vm.close_upvalues(base);
                            let wanted = vm.poscall(ra);
                            if vm.call_stack.len() == base_depth {
                                return Ok(());
                            }
                            if wanted != MULTRET {
                                vm.stack_top = vm.call_stack[ci_idx - 1].top;
                            }
                            continue 'frames;
                        }
                    }
                }

                OpCode::Return => {
                    let b = inst.b() as usize;
                    if b != 0 {
                        vm.stack_top = ra + b - 1;
                    }
                    vm.close_upvalues(base);
                    let wanted = vm.poscall(ra);
                    if vm.call_stack.len() == base_depth {
                        return Ok(());
                    }
                    if wanted != MULTRET {
                        vm.stack_top = vm.call_stack[ci_idx - 1].top;
                    }
                    continue 'frames;
                }

                OpCode::ForLoop => {
                    let step = vm.stack[ra + 2].as_number().unwrap_or(f64::NAN);
                    let idx = vm.stack[ra].as_number().unwrap_or(f64::NAN) + step;
                    let limit = vm.stack[ra + 1].as_number().unwrap_or(f64::NAN);
                    let go_on = if 0.0 < step { idx <= limit } else { limit <= idx };
                    if go_on {
                        let pc = vm.call_stack[ci_idx].pc;
                        vm.call_stack[ci_idx].pc = (pc as i64 + inst.sbx() as i64) as usize;
                        vm.stack[ra] = TValue::from_number(idx);
                        vm.stack[ra + 3] = TValue::from_number(idx);
                    }
                }

                OpCode::ForPrep => {
                    let init = for_number(vm, ra, "'for' initial value must be a number")?;
                    let limit = for_number(vm, ra + 1, "'for' limit must be a number")?;
                    let step = for_number(vm, ra + 2, "'for' step must be a number")?;
                    vm.stack[ra] = TValue::from_number(init - step);
                    vm.stack[ra + 1] = TValue::from_number(limit);
                    vm.stack[ra + 2] = TValue::from_number(step);
                    let pc = vm.call_stack[ci_idx].pc;
                    vm.call_stack[ci_idx].pc = (pc as i64 + inst.sbx() as i64) as usize;
                }

                OpCode::TForLoop => {
                    let cb = ra + 3;
                    vm.stack[cb + 2] = vm.stack[ra + 2];
                    vm.stack[cb + 1] = vm.stack[ra + 1];
                    vm.stack[cb] = vm.stack[ra];
                    vm.stack_top = cb + 3;
                    vm.call_at(cb, inst.c() as i32)?;
                    vm.stack_top = vm.call_stack[ci_idx].top;
                    let first = vm.stack[cb];
                    if !first.is_nil() {
                        vm.stack[cb - 1] = first;
                    }
                    cond_jump!(!first.is_nil());
                }

                OpCode::SetList => {
                    let b = inst.b() as usize;
                    let n = if b == 0 { vm.stack_top - ra - 1 } else { b };
                    let mut c = inst.c() as usize;
                    if c == 0 {
                        let pc = vm.call_stack[ci_idx].pc;
                        c = proto.code[pc].0 as usize;
                        vm.call_stack[ci_idx].pc = pc + 1;
                    }
                    let Some(t) = vm.stack[ra].as_table_idx() else {
                        return Err(vm.runtime_error("SETLIST target is not a table"));
                    };
                    let offset = (c - 1) * LFIELDS_PER_FLUSH as usize;
                    for i in 1..=n {
                        let v = vm.stack[ra + i];
                        vm.gc.table_mut(t).raw_set_int((offset + i) as i64, v);
                    }
                    if b == 0 {
                        vm.stack_top = vm.call_stack[ci_idx].top;
                    }
                }

                OpCode::Close => {
                    vm.close_upvalues(ra);
                }

                OpCode::Closure => {
                    let child = Rc::clone(&proto.protos[inst.bx() as usize]);
                    let nups = child.num_upvalues as usize;
                    let pc = vm.call_stack[ci_idx].pc;
                    let mut upvalues = Vec::with_capacity(nups);
                    for pseudo in &proto.code[pc..pc + nups] {
                        let uv = if pseudo.opcode() == OpCode::GetUpval {
                            vm.gc.closure(cl_idx).upvalues[pseudo.b() as usize]
                        } else {
                            vm.find_upvalue(base + pseudo.b() as usize)?
                        };
                        upvalues.push(uv);
                    }
                    vm.call_stack[ci_idx].pc = pc + nups;
                    let env = vm.gc.closure(cl_idx).env;
                    let ncl = vm.gc.alloc_closure(LuaClosure {
                        proto: child,
                        upvalues,
                        env,
                    })?;
                    vm.stack[ra] = TValue::from_closure(ncl);
                }

                OpCode::VarArg => {
                    let np = proto.num_params as usize;
                    let nvar = (base - func - 1).saturating_sub(np);
                    let b = inst.b() as usize;
                    let wanted = if b == 0 {
                        vm.ensure_stack(ra + nvar)?;
                        vm.stack_top = ra + nvar;
                        nvar
                    } else {
                        b - 1
                    };
                    for j in 0..wanted {
                        vm.stack[ra + j] = if j < nvar {
                            vm.stack[base - nvar + j]
                        } else {
                            TValue::nil()
                        };
                    }
                }
            }
        }
    }
}

/// Convert a numeric for-loop control value in place.
fn for_number(vm: &Vm, slot: usize, msg: &str) -> Result<f64, LuaError> {
    coerce::to_number(vm.stack[slot], &vm.strings).ok_or_else(|| vm.runtime_error(msg))
}

fn type_error(vm: &Vm, v: TValue, op: &str) -> LuaError {
    vm.runtime_error(&format!("attempt to {} a {} value", op, lua_type_name(v)))
}

/// `t[key]` with `__index` fallback.
pub(crate) fn index_value(vm: &mut Vm, mut t: TValue, key: TValue) -> Result<TValue, LuaError> {
    for _ in 0..MAXTAGLOOP {
        let tm = if let Some(h) = t.as_table_idx() {
            let table = vm.gc.table(h);
            let v = table.raw_get(key);
            if !v.is_nil() {
                return Ok(v);
            }
            match fast_tm(table.metatable, vm.mm_names.index, &vm.gc) {
                Some(tm) => tm,
                None => return Ok(TValue::nil()),
            }
        } else {
            match get_metamethod(t, vm.mm_names.index, &vm.gc) {
                Some(tm) => tm,
                None => return Err(type_error(vm, t, "index")),
            }
        };
        if tm.is_function() {
            return vm.call_tm_res(tm, t, key);
        }
        t = tm;
    }
    Err(vm.runtime_error("loop in gettable"))
}

/// `t[key] = val` with `__newindex` fallback.
pub(crate) fn set_index(vm: &mut Vm, mut t: TValue, key: TValue, val: TValue) -> Result<(), LuaError> {
    for _ in 0..MAXTAGLOOP {
        let tm = if let Some(h) = t.as_table_idx() {
            let table = vm.gc.table(h);
            let tm = if table.raw_get(key).is_nil() {
                fast_tm(table.metatable, vm.mm_names.newindex, &vm.gc)
            } else {
                None
            };
            if let Err(e) = TableKey::from_value(key) {
                return Err(vm.runtime_error(&e.to_string()));
            }
            match tm {
                Some(tm) => tm,
                None => {
                    if let Err(e) = vm.gc.table_mut(h).raw_set(key, val) {
                        return Err(vm.runtime_error(&e.to_string()));
                    }
                    return Ok(());
                }
            }
        } else {
            match get_metamethod(t, vm.mm_names.newindex, &vm.gc) {
                Some(tm) => tm,
                None => return Err(type_error(vm, t, "index")),
            }
        };
        if tm.is_function() {
            return vm.call_tm_void(tm, t, key, val);
        }
        t = tm;
    }
    Err(vm.runtime_error("loop in settable"))
}

/// Arithmetic on non-number operands: string coercion, then the event's
/// handler on either operand.
pub(crate) fn arith_value(vm: &mut Vm, op: ArithOp, a: TValue, b: TValue) -> Result<TValue, LuaError> {
    if let ArithResult::Ok(v) = arith::arith_op(op, a, b, &vm.strings) {
        return Ok(v);
    }
    let event = op.event(&vm.mm_names);
    let tm = get_metamethod(a, event, &vm.gc).or_else(|| get_metamethod(b, event, &vm.gc));
    match tm {
        Some(tm) => vm.call_tm_res(tm, a, b),
        None => {
            let culprit = if coerce::to_number(a, &vm.strings).is_some() { b } else { a };
            Err(type_error(vm, culprit, "perform arithmetic on"))
        }
    }
}

/// The `#` operator.
pub(crate) fn length_value(vm: &mut Vm, v: TValue) -> Result<TValue, LuaError> {
    if let Some(sid) = v.as_string_id() {
        return Ok(TValue::from_number(vm.strings.get(sid).len() as f64));
    }
    if let Some(h) = v.as_table_idx() {
        return Ok(TValue::from_number(vm.gc.table(h).length() as f64));
    }
    let tm = get_metamethod(v, vm.mm_names.len, &vm.gc)
        .or_else(|| get_metamethod(TValue::nil(), vm.mm_names.len, &vm.gc));
    match tm {
        Some(tm) => vm.call_tm_res(tm, v, TValue::nil()),
        None => Err(type_error(vm, v, "get length of")),
    }
}

/// `==` with the `__eq` fallback for tables and userdata.
pub(crate) fn values_equal(vm: &mut Vm, a: TValue, b: TValue) -> Result<bool, LuaError> {
    if let Some(eq) = compare::lua_eq(a, b) {
        return Ok(eq);
    }
    let mt1 = vm.gc.metatable_of(a);
    let mt2 = vm.gc.metatable_of(b);
    match get_comp_tm(mt1, mt2, vm.mm_names.eq, &vm.gc) {
        Some(tm) => Ok(vm.call_tm_res(tm, a, b)?.is_truthy()),
        None => Ok(false),
    }
}

/// Call an ordering handler shared by both operands. `None` when there is
/// no such handler.
fn call_order_tm(vm: &mut Vm, a: TValue, b: TValue, event: StringId) -> Result<Option<bool>, LuaError> {
    let Some(tm1) = get_metamethod(a, event, &vm.gc) else {
        return Ok(None);
    };
    match get_metamethod(b, event, &vm.gc) {
        Some(tm2) if tm1.raw_equal(&tm2) => Ok(Some(vm.call_tm_res(tm1, a, b)?.is_truthy())),
        _ => Ok(None),
    }
}

fn order_error(vm: &Vm, a: TValue, b: TValue) -> LuaError {
    vm.runtime_error(&compare::order_error_message(a, b))
}

/// `<` with the `__lt` fallback.
pub(crate) fn less_than(vm: &mut Vm, a: TValue, b: TValue) -> Result<bool, LuaError> {
    if let CompareResult::Ok(r) = compare::lua_lt(a, b, &vm.strings) {
        return Ok(r);
    }
    if LuaType::of(a) != LuaType::of(b) {
        return Err(order_error(vm, a, b));
    }
    let lt = vm.mm_names.lt;
    match call_order_tm(vm, a, b, lt)? {
        Some(r) => Ok(r),
        None => Err(order_error(vm, a, b)),
    }
}

/// `<=` with the `__le` fallback, then `not (b < a)` through `__lt`.
pub(crate) fn less_equal(vm: &mut Vm, a: TValue, b: TValue) -> Result<bool, LuaError> {
    if let CompareResult::Ok(r) = compare::lua_le(a, b, &vm.strings) {
        return Ok(r);
    }
    if LuaType::of(a) != LuaType::of(b) {
        return Err(order_error(vm, a, b));
    }
    let (le, lt) = (vm.mm_names.le, vm.mm_names.lt);
    if let Some(r) = call_order_tm(vm, a, b, le)? {
        return Ok(r);
    }
    match call_order_tm(vm, b, a, lt)? {
        Some(r) => Ok(!r),
        None => Err(order_error(vm, a, b)),
    }
}
