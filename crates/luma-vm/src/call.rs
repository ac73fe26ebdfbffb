//! The call protocol: entering and leaving frames, protected calls and
//! Rust-side calls into Lua.

use crate::callinfo::{CallInfo, MULTRET};
use crate::dispatch;
use crate::error::{LuaError, Status};
use crate::heap::TValueExt;
use crate::metamethod::get_metamethod;
use crate::vm::Vm;
use luma_core::object::lua_type_name;
use luma_core::value::TValue;
use log::trace;

/// Free slots guaranteed to a native function above its arguments.
pub const MIN_STACK: usize = 20;

/// What `precall` did with the callee.
pub(crate) enum PreCall {
    /// A Lua frame was pushed; the caller must run it.
    Lua,
    /// A native function ran to completion; its results are in place.
    Native,
}

impl Vm {
    /// Start a call to the function at `func` with arguments up to `stack_top`.
    pub(crate) fn precall(&mut self, func: usize, nresults: i32) -> Result<PreCall, LuaError> {
        self.precall_with(func, nresults, false)
    }

    /// `precall` for TAILCALL: a Lua callee takes over the running frame, so
    /// it does not count against the depth limit.
    pub(crate) fn precall_tail(&mut self, func: usize) -> Result<PreCall, LuaError> {
        self.precall_with(func, MULTRET, true)
    }

    fn precall_with(
        &mut self,
        func: usize,
        nresults: i32,
        reuses_frame: bool,
    ) -> Result<PreCall, LuaError> {
        let f = self.stack[func];
        if let Some(cl) = f.as_closure_idx() {
            let depth = self.call_stack.len() - usize::from(reuses_frame);
            if depth >= self.config.max_call_depth {
                return Err(LuaError::StackOverflow);
            }
            let proto = &self.gc.closure(cl).proto;
            let np = proto.num_params as usize;
            let is_vararg = proto.is_vararg;
            let max_stack = proto.max_stack_size as usize;
            let mut nargs = self.stack_top - func - 1;
            self.ensure_stack(func + 1 + nargs.max(np) + max_stack)?;

            let base = if is_vararg {
                // Fixed parameters move above the actual arguments; the
                // rest stay below the base as varargs.
                for slot in &mut self.stack[func + 1 + nargs..func + 1 + np.max(nargs)] {
                    *slot = TValue::nil();
                }
                nargs = nargs.max(np);
                let base = func + 1 + nargs;
                for i in 0..np {
                    self.stack[base + i] = self.stack[func + 1 + i];
                    self.stack[func + 1 + i] = TValue::nil();
                }
                base
            } else {
                func + 1
            };
            let top = base + max_stack;
            let first_free = if is_vararg { base + np } else { base + nargs.min(np) };
            for slot in &mut self.stack[first_free..top] {
                *slot = TValue::nil();
            }
            self.call_stack.push(CallInfo::new_lua(func, base, top, nresults));
            self.stack_top = top;
            trace!("call lua function at slot {func} (depth {})", self.call_stack.len());
            return Ok(PreCall::Lua);
        }

        if let Some(nf) = f.as_native_idx() {
            if self.call_stack.len() >= self.config.max_call_depth {
                return Err(LuaError::StackOverflow);
            }
            let native = self.gc.native(nf);
            let callee = native.func;
            trace!("call native '{}' (depth {})", native.name, self.call_stack.len() + 1);
            self.ensure_stack(self.stack_top + MIN_STACK)?;
            self.call_stack
                .push(CallInfo::new_native(func, self.stack_top + MIN_STACK, nresults));
            let saved_api_base = self.api_base;
            self.api_base = func + 1;
            let result = callee(self);
            self.api_base = saved_api_base;
            let n = result?.min(self.stack_top - (func + 1));
            self.poscall(self.stack_top - n);
            return Ok(PreCall::Native);
        }

        // Not a function: insert its __call handler below it and retry.
        match get_metamethod(f, self.mm_names.call, &self.gc) {
            Some(tm) if tm.is_function() => {
                self.ensure_stack(self.stack_top + 1)?;
                self.stack.copy_within(func..self.stack_top, func + 1);
                self.stack[func] = tm;
                self.stack_top += 1;
                self.precall_with(func, nresults, reuses_frame)
            }
            _ => Err(self.runtime_error(&format!(
                "attempt to call a {} value",
                lua_type_name(f)
            ))),
        }
    }

    /// Finish the running frame: move results starting at `first_result`
    /// (up to `stack_top`) to its function slot, adjusted to the wanted
    /// count, and pop it. Returns the wanted count.
    pub(crate) fn poscall(&mut self, first_result: usize) -> i32 {
        let ci = self
            .call_stack
            .pop()
            .expect("poscall with an empty call stack");
        let res = ci.func;
        let wanted = ci.num_results;
        let available = self.stack_top.saturating_sub(first_result);
        let n = if wanted == MULTRET { available } else { wanted as usize };
        if res + n > self.stack.len() {
            self.stack.resize(res + n, TValue::nil());
        }
        for i in 0..n {
            self.stack[res + i] = if i < available {
                self.stack[first_result + i]
            } else {
                TValue::nil()
            };
        }
        self.stack_top = res + n;
        trace!("return {n} values to slot {res} (depth {})", self.call_stack.len());
        wanted
    }

    /// Call the function at `func` and run it to completion. This is a
    /// native boundary: yields cannot cross it.
    pub(crate) fn call_at(&mut self, func: usize, nresults: i32) -> Result<(), LuaError> {
        if self.n_ccalls >= self.config.max_ccalls {
            return Err(LuaError::CStackOverflow);
        }
        self.n_ccalls += 1;
        let depth = self.call_stack.len();
        let result = match self.precall(func, nresults) {
            Ok(PreCall::Lua) => dispatch::execute(self, depth),
            Ok(PreCall::Native) => Ok(()),
            Err(e) => Err(e),
        };
        self.n_ccalls -= 1;
        result
    }

    /// `call_at`, restoring frames, upvalues and the stack top to the state
    /// before the call if it fails.
    pub(crate) fn protected_call_at(&mut self, func: usize, nresults: i32) -> Result<(), LuaError> {
        let saved_depth = self.call_stack.len();
        let saved_ccalls = self.n_ccalls;
        let saved_api_base = self.api_base;
        let result = self.call_at(func, nresults);
        if result.is_err() {
            self.close_upvalues(func);
            self.call_stack.truncate(saved_depth);
            self.n_ccalls = saved_ccalls;
            self.api_base = saved_api_base;
            self.stack_top = func;
        }
        result
    }

    fn call_func_slot(&self, nargs: usize) -> Result<usize, LuaError> {
        self.stack_top
            .checked_sub(nargs + 1)
            .filter(|&f| f >= self.api_base)
            .ok_or_else(|| LuaError::Runtime("not enough values on the stack for call".into()))
    }

    /// Call the function below the top `nargs` values. Results replace the
    /// function and arguments (`nresults` of them, or all for `MULTRET`).
    pub fn call(&mut self, nargs: usize, nresults: i32) -> Result<(), LuaError> {
        let func = self.call_func_slot(nargs)?;
        let result = self.protected_call_at(func, nresults);
        self.after_outer_call(result.as_ref().err());
        result
    }

    /// Protected `call`. On failure the error object (after the optional
    /// handler ran on it) replaces the function and arguments.
    pub fn pcall(&mut self, nargs: usize, nresults: i32, handler: Option<TValue>) -> Status {
        let func = match self.call_func_slot(nargs) {
            Ok(f) => f,
            Err(e) => {
                let v = e.into_value(self);
                self.push_value(v);
                return Status::ErrRun;
            }
        };
        let err = match self.protected_call_at(func, nresults) {
            Ok(()) => {
                self.after_outer_call(None);
                return Status::Ok;
            }
            Err(e) => e,
        };
        let mut status = err.status();
        let mut value = err.into_value(self);
        if let (Status::ErrRun, Some(h)) = (status, handler) {
            match self.call_value(h, &[value]) {
                Ok(results) => value = results.first().copied().unwrap_or_default(),
                Err(_) => {
                    status = Status::ErrErr;
                    value = LuaError::ErrorHandler.into_value(self);
                }
            }
        }
        self.stack_top = func;
        self.push_value(value);
        self.after_outer_call(None);
        status
    }

    /// Call `f` with `args` and collect all results. The stack is left as it
    /// was whether or not the call succeeds.
    pub fn call_value(&mut self, f: TValue, args: &[TValue]) -> Result<Vec<TValue>, LuaError> {
        let saved_top = self.stack_top;
        // A copy of the callee stays below the call so a deferred
        // collection cannot free it while the host still holds it.
        self.push_value(f);
        let func = self.stack_top;
        if let Err(e) = self.push_call(f, args) {
            self.stack_top = saved_top;
            return Err(e);
        }
        let result = self.protected_call_at(func, MULTRET);
        // Results sit in `func..stack_top` while the collector runs.
        self.after_outer_call(result.as_ref().err());
        let results = result.map(|()| self.stack[func..self.stack_top].to_vec());
        self.stack_top = saved_top;
        results
    }

    fn push_call(&mut self, f: TValue, args: &[TValue]) -> Result<(), LuaError> {
        let func = self.stack_top;
        self.ensure_stack(func + args.len() + 1)?;
        self.stack[func] = f;
        self.stack[func + 1..func + 1 + args.len()].copy_from_slice(args);
        self.stack_top = func + 1 + args.len();
        Ok(())
    }

    /// Call a metamethod handler with two operands, keeping one result.
    pub(crate) fn call_tm_res(&mut self, tm: TValue, a: TValue, b: TValue) -> Result<TValue, LuaError> {
        let func = self.stack_top;
        self.push_call(tm, &[a, b])?;
        self.call_at(func, 1)?;
        let result = self.stack[func];
        self.stack_top = func;
        Ok(result)
    }

    /// Call a metamethod handler with three operands, discarding results.
    pub(crate) fn call_tm_void(
        &mut self,
        tm: TValue,
        a: TValue,
        b: TValue,
        c: TValue,
    ) -> Result<(), LuaError> {
        let func = self.stack_top;
        self.push_call(tm, &[a, b, c])?;
        self.call_at(func, 0)?;
        self.stack_top = func;
        Ok(())
    }

    /// Run a deferred collection once the outermost call has returned.
    /// Everything below `stack_top` survives, and so does the error object
    /// of `err`.
    fn after_outer_call(&mut self, err: Option<&LuaError>) {
        if !self.gc_requested
            || !self.call_stack.is_empty()
            || self.current_thread != self.main_thread
        {
            return;
        }
        self.gc_requested = false;
        let saved_top = self.stack_top;
        if let Some(LuaError::Value(v)) = err {
            self.push_value(*v);
        }
        if let Err(e) = self.collect_garbage() {
            log::warn!("deferred collection failed: {e}");
        }
        self.stack_top = saved_top;
    }
}

/// Call `f` with `args` from Rust (natives, metamethods, hosts) and return
/// all results. A native boundary: the callee cannot yield. On error the
/// stack is left to the enclosing protected call to restore.
pub fn call_function(vm: &mut Vm, f: TValue, args: &[TValue]) -> Result<Vec<TValue>, LuaError> {
    let func = vm.stack_top;
    vm.push_call(f, args)?;
    vm.call_at(func, MULTRET)?;
    let results = vm.stack[func..vm.stack_top].to_vec();
    vm.stack_top = func;
    Ok(results)
}
