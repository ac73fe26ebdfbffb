//! Stack-based host API.
//!
//! Positive indices count from the base of the running native's window
//! (1 = first argument), negative ones from the top (-1 = top value).
//! Pseudo-indices reach the registry, the running function's environment,
//! the globals table and the running native's upvalues.

use crate::coerce;
use crate::concat;
use crate::dispatch;
use crate::error::LuaError;
use crate::heap::{NativeFn, NativeFunction, TValueExt};
use crate::vm::Vm;
use luma_core::gc::{GcIdx, Userdata, GC_SUB_CLOSURE, GC_SUB_NATIVE, GC_SUB_TABLE, GC_SUB_THREAD, GC_SUB_USERDATA};
use luma_core::object::{lua_type_name, LuaType};
use luma_core::string::StringId;
use luma_core::table::Table;
use luma_core::value::TValue;
use std::any::Any;

pub const REGISTRY_INDEX: i32 = -10000;
pub const ENVIRON_INDEX: i32 = -10001;
pub const GLOBALS_INDEX: i32 = -10002;

/// Pseudo-index of the running native's `i`-th upvalue (1-based).
pub const fn upvalue_index(i: i32) -> i32 {
    GLOBALS_INDEX - i
}

impl Vm {
    // ---- Stack window ----

    /// Number of values in the current window.
    pub fn get_top(&self) -> usize {
        self.stack_top - self.api_base
    }

    /// Arguments passed to the running native.
    pub fn arg_count(&self) -> usize {
        self.get_top()
    }

    /// Set the top: a non-negative `idx` is the new value count (new slots are
    /// nil), a negative one is relative to the current top.
    pub fn set_top(&mut self, idx: i32) -> Result<(), LuaError> {
        if idx >= 0 {
            let new_top = self.api_base + idx as usize;
            self.ensure_stack(new_top)?;
            for slot in self.stack_top..new_top {
                self.stack[slot] = TValue::nil();
            }
            self.stack_top = new_top;
        } else {
            let drop = (-idx - 1) as usize;
            self.stack_top = self.stack_top.saturating_sub(drop).max(self.api_base);
        }
        Ok(())
    }

    /// Stack slot of a real (non-pseudo) index, if it is within the window.
    fn slot(&self, idx: i32) -> Option<usize> {
        if idx > 0 {
            let s = self.api_base + idx as usize - 1;
            (s < self.stack_top).then_some(s)
        } else if idx < 0 && idx > REGISTRY_INDEX {
            let s = self.stack_top as i64 + idx as i64;
            (s >= self.api_base as i64).then_some(s as usize)
        } else {
            None
        }
    }

    /// Turn a relative index into an absolute one. Pseudo-indices pass through.
    pub fn abs_index(&self, idx: i32) -> i32 {
        if idx > 0 || idx <= REGISTRY_INDEX {
            idx
        } else {
            self.get_top() as i32 + idx + 1
        }
    }

    /// The running native function, if the top frame is one.
    fn running_native(&self) -> Option<GcIdx<NativeFunction>> {
        let ci = self.call_stack.last()?;
        if ci.is_lua() {
            None
        } else {
            self.stack[ci.func].as_native_idx()
        }
    }

    /// Value at `idx`; nil when the index is outside the window.
    pub fn value_at(&self, idx: i32) -> TValue {
        match idx {
            REGISTRY_INDEX => TValue::from_table(self.registry),
            GLOBALS_INDEX => TValue::from_table(self.globals),
            ENVIRON_INDEX => {
                let env = self
                    .running_native()
                    .map_or(self.globals, |nf| self.gc.native(nf).env);
                TValue::from_table(env)
            }
            i if i < GLOBALS_INDEX => {
                let n = (GLOBALS_INDEX - i) as usize;
                self.running_native()
                    .and_then(|nf| self.gc.native(nf).upvalues.get(n - 1).copied())
                    .unwrap_or_default()
            }
            i => self.slot(i).map_or(TValue::nil(), |s| self.stack[s]),
        }
    }

    fn set_value_at(&mut self, idx: i32, v: TValue) -> Result<(), LuaError> {
        if idx < GLOBALS_INDEX {
            let n = (GLOBALS_INDEX - idx) as usize;
            if let Some(nf) = self.running_native() {
                if let Some(slot) = self.gc.native_mut(nf).upvalues.get_mut(n - 1) {
                    *slot = v;
                    return Ok(());
                }
            }
            return Err(LuaError::Runtime("invalid upvalue index".into()));
        }
        match self.slot(idx) {
            Some(s) => {
                self.stack[s] = v;
                Ok(())
            }
            None => Err(LuaError::Runtime(format!("invalid stack index {idx}"))),
        }
    }

    // ---- Push / pop ----

    pub fn push_nil(&mut self) {
        self.push_value(TValue::nil());
    }

    pub fn push_number(&mut self, n: f64) {
        self.push_value(TValue::from_number(n));
    }

    pub fn push_boolean(&mut self, b: bool) {
        self.push_value(TValue::from_bool(b));
    }

    pub fn push_string(&mut self, bytes: &[u8]) {
        let s = self.intern(bytes);
        self.push_value(s);
    }

    /// Push a copy of the value at `idx`.
    pub fn push_index(&mut self, idx: i32) {
        let v = self.value_at(idx);
        self.push_value(v);
    }

    pub fn pop(&mut self, n: usize) {
        self.stack_top = self.stack_top.saturating_sub(n).max(self.api_base);
    }

    /// Move the top value into `idx`, shifting the values above up.
    pub fn insert(&mut self, idx: i32) {
        if let Some(s) = self.slot(idx) {
            let v = self.stack[self.stack_top - 1];
            self.stack.copy_within(s..self.stack_top - 1, s + 1);
            self.stack[s] = v;
        }
    }

    /// Remove the value at `idx`, shifting the values above down.
    pub fn remove(&mut self, idx: i32) {
        if let Some(s) = self.slot(idx) {
            self.stack.copy_within(s + 1..self.stack_top, s);
            self.stack_top -= 1;
        }
    }

    /// Pop the top value into `idx`.
    pub fn replace(&mut self, idx: i32) -> Result<(), LuaError> {
        let v = self.value_at(-1);
        self.pop(1);
        self.set_value_at(idx, v)
    }

    // ---- Reading values ----

    /// Type at `idx`, or `None` for an index past the top.
    pub fn type_of(&self, idx: i32) -> Option<LuaType> {
        if idx > REGISTRY_INDEX && self.slot(idx).is_none() {
            return None;
        }
        Some(LuaType::of(self.value_at(idx)))
    }

    /// Type name at `idx`, "no value" past the top.
    pub fn type_name_at(&self, idx: i32) -> &'static str {
        self.type_of(idx).map_or("no value", LuaType::name)
    }

    pub fn is_none(&self, idx: i32) -> bool {
        self.type_of(idx).is_none()
    }

    pub fn is_none_or_nil(&self, idx: i32) -> bool {
        self.value_at(idx).is_nil()
    }

    /// Numbers and strings convertible to numbers.
    pub fn is_number(&self, idx: i32) -> bool {
        self.to_number(idx).is_some()
    }

    /// Strings and numbers.
    pub fn is_string(&self, idx: i32) -> bool {
        let v = self.value_at(idx);
        v.is_string() || v.is_number()
    }

    pub fn is_table(&self, idx: i32) -> bool {
        self.value_at(idx).is_table()
    }

    pub fn is_function(&self, idx: i32) -> bool {
        self.value_at(idx).is_function()
    }

    pub fn is_native_function(&self, idx: i32) -> bool {
        self.value_at(idx).as_native_idx().is_some()
    }

    pub fn is_userdata(&self, idx: i32) -> bool {
        LuaType::of(self.value_at(idx)) == LuaType::Userdata
    }

    pub fn is_thread(&self, idx: i32) -> bool {
        self.value_at(idx).as_thread_idx().is_some()
    }

    pub fn to_number(&self, idx: i32) -> Option<f64> {
        coerce::to_number(self.value_at(idx), &self.strings)
    }

    pub fn to_boolean(&self, idx: i32) -> bool {
        self.value_at(idx).is_truthy()
    }

    /// String at `idx`; a number is converted in place.
    pub fn to_str(&mut self, idx: i32) -> Option<StringId> {
        let v = self.value_at(idx);
        if let Some(sid) = v.as_string_id() {
            return Some(sid);
        }
        let sid = coerce::to_str_id(v, &mut self.strings)?;
        // Only real stack slots are rewritten; pseudo-index values stay numbers.
        if let Some(s) = self.slot(idx) {
            self.stack[s] = TValue::from_string_id(sid);
        }
        Some(sid)
    }

    /// Bytes of the string at `idx`, converting a number in place.
    pub fn to_bytes(&mut self, idx: i32) -> Option<Vec<u8>> {
        let sid = self.to_str(idx)?;
        Some(self.strings.get_bytes(sid).to_vec())
    }

    // ---- Argument checks ----

    /// Name of the running native, for argument errors.
    fn native_name(&self) -> &'static str {
        self.running_native()
            .map_or("?", |nf| self.gc.native(nf).name)
    }

    /// Raise an error with the position of the calling Lua code.
    pub fn error(&self, msg: &str) -> LuaError {
        LuaError::Runtime(format!("{}{}", self.where_(1), msg))
    }

    pub fn arg_error(&self, narg: usize, extra: &str) -> LuaError {
        self.error(&format!(
            "bad argument #{} to '{}' ({})",
            narg,
            self.native_name(),
            extra
        ))
    }

    pub fn type_error(&self, narg: usize, expected: &str) -> LuaError {
        let got = self.type_name_at(narg as i32);
        self.arg_error(narg, &format!("{expected} expected, got {got}"))
    }

    pub fn check_any(&self, narg: usize) -> Result<TValue, LuaError> {
        if self.is_none(narg as i32) {
            return Err(self.arg_error(narg, "value expected"));
        }
        Ok(self.value_at(narg as i32))
    }

    pub fn check_number(&self, narg: usize) -> Result<f64, LuaError> {
        self.to_number(narg as i32)
            .ok_or_else(|| self.type_error(narg, "number"))
    }

    /// Integer argument, truncated toward zero.
    pub fn check_integer(&self, narg: usize) -> Result<i64, LuaError> {
        self.check_number(narg).map(|n| n as i64)
    }

    pub fn check_str(&mut self, narg: usize) -> Result<StringId, LuaError> {
        match self.to_str(narg as i32) {
            Some(sid) => Ok(sid),
            None => Err(self.type_error(narg, "string")),
        }
    }

    pub fn check_table(&self, narg: usize) -> Result<GcIdx<Table>, LuaError> {
        self.value_at(narg as i32)
            .as_table_idx()
            .ok_or_else(|| self.type_error(narg, "table"))
    }

    pub fn check_function(&self, narg: usize) -> Result<TValue, LuaError> {
        let v = self.value_at(narg as i32);
        if v.is_function() {
            Ok(v)
        } else {
            Err(self.type_error(narg, "function"))
        }
    }

    pub fn opt_number(&self, narg: usize, default: f64) -> Result<f64, LuaError> {
        if self.is_none_or_nil(narg as i32) {
            Ok(default)
        } else {
            self.check_number(narg)
        }
    }

    pub fn opt_integer(&self, narg: usize, default: i64) -> Result<i64, LuaError> {
        self.opt_number(narg, default as f64).map(|n| n as i64)
    }

    // ---- Tables ----

    /// Push a new empty table and return it.
    pub fn new_table(&mut self) -> Result<TValue, LuaError> {
        self.create_table(0, 0)
    }

    /// Push a new table with preallocated parts and return it.
    pub fn create_table(&mut self, narray: usize, nhash: usize) -> Result<TValue, LuaError> {
        let t = TValue::from_table(self.gc.alloc_table(narray, nhash)?);
        self.push_value(t);
        Ok(t)
    }

    /// Pop a key and push `t[key]`, where `t` is at `idx`.
    pub fn get_table(&mut self, idx: i32) -> Result<(), LuaError> {
        let t = self.value_at(idx);
        let key = self.value_at(-1);
        self.pop(1);
        let v = dispatch::index_value(self, t, key)?;
        self.push_value(v);
        Ok(())
    }

    /// Push `t[name]`, where `t` is at `idx`.
    pub fn get_field(&mut self, idx: i32, name: &str) -> Result<(), LuaError> {
        let t = self.value_at(idx);
        let key = self.intern(name.as_bytes());
        let v = dispatch::index_value(self, t, key)?;
        self.push_value(v);
        Ok(())
    }

    /// Pop a value and a key (value on top) and do `t[key] = value`.
    pub fn set_table(&mut self, idx: i32) -> Result<(), LuaError> {
        let t = self.value_at(idx);
        let key = self.value_at(-2);
        let val = self.value_at(-1);
        self.pop(2);
        dispatch::set_index(self, t, key, val)
    }

    /// Pop a value and do `t[name] = value`.
    pub fn set_field(&mut self, idx: i32, name: &str) -> Result<(), LuaError> {
        let t = self.value_at(idx);
        let key = self.intern(name.as_bytes());
        let val = self.value_at(-1);
        self.pop(1);
        dispatch::set_index(self, t, key, val)
    }

    pub fn get_global(&mut self, name: &str) -> Result<(), LuaError> {
        self.get_field(GLOBALS_INDEX, name)
    }

    pub fn set_global(&mut self, name: &str) -> Result<(), LuaError> {
        self.set_field(GLOBALS_INDEX, name)
    }

    fn table_at(&self, idx: i32) -> Result<GcIdx<Table>, LuaError> {
        self.value_at(idx).as_table_idx().ok_or_else(|| {
            LuaError::Runtime(format!(
                "table expected, got {}",
                lua_type_name(self.value_at(idx))
            ))
        })
    }

    /// Pop a key and push the raw `t[key]`.
    pub fn raw_get(&mut self, idx: i32) -> Result<(), LuaError> {
        let t = self.table_at(idx)?;
        let key = self.value_at(-1);
        self.pop(1);
        let v = self.gc.table(t).raw_get(key);
        self.push_value(v);
        Ok(())
    }

    /// Pop a value and a key and raw-assign them.
    pub fn raw_set(&mut self, idx: i32) -> Result<(), LuaError> {
        let t = self.table_at(idx)?;
        let key = self.value_at(-2);
        let val = self.value_at(-1);
        self.pop(2);
        self.gc
            .table_mut(t)
            .raw_set(key, val)
            .map_err(|e| LuaError::Runtime(e.to_string()))
    }

    pub fn raw_get_int(&mut self, idx: i32, n: i64) -> Result<(), LuaError> {
        let t = self.table_at(idx)?;
        let v = self.gc.table(t).raw_get_int(n);
        self.push_value(v);
        Ok(())
    }

    /// Pop a value into the raw `t[n]`.
    pub fn raw_set_int(&mut self, idx: i32, n: i64) -> Result<(), LuaError> {
        let t = self.table_at(idx)?;
        let val = self.value_at(-1);
        self.pop(1);
        self.gc.table_mut(t).raw_set_int(n, val);
        Ok(())
    }

    pub fn raw_equal(&self, idx1: i32, idx2: i32) -> bool {
        if self.is_none(idx1) || self.is_none(idx2) {
            return false;
        }
        self.value_at(idx1).raw_equal(&self.value_at(idx2))
    }

    /// Pop a key and push the next key/value pair of the table at `idx`.
    /// Returns false, pushing nothing, at the end of the traversal.
    pub fn next(&mut self, idx: i32) -> Result<bool, LuaError> {
        let t = self.table_at(idx)?;
        let key = self.value_at(-1);
        self.pop(1);
        match self.gc.table(t).next(key) {
            Ok(Some((k, v))) => {
                self.push_value(k);
                self.push_value(v);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(self.error(&e.to_string())),
        }
    }

    /// Raw length: string bytes, table border, 0 otherwise.
    pub fn obj_len(&self, idx: i32) -> usize {
        let v = self.value_at(idx);
        if let Some(sid) = v.as_string_id() {
            self.strings.get(sid).len()
        } else if let Some(num) = v.as_number() {
            coerce::number_to_str(num).len()
        } else if let Some(t) = v.as_table_idx() {
            self.gc.table(t).length()
        } else {
            0
        }
    }

    // ---- Metatables and environments ----

    /// Push the metatable of the value at `idx`. Returns false, pushing
    /// nothing, when it has none.
    pub fn get_metatable(&mut self, idx: i32) -> bool {
        match self.gc.metatable_of(self.value_at(idx)) {
            Some(mt) => {
                self.push_value(TValue::from_table(mt));
                true
            }
            None => false,
        }
    }

    /// Pop a table (or nil) and make it the metatable of the value at `idx`.
    /// Values other than tables and userdata share a metatable per type.
    pub fn set_metatable(&mut self, idx: i32) -> Result<(), LuaError> {
        let v = self.value_at(idx);
        let mt_val = self.value_at(-1);
        let mt = if mt_val.is_nil() {
            None
        } else {
            Some(
                mt_val
                    .as_table_idx()
                    .ok_or_else(|| LuaError::Runtime("table expected".into()))?,
            )
        };
        self.pop(1);
        if let Some(t) = v.as_table_idx() {
            self.gc.table_mut(t).metatable = mt;
        } else if let Some(u) = v.as_userdata_idx() {
            if let Some(ud) = self.gc.userdata.get_mut(u) {
                ud.metatable = mt;
            }
        } else {
            self.set_type_metatable(LuaType::of(v), mt);
        }
        Ok(())
    }

    /// Shared metatable for every value of a non-table, non-userdata type
    /// (light userdata included).
    pub fn set_type_metatable(&mut self, ty: LuaType, mt: Option<GcIdx<Table>>) {
        self.gc.type_metatables[ty as usize] = mt;
    }

    /// Environment table of a function, userdata or thread value.
    pub fn env_of(&self, v: TValue) -> Option<GcIdx<Table>> {
        match v.gc_sub_tag() {
            Some(GC_SUB_CLOSURE) => v.as_closure_idx().map(|c| self.gc.closure(c).env),
            Some(GC_SUB_NATIVE) => v.as_native_idx().map(|n| self.gc.native(n).env),
            Some(GC_SUB_USERDATA) => v
                .as_userdata_idx()
                .and_then(|u| self.gc.userdata.get(u))
                .and_then(|ud| ud.env),
            Some(GC_SUB_THREAD) => Some(self.globals),
            _ => None,
        }
    }

    /// Push the environment of the value at `idx` (nil if it has none).
    pub fn get_fenv(&mut self, idx: i32) {
        let env = self
            .env_of(self.value_at(idx))
            .map_or(TValue::nil(), TValue::from_table);
        self.push_value(env);
    }

    /// Pop a table and make it the environment of the function or userdata
    /// at `idx`. Returns false when the value cannot have one.
    pub fn set_fenv(&mut self, idx: i32) -> Result<bool, LuaError> {
        let v = self.value_at(idx);
        let env = self.table_at(-1)?;
        self.pop(1);
        let done = match v.gc_sub_tag() {
            Some(GC_SUB_CLOSURE) => v
                .as_closure_idx()
                .and_then(|c| self.gc.closures.get_mut(c))
                .map(|cl| cl.env = env)
                .is_some(),
            Some(GC_SUB_NATIVE) => v
                .as_native_idx()
                .map(|n| self.gc.native_mut(n).env = env)
                .is_some(),
            Some(GC_SUB_USERDATA) => v
                .as_userdata_idx()
                .and_then(|u| self.gc.userdata.get_mut(u))
                .map(|ud| ud.env = Some(env))
                .is_some(),
            _ => false,
        };
        Ok(done)
    }

    // ---- Operators ----

    /// Concatenate the top `n` values, leaving the result on top.
    pub fn concat(&mut self, n: usize) -> Result<(), LuaError> {
        match n {
            0 => self.push_string(b""),
            1 => {}
            _ => {
                let first = self.stack_top - n;
                concat::concat(self, first, n)?;
                self.stack_top = first + 1;
            }
        }
        Ok(())
    }

    pub fn less_than(&mut self, idx1: i32, idx2: i32) -> Result<bool, LuaError> {
        if self.is_none(idx1) || self.is_none(idx2) {
            return Ok(false);
        }
        let (a, b) = (self.value_at(idx1), self.value_at(idx2));
        dispatch::less_than(self, a, b)
    }

    pub fn equal(&mut self, idx1: i32, idx2: i32) -> Result<bool, LuaError> {
        if self.is_none(idx1) || self.is_none(idx2) {
            return Ok(false);
        }
        let (a, b) = (self.value_at(idx1), self.value_at(idx2));
        dispatch::values_equal(self, a, b)
    }

    /// `#v` with the `__len` fallback.
    pub fn length_of(&mut self, v: TValue) -> Result<TValue, LuaError> {
        dispatch::length_value(self, v)
    }

    // ---- Native functions ----

    /// A native function value over the globals environment.
    pub fn create_native(&mut self, name: &'static str, f: NativeFn) -> Result<TValue, LuaError> {
        let nf = self.gc.alloc_native(NativeFunction {
            func: f,
            name,
            upvalues: Vec::new(),
            env: self.globals,
        })?;
        Ok(TValue::from_native(nf))
    }

    /// Store a native function in the global `name`.
    pub fn register(&mut self, name: &'static str, f: NativeFn) -> Result<(), LuaError> {
        let v = self.create_native(name, f)?;
        let key = self.strings.intern(name.as_bytes());
        self.gc.table_mut(self.globals).raw_set_str(key, v);
        Ok(())
    }

    /// Create (or extend) the global table `lib` with native functions.
    pub fn register_lib(
        &mut self,
        lib: &str,
        funcs: &[(&'static str, NativeFn)],
    ) -> Result<TValue, LuaError> {
        let lib_key = self.strings.intern(lib.as_bytes());
        let existing = self.gc.table(self.globals).raw_get_str(lib_key);
        let t = match existing.as_table_idx() {
            Some(t) => t,
            None => {
                let t = self.gc.alloc_table(0, funcs.len())?;
                self.gc
                    .table_mut(self.globals)
                    .raw_set_str(lib_key, TValue::from_table(t));
                t
            }
        };
        for &(name, f) in funcs {
            let v = self.create_native(name, f)?;
            let key = self.strings.intern(name.as_bytes());
            self.gc.table_mut(t).raw_set_str(key, v);
        }
        Ok(TValue::from_table(t))
    }

    /// Pop `n` values and push a native function holding them as upvalues.
    pub fn push_native_closure(&mut self, f: NativeFn, n: usize) -> Result<(), LuaError> {
        let first = self.stack_top.saturating_sub(n).max(self.api_base);
        let upvalues = self.stack[first..self.stack_top].to_vec();
        let nf = self.gc.alloc_native(NativeFunction {
            func: f,
            name: "?",
            upvalues,
            env: self.globals,
        })?;
        self.stack_top = first;
        self.push_value(TValue::from_native(nf));
        Ok(())
    }

    /// The running native's `i`-th upvalue (1-based).
    pub fn native_upvalue(&self, i: usize) -> TValue {
        self.value_at(upvalue_index(i as i32))
    }

    // ---- Userdata ----

    /// Push a full userdata holding `payload`.
    pub fn new_userdata(&mut self, payload: Box<dyn Any>) -> Result<TValue, LuaError> {
        let u = self.gc.alloc_userdata(Userdata {
            payload,
            metatable: None,
            env: Some(self.globals),
        })?;
        let v = TValue::from_userdata(u);
        self.push_value(v);
        Ok(v)
    }

    /// Borrow the payload of the userdata at `idx` as a `T`.
    pub fn userdata_ref<T: 'static>(&self, idx: i32) -> Option<&T> {
        let u = self.value_at(idx).as_userdata_idx()?;
        self.gc.userdata.get(u)?.payload.downcast_ref::<T>()
    }

    pub fn userdata_mut<T: 'static>(&mut self, idx: i32) -> Option<&mut T> {
        let u = self.value_at(idx).as_userdata_idx()?;
        self.gc.userdata.get_mut(u)?.payload.downcast_mut::<T>()
    }

    // ---- Formatting ----

    /// `tostring` without metamethods: `%.14g` numbers, `table: 0x...` for
    /// reference types.
    pub fn display_raw(&self, v: TValue) -> String {
        if let Some(sid) = v.as_string_id() {
            return self.strings.get_str_lossy(sid);
        }
        if let Some(n) = v.as_number() {
            return coerce::number_to_str(n);
        }
        if let Some(b) = v.as_bool() {
            return b.to_string();
        }
        if v.is_nil() {
            return "nil".to_string();
        }
        if let Some(p) = v.as_light_userdata() {
            return format!("userdata: 0x{p:08x}");
        }
        // Identity: sub-tag and arena index, unique among live objects.
        let id = (v.gc_sub_tag().unwrap_or(0) << 28) | v.gc_index().unwrap_or(0) as u64;
        let kind = match v.gc_sub_tag() {
            Some(GC_SUB_TABLE) => "table",
            Some(GC_SUB_CLOSURE) | Some(GC_SUB_NATIVE) => "function",
            Some(GC_SUB_THREAD) => "thread",
            _ => "userdata",
        };
        format!("{kind}: 0x{id:08x}")
    }

    /// `tostring(v)`: the `__tostring` handler's result if there is one.
    pub fn tostring_value(&mut self, v: TValue) -> Result<TValue, LuaError> {
        if let Some(tm) = crate::metamethod::get_metamethod(v, self.mm_names.tostring, &self.gc) {
            let results = crate::call::call_function(self, tm, &[v])?;
            return Ok(results.first().copied().unwrap_or_default());
        }
        if v.is_string() {
            return Ok(v);
        }
        let s = self.display_raw(v);
        Ok(self.intern(s.as_bytes()))
    }

    /// Display string following `tostring` rules.
    pub fn to_display_string(&mut self, v: TValue) -> Result<String, LuaError> {
        let s = self.tostring_value(v)?;
        match s.as_string_id() {
            Some(sid) => Ok(self.strings.get_str_lossy(sid)),
            None if s.is_number() => Ok(self.display_raw(s)),
            None => Err(LuaError::Runtime("'__tostring' must return a string".into())),
        }
    }
}
