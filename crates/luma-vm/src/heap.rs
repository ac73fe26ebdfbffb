//! The VM's object heap: one arena per collectable object kind.

use crate::callinfo::CallInfo;
use crate::error::LuaError;
use crate::vm::Vm;
use luma_bytecode::proto::Proto;
use luma_core::gc::{
    Arena, GcIdx, UpVal, Userdata, GC_SUB_CLOSURE, GC_SUB_NATIVE, GC_SUB_THREAD,
};
use luma_core::object::LuaType;
use luma_core::table::Table;
use luma_core::value::TValue;
use std::rc::Rc;

/// Signature of a host function. Arguments sit on the stack from index 1;
/// the function pushes its results and returns how many there are.
pub type NativeFn = fn(&mut Vm) -> Result<usize, LuaError>;

/// A Lua function: a prototype plus its captured upvalues and environment.
pub struct LuaClosure {
    pub proto: Rc<Proto>,
    pub upvalues: Vec<GcIdx<UpVal>>,
    pub env: GcIdx<Table>,
}

/// A host function with its own upvalue slots.
pub struct NativeFunction {
    pub func: NativeFn,
    pub name: &'static str,
    pub upvalues: Vec<TValue>,
    pub env: GcIdx<Table>,
}

/// Lifecycle of a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Created, body not started yet.
    Fresh,
    /// Paused in a yield.
    Suspended,
    Running,
    /// Resumed another coroutine and waits for it.
    Normal,
    /// Returned or raised an error.
    Dead,
}

impl ThreadStatus {
    /// Name reported by `coroutine.status`.
    pub fn name(self) -> &'static str {
        match self {
            ThreadStatus::Fresh | ThreadStatus::Suspended => "suspended",
            ThreadStatus::Running => "running",
            ThreadStatus::Normal => "normal",
            ThreadStatus::Dead => "dead",
        }
    }
}

/// Saved execution state of a thread that is not currently running.
///
/// While a thread runs, its stack, frames and open upvalues live in the
/// `Vm` itself and these fields are empty.
pub struct LuaThread {
    pub stack: Vec<TValue>,
    pub call_stack: Vec<CallInfo>,
    pub stack_top: usize,
    /// Open upvalues sorted by stack slot, descending.
    pub open_upvals: Vec<(usize, GcIdx<UpVal>)>,
    pub status: ThreadStatus,
}

impl LuaThread {
    pub fn new(stack: Vec<TValue>, stack_top: usize, status: ThreadStatus) -> Self {
        LuaThread {
            stack,
            call_stack: Vec::new(),
            stack_top,
            open_upvals: Vec::new(),
            status,
        }
    }
}

/// Function and thread constructors/accessors for `TValue`.
pub trait TValueExt {
    fn from_closure(idx: GcIdx<LuaClosure>) -> Self;
    fn as_closure_idx(&self) -> Option<GcIdx<LuaClosure>>;
    fn from_native(idx: GcIdx<NativeFunction>) -> Self;
    fn as_native_idx(&self) -> Option<GcIdx<NativeFunction>>;
    fn from_thread(idx: GcIdx<LuaThread>) -> Self;
    fn as_thread_idx(&self) -> Option<GcIdx<LuaThread>>;
}

impl TValueExt for TValue {
    #[inline]
    fn from_closure(idx: GcIdx<LuaClosure>) -> Self {
        TValue::from_gc_sub(GC_SUB_CLOSURE, idx.0)
    }

    #[inline]
    fn as_closure_idx(&self) -> Option<GcIdx<LuaClosure>> {
        if self.gc_sub_tag() == Some(GC_SUB_CLOSURE) {
            self.gc_index().map(GcIdx::new)
        } else {
            None
        }
    }

    #[inline]
    fn from_native(idx: GcIdx<NativeFunction>) -> Self {
        TValue::from_gc_sub(GC_SUB_NATIVE, idx.0)
    }

    #[inline]
    fn as_native_idx(&self) -> Option<GcIdx<NativeFunction>> {
        if self.gc_sub_tag() == Some(GC_SUB_NATIVE) {
            self.gc_index().map(GcIdx::new)
        } else {
            None
        }
    }

    #[inline]
    fn from_thread(idx: GcIdx<LuaThread>) -> Self {
        TValue::from_gc_sub(GC_SUB_THREAD, idx.0)
    }

    #[inline]
    fn as_thread_idx(&self) -> Option<GcIdx<LuaThread>> {
        if self.gc_sub_tag() == Some(GC_SUB_THREAD) {
            self.gc_index().map(GcIdx::new)
        } else {
            None
        }
    }
}

/// All collectable objects except strings, which the interner owns.
#[derive(Default)]
pub struct GcHeap {
    pub tables: Arena<Table>,
    pub closures: Arena<LuaClosure>,
    pub natives: Arena<NativeFunction>,
    pub upvals: Arena<UpVal>,
    pub userdata: Arena<Userdata>,
    pub threads: Arena<LuaThread>,
    /// Shared metatables for non-table, non-userdata types, by `LuaType`.
    pub type_metatables: [Option<GcIdx<Table>>; 8],
    /// Live-object ceiling; allocation past it fails with "not enough memory".
    pub max_objects: Option<usize>,
}

impl GcHeap {
    pub fn new(max_objects: Option<usize>) -> Self {
        GcHeap {
            max_objects,
            ..GcHeap::default()
        }
    }

    /// Total number of live objects across all arenas.
    pub fn live_objects(&self) -> usize {
        self.tables.live()
            + self.closures.live()
            + self.natives.live()
            + self.upvals.live()
            + self.userdata.live()
            + self.threads.live()
    }

    fn check_limit(&self) -> Result<(), LuaError> {
        match self.max_objects {
            Some(max) if self.live_objects() >= max => Err(LuaError::Memory),
            _ => Ok(()),
        }
    }

    /// Size hints may come from bytecode; ones too large to honor raise a
    /// memory error.
    pub fn alloc_table(&mut self, narray: usize, nhash: usize) -> Result<GcIdx<Table>, LuaError> {
        self.check_limit()?;
        let table = Table::try_new(narray, nhash).map_err(|_| LuaError::Memory)?;
        Ok(self.tables.alloc(table))
    }

    pub fn alloc_closure(&mut self, closure: LuaClosure) -> Result<GcIdx<LuaClosure>, LuaError> {
        self.check_limit()?;
        Ok(self.closures.alloc(closure))
    }

    pub fn alloc_native(
        &mut self,
        native: NativeFunction,
    ) -> Result<GcIdx<NativeFunction>, LuaError> {
        self.check_limit()?;
        Ok(self.natives.alloc(native))
    }

    pub fn alloc_upval(&mut self, upval: UpVal) -> Result<GcIdx<UpVal>, LuaError> {
        self.check_limit()?;
        Ok(self.upvals.alloc(upval))
    }

    pub fn alloc_userdata(&mut self, ud: Userdata) -> Result<GcIdx<Userdata>, LuaError> {
        self.check_limit()?;
        Ok(self.userdata.alloc(ud))
    }

    pub fn alloc_thread(&mut self, thread: LuaThread) -> Result<GcIdx<LuaThread>, LuaError> {
        self.check_limit()?;
        Ok(self.threads.alloc(thread))
    }

    // Handles held by reachable values always point at live slots, so a
    // missing object here is a collector bug.

    #[inline]
    pub fn table(&self, idx: GcIdx<Table>) -> &Table {
        self.tables.get(idx).expect("dangling table handle")
    }

    #[inline]
    pub fn table_mut(&mut self, idx: GcIdx<Table>) -> &mut Table {
        self.tables.get_mut(idx).expect("dangling table handle")
    }

    #[inline]
    pub fn closure(&self, idx: GcIdx<LuaClosure>) -> &LuaClosure {
        self.closures.get(idx).expect("dangling closure handle")
    }

    #[inline]
    pub fn native(&self, idx: GcIdx<NativeFunction>) -> &NativeFunction {
        self.natives.get(idx).expect("dangling native handle")
    }

    #[inline]
    pub fn native_mut(&mut self, idx: GcIdx<NativeFunction>) -> &mut NativeFunction {
        self.natives.get_mut(idx).expect("dangling native handle")
    }

    #[inline]
    pub fn upval(&self, idx: GcIdx<UpVal>) -> &UpVal {
        self.upvals.get(idx).expect("dangling upvalue handle")
    }

    #[inline]
    pub fn upval_mut(&mut self, idx: GcIdx<UpVal>) -> &mut UpVal {
        self.upvals.get_mut(idx).expect("dangling upvalue handle")
    }

    #[inline]
    pub fn thread(&self, idx: GcIdx<LuaThread>) -> &LuaThread {
        self.threads.get(idx).expect("dangling thread handle")
    }

    #[inline]
    pub fn thread_mut(&mut self, idx: GcIdx<LuaThread>) -> &mut LuaThread {
        self.threads.get_mut(idx).expect("dangling thread handle")
    }

    /// Metatable of any value: its own for tables and full userdata,
    /// otherwise the shared one for its type.
    pub fn metatable_of(&self, v: TValue) -> Option<GcIdx<Table>> {
        if let Some(t) = v.as_table_idx() {
            self.table(t).metatable
        } else if let Some(u) = v.as_userdata_idx() {
            self.userdata.get(u).and_then(|ud| ud.metatable)
        } else {
            self.type_metatables[LuaType::of(v) as usize]
        }
    }
}
