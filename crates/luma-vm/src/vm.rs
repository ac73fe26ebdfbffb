//! Lua VM state.

use crate::callinfo::CallInfo;
use crate::error::LuaError;
use crate::heap::{GcHeap, LuaClosure, LuaThread, ThreadStatus, TValueExt};
use crate::hook::CountHook;
use crate::metamethod::MetamethodNames;
use luma_bytecode::chunk;
use luma_bytecode::proto::Proto;
use luma_core::gc::{GcIdx, UpVal, UpValLocation};
use luma_core::string::StringInterner;
use luma_core::table::Table;
use luma_core::value::TValue;
use std::io::Write;
use std::rc::Rc;

/// Maximum length of a chunk id, in bytes.
pub const IDSIZE: usize = 60;

/// Engine limits, fixed at construction.
#[derive(Clone, Debug)]
pub struct VmConfig {
    /// Max call frames per thread before "stack overflow".
    pub max_call_depth: usize,
    /// Max nested native boundaries before "C stack overflow".
    pub max_ccalls: usize,
    /// Max register stack slots per thread.
    pub max_stack_slots: usize,
    /// Initial register stack size.
    pub initial_stack: usize,
    /// Live heap object limit (`None` = unlimited).
    pub max_heap_objects: Option<usize>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 20000,
            max_ccalls: 200,
            max_stack_slots: 1_000_000,
            initial_stack: 64,
            max_heap_objects: None,
        }
    }
}

impl VmConfig {
    pub fn max_call_depth(mut self, n: usize) -> Self {
        self.max_call_depth = n;
        self
    }

    pub fn max_ccalls(mut self, n: usize) -> Self {
        self.max_ccalls = n;
        self
    }

    pub fn max_stack_slots(mut self, n: usize) -> Self {
        self.max_stack_slots = n;
        self
    }

    pub fn initial_stack(mut self, n: usize) -> Self {
        self.initial_stack = n;
        self
    }

    pub fn max_heap_objects(mut self, n: Option<usize>) -> Self {
        self.max_heap_objects = n;
        self
    }
}

/// Turns source text into a prototype. Hosts install one to load text chunks.
pub trait ChunkCompiler {
    fn compile(
        &mut self,
        source: &[u8],
        chunkname: &str,
        strings: &mut StringInterner,
    ) -> Result<Proto, String>;
}

/// The Lua virtual machine.
///
/// The `stack`, `call_stack`, `stack_top`, and `open_upvals` fields always
/// refer to the **currently running** thread. When a coroutine is resumed,
/// the caller's state is saved into its `LuaThread` record and the
/// coroutine's state is swapped in. On yield or return, the reverse swap happens.
pub struct Vm {
    /// Value stack (registers) of the running thread.
    pub stack: Vec<TValue>,
    /// Call stack (frames) of the running thread.
    pub call_stack: Vec<CallInfo>,
    /// Top of stack (index of first free slot) of the running thread.
    pub stack_top: usize,
    /// Open upvalues of the running thread, sorted by stack index (descending).
    pub open_upvals: Vec<(usize, GcIdx<UpVal>)>,
    /// Base of the stack window the host API addresses: the running native
    /// frame's base, or 0 at host level.
    pub api_base: usize,
    /// Nesting depth of native boundaries (calls made from Rust into the
    /// interpreter). Not reset by coroutine switches.
    pub n_ccalls: usize,
    /// `n_ccalls` at the point the running coroutine was resumed; a yield is
    /// legal only at exactly this depth.
    pub base_ccalls: usize,
    pub gc: GcHeap,
    pub strings: StringInterner,
    pub mm_names: MetamethodNames,
    pub globals: GcIdx<Table>,
    pub registry: GcIdx<Table>,
    pub main_thread: GcIdx<LuaThread>,
    pub current_thread: GcIdx<LuaThread>,
    pub config: VmConfig,
    pub(crate) hook: Option<CountHook>,
    pub(crate) compiler: Option<Box<dyn ChunkCompiler>>,
    pub(crate) output: Box<dyn Write>,
    /// Host-pinned values, kept alive by the collector.
    pub(crate) pinned: Vec<TValue>,
    /// Set by `collectgarbage("collect")`; honored when the outermost call returns.
    pub(crate) gc_requested: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let mut strings = StringInterner::new();
        let mm_names = MetamethodNames::init(&mut strings);
        let mut gc = GcHeap::new(config.max_heap_objects);
        // Bootstrap objects bypass the heap limit.
        let globals = gc.tables.alloc(Table::new(0, 32));
        let registry = gc.tables.alloc(Table::new(0, 4));
        let main_thread = gc
            .threads
            .alloc(LuaThread::new(Vec::new(), 0, ThreadStatus::Running));
        Vm {
            stack: vec![TValue::nil(); config.initial_stack.max(crate::call::MIN_STACK)],
            call_stack: Vec::new(),
            stack_top: 0,
            open_upvals: Vec::new(),
            api_base: 0,
            n_ccalls: 0,
            base_ccalls: 0,
            gc,
            strings,
            mm_names,
            globals,
            registry,
            main_thread,
            current_thread: main_thread,
            config,
            hook: None,
            compiler: None,
            output: Box::new(std::io::stdout()),
            pinned: Vec::new(),
            gc_requested: false,
        }
    }

    /// Install a compiler for text chunks.
    pub fn set_compiler(&mut self, compiler: Box<dyn ChunkCompiler>) {
        self.compiler = Some(compiler);
    }

    /// Redirect `print` output.
    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.output = out;
    }

    pub fn output(&mut self) -> &mut dyn Write {
        &mut *self.output
    }

    // ---- Strings ----

    /// Intern a byte string and return it as a value.
    pub fn intern(&mut self, bytes: &[u8]) -> TValue {
        TValue::from_string_id(self.strings.intern(bytes))
    }

    /// Bytes of a string value.
    pub fn str_bytes(&self, v: TValue) -> Option<&[u8]> {
        v.as_string_id().map(|id| self.strings.get_bytes(id))
    }

    // ---- Stack ----

    /// Make sure slots `0..n` exist on the running stack.
    pub fn ensure_stack(&mut self, n: usize) -> Result<(), LuaError> {
        if n > self.stack.len() {
            if n > self.config.max_stack_slots {
                return Err(LuaError::StackOverflow);
            }
            let new_len = n.max(self.stack.len() * 2).min(self.config.max_stack_slots);
            self.stack.resize(new_len, TValue::nil());
        }
        Ok(())
    }

    /// Push one value, growing the stack as needed.
    #[inline]
    pub fn push_value(&mut self, v: TValue) {
        if self.stack_top >= self.stack.len() {
            let new_len = (self.stack.len() * 2).max(crate::call::MIN_STACK);
            self.stack.resize(new_len, TValue::nil());
        }
        self.stack[self.stack_top] = v;
        self.stack_top += 1;
    }

    // ---- Upvalues ----

    /// Find or create the open upvalue aliasing `slot` of the running thread.
    pub fn find_upvalue(&mut self, slot: usize) -> Result<GcIdx<UpVal>, LuaError> {
        let mut pos = self.open_upvals.len();
        for (i, &(s, idx)) in self.open_upvals.iter().enumerate() {
            if s == slot {
                return Ok(idx);
            }
            if s < slot {
                pos = i;
                break;
            }
        }
        let uv = self.gc.alloc_upval(UpVal {
            location: UpValLocation::Open {
                thread: self.current_thread.0,
                slot,
            },
        })?;
        self.open_upvals.insert(pos, (slot, uv));
        Ok(uv)
    }

    /// Close every open upvalue at or above `level`: each takes its own copy
    /// of the slot's current value.
    pub fn close_upvalues(&mut self, level: usize) {
        let n = self
            .open_upvals
            .iter()
            .take_while(|&&(slot, _)| slot >= level)
            .count();
        for (slot, idx) in self.open_upvals.drain(..n) {
            let value = self.stack[slot];
            self.gc.upval_mut(idx).location = UpValLocation::Closed(value);
        }
    }

    /// Read an upvalue, open or closed.
    pub fn upval_get(&self, idx: GcIdx<UpVal>) -> TValue {
        match self.gc.upval(idx).location {
            UpValLocation::Closed(v) => v,
            UpValLocation::Open { thread, slot } => {
                if thread == self.current_thread.0 {
                    self.stack[slot]
                } else {
                    self.gc.thread(GcIdx::new(thread)).stack[slot]
                }
            }
        }
    }

    /// Write an upvalue, open or closed.
    pub fn upval_set(&mut self, idx: GcIdx<UpVal>, v: TValue) {
        match self.gc.upval(idx).location {
            UpValLocation::Closed(_) => {
                self.gc.upval_mut(idx).location = UpValLocation::Closed(v);
            }
            UpValLocation::Open { thread, slot } => {
                if thread == self.current_thread.0 {
                    self.stack[slot] = v;
                } else {
                    self.gc.thread_mut(GcIdx::new(thread)).stack[slot] = v;
                }
            }
        }
    }

    // ---- Errors ----

    /// Build a runtime error, prefixed with the position of the running
    /// frame when it is a Lua frame.
    pub fn runtime_error(&self, msg: &str) -> LuaError {
        match self.call_stack.last() {
            Some(ci) if ci.is_lua() => {
                let (source, line) = self.frame_position(ci);
                LuaError::Runtime(format!("{}:{}: {}", chunk_id(&source), line, msg))
            }
            _ => LuaError::Runtime(msg.to_string()),
        }
    }

    /// Position prefix `chunkid:line: ` for the Lua function `level` frames
    /// below the running one (0 = running), or "" when that frame is native
    /// or has no line information.
    pub fn where_(&self, level: usize) -> String {
        let n = self.call_stack.len();
        if level >= n {
            return String::new();
        }
        let ci = &self.call_stack[n - 1 - level];
        if !ci.is_lua() {
            return String::new();
        }
        let (source, line) = self.frame_position(ci);
        if line > 0 {
            format!("{}:{}: ", chunk_id(&source), line)
        } else {
            String::new()
        }
    }

    fn frame_position(&self, ci: &CallInfo) -> (String, u32) {
        match self.stack[ci.func].as_closure_idx() {
            Some(cl) => {
                let proto = &self.gc.closure(cl).proto;
                (proto.source.clone(), proto.get_line(ci.pc.saturating_sub(1)))
            }
            None => ("?".to_string(), 0),
        }
    }

    // ---- Loading ----

    /// Load a binary chunk, or source text through the installed compiler.
    /// Returns a closure whose environment is the globals table.
    pub fn load(&mut self, bytes: &[u8], chunkname: &str) -> Result<TValue, LuaError> {
        let proto = if chunk::is_binary_chunk(bytes) {
            chunk::undump(bytes, chunkname, &mut self.strings)
                .map_err(|e| LuaError::Syntax(format!("{}: {}", chunk_id(chunkname), e)))?
        } else {
            match self.compiler.as_mut() {
                Some(c) => c
                    .compile(bytes, chunkname, &mut self.strings)
                    .map_err(LuaError::Syntax)?,
                None => {
                    return Err(LuaError::Syntax(format!(
                        "{}: no compiler available for source chunks",
                        chunk_id(chunkname)
                    )))
                }
            }
        };
        self.load_proto(Rc::new(proto))
    }

    /// Wrap a prototype in a closure over the globals table. The prototype
    /// tree is verified first.
    pub fn load_proto(&mut self, proto: Rc<Proto>) -> Result<TValue, LuaError> {
        chunk::verify_tree(&proto).map_err(|e| {
            LuaError::Syntax(format!("{}: {}", chunk_id(&proto.source), e))
        })?;
        let mut upvalues = Vec::with_capacity(proto.num_upvalues as usize);
        for _ in 0..proto.num_upvalues {
            upvalues.push(self.gc.alloc_upval(UpVal {
                location: UpValLocation::Closed(TValue::nil()),
            })?);
        }
        log::debug!(
            "loaded chunk {} ({} instructions, {} functions)",
            chunk_id(&proto.source),
            proto.code.len(),
            proto.protos.len()
        );
        let cl = self.gc.alloc_closure(LuaClosure {
            proto,
            upvalues,
            env: self.globals,
        })?;
        Ok(TValue::from_closure(cl))
    }

    /// Serialize a Lua closure's prototype as a binary chunk.
    pub fn dump(&self, f: TValue, strip: bool) -> Result<Vec<u8>, LuaError> {
        let cl = f
            .as_closure_idx()
            .ok_or_else(|| LuaError::Runtime("unable to dump given function".to_string()))?;
        Ok(chunk::dump(&self.gc.closure(cl).proto, &self.strings, strip))
    }
}

/// Printable chunk name for messages: `=name` verbatim, `@file` with long
/// paths cut from the left, source text as `[string "first line..."]`.
pub fn chunk_id(source: &str) -> String {
    if let Some(name) = source.strip_prefix('=') {
        return truncate_bytes(name, IDSIZE - 1).to_string();
    }
    if let Some(file) = source.strip_prefix('@') {
        let max = IDSIZE - " '...' ".len() - 1;
        if file.len() > max {
            let mut start = file.len() - max;
            while !file.is_char_boundary(start) {
                start += 1;
            }
            return format!("...{}", &file[start..]);
        }
        return file.to_string();
    }
    let max = IDSIZE - " [string \"...\"] ".len() - 1;
    let line_end = source.find(['\n', '\r']).unwrap_or(source.len());
    let len = line_end.min(max);
    if len < source.len() {
        format!("[string \"{}...\"]", truncate_bytes(source, len))
    } else {
        format!("[string \"{source}\"]")
    }
}

fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
