//! Call frame information for the VM.

/// Wanted-results value meaning "all results".
pub const MULTRET: i32 = -1;

// Flags for CallInfo boolean fields
const FLAG_IS_LUA: u8 = 1;

/// A call frame on the VM call stack.
#[derive(Clone, Debug)]
pub struct CallInfo {
    /// Stack position of the function value; results are placed from here.
    pub func: usize,
    /// Stack base for registers (Lua) or arguments (native) in this frame.
    pub base: usize,
    /// Lua: `base + max_stack_size`. Native: stack top at entry plus headroom.
    pub top: usize,
    /// Program counter (index into proto.code) of the next instruction.
    pub pc: usize,
    /// Expected number of results (`MULTRET` = all).
    pub num_results: i32,
    /// Tail calls collapsed into this frame.
    pub tail_count: u32,
    flags: u8,
}

impl CallInfo {
    pub fn new_lua(func: usize, base: usize, top: usize, num_results: i32) -> Self {
        CallInfo {
            func,
            base,
            top,
            pc: 0,
            num_results,
            tail_count: 0,
            flags: FLAG_IS_LUA,
        }
    }

    pub fn new_native(func: usize, top: usize, num_results: i32) -> Self {
        CallInfo {
            func,
            base: func + 1,
            top,
            pc: 0,
            num_results,
            tail_count: 0,
            flags: 0,
        }
    }

    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        self.flags & FLAG_IS_LUA != 0
    }
}
