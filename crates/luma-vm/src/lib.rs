//! Luma virtual machine: Lua 5.1 bytecode interpreter, coroutines and the
//! host embedding API.

pub mod api;
pub mod arith;
pub mod call;
pub mod callinfo;
pub mod coerce;
pub mod collect;
pub mod compare;
pub mod concat;
pub mod coroutine;
pub mod dispatch;
pub mod error;
pub mod heap;
pub mod hook;
pub mod metamethod;
pub mod vm;

pub use api::{upvalue_index, ENVIRON_INDEX, GLOBALS_INDEX, REGISTRY_INDEX};
pub use call::call_function;
pub use callinfo::MULTRET;
pub use error::{LuaError, Status};
pub use heap::{NativeFn, TValueExt};
pub use hook::{HookAction, HookFn};
pub use vm::{chunk_id, ChunkCompiler, Vm, VmConfig};

use luma_core::value::TValue;

/// Load a chunk (binary, or text through the installed compiler) and run it,
/// returning its results.
pub fn execute_chunk(vm: &mut Vm, bytes: &[u8], chunkname: &str) -> Result<Vec<TValue>, LuaError> {
    let f = vm.load(bytes, chunkname)?;
    vm.call_value(f, &[])
}
