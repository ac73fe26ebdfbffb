//! Luma standard library: the Lua 5.1 base and coroutine libraries.

pub mod base_lib;
pub mod coroutine_lib;

use luma_vm::error::LuaError;
use luma_vm::Vm;

/// Register all standard library functions into the globals table.
pub fn open_libs(vm: &mut Vm) -> Result<(), LuaError> {
    base_lib::open_base(vm)?;
    coroutine_lib::open_coroutine(vm)?;
    log::debug!("opened base and coroutine libraries");
    Ok(())
}
