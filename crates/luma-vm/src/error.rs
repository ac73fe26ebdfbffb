//! Lua runtime error types and status codes.

use crate::vm::Vm;
use luma_core::object::lua_type_name;
use luma_core::value::TValue;
use thiserror::Error;

/// Result codes of protected calls and resumes, numbered as in the C API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Yield = 1,
    ErrRun = 2,
    ErrSyntax = 3,
    ErrMem = 4,
    ErrErr = 5,
}

/// A Lua error, or the yield signal travelling up to `resume`.
#[derive(Clone, Debug, Error)]
pub enum LuaError {
    /// Runtime error; the message already carries its position prefix.
    #[error("{0}")]
    Runtime(String),
    /// An arbitrary error object raised by `error`.
    #[error("error object is a {} value", lua_type_name(*.0))]
    Value(TValue),
    #[error("{0}")]
    Syntax(String),
    #[error("not enough memory")]
    Memory,
    /// The error handler of a protected call failed.
    #[error("error in error handling")]
    ErrorHandler,
    /// Not an error: the running coroutine yields the top `n` stack values.
    #[error("attempt to yield {0} values outside a resume")]
    Yield(usize),
    #[error("stack overflow")]
    StackOverflow,
    #[error("C stack overflow")]
    CStackOverflow,
}

impl LuaError {
    pub fn status(&self) -> Status {
        match self {
            LuaError::Runtime(_)
            | LuaError::Value(_)
            | LuaError::StackOverflow
            | LuaError::CStackOverflow => Status::ErrRun,
            LuaError::Syntax(_) => Status::ErrSyntax,
            LuaError::Memory => Status::ErrMem,
            LuaError::ErrorHandler => Status::ErrErr,
            LuaError::Yield(_) => Status::Yield,
        }
    }

    /// The error object a protected caller sees.
    pub fn into_value(self, vm: &mut Vm) -> TValue {
        match self {
            LuaError::Value(v) => v,
            other => {
                let msg = other.to_string();
                vm.intern(msg.as_bytes())
            }
        }
    }
}
