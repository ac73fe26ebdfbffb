//! Type names for values, by tag.

use crate::gc::*;
use crate::value::TValue;

/// The Lua type of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LuaType {
    Nil,
    Boolean,
    Number,
    String,
    Table,
    Function,
    Userdata,
    Thread,
}

impl LuaType {
    pub fn of(val: TValue) -> LuaType {
        if val.is_nil() {
            LuaType::Nil
        } else if val.is_bool() {
            LuaType::Boolean
        } else if val.is_number() {
            LuaType::Number
        } else if val.is_light_userdata() {
            LuaType::Userdata
        } else {
            match val.gc_sub_tag() {
                Some(GC_SUB_TABLE) => LuaType::Table,
                Some(GC_SUB_CLOSURE) | Some(GC_SUB_NATIVE) => LuaType::Function,
                Some(GC_SUB_STRING) => LuaType::String,
                Some(GC_SUB_THREAD) => LuaType::Thread,
                _ => LuaType::Userdata,
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LuaType::Nil => "nil",
            LuaType::Boolean => "boolean",
            LuaType::Number => "number",
            LuaType::String => "string",
            LuaType::Table => "table",
            LuaType::Function => "function",
            LuaType::Userdata => "userdata",
            LuaType::Thread => "thread",
        }
    }
}

/// Get the Lua type name for a TValue.
pub fn lua_type_name(val: TValue) -> &'static str {
    LuaType::of(val).name()
}
