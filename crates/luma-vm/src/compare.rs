//! Primitive comparisons. Metamethod fallbacks live in the dispatch loop.

use luma_core::object::LuaType;
use luma_core::string::StringInterner;
use luma_core::value::TValue;

/// Result of comparison that may need metamethod.
pub enum CompareResult {
    Ok(bool),
    NeedMetamethod,
}

/// Primitive equality for values of the same type. Returns `None` when both
/// are distinct tables or distinct full userdata, where `__eq` may apply.
pub fn lua_eq(a: TValue, b: TValue) -> Option<bool> {
    if a == b {
        return Some(true);
    }
    let same_kind = (a.is_table() && b.is_table())
        || (a.as_userdata_idx().is_some() && b.as_userdata_idx().is_some());
    if same_kind {
        None
    } else {
        Some(false)
    }
}

/// Numbers compare numerically, strings bytewise.
pub fn lua_lt(a: TValue, b: TValue, strings: &StringInterner) -> CompareResult {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return CompareResult::Ok(x < y);
    }
    if let (Some(x), Some(y)) = (a.as_string_id(), b.as_string_id()) {
        return CompareResult::Ok(strings.get_bytes(x) < strings.get_bytes(y));
    }
    CompareResult::NeedMetamethod
}

pub fn lua_le(a: TValue, b: TValue, strings: &StringInterner) -> CompareResult {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return CompareResult::Ok(x <= y);
    }
    if let (Some(x), Some(y)) = (a.as_string_id(), b.as_string_id()) {
        return CompareResult::Ok(strings.get_bytes(x) <= strings.get_bytes(y));
    }
    CompareResult::NeedMetamethod
}

/// Message for an ordering between values with no primitive order and no handler.
pub fn order_error_message(a: TValue, b: TValue) -> String {
    let t1 = LuaType::of(a).name();
    let t2 = LuaType::of(b).name();
    if t1 == t2 {
        format!("attempt to compare two {t1} values")
    } else {
        format!("attempt to compare {t1} with {t2}")
    }
}
