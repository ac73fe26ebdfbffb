//! Metamethod lookup.

use crate::heap::GcHeap;
use luma_core::string::{StringId, StringInterner};
use luma_core::table::Table;
use luma_core::gc::GcIdx;
use luma_core::value::TValue;

/// Pre-interned metamethod name StringIds for fast lookup.
pub struct MetamethodNames {
    pub index: StringId,
    pub newindex: StringId,
    pub eq: StringId,
    pub add: StringId,
    pub sub: StringId,
    pub mul: StringId,
    pub div: StringId,
    pub mod_: StringId,
    pub pow: StringId,
    pub unm: StringId,
    pub len: StringId,
    pub lt: StringId,
    pub le: StringId,
    pub concat: StringId,
    pub call: StringId,
    pub tostring: StringId,
    /// `__metatable`: protects a metatable from `getmetatable`/`setmetatable`.
    pub metatable: StringId,
}

impl MetamethodNames {
    pub fn init(strings: &mut StringInterner) -> Self {
        MetamethodNames {
            index: strings.intern(b"__index"),
            newindex: strings.intern(b"__newindex"),
            eq: strings.intern(b"__eq"),
            add: strings.intern(b"__add"),
            sub: strings.intern(b"__sub"),
            mul: strings.intern(b"__mul"),
            div: strings.intern(b"__div"),
            mod_: strings.intern(b"__mod"),
            pow: strings.intern(b"__pow"),
            unm: strings.intern(b"__unm"),
            len: strings.intern(b"__len"),
            lt: strings.intern(b"__lt"),
            le: strings.intern(b"__le"),
            concat: strings.intern(b"__concat"),
            call: strings.intern(b"__call"),
            tostring: strings.intern(b"__tostring"),
            metatable: strings.intern(b"__metatable"),
        }
    }
}

/// Look up a handler in a metatable. Absent and nil entries both give None.
#[inline]
pub fn fast_tm(mt: Option<GcIdx<Table>>, name: StringId, gc: &GcHeap) -> Option<TValue> {
    let v = gc.table(mt?).raw_get_str(name);
    if v.is_nil() {
        None
    } else {
        Some(v)
    }
}

/// Look up a metamethod on any value: tables and full userdata use their own
/// metatable, other types the shared per-type one.
pub fn get_metamethod(val: TValue, name: StringId, gc: &GcHeap) -> Option<TValue> {
    fast_tm(gc.metatable_of(val), name, gc)
}

/// The handler shared by two metatables, for `__eq`: the same metatable, or
/// two metatables whose handlers are raw-equal.
pub fn get_comp_tm(
    mt1: Option<GcIdx<Table>>,
    mt2: Option<GcIdx<Table>>,
    name: StringId,
    gc: &GcHeap,
) -> Option<TValue> {
    let tm1 = fast_tm(mt1, name, gc)?;
    if mt1 == mt2 {
        return Some(tm1);
    }
    let tm2 = fast_tm(mt2, name, gc)?;
    if tm1.raw_equal(&tm2) {
        Some(tm1)
    } else {
        None
    }
}
