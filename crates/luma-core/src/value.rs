/// NaN-boxed Lua value representation.
///
/// Layout (64 bits):
/// - Pure f64: any non-NaN double (quiet NaN canonicalized to QNAN)
/// - Tagged values: QNAN prefix (0x7FF8) | tag (3 bits, 48-50) | payload (47 bits)
///
/// Tags (bits 50-48):
///   000 = canonical NaN (no payload)
///   001 = nil
///   010 = bool
///   100 = GC handle (sub-tag + arena index)
///   101 = light userdata
///
/// Numbers are doubles only; there is no integer subtype.
use crate::gc::*;
use crate::string::StringId;
use crate::table::Table;
use std::fmt;
use std::marker::PhantomData;

/// Quiet NaN prefix: exponent all 1s + quiet bit set
const QNAN: u64 = 0x7FF8_0000_0000_0000;

/// Tag mask: 3 bits at positions 48-50
const TAG_MASK: u64 = 0x0007_0000_0000_0000;
/// Payload mask: lower 47 bits
const PAYLOAD_MASK: u64 = 0x0000_7FFF_FFFF_FFFF;

const TAG_NIL: u64 = 0x0001_0000_0000_0000;
const TAG_BOOL: u64 = 0x0002_0000_0000_0000;
const TAG_GC: u64 = 0x0004_0000_0000_0000;
const TAG_LIGHT: u64 = 0x0005_0000_0000_0000;

/// A NaN-boxed Lua value packed into 8 bytes.
#[derive(Clone, Copy)]
pub struct TValue(u64);

impl TValue {
    // ---- Constructors ----

    #[inline]
    pub fn nil() -> Self {
        TValue(QNAN | TAG_NIL)
    }

    #[inline]
    pub fn from_bool(b: bool) -> Self {
        TValue(QNAN | TAG_BOOL | (b as u64))
    }

    /// Create a number value. NaN inputs are canonicalized.
    #[inline]
    pub fn from_number(f: f64) -> Self {
        if f.is_nan() {
            TValue(QNAN)
        } else {
            TValue(f.to_bits())
        }
    }

    /// Create a light userdata value.
    ///
    /// # Panics
    /// Panics if the pointer uses more than 47 bits.
    #[inline]
    pub fn from_light_userdata(ptr: usize) -> Self {
        let ptr64 = ptr as u64;
        assert!(
            ptr64 & !PAYLOAD_MASK == 0,
            "light userdata pointer exceeds 47-bit address space"
        );
        TValue(QNAN | TAG_LIGHT | ptr64)
    }

    // ---- Type checks ----

    /// Returns true if this is a NaN-boxed tagged value (not a plain number).
    #[inline]
    fn is_tagged(&self) -> bool {
        (self.0 & QNAN) == QNAN
    }

    #[inline]
    fn tag(&self) -> u64 {
        self.0 & TAG_MASK
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        self.is_tagged() && self.tag() == TAG_NIL
    }

    #[inline]
    pub fn is_bool(&self) -> bool {
        self.is_tagged() && self.tag() == TAG_BOOL
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        !self.is_tagged() || self.tag() == 0
    }

    #[inline]
    pub fn is_gc(&self) -> bool {
        self.is_tagged() && self.tag() == TAG_GC
    }

    #[inline]
    pub fn is_light_userdata(&self) -> bool {
        self.is_tagged() && self.tag() == TAG_LIGHT
    }

    // ---- Extractors ----

    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        if !self.is_tagged() {
            Some(f64::from_bits(self.0))
        } else if self.tag() == 0 {
            Some(f64::NAN)
        } else {
            None
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        if self.is_bool() {
            Some((self.0 & 1) != 0)
        } else {
            None
        }
    }

    #[inline]
    pub fn as_light_userdata(&self) -> Option<usize> {
        if self.is_light_userdata() {
            Some((self.0 & PAYLOAD_MASK) as usize)
        } else {
            None
        }
    }

    // ---- GC sub-tag helpers ----

    /// Create a GC value with a sub-tag and index.
    #[inline]
    pub fn from_gc_sub(sub_tag: u64, index: u32) -> Self {
        let payload = (sub_tag << GC_SUB_SHIFT) | (index as u64);
        debug_assert!(payload & !PAYLOAD_MASK == 0);
        TValue(QNAN | TAG_GC | payload)
    }

    /// Extract the GC sub-tag (bits 44-46 of payload).
    #[inline]
    pub fn gc_sub_tag(&self) -> Option<u64> {
        if self.is_gc() {
            Some(((self.0 & PAYLOAD_MASK) >> GC_SUB_SHIFT) & GC_SUB_MASK)
        } else {
            None
        }
    }

    /// Extract the arena index (bits 0-43 of payload).
    #[inline]
    pub fn gc_index(&self) -> Option<u32> {
        if self.is_gc() {
            Some(((self.0 & PAYLOAD_MASK) & GC_INDEX_MASK) as u32)
        } else {
            None
        }
    }

    #[inline]
    fn sub_index(&self, sub: u64) -> Option<u32> {
        if self.gc_sub_tag() == Some(sub) {
            self.gc_index()
        } else {
            None
        }
    }

    #[inline]
    pub fn from_string_id(id: StringId) -> Self {
        Self::from_gc_sub(GC_SUB_STRING, id.0)
    }

    #[inline]
    pub fn as_string_id(&self) -> Option<StringId> {
        self.sub_index(GC_SUB_STRING).map(StringId)
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        self.gc_sub_tag() == Some(GC_SUB_STRING)
    }

    #[inline]
    pub fn from_table(idx: GcIdx<Table>) -> Self {
        Self::from_gc_sub(GC_SUB_TABLE, idx.0)
    }

    #[inline]
    pub fn as_table_idx(&self) -> Option<GcIdx<Table>> {
        self.sub_index(GC_SUB_TABLE).map(|i| GcIdx(i, PhantomData))
    }

    #[inline]
    pub fn is_table(&self) -> bool {
        self.gc_sub_tag() == Some(GC_SUB_TABLE)
    }

    #[inline]
    pub fn from_userdata(idx: GcIdx<Userdata>) -> Self {
        Self::from_gc_sub(GC_SUB_USERDATA, idx.0)
    }

    #[inline]
    pub fn as_userdata_idx(&self) -> Option<GcIdx<Userdata>> {
        self.sub_index(GC_SUB_USERDATA).map(|i| GcIdx(i, PhantomData))
    }

    /// Returns true if this is any kind of function (closure or native).
    #[inline]
    pub fn is_function(&self) -> bool {
        matches!(
            self.gc_sub_tag(),
            Some(GC_SUB_CLOSURE) | Some(GC_SUB_NATIVE)
        )
    }

    // ---- Lua semantics ----

    /// Lua falsy: only nil and false are falsy.
    #[inline]
    pub fn is_falsy(&self) -> bool {
        self.is_nil() || self.as_bool() == Some(false)
    }

    #[inline]
    pub fn is_truthy(&self) -> bool {
        !self.is_falsy()
    }

    /// Primitive equality without metamethods (`rawequal`).
    ///
    /// Strings are interned by content, so handle identity is content equality.
    #[inline]
    pub fn raw_equal(&self, other: &TValue) -> bool {
        self == other
    }

    /// Get the raw bits for hashing and debugging.
    #[inline]
    pub fn raw_bits(&self) -> u64 {
        self.0
    }

    /// Create a TValue from raw bits (for reconstructing from stored bits).
    #[inline]
    pub fn from_raw_bits(bits: u64) -> Self {
        TValue(bits)
    }
}

impl Default for TValue {
    fn default() -> Self {
        TValue::nil()
    }
}

impl From<bool> for TValue {
    fn from(b: bool) -> Self {
        TValue::from_bool(b)
    }
}

impl From<f64> for TValue {
    fn from(f: f64) -> Self {
        TValue::from_number(f)
    }
}

impl fmt::Debug for TValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "nil")
        } else if let Some(b) = self.as_bool() {
            write!(f, "{b}")
        } else if let Some(n) = self.as_number() {
            write!(f, "{n}")
        } else if self.is_gc() {
            let idx = self.gc_index().unwrap_or(0);
            match self.gc_sub_tag() {
                Some(GC_SUB_STRING) => write!(f, "string(#{idx})"),
                Some(GC_SUB_TABLE) => write!(f, "table(#{idx})"),
                Some(GC_SUB_CLOSURE) => write!(f, "closure(#{idx})"),
                Some(GC_SUB_NATIVE) => write!(f, "native(#{idx})"),
                Some(GC_SUB_USERDATA) => write!(f, "userdata(#{idx})"),
                Some(GC_SUB_THREAD) => write!(f, "thread(#{idx})"),
                _ => write!(f, "gc({:#x})", self.0 & PAYLOAD_MASK),
            }
        } else if self.is_light_userdata() {
            write!(f, "lightuserdata({:#x})", self.0 & PAYLOAD_MASK)
        } else {
            write!(f, "unknown({:#018x})", self.0)
        }
    }
}

impl PartialEq for TValue {
    fn eq(&self, other: &Self) -> bool {
        // Bit equality works for every tagged type; numbers need IEEE semantics
        // (NaN ~= NaN, 0 == -0).
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.0 == other.0,
            _ => false,
        }
    }
}
