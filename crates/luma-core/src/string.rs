//! The string store. Every string is interned by content, so two strings
//! are equal exactly when their `StringId`s are.
use std::collections::HashMap;
use std::fmt;

/// An opaque handle to a string in the interner.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StringId(pub u32);

/// An immutable byte string and its hash, computed once at interning.
#[derive(Clone)]
pub struct TString {
    bytes: Box<[u8]>,
    hash: u32,
}

impl TString {
    fn new(bytes: &[u8]) -> Self {
        TString {
            hash: lua_hash(bytes),
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }
}

impl fmt::Debug for TString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(s) = std::str::from_utf8(self.as_bytes()) {
            write!(f, "\"{}\"", s)
        } else {
            write!(f, "<binary string len={}>", self.len())
        }
    }
}

/// PUC Lua 5.1 string hash (luaS_newlstr), seeded with the length.
pub fn lua_hash(bytes: &[u8]) -> u32 {
    let len = bytes.len();
    let mut h = len as u32;
    // Long strings only hash a sample of their bytes.
    let step = (len >> 5) + 1;
    let mut i = len;
    while i >= step {
        h ^= (h << 5).wrapping_add(h >> 2).wrapping_add(bytes[i - 1] as u32);
        i -= step;
    }
    h
}

/// String interner: owns all strings and deduplicates them by content.
#[derive(Debug, Default)]
pub struct StringInterner {
    strings: Vec<TString>,
    /// hash → ids with that hash.
    lookup: HashMap<u32, Vec<u32>>,
}

impl StringInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a byte string. Returns the existing id if the content is known.
    pub fn intern(&mut self, bytes: &[u8]) -> StringId {
        let hash = lua_hash(bytes);
        if let Some(ids) = self.lookup.get(&hash) {
            for &id in ids {
                if self.strings[id as usize].as_bytes() == bytes {
                    return StringId(id);
                }
            }
        }
        let id = self.strings.len() as u32;
        self.strings.push(TString::new(bytes));
        self.lookup.entry(hash).or_default().push(id);
        StringId(id)
    }

    /// Look up a string without interning it.
    pub fn find(&self, bytes: &[u8]) -> Option<StringId> {
        let ids = self.lookup.get(&lua_hash(bytes))?;
        ids.iter()
            .copied()
            .find(|&id| self.strings[id as usize].as_bytes() == bytes)
            .map(StringId)
    }

    pub fn get(&self, id: StringId) -> &TString {
        &self.strings[id.0 as usize]
    }

    pub fn get_bytes(&self, id: StringId) -> &[u8] {
        self.strings[id.0 as usize].as_bytes()
    }

    /// Lossy UTF-8 view, for messages.
    pub fn get_str_lossy(&self, id: StringId) -> String {
        String::from_utf8_lossy(self.get_bytes(id)).into_owned()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}
