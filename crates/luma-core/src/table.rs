//! Hybrid array+hash table for Lua.
//!
//! The array part holds keys `1..=array.len()`; its size is chosen on rehash as
//! the largest power of two `n` such that more than `n/2` of the integer keys
//! `1..=n` are present. Every other key lives in the insertion-ordered hash
//! part. Deleting a hash key leaves a nil tombstone so a `next` traversal in
//! progress can continue from it; tombstones are dropped on the next rehash.

use crate::gc::GcIdx;
use crate::string::StringId;
use crate::value::TValue;
use indexmap::IndexMap;
use thiserror::Error;

/// Largest power of two considered for the array part.
const MAXBITS: usize = 26;
const MAXASIZE: usize = 1 << MAXBITS;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("table index is nil")]
    NilIndex,
    #[error("table index is NaN")]
    NaNIndex,
    #[error("invalid key to 'next'")]
    InvalidNextKey,
    #[error("table overflow")]
    TooBig,
}

/// A key in the hash part of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    /// Number key stored as bits, with -0.0 folded into 0.0.
    Number(u64),
    String(StringId),
    Boolean(bool),
    /// Any other reference value, by identity (raw TValue bits).
    Ref(u64),
}

impl TableKey {
    /// Convert a value to a hash key. Nil and NaN have no key.
    pub fn from_value(v: TValue) -> Result<TableKey, TableError> {
        if v.is_nil() {
            return Err(TableError::NilIndex);
        }
        if let Some(n) = v.as_number() {
            if n.is_nan() {
                return Err(TableError::NaNIndex);
            }
            return Ok(Self::number(n));
        }
        if let Some(b) = v.as_bool() {
            return Ok(TableKey::Boolean(b));
        }
        if let Some(sid) = v.as_string_id() {
            return Ok(TableKey::String(sid));
        }
        Ok(TableKey::Ref(v.raw_bits()))
    }

    #[inline]
    pub fn number(n: f64) -> TableKey {
        let n = if n == 0.0 { 0.0 } else { n };
        TableKey::Number(n.to_bits())
    }

    pub fn to_value(self) -> TValue {
        match self {
            TableKey::Number(bits) => TValue::from_number(f64::from_bits(bits)),
            TableKey::String(sid) => TValue::from_string_id(sid),
            TableKey::Boolean(b) => TValue::from_bool(b),
            TableKey::Ref(bits) => TValue::from_raw_bits(bits),
        }
    }
}

/// If `n` is an integral value usable as an array index, return it.
#[inline]
fn array_index(n: f64) -> Option<usize> {
    if n >= 1.0 && n <= MAXASIZE as f64 && n.fract() == 0.0 {
        Some(n as usize)
    } else {
        None
    }
}

/// `ceil(log2(x))` for `x >= 1`.
#[inline]
fn ceil_log2(x: usize) -> usize {
    debug_assert!(x >= 1);
    (usize::BITS - (x - 1).leading_zeros()) as usize
}

/// A Lua table: hybrid array + hash map.
pub struct Table {
    array: Vec<TValue>,
    hash: IndexMap<TableKey, TValue>,
    /// Inserting a new hash key while `hash.len() >= hash_limit` triggers a rehash.
    hash_limit: usize,
    in_rehash: bool,
    pub metatable: Option<GcIdx<Table>>,
}

impl Table {
    /// Create a new empty table with preallocated parts.
    pub fn new(narray: usize, nhash: usize) -> Self {
        Table {
            array: vec![TValue::nil(); narray],
            hash: IndexMap::with_capacity(nhash),
            hash_limit: nhash,
            in_rehash: false,
            metatable: None,
        }
    }

    /// `new` for sizes read from untrusted code: fails instead of aborting
    /// when a part is larger than `MAXASIZE` or cannot be allocated.
    pub fn try_new(narray: usize, nhash: usize) -> Result<Self, TableError> {
        if narray > MAXASIZE || nhash > MAXASIZE {
            return Err(TableError::TooBig);
        }
        let mut array = Vec::new();
        array
            .try_reserve_exact(narray)
            .map_err(|_| TableError::TooBig)?;
        array.resize(narray, TValue::nil());
        let mut hash = IndexMap::new();
        hash.try_reserve(nhash).map_err(|_| TableError::TooBig)?;
        Ok(Table {
            array,
            hash,
            hash_limit: nhash,
            in_rehash: false,
            metatable: None,
        })
    }

    /// Raw get by TValue key. Absent keys (and nil/NaN) yield nil.
    pub fn raw_get(&self, key: TValue) -> TValue {
        if let Some(n) = key.as_number() {
            return self.get_num(n);
        }
        match TableKey::from_value(key) {
            Ok(tk) => self.hash.get(&tk).copied().unwrap_or_default(),
            Err(_) => TValue::nil(),
        }
    }

    #[inline]
    fn get_num(&self, n: f64) -> TValue {
        if let Some(i) = array_index(n) {
            if i <= self.array.len() {
                return self.array[i - 1];
            }
        }
        if n.is_nan() {
            return TValue::nil();
        }
        self.hash
            .get(&TableKey::number(n))
            .copied()
            .unwrap_or_default()
    }

    /// Fast integer get (1-indexed).
    #[inline]
    pub fn raw_get_int(&self, key: i64) -> TValue {
        if key >= 1 && (key as usize) <= self.array.len() {
            self.array[(key - 1) as usize]
        } else {
            self.get_num(key as f64)
        }
    }

    /// Fast string key get.
    #[inline]
    pub fn raw_get_str(&self, key: StringId) -> TValue {
        self.hash
            .get(&TableKey::String(key))
            .copied()
            .unwrap_or_default()
    }

    /// Raw set by TValue key. Assigning nil deletes.
    pub fn raw_set(&mut self, key: TValue, value: TValue) -> Result<(), TableError> {
        if let Some(n) = key.as_number() {
            if let Some(i) = array_index(n) {
                if i <= self.array.len() {
                    self.array[i - 1] = value;
                    return Ok(());
                }
            }
        }
        let tk = TableKey::from_value(key)?;
        self.set_hash(tk, value);
        Ok(())
    }

    /// Fast integer set (1-indexed).
    pub fn raw_set_int(&mut self, key: i64, value: TValue) {
        if key >= 1 && (key as usize) <= self.array.len() {
            self.array[(key - 1) as usize] = value;
            return;
        }
        self.set_hash(TableKey::number(key as f64), value);
    }

    /// Fast string key set.
    pub fn raw_set_str(&mut self, key: StringId, value: TValue) {
        self.set_hash(TableKey::String(key), value);
    }

    fn set_hash(&mut self, tk: TableKey, value: TValue) {
        if let Some(slot) = self.hash.get_mut(&tk) {
            // Existing key (live or tombstone): update in place, keeping order.
            *slot = value;
            return;
        }
        if value.is_nil() {
            return;
        }
        if self.hash.len() >= self.hash_limit && !self.in_rehash {
            self.rehash(tk);
            // The new key may now belong to the array part.
            if let TableKey::Number(bits) = tk {
                if let Some(i) = array_index(f64::from_bits(bits)) {
                    if i <= self.array.len() {
                        self.array[i - 1] = value;
                        return;
                    }
                }
            }
        }
        self.hash.insert(tk, value);
    }

    /// Count non-nil array slots into `nums` by `ceil(log2(k))` bucket.
    fn num_use_array(&self, nums: &mut [usize; MAXBITS + 1]) -> usize {
        let mut ause = 0;
        let mut i = 1usize;
        let mut ttlg = 1usize;
        for num in nums.iter_mut() {
            let lim = ttlg.min(self.array.len());
            if i > lim {
                break;
            }
            // Slice (2^(lg-1), 2^lg]
            let lc = self.array[i - 1..lim].iter().filter(|v| !v.is_nil()).count();
            i = lim + 1;
            *num += lc;
            ause += lc;
            ttlg *= 2;
        }
        ause
    }

    /// Count integer keys of the hash part (live only). Returns (total live, integer keys).
    fn num_use_hash(&self, nums: &mut [usize; MAXBITS + 1]) -> (usize, usize) {
        let mut total = 0;
        let mut ause = 0;
        for (k, v) in &self.hash {
            if v.is_nil() {
                continue;
            }
            total += 1;
            ause += count_int(*k, nums);
        }
        (total, ause)
    }

    /// Choose the array size: the largest power of two `n` with more than
    /// `n/2` integer keys in `1..=n`. Returns (size, keys that go to the array).
    fn compute_sizes(nums: &[usize; MAXBITS + 1], total_int: usize) -> (usize, usize) {
        let mut a = 0;
        let mut na = 0;
        let mut n = 0;
        let mut twotoi = 1usize;
        for num in nums.iter() {
            if twotoi / 2 >= total_int {
                break;
            }
            if *num > 0 {
                a += num;
                if a > twotoi / 2 {
                    n = twotoi;
                    na = a;
                }
            }
            if a == total_int {
                break;
            }
            twotoi *= 2;
        }
        debug_assert!(n / 2 <= na && na <= n);
        (n, na)
    }

    /// Resize both parts so that `extra` (about to be inserted) is accounted for.
    fn rehash(&mut self, extra: TableKey) {
        self.in_rehash = true;
        let mut nums = [0usize; MAXBITS + 1];
        let mut total_int = self.num_use_array(&mut nums);
        let (hash_total, hash_int) = self.num_use_hash(&mut nums);
        total_int += hash_int;
        total_int += count_int(extra, &mut nums);
        let (asize, na) = Self::compute_sizes(&nums, total_int);
        self.resize_array(asize);
        self.hash.retain(|_, v| !v.is_nil());
        // Live hash keys after the move, plus the pending key if it stays in the hash.
        let array_total = self.array.iter().filter(|v| !v.is_nil()).count();
        let remaining = (hash_total + array_total + 1).saturating_sub(na);
        self.hash_limit = remaining.max(1).next_power_of_two();
        self.in_rehash = false;
    }

    /// Grow or shrink the array part, migrating keys across parts.
    fn resize_array(&mut self, nasize: usize) {
        let old = self.array.len();
        if nasize > old {
            self.array.reserve(nasize - old);
            for i in old..nasize {
                let k = TableKey::number((i + 1) as f64);
                let v = self.hash.shift_remove(&k).unwrap_or_default();
                self.array.push(v);
            }
        } else if nasize < old {
            for i in nasize..old {
                let v = self.array[i];
                if !v.is_nil() {
                    self.hash.insert(TableKey::number((i + 1) as f64), v);
                }
            }
            self.array.truncate(nasize);
        }
    }

    /// The length operator: some border of the table.
    ///
    /// A border is any `n` with `t[n] ~= nil` and `t[n+1] == nil` (or 0 when
    /// `t[1]` is nil). When the table has holes, which border is returned is
    /// unspecified.
    pub fn length(&self) -> usize {
        let mut j = self.array.len();
        if j > 0 && self.array[j - 1].is_nil() {
            // There is a border in the array part: binary search for it.
            let mut i = 0;
            while j - i > 1 {
                let m = (i + j) / 2;
                if self.array[m - 1].is_nil() {
                    j = m;
                } else {
                    i = m;
                }
            }
            return i;
        }
        if self.hash.is_empty() {
            return j;
        }
        self.unbound_search(j)
    }

    fn unbound_search(&self, start: usize) -> usize {
        let mut i = start;
        let mut j = start + 1;
        // Find i present and j absent by doubling.
        while !self.raw_get_int(j as i64).is_nil() {
            i = j;
            match j.checked_mul(2) {
                Some(next) if next <= i64::MAX as usize / 2 => j = next,
                _ => {
                    // Pathological: linear search from 1.
                    let mut k = 1usize;
                    while !self.raw_get_int(k as i64).is_nil() {
                        k += 1;
                    }
                    return k - 1;
                }
            }
        }
        while j - i > 1 {
            let m = (i + j) / 2;
            if self.raw_get_int(m as i64).is_nil() {
                j = m;
            } else {
                i = m;
            }
        }
        i
    }

    /// Iteration step: the entry after `key` (nil starts), array part first and
    /// then the hash part in insertion order. `Ok(None)` ends the traversal.
    pub fn next(&self, key: TValue) -> Result<Option<(TValue, TValue)>, TableError> {
        let (array_from, hash_from) = if key.is_nil() {
            (0, 0)
        } else {
            match key.as_number().and_then(array_index) {
                Some(i) if i <= self.array.len() => (i, 0),
                _ => {
                    let tk = TableKey::from_value(key).map_err(|_| TableError::InvalidNextKey)?;
                    let pos = self
                        .hash
                        .get_index_of(&tk)
                        .ok_or(TableError::InvalidNextKey)?;
                    (self.array.len(), pos + 1)
                }
            }
        };
        for (i, v) in self.array.iter().enumerate().skip(array_from) {
            if !v.is_nil() {
                return Ok(Some((TValue::from_number((i + 1) as f64), *v)));
            }
        }
        let mut idx = hash_from;
        while let Some((k, v)) = self.hash.get_index(idx) {
            if !v.is_nil() {
                return Ok(Some((k.to_value(), *v)));
            }
            idx += 1;
        }
        Ok(None)
    }

    /// Size of the array part.
    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    /// Number of hash slots in use, counting tombstones.
    pub fn hash_len(&self) -> usize {
        self.hash.len()
    }

    /// Array part values (for collector traversal).
    pub fn array_values(&self) -> &[TValue] {
        &self.array
    }

    /// Hash part entries including tombstones (for collector traversal).
    pub fn hash_entries(&self) -> impl Iterator<Item = (&TableKey, &TValue)> {
        self.hash.iter()
    }
}

/// Count `key` into `nums` if it is an array candidate.
fn count_int(key: TableKey, nums: &mut [usize; MAXBITS + 1]) -> usize {
    if let TableKey::Number(bits) = key {
        if let Some(k) = array_index(f64::from_bits(bits)) {
            nums[ceil_log2(k)] += 1;
            return 1;
        }
    }
    0
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "table(array={}, hash={})",
            self.array.len(),
            self.hash.len()
        )
    }
}
