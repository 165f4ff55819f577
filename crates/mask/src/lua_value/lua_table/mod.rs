// LuaTable - hybrid array+hash table, with frozen-table and length-cache
// support for Mask's `freeze(t)` builtin and `#t` operator.
mod native_table;

use super::lua_value::LuaValue;
use crate::lua_vm::LuaError;
use native_table::NativeTable;

/// Bits in `flags` caching which fast-access metamethods are known absent.
/// Mirrors ltable.c's per-table metamethod cache; bit set means "definitely
/// not present on the metatable", reset whenever the metatable changes.
pub const TM_INDEX: u8 = 1 << 0;
pub const TM_NEWINDEX: u8 = 1 << 1;
pub const TM_GC: u8 = 1 << 2;
pub const TM_MODE: u8 = 1 << 3;
pub const TM_LEN: u8 = 1 << 4;
pub const TM_EQ: u8 = 1 << 5;

pub struct LuaTable {
    meta: Option<LuaValue>,
    pub(crate) impl_table: NativeTable,
    /// One-way freeze bit: once set, any write raises a runtime error.
    frozen: bool,
    /// Fast-access metamethod absence cache (see TM_* constants above).
    flags: u8,
    /// `#t` cache; `None` means unknown and must be recomputed.
    length_cache: Option<i64>,
}

impl LuaTable {
    /// 创建新table
    pub fn new(asize: u32, hsize: u32) -> Self {
        Self {
            meta: None,
            impl_table: NativeTable::new(asize, hsize),
            frozen: false,
            flags: 0,
            length_cache: None,
        }
    }

    #[inline(always)]
    pub fn has_metatable(&self) -> bool {
        self.meta.is_some()
    }

    pub fn get_metatable(&self) -> Option<LuaValue> {
        self.meta
    }

    pub fn set_metatable(&mut self, metatable: Option<LuaValue>) {
        self.meta = metatable;
        // A new metatable may introduce metamethods the cache had marked
        // absent; clear it rather than try to prove which bits still hold.
        self.flags = 0;
    }

    /// Whether this table has been frozen (`freeze(t)`). One-way: there is
    /// no `unfreeze`.
    #[inline(always)]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Returns an error if the table is frozen, for use at every mutating
    /// entry point before any state is touched: check-frozen first, mutate
    /// the length cache only on success.
    #[inline(always)]
    pub fn err_if_frozen(&self) -> Result<(), LuaError> {
        if self.frozen {
            Err(LuaError::RuntimeError)
        } else {
            Ok(())
        }
    }

    pub fn metamethod_cache(&self) -> u8 {
        self.flags
    }

    pub fn set_metamethod_absent(&mut self, bit: u8) {
        self.flags |= bit;
    }

    /// `#t`. Returns the cached value if known, else delegates to the
    /// array-part border search.
    pub fn len(&self) -> usize {
        if let Some(cached) = self.length_cache {
            return cached.max(0) as usize;
        }
        self.impl_table.len()
    }

    fn invalidate_length(&mut self) {
        self.length_cache = None;
    }

    pub fn get_int(&self, key: i64) -> Option<LuaValue> {
        self.impl_table.get_int(key)
    }

    /// Unconditional write, matching the historical signature most of the
    /// tree calls. Silently ignored on a frozen table; opcode-level callers
    /// that must surface the runtime error use [`Self::checked_set_int`].
    pub fn set_int(&mut self, key: i64, value: LuaValue) {
        if self.frozen {
            return;
        }
        self.impl_table.set_int(key, value);
        self.invalidate_length();
    }

    pub fn checked_set_int(&mut self, key: i64, value: LuaValue) -> Result<(), LuaError> {
        self.err_if_frozen()?;
        self.impl_table.set_int(key, value);
        self.invalidate_length();
        Ok(())
    }

    pub fn raw_get(&self, key: &LuaValue) -> Option<LuaValue> {
        self.impl_table.raw_get(key)
    }

    /// Unconditional write; see [`Self::set_int`] for the frozen-table note.
    pub fn raw_set(&mut self, key: &LuaValue, value: LuaValue) {
        if self.frozen {
            return;
        }
        self.impl_table.raw_set(key, value);
        self.invalidate_length();
    }

    pub fn checked_raw_set(&mut self, key: &LuaValue, value: LuaValue) -> Result<(), LuaError> {
        self.err_if_frozen()?;
        self.impl_table.raw_set(key, value);
        self.invalidate_length();
        Ok(())
    }

    pub fn next(&self, input_key: &LuaValue) -> Option<(LuaValue, LuaValue)> {
        self.impl_table.next(input_key).ok().flatten()
    }

    pub fn insert_array_at(&mut self, i: i64, value: LuaValue) -> Result<(), LuaError> {
        self.err_if_frozen()?;
        if !self.impl_table.fast_seti(i, value) {
            self.impl_table.set_int(i, value);
        }
        self.invalidate_length();
        Ok(())
    }

    pub fn remove_array_at(&mut self, i: i64) -> Result<Option<LuaValue>, LuaError> {
        self.err_if_frozen()?;
        let removed = self.impl_table.remove_at(i);
        self.invalidate_length();
        Ok(removed)
    }

    pub fn iter_all(&self) -> Vec<(LuaValue, LuaValue)> {
        let mut result = Vec::new();
        let mut key = LuaValue::nil();
        while let Ok(Some((k, v))) = self.impl_table.next(&key) {
            result.push((k, v));
            key = k;
        }
        result
    }

    /// Remove entries with dead (collectible) keys or values. Used by weak
    /// table cleanup during GC.
    pub fn remove_weak_entries_with_checker<F>(
        &mut self,
        weak_keys: bool,
        weak_values: bool,
        mut is_dead: F,
    ) where
        F: FnMut(crate::lua_value::LuaValueKind, u32) -> bool,
    {
        let mut keys_to_remove = Vec::new();
        for (key, value) in self.iter_all() {
            let mut should_remove = false;
            if weak_keys {
                if let Some((kind, idx)) = Self::value_to_gc_id(&key) {
                    if is_dead(kind, idx) {
                        should_remove = true;
                    }
                }
            }
            if !should_remove && weak_values {
                if let Some((kind, idx)) = Self::value_to_gc_id(&value) {
                    if is_dead(kind, idx) {
                        should_remove = true;
                    }
                }
            }
            if should_remove {
                keys_to_remove.push(key);
            }
        }
        for key in keys_to_remove {
            self.raw_set(&key, LuaValue::nil());
        }
    }

    fn value_to_gc_id(value: &LuaValue) -> Option<(crate::lua_value::LuaValueKind, u32)> {
        use crate::lua_value::LuaValueKind;
        match value.kind() {
            LuaValueKind::String => value.as_string_id().map(|id| (LuaValueKind::String, id.0)),
            LuaValueKind::Table => value.as_table_id().map(|id| (LuaValueKind::Table, id.0)),
            LuaValueKind::Function => value
                .as_function_id()
                .map(|id| (LuaValueKind::Function, id.0)),
            LuaValueKind::Thread => value.as_thread_id().map(|id| (LuaValueKind::Thread, id.0)),
            LuaValueKind::Userdata => value
                .as_userdata_id()
                .map(|id| (LuaValueKind::Userdata, id.0)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn freeze_rejects_mutation() {
        let mut t = LuaTable::new(4, 0);
        t.checked_set_int(1, LuaValue::integer(10)).unwrap();
        assert!(!t.is_frozen());
        t.freeze();
        assert!(t.is_frozen());
        assert!(t.checked_set_int(1, LuaValue::integer(99)).is_err());
        assert!(
            t.checked_raw_set(&LuaValue::integer(2), LuaValue::integer(1))
                .is_err()
        );
        // reads remain legal on a frozen table
        assert_eq!(t.get_int(1).unwrap().as_integer(), Some(10));
    }

    #[test]
    fn length_cache_invalidated_on_write() {
        let mut t = LuaTable::new(0, 0);
        t.checked_set_int(1, LuaValue::integer(1)).unwrap();
        t.checked_set_int(2, LuaValue::integer(2)).unwrap();
        t.checked_set_int(3, LuaValue::integer(3)).unwrap();
        assert_eq!(t.len(), 3);
        t.checked_set_int(4, LuaValue::integer(4)).unwrap();
        assert_eq!(t.len(), 4);
    }
}
