//! The table: via's only compound data structure
//!
//! A table has two parts: an ordered part holding the dense integer keys
//! `0..n`, and an unordered part keyed by the 32-bit hash of a string key or
//! the wrapped 32-bit value of an integer key. The unordered part preserves
//! insertion order so stringification and `NEXTTABLE` traversal are
//! deterministic.
//!
//! A table may carry a metatable (operator overrides, `__call`, `__type`)
//! and a one-way frozen flag: once frozen, every mutation fails.

use crate::value::Value;
use indexmap::IndexMap;
use parking_lot::RwLock;
use rustc_hash::FxHasher;
use std::fmt;
use std::hash::BuildHasherDefault;
use std::sync::Arc;
use via_core::hash31;

type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

/// How a value addresses into a table, if it can at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKey {
    /// Integer key; `0..n` lands in the ordered part.
    Index(i64),
    /// Hashed string key.
    Hash(u32),
}

impl TableKey {
    /// Classify `key`. Only integers and strings key into tables.
    pub fn of(key: &Value) -> Option<TableKey> {
        match key {
            Value::Int(i) => Some(TableKey::Index(*i)),
            Value::Str(s) => Some(TableKey::Hash(s.hash())),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> TableKey {
        TableKey::Hash(hash31(name.as_bytes()))
    }

    fn hash(self) -> u32 {
        match self {
            TableKey::Index(i) => i as u32,
            TableKey::Hash(h) => h,
        }
    }
}

#[derive(Default)]
struct TableData {
    list: Vec<Value>,
    hash: FxIndexMap<u32, Value>,
    meta: Option<TableRef>,
    frozen: bool,
}

/// Owning handle to a table object. Clone shares the object.
#[derive(Clone, Default)]
pub struct TableRef(Arc<RwLock<TableData>>);

impl TableRef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stable per-process identity.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn same_object(&self, other: &TableRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Look up `key`, falling back to the metatable when `search_meta` is
    /// set. The metatable search does not chain further.
    pub fn get(&self, key: TableKey, search_meta: bool) -> Value {
        let data = self.0.read();
        if let TableKey::Index(i) = key {
            if let Ok(i) = usize::try_from(i) {
                if i < data.list.len() {
                    return data.list[i].clone();
                }
            }
        }
        if let Some(value) = data.hash.get(&key.hash()) {
            return value.clone();
        }
        if search_meta {
            if let Some(meta) = data.meta.clone() {
                drop(data);
                return meta.get(key, false);
            }
        }
        Value::Nil
    }

    /// Look up a hashed name (metamethods, `__type`), searching the
    /// metatable one level deep.
    pub fn get_named(&self, name: &str) -> Value {
        self.get(TableKey::from_name(name), true)
    }

    /// Assign `key = value`. Assigning nil to a hashed key erases the entry;
    /// within the ordered part the slot is kept and reads back as nil.
    /// Fails on frozen tables.
    pub fn set(&self, key: TableKey, value: Value) -> Result<(), ()> {
        let mut data = self.0.write();
        if data.frozen {
            return Err(());
        }
        if let TableKey::Index(i) = key {
            if let Ok(i) = usize::try_from(i) {
                if i < data.list.len() {
                    data.list[i] = value;
                    return Ok(());
                }
                if i == data.list.len() {
                    if !value.is_nil() {
                        data.list.push(value);
                    }
                    return Ok(());
                }
            }
        }
        if value.is_nil() {
            data.hash.shift_remove(&key.hash());
        } else {
            data.hash.insert(key.hash(), value);
        }
        Ok(())
    }

    /// Count of the ordered part.
    pub fn len(&self) -> i64 {
        self.0.read().list.len() as i64
    }

    pub fn is_empty(&self) -> bool {
        let data = self.0.read();
        data.list.is_empty() && data.hash.is_empty()
    }

    /// Total number of entries traversed by iteration.
    pub fn entry_count(&self) -> usize {
        let data = self.0.read();
        data.list.len() + data.hash.len()
    }

    /// The `pos`-th entry in traversal order: the ordered part first, then
    /// the unordered part in insertion order.
    pub fn entry_at(&self, pos: usize) -> Option<Value> {
        let data = self.0.read();
        if pos < data.list.len() {
            return Some(data.list[pos].clone());
        }
        data.hash
            .get_index(pos - data.list.len())
            .map(|(_, v)| v.clone())
    }

    /// Snapshot of every entry in traversal order.
    pub fn entries(&self) -> Vec<Value> {
        let data = self.0.read();
        data.list
            .iter()
            .cloned()
            .chain(data.hash.values().cloned())
            .collect()
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.0.read().meta.clone()
    }

    pub fn set_metatable(&self, meta: Option<TableRef>) -> Result<(), ()> {
        let mut data = self.0.write();
        if data.frozen {
            return Err(());
        }
        data.meta = meta;
        Ok(())
    }

    /// One-way: a frozen table never thaws.
    pub fn freeze(&self) {
        self.0.write().frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.0.read().frozen
    }

    /// Current strong refcount of the underlying object.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

// Debug prints identity, not contents; contents may recursively contain the
// table itself.
impl fmt::Debug for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableRef(0x{:x})", self.identity())
    }
}
