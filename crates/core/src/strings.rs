//! Interned strings and the content hash
//!
//! String values are immutable heap objects shared by handle. Interning
//! canonicalizes them: two equal literals resolve to the same object, so
//! equality starts with a pointer compare and the content hash is computed
//! exactly once per distinct string.
//!
//! The intern table holds `Weak` slots, bucketed by hash with chaining for
//! collisions. Dropping the last strong handle frees the string; the dead
//! slot is pruned the next time its bucket is touched. This keeps the table
//! non-owning without a back-pointer from the string to the table.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Polynomial string hash, base 31 modulo 2^32.
///
/// This is the one hash used for interning, table keys, global identifiers,
/// and metamethod lookup.
#[inline]
pub fn hash31(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |h, &b| h.wrapping_mul(31).wrapping_add(u32::from(b)))
}

/// Immutable string payload: content plus its precomputed hash.
struct StrData {
    text: Box<str>,
    hash: u32,
}

/// Handle to an interned string object.
///
/// Cloning increments the shared refcount; the content is immutable for the
/// object's lifetime. Equality is content equality, with a pointer fast path
/// because interning makes equal content share one object.
#[derive(Clone)]
pub struct VmStr(Arc<StrData>);

impl VmStr {
    pub fn as_str(&self) -> &str {
        &self.0.text
    }

    /// The content hash (see [`hash31`]).
    pub fn hash(&self) -> u32 {
        self.0.hash
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.text.is_empty()
    }

    /// Length in characters (code points).
    pub fn char_len(&self) -> usize {
        self.0.text.chars().count()
    }

    /// Stable per-process identity of the underlying object.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Current strong refcount of the underlying object.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl PartialEq for VmStr {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.text == other.0.text
    }
}

impl Eq for VmStr {}

impl fmt::Display for VmStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.text)
    }
}

impl fmt::Debug for VmStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VmStr({:?})", &*self.0.text)
    }
}

/// The string intern table.
///
/// May be shared across VM instances; lookups take the read lock, insertion
/// and pruning the write lock, so a reader never observes a partially
/// inserted entry.
#[derive(Default)]
pub struct Interner {
    buckets: RwLock<FxHashMap<u32, Vec<Weak<StrData>>>>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonicalize `text`: equal content always yields a handle to the same
    /// object. Insertion is idempotent.
    pub fn intern(&self, text: &str) -> VmStr {
        let hash = hash31(text.as_bytes());

        // Fast path: the string is already interned and alive.
        {
            let buckets = self.buckets.read();
            if let Some(bucket) = buckets.get(&hash) {
                for slot in bucket {
                    if let Some(data) = slot.upgrade() {
                        if &*data.text == text {
                            return VmStr(data);
                        }
                    }
                }
            }
        }

        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(hash).or_default();
        // Evict slots whose strings died since the bucket was last touched.
        bucket.retain(|slot| slot.strong_count() > 0);
        // Re-check under the write lock; another thread may have raced us.
        for slot in bucket.iter() {
            if let Some(data) = slot.upgrade() {
                if &*data.text == text {
                    return VmStr(data);
                }
            }
        }

        let data = Arc::new(StrData {
            text: text.into(),
            hash,
        });
        bucket.push(Arc::downgrade(&data));
        VmStr(data)
    }

    /// Number of live interned strings.
    pub fn live(&self) -> usize {
        self.buckets
            .read()
            .values()
            .map(|bucket| bucket.iter().filter(|slot| slot.strong_count() > 0).count())
            .sum()
    }

    /// Drop every dead slot and empty bucket.
    pub fn prune(&self) {
        let mut buckets = self.buckets.write();
        buckets.retain(|_, bucket| {
            bucket.retain(|slot| slot.strong_count() > 0);
            !bucket.is_empty()
        });
    }
}
