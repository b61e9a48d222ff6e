//! The global table and the shared environment
//!
//! Globals map the 32-bit hash of an identifier to a value and are
//! declare-once: redeclaration is an error, lookup of an unbound id is nil
//! (not an error).
//!
//! [`GlobalEnv`] bundles the two tables that may be shared across VM
//! instances - the string interner and the globals - behind reader-writer
//! locks. It is explicit state handed to every VM, never a process-wide
//! singleton.

use crate::error::{ErrorKind, VmError};
use crate::value::Value;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use via_core::{hash31, Interner, VmStr};

/// Declare-once global bindings keyed by identifier hash.
#[derive(Default)]
pub struct Globals {
    map: RwLock<FxHashMap<u32, Value>>,
}

impl Globals {
    /// Unbound ids read as nil.
    pub fn get(&self, id: u32) -> Value {
        self.map.read().get(&id).cloned().unwrap_or(Value::Nil)
    }

    pub fn is_declared(&self, id: u32) -> bool {
        self.map.read().contains_key(&id)
    }

    /// Bind `id` for the first and only time.
    pub fn declare(&self, id: u32, value: Value) -> Result<(), VmError> {
        let mut map = self.map.write();
        if map.contains_key(&id) {
            return Err(VmError::new(
                ErrorKind::GlobalRedeclaration,
                format!("cannot redeclare global {id:#010x}"),
            ));
        }
        map.insert(id, value);
        Ok(())
    }
}

/// State shared by every VM attached to it: interned strings and globals.
#[derive(Default)]
pub struct GlobalEnv {
    pub strings: Interner,
    pub globals: Globals,
}

impl GlobalEnv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn intern(&self, text: &str) -> VmStr {
        self.strings.intern(text)
    }

    /// Declare a global by name (hashed internally).
    pub fn declare(&self, name: &str, value: Value) -> Result<(), VmError> {
        self.globals
            .declare(hash31(name.as_bytes()), value)
            .map_err(|e| VmError::new(e.kind, format!("cannot redeclare global '{name}'")))
    }

    /// Look a global up by name; nil when unbound.
    pub fn global(&self, name: &str) -> Value {
        self.globals.get(hash31(name.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbound_global_is_nil() {
        let env = GlobalEnv::new();
        assert_eq!(env.global("missing"), Value::Nil);
    }

    #[test]
    fn test_declare_then_get() {
        let env = GlobalEnv::new();
        env.declare("x", Value::Int(42)).unwrap();
        assert_eq!(env.global("x"), Value::Int(42));
    }

    #[test]
    fn test_redeclaration_is_an_error() {
        let env = GlobalEnv::new();
        env.declare("x", Value::Int(1)).unwrap();
        let err = env.declare("x", Value::Int(2)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::GlobalRedeclaration);
        // The original binding survives.
        assert_eq!(env.global("x"), Value::Int(1));
    }
}
