//! via core: the shared foundation under the virtual machine
//!
//! Key design principles:
//! - One hash for everything: interning, table keys, global identifiers, and
//!   metamethod lookup all use the same 32-bit content hash.
//! - Interning is explicit state. The intern table is a value the host
//!   creates and threads through, never a process-wide singleton.
//! - The table holds non-owning slots; a string whose last handle drops is
//!   unreachable from the table before its storage is released.

pub mod strings;

pub use strings::{hash31, Interner, VmStr};
