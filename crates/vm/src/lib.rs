//! via VM: the execution core of the via language
//!
//! Key design principles:
//! - Values are a tagged sum; heap variants are refcounted handles, and the
//!   last drop frees the object.
//! - The machine is a register/stack hybrid driven by a dense-match
//!   dispatch loop; one VM is owned by one thread.
//! - Shared state (interned strings, globals) is explicit, handed to every
//!   VM as a [`GlobalEnv`] - never a process-wide singleton.
//! - Recoverable errors propagate along the frame chain toward a handler;
//!   fatal errors terminate the VM at once.

pub mod api;
pub mod base;
pub mod dispatch;
pub mod dump;
pub mod error;
pub mod globals;
pub mod image;
pub mod opcode;
pub mod ops;
pub mod program;
pub mod state;
pub mod table;
pub mod value;

pub use api::{foreign, foreign_handler, ProtectedOutcome};
pub use base::install_base;
pub use error::{ErrorKind, VmError};
pub use globals::{GlobalEnv, Globals};
pub use image::{read as read_image, write as write_image, LoadError};
pub use opcode::OpCode;
pub use program::{Constant, Header, Instruction, Program, ProgramBuilder, FORMAT_VERSION};
pub use state::{Vm, FRAME_DEPTH, REGISTER_COUNT, STACK_DEPTH};
pub use table::{TableKey, TableRef};
pub use value::{ClosureObj, ClosureRef, ForeignFn, ForeignObj, ForeignRef, Upvalue, Value};

pub use via_core::{hash31, Interner, VmStr};
