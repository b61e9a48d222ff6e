//! VM error model
//!
//! Errors carry a kind from a closed catalogue. Recoverable kinds enter the
//! propagation path: the dispatcher records them as pending state and
//! unwinds the frame chain toward an error handler. Fatal kinds terminate
//! the VM immediately; the compiler must never emit bytecode that reaches
//! one.

use thiserror::Error;

/// The error catalogue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ErrorKind {
    // Recoverable: propagate through the frame chain.
    #[error("type error")]
    Type,
    #[error("arity error")]
    Arity,
    #[error("argument error")]
    Argument,
    #[error("global redeclaration")]
    GlobalRedeclaration,
    #[error("frozen table")]
    FrozenTable,
    #[error("division by zero")]
    DivisionByZero,
    #[error("error")]
    User,

    // Fatal: terminate the VM, bypassing propagation.
    #[error("bad jump")]
    BadJump,
    #[error("stack overflow")]
    StackOverflow,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("invalid opcode")]
    InvalidOpcode,
    #[error("bad register")]
    BadRegister,
    #[error("bad constant")]
    BadConstant,
}

impl ErrorKind {
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::BadJump
                | ErrorKind::StackOverflow
                | ErrorKind::StackUnderflow
                | ErrorKind::InvalidOpcode
                | ErrorKind::BadRegister
                | ErrorKind::BadConstant
        )
    }
}

/// A VM error as surfaced to the host: kind, message, and the frame trace
/// captured where the error left the VM.
#[derive(Clone, Debug, Error)]
#[error("{kind}: {message}")]
pub struct VmError {
    pub kind: ErrorKind,
    pub message: String,
    /// One line per frame, innermost first. Empty until the error escapes.
    pub trace: Vec<String>,
}

impl VmError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: Vec::new(),
        }
    }
}

/// Error state recorded on the VM between the raising instruction and the
/// propagation step at the top of the dispatch loop.
#[derive(Clone, Debug)]
pub struct PendingError {
    pub kind: ErrorKind,
    pub message: String,
}
