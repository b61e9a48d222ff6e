//! Host embedding interface
//!
//! Everything a host (or a foreign function) needs beyond the state
//! accessors on [`Vm`]: running callees to completion, protected calls,
//! value construction, and global access by name.
//!
//! Calls made through this interface are synchronous: they drive the
//! dispatch loop until the callee's frame returns. An error the callee does
//! not handle comes back as `Err` - a foreign function can inspect it,
//! swallow it, or return it to re-enter the propagation path one frame out.

use crate::error::VmError;
use crate::state::Vm;
use crate::value::{ForeignFn, ForeignObj, Value};
use std::sync::Arc;
use via_core::VmStr;

/// Result of a [`Vm::protected_call`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtectedOutcome {
    /// The callee returned normally; its results are on the stack.
    Returned,
    /// A propagated error was caught at the call boundary; the message is
    /// also on top of the stack as a string.
    Caught(String),
}

impl Vm {
    /// Run `callee` (closure, foreign, or table with `__call`) to
    /// completion. Arguments must already be pushed; results are delivered
    /// on the stack.
    pub fn call(&mut self, callee: Value, argc: usize) -> Result<(), VmError> {
        self.host_call(callee, argc, false).map(|_| ())
    }

    /// Like [`Vm::call`], but the callee's frame is marked as an error
    /// handler: a propagated error stops here instead of unwinding further.
    pub fn protected_call(
        &mut self,
        callee: Value,
        argc: usize,
    ) -> Result<ProtectedOutcome, VmError> {
        self.host_call(callee, argc, true)
    }

    fn host_call(
        &mut self,
        callee: Value,
        argc: usize,
        protected: bool,
    ) -> Result<ProtectedOutcome, VmError> {
        let depth = self.frames.len();
        let saved_ip = self.ip;
        self.caught = None;

        self.call_any(callee, argc, saved_ip, protected)?;
        if self.frames.len() > depth {
            match self.run(depth) {
                Ok(()) => {}
                Err(e) => {
                    self.ip = saved_ip;
                    return Err(e);
                }
            }
        }
        self.ip = saved_ip;

        if let Some(pending) = self.pending.take() {
            return Err(VmError::new(pending.kind, pending.message));
        }
        match self.caught.take() {
            // Only a catch at the frame this call pushed counts as ours;
            // deeper catches resolved inside the callee.
            Some((at, message)) if at == depth => Ok(ProtectedOutcome::Caught(message)),
            _ => Ok(ProtectedOutcome::Returned),
        }
    }

    /// Intern a string in the shared environment.
    pub fn intern(&self, text: &str) -> VmStr {
        self.env.intern(text)
    }

    /// Look up a global by name; nil when unbound.
    pub fn get_global(&self, name: &str) -> Value {
        self.env.global(name)
    }

    /// Declare a global by name. Globals are declare-once.
    pub fn set_global(&mut self, name: &str, value: Value) -> Result<(), VmError> {
        self.env.declare(name, value)
    }
}

/// Construct a foreign function value.
pub fn foreign(name: &str, func: ForeignFn) -> Value {
    Value::Foreign(Arc::new(ForeignObj {
        name: name.into(),
        func,
        error_handler: false,
    }))
}

/// Construct a foreign function value whose frames catch propagated errors.
pub fn foreign_handler(name: &str, func: ForeignFn) -> Value {
    Value::Foreign(Arc::new(ForeignObj {
        name: name.into(),
        func,
        error_handler: true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::globals::GlobalEnv;
    use crate::opcode::OpCode;
    use crate::program::{Constant, Program};
    use crate::table::{TableKey, TableRef};

    fn vm_with(build: impl FnOnce(&mut crate::program::ProgramBuilder)) -> Vm {
        let env = GlobalEnv::new();
        let mut b = Program::builder();
        build(&mut b);
        Vm::new(Arc::new(b.build(&env.strings)), env)
    }

    fn double(vm: &mut Vm) -> Result<(), VmError> {
        let args = vm.take_arguments()?;
        match args.first() {
            Some(Value::Int(n)) => vm.push(Value::Int(n * 2)),
            _ => Err(VmError::new(ErrorKind::Argument, "double: expected an int")),
        }
    }

    #[test]
    fn test_host_call_foreign() {
        let mut vm = vm_with(|b| {
            b.emit(OpCode::Halt, 0, 0, 0);
        });
        vm.push(Value::Int(21)).unwrap();
        vm.call(foreign("double", double), 1).unwrap();
        assert_eq!(vm.pop().unwrap(), Value::Int(42));
        assert_eq!(vm.sp(), 0);
    }

    #[test]
    fn test_host_call_closure() {
        // Body at 1: return its first argument + 1.
        let mut vm = vm_with(|b| {
            b.emit(OpCode::Halt, 0, 0, 0); // 0 (entry)
            b.emit(OpCode::GetArgument, 0, 0, 0); // 1
            b.emit(OpCode::Increment, 0, 0, 0); // 2
            b.emit(OpCode::Push, 0, 0, 0); // 3
            b.emit(OpCode::Return, 1, 0, 0); // 4
        });
        let closure = Value::Closure(Arc::new(crate::value::ClosureObj {
            entry: 1,
            arity: 1,
            upvalues: Vec::new(),
        }));
        vm.push(Value::Int(5)).unwrap();
        vm.call(closure, 1).unwrap();
        assert_eq!(vm.pop().unwrap(), Value::Int(6));
        assert_eq!(vm.sp(), 0);
    }

    #[test]
    fn test_host_call_table_with_call_metamethod() {
        let mut vm = vm_with(|b| {
            b.emit(OpCode::Halt, 0, 0, 0);
        });
        fn receiver_argc(vm: &mut Vm) -> Result<(), VmError> {
            let args = vm.take_arguments()?;
            // Receiver rides as the last argument.
            assert!(matches!(args.last(), Some(Value::Table(_))));
            vm.push(Value::Int(args.len() as i64))
        }
        let t = TableRef::new();
        t.set(TableKey::from_name("__call"), foreign("call", receiver_argc))
            .unwrap();
        vm.push(Value::Int(1)).unwrap();
        vm.call(Value::Table(t), 1).unwrap();
        assert_eq!(vm.pop().unwrap(), Value::Int(2));
    }

    #[test]
    fn test_call_non_callable_is_an_error() {
        let mut vm = vm_with(|b| {
            b.emit(OpCode::Halt, 0, 0, 0);
        });
        let err = vm.call(Value::Int(3), 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
    }

    #[test]
    fn test_protected_call_catches() {
        let mut vm = vm_with(|b| {
            b.emit(OpCode::Halt, 0, 0, 0);
        });
        fn boom(vm: &mut Vm) -> Result<(), VmError> {
            let _ = vm.take_arguments()?;
            Err(VmError::new(ErrorKind::User, "kaboom"))
        }
        match vm.protected_call(foreign("boom", boom), 0).unwrap() {
            ProtectedOutcome::Caught(message) => assert_eq!(message, "kaboom"),
            other => panic!("expected a caught error, got {other:?}"),
        }
        // The message is also delivered on the stack.
        match vm.pop().unwrap() {
            Value::Str(s) => assert_eq!(s.as_str(), "kaboom"),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn test_unprotected_call_surfaces_the_error() {
        let mut vm = vm_with(|b| {
            b.emit(OpCode::Halt, 0, 0, 0);
        });
        fn boom(vm: &mut Vm) -> Result<(), VmError> {
            let _ = vm.take_arguments()?;
            Err(VmError::new(ErrorKind::User, "kaboom"))
        }
        let err = vm.call(foreign("boom", boom), 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::User);
    }

    #[test]
    fn test_globals_by_name() {
        let mut vm = vm_with(|b| {
            let k = b.constant(Constant::Str("x".into()));
            b.emit(OpCode::GetGlobal, 0, k, 0);
            b.emit(OpCode::Push, 0, 0, 0);
            b.emit(OpCode::Halt, 0, 0, 0);
        });
        vm.set_global("x", Value::Int(7)).unwrap();
        assert_eq!(vm.get_global("x"), Value::Int(7));
        // The same binding is visible to bytecode through its hash.
        vm.execute().unwrap();
        assert_eq!(vm.pop().unwrap(), Value::Int(7));
    }
}
