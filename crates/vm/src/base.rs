//! Base library
//!
//! The handful of built-in foreign functions every program can rely on.
//! Each one follows the foreign-call protocol: read arguments, pop them,
//! push results, and report failures as recoverable errors so protected
//! calls can catch them.
//!
//! Anything beyond these primitives belongs to the standard library, which
//! lives outside the execution core.

use crate::api::foreign;
use crate::error::{ErrorKind, VmError};
use crate::globals::GlobalEnv;
use crate::ops;
use crate::state::Vm;
use crate::value::Value;

/// Declare the base functions as globals. Fails only if one of the names is
/// already bound.
pub fn install_base(env: &GlobalEnv) -> Result<(), VmError> {
    env.declare("print", foreign("print", base_print))?;
    env.declare("error", foreign("error", base_error))?;
    env.declare("assert", foreign("assert", base_assert))?;
    env.declare("tostring", foreign("tostring", base_tostring))?;
    env.declare("tonumber", foreign("tonumber", base_tonumber))?;
    env.declare("type", foreign("type", base_type))?;
    env.declare("freeze", foreign("freeze", base_freeze))?;
    env.declare("frozen", foreign("frozen", base_frozen))?;
    Ok(())
}

/// `print(...)`: stringify every argument and print them space-separated.
fn base_print(vm: &mut Vm) -> Result<(), VmError> {
    let args = vm.take_arguments()?;
    let mut parts = Vec::with_capacity(args.len());
    for value in &args {
        match vm.stringify(value)? {
            Some(s) => parts.push(s.as_str().to_string()),
            // A __tostring metamethod raised; let it propagate.
            None => return Ok(()),
        }
    }
    println!("{}", parts.join(" "));
    Ok(())
}

/// `error(message)`: raise a user error.
fn base_error(vm: &mut Vm) -> Result<(), VmError> {
    let args = vm.take_arguments()?;
    let message = args
        .first()
        .map(ops::display)
        .unwrap_or_else(|| "error".to_string());
    Err(VmError::new(ErrorKind::User, message))
}

/// `assert(cond, message?)`: raise unless `cond` is truthy.
fn base_assert(vm: &mut Vm) -> Result<(), VmError> {
    let args = vm.take_arguments()?;
    let ok = args.first().map(Value::truthy).unwrap_or(false);
    if ok {
        return Ok(());
    }
    let message = match args.get(1) {
        Some(v) => ops::display(v),
        None => "assertion failed".to_string(),
    };
    Err(VmError::new(ErrorKind::User, message))
}

/// `tostring(v)`
fn base_tostring(vm: &mut Vm) -> Result<(), VmError> {
    let args = vm.take_arguments()?;
    let value = args.into_iter().next().unwrap_or(Value::Nil);
    if let Some(s) = vm.stringify(&value)? {
        vm.push(Value::Str(s))?;
    }
    Ok(())
}

/// `tonumber(v)`: number, or nil when the value has none.
fn base_tonumber(vm: &mut Vm) -> Result<(), VmError> {
    let args = vm.take_arguments()?;
    let value = args.into_iter().next().unwrap_or(Value::Nil);
    vm.push(ops::to_number(&value))
}

/// `type(v)`: primitive tag name.
fn base_type(vm: &mut Vm) -> Result<(), VmError> {
    let args = vm.take_arguments()?;
    let value = args.into_iter().next().unwrap_or(Value::Nil);
    let name = vm.intern(value.type_name());
    vm.push(Value::Str(name))
}

/// `freeze(t)`: freeze the table and return it.
fn base_freeze(vm: &mut Vm) -> Result<(), VmError> {
    let args = vm.take_arguments()?;
    match args.into_iter().next() {
        Some(Value::Table(t)) => {
            t.freeze();
            vm.push(Value::Table(t))
        }
        other => Err(VmError::new(
            ErrorKind::Argument,
            format!(
                "freeze: expected a table, got {}",
                other.as_ref().map_or("nothing", Value::type_name)
            ),
        )),
    }
}

/// `frozen(t)`: whether the table is frozen.
fn base_frozen(vm: &mut Vm) -> Result<(), VmError> {
    let args = vm.take_arguments()?;
    match args.into_iter().next() {
        Some(Value::Table(t)) => vm.push(Value::Bool(t.is_frozen())),
        other => Err(VmError::new(
            ErrorKind::Argument,
            format!(
                "frozen: expected a table, got {}",
                other.as_ref().map_or("nothing", Value::type_name)
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::OpCode;
    use crate::program::{Constant, Program};
    use crate::table::TableRef;
    use std::sync::Arc;

    fn fresh_vm() -> Vm {
        let env = GlobalEnv::new();
        install_base(&env).unwrap();
        let mut b = Program::builder();
        b.emit(OpCode::Halt, 0, 0, 0);
        Vm::new(Arc::new(b.build(&env.strings)), env)
    }

    #[test]
    fn test_install_base_declares_globals() {
        let vm = fresh_vm();
        assert!(matches!(vm.get_global("print"), Value::Foreign(_)));
        assert!(matches!(vm.get_global("error"), Value::Foreign(_)));
        assert_eq!(vm.get_global("nonsense"), Value::Nil);
    }

    #[test]
    fn test_install_base_twice_fails() {
        let env = GlobalEnv::new();
        install_base(&env).unwrap();
        assert!(install_base(&env).is_err());
    }

    #[test]
    fn test_tostring_and_tonumber() {
        let mut vm = fresh_vm();
        vm.push(Value::Int(42)).unwrap();
        let tostring = vm.get_global("tostring");
        vm.call(tostring, 1).unwrap();
        match vm.pop().unwrap() {
            Value::Str(s) => assert_eq!(s.as_str(), "42"),
            other => panic!("expected string, got {other:?}"),
        }

        let s = vm.intern("0x10");
        vm.push(Value::Str(s)).unwrap();
        let tonumber = vm.get_global("tonumber");
        vm.call(tonumber, 1).unwrap();
        assert_eq!(vm.pop().unwrap(), Value::Int(16));
    }

    #[test]
    fn test_error_builtin_propagates_and_is_catchable() {
        let mut vm = fresh_vm();
        let s = vm.intern("boom");
        vm.push(Value::Str(s)).unwrap();
        let error_fn = vm.get_global("error");
        let err = vm.call(error_fn.clone(), 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::User);
        assert_eq!(err.message, "boom");

        let s = vm.intern("caught me");
        vm.push(Value::Str(s)).unwrap();
        match vm.protected_call(error_fn, 1).unwrap() {
            crate::api::ProtectedOutcome::Caught(message) => assert_eq!(message, "caught me"),
            other => panic!("expected caught, got {other:?}"),
        }
    }

    #[test]
    fn test_freeze_and_frozen() {
        let mut vm = fresh_vm();
        let t = TableRef::new();
        vm.push(Value::Table(t.clone())).unwrap();
        let freeze = vm.get_global("freeze");
        vm.call(freeze, 1).unwrap();
        // freeze returns the table.
        assert!(matches!(vm.pop().unwrap(), Value::Table(_)));
        assert!(t.is_frozen());

        vm.push(Value::Table(t)).unwrap();
        let frozen = vm.get_global("frozen");
        vm.call(frozen, 1).unwrap();
        assert_eq!(vm.pop().unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_assert_truthy_and_falsy() {
        let mut vm = fresh_vm();
        let assert_fn = vm.get_global("assert");
        vm.push(Value::Bool(true)).unwrap();
        vm.call(assert_fn.clone(), 1).unwrap();
        assert_eq!(vm.sp(), 0);

        vm.push(Value::Bool(false)).unwrap();
        let err = vm.call(assert_fn, 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::User);
        assert_eq!(err.message, "assertion failed");
    }

    #[test]
    fn test_type_builtin() {
        let mut vm = fresh_vm();
        let type_fn = vm.get_global("type");
        vm.push(Value::Float(1.5)).unwrap();
        vm.call(type_fn, 1).unwrap();
        match vm.pop().unwrap() {
            Value::Str(s) => assert_eq!(s.as_str(), "float"),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn test_base_is_reachable_from_bytecode() {
        let env = GlobalEnv::new();
        install_base(&env).unwrap();
        let mut b = Program::builder();
        let k_name = b.constant(Constant::Str("tonumber".into()));
        let k_arg = b.constant(Constant::Str("21".into()));
        b.emit(OpCode::PushK, k_arg, 0, 0);
        b.emit(OpCode::GetGlobal, 0, k_name, 0);
        b.emit(OpCode::Call, 0, 1, 0);
        b.emit(OpCode::Halt, 0, 0, 0);
        let mut vm = Vm::new(Arc::new(b.build(&env.strings)), env);
        vm.execute().unwrap();
        assert_eq!(vm.pop().unwrap(), Value::Int(21));
    }
}
