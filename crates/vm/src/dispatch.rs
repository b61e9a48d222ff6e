//! The dispatcher: fetch, decode, execute
//!
//! A dense match over the opcode discriminant. Every iteration checks the
//! cooperative abort flag, then propagates any pending error toward the
//! nearest handler frame, then fetches (bounds-checked) and dispatches.
//!
//! Handlers either advance `ip` by one or set it for jumps, calls, and
//! returns. Raising a recoverable error leaves `ip` alone; the propagation
//! step decides where execution resumes. Fatal errors return `Err`
//! immediately and terminate the VM.
//!
//! Operator metamethods run *synchronously*: the dispatcher pushes the
//! operands, drives a nested run of the same loop until the metamethod
//! frame returns, then pops the result. Plain calls (`CALL` and friends)
//! stay asynchronous - they just push a frame and let the loop continue
//! inside the callee.

use crate::error::{ErrorKind, VmError};
use crate::opcode::OpCode;
use crate::ops::{self, ArithOp};
use crate::program::Instruction;
use crate::state::Vm;
use crate::table::{TableKey, TableRef};
use crate::value::{Upvalue, Value};
use tracing::{debug, error, trace};
use via_core::VmStr;

/// How a synchronous (metamethod) call ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncOutcome {
    /// The callee returned; its results are on the stack.
    Completed,
    /// The callee halted, raised, or unwound past the call site; the
    /// current handler must stop without touching its destination.
    Aborted,
}

#[derive(Clone, Copy, Debug)]
enum Cmp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    fn name(self) -> &'static str {
        match self {
            Cmp::Lt => "less",
            Cmp::Le => "less-or-equal",
            Cmp::Gt => "greater",
            Cmp::Ge => "greater-or-equal",
        }
    }
}

impl Vm {
    /// Run the program from its entry point until `HALT`/`EXIT`, the end of
    /// the instruction vector, or an error. `Ok` carries the exit code.
    pub fn execute(&mut self) -> Result<i32, VmError> {
        self.ip = self.program.entry as usize;
        self.halted = false;
        match self.run(0) {
            Ok(()) => Ok(self.exit_code),
            Err(mut e) => {
                // Fatal errors arrive without a trace; snapshot the frames
                // they died under.
                if e.trace.is_empty() {
                    e.trace = self.trace_lines();
                }
                self.exit_code = 1;
                error!(message = %e, "vm terminated");
                for line in &e.trace {
                    error!("  {line}");
                }
                Err(e)
            }
        }
    }

    /// The interpreter loop. Executes until the VM halts or the frame count
    /// drops to `floor` (how nested synchronous calls return control).
    pub(crate) fn run(&mut self, floor: usize) -> Result<(), VmError> {
        while !self.halted && self.frames.len() > floor {
            if self.abort_requested() {
                debug!("abort flag set; unwinding");
                while self.frames.len() > 1 {
                    self.pop_frame_closing();
                }
                self.halted = true;
                break;
            }

            if self.pending.is_some() {
                self.propagate(floor)?;
                continue;
            }

            let Some(&instr) = self.program.code.get(self.ip) else {
                // Running off the end is a clean halt.
                self.halted = true;
                break;
            };
            trace!(ip = self.ip, op = instr.op.mnemonic());
            self.step(instr)?;
        }
        Ok(())
    }

    /// Walk the frame chain toward the nearest error handler. Frames above
    /// it are discarded (their upvalues closed); the handler frame itself
    /// performs a return-like restore with the error message pushed as a
    /// string.
    ///
    /// The search stops at `floor`: an error never unwinds through an
    /// in-flight host call. With no handler in range, the error leaves this
    /// run with a frame trace attached - nested callers re-raise it one
    /// layer out, the top level reports it.
    fn propagate(&mut self, floor: usize) -> Result<(), VmError> {
        let pending = self.pending.take().expect("propagate runs with an error pending");

        let handler = self
            .frames
            .iter()
            .rposition(|frame| frame.error_handler)
            .filter(|&idx| idx > 0 && idx >= floor);

        let Some(idx) = handler else {
            let err = VmError {
                kind: pending.kind,
                message: pending.message,
                trace: self.trace_lines(),
            };
            // Discard the frames this run owns (closing their upvalues) and
            // give back their stack window before handing the error out.
            let mut restore_sp = None;
            while self.frames.len() > floor.max(1) {
                let frame = self.pop_frame_closing();
                restore_sp = Some(frame.saved_sp.saturating_sub(frame.argc));
            }
            if let Some(sp) = restore_sp {
                self.stack.truncate(sp);
            }
            return Err(err);
        };

        while self.frames.len() > idx + 1 {
            self.pop_frame_closing();
        }
        let frame = self.pop_frame_closing();
        self.ip = frame.ret_addr;
        self.stack
            .truncate(frame.saved_sp.saturating_sub(frame.argc));
        let message = self.env.intern(&pending.message);
        self.caught = Some((idx, pending.message));
        self.push(Value::Str(message))?;
        debug!(resume = self.ip, "error caught by handler frame");
        Ok(())
    }

    // ---- calls -----------------------------------------------------------

    /// Route a call to the callee's tag: closures begin executing in this
    /// loop, foreigns run to completion now, tables go through `__call`
    /// with the table pushed as the receiver.
    pub(crate) fn call_any(
        &mut self,
        callee: Value,
        argc: usize,
        ret_addr: usize,
        error_handler: bool,
    ) -> Result<(), VmError> {
        match callee {
            Value::Closure(c) => self.native_call(c, argc, error_handler, ret_addr),
            Value::Foreign(f) => {
                self.extern_call(f, argc, error_handler, ret_addr)?;
                if self.pending.is_none() {
                    self.ip = ret_addr;
                }
                Ok(())
            }
            Value::Table(t) => {
                let method = t.get_named("__call");
                if method.is_nil() {
                    self.raise(
                        ErrorKind::Type,
                        "attempt to call a table without a __call metamethod",
                    );
                    return Ok(());
                }
                self.push(Value::Table(t))?;
                self.call_any(method, argc + 1, ret_addr, error_handler)
            }
            other => {
                self.raise(
                    ErrorKind::Type,
                    format!("attempt to call a {} value", other.type_name()),
                );
                Ok(())
            }
        }
    }

    /// Run a callee to completion inside a nested run of the loop. The
    /// operands must already be on the stack. An error the callee does not
    /// handle re-raises at this level, so the surrounding frames get their
    /// own propagation pass.
    fn call_sync(&mut self, callee: Value, argc: usize) -> Result<SyncOutcome, VmError> {
        let depth = self.frames.len();
        // Resume the interrupted handler at the current instruction.
        self.call_any(callee, argc, self.ip, false)?;
        if self.frames.len() > depth {
            match self.run(depth) {
                Ok(()) => {}
                Err(e) if e.kind.is_fatal() => return Err(e),
                Err(e) => self.raise(e.kind, e.message),
            }
        }
        if self.halted || self.pending.is_some() || self.frames.len() < depth {
            Ok(SyncOutcome::Aborted)
        } else {
            Ok(SyncOutcome::Completed)
        }
    }

    /// Invoke a unary/binary metamethod and pop its result.
    fn metamethod_result(
        &mut self,
        method: Value,
        args: Vec<Value>,
    ) -> Result<Option<Value>, VmError> {
        let argc = args.len();
        for arg in args {
            self.push(arg)?;
        }
        match self.call_sync(method, argc)? {
            SyncOutcome::Completed => Ok(Some(self.pop()?)),
            SyncOutcome::Aborted => Ok(None),
        }
    }

    // ---- stringification -------------------------------------------------

    /// Stringification: a table's `__tostring` metamethod wins; everything
    /// else uses the plain form.
    pub fn stringify(&mut self, value: &Value) -> Result<Option<VmStr>, VmError> {
        if let Value::Str(s) = value {
            return Ok(Some(s.clone()));
        }
        if let Value::Table(t) = value {
            let method = t.get_named("__tostring");
            if !method.is_nil() {
                return match self.metamethod_result(method, vec![value.clone()])? {
                    Some(Value::Str(s)) => Ok(Some(s)),
                    Some(other) => Ok(Some(self.env.intern(&ops::display(&other)))),
                    None => Ok(None),
                };
            }
        }
        Ok(Some(self.env.intern(&ops::display(value))))
    }

    // ---- opcode families -------------------------------------------------

    fn arith(&mut self, op: ArithOp, dst: u16, lhs: u16, rhs: Value) -> Result<(), VmError> {
        let a = self.register(lhs)?.clone();
        match ops::num_binop(op, &a, &rhs) {
            Ok(value) => {
                self.set_register(dst, value)?;
                self.ip += 1;
            }
            Err(ops::NumError::DivisionByZero) => {
                self.raise(
                    ErrorKind::DivisionByZero,
                    format!("attempt to {} by zero", op.name()),
                );
            }
            Err(ops::NumError::NotNumeric) => {
                if let Value::Table(t) = &a {
                    let method = t.get_named(op.metamethod());
                    if !method.is_nil() {
                        if let Some(result) =
                            self.metamethod_result(method, vec![a.clone(), rhs])?
                        {
                            self.set_register(dst, result)?;
                            self.ip += 1;
                        }
                        return Ok(());
                    }
                }
                self.raise(
                    ErrorKind::Type,
                    format!(
                        "attempt to perform arithmetic ({}) on {} and {}",
                        op.name(),
                        a.type_name(),
                        rhs.type_name()
                    ),
                );
            }
        }
        Ok(())
    }

    fn unary_numeric(
        &mut self,
        dst: u16,
        src: u16,
        apply: fn(&Value) -> Option<Value>,
        metamethod: &str,
        what: &str,
    ) -> Result<(), VmError> {
        let value = self.register(src)?.clone();
        if let Some(result) = apply(&value) {
            self.set_register(dst, result)?;
            self.ip += 1;
            return Ok(());
        }
        if let Value::Table(t) = &value {
            let method = t.get_named(metamethod);
            if !method.is_nil() {
                if let Some(result) = self.metamethod_result(method, vec![value.clone()])? {
                    self.set_register(dst, result)?;
                    self.ip += 1;
                }
                return Ok(());
            }
        }
        self.raise(
            ErrorKind::Type,
            format!("attempt to {what} a {} value", value.type_name()),
        );
        Ok(())
    }

    /// Equality with `__eq` for non-identical tables.
    fn values_equal(&mut self, a: &Value, b: &Value) -> Result<Option<bool>, VmError> {
        if let (Value::Table(ta), Value::Table(tb)) = (a, b) {
            if ta.same_object(tb) {
                return Ok(Some(true));
            }
            let method = ta.get_named("__eq");
            if !method.is_nil() {
                return Ok(self
                    .metamethod_result(method, vec![a.clone(), b.clone()])?
                    .map(|v| v.truthy()));
            }
            return Ok(Some(false));
        }
        Ok(Some(a == b))
    }

    /// Ordering comparisons. `GREATER`/`GREATEROREQUAL` swap their operands
    /// and reuse `__lt`/`__le`, so only those two metamethods exist.
    fn ordered(&mut self, kind: Cmp, a: Value, b: Value) -> Result<Option<bool>, VmError> {
        let numeric = match kind {
            Cmp::Lt => ops::num_lt(&a, &b),
            Cmp::Le => ops::num_le(&a, &b),
            Cmp::Gt => ops::num_lt(&b, &a),
            Cmp::Ge => ops::num_le(&b, &a),
        };
        if let Some(result) = numeric {
            return Ok(Some(result));
        }

        let (lhs, rhs, name) = match kind {
            Cmp::Lt => (a, b, "__lt"),
            Cmp::Le => (a, b, "__le"),
            Cmp::Gt => (b, a, "__lt"),
            Cmp::Ge => (b, a, "__le"),
        };
        if let Value::Table(t) = &lhs {
            let method = t.get_named(name);
            if !method.is_nil() {
                return match self.metamethod_result(method, vec![lhs.clone(), rhs])? {
                    Some(Value::Bool(result)) => Ok(Some(result)),
                    Some(other) => {
                        self.raise(
                            ErrorKind::Type,
                            format!(
                                "comparison metamethod ({name}) returned {} instead of bool",
                                other.type_name()
                            ),
                        );
                        Ok(None)
                    }
                    None => Ok(None),
                };
            }
        }
        self.raise(
            ErrorKind::Type,
            format!(
                "attempt to perform comparison ({}) on {} and {}",
                kind.name(),
                lhs.type_name(),
                rhs.type_name()
            ),
        );
        Ok(None)
    }

    fn concat(&mut self, dst: u16, lhs: u16, rhs: Value) -> Result<(), VmError> {
        let a = self.register(lhs)?.clone();
        let left = concat_part(&a);
        let right = concat_part(&rhs);
        if let (Some(left), Some(right)) = (left, right) {
            let joined = self.env.intern(&format!("{left}{right}"));
            self.set_register(dst, Value::Str(joined))?;
            self.ip += 1;
            return Ok(());
        }
        if let Value::Table(t) = &a {
            let method = t.get_named("__con");
            if !method.is_nil() {
                if let Some(result) = self.metamethod_result(method, vec![a.clone(), rhs])? {
                    self.set_register(dst, result)?;
                    self.ip += 1;
                }
                return Ok(());
            }
        }
        self.raise(
            ErrorKind::Type,
            format!(
                "attempt to concatenate {} and {}",
                a.type_name(),
                rhs.type_name()
            ),
        );
        Ok(())
    }

    /// Validate a jump displacement against the instruction vector. Landing
    /// one past the end is a clean halt at the next fetch.
    fn jump_target(&self, raw: u16) -> Result<usize, VmError> {
        let target = self.ip as i64 + 1 + i64::from(Instruction::offset(raw));
        if target < 0 || target as usize > self.program.code.len() {
            return Err(VmError::new(
                ErrorKind::BadJump,
                format!("jump target {target} outside program"),
            ));
        }
        Ok(target as usize)
    }

    /// Construct a closure: consume the `CAPTURE` descriptors that follow,
    /// then skip the body (to the matching `RETURN`, tracking nesting).
    fn load_function(&mut self, dst: u16, nupv: usize, arity: usize) -> Result<(), VmError> {
        let mut upvalues = Vec::with_capacity(nupv);
        let mut opened = Vec::new();
        for j in 0..nupv {
            let descriptor = self.program.code.get(self.ip + 1 + j).copied().ok_or_else(|| {
                VmError::new(ErrorKind::BadJump, "function captures extend past program end")
            })?;
            if descriptor.op != OpCode::Capture {
                return Err(VmError::new(
                    ErrorKind::InvalidOpcode,
                    format!(
                        "expected CAPTURE descriptor, found {}",
                        descriptor.op.mnemonic()
                    ),
                ));
            }
            match descriptor.a {
                0 => {
                    let upv = Upvalue::open(usize::from(descriptor.b));
                    opened.push(std::sync::Arc::clone(&upv));
                    upvalues.push(upv);
                }
                1 => {
                    let parent = match &self.frame().callee {
                        crate::state::Callee::Closure(c) => std::sync::Arc::clone(c),
                        _ => {
                            return Err(VmError::new(
                                ErrorKind::InvalidOpcode,
                                "upvalue capture outside a closure",
                            ))
                        }
                    };
                    let upv = parent.upvalues.get(usize::from(descriptor.b)).ok_or_else(|| {
                        VmError::new(
                            ErrorKind::BadRegister,
                            format!("upvalue index {} out of range", descriptor.b),
                        )
                    })?;
                    upvalues.push(std::sync::Arc::clone(upv));
                }
                kind => {
                    return Err(VmError::new(
                        ErrorKind::InvalidOpcode,
                        format!("unknown capture kind {kind}"),
                    ))
                }
            }
        }

        let entry = self.ip + 1 + nupv;
        let mut scan = entry;
        let mut nesting = 0usize;
        let end = loop {
            let instr = self.program.code.get(scan).ok_or_else(|| {
                VmError::new(ErrorKind::BadJump, "unterminated function body")
            })?;
            match instr.op {
                OpCode::LoadFunction => nesting += 1,
                OpCode::Return => {
                    if nesting == 0 {
                        break scan;
                    }
                    nesting -= 1;
                }
                _ => {}
            }
            scan += 1;
        };

        let closure = std::sync::Arc::new(crate::value::ClosureObj {
            entry,
            arity,
            upvalues,
        });
        self.frame_mut().open_upvalues.extend(opened);
        self.set_register(dst, Value::Closure(closure))?;
        self.ip = end + 1;
        Ok(())
    }

    /// Resolve a `GETGLOBAL`/`SETGLOBAL` identifier constant to its hash.
    fn global_id(&self, k: u16) -> Result<(u32, VmStr), VmError> {
        match self.program.constant(k)? {
            Value::Str(name) => Ok((name.hash(), name.clone())),
            other => Err(VmError::new(
                ErrorKind::BadConstant,
                format!("global identifier constant is {}, not string", other.type_name()),
            )),
        }
    }

    fn running_closure(&self) -> Option<crate::value::ClosureRef> {
        match &self.frame().callee {
            crate::state::Callee::Closure(c) => Some(std::sync::Arc::clone(c)),
            _ => None,
        }
    }

    // ---- the dispatch table ---------------------------------------------

    fn step(&mut self, instr: Instruction) -> Result<(), VmError> {
        use OpCode::*;

        let Instruction { op, a, b, c } = instr;
        match op {
            Nop => self.ip += 1,

            Add | Sub | Mul | Div | Mod | Pow => {
                let arith_op = match op {
                    Add => ArithOp::Add,
                    Sub => ArithOp::Sub,
                    Mul => ArithOp::Mul,
                    Div => ArithOp::Div,
                    Mod => ArithOp::Mod,
                    _ => ArithOp::Pow,
                };
                let rhs = self.register(c)?.clone();
                self.arith(arith_op, a, b, rhs)?;
            }
            AddK | SubK | MulK | DivK | ModK | PowK => {
                let arith_op = match op {
                    AddK => ArithOp::Add,
                    SubK => ArithOp::Sub,
                    MulK => ArithOp::Mul,
                    DivK => ArithOp::Div,
                    ModK => ArithOp::Mod,
                    _ => ArithOp::Pow,
                };
                let rhs = self.program.constant(c)?.clone();
                self.arith(arith_op, a, b, rhs)?;
            }
            Neg => self.unary_numeric(a, b, ops::num_neg, "__neg", "negate")?,
            Increment => self.unary_numeric(a, a, |v| ops::num_step(v, 1), "__inc", "increment")?,
            Decrement => self.unary_numeric(a, a, |v| ops::num_step(v, -1), "__dec", "decrement")?,

            Move => {
                let value = self.register(b)?.clone();
                self.set_register(a, value)?;
                self.ip += 1;
            }
            Swap => {
                let x = self.register(a)?.clone();
                let y = self.register(b)?.clone();
                self.set_register(a, y)?;
                self.set_register(b, x)?;
                self.ip += 1;
            }
            LoadK => {
                let value = self.program.constant(b)?.clone();
                self.set_register(a, value)?;
                self.ip += 1;
            }
            LoadNil => {
                self.set_register(a, Value::Nil)?;
                self.ip += 1;
            }
            LoadTable => {
                self.set_register(a, Value::Table(TableRef::new()))?;
                self.ip += 1;
            }
            LoadFunction => self.load_function(a, usize::from(b), usize::from(c))?,
            Capture => {
                return Err(VmError::new(
                    ErrorKind::InvalidOpcode,
                    "stray CAPTURE outside LOADFUNCTION",
                ))
            }

            Push => {
                let value = self.register(a)?.clone();
                self.push(value)?;
                self.ip += 1;
            }
            PushK => {
                let value = self.program.constant(a)?.clone();
                self.push(value)?;
                self.ip += 1;
            }
            Pop => {
                let value = self.pop()?;
                self.set_register(a, value)?;
                self.ip += 1;
            }
            GetStack => {
                let value = self.get_stack(usize::from(b));
                self.set_register(a, value)?;
                self.ip += 1;
            }
            SetStack => {
                let value = self.register(a)?.clone();
                self.set_stack(usize::from(b), value)?;
                self.ip += 1;
            }
            GetArgument => {
                let value = self.argument(usize::from(b));
                self.set_register(a, value)?;
                self.ip += 1;
            }

            GetGlobal => {
                let (id, _) = self.global_id(b)?;
                let value = self.env.globals.get(id);
                self.set_register(a, value)?;
                self.ip += 1;
            }
            SetGlobal => {
                let (id, name) = self.global_id(b)?;
                let value = self.register(a)?.clone();
                match self.env.globals.declare(id, value) {
                    Ok(()) => self.ip += 1,
                    Err(_) => self.raise(
                        ErrorKind::GlobalRedeclaration,
                        format!("cannot redeclare global '{name}'"),
                    ),
                }
            }

            Equal | NotEqual => {
                let x = self.register(b)?.clone();
                let y = self.register(c)?.clone();
                if let Some(eq) = self.values_equal(&x, &y)? {
                    let result = if op == Equal { eq } else { !eq };
                    self.set_register(a, Value::Bool(result))?;
                    self.ip += 1;
                }
            }
            Less | Greater | LessOrEqual | GreaterOrEqual => {
                let kind = match op {
                    Less => Cmp::Lt,
                    Greater => Cmp::Gt,
                    LessOrEqual => Cmp::Le,
                    _ => Cmp::Ge,
                };
                let x = self.register(b)?.clone();
                let y = self.register(c)?.clone();
                if let Some(result) = self.ordered(kind, x, y)? {
                    self.set_register(a, Value::Bool(result))?;
                    self.ip += 1;
                }
            }

            Jump => {
                self.ip = self.jump_target(a)?;
            }
            JumpIf | JumpIfNot => {
                let target = self.jump_target(b)?;
                let cond = self.register(a)?.truthy();
                let take = if op == JumpIf { cond } else { !cond };
                self.ip = if take { target } else { self.ip + 1 };
            }
            JumpIfEqual | JumpIfNotEqual => {
                let target = self.jump_target(c)?;
                let x = self.register(a)?.clone();
                let y = self.register(b)?.clone();
                if let Some(eq) = self.values_equal(&x, &y)? {
                    let take = if op == JumpIfEqual { eq } else { !eq };
                    self.ip = if take { target } else { self.ip + 1 };
                }
            }
            JumpIfLess | JumpIfGreater | JumpIfLessOrEqual | JumpIfGreaterOrEqual => {
                let kind = match op {
                    JumpIfLess => Cmp::Lt,
                    JumpIfGreater => Cmp::Gt,
                    JumpIfLessOrEqual => Cmp::Le,
                    _ => Cmp::Ge,
                };
                let target = self.jump_target(c)?;
                let x = self.register(a)?.clone();
                let y = self.register(b)?.clone();
                if let Some(result) = self.ordered(kind, x, y)? {
                    self.ip = if result { target } else { self.ip + 1 };
                }
            }

            Call => {
                let callee = self.register(a)?.clone();
                self.call_any(callee, usize::from(b), self.ip + 1, false)?;
            }
            NativeCall => {
                let callee = self.register(a)?.clone();
                match callee {
                    Value::Closure(closure) => {
                        self.native_call(closure, usize::from(b), false, self.ip + 1)?;
                    }
                    other => self.raise(
                        ErrorKind::Type,
                        format!("attempt to native-call a {} value", other.type_name()),
                    ),
                }
            }
            ExternCall => {
                let callee = self.register(a)?.clone();
                match callee {
                    Value::Foreign(foreign) => {
                        let ret = self.ip + 1;
                        self.extern_call(foreign, usize::from(b), false, ret)?;
                        if self.pending.is_none() {
                            self.ip = ret;
                        }
                    }
                    other => self.raise(
                        ErrorKind::Type,
                        format!("attempt to extern-call a {} value", other.type_name()),
                    ),
                }
            }
            MethodCall => {
                let callee = self.register(a)?.clone();
                match callee {
                    Value::Table(t) => {
                        let method = t.get_named("__call");
                        if method.is_nil() {
                            self.raise(
                                ErrorKind::Type,
                                "attempt to call a table without a __call metamethod",
                            );
                        } else {
                            // The table rides along as the receiver.
                            self.push(Value::Table(t))?;
                            self.call_any(method, usize::from(b) + 1, self.ip + 1, false)?;
                        }
                    }
                    other => self.raise(
                        ErrorKind::Type,
                        format!("attempt to method-call a {} value", other.type_name()),
                    ),
                }
            }
            Return => self.do_return(usize::from(a))?,

            GetUpvalue | SetUpvalue => {
                let Some(closure) = self.running_closure() else {
                    return Err(VmError::new(
                        ErrorKind::InvalidOpcode,
                        "upvalue access outside a closure",
                    ));
                };
                let upv = closure.upvalues.get(usize::from(b)).ok_or_else(|| {
                    VmError::new(
                        ErrorKind::BadRegister,
                        format!("upvalue index {b} out of range"),
                    )
                })?;
                if op == GetUpvalue {
                    let value = upv.get(&self.stack);
                    self.set_register(a, value)?;
                } else {
                    let value = self.register(a)?.clone();
                    upv.set(&mut self.stack, value);
                }
                self.ip += 1;
            }

            GetTable => {
                let table = self.register(b)?.clone();
                let key = self.register(c)?.clone();
                match (&table, TableKey::of(&key)) {
                    (Value::Table(t), Some(key)) => {
                        let value = t.get(key, true);
                        self.set_register(a, value)?;
                        self.ip += 1;
                    }
                    (Value::Table(_), None) => self.raise(
                        ErrorKind::Type,
                        format!("attempt to index table with a {} key", key.type_name()),
                    ),
                    _ => self.raise(
                        ErrorKind::Type,
                        format!("attempt to index a {} value", table.type_name()),
                    ),
                }
            }
            SetTable => {
                let value = self.register(a)?.clone();
                let table = self.register(b)?.clone();
                let key = self.register(c)?.clone();
                match (&table, TableKey::of(&key)) {
                    (Value::Table(t), Some(key)) => match t.set(key, value) {
                        Ok(()) => self.ip += 1,
                        Err(()) => {
                            self.raise(ErrorKind::FrozenTable, "attempt to modify a frozen table")
                        }
                    },
                    (Value::Table(_), None) => self.raise(
                        ErrorKind::Type,
                        format!("attempt to index table with a {} key", key.type_name()),
                    ),
                    _ => self.raise(
                        ErrorKind::Type,
                        format!("attempt to index a {} value", table.type_name()),
                    ),
                }
            }
            NextTable => {
                let table = self.register(b)?.clone();
                match table {
                    Value::Table(t) => {
                        let value = self.cursor_next(&t).unwrap_or(Value::Nil);
                        self.set_register(a, value)?;
                        self.ip += 1;
                    }
                    other => self.raise(
                        ErrorKind::Type,
                        format!("attempt to iterate a {} value", other.type_name()),
                    ),
                }
            }
            LenTable => {
                let table = self.register(b)?.clone();
                match table {
                    Value::Table(t) => {
                        let method = t.get_named("__len");
                        if method.is_nil() {
                            self.set_register(a, Value::Int(t.len()))?;
                            self.ip += 1;
                        } else if let Some(result) =
                            self.metamethod_result(method, vec![Value::Table(t)])?
                        {
                            self.set_register(a, result)?;
                            self.ip += 1;
                        }
                    }
                    other => self.raise(
                        ErrorKind::Type,
                        format!("attempt to take table length of a {} value", other.type_name()),
                    ),
                }
            }
            Freeze => {
                let table = self.register(a)?.clone();
                match table {
                    Value::Table(t) => {
                        t.freeze();
                        self.ip += 1;
                    }
                    other => self.raise(
                        ErrorKind::Type,
                        format!("attempt to freeze a {} value", other.type_name()),
                    ),
                }
            }

            Concat => {
                let rhs = self.register(c)?.clone();
                self.concat(a, b, rhs)?;
            }
            ConcatK => {
                let rhs = self.program.constant(c)?.clone();
                self.concat(a, b, rhs)?;
            }

            GetString => {
                let string = self.register(b)?.clone();
                let index = self.register(c)?.clone();
                match (&string, &index) {
                    (Value::Str(s), Value::Int(i)) => {
                        let value = usize::try_from(*i)
                            .ok()
                            .and_then(|i| s.as_str().chars().nth(i))
                            .map_or(Value::Nil, |ch| Value::Int(i64::from(u32::from(ch))));
                        self.set_register(a, value)?;
                        self.ip += 1;
                    }
                    (Value::Str(_), other) => self.raise(
                        ErrorKind::Type,
                        format!("attempt to index string with a {} key", other.type_name()),
                    ),
                    (other, _) => self.raise(
                        ErrorKind::Type,
                        format!("attempt to index a {} value as string", other.type_name()),
                    ),
                }
            }
            LenString => {
                let string = self.register(b)?.clone();
                match string {
                    Value::Str(s) => {
                        self.set_register(a, Value::Int(s.len() as i64))?;
                        self.ip += 1;
                    }
                    other => self.raise(
                        ErrorKind::Type,
                        format!("attempt to take string length of a {} value", other.type_name()),
                    ),
                }
            }

            Len => {
                let value = self.register(b)?.clone();
                if let Value::Table(t) = &value {
                    let method = t.get_named("__len");
                    if !method.is_nil() {
                        if let Some(result) = self.metamethod_result(method, vec![value.clone()])? {
                            self.set_register(a, result)?;
                            self.ip += 1;
                        }
                        return Ok(());
                    }
                }
                self.set_register(a, ops::len(&value))?;
                self.ip += 1;
            }
            Type => {
                let name = self.register(b)?.type_name();
                let value = Value::Str(self.env.intern(name));
                self.set_register(a, value)?;
                self.ip += 1;
            }
            TypeOf => {
                let value = self.register(b)?.clone();
                let name = match &value {
                    Value::Table(t) => match t.get_named("__type") {
                        Value::Str(s) => s,
                        _ => self.env.intern(value.type_name()),
                    },
                    other => self.env.intern(other.type_name()),
                };
                self.set_register(a, Value::Str(name))?;
                self.ip += 1;
            }

            Halt => {
                self.halted = true;
            }
            Exit => {
                self.exit_code = i32::from(a as i16);
                self.halted = true;
            }
        }
        Ok(())
    }
}

/// Concatenable operand rendering: strings and numbers only.
fn concat_part(v: &Value) -> Option<String> {
    match v {
        Value::Str(_) | Value::Int(_) | Value::Float(_) => Some(ops::display(v)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::GlobalEnv;
    use crate::program::{Constant, Program};
    use std::sync::Arc;

    fn run_program(build: impl FnOnce(&mut crate::program::ProgramBuilder)) -> Vm {
        let env = GlobalEnv::new();
        let mut b = Program::builder();
        build(&mut b);
        let program = Arc::new(b.build(&env.strings));
        let mut vm = Vm::new(program, env);
        vm.execute().expect("program runs");
        vm
    }

    #[test]
    fn test_nop_and_run_off_the_end_halts() {
        let vm = run_program(|b| {
            b.emit(OpCode::Nop, 0, 0, 0);
            b.emit(OpCode::Nop, 0, 0, 0);
        });
        assert_eq!(vm.exit_code(), 0);
    }

    #[test]
    fn test_move_swap_loadnil() {
        let vm = run_program(|b| {
            let k = b.constant(Constant::Int(9));
            b.emit(OpCode::LoadK, 0, k, 0);
            b.emit(OpCode::Move, 1, 0, 0);
            b.emit(OpCode::LoadNil, 0, 0, 0);
            b.emit(OpCode::Swap, 0, 1, 0);
            b.emit(OpCode::Halt, 0, 0, 0);
        });
        assert_eq!(*vm.register(0).unwrap(), Value::Int(9));
        assert_eq!(*vm.register(1).unwrap(), Value::Nil);
    }

    #[test]
    fn test_backward_jump_loops_and_terminates() {
        // r0 = 3; while r0 != 0 { r0-- } ; push r0
        let mut vm = run_program(|b| {
            let k3 = b.constant(Constant::Int(3));
            let k0 = b.constant(Constant::Int(0));
            b.emit(OpCode::LoadK, 0, k3, 0); // 0
            b.emit(OpCode::LoadK, 1, k0, 0); // 1
            b.emit(OpCode::JumpIfEqual, 0, 1, 2); // 2 -> 5 when r0 == r1
            b.emit(OpCode::Decrement, 0, 0, 0); // 3
            b.emit(OpCode::Jump, (-3i16) as u16, 0, 0); // 4 -> 2
            b.emit(OpCode::Push, 0, 0, 0); // 5
            b.emit(OpCode::Halt, 0, 0, 0); // 6
        });
        assert_eq!(vm.pop().unwrap(), Value::Int(0));
    }

    #[test]
    fn test_jump_out_of_range_is_fatal() {
        let env = GlobalEnv::new();
        let mut b = Program::builder();
        b.emit(OpCode::Jump, 500, 0, 0);
        let program = Arc::new(b.build(&env.strings));
        let mut vm = Vm::new(program, env);
        let err = vm.execute().unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadJump);
    }

    #[test]
    fn test_exit_code_is_sign_extended() {
        let vm = run_program(|b| {
            b.emit(OpCode::Exit, 3, 0, 0);
        });
        assert_eq!(vm.exit_code(), 3);
    }
}
