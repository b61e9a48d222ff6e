//! VM state: registers, the evaluation stack, and the frame chain
//!
//! One `Vm` owns one register file, one evaluation stack, and one frame
//! arena, and is driven by exactly one thread; none of them need locking.
//! The only shared pieces are the interner and globals behind
//! [`GlobalEnv`].
//!
//! Frames live in a `Vec` and refer to each other by position - the caller
//! of `frames[i]` is `frames[i - 1]` - so error unwinding and upvalue
//! closing walk indices instead of pointers into a stack that may move.

use crate::error::{ErrorKind, PendingError, VmError};
use crate::globals::GlobalEnv;
use crate::program::Program;
use crate::value::{ClosureRef, ForeignRef, Upvalue, Value};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Register file size. The instruction format admits 65,536 registers; the
/// code generator never uses more than this.
pub const REGISTER_COUNT: usize = 128;

/// Evaluation stack depth limit.
pub const STACK_DEPTH: usize = 256 * 1024;

/// Call depth limit (frame count).
pub const FRAME_DEPTH: usize = 16 * 1024;

/// What a frame is executing.
#[derive(Clone, Debug)]
pub enum Callee {
    /// The synthetic root frame under the program's top level.
    Root,
    Closure(ClosureRef),
    Foreign(ForeignRef),
}

impl Callee {
    /// One-line description for frame traces.
    pub fn describe(&self) -> String {
        match self {
            Callee::Root => "<main>".to_string(),
            Callee::Closure(c) => format!("<function@0x{:x}>", Arc::as_ptr(c) as usize),
            Callee::Foreign(f) => {
                format!("<cfunction@0x{:x}> ({})", Arc::as_ptr(f) as usize, f.name)
            }
        }
    }
}

/// An activation record.
#[derive(Debug)]
pub struct Frame {
    pub callee: Callee,
    /// Where the dispatcher resumes when this frame returns.
    pub ret_addr: usize,
    /// `sp` at call entry; the arg window sits just below it.
    pub saved_sp: usize,
    pub argc: usize,
    /// Whether this frame may catch a propagated error.
    pub error_handler: bool,
    /// Upvalues opened over this frame's stack slots, closed on return.
    pub open_upvalues: Vec<Arc<Upvalue>>,
}

/// A single execution state driven by the dispatcher.
pub struct Vm {
    pub(crate) program: Arc<Program>,
    pub(crate) env: Arc<GlobalEnv>,
    pub(crate) ip: usize,
    pub(crate) registers: Vec<Value>,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) pending: Option<PendingError>,
    /// Most recently caught error: handler frame index + message
    /// (protected-call support).
    pub(crate) caught: Option<(usize, String)>,
    pub(crate) abort: Arc<AtomicBool>,
    pub(crate) halted: bool,
    pub(crate) exit_code: i32,
    /// NEXTTABLE cursors, keyed by table identity.
    pub(crate) cursors: FxHashMap<usize, usize>,
}

impl Vm {
    pub fn new(program: Arc<Program>, env: Arc<GlobalEnv>) -> Self {
        let entry = program.entry as usize;
        Self {
            program,
            env,
            ip: entry,
            registers: vec![Value::Nil; REGISTER_COUNT],
            stack: Vec::new(),
            frames: vec![Frame {
                callee: Callee::Root,
                ret_addr: 0,
                saved_sp: 0,
                argc: 0,
                error_handler: false,
                open_upvalues: Vec::new(),
            }],
            pending: None,
            caught: None,
            abort: Arc::new(AtomicBool::new(false)),
            halted: false,
            exit_code: 0,
            cursors: FxHashMap::default(),
        }
    }

    pub fn env(&self) -> &Arc<GlobalEnv> {
        &self.env
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Handle for requesting a cooperative unwind from another thread.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub(crate) fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    // ---- registers -------------------------------------------------------

    fn reg_index(reg: u16) -> Result<usize, VmError> {
        let idx = usize::from(reg);
        if idx < REGISTER_COUNT {
            Ok(idx)
        } else {
            Err(VmError::new(
                ErrorKind::BadRegister,
                format!("register r{reg} out of range"),
            ))
        }
    }

    pub fn register(&self, reg: u16) -> Result<&Value, VmError> {
        Ok(&self.registers[Self::reg_index(reg)?])
    }

    /// Drops the slot's prior contents.
    pub fn set_register(&mut self, reg: u16, value: Value) -> Result<(), VmError> {
        let idx = Self::reg_index(reg)?;
        self.registers[idx] = value;
        Ok(())
    }

    // ---- evaluation stack ------------------------------------------------

    pub fn sp(&self) -> usize {
        self.stack.len()
    }

    pub fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.stack.len() >= STACK_DEPTH {
            return Err(VmError::new(ErrorKind::StackOverflow, "stack overflow"));
        }
        self.stack.push(value);
        Ok(())
    }

    /// Decrement, then read.
    pub fn pop(&mut self) -> Result<Value, VmError> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::new(ErrorKind::StackUnderflow, "stack underflow"))
    }

    pub fn top(&self) -> Result<&Value, VmError> {
        self.stack
            .last()
            .ok_or_else(|| VmError::new(ErrorKind::StackUnderflow, "stack underflow"))
    }

    /// Read a slot at an absolute offset from the stack base; nil out of
    /// range.
    pub fn get_stack(&self, off: usize) -> Value {
        self.stack.get(off).cloned().unwrap_or(Value::Nil)
    }

    /// Write a live slot at an absolute offset from the stack base.
    pub fn set_stack(&mut self, off: usize, value: Value) -> Result<(), VmError> {
        match self.stack.get_mut(off) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(VmError::new(
                ErrorKind::StackOverflow,
                format!("stack slot {off} out of range"),
            )),
        }
    }

    // ---- frames and arguments --------------------------------------------

    /// The running frame. The arena always holds at least the root.
    pub(crate) fn frame(&self) -> &Frame {
        self.frames.last().expect("frame arena holds the root")
    }

    pub(crate) fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame arena holds the root")
    }

    pub fn frame_argc(&self) -> usize {
        self.frame().argc
    }

    /// The i-th argument of the running frame; nil when out of range.
    ///
    /// Arguments are laid out by the caller in order just below the saved
    /// stack pointer, so `argument(i)` reads `saved_sp - argc + i`.
    pub fn argument(&self, i: usize) -> Value {
        let frame = self.frame();
        if i >= frame.argc {
            return Value::Nil;
        }
        let slot = frame.saved_sp - frame.argc + i;
        self.stack.get(slot).cloned().unwrap_or(Value::Nil)
    }

    /// Pop the running frame's arguments off the stack, in argument order.
    /// Foreign functions call this to honor the call protocol.
    pub fn take_arguments(&mut self) -> Result<Vec<Value>, VmError> {
        let argc = self.frame().argc;
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();
        Ok(args)
    }

    pub(crate) fn push_frame(
        &mut self,
        callee: Callee,
        argc: usize,
        error_handler: bool,
        ret_addr: usize,
    ) -> Result<(), VmError> {
        if self.frames.len() >= FRAME_DEPTH {
            return Err(VmError::new(ErrorKind::StackOverflow, "call depth exceeded"));
        }
        self.frames.push(Frame {
            callee,
            ret_addr,
            saved_sp: self.stack.len(),
            argc,
            error_handler,
            open_upvalues: Vec::new(),
        });
        Ok(())
    }

    /// Pop the running frame, closing every upvalue opened over its slots
    /// while they are still live.
    pub(crate) fn pop_frame_closing(&mut self) -> Frame {
        let frame = self.frames.pop().expect("frame arena holds the root");
        for upv in &frame.open_upvalues {
            if let Some(slot) = upv.open_slot() {
                let value = self.stack.get(slot).cloned().unwrap_or(Value::Nil);
                upv.close(value);
            }
        }
        frame
    }

    /// Begin executing a closure: capture the return point, snapshot `sp`,
    /// and land on the entry instruction.
    pub(crate) fn native_call(
        &mut self,
        closure: ClosureRef,
        argc: usize,
        error_handler: bool,
        ret_addr: usize,
    ) -> Result<(), VmError> {
        trace!(entry = closure.entry, argc, "native call");
        let entry = closure.entry;
        self.push_frame(Callee::Closure(closure), argc, error_handler, ret_addr)?;
        self.ip = entry;
        Ok(())
    }

    /// Invoke a foreign function behind a synthetic frame (so the trace has
    /// an entry). The foreign pops its arguments and pushes its results; a
    /// recoverable error return becomes pending state handled by the
    /// propagation step, with the synthetic frame still in place.
    pub(crate) fn extern_call(
        &mut self,
        foreign: ForeignRef,
        argc: usize,
        error_handler: bool,
        ret_addr: usize,
    ) -> Result<(), VmError> {
        trace!(name = &*foreign.name, argc, "extern call");
        let error_handler = error_handler || foreign.error_handler;
        self.push_frame(Callee::Foreign(foreign.clone()), argc, error_handler, ret_addr)?;
        let depth = self.frames.len();

        match (foreign.func)(self) {
            Ok(()) => {}
            Err(e) if e.kind.is_fatal() => return Err(e),
            Err(e) => self.raise(e.kind, e.message),
        }

        if self.pending.is_none() {
            // Drop the synthetic frame (and anything a misbehaving foreign
            // left above it). With an error pending it stays for the
            // propagation step.
            while self.frames.len() >= depth {
                self.pop_frame_closing();
            }
        }
        Ok(())
    }

    /// `RETURN retc`: buffer the return values, restore the caller, drop
    /// the argument window, and replay the buffer so the caller sees the
    /// values top-of-stack in their original order.
    pub(crate) fn do_return(&mut self, retc: usize) -> Result<(), VmError> {
        if self.frames.len() == 1 {
            return Err(VmError::new(
                ErrorKind::InvalidOpcode,
                "return outside a function",
            ));
        }
        let mut rets = Vec::with_capacity(retc);
        for _ in 0..retc {
            rets.push(self.pop()?);
        }
        let frame = self.pop_frame_closing();
        self.ip = frame.ret_addr;
        self.stack
            .truncate(frame.saved_sp.saturating_sub(frame.argc));
        for value in rets.into_iter().rev() {
            self.push(value)?;
        }
        trace!(ret = self.ip, "return");
        Ok(())
    }

    // ---- errors ----------------------------------------------------------

    /// Record a recoverable error; the dispatch loop propagates it before
    /// the next fetch.
    pub fn raise(&mut self, kind: ErrorKind, message: impl Into<String>) {
        debug_assert!(!kind.is_fatal(), "fatal errors return Err directly");
        if self.pending.is_none() {
            self.pending = Some(PendingError {
                kind,
                message: message.into(),
            });
        }
    }

    /// Frame trace, innermost first.
    pub(crate) fn trace_lines(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .enumerate()
            .map(|(i, frame)| format!("#{i} {}", frame.callee.describe()))
            .collect()
    }

    /// Advance this table's traversal cursor, yielding the next entry or
    /// `None` (which resets the cursor) when exhausted.
    pub(crate) fn cursor_next(&mut self, table: &crate::table::TableRef) -> Option<Value> {
        let id = table.identity();
        let pos = self.cursors.get(&id).copied().unwrap_or(0);
        match table.entry_at(pos) {
            Some(value) => {
                self.cursors.insert(id, pos + 1);
                Some(value)
            }
            None => {
                self.cursors.remove(&id);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{TableKey, TableRef};

    fn empty_vm() -> Vm {
        let env = GlobalEnv::new();
        let program = Arc::new(Program::builder().build(&env.strings));
        Vm::new(program, env)
    }

    #[test]
    fn test_registers_start_nil_and_bounds_are_fatal() {
        let mut vm = empty_vm();
        assert_eq!(*vm.register(0).unwrap(), Value::Nil);
        assert_eq!(*vm.register(127).unwrap(), Value::Nil);
        let err = vm.register(128).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRegister);
        assert!(vm.set_register(60000, Value::Nil).is_err());
    }

    #[test]
    fn test_push_pop_discipline() {
        let mut vm = empty_vm();
        vm.push(Value::Int(1)).unwrap();
        vm.push(Value::Int(2)).unwrap();
        assert_eq!(*vm.top().unwrap(), Value::Int(2));
        assert_eq!(vm.pop().unwrap(), Value::Int(2));
        assert_eq!(vm.pop().unwrap(), Value::Int(1));
        let err = vm.pop().unwrap_err();
        assert_eq!(err.kind, ErrorKind::StackUnderflow);
    }

    #[test]
    fn test_stack_slot_access() {
        let mut vm = empty_vm();
        vm.push(Value::Int(10)).unwrap();
        vm.push(Value::Int(20)).unwrap();
        assert_eq!(vm.get_stack(0), Value::Int(10));
        assert_eq!(vm.get_stack(5), Value::Nil);
        vm.set_stack(1, Value::Int(21)).unwrap();
        assert_eq!(vm.get_stack(1), Value::Int(21));
        assert!(vm.set_stack(9, Value::Nil).is_err());
    }

    #[test]
    fn test_arguments_read_in_order_and_lenient() {
        let mut vm = empty_vm();
        vm.push(Value::Int(100)).unwrap();
        vm.push(Value::Int(200)).unwrap();
        vm.push_frame(Callee::Root, 2, false, 0).unwrap();
        assert_eq!(vm.argument(0), Value::Int(100));
        assert_eq!(vm.argument(1), Value::Int(200));
        assert_eq!(vm.argument(2), Value::Nil);
        assert_eq!(vm.argument(99), Value::Nil);
    }

    #[test]
    fn test_take_arguments_in_order() {
        let mut vm = empty_vm();
        vm.push(Value::Int(1)).unwrap();
        vm.push(Value::Int(2)).unwrap();
        vm.push(Value::Int(3)).unwrap();
        vm.push_frame(Callee::Root, 3, false, 0).unwrap();
        let args = vm.take_arguments().unwrap();
        assert_eq!(args, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(vm.sp(), 0);
    }

    #[test]
    fn test_return_restores_caller_window() {
        let mut vm = empty_vm();
        // Caller pushes two args, callee pushes a local and two returns.
        vm.push(Value::Int(1)).unwrap();
        vm.push(Value::Int(2)).unwrap();
        vm.push_frame(Callee::Root, 2, false, 7).unwrap();
        vm.push(Value::Int(99)).unwrap(); // local, dropped by the restore
        vm.push(Value::Int(10)).unwrap();
        vm.push(Value::Int(20)).unwrap();
        vm.do_return(2).unwrap();

        assert_eq!(vm.ip, 7);
        // Args gone, returns in original order: 10 below 20.
        assert_eq!(vm.sp(), 2);
        assert_eq!(vm.pop().unwrap(), Value::Int(20));
        assert_eq!(vm.pop().unwrap(), Value::Int(10));
    }

    #[test]
    fn test_return_closes_open_upvalues() {
        let mut vm = empty_vm();
        vm.push_frame(Callee::Root, 0, false, 0).unwrap();
        vm.push(Value::Int(5)).unwrap();
        let upv = Upvalue::open(0);
        vm.frame_mut().open_upvalues.push(Arc::clone(&upv));

        vm.do_return(0).unwrap();
        assert_eq!(upv.open_slot(), None);
        assert_eq!(upv.get(&[]), Value::Int(5));
    }

    #[test]
    fn test_return_at_root_is_fatal() {
        let mut vm = empty_vm();
        let err = vm.do_return(0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidOpcode);
    }

    #[test]
    fn test_cursor_walks_then_resets() {
        let mut vm = empty_vm();
        let t = TableRef::new();
        t.set(TableKey::Index(0), Value::Int(1)).unwrap();
        t.set(TableKey::from_name("k"), Value::Int(2)).unwrap();

        assert_eq!(vm.cursor_next(&t), Some(Value::Int(1)));
        assert_eq!(vm.cursor_next(&t), Some(Value::Int(2)));
        assert_eq!(vm.cursor_next(&t), None);
        // Exhaustion resets: traversal restarts.
        assert_eq!(vm.cursor_next(&t), Some(Value::Int(1)));
    }
}
