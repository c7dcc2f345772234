//! The virtual machine
//!
//! State per instance: operand stack (a growable vector; the stack pointer
//! is its length), base pointer `sb` (points at `this` of the current
//! frame; the callee sits below it, arguments above, locals above those),
//! the stash chain, a call stack of saved contexts, and auxiliary stacks
//! for try frames, iteration and references. Faults propagate as `Err`
//! values; the run loop owns unwinding into try frames.

mod conv;
mod exec;

use crate::errors::StackFrame;
use crate::instr::BindingAttr;
use crate::object::{FuncKind, JsObject, PropKey, ScriptFunc};
use crate::program::Program;
use crate::runtime::Realm;
use crate::value::Value;
use skiff_core::JsString;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// How many instructions run between cooperative interrupt checks.
const INTERRUPT_PERIOD: u32 = 10_000;

/// Call depth limit; exceeding raises a catchable range error.
const MAX_CALL_DEPTH: usize = 2000;

/// A raised condition travelling up the dispatch loop.
#[derive(Debug)]
pub enum VmFault {
    /// A script value was thrown; catchable.
    Thrown(Value),
    /// Host-initiated interruption; never catchable.
    Interrupt(Value),
}

/// Cross-thread interrupt channel shared between the VM and the host.
pub struct InterruptState {
    flag: AtomicBool,
    payload: Mutex<Option<String>>,
}

impl InterruptState {
    pub fn new() -> Arc<InterruptState> {
        Arc::new(InterruptState {
            flag: AtomicBool::new(false),
            payload: Mutex::new(None),
        })
    }

    pub fn set(&self, payload: impl Into<String>) {
        if let Ok(mut slot) = self.payload.lock() {
            *slot = Some(payload.into());
        }
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.payload.lock() {
            *slot = None;
        }
    }

    fn take(&self) -> Option<String> {
        if !self.flag.swap(false, Ordering::SeqCst) {
            return None;
        }
        self.payload
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .or_else(|| Some(String::new()))
    }

    fn armed(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

impl Default for InterruptState {
    fn default() -> Self {
        InterruptState {
            flag: AtomicBool::new(false),
            payload: Mutex::new(None),
        }
    }
}

/// A runtime environment record. Slot values start as `Empty`; lexical
/// slots trap until initialized. `names` is present when the frame
/// supports by-name lookup (direct eval, blocks visible to it, the global
/// frame); `obj` is the bound object of `with` frames and the global
/// frame.
pub struct Stash {
    pub values: Vec<Value>,
    pub names: Option<HashMap<JsString, (u32, BindingAttr)>>,
    pub obj: Option<JsObject>,
    pub outer: Option<Rc<RefCell<Stash>>>,
    /// Function boundary: the variable environment for eval-introduced
    /// vars.
    pub function: bool,
}

impl Stash {
    pub fn get_slot(&self, idx: u32) -> Value {
        self.values
            .get(idx as usize)
            .cloned()
            .unwrap_or(Value::Empty)
    }

    pub fn set_slot(&mut self, idx: u32, v: Value) {
        let idx = idx as usize;
        if idx >= self.values.len() {
            self.values.resize(idx + 1, Value::Empty);
        }
        self.values[idx] = v;
    }

    /// Add a by-name binding (eval-introduced vars).
    pub fn add_named(&mut self, name: JsString, attr: BindingAttr, v: Value) {
        let idx = self.values.len() as u32;
        self.values.push(v);
        self.names
            .get_or_insert_with(HashMap::new)
            .insert(name, (idx, attr));
    }
}

/// A saved execution context, pushed per nested call. A negative resume
/// pc marks a host (re-)entry frame: returning through it halts the
/// dispatch loop.
pub struct Context {
    pub prg: Rc<Program>,
    pub stash: Option<Rc<RefCell<Stash>>>,
    pub pc: isize,
    pub sb: usize,
    pub args: usize,
    pub new_target: Value,
    pub result: Value,
}

/// A transient addressable place, living on the reference stack.
pub enum RefRecord {
    /// A stash slot found by name or produced by `ResolveMixed`.
    Slot {
        stash: Rc<RefCell<Stash>>,
        idx: u32,
        attr: BindingAttr,
        name: JsString,
    },
    /// A property of a `with` object.
    Prop {
        base: JsObject,
        name: JsString,
        strict: bool,
    },
    /// An unresolved name falling through to the global object.
    Global { name: JsString, strict: bool },
}

/// Iteration-stack record.
pub enum IterRecord {
    /// for..in key enumeration: keys snapshotted at entry, deleted keys
    /// skipped at yield time.
    Enum {
        obj: JsObject,
        keys: Vec<JsString>,
        idx: usize,
        started: bool,
    },
    /// for..of protocol iterator.
    Iter { iterator: JsObject, done: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryState {
    InTry,
    InCatch,
    InFinally,
}

/// What a finally block does when it completes normally.
pub enum FinallyExit {
    None,
    /// Continue at this pc (normal completion, break/continue chains).
    Resume(usize),
    /// Re-raise the pending exception.
    Rethrow(Value),
    /// Continue a `return` that was intercepted by the finally.
    Return(Value),
}

/// An unwind record installed by the `Try` instruction.
pub struct TryFrame {
    pub catch_pc: i32,
    pub finally_pc: i32,
    pub sp: usize,
    pub stash: Option<Rc<RefCell<Stash>>>,
    pub call_depth: usize,
    pub iter_len: usize,
    pub ref_len: usize,
    pub state: TryState,
    pub exit: FinallyExit,
}

pub struct Vm {
    pub stack: Vec<Value>,
    pub sb: usize,
    pub args: usize,
    pub prg: Rc<Program>,
    pub pc: usize,
    pub stash: Option<Rc<RefCell<Stash>>>,
    pub call_stack: Vec<Context>,
    pub iter_stack: Vec<IterRecord>,
    pub ref_stack: Vec<RefRecord>,
    pub try_stack: Vec<TryFrame>,
    pub new_target: Value,
    /// Script/eval completion register.
    pub result: Value,
    pub realm: Rc<Realm>,
    pub interrupt: Arc<InterruptState>,
    icount: u32,
    halted: bool,
}

/// Result of walking the stash chain for a name.
pub enum DynLookup {
    Slot {
        stash: Rc<RefCell<Stash>>,
        idx: u32,
        attr: BindingAttr,
    },
    WithObj(JsObject),
    Global,
}

impl Vm {
    pub fn new(realm: Rc<Realm>, prg: Rc<Program>, interrupt: Arc<InterruptState>) -> Vm {
        Vm {
            stack: Vec::with_capacity(64),
            sb: 0,
            args: 0,
            prg,
            pc: 0,
            stash: None,
            call_stack: Vec::new(),
            iter_stack: Vec::new(),
            ref_stack: Vec::new(),
            try_stack: Vec::new(),
            new_target: Value::Undefined,
            result: Value::Undefined,
            realm,
            interrupt,
            icount: 0,
            halted: false,
        }
    }

    // ------------------------------------------------------------------
    // Operand stack
    // ------------------------------------------------------------------

    pub fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Undefined)
    }

    pub fn peek(&self) -> Value {
        self.stack.last().cloned().unwrap_or(Value::Undefined)
    }

    pub fn sp(&self) -> usize {
        self.stack.len()
    }

    /// Frame-relative slot resolution: 0 is `this`, negative addresses
    /// arguments, positive addresses locals above the argument window.
    fn stack_slot(&self, idx: i32) -> usize {
        if idx <= 0 {
            self.sb + (-idx) as usize
        } else {
            self.sb + self.args + idx as usize
        }
    }

    pub fn read_stack(&self, idx: i32) -> Value {
        self.stack
            .get(self.stack_slot(idx))
            .cloned()
            .unwrap_or(Value::Empty)
    }

    pub fn write_stack(&mut self, idx: i32, v: Value) {
        let slot = self.stack_slot(idx);
        if slot >= self.stack.len() {
            self.stack.resize(slot + 1, Value::Empty);
        }
        self.stack[slot] = v;
    }

    // ------------------------------------------------------------------
    // Fault constructors
    // ------------------------------------------------------------------

    /// Build a thrown error object on the given intrinsic prototype; the
    /// `name` comes from the prototype chain.
    pub fn throw_error(&mut self, proto: &JsObject, msg: &str) -> VmFault {
        let obj = JsObject::new(
            Some(proto.clone()),
            "Error",
            crate::object::ObjectKind::Plain,
        );
        obj.put_value(&PropKey::str("message"), Value::str(msg));
        VmFault::Thrown(Value::Object(obj))
    }

    pub fn type_error(&mut self, msg: impl AsRef<str>) -> VmFault {
        let proto = self.realm.type_error_proto.clone();
        self.throw_error(&proto, msg.as_ref())
    }

    pub fn range_error(&mut self, msg: impl AsRef<str>) -> VmFault {
        let proto = self.realm.range_error_proto.clone();
        self.throw_error(&proto, msg.as_ref())
    }

    pub fn reference_error(&mut self, msg: impl AsRef<str>) -> VmFault {
        let proto = self.realm.reference_error_proto.clone();
        self.throw_error(&proto, msg.as_ref())
    }

    pub fn syntax_error(&mut self, msg: impl AsRef<str>) -> VmFault {
        let proto = self.realm.syntax_error_proto.clone();
        self.throw_error(&proto, msg.as_ref())
    }

    /// Temporal-dead-zone violation.
    pub fn init_error(&mut self, name: &JsString) -> VmFault {
        self.reference_error(format!(
            "Cannot access '{}' before initialization",
            name
        ))
    }

    pub fn const_error(&mut self) -> VmFault {
        self.type_error("Assignment to constant variable.")
    }

    pub fn not_defined_error(&mut self, name: &JsString) -> VmFault {
        self.reference_error(format!("{} is not defined", name))
    }

    // ------------------------------------------------------------------
    // Dispatch loop
    // ------------------------------------------------------------------

    /// Run until the current entry halts. `base_depth` is the call depth
    /// this loop entered at; try frames below it belong to an outer loop.
    pub fn run(&mut self, base_depth: usize) -> Result<(), VmFault> {
        while !self.halted {
            if self.icount >= INTERRUPT_PERIOD {
                self.icount = 0;
                // Cooperative yield point: the atomic is only read here.
                if self.interrupt.armed() {
                    if let Some(payload) = self.interrupt.take() {
                        tracing::debug!(payload = %payload, "interrupt observed");
                        let fault = VmFault::Interrupt(Value::str(payload));
                        return Err(self.unwind(fault, base_depth));
                    }
                }
            }
            self.icount += 1;
            let prg = Rc::clone(&self.prg);
            let pc = self.pc;
            debug_assert!(pc < prg.code.len(), "pc ran off the program");
            match self.exec(&prg.code[pc]) {
                Ok(()) => {}
                Err(fault) => {
                    let fault = self.unwind(fault, base_depth);
                    match fault {
                        VmFault::Thrown(Value::Empty) => {} // handled by a try frame
                        fault => return Err(fault),
                    }
                }
            }
        }
        self.halted = false;
        Ok(())
    }

    /// Unwind into the nearest try frame that can handle the fault.
    /// Returns `Thrown(Empty)` as the "handled, keep running" signal, or
    /// the original fault if no frame at or above `base_depth` applies.
    fn unwind(&mut self, fault: VmFault, base_depth: usize) -> VmFault {
        let value = match fault {
            VmFault::Thrown(v) => v,
            // Interrupts bypass every handler.
            VmFault::Interrupt(v) => return VmFault::Interrupt(v),
        };
        loop {
            let frame = match self.try_stack.last() {
                Some(f) if f.call_depth >= base_depth => f,
                _ => return VmFault::Thrown(value),
            };
            let (state, catch_pc, finally_pc) = (frame.state, frame.catch_pc, frame.finally_pc);
            if state == TryState::InTry && catch_pc >= 0 {
                self.restore_try_frame();
                let frame = self.try_stack.last_mut().expect("frame just restored");
                frame.state = TryState::InCatch;
                let pc = catch_pc as usize;
                self.push(value);
                self.pc = pc;
                return VmFault::Thrown(Value::Empty);
            }
            if state != TryState::InFinally && finally_pc >= 0 {
                self.restore_try_frame();
                let frame = self.try_stack.last_mut().expect("frame just restored");
                frame.state = TryState::InFinally;
                frame.exit = FinallyExit::Rethrow(value);
                self.pc = finally_pc as usize;
                return VmFault::Thrown(Value::Empty);
            }
            // This frame cannot handle the fault: discard it (restoring
            // its recorded depths) and try the next one out.
            self.restore_try_frame();
            self.try_stack.pop();
        }
    }

    /// Restore machine state to what the innermost try frame recorded:
    /// operand stack, stash, call stack, reference depth, and the
    /// iteration stack (closing abandoned for..of iterators).
    fn restore_try_frame(&mut self) {
        let frame = self.try_stack.last().expect("restore without frame");
        let (sp, stash, call_depth, iter_len, ref_len) = (
            frame.sp,
            frame.stash.clone(),
            frame.call_depth,
            frame.iter_len,
            frame.ref_len,
        );
        while self.call_stack.len() > call_depth {
            let ctx = self.call_stack.pop().expect("call depth checked");
            self.prg = ctx.prg;
            self.stash = ctx.stash;
            self.sb = ctx.sb;
            self.args = ctx.args;
            self.new_target = ctx.new_target;
            self.result = ctx.result;
        }
        self.stack.truncate(sp);
        self.stash = stash;
        self.ref_stack.truncate(ref_len);
        while self.iter_stack.len() > iter_len {
            let rec = self.iter_stack.pop().expect("iter depth checked");
            self.close_iter_record(rec);
        }
    }

    /// Invoke an abandoned for..of iterator's `return` method, swallowing
    /// secondary failures.
    pub(crate) fn close_iter_record(&mut self, rec: IterRecord) {
        if let IterRecord::Iter { iterator, done } = rec {
            if !done {
                let ret = iterator.lookup(&PropKey::str("return"));
                if let Some(prop) = ret {
                    if let Value::Object(f) = &prop.value {
                        if f.is_callable() {
                            let _ = self.call_function(
                                Value::Object(f.clone()),
                                Value::Object(iterator),
                                &[],
                            );
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Call a callable value with an explicit `this` and arguments,
    /// running nested script frames to completion. This is the re-entry
    /// point used by natives, iteration, accessors and the embedding
    /// surface.
    pub fn call_function(
        &mut self,
        callee: Value,
        this: Value,
        args: &[Value],
    ) -> Result<Value, VmFault> {
        let func = match callee.as_object().and_then(|o| o.assert_callable()) {
            Some(f) => f,
            None => {
                return Err(self.type_error(format!("{} is not a function", self.describe(&callee))))
            }
        };
        match func {
            FuncKind::Native(n) => (n.func)(self, &this, args),
            FuncKind::Script(f) => {
                self.push(callee.clone());
                self.push(this);
                for a in args {
                    self.push(a.clone());
                }
                self.enter_script_frame(&f, args.len(), Value::Undefined, -1)?;
                let depth = self.call_stack.len();
                match self.run(depth) {
                    Ok(()) => Ok(self.pop()),
                    Err(fault) => Err(fault),
                }
            }
        }
    }

    /// `new callee(...args)`.
    pub fn construct(&mut self, callee: Value, args: &[Value]) -> Result<Value, VmFault> {
        let obj = match callee.as_object() {
            Some(o) => o.clone(),
            None => {
                return Err(
                    self.type_error(format!("{} is not a constructor", self.describe(&callee)))
                )
            }
        };
        let func = match obj.assert_constructor() {
            Some(f) => f,
            None => {
                return Err(
                    self.type_error(format!("{} is not a constructor", self.describe(&callee)))
                )
            }
        };
        match func {
            FuncKind::Native(n) => {
                let ctor = n.ctor.expect("assert_constructor checked");
                let saved = std::mem::replace(&mut self.new_target, callee.clone());
                let result = ctor(self, &Value::Undefined, args);
                self.new_target = saved;
                result
            }
            FuncKind::Script(f) => {
                let proto = match self.get_prop_value(&callee, &PropKey::str("prototype"))? {
                    Value::Object(p) => p,
                    _ => self.realm.object_proto.clone(),
                };
                let this_obj = JsObject::plain(Some(proto));
                self.push(callee.clone());
                self.push(Value::Object(this_obj.clone()));
                for a in args {
                    self.push(a.clone());
                }
                self.enter_script_frame(&f, args.len(), callee, -1)?;
                let depth = self.call_stack.len();
                self.run(depth)?;
                let ret = self.pop();
                Ok(match ret {
                    Value::Object(_) => ret,
                    _ => Value::Object(this_obj),
                })
            }
        }
    }

    /// Run a script program (top-level or indirect eval) in a fresh frame
    /// against the global stash, returning its completion value. Nestable:
    /// the current context is saved as a host re-entry frame.
    pub fn run_script(&mut self, prg: Rc<Program>) -> Result<Value, VmFault> {
        self.call_stack.push(Context {
            prg: std::mem::replace(&mut self.prg, prg),
            stash: self.stash.take(),
            pc: -1,
            sb: self.sb,
            args: self.args,
            new_target: std::mem::replace(&mut self.new_target, Value::Undefined),
            result: std::mem::replace(&mut self.result, Value::Undefined),
        });
        let global = self.realm.global.clone();
        self.push(Value::Undefined); // callee slot
        self.push(Value::Object(global));
        self.sb = self.sp() - 1;
        self.args = 0;
        self.stash = Some(Rc::clone(&self.realm.global_stash));
        self.pc = 0;
        let depth = self.call_stack.len();
        self.run(depth)?;
        let result = std::mem::replace(&mut self.result, Value::Undefined);
        // Halt leaves the pseudo-frame in place; tear it down by hand.
        let sb = self.sb;
        self.stack.truncate(sb.saturating_sub(1));
        if let Some(ctx) = self.call_stack.pop() {
            self.prg = ctx.prg;
            self.stash = ctx.stash;
            self.sb = ctx.sb;
            self.args = ctx.args;
            self.new_target = ctx.new_target;
            self.result = ctx.result;
        }
        Ok(result)
    }

    /// Shared frame setup for script calls. Expects
    /// `[callee, this, args...]` already on the stack; `resume_pc < 0`
    /// makes the matching return halt the loop (host re-entry).
    pub(crate) fn enter_script_frame(
        &mut self,
        f: &Rc<ScriptFunc>,
        nargs: usize,
        new_target: Value,
        resume_pc: isize,
    ) -> Result<(), VmFault> {
        if self.call_stack.len() >= MAX_CALL_DEPTH {
            return Err(self.range_error("Maximum call stack size exceeded"));
        }
        let callee_idx = self.sp() - nargs - 2;
        if f.arrow {
            // Arrows ignore the caller-provided `this` entirely.
            self.stack[callee_idx + 1] = f.captured_this.clone();
        } else if !f.strict {
            // Sloppy functions observe a coerced `this`.
            let this = self.stack[callee_idx + 1].clone();
            self.stack[callee_idx + 1] = self.coerce_this(this)?;
        }
        self.call_stack.push(Context {
            prg: Rc::clone(&self.prg),
            stash: self.stash.clone(),
            pc: resume_pc,
            sb: self.sb,
            args: self.args,
            new_target: std::mem::replace(
                &mut self.new_target,
                if f.arrow {
                    f.captured_new_target.clone()
                } else {
                    new_target
                },
            ),
            result: std::mem::replace(&mut self.result, Value::Undefined),
        });
        self.prg = Rc::clone(&f.prg);
        self.stash = f.stash.clone();
        self.sb = callee_idx + 1;
        self.args = nargs;
        self.pc = 0;
        Ok(())
    }

    /// Return from the current frame with `result`, restoring the saved
    /// context. Halts the loop when the context was a host re-entry.
    pub(crate) fn do_return(&mut self, result: Value) -> Result<(), VmFault> {
        // Any try frames still belonging to this call are dead now.
        while let Some(f) = self.try_stack.last() {
            if f.call_depth >= self.call_stack.len() && !self.call_stack.is_empty() {
                self.try_stack.pop();
            } else {
                break;
            }
        }
        let sb = self.sb;
        self.stack.truncate(sb);
        if sb == 0 {
            return Err(self.type_error("return outside of a call frame"));
        }
        self.stack[sb - 1] = result;
        let ctx = match self.call_stack.pop() {
            Some(ctx) => ctx,
            None => return Err(self.type_error("return outside of a call frame")),
        };
        self.prg = ctx.prg;
        self.stash = ctx.stash;
        self.sb = ctx.sb;
        self.args = ctx.args;
        self.new_target = ctx.new_target;
        self.result = ctx.result;
        if ctx.pc < 0 {
            self.halted = true;
        } else {
            self.pc = ctx.pc as usize;
        }
        Ok(())
    }

    pub(crate) fn halt(&mut self) {
        self.halted = true;
    }

    // ------------------------------------------------------------------
    // Stash chain walking
    // ------------------------------------------------------------------

    /// Full dynamic resolution: walk the stash chain outward, consulting
    /// name maps and `with` objects, ending at the global frame.
    pub fn dynamic_lookup(&self, name: &JsString) -> DynLookup {
        let mut cur = self.stash.clone();
        while let Some(stash_rc) = cur {
            let stash = stash_rc.borrow();
            if let Some(names) = &stash.names {
                if let Some((idx, attr)) = names.get(name) {
                    let (idx, attr) = (*idx, *attr);
                    drop(stash);
                    return DynLookup::Slot {
                        stash: stash_rc,
                        idx,
                        attr,
                    };
                }
            }
            if let Some(obj) = &stash.obj {
                // The global frame is the chain terminator, handled below.
                if stash.outer.is_some() && obj.has_property(&PropKey::Str(name.clone())) {
                    return DynLookup::WithObj(obj.clone());
                }
            }
            cur = stash.outer.clone();
        }
        DynLookup::Global
    }

    /// Bounded walk for mixed access: consult at most `level` frames by
    /// name, then fall back to the packed slot with the statically known
    /// binding attributes.
    pub fn mixed_lookup(
        &self,
        name: &JsString,
        level: u32,
        slot: u32,
        fallback: BindingAttr,
    ) -> DynLookup {
        let mut cur = self.stash.clone();
        let mut remaining = level;
        while let Some(stash_rc) = cur {
            if remaining == 0 {
                return DynLookup::Slot {
                    stash: stash_rc,
                    idx: slot,
                    attr: fallback,
                };
            }
            let stash = stash_rc.borrow();
            if let Some(names) = &stash.names {
                if let Some((idx, attr)) = names.get(name) {
                    let (idx, attr) = (*idx, *attr);
                    drop(stash);
                    return DynLookup::Slot {
                        stash: stash_rc,
                        idx,
                        attr,
                    };
                }
            }
            if let Some(obj) = &stash.obj {
                if stash.outer.is_some() && obj.has_property(&PropKey::Str(name.clone())) {
                    return DynLookup::WithObj(obj.clone());
                }
            }
            cur = stash.outer.clone();
            remaining -= 1;
        }
        DynLookup::Global
    }

    /// The stash `level` frames out from the current one.
    pub fn stash_at(&self, level: u32) -> Rc<RefCell<Stash>> {
        let mut cur = self.stash.clone().expect("stash access without a stash");
        for _ in 0..level {
            let outer = cur.borrow().outer.clone();
            cur = outer.expect("stash level exceeds chain");
        }
        cur
    }

    // ------------------------------------------------------------------
    // Stack trace capture
    // ------------------------------------------------------------------

    /// Capture the script stack, innermost frame first, stopping at the
    /// nearest host re-entry frame.
    pub fn capture_stack(&self) -> Vec<StackFrame> {
        fn frame_of(prg: &Program, pc: usize) -> StackFrame {
            let offset = prg.source_offset(pc) as usize;
            StackFrame {
                func_name: prg.func_name.as_ref().map(|n| n.to_std_string()),
                file: prg.file.name().to_string(),
                position: prg.file.position(offset),
            }
        }
        let mut frames = vec![frame_of(&self.prg, self.pc)];
        for ctx in self.call_stack.iter().rev() {
            if ctx.pc < 0 {
                break;
            }
            frames.push(frame_of(&ctx.prg, (ctx.pc as usize).saturating_sub(1)));
        }
        frames
    }

    /// Reset all execution state after an unhandled fault, closing any
    /// iterators a thrown value abandoned.
    pub fn reset(&mut self, close_iterators: bool) {
        while let Some(rec) = self.iter_stack.pop() {
            if close_iterators {
                self.close_iter_record(rec);
            }
        }
        self.stack.clear();
        self.call_stack.clear();
        self.ref_stack.clear();
        self.try_stack.clear();
        self.sb = 0;
        self.args = 0;
        self.pc = 0;
        self.stash = None;
        self.new_target = Value::Undefined;
        self.result = Value::Undefined;
        self.halted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_take_clears_the_flag() {
        let state = InterruptState::new();
        assert!(state.take().is_none());
        state.set("stop");
        assert!(state.armed());
        assert_eq!(state.take().as_deref(), Some("stop"));
        assert!(!state.armed());
        assert!(state.take().is_none());
    }

    #[test]
    fn interrupt_clear_discards_the_payload() {
        let state = InterruptState::new();
        state.set("stale");
        state.clear();
        assert!(state.take().is_none());
    }

    #[test]
    fn stash_slots_grow_and_default_to_empty() {
        let mut stash = Stash {
            values: Vec::new(),
            names: None,
            obj: None,
            outer: None,
            function: true,
        };
        assert!(stash.get_slot(3).is_empty());
        stash.set_slot(3, Value::Int(7));
        assert!(stash.get_slot(3).strict_equals(&Value::Int(7)));
        assert!(stash.get_slot(1).is_empty());
    }

    #[test]
    fn named_stash_bindings_resolve_by_name() {
        let mut stash = Stash {
            values: Vec::new(),
            names: Some(std::collections::HashMap::new()),
            obj: None,
            outer: None,
            function: true,
        };
        stash.add_named(
            skiff_core::JsString::from("x"),
            BindingAttr::VAR,
            Value::Int(1),
        );
        let (idx, attr) = stash.names.as_ref().unwrap()[&skiff_core::JsString::from("x")];
        assert_eq!(idx, 0);
        assert!(attr.mutable);
        assert!(stash.get_slot(0).strict_equals(&Value::Int(1)));
    }
}
