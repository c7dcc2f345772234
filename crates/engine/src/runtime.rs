//! Embedding surface
//!
//! A [`Runtime`] owns one VM, one global object and the process-visible
//! interrupt channel. It is single-threaded; the only part that may be
//! touched from other threads is the [`InterruptHandle`].

use crate::builtins;
use crate::compiler;
use crate::errors::EngineError;
use crate::object::{JsObject, PropKey};
use crate::program::Program;
use crate::value::{JsSymbol, Value};
use crate::vm::{InterruptState, Stash, Vm, VmFault};
use skiff_core::SrcFile;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// Per-instance constants: the global object, the intrinsic prototypes and
/// well-known symbols. Immutable after bootstrap.
pub struct Realm {
    pub global: JsObject,
    /// The global frame: lexical bindings by name, bound to the global
    /// object, chain terminator.
    pub global_stash: Rc<RefCell<Stash>>,
    pub object_proto: JsObject,
    pub func_proto: JsObject,
    pub array_proto: JsObject,
    pub string_proto: JsObject,
    pub number_proto: JsObject,
    pub boolean_proto: JsObject,
    pub symbol_proto: JsObject,
    pub regexp_proto: JsObject,
    pub error_proto: JsObject,
    pub type_error_proto: JsObject,
    pub range_error_proto: JsObject,
    pub reference_error_proto: JsObject,
    pub syntax_error_proto: JsObject,
    pub eval_error_proto: JsObject,
    pub array_iter_proto: JsObject,
    pub sym_iterator: JsSymbol,
    /// Identity of the real `eval` function, for direct-eval detection.
    pub eval_fn: JsObject,
}

/// Cross-thread interruption: set a payload and the dispatch loop raises
/// an uncatchable error at its next check. The flag clears itself once
/// the interruption propagates.
#[derive(Clone)]
pub struct InterruptHandle(Arc<InterruptState>);

impl InterruptHandle {
    pub fn interrupt(&self, payload: impl Into<String>) {
        self.0.set(payload);
    }

    pub fn clear_interrupt(&self) {
        self.0.clear();
    }
}

pub struct Runtime {
    realm: Rc<Realm>,
    vm: Vm,
    interrupt: Arc<InterruptState>,
}

impl Runtime {
    pub fn new() -> Runtime {
        let interrupt = InterruptState::new();
        let realm = builtins::create_realm();
        let boot = Rc::new(Program {
            code: vec![crate::instr::Instr::Halt],
            values: Vec::new(),
            src_map: Vec::new(),
            func_name: None,
            file: SrcFile::new("<boot>", ""),
        });
        let vm = Vm::new(Rc::clone(&realm), boot, Arc::clone(&interrupt));
        Runtime {
            realm,
            vm,
            interrupt,
        }
    }

    pub fn realm(&self) -> &Rc<Realm> {
        &self.realm
    }

    /// Compile and run a source string; the result is the script's
    /// completion value (the value of its last expression statement).
    pub fn eval(&mut self, name: &str, src: &str) -> Result<Value, EngineError> {
        let file = SrcFile::new(name, src);
        let prg = compiler::compile_global(&file, &self.realm)?;
        match self.vm.run_script(prg) {
            Ok(v) => Ok(v),
            Err(fault) => Err(self.engine_error(fault)),
        }
    }

    /// Read a global binding by name.
    pub fn global_get(&mut self, name: &str) -> Result<Value, EngineError> {
        let global = Value::Object(self.realm.global.clone());
        self.vm
            .get_prop_value(&global, &PropKey::str(name))
            .map_err(|f| self.engine_error(f))
    }

    /// Create or overwrite a global binding by name.
    pub fn global_set(&mut self, name: &str, value: Value) -> Result<(), EngineError> {
        let global = Value::Object(self.realm.global.clone());
        self.vm
            .set_prop_value(&global, &PropKey::str(name), value, false)
            .map_err(|f| self.engine_error(f))
    }

    /// Call a script function from the host.
    pub fn call(
        &mut self,
        func: &Value,
        this: Value,
        args: &[Value],
    ) -> Result<Value, EngineError> {
        self.vm
            .call_function(func.clone(), this, args)
            .map_err(|f| self.engine_error(f))
    }

    /// Import a host JSON value as a script value. Numbers become
    /// integers when integral, objects become plain objects, arrays
    /// become arrays.
    pub fn from_json(&mut self, v: &serde_json::Value) -> Value {
        builtins::json_to_value(&mut self.vm, v)
    }

    /// Export a script value as JSON. Functions and undefined cannot be
    /// represented; cyclic structures are rejected.
    pub fn to_json(&mut self, v: &Value) -> Result<serde_json::Value, EngineError> {
        match builtins::value_to_json(&mut self.vm, v, &mut Vec::new()) {
            Ok(Some(j)) => Ok(j),
            Ok(None) => Err(EngineError::Conversion(
                "undefined, functions and symbols have no JSON representation".to_string(),
            )),
            Err(f) => Err(self.engine_error(f)),
        }
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(Arc::clone(&self.interrupt))
    }

    pub fn clear_interrupt(&self) {
        self.interrupt.clear();
    }

    /// Convert a VM fault into the host-facing error shape, capturing the
    /// stack before the machine state is reset.
    fn engine_error(&mut self, fault: VmFault) -> EngineError {
        let stack = self.vm.capture_stack();
        match fault {
            VmFault::Interrupt(payload) => {
                self.vm.reset(false);
                EngineError::Interrupted {
                    payload: payload
                        .primitive_to_string()
                        .map(|s| s.to_std_string())
                        .unwrap_or_default(),
                }
            }
            VmFault::Thrown(value) => {
                let message = describe_thrown(&value);
                self.vm.reset(true);
                EngineError::Script {
                    value,
                    message,
                    stack,
                }
            }
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new()
    }
}

/// Message for an uncaught thrown value: `Name: message` for error
/// objects, the display form otherwise.
fn describe_thrown(value: &Value) -> String {
    if let Value::Object(o) = value {
        let name = o
            .lookup(&PropKey::str("name"))
            .filter(|p| !p.accessor)
            .and_then(|p| p.value.primitive_to_string());
        let message = o
            .lookup(&PropKey::str("message"))
            .filter(|p| !p.accessor)
            .and_then(|p| p.value.primitive_to_string());
        if let Some(name) = name {
            return match message {
                Some(m) if !m.is_empty() => format!("{}: {}", name, m),
                _ => name.to_std_string(),
            };
        }
        return format!("[object {}]", o.class());
    }
    match value.primitive_to_string() {
        Some(s) => format!("Uncaught {}", s),
        None => "Uncaught value".to_string(),
    }
}
