//! Instruction dispatch
//!
//! One `exec` call per instruction. The pc is pre-incremented; jump
//! instructions overwrite it relative to the pc of the jump itself, and
//! call/return instructions install the frame they switch to.

use super::conv::{Hint, Relation};
use super::{
    Context, DynLookup, FinallyExit, IterRecord, RefRecord, Stash, TryFrame, TryState, Vm,
    VmFault,
};
use crate::instr::{unpack, BindingAttr, BlockParams, EnterFuncParams, FuncRef, Instr};
use crate::object::{
    ArgsData, FuncKind, JsObject, ObjectKind, PropKey, Property, RegexpData, ScriptFunc,
};
use crate::value::Value;
use skiff_core::JsString;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

impl Vm {
    pub(super) fn exec(&mut self, instr: &Instr) -> Result<(), VmFault> {
        let pc = self.pc;
        self.pc = pc + 1;
        match instr {
            Instr::Nop => {}

            // ---- constants --------------------------------------------
            Instr::LoadVal(idx) => {
                let v = self.prg.values[*idx as usize].clone();
                self.push(v);
            }
            Instr::LoadUndef => self.push(Value::Undefined),
            Instr::LoadNull => self.push(Value::Null),
            Instr::LoadEmpty => self.push(Value::Empty),
            Instr::LoadGlobalObject => {
                let g = self.realm.global.clone();
                self.push(Value::Object(g));
            }
            Instr::LoadCallee => {
                let v = self.stack[self.sb - 1].clone();
                self.push(v);
            }
            Instr::LoadNewTarget => {
                let v = self.new_target.clone();
                self.push(v);
            }

            // ---- stack slots ------------------------------------------
            Instr::LoadStack(idx) => {
                let v = self.read_stack(*idx).nil_safe();
                self.push(v);
            }
            Instr::LoadStackLex { idx, name } => {
                let v = self.read_stack(*idx);
                if v.is_empty() {
                    return Err(self.init_error(name));
                }
                self.push(v);
            }
            Instr::StoreStack(idx) => {
                let v = self.peek();
                self.write_stack(*idx, v);
            }
            Instr::StoreStackP(idx) => {
                let v = self.pop();
                self.write_stack(*idx, v);
            }
            Instr::InitStack(idx) => {
                let v = self.pop();
                self.write_stack(*idx, v);
            }
            Instr::StoreStackLex { idx, name } => {
                if self.read_stack(*idx).is_empty() {
                    return Err(self.init_error(name));
                }
                let v = self.peek();
                self.write_stack(*idx, v);
            }
            Instr::StoreStackConst { idx, name } => {
                if self.read_stack(*idx).is_empty() {
                    return Err(self.init_error(name));
                }
                return Err(self.const_error());
            }

            // ---- stash slots ------------------------------------------
            Instr::LoadStash(packed) => {
                let (level, slot) = unpack(*packed);
                let v = self.stash_at(level).borrow().get_slot(slot).nil_safe();
                self.push(v);
            }
            Instr::LoadStashLex { packed, name } => {
                let (level, slot) = unpack(*packed);
                let v = self.stash_at(level).borrow().get_slot(slot);
                if v.is_empty() {
                    return Err(self.init_error(name));
                }
                self.push(v);
            }
            Instr::StoreStash(packed) => {
                let (level, slot) = unpack(*packed);
                let v = self.peek();
                self.stash_at(level).borrow_mut().set_slot(slot, v);
            }
            Instr::StoreStashP(packed) => {
                let (level, slot) = unpack(*packed);
                let v = self.pop();
                self.stash_at(level).borrow_mut().set_slot(slot, v);
            }
            Instr::StoreStashLex { packed, name } => {
                let (level, slot) = unpack(*packed);
                let stash = self.stash_at(level);
                if stash.borrow().get_slot(slot).is_empty() {
                    return Err(self.init_error(name));
                }
                let v = self.peek();
                stash.borrow_mut().set_slot(slot, v);
            }
            Instr::StoreStashConst { packed, name } => {
                let (level, slot) = unpack(*packed);
                if self.stash_at(level).borrow().get_slot(slot).is_empty() {
                    return Err(self.init_error(name));
                }
                return Err(self.const_error());
            }
            Instr::InitStash(packed) => {
                let (level, slot) = unpack(*packed);
                let v = self.pop();
                self.stash_at(level).borrow_mut().set_slot(slot, v);
            }

            // ---- mixed access -----------------------------------------
            Instr::LoadMixed { name, packed, lex } => {
                let v = self.load_mixed(name, *packed, *lex)?;
                self.push(v);
            }
            Instr::LoadMixedCallee { name, packed, lex } => {
                let (level, slot) = unpack(*packed);
                let fallback = if *lex {
                    BindingAttr::LET
                } else {
                    BindingAttr::VAR
                };
                match self.mixed_lookup(name, level, slot, fallback) {
                    DynLookup::WithObj(obj) => {
                        let v = self
                            .get_prop_value(&Value::Object(obj.clone()), &PropKey::Str(name.clone()))?;
                        self.push(v);
                        self.push(Value::Object(obj));
                    }
                    DynLookup::Slot { stash, idx, attr } => {
                        let v = stash.borrow().get_slot(idx);
                        if attr.lex && v.is_empty() {
                            return Err(self.init_error(name));
                        }
                        self.push(v.nil_safe());
                        self.push(Value::Undefined);
                    }
                    DynLookup::Global => return Err(self.not_defined_error(name)),
                }
            }
            Instr::ResolveMixed { name, packed, attr } => {
                let (level, slot) = unpack(*packed);
                let rec = match self.mixed_lookup(name, level, slot, *attr) {
                    DynLookup::Slot { stash, idx, attr } => RefRecord::Slot {
                        stash,
                        idx,
                        attr,
                        name: name.clone(),
                    },
                    DynLookup::WithObj(obj) => RefRecord::Prop {
                        base: obj,
                        name: name.clone(),
                        strict: false,
                    },
                    DynLookup::Global => RefRecord::Global {
                        name: name.clone(),
                        strict: false,
                    },
                };
                self.ref_stack.push(rec);
            }

            // ---- dynamic names ----------------------------------------
            Instr::LoadDynamic(name) => {
                let v = self.load_dynamic(name, false)?;
                self.push(v);
            }
            Instr::LoadDynamicTypeof(name) => {
                let v = self.load_dynamic(name, true)?;
                self.push(v);
            }
            Instr::LoadDynamicCallee(name) => match self.dynamic_lookup(name) {
                DynLookup::Slot { stash, idx, attr } => {
                    let v = stash.borrow().get_slot(idx);
                    if attr.lex && v.is_empty() {
                        return Err(self.init_error(name));
                    }
                    self.push(v.nil_safe());
                    self.push(Value::Undefined);
                }
                DynLookup::WithObj(obj) => {
                    let v = self
                        .get_prop_value(&Value::Object(obj.clone()), &PropKey::Str(name.clone()))?;
                    self.push(v);
                    self.push(Value::Object(obj));
                }
                DynLookup::Global => {
                    let g = self.realm.global.clone();
                    let key = PropKey::Str(name.clone());
                    if !g.has_property(&key) {
                        return Err(self.not_defined_error(name));
                    }
                    let v = self.get_prop_value(&Value::Object(g), &key)?;
                    self.push(v);
                    self.push(Value::Undefined);
                }
            },
            Instr::StoreDynamic { name, strict } => {
                let v = self.peek();
                self.store_dynamic(name, v, *strict)?;
            }
            Instr::ResolveVar { name, strict } => {
                let rec = match self.dynamic_lookup(name) {
                    DynLookup::Slot { stash, idx, attr } => RefRecord::Slot {
                        stash,
                        idx,
                        attr,
                        name: name.clone(),
                    },
                    DynLookup::WithObj(obj) => RefRecord::Prop {
                        base: obj,
                        name: name.clone(),
                        strict: *strict,
                    },
                    DynLookup::Global => RefRecord::Global {
                        name: name.clone(),
                        strict: *strict,
                    },
                };
                self.ref_stack.push(rec);
            }
            Instr::GetValue => {
                if self.ref_stack.is_empty() {
                    return Err(self.type_error("reference stack underflow"));
                }
                let v = self.ref_get(self.ref_stack.len() - 1)?;
                self.push(v);
            }
            Instr::PutValue => {
                let v = self.peek();
                let rec = match self.ref_stack.pop() {
                    Some(r) => r,
                    None => return Err(self.type_error("reference stack underflow")),
                };
                self.ref_put(&rec, v)?;
            }
            Instr::DeleteVar(name) => {
                let r = self.delete_var(name)?;
                self.push(Value::Bool(r));
            }
            Instr::DeleteGlobal(name) => {
                let g = self.realm.global.clone();
                let r = g.delete(&PropKey::Str(name.clone()));
                self.push(Value::Bool(r));
            }

            // ---- properties -------------------------------------------
            Instr::GetProp(name) => {
                let base = self.pop();
                let v = self.get_prop_value(&base, &PropKey::Str(name.clone()))?;
                self.push(v);
            }
            Instr::GetPropCallee(name) => {
                let base = self.pop();
                let v = self.get_prop_value(&base, &PropKey::Str(name.clone()))?;
                self.push(v);
                self.push(base);
            }
            Instr::GetElem => {
                let key = self.pop();
                let base = self.pop();
                let key = self.to_property_key(key)?;
                let v = self.get_prop_value(&base, &key)?;
                self.push(v);
            }
            Instr::GetElemCallee => {
                let key = self.pop();
                let base = self.pop();
                let key = self.to_property_key(key)?;
                let v = self.get_prop_value(&base, &key)?;
                self.push(v);
                self.push(base);
            }
            Instr::SetProp(name) | Instr::SetPropStrict(name) => {
                let strict = matches!(instr, Instr::SetPropStrict(_));
                let v = self.pop();
                let base = self.pop();
                self.set_prop_value(&base, &PropKey::Str(name.clone()), v.clone(), strict)?;
                self.push(v);
            }
            Instr::SetElem | Instr::SetElemStrict => {
                let strict = matches!(instr, Instr::SetElemStrict);
                let v = self.pop();
                let key = self.pop();
                let base = self.pop();
                let key = self.to_property_key(key)?;
                self.set_prop_value(&base, &key, v.clone(), strict)?;
                self.push(v);
            }
            Instr::DeleteProp(name) | Instr::DeletePropStrict(name) => {
                let strict = matches!(instr, Instr::DeletePropStrict(_));
                let base = self.pop();
                let r = self.delete_prop_value(&base, &PropKey::Str(name.clone()), strict)?;
                self.push(Value::Bool(r));
            }
            Instr::DeleteElem | Instr::DeleteElemStrict => {
                let strict = matches!(instr, Instr::DeleteElemStrict);
                let key = self.pop();
                let base = self.pop();
                let key = self.to_property_key(key)?;
                let r = self.delete_prop_value(&base, &key, strict)?;
                self.push(Value::Bool(r));
            }
            Instr::SetProp1(name) => {
                let v = self.pop();
                if let Value::Object(obj) = self.peek() {
                    obj.define_own(PropKey::Str(name.clone()), Property::data(v));
                }
            }
            Instr::SetPropGetter(name) => {
                let f = self.pop();
                if let (Value::Object(obj), Value::Object(func)) = (self.peek(), f) {
                    let key = PropKey::Str(name.clone());
                    let setter = obj
                        .get_own(&key)
                        .filter(|p| p.accessor)
                        .and_then(|p| p.setter);
                    obj.define_own(key, Property::accessor(Some(func), setter));
                }
            }
            Instr::SetPropSetter(name) => {
                let f = self.pop();
                if let (Value::Object(obj), Value::Object(func)) = (self.peek(), f) {
                    let key = PropKey::Str(name.clone());
                    let getter = obj
                        .get_own(&key)
                        .filter(|p| p.accessor)
                        .and_then(|p| p.getter);
                    obj.define_own(key, Property::accessor(getter, Some(func)));
                }
            }
            Instr::SetProto => {
                let v = self.pop();
                if let Value::Object(obj) = self.peek() {
                    match v {
                        Value::Object(p) => {
                            obj.set_proto(Some(p));
                        }
                        Value::Null => {
                            obj.set_proto(None);
                        }
                        _ => {}
                    }
                }
            }

            // ---- declarations -----------------------------------------
            Instr::BindVars { names, deletable } => {
                self.bind_vars(names, *deletable);
            }
            Instr::BindGlobal(gb) => {
                self.bind_global(gb)?;
            }
            Instr::InitGlobal(name) => {
                let v = self.pop();
                let stash = self.realm.global_stash.clone();
                let slot = {
                    let s = stash.borrow();
                    s.names.as_ref().and_then(|m| m.get(name)).map(|(i, _)| *i)
                };
                match slot {
                    Some(i) => stash.borrow_mut().set_slot(i, v),
                    None => stash
                        .borrow_mut()
                        .add_named(name.clone(), BindingAttr::LET, v),
                }
            }

            // ---- operators --------------------------------------------
            Instr::Add => {
                let b = self.pop();
                let a = self.pop();
                let v = self.add_values(a, b)?;
                self.push(v);
            }
            Instr::Sub => {
                let b = self.pop();
                let a = self.pop();
                let (a, b) = self.numeric_pair(a, b)?;
                let v = self.sub_values(a, b)?;
                self.push(v);
            }
            Instr::Mul => {
                let b = self.pop();
                let a = self.pop();
                let (a, b) = self.numeric_pair(a, b)?;
                let v = self.mul_values(a, b)?;
                self.push(v);
            }
            Instr::Div => {
                let b = self.pop();
                let a = self.pop();
                let (a, b) = self.numeric_pair(a, b)?;
                let v = self.div_values(a, b)?;
                self.push(v);
            }
            Instr::Mod => {
                let b = self.pop();
                let a = self.pop();
                let (a, b) = self.numeric_pair(a, b)?;
                let v = self.mod_values(a, b)?;
                self.push(v);
            }
            Instr::Neg => {
                let v = self.pop();
                let v = self.to_numeric(v)?;
                self.push(match v {
                    Value::Int(0) => Value::Float(-0.0),
                    Value::Int(i) => match i.checked_neg() {
                        Some(n) => Value::Int(n),
                        None => Value::Float(-(i as f64)),
                    },
                    Value::Float(f) => Value::Float(-f),
                    other => other,
                });
            }
            Instr::Pos => {
                let v = self.pop();
                let v = self.to_numeric(v)?;
                self.push(v);
            }
            Instr::Inc => {
                let v = self.pop();
                let v = self.to_numeric(v)?;
                self.push(match v {
                    Value::Int(i) => match i.checked_add(1) {
                        Some(n) if n.unsigned_abs() <= 1u64 << 53 => Value::Int(n),
                        _ => Value::Float(i as f64 + 1.0),
                    },
                    Value::Float(f) => Value::Float(f + 1.0),
                    other => other,
                });
            }
            Instr::Dec => {
                let v = self.pop();
                let v = self.to_numeric(v)?;
                self.push(match v {
                    Value::Int(i) => match i.checked_sub(1) {
                        Some(n) if n.unsigned_abs() <= 1u64 << 53 => Value::Int(n),
                        _ => Value::Float(i as f64 - 1.0),
                    },
                    Value::Float(f) => Value::Float(f - 1.0),
                    other => other,
                });
            }
            Instr::BitAnd => self.bitwise(|a, b| a & b)?,
            Instr::BitOr => self.bitwise(|a, b| a | b)?,
            Instr::BitXor => self.bitwise(|a, b| a ^ b)?,
            Instr::BitNot => {
                let v = self.pop();
                let n = self.to_int32_value(&v)?;
                self.push(Value::Int(i64::from(!n)));
            }
            Instr::Shl => {
                let b = self.pop();
                let a = self.pop();
                let x = self.to_int32_value(&a)?;
                let s = self.to_uint32_value(&b)? & 31;
                self.push(Value::Int(i64::from(x.wrapping_shl(s))));
            }
            Instr::Sar => {
                let b = self.pop();
                let a = self.pop();
                let x = self.to_int32_value(&a)?;
                let s = self.to_uint32_value(&b)? & 31;
                self.push(Value::Int(i64::from(x >> s)));
            }
            Instr::Shr => {
                let b = self.pop();
                let a = self.pop();
                let x = self.to_uint32_value(&a)?;
                let s = self.to_uint32_value(&b)? & 31;
                self.push(Value::Int(i64::from(x >> s)));
            }
            Instr::Lt | Instr::Le | Instr::Gt | Instr::Ge => {
                let b = self.pop();
                let a = self.pop();
                let rel = self.relational(a, b)?;
                let r = match (instr, rel) {
                    (_, Relation::Undefined) => false,
                    (Instr::Lt, Relation::Cmp(o)) => o == Ordering::Less,
                    (Instr::Le, Relation::Cmp(o)) => o != Ordering::Greater,
                    (Instr::Gt, Relation::Cmp(o)) => o == Ordering::Greater,
                    (_, Relation::Cmp(o)) => o != Ordering::Less,
                };
                self.push(Value::Bool(r));
            }
            Instr::Eq | Instr::Neq => {
                let b = self.pop();
                let a = self.pop();
                let r = self.loose_equals(&a, &b)?;
                self.push(Value::Bool(r == matches!(instr, Instr::Eq)));
            }
            Instr::StrictEq => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a.strict_equals(&b)));
            }
            Instr::StrictNeq => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(!a.strict_equals(&b)));
            }
            Instr::In => {
                let obj = self.pop();
                let key = self.pop();
                let r = self.in_check(key, &obj)?;
                self.push(Value::Bool(r));
            }
            Instr::InstanceOf => {
                let rhs = self.pop();
                let lhs = self.pop();
                let r = self.instanceof_check(&lhs, &rhs)?;
                self.push(Value::Bool(r));
            }
            Instr::Not => {
                let v = self.pop();
                self.push(Value::Bool(!v.to_boolean()));
            }
            Instr::TypeOf => {
                let v = self.pop();
                self.push(Value::str(v.type_of()));
            }

            // ---- control ----------------------------------------------
            Instr::Jump(d) => self.jump_from(pc, *d),
            Instr::JumpIfFalse(d) => {
                if !self.pop().to_boolean() {
                    self.jump_from(pc, *d);
                }
            }
            Instr::JumpIfTrue(d) => {
                if self.pop().to_boolean() {
                    self.jump_from(pc, *d);
                }
            }
            Instr::JumpIfTruePeek(d) => {
                if self.peek().to_boolean() {
                    self.jump_from(pc, *d);
                } else {
                    self.pop();
                }
            }
            Instr::JumpIfFalsePeek(d) => {
                if !self.peek().to_boolean() {
                    self.jump_from(pc, *d);
                } else {
                    self.pop();
                }
            }
            Instr::Pop => {
                self.pop();
            }
            Instr::Dup => {
                let v = self.peek();
                self.push(v);
            }
            Instr::Dup2 => {
                let n = self.sp();
                let a = self.stack[n - 2].clone();
                let b = self.stack[n - 1].clone();
                self.push(a);
                self.push(b);
            }
            Instr::DupAt(n) => {
                let v = self.stack[self.sp() - 1 - *n as usize].clone();
                self.push(v);
            }
            Instr::Swap => {
                let n = self.sp();
                self.stack.swap(n - 1, n - 2);
            }
            Instr::Rot3 => {
                let c = self.pop();
                let at = self.sp() - 2;
                self.stack.insert(at, c);
            }
            Instr::Rot3L => {
                let at = self.sp() - 3;
                let a = self.stack.remove(at);
                self.push(a);
            }
            Instr::SaveResult => {
                self.result = self.pop();
            }
            Instr::LoadResult => {
                let v = self.result.clone();
                self.push(v);
            }
            Instr::Halt => self.halt(),

            // ---- calls ------------------------------------------------
            Instr::Call(n) => self.exec_call(*n as usize)?,
            Instr::CallEval { nargs, strict } => self.exec_call_eval(*nargs as usize, *strict)?,
            Instr::New(n) => {
                let n = *n as usize;
                let split = self.sp() - n;
                let args: Vec<Value> = self.stack.split_off(split);
                let callee = self.pop();
                let v = self.construct(callee, &args)?;
                self.push(v);
            }
            Instr::Ret => {
                let v = self.pop();
                self.do_return(v)?;
            }
            Instr::RetFinally => {
                let v = self.pop();
                self.do_ret_finally(v)?;
            }

            // ---- function entry ---------------------------------------
            Instr::EnterFunc(p) => self.enter_func(p),
            Instr::EnterFuncStashless {
                stack_size,
                num_args,
            } => {
                self.pad_args(*num_args);
                for _ in 0..*stack_size {
                    self.push(Value::Empty);
                }
            }
            Instr::CreateArgs(formals) => {
                let obj = self.create_args(*formals, false);
                self.push(Value::Object(obj));
            }
            Instr::CreateArgsStrict(formals) => {
                let obj = self.create_args(*formals, true);
                self.push(Value::Object(obj));
            }
            Instr::BoxThis(slot) => {
                let this = self.stack[self.sb].clone();
                let stash = self.stash.clone().expect("BoxThis requires a stash");
                stash.borrow_mut().set_slot(*slot, this);
            }

            // ---- blocks -----------------------------------------------
            Instr::EnterBlock(p) => self.enter_block(p),
            Instr::EnterCatchBlock(p) => {
                let exc = self.pop();
                self.enter_block(p);
                self.push(exc);
            }
            Instr::LeaveBlock {
                stack_size,
                pop_stash,
            } => {
                let keep = self.sp() - *stack_size as usize;
                self.stack.truncate(keep);
                if *pop_stash {
                    let outer = self
                        .stash
                        .as_ref()
                        .and_then(|s| s.borrow().outer.clone());
                    self.stash = outer;
                }
            }
            Instr::EnterWith => {
                let v = self.pop();
                let obj = self.to_object(v)?;
                let outer = self.stash.take();
                self.stash = Some(Rc::new(RefCell::new(Stash {
                    values: Vec::new(),
                    names: None,
                    obj: Some(obj),
                    outer,
                    function: false,
                })));
            }
            Instr::LeaveWith => {
                let outer = self
                    .stash
                    .as_ref()
                    .and_then(|s| s.borrow().outer.clone());
                self.stash = outer;
            }

            // ---- exceptions -------------------------------------------
            Instr::Try {
                catch_ofs,
                finally_ofs,
            } => {
                let abs = |ofs: i32| {
                    if ofs == 0 {
                        -1
                    } else {
                        pc as i32 + ofs
                    }
                };
                self.try_stack.push(TryFrame {
                    catch_pc: abs(*catch_ofs),
                    finally_pc: abs(*finally_ofs),
                    sp: self.sp(),
                    stash: self.stash.clone(),
                    call_depth: self.call_stack.len(),
                    iter_len: self.iter_stack.len(),
                    ref_len: self.ref_stack.len(),
                    state: TryState::InTry,
                    exit: FinallyExit::None,
                });
            }
            Instr::PopTry => {
                let (state, finally_pc) = match self.try_stack.last() {
                    Some(f) => (f.state, f.finally_pc),
                    None => return Err(self.type_error("try stack underflow")),
                };
                if state != TryState::InFinally && finally_pc >= 0 {
                    let frame = self.try_stack.last_mut().expect("frame just read");
                    frame.state = TryState::InFinally;
                    frame.exit = FinallyExit::Resume(self.pc);
                    self.pc = finally_pc as usize;
                } else {
                    self.try_stack.pop();
                }
            }
            Instr::LeaveFinally => {
                let frame = match self.try_stack.pop() {
                    Some(f) => f,
                    None => return Err(self.type_error("try stack underflow")),
                };
                match frame.exit {
                    FinallyExit::None => {}
                    FinallyExit::Resume(target) => self.pc = target,
                    FinallyExit::Rethrow(v) => return Err(VmFault::Thrown(v)),
                    FinallyExit::Return(v) => self.do_ret_finally(v)?,
                }
            }
            Instr::Throw => {
                let v = self.pop();
                return Err(VmFault::Thrown(v));
            }

            // ---- iteration --------------------------------------------
            Instr::Enumerate => {
                let v = self.pop();
                let rec = if v.is_nullish() {
                    IterRecord::Enum {
                        obj: self.realm.global.clone(),
                        keys: Vec::new(),
                        idx: 0,
                        started: false,
                    }
                } else {
                    let obj = self.to_object(v)?;
                    let keys = enumeration_keys(&obj);
                    IterRecord::Enum {
                        obj,
                        keys,
                        idx: 0,
                        started: false,
                    }
                };
                self.iter_stack.push(rec);
            }
            Instr::EnumNext(d) => {
                let done = {
                    let rec = match self.iter_stack.last_mut() {
                        Some(IterRecord::Enum {
                            obj,
                            keys,
                            idx,
                            started,
                        }) => {
                            if *started {
                                *idx += 1;
                            }
                            *started = true;
                            while *idx < keys.len()
                                && !obj.has_property(&PropKey::Str(keys[*idx].clone()))
                            {
                                *idx += 1;
                            }
                            *idx >= keys.len()
                        }
                        _ => return Err(self.type_error("iteration stack underflow")),
                    };
                    rec
                };
                if done {
                    self.jump_from(pc, *d);
                }
            }
            Instr::EnumGet => {
                let key = match self.iter_stack.last() {
                    Some(IterRecord::Enum { keys, idx, .. }) => keys[*idx].clone(),
                    _ => return Err(self.type_error("iteration stack underflow")),
                };
                self.push(Value::Str(key));
            }
            Instr::EnumPop => {
                self.iter_stack.pop();
            }
            Instr::EnumPopClose => {
                if let Some(rec) = self.iter_stack.pop() {
                    self.close_iter_record(rec);
                }
            }
            Instr::Iterate => {
                let v = self.pop();
                let iterator = self.iterator_open(v)?;
                self.iter_stack.push(IterRecord::Iter {
                    iterator,
                    done: false,
                });
            }
            Instr::IterNext(d) => {
                let iterator = match self.iter_stack.last() {
                    Some(IterRecord::Iter { iterator, .. }) => iterator.clone(),
                    _ => return Err(self.type_error("iteration stack underflow")),
                };
                match self.iterator_step(&iterator) {
                    Ok(Some(v)) => self.push(v),
                    Ok(None) => {
                        if let Some(IterRecord::Iter { done, .. }) = self.iter_stack.last_mut() {
                            *done = true;
                        }
                        self.iter_stack.pop();
                        self.jump_from(pc, *d);
                    }
                    Err(fault) => {
                        // A throwing next() leaves the iterator unclosed.
                        if let Some(IterRecord::Iter { done, .. }) = self.iter_stack.last_mut() {
                            *done = true;
                        }
                        return Err(fault);
                    }
                }
            }

            // ---- literals ---------------------------------------------
            Instr::NewObject => {
                let obj = JsObject::plain(Some(self.realm.object_proto.clone()));
                self.push(Value::Object(obj));
            }
            Instr::NewArray(n) => {
                let split = self.sp() - *n as usize;
                let elems = self.stack.split_off(split);
                let arr = JsObject::array(Some(self.realm.array_proto.clone()), elems);
                self.push(Value::Object(arr));
            }
            Instr::NewArraySparse { count, length } => {
                let split = self.sp() - *count as usize;
                let elems = self.stack.split_off(split);
                let arr = JsObject::array(Some(self.realm.array_proto.clone()), elems);
                arr.with_kind_mut(|k| {
                    if let ObjectKind::Array(a) = k {
                        a.length = *length;
                    }
                });
                self.push(Value::Object(arr));
            }
            Instr::NewRegexp(lit) => {
                let obj = JsObject::new(
                    Some(self.realm.regexp_proto.clone()),
                    "RegExp",
                    ObjectKind::Regexp(RegexpData {
                        source: lit.source.clone(),
                        flags: lit.flags.clone(),
                        global: lit.global,
                        matcher: Rc::clone(&lit.matcher),
                        last_index: 0,
                    }),
                );
                self.push(Value::Object(obj));
            }
            Instr::NewFunc {
                prg,
                name,
                length,
                strict,
                arrow,
            } => {
                let prg = match prg {
                    FuncRef::Prg(p) => Rc::clone(p),
                    FuncRef::Id(_) => {
                        return Err(self.type_error("unresolved function reference"))
                    }
                };
                let func = ScriptFunc {
                    prg,
                    stash: self.stash.clone(),
                    name: name.clone(),
                    length: *length,
                    strict: *strict,
                    arrow: *arrow,
                    captured_new_target: if *arrow {
                        self.new_target.clone()
                    } else {
                        Value::Undefined
                    },
                    captured_this: if *arrow {
                        self.stack[self.sb].clone()
                    } else {
                        Value::Undefined
                    },
                };
                let obj = self.make_function_object(Rc::new(func));
                self.push(Value::Object(obj));
            }
        }
        Ok(())
    }

    fn jump_from(&mut self, pc: usize, d: i32) {
        self.pc = (pc as i64 + i64::from(d)) as usize;
    }

    // ------------------------------------------------------------------
    // Helper bodies kept out of the match for readability
    // ------------------------------------------------------------------

    fn numeric_pair(&mut self, a: Value, b: Value) -> Result<(Value, Value), VmFault> {
        // Left-to-right coercion order is observable through valueOf.
        let a = self.to_numeric_via_primitive(a)?;
        let b = self.to_numeric_via_primitive(b)?;
        Ok((a, b))
    }

    fn to_numeric_via_primitive(&mut self, v: Value) -> Result<Value, VmFault> {
        let p = self.to_primitive(&v, Hint::Number)?;
        self.to_numeric(p)
    }

    fn bitwise(&mut self, f: impl Fn(i32, i32) -> i32) -> Result<(), VmFault> {
        let b = self.pop();
        let a = self.pop();
        let x = self.to_int32_value(&a)?;
        let y = self.to_int32_value(&b)?;
        self.push(Value::Int(i64::from(f(x, y))));
        Ok(())
    }

    fn load_mixed(&mut self, name: &JsString, packed: u32, lex: bool) -> Result<Value, VmFault> {
        let (level, slot) = unpack(packed);
        let fallback = if lex { BindingAttr::LET } else { BindingAttr::VAR };
        match self.mixed_lookup(name, level, slot, fallback) {
            DynLookup::Slot { stash, idx, attr } => {
                let v = stash.borrow().get_slot(idx);
                if attr.lex && v.is_empty() {
                    return Err(self.init_error(name));
                }
                Ok(v.nil_safe())
            }
            DynLookup::WithObj(obj) => {
                self.get_prop_value(&Value::Object(obj), &PropKey::Str(name.clone()))
            }
            DynLookup::Global => Err(self.not_defined_error(name)),
        }
    }

    fn load_dynamic(&mut self, name: &JsString, for_typeof: bool) -> Result<Value, VmFault> {
        match self.dynamic_lookup(name) {
            DynLookup::Slot { stash, idx, attr } => {
                let v = stash.borrow().get_slot(idx);
                if attr.lex && v.is_empty() {
                    return Err(self.init_error(name));
                }
                Ok(v.nil_safe())
            }
            DynLookup::WithObj(obj) => {
                self.get_prop_value(&Value::Object(obj), &PropKey::Str(name.clone()))
            }
            DynLookup::Global => {
                let g = self.realm.global.clone();
                let key = PropKey::Str(name.clone());
                if g.has_property(&key) {
                    self.get_prop_value(&Value::Object(g), &key)
                } else if for_typeof {
                    Ok(Value::Undefined)
                } else {
                    Err(self.not_defined_error(name))
                }
            }
        }
    }

    fn store_dynamic(&mut self, name: &JsString, v: Value, strict: bool) -> Result<(), VmFault> {
        match self.dynamic_lookup(name) {
            DynLookup::Slot { stash, idx, attr } => {
                if attr.lex && stash.borrow().get_slot(idx).is_empty() {
                    return Err(self.init_error(name));
                }
                if !attr.mutable {
                    return Err(self.const_error());
                }
                stash.borrow_mut().set_slot(idx, v);
                Ok(())
            }
            DynLookup::WithObj(obj) => {
                self.set_prop_value(&Value::Object(obj), &PropKey::Str(name.clone()), v, strict)
            }
            DynLookup::Global => {
                let g = self.realm.global.clone();
                let key = PropKey::Str(name.clone());
                if strict && !g.has_property(&key) {
                    return Err(self.not_defined_error(name));
                }
                self.set_prop_value(&Value::Object(g), &key, v, strict)
            }
        }
    }

    fn ref_get(&mut self, idx: usize) -> Result<Value, VmFault> {
        enum Plan {
            Slot(Rc<RefCell<Stash>>, u32, BindingAttr, JsString),
            Prop(JsObject, JsString),
            Global(JsString),
        }
        let plan = match &self.ref_stack[idx] {
            RefRecord::Slot {
                stash,
                idx,
                attr,
                name,
            } => Plan::Slot(Rc::clone(stash), *idx, *attr, name.clone()),
            RefRecord::Prop { base, name, .. } => Plan::Prop(base.clone(), name.clone()),
            RefRecord::Global { name, .. } => Plan::Global(name.clone()),
        };
        match plan {
            Plan::Slot(stash, slot, attr, name) => {
                let v = stash.borrow().get_slot(slot);
                if attr.lex && v.is_empty() {
                    return Err(self.init_error(&name));
                }
                Ok(v.nil_safe())
            }
            Plan::Prop(base, name) => {
                self.get_prop_value(&Value::Object(base), &PropKey::Str(name))
            }
            Plan::Global(name) => {
                let g = self.realm.global.clone();
                let key = PropKey::Str(name.clone());
                if !g.has_property(&key) {
                    return Err(self.not_defined_error(&name));
                }
                self.get_prop_value(&Value::Object(g), &key)
            }
        }
    }

    fn ref_put(&mut self, rec: &RefRecord, v: Value) -> Result<(), VmFault> {
        match rec {
            RefRecord::Slot {
                stash,
                idx,
                attr,
                name,
            } => {
                if attr.lex && stash.borrow().get_slot(*idx).is_empty() {
                    let name = name.clone();
                    return Err(self.init_error(&name));
                }
                if !attr.mutable {
                    return Err(self.const_error());
                }
                stash.borrow_mut().set_slot(*idx, v);
                Ok(())
            }
            RefRecord::Prop { base, name, strict } => self.set_prop_value(
                &Value::Object(base.clone()),
                &PropKey::Str(name.clone()),
                v,
                *strict,
            ),
            RefRecord::Global { name, strict } => {
                let g = self.realm.global.clone();
                let key = PropKey::Str(name.clone());
                if *strict && !g.has_property(&key) {
                    let name = name.clone();
                    return Err(self.not_defined_error(&name));
                }
                self.set_prop_value(&Value::Object(g), &key, v, *strict)
            }
        }
    }

    fn delete_var(&mut self, name: &JsString) -> Result<bool, VmFault> {
        let mut cur = self.stash.clone();
        while let Some(stash_rc) = cur {
            let deletable = {
                let stash = stash_rc.borrow();
                if let Some(names) = &stash.names {
                    if let Some((_, attr)) = names.get(name) {
                        Some(attr.deletable)
                    } else {
                        None
                    }
                } else {
                    None
                }
            };
            if let Some(deletable) = deletable {
                if deletable {
                    if let Some(names) = stash_rc.borrow_mut().names.as_mut() {
                        names.remove(name);
                    }
                    return Ok(true);
                }
                return Ok(false);
            }
            let stash = stash_rc.borrow();
            if let Some(obj) = &stash.obj {
                let key = PropKey::Str(name.clone());
                if stash.outer.is_some() {
                    if obj.has_property(&key) {
                        let obj = obj.clone();
                        drop(stash);
                        return self.delete_prop_value(&Value::Object(obj), &key, false);
                    }
                } else {
                    // Global frame.
                    let obj = obj.clone();
                    drop(stash);
                    return Ok(obj.delete(&key));
                }
            }
            cur = stash_rc.borrow().outer.clone();
        }
        let g = self.realm.global.clone();
        Ok(g.delete(&PropKey::Str(name.clone())))
    }

    fn bind_vars(&mut self, names: &Rc<Vec<JsString>>, deletable: bool) {
        // Find the variable environment: the nearest function-boundary
        // stash with by-name slots, else the global object.
        let mut cur = self.stash.clone();
        while let Some(stash_rc) = cur {
            let is_var_env = {
                let stash = stash_rc.borrow();
                stash.function && stash.names.is_some()
            };
            if is_var_env {
                let mut stash = stash_rc.borrow_mut();
                for name in names.iter() {
                    let present = stash
                        .names
                        .as_ref()
                        .is_some_and(|m| m.contains_key(name));
                    if !present {
                        let attr = BindingAttr {
                            lex: false,
                            mutable: true,
                            deletable,
                        };
                        stash.add_named(name.clone(), attr, Value::Undefined);
                    }
                }
                return;
            }
            cur = stash_rc.borrow().outer.clone();
        }
        let g = self.realm.global.clone();
        for name in names.iter() {
            let key = PropKey::Str(name.clone());
            if !g.has_own(&key) {
                g.define_own(
                    key,
                    Property::data_with(Value::Undefined, true, true, deletable),
                );
            }
        }
    }

    fn bind_global(&mut self, gb: &crate::instr::GlobalBindings) -> Result<(), VmFault> {
        let g = self.realm.global.clone();
        let global_stash = self.realm.global_stash.clone();
        for (name, attr) in &gb.lets {
            let clash = {
                let stash = global_stash.borrow();
                stash
                    .names
                    .as_ref()
                    .is_some_and(|m| m.contains_key(name))
            };
            if clash || g.has_own(&PropKey::Str(name.clone())) {
                return Err(self.syntax_error(format!(
                    "Identifier '{}' has already been declared",
                    name
                )));
            }
            global_stash
                .borrow_mut()
                .add_named(name.clone(), *attr, Value::Empty);
        }
        for name in gb.vars.iter().chain(gb.funcs.iter()) {
            let lex_clash = {
                let stash = global_stash.borrow();
                stash
                    .names
                    .as_ref()
                    .is_some_and(|m| m.contains_key(name))
            };
            if lex_clash {
                return Err(self.syntax_error(format!(
                    "Identifier '{}' has already been declared",
                    name
                )));
            }
            let key = PropKey::Str(name.clone());
            if !g.has_own(&key) {
                g.define_own(
                    key,
                    Property::data_with(Value::Undefined, true, true, false),
                );
            }
        }
        Ok(())
    }

    fn exec_call(&mut self, nargs: usize) -> Result<(), VmFault> {
        let callee_idx = self.sp() - nargs - 2;
        let callee = self.stack[callee_idx].clone();
        if let Value::Unresolved(name) = &callee {
            let name = name.clone();
            return Err(self.not_defined_error(&name));
        }
        let func = match callee.as_object().and_then(|o| o.assert_callable()) {
            Some(f) => f,
            None => {
                return Err(
                    self.type_error(format!("{} is not a function", self.describe(&callee)))
                )
            }
        };
        match func {
            FuncKind::Native(n) => {
                let this = self.stack[callee_idx + 1].clone();
                let args: Vec<Value> = self.stack.split_off(callee_idx + 2);
                self.stack.truncate(callee_idx);
                let result = (n.func)(self, &this, &args)?;
                self.push(result);
                Ok(())
            }
            FuncKind::Script(f) => {
                self.enter_script_frame(&f, nargs, Value::Undefined, self.pc as isize)
            }
        }
    }

    fn exec_call_eval(&mut self, nargs: usize, strict: bool) -> Result<(), VmFault> {
        let callee_idx = self.sp() - nargs - 2;
        let callee = self.stack[callee_idx].clone();
        let is_eval = callee
            .as_object()
            .is_some_and(|o| o.same(&self.realm.eval_fn));
        if !is_eval {
            return self.exec_call(nargs);
        }
        let args: Vec<Value> = self.stack.split_off(callee_idx + 2);
        self.stack.truncate(callee_idx);
        let src = match args.first() {
            Some(Value::Str(s)) => s.clone(),
            Some(other) => {
                self.push(other.clone());
                return Ok(());
            }
            None => {
                self.push(Value::Undefined);
                return Ok(());
            }
        };
        let prg = match crate::compiler::compile_eval(
            &src.to_std_string(),
            strict,
            &self.realm,
        ) {
            Ok(prg) => prg,
            Err(e) => return Err(self.syntax_error(e.message)),
        };
        // Rebuild a standard two-slot frame around the caller's `this` so
        // the eval program's `Ret` stays uniform.
        let caller_this = self.stack[self.sb].clone();
        self.push(Value::Empty); // callee placeholder
        self.push(caller_this);
        self.call_stack.push(Context {
            prg: Rc::clone(&self.prg),
            stash: self.stash.clone(),
            pc: self.pc as isize,
            sb: self.sb,
            args: self.args,
            new_target: self.new_target.clone(),
            result: std::mem::replace(&mut self.result, Value::Undefined),
        });
        self.prg = prg;
        self.sb = self.sp() - 1;
        self.args = 0;
        self.pc = 0;
        Ok(())
    }

    /// `return` with pending finally blocks: run the innermost one that
    /// has not executed yet, remembering to continue the return after.
    fn do_ret_finally(&mut self, v: Value) -> Result<(), VmFault> {
        let depth = self.call_stack.len();
        let mut target = None;
        for (i, f) in self.try_stack.iter().enumerate().rev() {
            if f.call_depth < depth {
                break;
            }
            if f.finally_pc >= 0 && f.state != TryState::InFinally {
                target = Some(i);
                break;
            }
        }
        match target {
            None => {
                while let Some(f) = self.try_stack.last() {
                    if f.call_depth >= depth && depth > 0 {
                        self.try_stack.pop();
                    } else {
                        break;
                    }
                }
                self.do_return(v)
            }
            Some(i) => {
                self.try_stack.truncate(i + 1);
                // The finally runs at the frame's recorded baseline, not
                // wherever the return statement sat.
                self.restore_try_frame();
                let frame = self.try_stack.last_mut().expect("frame just kept");
                frame.state = TryState::InFinally;
                let finally_pc = frame.finally_pc as usize;
                frame.exit = FinallyExit::Return(v);
                self.pc = finally_pc;
                Ok(())
            }
        }
    }

    fn pad_args(&mut self, num_args: u32) {
        while self.args < num_args as usize {
            self.push(Value::Undefined);
            self.args += 1;
        }
    }

    fn enter_func(&mut self, p: &Rc<EnterFuncParams>) {
        self.pad_args(p.num_args);
        let outer = self.stash.take();
        let mut stash = Stash {
            values: vec![Value::Empty; p.stash_size as usize],
            names: p.names.as_ref().map(|names| {
                names
                    .iter()
                    .enumerate()
                    .map(|(i, (n, a))| (n.clone(), (i as u32, *a)))
                    .collect::<HashMap<_, _>>()
            }),
            obj: None,
            outer,
            function: true,
        };
        if p.args_to_stash {
            for i in 0..p.num_args as usize {
                stash.values[i] = self.stack[self.sb + 1 + i].clone();
            }
        }
        self.stash = Some(Rc::new(RefCell::new(stash)));
        for _ in 0..p.stack_size {
            self.push(Value::Empty);
        }
    }

    fn enter_block(&mut self, p: &Rc<BlockParams>) {
        if p.stash_size > 0 || p.names.is_some() {
            let outer = self.stash.take();
            self.stash = Some(Rc::new(RefCell::new(Stash {
                values: vec![Value::Empty; p.stash_size as usize],
                names: p.names.as_ref().map(|names| {
                    names
                        .iter()
                        .enumerate()
                        .map(|(i, (n, a))| (n.clone(), (i as u32, *a)))
                        .collect::<HashMap<_, _>>()
                }),
                obj: None,
                outer,
                function: false,
            })));
        }
        for _ in 0..p.stack_size {
            self.push(Value::Empty);
        }
    }

    fn create_args(&mut self, formals: u32, strict: bool) -> JsObject {
        let nargs = self.args;
        let stash = self
            .stash
            .clone()
            .expect("arguments materialization requires a stash");
        let mapped: Vec<Option<u32>> = (0..nargs)
            .map(|i| {
                if !strict && (i as u32) < formals {
                    Some(i as u32)
                } else {
                    None
                }
            })
            .collect();
        let obj = JsObject::new(
            Some(self.realm.object_proto.clone()),
            "Arguments",
            ObjectKind::Arguments(ArgsData {
                stash,
                mapped,
            }),
        );
        // Unmapped indices (extras, or everything under strict) become
        // plain properties snapshotting the call's actuals.
        for i in 0..nargs {
            if strict || i as u32 >= formals {
                let v = self.stack[self.sb + 1 + i].clone().nil_safe();
                obj.put_value(&PropKey::str(i.to_string()), v);
            }
        }
        obj.define_own(
            PropKey::str("length"),
            Property::data_with(Value::Int(nargs as i64), true, false, true),
        );
        if !strict {
            let callee = self.stack[self.sb - 1].clone();
            obj.define_own(
                PropKey::str("callee"),
                Property::data_with(callee, true, false, true),
            );
        }
        obj
    }

    /// Build the callable object for a compiled function, with `name`,
    /// `length` and (except for arrows) a fresh `prototype`.
    pub(crate) fn make_function_object(&mut self, f: Rc<ScriptFunc>) -> JsObject {
        let arrow = f.arrow;
        let name = f.name.clone();
        let length = f.length;
        let obj = JsObject::new(
            Some(self.realm.func_proto.clone()),
            "Function",
            ObjectKind::Function(FuncKind::Script(f)),
        );
        obj.define_own(
            PropKey::str("name"),
            Property::data_with(Value::Str(name), false, false, true),
        );
        obj.define_own(
            PropKey::str("length"),
            Property::data_with(Value::Int(i64::from(length)), false, false, true),
        );
        if !arrow {
            let proto = JsObject::plain(Some(self.realm.object_proto.clone()));
            proto.define_own(
                PropKey::str("constructor"),
                Property::data_with(Value::Object(obj.clone()), true, false, true),
            );
            obj.define_own(
                PropKey::str("prototype"),
                Property::data_with(Value::Object(proto), true, false, false),
            );
        }
        obj
    }
}

/// for..in key collection: own enumerable keys, then each prototype's,
/// skipping anything already seen (shadowed properties hide inherited
/// ones regardless of enumerability).
fn enumeration_keys(obj: &JsObject) -> Vec<JsString> {
    let mut keys = Vec::new();
    let mut seen: Vec<JsString> = Vec::new();
    let mut cur = Some(obj.clone());
    while let Some(o) = cur {
        let own_all = o.own_string_keys();
        let own_enumerable = o.own_enumerable_string_keys();
        for k in own_enumerable {
            if !seen.contains(&k) {
                keys.push(k);
            }
        }
        for k in own_all {
            if !seen.contains(&k) {
                seen.push(k);
            }
        }
        cur = o.proto();
    }
    keys
}
