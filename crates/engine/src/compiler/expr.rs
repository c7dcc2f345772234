//! Expression lowering
//!
//! Each l-value kind supports three emission shapes: plain load, plain
//! store (the stored value stays on the stack), and read-modify-write for
//! compound assignment and increment/decrement. Statically bound
//! identifiers emit placeholder slot instructions rewritten at scope
//! finalization; identifiers behind dynamic frames go through the
//! mixed/reference instructions; everything else resolves by name at
//! runtime.
//!
//! Constant subexpressions are folded by compiling them into a scratch
//! program and running it on a throwaway VM; the resulting value replaces
//! the whole emission with a single constant load.

use super::{BindKind, Compiler, PrgBuilder, Resolved};
use crate::ast::*;
use crate::errors::CompileError;
use crate::instr::Instr;
use crate::object::build_regex;
use crate::value::Value;
use crate::vm::{InterruptState, Vm};
use skiff_core::JsString;
use std::rc::Rc;

impl Compiler {
    pub(crate) fn compile_expr(&mut self, e: &Expr, put: bool) -> Result<(), CompileError> {
        // Constant folding: run the subexpression on a scratch VM and emit
        // a single constant load in its place.
        if put && !self.folding && is_foldable(e) {
            if let Some(v) = self.fold_constant(e) {
                self.load_const(v);
                return Ok(());
            }
        }
        match &e.kind {
            ExprKind::Num(n) => {
                if put {
                    self.load_const(Value::number(*n));
                }
            }
            ExprKind::Str(s) => {
                if put {
                    self.load_const(Value::Str(s.clone()));
                }
            }
            ExprKind::Bool(b) => {
                if put {
                    self.load_const(Value::Bool(*b));
                }
            }
            ExprKind::Null => {
                if put {
                    self.emit(Instr::LoadNull);
                }
            }
            ExprKind::Regex { pattern, flags } => {
                let lit = build_regex(pattern, flags)
                    .map_err(|msg| self.err_at(e.offset, msg))?;
                self.emit(Instr::NewRegexp(Rc::new(lit)));
                if !put {
                    self.emit(Instr::Pop);
                }
            }
            ExprKind::This => {
                if put {
                    self.compile_this();
                }
            }
            ExprKind::NewTarget => {
                if !self.in_function {
                    return Err(
                        self.err_at(e.offset, "new.target expression is not allowed here")
                    );
                }
                if put {
                    self.emit(Instr::LoadNewTarget);
                }
            }
            ExprKind::Ident(name) => {
                self.mark_src(e.offset);
                self.compile_ident_get(name);
                if !put {
                    self.emit(Instr::Pop);
                }
            }
            ExprKind::Array(items) => {
                let sparse = items.iter().any(|i| i.is_none());
                for item in items {
                    match item {
                        Some(e) => self.compile_expr(e, true)?,
                        None => {
                            self.emit(Instr::LoadEmpty);
                        }
                    }
                }
                let n = items.len() as u32;
                self.emit(if sparse {
                    Instr::NewArraySparse {
                        count: n,
                        length: n,
                    }
                } else {
                    Instr::NewArray(n)
                });
                if !put {
                    self.emit(Instr::Pop);
                }
            }
            ExprKind::Object(props) => {
                self.emit(Instr::NewObject);
                for p in props {
                    self.mark_src(p.offset);
                    match p.kind {
                        PropDefKind::Init => {
                            self.compile_expr(&p.value, true)?;
                            if p.key.as_ascii() == Some("__proto__") {
                                self.emit(Instr::SetProto);
                            } else {
                                self.emit(Instr::SetProp1(p.key.clone()));
                            }
                        }
                        PropDefKind::Getter => {
                            self.compile_expr(&p.value, true)?;
                            self.emit(Instr::SetPropGetter(p.key.clone()));
                        }
                        PropDefKind::Setter => {
                            self.compile_expr(&p.value, true)?;
                            self.emit(Instr::SetPropSetter(p.key.clone()));
                        }
                    }
                }
                if !put {
                    self.emit(Instr::Pop);
                }
            }
            ExprKind::Function(lit) => {
                self.compile_function(lit)?;
                if !put {
                    self.emit(Instr::Pop);
                }
            }
            ExprKind::Member { obj, prop } => {
                self.compile_expr(obj, true)?;
                self.mark_src(e.offset);
                self.emit(Instr::GetProp(prop.clone()));
                if !put {
                    self.emit(Instr::Pop);
                }
            }
            ExprKind::Index { obj, prop } => {
                self.compile_expr(obj, true)?;
                self.compile_expr(prop, true)?;
                self.mark_src(e.offset);
                self.emit(Instr::GetElem);
                if !put {
                    self.emit(Instr::Pop);
                }
            }
            ExprKind::Seq(exprs) => {
                let (last, init) = exprs.split_last().expect("sequence is non-empty");
                for e in init {
                    self.compile_expr(e, false)?;
                }
                self.compile_expr(last, put)?;
            }
            ExprKind::Unary {
                op,
                prefix,
                operand,
            } => self.compile_unary(e.offset, *op, *prefix, operand, put)?,
            ExprKind::Binary { op, lhs, rhs } => {
                self.compile_expr(lhs, true)?;
                self.compile_expr(rhs, true)?;
                self.mark_src(e.offset);
                self.emit(binop_instr(*op));
                if !put {
                    self.emit(Instr::Pop);
                }
            }
            ExprKind::Logical { and, lhs, rhs } => {
                self.compile_expr(lhs, true)?;
                let j = self.emit(if *and {
                    Instr::JumpIfFalsePeek(0)
                } else {
                    Instr::JumpIfTruePeek(0)
                });
                self.compile_expr(rhs, true)?;
                self.patch_jump(j);
                if !put {
                    self.emit(Instr::Pop);
                }
            }
            ExprKind::Cond { test, cons, alt } => {
                self.compile_expr(test, true)?;
                let jf = self.emit(Instr::JumpIfFalse(0));
                self.compile_expr(cons, true)?;
                let j_end = self.emit(Instr::Jump(0));
                self.patch_jump(jf);
                self.compile_expr(alt, true)?;
                self.patch_jump(j_end);
                if !put {
                    self.emit(Instr::Pop);
                }
            }
            ExprKind::Assign { op, target, value } => {
                self.compile_assign(e.offset, op.as_ref(), target, value, put)?
            }
            ExprKind::Call { callee, args } => self.compile_call(e.offset, callee, args, put)?,
            ExprKind::New { callee, args } => {
                self.compile_expr(callee, true)?;
                for a in args {
                    self.compile_expr(a, true)?;
                }
                self.mark_src(e.offset);
                self.emit(Instr::New(args.len() as u32));
                if !put {
                    self.emit(Instr::Pop);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Identifiers
    // ------------------------------------------------------------------

    fn resolve_ident(&mut self, name: &JsString) -> Resolved {
        if name.as_ascii() == Some("arguments") {
            self.lookup_arguments(name)
        } else {
            self.lookup(name)
        }
    }

    pub(crate) fn compile_ident_get(&mut self, name: &JsString) {
        match self.resolve_ident(name) {
            Resolved::Static { scope, idx } => {
                self.emit_binding_access(scope, idx, Instr::LoadStash(0));
            }
            Resolved::Mixed { scope, idx } => {
                let lex = self.scopes[scope].bindings[idx].kind.lexical();
                self.emit_binding_access(
                    scope,
                    idx,
                    Instr::LoadMixed {
                        name: name.clone(),
                        packed: 0,
                        lex,
                    },
                );
            }
            Resolved::Dynamic => {
                self.emit(Instr::LoadDynamic(name.clone()));
            }
        }
    }

    /// Push callee then `this` for a call through a bare identifier.
    fn compile_ident_callee(&mut self, name: &JsString) {
        match self.resolve_ident(name) {
            Resolved::Static { scope, idx } => {
                self.emit_binding_access(scope, idx, Instr::LoadStash(0));
                self.emit(Instr::LoadUndef);
            }
            Resolved::Mixed { scope, idx } => {
                let lex = self.scopes[scope].bindings[idx].kind.lexical();
                self.emit_binding_access(
                    scope,
                    idx,
                    Instr::LoadMixedCallee {
                        name: name.clone(),
                        packed: 0,
                        lex,
                    },
                );
            }
            Resolved::Dynamic => {
                self.emit(Instr::LoadDynamicCallee(name.clone()));
            }
        }
    }

    /// Store the top of stack into a name, keeping the value.
    pub(crate) fn emit_var_store(
        &mut self,
        name: &JsString,
        offset: u32,
    ) -> Result<(), CompileError> {
        if self.strict() && matches!(name.as_ascii(), Some("eval") | Some("arguments")) {
            return Err(self.err_at(
                offset,
                format!("Assignment to '{}' in strict mode", name),
            ));
        }
        match self.resolve_ident(name) {
            Resolved::Static { scope, idx } => {
                let kind = self.scopes[scope].bindings[idx].kind;
                if matches!(kind, BindKind::Callee) && !self.strict() {
                    // Sloppy assignment to a function expression's own
                    // name is silently dropped.
                    return Ok(());
                }
                self.emit_binding_access(scope, idx, Instr::StoreStash(0));
            }
            Resolved::Mixed { scope, idx } => {
                let attr = self.scopes[scope].bindings[idx].kind.attr();
                self.emit_binding_access(
                    scope,
                    idx,
                    Instr::ResolveMixed {
                        name: name.clone(),
                        packed: 0,
                        attr,
                    },
                );
                self.emit(Instr::PutValue);
            }
            Resolved::Dynamic => {
                let strict = self.strict();
                self.emit(Instr::StoreDynamic {
                    name: name.clone(),
                    strict,
                });
            }
        }
        Ok(())
    }

    /// Pop the top of stack into a name: declaration initialization.
    pub(crate) fn emit_var_init(&mut self, name: &JsString) -> Result<(), CompileError> {
        match self.resolve_ident(name) {
            Resolved::Static { scope, idx } => {
                self.emit_binding_access(scope, idx, Instr::InitStash(0));
            }
            Resolved::Mixed { scope, idx } => {
                // Initialization never observes the dead zone, so route a
                // plain mutable reference through it.
                self.emit_binding_access(
                    scope,
                    idx,
                    Instr::ResolveMixed {
                        name: name.clone(),
                        packed: 0,
                        attr: crate::instr::BindingAttr::VAR,
                    },
                );
                self.emit(Instr::PutValue);
                self.emit(Instr::Pop);
            }
            Resolved::Dynamic => {
                let strict = self.strict();
                self.emit(Instr::StoreDynamic {
                    name: name.clone(),
                    strict,
                });
                self.emit(Instr::Pop);
            }
        }
        Ok(())
    }

    /// Store the value on top of the stack into an arbitrary assignment
    /// target, consuming it (for..in / for..of heads).
    pub(crate) fn compile_store_from_stack(&mut self, target: &Expr) -> Result<(), CompileError> {
        match &target.kind {
            ExprKind::Ident(name) => {
                let name = name.clone();
                self.emit_var_store(&name, target.offset)?;
                self.emit(Instr::Pop);
            }
            ExprKind::Member { obj, prop } => {
                self.compile_expr(obj, true)?;
                self.emit(Instr::Swap);
                self.emit(if self.strict() {
                    Instr::SetPropStrict(prop.clone())
                } else {
                    Instr::SetProp(prop.clone())
                });
                self.emit(Instr::Pop);
            }
            ExprKind::Index { obj, prop } => {
                self.compile_expr(obj, true)?;
                self.compile_expr(prop, true)?;
                self.emit(Instr::Rot3L);
                self.emit(if self.strict() {
                    Instr::SetElemStrict
                } else {
                    Instr::SetElem
                });
                self.emit(Instr::Pop);
            }
            _ => {
                return Err(self.err_at(target.offset, "invalid assignment target"));
            }
        }
        Ok(())
    }

    fn compile_this(&mut self) {
        // `this` inside an arrow reads the enclosing function's boxed
        // binding; everywhere else it is the frame slot.
        let mut s = Some(self.cur_scope);
        let mut in_arrow = false;
        while let Some(id) = s {
            if self.scopes[id].function {
                in_arrow = self.scopes[id].is_arrow;
                break;
            }
            s = self.scopes[id].parent;
        }
        if in_arrow {
            if let Some(resolved) = self.lookup_boxed_this() {
                match resolved {
                    Resolved::Static { scope, idx } => {
                        self.emit_binding_access(scope, idx, Instr::LoadStash(0));
                        return;
                    }
                    Resolved::Mixed { scope, idx } => {
                        self.emit_binding_access(
                            scope,
                            idx,
                            Instr::LoadMixed {
                                name: JsString::from("this"),
                                packed: 0,
                                lex: false,
                            },
                        );
                        return;
                    }
                    Resolved::Dynamic => {}
                }
            }
        }
        self.emit(Instr::LoadStack(0));
    }

    // ------------------------------------------------------------------
    // Assignment, increment, decrement
    // ------------------------------------------------------------------

    fn compile_assign(
        &mut self,
        offset: u32,
        op: Option<&BinOp>,
        target: &Expr,
        value: &Expr,
        put: bool,
    ) -> Result<(), CompileError> {
        self.mark_src(offset);
        let strict = self.strict();
        match (op, &target.kind) {
            (None, ExprKind::Ident(name)) => {
                let name = name.clone();
                if strict && matches!(name.as_ascii(), Some("eval") | Some("arguments")) {
                    return Err(self.err_at(
                        target.offset,
                        format!("Assignment to '{}' in strict mode", name),
                    ));
                }
                self.compile_expr(value, true)?;
                // Statement-position stores of plain vars pop in one
                // instruction instead of store-then-pop.
                if !put {
                    if let Resolved::Static { scope, idx } = self.resolve_ident(&name) {
                        let kind = self.scopes[scope].bindings[idx].kind;
                        if matches!(kind, BindKind::Var | BindKind::Arg(_)) {
                            self.emit_binding_access(scope, idx, Instr::StoreStashP(0));
                            return Ok(());
                        }
                    }
                }
                self.emit_var_store(&name, target.offset)?;
            }
            (None, ExprKind::Member { obj, prop }) => {
                self.compile_expr(obj, true)?;
                self.compile_expr(value, true)?;
                self.emit(if strict {
                    Instr::SetPropStrict(prop.clone())
                } else {
                    Instr::SetProp(prop.clone())
                });
            }
            (None, ExprKind::Index { obj, prop }) => {
                self.compile_expr(obj, true)?;
                self.compile_expr(prop, true)?;
                self.compile_expr(value, true)?;
                self.emit(if strict {
                    Instr::SetElemStrict
                } else {
                    Instr::SetElem
                });
            }
            (Some(op), ExprKind::Ident(name)) => {
                let name = name.clone();
                if strict && matches!(name.as_ascii(), Some("eval") | Some("arguments")) {
                    return Err(self.err_at(
                        target.offset,
                        format!("Assignment to '{}' in strict mode", name),
                    ));
                }
                match self.resolve_ident(&name) {
                    Resolved::Static { scope, idx } => {
                        self.emit_binding_access(scope, idx, Instr::LoadStash(0));
                        self.compile_expr(value, true)?;
                        self.emit(binop_instr(*op));
                        self.emit_binding_access(scope, idx, Instr::StoreStash(0));
                    }
                    Resolved::Mixed { scope, idx } => {
                        let attr = self.scopes[scope].bindings[idx].kind.attr();
                        self.emit_binding_access(
                            scope,
                            idx,
                            Instr::ResolveMixed {
                                name: name.clone(),
                                packed: 0,
                                attr,
                            },
                        );
                        self.emit(Instr::GetValue);
                        self.compile_expr(value, true)?;
                        self.emit(binop_instr(*op));
                        self.emit(Instr::PutValue);
                    }
                    Resolved::Dynamic => {
                        self.emit(Instr::ResolveVar {
                            name: name.clone(),
                            strict,
                        });
                        self.emit(Instr::GetValue);
                        self.compile_expr(value, true)?;
                        self.emit(binop_instr(*op));
                        self.emit(Instr::PutValue);
                    }
                }
            }
            (Some(op), ExprKind::Member { obj, prop }) => {
                self.compile_expr(obj, true)?;
                self.emit(Instr::Dup);
                self.emit(Instr::GetProp(prop.clone()));
                self.compile_expr(value, true)?;
                self.emit(binop_instr(*op));
                self.emit(if strict {
                    Instr::SetPropStrict(prop.clone())
                } else {
                    Instr::SetProp(prop.clone())
                });
            }
            (Some(op), ExprKind::Index { obj, prop }) => {
                self.compile_expr(obj, true)?;
                self.compile_expr(prop, true)?;
                self.emit(Instr::Dup2);
                self.emit(Instr::GetElem);
                self.compile_expr(value, true)?;
                self.emit(binop_instr(*op));
                self.emit(if strict {
                    Instr::SetElemStrict
                } else {
                    Instr::SetElem
                });
            }
            _ => return Err(self.err_at(target.offset, "invalid left-hand side in assignment")),
        }
        if !put {
            self.emit(Instr::Pop);
        }
        Ok(())
    }

    fn compile_unary(
        &mut self,
        offset: u32,
        op: UnaryOp,
        prefix: bool,
        operand: &Expr,
        put: bool,
    ) -> Result<(), CompileError> {
        match op {
            UnaryOp::Delete => return self.compile_delete(offset, operand, put),
            UnaryOp::TypeOf => {
                if let ExprKind::Ident(name) = &operand.kind {
                    let name = name.clone();
                    match self.resolve_ident(&name) {
                        Resolved::Dynamic => {
                            self.emit(Instr::LoadDynamicTypeof(name));
                        }
                        Resolved::Static { scope, idx } => {
                            self.emit_binding_access(scope, idx, Instr::LoadStash(0));
                        }
                        Resolved::Mixed { scope, idx } => {
                            let lex = self.scopes[scope].bindings[idx].kind.lexical();
                            self.emit_binding_access(
                                scope,
                                idx,
                                Instr::LoadMixed {
                                    name,
                                    packed: 0,
                                    lex,
                                },
                            );
                        }
                    }
                } else {
                    self.compile_expr(operand, true)?;
                }
                self.emit(Instr::TypeOf);
                if !put {
                    self.emit(Instr::Pop);
                }
                return Ok(());
            }
            UnaryOp::Inc | UnaryOp::Dec => {
                return self.compile_inc_dec(offset, op, prefix, operand, put)
            }
            UnaryOp::Void => {
                self.compile_expr(operand, false)?;
                if put {
                    self.emit(Instr::LoadUndef);
                }
                return Ok(());
            }
            _ => {}
        }
        self.compile_expr(operand, true)?;
        self.mark_src(offset);
        self.emit(match op {
            UnaryOp::Minus => Instr::Neg,
            UnaryOp::Plus => Instr::Pos,
            UnaryOp::Not => Instr::Not,
            UnaryOp::BitNot => Instr::BitNot,
            _ => unreachable!("handled above"),
        });
        if !put {
            self.emit(Instr::Pop);
        }
        Ok(())
    }

    fn compile_inc_dec(
        &mut self,
        offset: u32,
        op: UnaryOp,
        prefix: bool,
        operand: &Expr,
        put: bool,
    ) -> Result<(), CompileError> {
        self.mark_src(offset);
        let strict = self.strict();
        let step = if matches!(op, UnaryOp::Inc) {
            Instr::Inc
        } else {
            Instr::Dec
        };
        let postfix = !prefix && put;
        match &operand.kind {
            ExprKind::Ident(name) => {
                let name = name.clone();
                if strict && matches!(name.as_ascii(), Some("eval") | Some("arguments")) {
                    return Err(self.err_at(
                        operand.offset,
                        format!("Assignment to '{}' in strict mode", name),
                    ));
                }
                match self.resolve_ident(&name) {
                    Resolved::Static { scope, idx } => {
                        self.emit_binding_access(scope, idx, Instr::LoadStash(0));
                        if postfix {
                            self.emit(Instr::Pos);
                            self.emit(Instr::Dup);
                            self.emit(step);
                            self.emit_binding_access(scope, idx, Instr::StoreStash(0));
                            self.emit(Instr::Pop);
                        } else {
                            self.emit(step);
                            self.emit_binding_access(scope, idx, Instr::StoreStash(0));
                            if !put {
                                self.emit(Instr::Pop);
                            }
                        }
                    }
                    resolved @ (Resolved::Mixed { .. } | Resolved::Dynamic) => {
                        match resolved {
                            Resolved::Mixed { scope, idx } => {
                                let attr = self.scopes[scope].bindings[idx].kind.attr();
                                self.emit_binding_access(
                                    scope,
                                    idx,
                                    Instr::ResolveMixed {
                                        name: name.clone(),
                                        packed: 0,
                                        attr,
                                    },
                                );
                            }
                            _ => {
                                self.emit(Instr::ResolveVar {
                                    name: name.clone(),
                                    strict,
                                });
                            }
                        }
                        self.emit(Instr::GetValue);
                        if postfix {
                            self.emit(Instr::Pos);
                            self.emit(Instr::Dup);
                            self.emit(step);
                            self.emit(Instr::PutValue);
                            self.emit(Instr::Pop);
                        } else {
                            self.emit(step);
                            self.emit(Instr::PutValue);
                            if !put {
                                self.emit(Instr::Pop);
                            }
                        }
                    }
                }
            }
            ExprKind::Member { obj, prop } => {
                self.compile_expr(obj, true)?;
                self.emit(Instr::Dup);
                self.emit(Instr::GetProp(prop.clone()));
                let set = if strict {
                    Instr::SetPropStrict(prop.clone())
                } else {
                    Instr::SetProp(prop.clone())
                };
                if postfix {
                    self.emit(Instr::Pos);
                    self.emit(Instr::Swap);
                    self.emit(Instr::DupAt(1));
                    self.emit(step);
                    self.emit(set);
                    self.emit(Instr::Pop);
                } else {
                    self.emit(step);
                    self.emit(set);
                    if !put {
                        self.emit(Instr::Pop);
                    }
                }
            }
            ExprKind::Index { obj, prop } => {
                self.compile_expr(obj, true)?;
                self.compile_expr(prop, true)?;
                self.emit(Instr::Dup2);
                self.emit(Instr::GetElem);
                let set = if strict {
                    Instr::SetElemStrict
                } else {
                    Instr::SetElem
                };
                if postfix {
                    self.emit(Instr::Pos);
                    self.emit(Instr::Rot3);
                    self.emit(Instr::DupAt(2));
                    self.emit(step);
                    self.emit(set);
                    self.emit(Instr::Pop);
                } else {
                    self.emit(step);
                    self.emit(set);
                    if !put {
                        self.emit(Instr::Pop);
                    }
                }
            }
            _ => {
                return Err(self.err_at(
                    operand.offset,
                    "invalid left-hand side in increment/decrement",
                ))
            }
        }
        Ok(())
    }

    fn compile_delete(
        &mut self,
        offset: u32,
        operand: &Expr,
        put: bool,
    ) -> Result<(), CompileError> {
        self.mark_src(offset);
        let strict = self.strict();
        match &operand.kind {
            ExprKind::Ident(name) => {
                if strict {
                    return Err(self.err_at(
                        offset,
                        "Delete of an unqualified identifier in strict mode.",
                    ));
                }
                let name = name.clone();
                match self.resolve_ident(&name) {
                    Resolved::Static { .. } => {
                        // Declared bindings are not deletable.
                        if put {
                            self.load_const(Value::Bool(false));
                        }
                        return Ok(());
                    }
                    Resolved::Mixed { .. } => {
                        self.emit(Instr::DeleteVar(name));
                    }
                    Resolved::Dynamic => {
                        if self.scopes[self.cur_scope].global {
                            self.emit(Instr::DeleteGlobal(name));
                        } else {
                            self.emit(Instr::DeleteVar(name));
                        }
                    }
                }
            }
            ExprKind::Member { obj, prop } => {
                self.compile_expr(obj, true)?;
                self.emit(if strict {
                    Instr::DeletePropStrict(prop.clone())
                } else {
                    Instr::DeleteProp(prop.clone())
                });
            }
            ExprKind::Index { obj, prop } => {
                self.compile_expr(obj, true)?;
                self.compile_expr(prop, true)?;
                self.emit(if strict {
                    Instr::DeleteElemStrict
                } else {
                    Instr::DeleteElem
                });
            }
            _ => {
                self.compile_expr(operand, false)?;
                if put {
                    self.load_const(Value::Bool(true));
                }
                return Ok(());
            }
        }
        if !put {
            self.emit(Instr::Pop);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn compile_call(
        &mut self,
        offset: u32,
        callee: &Expr,
        args: &[Expr],
        put: bool,
    ) -> Result<(), CompileError> {
        let n = args.len() as u32;
        let direct_eval = matches!(&callee.kind, ExprKind::Ident(name) if name.as_ascii() == Some("eval"));
        if direct_eval {
            // A syntactic eval call defeats static binding everywhere
            // around it, whether or not it is the real eval at runtime.
            self.mark_direct_eval();
        }
        match &callee.kind {
            ExprKind::Ident(name) => {
                let name = name.clone();
                self.compile_ident_callee(&name);
            }
            ExprKind::Member { obj, prop } => {
                self.compile_expr(obj, true)?;
                self.emit(Instr::GetPropCallee(prop.clone()));
            }
            ExprKind::Index { obj, prop } => {
                self.compile_expr(obj, true)?;
                self.compile_expr(prop, true)?;
                self.emit(Instr::GetElemCallee);
            }
            _ => {
                self.compile_expr(callee, true)?;
                self.emit(Instr::LoadUndef);
            }
        }
        for a in args {
            self.compile_expr(a, true)?;
        }
        self.mark_src(offset);
        if direct_eval {
            let strict = self.strict();
            self.emit(Instr::CallEval { nargs: n, strict });
        } else {
            self.emit(Instr::Call(n));
        }
        if !put {
            self.emit(Instr::Pop);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Constant folding
    // ------------------------------------------------------------------

    fn fold_constant(&mut self, e: &Expr) -> Option<Value> {
        let mut scratch = Compiler {
            programs: vec![Some(PrgBuilder {
                code: Vec::new(),
                values: Vec::new(),
                src_map: Vec::new(),
                func_name: None,
            })],
            cur_prg: 0,
            scopes: Vec::new(),
            cur_scope: 0,
            blocks: Vec::new(),
            file: Rc::clone(&self.file),
            realm: Rc::clone(&self.realm),
            save_result: false,
            in_function: false,
            folding: true,
        };
        scratch.push_fold_scope(self.strict());
        scratch.compile_expr(e, true).ok()?;
        scratch.emit(Instr::Halt);
        let prg = super::freeze(&mut scratch.programs, 0, &self.file);
        let mut vm = Vm::new(
            Rc::clone(&self.realm),
            prg,
            InterruptState::new(),
        );
        // A minimal frame: [callee, this].
        vm.stack.push(Value::Undefined);
        vm.stack.push(Value::Undefined);
        vm.sb = 1;
        match vm.run(0) {
            Ok(()) if vm.sp() == 3 => Some(vm.pop()),
            _ => None,
        }
    }
}

fn binop_instr(op: BinOp) -> Instr {
    match op {
        BinOp::Add => Instr::Add,
        BinOp::Sub => Instr::Sub,
        BinOp::Mul => Instr::Mul,
        BinOp::Div => Instr::Div,
        BinOp::Mod => Instr::Mod,
        BinOp::BitAnd => Instr::BitAnd,
        BinOp::BitOr => Instr::BitOr,
        BinOp::BitXor => Instr::BitXor,
        BinOp::Shl => Instr::Shl,
        BinOp::Sar => Instr::Sar,
        BinOp::Shr => Instr::Shr,
        BinOp::Lt => Instr::Lt,
        BinOp::Le => Instr::Le,
        BinOp::Gt => Instr::Gt,
        BinOp::Ge => Instr::Ge,
        BinOp::Eq => Instr::Eq,
        BinOp::Neq => Instr::Neq,
        BinOp::StrictEq => Instr::StrictEq,
        BinOp::StrictNeq => Instr::StrictNeq,
        BinOp::In => Instr::In,
        BinOp::InstanceOf => Instr::InstanceOf,
    }
}

/// Worth replacing with a single constant load: a pure operator tree over
/// literals (bare literals already compile to one instruction).
fn is_foldable(e: &Expr) -> bool {
    match &e.kind {
        ExprKind::Unary { op, operand, .. } => {
            matches!(
                op,
                UnaryOp::Minus | UnaryOp::Plus | UnaryOp::Not | UnaryOp::BitNot
            ) && is_const_operand(operand)
        }
        ExprKind::Binary { op, lhs, rhs } => {
            !matches!(op, BinOp::In | BinOp::InstanceOf)
                && is_const_operand(lhs)
                && is_const_operand(rhs)
        }
        ExprKind::Logical { lhs, rhs, .. } => is_const_operand(lhs) && is_const_operand(rhs),
        ExprKind::Cond { test, cons, alt } => {
            is_const_operand(test) && is_const_operand(cons) && is_const_operand(alt)
        }
        _ => false,
    }
}

fn is_const_operand(e: &Expr) -> bool {
    match &e.kind {
        ExprKind::Num(_) | ExprKind::Str(_) | ExprKind::Bool(_) | ExprKind::Null => true,
        _ => is_foldable(e),
    }
}
