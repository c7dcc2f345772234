//! Bytecode compiler
//!
//! Compilation is two-pass per function. While lowering, identifier
//! accesses are emitted as placeholder instructions (`LoadStash(0)` family)
//! and recorded as access points on their binding. When a function scope
//! closes, finalization decides each binding's storage (stack slot vs
//! stash slot), assigns indices, and rewrites every recorded access point
//! in place, packing the stash level into the operand. Accesses that cross
//! a function boundary force stash placement (closures capture only
//! through stashes); `with` and direct eval mark scopes dynamic, forcing
//! by-name instructions.
//!
//! Programs are built in an arena so that finalization of an outer scope
//! can still rewrite instructions inside already-compiled inner functions;
//! the arena is frozen into immutable `Program`s at the very end.

mod expr;
mod stmt;

use crate::ast::{FuncLit, ParsedProgram};
use crate::errors::{CompileError, CompileErrorKind};
use crate::instr::{
    pack, BindingAttr, BlockParams, EnterFuncParams, FuncRef, Instr, StashNames, MAX_STASH_LEVEL,
};
use crate::parser::Parser;
use crate::program::{Program, SrcMapEntry};
use crate::runtime::Realm;
use crate::value::Value;
use skiff_core::{JsString, SrcFile};
use std::collections::HashMap;
use std::rc::Rc;

/// Compile a top-level script.
pub fn compile_global(file: &Rc<SrcFile>, realm: &Rc<Realm>) -> Result<Rc<Program>, CompileError> {
    let parsed = Parser::parse_program(file, false)?;
    Compiler::compile(file, &parsed, Mode::Global, realm)
}

/// Compile the body of a direct `eval` call. `strict_caller` forces strict
/// mode from the calling context.
pub fn compile_eval(
    src: &str,
    strict_caller: bool,
    realm: &Rc<Realm>,
) -> Result<Rc<Program>, CompileError> {
    let file = SrcFile::new("<eval>", src);
    let parsed = Parser::parse_program(&file, strict_caller)?;
    Compiler::compile(&file, &parsed, Mode::Eval, realm)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Global,
    Eval,
}

pub(crate) struct PrgBuilder {
    pub code: Vec<Instr>,
    pub values: Vec<Value>,
    pub src_map: Vec<SrcMapEntry>,
    pub func_name: Option<JsString>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindKind {
    Var,
    Let,
    Const,
    Arg(u32),
    /// The self-binding of a named function expression.
    Callee,
}

impl BindKind {
    fn lexical(self) -> bool {
        matches!(self, BindKind::Let | BindKind::Const)
    }

    fn immutable(self) -> bool {
        matches!(self, BindKind::Const | BindKind::Callee)
    }

    pub(crate) fn attr(self) -> BindingAttr {
        match self {
            BindKind::Let => BindingAttr::LET,
            BindKind::Const => BindingAttr::CONST,
            BindKind::Callee => BindingAttr {
                lex: false,
                mutable: false,
                deletable: false,
            },
            _ => BindingAttr::VAR,
        }
    }
}

pub(crate) struct Binding {
    pub name: JsString,
    pub kind: BindKind,
    pub in_stash: bool,
    pub used: bool,
    pub deleted: bool,
    pub stack_idx: i32,
    pub stash_slot: u32,
    /// Access points: (referencing scope, pc in that scope's program).
    pub access: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnterKind {
    /// Function preamble (six reserved slots at pc 0).
    Func,
    Block,
    CatchBlock,
    /// `with` pushes its stash in the `EnterWith` instruction itself.
    With,
    /// Global top scope: no enter instruction.
    None,
}

pub(crate) struct CompScope {
    pub parent: Option<usize>,
    pub prg: u32,
    pub bindings: Vec<Binding>,
    pub names: HashMap<JsString, usize>,
    pub function: bool,
    pub is_arrow: bool,
    pub strict: bool,
    pub global: bool,
    pub eval: bool,
    /// Direct eval can introduce or inspect names here at runtime: every
    /// binding goes to the stash with a name map.
    pub dynamic: bool,
    pub with: bool,
    pub needs_stash: bool,
    pub args_in_stash: bool,
    pub args_needed: bool,
    pub this_needed: bool,
    pub num_args: u32,
    pub base_pc: usize,
    pub enter_kind: EnterKind,
    /// `LeaveBlock` sites to patch with the final sizes.
    pub leave_pcs: Vec<usize>,
    pub children: Vec<usize>,
    pub stash_size: u32,
    pub stack_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    Loop,
    LoopEnum,
    LoopIter,
    Switch,
    Scope,
    Try,
    With,
    Labeled,
}

/// Compile-time block stack entry for break/continue routing.
pub(crate) struct Block {
    pub kind: BlockKind,
    pub label: Option<JsString>,
    /// Continue target when already emitted (backward jumps); forward
    /// continues collect in `conts`.
    pub cont_target: Option<usize>,
    pub breaks: Vec<usize>,
    pub conts: Vec<usize>,
    /// The lexical scope a `Scope` block owns.
    pub scope: Option<usize>,
}

/// Identifier resolution outcome.
pub(crate) enum Resolved {
    /// Statically placed: slot access, rewritten at finalization.
    Static { scope: usize, idx: usize },
    /// Statically known binding behind dynamic frames: by-name walk with a
    /// packed fallback.
    Mixed { scope: usize, idx: usize },
    /// Not bound anywhere in the compiled unit: fully dynamic.
    Dynamic,
}

pub(crate) struct Compiler {
    pub programs: Vec<Option<PrgBuilder>>,
    pub cur_prg: u32,
    pub scopes: Vec<CompScope>,
    pub cur_scope: usize,
    pub blocks: Vec<Block>,
    pub file: Rc<SrcFile>,
    pub realm: Rc<Realm>,
    /// Expression statements store their value into the completion
    /// register (script and eval code only).
    pub save_result: bool,
    /// Inside a function body (`return` is legal, `new.target` resolves).
    pub in_function: bool,
    /// Compiling a constant-folding scratch program: no nested folding.
    pub folding: bool,
}

impl Compiler {
    fn compile(
        file: &Rc<SrcFile>,
        parsed: &ParsedProgram,
        mode: Mode,
        realm: &Rc<Realm>,
    ) -> Result<Rc<Program>, CompileError> {
        let mut c = Compiler {
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
            file: Rc::clone(file),
            realm: Rc::clone(realm),
            save_result: true,
            in_function: false,
            folding: false,
        };
        match mode {
            Mode::Global => c.compile_global_body(parsed)?,
            Mode::Eval => c.compile_eval_body(parsed)?,
        }
        Ok(freeze(&mut c.programs, 0, file))
    }

    fn compile_global_body(&mut self, parsed: &ParsedProgram) -> Result<(), CompileError> {
        self.push_scope(CompScope {
            parent: None,
            prg: 0,
            bindings: Vec::new(),
            names: HashMap::new(),
            function: false,
            is_arrow: false,
            strict: parsed.strict,
            global: true,
            eval: false,
            dynamic: true,
            with: false,
            needs_stash: false,
            args_in_stash: false,
            args_needed: false,
            this_needed: false,
            num_args: 0,
            base_pc: 0,
            enter_kind: EnterKind::None,
            leave_pcs: Vec::new(),
            children: Vec::new(),
            stash_size: 0,
            stack_size: 0,
        });
        let hoisted = stmt::scan_declarations(&parsed.body);
        let lets: Vec<(JsString, BindingAttr)> = hoisted
            .lets
            .iter()
            .map(|(name, kind)| (name.clone(), kind.attr()))
            .collect();
        self.emit(Instr::BindGlobal(Rc::new(crate::instr::GlobalBindings {
            vars: hoisted.vars.clone(),
            funcs: hoisted.funcs.iter().map(|f| stmt::decl_name(f)).collect(),
            lets,
        })));
        for lit in &hoisted.funcs {
            self.compile_function(lit)?;
            self.emit(Instr::StoreDynamic {
                name: stmt::decl_name(lit),
                strict: false,
            });
            self.emit(Instr::Pop);
        }
        for stmt in &parsed.body {
            self.compile_stmt(stmt)?;
        }
        self.emit(Instr::Halt);
        self.patch_jumps_sanity();
        Ok(())
    }

    fn compile_eval_body(&mut self, parsed: &ParsedProgram) -> Result<(), CompileError> {
        let strict = parsed.strict;
        self.push_scope(CompScope {
            parent: None,
            prg: 0,
            bindings: Vec::new(),
            names: HashMap::new(),
            // Strict eval keeps its vars local: it is its own variable
            // environment.
            function: strict,
            is_arrow: false,
            strict,
            global: false,
            eval: true,
            dynamic: true,
            with: false,
            needs_stash: false,
            args_in_stash: false,
            args_needed: false,
            this_needed: false,
            num_args: 0,
            base_pc: 0,
            enter_kind: EnterKind::Block,
            leave_pcs: Vec::new(),
            children: Vec::new(),
            stash_size: 0,
            stack_size: 0,
        });
        let base_pc = self.emit(Instr::EnterBlock(Rc::new(BlockParams {
            stash_size: 0,
            stack_size: 0,
            names: None,
        })));
        self.scopes[self.cur_scope].base_pc = base_pc;
        let hoisted = stmt::scan_declarations(&parsed.body);
        if strict {
            for name in &hoisted.vars {
                self.declare(name.clone(), BindKind::Var, 0)?;
            }
            for lit in &hoisted.funcs {
                self.declare(stmt::decl_name(lit), BindKind::Var, lit.offset)?;
            }
        } else if !hoisted.vars.is_empty() || !hoisted.funcs.is_empty() {
            let mut names = hoisted.vars.clone();
            names.extend(hoisted.funcs.iter().map(|f| stmt::decl_name(f)));
            self.emit(Instr::BindVars {
                names: Rc::new(names),
                deletable: true,
            });
        }
        for (name, kind) in &hoisted.lets {
            self.declare(name.clone(), *kind, 0)?;
        }
        for lit in &hoisted.funcs {
            self.compile_function(lit)?;
            if strict {
                self.emit_var_init(&stmt::decl_name(lit))?;
            } else {
                self.emit(Instr::StoreDynamic {
                    name: stmt::decl_name(lit),
                    strict: false,
                });
                self.emit(Instr::Pop);
            }
        }
        for stmt in &parsed.body {
            self.compile_stmt(stmt)?;
        }
        self.emit(Instr::LoadResult);
        self.emit(Instr::Ret);
        let top = self.cur_scope;
        self.finalize_block_scope(top)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Emission plumbing
    // ------------------------------------------------------------------

    pub(crate) fn prg(&mut self) -> &mut PrgBuilder {
        self.programs[self.cur_prg as usize]
            .as_mut()
            .expect("current program taken")
    }

    pub(crate) fn emit(&mut self, instr: Instr) -> usize {
        let prg = self.prg();
        prg.code.push(instr);
        prg.code.len() - 1
    }

    pub(crate) fn pc(&mut self) -> usize {
        self.prg().code.len()
    }

    /// Record the source offset for instructions emitted from here on.
    pub(crate) fn mark_src(&mut self, offset: u32) {
        let pc = self.pc() as u32;
        let prg = self.prg();
        if let Some(last) = prg.src_map.last_mut() {
            if last.pc == pc {
                last.offset = offset;
                return;
            }
            if last.offset == offset {
                return;
            }
        }
        prg.src_map.push(SrcMapEntry { pc, offset });
    }

    pub(crate) fn load_const(&mut self, v: Value) {
        let prg = self.prg();
        prg.values.push(v);
        let idx = (prg.values.len() - 1) as u32;
        self.emit(Instr::LoadVal(idx));
    }

    /// Patch a previously emitted jump-family instruction to land at the
    /// current pc.
    pub(crate) fn patch_jump(&mut self, at: usize) {
        let target = self.pc() as i64;
        let d = (target - at as i64) as i32;
        let prg = self.prg();
        match &mut prg.code[at] {
            Instr::Jump(ofs)
            | Instr::JumpIfFalse(ofs)
            | Instr::JumpIfTrue(ofs)
            | Instr::JumpIfTruePeek(ofs)
            | Instr::JumpIfFalsePeek(ofs)
            | Instr::EnumNext(ofs)
            | Instr::IterNext(ofs) => *ofs = d,
            other => debug_assert!(false, "patching non-jump {:?}", other),
        }
    }

    fn patch_jumps_sanity(&mut self) {
        debug_assert!(self.blocks.is_empty(), "unbalanced block stack");
    }

    pub(crate) fn err_at(&self, offset: u32, message: impl Into<String>) -> CompileError {
        CompileError {
            kind: CompileErrorKind::Syntax,
            message: message.into(),
            file: self.file.name().to_string(),
            offset: offset as usize,
            position: self.file.position(offset as usize),
        }
    }

    // ------------------------------------------------------------------
    // Scopes and bindings
    // ------------------------------------------------------------------

    fn push_scope(&mut self, scope: CompScope) -> usize {
        let id = self.scopes.len();
        if let Some(parent) = scope.parent {
            self.scopes[parent].children.push(id);
        }
        self.scopes.push(scope);
        self.cur_scope = id;
        id
    }

    pub(crate) fn strict(&self) -> bool {
        self.scopes[self.cur_scope].strict
    }

    /// Minimal scope for constant-folding scratch programs.
    pub(crate) fn push_fold_scope(&mut self, strict: bool) {
        self.push_scope(CompScope {
            parent: None,
            prg: 0,
            bindings: Vec::new(),
            names: HashMap::new(),
            function: false,
            is_arrow: false,
            strict,
            global: true,
            eval: false,
            dynamic: false,
            with: false,
            needs_stash: false,
            args_in_stash: false,
            args_needed: false,
            this_needed: false,
            num_args: 0,
            base_pc: 0,
            enter_kind: EnterKind::None,
            leave_pcs: Vec::new(),
            children: Vec::new(),
            stash_size: 0,
            stack_size: 0,
        });
    }

    /// Open a lexical block scope in the current program; the enter
    /// instruction is a placeholder patched at finalization.
    pub(crate) fn enter_block_scope(&mut self, catch: bool) -> usize {
        let parent = self.cur_scope;
        let strict = self.scopes[parent].strict;
        let dynamic = self.scopes[parent].dynamic && self.scopes[parent].eval;
        let id = self.push_scope(CompScope {
            parent: Some(parent),
            prg: self.cur_prg,
            bindings: Vec::new(),
            names: HashMap::new(),
            function: false,
            is_arrow: false,
            strict,
            global: false,
            eval: false,
            dynamic,
            with: false,
            needs_stash: false,
            args_in_stash: false,
            args_needed: false,
            this_needed: false,
            num_args: 0,
            base_pc: 0,
            enter_kind: if catch {
                EnterKind::CatchBlock
            } else {
                EnterKind::Block
            },
            leave_pcs: Vec::new(),
            children: Vec::new(),
            stash_size: 0,
            stack_size: 0,
        });
        let placeholder = Rc::new(BlockParams {
            stash_size: 0,
            stack_size: 0,
            names: None,
        });
        let base_pc = self.emit(if catch {
            Instr::EnterCatchBlock(placeholder)
        } else {
            Instr::EnterBlock(placeholder)
        });
        self.scopes[id].base_pc = base_pc;
        id
    }

    /// Emit the leave instruction for a block scope (sizes patched later)
    /// and return to the parent scope.
    pub(crate) fn leave_block_scope(&mut self, id: usize) {
        let pc = self.emit(Instr::LeaveBlock {
            stack_size: 0,
            pop_stash: false,
        });
        self.scopes[id].leave_pcs.push(pc);
        self.cur_scope = self.scopes[id].parent.expect("block scope has a parent");
    }

    /// Register an extra leave site (break/continue crossing the block).
    pub(crate) fn emit_block_leave(&mut self, id: usize) {
        let pc = self.emit(Instr::LeaveBlock {
            stack_size: 0,
            pop_stash: false,
        });
        self.scopes[id].leave_pcs.push(pc);
    }

    /// Open a `with` body scope; the stash is pushed by `EnterWith`.
    pub(crate) fn enter_with_scope(&mut self) -> usize {
        let parent = self.cur_scope;
        let strict = self.scopes[parent].strict;
        self.push_scope(CompScope {
            parent: Some(parent),
            prg: self.cur_prg,
            bindings: Vec::new(),
            names: HashMap::new(),
            function: false,
            is_arrow: false,
            strict,
            global: false,
            eval: false,
            dynamic: false,
            with: true,
            needs_stash: true,
            args_in_stash: false,
            args_needed: false,
            this_needed: false,
            num_args: 0,
            base_pc: 0,
            enter_kind: EnterKind::With,
            leave_pcs: Vec::new(),
            children: Vec::new(),
            stash_size: 0,
            stack_size: 0,
        })
    }

    pub(crate) fn leave_with_scope(&mut self, id: usize) {
        self.cur_scope = self.scopes[id].parent.expect("with scope has a parent");
    }

    /// Declare a binding in the current scope. Lexical redeclaration is a
    /// syntax error; `var` merges with an existing binding.
    pub(crate) fn declare(
        &mut self,
        name: JsString,
        kind: BindKind,
        offset: u32,
    ) -> Result<usize, CompileError> {
        if self.strict() && matches!(name.as_ascii(), Some("eval") | Some("arguments")) {
            if !matches!(kind, BindKind::Callee) {
                return Err(self.err_at(
                    offset,
                    format!("unexpected strict mode reserved binding '{}'", name),
                ));
            }
        }
        let scope = &mut self.scopes[self.cur_scope];
        if let Some(&idx) = scope.names.get(&name) {
            let existing = scope.bindings[idx].kind;
            let clash = kind.lexical()
                || existing.lexical()
                || (matches!(kind, BindKind::Arg(_)) && scope.strict);
            if clash && !matches!(kind, BindKind::Callee) {
                return Err(self.err_at(
                    offset,
                    format!("Identifier '{}' has already been declared", name),
                ));
            }
            if matches!(kind, BindKind::Arg(_)) {
                // Sloppy duplicate parameter: the later one wins the name.
                let new_idx = scope.bindings.len();
                scope.bindings.push(Binding {
                    name: name.clone(),
                    kind,
                    in_stash: false,
                    used: false,
                    deleted: false,
                    stack_idx: 0,
                    stash_slot: 0,
                    access: Vec::new(),
                });
                scope.names.insert(name, new_idx);
                return Ok(new_idx);
            }
            return Ok(idx);
        }
        let idx = scope.bindings.len();
        scope.bindings.push(Binding {
            name: name.clone(),
            kind,
            in_stash: false,
            used: false,
            deleted: false,
            stack_idx: 0,
            stash_slot: 0,
            access: Vec::new(),
        });
        scope.names.insert(name, idx);
        Ok(idx)
    }

    /// Resolve a name from the current scope, marking stash placement when
    /// the access crosses a function boundary and detecting dynamic frames
    /// in between.
    pub(crate) fn lookup(&mut self, name: &JsString) -> Resolved {
        let mut s = self.cur_scope;
        let mut crossed_func = false;
        let mut any_dynamic = false;
        loop {
            if let Some(&idx) = self.scopes[s].names.get(name) {
                let b = &mut self.scopes[s].bindings[idx];
                b.used = true;
                if crossed_func || any_dynamic {
                    b.in_stash = true;
                }
                return if any_dynamic {
                    Resolved::Mixed { scope: s, idx }
                } else {
                    Resolved::Static { scope: s, idx }
                };
            }
            let scope = &self.scopes[s];
            if scope.dynamic || scope.with {
                any_dynamic = true;
            }
            if scope.function {
                crossed_func = true;
            }
            match scope.parent {
                Some(p) => s = p,
                None => return Resolved::Dynamic,
            }
        }
    }

    /// Resolve `arguments`: auto-create the binding on the nearest
    /// enclosing non-arrow function when nothing shadows it.
    pub(crate) fn lookup_arguments(&mut self, name: &JsString) -> Resolved {
        match self.lookup(name) {
            Resolved::Dynamic => {}
            found => return found,
        }
        let mut s = Some(self.cur_scope);
        while let Some(id) = s {
            if self.scopes[id].function && !self.scopes[id].is_arrow && !self.scopes[id].eval {
                self.ensure_arguments(id);
                return self.lookup(name);
            }
            s = self.scopes[id].parent;
        }
        Resolved::Dynamic
    }

    pub(crate) fn ensure_arguments(&mut self, func_scope: usize) {
        if self.scopes[func_scope].args_needed {
            return;
        }
        self.scopes[func_scope].args_needed = true;
        let name = JsString::from("arguments");
        if !self.scopes[func_scope].names.contains_key(&name) {
            let idx = self.scopes[func_scope].bindings.len();
            self.scopes[func_scope].bindings.push(Binding {
                name: name.clone(),
                kind: BindKind::Var,
                in_stash: false,
                used: true,
                deleted: false,
                stack_idx: 0,
                stash_slot: 0,
                access: Vec::new(),
            });
            self.scopes[func_scope].names.insert(name, idx);
        }
    }

    /// Resolve `this` from inside an arrow: bind through the nearest
    /// non-arrow function's boxed-this stash slot.
    pub(crate) fn lookup_boxed_this(&mut self) -> Option<Resolved> {
        let mut s = Some(self.cur_scope);
        while let Some(id) = s {
            if self.scopes[id].function && !self.scopes[id].is_arrow {
                let name = JsString::from("this");
                if !self.scopes[id].names.contains_key(&name) {
                    let idx = self.scopes[id].bindings.len();
                    self.scopes[id].bindings.push(Binding {
                        name: name.clone(),
                        kind: BindKind::Var,
                        in_stash: true,
                        used: true,
                        deleted: false,
                        stack_idx: 0,
                        stash_slot: 0,
                        access: Vec::new(),
                    });
                    self.scopes[id].names.insert(name, idx);
                }
                self.scopes[id].this_needed = true;
                return Some(self.lookup(&JsString::from("this")));
            }
            s = self.scopes[id].parent;
        }
        None
    }

    /// A syntactically direct `eval` call defeats static binding in every
    /// enclosing scope.
    pub(crate) fn mark_direct_eval(&mut self) {
        tracing::debug!("direct eval: dynamizing enclosing scopes");
        let mut s = Some(self.cur_scope);
        let mut args_done = false;
        while let Some(id) = s {
            self.scopes[id].dynamic = true;
            if !args_done && self.scopes[id].function && !self.scopes[id].is_arrow
                && !self.scopes[id].eval
            {
                self.ensure_arguments(id);
                args_done = true;
            }
            s = self.scopes[id].parent;
        }
    }

    /// Record an access point for a binding and emit its placeholder.
    pub(crate) fn emit_binding_access(&mut self, scope: usize, idx: usize, placeholder: Instr) {
        let pc = self.emit(placeholder);
        self.scopes[scope].bindings[idx]
            .access
            .push((self.cur_scope, pc));
    }

    // ------------------------------------------------------------------
    // Function literals
    // ------------------------------------------------------------------

    /// Compile a function literal into a fresh program and emit the
    /// `NewFunc` instruction for it in the current program.
    pub(crate) fn compile_function(&mut self, lit: &FuncLit) -> Result<(), CompileError> {
        let name = lit
            .name
            .clone()
            .unwrap_or_else(JsString::empty);
        let child_prg = self.programs.len() as u32;
        self.programs.push(Some(PrgBuilder {
            code: Vec::new(),
            values: Vec::new(),
            src_map: Vec::new(),
            func_name: if name.is_empty() {
                None
            } else {
                Some(name.clone())
            },
        }));
        let saved_prg = self.cur_prg;
        let saved_scope = self.cur_scope;
        let saved_blocks = std::mem::take(&mut self.blocks);
        let saved_save_result = self.save_result;
        let saved_in_function = self.in_function;
        self.cur_prg = child_prg;
        self.save_result = false;
        self.in_function = true;

        let strict = self.scopes[saved_scope].strict || lit.strict_body;
        let fs = self.push_scope(CompScope {
            parent: Some(saved_scope),
            prg: child_prg,
            bindings: Vec::new(),
            names: HashMap::new(),
            function: true,
            is_arrow: lit.is_arrow,
            strict,
            global: false,
            eval: false,
            dynamic: false,
            with: false,
            needs_stash: false,
            args_in_stash: false,
            args_needed: false,
            this_needed: false,
            num_args: lit.params.len() as u32,
            base_pc: 0,
            enter_kind: EnterKind::Func,
            leave_pcs: Vec::new(),
            children: Vec::new(),
            stash_size: 0,
            stack_size: 0,
        });
        self.mark_src(lit.offset);

        // Reserved preamble: enter, box-this, create-arguments,
        // init-arguments, load-callee, init-callee.
        for _ in 0..6 {
            self.emit(Instr::Nop);
        }

        // Parameters.
        for (i, param) in lit.params.iter().enumerate() {
            if strict {
                if let Some(&prev) = self.scopes[fs].names.get(&param.name) {
                    if matches!(self.scopes[fs].bindings[prev].kind, BindKind::Arg(_)) {
                        return Err(self.err_at(
                            param.offset,
                            format!("Duplicate parameter name '{}' not allowed", param.name),
                        ));
                    }
                }
            }
            self.declare(param.name.clone(), BindKind::Arg(i as u32), param.offset)?;
        }

        // Hoisted declarations.
        let hoisted = stmt::scan_declarations(&lit.body);
        for v in &hoisted.vars {
            self.declare(v.clone(), BindKind::Var, lit.offset)?;
        }
        for f in &hoisted.funcs {
            self.declare(stmt::decl_name(f), BindKind::Var, f.offset)?;
        }
        for (l, kind) in &hoisted.lets {
            self.declare(l.clone(), *kind, lit.offset)?;
        }
        // The callee self-binding of a named function expression, unless
        // shadowed.
        if !lit.is_arrow {
            if let Some(fname) = &lit.name {
                if !self.scopes[fs].names.contains_key(fname) {
                    self.declare(fname.clone(), BindKind::Callee, lit.offset)?;
                }
            }
        }

        // Hoisted function initializations run before any body statement.
        for f in &hoisted.funcs {
            self.compile_function(f)?;
            self.emit_var_init(&stmt::decl_name(f))?;
        }
        for s in &lit.body {
            self.compile_stmt(s)?;
        }
        if !matches!(self.prg().code.last(), Some(Instr::Ret | Instr::RetFinally)) {
            self.emit(Instr::LoadUndef);
            self.emit(Instr::Ret);
        }

        self.finalize_function(fs)?;

        self.cur_prg = saved_prg;
        self.cur_scope = saved_scope;
        self.blocks = saved_blocks;
        self.save_result = saved_save_result;
        self.in_function = saved_in_function;
        self.emit(Instr::NewFunc {
            prg: FuncRef::Id(child_prg),
            name,
            length: lit.params.len() as u32,
            strict,
            arrow: lit.is_arrow,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------

    /// Close a function scope: delete the callee binding when unused,
    /// lay out storage for the scope subtree, rewrite all access points,
    /// and patch the preamble.
    fn finalize_function(&mut self, fs: usize) -> Result<(), CompileError> {
        // Unused named-function-expression self-binding: drop it and keep
        // the preamble slots blank.
        let mut callee_kept = None;
        let dynamic = self.scopes[fs].dynamic;
        for (i, b) in self.scopes[fs].bindings.iter_mut().enumerate() {
            if matches!(b.kind, BindKind::Callee) {
                if !b.used && !dynamic {
                    b.deleted = true;
                } else {
                    callee_kept = Some(i);
                }
            }
        }
        // Any escaping argument moves all of them into the stash so the
        // arguments object can alias slots positionally.
        let any_arg_stashed = self.scopes[fs]
            .bindings
            .iter()
            .any(|b| matches!(b.kind, BindKind::Arg(_)) && b.in_stash);
        if any_arg_stashed || self.scopes[fs].args_needed || self.scopes[fs].dynamic {
            self.scopes[fs].args_in_stash = true;
            for b in self.scopes[fs].bindings.iter_mut() {
                if matches!(b.kind, BindKind::Arg(_)) {
                    b.in_stash = true;
                }
            }
        }

        self.layout_scope(fs, 0);
        self.rewrite_scope(fs)?;
        self.patch_enters(fs);

        // Preamble.
        let scope = &self.scopes[fs];
        let base = scope.base_pc;
        let stash_size = scope.stash_size;
        let stack_size = scope.stack_size;
        let num_args = scope.num_args;
        let args_to_stash = scope.args_in_stash;
        let names = if scope.dynamic {
            Some(self.stash_names(fs))
        } else {
            None
        };
        let needs_stash = self.scopes[fs].needs_stash;
        let enter = if needs_stash {
            Instr::EnterFunc(Rc::new(EnterFuncParams {
                stash_size,
                stack_size,
                num_args,
                args_to_stash,
                names,
            }))
        } else {
            Instr::EnterFuncStashless {
                stack_size,
                num_args,
            }
        };
        let strict = self.scopes[fs].strict;
        let this_slot = self.scopes[fs]
            .names
            .get(&JsString::from("this"))
            .map(|&i| self.scopes[fs].bindings[i].stash_slot);
        let args_init = self.scopes[fs]
            .names
            .get(&JsString::from("arguments"))
            .filter(|_| self.scopes[fs].args_needed)
            .map(|&i| self.binding_init_instr(fs, i));
        let callee_init = callee_kept.map(|i| self.binding_init_instr(fs, i));

        let prg = self.programs[self.scopes[fs].prg as usize]
            .as_mut()
            .expect("function program taken");
        prg.code[base] = enter;
        if let Some(slot) = this_slot {
            if self.scopes[fs].this_needed {
                prg.code[base + 1] = Instr::BoxThis(slot);
            }
        }
        if let Some(init) = args_init {
            prg.code[base + 2] = if strict {
                Instr::CreateArgsStrict(num_args)
            } else {
                Instr::CreateArgs(num_args)
            };
            prg.code[base + 3] = init;
        }
        if let Some(init) = callee_init {
            prg.code[base + 4] = Instr::LoadCallee;
            prg.code[base + 5] = init;
        }
        Ok(())
    }

    /// Close the top-level eval block scope.
    fn finalize_block_scope(&mut self, id: usize) -> Result<(), CompileError> {
        self.layout_scope(id, 0);
        self.rewrite_scope(id)?;
        self.patch_enters(id);
        Ok(())
    }

    /// The direct init instruction for a binding whose layout is known.
    fn binding_init_instr(&self, scope: usize, idx: usize) -> Instr {
        let b = &self.scopes[scope].bindings[idx];
        if b.in_stash {
            Instr::InitStash(pack(0, b.stash_slot))
        } else {
            Instr::InitStack(b.stack_idx)
        }
    }

    /// Ordered `(name, attr)` list for a dynamic frame's name map.
    fn stash_names(&self, scope: usize) -> StashNames {
        let mut named: Vec<(u32, JsString, BindingAttr)> = self.scopes[scope]
            .bindings
            .iter()
            .filter(|b| !b.deleted && b.in_stash)
            .map(|b| (b.stash_slot, b.name.clone(), b.kind.attr()))
            .collect();
        named.sort_by_key(|(slot, _, _)| *slot);
        Rc::new(named.into_iter().map(|(_, n, a)| (n, a)).collect())
    }

    /// Assign storage for a scope and its same-function descendants.
    fn layout_scope(&mut self, id: usize, stack_base: u32) {
        let mut stash = 0u32;
        let mut locals = 0u32;
        {
            let dynamic = self.scopes[id].dynamic;
            let scope = &mut self.scopes[id];
            for b in scope.bindings.iter_mut() {
                if b.deleted {
                    continue;
                }
                if dynamic || b.in_stash {
                    b.in_stash = true;
                    b.stash_slot = stash;
                    stash += 1;
                } else {
                    match b.kind {
                        BindKind::Arg(i) => b.stack_idx = -((i + 1) as i32),
                        _ => {
                            locals += 1;
                            b.stack_idx = (stack_base + locals) as i32;
                        }
                    }
                }
            }
            scope.stash_size = stash;
            scope.stack_size = locals;
            scope.needs_stash = match scope.enter_kind {
                EnterKind::With => true,
                EnterKind::None => false,
                _ => stash > 0 || scope.dynamic,
            };
        }
        let children = self.scopes[id].children.clone();
        for child in children {
            if !self.scopes[child].function {
                self.layout_scope(child, stack_base + locals);
            }
        }
    }

    /// Rewrite every access point recorded against this scope subtree's
    /// bindings into its final form.
    fn rewrite_scope(&mut self, id: usize) -> Result<(), CompileError> {
        for b_idx in 0..self.scopes[id].bindings.len() {
            let (deleted, in_stash, slot, stack_idx, kind, name, access) = {
                let b = &self.scopes[id].bindings[b_idx];
                (
                    b.deleted,
                    b.in_stash,
                    b.stash_slot,
                    b.stack_idx,
                    b.kind,
                    b.name.clone(),
                    b.access.clone(),
                )
            };
            if deleted {
                continue;
            }
            let lex = kind.lexical();
            let immutable = kind.immutable();
            for (ref_scope, pc) in access {
                let packed = if in_stash {
                    let level = self.count_stash_levels(ref_scope, id)?;
                    pack(level, slot)
                } else {
                    0
                };
                let prg_id = self.scopes[ref_scope].prg as usize;
                let prg = self.programs[prg_id].as_mut().expect("program taken");
                let instr = &mut prg.code[pc];
                *instr = match (&*instr, in_stash) {
                    (Instr::LoadStash(_), true) => {
                        if lex {
                            Instr::LoadStashLex {
                                packed,
                                name: name.clone(),
                            }
                        } else {
                            Instr::LoadStash(packed)
                        }
                    }
                    (Instr::LoadStash(_), false) => {
                        if lex {
                            Instr::LoadStackLex {
                                idx: stack_idx,
                                name: name.clone(),
                            }
                        } else {
                            Instr::LoadStack(stack_idx)
                        }
                    }
                    (Instr::StoreStash(_), true) => {
                        if immutable {
                            Instr::StoreStashConst {
                                packed,
                                name: name.clone(),
                            }
                        } else if lex {
                            Instr::StoreStashLex {
                                packed,
                                name: name.clone(),
                            }
                        } else {
                            Instr::StoreStash(packed)
                        }
                    }
                    (Instr::StoreStash(_), false) => {
                        if immutable {
                            Instr::StoreStackConst {
                                idx: stack_idx,
                                name: name.clone(),
                            }
                        } else if lex {
                            Instr::StoreStackLex {
                                idx: stack_idx,
                                name: name.clone(),
                            }
                        } else {
                            Instr::StoreStack(stack_idx)
                        }
                    }
                    // Pop-stores are only emitted for plain vars.
                    (Instr::StoreStashP(_), true) => Instr::StoreStashP(packed),
                    (Instr::StoreStashP(_), false) => Instr::StoreStackP(stack_idx),
                    (Instr::InitStash(_), true) => Instr::InitStash(packed),
                    (Instr::InitStash(_), false) => Instr::InitStack(stack_idx),
                    (Instr::LoadMixed { name, lex, .. }, _) => Instr::LoadMixed {
                        name: name.clone(),
                        packed,
                        lex: *lex,
                    },
                    (Instr::LoadMixedCallee { name, lex, .. }, _) => Instr::LoadMixedCallee {
                        name: name.clone(),
                        packed,
                        lex: *lex,
                    },
                    (Instr::ResolveMixed { name, attr, .. }, _) => Instr::ResolveMixed {
                        name: name.clone(),
                        packed,
                        attr: *attr,
                    },
                    (other, _) => {
                        debug_assert!(false, "unexpected access placeholder {:?}", other);
                        other.clone()
                    }
                };
            }
        }
        let children = self.scopes[id].children.clone();
        for child in children {
            if !self.scopes[child].function {
                self.rewrite_scope(child)?;
            }
        }
        Ok(())
    }

    /// Patch block enter/leave instructions with the final sizes.
    fn patch_enters(&mut self, id: usize) {
        let scope = &self.scopes[id];
        let (base_pc, enter_kind, stash_size, stack_size, dynamic, needs_stash) = (
            scope.base_pc,
            scope.enter_kind,
            scope.stash_size,
            scope.stack_size,
            scope.dynamic,
            scope.needs_stash,
        );
        let leave_pcs = scope.leave_pcs.clone();
        let prg_id = scope.prg as usize;
        if matches!(enter_kind, EnterKind::Block | EnterKind::CatchBlock) {
            let names = if dynamic || stash_size > 0 && self.scope_visible_to_eval(id) {
                Some(self.stash_names(id))
            } else {
                None
            };
            let params = Rc::new(BlockParams {
                stash_size,
                stack_size,
                names,
            });
            let prg = self.programs[prg_id].as_mut().expect("program taken");
            prg.code[base_pc] = match enter_kind {
                EnterKind::CatchBlock => Instr::EnterCatchBlock(params),
                _ => Instr::EnterBlock(params),
            };
        }
        let prg = self.programs[prg_id].as_mut().expect("program taken");
        for pc in leave_pcs {
            prg.code[pc] = Instr::LeaveBlock {
                stack_size,
                pop_stash: needs_stash,
            };
        }
        let children = self.scopes[id].children.clone();
        for child in children {
            if !self.scopes[child].function {
                self.patch_enters(child);
            }
        }
    }

    /// A block whose enclosing function saw a direct eval keeps a name
    /// map, so eval code can inspect it.
    fn scope_visible_to_eval(&self, id: usize) -> bool {
        let mut s = Some(id);
        while let Some(i) = s {
            if self.scopes[i].dynamic {
                return true;
            }
            if self.scopes[i].function {
                return false;
            }
            s = self.scopes[i].parent;
        }
        false
    }

    /// Number of stash-creating frames between an access site and the
    /// owning scope.
    fn count_stash_levels(&self, from: usize, to: usize) -> Result<u32, CompileError> {
        let mut level = 0u32;
        let mut s = from;
        while s != to {
            if self.scopes[s].needs_stash {
                level += 1;
            }
            s = match self.scopes[s].parent {
                Some(p) => p,
                None => {
                    debug_assert!(false, "binding owner not on scope path");
                    break;
                }
            };
        }
        if level > MAX_STASH_LEVEL {
            return Err(self.err_at(0, "scope nesting level exceeds 255"));
        }
        Ok(level)
    }
}

/// Resolve nested program references and turn the builder arena into
/// immutable `Program`s.
pub(crate) fn freeze(
    builders: &mut Vec<Option<PrgBuilder>>,
    id: u32,
    file: &Rc<SrcFile>,
) -> Rc<Program> {
    let mut b = builders[id as usize].take().expect("program frozen twice");
    let mut code = std::mem::take(&mut b.code);
    for instr in code.iter_mut() {
        if let Instr::NewFunc { prg, .. } = instr {
            if let FuncRef::Id(child) = prg {
                let child = *child;
                *prg = FuncRef::Prg(freeze(builders, child, file));
            }
        }
    }
    Rc::new(Program {
        code,
        values: b.values,
        src_map: b.src_map,
        func_name: b.func_name,
        file: Rc::clone(file),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins;
    use crate::instr::unpack;

    fn compile(src: &str) -> Rc<Program> {
        let realm = builtins::create_realm();
        let file = SrcFile::new("t.js", src);
        compile_global(&file, &realm).expect("compile")
    }

    fn compile_err(src: &str) -> CompileError {
        let realm = builtins::create_realm();
        let file = SrcFile::new("t.js", src);
        compile_global(&file, &realm).expect_err("expected a compile error")
    }

    /// Nested programs referenced by `NewFunc`, in emission order.
    fn nested(prg: &Program) -> Vec<Rc<Program>> {
        prg.code
            .iter()
            .filter_map(|i| match i {
                Instr::NewFunc {
                    prg: FuncRef::Prg(p),
                    ..
                } => Some(Rc::clone(p)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn programs_end_with_halt() {
        let prg = compile("1 + 2;");
        assert!(matches!(prg.code.last(), Some(Instr::Halt)));
    }

    #[test]
    fn source_map_is_strictly_increasing() {
        let prg = compile("var a = 1;\nvar b = 2;\nfunction f() { return a + b; }\nf();");
        for w in prg.src_map.windows(2) {
            assert!(w[0].pc < w[1].pc, "src map regressed: {:?}", prg.src_map);
        }
    }

    #[test]
    fn constant_expressions_fold_to_one_load() {
        let prg = compile("2 + 3 * 4;");
        let loads = prg
            .code
            .iter()
            .filter(|i| matches!(i, Instr::LoadVal(_)))
            .count();
        assert_eq!(loads, 1);
        assert!(!prg.code.iter().any(|i| matches!(i, Instr::Add | Instr::Mul)));
        assert!(prg.values.iter().any(|v| v.strict_equals(&Value::Int(14))));
    }

    #[test]
    fn plain_functions_enter_stashless() {
        let prg = compile("function f(a) { var y = a + 1; return y; }");
        let f = &nested(&prg)[0];
        assert!(matches!(
            f.code[0],
            Instr::EnterFuncStashless { stack_size: 1, num_args: 1 }
        ));
        assert!(f.code.iter().any(|i| matches!(i, Instr::InitStack(1))));
        assert!(f.code.iter().any(|i| matches!(i, Instr::LoadStack(-1))));
    }

    #[test]
    fn captured_variables_move_to_the_stash() {
        let prg = compile("function outer() { var x = 1; return function () { return x; }; }");
        let outer = &nested(&prg)[0];
        assert!(matches!(outer.code[0], Instr::EnterFunc(_)));
        assert!(outer.code.iter().any(|i| matches!(i, Instr::InitStash(_))));
        let inner = &nested(outer)[0];
        let load = inner
            .code
            .iter()
            .find_map(|i| match i {
                Instr::LoadStash(p) => Some(*p),
                _ => None,
            })
            .expect("captured access compiles to a stash load");
        assert_eq!(unpack(load), (0, 0));
    }

    #[test]
    fn stash_levels_count_intervening_frames() {
        let prg = compile(
            "function a() { var x = 0;\n\
               return function b() { var y = 1;\n\
                 return function c() { return x + y; };\n\
               };\n\
             }",
        );
        let a = &nested(&prg)[0];
        let b = &nested(a)[0];
        let c = &nested(b)[0];
        let levels: Vec<(u32, u32)> = c
            .code
            .iter()
            .filter_map(|i| match i {
                Instr::LoadStash(p) => Some(unpack(*p)),
                _ => None,
            })
            .collect();
        // y lives in b's stash (level 0 from c), x in a's (level 1).
        assert!(levels.contains(&(0, 0)));
        assert!(levels.contains(&(1, 0)));
    }

    #[test]
    fn unused_callee_binding_is_suppressed() {
        let prg = compile("var f = function g() { return 1; };");
        let f = &nested(&prg)[0];
        assert!(!f.code.iter().any(|i| matches!(i, Instr::LoadCallee)));

        let prg = compile("var f = function g() { return g; };");
        let f = &nested(&prg)[0];
        assert!(f.code.iter().any(|i| matches!(i, Instr::LoadCallee)));
    }

    #[test]
    fn arguments_materialization_forces_args_into_the_stash() {
        let prg = compile("function f(a) { return arguments[0] + a; }");
        let f = &nested(&prg)[0];
        match &f.code[0] {
            Instr::EnterFunc(p) => {
                assert!(p.args_to_stash);
                assert_eq!(p.num_args, 1);
            }
            other => panic!("expected EnterFunc, got {:?}", other),
        }
        assert!(f.code.iter().any(|i| matches!(i, Instr::CreateArgs(1))));
    }

    #[test]
    fn direct_eval_dynamizes_the_function() {
        let prg = compile("function f() { var x = 1; eval('x'); return x; }");
        let f = &nested(&prg)[0];
        match &f.code[0] {
            Instr::EnterFunc(p) => assert!(p.names.is_some()),
            other => panic!("expected EnterFunc, got {:?}", other),
        }
        assert!(f
            .code
            .iter()
            .any(|i| matches!(i, Instr::CallEval { nargs: 1, .. })));
    }

    #[test]
    fn stash_nesting_above_255_is_rejected() {
        let depth = 258;
        let mut src = String::from("function f0() { var x0 = 0;\n");
        for i in 1..depth {
            src.push_str(&format!(
                "return function f{}() {{ var x{} = x{};\n",
                i,
                i,
                i - 1
            ));
        }
        src.push_str("return x0;\n");
        for _ in 0..depth {
            src.push_str("}\n");
        }
        let err = compile_err(&src);
        assert!(err.message.contains("255"), "message: {}", err.message);
    }

    #[test]
    fn strict_duplicate_parameters_are_rejected() {
        let err = compile_err("function f(a, a) { 'use strict'; }");
        assert!(err.message.contains("Duplicate parameter"));
    }

    #[test]
    fn lexical_redeclaration_is_rejected() {
        let err = compile_err("function f() { let a; var a; }");
        assert!(err.message.contains("already been declared"));
    }
}
