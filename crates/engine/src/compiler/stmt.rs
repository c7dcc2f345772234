//! Statement lowering
//!
//! Loop-like constructs push a compile-time block frame recording their
//! kind, label, continue target and pending break/continue patch sites.
//! Break and continue walk the frame stack emitting the cleanup each
//! crossed construct needs: `PopTry` for protected regions, `LeaveWith`
//! for with bodies, enumerator pops (closing for..of iterators) and
//! `LeaveBlock` for lexical scopes.

use super::{BindKind, Block, BlockKind, Compiler};
use crate::ast::*;
use crate::errors::CompileError;
use crate::instr::Instr;
use skiff_core::JsString;

/// Declarations hoisted out of a statement list.
pub(crate) struct Hoisted<'a> {
    /// Every `var` in the list, including inside nested blocks and loop
    /// heads (but not nested functions).
    pub vars: Vec<JsString>,
    /// Function declarations at the top level of the list.
    pub funcs: Vec<&'a FuncLit>,
    /// `let`/`const` at the top level of the list.
    pub lets: Vec<(JsString, BindKind)>,
}

pub(crate) fn decl_name(lit: &FuncLit) -> JsString {
    lit.name.clone().unwrap_or_else(JsString::empty)
}

pub(crate) fn scan_declarations(stmts: &[Stmt]) -> Hoisted<'_> {
    let mut h = Hoisted {
        vars: Vec::new(),
        funcs: Vec::new(),
        lets: Vec::new(),
    };
    for s in stmts {
        match &s.kind {
            StmtKind::FuncDecl(lit) => h.funcs.push(lit),
            StmtKind::Decl(DeclKind::Let, decls) => {
                for d in decls {
                    h.lets.push((d.name.clone(), BindKind::Let));
                }
            }
            StmtKind::Decl(DeclKind::Const, decls) => {
                for d in decls {
                    h.lets.push((d.name.clone(), BindKind::Const));
                }
            }
            _ => {}
        }
        scan_vars(s, &mut h.vars);
    }
    h
}

/// Collect `var` names recursively, stopping at function boundaries.
fn scan_vars(s: &Stmt, vars: &mut Vec<JsString>) {
    match &s.kind {
        StmtKind::Decl(DeclKind::Var, decls) => {
            for d in decls {
                vars.push(d.name.clone());
            }
        }
        StmtKind::Block(stmts) => {
            for s in stmts {
                scan_vars(s, vars);
            }
        }
        StmtKind::If { cons, alt, .. } => {
            scan_vars(cons, vars);
            if let Some(alt) = alt {
                scan_vars(alt, vars);
            }
        }
        StmtKind::While { body, .. } | StmtKind::DoWhile { body, .. } => scan_vars(body, vars),
        StmtKind::For { init, body, .. } => {
            if let Some(ForInit::Decl(DeclKind::Var, decls)) = init {
                for d in decls {
                    vars.push(d.name.clone());
                }
            }
            scan_vars(body, vars);
        }
        StmtKind::ForIn { left, body, .. } => {
            if let ForTarget::Decl(DeclKind::Var, name) = left {
                vars.push(name.clone());
            }
            scan_vars(body, vars);
        }
        StmtKind::With { body, .. } | StmtKind::Labeled { body, .. } => scan_vars(body, vars),
        StmtKind::Switch { cases, .. } => {
            for case in cases {
                for s in &case.body {
                    scan_vars(s, vars);
                }
            }
        }
        StmtKind::Try {
            block,
            catch,
            finally,
        } => {
            for s in block {
                scan_vars(s, vars);
            }
            if let Some(c) = catch {
                for s in &c.body {
                    scan_vars(s, vars);
                }
            }
            if let Some(f) = finally {
                for s in f {
                    scan_vars(s, vars);
                }
            }
        }
        _ => {}
    }
}

impl Compiler {
    pub(crate) fn compile_stmt(&mut self, s: &Stmt) -> Result<(), CompileError> {
        self.compile_stmt_labeled(s, None)
    }

    fn compile_stmt_labeled(
        &mut self,
        s: &Stmt,
        label: Option<JsString>,
    ) -> Result<(), CompileError> {
        match &s.kind {
            StmtKind::Empty | StmtKind::Debugger => {}
            // Hoisted separately: top-level ones in the function preamble,
            // block-level ones at block entry.
            StmtKind::FuncDecl(_) => {}
            StmtKind::Expr(e) => {
                self.mark_src(s.offset);
                self.compile_expr(e, self.save_result)?;
                if self.save_result {
                    self.emit(Instr::SaveResult);
                }
            }
            StmtKind::Block(stmts) => self.compile_block(stmts, label, s.offset)?,
            StmtKind::Decl(kind, decls) => self.compile_decl(*kind, decls)?,
            StmtKind::If { test, cons, alt } => {
                self.mark_src(s.offset);
                self.compile_expr(test, true)?;
                let jf = self.emit(Instr::JumpIfFalse(0));
                self.compile_stmt(cons)?;
                match alt {
                    Some(alt) => {
                        let j_end = self.emit(Instr::Jump(0));
                        self.patch_jump(jf);
                        self.compile_stmt(alt)?;
                        self.patch_jump(j_end);
                    }
                    None => self.patch_jump(jf),
                }
            }
            StmtKind::While { test, body } => {
                let start = self.pc();
                self.mark_src(s.offset);
                self.compile_expr(test, true)?;
                let jf = self.emit(Instr::JumpIfFalse(0));
                self.blocks.push(Block {
                    kind: BlockKind::Loop,
                    label,
                    cont_target: Some(start),
                    breaks: Vec::new(),
                    conts: Vec::new(),
                    scope: None,
                });
                self.compile_stmt(body)?;
                self.emit_jump_back(start);
                self.patch_jump(jf);
                self.pop_loop_block();
            }
            StmtKind::DoWhile { body, test } => {
                let start = self.pc();
                self.blocks.push(Block {
                    kind: BlockKind::Loop,
                    label,
                    cont_target: None,
                    breaks: Vec::new(),
                    conts: Vec::new(),
                    scope: None,
                });
                self.compile_stmt(body)?;
                self.patch_conts();
                self.mark_src(s.offset);
                self.compile_expr(test, true)?;
                let jt = self.emit(Instr::JumpIfTrue(0));
                self.patch_jump_to(jt, start);
                self.pop_loop_block();
            }
            StmtKind::For {
                init,
                test,
                update,
                body,
            } => self.compile_for(s.offset, init, test, update, body, label)?,
            StmtKind::ForIn {
                left,
                right,
                body,
                of,
            } => self.compile_for_in(s.offset, left, right, body, *of, label)?,
            StmtKind::Continue(target) => self.compile_continue(s.offset, target.as_ref())?,
            StmtKind::Break(target) => self.compile_break(s.offset, target.as_ref())?,
            StmtKind::Return(arg) => {
                if !self.in_function {
                    return Err(self.err_at(s.offset, "Illegal return statement"));
                }
                self.mark_src(s.offset);
                match arg {
                    Some(e) => self.compile_expr(e, true)?,
                    None => {
                        self.emit(Instr::LoadUndef);
                    }
                }
                let mut has_try = false;
                for i in (0..self.blocks.len()).rev() {
                    match self.blocks[i].kind {
                        BlockKind::LoopEnum => {
                            self.emit(Instr::EnumPop);
                        }
                        BlockKind::LoopIter => {
                            self.emit(Instr::EnumPopClose);
                        }
                        BlockKind::Try => has_try = true,
                        _ => {}
                    }
                }
                self.emit(if has_try {
                    Instr::RetFinally
                } else {
                    Instr::Ret
                });
            }
            StmtKind::With { obj, body } => {
                self.mark_src(s.offset);
                self.compile_expr(obj, true)?;
                self.emit(Instr::EnterWith);
                let scope = self.enter_with_scope();
                self.blocks.push(Block {
                    kind: BlockKind::With,
                    label: None,
                    cont_target: None,
                    breaks: Vec::new(),
                    conts: Vec::new(),
                    scope: Some(scope),
                });
                self.compile_stmt(body)?;
                self.blocks.pop();
                self.emit(Instr::LeaveWith);
                self.leave_with_scope(scope);
            }
            StmtKind::Labeled { label: name, body } => {
                // Loops absorb their label directly; anything else gets a
                // labelled frame so `break name` has a target.
                match &body.kind {
                    StmtKind::While { .. }
                    | StmtKind::DoWhile { .. }
                    | StmtKind::For { .. }
                    | StmtKind::ForIn { .. }
                    | StmtKind::Block(_) => {
                        self.compile_stmt_labeled(body, Some(name.clone()))?
                    }
                    _ => {
                        self.blocks.push(Block {
                            kind: BlockKind::Labeled,
                            label: Some(name.clone()),
                            cont_target: None,
                            breaks: Vec::new(),
                            conts: Vec::new(),
                            scope: None,
                        });
                        self.compile_stmt(body)?;
                        let block = self.blocks.pop().expect("labelled block pushed");
                        for pc in block.breaks {
                            self.patch_jump(pc);
                        }
                    }
                }
            }
            StmtKind::Switch { disc, cases } => self.compile_switch(s.offset, disc, cases, label)?,
            StmtKind::Throw(e) => {
                self.mark_src(s.offset);
                self.compile_expr(e, true)?;
                self.emit(Instr::Throw);
            }
            StmtKind::Try {
                block,
                catch,
                finally,
            } => self.compile_try(s.offset, block, catch.as_ref(), finally.as_deref())?,
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Blocks and declarations
    // ------------------------------------------------------------------

    fn compile_block(
        &mut self,
        stmts: &[Stmt],
        label: Option<JsString>,
        offset: u32,
    ) -> Result<(), CompileError> {
        self.mark_src(offset);
        let scope = self.enter_block_scope(false);
        self.blocks.push(Block {
            kind: BlockKind::Scope,
            label,
            cont_target: None,
            breaks: Vec::new(),
            conts: Vec::new(),
            scope: Some(scope),
        });
        self.declare_block_lexicals(stmts)?;
        for s in stmts {
            self.compile_stmt(s)?;
        }
        self.leave_block_scope(scope);
        let block = self.blocks.pop().expect("scope block pushed");
        for pc in block.breaks {
            self.patch_jump(pc);
        }
        Ok(())
    }

    /// Bind this block's `let`/`const` and block-level function
    /// declarations, and initialize the functions.
    pub(crate) fn declare_block_lexicals(&mut self, stmts: &[Stmt]) -> Result<(), CompileError> {
        let mut funcs: Vec<&FuncLit> = Vec::new();
        for s in stmts {
            match &s.kind {
                StmtKind::Decl(DeclKind::Let, decls) => {
                    for d in decls {
                        self.declare(d.name.clone(), BindKind::Let, d.offset)?;
                    }
                }
                StmtKind::Decl(DeclKind::Const, decls) => {
                    for d in decls {
                        self.declare(d.name.clone(), BindKind::Const, d.offset)?;
                    }
                }
                StmtKind::FuncDecl(lit) => {
                    self.declare(decl_name(lit), BindKind::Let, lit.offset)?;
                    funcs.push(lit);
                }
                _ => {}
            }
        }
        for lit in funcs {
            self.compile_function(lit)?;
            self.emit_var_init(&decl_name(lit))?;
        }
        Ok(())
    }

    fn compile_decl(&mut self, kind: DeclKind, decls: &[Declarator]) -> Result<(), CompileError> {
        for d in decls {
            self.mark_src(d.offset);
            match kind {
                DeclKind::Var => {
                    if let Some(init) = &d.init {
                        self.compile_expr(init, true)?;
                        self.emit_var_init(&d.name)?;
                    }
                }
                DeclKind::Let | DeclKind::Const => {
                    match &d.init {
                        Some(init) => self.compile_expr(init, true)?,
                        None => {
                            self.emit(Instr::LoadUndef);
                        }
                    }
                    if self.scopes[self.cur_scope].global {
                        self.emit(Instr::InitGlobal(d.name.clone()));
                    } else {
                        self.emit_var_init(&d.name)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    fn compile_for(
        &mut self,
        offset: u32,
        init: &Option<ForInit>,
        test: &Option<Expr>,
        update: &Option<Expr>,
        body: &Stmt,
        label: Option<JsString>,
    ) -> Result<(), CompileError> {
        self.mark_src(offset);
        // A lexical loop head gets its own scope around the whole loop.
        let head_scope = match init {
            Some(ForInit::Decl(kind @ (DeclKind::Let | DeclKind::Const), decls)) => {
                let scope = self.enter_block_scope(false);
                self.blocks.push(Block {
                    kind: BlockKind::Scope,
                    label: None,
                    cont_target: None,
                    breaks: Vec::new(),
                    conts: Vec::new(),
                    scope: Some(scope),
                });
                let bk = if matches!(kind, DeclKind::Const) {
                    BindKind::Const
                } else {
                    BindKind::Let
                };
                for d in decls {
                    self.declare(d.name.clone(), bk, d.offset)?;
                }
                self.compile_decl(*kind, decls)?;
                Some(scope)
            }
            Some(ForInit::Decl(DeclKind::Var, decls)) => {
                self.compile_decl(DeclKind::Var, decls)?;
                None
            }
            Some(ForInit::Expr(e)) => {
                self.compile_expr(e, false)?;
                None
            }
            None => None,
        };
        let start = self.pc();
        let jf = match test {
            Some(test) => {
                self.compile_expr(test, true)?;
                Some(self.emit(Instr::JumpIfFalse(0)))
            }
            None => None,
        };
        self.blocks.push(Block {
            kind: BlockKind::Loop,
            label,
            cont_target: None,
            breaks: Vec::new(),
            conts: Vec::new(),
            scope: None,
        });
        self.compile_stmt(body)?;
        self.patch_conts();
        if let Some(update) = update {
            self.compile_expr(update, false)?;
        }
        self.emit_jump_back(start);
        if let Some(jf) = jf {
            self.patch_jump(jf);
        }
        self.pop_loop_block();
        if let Some(scope) = head_scope {
            self.leave_block_scope(scope);
            let block = self.blocks.pop().expect("loop head scope pushed");
            for pc in block.breaks {
                self.patch_jump(pc);
            }
        }
        Ok(())
    }

    fn compile_for_in(
        &mut self,
        offset: u32,
        left: &ForTarget,
        right: &Expr,
        body: &Stmt,
        of: bool,
        label: Option<JsString>,
    ) -> Result<(), CompileError> {
        self.mark_src(offset);
        // Lexical targets are scoped to the loop.
        let head_scope = match left {
            ForTarget::Decl(kind @ (DeclKind::Let | DeclKind::Const), name) => {
                let scope = self.enter_block_scope(false);
                self.blocks.push(Block {
                    kind: BlockKind::Scope,
                    label: None,
                    cont_target: None,
                    breaks: Vec::new(),
                    conts: Vec::new(),
                    scope: Some(scope),
                });
                let bk = if matches!(kind, DeclKind::Const) {
                    BindKind::Const
                } else {
                    BindKind::Let
                };
                self.declare(name.clone(), bk, offset)?;
                Some(scope)
            }
            _ => None,
        };
        self.compile_expr(right, true)?;
        self.emit(if of { Instr::Iterate } else { Instr::Enumerate });
        let start = self.pc();
        let next = self.emit(if of {
            Instr::IterNext(0)
        } else {
            Instr::EnumNext(0)
        });
        self.blocks.push(Block {
            kind: if of {
                BlockKind::LoopIter
            } else {
                BlockKind::LoopEnum
            },
            label,
            cont_target: Some(start),
            breaks: Vec::new(),
            conts: Vec::new(),
            scope: None,
        });
        // for..of: the value is already on the stack; for..in: push the
        // key at the store site so property targets can evaluate their
        // base first.
        match left {
            ForTarget::Decl(_, name) => {
                if !of {
                    self.emit(Instr::EnumGet);
                }
                self.emit_var_init(name)?;
            }
            ForTarget::Expr(target) => {
                if of {
                    self.compile_store_from_stack(target)?;
                } else {
                    match &target.kind {
                        ExprKind::Ident(_) => {
                            self.emit(Instr::EnumGet);
                            self.compile_store_from_stack(target)?;
                        }
                        ExprKind::Member { obj, prop } => {
                            self.compile_expr(obj, true)?;
                            self.emit(Instr::EnumGet);
                            self.emit(Instr::SetProp(prop.clone()));
                            self.emit(Instr::Pop);
                        }
                        ExprKind::Index { obj, prop } => {
                            self.compile_expr(obj, true)?;
                            self.compile_expr(prop, true)?;
                            self.emit(Instr::EnumGet);
                            self.emit(Instr::SetElem);
                            self.emit(Instr::Pop);
                        }
                        _ => {
                            return Err(
                                self.err_at(target.offset, "invalid for-in assignment target")
                            )
                        }
                    }
                }
            }
        }
        self.compile_stmt(body)?;
        self.emit_jump_back(start);
        self.patch_jump(next);
        if !of {
            self.emit(Instr::EnumPop);
        }
        self.pop_loop_block();
        if let Some(scope) = head_scope {
            self.leave_block_scope(scope);
            let block = self.blocks.pop().expect("loop head scope pushed");
            for pc in block.breaks {
                self.patch_jump(pc);
            }
        }
        Ok(())
    }

    /// Pop the innermost loop frame, patching its breaks to land here.
    fn pop_loop_block(&mut self) {
        let block = self.blocks.pop().expect("loop block pushed");
        for pc in block.breaks {
            self.patch_jump(pc);
        }
        debug_assert!(block.conts.is_empty(), "unpatched continue sites");
    }

    /// Patch forward continues of the innermost loop frame to land here.
    fn patch_conts(&mut self) {
        let conts = std::mem::take(
            &mut self
                .blocks
                .last_mut()
                .expect("loop block pushed")
                .conts,
        );
        for pc in conts {
            self.patch_jump(pc);
        }
    }

    fn emit_jump_back(&mut self, target: usize) {
        let at = self.emit(Instr::Jump(0));
        self.patch_jump_to(at, target);
    }

    pub(crate) fn patch_jump_to(&mut self, at: usize, target: usize) {
        let d = (target as i64 - at as i64) as i32;
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

    // ------------------------------------------------------------------
    // Break / continue
    // ------------------------------------------------------------------

    fn find_break_target(&self, label: Option<&JsString>) -> Option<usize> {
        for i in (0..self.blocks.len()).rev() {
            let b = &self.blocks[i];
            match label {
                Some(l) => {
                    if b.label.as_ref() == Some(l) {
                        return Some(i);
                    }
                }
                None => {
                    if matches!(
                        b.kind,
                        BlockKind::Loop
                            | BlockKind::LoopEnum
                            | BlockKind::LoopIter
                            | BlockKind::Switch
                    ) {
                        return Some(i);
                    }
                }
            }
        }
        None
    }

    fn compile_break(
        &mut self,
        offset: u32,
        label: Option<&JsString>,
    ) -> Result<(), CompileError> {
        let target = match self.find_break_target(label) {
            Some(t) => t,
            None => {
                return Err(self.err_at(
                    offset,
                    match label {
                        Some(l) => format!("Undefined label '{}'", l),
                        None => "Illegal break statement".to_string(),
                    },
                ))
            }
        };
        // Cleanup for every frame from the innermost out to (and
        // including) the target.
        for i in (target..self.blocks.len()).rev() {
            match self.blocks[i].kind {
                BlockKind::Try => {
                    self.emit(Instr::PopTry);
                }
                BlockKind::With => {
                    self.emit(Instr::LeaveWith);
                }
                BlockKind::LoopEnum => {
                    self.emit(Instr::EnumPop);
                }
                BlockKind::LoopIter => {
                    self.emit(Instr::EnumPopClose);
                }
                BlockKind::Scope => {
                    if let Some(scope) = self.blocks[i].scope {
                        self.emit_block_leave(scope);
                    }
                }
                _ => {}
            }
        }
        let at = self.emit(Instr::Jump(0));
        self.blocks[target].breaks.push(at);
        Ok(())
    }

    fn compile_continue(
        &mut self,
        offset: u32,
        label: Option<&JsString>,
    ) -> Result<(), CompileError> {
        let mut target = None;
        for i in (0..self.blocks.len()).rev() {
            let b = &self.blocks[i];
            let is_loop = matches!(
                b.kind,
                BlockKind::Loop | BlockKind::LoopEnum | BlockKind::LoopIter
            );
            if !is_loop {
                continue;
            }
            match label {
                Some(l) => {
                    if b.label.as_ref() == Some(l) {
                        target = Some(i);
                        break;
                    }
                }
                None => {
                    target = Some(i);
                    break;
                }
            }
        }
        let target = match target {
            Some(t) => t,
            None => {
                return Err(self.err_at(
                    offset,
                    match label {
                        Some(l) => format!("Undefined label '{}'", l),
                        None => "Illegal continue statement".to_string(),
                    },
                ))
            }
        };
        // Cleanup for crossed frames only; the target loop keeps running.
        for i in (target + 1..self.blocks.len()).rev() {
            match self.blocks[i].kind {
                BlockKind::Try => {
                    self.emit(Instr::PopTry);
                }
                BlockKind::With => {
                    self.emit(Instr::LeaveWith);
                }
                BlockKind::LoopEnum => {
                    self.emit(Instr::EnumPop);
                }
                BlockKind::LoopIter => {
                    self.emit(Instr::EnumPopClose);
                }
                BlockKind::Scope => {
                    if let Some(scope) = self.blocks[i].scope {
                        self.emit_block_leave(scope);
                    }
                }
                _ => {}
            }
        }
        match self.blocks[target].cont_target {
            Some(pc) => {
                let at = self.emit(Instr::Jump(0));
                self.patch_jump_to(at, pc);
            }
            None => {
                let at = self.emit(Instr::Jump(0));
                self.blocks[target].conts.push(at);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Switch
    // ------------------------------------------------------------------

    fn compile_switch(
        &mut self,
        offset: u32,
        disc: &Expr,
        cases: &[SwitchCase],
        label: Option<JsString>,
    ) -> Result<(), CompileError> {
        self.mark_src(offset);
        let scope = self.enter_block_scope(false);
        self.blocks.push(Block {
            kind: BlockKind::Scope,
            label: label.clone(),
            cont_target: None,
            breaks: Vec::new(),
            conts: Vec::new(),
            scope: Some(scope),
        });
        // Case-scoped lexical declarations share the switch block.
        let mut all: Vec<Stmt> = Vec::new();
        for c in cases {
            all.extend(c.body.iter().cloned());
        }
        self.declare_block_lexicals(&all)?;

        self.compile_expr(disc, true)?;
        self.blocks.push(Block {
            kind: BlockKind::Switch,
            label: None,
            cont_target: None,
            breaks: Vec::new(),
            conts: Vec::new(),
            scope: None,
        });
        // Dispatch: test each case in order, jumping to a trampoline that
        // pops the discriminant before entering the body run.
        let mut tests = Vec::new();
        for (i, case) in cases.iter().enumerate() {
            if let Some(test) = &case.test {
                self.mark_src(case.offset);
                self.emit(Instr::Dup);
                self.compile_expr(test, true)?;
                self.emit(Instr::StrictEq);
                let jt = self.emit(Instr::JumpIfTrue(0));
                tests.push((i, jt));
            }
        }
        let default_idx = cases.iter().position(|c| c.test.is_none());
        let j_no_match = self.emit(Instr::Jump(0));
        // Trampolines.
        let mut tramp_jumps: Vec<(usize, usize)> = Vec::new();
        for (i, jt) in tests {
            self.patch_jump(jt);
            self.emit(Instr::Pop);
            let j = self.emit(Instr::Jump(0));
            tramp_jumps.push((i, j));
        }
        self.patch_jump(j_no_match);
        self.emit(Instr::Pop);
        let j_default = self.emit(Instr::Jump(0));
        // Bodies, with fallthrough.
        let mut body_pcs = Vec::with_capacity(cases.len());
        for case in cases {
            body_pcs.push(self.pc());
            for s in &case.body {
                self.compile_stmt(s)?;
            }
        }
        for (i, j) in tramp_jumps {
            self.patch_jump_to(j, body_pcs[i]);
        }
        match default_idx {
            Some(i) => self.patch_jump_to(j_default, body_pcs[i]),
            None => self.patch_jump(j_default),
        }
        let switch_block = self.blocks.pop().expect("switch block pushed");
        for pc in switch_block.breaks {
            self.patch_jump(pc);
        }
        self.leave_block_scope(scope);
        let scope_block = self.blocks.pop().expect("switch scope pushed");
        for pc in scope_block.breaks {
            self.patch_jump(pc);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Try / catch / finally
    // ------------------------------------------------------------------

    fn compile_try(
        &mut self,
        offset: u32,
        block: &[Stmt],
        catch: Option<&CatchClause>,
        finally: Option<&[Stmt]>,
    ) -> Result<(), CompileError> {
        self.mark_src(offset);
        let try_pc = self.emit(Instr::Try {
            catch_ofs: 0,
            finally_ofs: 0,
        });
        self.blocks.push(Block {
            kind: BlockKind::Try,
            label: None,
            cont_target: None,
            breaks: Vec::new(),
            conts: Vec::new(),
            scope: None,
        });

        self.compile_block(block, None, offset)?;
        self.emit(Instr::PopTry);
        let j_end_try = self.emit(Instr::Jump(0));

        let mut j_end_catch = None;
        if let Some(clause) = catch {
            let catch_ofs = (self.pc() as i64 - try_pc as i64) as i32;
            self.patch_try(try_pc, Some(catch_ofs), None);
            self.mark_src(clause.offset);
            let scope = self.enter_block_scope(true);
            self.blocks.push(Block {
                kind: BlockKind::Scope,
                label: None,
                cont_target: None,
                breaks: Vec::new(),
                conts: Vec::new(),
                scope: Some(scope),
            });
            if self.strict()
                && matches!(clause.param.as_ascii(), Some("eval") | Some("arguments"))
            {
                return Err(self.err_at(
                    clause.offset,
                    format!("unexpected strict mode reserved binding '{}'", clause.param),
                ));
            }
            self.declare(clause.param.clone(), BindKind::Var, clause.offset)?;
            // The unwinder re-pushed the exception above the reserved
            // window; bind it to the parameter.
            self.emit_var_init(&clause.param)?;
            self.declare_block_lexicals(&clause.body)?;
            for s in &clause.body {
                self.compile_stmt(s)?;
            }
            self.leave_block_scope(scope);
            let b = self.blocks.pop().expect("catch scope pushed");
            for pc in b.breaks {
                self.patch_jump(pc);
            }
            self.emit(Instr::PopTry);
            j_end_catch = Some(self.emit(Instr::Jump(0)));
        }

        if let Some(stmts) = finally {
            let finally_ofs = (self.pc() as i64 - try_pc as i64) as i32;
            self.patch_try(try_pc, None, Some(finally_ofs));
            self.compile_block(stmts, None, offset)?;
            self.emit(Instr::LeaveFinally);
        }

        self.patch_jump(j_end_try);
        if let Some(j) = j_end_catch {
            self.patch_jump(j);
        }
        self.blocks.pop().expect("try block pushed");
        Ok(())
    }

    fn patch_try(&mut self, at: usize, catch: Option<i32>, finally: Option<i32>) {
        let prg = self.prg();
        if let Instr::Try {
            catch_ofs,
            finally_ofs,
        } = &mut prg.code[at]
        {
            if let Some(c) = catch {
                *catch_ofs = c;
            }
            if let Some(f) = finally {
                *finally_ofs = f;
            }
        }
    }
}
