//! Recursive-descent parser for the 5.1 grammar
//!
//! Later-edition additions handled here: `let`/`const`, arrow functions,
//! `for..of`, `new.target`. Automatic semicolon insertion follows the
//! standard rules: a statement ends at a `}`, at end of input, or before a
//! token on a new line; `return`/`throw`/`break`/`continue` and postfix
//! `++`/`--` are newline-restricted.

use crate::ast::*;
use crate::errors::{CompileError, CompileErrorKind};
use crate::lexer::{Kw, Lexer, Punct, Tok, Token};
use skiff_core::{JsString, SrcFile};
use std::rc::Rc;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    file: Rc<SrcFile>,
    strict: bool,
}

impl Parser {
    /// Parse a whole program (or eval body). `strict` forces strict mode
    /// from the outside, as an eval call from strict code does.
    pub fn parse_program(file: &Rc<SrcFile>, strict: bool) -> Result<ParsedProgram, CompileError> {
        let tokens = Lexer::tokenize(file)?;
        let mut p = Parser {
            tokens,
            pos: 0,
            file: Rc::clone(file),
            strict,
        };
        let (body, strict) = p.parse_body(strict, |p| p.at_eof())?;
        if !p.at_eof() {
            return Err(p.unexpected());
        }
        Ok(ParsedProgram { body, strict })
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn cur(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_tok(&self, n: usize) -> &Tok {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[idx].tok
    }

    fn at_eof(&self) -> bool {
        matches!(self.cur().tok, Tok::Eof)
    }

    fn offset(&self) -> u32 {
        self.cur().offset
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn is_punct(&self, p: Punct) -> bool {
        matches!(self.cur().tok, Tok::Punct(q) if q == p)
    }

    fn eat_punct(&mut self, p: Punct) -> bool {
        if self.is_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: Punct, what: &str) -> Result<(), CompileError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.err_here(format!("expected {}", what)))
        }
    }

    fn is_kw(&self, kw: Kw) -> bool {
        matches!(self.cur().tok, Tok::Keyword(k) if k == kw)
    }

    fn eat_kw(&mut self, kw: Kw) -> bool {
        if self.is_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Contextual keyword check (`of`, `get`, `set`, `target`).
    fn is_ident_named(&self, name: &str) -> bool {
        matches!(&self.cur().tok, Tok::Ident(s) if s.as_ascii() == Some(name))
    }

    fn err_at(&self, offset: u32, message: impl Into<String>) -> CompileError {
        CompileError {
            kind: CompileErrorKind::Syntax,
            message: message.into(),
            file: self.file.name().to_string(),
            offset: offset as usize,
            position: self.file.position(offset as usize),
        }
    }

    fn err_here(&self, message: impl Into<String>) -> CompileError {
        self.err_at(self.offset(), message)
    }

    fn unexpected(&self) -> CompileError {
        let what = match &self.cur().tok {
            Tok::Eof => "unexpected end of input".to_string(),
            t => format!("unexpected token {:?}", t),
        };
        self.err_here(what)
    }

    fn expect_ident(&mut self) -> Result<(JsString, u32), CompileError> {
        let offset = self.offset();
        match self.advance().tok {
            Tok::Ident(name) => Ok((name, offset)),
            // `let` is only reserved in strict code.
            Tok::Keyword(Kw::Let) if !self.strict => Ok((JsString::from("let"), offset)),
            _ => Err(self.err_at(offset, "expected identifier")),
        }
    }

    /// Statement terminator with automatic semicolon insertion.
    fn expect_semi(&mut self) -> Result<(), CompileError> {
        if self.eat_punct(Punct::Semi) {
            return Ok(());
        }
        if self.is_punct(Punct::RBrace) || self.at_eof() || self.cur().newline_before {
            return Ok(());
        }
        Err(self.err_here("expected semicolon"))
    }

    // ------------------------------------------------------------------
    // Bodies and directive prologues
    // ------------------------------------------------------------------

    /// Parse a statement list, recognizing the directive prologue. Returns
    /// the statements and whether strict mode is in force for them.
    fn parse_body(
        &mut self,
        outer_strict: bool,
        done: impl Fn(&Parser) -> bool,
    ) -> Result<(Vec<Stmt>, bool), CompileError> {
        let saved_strict = self.strict;
        self.strict = outer_strict;
        let mut body = Vec::new();
        // Directive prologue: leading expression statements that are lone
        // string literals.
        while let Tok::Str { raw, .. } = &self.cur().tok {
            let raw = raw.clone();
            let stmt = self.parse_stmt()?;
            let is_lone_string = matches!(
                &stmt.kind,
                StmtKind::Expr(Expr {
                    kind: ExprKind::Str(_),
                    ..
                })
            );
            if is_lone_string && (raw == "\"use strict\"" || raw == "'use strict'") {
                self.strict = true;
            }
            body.push(stmt);
            if !is_lone_string {
                break;
            }
        }
        while !done(self) {
            body.push(self.parse_stmt()?);
        }
        let strict = self.strict;
        self.strict = saved_strict;
        Ok((body, strict))
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_stmt(&mut self) -> Result<Stmt, CompileError> {
        let offset = self.offset();
        let kind = match &self.cur().tok {
            Tok::Punct(Punct::LBrace) => StmtKind::Block(self.parse_block()?),
            Tok::Punct(Punct::Semi) => {
                self.advance();
                StmtKind::Empty
            }
            Tok::Keyword(Kw::Var) => self.parse_decl_stmt(DeclKind::Var)?,
            Tok::Keyword(Kw::Let) => self.parse_decl_stmt(DeclKind::Let)?,
            Tok::Keyword(Kw::Const) => self.parse_decl_stmt(DeclKind::Const)?,
            Tok::Keyword(Kw::Function) => {
                let lit = self.parse_function(false)?;
                if lit.name.is_none() {
                    return Err(self.err_at(offset, "function declaration requires a name"));
                }
                StmtKind::FuncDecl(Box::new(lit))
            }
            Tok::Keyword(Kw::If) => self.parse_if()?,
            Tok::Keyword(Kw::While) => {
                self.advance();
                self.expect_punct(Punct::LParen, "'('")?;
                let test = self.parse_expr(true)?;
                self.expect_punct(Punct::RParen, "')'")?;
                let body = Box::new(self.parse_stmt()?);
                StmtKind::While { test, body }
            }
            Tok::Keyword(Kw::Do) => {
                self.advance();
                let body = Box::new(self.parse_stmt()?);
                if !self.eat_kw(Kw::While) {
                    return Err(self.err_here("expected 'while'"));
                }
                self.expect_punct(Punct::LParen, "'('")?;
                let test = self.parse_expr(true)?;
                self.expect_punct(Punct::RParen, "')'")?;
                // The trailing semicolon of do..while is always optional.
                self.eat_punct(Punct::Semi);
                StmtKind::DoWhile { body, test }
            }
            Tok::Keyword(Kw::For) => self.parse_for()?,
            Tok::Keyword(Kw::Continue) => {
                self.advance();
                let label = self.parse_label_ref()?;
                self.expect_semi()?;
                StmtKind::Continue(label)
            }
            Tok::Keyword(Kw::Break) => {
                self.advance();
                let label = self.parse_label_ref()?;
                self.expect_semi()?;
                StmtKind::Break(label)
            }
            Tok::Keyword(Kw::Return) => {
                self.advance();
                let arg = if self.is_punct(Punct::Semi)
                    || self.is_punct(Punct::RBrace)
                    || self.at_eof()
                    || self.cur().newline_before
                {
                    None
                } else {
                    Some(self.parse_expr(true)?)
                };
                self.expect_semi()?;
                StmtKind::Return(arg)
            }
            Tok::Keyword(Kw::With) => {
                self.advance();
                if self.strict {
                    return Err(self.err_at(offset, "'with' is not allowed in strict mode"));
                }
                self.expect_punct(Punct::LParen, "'('")?;
                let obj = self.parse_expr(true)?;
                self.expect_punct(Punct::RParen, "')'")?;
                let body = Box::new(self.parse_stmt()?);
                StmtKind::With { obj, body }
            }
            Tok::Keyword(Kw::Switch) => self.parse_switch()?,
            Tok::Keyword(Kw::Throw) => {
                self.advance();
                if self.cur().newline_before {
                    return Err(self.err_at(offset, "illegal newline after 'throw'"));
                }
                let arg = self.parse_expr(true)?;
                self.expect_semi()?;
                StmtKind::Throw(arg)
            }
            Tok::Keyword(Kw::Try) => self.parse_try()?,
            Tok::Keyword(Kw::Debugger) => {
                self.advance();
                self.expect_semi()?;
                StmtKind::Debugger
            }
            Tok::Ident(_) if matches!(self.peek_tok(1), Tok::Punct(Punct::Colon)) => {
                let (label, _) = self.expect_ident()?;
                self.advance(); // colon
                let body = Box::new(self.parse_stmt()?);
                StmtKind::Labeled { label, body }
            }
            _ => {
                let expr = self.parse_expr(true)?;
                self.expect_semi()?;
                StmtKind::Expr(expr)
            }
        };
        Ok(Stmt { kind, offset })
    }

    fn parse_label_ref(&mut self) -> Result<Option<JsString>, CompileError> {
        if self.cur().newline_before
            || self.is_punct(Punct::Semi)
            || self.is_punct(Punct::RBrace)
            || self.at_eof()
        {
            return Ok(None);
        }
        let (name, _) = self.expect_ident()?;
        Ok(Some(name))
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        self.expect_punct(Punct::LBrace, "'{'")?;
        let mut body = Vec::new();
        while !self.is_punct(Punct::RBrace) {
            if self.at_eof() {
                return Err(self.err_here("unexpected end of input in block"));
            }
            body.push(self.parse_stmt()?);
        }
        self.advance();
        Ok(body)
    }

    fn parse_decl_stmt(&mut self, kind: DeclKind) -> Result<StmtKind, CompileError> {
        self.advance();
        let decls = self.parse_declarators(kind, true)?;
        self.expect_semi()?;
        Ok(StmtKind::Decl(kind, decls))
    }

    fn parse_declarators(
        &mut self,
        kind: DeclKind,
        allow_in: bool,
    ) -> Result<Vec<Declarator>, CompileError> {
        let mut decls = Vec::new();
        loop {
            let (name, offset) = self.expect_ident()?;
            let init = if self.eat_punct(Punct::Assign) {
                Some(self.parse_assign(allow_in)?)
            } else {
                if kind == DeclKind::Const {
                    return Err(self.err_at(offset, "missing initializer in const declaration"));
                }
                None
            };
            decls.push(Declarator { name, init, offset });
            if !self.eat_punct(Punct::Comma) {
                return Ok(decls);
            }
        }
    }

    fn parse_if(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        self.expect_punct(Punct::LParen, "'('")?;
        let test = self.parse_expr(true)?;
        self.expect_punct(Punct::RParen, "')'")?;
        let cons = Box::new(self.parse_stmt()?);
        let alt = if self.eat_kw(Kw::Else) {
            Some(Box::new(self.parse_stmt()?))
        } else {
            None
        };
        Ok(StmtKind::If { test, cons, alt })
    }

    fn parse_for(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        self.expect_punct(Punct::LParen, "'('")?;

        if self.eat_punct(Punct::Semi) {
            return self.parse_for_tail(None);
        }

        let decl_kind = match self.cur().tok {
            Tok::Keyword(Kw::Var) => Some(DeclKind::Var),
            Tok::Keyword(Kw::Let) => Some(DeclKind::Let),
            Tok::Keyword(Kw::Const) => Some(DeclKind::Const),
            _ => None,
        };

        if let Some(kind) = decl_kind {
            self.advance();
            let (name, name_offset) = self.expect_ident()?;
            // for (var x in obj) / for (let x of obj)
            if self.is_kw(Kw::In) || self.is_ident_named("of") {
                let of = !self.is_kw(Kw::In);
                self.advance();
                let right = self.parse_expr(true)?;
                self.expect_punct(Punct::RParen, "')'")?;
                let body = Box::new(self.parse_stmt()?);
                return Ok(StmtKind::ForIn {
                    left: ForTarget::Decl(kind, name),
                    right,
                    body,
                    of,
                });
            }
            // Ordinary header: finish this declarator, then the rest.
            let init = if self.eat_punct(Punct::Assign) {
                Some(self.parse_assign(false)?)
            } else {
                if kind == DeclKind::Const {
                    return Err(
                        self.err_at(name_offset, "missing initializer in const declaration")
                    );
                }
                None
            };
            let mut decls = vec![Declarator {
                name,
                init,
                offset: name_offset,
            }];
            if self.eat_punct(Punct::Comma) {
                decls.extend(self.parse_declarators(kind, false)?);
            }
            self.expect_punct(Punct::Semi, "';'")?;
            return self.parse_for_tail(Some(ForInit::Decl(kind, decls)));
        }

        let init_offset = self.offset();
        let init = self.parse_expr(false)?;
        if self.is_kw(Kw::In) || self.is_ident_named("of") {
            let of = !self.is_kw(Kw::In);
            self.advance();
            if !is_assign_target(&init) {
                return Err(self.err_at(init_offset, "invalid left-hand side in for-in loop"));
            }
            let right = self.parse_expr(true)?;
            self.expect_punct(Punct::RParen, "')'")?;
            let body = Box::new(self.parse_stmt()?);
            return Ok(StmtKind::ForIn {
                left: ForTarget::Expr(init),
                right,
                body,
                of,
            });
        }
        self.expect_punct(Punct::Semi, "';'")?;
        self.parse_for_tail(Some(ForInit::Expr(init)))
    }

    fn parse_for_tail(&mut self, init: Option<ForInit>) -> Result<StmtKind, CompileError> {
        let test = if self.is_punct(Punct::Semi) {
            None
        } else {
            Some(self.parse_expr(true)?)
        };
        self.expect_punct(Punct::Semi, "';'")?;
        let update = if self.is_punct(Punct::RParen) {
            None
        } else {
            Some(self.parse_expr(true)?)
        };
        self.expect_punct(Punct::RParen, "')'")?;
        let body = Box::new(self.parse_stmt()?);
        Ok(StmtKind::For {
            init,
            test,
            update,
            body,
        })
    }

    fn parse_switch(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        self.expect_punct(Punct::LParen, "'('")?;
        let disc = self.parse_expr(true)?;
        self.expect_punct(Punct::RParen, "')'")?;
        self.expect_punct(Punct::LBrace, "'{'")?;
        let mut cases = Vec::new();
        let mut seen_default = false;
        while !self.eat_punct(Punct::RBrace) {
            let offset = self.offset();
            let test = if self.eat_kw(Kw::Case) {
                let e = self.parse_expr(true)?;
                Some(e)
            } else if self.eat_kw(Kw::Default) {
                if seen_default {
                    return Err(self.err_at(offset, "more than one default clause in switch"));
                }
                seen_default = true;
                None
            } else {
                return Err(self.unexpected());
            };
            self.expect_punct(Punct::Colon, "':'")?;
            let mut body = Vec::new();
            while !self.is_punct(Punct::RBrace)
                && !self.is_kw(Kw::Case)
                && !self.is_kw(Kw::Default)
            {
                if self.at_eof() {
                    return Err(self.err_here("unexpected end of input in switch"));
                }
                body.push(self.parse_stmt()?);
            }
            cases.push(SwitchCase { test, body, offset });
        }
        Ok(StmtKind::Switch { disc, cases })
    }

    fn parse_try(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        let block = self.parse_block()?;
        let catch = if self.is_kw(Kw::Catch) {
            let offset = self.offset();
            self.advance();
            self.expect_punct(Punct::LParen, "'('")?;
            let (param, _) = self.expect_ident()?;
            self.expect_punct(Punct::RParen, "')'")?;
            let body = self.parse_block()?;
            Some(CatchClause {
                param,
                body,
                offset,
            })
        } else {
            None
        };
        let finally = if self.eat_kw(Kw::Finally) {
            Some(self.parse_block()?)
        } else {
            None
        };
        if catch.is_none() && finally.is_none() {
            return Err(self.err_here("missing catch or finally after try"));
        }
        Ok(StmtKind::Try {
            block,
            catch,
            finally,
        })
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    /// Parse `function [name] (params) { body }`. The `function` keyword is
    /// current. `expr_pos` allows the name to be omitted.
    fn parse_function(&mut self, expr_pos: bool) -> Result<FuncLit, CompileError> {
        let offset = self.offset();
        self.advance(); // function
        let name = if matches!(self.cur().tok, Tok::Ident(_)) {
            Some(self.expect_ident()?.0)
        } else {
            if !expr_pos && !self.is_punct(Punct::LParen) {
                return Err(self.err_here("expected function name"));
            }
            None
        };
        let params = self.parse_params()?;
        let (body, strict_body) = self.parse_function_body()?;
        Ok(FuncLit {
            name,
            params,
            body,
            is_arrow: false,
            strict_body,
            offset,
        })
    }

    fn parse_params(&mut self) -> Result<Vec<Param>, CompileError> {
        self.expect_punct(Punct::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.is_punct(Punct::RParen) {
            loop {
                let (name, offset) = self.expect_ident()?;
                params.push(Param { name, offset });
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
        }
        self.expect_punct(Punct::RParen, "')'")?;
        Ok(params)
    }

    fn parse_function_body(&mut self) -> Result<(Vec<Stmt>, bool), CompileError> {
        self.expect_punct(Punct::LBrace, "'{'")?;
        let outer = self.strict;
        let (body, strict) = self.parse_body(outer, |p| p.is_punct(Punct::RBrace))?;
        self.expect_punct(Punct::RBrace, "'}'")?;
        Ok((body, strict))
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expr(&mut self, allow_in: bool) -> Result<Expr, CompileError> {
        let offset = self.offset();
        let first = self.parse_assign(allow_in)?;
        if !self.is_punct(Punct::Comma) {
            return Ok(first);
        }
        let mut seq = vec![first];
        while self.eat_punct(Punct::Comma) {
            seq.push(self.parse_assign(allow_in)?);
        }
        Ok(Expr {
            kind: ExprKind::Seq(seq),
            offset,
        })
    }

    fn parse_assign(&mut self, allow_in: bool) -> Result<Expr, CompileError> {
        if let Some(expr) = self.try_parse_arrow()? {
            return Ok(expr);
        }
        let offset = self.offset();
        let lhs = self.parse_cond(allow_in)?;
        let op = match self.cur().tok {
            Tok::Punct(Punct::Assign) => None,
            Tok::Punct(Punct::PlusAssign) => Some(BinOp::Add),
            Tok::Punct(Punct::MinusAssign) => Some(BinOp::Sub),
            Tok::Punct(Punct::StarAssign) => Some(BinOp::Mul),
            Tok::Punct(Punct::SlashAssign) => Some(BinOp::Div),
            Tok::Punct(Punct::PercentAssign) => Some(BinOp::Mod),
            Tok::Punct(Punct::ShlAssign) => Some(BinOp::Shl),
            Tok::Punct(Punct::SarAssign) => Some(BinOp::Sar),
            Tok::Punct(Punct::ShrAssign) => Some(BinOp::Shr),
            Tok::Punct(Punct::AndAssign) => Some(BinOp::BitAnd),
            Tok::Punct(Punct::OrAssign) => Some(BinOp::BitOr),
            Tok::Punct(Punct::XorAssign) => Some(BinOp::BitXor),
            _ => return Ok(lhs),
        };
        if !is_assign_target(&lhs) {
            return Err(self.err_at(offset, "invalid left-hand side in assignment"));
        }
        self.advance();
        let value = self.parse_assign(allow_in)?;
        Ok(Expr {
            kind: ExprKind::Assign {
                op,
                target: Box::new(lhs),
                value: Box::new(value),
            },
            offset,
        })
    }

    /// Detect `ident => …` and `(a, b) => …` without committing the main
    /// cursor.
    fn try_parse_arrow(&mut self) -> Result<Option<Expr>, CompileError> {
        let is_arrow = match &self.cur().tok {
            Tok::Ident(_) => {
                matches!(self.peek_tok(1), Tok::Punct(Punct::Arrow))
                    && !self.tokens[self.pos + 1].newline_before
            }
            Tok::Punct(Punct::LParen) => {
                let mut depth = 0usize;
                let mut i = self.pos;
                loop {
                    match &self.tokens[i].tok {
                        Tok::Punct(Punct::LParen) => depth += 1,
                        Tok::Punct(Punct::RParen) => {
                            depth -= 1;
                            if depth == 0 {
                                break matches!(
                                    self.tokens.get(i + 1).map(|t| &t.tok),
                                    Some(Tok::Punct(Punct::Arrow))
                                ) && !self.tokens[i + 1].newline_before;
                            }
                        }
                        Tok::Eof => break false,
                        _ => {}
                    }
                    i += 1;
                }
            }
            _ => false,
        };
        if !is_arrow {
            return Ok(None);
        }
        let offset = self.offset();
        let params = if matches!(self.cur().tok, Tok::Ident(_)) {
            let (name, p_offset) = self.expect_ident()?;
            vec![Param {
                name,
                offset: p_offset,
            }]
        } else {
            self.parse_params()?
        };
        self.expect_punct(Punct::Arrow, "'=>'")?;
        let (body, strict_body) = if self.is_punct(Punct::LBrace) {
            self.parse_function_body()?
        } else {
            // Expression body desugars to a single return statement.
            let body_offset = self.offset();
            let expr = self.parse_assign(true)?;
            (
                vec![Stmt {
                    kind: StmtKind::Return(Some(expr)),
                    offset: body_offset,
                }],
                self.strict,
            )
        };
        Ok(Some(Expr {
            kind: ExprKind::Function(Box::new(FuncLit {
                name: None,
                params,
                body,
                is_arrow: true,
                strict_body,
                offset,
            })),
            offset,
        }))
    }

    fn parse_cond(&mut self, allow_in: bool) -> Result<Expr, CompileError> {
        let offset = self.offset();
        let test = self.parse_binary(1, allow_in)?;
        if !self.eat_punct(Punct::Question) {
            return Ok(test);
        }
        let cons = self.parse_assign(true)?;
        self.expect_punct(Punct::Colon, "':'")?;
        let alt = self.parse_assign(allow_in)?;
        Ok(Expr {
            kind: ExprKind::Cond {
                test: Box::new(test),
                cons: Box::new(cons),
                alt: Box::new(alt),
            },
            offset,
        })
    }

    fn binary_prec(&self, allow_in: bool) -> Option<(u8, Option<BinOp>)> {
        let p = match self.cur().tok {
            Tok::Punct(Punct::OrOr) => (1, None),
            Tok::Punct(Punct::AndAnd) => (2, None),
            Tok::Punct(Punct::BitOr) => (3, Some(BinOp::BitOr)),
            Tok::Punct(Punct::BitXor) => (4, Some(BinOp::BitXor)),
            Tok::Punct(Punct::BitAnd) => (5, Some(BinOp::BitAnd)),
            Tok::Punct(Punct::Eq) => (6, Some(BinOp::Eq)),
            Tok::Punct(Punct::Neq) => (6, Some(BinOp::Neq)),
            Tok::Punct(Punct::StrictEq) => (6, Some(BinOp::StrictEq)),
            Tok::Punct(Punct::StrictNeq) => (6, Some(BinOp::StrictNeq)),
            Tok::Punct(Punct::Lt) => (7, Some(BinOp::Lt)),
            Tok::Punct(Punct::Gt) => (7, Some(BinOp::Gt)),
            Tok::Punct(Punct::Le) => (7, Some(BinOp::Le)),
            Tok::Punct(Punct::Ge) => (7, Some(BinOp::Ge)),
            Tok::Keyword(Kw::InstanceOf) => (7, Some(BinOp::InstanceOf)),
            Tok::Keyword(Kw::In) if allow_in => (7, Some(BinOp::In)),
            Tok::Punct(Punct::Shl) => (8, Some(BinOp::Shl)),
            Tok::Punct(Punct::Sar) => (8, Some(BinOp::Sar)),
            Tok::Punct(Punct::Shr) => (8, Some(BinOp::Shr)),
            Tok::Punct(Punct::Plus) => (9, Some(BinOp::Add)),
            Tok::Punct(Punct::Minus) => (9, Some(BinOp::Sub)),
            Tok::Punct(Punct::Star) => (10, Some(BinOp::Mul)),
            Tok::Punct(Punct::Slash) => (10, Some(BinOp::Div)),
            Tok::Punct(Punct::Percent) => (10, Some(BinOp::Mod)),
            _ => return None,
        };
        Some(p)
    }

    fn parse_binary(&mut self, min_prec: u8, allow_in: bool) -> Result<Expr, CompileError> {
        let offset = self.offset();
        let mut lhs = self.parse_unary(allow_in)?;
        while let Some((prec, op)) = self.binary_prec(allow_in) {
            if prec < min_prec {
                break;
            }
            let and = matches!(self.cur().tok, Tok::Punct(Punct::AndAnd));
            self.advance();
            let rhs = self.parse_binary(prec + 1, allow_in)?;
            lhs = Expr {
                kind: match op {
                    Some(op) => ExprKind::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    None => ExprKind::Logical {
                        and,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                },
                offset,
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self, allow_in: bool) -> Result<Expr, CompileError> {
        let offset = self.offset();
        let op = match self.cur().tok {
            Tok::Punct(Punct::Minus) => Some(UnaryOp::Minus),
            Tok::Punct(Punct::Plus) => Some(UnaryOp::Plus),
            Tok::Punct(Punct::Not) => Some(UnaryOp::Not),
            Tok::Punct(Punct::BitNot) => Some(UnaryOp::BitNot),
            Tok::Keyword(Kw::TypeOf) => Some(UnaryOp::TypeOf),
            Tok::Keyword(Kw::Void) => Some(UnaryOp::Void),
            Tok::Keyword(Kw::Delete) => Some(UnaryOp::Delete),
            Tok::Punct(Punct::Inc) => Some(UnaryOp::Inc),
            Tok::Punct(Punct::Dec) => Some(UnaryOp::Dec),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary(allow_in)?;
            if matches!(op, UnaryOp::Inc | UnaryOp::Dec) && !is_assign_target(&operand) {
                return Err(self.err_at(offset, "invalid left-hand side in prefix operation"));
            }
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op,
                    prefix: true,
                    operand: Box::new(operand),
                },
                offset,
            });
        }
        let expr = self.parse_lhs(true)?;
        // Postfix ++/-- binds only without an intervening newline.
        if !self.cur().newline_before
            && (self.is_punct(Punct::Inc) || self.is_punct(Punct::Dec))
        {
            let op = if self.is_punct(Punct::Inc) {
                UnaryOp::Inc
            } else {
                UnaryOp::Dec
            };
            if !is_assign_target(&expr) {
                return Err(self.err_here("invalid left-hand side in postfix operation"));
            }
            self.advance();
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op,
                    prefix: false,
                    operand: Box::new(expr),
                },
                offset,
            });
        }
        Ok(expr)
    }

    /// Left-hand-side expression: member chains, calls, `new`.
    fn parse_lhs(&mut self, allow_call: bool) -> Result<Expr, CompileError> {
        let offset = self.offset();
        let mut expr = if self.is_kw(Kw::New) {
            self.advance();
            if self.eat_punct(Punct::Dot) {
                if !self.is_ident_named("target") {
                    return Err(self.err_here("expected 'target' after 'new.'"));
                }
                self.advance();
                Expr {
                    kind: ExprKind::NewTarget,
                    offset,
                }
            } else {
                let callee = self.parse_lhs(false)?;
                let args = if self.is_punct(Punct::LParen) {
                    self.parse_args()?
                } else {
                    Vec::new()
                };
                Expr {
                    kind: ExprKind::New {
                        callee: Box::new(callee),
                        args,
                    },
                    offset,
                }
            }
        } else {
            self.parse_primary()?
        };
        loop {
            if self.eat_punct(Punct::Dot) {
                let prop = self.parse_property_name_after_dot()?;
                expr = Expr {
                    kind: ExprKind::Member {
                        obj: Box::new(expr),
                        prop,
                    },
                    offset,
                };
            } else if self.is_punct(Punct::LBracket) {
                self.advance();
                let prop = self.parse_expr(true)?;
                self.expect_punct(Punct::RBracket, "']'")?;
                expr = Expr {
                    kind: ExprKind::Index {
                        obj: Box::new(expr),
                        prop: Box::new(prop),
                    },
                    offset,
                };
            } else if allow_call && self.is_punct(Punct::LParen) {
                let args = self.parse_args()?;
                expr = Expr {
                    kind: ExprKind::Call {
                        callee: Box::new(expr),
                        args,
                    },
                    offset,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    /// Reserved words are valid property names after a dot.
    fn parse_property_name_after_dot(&mut self) -> Result<JsString, CompileError> {
        let offset = self.offset();
        match self.advance().tok {
            Tok::Ident(name) => Ok(name),
            Tok::Keyword(kw) => Ok(JsString::from(keyword_text(kw))),
            _ => Err(self.err_at(offset, "expected property name")),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, CompileError> {
        self.expect_punct(Punct::LParen, "'('")?;
        let mut args = Vec::new();
        if !self.is_punct(Punct::RParen) {
            loop {
                args.push(self.parse_assign(true)?);
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
        }
        self.expect_punct(Punct::RParen, "')'")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let offset = self.offset();
        let kind = match self.cur().tok.clone() {
            Tok::Num {
                value,
                legacy_octal,
            } => {
                if legacy_octal && self.strict {
                    return Err(
                        self.err_at(offset, "octal literals are not allowed in strict mode")
                    );
                }
                self.advance();
                ExprKind::Num(value)
            }
            Tok::Str {
                value,
                legacy_octal,
                ..
            } => {
                if legacy_octal && self.strict {
                    return Err(
                        self.err_at(offset, "octal escapes are not allowed in strict mode")
                    );
                }
                self.advance();
                ExprKind::Str(value)
            }
            Tok::Regex { pattern, flags } => {
                self.advance();
                ExprKind::Regex { pattern, flags }
            }
            Tok::Ident(name) => {
                self.advance();
                ExprKind::Ident(name)
            }
            Tok::Keyword(Kw::This) => {
                self.advance();
                ExprKind::This
            }
            Tok::Keyword(Kw::Null) => {
                self.advance();
                ExprKind::Null
            }
            Tok::Keyword(Kw::True) => {
                self.advance();
                ExprKind::Bool(true)
            }
            Tok::Keyword(Kw::False) => {
                self.advance();
                ExprKind::Bool(false)
            }
            Tok::Keyword(Kw::Function) => {
                let lit = self.parse_function(true)?;
                ExprKind::Function(Box::new(lit))
            }
            Tok::Keyword(Kw::Let) if !self.strict => {
                self.advance();
                ExprKind::Ident(JsString::from("let"))
            }
            Tok::Punct(Punct::LParen) => {
                self.advance();
                let expr = self.parse_expr(true)?;
                self.expect_punct(Punct::RParen, "')'")?;
                return Ok(expr);
            }
            Tok::Punct(Punct::LBracket) => return self.parse_array_literal(),
            Tok::Punct(Punct::LBrace) => return self.parse_object_literal(),
            _ => return Err(self.unexpected()),
        };
        Ok(Expr { kind, offset })
    }

    fn parse_array_literal(&mut self) -> Result<Expr, CompileError> {
        let offset = self.offset();
        self.advance(); // [
        let mut items: Vec<Option<Expr>> = Vec::new();
        loop {
            if self.eat_punct(Punct::RBracket) {
                break;
            }
            if self.eat_punct(Punct::Comma) {
                items.push(None); // elision
                continue;
            }
            items.push(Some(self.parse_assign(true)?));
            if !self.is_punct(Punct::RBracket) {
                self.expect_punct(Punct::Comma, "','")?;
                if self.eat_punct(Punct::RBracket) {
                    // Trailing comma does not add a hole.
                    break;
                }
            } else {
                self.advance();
                break;
            }
        }
        Ok(Expr {
            kind: ExprKind::Array(items),
            offset,
        })
    }

    fn parse_object_literal(&mut self) -> Result<Expr, CompileError> {
        let offset = self.offset();
        self.advance(); // {
        let mut props = Vec::new();
        while !self.eat_punct(Punct::RBrace) {
            let prop_offset = self.offset();
            // get/set accessors: `get name() {}` where `get` is not
            // immediately followed by `:` or `,`.
            let accessor = if (self.is_ident_named("get") || self.is_ident_named("set"))
                && !matches!(
                    self.peek_tok(1),
                    Tok::Punct(Punct::Colon)
                        | Tok::Punct(Punct::Comma)
                        | Tok::Punct(Punct::RBrace)
                        | Tok::Punct(Punct::LParen)
                ) {
                let is_get = self.is_ident_named("get");
                self.advance();
                Some(is_get)
            } else {
                None
            };
            let key = self.parse_property_key()?;
            if let Some(is_get) = accessor {
                let params = self.parse_params()?;
                if is_get && !params.is_empty() {
                    return Err(self.err_at(prop_offset, "getter must have no parameters"));
                }
                if !is_get && params.len() != 1 {
                    return Err(self.err_at(prop_offset, "setter must have one parameter"));
                }
                let (body, strict_body) = self.parse_function_body()?;
                props.push(PropDef {
                    key,
                    kind: if is_get {
                        PropDefKind::Getter
                    } else {
                        PropDefKind::Setter
                    },
                    value: Expr {
                        kind: ExprKind::Function(Box::new(FuncLit {
                            name: None,
                            params,
                            body,
                            is_arrow: false,
                            strict_body,
                            offset: prop_offset,
                        })),
                        offset: prop_offset,
                    },
                    offset: prop_offset,
                });
            } else {
                self.expect_punct(Punct::Colon, "':'")?;
                let value = self.parse_assign(true)?;
                props.push(PropDef {
                    key,
                    kind: PropDefKind::Init,
                    value,
                    offset: prop_offset,
                });
            }
            if !self.is_punct(Punct::RBrace) {
                self.expect_punct(Punct::Comma, "','")?;
            }
        }
        Ok(Expr {
            kind: ExprKind::Object(props),
            offset,
        })
    }

    fn parse_property_key(&mut self) -> Result<JsString, CompileError> {
        let offset = self.offset();
        match self.advance().tok {
            Tok::Ident(name) => Ok(name),
            Tok::Keyword(kw) => Ok(JsString::from(keyword_text(kw))),
            Tok::Str { value, .. } => Ok(value),
            Tok::Num { value, .. } => Ok(JsString::from(skiff_core::number::format_f64(value))),
            _ => Err(self.err_at(offset, "expected property name")),
        }
    }
}

/// Valid assignment / ++ / -- / for-in targets.
fn is_assign_target(e: &Expr) -> bool {
    matches!(
        e.kind,
        ExprKind::Ident(_) | ExprKind::Member { .. } | ExprKind::Index { .. }
    )
}

fn keyword_text(kw: Kw) -> &'static str {
    match kw {
        Kw::Var => "var",
        Kw::Let => "let",
        Kw::Const => "const",
        Kw::Function => "function",
        Kw::Return => "return",
        Kw::If => "if",
        Kw::Else => "else",
        Kw::While => "while",
        Kw::Do => "do",
        Kw::For => "for",
        Kw::In => "in",
        Kw::New => "new",
        Kw::Delete => "delete",
        Kw::Void => "void",
        Kw::TypeOf => "typeof",
        Kw::InstanceOf => "instanceof",
        Kw::This => "this",
        Kw::Null => "null",
        Kw::True => "true",
        Kw::False => "false",
        Kw::Throw => "throw",
        Kw::Try => "try",
        Kw::Catch => "catch",
        Kw::Finally => "finally",
        Kw::Switch => "switch",
        Kw::Case => "case",
        Kw::Default => "default",
        Kw::Break => "break",
        Kw::Continue => "continue",
        Kw::With => "with",
        Kw::Debugger => "debugger",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> ParsedProgram {
        let file = SrcFile::new("t.js", src);
        Parser::parse_program(&file, false).expect("parse")
    }

    fn parse_err(src: &str) -> CompileError {
        let file = SrcFile::new("t.js", src);
        Parser::parse_program(&file, false).expect_err("expected parse error")
    }

    #[test]
    fn precedence_shapes() {
        let p = parse("1 + 2 * 3;");
        match &p.body[0].kind {
            StmtKind::Expr(Expr {
                kind: ExprKind::Binary { op: BinOp::Add, rhs, .. },
                ..
            }) => {
                assert!(matches!(
                    rhs.kind,
                    ExprKind::Binary { op: BinOp::Mul, .. }
                ));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn asi_inserts_at_newlines() {
        let p = parse("a = 1\nb = 2");
        assert_eq!(p.body.len(), 2);
    }

    #[test]
    fn return_is_newline_restricted() {
        let p = parse("function f() { return\n1; }");
        match &p.body[0].kind {
            StmtKind::FuncDecl(lit) => {
                assert!(matches!(lit.body[0].kind, StmtKind::Return(None)));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn arrows_single_and_parenthesized() {
        let p = parse("var f = x => x + 1; var g = (a, b) => { return a; };");
        assert_eq!(p.body.len(), 2);
        match &p.body[0].kind {
            StmtKind::Decl(_, decls) => match &decls[0].init.as_ref().unwrap().kind {
                ExprKind::Function(lit) => {
                    assert!(lit.is_arrow);
                    assert_eq!(lit.params.len(), 1);
                    assert!(matches!(lit.body[0].kind, StmtKind::Return(Some(_))));
                }
                other => panic!("unexpected init: {:?}", other),
            },
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn for_in_and_for_of() {
        let p = parse("for (var k in o) {} for (var v of a) {}");
        assert!(matches!(p.body[0].kind, StmtKind::ForIn { of: false, .. }));
        assert!(matches!(p.body[1].kind, StmtKind::ForIn { of: true, .. }));
    }

    #[test]
    fn directive_prologue_sets_strict() {
        let p = parse("'use strict'; var x;");
        assert!(p.strict);
        let p = parse("var x; 'use strict';");
        assert!(!p.strict);
    }

    #[test]
    fn strict_octal_rejected() {
        let e = parse_err("'use strict'; var x = 010;");
        assert!(e.message.contains("octal"));
    }

    #[test]
    fn strict_with_rejected() {
        let e = parse_err("'use strict'; with (o) {}");
        assert!(e.message.contains("with"));
    }

    #[test]
    fn invalid_assignment_targets() {
        assert!(parse_err("1 = 2;").message.contains("left-hand side"));
        assert!(parse_err("a + b = 2;").message.contains("left-hand side"));
        assert!(parse_err("f() ++;").message.contains("left-hand side"));
    }

    #[test]
    fn new_target_and_new_chains() {
        let p = parse("function f() { return new.target; } new f(); new f;");
        assert_eq!(p.body.len(), 3);
        assert!(matches!(p.body[1].kind, StmtKind::Expr(Expr { kind: ExprKind::New { .. }, .. })));
    }

    #[test]
    fn object_literal_accessors() {
        let p = parse("var o = { a: 1, get b() { return 2; }, set b(v) {}, 'c': 3, 4: 5 };");
        match &p.body[0].kind {
            StmtKind::Decl(_, decls) => match &decls[0].init.as_ref().unwrap().kind {
                ExprKind::Object(props) => {
                    assert_eq!(props.len(), 5);
                    assert_eq!(props[1].kind, PropDefKind::Getter);
                    assert_eq!(props[2].kind, PropDefKind::Setter);
                    assert_eq!(props[4].key.to_std_string(), "4");
                }
                other => panic!("unexpected init: {:?}", other),
            },
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn array_holes() {
        let p = parse("var a = [1, , 3, ];");
        match &p.body[0].kind {
            StmtKind::Decl(_, decls) => match &decls[0].init.as_ref().unwrap().kind {
                ExprKind::Array(items) => {
                    assert_eq!(items.len(), 3);
                    assert!(items[1].is_none());
                }
                other => panic!("unexpected init: {:?}", other),
            },
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn labelled_statements() {
        let p = parse("outer: for (;;) { break outer; }");
        assert!(matches!(p.body[0].kind, StmtKind::Labeled { .. }));
    }

    #[test]
    fn try_requires_handler() {
        assert!(parse_err("try { }").message.contains("catch or finally"));
    }
}
