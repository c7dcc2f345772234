//! Syntax tree produced by the parser and consumed by the compiler
//!
//! Every node carries the byte offset of the token that introduced it, so
//! compile errors and the program source map can point back into the
//! original text.

use skiff_core::JsString;

/// An expression with its source offset.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Num(f64),
    Str(JsString),
    Regex {
        pattern: String,
        flags: String,
    },
    Bool(bool),
    Null,
    This,
    NewTarget,
    Ident(JsString),
    Array(Vec<Option<Expr>>),
    Object(Vec<PropDef>),
    Function(Box<FuncLit>),
    Unary {
        op: UnaryOp,
        prefix: bool,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Logical {
        and: bool,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Cond {
        test: Box<Expr>,
        cons: Box<Expr>,
        alt: Box<Expr>,
    },
    Assign {
        /// `None` for plain `=`, otherwise the compound operator.
        op: Option<BinOp>,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    New {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    /// `obj.prop`
    Member {
        obj: Box<Expr>,
        prop: JsString,
    },
    /// `obj[prop]`
    Index {
        obj: Box<Expr>,
        prop: Box<Expr>,
    },
    /// Comma operator; at least two elements.
    Seq(Vec<Expr>),
}

/// One entry of an object literal.
#[derive(Debug, Clone)]
pub struct PropDef {
    pub key: JsString,
    pub kind: PropDefKind,
    pub value: Expr,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropDefKind {
    Init,
    Getter,
    Setter,
}

/// A function literal: declaration, expression, accessor body or arrow.
#[derive(Debug, Clone)]
pub struct FuncLit {
    pub name: Option<JsString>,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub is_arrow: bool,
    /// Body began with a `"use strict"` directive.
    pub strict_body: bool,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: JsString,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Minus,
    Plus,
    Not,
    BitNot,
    TypeOf,
    Void,
    Delete,
    Inc,
    Dec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Sar,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Neq,
    StrictEq,
    StrictNeq,
    In,
    InstanceOf,
}

/// A statement with its source offset.
#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Var,
    Let,
    Const,
}

/// One declarator of a `var`/`let`/`const` statement.
#[derive(Debug, Clone)]
pub struct Declarator {
    pub name: JsString,
    pub init: Option<Expr>,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub enum ForInit {
    Expr(Expr),
    Decl(DeclKind, Vec<Declarator>),
}

/// Assignment target of a `for..in` / `for..of` head.
#[derive(Debug, Clone)]
pub enum ForTarget {
    Decl(DeclKind, JsString),
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub struct SwitchCase {
    pub test: Option<Expr>,
    pub body: Vec<Stmt>,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct CatchClause {
    pub param: JsString,
    pub body: Vec<Stmt>,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Empty,
    Expr(Expr),
    Block(Vec<Stmt>),
    Decl(DeclKind, Vec<Declarator>),
    If {
        test: Expr,
        cons: Box<Stmt>,
        alt: Option<Box<Stmt>>,
    },
    While {
        test: Expr,
        body: Box<Stmt>,
    },
    DoWhile {
        body: Box<Stmt>,
        test: Expr,
    },
    For {
        init: Option<ForInit>,
        test: Option<Expr>,
        update: Option<Expr>,
        body: Box<Stmt>,
    },
    ForIn {
        left: ForTarget,
        right: Expr,
        body: Box<Stmt>,
        /// `true` for `for..of`, `false` for `for..in`.
        of: bool,
    },
    Continue(Option<JsString>),
    Break(Option<JsString>),
    Return(Option<Expr>),
    With {
        obj: Expr,
        body: Box<Stmt>,
    },
    Labeled {
        label: JsString,
        body: Box<Stmt>,
    },
    Switch {
        disc: Expr,
        cases: Vec<SwitchCase>,
    },
    Throw(Expr),
    Try {
        block: Vec<Stmt>,
        catch: Option<CatchClause>,
        finally: Option<Vec<Stmt>>,
    },
    FuncDecl(Box<FuncLit>),
    Debugger,
}

/// A parsed top-level program or eval body.
#[derive(Debug, Clone)]
pub struct ParsedProgram {
    pub body: Vec<Stmt>,
    /// Source began with a `"use strict"` directive.
    pub strict: bool,
}
