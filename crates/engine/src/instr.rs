//! The closed instruction set
//!
//! Instructions carry their operands inline. Stash operands are packed as
//! `(level << 24) | slot`: `level` counts stash-creating frames between the
//! access and the owning scope (at most 255), `slot` indexes into the
//! owning stash. Stack operands are frame-relative: `0` is `this`,
//! negative indices address arguments, positive indices address locals
//! above the argument window. Jump operands are relative to the pc of the
//! jump instruction itself.
//!
//! The compiler first emits the `Stash` access variants with a packed
//! operand of 0 as placeholders; scope finalization rewrites each recorded
//! access point into its final stack/stash/const/lexical form.

use skiff_core::JsString;
use std::rc::Rc;

pub const MAX_STASH_LEVEL: u32 = 255;

pub fn pack(level: u32, slot: u32) -> u32 {
    debug_assert!(level <= MAX_STASH_LEVEL);
    (level << 24) | (slot & 0x00ff_ffff)
}

pub fn unpack(packed: u32) -> (u32, u32) {
    (packed >> 24, packed & 0x00ff_ffff)
}

/// Attributes of a binding as needed at runtime for by-name access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingAttr {
    /// Lexical binding: reads before initialization trap.
    pub lex: bool,
    /// `false` for `const`.
    pub mutable: bool,
    /// Deletable (eval-introduced vars).
    pub deletable: bool,
}

impl BindingAttr {
    pub const VAR: BindingAttr = BindingAttr {
        lex: false,
        mutable: true,
        deletable: false,
    };
    pub const LET: BindingAttr = BindingAttr {
        lex: true,
        mutable: true,
        deletable: false,
    };
    pub const CONST: BindingAttr = BindingAttr {
        lex: true,
        mutable: false,
        deletable: false,
    };
}

/// Named slots of a dynamic frame, in slot order.
pub type StashNames = Rc<Vec<(JsString, BindingAttr)>>;

/// Parameters of a full (stash-carrying) function entry.
#[derive(Debug)]
pub struct EnterFuncParams {
    pub stash_size: u32,
    pub stack_size: u32,
    pub num_args: u32,
    /// Copy the actual arguments into stash slots `0..num_args`.
    pub args_to_stash: bool,
    /// Present when the frame supports by-name lookup (direct eval).
    pub names: Option<StashNames>,
}

/// Parameters of a lexical block entry.
#[derive(Debug)]
pub struct BlockParams {
    pub stash_size: u32,
    pub stack_size: u32,
    pub names: Option<StashNames>,
}

/// Global declarations installed by `BindGlobal`.
#[derive(Debug)]
pub struct GlobalBindings {
    pub vars: Vec<JsString>,
    pub funcs: Vec<JsString>,
    pub lets: Vec<(JsString, BindingAttr)>,
}

/// A regex literal compiled at compile time; each evaluation instantiates
/// a fresh object sharing the compiled matcher.
pub struct RegexpLiteral {
    pub source: JsString,
    pub flags: JsString,
    pub global: bool,
    pub matcher: Rc<regex::Regex>,
}

impl std::fmt::Debug for RegexpLiteral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}/{}", self.source, self.flags)
    }
}

/// A nested program reference: an arena id while the compiler is still
/// rewriting, the frozen program afterwards.
#[derive(Clone)]
pub enum FuncRef {
    Id(u32),
    Prg(Rc<crate::program::Program>),
}

impl std::fmt::Debug for FuncRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FuncRef::Id(id) => write!(f, "#%{}", id),
            FuncRef::Prg(p) => write!(
                f,
                "fn {}",
                p.func_name
                    .as_ref()
                    .map(|n| n.to_std_string())
                    .unwrap_or_default()
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Instr {
    Nop,

    // ---- constants -----------------------------------------------------
    /// Push `values[idx]` from the constant pool.
    LoadVal(u32),
    LoadUndef,
    LoadNull,
    /// Push the hole sentinel (array elisions, TDZ pre-init).
    LoadEmpty,
    LoadGlobalObject,
    /// Push the current frame's callee (named function expressions).
    LoadCallee,
    LoadNewTarget,

    // ---- stack slots ---------------------------------------------------
    LoadStack(i32),
    /// Lexical variant: traps on an uninitialized slot.
    LoadStackLex { idx: i32, name: JsString },
    /// Peek the top of stack into the slot (assignment keeps its value).
    StoreStack(i32),
    /// Pop the top of stack into the slot.
    StoreStackP(i32),
    /// Pop into the slot; declaration initialization.
    InitStack(i32),
    StoreStackLex { idx: i32, name: JsString },
    /// Const trap: raises init error before initialization, type error
    /// after.
    StoreStackConst { idx: i32, name: JsString },

    // ---- stash slots ---------------------------------------------------
    LoadStash(u32),
    LoadStashLex { packed: u32, name: JsString },
    StoreStash(u32),
    /// Pop the top of stack into the slot (statement-position stores of
    /// plain vars).
    StoreStashP(u32),
    StoreStashLex { packed: u32, name: JsString },
    StoreStashConst { packed: u32, name: JsString },
    /// Pop into the slot; declaration initialization.
    InitStash(u32),

    // ---- mixed (static binding behind dynamic frames) -------------------
    LoadMixed {
        name: JsString,
        packed: u32,
        lex: bool,
    },
    /// Push callee then `this` (the `with` object when the name resolves
    /// through one).
    LoadMixedCallee {
        name: JsString,
        packed: u32,
        lex: bool,
    },
    /// Push a reference for interleaved get/put.
    ResolveMixed {
        name: JsString,
        packed: u32,
        attr: BindingAttr,
    },

    // ---- fully dynamic names -------------------------------------------
    LoadDynamic(JsString),
    /// `typeof` flavor: missing names yield `undefined` instead of
    /// raising.
    LoadDynamicTypeof(JsString),
    /// Push callee then `this`.
    LoadDynamicCallee(JsString),
    StoreDynamic {
        name: JsString,
        strict: bool,
    },
    ResolveVar {
        name: JsString,
        strict: bool,
    },
    /// Push the value of the top reference (kept on the reference stack).
    GetValue,
    /// Store the top of stack through the top reference, popping the
    /// reference but keeping the value.
    PutValue,
    DeleteVar(JsString),
    DeleteGlobal(JsString),

    // ---- properties ----------------------------------------------------
    GetProp(JsString),
    /// Pop base, push the property value then the base (method calls).
    GetPropCallee(JsString),
    GetElem,
    GetElemCallee,
    SetProp(JsString),
    SetPropStrict(JsString),
    SetElem,
    SetElemStrict,
    DeleteProp(JsString),
    DeletePropStrict(JsString),
    DeleteElem,
    DeleteElemStrict,
    /// Literal initialization: pop value, define own property on the
    /// object kept on the stack.
    SetProp1(JsString),
    SetPropGetter(JsString),
    SetPropSetter(JsString),
    /// `__proto__` in an object literal: pop value, set prototype of the
    /// object kept on the stack.
    SetProto,

    // ---- declarations --------------------------------------------------
    BindVars {
        names: Rc<Vec<JsString>>,
        deletable: bool,
    },
    BindGlobal(Rc<GlobalBindings>),
    /// Pop into a global lexical slot, ending its dead zone.
    InitGlobal(JsString),

    // ---- operators -----------------------------------------------------
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    /// Unary plus: `ToNumber`.
    Pos,
    Inc,
    Dec,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
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
    Not,
    TypeOf,

    // ---- control -------------------------------------------------------
    Jump(i32),
    /// Pop; jump when falsy.
    JumpIfFalse(i32),
    /// Pop; jump when truthy.
    JumpIfTrue(i32),
    /// Keep the value and jump when truthy, otherwise pop (`||`).
    JumpIfTruePeek(i32),
    /// Keep the value and jump when falsy, otherwise pop (`&&`).
    JumpIfFalsePeek(i32),
    Pop,
    Dup,
    /// `[a b] -> [a b a b]`.
    Dup2,
    /// Push a copy of the value `n` slots below the top.
    DupAt(u32),
    Swap,
    /// `[a b c] -> [c a b]`: tuck the top under the next two.
    Rot3,
    /// `[a b c] -> [b c a]`: lift the third-from-top to the top.
    Rot3L,
    /// Pop into the script/eval completion register.
    SaveResult,
    /// Push the completion register.
    LoadResult,
    Halt,

    // ---- calls ---------------------------------------------------------
    Call(u32),
    CallEval {
        nargs: u32,
        strict: bool,
    },
    New(u32),
    Ret,
    /// Return driving any pending finally blocks first.
    RetFinally,

    // ---- function entry ------------------------------------------------
    EnterFunc(Rc<EnterFuncParams>),
    EnterFuncStashless {
        stack_size: u32,
        num_args: u32,
    },
    /// Materialize the mapped `arguments` object (parameters live in the
    /// stash).
    CreateArgs(u32),
    /// Strict flavor: a plain snapshot, no parameter aliasing.
    CreateArgsStrict(u32),
    /// Copy `this` into a stash slot for arrow capture.
    BoxThis(u32),

    // ---- blocks --------------------------------------------------------
    EnterBlock(Rc<BlockParams>),
    /// Like `EnterBlock`, but re-pushes the in-flight exception above the
    /// reserved window.
    EnterCatchBlock(Rc<BlockParams>),
    LeaveBlock {
        stack_size: u32,
        pop_stash: bool,
    },
    EnterWith,
    LeaveWith,

    // ---- exceptions ----------------------------------------------------
    /// Push an unwind record. Offsets are relative; 0 means absent.
    Try {
        catch_ofs: i32,
        finally_ofs: i32,
    },
    /// Leave the protected region normally, running a pending finally.
    PopTry,
    /// Dispatch the completion recorded when the finally was entered.
    LeaveFinally,
    /// Pop a value and raise it.
    Throw,

    // ---- iteration -----------------------------------------------------
    /// Pop an object, push a for-in key enumerator on the iteration stack.
    Enumerate,
    /// Advance the enumerator; jump when exhausted.
    EnumNext(i32),
    /// Push the current enumeration key.
    EnumGet,
    /// Drop the top iteration-stack record.
    EnumPop,
    /// Drop the top record, invoking a for-of iterator's `return`.
    EnumPopClose,
    /// Pop an iterable, open its iterator onto the iteration stack.
    Iterate,
    /// `next()` the iterator; push the value, or pop the record and jump
    /// when done.
    IterNext(i32),

    // ---- literals ------------------------------------------------------
    NewObject,
    /// Pop `n` values (in push order) into a dense array.
    NewArray(u32),
    /// Sparse literal: pop `count` values, final length is `length`.
    NewArraySparse {
        count: u32,
        length: u32,
    },
    NewRegexp(Rc<RegexpLiteral>),
    NewFunc {
        prg: FuncRef,
        name: JsString,
        length: u32,
        strict: bool,
        arrow: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packing_round_trips() {
        let p = pack(3, 17);
        assert_eq!(unpack(p), (3, 17));
        let p = pack(255, 0x00ff_ffff);
        assert_eq!(unpack(p), (255, 0x00ff_ffff));
        assert_eq!(unpack(pack(0, 0)), (0, 0));
    }
}
