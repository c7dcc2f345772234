//! Tokenizer for the 5.1 grammar
//!
//! The whole source is tokenized in one pass. The classic regex-vs-division
//! ambiguity is resolved with the previous-significant-token heuristic: a
//! `/` starts a regular expression literal unless the preceding token could
//! end an expression.

use crate::errors::{CompileError, CompileErrorKind};
use skiff_core::{JsString, SrcFile};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kw {
    Var,
    Let,
    Const,
    Function,
    Return,
    If,
    Else,
    While,
    Do,
    For,
    In,
    New,
    Delete,
    Void,
    TypeOf,
    InstanceOf,
    This,
    Null,
    True,
    False,
    Throw,
    Try,
    Catch,
    Finally,
    Switch,
    Case,
    Default,
    Break,
    Continue,
    With,
    Debugger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Punct {
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Semi,
    Comma,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Neq,
    StrictEq,
    StrictNeq,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Inc,
    Dec,
    Shl,
    Sar,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Not,
    BitNot,
    AndAnd,
    OrOr,
    Question,
    Colon,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    ShlAssign,
    SarAssign,
    ShrAssign,
    AndAssign,
    OrAssign,
    XorAssign,
    Dot,
    Arrow,
}

#[derive(Debug, Clone)]
pub enum Tok {
    Ident(JsString),
    Keyword(Kw),
    Num {
        value: f64,
        /// Written with a legacy `0NN` octal prefix (an error under strict).
        legacy_octal: bool,
    },
    Str {
        value: JsString,
        /// Contains a legacy octal escape (an error under strict).
        legacy_octal: bool,
        /// The raw text, kept so directive prologues can be recognized
        /// exactly (`"use strict"` must contain no escapes).
        raw: String,
    },
    Regex {
        pattern: String,
        flags: String,
    },
    Punct(Punct),
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub tok: Tok,
    pub offset: u32,
    /// A line terminator appeared between the previous token and this one.
    pub newline_before: bool,
}

pub struct Lexer {
    src: Vec<char>,
    /// Byte offset of each entry in `src`.
    offsets: Vec<u32>,
    pos: usize,
    file: Rc<SrcFile>,
}

impl Lexer {
    pub fn tokenize(file: &Rc<SrcFile>) -> Result<Vec<Token>, CompileError> {
        let mut offsets = Vec::new();
        let mut chars = Vec::new();
        for (i, c) in file.src().char_indices() {
            offsets.push(i as u32);
            chars.push(c);
        }
        offsets.push(file.src().len() as u32);
        let mut lexer = Lexer {
            src: chars,
            offsets,
            pos: 0,
            file: Rc::clone(file),
        };
        lexer.run()
    }

    fn run(&mut self) -> Result<Vec<Token>, CompileError> {
        let mut out: Vec<Token> = Vec::new();
        loop {
            let newline_before = self.skip_trivia()?;
            let offset = self.offset();
            if self.pos >= self.src.len() {
                out.push(Token {
                    tok: Tok::Eof,
                    offset,
                    newline_before,
                });
                return Ok(out);
            }
            let c = self.src[self.pos];
            let tok = match c {
                '0'..='9' => self.read_number()?,
                '"' | '\'' => self.read_string(c)?,
                '/' if self.regex_allowed(&out) => self.read_regex()?,
                _ if is_ident_start(c) => self.read_ident(),
                _ => self.read_punct()?,
            };
            out.push(Token {
                tok,
                offset,
                newline_before,
            });
        }
    }

    fn offset(&self) -> u32 {
        self.offsets[self.pos.min(self.src.len())]
    }

    fn err(&self, offset: u32, message: impl Into<String>) -> CompileError {
        CompileError {
            kind: CompileErrorKind::Syntax,
            message: message.into(),
            file: self.file.name().to_string(),
            offset: offset as usize,
            position: self.file.position(offset as usize),
        }
    }

    /// Skip whitespace and comments; report whether a line terminator was
    /// crossed.
    fn skip_trivia(&mut self) -> Result<bool, CompileError> {
        let mut newline = false;
        loop {
            match self.src.get(self.pos) {
                Some('\n') | Some('\r') | Some('\u{2028}') | Some('\u{2029}') => {
                    newline = true;
                    self.pos += 1;
                }
                Some(c) if c.is_whitespace() || *c == '\u{feff}' => self.pos += 1,
                Some('/') if self.src.get(self.pos + 1) == Some(&'/') => {
                    while self.pos < self.src.len() && !is_line_terminator(self.src[self.pos]) {
                        self.pos += 1;
                    }
                }
                Some('/') if self.src.get(self.pos + 1) == Some(&'*') => {
                    let start = self.offset();
                    self.pos += 2;
                    loop {
                        match self.src.get(self.pos) {
                            None => return Err(self.err(start, "unterminated comment")),
                            Some('*') if self.src.get(self.pos + 1) == Some(&'/') => {
                                self.pos += 2;
                                break;
                            }
                            Some(c) => {
                                if is_line_terminator(*c) {
                                    newline = true;
                                }
                                self.pos += 1;
                            }
                        }
                    }
                }
                _ => return Ok(newline),
            }
        }
    }

    /// A `/` starts a regex unless the previous token could end an
    /// expression.
    fn regex_allowed(&self, out: &[Token]) -> bool {
        match out.last().map(|t| &t.tok) {
            None => true,
            Some(Tok::Ident(_)) | Some(Tok::Num { .. }) | Some(Tok::Str { .. })
            | Some(Tok::Regex { .. }) => false,
            Some(Tok::Keyword(kw)) => !matches!(kw, Kw::This | Kw::Null | Kw::True | Kw::False),
            Some(Tok::Punct(p)) => !matches!(
                p,
                Punct::RParen | Punct::RBracket | Punct::Inc | Punct::Dec
            ),
            Some(Tok::Eof) => true,
        }
    }

    fn read_ident(&mut self) -> Tok {
        let start = self.pos;
        while self.pos < self.src.len() && is_ident_part(self.src[self.pos]) {
            self.pos += 1;
        }
        let text: String = self.src[start..self.pos].iter().collect();
        match keyword(&text) {
            Some(kw) => Tok::Keyword(kw),
            None => Tok::Ident(JsString::from_str_value(&text)),
        }
    }

    fn read_number(&mut self) -> Result<Tok, CompileError> {
        let start = self.pos;
        let start_offset = self.offset();
        if self.src[self.pos] == '0'
            && matches!(self.src.get(self.pos + 1), Some('x') | Some('X'))
        {
            self.pos += 2;
            let digits_start = self.pos;
            while self
                .src
                .get(self.pos)
                .is_some_and(|c| c.is_ascii_hexdigit())
            {
                self.pos += 1;
            }
            if self.pos == digits_start {
                return Err(self.err(start_offset, "missing hex digits"));
            }
            let text: String = self.src[digits_start..self.pos].iter().collect();
            let value = u64::from_str_radix(&text, 16)
                .map(|v| v as f64)
                .unwrap_or(f64::INFINITY);
            return Ok(Tok::Num {
                value,
                legacy_octal: false,
            });
        }
        // Legacy octal: 0 followed directly by digits.
        if self.src[self.pos] == '0' && self.src.get(self.pos + 1).is_some_and(|c| c.is_ascii_digit())
        {
            let digits_start = self.pos + 1;
            let mut p = digits_start;
            let mut octal = true;
            while self.src.get(p).is_some_and(|c| c.is_ascii_digit()) {
                if !('0'..='7').contains(&self.src[p]) {
                    octal = false;
                }
                p += 1;
            }
            // Digits 8/9 fall back to decimal, still flagged as legacy.
            if octal && !matches!(self.src.get(p), Some('.') | Some('e') | Some('E')) {
                self.pos = p;
                let text: String = self.src[digits_start..p].iter().collect();
                let value = u64::from_str_radix(&text, 8)
                    .map(|v| v as f64)
                    .unwrap_or(f64::INFINITY);
                return Ok(Tok::Num {
                    value,
                    legacy_octal: true,
                });
            }
        }
        let mut legacy = self.src[self.pos] == '0'
            && self.src.get(self.pos + 1).is_some_and(|c| c.is_ascii_digit());
        while self.src.get(self.pos).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.src.get(self.pos) == Some(&'.') {
            self.pos += 1;
            while self.src.get(self.pos).is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.src.get(self.pos), Some('e') | Some('E')) {
            let mut p = self.pos + 1;
            if matches!(self.src.get(p), Some('+') | Some('-')) {
                p += 1;
            }
            if self.src.get(p).is_some_and(|c| c.is_ascii_digit()) {
                self.pos = p;
                while self.src.get(self.pos).is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            } else {
                return Err(self.err(start_offset, "missing exponent digits"));
            }
        }
        if self.src.get(self.pos).is_some_and(|c| is_ident_start(*c)) {
            return Err(self.err(start_offset, "identifier starts immediately after number"));
        }
        let text: String = self.src[start..self.pos].iter().collect();
        if text.len() == 1 {
            legacy = false;
        }
        let value: f64 = text.parse().map_err(|_| {
            self.err(start_offset, format!("invalid number literal {}", text))
        })?;
        Ok(Tok::Num {
            value,
            legacy_octal: legacy,
        })
    }

    fn read_string(&mut self, quote: char) -> Result<Tok, CompileError> {
        let start_offset = self.offset();
        let raw_start = self.pos;
        self.pos += 1;
        let mut units: Vec<u16> = Vec::new();
        let mut legacy_octal = false;
        loop {
            let c = match self.src.get(self.pos) {
                None => return Err(self.err(start_offset, "unterminated string literal")),
                Some(c) => *c,
            };
            if is_line_terminator(c) {
                return Err(self.err(start_offset, "unterminated string literal"));
            }
            self.pos += 1;
            if c == quote {
                break;
            }
            if c != '\\' {
                push_char(&mut units, c);
                continue;
            }
            let esc = match self.src.get(self.pos) {
                None => return Err(self.err(start_offset, "unterminated string literal")),
                Some(c) => *c,
            };
            self.pos += 1;
            match esc {
                'n' => units.push(b'\n'.into()),
                't' => units.push(b'\t'.into()),
                'r' => units.push(b'\r'.into()),
                'b' => units.push(0x08),
                'f' => units.push(0x0c),
                'v' => units.push(0x0b),
                '0' if !self.src.get(self.pos).is_some_and(|c| c.is_ascii_digit()) => {
                    units.push(0)
                }
                '0'..='7' => {
                    // Legacy octal escape: up to three octal digits.
                    let mut v = esc.to_digit(8).unwrap_or(0);
                    for _ in 0..2 {
                        match self.src.get(self.pos).and_then(|c| c.to_digit(8)) {
                            Some(d) if v * 8 + d <= 0xff => {
                                v = v * 8 + d;
                                self.pos += 1;
                            }
                            _ => break,
                        }
                    }
                    legacy_octal = true;
                    units.push(v as u16);
                }
                '8' | '9' => {
                    return Err(self.err(start_offset, "invalid escape sequence"));
                }
                'x' => {
                    let v = self.read_hex(2, start_offset)?;
                    units.push(v as u16);
                }
                'u' => {
                    let v = self.read_hex(4, start_offset)?;
                    units.push(v as u16);
                }
                c if is_line_terminator(c) => {
                    // Line continuation: \r\n counts as one terminator.
                    if c == '\r' && self.src.get(self.pos) == Some(&'\n') {
                        self.pos += 1;
                    }
                }
                c => push_char(&mut units, c),
            }
        }
        let raw: String = self.src[raw_start..self.pos].iter().collect();
        Ok(Tok::Str {
            value: JsString::from_utf16(units),
            legacy_octal,
            raw,
        })
    }

    fn read_hex(&mut self, n: usize, err_offset: u32) -> Result<u32, CompileError> {
        let mut v = 0u32;
        for _ in 0..n {
            let d = self
                .src
                .get(self.pos)
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.err(err_offset, "invalid hex escape"))?;
            v = v * 16 + d;
            self.pos += 1;
        }
        Ok(v)
    }

    fn read_regex(&mut self) -> Result<Tok, CompileError> {
        let start_offset = self.offset();
        self.pos += 1;
        let body_start = self.pos;
        let mut in_class = false;
        loop {
            let c = match self.src.get(self.pos) {
                None => return Err(self.err(start_offset, "unterminated regular expression")),
                Some(c) => *c,
            };
            if is_line_terminator(c) {
                return Err(self.err(start_offset, "unterminated regular expression"));
            }
            match c {
                '\\' => {
                    self.pos += 2;
                    continue;
                }
                '[' => in_class = true,
                ']' => in_class = false,
                '/' if !in_class => break,
                _ => {}
            }
            self.pos += 1;
        }
        let pattern: String = self.src[body_start..self.pos].iter().collect();
        self.pos += 1; // closing slash
        let flags_start = self.pos;
        while self.src.get(self.pos).is_some_and(|c| is_ident_part(*c)) {
            self.pos += 1;
        }
        let flags: String = self.src[flags_start..self.pos].iter().collect();
        Ok(Tok::Regex { pattern, flags })
    }

    fn read_punct(&mut self) -> Result<Tok, CompileError> {
        use Punct::*;
        let rest = &self.src[self.pos..];
        // Longest match first.
        let table: &[(&str, Punct)] = &[
            (">>>=", ShrAssign),
            ("===", StrictEq),
            ("!==", StrictNeq),
            (">>>", Shr),
            ("<<=", ShlAssign),
            (">>=", SarAssign),
            ("==", Eq),
            ("!=", Neq),
            ("<=", Le),
            (">=", Ge),
            ("&&", AndAnd),
            ("||", OrOr),
            ("++", Inc),
            ("--", Dec),
            ("<<", Shl),
            (">>", Sar),
            ("+=", PlusAssign),
            ("-=", MinusAssign),
            ("*=", StarAssign),
            ("/=", SlashAssign),
            ("%=", PercentAssign),
            ("&=", AndAssign),
            ("|=", OrAssign),
            ("^=", XorAssign),
            ("=>", Arrow),
            ("{", LBrace),
            ("}", RBrace),
            ("(", LParen),
            (")", RParen),
            ("[", LBracket),
            ("]", RBracket),
            (";", Semi),
            (",", Comma),
            ("<", Lt),
            (">", Gt),
            ("+", Plus),
            ("-", Minus),
            ("*", Star),
            ("/", Slash),
            ("%", Percent),
            ("&", BitAnd),
            ("|", BitOr),
            ("^", BitXor),
            ("!", Not),
            ("~", BitNot),
            ("?", Question),
            (":", Colon),
            ("=", Assign),
            (".", Dot),
        ];
        for (text, p) in table {
            let chars: Vec<char> = text.chars().collect();
            if rest.len() >= chars.len() && rest[..chars.len()] == chars[..] {
                self.pos += chars.len();
                return Ok(Tok::Punct(*p));
            }
        }
        Err(self.err(
            self.offset(),
            format!("unexpected character {:?}", self.src[self.pos]),
        ))
    }
}

fn push_char(units: &mut Vec<u16>, c: char) {
    let mut buf = [0u16; 2];
    units.extend_from_slice(c.encode_utf16(&mut buf));
}

fn is_line_terminator(c: char) -> bool {
    matches!(c, '\n' | '\r' | '\u{2028}' | '\u{2029}')
}

fn is_ident_start(c: char) -> bool {
    c == '$' || c == '_' || c.is_alphabetic()
}

fn is_ident_part(c: char) -> bool {
    is_ident_start(c) || c.is_ascii_digit() || c.is_numeric()
}

fn keyword(text: &str) -> Option<Kw> {
    Some(match text {
        "var" => Kw::Var,
        "let" => Kw::Let,
        "const" => Kw::Const,
        "function" => Kw::Function,
        "return" => Kw::Return,
        "if" => Kw::If,
        "else" => Kw::Else,
        "while" => Kw::While,
        "do" => Kw::Do,
        "for" => Kw::For,
        "in" => Kw::In,
        "new" => Kw::New,
        "delete" => Kw::Delete,
        "void" => Kw::Void,
        "typeof" => Kw::TypeOf,
        "instanceof" => Kw::InstanceOf,
        "this" => Kw::This,
        "null" => Kw::Null,
        "true" => Kw::True,
        "false" => Kw::False,
        "throw" => Kw::Throw,
        "try" => Kw::Try,
        "catch" => Kw::Catch,
        "finally" => Kw::Finally,
        "switch" => Kw::Switch,
        "case" => Kw::Case,
        "default" => Kw::Default,
        "break" => Kw::Break,
        "continue" => Kw::Continue,
        "with" => Kw::With,
        "debugger" => Kw::Debugger,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Token> {
        let file = SrcFile::new("t.js", src);
        Lexer::tokenize(&file).expect("tokenize")
    }

    #[test]
    fn basic_stream() {
        let t = toks("var x = 1 + 2.5;");
        assert!(matches!(t[0].tok, Tok::Keyword(Kw::Var)));
        assert!(matches!(&t[1].tok, Tok::Ident(s) if s.to_std_string() == "x"));
        assert!(matches!(t[3].tok, Tok::Num { value, .. } if value == 1.0));
        assert!(matches!(t[5].tok, Tok::Num { value, .. } if value == 2.5));
        assert!(matches!(t.last().unwrap().tok, Tok::Eof));
    }

    #[test]
    fn regex_vs_division() {
        let t = toks("a / b");
        assert!(matches!(t[1].tok, Tok::Punct(Punct::Slash)));
        let t = toks("x = /ab+c/g");
        assert!(
            matches!(&t[2].tok, Tok::Regex { pattern, flags } if pattern == "ab+c" && flags == "g")
        );
        let t = toks("(1) / 2");
        assert!(matches!(t[3].tok, Tok::Punct(Punct::Slash)));
    }

    #[test]
    fn string_escapes() {
        let t = toks(r#"'a\n\x41☃'"#);
        match &t[0].tok {
            Tok::Str { value, .. } => {
                assert_eq!(value.to_std_string(), "a\nA\u{2603}");
            }
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn legacy_octal_flags() {
        assert!(matches!(
            toks("010")[0].tok,
            Tok::Num { value, legacy_octal: true } if value == 8.0
        ));
        assert!(matches!(
            toks("089")[0].tok,
            Tok::Num { value, legacy_octal: true } if value == 89.0
        ));
        assert!(matches!(toks("0")[0].tok, Tok::Num { legacy_octal: false, .. }));
    }

    #[test]
    fn newline_tracking_for_asi() {
        let t = toks("a\nb");
        assert!(!t[0].newline_before);
        assert!(t[1].newline_before);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let file = SrcFile::new("t.js", "'abc");
        assert!(Lexer::tokenize(&file).is_err());
    }
}
