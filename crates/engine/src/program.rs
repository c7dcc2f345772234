//! The compiler's output artifact
//!
//! A `Program` is immutable once compilation finishes: a linear instruction
//! array, a constant pool, a pc -> source-offset map (sorted by pc, binary
//! searched), and optional debug metadata. Function literals embed nested
//! `Program`s, so one top-level compile produces a tree of them.

use crate::instr::Instr;
use crate::value::Value;
use skiff_core::{JsString, SrcFile};
use std::rc::Rc;

#[derive(Debug, Clone, Copy)]
pub struct SrcMapEntry {
    pub pc: u32,
    pub offset: u32,
}

pub struct Program {
    pub code: Vec<Instr>,
    /// Constant pool referenced by `LoadVal`.
    pub values: Vec<Value>,
    /// Sorted by pc; one entry per source-position change.
    pub src_map: Vec<SrcMapEntry>,
    pub func_name: Option<JsString>,
    pub file: Rc<SrcFile>,
}

impl Program {
    /// Source offset of the instruction at `pc`.
    pub fn source_offset(&self, pc: usize) -> u32 {
        let pc = pc as u32;
        match self.src_map.binary_search_by_key(&pc, |e| e.pc) {
            Ok(i) => self.src_map[i].offset,
            Err(0) => 0,
            Err(i) => self.src_map[i - 1].offset,
        }
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Program({}, {} instrs)",
            self.func_name
                .as_ref()
                .map(|n| n.to_std_string())
                .unwrap_or_else(|| "<top>".to_string()),
            self.code.len()
        )?;
        for (i, instr) in self.code.iter().enumerate() {
            writeln!(f, "  {:4}: {:?}", i, instr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_map_binary_search() {
        let prg = Program {
            code: Vec::new(),
            values: Vec::new(),
            src_map: vec![
                SrcMapEntry { pc: 0, offset: 0 },
                SrcMapEntry { pc: 5, offset: 12 },
                SrcMapEntry { pc: 9, offset: 30 },
            ],
            func_name: None,
            file: SrcFile::new("t.js", ""),
        };
        assert_eq!(prg.source_offset(0), 0);
        assert_eq!(prg.source_offset(4), 0);
        assert_eq!(prg.source_offset(5), 12);
        assert_eq!(prg.source_offset(8), 12);
        assert_eq!(prg.source_offset(100), 30);
    }
}
