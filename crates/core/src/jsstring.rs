//! Two-flavor string representation
//!
//! Scripts index strings by UTF-16 code unit, but almost every string a real
//! program touches is pure ASCII. `JsString` keeps an ASCII fast path
//! (`Rc<str>`, one byte per code unit) and falls back to a `Rc<[u16]>` wide
//! form only when a string actually contains non-ASCII data. Both flavors
//! expose the same logical operations; equality, ordering and hashing are
//! content-based across flavors.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// A script-visible string. Cheap to clone (both flavors are `Rc`).
#[derive(Clone)]
pub enum JsString {
    /// Pure-ASCII payload: byte index == UTF-16 index.
    Ascii(Rc<str>),
    /// General payload stored as UTF-16 code units.
    Wide(Rc<[u16]>),
}

impl JsString {
    /// Build from a Rust string, choosing the narrow flavor when possible.
    pub fn from_str_value(s: &str) -> JsString {
        if s.is_ascii() {
            JsString::Ascii(Rc::from(s))
        } else {
            let units: Vec<u16> = s.encode_utf16().collect();
            JsString::Wide(Rc::from(units.as_slice()))
        }
    }

    /// Build from raw UTF-16 code units (may contain unpaired surrogates).
    pub fn from_utf16(units: Vec<u16>) -> JsString {
        if units.iter().all(|&u| u < 0x80) {
            let bytes: String = units.iter().map(|&u| u as u8 as char).collect();
            JsString::Ascii(Rc::from(bytes.as_str()))
        } else {
            JsString::Wide(Rc::from(units.as_slice()))
        }
    }

    pub fn empty() -> JsString {
        JsString::Ascii(Rc::from(""))
    }

    /// Length in UTF-16 code units.
    pub fn len(&self) -> usize {
        match self {
            JsString::Ascii(s) => s.len(),
            JsString::Wide(u) => u.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Code unit at `idx`, or `None` past the end.
    pub fn char_code_at(&self, idx: usize) -> Option<u16> {
        match self {
            JsString::Ascii(s) => s.as_bytes().get(idx).map(|&b| u16::from(b)),
            JsString::Wide(u) => u.get(idx).copied(),
        }
    }

    /// Substring over code units, clamped to the string bounds.
    pub fn substring(&self, start: usize, end: usize) -> JsString {
        let end = end.min(self.len());
        let start = start.min(end);
        match self {
            JsString::Ascii(s) => JsString::Ascii(Rc::from(&s[start..end])),
            JsString::Wide(u) => JsString::from_utf16(u[start..end].to_vec()),
        }
    }

    pub fn concat(&self, other: &JsString) -> JsString {
        match (self, other) {
            (JsString::Ascii(a), JsString::Ascii(b)) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a);
                s.push_str(b);
                JsString::Ascii(Rc::from(s.as_str()))
            }
            _ => {
                let mut units: Vec<u16> = self.iter_units().collect();
                units.extend(other.iter_units());
                JsString::Wide(Rc::from(units.as_slice()))
            }
        }
    }

    /// Iterate the UTF-16 code units regardless of flavor.
    pub fn iter_units(&self) -> impl Iterator<Item = u16> + '_ {
        let (ascii, wide) = match self {
            JsString::Ascii(s) => (Some(s.as_bytes()), None),
            JsString::Wide(u) => (None, Some(&u[..])),
        };
        ascii
            .into_iter()
            .flatten()
            .map(|&b| u16::from(b))
            .chain(wide.into_iter().flatten().copied())
    }

    /// Lossy conversion to a Rust `String` (unpaired surrogates become
    /// U+FFFD).
    pub fn to_std_string(&self) -> String {
        match self {
            JsString::Ascii(s) => s.to_string(),
            JsString::Wide(u) => String::from_utf16_lossy(u),
        }
    }

    /// Borrow the ASCII payload when this is the narrow flavor.
    pub fn as_ascii(&self) -> Option<&str> {
        match self {
            JsString::Ascii(s) => Some(s),
            JsString::Wide(_) => None,
        }
    }

    /// Code-unit-wise comparison, the ordering relational operators use.
    pub fn compare(&self, other: &JsString) -> std::cmp::Ordering {
        self.iter_units().cmp(other.iter_units())
    }

    /// Index of the first occurrence of `needle` at or after `from`.
    pub fn index_of(&self, needle: &JsString, from: usize) -> Option<usize> {
        let hay: Vec<u16> = self.iter_units().collect();
        let pat: Vec<u16> = needle.iter_units().collect();
        if pat.is_empty() {
            return Some(from.min(hay.len()));
        }
        if from >= hay.len() || hay.len() - from < pat.len() {
            return None;
        }
        (from..=hay.len() - pat.len()).find(|&i| hay[i..i + pat.len()] == pat[..])
    }
}

impl PartialEq for JsString {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (JsString::Ascii(a), JsString::Ascii(b)) => a == b,
            (JsString::Wide(a), JsString::Wide(b)) => a == b,
            _ => self.len() == other.len() && self.iter_units().eq(other.iter_units()),
        }
    }
}

impl Eq for JsString {}

impl Hash for JsString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Must agree across flavors: hash the code unit sequence.
        for u in self.iter_units() {
            u.hash(state);
        }
    }
}

impl fmt::Display for JsString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsString::Ascii(s) => f.write_str(s),
            JsString::Wide(u) => f.write_str(&String::from_utf16_lossy(u)),
        }
    }
}

impl fmt::Debug for JsString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_std_string())
    }
}

impl From<&str> for JsString {
    fn from(s: &str) -> Self {
        JsString::from_str_value(s)
    }
}

impl From<String> for JsString {
    fn from(s: String) -> Self {
        JsString::from_str_value(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_and_wide_compare_by_content() {
        let a = JsString::from("hello");
        let w = JsString::from_utf16(vec![0x68, 0x65, 0x6c, 0x6c, 0x6f, 0x2603]);
        let w = w.substring(0, 5);
        assert_eq!(a, w);
        assert_eq!(a.len(), 5);
    }

    #[test]
    fn wide_flavor_chosen_for_non_ascii() {
        let s = JsString::from("héllo");
        assert!(matches!(s, JsString::Wide(_)));
        assert_eq!(s.len(), 5);
        assert_eq!(s.char_code_at(1), Some(0xe9));
    }

    #[test]
    fn substring_clamps() {
        let s = JsString::from("abc");
        assert_eq!(s.substring(1, 99).to_std_string(), "bc");
        assert_eq!(s.substring(5, 9).to_std_string(), "");
    }

    #[test]
    fn index_of_spans_flavors() {
        let s = JsString::from("ananas");
        assert_eq!(s.index_of(&JsString::from("na"), 0), Some(1));
        assert_eq!(s.index_of(&JsString::from("na"), 2), Some(3));
        assert_eq!(s.index_of(&JsString::from("x"), 0), None);
        assert_eq!(s.index_of(&JsString::from(""), 4), Some(4));
    }

    #[test]
    fn hash_agrees_across_flavors() {
        use std::collections::hash_map::DefaultHasher;
        let narrow = JsString::from("abc");
        let wide = JsString::Wide(Rc::from(&[0x61u16, 0x62, 0x63][..]));
        let mut h1 = DefaultHasher::new();
        let mut h2 = DefaultHasher::new();
        narrow.hash(&mut h1);
        wide.hash(&mut h2);
        assert_eq!(h1.finish(), h2.finish());
    }
}
