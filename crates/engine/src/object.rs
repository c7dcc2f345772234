//! Object model: ordinary objects, prototype chains, property descriptors
//! and the exotic kinds the engine needs (arrays, functions, arguments,
//! primitive wrappers, regexps, iterators)
//!
//! The VM consumes objects exclusively through the methods here: own/chain
//! property lookup, set dispositions, define/delete, prototype access,
//! callability assertions and key enumeration. Accessor invocation is the
//! VM's job; this module only reports that a setter or getter is involved.

use crate::value::{JsSymbol, Value};
use crate::vm::Stash;
use skiff_core::JsString;
use std::cell::RefCell;
use std::rc::Rc;

/// Property key: interned string or symbol.
#[derive(Debug, Clone)]
pub enum PropKey {
    Str(JsString),
    Sym(JsSymbol),
}

impl PropKey {
    pub fn str(s: impl Into<JsString>) -> PropKey {
        PropKey::Str(s.into())
    }

    pub fn same(&self, other: &PropKey) -> bool {
        match (self, other) {
            (PropKey::Str(a), PropKey::Str(b)) => a == b,
            (PropKey::Sym(a), PropKey::Sym(b)) => a.same(b),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&JsString> {
        match self {
            PropKey::Str(s) => Some(s),
            PropKey::Sym(_) => None,
        }
    }
}

/// A property slot: either data (value + writable) or accessor
/// (getter/setter objects).
#[derive(Debug, Clone)]
pub struct Property {
    pub value: Value,
    pub getter: Option<JsObject>,
    pub setter: Option<JsObject>,
    pub accessor: bool,
    pub writable: bool,
    pub enumerable: bool,
    pub configurable: bool,
}

impl Property {
    pub fn data(value: Value) -> Property {
        Property {
            value,
            getter: None,
            setter: None,
            accessor: false,
            writable: true,
            enumerable: true,
            configurable: true,
        }
    }

    pub fn data_with(value: Value, writable: bool, enumerable: bool, configurable: bool) -> Property {
        Property {
            value,
            getter: None,
            setter: None,
            accessor: false,
            writable,
            enumerable,
            configurable,
        }
    }

    pub fn accessor(getter: Option<JsObject>, setter: Option<JsObject>) -> Property {
        Property {
            value: Value::Undefined,
            getter,
            setter,
            accessor: true,
            writable: false,
            enumerable: true,
            configurable: true,
        }
    }
}

/// Insertion-ordered property map. Objects in scripts are small; a vector
/// with linear lookup keeps enumeration order for free.
#[derive(Default)]
pub struct PropMap {
    entries: Vec<(PropKey, Property)>,
}

impl PropMap {
    fn find(&self, key: &PropKey) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k.same(key))
    }

    fn get(&self, key: &PropKey) -> Option<&Property> {
        self.find(key).map(|i| &self.entries[i].1)
    }

    fn insert(&mut self, key: PropKey, prop: Property) {
        match self.find(&key) {
            Some(i) => self.entries[i].1 = prop,
            None => self.entries.push((key, prop)),
        }
    }

    fn remove(&mut self, key: &PropKey) -> bool {
        match self.find(key) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }
}

/// Native function implementation. `this` and the argument slice come from
/// the VM's operand stack; the result is pushed back by the caller.
pub type NativeFn =
    fn(&mut crate::vm::Vm, &Value, &[Value]) -> Result<Value, crate::vm::VmFault>;

#[derive(Clone)]
pub struct NativeFunc {
    pub name: &'static str,
    pub length: u32,
    pub func: NativeFn,
    /// Construct behavior (`new F(...)`); `None` means not a constructor.
    pub ctor: Option<NativeFn>,
}

/// A compiled script function: program + captured stash chain.
pub struct ScriptFunc {
    pub prg: Rc<crate::program::Program>,
    pub stash: Option<Rc<RefCell<Stash>>>,
    pub name: JsString,
    pub length: u32,
    pub strict: bool,
    pub arrow: bool,
    /// Arrows capture the enclosing invocation's `new.target` at creation.
    pub captured_new_target: Value,
    /// Arrows also pin the enclosing frame's `this`; it backs `this`
    /// references when no boxed-this binding is in reach (top-level and
    /// eval arrows).
    pub captured_this: Value,
}

#[derive(Clone)]
pub enum FuncKind {
    Native(NativeFunc),
    Script(Rc<ScriptFunc>),
}

pub struct ArrayData {
    /// Dense element storage; `Empty` marks holes.
    pub elems: Vec<Value>,
    pub length: u32,
}

/// The `arguments` exotic object. In mapped (non-strict) form, indices of
/// declared parameters alias the function's stash slots.
pub struct ArgsData {
    pub stash: Rc<RefCell<Stash>>,
    /// Per index: the aliased stash slot, or `None` once unmapped.
    pub mapped: Vec<Option<u32>>,
}

pub struct RegexpData {
    pub source: JsString,
    pub flags: JsString,
    pub global: bool,
    pub matcher: Rc<regex::Regex>,
    pub last_index: u32,
}

/// State of an array iterator produced by `[][Symbol.iterator]()`.
pub struct ArrayIterData {
    pub target: Value,
    pub index: u32,
    pub done: bool,
}

pub enum ObjectKind {
    Plain,
    Array(ArrayData),
    Function(FuncKind),
    Arguments(ArgsData),
    BoolWrap(bool),
    NumberWrap(Value),
    StringWrap(JsString),
    Regexp(RegexpData),
    ArrayIter(ArrayIterData),
}

pub struct ObjectData {
    pub class: &'static str,
    pub proto: Option<JsObject>,
    pub extensible: bool,
    pub props: PropMap,
    pub kind: ObjectKind,
}

/// Reference-counted handle to an object. Equality is identity.
#[derive(Clone)]
pub struct JsObject(Rc<RefCell<ObjectData>>);

/// What a property write should do, decided before any script code runs.
pub enum SetDisposition {
    /// Write through to own/new storage on the receiver.
    Write,
    /// Invoke this setter with the receiver as `this`.
    CallSetter(JsObject),
    /// Read-only or non-extensible; throw under strict, ignore otherwise.
    Reject,
}

impl JsObject {
    pub fn new(proto: Option<JsObject>, class: &'static str, kind: ObjectKind) -> JsObject {
        JsObject(Rc::new(RefCell::new(ObjectData {
            class,
            proto,
            extensible: true,
            props: PropMap::default(),
            kind,
        })))
    }

    pub fn plain(proto: Option<JsObject>) -> JsObject {
        JsObject::new(proto, "Object", ObjectKind::Plain)
    }

    pub fn array(proto: Option<JsObject>, elems: Vec<Value>) -> JsObject {
        let length = elems.len() as u32;
        JsObject::new(
            proto,
            "Array",
            ObjectKind::Array(ArrayData { elems, length }),
        )
    }

    pub fn same(&self, other: &JsObject) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn class(&self) -> &'static str {
        self.0.borrow().class
    }

    pub fn proto(&self) -> Option<JsObject> {
        self.0.borrow().proto.clone()
    }

    pub fn set_proto(&self, proto: Option<JsObject>) -> bool {
        // Cycle check keeps prototype walks terminating.
        let mut p = proto.clone();
        while let Some(o) = p {
            if o.same(self) {
                return false;
            }
            p = o.proto();
        }
        self.0.borrow_mut().proto = proto;
        true
    }

    pub fn is_extensible(&self) -> bool {
        self.0.borrow().extensible
    }

    pub fn prevent_extensions(&self) {
        self.0.borrow_mut().extensible = false;
    }

    pub fn with_kind<R>(&self, f: impl FnOnce(&ObjectKind) -> R) -> R {
        f(&self.0.borrow().kind)
    }

    pub fn with_kind_mut<R>(&self, f: impl FnOnce(&mut ObjectKind) -> R) -> R {
        f(&mut self.0.borrow_mut().kind)
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Own property, including the synthesized ones of exotic kinds.
    pub fn get_own(&self, key: &PropKey) -> Option<Property> {
        let data = self.0.borrow();
        if let PropKey::Str(name) = key {
            match &data.kind {
                ObjectKind::Array(arr) => {
                    if name.as_ascii() == Some("length") {
                        return Some(Property::data_with(
                            Value::Int(i64::from(arr.length)),
                            true,
                            false,
                            false,
                        ));
                    }
                    if let Some(idx) = array_index(name) {
                        if let Some(v) = arr.elems.get(idx as usize) {
                            if !v.is_empty() {
                                return Some(Property::data(v.clone()));
                            }
                            return None;
                        }
                    }
                }
                ObjectKind::StringWrap(s) => {
                    if name.as_ascii() == Some("length") {
                        return Some(Property::data_with(
                            Value::Int(s.len() as i64),
                            false,
                            false,
                            false,
                        ));
                    }
                    if let Some(idx) = array_index(name) {
                        if let Some(_u) = s.char_code_at(idx as usize) {
                            return Some(Property::data_with(
                                Value::Str(s.substring(idx as usize, idx as usize + 1)),
                                false,
                                true,
                                false,
                            ));
                        }
                    }
                }
                ObjectKind::Arguments(args) => {
                    if let Some(idx) = array_index(name) {
                        if let Some(Some(slot)) = args.mapped.get(idx as usize) {
                            let v = args.stash.borrow().get_slot(*slot);
                            return Some(Property::data(v.nil_safe()));
                        }
                    }
                }
                _ => {}
            }
        }
        data.props.get(key).cloned()
    }

    /// Walk the prototype chain.
    pub fn lookup(&self, key: &PropKey) -> Option<Property> {
        let mut cur = Some(self.clone());
        while let Some(o) = cur {
            if let Some(p) = o.get_own(key) {
                return Some(p);
            }
            cur = o.proto();
        }
        None
    }

    pub fn has_own(&self, key: &PropKey) -> bool {
        self.get_own(key).is_some()
    }

    pub fn has_property(&self, key: &PropKey) -> bool {
        self.lookup(key).is_some()
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Decide how a `[[Set]]` with this object as receiver proceeds.
    pub fn set_disposition(&self, key: &PropKey) -> SetDisposition {
        if let Some(own) = self.get_own(key) {
            if own.accessor {
                return match own.setter {
                    Some(s) => SetDisposition::CallSetter(s),
                    None => SetDisposition::Reject,
                };
            }
            return if own.writable {
                SetDisposition::Write
            } else {
                SetDisposition::Reject
            };
        }
        let mut cur = self.proto();
        while let Some(o) = cur {
            if let Some(p) = o.get_own(key) {
                if p.accessor {
                    return match p.setter {
                        Some(s) => SetDisposition::CallSetter(s),
                        None => SetDisposition::Reject,
                    };
                }
                return if p.writable {
                    SetDisposition::Write
                } else {
                    SetDisposition::Reject
                };
            }
            cur = o.proto();
        }
        if self.is_extensible() {
            SetDisposition::Write
        } else {
            SetDisposition::Reject
        }
    }

    /// Kind-aware plain write: array indices and length, mapped arguments,
    /// otherwise the property map (keeping existing flags on overwrite).
    pub fn put_value(&self, key: &PropKey, value: Value) {
        let mut data = self.0.borrow_mut();
        let data = &mut *data;
        if let PropKey::Str(name) = key {
            match &mut data.kind {
                ObjectKind::Array(arr) => {
                    if name.as_ascii() == Some("length") {
                        if let Some(n) = value.number_value() {
                            let n = n as u32;
                            arr.elems.truncate(n as usize);
                            arr.length = n;
                        }
                        return;
                    }
                    if let Some(idx) = array_index(name) {
                        let i = idx as usize;
                        if i < arr.elems.len() {
                            arr.elems[i] = value;
                        } else if i == arr.elems.len() {
                            arr.elems.push(value);
                        } else if i < arr.elems.len() + 1024 {
                            arr.elems.resize(i, Value::Empty);
                            arr.elems.push(value);
                        } else {
                            // Far sparse writes land in the property map.
                            if idx >= arr.length {
                                arr.length = idx + 1;
                            }
                            data.props.insert(key.clone(), Property::data(value));
                            return;
                        }
                        if idx >= arr.length {
                            arr.length = idx + 1;
                        }
                        return;
                    }
                }
                ObjectKind::Arguments(args) => {
                    if let Some(idx) = array_index(name) {
                        if let Some(Some(slot)) = args.mapped.get(idx as usize) {
                            args.stash.borrow_mut().set_slot(*slot, value);
                            return;
                        }
                    }
                }
                _ => {}
            }
        }
        match data.props.find(key) {
            Some(i) => data.props.entries[i].1.value = value,
            None => data.props.insert(key.clone(), Property::data(value)),
        }
    }

    /// `[[DefineOwnProperty]]`, simplified to the compatibility the engine
    /// needs: non-configurable properties only admit value writes while
    /// writable, and `writable: true -> false` transitions.
    pub fn define_own(&self, key: PropKey, prop: Property) -> bool {
        if let Some(existing) = self.get_own(&key) {
            if !existing.configurable {
                let value_only = !existing.accessor
                    && !prop.accessor
                    && existing.enumerable == prop.enumerable
                    && prop.configurable == existing.configurable;
                if !(value_only && (existing.writable || (!prop.writable && existing.value.strict_equals(&prop.value)))) {
                    return false;
                }
            }
        } else if !self.is_extensible() {
            return false;
        }
        // Default-shaped data properties on arrays go through the element
        // fast path so dense storage stays dense.
        if let PropKey::Str(name) = &key {
            let plain_data =
                !prop.accessor && prop.writable && prop.enumerable && prop.configurable;
            let is_array = matches!(self.0.borrow().kind, ObjectKind::Array(_));
            if is_array && plain_data && array_index(name).is_some() {
                self.put_value(&key, prop.value);
                return true;
            }
            if is_array && name.as_ascii() == Some("length") {
                self.put_value(&key, prop.value);
                return true;
            }
        }
        self.0.borrow_mut().props.insert(key, prop);
        true
    }

    /// `[[Delete]]`; `false` when the property resists.
    pub fn delete(&self, key: &PropKey) -> bool {
        if let PropKey::Str(name) = key {
            let mut data = self.0.borrow_mut();
            let data = &mut *data;
            match &mut data.kind {
                ObjectKind::Array(arr) => {
                    if let Some(idx) = array_index(name) {
                        if let Some(slot) = arr.elems.get_mut(idx as usize) {
                            *slot = Value::Empty;
                            return true;
                        }
                        return data.props.remove(key) || true;
                    }
                    if name.as_ascii() == Some("length") {
                        return false;
                    }
                }
                ObjectKind::Arguments(args) => {
                    if let Some(idx) = array_index(name) {
                        if let Some(entry) = args.mapped.get_mut(idx as usize) {
                            if let Some(slot) = entry.take() {
                                // Unmapping keeps the current value as an
                                // ordinary property.
                                let v = args.stash.borrow().get_slot(slot).nil_safe();
                                data.props.insert(key.clone(), Property::data(v));
                            }
                        }
                        return data.props.remove(key) || true;
                    }
                }
                _ => {}
            }
        }
        let data = self.0.borrow();
        match data.props.get(key) {
            None => true,
            Some(p) if p.configurable => {
                drop(data);
                self.0.borrow_mut().props.remove(key)
            }
            Some(_) => false,
        }
    }

    // ------------------------------------------------------------------
    // Enumeration
    // ------------------------------------------------------------------

    /// Own enumerable string keys, exotic indices first, in insertion
    /// order after that.
    pub fn own_enumerable_string_keys(&self) -> Vec<JsString> {
        let data = self.0.borrow();
        let mut keys = Vec::new();
        match &data.kind {
            ObjectKind::Array(arr) => {
                for (i, v) in arr.elems.iter().enumerate() {
                    if !v.is_empty() {
                        keys.push(JsString::from(i.to_string()));
                    }
                }
            }
            ObjectKind::StringWrap(s) => {
                for i in 0..s.len() {
                    keys.push(JsString::from(i.to_string()));
                }
            }
            ObjectKind::Arguments(args) => {
                for (i, m) in args.mapped.iter().enumerate() {
                    if m.is_some() {
                        keys.push(JsString::from(i.to_string()));
                    }
                }
            }
            _ => {}
        }
        for (k, p) in &data.props.entries {
            if p.enumerable {
                if let PropKey::Str(s) = k {
                    keys.push(s.clone());
                }
            }
        }
        keys
    }

    /// Own string keys regardless of enumerability (property reflection).
    pub fn own_string_keys(&self) -> Vec<JsString> {
        let data = self.0.borrow();
        let mut keys = Vec::new();
        if let ObjectKind::Array(arr) = &data.kind {
            for (i, v) in arr.elems.iter().enumerate() {
                if !v.is_empty() {
                    keys.push(JsString::from(i.to_string()));
                }
            }
            keys.push(JsString::from("length"));
        }
        for (k, _) in &data.props.entries {
            if let PropKey::Str(s) = k {
                keys.push(s.clone());
            }
        }
        keys
    }

    // ------------------------------------------------------------------
    // Callables
    // ------------------------------------------------------------------

    pub fn is_callable(&self) -> bool {
        matches!(self.0.borrow().kind, ObjectKind::Function(_))
    }

    /// The function implementation, if this object is callable.
    pub fn assert_callable(&self) -> Option<FuncKind> {
        match &self.0.borrow().kind {
            ObjectKind::Function(k) => Some(k.clone()),
            _ => None,
        }
    }

    /// The construct implementation, if this object can be `new`ed.
    /// Arrows and most natives are callable but not constructors.
    pub fn assert_constructor(&self) -> Option<FuncKind> {
        match &self.0.borrow().kind {
            ObjectKind::Function(FuncKind::Script(f)) if !f.arrow => {
                Some(FuncKind::Script(Rc::clone(f)))
            }
            ObjectKind::Function(FuncKind::Native(n)) if n.ctor.is_some() => {
                Some(FuncKind::Native(n.clone()))
            }
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Array helpers for the built-ins
    // ------------------------------------------------------------------

    pub fn array_length(&self) -> Option<u32> {
        self.with_kind(|k| match k {
            ObjectKind::Array(a) => Some(a.length),
            _ => None,
        })
    }

    pub fn array_push(&self, v: Value) {
        self.with_kind_mut(|k| {
            if let ObjectKind::Array(a) = k {
                a.elems.push(v);
                a.length = a.length.max(a.elems.len() as u32);
            }
        });
    }
}

impl std::fmt::Debug for JsObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[object {}]", self.class())
    }
}

/// Translate a scripting regex literal into a compiled matcher. The `g`
/// flag is tracked by the engine; `i` and `m` become inline flags.
/// Constructs the matcher cannot express (backreferences, lookaround)
/// surface as a syntax error.
pub fn build_regex(source: &str, flags: &str) -> Result<crate::instr::RegexpLiteral, String> {
    let mut global = false;
    let mut icase = false;
    let mut multiline = false;
    for c in flags.chars() {
        let slot = match c {
            'g' => &mut global,
            'i' => &mut icase,
            'm' => &mut multiline,
            _ => {
                return Err(format!(
                    "Invalid regular expression flags: '{}'",
                    flags
                ))
            }
        };
        if *slot {
            return Err(format!("Invalid regular expression flags: '{}'", flags));
        }
        *slot = true;
    }
    let body = if source.is_empty() { "(?:)" } else { source };
    let mut pattern = String::new();
    if icase {
        pattern.push_str("(?i)");
    }
    if multiline {
        pattern.push_str("(?m)");
    }
    pattern.push_str(body);
    let matcher = regex::Regex::new(&pattern)
        .map_err(|e| format!("Invalid regular expression: {}", e))?;
    Ok(crate::instr::RegexpLiteral {
        source: JsString::from(source),
        flags: JsString::from(flags),
        global,
        matcher: Rc::new(matcher),
    })
}

/// Canonical array index: a string of decimal digits with no leading zero
/// (except "0") that fits in u32.
pub fn array_index(name: &JsString) -> Option<u32> {
    let s = name.as_ascii()?;
    if s.is_empty() || (s.len() > 1 && s.starts_with('0')) {
        return None;
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_order_is_preserved() {
        let o = JsObject::plain(None);
        o.put_value(&PropKey::str("b"), Value::Int(1));
        o.put_value(&PropKey::str("a"), Value::Int(2));
        o.put_value(&PropKey::str("b"), Value::Int(3));
        let keys: Vec<String> = o
            .own_enumerable_string_keys()
            .iter()
            .map(|k| k.to_std_string())
            .collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn prototype_chain_lookup() {
        let proto = JsObject::plain(None);
        proto.put_value(&PropKey::str("x"), Value::Int(7));
        let o = JsObject::plain(Some(proto));
        assert_eq!(
            o.lookup(&PropKey::str("x")).map(|p| p.value.strict_equals(&Value::Int(7))),
            Some(true)
        );
        assert!(o.get_own(&PropKey::str("x")).is_none());
    }

    #[test]
    fn array_length_tracks_writes() {
        let a = JsObject::array(None, vec![Value::Int(1)]);
        a.put_value(&PropKey::str("3"), Value::Int(4));
        assert_eq!(a.array_length(), Some(4));
        assert!(a.get_own(&PropKey::str("1")).is_none()); // hole
        a.put_value(&PropKey::str("length"), Value::Int(1));
        assert_eq!(a.array_length(), Some(1));
        assert!(a.get_own(&PropKey::str("3")).is_none());
    }

    #[test]
    fn delete_respects_configurable() {
        let o = JsObject::plain(None);
        o.define_own(
            PropKey::str("k"),
            Property::data_with(Value::Int(1), true, true, false),
        );
        assert!(!o.delete(&PropKey::str("k")));
        // Deleting an absent property succeeds and stays idempotent.
        assert!(o.delete(&PropKey::str("missing")));
        assert!(o.delete(&PropKey::str("missing")));
    }

    #[test]
    fn non_extensible_rejects_new_props() {
        let o = JsObject::plain(None);
        o.prevent_extensions();
        assert!(matches!(
            o.set_disposition(&PropKey::str("x")),
            SetDisposition::Reject
        ));
    }

    #[test]
    fn array_index_grammar() {
        assert_eq!(array_index(&JsString::from("0")), Some(0));
        assert_eq!(array_index(&JsString::from("42")), Some(42));
        assert_eq!(array_index(&JsString::from("01")), None);
        assert_eq!(array_index(&JsString::from("-1")), None);
        assert_eq!(array_index(&JsString::from("1.5")), None);
    }

    #[test]
    fn proto_cycles_are_rejected() {
        let a = JsObject::plain(None);
        let b = JsObject::plain(Some(a.clone()));
        assert!(!a.set_proto(Some(b)));
    }
}
