//! The standard global objects
//!
//! Installed into a fresh realm before any script runs. Coverage follows
//! what embedded scripts actually reach for: the global functions, the
//! core constructors with their prototypes, `Math`, `JSON` (via
//! serde_json), `RegExp` (via the regex crate), the error hierarchy, the
//! iteration protocol for arrays and strings, and `console.log`.

use crate::object::{
    build_regex, FuncKind, JsObject, NativeFunc, ObjectKind, PropKey, Property, RegexpData,
};
use crate::runtime::Realm;
use crate::value::{JsSymbol, Value};
use crate::vm::{Stash, Vm, VmFault};
use skiff_core::{number, JsString, SrcFile};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

type NativeResult = Result<Value, VmFault>;

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Undefined)
}

fn new_native(
    func_proto: &JsObject,
    name: &'static str,
    length: u32,
    func: crate::object::NativeFn,
    ctor: Option<crate::object::NativeFn>,
) -> JsObject {
    let obj = JsObject::new(
        Some(func_proto.clone()),
        "Function",
        ObjectKind::Function(FuncKind::Native(NativeFunc {
            name,
            length,
            func,
            ctor,
        })),
    );
    obj.define_own(
        PropKey::str("name"),
        Property::data_with(Value::str(name), false, false, true),
    );
    obj.define_own(
        PropKey::str("length"),
        Property::data_with(Value::Int(i64::from(length)), false, false, true),
    );
    obj
}

/// Define a non-enumerable method.
fn def_method(
    target: &JsObject,
    func_proto: &JsObject,
    name: &'static str,
    length: u32,
    func: crate::object::NativeFn,
) {
    let f = new_native(func_proto, name, length, func, None);
    target.define_own(
        PropKey::str(name),
        Property::data_with(Value::Object(f), true, false, true),
    );
}

fn def_value(target: &JsObject, name: &'static str, v: Value) {
    target.define_own(PropKey::str(name), Property::data_with(v, true, false, true));
}

fn def_frozen(target: &JsObject, name: &'static str, v: Value) {
    target.define_own(
        PropKey::str(name),
        Property::data_with(v, false, false, false),
    );
}

/// A constructor function wired to its prototype.
fn new_ctor(
    func_proto: &JsObject,
    name: &'static str,
    length: u32,
    func: crate::object::NativeFn,
    ctor: crate::object::NativeFn,
    proto: &JsObject,
) -> JsObject {
    let f = new_native(func_proto, name, length, func, Some(ctor));
    f.define_own(
        PropKey::str("prototype"),
        Property::data_with(Value::Object(proto.clone()), false, false, false),
    );
    proto.define_own(
        PropKey::str("constructor"),
        Property::data_with(Value::Object(f.clone()), true, false, true),
    );
    f
}

pub fn create_realm() -> Rc<Realm> {
    let object_proto = JsObject::plain(None);
    let func_proto = JsObject::new(
        Some(object_proto.clone()),
        "Function",
        ObjectKind::Function(FuncKind::Native(NativeFunc {
            name: "",
            length: 0,
            func: func_proto_call,
            ctor: None,
        })),
    );
    let array_proto = JsObject::array(Some(object_proto.clone()), Vec::new());
    let string_proto = JsObject::new(
        Some(object_proto.clone()),
        "String",
        ObjectKind::StringWrap(JsString::empty()),
    );
    let number_proto = JsObject::new(
        Some(object_proto.clone()),
        "Number",
        ObjectKind::NumberWrap(Value::Int(0)),
    );
    let boolean_proto = JsObject::new(
        Some(object_proto.clone()),
        "Boolean",
        ObjectKind::BoolWrap(false),
    );
    let symbol_proto = JsObject::new(Some(object_proto.clone()), "Symbol", ObjectKind::Plain);
    let regexp_proto = JsObject::new(Some(object_proto.clone()), "RegExp", ObjectKind::Plain);
    let error_proto = JsObject::new(Some(object_proto.clone()), "Error", ObjectKind::Plain);
    let type_error_proto = JsObject::new(Some(error_proto.clone()), "Error", ObjectKind::Plain);
    let range_error_proto = JsObject::new(Some(error_proto.clone()), "Error", ObjectKind::Plain);
    let reference_error_proto =
        JsObject::new(Some(error_proto.clone()), "Error", ObjectKind::Plain);
    let syntax_error_proto = JsObject::new(Some(error_proto.clone()), "Error", ObjectKind::Plain);
    let eval_error_proto = JsObject::new(Some(error_proto.clone()), "Error", ObjectKind::Plain);
    let array_iter_proto = JsObject::new(Some(object_proto.clone()), "Object", ObjectKind::Plain);
    let global = JsObject::new(Some(object_proto.clone()), "global", ObjectKind::Plain);
    let sym_iterator = JsSymbol::new(Some(JsString::from("Symbol.iterator")));
    let eval_fn = new_native(&func_proto, "eval", 1, global_eval, None);

    let global_stash = Rc::new(RefCell::new(Stash {
        values: Vec::new(),
        names: Some(HashMap::new()),
        obj: Some(global.clone()),
        outer: None,
        function: false,
    }));

    let realm = Rc::new(Realm {
        global,
        global_stash,
        object_proto,
        func_proto,
        array_proto,
        string_proto,
        number_proto,
        boolean_proto,
        symbol_proto,
        regexp_proto,
        error_proto,
        type_error_proto,
        range_error_proto,
        reference_error_proto,
        syntax_error_proto,
        eval_error_proto,
        array_iter_proto,
        sym_iterator,
        eval_fn,
    });
    install(&realm);
    realm
}

fn install(realm: &Realm) {
    let g = &realm.global;
    let fp = &realm.func_proto;

    // Value properties.
    def_frozen(g, "undefined", Value::Undefined);
    def_frozen(g, "NaN", Value::Float(f64::NAN));
    def_frozen(g, "Infinity", Value::Float(f64::INFINITY));
    def_value(g, "globalThis", Value::Object(g.clone()));

    // Global functions.
    g.define_own(
        PropKey::str("eval"),
        Property::data_with(Value::Object(realm.eval_fn.clone()), true, false, true),
    );
    def_method(g, fp, "isNaN", 1, global_is_nan);
    def_method(g, fp, "isFinite", 1, global_is_finite);
    def_method(g, fp, "parseInt", 2, global_parse_int);
    def_method(g, fp, "parseFloat", 1, global_parse_float);

    // Object.
    let object_ctor = new_ctor(fp, "Object", 1, object_call, object_call, &realm.object_proto);
    def_method(&object_ctor, fp, "keys", 1, object_keys);
    def_method(
        &object_ctor,
        fp,
        "getOwnPropertyNames",
        1,
        object_get_own_property_names,
    );
    def_method(&object_ctor, fp, "getPrototypeOf", 1, object_get_prototype_of);
    def_method(&object_ctor, fp, "create", 2, object_create);
    def_method(&object_ctor, fp, "defineProperty", 3, object_define_property);
    def_method(
        &object_ctor,
        fp,
        "preventExtensions",
        1,
        object_prevent_extensions,
    );
    def_value(g, "Object", Value::Object(object_ctor));
    def_method(&realm.object_proto, fp, "toString", 0, object_proto_to_string);
    def_method(
        &realm.object_proto,
        fp,
        "hasOwnProperty",
        1,
        object_proto_has_own,
    );
    def_method(&realm.object_proto, fp, "valueOf", 0, object_proto_value_of);

    // Function.prototype.
    def_method(fp, fp, "call", 1, func_proto_call_method);
    def_method(fp, fp, "apply", 2, func_proto_apply);
    def_method(fp, fp, "toString", 0, func_proto_to_string);

    // Array.
    let array_ctor = new_ctor(fp, "Array", 1, array_call, array_call, &realm.array_proto);
    def_method(&array_ctor, fp, "isArray", 1, array_is_array);
    def_value(g, "Array", Value::Object(array_ctor));
    let ap = &realm.array_proto;
    def_method(ap, fp, "push", 1, array_push);
    def_method(ap, fp, "pop", 0, array_pop);
    def_method(ap, fp, "join", 1, array_join);
    def_method(ap, fp, "indexOf", 1, array_index_of);
    def_method(ap, fp, "slice", 2, array_slice);
    def_method(ap, fp, "forEach", 1, array_for_each);
    def_method(ap, fp, "map", 1, array_map);
    def_method(ap, fp, "toString", 0, array_to_string);
    let values_fn = new_native(fp, "values", 0, array_values, None);
    ap.define_own(
        PropKey::Sym(realm.sym_iterator.clone()),
        Property::data_with(Value::Object(values_fn), true, false, true),
    );
    def_method(&realm.array_iter_proto, fp, "next", 0, array_iter_next);

    // String.
    let string_ctor = new_ctor(fp, "String", 1, string_call, string_construct, &realm.string_proto);
    def_method(&string_ctor, fp, "fromCharCode", 1, string_from_char_code);
    def_value(g, "String", Value::Object(string_ctor));
    let sp = &realm.string_proto;
    def_method(sp, fp, "toString", 0, string_proto_value_of);
    def_method(sp, fp, "valueOf", 0, string_proto_value_of);
    def_method(sp, fp, "charAt", 1, string_char_at);
    def_method(sp, fp, "charCodeAt", 1, string_char_code_at);
    def_method(sp, fp, "indexOf", 1, string_index_of);
    def_method(sp, fp, "slice", 2, string_slice);
    def_method(sp, fp, "substring", 2, string_substring);
    def_method(sp, fp, "toUpperCase", 0, string_to_upper);
    def_method(sp, fp, "toLowerCase", 0, string_to_lower);
    def_method(sp, fp, "split", 2, string_split);
    def_method(sp, fp, "trim", 0, string_trim);
    let str_iter = new_native(fp, "[Symbol.iterator]", 0, string_iterator, None);
    sp.define_own(
        PropKey::Sym(realm.sym_iterator.clone()),
        Property::data_with(Value::Object(str_iter), true, false, true),
    );

    // Number.
    let number_ctor = new_ctor(fp, "Number", 1, number_call, number_construct, &realm.number_proto);
    def_frozen(
        &number_ctor,
        "MAX_SAFE_INTEGER",
        Value::Int(9_007_199_254_740_991),
    );
    def_frozen(&number_ctor, "NaN", Value::Float(f64::NAN));
    def_value(g, "Number", Value::Object(number_ctor));
    let np = &realm.number_proto;
    def_method(np, fp, "toString", 1, number_to_string);
    def_method(np, fp, "toFixed", 1, number_to_fixed);
    def_method(np, fp, "valueOf", 0, number_value_of);

    // Boolean.
    let boolean_ctor = new_ctor(
        fp,
        "Boolean",
        1,
        boolean_call,
        boolean_construct,
        &realm.boolean_proto,
    );
    def_value(g, "Boolean", Value::Object(boolean_ctor));
    def_method(&realm.boolean_proto, fp, "toString", 0, boolean_to_string);
    def_method(&realm.boolean_proto, fp, "valueOf", 0, boolean_value_of);

    // Symbol.
    let symbol_ctor = new_native(fp, "Symbol", 0, symbol_call, None);
    symbol_ctor.define_own(
        PropKey::str("iterator"),
        Property::data_with(Value::Symbol(realm.sym_iterator.clone()), false, false, false),
    );
    symbol_ctor.define_own(
        PropKey::str("prototype"),
        Property::data_with(Value::Object(realm.symbol_proto.clone()), false, false, false),
    );
    def_value(g, "Symbol", Value::Object(symbol_ctor));
    def_method(&realm.symbol_proto, fp, "toString", 0, symbol_to_string);

    // Errors.
    let error_ctor = new_ctor(fp, "Error", 1, error_new, error_new, &realm.error_proto);
    def_value(&realm.error_proto, "name", Value::str("Error"));
    def_value(&realm.error_proto, "message", Value::str(""));
    def_method(&realm.error_proto, fp, "toString", 0, error_to_string);
    def_value(g, "Error", Value::Object(error_ctor));
    let pairs: [(&'static str, &JsObject, crate::object::NativeFn); 5] = [
        ("TypeError", &realm.type_error_proto, type_error_new),
        ("RangeError", &realm.range_error_proto, range_error_new),
        (
            "ReferenceError",
            &realm.reference_error_proto,
            reference_error_new,
        ),
        ("SyntaxError", &realm.syntax_error_proto, syntax_error_new),
        ("EvalError", &realm.eval_error_proto, eval_error_new),
    ];
    for (name, proto, ctor) in pairs {
        let c = new_ctor(fp, name, 1, ctor, ctor, proto);
        def_value(proto, "name", Value::str(name));
        def_value(g, name, Value::Object(c));
    }

    // Math.
    let math = JsObject::new(Some(realm.object_proto.clone()), "Math", ObjectKind::Plain);
    def_frozen(&math, "PI", Value::Float(std::f64::consts::PI));
    def_frozen(&math, "E", Value::Float(std::f64::consts::E));
    def_method(&math, fp, "floor", 1, math_floor);
    def_method(&math, fp, "ceil", 1, math_ceil);
    def_method(&math, fp, "round", 1, math_round);
    def_method(&math, fp, "trunc", 1, math_trunc);
    def_method(&math, fp, "abs", 1, math_abs);
    def_method(&math, fp, "sqrt", 1, math_sqrt);
    def_method(&math, fp, "pow", 2, math_pow);
    def_method(&math, fp, "max", 2, math_max);
    def_method(&math, fp, "min", 2, math_min);
    def_value(g, "Math", Value::Object(math));

    // JSON.
    let json = JsObject::new(Some(realm.object_proto.clone()), "JSON", ObjectKind::Plain);
    def_method(&json, fp, "parse", 2, json_parse);
    def_method(&json, fp, "stringify", 3, json_stringify);
    def_value(g, "JSON", Value::Object(json));

    // RegExp.
    let regexp_ctor = new_ctor(
        fp,
        "RegExp",
        2,
        regexp_construct,
        regexp_construct,
        &realm.regexp_proto,
    );
    def_value(g, "RegExp", Value::Object(regexp_ctor));
    let rp = &realm.regexp_proto;
    def_method(rp, fp, "test", 1, regexp_test);
    def_method(rp, fp, "exec", 1, regexp_exec);
    def_method(rp, fp, "toString", 0, regexp_to_string);

    // console.
    let console = JsObject::plain(Some(realm.object_proto.clone()));
    def_method(&console, fp, "log", 0, console_log);
    def_method(&console, fp, "error", 0, console_log);
    def_value(g, "console", Value::Object(console));
}

// ----------------------------------------------------------------------
// Global functions
// ----------------------------------------------------------------------

/// Indirect eval: always global scope, always sloppy at entry.
fn global_eval(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let src = match args.first() {
        Some(Value::Str(s)) => s.clone(),
        Some(v) => return Ok(v.clone()),
        None => return Ok(Value::Undefined),
    };
    let realm = vm.realm.clone();
    let file = SrcFile::new("<eval>", src.to_std_string());
    let prg = match crate::compiler::compile_global(&file, &realm) {
        Ok(prg) => prg,
        Err(e) => return Err(vm.syntax_error(e.message)),
    };
    vm.run_script(prg)
}

fn global_is_nan(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let n = vm.to_number_value(&arg(args, 0))?;
    Ok(Value::Bool(n.is_nan()))
}

fn global_is_finite(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let n = vm.to_number_value(&arg(args, 0))?;
    Ok(Value::Bool(n.is_finite()))
}

fn global_parse_int(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let s = vm.to_string_value(&arg(args, 0))?;
    let radix = match args.get(1) {
        None | Some(Value::Undefined) => 0,
        Some(r) => vm.to_int32_value(r)? as u32,
    };
    Ok(Value::number(number::parse_int(&s.to_std_string(), radix)))
}

fn global_parse_float(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let s = vm.to_string_value(&arg(args, 0))?;
    let t = s.to_std_string();
    let t = t.trim_matches(|c: char| c.is_whitespace() || c == '\u{feff}');
    // Longest prefix matching the float grammar.
    let b = t.as_bytes();
    let mut i = 0;
    if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
        i += 1;
    }
    if t[i..].starts_with("Infinity") {
        let v = if b.first() == Some(&b'-') {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
        return Ok(Value::Float(v));
    }
    let digits_start = i;
    while i < b.len() && b[i].is_ascii_digit() {
        i += 1;
    }
    if i < b.len() && b[i] == b'.' {
        i += 1;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i == digits_start {
        return Ok(Value::Float(f64::NAN));
    }
    if i < b.len() && (b[i] == b'e' || b[i] == b'E') {
        let mut j = i + 1;
        if j < b.len() && (b[j] == b'+' || b[j] == b'-') {
            j += 1;
        }
        if j < b.len() && b[j].is_ascii_digit() {
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    Ok(match t[..i].parse::<f64>() {
        Ok(v) => Value::number(v),
        Err(_) => Value::Float(f64::NAN),
    })
}

// ----------------------------------------------------------------------
// Object
// ----------------------------------------------------------------------

fn object_call(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    match args.first() {
        None | Some(Value::Undefined) | Some(Value::Null) => Ok(Value::Object(JsObject::plain(
            Some(vm.realm.object_proto.clone()),
        ))),
        Some(v) => Ok(Value::Object(vm.to_object(v.clone())?)),
    }
}

fn object_keys(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let o = vm.to_object(arg(args, 0))?;
    let keys: Vec<Value> = o
        .own_enumerable_string_keys()
        .into_iter()
        .map(Value::Str)
        .collect();
    Ok(Value::Object(JsObject::array(
        Some(vm.realm.array_proto.clone()),
        keys,
    )))
}

fn object_get_own_property_names(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let o = vm.to_object(arg(args, 0))?;
    let keys: Vec<Value> = o.own_string_keys().into_iter().map(Value::Str).collect();
    Ok(Value::Object(JsObject::array(
        Some(vm.realm.array_proto.clone()),
        keys,
    )))
}

fn object_get_prototype_of(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let o = vm.to_object(arg(args, 0))?;
    Ok(match o.proto() {
        Some(p) => Value::Object(p),
        None => Value::Null,
    })
}

fn object_create(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let proto = match arg(args, 0) {
        Value::Object(p) => Some(p),
        Value::Null => None,
        _ => return Err(vm.type_error("Object prototype may only be an Object or null")),
    };
    Ok(Value::Object(JsObject::plain(proto)))
}

fn object_define_property(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let target = match arg(args, 0) {
        Value::Object(o) => o,
        _ => return Err(vm.type_error("Object.defineProperty called on non-object")),
    };
    let key = vm.to_property_key(arg(args, 1))?;
    let desc = match arg(args, 2) {
        Value::Object(d) => d,
        _ => return Err(vm.type_error("Property description must be an object")),
    };
    let read = |vm: &mut Vm, name: &str| -> Result<Option<Value>, VmFault> {
        let k = PropKey::str(name);
        if desc.has_property(&k) {
            Ok(Some(vm.get_prop_value(&Value::Object(desc.clone()), &k)?))
        } else {
            Ok(None)
        }
    };
    let getter = read(vm, "get")?;
    let setter = read(vm, "set")?;
    let prop = if getter.is_some() || setter.is_some() {
        let as_fn = |vm: &mut Vm, v: Option<Value>| -> Result<Option<JsObject>, VmFault> {
            match v {
                None | Some(Value::Undefined) => Ok(None),
                Some(Value::Object(f)) if f.is_callable() => Ok(Some(f)),
                _ => Err(vm.type_error("Getter/setter must be callable")),
            }
        };
        let mut p = Property::accessor(as_fn(vm, getter)?, as_fn(vm, setter)?);
        p.enumerable = read(vm, "enumerable")?.map(|v| v.to_boolean()).unwrap_or(false);
        p.configurable = read(vm, "configurable")?
            .map(|v| v.to_boolean())
            .unwrap_or(false);
        p
    } else {
        Property {
            value: read(vm, "value")?.unwrap_or(Value::Undefined),
            getter: None,
            setter: None,
            accessor: false,
            writable: read(vm, "writable")?.map(|v| v.to_boolean()).unwrap_or(false),
            enumerable: read(vm, "enumerable")?.map(|v| v.to_boolean()).unwrap_or(false),
            configurable: read(vm, "configurable")?
                .map(|v| v.to_boolean())
                .unwrap_or(false),
        }
    };
    if !target.define_own(key, prop) {
        return Err(vm.type_error("Cannot redefine property"));
    }
    Ok(Value::Object(target))
}

fn object_prevent_extensions(_vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    if let Value::Object(o) = arg(args, 0) {
        o.prevent_extensions();
        return Ok(Value::Object(o));
    }
    Ok(arg(args, 0))
}

fn object_proto_to_string(_vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    let tag = match this {
        Value::Undefined | Value::Empty => "Undefined",
        Value::Null => "Null",
        Value::Object(o) => o.class(),
        Value::Str(_) => "String",
        Value::Bool(_) => "Boolean",
        Value::Int(_) | Value::Float(_) => "Number",
        Value::Symbol(_) => "Symbol",
        Value::Unresolved(_) => "Undefined",
    };
    Ok(Value::str(format!("[object {}]", tag)))
}

fn object_proto_has_own(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let key = vm.to_property_key(arg(args, 0))?;
    let o = vm.to_object(this.clone())?;
    Ok(Value::Bool(o.has_own(&key)))
}

fn object_proto_value_of(vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Object(vm.to_object(this.clone())?))
}

// ----------------------------------------------------------------------
// Function.prototype
// ----------------------------------------------------------------------

fn func_proto_call(_vm: &mut Vm, _this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Undefined)
}

fn func_proto_call_method(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let call_args = if args.is_empty() { &[] } else { &args[1..] };
    vm.call_function(this.clone(), arg(args, 0), call_args)
}

fn func_proto_apply(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let list = match args.get(1) {
        None | Some(Value::Undefined) | Some(Value::Null) => Vec::new(),
        Some(Value::Object(o)) => {
            let length_value = vm.get_prop_value(&Value::Object(o.clone()), &PropKey::str("length"))?;
            let len = vm.to_uint32_value(&length_value)?;
            let mut out = Vec::with_capacity(len as usize);
            for i in 0..len {
                out.push(vm.get_prop_value(
                    &Value::Object(o.clone()),
                    &PropKey::str(i.to_string()),
                )?);
            }
            out
        }
        Some(_) => return Err(vm.type_error("CreateListFromArrayLike called on non-object")),
    };
    vm.call_function(this.clone(), arg(args, 0), &list)
}

fn func_proto_to_string(vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    match this.as_object() {
        Some(o) if o.is_callable() => {
            let name = o
                .get_own(&PropKey::str("name"))
                .and_then(|p| p.value.primitive_to_string())
                .unwrap_or_else(JsString::empty);
            Ok(Value::str(format!("function {}() {{ [native code] }}", name)))
        }
        _ => Err(vm.type_error("Function.prototype.toString requires a function")),
    }
}

// ----------------------------------------------------------------------
// Array
// ----------------------------------------------------------------------

fn array_call(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    if args.len() == 1 {
        if let Some(n) = args[0].number_value() {
            let len = n as u32;
            if f64::from(len) != n {
                return Err(vm.range_error("Invalid array length"));
            }
            let arr = JsObject::array(Some(vm.realm.array_proto.clone()), Vec::new());
            arr.with_kind_mut(|k| {
                if let ObjectKind::Array(a) = k {
                    a.length = len;
                }
            });
            return Ok(Value::Object(arr));
        }
    }
    Ok(Value::Object(JsObject::array(
        Some(vm.realm.array_proto.clone()),
        args.to_vec(),
    )))
}

fn array_is_array(_vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let is = matches!(arg(args, 0).as_object().map(|o| o.array_length()), Some(Some(_)));
    Ok(Value::Bool(is))
}

fn array_like_length(vm: &mut Vm, o: &JsObject) -> Result<u32, VmFault> {
    let len = vm.get_prop_value(&Value::Object(o.clone()), &PropKey::str("length"))?;
    vm.to_uint32_value(&len)
}

fn array_push(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let o = vm.to_object(this.clone())?;
    let mut len = array_like_length(vm, &o)?;
    for v in args {
        vm.set_prop_value(
            &Value::Object(o.clone()),
            &PropKey::str(len.to_string()),
            v.clone(),
            false,
        )?;
        len += 1;
    }
    vm.set_prop_value(
        &Value::Object(o.clone()),
        &PropKey::str("length"),
        Value::Int(i64::from(len)),
        false,
    )?;
    Ok(Value::Int(i64::from(len)))
}

fn array_pop(vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    let o = vm.to_object(this.clone())?;
    let len = array_like_length(vm, &o)?;
    if len == 0 {
        return Ok(Value::Undefined);
    }
    let key = PropKey::str((len - 1).to_string());
    let v = vm.get_prop_value(&Value::Object(o.clone()), &key)?;
    o.delete(&key);
    vm.set_prop_value(
        &Value::Object(o),
        &PropKey::str("length"),
        Value::Int(i64::from(len - 1)),
        false,
    )?;
    Ok(v)
}

fn array_join(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let o = vm.to_object(this.clone())?;
    let len = array_like_length(vm, &o)?;
    let sep = match args.first() {
        None | Some(Value::Undefined) => JsString::from(","),
        Some(v) => vm.to_string_value(v)?,
    };
    let mut out = JsString::empty();
    for i in 0..len {
        if i > 0 {
            out = out.concat(&sep);
        }
        let v = vm.get_prop_value(&Value::Object(o.clone()), &PropKey::str(i.to_string()))?;
        if !v.is_nullish() && !v.is_empty() {
            out = out.concat(&vm.to_string_value(&v)?);
        }
    }
    Ok(Value::Str(out))
}

fn array_to_string(vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    array_join(vm, this, &[])
}

fn array_index_of(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let o = vm.to_object(this.clone())?;
    let len = array_like_length(vm, &o)?;
    let needle = arg(args, 0);
    let from = match args.get(1) {
        Some(v) => vm.to_int32_value(v)?.max(0) as u32,
        None => 0,
    };
    for i in from..len {
        let v = vm.get_prop_value(&Value::Object(o.clone()), &PropKey::str(i.to_string()))?;
        if v.strict_equals(&needle) {
            return Ok(Value::Int(i64::from(i)));
        }
    }
    Ok(Value::Int(-1))
}

fn clamp_index(v: i64, len: u32) -> u32 {
    if v < 0 {
        (i64::from(len) + v).max(0) as u32
    } else {
        (v as u64).min(u64::from(len)) as u32
    }
}

fn array_slice(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let o = vm.to_object(this.clone())?;
    let len = array_like_length(vm, &o)?;
    let start = match args.first() {
        None | Some(Value::Undefined) => 0,
        Some(v) => clamp_index(vm.to_number_value(v)? as i64, len),
    };
    let end = match args.get(1) {
        None | Some(Value::Undefined) => len,
        Some(v) => clamp_index(vm.to_number_value(v)? as i64, len),
    };
    let mut out = Vec::new();
    for i in start..end.max(start) {
        out.push(vm.get_prop_value(&Value::Object(o.clone()), &PropKey::str(i.to_string()))?);
    }
    Ok(Value::Object(JsObject::array(
        Some(vm.realm.array_proto.clone()),
        out,
    )))
}

fn array_for_each(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let o = vm.to_object(this.clone())?;
    let len = array_like_length(vm, &o)?;
    let cb = arg(args, 0);
    let this_arg = arg(args, 1);
    for i in 0..len {
        let key = PropKey::str(i.to_string());
        if o.has_property(&key) {
            let v = vm.get_prop_value(&Value::Object(o.clone()), &key)?;
            vm.call_function(
                cb.clone(),
                this_arg.clone(),
                &[v, Value::Int(i64::from(i)), Value::Object(o.clone())],
            )?;
        }
    }
    Ok(Value::Undefined)
}

fn array_map(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let o = vm.to_object(this.clone())?;
    let len = array_like_length(vm, &o)?;
    let cb = arg(args, 0);
    let this_arg = arg(args, 1);
    let mut out = vec![Value::Empty; len as usize];
    for i in 0..len {
        let key = PropKey::str(i.to_string());
        if o.has_property(&key) {
            let v = vm.get_prop_value(&Value::Object(o.clone()), &key)?;
            out[i as usize] = vm.call_function(
                cb.clone(),
                this_arg.clone(),
                &[v, Value::Int(i64::from(i)), Value::Object(o.clone())],
            )?;
        }
    }
    Ok(Value::Object(JsObject::array(
        Some(vm.realm.array_proto.clone()),
        out,
    )))
}

fn array_values(vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Object(vm.new_array_iter(this.clone())))
}

fn string_iterator(vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    let s = this_string(vm, this)?;
    Ok(Value::Object(vm.new_array_iter(Value::Str(s))))
}

fn array_iter_next(vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    let iter = match this.as_object() {
        Some(o) => o.clone(),
        None => return Err(vm.type_error("next called on a non-iterator")),
    };
    let state = iter.with_kind(|k| match k {
        ObjectKind::ArrayIter(it) => Some((it.target.clone(), it.index, it.done)),
        _ => None,
    });
    let (target, index, done) = match state {
        Some(s) => s,
        None => return Err(vm.type_error("next called on a non-iterator")),
    };
    let result = JsObject::plain(Some(vm.realm.object_proto.clone()));
    if done {
        result.put_value(&PropKey::str("done"), Value::Bool(true));
        result.put_value(&PropKey::str("value"), Value::Undefined);
        return Ok(Value::Object(result));
    }
    let len = match &target {
        Value::Str(s) => s.len() as u32,
        Value::Object(o) => array_like_length(vm, &o.clone())?,
        _ => 0,
    };
    if index >= len {
        iter.with_kind_mut(|k| {
            if let ObjectKind::ArrayIter(it) = k {
                it.done = true;
            }
        });
        result.put_value(&PropKey::str("done"), Value::Bool(true));
        result.put_value(&PropKey::str("value"), Value::Undefined);
        return Ok(Value::Object(result));
    }
    let value = match &target {
        Value::Str(s) => Value::Str(s.substring(index as usize, index as usize + 1)),
        other => vm.get_prop_value(other, &PropKey::str(index.to_string()))?,
    };
    iter.with_kind_mut(|k| {
        if let ObjectKind::ArrayIter(it) = k {
            it.index = index + 1;
        }
    });
    result.put_value(&PropKey::str("done"), Value::Bool(false));
    result.put_value(&PropKey::str("value"), value);
    Ok(Value::Object(result))
}

// ----------------------------------------------------------------------
// String
// ----------------------------------------------------------------------

fn this_string(vm: &mut Vm, this: &Value) -> Result<JsString, VmFault> {
    match this {
        Value::Str(s) => Ok(s.clone()),
        Value::Object(o) => {
            let s = o.with_kind(|k| match k {
                ObjectKind::StringWrap(s) => Some(s.clone()),
                _ => None,
            });
            match s {
                Some(s) => Ok(s),
                None => vm.to_string_value(this),
            }
        }
        other => vm.to_string_value(other),
    }
}

fn string_call(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    match args.first() {
        None => Ok(Value::Str(JsString::empty())),
        Some(Value::Symbol(s)) => Ok(Value::str(format!(
            "Symbol({})",
            s.description().map(|d| d.to_std_string()).unwrap_or_default()
        ))),
        Some(v) => Ok(Value::Str(vm.to_string_value(v)?)),
    }
}

fn string_construct(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let s = match args.first() {
        None => JsString::empty(),
        Some(v) => vm.to_string_value(v)?,
    };
    Ok(Value::Object(JsObject::new(
        Some(vm.realm.string_proto.clone()),
        "String",
        ObjectKind::StringWrap(s),
    )))
}

fn string_from_char_code(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let mut units = Vec::with_capacity(args.len());
    for a in args {
        units.push(vm.to_uint32_value(a)? as u16);
    }
    Ok(Value::Str(JsString::from_utf16(units)))
}

fn string_proto_value_of(vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    match this {
        Value::Str(s) => Ok(Value::Str(s.clone())),
        Value::Object(o) => {
            let s = o.with_kind(|k| match k {
                ObjectKind::StringWrap(s) => Some(s.clone()),
                _ => None,
            });
            match s {
                Some(s) => Ok(Value::Str(s)),
                None => Err(vm.type_error("String.prototype.valueOf requires a string")),
            }
        }
        _ => Err(vm.type_error("String.prototype.valueOf requires a string")),
    }
}

fn string_char_at(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let s = this_string(vm, this)?;
    let i = vm.to_int32_value(&arg(args, 0))?;
    if i < 0 || i as usize >= s.len() {
        return Ok(Value::Str(JsString::empty()));
    }
    Ok(Value::Str(s.substring(i as usize, i as usize + 1)))
}

fn string_char_code_at(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let s = this_string(vm, this)?;
    let i = vm.to_int32_value(&arg(args, 0))?;
    match s.char_code_at(i.max(0) as usize) {
        Some(u) if i >= 0 => Ok(Value::Int(i64::from(u))),
        _ => Ok(Value::Float(f64::NAN)),
    }
}

fn string_index_of(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let s = this_string(vm, this)?;
    let needle = vm.to_string_value(&arg(args, 0))?;
    let from = match args.get(1) {
        Some(v) => vm.to_int32_value(v)?.max(0) as usize,
        None => 0,
    };
    Ok(match s.index_of(&needle, from) {
        Some(i) => Value::Int(i as i64),
        None => Value::Int(-1),
    })
}

fn string_slice(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let s = this_string(vm, this)?;
    let len = s.len() as u32;
    let start = match args.first() {
        None | Some(Value::Undefined) => 0,
        Some(v) => clamp_index(vm.to_number_value(v)? as i64, len),
    };
    let end = match args.get(1) {
        None | Some(Value::Undefined) => len,
        Some(v) => clamp_index(vm.to_number_value(v)? as i64, len),
    };
    Ok(Value::Str(s.substring(start as usize, end.max(start) as usize)))
}

fn string_substring(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let s = this_string(vm, this)?;
    let len = s.len() as u32;
    let to_idx = |vm: &mut Vm, v: Option<&Value>, default: u32| -> Result<u32, VmFault> {
        match v {
            None | Some(Value::Undefined) => Ok(default),
            Some(v) => {
                let n = vm.to_number_value(v)?;
                if n.is_nan() || n < 0.0 {
                    Ok(0)
                } else {
                    Ok((n as u64).min(u64::from(len)) as u32)
                }
            }
        }
    };
    let a = to_idx(vm, args.first(), 0)?;
    let b = to_idx(vm, args.get(1), len)?;
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    Ok(Value::Str(s.substring(lo as usize, hi as usize)))
}

fn string_to_upper(vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    let s = this_string(vm, this)?;
    Ok(Value::str(s.to_std_string().to_uppercase()))
}

fn string_to_lower(vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    let s = this_string(vm, this)?;
    Ok(Value::str(s.to_std_string().to_lowercase()))
}

fn string_trim(vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    let s = this_string(vm, this)?;
    Ok(Value::str(
        s.to_std_string()
            .trim_matches(|c: char| c.is_whitespace() || c == '\u{feff}')
            .to_string(),
    ))
}

fn string_split(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let s = this_string(vm, this)?;
    let limit = match args.get(1) {
        None | Some(Value::Undefined) => u32::MAX,
        Some(v) => vm.to_uint32_value(v)?,
    };
    let parts: Vec<Value> = match args.first() {
        None | Some(Value::Undefined) => vec![Value::Str(s)],
        Some(sep) => {
            let sep = vm.to_string_value(sep)?;
            let hay = s.to_std_string();
            if sep.is_empty() {
                hay.chars()
                    .map(|c| Value::str(c.to_string()))
                    .collect()
            } else {
                hay.split(sep.to_std_string().as_str())
                    .map(Value::str)
                    .collect()
            }
        }
    };
    let parts: Vec<Value> = parts.into_iter().take(limit as usize).collect();
    Ok(Value::Object(JsObject::array(
        Some(vm.realm.array_proto.clone()),
        parts,
    )))
}

// ----------------------------------------------------------------------
// Number / Boolean / Symbol
// ----------------------------------------------------------------------

fn this_number(vm: &mut Vm, this: &Value) -> Result<f64, VmFault> {
    match this {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        Value::Object(o) => {
            let n = o.with_kind(|k| match k {
                ObjectKind::NumberWrap(v) => v.number_value(),
                _ => None,
            });
            match n {
                Some(n) => Ok(n),
                None => Err(vm.type_error("Number method called on an incompatible receiver")),
            }
        }
        _ => Err(vm.type_error("Number method called on an incompatible receiver")),
    }
}

fn number_call(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    match args.first() {
        None => Ok(Value::Int(0)),
        Some(v) => {
            let n = vm.to_number_value(v)?;
            Ok(match v {
                Value::Int(i) => Value::Int(*i),
                _ => Value::number(n),
            })
        }
    }
}

fn number_construct(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let v = number_call(vm, &Value::Undefined, args)?;
    Ok(Value::Object(JsObject::new(
        Some(vm.realm.number_proto.clone()),
        "Number",
        ObjectKind::NumberWrap(v),
    )))
}

fn number_to_string(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let n = this_number(vm, this)?;
    let radix = match args.first() {
        None | Some(Value::Undefined) => 10,
        Some(v) => {
            let r = vm.to_number_value(v)?;
            let r = r.trunc();
            if !(2.0..=36.0).contains(&r) {
                return Err(vm.range_error("toString() radix must be between 2 and 36"));
            }
            r as u32
        }
    };
    Ok(Value::str(if radix == 10 {
        number::format_f64(n)
    } else {
        number::format_radix(n, radix)
    }))
}

fn number_to_fixed(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let n = this_number(vm, this)?;
    let digits = match args.first() {
        None | Some(Value::Undefined) => 0.0,
        Some(v) => vm.to_number_value(v)?.trunc(),
    };
    if !(0.0..=100.0).contains(&digits) {
        return Err(vm.range_error("toFixed() digits argument must be between 0 and 100"));
    }
    Ok(Value::str(number::to_fixed(n, digits as usize)))
}

fn number_value_of(vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    let n = this_number(vm, this)?;
    Ok(match this {
        Value::Int(i) => Value::Int(*i),
        _ => Value::number(n),
    })
}

fn this_bool(vm: &mut Vm, this: &Value) -> Result<bool, VmFault> {
    match this {
        Value::Bool(b) => Ok(*b),
        Value::Object(o) => {
            let b = o.with_kind(|k| match k {
                ObjectKind::BoolWrap(b) => Some(*b),
                _ => None,
            });
            match b {
                Some(b) => Ok(b),
                None => Err(vm.type_error("Boolean method called on an incompatible receiver")),
            }
        }
        _ => Err(vm.type_error("Boolean method called on an incompatible receiver")),
    }
}

fn boolean_call(_vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    Ok(Value::Bool(arg(args, 0).to_boolean()))
}

fn boolean_construct(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    Ok(Value::Object(JsObject::new(
        Some(vm.realm.boolean_proto.clone()),
        "Boolean",
        ObjectKind::BoolWrap(arg(args, 0).to_boolean()),
    )))
}

fn boolean_to_string(vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    let b = this_bool(vm, this)?;
    Ok(Value::str(if b { "true" } else { "false" }))
}

fn boolean_value_of(vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Bool(this_bool(vm, this)?))
}

fn symbol_call(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let description = match args.first() {
        None | Some(Value::Undefined) => None,
        Some(v) => Some(vm.to_string_value(v)?),
    };
    Ok(Value::Symbol(JsSymbol::new(description)))
}

fn symbol_to_string(vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    match this {
        Value::Symbol(s) => Ok(Value::str(format!(
            "Symbol({})",
            s.description().map(|d| d.to_std_string()).unwrap_or_default()
        ))),
        _ => Err(vm.type_error("Symbol.prototype.toString requires a symbol")),
    }
}

// ----------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------

macro_rules! error_ctor_fn {
    ($fname:ident, $proto:ident) => {
        fn $fname(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
            let proto = vm.realm.$proto.clone();
            let obj = JsObject::new(Some(proto), "Error", ObjectKind::Plain);
            if let Some(msg) = args.first() {
                if !msg.is_undefined() {
                    let s = vm.to_string_value(msg)?;
                    obj.define_own(
                        PropKey::str("message"),
                        Property::data_with(Value::Str(s), true, false, true),
                    );
                }
            }
            Ok(Value::Object(obj))
        }
    };
}

error_ctor_fn!(error_new, error_proto);
error_ctor_fn!(type_error_new, type_error_proto);
error_ctor_fn!(range_error_new, range_error_proto);
error_ctor_fn!(reference_error_new, reference_error_proto);
error_ctor_fn!(syntax_error_new, syntax_error_proto);
error_ctor_fn!(eval_error_new, eval_error_proto);

fn error_to_string(vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    let o = match this.as_object() {
        Some(o) => o.clone(),
        None => return Err(vm.type_error("Error.prototype.toString requires an object")),
    };
    let name = vm
        .get_prop_value(&Value::Object(o.clone()), &PropKey::str("name"))?
        .primitive_to_string()
        .unwrap_or_else(|| JsString::from("Error"));
    let message = vm
        .get_prop_value(&Value::Object(o), &PropKey::str("message"))?
        .primitive_to_string()
        .unwrap_or_else(JsString::empty);
    Ok(Value::Str(if message.is_empty() {
        name
    } else {
        name.concat(&JsString::from(": ")).concat(&message)
    }))
}

// ----------------------------------------------------------------------
// Math
// ----------------------------------------------------------------------

macro_rules! math_unary {
    ($fname:ident, $op:expr) => {
        fn $fname(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
            let n = vm.to_number_value(&arg(args, 0))?;
            let f: fn(f64) -> f64 = $op;
            Ok(Value::number(f(n)))
        }
    };
}

math_unary!(math_floor, f64::floor);
math_unary!(math_ceil, f64::ceil);
math_unary!(math_trunc, f64::trunc);
math_unary!(math_abs, f64::abs);
math_unary!(math_sqrt, f64::sqrt);

fn math_round(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let n = vm.to_number_value(&arg(args, 0))?;
    // Half-up, including for negatives: round(-2.5) is -2.
    Ok(Value::number((n + 0.5).floor()))
}

fn math_pow(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let a = vm.to_number_value(&arg(args, 0))?;
    let b = vm.to_number_value(&arg(args, 1))?;
    Ok(Value::number(a.powf(b)))
}

fn math_max(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let mut best = f64::NEG_INFINITY;
    for a in args {
        let n = vm.to_number_value(a)?;
        if n.is_nan() {
            return Ok(Value::Float(f64::NAN));
        }
        if n > best {
            best = n;
        }
    }
    Ok(Value::number(best))
}

fn math_min(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let mut best = f64::INFINITY;
    for a in args {
        let n = vm.to_number_value(a)?;
        if n.is_nan() {
            return Ok(Value::Float(f64::NAN));
        }
        if n < best {
            best = n;
        }
    }
    Ok(Value::number(best))
}

// ----------------------------------------------------------------------
// JSON
// ----------------------------------------------------------------------

/// Import a JSON document as script values.
pub fn json_to_value(vm: &mut Vm, j: &serde_json::Value) -> Value {
    match j {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::str(s.as_str()),
        serde_json::Value::Array(items) => {
            let elems: Vec<Value> = items.iter().map(|i| json_to_value(vm, i)).collect();
            Value::Object(JsObject::array(Some(vm.realm.array_proto.clone()), elems))
        }
        serde_json::Value::Object(map) => {
            let obj = JsObject::plain(Some(vm.realm.object_proto.clone()));
            for (k, v) in map {
                let val = json_to_value(vm, v);
                obj.put_value(&PropKey::str(k.as_str()), val);
            }
            Value::Object(obj)
        }
    }
}

/// Export a script value as JSON. `None` means unrepresentable (undefined,
/// functions, symbols); in objects such members are skipped, in arrays
/// they become null.
pub fn value_to_json(
    vm: &mut Vm,
    v: &Value,
    seen: &mut Vec<JsObject>,
) -> Result<Option<serde_json::Value>, VmFault> {
    Ok(Some(match v {
        Value::Undefined | Value::Empty | Value::Symbol(_) | Value::Unresolved(_) => {
            return Ok(None)
        }
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => {
            if f.is_finite() {
                serde_json::Number::from_f64(*f)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            } else {
                serde_json::Value::Null
            }
        }
        Value::Str(s) => serde_json::Value::String(s.to_std_string()),
        Value::Object(o) => {
            if o.is_callable() {
                return Ok(None);
            }
            if seen.iter().any(|s| s.same(o)) {
                return Err(vm.type_error("Converting circular structure to JSON"));
            }
            seen.push(o.clone());
            let result = if let Some(len) = o.array_length() {
                let mut items = Vec::with_capacity(len as usize);
                for i in 0..len {
                    let item =
                        vm.get_prop_value(&Value::Object(o.clone()), &PropKey::str(i.to_string()))?;
                    items.push(
                        value_to_json(vm, &item, seen)?.unwrap_or(serde_json::Value::Null),
                    );
                }
                serde_json::Value::Array(items)
            } else {
                let mut map = serde_json::Map::new();
                for key in o.own_enumerable_string_keys() {
                    let item = vm.get_prop_value(
                        &Value::Object(o.clone()),
                        &PropKey::Str(key.clone()),
                    )?;
                    if let Some(j) = value_to_json(vm, &item, seen)? {
                        map.insert(key.to_std_string(), j);
                    }
                }
                serde_json::Value::Object(map)
            };
            seen.pop();
            result
        }
    }))
}

fn json_parse(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let text = vm.to_string_value(&arg(args, 0))?;
    match serde_json::from_str::<serde_json::Value>(&text.to_std_string()) {
        Ok(j) => Ok(json_to_value(vm, &j)),
        Err(e) => Err(vm.syntax_error(format!("Unexpected token in JSON: {}", e))),
    }
}

fn json_stringify(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let v = arg(args, 0);
    let pretty = match args.get(2) {
        Some(space) => vm.to_number_value(space).map(|n| n > 0.0).unwrap_or(false),
        None => false,
    };
    match value_to_json(vm, &v, &mut Vec::new())? {
        None => Ok(Value::Undefined),
        Some(j) => {
            let text = if pretty {
                serde_json::to_string_pretty(&j)
            } else {
                serde_json::to_string(&j)
            };
            match text {
                Ok(t) => Ok(Value::str(t)),
                Err(e) => Err(vm.type_error(format!("JSON.stringify failed: {}", e))),
            }
        }
    }
}

// ----------------------------------------------------------------------
// RegExp
// ----------------------------------------------------------------------

fn regexp_construct(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let (source, flags) = match args.first() {
        Some(Value::Object(o)) => {
            let data = o.with_kind(|k| match k {
                ObjectKind::Regexp(r) => Some((r.source.clone(), r.flags.clone())),
                _ => None,
            });
            match data {
                Some((s, f)) => (s.to_std_string(), f.to_std_string()),
                None => (vm.to_string_value(&arg(args, 0))?.to_std_string(), String::new()),
            }
        }
        None | Some(Value::Undefined) => (String::new(), String::new()),
        Some(v) => (vm.to_string_value(v)?.to_std_string(), String::new()),
    };
    let flags = match args.get(1) {
        None | Some(Value::Undefined) => flags,
        Some(v) => vm.to_string_value(v)?.to_std_string(),
    };
    let lit = match build_regex(&source, &flags) {
        Ok(lit) => lit,
        Err(msg) => return Err(vm.syntax_error(msg)),
    };
    Ok(Value::Object(JsObject::new(
        Some(vm.realm.regexp_proto.clone()),
        "RegExp",
        ObjectKind::Regexp(RegexpData {
            source: lit.source,
            flags: lit.flags,
            global: lit.global,
            matcher: lit.matcher,
            last_index: 0,
        }),
    )))
}

fn this_regexp(vm: &mut Vm, this: &Value) -> Result<JsObject, VmFault> {
    match this.as_object() {
        Some(o) if o.with_kind(|k| matches!(k, ObjectKind::Regexp(_))) => Ok(o.clone()),
        _ => Err(vm.type_error("RegExp method called on an incompatible receiver")),
    }
}

fn regexp_test(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let result = regexp_exec(vm, this, args)?;
    Ok(Value::Bool(!matches!(result, Value::Null)))
}

fn regexp_exec(vm: &mut Vm, this: &Value, args: &[Value]) -> NativeResult {
    let re = this_regexp(vm, this)?;
    let input = vm.to_string_value(&arg(args, 0))?;
    let hay = input.to_std_string();
    let (matcher, global, start) = re.with_kind(|k| match k {
        ObjectKind::Regexp(r) => (
            Rc::clone(&r.matcher),
            r.global,
            r.last_index as usize,
        ),
        _ => unreachable!("receiver checked"),
    });
    let start = if global { start.min(hay.len()) } else { 0 };
    let caps = matcher.captures_at(&hay, start);
    let caps = match caps {
        Some(c) => c,
        None => {
            if global {
                re.with_kind_mut(|k| {
                    if let ObjectKind::Regexp(r) = k {
                        r.last_index = 0;
                    }
                });
            }
            return Ok(Value::Null);
        }
    };
    let full = caps.get(0).expect("capture 0 always present");
    if global {
        re.with_kind_mut(|k| {
            if let ObjectKind::Regexp(r) = k {
                r.last_index = full.end() as u32;
            }
        });
    }
    let mut groups = Vec::with_capacity(caps.len());
    for i in 0..caps.len() {
        groups.push(match caps.get(i) {
            Some(m) => Value::str(m.as_str()),
            None => Value::Undefined,
        });
    }
    let arr = JsObject::array(Some(vm.realm.array_proto.clone()), groups);
    arr.put_value(&PropKey::str("index"), Value::Int(full.start() as i64));
    arr.put_value(&PropKey::str("input"), Value::Str(input));
    Ok(Value::Object(arr))
}

fn regexp_to_string(vm: &mut Vm, this: &Value, _args: &[Value]) -> NativeResult {
    let re = this_regexp(vm, this)?;
    let (source, flags) = re.with_kind(|k| match k {
        ObjectKind::Regexp(r) => (r.source.clone(), r.flags.clone()),
        _ => unreachable!("receiver checked"),
    });
    Ok(Value::str(format!("/{}/{}", source, flags)))
}

// ----------------------------------------------------------------------
// console
// ----------------------------------------------------------------------

fn console_log(vm: &mut Vm, _this: &Value, args: &[Value]) -> NativeResult {
    let mut parts = Vec::with_capacity(args.len());
    for a in args {
        let text = match a {
            Value::Str(s) => s.to_std_string(),
            Value::Object(_) => match vm.to_string_value(a) {
                Ok(s) => s.to_std_string(),
                Err(_) => format!("{:?}", a),
            },
            other => other
                .primitive_to_string()
                .map(|s| s.to_std_string())
                .unwrap_or_else(|| format!("{:?}", other)),
        };
        parts.push(text);
    }
    println!("{}", parts.join(" "));
    Ok(Value::Undefined)
}
