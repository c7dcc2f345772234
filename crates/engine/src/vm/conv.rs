//! Coercions and the operator semantics that need them
//!
//! Everything here may call script code (valueOf/toString, accessors,
//! iterator methods), so it lives on the VM rather than on `Value`.

use super::{Vm, VmFault};
use crate::object::{
    ArrayIterData, JsObject, ObjectKind, PropKey, SetDisposition,
};
use crate::value::Value;
use skiff_core::{number, JsString};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    Number,
    String,
}

/// Outcome of the abstract relational comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Cmp(Ordering),
    /// A NaN was involved; every relational operator yields false.
    Undefined,
}

impl Vm {
    /// Human-readable description of a value for error messages.
    pub fn describe(&self, v: &Value) -> String {
        match v {
            Value::Object(o) if o.is_callable() => {
                match o.get_own(&PropKey::str("name")).map(|p| p.value) {
                    Some(Value::Str(name)) if !name.is_empty() => {
                        format!("function {}", name)
                    }
                    _ => "function".to_string(),
                }
            }
            Value::Object(o) => format!("[object {}]", o.class()),
            Value::Str(s) => format!("{:?}", s.to_std_string()),
            other => other
                .primitive_to_string()
                .map(|s| s.to_std_string())
                .unwrap_or_else(|| "value".to_string()),
        }
    }

    /// The `this` seen by sloppy-mode functions: nullish becomes the
    /// global object, primitives get wrapped.
    pub fn coerce_this(&mut self, v: Value) -> Result<Value, VmFault> {
        match v {
            Value::Undefined | Value::Null | Value::Empty => {
                Ok(Value::Object(self.realm.global.clone()))
            }
            Value::Object(_) => Ok(v),
            prim => Ok(Value::Object(self.wrap_primitive(prim)?)),
        }
    }

    pub fn wrap_primitive(&mut self, v: Value) -> Result<JsObject, VmFault> {
        let realm = self.realm.clone();
        Ok(match v {
            Value::Bool(b) => JsObject::new(
                Some(realm.boolean_proto.clone()),
                "Boolean",
                ObjectKind::BoolWrap(b),
            ),
            Value::Int(_) | Value::Float(_) => JsObject::new(
                Some(realm.number_proto.clone()),
                "Number",
                ObjectKind::NumberWrap(v),
            ),
            Value::Str(s) => JsObject::new(
                Some(realm.string_proto.clone()),
                "String",
                ObjectKind::StringWrap(s),
            ),
            Value::Symbol(_) => JsObject::new(
                Some(realm.symbol_proto.clone()),
                "Symbol",
                ObjectKind::NumberWrap(v),
            ),
            other => {
                return Err(self.type_error(format!(
                    "Cannot convert {} to an object",
                    self.describe(&other)
                )))
            }
        })
    }

    pub fn to_object(&mut self, v: Value) -> Result<JsObject, VmFault> {
        match v {
            Value::Object(o) => Ok(o),
            Value::Undefined | Value::Null | Value::Empty => {
                Err(self.type_error("Cannot convert undefined or null to object"))
            }
            prim => self.wrap_primitive(prim),
        }
    }

    /// `ToPrimitive`: for objects, try valueOf/toString in hint order.
    pub fn to_primitive(&mut self, v: &Value, hint: Hint) -> Result<Value, VmFault> {
        let obj = match v {
            Value::Object(o) => o.clone(),
            Value::Unresolved(name) => {
                let name = name.clone();
                return Err(self.not_defined_error(&name));
            }
            other => return Ok(other.clone()),
        };
        let order: [&str; 2] = match hint {
            Hint::Number => ["valueOf", "toString"],
            Hint::String => ["toString", "valueOf"],
        };
        for name in order {
            let method = self.get_prop_value(v, &PropKey::str(name))?;
            if let Value::Object(m) = &method {
                if m.is_callable() {
                    let result =
                        self.call_function(method.clone(), Value::Object(obj.clone()), &[])?;
                    if !matches!(result, Value::Object(_)) {
                        return Ok(result);
                    }
                }
            }
        }
        Err(self.type_error("Cannot convert object to primitive value"))
    }

    pub fn to_number_value(&mut self, v: &Value) -> Result<f64, VmFault> {
        match v {
            Value::Symbol(_) => Err(self.type_error("Cannot convert a Symbol value to a number")),
            Value::Object(_) => {
                let prim = self.to_primitive(v, Hint::Number)?;
                self.to_number_value(&prim)
            }
            other => match other.primitive_to_number() {
                Some(n) => Ok(n),
                None => Err(self.type_error("Cannot convert value to a number")),
            },
        }
    }

    /// `ToNumber` keeping the integer flavor where possible.
    pub fn to_numeric(&mut self, v: Value) -> Result<Value, VmFault> {
        match v {
            Value::Int(_) | Value::Float(_) => Ok(v),
            other => {
                let n = self.to_number_value(&other)?;
                Ok(Value::number(n))
            }
        }
    }

    pub fn to_string_value(&mut self, v: &Value) -> Result<JsString, VmFault> {
        match v {
            Value::Symbol(_) => Err(self.type_error("Cannot convert a Symbol value to a string")),
            Value::Object(_) => {
                let prim = self.to_primitive(v, Hint::String)?;
                self.to_string_value(&prim)
            }
            other => match other.primitive_to_string() {
                Some(s) => Ok(s),
                None => Err(self.type_error("Cannot convert value to a string")),
            },
        }
    }

    pub fn to_property_key(&mut self, v: Value) -> Result<PropKey, VmFault> {
        match v {
            Value::Symbol(s) => Ok(PropKey::Sym(s)),
            Value::Object(_) => {
                let prim = self.to_primitive(&v, Hint::String)?;
                self.to_property_key(prim)
            }
            other => Ok(PropKey::Str(self.to_string_value(&other)?)),
        }
    }

    // ------------------------------------------------------------------
    // Property access on arbitrary bases
    // ------------------------------------------------------------------

    pub fn get_prop_value(&mut self, base: &Value, key: &PropKey) -> Result<Value, VmFault> {
        let proto = match base {
            Value::Object(o) => {
                return self.get_prop_on_object(o.clone(), key, base.clone());
            }
            Value::Str(s) => {
                if let PropKey::Str(name) = key {
                    if name.as_ascii() == Some("length") {
                        return Ok(Value::Int(s.len() as i64));
                    }
                    if let Some(idx) = crate::object::array_index(name) {
                        return Ok(if (idx as usize) < s.len() {
                            Value::Str(s.substring(idx as usize, idx as usize + 1))
                        } else {
                            Value::Undefined
                        });
                    }
                }
                self.realm.string_proto.clone()
            }
            Value::Int(_) | Value::Float(_) => self.realm.number_proto.clone(),
            Value::Bool(_) => self.realm.boolean_proto.clone(),
            Value::Symbol(_) => self.realm.symbol_proto.clone(),
            Value::Unresolved(name) => {
                let name = name.clone();
                return Err(self.not_defined_error(&name));
            }
            Value::Undefined | Value::Null | Value::Empty => {
                let what = match key {
                    PropKey::Str(s) => s.to_std_string(),
                    PropKey::Sym(_) => "Symbol(...)".to_string(),
                };
                return Err(self.type_error(format!(
                    "Cannot read properties of {} (reading '{}')",
                    if matches!(base, Value::Null) {
                        "null"
                    } else {
                        "undefined"
                    },
                    what
                )));
            }
        };
        self.get_prop_on_object(proto, key, base.clone())
    }

    fn get_prop_on_object(
        &mut self,
        obj: JsObject,
        key: &PropKey,
        receiver: Value,
    ) -> Result<Value, VmFault> {
        match obj.lookup(key) {
            None => Ok(Value::Undefined),
            Some(p) if !p.accessor => Ok(p.value),
            Some(p) => match p.getter {
                Some(g) => self.call_function(Value::Object(g), receiver, &[]),
                None => Ok(Value::Undefined),
            },
        }
    }

    pub fn set_prop_value(
        &mut self,
        base: &Value,
        key: &PropKey,
        value: Value,
        strict: bool,
    ) -> Result<(), VmFault> {
        match base {
            Value::Object(o) => {
                let o = o.clone();
                match o.set_disposition(key) {
                    SetDisposition::Write => {
                        o.put_value(key, value);
                        Ok(())
                    }
                    SetDisposition::CallSetter(s) => {
                        self.call_function(Value::Object(s), base.clone(), &[value])?;
                        Ok(())
                    }
                    SetDisposition::Reject => {
                        if strict {
                            let what = key
                                .as_str()
                                .map(|s| s.to_std_string())
                                .unwrap_or_else(|| "Symbol(...)".to_string());
                            Err(self.type_error(format!(
                                "Cannot assign to read only property '{}' of object",
                                what
                            )))
                        } else {
                            Ok(())
                        }
                    }
                }
            }
            Value::Undefined | Value::Null | Value::Empty => {
                Err(self.type_error("Cannot set properties of undefined or null"))
            }
            Value::Unresolved(name) => {
                let name = name.clone();
                Err(self.not_defined_error(&name))
            }
            _prim => {
                if strict {
                    Err(self.type_error("Cannot create property on a primitive value"))
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn delete_prop_value(
        &mut self,
        base: &Value,
        key: &PropKey,
        strict: bool,
    ) -> Result<bool, VmFault> {
        match base {
            Value::Object(o) => {
                let ok = o.delete(key);
                if !ok && strict {
                    let what = key
                        .as_str()
                        .map(|s| s.to_std_string())
                        .unwrap_or_else(|| "Symbol(...)".to_string());
                    return Err(
                        self.type_error(format!("Cannot delete property '{}' of object", what))
                    );
                }
                Ok(ok)
            }
            Value::Undefined | Value::Null | Value::Empty => {
                Err(self.type_error("Cannot convert undefined or null to object"))
            }
            _ => Ok(true),
        }
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    /// `+`: string concatenation when either primitive is a string,
    /// numeric addition otherwise. Integer overflow falls back to float.
    pub fn add_values(&mut self, a: Value, b: Value) -> Result<Value, VmFault> {
        let pa = self.to_primitive(&a, Hint::Number)?;
        let pb = self.to_primitive(&b, Hint::Number)?;
        if matches!(pa, Value::Str(_)) || matches!(pb, Value::Str(_)) {
            let sa = self.to_string_value(&pa)?;
            let sb = self.to_string_value(&pb)?;
            return Ok(Value::Str(sa.concat(&sb)));
        }
        if let (Value::Int(x), Value::Int(y)) = (&pa, &pb) {
            return Ok(match x.checked_add(*y) {
                Some(s) if s.unsigned_abs() <= 1u64 << 53 => Value::Int(s),
                _ => Value::Float(*x as f64 + *y as f64),
            });
        }
        let x = self.to_number_value(&pa)?;
        let y = self.to_number_value(&pb)?;
        Ok(Value::Float(x + y))
    }

    pub fn sub_values(&mut self, a: Value, b: Value) -> Result<Value, VmFault> {
        if let (Value::Int(x), Value::Int(y)) = (&a, &b) {
            return Ok(match x.checked_sub(*y) {
                Some(s) if s.unsigned_abs() <= 1u64 << 53 => Value::Int(s),
                _ => Value::Float(*x as f64 - *y as f64),
            });
        }
        let x = self.to_number_value(&a)?;
        let y = self.to_number_value(&b)?;
        Ok(Value::Float(x - y))
    }

    pub fn mul_values(&mut self, a: Value, b: Value) -> Result<Value, VmFault> {
        if let (Value::Int(x), Value::Int(y)) = (&a, &b) {
            return Ok(match x.checked_mul(*y) {
                Some(p) if p.unsigned_abs() <= 1u64 << 53 => Value::Int(p),
                _ => Value::Float(*x as f64 * *y as f64),
            });
        }
        let x = self.to_number_value(&a)?;
        let y = self.to_number_value(&b)?;
        Ok(Value::Float(x * y))
    }

    /// Division stays integral only when exact; `0/0` is NaN, `x/0`
    /// signed infinity.
    pub fn div_values(&mut self, a: Value, b: Value) -> Result<Value, VmFault> {
        if let (Value::Int(x), Value::Int(y)) = (&a, &b) {
            if *y != 0 && x % y == 0 {
                let q = x / y;
                if !(q == 0 && (*x < 0) != (*y < 0)) {
                    return Ok(Value::Int(q));
                }
            }
        }
        let x = self.to_number_value(&a)?;
        let y = self.to_number_value(&b)?;
        Ok(Value::Float(x / y))
    }

    /// `%` keeps the sign of the dividend.
    pub fn mod_values(&mut self, a: Value, b: Value) -> Result<Value, VmFault> {
        if let (Value::Int(x), Value::Int(y)) = (&a, &b) {
            if *y != 0 {
                let r = x % y;
                if !(r == 0 && *x < 0) {
                    return Ok(Value::Int(r));
                }
            }
        }
        let x = self.to_number_value(&a)?;
        let y = self.to_number_value(&b)?;
        Ok(Value::Float(x % y))
    }

    /// The abstract relational comparison.
    pub fn relational(&mut self, a: Value, b: Value) -> Result<Relation, VmFault> {
        let pa = self.to_primitive(&a, Hint::Number)?;
        let pb = self.to_primitive(&b, Hint::Number)?;
        if let (Value::Str(x), Value::Str(y)) = (&pa, &pb) {
            return Ok(Relation::Cmp(x.compare(y)));
        }
        let x = self.to_number_value(&pa)?;
        let y = self.to_number_value(&pb)?;
        Ok(match x.partial_cmp(&y) {
            Some(ord) => Relation::Cmp(ord),
            None => Relation::Undefined,
        })
    }

    /// Loose equality including the object-to-primitive cases.
    pub fn loose_equals(&mut self, a: &Value, b: &Value) -> Result<bool, VmFault> {
        if let Some(r) = a.loose_equals_primitive(b) {
            return Ok(r);
        }
        // One side is an object, the other a non-nullish primitive.
        match (a, b) {
            (Value::Object(_), prim) => {
                let pa = self.to_primitive(a, Hint::Number)?;
                let prim = prim.clone();
                self.loose_equals(&pa, &prim)
            }
            (prim, Value::Object(_)) => {
                let pb = self.to_primitive(b, Hint::Number)?;
                let prim = prim.clone();
                self.loose_equals(&prim, &pb)
            }
            _ => Ok(false),
        }
    }

    pub fn instanceof_check(&mut self, lhs: &Value, rhs: &Value) -> Result<bool, VmFault> {
        if !rhs.as_object().is_some_and(|o| o.is_callable()) {
            return Err(self.type_error("Right-hand side of 'instanceof' is not callable"));
        }
        let proto = match self.get_prop_value(rhs, &PropKey::str("prototype"))? {
            Value::Object(p) => p,
            _ => {
                return Err(self.type_error(
                    "Function has non-object prototype in instanceof check",
                ))
            }
        };
        let mut cur = match lhs {
            Value::Object(o) => o.proto(),
            _ => return Ok(false),
        };
        while let Some(o) = cur {
            if o.same(&proto) {
                return Ok(true);
            }
            cur = o.proto();
        }
        Ok(false)
    }

    pub fn in_check(&mut self, key: Value, obj: &Value) -> Result<bool, VmFault> {
        let target = match obj.as_object() {
            Some(o) => o.clone(),
            None => {
                return Err(self.type_error("Cannot use 'in' operator on a non-object"))
            }
        };
        let key = self.to_property_key(key)?;
        Ok(target.has_property(&key))
    }

    // ------------------------------------------------------------------
    // Bitwise helpers
    // ------------------------------------------------------------------

    pub fn to_int32_value(&mut self, v: &Value) -> Result<i32, VmFault> {
        let n = self.to_number_value(v)?;
        Ok(number::to_int32(n))
    }

    pub fn to_uint32_value(&mut self, v: &Value) -> Result<u32, VmFault> {
        let n = self.to_number_value(v)?;
        Ok(number::to_uint32(n))
    }

    // ------------------------------------------------------------------
    // Iteration protocol
    // ------------------------------------------------------------------

    /// `GetIterator`: look up `Symbol.iterator`, call it, demand an
    /// object.
    pub fn iterator_open(&mut self, v: Value) -> Result<JsObject, VmFault> {
        let sym = PropKey::Sym(self.realm.sym_iterator.clone());
        let method = self.get_prop_value(&v, &sym)?;
        match &method {
            Value::Object(m) if m.is_callable() => {}
            _ => {
                return Err(
                    self.type_error(format!("{} is not iterable", self.describe(&v)))
                )
            }
        }
        match self.call_function(method, v, &[])? {
            Value::Object(o) => Ok(o),
            _ => Err(self.type_error("Iterator result is not an object")),
        }
    }

    /// One `next()` step: `Ok(Some(value))` while running, `Ok(None)` at
    /// completion.
    pub fn iterator_step(&mut self, iterator: &JsObject) -> Result<Option<Value>, VmFault> {
        let next = self.get_prop_value(&Value::Object(iterator.clone()), &PropKey::str("next"))?;
        let result =
            self.call_function(next, Value::Object(iterator.clone()), &[])?;
        let result = match result {
            Value::Object(o) => o,
            _ => return Err(self.type_error("Iterator result is not an object")),
        };
        let done = self
            .get_prop_value(&Value::Object(result.clone()), &PropKey::str("done"))?
            .to_boolean();
        if done {
            return Ok(None);
        }
        let value =
            self.get_prop_value(&Value::Object(result), &PropKey::str("value"))?;
        Ok(Some(value))
    }

    /// Fresh array iterator object (backs `Array.prototype[Symbol.iterator]`
    /// and string iteration).
    pub fn new_array_iter(&mut self, target: Value) -> JsObject {
        JsObject::new(
            Some(self.realm.array_iter_proto.clone()),
            "Array Iterator",
            ObjectKind::ArrayIter(ArrayIterData {
                target,
                index: 0,
                done: false,
            }),
        )
    }
}
