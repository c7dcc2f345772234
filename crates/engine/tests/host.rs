//! The embedding surface: globals, host calls, JSON exchange.

use skiff_engine::{Runtime, Value};

#[test]
fn globals_round_trip() {
    let mut rt = Runtime::new();
    rt.global_set("answer", Value::Int(40)).expect("set");
    let v = rt.eval("t.js", "answer + 2").expect("eval");
    assert!(v.strict_equals(&Value::Int(42)));
    rt.eval("t.js", "var out = 'from script';").expect("eval");
    let out = rt.global_get("out").expect("get");
    assert_eq!(out.primitive_to_string().unwrap().to_std_string(), "from script");
}

#[test]
fn host_calls_a_script_function() {
    let mut rt = Runtime::new();
    rt.eval("t.js", "function add(a, b) { return a + b; }")
        .expect("eval");
    let f = rt.global_get("add").expect("get");
    let v = rt
        .call(&f, Value::Undefined, &[Value::Int(40), Value::Int(2)])
        .expect("call");
    assert!(v.strict_equals(&Value::Int(42)));
}

#[test]
fn host_call_sees_this() {
    let mut rt = Runtime::new();
    rt.eval("t.js", "function get() { return this.v; }").expect("eval");
    let f = rt.global_get("get").expect("get");
    let obj = rt.eval("t.js", "({ v: 7 })").expect("eval");
    let v = rt.call(&f, obj, &[]).expect("call");
    assert!(v.strict_equals(&Value::Int(7)));
}

#[test]
fn json_import_export() {
    let mut rt = Runtime::new();
    let j: serde_json::Value = serde_json::json!({ "a": [1, 2.5, "x"], "b": true });
    let v = rt.from_json(&j);
    rt.global_set("data", v).expect("set");
    let sum = rt.eval("t.js", "data.a[0] + data.a[1]").expect("eval");
    assert!(matches!(sum, Value::Float(f) if f == 3.5));

    let back = rt.global_get("data").expect("get");
    let exported = rt.to_json(&back).expect("export");
    assert_eq!(exported, j);
}

#[test]
fn export_rejects_cycles() {
    let mut rt = Runtime::new();
    let v = rt
        .eval("t.js", "var o = {}; o.self = o; o")
        .expect("eval");
    assert!(rt.to_json(&v).is_err());
}

#[test]
fn script_errors_preserve_the_thrown_value() {
    let mut rt = Runtime::new();
    let err = rt
        .eval("t.js", "throw { code: 42 };")
        .expect_err("throw surfaces");
    match err {
        skiff_engine::EngineError::Script { value, .. } => {
            let obj = value.as_object().expect("thrown value is an object").clone();
            let prop = obj
                .get_own(&skiff_engine::object::PropKey::str("code"))
                .expect("thrown object keeps its properties");
            assert!(prop.value.strict_equals(&Value::Int(42)));
        }
        other => panic!("expected script error, got {:?}", other),
    }
}
