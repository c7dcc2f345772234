//! End-to-end language semantics: source string in, value out.

use skiff_engine::{EngineError, Runtime, Value};

fn eval(src: &str) -> Value {
    Runtime::new()
        .eval("test.js", src)
        .unwrap_or_else(|e| panic!("eval failed for {:?}: {}", src, e))
}

fn eval_err(src: &str) -> EngineError {
    Runtime::new()
        .eval("test.js", src)
        .expect_err("expected an error")
}

fn eval_int(src: &str) -> i64 {
    match eval(src) {
        Value::Int(i) => i,
        other => panic!("expected integer from {:?}, got {:?}", src, other),
    }
}

fn eval_bool(src: &str) -> bool {
    match eval(src) {
        Value::Bool(b) => b,
        other => panic!("expected boolean from {:?}, got {:?}", src, other),
    }
}

fn eval_str(src: &str) -> String {
    match eval(src) {
        Value::Str(s) => s.to_std_string(),
        other => panic!("expected string from {:?}, got {:?}", src, other),
    }
}

#[test]
fn arithmetic_stays_integral() {
    assert_eq!(eval_int("2 + 2"), 4);
    assert_eq!(eval_int("7 * 6"), 42);
    assert_eq!(eval_int("10 / 2"), 5);
    assert_eq!(eval_int("-7 % 3"), -1);
}

#[test]
fn function_calls() {
    assert_eq!(eval_int("function s(a, b) { return a + b; } s(40, 2)"), 42);
    assert_eq!(eval_int("var f = function (x) { return x * 2; }; f(21)"), 42);
    assert_eq!(eval_int("(function () { return 42; })()"), 42);
}

#[test]
fn missing_arguments_read_undefined() {
    assert_eq!(eval_str("function f(a, b) { return typeof b; } f(1)"), "undefined");
}

#[test]
fn thrown_value_reaches_catch() {
    assert_eq!(eval_str("try { throw 'Test'; } catch (e) { e }"), "Test");
}

#[test]
fn duplicate_strict_parameter_is_a_compile_error() {
    let err = eval_err("(function(){ 'use strict'; function f(a, a) {} })()");
    match err {
        EngineError::Compile(e) => assert!(e.message.contains("Duplicate parameter")),
        other => panic!("expected compile error, got {:?}", other),
    }
}

#[test]
fn const_assignment_raises_and_preserves_value() {
    assert_eq!(
        eval_str("const x = 1; var r; try { x = 2; } catch (e) { r = e.name; } r"),
        "TypeError"
    );
    assert_eq!(eval_int("const x = 1; try { x = 2; } catch (e) {} x"), 1);
}

#[test]
fn closures_share_their_stash() {
    assert_eq!(
        eval_int(
            "function mk() { var n = 0; return function () { n = n + 1; return n; }; }\n\
             var c = mk(); c(); c(); c()"
        ),
        3
    );
    // Two closures over the same variable observe each other's writes.
    assert_eq!(
        eval_int(
            "function mk() { var n = 0;\n\
               return { inc: function () { n++; }, get: function () { return n; } };\n\
             }\n\
             var o = mk(); o.inc(); o.inc(); o.get()"
        ),
        2
    );
}

#[test]
fn let_is_dead_until_initialized() {
    assert!(eval_bool(
        "var r; { try { q; } catch (e) { r = e instanceof ReferenceError; } let q = 1; } r"
    ));
    assert!(eval_bool(
        "var r; { try { q = 5; } catch (e) { r = e instanceof ReferenceError; } let q; } r"
    ));
}

#[test]
fn mapped_arguments_alias_parameters() {
    assert_eq!(eval_int("function f(a) { arguments[0] = 9; return a; } f(1)"), 9);
    assert_eq!(eval_int("function f(a) { a = 5; return arguments[0]; } f(1)"), 5);
    assert_eq!(eval_int("(function () { return arguments.length; })(1, 2, 3)"), 3);
}

#[test]
fn strict_arguments_do_not_alias() {
    assert_eq!(
        eval_int("function f(a) { 'use strict'; arguments[0] = 9; return a; } f(1)"),
        1
    );
}

#[test]
fn arrows_capture_this_and_new_target() {
    assert!(eval_bool(
        "var o = { v: 7, m: function () { var a = function () { return this.v; };\n\
           var b = (function (s) { return function () { return s.v; }; })(this);\n\
           var c = undefined; c = (x => this.v); return c() === 7; } };\n\
         o.m()"
    ));
    assert!(eval_bool(
        "function G() { var a = function () { return new.target; }; var b = () => new.target;\n\
           this.plain = a(); this.arrow = b(); }\n\
         var g = new G(); g.arrow === G && g.plain === undefined"
    ));
}

#[test]
fn labelled_break_and_continue() {
    assert_eq!(
        eval_int(
            "var n = 0;\n\
             outer: for (var i = 0; i < 5; i++) {\n\
               for (var j = 0; j < 5; j++) {\n\
                 if (j === 2) continue outer;\n\
                 if (i === 3) break outer;\n\
                 n++;\n\
               }\n\
             }\n\
             n"
        ),
        6
    );
}

#[test]
fn for_in_enumerates_own_then_inherited() {
    assert_eq!(
        eval_str(
            "var o = { a: 1, b: 2 }; var keys = '';\n\
             for (var k in o) { keys += k; }\n\
             keys"
        ),
        "ab"
    );
    // Deleted keys are skipped mid-walk.
    assert_eq!(
        eval_str(
            "var o = { a: 1, b: 2, c: 3 }; var keys = '';\n\
             for (var k in o) { keys += k; delete o.c; }\n\
             keys"
        ),
        "ab"
    );
}

#[test]
fn for_of_uses_the_iteration_protocol() {
    assert_eq!(eval_int("var s = 0; for (var v of [1, 2, 3]) { s += v; } s"), 6);
    assert_eq!(eval_str("var s = ''; for (var c of 'abc') { s += c; } s"), "abc");
}

#[test]
fn for_of_closes_iterator_on_break() {
    assert!(eval_bool(
        "var closed = false;\n\
         var iter = { next: function () { return { value: 1, done: false }; },\n\
                      return: function () { closed = true; return {}; } };\n\
         var iterable = {};\n\
         iterable[Symbol.iterator] = function () { return iter; };\n\
         for (var v of iterable) { break; }\n\
         closed"
    ));
}

#[test]
fn switch_dispatch_and_fallthrough() {
    assert_eq!(
        eval_str(
            "function f(x) { var r = '';\n\
               switch (x) {\n\
                 case 1: r += 'one ';\n\
                 case 2: r += 'two'; break;\n\
                 default: r = 'other';\n\
               }\n\
               return r; }\n\
             f(1) + '/' + f(2) + '/' + f(9)"
        ),
        "one two/two/other"
    );
}

#[test]
fn finally_runs_on_return_and_break() {
    assert_eq!(
        eval_str(
            "var log = '';\n\
             function f() { try { log += 't'; return 'r'; } finally { log += 'f'; } }\n\
             f(); log"
        ),
        "tf"
    );
    assert_eq!(
        eval_int("var r = 0; l: try { break l; } finally { r = 1; } r"),
        1
    );
    // A finally that falls through re-raises the pending exception.
    assert_eq!(
        eval_str(
            "var r = '';\n\
             try { try { throw 'x'; } finally { r += 'f'; } } catch (e) { r += e; }\n\
             r"
        ),
        "fx"
    );
}

#[test]
fn nested_finally_ordering_on_return() {
    assert_eq!(
        eval_str(
            "var log = '';\n\
             function f() {\n\
               try { try { return 'v'; } finally { log += 'a'; } } finally { log += 'b'; }\n\
             }\n\
             f() + ':' + log"
        ),
        "v:ab"
    );
}

#[test]
fn with_defeats_static_binding() {
    assert_eq!(eval_int("var o = { x: 5 }; var r; with (o) { r = x; } r"), 5);
    assert_eq!(
        eval_int("var x = 1; var o = { x: 5 }; with (o) { x = 7; } o.x"),
        7
    );
    assert_eq!(
        eval_int("var x = 1; var o = {}; with (o) { x = 7; } x"),
        7
    );
    // Inside a function the binding is statically known but the with
    // frame may shadow it at runtime.
    assert_eq!(
        eval_int("function f() { var x = 1; var o = { x: 5 }; with (o) { return x; } } f()"),
        5
    );
    assert_eq!(
        eval_int("function g() { var x = 1; with ({}) { return x; } } g()"),
        1
    );
}

#[test]
fn direct_eval_dynamizes_enclosing_scopes() {
    assert_eq!(
        eval_int(
            "function f() { var x = 3; function inner() { return x; } eval(''); return inner(); }\n\
             f()"
        ),
        3
    );
    assert_eq!(
        eval_int("function f() { var x = 1; eval('x = 41'); return x + 1; } f()"),
        42
    );
}

#[test]
fn direct_eval_sees_and_extends_the_caller_scope() {
    assert_eq!(eval_int("function f() { var x = 7; return eval('x'); } f()"), 7);
    assert_eq!(eval_int("function g() { eval('var z = 3'); return z; } g()"), 3);
    assert_eq!(
        eval_str("try { throw 'Test'; } catch (e) { eval('e') }"),
        "Test"
    );
    // Indirect eval runs in the global scope instead.
    assert_eq!(
        eval_str(
            "var x = 'global'; function h() { var x = 'local'; var e = eval; return e('x'); } h()"
        ),
        "global"
    );
}

#[test]
fn accessors_in_object_literals() {
    assert_eq!(eval_int("var o = { get a() { return 42; } }; o.a"), 42);
    assert_eq!(
        eval_int("var o = { set a(v) { this.b = v * 2; } }; o.a = 21; o.b"),
        42
    );
}

#[test]
fn prototype_chain_and_instanceof() {
    assert!(eval_bool("[] instanceof Array"));
    assert!(eval_bool("new TypeError('m') instanceof Error"));
    assert!(eval_bool(
        "function A() {} function B() {}\n\
         B.prototype = new A();\n\
         new B() instanceof A"
    ));
    assert_eq!(
        eval_int(
            "function P() {} P.prototype.v = 9; new P().v"
        ),
        9
    );
}

#[test]
fn constructor_returning_object_overrides_this() {
    assert_eq!(
        eval_int("function C() { this.a = 1; return { a: 2 }; } new C().a"),
        2
    );
    assert_eq!(
        eval_int("function C() { this.a = 1; return 5; } new C().a"),
        1
    );
}

#[test]
fn number_boundaries() {
    assert!(eval_bool("isNaN(0 / 0)"));
    assert!(eval_bool("1 / 0 === Infinity"));
    assert!(eval_bool("-1 / 0 === -Infinity"));
    assert!(eval_bool("9007199254740991 + 2 === 9007199254740992"));
    assert_eq!(eval_str("(255).toString(16)"), "ff");
    assert_eq!(eval_str("(2.5).toFixed(0)"), "3");
    assert!(eval_bool(
        "try { (1).toFixed(101); false } catch (e) { e instanceof RangeError }"
    ));
    assert!(eval_bool(
        "try { (1).toString(37); false } catch (e) { e instanceof RangeError }"
    ));
}

#[test]
fn delete_is_idempotent() {
    assert!(eval_bool("var o = { p: 1 }; delete o.p; delete o.p"));
    assert_eq!(eval_str("var o = { p: 1 }; delete o.p; typeof o.p"), "undefined");
}

#[test]
fn identity_preserved_through_calls() {
    assert!(eval_bool("var o = {}; (function (x) { return x; })(o) === o"));
    assert!(eval_bool("var o = {}; (x => x)(o) === o"));
}

#[test]
fn typeof_unresolved_names() {
    assert_eq!(eval_str("typeof nope"), "undefined");
    assert!(matches!(
        eval_err("nope"),
        EngineError::Script { message, .. } if message.contains("not defined")
    ));
}

#[test]
fn strict_delete_of_identifier_is_a_compile_error() {
    match eval_err("'use strict'; var a = 1; delete a;") {
        EngineError::Compile(e) => assert!(e.message.contains("Delete")),
        other => panic!("expected compile error, got {:?}", other),
    }
}

#[test]
fn constant_folding_matches_evaluation() {
    assert_eq!(eval_int("2 + 3 * 4"), 14);
    assert_eq!(eval_str("'a' + 'b' + 'c'"), "abc");
    assert!(eval_bool("(1 < 2) && ('a' < 'b')"));
    assert_eq!(eval_int("true ? 1 + 1 : 0"), 2);
}

#[test]
fn json_round_trips() {
    assert_eq!(eval_str("JSON.stringify({ a: [1, 2], b: 'x' })"), "{\"a\":[1,2],\"b\":\"x\"}");
    assert_eq!(eval_int("JSON.parse('{\"a\": 41}').a + 1"), 42);
}

#[test]
fn regex_literals_and_methods() {
    assert_eq!(eval_str("/a(b+)c/.exec('xabbc')[1]"), "bb");
    assert!(eval_bool("/^\\d+$/.test('12345')"));
    assert!(!eval_bool("/^\\d+$/.test('12a45')"));
    assert_eq!(eval_int("'a1b22c'.split(/x/) ? 1 : 0"), 1);
}

#[test]
fn string_methods() {
    assert_eq!(eval_int("'hello'.length"), 5);
    assert_eq!(eval_str("'hello'.charAt(1)"), "e");
    assert_eq!(eval_str("'hello'.toUpperCase()"), "HELLO");
    assert_eq!(eval_int("'ananas'.indexOf('na', 2)"), 3);
    assert_eq!(eval_str("'a,b,c'.split(',')[1]"), "b");
    assert_eq!(eval_str("' x '.trim()"), "x");
}

#[test]
fn array_methods() {
    assert_eq!(eval_int("var a = [1, 2]; a.push(3); a.length"), 3);
    assert_eq!(eval_str("[1, 2, 3].join('-')"), "1-2-3");
    assert_eq!(eval_int("[1, 2, 3].map(function (x) { return x * 2; })[2]"), 6);
    assert_eq!(eval_int("[10, 20, 30].indexOf(20)"), 1);
    assert_eq!(eval_int("[1, 2, 3, 4].slice(1, 3).length"), 2);
}

#[test]
fn array_holes_are_skipped() {
    assert_eq!(eval_int("[1, , 3].length"), 3);
    assert_eq!(
        eval_str("var s = ''; for (var k in [1, , 3]) { s += k; } s"),
        "02"
    );
}

#[test]
fn hoisting() {
    assert_eq!(eval_int("f(); function f() { return g(); } function g() { return 42; }"), 42);
    // The binding exists before its initializer runs.
    assert_eq!(eval_str("typeof v; var v = 1;"), "undefined");
}

#[test]
fn comma_and_conditional() {
    assert_eq!(eval_int("(1, 2, 3)"), 3);
    assert_eq!(eval_int("var x = 5; x > 3 ? 10 : 20"), 10);
}

#[test]
fn compound_assignment_and_increments() {
    assert_eq!(eval_int("var x = 5; x += 3; x *= 2; x"), 16);
    assert_eq!(eval_int("var x = 5; x++"), 5);
    assert_eq!(eval_int("var x = 5; x++; x"), 6);
    assert_eq!(eval_int("var x = 5; ++x"), 6);
    assert_eq!(eval_int("var o = { n: 1 }; o.n++; o.n += 2; o.n"), 4);
    assert_eq!(eval_int("var a = [5]; a[0]++; a[0]"), 6);
    assert_eq!(eval_str("var s = 'a'; s += 1; s"), "a1");
}

#[test]
fn equality_tables() {
    assert!(eval_bool("null == undefined"));
    assert!(!eval_bool("null === undefined"));
    assert!(eval_bool("'2' == 2"));
    assert!(!eval_bool("'2' === 2"));
    assert!(eval_bool("NaN !== NaN"));
    assert!(eval_bool("1 == true"));
    assert!(!eval_bool("({}) == ({})"));
    assert!(eval_bool("var o = {}; o == o"));
}

#[test]
fn logical_short_circuit_preserves_values() {
    assert_eq!(eval_int("0 || 42"), 42);
    assert_eq!(eval_int("1 && 42"), 42);
    assert_eq!(eval_int("0 && f_undefined_never_called()"), 0);
    assert_eq!(eval_str("'x' || f_undefined_never_called()"), "x");
}

#[test]
fn global_lexicals() {
    assert_eq!(eval_int("let a = 40; const b = 2; a + b"), 42);
    assert!(matches!(
        eval_err("const c = 1; c = 2;"),
        EngineError::Script { message, .. } if message.contains("constant")
    ));
}

#[test]
fn script_completion_value_comes_from_the_last_expression() {
    assert_eq!(eval_int("1; 2; 3"), 3);
    assert_eq!(eval_int("var x = 9;  if (true) { 42; }"), 42);
}

#[test]
fn call_and_apply() {
    assert_eq!(
        eval_int("function f(a, b) { return this.base + a + b; } f.call({ base: 30 }, 10, 2)"),
        42
    );
    assert_eq!(
        eval_int("function f(a, b) { return a + b; } f.apply(null, [40, 2])"),
        42
    );
}

#[test]
fn uncaught_errors_carry_a_stack() {
    let err = eval_err("function inner() { throw new TypeError('boom'); }\nfunction outer() { inner(); }\nouter();");
    match err {
        EngineError::Script { message, stack, .. } => {
            assert_eq!(message, "TypeError: boom");
            assert!(!stack.is_empty());
            assert!(stack.iter().all(|f| f.file == "test.js"));
            assert_eq!(stack[0].func_name.as_deref(), Some("inner"));
        }
        other => panic!("expected script error, got {:?}", other),
    }
}
