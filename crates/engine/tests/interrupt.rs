//! Cooperative interruption from another thread.

use skiff_engine::{EngineError, Runtime};
use std::time::Duration;

#[test]
fn infinite_loop_is_interrupted_with_the_payload() {
    let mut runtime = Runtime::new();
    let handle = runtime.interrupt_handle();
    let timer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        handle.interrupt("deadline");
    });
    let err = runtime
        .eval("loop.js", "var i = 0; for (;;) i++;")
        .expect_err("the loop must not terminate on its own");
    timer.join().expect("timer thread");
    match err {
        EngineError::Interrupted { payload } => assert_eq!(payload, "deadline"),
        other => panic!("expected interruption, got {:?}", other),
    }
}

#[test]
fn interrupt_is_not_catchable_by_script() {
    let mut runtime = Runtime::new();
    let handle = runtime.interrupt_handle();
    let timer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        handle.interrupt("stop");
    });
    let err = runtime
        .eval(
            "loop.js",
            "for (;;) { try { for (var i = 0; i < 1000; i++) {} } catch (e) {} }",
        )
        .expect_err("catch must not swallow the interruption");
    timer.join().expect("timer thread");
    assert!(matches!(err, EngineError::Interrupted { .. }));
}

#[test]
fn the_flag_clears_after_propagation() {
    let mut runtime = Runtime::new();
    let handle = runtime.interrupt_handle();
    let timer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        handle.interrupt("once");
    });
    runtime
        .eval("loop.js", "for (;;) {}")
        .expect_err("interrupted");
    timer.join().expect("timer thread");
    // The next evaluation proceeds normally.
    let v = runtime.eval("ok.js", "40 + 2").expect("second run");
    assert!(v.strict_equals(&skiff_engine::Value::Int(42)));
}
