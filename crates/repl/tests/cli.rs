//! Black-box tests of the `skiff` binary.

use std::io::Write;
use std::process::Command;

fn skiff() -> Command {
    Command::new(env!("CARGO_BIN_EXE_skiff"))
}

#[test]
fn evaluates_an_inline_expression() {
    let out = skiff()
        .args(["-e", "40 + 2"])
        .output()
        .expect("run skiff");
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "42");
}

#[test]
fn runs_a_script_file() {
    let mut file = tempfile::Builder::new()
        .suffix(".js")
        .tempfile()
        .expect("temp file");
    writeln!(file, "console.log('hello from ' + 'skiff');").expect("write script");
    let out = skiff()
        .arg(file.path())
        .output()
        .expect("run skiff");
    assert!(out.status.success());
    assert_eq!(
        String::from_utf8_lossy(&out.stdout).trim(),
        "hello from skiff"
    );
}

#[test]
fn script_errors_exit_nonzero_with_a_trace() {
    let out = skiff()
        .args(["-e", "(function boom() { throw new TypeError('bad'); })()"])
        .output()
        .expect("run skiff");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("TypeError: bad"));
    assert!(stderr.contains("boom"));
}

#[test]
fn syntax_errors_point_at_the_source() {
    let out = skiff().args(["-e", "var = 1"]).output().expect("run skiff");
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("SyntaxError"));
}
