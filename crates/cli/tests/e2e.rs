//! End-to-end tests: write a script to a temp file, run the `ember` binary
//! against it, and check stdout/stderr/exit code. These exercise the full
//! scan -> compile -> run pipeline through the actual executable rather
//! than calling `Vm` directly.

use std::io::Write;
use std::process::Command;

fn run_script(source: &str) -> (std::process::Output, tempfile::NamedTempFile) {
    let mut file = tempfile::NamedTempFile::new().expect("create temp script");
    file.write_all(source.as_bytes()).expect("write script");
    let output = Command::new(env!("CARGO_BIN_EXE_ember"))
        .arg(file.path())
        .output()
        .expect("run ember binary");
    (output, file)
}

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn arithmetic_prints_expected_value() {
    let (output, _file) = run_script("println(1 + 2 * 3);");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout(&output), "7\n");
}

#[test]
fn globals_and_conditionals() {
    let (output, _file) = run_script(
        "var x = 10;
         if (x > 5) { println(\"big\"); } else { println(\"small\"); }",
    );
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout(&output), "big\n");
}

#[test]
fn closures_capture_the_loop_variable_at_creation() {
    let (output, _file) = run_script(
        "fun make(n) { return () -> n; }
         var a = make(1);
         var b = make(2);
         println(a());
         println(b());",
    );
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout(&output), "1\n2\n");
}

#[test]
fn recursive_fibonacci() {
    let (output, _file) = run_script(
        "fun fib(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); }
         println(fib(10));",
    );
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout(&output), "55\n");
}

#[test]
fn equal_string_literals_compare_equal_via_interning() {
    let (output, _file) = run_script(
        "var a = \"hi\" + \"\";
         var b = \"hi\";
         println(a == b);",
    );
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout(&output), "true\n");
}

#[test]
fn undefined_variable_is_a_runtime_error_with_nonzero_exit() {
    let (output, _file) = run_script("println(doesNotExist);");
    assert_eq!(output.status.code(), Some(3));
    assert!(stderr(&output).contains("Runtime error"));
}

#[test]
fn syntax_error_exits_with_compile_error_code() {
    let (output, _file) = run_script("var x = ;");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn missing_script_file_exits_with_no_file_code() {
    let output = Command::new(env!("CARGO_BIN_EXE_ember"))
        .arg("/nonexistent/path/does_not_exist.ember")
        .output()
        .expect("run ember binary");
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn dump_flag_prints_disassembly_before_running() {
    let mut file = tempfile::NamedTempFile::new().expect("create temp script");
    file.write_all(b"println(1 + 1);").expect("write script");
    let output = Command::new(env!("CARGO_BIN_EXE_ember"))
        .arg("--dump")
        .arg(file.path())
        .output()
        .expect("run ember binary");
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("PUSH_CONST") || stdout(&output).contains("RET"));
}
