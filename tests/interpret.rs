//! End-to-end tests: whole programs through the engine, asserting on
//! captured `print` output and on the reported result.

use std::cell::RefCell;
use std::fs;
use std::io::Write;
use std::process::Command;
use std::rc::Rc;

use quill::value::{FileHandle, Value};
use quill::vm::{ExecutionEngine, ExecutionResult};

fn quill() -> Command {
    Command::new(env!("CARGO_BIN_EXE_quill"))
}

#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn engine() -> (ExecutionEngine, SharedBuf) {
    let buf = SharedBuf::default();
    let engine = ExecutionEngine::with_output(Box::new(buf.clone()));
    (engine, buf)
}

fn run(source: &str) -> (ExecutionResult, String) {
    let (mut engine, out) = engine();
    let result = engine.interpret(source);
    (result, out.contents())
}

#[test]
fn fibonacci() {
    let source = "
        func fib(n) {
            if (n < 2) return n;
            return fib(n - 1) + fib(n - 2);
        }
        for (var i = 0; i < 8; i = i + 1) print fib(i);
    ";
    let (result, output) = run(source);
    assert_eq!(result, ExecutionResult::Ok);
    assert_eq!(output, "0\n1\n1\n2\n3\n5\n8\n13\n");
}

#[test]
fn string_building_in_a_loop() {
    let source = "
        var line = \"\";
        for (var i = 1; i < 4; i = i + 1) {
            line = line + i + \",\";
        }
        print line;
    ";
    let (result, output) = run(source);
    assert_eq!(result, ExecutionResult::Ok);
    assert_eq!(output, "1,2,3,\n");
}

#[test]
fn counters_are_independent_closures() {
    let source = "
        func make_counter() {
            var count = 0;
            func next() {
                count = count + 1;
                return count;
            }
            return next;
        }
        var a = make_counter();
        var b = make_counter();
        print a();
        print a();
        print b();
        print a();
    ";
    let (result, output) = run(source);
    assert_eq!(result, ExecutionResult::Ok);
    assert_eq!(output, "1\n2\n1\n3\n");
}

#[test]
fn class_hierarchy_with_initializers() {
    let source = "
        class Shape {
            init(name) { this.name = name; }
            describe() { return this.name + \" with area \" + this.area(); }
        }
        class Square < Shape {
            init(side) {
                this.name = \"square\";
                this.side = side;
            }
            area() { return this.side * this.side; }
        }
        print Square(4).describe();
    ";
    let (result, output) = run(source);
    assert_eq!(result, ExecutionResult::Ok);
    assert_eq!(output, "square with area 16\n");
}

#[test]
fn super_dispatch_uses_the_declaring_class() {
    let source = "
        class A {
            greet() { return \"A\"; }
            both() { return this.greet() + \"!\"; }
        }
        class B < A {
            greet() { return \"B\"; }
            loud() { return super.greet() + this.greet(); }
        }
        print B().loud();
        print B().both();
    ";
    let (result, output) = run(source);
    assert_eq!(result, ExecutionResult::Ok);
    assert_eq!(output, "AB\nB!\n");
}

#[test]
fn subclass_inherits_the_initializer() {
    let source = "
        class Named {
            init(name) { this.name = name; }
            who() { return this.name; }
        }
        class Dog < Named {
            speak() { return this.who() + \" says woof\"; }
        }
        print Dog(\"rex\").speak();
    ";
    let (result, output) = run(source);
    assert_eq!(result, ExecutionResult::Ok);
    assert_eq!(output, "rex says woof\n");
}

#[test]
fn arrays_of_mixed_values() {
    let source = "
        var items = [1, \"two\", true, null];
        print items;
        items[1] = 2;
        print items[1] + items[0];
    ";
    let (result, output) = run(source);
    assert_eq!(result, ExecutionResult::Ok);
    assert_eq!(output, "[1, two, true, null]\n3\n");
}

#[test]
fn array_out_of_bounds_unwinds() {
    let (result, output) = run("var a = [1, 2]; print \"before\"; a[5]; print \"after\";");
    assert_eq!(result, ExecutionResult::RuntimeError);
    assert_eq!(output, "before\n");
}

#[test]
fn repl_style_session_keeps_globals() {
    let (mut engine, out) = engine();
    assert_eq!(engine.interpret("var total = 0;"), ExecutionResult::Ok);
    assert_eq!(
        engine.interpret("func bump(n) { total = total + n; }"),
        ExecutionResult::Ok
    );
    assert_eq!(engine.interpret("bump(2); bump(3);"), ExecutionResult::Ok);
    assert_eq!(engine.interpret("print total;"), ExecutionResult::Ok);
    assert_eq!(out.contents(), "5\n");
}

#[test]
fn session_recovers_after_errors() {
    let (mut engine, out) = engine();
    assert_eq!(engine.interpret("var x = ;"), ExecutionResult::CompileError);
    assert_eq!(engine.interpret("undefined();"), ExecutionResult::RuntimeError);
    assert_eq!(engine.interpret("var x = 7; print x;"), ExecutionResult::Ok);
    assert_eq!(out.contents(), "7\n");
}

#[test]
fn script_loaded_from_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("script.ql");
    fs::write(&path, "print 1 + 2;").unwrap();

    let source = fs::read_to_string(&path).unwrap();
    let (result, output) = run(&source);
    assert_eq!(result, ExecutionResult::Ok);
    assert_eq!(output, "3\n");
}

#[test]
fn binary_runs_a_script_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sum.ql");
    fs::write(&path, "print 1 + 2;").unwrap();

    let output = quill().arg(&path).output().unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "3\n");
}

#[test]
fn binary_exit_codes_distinguish_error_kinds() {
    let dir = tempfile::tempdir().unwrap();

    let bad_syntax = dir.path().join("bad.ql");
    fs::write(&bad_syntax, "var x = ;").unwrap();
    let output = quill().arg(&bad_syntax).output().unwrap();
    assert_eq!(output.status.code(), Some(65));
    assert!(String::from_utf8_lossy(&output.stderr).contains("[line 1] Error"));

    let bad_call = dir.path().join("crash.ql");
    fs::write(&bad_call, "var f = 1; f();").unwrap();
    let output = quill().arg(&bad_call).output().unwrap();
    assert_eq!(output.status.code(), Some(70));
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("Can only call functions and classes.")
    );
}

#[test]
fn binary_dumps_bytecode_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump.ql");
    fs::write(&path, "print 1;").unwrap();

    let output = quill().arg("--dump-bytecode").arg(&path).output().unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["arity"], 0);
    assert!(json["instructions"].as_array().is_some_and(|ops| !ops.is_empty()));
}

#[test]
fn dump_bytecode_requires_a_script() {
    let output = quill().arg("--dump-bytecode").output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("required"));
}

#[test]
fn file_natives_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.txt");
    let path_text = path.to_string_lossy().into_owned();

    let (mut engine, out) = engine();
    engine.define_native("open", |args| match args {
        [Value::Str(path), Value::Str(mode)] => {
            Ok(Value::File(Rc::new(FileHandle::open(path, mode)?)))
        }
        _ => Err("open expects a path and a mode.".to_string()),
    });
    engine.define_native("read_file", |args| match args {
        [Value::File(handle)] => Ok(Value::from(handle.read_all()?)),
        _ => Err("read_file expects a file.".to_string()),
    });
    engine.define_native("write_file", |args| match args {
        [Value::File(handle), Value::Str(data)] => {
            handle.write_all(data)?;
            Ok(Value::Null)
        }
        _ => Err("write_file expects a file and a string.".to_string()),
    });
    engine.define_native("close_file", |args| match args {
        [Value::File(handle)] => {
            handle.close();
            Ok(Value::Null)
        }
        _ => Err("close_file expects a file.".to_string()),
    });

    let source = format!(
        "
        var f = open(\"{path_text}\", \"w\");
        write_file(f, \"hello files\");
        close_file(f);
        var g = open(\"{path_text}\", \"r\");
        print read_file(g);
        close_file(g);
        "
    );
    assert_eq!(engine.interpret(&source), ExecutionResult::Ok);
    assert_eq!(out.contents(), "hello files\n");
    assert_eq!(fs::read_to_string(&path).unwrap(), "hello files");
}

#[test]
fn native_functions_mix_with_script_code() {
    let (mut engine, out) = engine();
    engine.define_native("halve", |args| match args {
        [Value::Number(n)] => Ok(Value::Number(n / 2.0)),
        _ => Err("halve expects one number.".to_string()),
    });
    let source = "
        func apply_twice(f, x) { return f(f(x)); }
        print apply_twice(halve, 100);
    ";
    assert_eq!(engine.interpret(source), ExecutionResult::Ok);
    assert_eq!(out.contents(), "25\n");
}

#[test]
fn bound_methods_can_outlive_their_access() {
    let source = "
        class Cell {
            init(v) { this.v = v; }
            get() { return this.v; }
        }
        var cells = [Cell(1).get, Cell(2).get];
        print cells[0]() + cells[1]();
    ";
    let (result, output) = run(source);
    assert_eq!(result, ExecutionResult::Ok);
    assert_eq!(output, "3\n");
}

#[test]
fn field_shadows_method_on_invoke() {
    let source = "
        class Box {
            act() { return \"method\"; }
        }
        var b = Box();
        print b.act();
        b.act = Box().act;
        print b.act();
    ";
    let (result, output) = run(source);
    assert_eq!(result, ExecutionResult::Ok);
    assert_eq!(output, "method\nmethod\n");
}
