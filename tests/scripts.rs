//! End-to-end scenarios driven through the public interface:
//! source in, interpret result and observable globals out.

use iii::common::value::Value;
use iii::vm::heap::Heap;
use iii::{InterpretResult, Vm};

fn run(source: &str) -> Vm {
    let mut vm = Vm::new();
    assert_eq!(vm.interpret(source), InterpretResult::Ok, "{:?}", source);
    vm
}

fn shown(vm: &mut Vm, name: &str) -> String {
    let value = vm.get_global(name).expect("global should be defined");
    vm.show(value)
}

#[test]
fn arithmetic_precedence() {
    let mut vm = run("var r = 1 + 2 * 3;");
    assert_eq!(shown(&mut vm, "r"), "7");
}

#[test]
fn string_concatenation() {
    let mut vm = run("var a = \"he\"; var b = \"llo\"; var c = a + b;");
    assert_eq!(shown(&mut vm, "c"), "hello");

    // interning: the concatenated value and a fresh literal are the
    // same object, so they compare equal by identity
    let mut vm = run(
        "var a = \"he\"; var b = \"llo\";\n\
         var same = (a + b) == \"hello\";",
    );
    assert_eq!(vm.get_global("same"), Some(Value::Bool(true)));
}

#[test]
fn counter_closure() {
    let mut vm = run(
        "fn makeCounter() {\n\
           var n = 0;\n\
           fn inc() { n = n + 1; return n; }\n\
           return inc;\n\
         }\n\
         var c = makeCounter();\n\
         var a = c(); var b = c(); var d = c();",
    );
    assert_eq!(shown(&mut vm, "a"), "1");
    assert_eq!(shown(&mut vm, "b"), "2");
    assert_eq!(shown(&mut vm, "d"), "3");
}

#[test]
fn classes_with_initializer_and_method() {
    let mut vm = run(
        "class Box {\n\
           init(v) { this.v = v; }\n\
           get() { return this.v; }\n\
         }\n\
         var b = Box(41);\n\
         var r = b.get() + 1;",
    );
    assert_eq!(shown(&mut vm, "r"), "42");
}

#[test]
fn superclass_methods_are_inherited() {
    let mut vm = run(
        "class A { hi() { return \"A\"; } }\n\
         class B < A {}\n\
         var r = B().hi();",
    );
    assert_eq!(shown(&mut vm, "r"), "A");
}

#[test]
fn runtime_error_unwinds() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret("fn f() { return 1 + \"x\"; } f();"),
        InterpretResult::RuntimeError,
    );

    // the VM stays usable afterwards
    assert_eq!(vm.interpret("var ok = 1;"), InterpretResult::Ok);
    assert_eq!(shown(&mut vm, "ok"), "1");
}

#[test]
fn compile_error_is_distinguished() {
    let mut vm = Vm::new();
    assert_eq!(vm.interpret("var = 1;"), InterpretResult::CompileError);
    assert_eq!(vm.interpret("a + b = 1;"), InterpretResult::CompileError);
}

#[test]
fn fib_exercises_calls_and_branches() {
    let mut vm = run(
        "fn fib(n) {\n\
           if (n < 2) { return n; }\n\
           return fib(n - 1) + fib(n - 2);\n\
         }\n\
         var r = fib(12);",
    );
    assert_eq!(shown(&mut vm, "r"), "144");
}

#[test]
fn shadowing_and_scopes() {
    let mut vm = run(
        "var x = \"global\";\n\
         var seen = nil;\n\
         {\n\
           var x = \"local\";\n\
           seen = x;\n\
         }\n\
         var after = x;",
    );
    assert_eq!(shown(&mut vm, "seen"), "local");
    assert_eq!(shown(&mut vm, "after"), "global");
}

#[test]
fn values_render_like_print() {
    let mut vm = run(
        "fn f() {}\n\
         class A {}\n\
         var g = f;\n\
         var k = A;\n\
         var i = A();\n\
         var m = nil;\n\
         var n = 2.5;\n\
         var t = true;",
    );
    assert_eq!(shown(&mut vm, "g"), "<fn f>");
    assert_eq!(shown(&mut vm, "k"), "A");
    assert_eq!(shown(&mut vm, "i"), "A instance");
    assert_eq!(shown(&mut vm, "m"), "nil");
    assert_eq!(shown(&mut vm, "n"), "2.5");
    assert_eq!(shown(&mut vm, "t"), "true");
}

#[test]
fn host_natives_can_be_registered() {
    fn double(_heap: &Heap, args: &[Value]) -> Result<Value, String> {
        match args {
            [Value::Number(n)] => Ok(Value::Number(n * 2.0)),
            _ => Err("double expects one number".to_string()),
        }
    }

    let mut vm = Vm::new();
    vm.define_native("double", double);

    assert_eq!(vm.interpret("var r = double(21);"), InterpretResult::Ok);
    assert_eq!(shown(&mut vm, "r"), "42");

    // a native error is an ordinary runtime error
    assert_eq!(
        vm.interpret("double(\"x\");"),
        InterpretResult::RuntimeError,
    );
}

#[test]
fn heavy_allocation_survives_collection() {
    // churn out enough short-lived instances to cross the collection
    // threshold several times over; only the last one stays reachable
    let mut vm = run(
        "class Box { init(v) { this.v = v; } }\n\
         var last = nil;\n\
         for (var i = 0; i < 20000; i = i + 1) {\n\
           last = Box(i);\n\
         }\n\
         var n = last.v;",
    );
    assert_eq!(shown(&mut vm, "n"), "19999");
}
