//! The native function bindings every interpreter starts with.
//! Natives run inside the calling frame: no bytecode, no call frame of
//! their own, and an `Err` surfaces as a runtime error at the call.

use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::common::value::Value;
use crate::vm::heap::Heap;
use crate::vm::vm::Vm;

/// Installs the standard bindings into a fresh interpreter.
pub fn install(vm: &mut Vm) {
    vm.define_native("clock", clock);
    vm.define_native("print", print);
    vm.define_native("len", len);
    vm.define_native("exit", exit);
}

/// Seconds since the Unix epoch, as a number. Useful for timing scripts.
fn clock(_heap: &Heap, _args: &[Value]) -> Result<Value, String> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "System clock is before the epoch".to_string())?;

    Ok(Value::Number(elapsed.as_secs_f64()))
}

/// Prints every argument, then one newline. Returns nil.
fn print(heap: &Heap, args: &[Value]) -> Result<Value, String> {
    for arg in args {
        print!("{}", heap.show(*arg));
    }
    println!();

    Ok(Value::Nil)
}

/// The length of a string; nil for everything else.
fn len(heap: &Heap, args: &[Value]) -> Result<Value, String> {
    if let [Value::Obj(handle)] = args {
        if let crate::vm::object::Obj::Str(string) = heap.get(*handle) {
            return Ok(Value::Number(string.chars.len() as f64));
        }
    }

    Ok(Value::Nil)
}

/// Terminates the process, with the given numeric status or 0.
fn exit(_heap: &Heap, args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::Number(code)] => process::exit(*code as i32),
        _ => process::exit(0),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn len_of_strings_and_others() {
        let mut heap = Heap::new();
        let hello = heap.intern("hello");

        assert_eq!(
            len(&heap, &[Value::Obj(hello)]),
            Ok(Value::Number(5.0)),
        );
        assert_eq!(len(&heap, &[Value::Number(3.0)]), Ok(Value::Nil));
        assert_eq!(len(&heap, &[]), Ok(Value::Nil));
    }

    #[test]
    fn clock_moves_forward() {
        let heap = Heap::new();
        let a = clock(&heap, &[]).unwrap();
        let b = clock(&heap, &[]).unwrap();
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => assert!(b >= a),
            other => panic!("clock returned {:?}", other),
        }
    }
}
