use tracing::trace;

use crate::common::opcode::Opcode;
use crate::common::value::{Handle, Value};
use crate::compiler::compile;
use crate::vm::heap::Heap;
use crate::vm::object::{
    BoundMethod, Class, Closure, Instance, Location, Native, NativeFn, Obj, Upvalue,
};
use crate::vm::table::Table;
use crate::vm::trace::Trace;

/// The call stack is bounded; the value stack grows with it.
const FRAMES_MAX: usize = 64;

/// One activation record: the closure being run, an instruction
/// pointer into its function's chunk, and the stack slot its window
/// starts at (slot zero holds the callee or the receiver).
#[derive(Debug)]
struct CallFrame {
    closure: Handle,
    /// The closure's function, cached to keep the dispatch loop off
    /// the closure indirection.
    function: Handle,
    ip: usize,
    base: usize,
}

/// What became of an `interpret` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// The virtual machine: a value stack, a call-frame stack, the global
/// environment, the list of open upvalues, and the heap everything
/// lives on. One `Vm` is one independent interpreter; nothing is
/// process-global.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Head of the open-upvalue list, sorted by descending stack slot.
    open_upvalues: Option<Handle>,
    /// The interned `"init"`, looked up on every class construction.
    init_string: Handle,
}

// This impl contains initialization, the public surface, and the
// plumbing the dispatch loop leans on; the impl below it holds the
// opcode implementations.
impl Vm {
    /// Creates an interpreter with the native bindings installed.
    pub fn new() -> Vm {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        heap.pin(init_string);

        let mut vm = Vm {
            heap,
            stack: vec![],
            frames: vec![],
            globals: Table::new(),
            open_upvalues: None,
            init_string,
        };

        crate::core::install(&mut vm);
        vm
    }

    /// Compiles and runs a script.
    /// Diagnostics go to stderr; the result says which phase failed,
    /// if any.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = match compile(source, &mut self.heap, &self.globals) {
            Some(function) => function,
            None => return InterpretResult::CompileError,
        };

        match self.run_function(function) {
            Ok(()) => InterpretResult::Ok,
            Err(trace) => {
                eprintln!("{}", trace);
                self.reset_stack();
                InterpretResult::RuntimeError
            },
        }
    }

    /// Wraps a compiled script in a closure, installs the first frame,
    /// and spins the dispatch loop.
    fn run_function(&mut self, function: Handle) -> Result<(), Trace> {
        // the function rides the stack while its closure is allocated
        self.push(Value::Obj(function));
        let closure = self.alloc(Obj::Closure(Closure {
            function,
            upvalues: vec![],
        }));
        self.pop();
        self.push(Value::Obj(closure));

        self.call(closure, 0)?;
        self.run()
    }

    /// Registers a host function under `name` in the globals.
    /// Both halves ride the value stack while the table takes them, so
    /// a collection between the two allocations can't eat either.
    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let name_handle = self.intern(name);
        self.push(Value::Obj(name_handle));
        let native = self.alloc(Obj::Native(Native { function }));
        self.push(Value::Obj(native));

        let hash = self.heap.str_hash(name_handle);
        self.globals.set(name_handle, hash, Value::Obj(native));

        self.pop();
        self.pop();
    }

    /// Reads a global by name, mostly useful for embedding and tests.
    pub fn get_global(&mut self, name: &str) -> Option<Value> {
        let handle = self.intern(name);
        let hash = self.heap.str_hash(handle);
        self.globals.get(handle, hash)
    }

    /// Renders a value the way `print` would.
    pub fn show(&self, value: Value) -> String {
        self.heap.show(value)
    }

    // stack plumbing

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => unreachable!("value stack underflow"),
        }
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    fn frame(&self) -> &CallFrame {
        match self.frames.last() {
            Some(frame) => frame,
            None => unreachable!("no active call frame"),
        }
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        match self.frames.last_mut() {
            Some(frame) => frame,
            None => unreachable!("no active call frame"),
        }
    }

    // operand reads, against the current frame's chunk

    fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let function = frame.function;
        let ip = frame.ip;
        frame.ip += 1;
        self.heap.function(function).chunk.code[ip]
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frame_mut();
        let function = frame.function;
        let ip = frame.ip;
        frame.ip += 2;
        self.heap.function(function).chunk.read_u16(ip)
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_u16() as usize;
        let function = self.frame().function;
        self.heap.function(function).chunk.constants[index]
    }

    /// Reads a constant that the compiler guaranteed is a name.
    fn read_string(&mut self) -> Handle {
        match self.read_constant() {
            Value::Obj(handle) => handle,
            other => unreachable!("name constant is not an object: {:?}", other),
        }
    }

    // allocation safepoints

    fn alloc(&mut self, obj: Obj) -> Handle {
        if self.heap.wants_gc() {
            self.collect_garbage();
        }
        self.heap.alloc(obj)
    }

    fn intern(&mut self, chars: &str) -> Handle {
        if self.heap.wants_gc() {
            self.collect_garbage();
        }
        self.heap.intern(chars)
    }

    fn intern_owned(&mut self, chars: String) -> Handle {
        if self.heap.wants_gc() {
            self.collect_garbage();
        }
        self.heap.intern_owned(chars)
    }

    /// Marks the VM roots and collects: every stack slot, every frame's
    /// closure, the open upvalues, the globals (keys and values), and
    /// the `"init"` name.
    fn collect_garbage(&mut self) {
        for value in &self.stack {
            self.heap.mark_value(*value);
        }

        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }

        let mut open = self.open_upvalues;
        while let Some(handle) = open {
            self.heap.mark_object(handle);
            open = self.heap.upvalue(handle).next;
        }

        for (key, value) in self.globals.iter() {
            self.heap.mark_object(key);
            self.heap.mark_value(value);
        }

        self.heap.mark_object(self.init_string);

        self.heap.collect();
    }

    // errors

    /// Builds a traceback for the current frame stack, innermost call
    /// first. The caller unwinds by returning it.
    fn runtime_error(&self, message: impl Into<String>) -> Trace {
        let mut trace = Trace::error(message);

        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            // the ip already sits past the faulting instruction
            let line = function.chunk.lines[frame.ip.saturating_sub(1)];
            let name = function.name.map(|name| self.heap.str(name).to_string());
            trace.add_context(line, name);
        }

        trace
    }

    fn undefined_variable(&self, name: Handle) -> Trace {
        self.runtime_error(format!("Undefined variable '{}'.", self.heap.str(name)))
    }

    // the dispatch loop

    fn run(&mut self) -> Result<(), Trace> {
        loop {
            let op = Opcode::from_byte(self.read_byte());
            trace!(target: "vm", "{:?}", op);

            match op {
                Opcode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                },
                Opcode::Nil => self.push(Value::Nil),
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),
                Opcode::Pop => {
                    self.pop();
                },

                Opcode::GetLocal => {
                    let slot = self.read_u16() as usize;
                    let base = self.frame().base;
                    self.push(self.stack[base + slot]);
                },
                Opcode::SetLocal => {
                    let slot = self.read_u16() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0);
                },

                Opcode::GetGlobal => self.op_get_global()?,
                Opcode::DefineGlobal => self.op_define_global(),
                Opcode::SetGlobal => self.op_set_global()?,

                Opcode::GetUpvalue => {
                    let index = self.read_u16() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                    let value = match self.heap.upvalue(upvalue).location {
                        Location::Open(slot) => self.stack[slot],
                        Location::Closed(value) => value,
                    };
                    self.push(value);
                },
                Opcode::SetUpvalue => {
                    let index = self.read_u16() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue).location {
                        Location::Open(slot) => self.stack[slot] = value,
                        Location::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).location = Location::Closed(value);
                        },
                    }
                },

                Opcode::GetProperty => self.op_get_property()?,
                Opcode::SetProperty => self.op_set_property()?,
                Opcode::GetSuper => {
                    let name = self.read_string();
                    let superclass = match self.pop() {
                        Value::Obj(handle) => handle,
                        other => unreachable!("'super' is not a class: {:?}", other),
                    };
                    self.bind_method(superclass, name)?;
                },

                Opcode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                },
                Opcode::Greater | Opcode::Less => self.op_comparison(op)?,
                Opcode::Add => self.op_add()?,
                Opcode::Subtract | Opcode::Multiply | Opcode::Divide => {
                    self.op_arithmetic(op)?
                },
                Opcode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                },
                Opcode::Negate => {
                    match self.peek(0).as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        },
                        None => return Err(self.runtime_error("Operand must be a number")),
                    }
                },

                Opcode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                },
                Opcode::JumpFalse => {
                    let offset = self.read_u16() as usize;
                    // the condition stays on the stack for `and`/`or`
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                },
                Opcode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                },

                Opcode::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)?;
                },
                Opcode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte();
                    self.invoke(name, arg_count)?;
                },
                Opcode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte();
                    let superclass = match self.pop() {
                        Value::Obj(handle) => handle,
                        other => unreachable!("'super' is not a class: {:?}", other),
                    };
                    self.invoke_from_class(superclass, name, arg_count)?;
                },

                Opcode::Closure => self.op_closure(),
                Opcode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                },
                Opcode::Return => {
                    let result = self.pop();
                    let frame = match self.frames.pop() {
                        Some(frame) => frame,
                        None => unreachable!("no active call frame"),
                    };
                    self.close_upvalues(frame.base);

                    if self.frames.is_empty() {
                        // pop the script closure; the stack is now empty
                        self.pop();
                        return Ok(());
                    }

                    self.stack.truncate(frame.base);
                    self.push(result);
                },

                Opcode::Class => {
                    let name = self.read_string();
                    let class = self.alloc(Obj::Class(Class {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class));
                },
                Opcode::Inherit => self.op_inherit()?,
                Opcode::Method => {
                    let name = self.read_string();
                    self.define_method(name);
                },
            }
        }
    }
}

// Opcode implementations and call machinery.
impl Vm {
    fn op_get_global(&mut self) -> Result<(), Trace> {
        let name = self.read_string();
        let hash = self.heap.str_hash(name);

        match self.globals.get(name, hash) {
            Some(value) => {
                self.push(value);
                Ok(())
            },
            None => Err(self.undefined_variable(name)),
        }
    }

    fn op_define_global(&mut self) {
        let name = self.read_string();
        let hash = self.heap.str_hash(name);
        let value = self.peek(0);
        self.globals.set(name, hash, value);
        self.pop();
    }

    fn op_set_global(&mut self) -> Result<(), Trace> {
        let name = self.read_string();
        let hash = self.heap.str_hash(name);
        let value = self.peek(0);

        // assignment must not create a global; undo the insert
        if self.globals.set(name, hash, value) {
            self.globals.delete(name, hash);
            return Err(self.undefined_variable(name));
        }

        Ok(())
    }

    fn as_instance(&self, value: Value) -> Option<Handle> {
        match value {
            Value::Obj(handle) => match self.heap.get(handle) {
                Obj::Instance(_) => Some(handle),
                _ => None,
            },
            _ => None,
        }
    }

    fn as_string(&self, value: Value) -> Option<Handle> {
        match value {
            Value::Obj(handle) => match self.heap.get(handle) {
                Obj::Str(_) => Some(handle),
                _ => None,
            },
            _ => None,
        }
    }

    fn op_get_property(&mut self) -> Result<(), Trace> {
        let name = self.read_string();

        let instance = match self.as_instance(self.peek(0)) {
            Some(instance) => instance,
            None => return Err(self.runtime_error("Only instances can have properties")),
        };

        let hash = self.heap.str_hash(name);
        if let Some(value) = self.heap.instance(instance).fields.get(name, hash) {
            self.pop(); // the instance
            self.push(value);
            return Ok(());
        }

        // not a field: fall back to a method, bound to this receiver
        let class = self.heap.instance(instance).class;
        self.bind_method(class, name)
    }

    fn op_set_property(&mut self) -> Result<(), Trace> {
        let name = self.read_string();

        let instance = match self.as_instance(self.peek(1)) {
            Some(instance) => instance,
            None => return Err(self.runtime_error("Only instances can have fields")),
        };

        let hash = self.heap.str_hash(name);
        let value = self.peek(0);
        self.heap
            .instance_mut(instance)
            .fields
            .set(name, hash, value);

        // leave the assigned value as the expression's result
        let value = self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn op_comparison(&mut self, op: Opcode) -> Result<(), Trace> {
        let (a, b) = (self.peek(1), self.peek(0));
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                let result = match op {
                    Opcode::Greater => a > b,
                    Opcode::Less => a < b,
                    _ => unreachable!("not a comparison opcode"),
                };
                self.push(Value::Bool(result));
                Ok(())
            },
            _ => Err(self.runtime_error("Operands must be numbers")),
        }
    }

    fn op_arithmetic(&mut self, op: Opcode) -> Result<(), Trace> {
        let (a, b) = (self.peek(1), self.peek(0));
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                let result = match op {
                    Opcode::Subtract => a - b,
                    Opcode::Multiply => a * b,
                    Opcode::Divide => a / b,
                    _ => unreachable!("not an arithmetic opcode"),
                };
                self.push(Value::Number(result));
                Ok(())
            },
            _ => Err(self.runtime_error("Operands must be numbers")),
        }
    }

    /// `+` is type-dispatched: two numbers add, two strings
    /// concatenate, anything else is an error.
    fn op_add(&mut self) -> Result<(), Trace> {
        let (a, b) = (self.peek(1), self.peek(0));

        if let (Some(a_str), Some(b_str)) = (self.as_string(a), self.as_string(b)) {
            // the operands stay peeked, so they are rooted while the
            // result is built and interned
            let combined = format!("{}{}", self.heap.str(a_str), self.heap.str(b_str));
            let result = self.intern_owned(combined);
            self.pop();
            self.pop();
            self.push(Value::Obj(result));
            return Ok(());
        }

        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b));
                Ok(())
            },
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
    }

    /// Installs a frame for `closure`. The callee and its arguments are
    /// already in place on the stack; slot zero of the frame is the
    /// callee itself (or the receiver, once a bound method rewrote it).
    fn call(&mut self, closure: Handle, arg_count: u8) -> Result<(), Trace> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;

        if arg_count != arity {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}",
                arity, arg_count,
            )));
        }

        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow"));
        }

        let base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            base,
        });

        Ok(())
    }

    /// Calls whatever sits beneath the arguments: a closure pushes a
    /// frame, a native runs inline, a class constructs, a bound method
    /// rebinds its receiver into slot zero.
    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), Trace> {
        let handle = match callee {
            Value::Obj(handle) => handle,
            _ => return Err(self.runtime_error("Can only call functions and classes")),
        };

        match self.heap.get(handle) {
            Obj::Closure(_) => self.call(handle, arg_count),

            Obj::Native(native) => {
                let function = native.function;
                let first = self.stack.len() - arg_count as usize;

                match function(&self.heap, &self.stack[first..]) {
                    Ok(result) => {
                        self.stack.truncate(first - 1);
                        self.push(result);
                        Ok(())
                    },
                    Err(message) => Err(self.runtime_error(message)),
                }
            },

            Obj::Class(_) => {
                // the class on the stack keeps itself rooted while the
                // instance is allocated into its slot
                let instance = self.alloc(Obj::Instance(Instance {
                    class: handle,
                    fields: Table::new(),
                }));
                let slot = self.stack.len() - arg_count as usize - 1;
                self.stack[slot] = Value::Obj(instance);

                let hash = self.heap.str_hash(self.init_string);
                match self.heap.class(handle).methods.get(self.init_string, hash) {
                    Some(Value::Obj(initializer)) => self.call(initializer, arg_count),
                    Some(other) => unreachable!("initializer is not a closure: {:?}", other),
                    None if arg_count != 0 => Err(self.runtime_error(format!(
                        "Expected 0 arguments but got {}",
                        arg_count,
                    ))),
                    None => Ok(()),
                }
            },

            Obj::BoundMethod(bound) => {
                let receiver = bound.receiver;
                let method = bound.method;
                let slot = self.stack.len() - arg_count as usize - 1;
                self.stack[slot] = receiver;
                self.call(method, arg_count)
            },

            _ => Err(self.runtime_error("Can only call functions and classes")),
        }
    }

    /// The hot path for `receiver.name(args)`: a field holding a
    /// callable is called as-is; otherwise the method is called
    /// directly off the class, skipping the bound-method allocation.
    fn invoke(&mut self, name: Handle, arg_count: u8) -> Result<(), Trace> {
        let receiver = self.peek(arg_count as usize);

        let instance = match self.as_instance(receiver) {
            Some(instance) => instance,
            None => return Err(self.runtime_error("Only instances have methods")),
        };

        let hash = self.heap.str_hash(name);
        if let Some(field) = self.heap.instance(instance).fields.get(name, hash) {
            let slot = self.stack.len() - arg_count as usize - 1;
            self.stack[slot] = field;
            return self.call_value(field, arg_count);
        }

        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(&mut self, class: Handle, name: Handle, arg_count: u8) -> Result<(), Trace> {
        let hash = self.heap.str_hash(name);
        match self.heap.class(class).methods.get(name, hash) {
            Some(Value::Obj(method)) => self.call(method, arg_count),
            Some(other) => unreachable!("method is not a closure: {:?}", other),
            None => Err(self.runtime_error(format!(
                "Undefined property '{}'",
                self.heap.str(name),
            ))),
        }
    }

    /// Replaces the receiver on top of the stack with a bound method
    /// wrapping it, or errors if the class has no such method.
    fn bind_method(&mut self, class: Handle, name: Handle) -> Result<(), Trace> {
        let hash = self.heap.str_hash(name);
        let method = match self.heap.class(class).methods.get(name, hash) {
            Some(Value::Obj(method)) => method,
            Some(other) => unreachable!("method is not a closure: {:?}", other),
            None => {
                return Err(self.runtime_error(format!(
                    "Undefined property '{}'",
                    self.heap.str(name),
                )))
            },
        };

        let receiver = self.peek(0);
        let bound = self.alloc(Obj::BoundMethod(BoundMethod { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    fn define_method(&mut self, name: Handle) {
        let method = self.peek(0);
        let class = match self.peek(1) {
            Value::Obj(handle) => handle,
            other => unreachable!("method defined on a non-class: {:?}", other),
        };

        let hash = self.heap.str_hash(name);
        self.heap.class_mut(class).methods.set(name, hash, method);
        self.pop();
    }

    fn op_closure(&mut self) {
        let function = match self.read_constant() {
            Value::Obj(handle) => handle,
            other => unreachable!("closure constant is not a function: {:?}", other),
        };
        let upvalue_count = self.heap.function(function).upvalue_count as usize;

        // the closure goes on the stack before its upvalues are
        // captured, so the capture allocations can't collect it
        let closure = self.alloc(Obj::Closure(Closure {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }));
        self.push(Value::Obj(closure));

        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_u16() as usize;

            let upvalue = if is_local {
                let base = self.frame().base;
                self.capture_upvalue(base + index)
            } else {
                self.heap.closure(self.frame().closure).upvalues[index]
            };

            self.heap.closure_mut(closure).upvalues.push(upvalue);
        }
    }

    fn op_inherit(&mut self) -> Result<(), Trace> {
        let superclass = match self.peek(1) {
            Value::Obj(handle) => match self.heap.get(handle) {
                Obj::Class(_) => handle,
                _ => return Err(self.runtime_error("Superclass must be a class")),
            },
            _ => return Err(self.runtime_error("Superclass must be a class")),
        };

        let subclass = match self.peek(0) {
            Value::Obj(handle) => handle,
            other => unreachable!("inheriting into a non-class: {:?}", other),
        };

        // copy-down inheritance: the subclass starts from a snapshot of
        // the superclass's methods, then overrides land on top
        let methods = self.heap.class(superclass).methods.clone();
        self.heap.class_mut(subclass).methods.extend_from(&methods);

        self.pop(); // the subclass; the superclass stays as `super`
        Ok(())
    }

    /// Finds or creates the open upvalue for an absolute stack slot.
    /// The list is sorted by descending slot, so the walk stops at the
    /// first upvalue at or below the target.
    fn capture_upvalue(&mut self, slot: usize) -> Handle {
        let mut prev = None;
        let mut current = self.open_upvalues;

        while let Some(handle) = current {
            let upvalue = self.heap.upvalue(handle);
            let (location, next) = (upvalue.location, upvalue.next);

            match location {
                Location::Open(open) if open > slot => {
                    prev = Some(handle);
                    current = next;
                },
                Location::Open(open) if open == slot => return handle,
                Location::Open(_) => break,
                Location::Closed(_) => unreachable!("closed upvalue on the open list"),
            }
        }

        let created = self.alloc(Obj::Upvalue(Upvalue {
            location: Location::Open(slot),
            next: current,
        }));

        match prev {
            None => self.open_upvalues = Some(created),
            Some(prev) => self.heap.upvalue_mut(prev).next = Some(created),
        }

        created
    }

    /// Closes every open upvalue at or above `last`: the stack value
    /// moves into the upvalue and the upvalue leaves the open list.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(handle) = self.open_upvalues {
            let upvalue = self.heap.upvalue(handle);
            let (location, next) = (upvalue.location, upvalue.next);

            let slot = match location {
                Location::Open(slot) => slot,
                Location::Closed(_) => unreachable!("closed upvalue on the open list"),
            };
            if slot < last {
                break;
            }

            let value = self.stack[slot];
            let upvalue = self.heap.upvalue_mut(handle);
            upvalue.location = Location::Closed(value);
            upvalue.next = None;
            self.open_upvalues = next;
        }
    }
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn run(source: &str) -> Vm {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret(source), InterpretResult::Ok);
        vm
    }

    fn number_global(vm: &mut Vm, name: &str) -> f64 {
        match vm.get_global(name) {
            Some(Value::Number(n)) => n,
            other => panic!("global {} is {:?}", name, other),
        }
    }

    fn run_for_trace(source: &str) -> Trace {
        let mut vm = Vm::new();
        let function =
            compile(source, &mut vm.heap, &vm.globals).expect("script should compile");
        vm.run_function(function).expect_err("script should fail")
    }

    #[test]
    fn arithmetic() {
        let mut vm = run("var r = 1 + 2 * 3;");
        assert_eq!(number_global(&mut vm, "r"), 7.0);
    }

    #[test]
    fn comparison_and_logic() {
        let mut vm = run(
            "var a = 1 < 2 and 2 <= 2;\n\
             var b = 1 > 2 or !false;\n\
             var c = 1 == 1;\n\
             var d = 1 != 1;\n\
             var e = nil == false;",
        );
        assert_eq!(vm.get_global("a"), Some(Value::Bool(true)));
        assert_eq!(vm.get_global("b"), Some(Value::Bool(true)));
        assert_eq!(vm.get_global("c"), Some(Value::Bool(true)));
        assert_eq!(vm.get_global("d"), Some(Value::Bool(false)));
        assert_eq!(vm.get_global("e"), Some(Value::Bool(false)));
    }

    #[test]
    fn concatenation_interns_the_result() {
        let mut vm = run("var a = \"he\"; var b = \"llo\"; var c = a + b;");

        let c = match vm.get_global("c") {
            Some(Value::Obj(handle)) => handle,
            other => panic!("c is {:?}", other),
        };
        assert_eq!(vm.heap.str(c), "hello");

        // re-interning must hand back the same object
        assert_eq!(vm.heap.intern("hello"), c);
    }

    #[test]
    fn control_flow() {
        let mut vm = run(
            "var r = 0;\n\
             for (var i = 0; i < 5; i = i + 1) { r = r + i; }\n\
             while (r < 20) { r = r + 5; }\n\
             if (r == 20) { r = r + 1; } else { r = 0; }",
        );
        assert_eq!(number_global(&mut vm, "r"), 21.0);
    }

    #[test]
    fn closures_count() {
        let mut vm = run(
            "fn makeCounter() {\n\
               var n = 0;\n\
               fn inc() { n = n + 1; return n; }\n\
               return inc;\n\
             }\n\
             var c = makeCounter();\n\
             var a = c(); var b = c(); var d = c();",
        );

        assert_eq!(number_global(&mut vm, "a"), 1.0);
        assert_eq!(number_global(&mut vm, "b"), 2.0);
        assert_eq!(number_global(&mut vm, "d"), 3.0);

        // everything returned; no upvalue may still point at the stack
        assert!(vm.open_upvalues.is_none());
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn sibling_closures_share_a_variable() {
        let mut vm = run(
            "fn pair() {\n\
               var n = 0;\n\
               fn up() { n = n + 1; return n; }\n\
               fn down() { n = n - 1; return n; }\n\
               up(); up();\n\
               return down;\n\
             }\n\
             var r = pair()();",
        );
        assert_eq!(number_global(&mut vm, "r"), 1.0);
    }

    #[test]
    fn classes_with_initializer() {
        let mut vm = run(
            "class Box {\n\
               init(v) { this.v = v; }\n\
               get() { return this.v; }\n\
             }\n\
             var b = Box(41);\n\
             var r = b.get() + 1;",
        );
        assert_eq!(number_global(&mut vm, "r"), 42.0);
    }

    #[test]
    fn bound_methods_remember_their_receiver() {
        let mut vm = run(
            "class Box { init(v) { this.v = v; } get() { return this.v; } }\n\
             var m = Box(7).get;\n\
             var r = m();",
        );
        assert_eq!(number_global(&mut vm, "r"), 7.0);
    }

    #[test]
    fn fields_shadow_methods_on_invoke() {
        let mut vm = run(
            "fn three() { return 3; }\n\
             class Box { get() { return 4; } }\n\
             var b = Box();\n\
             b.get = three;\n\
             var r = b.get();",
        );
        assert_eq!(number_global(&mut vm, "r"), 3.0);
    }

    #[test]
    fn inheritance_and_super() {
        let mut vm = run(
            "class A { hi() { return \"A\"; } }\n\
             class B < A {}\n\
             var r = B().hi();",
        );
        let r = vm.get_global("r").and_then(|v| v.as_obj()).unwrap();
        assert_eq!(vm.heap.str(r), "A");

        let mut vm = run(
            "class A { hi() { return 1; } }\n\
             class B < A { hi() { return super.hi() + 1; } }\n\
             var r = B().hi();",
        );
        assert_eq!(number_global(&mut vm, "r"), 2.0);
    }

    #[test]
    fn natives() {
        let mut vm = run(
            "var n = len(\"abc\");\n\
             var t = clock();\n\
             var p = print(\"printed from a test\");",
        );
        assert_eq!(number_global(&mut vm, "n"), 3.0);
        assert!(number_global(&mut vm, "t") >= 0.0);
        assert_eq!(vm.get_global("p"), Some(Value::Nil));
    }

    #[test]
    fn runtime_error_carries_a_trace() {
        let trace = run_for_trace("fn f() { return 1 + \"x\"; } f();");
        let rendered = format!("{}", trace);
        assert!(rendered.contains("Operands must be two numbers or two strings."));
        assert!(rendered.contains("[line 1] in f()"));
        assert!(rendered.contains("[line 1] in script"));
    }

    #[test]
    fn error_paths() {
        let cases = [
            "missing;",
            "missing = 1;",
            "1();",
            "var x = 1; x.field;",
            "var x = 1; x.field = 2;",
            "fn f(a) {} f();",
            "class Box {} Box(1);",
            "var NotClass = 1; class Sub < NotClass {}",
            "-\"x\";",
            "1 < \"x\";",
            "class Box {} Box().missing;",
            "fn f() { f(); } f();",
        ];

        for source in cases {
            let mut vm = Vm::new();
            assert_eq!(
                vm.interpret(source),
                InterpretResult::RuntimeError,
                "{:?} should fail at runtime",
                source,
            );
            // a runtime error unwinds everything
            assert!(vm.stack.is_empty());
            assert!(vm.frames.is_empty());
        }
    }

    #[test]
    fn stack_overflow_mentions_itself() {
        let trace = run_for_trace("fn f() { f(); } f();");
        assert!(format!("{}", trace).starts_with("Stack overflow"));
    }

    #[test]
    fn stress_gc_does_not_change_behavior() {
        let source = "fn makeCounter() {\n\
                        var n = 0;\n\
                        fn inc() { n = n + 1; return n; }\n\
                        return inc;\n\
                      }\n\
                      var c = makeCounter();\n\
                      c(); c();\n\
                      class Box { init(v) { this.v = v; } get() { return this.v; } }\n\
                      var r = Box(c() + 38).get() + len(\"a\" + \"bc\");";

        let mut vm = Vm::new();
        vm.heap.stress = true;
        assert_eq!(vm.interpret(source), InterpretResult::Ok);
        assert_eq!(number_global(&mut vm, "r"), 44.0);
    }

    #[test]
    fn collection_keeps_only_reachable_objects() {
        let mut vm = run(
            "var keep = \"kept string\";\n\
             { var a = \"dropped one\"; var b = \"dropped two\"; }",
        );

        let before = vm.heap.live_count();
        vm.collect_garbage();
        let after = vm.heap.live_count();
        assert!(after <= before);

        // a second collection with the same roots frees nothing more
        vm.collect_garbage();
        assert_eq!(vm.heap.live_count(), after);

        let keep = vm.get_global("keep").and_then(|v| v.as_obj()).unwrap();
        assert_eq!(vm.heap.str(keep), "kept string");
    }

    #[test]
    fn repeated_interpret_calls_share_globals() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("var a = 1;"), InterpretResult::Ok);
        assert_eq!(vm.interpret("var b = a + 1;"), InterpretResult::Ok);
        assert_eq!(number_global(&mut vm, "b"), 2.0);
    }
}
