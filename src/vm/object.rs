use std::mem;

use crate::common::chunk::Chunk;
use crate::common::value::{Handle, Value};
use crate::vm::heap::Heap;
use crate::vm::table::Table;

/// The signature of a host-provided native function.
/// Natives receive the heap (to read strings and render values)
/// and a slice of arguments; an `Err` becomes a runtime error
/// in the calling frame.
pub type NativeFn = fn(&Heap, &[Value]) -> Result<Value, String>;

/// An interned, immutable string.
/// At most one `Str` with any given byte sequence exists on the heap,
/// so handle equality is byte equality.
#[derive(Debug)]
pub struct Str {
    pub chars: Box<str>,
    pub hash: u32,
}

/// A compiled function: its bytecode plus the shape of its frame.
#[derive(Debug)]
pub struct Function {
    pub arity: u8,
    pub upvalue_count: u16,
    pub chunk: Chunk,
    /// `None` for the top-level script.
    pub name: Option<Handle>,
}

impl Function {
    pub fn new(name: Option<Handle>) -> Function {
        Function {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::empty(),
            name,
        }
    }
}

#[derive(Debug)]
pub struct Native {
    pub function: NativeFn,
}

/// A function paired with the upvalues it captured.
/// `upvalues.len()` always equals the function's `upvalue_count`
/// once construction finishes.
#[derive(Debug)]
pub struct Closure {
    pub function: Handle,
    pub upvalues: Vec<Handle>,
}

/// Where an upvalue's value currently lives.
#[derive(Debug, Clone, Copy)]
pub enum Location {
    /// Still on the VM value stack, at this absolute slot index.
    Open(usize),
    /// Hoisted off the stack into the upvalue itself.
    Closed(Value),
}

/// A first-class reference to a local of an enclosing function.
/// Open upvalues form a singly linked list threaded through `next`,
/// kept sorted by descending stack slot.
#[derive(Debug)]
pub struct Upvalue {
    pub location: Location,
    pub next: Option<Handle>,
}

#[derive(Debug)]
pub struct Class {
    pub name: Handle,
    /// method name -> closure value
    pub methods: Table,
}

#[derive(Debug)]
pub struct Instance {
    pub class: Handle,
    pub fields: Table,
}

/// A method plucked off an instance: remembers its receiver so a later
/// call can re-install it in slot zero.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Handle,
}

/// A heap-allocated object.
/// The registry stores these; everything else refers to them by [`Handle`].
#[derive(Debug)]
pub enum Obj {
    Str(Str),
    Function(Function),
    Native(Native),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
}

impl Obj {
    /// An estimate of the bytes this object keeps alive, used to drive
    /// the collection trigger. Counts the object itself plus owned
    /// buffers, the same accounting the allocator macros of a manual
    /// implementation would see.
    pub fn size_hint(&self) -> usize {
        let owned = match self {
            Obj::Str(s) => s.chars.len(),
            Obj::Function(f) => {
                f.chunk.code.capacity()
                    + f.chunk.lines.capacity() * mem::size_of::<u32>()
                    + f.chunk.constants.capacity() * mem::size_of::<Value>()
            },
            Obj::Closure(c) => c.upvalues.capacity() * mem::size_of::<Handle>(),
            Obj::Class(c) => c.methods.byte_size(),
            Obj::Instance(i) => i.fields.byte_size(),
            Obj::Native(_) | Obj::Upvalue(_) | Obj::BoundMethod(_) => 0,
        };

        mem::size_of::<Obj>() + owned
    }

    /// Appends every handle and value this object refers to.
    /// This is the per-type referent table the mark phase traces through:
    /// strings and natives have no referents; everything else points at
    /// other heap objects.
    pub fn collect_refs(&self, refs: &mut Vec<Value>) {
        match self {
            Obj::Str(_) | Obj::Native(_) => (),
            Obj::Upvalue(upvalue) => {
                if let Location::Closed(value) = upvalue.location {
                    refs.push(value);
                }
            },
            Obj::Function(function) => {
                if let Some(name) = function.name {
                    refs.push(Value::Obj(name));
                }
                refs.extend_from_slice(&function.chunk.constants);
            },
            Obj::Closure(closure) => {
                refs.push(Value::Obj(closure.function));
                for upvalue in &closure.upvalues {
                    refs.push(Value::Obj(*upvalue));
                }
            },
            Obj::Class(class) => {
                refs.push(Value::Obj(class.name));
                class.methods.collect_refs(refs);
            },
            Obj::Instance(instance) => {
                refs.push(Value::Obj(instance.class));
                instance.fields.collect_refs(refs);
            },
            Obj::BoundMethod(bound) => {
                refs.push(bound.receiver);
                refs.push(Value::Obj(bound.method));
            },
        }
    }
}

/// The 32-bit FNV-1a hash of a byte sequence.
/// Every interned string carries its hash precomputed.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fnv1a_known_values() {
        // reference vectors for 32-bit FNV-1a
        assert_eq!(hash_bytes(b""), 0x811c9dc5);
        assert_eq!(hash_bytes(b"a"), 0xe40c292c);
        assert_eq!(hash_bytes(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn string_size_counts_bytes() {
        let small = Obj::Str(Str { chars: "hi".into(), hash: 0 });
        let large = Obj::Str(Str { chars: "hello, world".into(), hash: 0 });
        assert!(small.size_hint() < large.size_hint());
    }
}
