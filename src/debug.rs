//! Bytecode inspection. Renders a chunk one instruction at a time,
//! with source lines down the left-hand gutter.

use std::fmt::Write;

use crate::common::chunk::Chunk;
use crate::common::opcode::Opcode;
use crate::vm::heap::Heap;

/// Dumps a whole chunk for inspection.
pub fn disassemble(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);

    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, &mut out);
    }

    out
}

/// Renders the instruction at `offset` and returns the offset of the
/// next one.
pub fn disassemble_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut String,
) -> usize {
    let _ = write!(out, "{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.lines[offset]);
    }

    let op = match Opcode::from_byte_safe(chunk.code[offset]) {
        Some(op) => op,
        None => {
            let _ = writeln!(out, "Unknown opcode {}", chunk.code[offset]);
            return offset + 1;
        },
    };

    match op {
        // no operands
        Opcode::Nil
        | Opcode::True
        | Opcode::False
        | Opcode::Pop
        | Opcode::Equal
        | Opcode::Greater
        | Opcode::Less
        | Opcode::Add
        | Opcode::Subtract
        | Opcode::Multiply
        | Opcode::Divide
        | Opcode::Not
        | Opcode::Negate
        | Opcode::CloseUpvalue
        | Opcode::Return
        | Opcode::Inherit => {
            let _ = writeln!(out, "{:?}", op);
            offset + 1
        },

        // one byte
        Opcode::Call => {
            let _ = writeln!(out, "{:<16} {:4}", "Call", chunk.code[offset + 1]);
            offset + 2
        },

        // one 16-bit slot index
        Opcode::GetLocal | Opcode::SetLocal | Opcode::GetUpvalue | Opcode::SetUpvalue => {
            let slot = chunk.read_u16(offset + 1);
            let _ = writeln!(out, "{:<16} {:6}", format!("{:?}", op), slot);
            offset + 3
        },

        // one 16-bit constant index
        Opcode::Constant
        | Opcode::GetGlobal
        | Opcode::DefineGlobal
        | Opcode::SetGlobal
        | Opcode::GetProperty
        | Opcode::SetProperty
        | Opcode::GetSuper
        | Opcode::Class
        | Opcode::Method => {
            let constant = chunk.read_u16(offset + 1);
            let _ = writeln!(
                out,
                "{:<16} {:4} '{}'",
                format!("{:?}", op),
                constant,
                heap.show(chunk.constants[constant as usize]),
            );
            offset + 3
        },

        // jumps render their target
        Opcode::Jump | Opcode::JumpFalse | Opcode::Loop => {
            let jump = chunk.read_u16(offset + 1) as isize;
            let sign = if op == Opcode::Loop { -1 } else { 1 };
            let target = offset as isize + 3 + sign * jump;
            let _ = writeln!(out, "{:<16} {:4} -> {}", format!("{:?}", op), offset, target);
            offset + 3
        },

        // name constant plus argument count
        Opcode::Invoke | Opcode::SuperInvoke => {
            let constant = chunk.read_u16(offset + 1);
            let args = chunk.code[offset + 3];
            let _ = writeln!(
                out,
                "{:<16} ({} args) {:4} '{}'",
                format!("{:?}", op),
                args,
                constant,
                heap.show(chunk.constants[constant as usize]),
            );
            offset + 4
        },

        Opcode::Closure => {
            let constant = chunk.read_u16(offset + 1);
            let _ = writeln!(
                out,
                "{:<16} {:4} {}",
                "Closure",
                constant,
                heap.show(chunk.constants[constant as usize]),
            );

            // one (is_local, index) pair per upvalue follows inline
            let function = match chunk.constants[constant as usize] {
                crate::common::value::Value::Obj(handle) => heap.function(handle),
                _ => unreachable!("closure constant is not a function"),
            };

            let mut next = offset + 3;
            for _ in 0..function.upvalue_count {
                let is_local = chunk.code[next];
                let index = chunk.read_u16(next + 1);
                let _ = writeln!(
                    out,
                    "{:04}    |                     {} {}",
                    next,
                    if is_local != 0 { "local" } else { "upvalue" },
                    index,
                );
                next += 3;
            }

            next
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compiler::compile;
    use crate::vm::table::Table;

    #[test]
    fn renders_every_instruction_of_a_busy_chunk() {
        let mut heap = Heap::new();
        let globals = Table::new();
        let function = compile(
            "fn outer() { var x = 1; fn inner() { return x + 1; } return inner; }\n\
             class A { hi() { return \"A\"; } }\n\
             class B < A { hi() { return super.hi(); } }\n\
             var b = B();\n\
             if (b == nil or !true and 1 < 2) { b.hi(); } else { b.x = len(\"x\"); }\n\
             while (false) {}",
            &mut heap,
            &globals,
        )
        .expect("script should compile");

        let listing = disassemble(&heap, &heap.function(function).chunk, "script");

        // the listing walks the whole chunk without losing alignment
        assert!(listing.contains("== script =="));
        assert!(listing.contains("Class"));
        assert!(listing.contains("Inherit"));
        assert!(listing.contains("JumpFalse"));
        assert!(listing.contains("Closure"));
        assert!(listing.ends_with("Return\n"));
    }
}
