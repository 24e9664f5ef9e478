//! Bytecode disassembler: a debugging aid, not used by the compiler or VM
//! in normal operation. Renders a [`Chunk`] the way the CLI's `--dump` flag
//! and `tracing::trace!` spans present it: one line per instruction, the
//! source line (or `|` when it repeats the line above), the opcode name,
//! and any operand. Function and closure constants are disassembled
//! recursively so a single call dumps a whole compilation unit.

use ember_core::{Chunk, Heap, Obj, OpCode};
use std::fmt::Write as _;

/// Disassemble `chunk` (named `name` in the header) and every nested
/// function reachable through its constant pool.
pub fn disassemble_chunk(chunk: &Chunk, name: &str, heap: &Heap) -> String {
    let mut out = String::new();
    render_chunk(&mut out, chunk, name, heap);
    out
}

fn render_chunk(out: &mut String, chunk: &Chunk, name: &str, heap: &Heap) {
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = render_instruction(out, chunk, offset, heap);
    }
    for constant in &chunk.constants {
        let Some(r) = constant.as_obj() else { continue };
        if let Obj::Function(f) = heap.get(r) {
            let fname = f
                .name
                .map(|n| heap.as_string(n).as_str().to_string())
                .unwrap_or_else(|| "anonymous fn".to_string());
            out.push('\n');
            render_chunk(out, &f.chunk, &fname, heap);
        }
    }
}

/// Disassemble the single instruction at `offset`, returning its rendering
/// and the offset of the instruction that follows.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, heap: &Heap) -> (String, usize) {
    let mut out = String::new();
    let next = render_instruction(&mut out, chunk, offset, heap);
    (out, next)
}

fn render_instruction(out: &mut String, chunk: &Chunk, offset: usize, heap: &Heap) -> usize {
    let line = chunk.line_for_offset(offset);
    let line_col = if offset > 0 && chunk.line_for_offset(offset - 1) == line {
        "   |".to_string()
    } else {
        format!("{line:4}")
    };

    let Some(op) = OpCode::from_u8(chunk.code[offset]) else {
        let _ = writeln!(out, "{offset:04} {line_col} UNKNOWN {}", chunk.code[offset]);
        return offset + 1;
    };

    match op.operand_len() {
        0 => {
            let _ = writeln!(out, "{offset:04} {line_col} {}", op.name());
        }
        1 => {
            let operand = chunk.code[offset + 1];
            let rendered = match op {
                OpCode::PushConst | OpCode::DefGlobal | OpCode::PushGlobal | OpCode::PopGlobal => {
                    chunk
                        .constants
                        .get(operand as usize)
                        .map(|v| format!(" ; {}", heap.debug_value(*v)))
                        .unwrap_or_default()
                }
                _ => String::new(),
            };
            let _ = writeln!(out, "{offset:04} {line_col} {:<14} {operand:3}{rendered}", op.name());
        }
        2 => {
            let lo = chunk.code[offset + 1];
            let hi = chunk.code[offset + 2];
            let rel = i16::from_le_bytes([lo, hi]);
            let target = (offset as isize + 3 + rel as isize) as usize;
            let _ = writeln!(out, "{offset:04} {line_col} {:<14} {offset} -> {target}", op.name());
        }
        n => unreachable!("opcode operand length {n} not handled"),
    }
    offset + 1 + op.operand_len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{Table, Value};

    #[test]
    fn disassembles_a_constant_load() {
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(2.0)).unwrap();
        chunk.write_op(OpCode::PushConst, 1);
        chunk.write_byte(idx, 1);
        chunk.write_op(OpCode::Ret, 1);

        let heap = Heap::new();
        let text = disassemble_chunk(&chunk, "test", &heap);
        assert!(text.contains("== test =="));
        assert!(text.contains("PUSH_CONST"));
        assert!(text.contains("; 2"));
        assert!(text.contains("RET"));
    }

    #[test]
    fn disassembles_a_jump_with_target_offset() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::JmpFalse, 1);
        chunk.write_byte(0, 1);
        chunk.write_byte(0, 1);
        chunk.write_op(OpCode::Ret, 1);

        let heap = Heap::new();
        let (text, next) = disassemble_instruction(&chunk, 0, &heap);
        assert!(text.contains("JMP_FALSE"));
        assert!(text.contains("0 -> 3"));
        assert_eq!(next, 3);
    }

    #[test]
    fn recurses_into_nested_function_constants() {
        let mut heap = Heap::new();
        let mut interner = Table::new();
        let func_ref = ember_core::intern(&mut heap, &mut interner, "unused");
        let _ = func_ref;

        let mut inner = Chunk::new();
        inner.write_op(OpCode::PushNil, 3);
        inner.write_op(OpCode::Ret, 3);
        let name_ref = ember_core::intern(&mut heap, &mut interner, "helper");
        let function_ref = heap.alloc(ember_core::Obj::Function(ember_core::ObjFunction {
            name: Some(name_ref),
            arity: 0,
            chunk: inner,
            upvalues: Vec::new(),
        }));

        let mut outer = Chunk::new();
        let idx = outer.add_constant(Value::Obj(function_ref)).unwrap();
        outer.write_op(OpCode::PushConst, 1);
        outer.write_byte(idx, 1);
        outer.write_op(OpCode::Ret, 1);

        let text = disassemble_chunk(&outer, "script", &heap);
        assert!(text.contains("== script =="));
        assert!(text.contains("== helper =="));
    }
}
