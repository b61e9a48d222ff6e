//! Bytecode disassembler
//!
//! Renders a loaded program as a listing: header summary, constant pool,
//! and one line per instruction with constant annotations and resolved
//! jump targets. This is what the driver prints for `-bc`.

use crate::opcode::OpCode;
use crate::ops;
use crate::program::{Instruction, Program};

/// Which pool slot an instruction references, if any.
fn constant_operand(instr: &Instruction) -> Option<u16> {
    use OpCode::*;
    match instr.op {
        AddK | SubK | MulK | DivK | ModK | PowK | ConcatK => Some(instr.c),
        LoadK | GetGlobal | SetGlobal => Some(instr.b),
        PushK => Some(instr.a),
        _ => None,
    }
}

/// Which operand is a signed jump displacement, if any.
fn jump_operand(instr: &Instruction) -> Option<u16> {
    use OpCode::*;
    match instr.op {
        Jump => Some(instr.a),
        JumpIf | JumpIfNot => Some(instr.b),
        JumpIfEqual | JumpIfNotEqual | JumpIfLess | JumpIfGreater | JumpIfLessOrEqual
        | JumpIfGreaterOrEqual => Some(instr.c),
        _ => None,
    }
}

/// Render the whole program as a listing.
pub fn disassemble(program: &Program) -> String {
    let mut out = String::new();

    let platform: String = program
        .header
        .platform
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect();
    out.push_str(&format!(
        "; via image v{} ({}), {} constants, {} instructions, entry {}\n",
        program.header.version,
        platform,
        program.constants.len(),
        program.code.len(),
        program.entry
    ));

    if !program.constants.is_empty() {
        out.push_str("\n; constants\n");
        for (i, value) in program.constants.iter().enumerate() {
            out.push_str(&format!(";   k{i} = {}\n", ops::display(value)));
        }
    }

    out.push('\n');
    for (i, instr) in program.code.iter().enumerate() {
        let mut line = format!(
            "{i:5}  {:<20} {:5} {:5} {:5}",
            instr.op.mnemonic(),
            instr.a,
            instr.b,
            instr.c
        );
        if let Some(k) = constant_operand(instr) {
            match program.constants.get(usize::from(k)) {
                Some(value) => line.push_str(&format!("  ; k{k} = {}", ops::display(value))),
                None => line.push_str(&format!("  ; k{k} = <out of range>")),
            }
        }
        if let Some(raw) = jump_operand(instr) {
            let target = i as i64 + 1 + i64::from(Instruction::offset(raw));
            line.push_str(&format!("  ; -> {target}"));
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Constant;
    use via_core::Interner;

    #[test]
    fn test_listing_shape() {
        let strings = Interner::new();
        let mut b = Program::builder();
        let k = b.constant(Constant::Int(5));
        b.constant(Constant::Str("name".into()));
        b.emit(OpCode::LoadK, 0, k, 0);
        b.emit(OpCode::Jump, (-2i16) as u16, 0, 0);
        b.emit(OpCode::Halt, 0, 0, 0);
        let listing = disassemble(&b.build(&strings));

        assert!(listing.contains("k0 = 5"));
        assert!(listing.contains("k1 = name"));
        assert!(listing.contains("LOADK"));
        assert!(listing.contains("; k0 = 5"));
        // Jump at index 1 with displacement -2 resolves to 0.
        assert!(listing.contains("; -> 0"));
        assert!(listing.contains("HALT"));
    }
}
