/// Bytecode disassembler (luac -l style output).
use crate::opcode::{index_k, is_k, Instruction, InstructionFormat, OpCode};
use crate::proto::{Constant, Proto};
use luma_core::string::StringInterner;
use std::fmt::Write;

/// Disassemble a complete Proto into a human-readable string.
pub fn disassemble(proto: &Proto, strings: &StringInterner) -> String {
    let mut out = String::new();
    disassemble_proto(&mut out, proto, strings);
    out
}

fn disassemble_proto(out: &mut String, proto: &Proto, strings: &StringInterner) {
    let kind = if proto.line_defined == 0 { "main" } else { "function" };
    let _ = writeln!(
        out,
        "\n{kind} <{}:{},{}> ({} instructions)",
        display_source(&proto.source),
        proto.line_defined,
        proto.last_line_defined,
        proto.code.len()
    );
    let vararg = if proto.is_vararg { "+" } else { "" };
    let _ = writeln!(
        out,
        "{}{vararg} params, {} slots, {} upvalues, {} locals, {} constants, {} functions",
        proto.num_params,
        proto.max_stack_size,
        proto.num_upvalues,
        proto.local_vars.len(),
        proto.constants.len(),
        proto.protos.len(),
    );

    for (pc, inst) in proto.code.iter().enumerate() {
        let line = proto.get_line(pc);
        let line_str = if line > 0 { format!("[{line}]") } else { "[-]".to_string() };
        let _ = write!(out, "\t{}\t{}\t", pc + 1, line_str);
        disasm_instruction(out, pc, inst, proto, strings);
        out.push('\n');
    }

    if !proto.constants.is_empty() {
        let _ = writeln!(out, "constants ({}):", proto.constants.len());
        for (i, k) in proto.constants.iter().enumerate() {
            let _ = write!(out, "\t{}\t", i + 1);
            format_constant(out, k, strings);
            out.push('\n');
        }
    }

    if !proto.local_vars.is_empty() {
        let _ = writeln!(out, "locals ({}):", proto.local_vars.len());
        for (i, v) in proto.local_vars.iter().enumerate() {
            let _ = writeln!(out, "\t{i}\t{}\t{}\t{}", v.name, v.start_pc + 1, v.end_pc + 1);
        }
    }

    if !proto.upvalue_names.is_empty() {
        let _ = writeln!(out, "upvalues ({}):", proto.upvalue_names.len());
        for (i, name) in proto.upvalue_names.iter().enumerate() {
            let _ = writeln!(out, "\t{i}\t{name}");
        }
    }

    for p in &proto.protos {
        disassemble_proto(out, p, strings);
    }
}

fn display_source(source: &str) -> &str {
    source
        .strip_prefix('@')
        .or_else(|| source.strip_prefix('='))
        .unwrap_or("?")
}

/// Operand as luac prints it: registers as-is, constants as `-1-k`.
fn rk(x: u32) -> i64 {
    if is_k(x) {
        -1 - index_k(x) as i64
    } else {
        x as i64
    }
}

/// Disassemble a single instruction into the output string.
pub fn disasm_instruction(
    out: &mut String,
    pc: usize,
    inst: &Instruction,
    proto: &Proto,
    strings: &StringInterner,
) {
    let Some(op) = OpCode::from_u8(inst.op_bits()) else {
        let _ = write!(out, "{:<9}\t{:#010x}", "???", inst.0);
        return;
    };
    let _ = write!(out, "{:<9}\t", op.name());

    let (b_rk, c_rk) = op.rk_operands();
    match op.format() {
        InstructionFormat::IABC => {
            let b = if b_rk { rk(inst.b()) } else { inst.b() as i64 };
            let c = if c_rk { rk(inst.c()) } else { inst.c() as i64 };
            let _ = write!(out, "{} {} {}", inst.a(), b, c);
            let mut ks = Vec::new();
            if b_rk && is_k(inst.b()) {
                ks.push(index_k(inst.b()));
            }
            if c_rk && is_k(inst.c()) {
                ks.push(index_k(inst.c()));
            }
            if !ks.is_empty() {
                out.push_str("\t;");
                for k in ks {
                    out.push(' ');
                    constant_at(out, proto, k, strings);
                }
            }
        }
        InstructionFormat::IABx => {
            let _ = write!(out, "{} {}", inst.a(), inst.bx());
            match op {
                OpCode::LoadK | OpCode::GetGlobal | OpCode::SetGlobal => {
                    out.push_str("\t; ");
                    constant_at(out, proto, inst.bx() as usize, strings);
                }
                OpCode::Closure => {
                    let _ = write!(out, "\t; function [{}]", inst.bx());
                }
                _ => {}
            }
        }
        InstructionFormat::IAsBx => {
            let _ = write!(out, "{} {}", inst.a(), inst.sbx());
            let target = pc as i64 + 1 + inst.sbx() as i64;
            let _ = write!(out, "\t; to {}", target + 1);
        }
    }
}

fn constant_at(out: &mut String, proto: &Proto, idx: usize, strings: &StringInterner) {
    match proto.constants.get(idx) {
        Some(k) => format_constant(out, k, strings),
        None => out.push('?'),
    }
}

fn format_constant(out: &mut String, k: &Constant, strings: &StringInterner) {
    match k {
        Constant::Nil => out.push_str("nil"),
        Constant::Boolean(b) => {
            let _ = write!(out, "{b}");
        }
        Constant::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Constant::String(id) => {
            let _ = write!(out, "{:?}", strings.get_str_lossy(*id));
        }
    }
}
