//! Lua 5.1 binary chunk serialization (dump) and deserialization (undump).
//!
//! The loader accepts chunks written on either endianness with 4- or 8-byte
//! `int`/`size_t`; instructions must be 4 bytes and numbers 8-byte doubles.
//! Loaded code is verified so that the interpreter never indexes outside a
//! frame's registers or constants.

use crate::opcode::{index_k, is_k, Instruction, OpCode};
use crate::proto::{Constant, LocalVar, Proto};
use log::debug;
use luma_core::string::StringInterner;
use std::rc::Rc;
use thiserror::Error;

pub const LUA_SIGNATURE: &[u8; 4] = b"\x1bLua";
const LUAC_VERSION: u8 = 0x51;
const LUAC_FORMAT: u8 = 0;
const INSTRUCTION_SIZE: u8 = 4;
const LUA_NUMBER_SIZE: u8 = 8;
const DUMP_INT_SIZE: u8 = 4;
const DUMP_SIZE_T_SIZE: u8 = 8;

// Constant type tags (lua.h)
const LUA_TNIL: u8 = 0;
const LUA_TBOOLEAN: u8 = 1;
const LUA_TNUMBER: u8 = 3;
const LUA_TSTRING: u8 = 4;

/// Why a binary chunk was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum UndumpError {
    #[error("truncated precompiled chunk")]
    Truncated,
    #[error("bad header in precompiled chunk")]
    BadHeader,
    #[error("bad constant in precompiled chunk")]
    BadConstant,
    #[error("bad integer in precompiled chunk")]
    BadInteger,
    #[error("bad code in precompiled chunk")]
    BadCode,
}

/// Does this buffer start with the binary chunk signature?
pub fn is_binary_chunk(data: &[u8]) -> bool {
    data.starts_with(LUA_SIGNATURE)
}

// ─── Undump ─────────────────────────────────────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    big_endian: bool,
    int_size: usize,
    size_t_size: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_byte(&mut self) -> Result<u8, UndumpError> {
        let b = *self.data.get(self.pos).ok_or(UndumpError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], UndumpError> {
        if self.remaining() < n {
            return Err(UndumpError::Truncated);
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn read_uint(&mut self, size: usize) -> Result<u64, UndumpError> {
        let bytes = self.read_bytes(size)?;
        let mut v = 0u64;
        if self.big_endian {
            for b in bytes {
                v = (v << 8) | *b as u64;
            }
        } else {
            for b in bytes.iter().rev() {
                v = (v << 8) | *b as u64;
            }
        }
        Ok(v)
    }

    /// A C `int`, sign-extended from its dumped width.
    fn read_int(&mut self) -> Result<i64, UndumpError> {
        let raw = self.read_uint(self.int_size)?;
        let shift = 64 - 8 * self.int_size as u32;
        Ok(((raw << shift) as i64) >> shift)
    }

    /// A non-negative count of items that each take at least one byte.
    fn read_count(&mut self) -> Result<usize, UndumpError> {
        let n = self.read_int()?;
        if n < 0 {
            return Err(UndumpError::BadInteger);
        }
        let n = n as usize;
        if n > self.remaining() {
            return Err(UndumpError::Truncated);
        }
        Ok(n)
    }

    fn read_instruction(&mut self) -> Result<Instruction, UndumpError> {
        Ok(Instruction(self.read_uint(4)? as u32))
    }

    fn read_number(&mut self) -> Result<f64, UndumpError> {
        Ok(f64::from_bits(self.read_uint(8)?))
    }

    /// A `size_t`-prefixed string including its trailing NUL; size 0 is "no string".
    fn read_string(&mut self) -> Result<Option<&'a [u8]>, UndumpError> {
        let size = self.read_uint(self.size_t_size)?;
        if size == 0 {
            return Ok(None);
        }
        if size > self.remaining() as u64 {
            return Err(UndumpError::Truncated);
        }
        let bytes = self.read_bytes(size as usize)?;
        Ok(Some(&bytes[..bytes.len() - 1]))
    }
}

/// Load a binary chunk. String constants are interned into `strings`.
/// A top-level function without a recorded source takes `chunkname`.
pub fn undump(
    data: &[u8],
    chunkname: &str,
    strings: &mut StringInterner,
) -> Result<Proto, UndumpError> {
    let mut reader = Reader {
        data,
        pos: 0,
        big_endian: false,
        int_size: 4,
        size_t_size: 4,
    };
    read_header(&mut reader)?;
    let proto = read_function(&mut reader, chunkname, strings)?;
    debug!(
        "undumped chunk {chunkname}: {} instructions, {} nested functions",
        proto.code.len(),
        proto.protos.len()
    );
    Ok(proto)
}

fn read_header(reader: &mut Reader) -> Result<(), UndumpError> {
    if reader.read_bytes(4)? != LUA_SIGNATURE {
        return Err(UndumpError::BadHeader);
    }
    if reader.read_byte()? != LUAC_VERSION || reader.read_byte()? != LUAC_FORMAT {
        return Err(UndumpError::BadHeader);
    }
    reader.big_endian = match reader.read_byte()? {
        0 => true,
        1 => false,
        _ => return Err(UndumpError::BadHeader),
    };
    let int_size = reader.read_byte()?;
    let size_t_size = reader.read_byte()?;
    let inst_size = reader.read_byte()?;
    let num_size = reader.read_byte()?;
    let integral = reader.read_byte()?;
    if !matches!(int_size, 4 | 8)
        || !matches!(size_t_size, 4 | 8)
        || inst_size != INSTRUCTION_SIZE
        || num_size != LUA_NUMBER_SIZE
        || integral != 0
    {
        return Err(UndumpError::BadHeader);
    }
    reader.int_size = int_size as usize;
    reader.size_t_size = size_t_size as usize;
    Ok(())
}

fn read_function(
    reader: &mut Reader,
    parent_source: &str,
    strings: &mut StringInterner,
) -> Result<Proto, UndumpError> {
    let source = match reader.read_string()? {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None => parent_source.to_string(),
    };
    let mut proto = Proto::new(source);
    proto.line_defined = reader.read_int()? as u32;
    proto.last_line_defined = reader.read_int()? as u32;
    proto.num_upvalues = reader.read_byte()?;
    proto.num_params = reader.read_byte()?;
    // Bit 2 (VARARG_ISVARARG) marks a vararg function; bits 1 and 4 are
    // 5.0 compatibility flags. NEEDSARG (4) is not supported.
    let vararg = reader.read_byte()?;
    if vararg > 3 {
        return Err(UndumpError::BadCode);
    }
    proto.is_vararg = vararg != 0;
    proto.max_stack_size = reader.read_byte()?;

    let n = reader.read_count()?;
    proto.code.reserve(n);
    for _ in 0..n {
        proto.code.push(reader.read_instruction()?);
    }

    let n = reader.read_count()?;
    for _ in 0..n {
        let k = match reader.read_byte()? {
            LUA_TNIL => Constant::Nil,
            LUA_TBOOLEAN => match reader.read_byte()? {
                0 => Constant::Boolean(false),
                1 => Constant::Boolean(true),
                _ => return Err(UndumpError::BadConstant),
            },
            LUA_TNUMBER => Constant::Number(reader.read_number()?),
            LUA_TSTRING => {
                let bytes = reader.read_string()?.ok_or(UndumpError::BadConstant)?;
                Constant::String(strings.intern(bytes))
            }
            _ => return Err(UndumpError::BadConstant),
        };
        proto.constants.push(k);
    }

    let n = reader.read_count()?;
    for _ in 0..n {
        let child = read_function(reader, &proto.source, strings)?;
        proto.protos.push(Rc::new(child));
    }

    // Debug info
    let n = reader.read_count()?;
    for _ in 0..n {
        proto.line_info.push(reader.read_int()?.max(0) as u32);
    }
    let n = reader.read_count()?;
    for _ in 0..n {
        let name = reader.read_string()?.unwrap_or_default();
        let start_pc = reader.read_int()?.max(0) as u32;
        let end_pc = reader.read_int()?.max(0) as u32;
        proto.local_vars.push(LocalVar {
            name: String::from_utf8_lossy(name).into_owned(),
            start_pc,
            end_pc,
        });
    }
    let n = reader.read_count()?;
    for _ in 0..n {
        let name = reader.read_string()?.unwrap_or_default();
        proto.upvalue_names.push(String::from_utf8_lossy(name).into_owned());
    }

    verify(&proto)?;
    Ok(proto)
}

/// Static checks that keep every register, constant, upvalue and jump of a
/// loaded prototype inside its bounds.
pub fn verify(proto: &Proto) -> Result<(), UndumpError> {
    let max = proto.max_stack_size as u32;
    let nk = proto.constants.len();
    let nups = proto.num_upvalues as u32;
    let code = &proto.code;
    if max < 2 || max < proto.num_params as u32 || code.is_empty() {
        return Err(UndumpError::BadCode);
    }
    if code[code.len() - 1].opcode() != OpCode::Return {
        return Err(UndumpError::BadCode);
    }

    let check = |ok: bool| if ok { Ok(()) } else { Err(UndumpError::BadCode) };
    let reg = |r: u32| check(r < max);
    let rk = |x: u32| if is_k(x) { check(index_k(x) < nk) } else { check(x < max) };
    let jump = |pc: usize, sbx: i32| {
        let target = pc as i64 + 1 + sbx as i64;
        check(target >= 0 && (target as usize) < code.len())
    };

    let mut pc = 0;
    while pc < code.len() {
        let inst = code[pc];
        let op = OpCode::from_u8(inst.op_bits()).ok_or(UndumpError::BadCode)?;
        let (a, b, c) = (inst.a(), inst.b(), inst.c());
        if op != OpCode::Jmp {
            reg(a)?;
        }
        if op.is_test() {
            check(pc + 1 < code.len() && code[pc + 1].opcode() == OpCode::Jmp)?;
        }
        match op {
            OpCode::Move | OpCode::Unm | OpCode::Not | OpCode::Len | OpCode::TestSet => reg(b)?,
            OpCode::LoadNil => {
                check(b >= a)?;
                reg(b)?;
            }
            OpCode::LoadK => check((inst.bx() as usize) < nk)?,
            OpCode::GetGlobal | OpCode::SetGlobal => {
                check(matches!(proto.constants.get(inst.bx() as usize), Some(Constant::String(_))))?
            }
            OpCode::LoadBool => check(c == 0 || pc + 2 < code.len())?,
            OpCode::GetUpval | OpCode::SetUpval => check(b < nups)?,
            OpCode::GetTable => {
                reg(b)?;
                rk(c)?;
            }
            OpCode::Self_ => {
                reg(a + 1)?;
                reg(b)?;
                rk(c)?;
            }
            OpCode::SetTable
            | OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Pow
            | OpCode::Eq
            | OpCode::Lt
            | OpCode::Le => {
                rk(b)?;
                rk(c)?;
            }
            OpCode::Concat => check(b < c && c < max)?,
            OpCode::Jmp | OpCode::ForPrep => jump(pc, inst.sbx())?,
            OpCode::ForLoop => {
                reg(a + 3)?;
                jump(pc, inst.sbx())?;
            }
            OpCode::TForLoop => check(c >= 1 && a + 3 + c <= max)?,
            OpCode::Call | OpCode::TailCall => {
                if b > 0 {
                    check(a + b <= max)?;
                }
                if op == OpCode::Call && c > 1 {
                    check(a + c - 1 <= max)?;
                }
            }
            OpCode::Return => {
                if b > 0 {
                    check(a + b - 1 <= max)?;
                }
            }
            OpCode::VarArg => {
                check(proto.is_vararg)?;
                if b > 0 {
                    check(a + b - 1 <= max)?;
                }
            }
            OpCode::SetList => {
                if b > 0 {
                    check(a + b < max)?;
                }
                if c == 0 {
                    // The batch number lives in the next code word.
                    check(pc + 1 < code.len())?;
                    pc += 1;
                }
            }
            OpCode::Closure => {
                let child = proto
                    .protos
                    .get(inst.bx() as usize)
                    .ok_or(UndumpError::BadCode)?;
                let n = child.num_upvalues as usize;
                check(pc + n < code.len())?;
                for pseudo in &code[pc + 1..=pc + n] {
                    match pseudo.opcode() {
                        OpCode::Move => reg(pseudo.b())?,
                        OpCode::GetUpval => check(pseudo.b() < nups)?,
                        _ => return Err(UndumpError::BadCode),
                    }
                }
                pc += n;
            }
            OpCode::NewTable | OpCode::Test | OpCode::Close => {}
        }
        pc += 1;
    }
    Ok(())
}

/// `verify` applied to a prototype and all of its nested functions.
pub fn verify_tree(proto: &Proto) -> Result<(), UndumpError> {
    verify(proto)?;
    proto.protos.iter().try_for_each(|p| verify_tree(p))
}

// ─── Dump ───────────────────────────────────────────────────────────────

/// Serialize a prototype tree as a little-endian Lua 5.1 chunk
/// (4-byte `int`, 8-byte `size_t`). `strip` omits debug info.
pub fn dump(proto: &Proto, strings: &StringInterner, strip: bool) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(LUA_SIGNATURE);
    out.push(LUAC_VERSION);
    out.push(LUAC_FORMAT);
    out.push(1); // little endian
    out.push(DUMP_INT_SIZE);
    out.push(DUMP_SIZE_T_SIZE);
    out.push(INSTRUCTION_SIZE);
    out.push(LUA_NUMBER_SIZE);
    out.push(0); // floating-point numbers
    write_function(&mut out, proto, strings, strip, None);
    out
}

fn write_int(out: &mut Vec<u8>, n: usize) {
    out.extend_from_slice(&(n as i32).to_le_bytes());
}

fn write_string(out: &mut Vec<u8>, s: Option<&[u8]>) {
    match s {
        None => out.extend_from_slice(&0u64.to_le_bytes()),
        Some(bytes) => {
            out.extend_from_slice(&(bytes.len() as u64 + 1).to_le_bytes());
            out.extend_from_slice(bytes);
            out.push(0);
        }
    }
}

fn write_function(
    out: &mut Vec<u8>,
    proto: &Proto,
    strings: &StringInterner,
    strip: bool,
    parent_source: Option<&str>,
) {
    if strip || parent_source == Some(proto.source.as_str()) {
        write_string(out, None);
    } else {
        write_string(out, Some(proto.source.as_bytes()));
    }
    write_int(out, proto.line_defined as usize);
    write_int(out, proto.last_line_defined as usize);
    out.push(proto.num_upvalues);
    out.push(proto.num_params);
    out.push(if proto.is_vararg { 2 } else { 0 });
    out.push(proto.max_stack_size);

    write_int(out, proto.code.len());
    for inst in &proto.code {
        out.extend_from_slice(&inst.0.to_le_bytes());
    }

    write_int(out, proto.constants.len());
    for k in &proto.constants {
        match k {
            Constant::Nil => out.push(LUA_TNIL),
            Constant::Boolean(b) => {
                out.push(LUA_TBOOLEAN);
                out.push(*b as u8);
            }
            Constant::Number(n) => {
                out.push(LUA_TNUMBER);
                out.extend_from_slice(&n.to_bits().to_le_bytes());
            }
            Constant::String(id) => {
                out.push(LUA_TSTRING);
                write_string(out, Some(strings.get_bytes(*id)));
            }
        }
    }

    write_int(out, proto.protos.len());
    for p in &proto.protos {
        write_function(out, p, strings, strip, Some(&proto.source));
    }

    if strip {
        write_int(out, 0);
        write_int(out, 0);
        write_int(out, 0);
        return;
    }
    write_int(out, proto.line_info.len());
    for line in &proto.line_info {
        write_int(out, *line as usize);
    }
    write_int(out, proto.local_vars.len());
    for v in &proto.local_vars {
        write_string(out, Some(v.name.as_bytes()));
        write_int(out, v.start_pc as usize);
        write_int(out, v.end_pc as usize);
    }
    write_int(out, proto.upvalue_names.len());
    for name in &proto.upvalue_names {
        write_string(out, Some(name.as_bytes()));
    }
}
