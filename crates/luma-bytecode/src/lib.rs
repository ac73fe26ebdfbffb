//! Lua 5.1 instruction set, function prototypes, an assembler for building
//! them, a disassembler, and the binary chunk format.

pub mod builder;
pub mod chunk;
pub mod disasm;
pub mod opcode;
pub mod proto;
