//! Assembler for prototypes.
//!
//! `ProtoBuilder` emits instructions and pools constants the way a code
//! generator would, without needing the VM's string store until `build`.
//! Hosts without a source compiler (and the test suites) use it to produce
//! runnable chunks.

use crate::opcode::{rk_as_k, Instruction, OpCode, LFIELDS_PER_FLUSH};
use crate::proto::{Constant, LocalVar, Proto};
use luma_core::string::StringInterner;
use std::rc::Rc;

/// A constant before string interning.
#[derive(Clone, Debug, PartialEq)]
enum PendingConst {
    Nil,
    Boolean(bool),
    Number(f64),
    Str(Vec<u8>),
}

impl PendingConst {
    /// Pool identity: numbers by bit pattern so NaN dedups with itself.
    fn same(&self, other: &PendingConst) -> bool {
        match (self, other) {
            (PendingConst::Number(a), PendingConst::Number(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }
}

/// Builds one function prototype (and its children).
#[derive(Clone, Debug)]
pub struct ProtoBuilder {
    source: String,
    code: Vec<Instruction>,
    lines: Vec<u32>,
    current_line: u32,
    constants: Vec<PendingConst>,
    children: Vec<ProtoBuilder>,
    num_params: u8,
    is_vararg: bool,
    max_stack: u8,
    num_upvalues: u8,
    upvalue_names: Vec<String>,
    local_vars: Vec<LocalVar>,
    line_defined: u32,
    last_line_defined: u32,
}

impl ProtoBuilder {
    /// Start a prototype for the given source name (`=name`, `@file`, ...).
    pub fn new(source: &str) -> Self {
        ProtoBuilder {
            source: source.to_string(),
            code: Vec::new(),
            lines: Vec::new(),
            current_line: 1,
            constants: Vec::new(),
            children: Vec::new(),
            num_params: 0,
            is_vararg: false,
            max_stack: 16,
            num_upvalues: 0,
            upvalue_names: Vec::new(),
            local_vars: Vec::new(),
            line_defined: 0,
            last_line_defined: 0,
        }
    }

    pub fn params(mut self, n: u8) -> Self {
        self.num_params = n;
        self
    }

    pub fn vararg(mut self) -> Self {
        self.is_vararg = true;
        self
    }

    pub fn max_stack(mut self, n: u8) -> Self {
        self.max_stack = n.max(2);
        self
    }

    pub fn upvalues(mut self, n: u8) -> Self {
        self.num_upvalues = n;
        self
    }

    pub fn defined_at(mut self, first: u32, last: u32) -> Self {
        self.line_defined = first;
        self.last_line_defined = last;
        self
    }

    /// Set the source line recorded for subsequently emitted instructions.
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.current_line = line;
        self
    }

    // ---- Constants ----

    fn add_constant(&mut self, k: PendingConst) -> u32 {
        if let Some(i) = self.constants.iter().position(|e| e.same(&k)) {
            return i as u32;
        }
        self.constants.push(k);
        (self.constants.len() - 1) as u32
    }

    pub fn k_nil(&mut self) -> u32 {
        self.add_constant(PendingConst::Nil)
    }

    pub fn k_bool(&mut self, b: bool) -> u32 {
        self.add_constant(PendingConst::Boolean(b))
    }

    pub fn k_num(&mut self, n: f64) -> u32 {
        self.add_constant(PendingConst::Number(n))
    }

    pub fn k_str(&mut self, s: &str) -> u32 {
        self.add_constant(PendingConst::Str(s.as_bytes().to_vec()))
    }

    /// Number constant as an RK operand.
    pub fn rk_num(&mut self, n: f64) -> u32 {
        let k = self.k_num(n);
        rk_as_k(k)
    }

    /// String constant as an RK operand.
    pub fn rk_str(&mut self, s: &str) -> u32 {
        let k = self.k_str(s);
        rk_as_k(k)
    }

    // ---- Code ----

    /// Append a raw instruction word. Returns its pc.
    pub fn emit(&mut self, inst: Instruction) -> usize {
        self.code.push(inst);
        self.lines.push(self.current_line);
        self.code.len() - 1
    }

    pub fn abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> usize {
        self.emit(Instruction::abc(op, a, b, c))
    }

    pub fn abx(&mut self, op: OpCode, a: u32, bx: u32) -> usize {
        self.emit(Instruction::abx(op, a, bx))
    }

    pub fn asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> usize {
        self.emit(Instruction::asbx(op, a, sbx))
    }

    /// pc of the next instruction to be emitted.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    /// Emit a jump (or any iAsBx op) landing on `target`.
    pub fn jump_to(&mut self, op: OpCode, a: u32, target: usize) -> usize {
        let pc = self.here();
        self.asbx(op, a, target as i32 - (pc as i32 + 1))
    }

    /// Point the iAsBx instruction at `pc` to `target`.
    pub fn patch_to(&mut self, pc: usize, target: usize) {
        self.code[pc].set_sbx(target as i32 - (pc as i32 + 1));
    }

    /// `LOADK a, <number>`.
    pub fn load_num(&mut self, a: u32, n: f64) -> usize {
        let k = self.k_num(n);
        self.abx(OpCode::LoadK, a, k)
    }

    /// `LOADK a, <string>`.
    pub fn load_str(&mut self, a: u32, s: &str) -> usize {
        let k = self.k_str(s);
        self.abx(OpCode::LoadK, a, k)
    }

    /// `GETGLOBAL a, name`.
    pub fn get_global(&mut self, a: u32, name: &str) -> usize {
        let k = self.k_str(name);
        self.abx(OpCode::GetGlobal, a, k)
    }

    /// `SETGLOBAL a, name`.
    pub fn set_global(&mut self, a: u32, name: &str) -> usize {
        let k = self.k_str(name);
        self.abx(OpCode::SetGlobal, a, k)
    }

    /// SETLIST storing `n` values from A+1 as batch `batch` (1-based).
    /// Batches past the C field's range spill into an extra code word.
    pub fn set_list(&mut self, a: u32, n: u32, batch: u32) -> usize {
        if batch <= crate::opcode::MAX_C {
            self.abc(OpCode::SetList, a, n, batch)
        } else {
            let pc = self.abc(OpCode::SetList, a, n, 0);
            self.emit(Instruction(batch));
            pc
        }
    }

    /// Batch number holding list item `i` (1-based).
    pub fn list_batch(i: u32) -> u32 {
        (i - 1) / LFIELDS_PER_FLUSH + 1
    }

    /// Add a child prototype. Returns its CLOSURE index.
    pub fn child(&mut self, child: ProtoBuilder) -> u32 {
        self.children.push(child);
        (self.children.len() - 1) as u32
    }

    pub fn upvalue_name(&mut self, name: &str) -> &mut Self {
        self.upvalue_names.push(name.to_string());
        self
    }

    pub fn local(&mut self, name: &str, start_pc: u32, end_pc: u32) -> &mut Self {
        self.local_vars.push(LocalVar { name: name.to_string(), start_pc, end_pc });
        self
    }

    /// Intern pending strings and produce the immutable prototype tree.
    pub fn build(&self, strings: &mut StringInterner) -> Proto {
        let constants = self
            .constants
            .iter()
            .map(|k| match k {
                PendingConst::Nil => Constant::Nil,
                PendingConst::Boolean(b) => Constant::Boolean(*b),
                PendingConst::Number(n) => Constant::Number(*n),
                PendingConst::Str(bytes) => Constant::String(strings.intern(bytes)),
            })
            .collect();
        let protos = self
            .children
            .iter()
            .map(|c| {
                let mut child = c.build(strings);
                if child.source.is_empty() {
                    child.source = self.source.clone();
                }
                Rc::new(child)
            })
            .collect();
        let num_upvalues = self.num_upvalues.max(self.upvalue_names.len() as u8);
        Proto {
            code: self.code.clone(),
            constants,
            protos,
            num_upvalues,
            num_params: self.num_params,
            is_vararg: self.is_vararg,
            max_stack_size: self.max_stack.max(self.num_params + 1),
            source: self.source.clone(),
            line_defined: self.line_defined,
            last_line_defined: self.last_line_defined,
            line_info: self.lines.clone(),
            local_vars: self.local_vars.clone(),
            upvalue_names: self.upvalue_names.clone(),
        }
    }
}
