/// Function prototype: holds bytecode, constants, and debug info.
use crate::opcode::Instruction;
use luma_core::string::StringId;
use luma_core::value::TValue;
use std::rc::Rc;

/// A constant value in the constant pool.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Number(f64),
    String(StringId),
}

impl Constant {
    #[inline]
    pub fn to_value(self) -> TValue {
        match self {
            Constant::Nil => TValue::nil(),
            Constant::Boolean(b) => TValue::from_bool(b),
            Constant::Number(n) => TValue::from_number(n),
            Constant::String(id) => TValue::from_string_id(id),
        }
    }
}

/// A local variable debug entry.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalVar {
    pub name: String,
    /// First PC where the variable is active.
    pub start_pc: u32,
    /// First PC where the variable is dead.
    pub end_pc: u32,
}

/// An immutable function prototype, shared by every closure made from it.
#[derive(Clone, Debug)]
pub struct Proto {
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    /// Nested function prototypes, indexed by CLOSURE's Bx.
    pub protos: Vec<Rc<Proto>>,
    pub num_upvalues: u8,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    /// Source name as given at load time (`@file`, `=name` or the text itself).
    pub source: String,
    pub line_defined: u32,
    pub last_line_defined: u32,

    // --- Debug info ---
    /// Source line per instruction (may be empty when stripped).
    pub line_info: Vec<u32>,
    pub local_vars: Vec<LocalVar>,
    pub upvalue_names: Vec<String>,
}

impl Proto {
    pub fn new(source: impl Into<String>) -> Self {
        Proto {
            code: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            num_upvalues: 0,
            num_params: 0,
            is_vararg: false,
            max_stack_size: 2, // minimum
            source: source.into(),
            line_defined: 0,
            last_line_defined: 0,
            line_info: Vec::new(),
            local_vars: Vec::new(),
            upvalue_names: Vec::new(),
        }
    }

    /// Source line of the instruction at `pc`, or 0 when unknown.
    pub fn get_line(&self, pc: usize) -> u32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }

    /// Name of the local in register `reg` at `pc`, if debug info has it.
    pub fn local_name(&self, reg: usize, pc: usize) -> Option<&str> {
        let pc = pc as u32;
        self.local_vars
            .iter()
            .filter(|v| v.start_pc <= pc && pc < v.end_pc)
            .nth(reg)
            .map(|v| v.name.as_str())
    }

    pub fn code_len(&self) -> usize {
        self.code.len()
    }
}

impl Default for Proto {
    fn default() -> Self {
        Self::new("=?")
    }
}
