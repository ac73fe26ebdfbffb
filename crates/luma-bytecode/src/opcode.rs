/// Lua 5.1 opcodes and instruction encoding.
///
/// Instruction format (32 bits):
/// - Bits 0-5: OpCode (6 bits)
/// - Bits 6-13: A (8 bits)
/// - For iABC format:
///   - Bits 14-22: C (9 bits)
///   - Bits 23-31: B (9 bits)
/// - For iABx: Bx = bits 14-31 (unsigned 18 bits)
/// - For iAsBx: sBx = Bx - 131071 (signed interpretation)
use std::fmt;

/// Size constants for instruction fields.
const SIZE_OP: u32 = 6;
const SIZE_A: u32 = 8;
const SIZE_B: u32 = 9;
const SIZE_C: u32 = 9;
const SIZE_BX: u32 = SIZE_B + SIZE_C; // 18

/// Position constants.
const POS_OP: u32 = 0;
const POS_A: u32 = POS_OP + SIZE_OP; // 6
const POS_C: u32 = POS_A + SIZE_A; // 14
const POS_B: u32 = POS_C + SIZE_C; // 23
const POS_BX: u32 = POS_C;

const fn mask(n: u32) -> u32 {
    (1 << n) - 1
}

pub const MAX_A: u32 = mask(SIZE_A); // 255
pub const MAX_B: u32 = mask(SIZE_B); // 511
pub const MAX_C: u32 = mask(SIZE_C); // 511
pub const MAX_BX: u32 = mask(SIZE_BX); // 262143
pub const MAX_SBX: i32 = (MAX_BX >> 1) as i32; // 131071
pub const MIN_SBX: i32 = -MAX_SBX;

/// RK operands at or above this value name a constant.
pub const BITRK: u32 = 1 << (SIZE_B - 1); // 256
/// Largest constant index an RK operand can name.
pub const MAXINDEXRK: u32 = BITRK - 1;

/// Number of list items SETLIST stores per batch.
pub const LFIELDS_PER_FLUSH: u32 = 50;

/// Is this RK operand a constant?
#[inline]
pub fn is_k(x: u32) -> bool {
    x & BITRK != 0
}

/// Constant index of a constant RK operand.
#[inline]
pub fn index_k(x: u32) -> usize {
    (x & !BITRK) as usize
}

/// Encode constant index `k` as an RK operand.
#[inline]
pub fn rk_as_k(k: u32) -> u32 {
    debug_assert!(k <= MAXINDEXRK);
    k | BITRK
}

/// Decode a "floating point byte" (`eeeeexxx`) into an integer.
pub fn fb2int(x: u32) -> usize {
    let e = (x >> 3) & 31;
    if e == 0 {
        x as usize
    } else {
        (((x & 7) + 8) as usize) << (e - 1)
    }
}

/// Encode an integer as a floating point byte, rounding up.
pub fn int2fb(mut x: usize) -> u32 {
    let mut e = 0u32;
    while x >= 16 {
        x = (x + 1) >> 1;
        e += 1;
    }
    if x < 8 {
        x as u32
    } else {
        ((e + 1) << 3) | (x as u32 - 8)
    }
}

/// All 38 Lua 5.1 opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,
    LoadK,
    LoadBool,
    LoadNil,
    GetUpval,
    GetGlobal,
    GetTable,
    SetGlobal,
    SetUpval,
    SetTable,
    NewTable,
    Self_,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Not,
    Len,
    Concat,
    Jmp,
    Eq,
    Lt,
    Le,
    Test,
    TestSet,
    Call,
    TailCall,
    Return,
    ForLoop,
    ForPrep,
    TForLoop,
    SetList,
    Close,
    Closure,
    VarArg,
}

impl OpCode {
    /// Number of opcodes.
    pub const COUNT: usize = 38;

    /// Get the opcode from a u8 value.
    pub fn from_u8(val: u8) -> Option<OpCode> {
        if (val as usize) < Self::COUNT {
            // Safety: OpCode is repr(u8) with contiguous discriminants 0..COUNT
            Some(unsafe { std::mem::transmute::<u8, OpCode>(val) })
        } else {
            None
        }
    }

    /// Get the instruction format for this opcode.
    pub fn format(&self) -> InstructionFormat {
        use InstructionFormat::*;
        use OpCode::*;
        match self {
            LoadK | GetGlobal | SetGlobal | Closure => IABx,
            Jmp | ForLoop | ForPrep => IAsBx,
            _ => IABC,
        }
    }

    /// Get the name of this opcode.
    pub fn name(&self) -> &'static str {
        use OpCode::*;
        match self {
            Move => "MOVE",
            LoadK => "LOADK",
            LoadBool => "LOADBOOL",
            LoadNil => "LOADNIL",
            GetUpval => "GETUPVAL",
            GetGlobal => "GETGLOBAL",
            GetTable => "GETTABLE",
            SetGlobal => "SETGLOBAL",
            SetUpval => "SETUPVAL",
            SetTable => "SETTABLE",
            NewTable => "NEWTABLE",
            Self_ => "SELF",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Mod => "MOD",
            Pow => "POW",
            Unm => "UNM",
            Not => "NOT",
            Len => "LEN",
            Concat => "CONCAT",
            Jmp => "JMP",
            Eq => "EQ",
            Lt => "LT",
            Le => "LE",
            Test => "TEST",
            TestSet => "TESTSET",
            Call => "CALL",
            TailCall => "TAILCALL",
            Return => "RETURN",
            ForLoop => "FORLOOP",
            ForPrep => "FORPREP",
            TForLoop => "TFORLOOP",
            SetList => "SETLIST",
            Close => "CLOSE",
            Closure => "CLOSURE",
            VarArg => "VARARG",
        }
    }

    /// Returns true if this opcode is a test (the next instruction is a jump).
    pub fn is_test(&self) -> bool {
        use OpCode::*;
        matches!(self, Eq | Lt | Le | Test | TestSet | TForLoop)
    }

    /// Which of B and C are RK operands, as (b_is_rk, c_is_rk).
    pub fn rk_operands(&self) -> (bool, bool) {
        use OpCode::*;
        match self {
            GetTable | Self_ => (false, true),
            SetTable | Add | Sub | Mul | Div | Mod | Pow | Eq | Lt | Le => (true, true),
            _ => (false, false),
        }
    }
}

/// Instruction format types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstructionFormat {
    IABC,
    IABx,
    IAsBx,
}

/// A 32-bit Lua bytecode instruction.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    // ---- Constructors ----

    /// Create an iABC instruction.
    pub fn abc(op: OpCode, a: u32, b: u32, c: u32) -> Self {
        debug_assert!(a <= MAX_A && b <= MAX_B && c <= MAX_C);
        Instruction(
            ((op as u32) << POS_OP)
                | ((a & MAX_A) << POS_A)
                | ((b & MAX_B) << POS_B)
                | ((c & MAX_C) << POS_C),
        )
    }

    /// Create an iABx instruction.
    pub fn abx(op: OpCode, a: u32, bx: u32) -> Self {
        debug_assert!(bx <= MAX_BX, "Bx out of range: {bx}");
        Instruction(((op as u32) << POS_OP) | ((a & MAX_A) << POS_A) | ((bx & MAX_BX) << POS_BX))
    }

    /// Create an iAsBx instruction (signed Bx).
    pub fn asbx(op: OpCode, a: u32, sbx: i32) -> Self {
        debug_assert!((MIN_SBX..=MAX_SBX).contains(&sbx), "sBx out of range: {sbx}");
        Self::abx(op, a, (sbx + MAX_SBX) as u32)
    }

    // ---- Decoders ----

    /// Raw opcode bits; may name no opcode in a malformed chunk.
    #[inline]
    pub fn op_bits(&self) -> u8 {
        ((self.0 >> POS_OP) & mask(SIZE_OP)) as u8
    }

    /// Get the opcode. Unknown bits decode as MOVE; loaded chunks are verified.
    #[inline]
    pub fn opcode(&self) -> OpCode {
        OpCode::from_u8(self.op_bits()).unwrap_or(OpCode::Move)
    }

    #[inline]
    pub fn a(&self) -> u32 {
        (self.0 >> POS_A) & MAX_A
    }

    #[inline]
    pub fn b(&self) -> u32 {
        (self.0 >> POS_B) & MAX_B
    }

    #[inline]
    pub fn c(&self) -> u32 {
        (self.0 >> POS_C) & MAX_C
    }

    #[inline]
    pub fn bx(&self) -> u32 {
        (self.0 >> POS_BX) & MAX_BX
    }

    #[inline]
    pub fn sbx(&self) -> i32 {
        self.bx() as i32 - MAX_SBX
    }

    // ---- Mutators (for backpatching) ----

    pub fn set_a(&mut self, a: u32) {
        self.0 = (self.0 & !(MAX_A << POS_A)) | ((a & MAX_A) << POS_A);
    }

    pub fn set_sbx(&mut self, sbx: i32) {
        debug_assert!((MIN_SBX..=MAX_SBX).contains(&sbx));
        let bx = (sbx + MAX_SBX) as u32;
        self.0 = (self.0 & !(MAX_BX << POS_BX)) | (bx << POS_BX);
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.opcode();
        write!(f, "{}", op.name())?;
        match op.format() {
            InstructionFormat::IABC => write!(f, " A={} B={} C={}", self.a(), self.b(), self.c()),
            InstructionFormat::IABx => write!(f, " A={} Bx={}", self.a(), self.bx()),
            InstructionFormat::IAsBx => write!(f, " A={} sBx={}", self.a(), self.sbx()),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
