//! Arithmetic on numbers and numeric strings.

use crate::coerce;
use crate::metamethod::MetamethodNames;
use luma_core::string::{StringId, StringInterner};
use luma_core::value::TValue;

/// Arithmetic operation kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
}

impl ArithOp {
    /// The metamethod consulted when an operand is not a number.
    pub fn event(self, names: &MetamethodNames) -> StringId {
        match self {
            ArithOp::Add => names.add,
            ArithOp::Sub => names.sub,
            ArithOp::Mul => names.mul,
            ArithOp::Div => names.div,
            ArithOp::Mod => names.mod_,
            ArithOp::Pow => names.pow,
            ArithOp::Unm => names.unm,
        }
    }
}

/// Result of an arithmetic operation that may need a metamethod fallback.
pub enum ArithResult {
    Ok(TValue),
    /// An operand does not convert to a number; try the event's handler.
    NeedMetamethod,
}

/// Perform an arithmetic operation, coercing numeric strings.
/// For `Unm` the second operand is ignored.
pub fn arith_op(op: ArithOp, a: TValue, b: TValue, strings: &StringInterner) -> ArithResult {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return ArithResult::Ok(TValue::from_number(num_arith(op, x, y)));
    }
    let x = coerce::to_number(a, strings);
    let y = if op == ArithOp::Unm { x } else { coerce::to_number(b, strings) };
    match (x, y) {
        (Some(x), Some(y)) => ArithResult::Ok(TValue::from_number(num_arith(op, x, y))),
        _ => ArithResult::NeedMetamethod,
    }
}

/// Double-precision arithmetic with Lua's floored modulo.
#[inline]
pub fn num_arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => lua_fmod(a, b),
        ArithOp::Pow => a.powf(b),
        ArithOp::Unm => -a,
    }
}

/// `a - floor(a/b)*b`: the result takes the sign of the divisor.
#[inline]
pub fn lua_fmod(a: f64, b: f64) -> f64 {
    a - (a / b).floor() * b
}
