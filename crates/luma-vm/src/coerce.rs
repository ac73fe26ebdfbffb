//! String/number coercions.

use luma_core::string::{StringId, StringInterner};
use luma_core::value::TValue;

/// Significant digits used when converting numbers to strings.
const NUMBER_DIGITS: usize = 14;

/// Convert a value to a number: numbers as-is, numeric strings parsed.
pub fn to_number(v: TValue, strings: &StringInterner) -> Option<f64> {
    if let Some(f) = v.as_number() {
        Some(f)
    } else if let Some(sid) = v.as_string_id() {
        str_to_number(strings.get_bytes(sid))
    } else {
        None
    }
}

/// Parse the text of a numeric string: optional surrounding whitespace,
/// a decimal float, or a `0x` hexadecimal integer.
pub fn str_to_number(bytes: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(bytes).ok()?;
    let s = s.trim_matches(|c: char| c.is_ascii_whitespace() || c == '\x0b');
    if s.is_empty() {
        return None;
    }
    let (neg, digits) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let mut n = 0.0f64;
        for b in hex.bytes() {
            n = n * 16.0 + (b as char).to_digit(16)? as f64;
        }
        return Some(if neg { -n } else { n });
    }
    // Rust's float grammar admits "inf"/"nan" spellings, as C's strtod does.
    s.parse::<f64>().ok()
}

/// Parse an integer numeral in `base` (2..=36), as `tonumber(s, base)` does.
pub fn str_to_number_base(bytes: &[u8], base: u32) -> Option<f64> {
    let s = std::str::from_utf8(bytes).ok()?;
    let s = s.trim_matches(|c: char| c.is_ascii_whitespace());
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if digits.is_empty() {
        return None;
    }
    let mut n = 0.0f64;
    for c in digits.chars() {
        n = n * base as f64 + c.to_digit(base)? as f64;
    }
    Some(if neg { -n } else { n })
}

/// Format a number the way Lua's `%.14g` does.
pub fn number_to_str(f: f64) -> String {
    if f.is_nan() {
        return if f.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if f.is_infinite() {
        return if f < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    // Round to the significant digits first; the exponent of the rounded
    // value picks fixed or scientific notation.
    let sci = format!("{:.*e}", NUMBER_DIGITS - 1, f);
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return sci;
    };
    let exp: i32 = exp.parse().unwrap_or(0);
    if exp < -4 || exp >= NUMBER_DIGITS as i32 {
        let mantissa = strip_zeros(mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exp.abs())
    } else {
        let decimals = (NUMBER_DIGITS as i32 - 1 - exp).max(0) as usize;
        let fixed = format!("{:.*}", decimals, f);
        strip_zeros(&fixed).to_string()
    }
}

fn strip_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// String form of a string or number operand, interning numbers on demand.
pub fn to_str_id(v: TValue, strings: &mut StringInterner) -> Option<StringId> {
    if let Some(sid) = v.as_string_id() {
        Some(sid)
    } else {
        v.as_number()
            .map(|f| strings.intern(number_to_str(f).as_bytes()))
    }
}
