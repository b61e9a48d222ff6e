//! Pure value operations
//!
//! The coercions and numeric kernels the dispatcher is built on. Everything
//! here is metamethod-blind: operator overrides on tables are the
//! dispatcher's business, which falls back to these after the override
//! search misses (or never searches, for plain numeric operands).
//!
//! Integer arithmetic wraps. Integer division and remainder by zero are
//! reported, not computed; float division follows IEEE and may yield
//! infinities or NaN.

use crate::value::Value;

/// Binary arithmetic selector shared by register and constant variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Mod,
}

impl ArithOp {
    /// Hashed table key that overrides this operator.
    pub fn metamethod(self) -> &'static str {
        match self {
            ArithOp::Add => "__add",
            ArithOp::Sub => "__sub",
            ArithOp::Mul => "__mul",
            ArithOp::Div => "__div",
            ArithOp::Pow => "__pow",
            ArithOp::Mod => "__mod",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
            ArithOp::Pow => "pow",
            ArithOp::Mod => "mod",
        }
    }
}

/// Why a numeric kernel refused its operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumError {
    /// At least one operand is not an int or float.
    NotNumeric,
    /// Integer division or remainder by zero.
    DivisionByZero,
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn int_pow(base: i64, exp: i64) -> Value {
    if exp < 0 {
        // Negative exponents promote both operands to float.
        return Value::Float((base as f64).powf(exp as f64));
    }
    let exp = u32::try_from(exp).unwrap_or(u32::MAX);
    Value::Int(base.wrapping_pow(exp))
}

/// Binary arithmetic over numeric operands with int/float promotion.
pub fn num_binop(op: ArithOp, lhs: &Value, rhs: &Value) -> Result<Value, NumError> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        let (a, b) = (*a, *b);
        return match op {
            ArithOp::Add => Ok(Value::Int(a.wrapping_add(b))),
            ArithOp::Sub => Ok(Value::Int(a.wrapping_sub(b))),
            ArithOp::Mul => Ok(Value::Int(a.wrapping_mul(b))),
            ArithOp::Div => {
                if b == 0 {
                    Err(NumError::DivisionByZero)
                } else {
                    Ok(Value::Int(a.wrapping_div(b)))
                }
            }
            // Truncated remainder, matching the truncated division above.
            ArithOp::Mod => {
                if b == 0 {
                    Err(NumError::DivisionByZero)
                } else {
                    Ok(Value::Int(a.wrapping_rem(b)))
                }
            }
            ArithOp::Pow => Ok(int_pow(a, b)),
        };
    }

    let (a, b) = match (as_f64(lhs), as_f64(rhs)) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(NumError::NotNumeric),
    };
    Ok(Value::Float(match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => a % b,
        ArithOp::Pow => a.powf(b),
    }))
}

/// Arithmetic negation.
pub fn num_neg(v: &Value) -> Option<Value> {
    match v {
        Value::Int(i) => Some(Value::Int(i.wrapping_neg())),
        Value::Float(f) => Some(Value::Float(-f)),
        _ => None,
    }
}

/// Add a small integer delta (INCREMENT/DECREMENT).
pub fn num_step(v: &Value, delta: i64) -> Option<Value> {
    match v {
        Value::Int(i) => Some(Value::Int(i.wrapping_add(delta))),
        Value::Float(f) => Some(Value::Float(f + delta as f64)),
        _ => None,
    }
}

/// Numeric less-than with promotion; `None` when either side is not numeric.
pub fn num_lt(lhs: &Value, rhs: &Value) -> Option<bool> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(a < b),
        _ => Some(as_f64(lhs)? < as_f64(rhs)?),
    }
}

/// Numeric less-or-equal with promotion.
pub fn num_le(lhs: &Value, rhs: &Value) -> Option<bool> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(a <= b),
        _ => Some(as_f64(lhs)? <= as_f64(rhs)?),
    }
}

/// Stringification without metamethods; the dispatcher consults
/// `__tostring` before falling back here.
pub fn display(v: &Value) -> String {
    match v {
        Value::Nil => "nil".to_string(),
        Value::Int(i) => i.to_string(),
        // `{:?}` is the shortest round-trip form, and keeps the trailing
        // ".0" that distinguishes floats from ints.
        Value::Float(f) => format!("{f:?}"),
        Value::Bool(b) => b.to_string(),
        Value::Str(s) => s.as_str().to_string(),
        Value::Table(t) => {
            let parts: Vec<String> = t.entries().iter().map(display).collect();
            format!("{{{}}}", parts.join(", "))
        }
        Value::Closure(c) => format!("<function@0x{:x}>", std::sync::Arc::as_ptr(c) as usize),
        Value::Foreign(f) => format!("<cfunction@0x{:x}>", std::sync::Arc::as_ptr(f) as usize),
    }
}

/// Numeric coercion: numbers pass through, booleans become 0/1, strings are
/// parsed. Everything else is nil.
pub fn to_number(v: &Value) -> Value {
    match v {
        Value::Int(_) | Value::Float(_) => v.clone(),
        Value::Bool(b) => Value::Int(i64::from(*b)),
        Value::Str(s) => parse_number(s.as_str()).unwrap_or(Value::Nil),
        _ => Value::Nil,
    }
}

/// Parse integer first (decimal, `0x` hex, `0b` binary), then float.
pub fn parse_number(text: &str) -> Option<Value> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, text.strip_prefix('+').unwrap_or(text)),
    };
    let int = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = digits.strip_prefix("0b").or_else(|| digits.strip_prefix("0B")) {
        i64::from_str_radix(bin, 2).ok()
    } else {
        digits.parse::<i64>().ok()
    };
    if let Some(i) = int {
        return Some(Value::Int(i.wrapping_mul(sign)));
    }

    text.parse::<f64>().ok().map(Value::Float)
}

/// Length without metamethods: character count for strings, ordered-part
/// count for tables, nil otherwise. The dispatcher consults `__len` first.
pub fn len(v: &Value) -> Value {
    match v {
        Value::Str(s) => Value::Int(s.char_len() as i64),
        Value::Table(t) => Value::Int(t.len()),
        _ => Value::Nil,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{TableKey, TableRef};

    #[test]
    fn test_int_arithmetic_wraps() {
        assert_eq!(
            num_binop(ArithOp::Add, &Value::Int(i64::MAX), &Value::Int(1)),
            Ok(Value::Int(i64::MIN))
        );
        assert_eq!(
            num_binop(ArithOp::Mul, &Value::Int(i64::MIN), &Value::Int(-1)),
            Ok(Value::Int(i64::MIN))
        );
    }

    #[test]
    fn test_division_by_zero_is_reported() {
        assert_eq!(
            num_binop(ArithOp::Div, &Value::Int(7), &Value::Int(0)),
            Err(NumError::DivisionByZero)
        );
        assert_eq!(
            num_binop(ArithOp::Mod, &Value::Int(7), &Value::Int(0)),
            Err(NumError::DivisionByZero)
        );
    }

    #[test]
    fn test_float_division_by_zero_is_ieee() {
        match num_binop(ArithOp::Div, &Value::Float(1.0), &Value::Float(0.0)) {
            Ok(Value::Float(f)) => assert!(f.is_infinite() && f > 0.0),
            other => panic!("expected +inf, got {other:?}"),
        }
        match num_binop(ArithOp::Div, &Value::Float(0.0), &Value::Float(0.0)) {
            Ok(Value::Float(f)) => assert!(f.is_nan()),
            other => panic!("expected NaN, got {other:?}"),
        }
    }

    #[test]
    fn test_mixed_operands_promote_to_float() {
        assert_eq!(
            num_binop(ArithOp::Div, &Value::Int(7), &Value::Float(2.0)),
            Ok(Value::Float(3.5))
        );
        assert_eq!(
            num_binop(ArithOp::Add, &Value::Float(0.5), &Value::Int(1)),
            Ok(Value::Float(1.5))
        );
    }

    #[test]
    fn test_truncated_modulo_for_negatives() {
        // Matches C's % on negative operands.
        assert_eq!(
            num_binop(ArithOp::Mod, &Value::Int(-7), &Value::Int(3)),
            Ok(Value::Int(-1))
        );
        assert_eq!(
            num_binop(ArithOp::Mod, &Value::Int(7), &Value::Int(-3)),
            Ok(Value::Int(1))
        );
    }

    #[test]
    fn test_integer_pow() {
        assert_eq!(
            num_binop(ArithOp::Pow, &Value::Int(2), &Value::Int(10)),
            Ok(Value::Int(1024))
        );
        // Negative exponent promotes to float.
        assert_eq!(
            num_binop(ArithOp::Pow, &Value::Int(2), &Value::Int(-1)),
            Ok(Value::Float(0.5))
        );
    }

    #[test]
    fn test_non_numeric_operands_are_refused() {
        assert_eq!(
            num_binop(ArithOp::Add, &Value::Bool(true), &Value::Int(1)),
            Err(NumError::NotNumeric)
        );
        assert_eq!(num_neg(&Value::Nil), None);
        assert_eq!(num_lt(&Value::Nil, &Value::Int(0)), None);
    }

    #[test]
    fn test_parse_number_forms() {
        assert_eq!(parse_number("42"), Some(Value::Int(42)));
        assert_eq!(parse_number("-42"), Some(Value::Int(-42)));
        assert_eq!(parse_number("0x1f"), Some(Value::Int(31)));
        assert_eq!(parse_number("0b101"), Some(Value::Int(5)));
        assert_eq!(parse_number("3.5"), Some(Value::Float(3.5)));
        assert_eq!(parse_number("  7 "), Some(Value::Int(7)));
        assert_eq!(parse_number("pizza"), None);
    }

    #[test]
    fn test_to_number_coercions() {
        assert_eq!(to_number(&Value::Bool(true)), Value::Int(1));
        assert_eq!(to_number(&Value::Bool(false)), Value::Int(0));
        assert_eq!(to_number(&Value::Nil), Value::Nil);
        assert_eq!(to_number(&Value::Float(2.5)), Value::Float(2.5));
    }

    #[test]
    fn test_display_primitives() {
        assert_eq!(display(&Value::Nil), "nil");
        assert_eq!(display(&Value::Bool(true)), "true");
        assert_eq!(display(&Value::Int(-3)), "-3");
        assert_eq!(display(&Value::Float(2.0)), "2.0");
        assert_eq!(display(&Value::Float(3.5)), "3.5");
    }

    #[test]
    fn test_display_table_in_insertion_order() {
        let t = TableRef::new();
        t.set(TableKey::Index(0), Value::Int(1)).unwrap();
        t.set(TableKey::from_name("x"), Value::Int(2)).unwrap();
        assert_eq!(display(&Value::Table(t)), "{1, 2}");
    }

    #[test]
    fn test_num_compare_mixed() {
        assert_eq!(num_lt(&Value::Int(1), &Value::Float(1.5)), Some(true));
        assert_eq!(num_le(&Value::Float(2.0), &Value::Int(2)), Some(true));
        assert_eq!(num_lt(&Value::Float(f64::NAN), &Value::Float(0.0)), Some(false));
    }
}
