//! The operation layer.
//!
//! The dispatch loop delegates all value semantics it does not own to an
//! [`Operations`] implementation: generic binary operators and truth
//! testing. The specialized int handlers bypass the trait for speed but
//! share the checked arithmetic helpers here, so a site produces the
//! same result (or the same error) before and after generalization.

use lumen_core::{LanguageError, LanguageResult, Value};

use crate::code::BinaryOp;

/// Value semantics the engine delegates.
pub trait Operations: Send + Sync {
    /// Apply a binary operator to boxed operands.
    fn binary(&self, op: BinaryOp, lhs: &Value, rhs: &Value) -> LanguageResult<Value>;

    /// Truth-test a boxed value.
    fn truthy(&self, value: &Value) -> LanguageResult<bool>;
}

// =============================================================================
// Checked int arithmetic
// =============================================================================

/// Floor division, rounding toward negative infinity.
pub(crate) fn int_floordiv(a: i64, b: i64) -> LanguageResult<i64> {
    if b == 0 {
        return Err(LanguageError::zero_division(
            "integer division or modulo by zero",
        ));
    }
    if a == i64::MIN && b == -1 {
        return Err(int_overflow(BinaryOp::FloorDiv, a, b));
    }
    let q = a / b;
    let r = a % b;
    Ok(if r != 0 && (r < 0) != (b < 0) { q - 1 } else { q })
}

/// Modulo with the sign of the divisor.
pub(crate) fn int_mod(a: i64, b: i64) -> LanguageResult<i64> {
    if b == 0 {
        return Err(LanguageError::zero_division(
            "integer division or modulo by zero",
        ));
    }
    if a == i64::MIN && b == -1 {
        return Ok(0);
    }
    let r = a % b;
    Ok(if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
}

/// int × int → int, checked. Overflow is an error; the engine never
/// wraps and does not promote to wider integers.
pub(crate) fn int_arith(op: BinaryOp, a: i64, b: i64) -> LanguageResult<i64> {
    match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::FloorDiv => return int_floordiv(a, b),
        BinaryOp::Mod => return int_mod(a, b),
        _ => return Err(LanguageError::internal("not an int arithmetic operator")),
    }
    .ok_or_else(|| int_overflow(op, a, b))
}

/// int × int → bool comparison.
pub(crate) fn int_compare(op: BinaryOp, a: i64, b: i64) -> bool {
    match op {
        BinaryOp::Eq => a == b,
        BinaryOp::Ne => a != b,
        BinaryOp::Lt => a < b,
        BinaryOp::Le => a <= b,
        BinaryOp::Gt => a > b,
        BinaryOp::Ge => a >= b,
        _ => unreachable!("not a comparison"),
    }
}

/// int × int → float true division.
pub(crate) fn int_truediv(a: i64, b: i64) -> LanguageResult<f64> {
    if b == 0 {
        return Err(LanguageError::zero_division("division by zero"));
    }
    Ok(a as f64 / b as f64)
}

fn int_overflow(op: BinaryOp, a: i64, b: i64) -> LanguageError {
    LanguageError::overflow(format!(
        "integer result of {a} {} {b} out of range",
        op.symbol()
    ))
}

// =============================================================================
// Default operations
// =============================================================================

/// Reference semantics: machine ints (bools promote), floats, string
/// concatenation, structural equality, and ordering on numbers and
/// strings. Heap objects compare by identity and are always truthy.
#[derive(Debug, Default)]
pub struct DefaultOperations;

impl DefaultOperations {
    fn numeric(value: &Value) -> Option<f64> {
        match value {
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn as_int(value: &Value) -> Option<i64> {
        match value {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn eq(lhs: &Value, rhs: &Value) -> bool {
        match (lhs, rhs) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| Self::eq(x, y))
            }
            (Value::Obj(a), Value::Obj(b)) => std::ptr::eq(
                std::sync::Arc::as_ptr(a) as *const u8,
                std::sync::Arc::as_ptr(b) as *const u8,
            ),
            _ => match (Self::numeric(lhs), Self::numeric(rhs)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    fn type_mismatch(op: BinaryOp, lhs: &Value, rhs: &Value) -> LanguageError {
        LanguageError::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            lhs.type_name(),
            rhs.type_name()
        ))
    }
}

impl Operations for DefaultOperations {
    fn binary(&self, op: BinaryOp, lhs: &Value, rhs: &Value) -> LanguageResult<Value> {
        // Pure int lanes first, matching the specialized handlers.
        if let (Some(a), Some(b)) = (Self::as_int(lhs), Self::as_int(rhs)) {
            return Ok(match op {
                BinaryOp::Add
                | BinaryOp::Sub
                | BinaryOp::Mul
                | BinaryOp::FloorDiv
                | BinaryOp::Mod => Value::Int(int_arith(op, a, b)?),
                BinaryOp::TrueDiv => Value::Float(int_truediv(a, b)?),
                _ => Value::Bool(int_compare(op, a, b)),
            });
        }

        match op {
            BinaryOp::Eq => return Ok(Value::Bool(Self::eq(lhs, rhs))),
            BinaryOp::Ne => return Ok(Value::Bool(!Self::eq(lhs, rhs))),
            _ => {}
        }

        if let (Value::Str(a), Value::Str(b)) = (lhs, rhs) {
            return match op {
                BinaryOp::Add => {
                    let mut s = String::with_capacity(a.len() + b.len());
                    s.push_str(a);
                    s.push_str(b);
                    Ok(Value::str(s))
                }
                BinaryOp::Lt => Ok(Value::Bool(a < b)),
                BinaryOp::Le => Ok(Value::Bool(a <= b)),
                BinaryOp::Gt => Ok(Value::Bool(a > b)),
                BinaryOp::Ge => Ok(Value::Bool(a >= b)),
                _ => Err(Self::type_mismatch(op, lhs, rhs)),
            };
        }

        if let (Some(a), Some(b)) = (Self::numeric(lhs), Self::numeric(rhs)) {
            return Ok(match op {
                BinaryOp::Add => Value::Float(a + b),
                BinaryOp::Sub => Value::Float(a - b),
                BinaryOp::Mul => Value::Float(a * b),
                BinaryOp::TrueDiv | BinaryOp::FloorDiv | BinaryOp::Mod => {
                    if b == 0.0 {
                        return Err(LanguageError::zero_division("float division by zero"));
                    }
                    match op {
                        BinaryOp::TrueDiv => Value::Float(a / b),
                        BinaryOp::FloorDiv => Value::Float((a / b).floor()),
                        _ => Value::Float(a - b * (a / b).floor()),
                    }
                }
                BinaryOp::Lt => Value::Bool(a < b),
                BinaryOp::Le => Value::Bool(a <= b),
                BinaryOp::Gt => Value::Bool(a > b),
                BinaryOp::Ge => Value::Bool(a >= b),
                BinaryOp::Eq | BinaryOp::Ne => unreachable!("handled above"),
            });
        }

        Err(Self::type_mismatch(op, lhs, rhs))
    }

    fn truthy(&self, value: &Value) -> LanguageResult<bool> {
        Ok(match value {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Obj(_) => true,
        })
    }
}
