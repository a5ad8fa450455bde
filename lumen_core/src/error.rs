//! Language-level error hierarchy.
//!
//! Three severities share this enum:
//! - user-visible language errors, catchable by handler ranges;
//! - `Cancelled`, the distinguished cooperative-cancellation signal,
//!   unwound like an error but never matched to a handler;
//! - `Internal`, fatal invariant violations that abort the activation.

use thiserror::Error;

/// The result type used by the operation layer and the engine internals.
pub type LanguageResult<T> = Result<T, LanguageError>;

/// A language-level error condition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LanguageError {
    /// Local variable read before any assignment.
    #[error("UnboundLocalError: local variable '{name}' referenced before assignment")]
    UnboundLocal {
        /// The variable name.
        name: String,
    },

    /// Closure cell read before the enclosing scope assigned it.
    #[error("NameError: free variable '{name}' referenced before assignment in enclosing scope")]
    UnboundCell {
        /// The variable name.
        name: String,
    },

    /// Type mismatch.
    #[error("TypeError: {message}")]
    Type {
        /// Error description.
        message: String,
    },

    /// Invalid value.
    #[error("ValueError: {message}")]
    Value {
        /// Error description.
        message: String,
    },

    /// Division or modulo by zero.
    #[error("ZeroDivisionError: {message}")]
    ZeroDivision {
        /// Error description.
        message: String,
    },

    /// Arithmetic result out of machine-integer range.
    #[error("OverflowError: {message}")]
    Overflow {
        /// Error description.
        message: String,
    },

    /// Generator/iterator exhausted. Carries the final return value's
    /// display form for diagnostics.
    #[error("StopIteration: {message}")]
    StopIteration {
        /// Error description.
        message: String,
    },

    /// Generic runtime error (wrong generator state, user raise of a
    /// non-exception value, and similar).
    #[error("RuntimeError: {message}")]
    Runtime {
        /// Error description.
        message: String,
    },

    /// Cooperative cancellation. Unwinds through the normal path but is
    /// never delivered to language-level handlers.
    #[error("Cancelled: activation cancelled")]
    Cancelled,

    /// Recursion limit exceeded.
    #[error("RecursionError: maximum recursion depth exceeded")]
    Recursion,

    /// Fatal engine invariant violation. Never delivered to handlers.
    #[error("InternalError: {message}")]
    Internal {
        /// Error description.
        message: String,
    },
}

impl LanguageError {
    /// Create a type error.
    #[must_use]
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type {
            message: message.into(),
        }
    }

    /// Create a value error.
    #[must_use]
    pub fn value_error(message: impl Into<String>) -> Self {
        Self::Value {
            message: message.into(),
        }
    }

    /// Create a zero-division error.
    #[must_use]
    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::ZeroDivision {
            message: message.into(),
        }
    }

    /// Create an overflow error.
    #[must_use]
    pub fn overflow(message: impl Into<String>) -> Self {
        Self::Overflow {
            message: message.into(),
        }
    }

    /// Create a stop-iteration signal.
    #[must_use]
    pub fn stop_iteration(message: impl Into<String>) -> Self {
        Self::StopIteration {
            message: message.into(),
        }
    }

    /// Create a runtime error.
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Create a fatal internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an unbound-local error.
    #[must_use]
    pub fn unbound_local(name: impl Into<String>) -> Self {
        Self::UnboundLocal { name: name.into() }
    }

    /// Create an unbound-cell error.
    #[must_use]
    pub fn unbound_cell(name: impl Into<String>) -> Self {
        Self::UnboundCell { name: name.into() }
    }

    /// Whether handler ranges may intercept this error. Cancellation and
    /// internal invariant violations always propagate.
    #[must_use]
    pub const fn is_catchable(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::Internal { .. })
    }

    /// Language-level exception type name.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::UnboundLocal { .. } => "UnboundLocalError",
            Self::UnboundCell { .. } => "NameError",
            Self::Type { .. } => "TypeError",
            Self::Value { .. } => "ValueError",
            Self::ZeroDivision { .. } => "ZeroDivisionError",
            Self::Overflow { .. } => "OverflowError",
            Self::StopIteration { .. } => "StopIteration",
            Self::Runtime { .. } => "RuntimeError",
            Self::Cancelled => "Cancelled",
            Self::Recursion => "RecursionError",
            Self::Internal { .. } => "InternalError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = LanguageError::unbound_local("x");
        assert_eq!(
            err.to_string(),
            "UnboundLocalError: local variable 'x' referenced before assignment"
        );
        assert_eq!(err.kind_name(), "UnboundLocalError");

        let err = LanguageError::zero_division("integer division or modulo by zero");
        assert_eq!(
            err.to_string(),
            "ZeroDivisionError: integer division or modulo by zero"
        );
    }

    #[test]
    fn test_catchability() {
        assert!(LanguageError::type_error("x").is_catchable());
        assert!(LanguageError::overflow("x").is_catchable());
        assert!(!LanguageError::Cancelled.is_catchable());
        assert!(!LanguageError::internal("bad opcode").is_catchable());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(LanguageError::unbound_cell("f").kind_name(), "NameError");
        assert_eq!(LanguageError::Recursion.kind_name(), "RecursionError");
        assert_eq!(LanguageError::Cancelled.kind_name(), "Cancelled");
    }
}
