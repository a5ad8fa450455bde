//! Boxed value representation.
//!
//! The engine stores most values boxed in this enum; the interpreter's
//! frame slots additionally hold unboxed int/bool representations and
//! widen to `Value` when a speculative assumption fails. Heap-backed
//! variants are `Arc`-shared so cloning a value is cheap and frames can
//! be copied on generator suspension without deep-copying objects.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Trait implemented by every heap object the engine can hold.
///
/// The engine itself only knows a handful of concrete objects (functions,
/// generators, cells, exceptions); everything else is owned by the
/// operation-node layer and flows through here opaquely. Downcasting goes
/// through [`Object::as_any`].
pub trait Object: fmt::Debug + Send + Sync {
    /// Language-level type name, used in error messages.
    fn type_name(&self) -> &'static str;

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;

    /// Ownership-preserving downcast support. Implementations return
    /// `self`.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A boxed language value.
#[derive(Debug, Clone)]
pub enum Value {
    /// The singleton "no value".
    None,
    /// Boolean.
    Bool(bool),
    /// Machine-width integer. Overflow beyond this width is the
    /// operation layer's concern; the engine never wraps.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// Immutable string.
    Str(Arc<str>),
    /// Immutable sequence, used for varargs/keyword plumbing.
    Tuple(Arc<[Value]>),
    /// Heap object (function, generator, cell, exception, or anything
    /// the operation layer defines).
    Obj(Arc<dyn Object>),
}

impl Value {
    /// Create a string value.
    #[must_use]
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Self::Str(s.into())
    }

    /// Create a tuple value.
    #[must_use]
    pub fn tuple(items: impl Into<Arc<[Value]>>) -> Self {
        Self::Tuple(items.into())
    }

    /// Wrap a heap object.
    #[must_use]
    pub fn obj(o: Arc<impl Object + 'static>) -> Self {
        Self::Obj(o)
    }

    /// Check for the `None` singleton.
    #[inline]
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Extract an integer, if this is one.
    #[inline]
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Extract a bool, if this is one.
    #[inline]
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Extract a float, if this is one.
    #[inline]
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Extract a string slice, if this is a string.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Downcast a heap object to a concrete type.
    #[must_use]
    pub fn downcast<T: 'static>(&self) -> Option<&T> {
        match self {
            Self::Obj(o) => o.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Language-level type name, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Tuple(_) => "tuple",
            Self::Obj(o) => o.type_name(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => f.write_str(s),
            Self::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
            Self::Obj(o) => write!(f, "<{}>", o.type_name()),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Marker(u32);

    impl Object for Marker {
        fn type_name(&self) -> &'static str {
            "marker"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Int(7).as_int(), Some(7));
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Int(7).as_bool(), None);
        assert!(Value::None.is_none());
        assert_eq!(Value::from("hi").as_str(), Some("hi"));
    }

    #[test]
    fn test_downcast() {
        let v = Value::obj(Arc::new(Marker(3)));
        assert_eq!(v.downcast::<Marker>().map(|m| m.0), Some(3));
        assert!(v.downcast::<String>().is_none());
        assert_eq!(v.type_name(), "marker");
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::None.to_string(), "None");
        assert_eq!(Value::Bool(true).to_string(), "True");
        assert_eq!(
            Value::tuple(vec![Value::Int(1), Value::Int(2)]).to_string(),
            "(1, 2)"
        );
    }

    #[test]
    fn test_clone_is_shallow() {
        let s: Arc<str> = Arc::from("shared");
        let v = Value::Str(s.clone());
        let _w = v.clone();
        // Two values plus the local handle.
        assert_eq!(Arc::strong_count(&s), 3);
    }
}
