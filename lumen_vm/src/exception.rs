//! Exception objects and handler lookup.
//!
//! In-flight exceptions travel through the dispatch loop as
//! [`Arc<ExceptionObject>`]: a language error plus the mutable state
//! that accretes while it propagates (traceback entries, the implicit
//! context chain). Handler lookup is a linear scan of the unit's sorted
//! range table; with nesting, the innermost enclosing range wins.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use lumen_core::{LanguageError, Object, Value};
use parking_lot::Mutex;

use crate::code::{CompiledUnit, HandlerRange};

/// Result of running bytecode. An uncaught exception leaves every
/// activation boundary as the exception object itself, so its identity,
/// context chain, and accumulated traceback survive to the caller (or
/// to the host).
pub type ExecResult<T> = Result<T, Arc<ExceptionObject>>;

/// Bound on the context-chain walk used for cycle suppression. Chains
/// longer than this are truncated rather than walked further.
const CHAIN_WALK_LIMIT: usize = 128;

/// One traceback frame, innermost last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracebackEntry {
    /// Function name.
    pub function: Arc<str>,
    /// Source line, when the unit has position information.
    pub line: Option<u32>,
    /// Raising bytecode index.
    pub bci: u32,
}

/// A language exception as a heap object.
#[derive(Debug)]
pub struct ExceptionObject {
    /// The underlying error condition.
    pub error: LanguageError,
    /// Implicitly chained exception: the one that was being handled
    /// when this one was raised.
    context: Mutex<Option<Arc<ExceptionObject>>>,
    /// Traceback, innermost frame last.
    traceback: Mutex<Vec<TracebackEntry>>,
}

impl ExceptionObject {
    /// Wrap an error with an empty traceback and no context.
    #[must_use]
    pub fn new(error: LanguageError) -> Arc<Self> {
        Arc::new(Self {
            error,
            context: Mutex::new(None),
            traceback: Mutex::new(Vec::new()),
        })
    }

    /// Language-level exception type name.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        self.error.kind_name()
    }

    /// The chained context, if any.
    #[must_use]
    pub fn context(&self) -> Option<Arc<ExceptionObject>> {
        self.context.lock().clone()
    }

    /// Chain `prev` as this exception's implicit context.
    ///
    /// No-op when a context is already set (explicit re-raises keep
    /// their original chain) or when `prev` is this exception itself.
    /// The walk down `prev`'s chain severs any link back to `self`, and
    /// gives up past [`CHAIN_WALK_LIMIT`] hops, so pathological chains
    /// are truncated instead of looping forever.
    pub fn chain_context(self: &Arc<Self>, prev: Arc<ExceptionObject>) {
        if Arc::ptr_eq(self, &prev) || self.context.lock().is_some() {
            return;
        }
        // Sever any link back to this exception before publishing the
        // chain. Only one node's lock is held at a time.
        let mut cursor = Arc::clone(&prev);
        for _ in 0..CHAIN_WALK_LIMIT {
            let next = {
                let mut ctx = cursor.context.lock();
                match ctx.as_ref() {
                    Some(next) if Arc::ptr_eq(next, self) => {
                        *ctx = None;
                        break;
                    }
                    Some(next) => Arc::clone(next),
                    None => break,
                }
            };
            cursor = next;
        }
        let mut slot = self.context.lock();
        if slot.is_none() {
            *slot = Some(prev);
        }
    }

    /// Append a traceback frame (innermost last).
    pub fn push_traceback(&self, function: Arc<str>, line: Option<u32>, bci: u32) {
        self.traceback.lock().push(TracebackEntry {
            function,
            line,
            bci,
        });
    }

    /// Snapshot of the traceback.
    #[must_use]
    pub fn traceback(&self) -> Vec<TracebackEntry> {
        self.traceback.lock().clone()
    }

    /// Length of the context chain, capped at the walk limit.
    #[must_use]
    pub fn chain_len(&self) -> usize {
        let mut len = 0;
        let mut cursor = self.context();
        while let Some(exc) = cursor {
            len += 1;
            if len >= CHAIN_WALK_LIMIT {
                break;
            }
            cursor = exc.context();
        }
        len
    }
}

impl fmt::Display for ExceptionObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl Object for ExceptionObject {
    fn type_name(&self) -> &'static str {
        self.error.kind_name()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Coerce a raised value to an exception object. Raising anything else
/// is itself a type error.
pub fn to_exception(value: Value) -> Result<Arc<ExceptionObject>, LanguageError> {
    match value {
        Value::Obj(obj) if obj.as_any().is::<ExceptionObject>() => obj
            .into_any()
            .downcast::<ExceptionObject>()
            .map_err(|_| LanguageError::internal("exception downcast failed")),
        other => Err(LanguageError::type_error(format!(
            "exceptions must be exception objects, not '{}'",
            other.type_name()
        ))),
    }
}

/// Find the innermost handler range enclosing `bci`.
///
/// The table is sorted by start (outer ranges before the inner ranges
/// they contain), so the last match of a linear scan is the innermost.
#[must_use]
pub fn find_handler(unit: &CompiledUnit, bci: u32) -> Option<HandlerRange> {
    let mut found = None;
    for range in unit.handlers.iter() {
        if range.start > bci {
            break;
        }
        if range.contains(bci) {
            found = Some(*range);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{Opcode, UnitBuilder};

    #[test]
    fn test_chain_context() {
        let first = ExceptionObject::new(LanguageError::value_error("first"));
        let second = ExceptionObject::new(LanguageError::type_error("second"));
        second.chain_context(Arc::clone(&first));
        assert!(Arc::ptr_eq(&second.context().unwrap(), &first));
        // Already chained: a later chain attempt does not overwrite.
        let third = ExceptionObject::new(LanguageError::runtime("third"));
        second.chain_context(third);
        assert!(Arc::ptr_eq(&second.context().unwrap(), &first));
    }

    #[test]
    fn test_chain_self_is_ignored() {
        let exc = ExceptionObject::new(LanguageError::runtime("loop"));
        exc.chain_context(Arc::clone(&exc));
        assert!(exc.context().is_none());
    }

    #[test]
    fn test_chain_cycle_is_severed() {
        let a = ExceptionObject::new(LanguageError::runtime("a"));
        let b = ExceptionObject::new(LanguageError::runtime("b"));
        b.chain_context(Arc::clone(&a));
        // Chaining b under a would create a -> b -> a.
        a.chain_context(Arc::clone(&b));
        assert_eq!(a.chain_len(), 1);
        assert!(b.context().is_none());
    }

    #[test]
    fn test_to_exception_rejects_plain_values() {
        let err = to_exception(Value::Int(3)).unwrap_err();
        assert!(err.to_string().contains("not 'int'"));
        let exc = ExceptionObject::new(LanguageError::value_error("v"));
        let round = to_exception(Value::Obj(exc.clone())).unwrap();
        assert!(Arc::ptr_eq(&round, &exc));
    }

    #[test]
    fn test_find_handler_innermost() {
        let mut b = UnitBuilder::new("h");
        for _ in 0..20 {
            b.op(Opcode::Nop);
        }
        b.op(Opcode::LoadNone);
        b.op(Opcode::Return);
        b.handler(0, 16, 17, 0);
        b.handler(4, 10, 12, 1);
        let unit = b.build();

        assert_eq!(find_handler(&unit, 2).unwrap().handler, 17);
        assert_eq!(find_handler(&unit, 6).unwrap().handler, 12);
        assert_eq!(find_handler(&unit, 6).unwrap().stack_depth, 1);
        assert_eq!(find_handler(&unit, 11).unwrap().handler, 17);
        assert!(find_handler(&unit, 18).is_none());
    }

    #[test]
    fn test_traceback_order() {
        let exc = ExceptionObject::new(LanguageError::runtime("x"));
        exc.push_traceback(Arc::from("inner"), Some(3), 8);
        exc.push_traceback(Arc::from("outer"), Some(10), 2);
        let tb = exc.traceback();
        assert_eq!(&*tb[0].function, "inner");
        assert_eq!(&*tb[1].function, "outer");
    }
}
