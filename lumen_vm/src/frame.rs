//! Activation frames.
//!
//! A frame holds one flat slot array, locals first and the operand stack
//! behind them, plus the closure cells visible to the activation. Slots
//! carry either an unboxed representation placed there by a specialized
//! store/load, the boxed [`Value`], or nothing at all (`Unset` is how
//! unassigned locals are observed).
//!
//! Frames are plain owned data. For ordinary calls one lives on the Rust
//! stack of the dispatch loop; generators persist one inside the
//! generator object and move it out for the duration of each resume.
//! Copying a frame is cheap regardless because every heap-backed value
//! is `Arc`-shared.

use std::any::Any;
use std::sync::Arc;

use lumen_core::{LanguageError, LanguageResult, Object, Value};
use parking_lot::Mutex;

use crate::code::CompiledUnit;

// =============================================================================
// Cells
// =============================================================================

/// A closure cell: one shared, mutable variable binding.
///
/// Cells outlive the frame that created them, so reads and writes go
/// through a mutex. An empty cell is a variable the enclosing scope has
/// not assigned yet.
#[derive(Debug, Default)]
pub struct Cell {
    value: Mutex<Option<Value>>,
}

impl Cell {
    /// Create an empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cell holding `value`.
    #[must_use]
    pub fn with_value(value: Value) -> Self {
        Self {
            value: Mutex::new(Some(value)),
        }
    }

    /// Read the cell, or `None` if it was never assigned.
    #[must_use]
    pub fn get(&self) -> Option<Value> {
        self.value.lock().clone()
    }

    /// Assign the cell.
    pub fn set(&self, value: Value) {
        *self.value.lock() = Some(value);
    }
}

impl Object for Cell {
    fn type_name(&self) -> &'static str {
        "cell"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// =============================================================================
// Slots
// =============================================================================

/// One frame slot.
///
/// Unboxed variants exist only while the producing and consuming sites
/// both speculate on the representation; any reader can widen a slot to
/// a boxed [`Value`] without information loss.
#[derive(Debug, Clone, Default)]
pub enum Slot {
    /// No value. Reading an unset local raises `UnboundLocalError`.
    #[default]
    Unset,
    /// Unboxed machine integer.
    Int(i64),
    /// Unboxed boolean.
    Bool(bool),
    /// Boxed value.
    Obj(Value),
}

impl Slot {
    /// Whether the slot holds no value.
    #[inline]
    #[must_use]
    pub const fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    /// Widen to a boxed value. `None` if the slot is unset.
    #[inline]
    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Unset => None,
            Self::Int(i) => Some(Value::Int(i)),
            Self::Bool(b) => Some(Value::Bool(b)),
            Self::Obj(v) => Some(v),
        }
    }

    /// Box a value into a slot.
    #[inline]
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        Self::Obj(value)
    }
}

// =============================================================================
// Frames
// =============================================================================

/// One activation of a compiled unit.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The program this frame executes.
    pub unit: Arc<CompiledUnit>,
    /// `[locals | operand stack]`.
    slots: Box<[Slot]>,
    /// Closure cells: own cell variables first, then received free
    /// variables, indexed as the cell opcodes expect.
    pub cells: Box<[Arc<Cell>]>,
    /// Resume point. Meaningful only while suspended.
    pub bci: u32,
    /// Operand stack depth.
    pub sp: u16,
    /// The exception currently being handled, if any. Saved and restored
    /// by the exception bookkeeping opcodes so handlers nest.
    pub active_exc: Option<Value>,
}

impl Frame {
    /// Create a frame with unset locals, an empty stack, fresh cells for
    /// the unit's cell variables, and `free` received from the caller.
    pub fn new(unit: Arc<CompiledUnit>, free: &[Arc<Cell>]) -> LanguageResult<Self> {
        if free.len() != unit.free_names.len() {
            return Err(LanguageError::internal(format!(
                "function '{}' expects {} free cells, got {}",
                unit.name,
                unit.free_names.len(),
                free.len()
            )));
        }
        let nslots = unit.local_names.len() + unit.stack_size as usize;
        let cells: Box<[Arc<Cell>]> = unit
            .cell_names
            .iter()
            .map(|_| Arc::new(Cell::new()))
            .chain(free.iter().cloned())
            .collect();
        Ok(Self {
            unit,
            slots: vec![Slot::Unset; nslots].into_boxed_slice(),
            cells,
            bci: 0,
            sp: 0,
            active_exc: None,
        })
    }

    /// Bind call arguments: positionals into the leading local slots,
    /// keywords by parameter name, then seed argument-backed cells.
    pub fn bind_args(&mut self, args: &[Value], kwargs: &[(Arc<str>, Value)]) -> LanguageResult<()> {
        let params = self.unit.param_count as usize;
        if args.len() > params {
            return Err(LanguageError::type_error(format!(
                "{}() takes {} positional argument{} but {} were given",
                self.unit.name,
                params,
                if params == 1 { "" } else { "s" },
                args.len()
            )));
        }
        for (i, arg) in args.iter().enumerate() {
            self.slots[i] = Slot::Obj(arg.clone());
        }
        for (name, value) in kwargs {
            let idx = self.unit.local_names[..params]
                .iter()
                .position(|p| **p == **name)
                .ok_or_else(|| {
                    LanguageError::type_error(format!(
                        "{}() got an unexpected keyword argument '{name}'",
                        self.unit.name
                    ))
                })?;
            if !self.slots[idx].is_unset() {
                return Err(LanguageError::type_error(format!(
                    "{}() got multiple values for argument '{name}'",
                    self.unit.name
                )));
            }
            self.slots[idx] = Slot::Obj(value.clone());
        }
        if let Some(missing) = self.slots[..params].iter().position(Slot::is_unset) {
            return Err(LanguageError::type_error(format!(
                "{}() missing required argument '{}'",
                self.unit.name,
                self.unit.local_name(missing as u16)
            )));
        }

        // Arguments captured by nested closures move into their cells.
        let cell2arg = self.unit.cell2arg.clone();
        for (cell_idx, &arg_idx) in cell2arg.iter().enumerate() {
            if arg_idx >= 0 {
                let slot = std::mem::take(&mut self.slots[arg_idx as usize]);
                if let Some(value) = slot.into_value() {
                    self.cells[cell_idx].set(value);
                }
            }
        }
        Ok(())
    }

    /// Number of local slots.
    #[inline]
    #[must_use]
    pub fn locals_len(&self) -> usize {
        self.unit.local_names.len()
    }

    /// Read a local slot.
    #[inline]
    #[must_use]
    pub fn local(&self, index: u16) -> &Slot {
        &self.slots[index as usize]
    }

    /// Write a local slot.
    #[inline]
    pub fn set_local(&mut self, index: u16, slot: Slot) {
        self.slots[index as usize] = slot;
    }

    /// Push onto the operand stack.
    #[inline]
    pub fn push(&mut self, slot: Slot) {
        let at = self.locals_len() + self.sp as usize;
        self.slots[at] = slot;
        self.sp += 1;
    }

    /// Pop the operand stack.
    #[inline]
    pub fn pop(&mut self) -> Slot {
        self.sp -= 1;
        let at = self.locals_len() + self.sp as usize;
        std::mem::take(&mut self.slots[at])
    }

    /// Borrow the top of stack.
    #[inline]
    #[must_use]
    pub fn peek(&self) -> &Slot {
        &self.slots[self.locals_len() + self.sp as usize - 1]
    }

    /// Pop and widen, failing on an unset slot (an engine bug, not a
    /// language error).
    pub fn pop_value(&mut self) -> LanguageResult<Value> {
        self.pop()
            .into_value()
            .ok_or_else(|| LanguageError::internal("popped an unset stack slot"))
    }

    /// Drop stack entries above `depth` (handler-entry truncation).
    pub fn truncate_stack(&mut self, depth: u16) {
        while self.sp > depth {
            let _ = self.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{Opcode, UnitBuilder};

    fn unit_with_params(params: &[&str], cells_from_arg: &[(&str, u16)]) -> Arc<CompiledUnit> {
        let mut b = UnitBuilder::new("f");
        for p in params {
            b.param(p);
        }
        for (name, arg) in cells_from_arg {
            b.cell_for_param(name, *arg);
        }
        b.op(Opcode::LoadNone);
        b.op(Opcode::Return);
        b.build()
    }

    #[test]
    fn test_bind_positional_and_keyword() {
        let unit = unit_with_params(&["a", "b"], &[]);
        let mut frame = Frame::new(unit, &[]).unwrap();
        frame
            .bind_args(&[Value::Int(1)], &[(Arc::from("b"), Value::Int(2))])
            .unwrap();
        assert_eq!(frame.local(0).clone().into_value().unwrap().as_int(), Some(1));
        assert_eq!(frame.local(1).clone().into_value().unwrap().as_int(), Some(2));
    }

    #[test]
    fn test_bind_arity_errors() {
        let unit = unit_with_params(&["a"], &[]);
        let mut frame = Frame::new(unit.clone(), &[]).unwrap();
        let err = frame
            .bind_args(&[Value::Int(1), Value::Int(2)], &[])
            .unwrap_err();
        assert_eq!(err.kind_name(), "TypeError");

        let mut frame = Frame::new(unit.clone(), &[]).unwrap();
        let err = frame.bind_args(&[], &[]).unwrap_err();
        assert!(err.to_string().contains("missing required argument 'a'"));

        let mut frame = Frame::new(unit, &[]).unwrap();
        let err = frame
            .bind_args(&[Value::Int(1)], &[(Arc::from("a"), Value::Int(2))])
            .unwrap_err();
        assert!(err.to_string().contains("multiple values"));
    }

    #[test]
    fn test_bind_unknown_keyword() {
        let unit = unit_with_params(&["a"], &[]);
        let mut frame = Frame::new(unit, &[]).unwrap();
        let err = frame
            .bind_args(&[Value::Int(1)], &[(Arc::from("zz"), Value::None)])
            .unwrap_err();
        assert!(err.to_string().contains("unexpected keyword argument 'zz'"));
    }

    #[test]
    fn test_cell_seeded_from_argument() {
        let unit = unit_with_params(&["a"], &[("a", 0)]);
        let mut frame = Frame::new(unit, &[]).unwrap();
        frame.bind_args(&[Value::Int(41)], &[]).unwrap();
        // The argument moved into the cell; the local slot is cleared.
        assert!(frame.local(0).is_unset());
        assert_eq!(frame.cells[0].get().unwrap().as_int(), Some(41));
    }

    #[test]
    fn test_free_cell_count_checked() {
        let mut b = UnitBuilder::new("g");
        b.free_var("x");
        b.op(Opcode::LoadNone);
        b.op(Opcode::Return);
        let unit = b.build();
        assert!(Frame::new(unit, &[]).is_err());
    }

    #[test]
    fn test_stack_ops() {
        let mut b = UnitBuilder::new("s");
        b.op(Opcode::LoadNone);
        b.op(Opcode::Dup);
        b.op(Opcode::Pop);
        b.op(Opcode::Return);
        let unit = b.build();
        let mut frame = Frame::new(unit, &[]).unwrap();
        frame.push(Slot::Int(1));
        frame.push(Slot::Bool(true));
        assert!(matches!(frame.peek(), Slot::Bool(true)));
        frame.truncate_stack(1);
        assert_eq!(frame.sp, 1);
        assert_eq!(frame.pop_value().unwrap().as_int(), Some(1));
    }
}
